//! Command-line interface for flare.
//!
//! Provides commands for submitting events into the local queue and for
//! inspecting or trimming what is waiting for delivery.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use crate::client::{SubmissionError, SubmissionReceipt, TelemetryClient};
use crate::config::{self, Config, StorageKind};
use crate::domain::ErrorInfo;

/// Log filter used when `RUST_LOG` is unset
pub const DEFAULT_LOG_FILTER: &str = "info";

/// flare - client-side telemetry agent
#[derive(Parser, Debug)]
#[command(name = "flare")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Submit an event into the local queue
    Submit {
        #[command(subcommand)]
        event: SubmitCommands,
    },

    /// Inspect or modify the local queue
    Queue {
        #[command(subcommand)]
        command: QueueCommands,
    },

    /// Show resolved configuration (debug)
    Config,
}

#[derive(Subcommand, Debug)]
pub enum SubmitCommands {
    /// Log message
    Log {
        message: String,

        /// Logger or component name
        #[arg(short, long)]
        source: Option<String>,

        /// Severity (trace, debug, info, warn, error)
        #[arg(short, long)]
        level: Option<String>,

        /// Correlation id
        #[arg(long)]
        reference_id: Option<String>,
    },

    /// Feature usage marker
    Usage {
        feature: String,
    },

    /// Missing resource
    NotFound {
        resource: String,
    },

    /// Error report
    Error {
        message: String,

        /// Error type name
        #[arg(short, long)]
        kind: Option<String>,

        /// Mark as reaching a top-level handler
        #[arg(long)]
        unhandled: bool,
    },
}

#[derive(Subcommand, Debug)]
pub enum QueueCommands {
    /// List queued events, oldest first
    List {
        /// Maximum number of events to show
        #[arg(short, long)]
        limit: Option<usize>,
    },

    /// Remove one queued event
    Remove {
        path: String,
    },

    /// Remove every queued event
    Purge,
}

impl Cli {
    /// Execute the CLI command
    pub async fn execute(self) -> Result<()> {
        match self.command {
            Commands::Submit { event } => submit(event).await,
            Commands::Queue { command } => match command {
                QueueCommands::List { limit } => list_queue(limit).await,
                QueueCommands::Remove { path } => remove_from_queue(&path).await,
                QueueCommands::Purge => purge_queue().await,
            },
            Commands::Config => show_config(),
        }
    }
}

/// Client over the file-backed queue in the configured data directory
async fn open_client() -> Result<TelemetryClient> {
    let config = Config {
        storage: StorageKind::File,
        ..config::config()?.clone()
    };

    TelemetryClient::from_config(config)
        .await
        .context("Failed to open event queue")
}

async fn submit(command: SubmitCommands) -> Result<()> {
    let client = open_client().await?;

    let builder = match command {
        SubmitCommands::Log {
            message,
            source,
            level,
            reference_id,
        } => {
            let builder = match source {
                Some(source) => client.create_log_with(source, message, level.as_deref()),
                None => match level {
                    Some(level) => client
                        .create_log(message)
                        .set_property(crate::domain::property::LEVEL, level),
                    None => client.create_log(message),
                },
            };
            match reference_id {
                Some(id) => builder.set_reference_id(id),
                None => builder,
            }
        }
        SubmitCommands::Usage { feature } => client.create_feature_usage(feature),
        SubmitCommands::NotFound { resource } => client.create_not_found(resource),
        SubmitCommands::Error {
            message,
            kind,
            unhandled,
        } => {
            let mut info = ErrorInfo::new(message);
            if let Some(kind) = kind {
                info = info.with_kind(kind);
            }
            if unhandled {
                client.create_unhandled_error(info)
            } else {
                client.create_error(info)
            }
        }
    };

    match builder.submit().await {
        Ok(receipt) => {
            print_receipt(&receipt);
            Ok(())
        }
        Err(e @ SubmissionError::Cancelled { .. }) | Err(e @ SubmissionError::Disabled) => {
            eprintln!("Not queued: {}", e);
            Ok(())
        }
        Err(e) => Err(e).context("Failed to submit event"),
    }
}

fn print_receipt(receipt: &SubmissionReceipt) {
    println!("Queued: {}", receipt.path);
    if let Some(id) = &receipt.reference_id {
        println!("Reference id: {}", id);
    }
}

async fn list_queue(limit: Option<usize>) -> Result<()> {
    let client = open_client().await?;
    let items = client.queue().pending(limit).await?;

    if items.is_empty() {
        println!("Queue is empty.");
        return Ok(());
    }

    println!("{:<28} {:<8} {:<25} MESSAGE", "PATH", "TYPE", "DATE");
    println!("{}", "-".repeat(80));

    for item in &items {
        let event = &item.value;
        let date = event
            .date
            .map(|d| d.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_default();
        let message = event
            .message
            .as_deref()
            .or(event.source.as_deref())
            .unwrap_or("");
        println!(
            "{:<28} {:<8} {:<25} {}",
            item.path,
            event.event_type,
            date,
            truncate(message, 40)
        );
    }

    println!("\nShowing {} of {} queued events", items.len(), client.queue().len().await?);

    Ok(())
}

async fn remove_from_queue(path: &str) -> Result<()> {
    let client = open_client().await?;
    if client.queue().storage().get(path).await?.is_none() {
        anyhow::bail!("No queued event at path: {}", path);
    }

    client.queue().remove(path).await?;
    println!("Removed: {}", path);

    Ok(())
}

async fn purge_queue() -> Result<()> {
    let client = open_client().await?;
    let removed = client.queue().purge().await?;
    println!("Removed {} queued events", removed);

    Ok(())
}

fn show_config() -> Result<()> {
    let config = config::config()?;

    println!("flare configuration");
    println!("===================");
    println!();
    println!("Server URL:      {}", config.server_url);
    println!(
        "API key:         {}",
        if config.api_key.is_some() { "(set)" } else { "(not set)" }
    );
    println!("Enabled:         {}", config.enabled);
    println!("Queue capacity:  {}", config.max_queue_items);
    println!("Queue prefix:    {}", config.queue_prefix);
    println!("Batch size:      {}", config.batch_size);
    println!("Queue directory: {}", config.queue_dir().display());
    match config.plugin_timeout {
        Some(timeout) => println!("Plugin timeout:  {:?}", timeout),
        None => println!("Plugin timeout:  (none)"),
    }
    if !config.exclusions.is_empty() {
        println!("Exclusions:      {}", config.exclusions.join(", "));
    }

    Ok(())
}

/// Truncate a string for table output
fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let cut: String = s.chars().take(max.saturating_sub(3)).collect();
        format!("{}...", cut)
    }
}
