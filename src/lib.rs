//! flare - client-side telemetry agent
//!
//! Captures structured events (errors, log lines, feature usage, session
//! boundaries) from an instrumented application, lets plugins enrich or veto
//! each event, and persists survivors in a bounded local queue for a
//! transport to deliver later.
//!
//! # Architecture
//!
//! ```text
//! caller → TelemetryClient → PluginManager (mutates context)
//!                          → normalize → EventQueue → Storage
//!                                                      ↑
//!                                      Transport drains oldest-first
//! ```
//!
//! The application must never block or fail because of telemetry: every
//! rejection is returned as a [`SubmissionError`], and the queue bounds
//! memory by evicting its oldest items.
//!
//! # Modules
//!
//! - `storage`: Bounded ordered key-value backends (memory, JSONL file)
//! - `pipeline`: Plugin trait, manager, and built-in plugins
//! - `queue`: Events namespace and drain pass
//! - `client`: Submission orchestrator and event builder
//! - `hooks`: Ordered chain of unhandled-error handlers
//! - `config`: Settings providers and resolved configuration
//! - `cli`: Command-line interface
//!
//! # Usage
//!
//! ```no_run
//! use flare::{Config, TelemetryClient};
//!
//! # async fn demo() -> anyhow::Result<()> {
//! let client = TelemetryClient::in_memory(Config::default());
//! client.submit_log_with("billing", "invoice generated", Some("info")).await?;
//! println!("{:?}", client.last_reference_id());
//! # Ok(())
//! # }
//! ```

pub mod cli;
pub mod client;
pub mod config;
pub mod domain;
pub mod hooks;
pub mod last_reference;
pub mod pipeline;
pub mod queue;
pub mod storage;
pub mod transport;

// Re-export main types at crate root for convenience
pub use client::{EventBuilder, SubmissionError, SubmissionReceipt, TelemetryClient};
pub use config::{Config, SettingsProvider, StorageKind};
pub use domain::{ContextData, ErrorInfo, Event};
pub use hooks::{ErrorHook, ErrorHookChain, ErrorReport, HookFlow};
pub use last_reference::{InMemoryLastReferenceIdManager, LastReferenceIdManager};
pub use pipeline::{Plugin, PluginContext, PluginError, PluginManager, RunState};
pub use queue::{EventQueue, ProcessSummary};
pub use storage::{FileStorage, InMemoryStorage, Storage, StorageError, StorageItem};
pub use transport::{Delivery, Transport};
