//! Plugin pipeline run against every submitted event.
//!
//! Plugins run sequentially in ascending priority (ties in registration
//! order) against a mutable [`PluginContext`]. A plugin may enrich the event,
//! or veto it by setting `context.cancel`; a veto is an expected outcome,
//! distinct from a plugin returning an error.
//!
//! ```text
//! Pending → Running → Completed
//!                   ↘ Cancelled (context.cancel set)
//!                   ↘ Failed    (plugin error or deadline)
//! ```

pub mod manager;
pub mod plugins;

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use thiserror::Error;

use crate::domain::{ContextData, Event};

pub use manager::{PipelineRun, PluginManager, RunState};
pub use plugins::{EventExclusionPlugin, ReferenceIdPlugin};

/// Mutable state shared by the plugins of one submission
#[derive(Debug, Clone, Default)]
pub struct PluginContext {
    /// Event being submitted
    pub event: Event,

    /// Side data from the builder (error details, unhandled flag)
    pub data: ContextData,

    /// Set by a plugin to stop the pipeline and drop the event
    pub cancel: bool,
}

impl PluginContext {
    pub fn new(event: Event, data: ContextData) -> Self {
        Self {
            event,
            data,
            cancel: false,
        }
    }
}

/// A pipeline unit
#[async_trait]
pub trait Plugin: Send + Sync {
    /// Unique name; registering the same name again replaces the plugin
    fn name(&self) -> &str;

    /// Lower runs earlier
    fn priority(&self) -> i32;

    /// Deadline for one invocation, overriding the manager default
    fn timeout(&self) -> Option<Duration> {
        None
    }

    /// Inspect or mutate the context
    async fn run(&self, context: &mut PluginContext) -> Result<()>;
}

/// Why a plugin invocation failed
#[derive(Debug, Error)]
pub enum PluginError {
    #[error("Plugin '{plugin}' failed: {source}")]
    Failed {
        plugin: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("Plugin '{plugin}' timed out after {timeout:?}")]
    TimedOut { plugin: String, timeout: Duration },
}

impl PluginError {
    /// Name of the plugin that failed
    pub fn plugin(&self) -> &str {
        match self {
            Self::Failed { plugin, .. } | Self::TimedOut { plugin, .. } => plugin,
        }
    }
}
