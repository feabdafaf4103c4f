//! Ordered chain of unhandled-error handlers.
//!
//! Instead of wrapping whatever handler was installed before, handlers are
//! registered on an explicit chain. Each one sees the report in registration
//! order and may stop the chain. Removing a handler never disturbs the
//! others.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use anyhow::Result;
use tracing::{debug, error, warn};

use crate::client::TelemetryClient;
use crate::domain::{ErrorInfo, StackFrame};

/// An error that reached a top-level handler
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ErrorReport {
    pub message: String,

    /// Structured error, when the handler received one
    pub error: Option<ErrorInfo>,

    pub file_name: Option<String>,
    pub line_number: Option<u32>,
    pub column: Option<u32>,
}

impl ErrorReport {
    /// Report with only a message
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Default::default()
        }
    }

    /// Report carrying a full error
    pub fn from_error(error: &(dyn std::error::Error + 'static)) -> Self {
        let info = ErrorInfo::from_error(error);
        Self {
            message: info.message.clone(),
            error: Some(info),
            ..Default::default()
        }
    }

    /// Attach the source location
    pub fn at(mut self, file_name: impl Into<String>, line_number: u32, column: u32) -> Self {
        self.file_name = Some(file_name.into());
        self.line_number = Some(line_number);
        self.column = Some(column);
        self
    }

    /// Error details for an event; location-only reports become a single
    /// stack frame
    pub fn to_error_info(&self) -> ErrorInfo {
        if let Some(info) = &self.error {
            return info.clone();
        }

        let info = ErrorInfo::new(self.message.clone());
        if self.file_name.is_none() && self.line_number.is_none() {
            return info;
        }

        info.with_frame(StackFrame {
            file_name: self.file_name.clone(),
            line_number: self.line_number,
            column: self.column,
            function: None,
        })
    }
}

/// Whether later hooks should see the report
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookFlow {
    Continue,
    Stop,
}

/// A handler on the chain
pub trait ErrorHook: Send + Sync {
    fn name(&self) -> &str;

    fn handle(&self, report: &ErrorReport) -> Result<HookFlow>;
}

/// Handle returned by [`ErrorHookChain::register`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HookId(u64);

/// Registered handlers in invocation order
#[derive(Default)]
pub struct ErrorHookChain {
    hooks: RwLock<Vec<(HookId, Arc<dyn ErrorHook>)>>,
    next_id: AtomicU64,
}

impl ErrorHookChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a hook to the end of the chain
    pub fn register<H: ErrorHook + 'static>(&self, hook: H) -> HookId {
        let id = HookId(self.next_id.fetch_add(1, Ordering::Relaxed));
        debug!(hook = hook.name(), "Registered error hook");
        self.write().push((id, Arc::new(hook)));
        id
    }

    /// Remove a hook, returning whether it was registered
    pub fn remove(&self, id: HookId) -> bool {
        let mut hooks = self.write();
        let before = hooks.len();
        hooks.retain(|(hook_id, _)| *hook_id != id);
        hooks.len() != before
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Pass `report` along the chain, returning how many hooks ran.
    ///
    /// A failing hook is logged and the chain moves on.
    pub fn dispatch(&self, report: &ErrorReport) -> usize {
        let hooks: Vec<Arc<dyn ErrorHook>> = self.read().iter().map(|(_, hook)| Arc::clone(hook)).collect();
        let mut invoked = 0;

        for hook in hooks {
            invoked += 1;
            match hook.handle(report) {
                Ok(HookFlow::Continue) => {}
                Ok(HookFlow::Stop) => break,
                Err(e) => {
                    error!(hook = hook.name(), error = %e, "Error hook failed");
                }
            }
        }

        invoked
    }

    fn read(&self) -> RwLockReadGuard<'_, Vec<(HookId, Arc<dyn ErrorHook>)>> {
        self.hooks.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Vec<(HookId, Arc<dyn ErrorHook>)>> {
        self.hooks.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Forwards reports to a client as unhandled error events.
///
/// Submission is spawned on the current tokio runtime so the reporting
/// thread never waits on the pipeline.
pub struct SubmitUnhandledHook {
    client: Arc<TelemetryClient>,
}

impl SubmitUnhandledHook {
    pub fn new(client: Arc<TelemetryClient>) -> Self {
        Self { client }
    }
}

impl ErrorHook for SubmitUnhandledHook {
    fn name(&self) -> &str {
        "submit-unhandled"
    }

    fn handle(&self, report: &ErrorReport) -> Result<HookFlow> {
        let info = report.to_error_info();

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let client = Arc::clone(&self.client);
                handle.spawn(async move {
                    if let Err(e) = client.create_unhandled_error(info).submit().await {
                        debug!(error = %e, "Unhandled error was not queued");
                    }
                });
            }
            Err(_) => {
                warn!(message = %report.message, "No async runtime; unhandled error dropped");
            }
        }

        Ok(HookFlow::Continue)
    }
}
