//! Per-submission side data and error details.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// A single stack frame
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StackFrame {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line_number: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub column: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function: Option<String>,
}

/// Structured description of a captured error
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub message: String,

    /// Error type name, when known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,

    /// Messages of the error's `source()` chain, outermost first
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub causes: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stack_trace: Vec<StackFrame>,
}

impl ErrorInfo {
    /// Error with only a message
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Default::default()
        }
    }

    /// Capture an error and its source chain
    pub fn from_error(error: &(dyn std::error::Error + 'static)) -> Self {
        let mut causes = Vec::new();
        let mut current = error.source();
        while let Some(cause) = current {
            causes.push(cause.to_string());
            current = cause.source();
        }

        Self {
            message: error.to_string(),
            kind: None,
            causes,
            stack_trace: Vec::new(),
        }
    }

    /// Attach the error type name
    pub fn with_kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = Some(kind.into());
        self
    }

    /// Append a stack frame
    pub fn with_frame(mut self, frame: StackFrame) -> Self {
        self.stack_trace.push(frame);
        self
    }
}

/// Data handed to plugins alongside the event
#[derive(Debug, Clone, Default)]
pub struct ContextData {
    /// Captured error, for error events
    pub error: Option<ErrorInfo>,

    /// Whether the error reached a top-level handler
    pub unhandled: bool,

    /// Arbitrary values for plugins
    pub extra: HashMap<String, serde_json::Value>,
}

impl ContextData {
    pub fn new() -> Self {
        Self::default()
    }

    /// Context carrying an error
    pub fn with_error(error: ErrorInfo) -> Self {
        Self {
            error: Some(error),
            ..Default::default()
        }
    }

    pub fn set_error(&mut self, error: ErrorInfo) {
        self.error = Some(error);
    }

    pub fn mark_as_unhandled(&mut self) {
        self.unhandled = true;
    }

    pub fn is_unhandled(&self) -> bool {
        self.unhandled
    }
}
