//! Telemetry events.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Well-known event types
pub mod event_type {
    pub const ERROR: &str = "error";
    pub const USAGE: &str = "usage";
    pub const LOG: &str = "log";
    pub const NOT_FOUND: &str = "404";
    pub const SESSION_START: &str = "start";
    pub const SESSION_END: &str = "end";
}

/// Well-known property keys
pub mod property {
    /// Log severity for `log` events
    pub const LEVEL: &str = "@level";
    /// Structured error details for `error` events
    pub const ERROR: &str = "@error";
    /// Session identifier for session events
    pub const SESSION_ID: &str = "@session";
}

/// A structured record of a captured occurrence.
///
/// `reference_id` is caller-supplied correlation metadata; it is not unique
/// and is never used as a storage key.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Event type; normalized to `log` when empty
    #[serde(rename = "type", default)]
    pub event_type: String,

    /// When the event occurred; filled in at submission when missing
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date: Option<DateTime<Utc>>,

    /// Correlation id
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference_id: Option<String>,

    /// Origin of the event (logger name, feature, resource)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,

    /// Free-form extended data
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub properties: HashMap<String, serde_json::Value>,
}

impl Event {
    /// Create an event of the given type dated now
    pub fn new(event_type: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            date: Some(Utc::now()),
            ..Default::default()
        }
    }

    /// Reference id if present and non-empty
    pub fn reference_id(&self) -> Option<&str> {
        self.reference_id.as_deref().filter(|id| !id.is_empty())
    }

    /// Fill in required fields: empty type becomes `log`, missing date
    /// becomes now
    pub fn normalize(&mut self) {
        if self.event_type.is_empty() {
            self.event_type = event_type::LOG.to_string();
        }

        if self.date.is_none() {
            self.date = Some(Utc::now());
        }
    }
}
