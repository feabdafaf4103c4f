//! Domain types for telemetry events.
//!
//! This module contains:
//! - Event: the record persisted in the queue
//! - ContextData / ErrorInfo: side data seen only by plugins

pub mod context;
pub mod event;

pub use context::{ContextData, ErrorInfo, StackFrame};
pub use event::{event_type, property, Event};
