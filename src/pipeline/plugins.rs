//! Built-in plugins.

use anyhow::Result;
use async_trait::async_trait;
use glob::Pattern;
use tracing::{debug, warn};
use uuid::Uuid;

use super::{Plugin, PluginContext};
use crate::domain::event_type;

/// Assigns a short random reference id to error events lacking one, so the
/// caller can correlate the error with later user feedback
#[derive(Debug, Default)]
pub struct ReferenceIdPlugin;

impl ReferenceIdPlugin {
    pub const NAME: &'static str = "reference-id";
}

#[async_trait]
impl Plugin for ReferenceIdPlugin {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn priority(&self) -> i32 {
        90
    }

    async fn run(&self, context: &mut PluginContext) -> Result<()> {
        let event = &mut context.event;
        if event.event_type == event_type::ERROR && event.reference_id().is_none() {
            let id = Uuid::new_v4().simple().to_string();
            event.reference_id = Some(id[..10].to_string());
        }
        Ok(())
    }
}

/// Which event field an exclusion pattern applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Field {
    Type,
    Source,
    Any,
}

/// Cancels events whose type or source matches a glob pattern.
///
/// Patterns may be scoped with a `type:` or `source:` prefix; an unscoped
/// pattern is matched against both fields.
#[derive(Debug, Default)]
pub struct EventExclusionPlugin {
    patterns: Vec<(Field, Pattern)>,
}

impl EventExclusionPlugin {
    pub const NAME: &'static str = "event-exclusion";

    /// Compile patterns; invalid ones are skipped with a warning
    pub fn new<S: AsRef<str>>(patterns: &[S]) -> Self {
        let patterns = patterns
            .iter()
            .filter_map(|raw| {
                let raw = raw.as_ref();
                let (field, glob) = if let Some(rest) = raw.strip_prefix("type:") {
                    (Field::Type, rest)
                } else if let Some(rest) = raw.strip_prefix("source:") {
                    (Field::Source, rest)
                } else {
                    (Field::Any, raw)
                };

                match Pattern::new(glob) {
                    Ok(pattern) => Some((field, pattern)),
                    Err(e) => {
                        warn!(pattern = %raw, error = %e, "Ignoring invalid exclusion pattern");
                        None
                    }
                }
            })
            .collect();

        Self { patterns }
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    fn is_excluded(&self, event_type: &str, source: Option<&str>) -> bool {
        self.patterns.iter().any(|(field, pattern)| {
            let type_hit = || pattern.matches(event_type);
            let source_hit = || source.map(|s| pattern.matches(s)).unwrap_or(false);
            match field {
                Field::Type => type_hit(),
                Field::Source => source_hit(),
                Field::Any => type_hit() || source_hit(),
            }
        })
    }
}

#[async_trait]
impl Plugin for EventExclusionPlugin {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn priority(&self) -> i32 {
        10
    }

    async fn run(&self, context: &mut PluginContext) -> Result<()> {
        let event = &context.event;
        if self.is_excluded(&event.event_type, event.source.as_deref()) {
            debug!(
                event_type = %event.event_type,
                source = event.source.as_deref().unwrap_or(""),
                "Event matched exclusion"
            );
            context.cancel = true;
        }
        Ok(())
    }
}
