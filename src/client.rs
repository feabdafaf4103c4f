//! Submission orchestrator.
//!
//! Validates each event, runs the plugin pipeline, normalizes what survives,
//! persists it to the event queue, and records the last reference id.
//! Nothing is persisted on any failure path: an event is either absent from
//! the queue or fully present and normalized.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use anyhow::Result;
use serde_json::Value;
use thiserror::Error;
use tracing::{error, info, instrument, warn};

use crate::config::{Config, StorageKind};
use crate::domain::{event_type, property, ContextData, ErrorInfo, Event};
use crate::last_reference::{InMemoryLastReferenceIdManager, LastReferenceIdManager};
use crate::pipeline::{
    EventExclusionPlugin, Plugin, PluginContext, PluginError, PluginManager, ReferenceIdPlugin, RunState,
};
use crate::queue::EventQueue;
use crate::storage::{FileStorage, InMemoryStorage, Storage, StorageError};

/// Lazily built process default (see [`TelemetryClient::shared`])
static SHARED: OnceLock<TelemetryClient> = OnceLock::new();

/// Why a submission was rejected
#[derive(Debug, Error)]
pub enum SubmissionError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Event submission is currently disabled")]
    Disabled,

    #[error("Event submission cancelled by plugin '{plugin}': type={event_type} id={}", .reference_id.as_deref().unwrap_or("-"))]
    Cancelled {
        plugin: String,
        event_type: String,
        reference_id: Option<String>,
    },

    #[error("Event submission cancelled. An error occurred while running the plugins: {0}")]
    PluginFailure(#[source] PluginError),

    #[error("Failed to persist event: {0}")]
    Storage(#[from] StorageError),
}

impl SubmissionError {
    /// A plugin vetoed the event (expected, not a fault)
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }
}

/// Successful submission
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmissionReceipt {
    /// Queue path the event was stored under
    pub path: String,

    /// Reference id the event carried, if any
    pub reference_id: Option<String>,
}

/// Telemetry client owned by the application's composition root
pub struct TelemetryClient {
    config: Config,
    enabled: AtomicBool,
    plugins: PluginManager,
    queue: EventQueue,
    last_reference: Arc<dyn LastReferenceIdManager>,
}

impl TelemetryClient {
    /// Create a client over `storage`, registering the built-in plugins
    pub fn new(config: Config, storage: Arc<dyn Storage<Event>>) -> Self {
        let plugins = PluginManager::new().with_default_timeout(config.plugin_timeout);

        let exclusions = EventExclusionPlugin::new(config.exclusions.as_slice());
        if !exclusions.is_empty() {
            plugins.register(exclusions);
        }
        plugins.register(ReferenceIdPlugin);

        let queue = EventQueue::new(storage, config.queue_prefix.clone(), config.batch_size);

        Self {
            enabled: AtomicBool::new(config.enabled),
            config,
            plugins,
            queue,
            last_reference: Arc::new(InMemoryLastReferenceIdManager::new()),
        }
    }

    /// Client backed by process-local storage
    pub fn in_memory(config: Config) -> Self {
        let storage = Arc::new(InMemoryStorage::<Event>::new(config.max_queue_items));
        Self::new(config, storage)
    }

    /// Client backed by the storage kind named in `config`
    pub async fn from_config(config: Config) -> Result<Self> {
        let storage: Arc<dyn Storage<Event>> = match config.storage {
            StorageKind::Memory => Arc::new(InMemoryStorage::<Event>::new(config.max_queue_items)),
            StorageKind::File => Arc::new(
                FileStorage::<Event>::open(config.queue_dir(), config.max_queue_items).await?,
            ),
        };

        Ok(Self::new(config, storage))
    }

    /// Replace the last-reference tracker
    pub fn with_last_reference_manager(mut self, manager: Arc<dyn LastReferenceIdManager>) -> Self {
        self.last_reference = manager;
        self
    }

    /// Process-wide default client, built on first use from the loaded
    /// configuration with in-memory storage
    pub fn shared() -> &'static TelemetryClient {
        SHARED.get_or_init(|| {
            let config = match crate::config::config() {
                Ok(config) => config.clone(),
                Err(e) => {
                    warn!(error = %e, "Falling back to default configuration");
                    Config::default()
                }
            };
            Self::in_memory(config)
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn queue(&self) -> &EventQueue {
        &self.queue
    }

    pub fn plugins(&self) -> &PluginManager {
        &self.plugins
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Turn submission on or off
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    /// Register a plugin, replacing one with the same name
    pub fn register_plugin<P: Plugin + 'static>(&self, plugin: P) {
        self.plugins.register(plugin);
    }

    pub fn unregister_plugin(&self, name: &str) -> bool {
        self.plugins.unregister(name)
    }

    /// Reference id of the last successfully submitted event that had one
    pub fn last_reference_id(&self) -> Option<String> {
        self.last_reference.get_last()
    }

    /// Run `event` through the pipeline and persist it.
    ///
    /// `None` is rejected as invalid input. Cancellation and plugin failure
    /// leave the queue and the last reference id untouched.
    #[instrument(skip_all)]
    pub async fn submit_event(
        &self,
        event: impl Into<Option<Event>>,
        data: Option<ContextData>,
    ) -> Result<SubmissionReceipt, SubmissionError> {
        let Some(event) = event.into() else {
            return Err(SubmissionError::InvalidInput(
                "Unable to submit undefined event".to_string(),
            ));
        };

        if !self.is_enabled() {
            info!("Event submission is currently disabled");
            return Err(SubmissionError::Disabled);
        }

        let mut context = PluginContext::new(event, data.unwrap_or_default());
        let run = self.plugins.run(&mut context).await;

        match run.state {
            RunState::Completed => {}
            RunState::Cancelled { plugin } => {
                let err = SubmissionError::Cancelled {
                    plugin,
                    event_type: context.event.event_type.clone(),
                    reference_id: context.event.reference_id.clone(),
                };
                info!("{}", err);
                return Err(err);
            }
            RunState::Failed(source) => {
                let err = SubmissionError::PluginFailure(source);
                error!(error = %err, "Plugin pipeline failed");
                return Err(err);
            }
        }

        let mut event = context.event;
        event.normalize();

        let reference_id = event.reference_id().map(str::to_string);
        info!(
            event_type = %event.event_type,
            refid = reference_id.as_deref().unwrap_or(""),
            "Submitting event"
        );

        let path = self.queue.enqueue(event).await.map_err(|e| {
            error!(error = %e, "Failed to enqueue event");
            SubmissionError::from(e)
        })?;

        if let Some(id) = &reference_id {
            info!(reference_id = %id, "Setting last reference id");
            self.last_reference.set_last(id);
        }

        Ok(SubmissionReceipt { path, reference_id })
    }

    /// Start an event with the current date
    pub fn create_event(&self) -> EventBuilder<'_> {
        EventBuilder::new(self, Event::new(""), ContextData::new())
    }

    /// Error event for `error` and its source chain
    pub fn create_exception(&self, error: &(dyn std::error::Error + 'static)) -> EventBuilder<'_> {
        self.create_error(ErrorInfo::from_error(error))
    }

    /// Error event from already structured details
    pub fn create_error(&self, info: ErrorInfo) -> EventBuilder<'_> {
        let message = info.message.clone();
        EventBuilder::new(self, Event::new(event_type::ERROR), ContextData::with_error(info))
            .set_message(message)
    }

    /// Error event marked as reaching a top-level handler
    pub fn create_unhandled_exception(&self, error: &(dyn std::error::Error + 'static)) -> EventBuilder<'_> {
        self.create_unhandled_error(ErrorInfo::from_error(error))
    }

    pub fn create_unhandled_error(&self, info: ErrorInfo) -> EventBuilder<'_> {
        let mut builder = self.create_error(info);
        builder.data.mark_as_unhandled();
        builder
    }

    pub fn create_feature_usage(&self, feature: impl Into<String>) -> EventBuilder<'_> {
        EventBuilder::new(self, Event::new(event_type::USAGE), ContextData::new()).set_source(feature)
    }

    /// Log event with no source
    pub fn create_log(&self, message: impl Into<String>) -> EventBuilder<'_> {
        EventBuilder::new(self, Event::new(event_type::LOG), ContextData::new()).set_message(message)
    }

    /// Log event with an explicit source and optional level
    pub fn create_log_with(
        &self,
        source: impl Into<String>,
        message: impl Into<String>,
        level: Option<&str>,
    ) -> EventBuilder<'_> {
        let builder = self.create_log(message).set_source(source);
        match level {
            Some(level) => builder.set_property(property::LEVEL, level),
            None => builder,
        }
    }

    pub fn create_not_found(&self, resource: impl Into<String>) -> EventBuilder<'_> {
        EventBuilder::new(self, Event::new(event_type::NOT_FOUND), ContextData::new()).set_source(resource)
    }

    pub fn create_session_start(&self, session_id: impl Into<String>) -> EventBuilder<'_> {
        EventBuilder::new(self, Event::new(event_type::SESSION_START), ContextData::new())
            .set_property(property::SESSION_ID, session_id.into())
    }

    pub fn create_session_end(&self, session_id: impl Into<String>) -> EventBuilder<'_> {
        EventBuilder::new(self, Event::new(event_type::SESSION_END), ContextData::new())
            .set_property(property::SESSION_ID, session_id.into())
    }

    pub async fn submit_exception(
        &self,
        error: &(dyn std::error::Error + 'static),
    ) -> Result<SubmissionReceipt, SubmissionError> {
        self.create_exception(error).submit().await
    }

    pub async fn submit_unhandled_exception(
        &self,
        error: &(dyn std::error::Error + 'static),
    ) -> Result<SubmissionReceipt, SubmissionError> {
        self.create_unhandled_exception(error).submit().await
    }

    pub async fn submit_feature_usage(&self, feature: &str) -> Result<SubmissionReceipt, SubmissionError> {
        self.create_feature_usage(feature).submit().await
    }

    pub async fn submit_log(&self, message: &str) -> Result<SubmissionReceipt, SubmissionError> {
        self.create_log(message).submit().await
    }

    pub async fn submit_log_with(
        &self,
        source: &str,
        message: &str,
        level: Option<&str>,
    ) -> Result<SubmissionReceipt, SubmissionError> {
        self.create_log_with(source, message, level).submit().await
    }

    pub async fn submit_not_found(&self, resource: &str) -> Result<SubmissionReceipt, SubmissionError> {
        self.create_not_found(resource).submit().await
    }

    pub async fn submit_session_start(&self, session_id: &str) -> Result<SubmissionReceipt, SubmissionError> {
        self.create_session_start(session_id).submit().await
    }

    pub async fn submit_session_end(&self, session_id: &str) -> Result<SubmissionReceipt, SubmissionError> {
        self.create_session_end(session_id).submit().await
    }
}

/// Fluent event construction bound to a client
pub struct EventBuilder<'a> {
    client: &'a TelemetryClient,
    event: Event,
    data: ContextData,
}

impl<'a> EventBuilder<'a> {
    fn new(client: &'a TelemetryClient, event: Event, data: ContextData) -> Self {
        Self { client, event, data }
    }

    pub fn set_type(mut self, event_type: impl Into<String>) -> Self {
        self.event.event_type = event_type.into();
        self
    }

    pub fn set_source(mut self, source: impl Into<String>) -> Self {
        self.event.source = Some(source.into());
        self
    }

    pub fn set_message(mut self, message: impl Into<String>) -> Self {
        self.event.message = Some(message.into());
        self
    }

    pub fn set_reference_id(mut self, reference_id: impl Into<String>) -> Self {
        self.event.reference_id = Some(reference_id.into());
        self
    }

    pub fn add_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.event.tags.extend(tags.into_iter().map(Into::into));
        self
    }

    pub fn set_property(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.event.properties.insert(key.into(), value.into());
        self
    }

    /// Mark the error (if any) as unhandled
    pub fn mark_as_unhandled(mut self) -> Self {
        self.data.mark_as_unhandled();
        self
    }

    /// Event and context data without submitting
    pub fn build(self) -> (Event, ContextData) {
        (self.event, self.data)
    }

    /// Submit through the owning client
    pub async fn submit(self) -> Result<SubmissionReceipt, SubmissionError> {
        let client = self.client;
        let (event, data) = self.build();
        client.submit_event(event, Some(data)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> TelemetryClient {
        TelemetryClient::in_memory(Config::default())
    }

    #[tokio::test]
    async fn test_builtin_plugins_registered() {
        let config = Config {
            exclusions: vec!["type:usage".to_string()],
            ..Default::default()
        };
        let client = TelemetryClient::in_memory(config);
        assert_eq!(
            client.plugins().plugin_names(),
            vec![EventExclusionPlugin::NAME, ReferenceIdPlugin::NAME]
        );

        let result = client.submit_feature_usage("export").await;
        assert!(result.unwrap_err().is_cancelled());
        assert!(client.queue().is_empty().await.unwrap());
    }

    #[tokio::test]
    async fn test_log_builders() {
        let client = client();
        let (event, _) = client.create_log("hello").build();
        assert_eq!(event.event_type, "log");
        assert_eq!(event.source, None);

        let (event, _) = client.create_log_with("app::db", "slow query", Some("warn")).build();
        assert_eq!(event.source.as_deref(), Some("app::db"));
        assert_eq!(event.message.as_deref(), Some("slow query"));
        assert_eq!(event.properties.get("@level"), Some(&Value::from("warn")));
    }

    #[tokio::test]
    async fn test_unhandled_error_gets_reference_id() {
        let client = client();
        let io = std::io::Error::new(std::io::ErrorKind::Other, "socket closed");

        let (event, data) = client.create_unhandled_exception(&io).build();
        assert_eq!(event.event_type, "error");
        assert_eq!(event.message.as_deref(), Some("socket closed"));
        assert!(data.is_unhandled());

        let receipt = client.submit_unhandled_exception(&io).await.unwrap();
        let id = receipt.reference_id.unwrap();
        assert_eq!(client.last_reference_id(), Some(id));
    }

    #[tokio::test]
    async fn test_session_events() {
        let client = client();
        client.submit_session_start("s-1").await.unwrap();
        client.submit_session_end("s-1").await.unwrap();

        let items = client.queue().pending(None).await.unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].value.event_type, "start");
        assert_eq!(items[1].value.event_type, "end");
        assert_eq!(items[1].value.properties.get("@session"), Some(&Value::from("s-1")));
    }

    #[tokio::test]
    async fn test_custom_type_is_kept() {
        let client = client();
        let receipt = client
            .create_event()
            .set_type("deploy")
            .add_tags(["prod"])
            .submit()
            .await
            .unwrap();

        let stored = client.queue().storage().get(&receipt.path).await.unwrap().unwrap();
        assert_eq!(stored.event_type, "deploy");
        assert_eq!(stored.tags, vec!["prod".to_string()]);
    }

    #[tokio::test]
    async fn test_empty_type_is_normalized() {
        let client = client();
        let receipt = client.create_event().submit().await.unwrap();
        let stored = client.queue().storage().get(&receipt.path).await.unwrap().unwrap();
        assert_eq!(stored.event_type, "log");
        assert!(stored.date.is_some());
    }
}
