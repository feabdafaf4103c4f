//! Ordered plugin registry and runner.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use tokio::time::timeout;
use tracing::{debug, instrument};

use super::{Plugin, PluginContext, PluginError};

/// Terminal state of one pipeline run
#[derive(Debug)]
pub enum RunState {
    /// Every plugin ran without vetoing
    Completed,

    /// A plugin set `context.cancel`
    Cancelled { plugin: String },

    /// A plugin errored or missed its deadline
    Failed(PluginError),
}

/// Result of running the pipeline once
#[derive(Debug)]
pub struct PipelineRun {
    pub state: RunState,

    /// Plugins invoked, in order (including one that failed)
    pub executed: Vec<String>,
}

impl PipelineRun {
    pub fn is_completed(&self) -> bool {
        matches!(self.state, RunState::Completed)
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.state, RunState::Cancelled { .. })
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.state, RunState::Failed(_))
    }
}

struct Registration {
    name: String,
    priority: i32,
    order: u64,
    plugin: Arc<dyn Plugin>,
}

/// Holds plugins sorted by (priority, registration order)
pub struct PluginManager {
    plugins: RwLock<Vec<Registration>>,
    next_order: AtomicU64,

    /// Deadline for plugins that don't declare their own
    default_timeout: Option<Duration>,
}

impl Default for PluginManager {
    fn default() -> Self {
        Self::new()
    }
}

impl PluginManager {
    /// Create an empty manager with no plugin deadline
    pub fn new() -> Self {
        Self {
            plugins: RwLock::new(Vec::new()),
            next_order: AtomicU64::new(0),
            default_timeout: None,
        }
    }

    /// Apply a deadline to every plugin without its own
    pub fn with_default_timeout(mut self, limit: Option<Duration>) -> Self {
        self.default_timeout = limit;
        self
    }

    pub fn default_timeout(&self) -> Option<Duration> {
        self.default_timeout
    }

    /// Register a plugin, replacing any plugin with the same name
    pub fn register<P: Plugin + 'static>(&self, plugin: P) {
        self.register_shared(Arc::new(plugin));
    }

    /// Register an already shared plugin
    pub fn register_shared(&self, plugin: Arc<dyn Plugin>) {
        let name = plugin.name().to_string();
        let registration = Registration {
            name: name.clone(),
            priority: plugin.priority(),
            order: self.next_order.fetch_add(1, Ordering::Relaxed),
            plugin,
        };

        let mut plugins = self.write();
        let replaced = plugins.iter().any(|r| r.name == name);
        plugins.retain(|r| r.name != name);
        plugins.push(registration);
        plugins.sort_by_key(|r| (r.priority, r.order));

        debug!(plugin = %name, replaced, "Registered plugin");
    }

    /// Remove a plugin by name, returning whether it was registered
    pub fn unregister(&self, name: &str) -> bool {
        let mut plugins = self.write();
        let before = plugins.len();
        plugins.retain(|r| r.name != name);
        plugins.len() != before
    }

    /// Registered plugin names in execution order
    pub fn plugin_names(&self) -> Vec<String> {
        self.read().iter().map(|r| r.name.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Run every plugin against `context`, stopping at the first veto or
    /// failure
    #[instrument(skip_all, fields(event_type = %context.event.event_type))]
    pub async fn run(&self, context: &mut PluginContext) -> PipelineRun {
        // Snapshot so registration changes never block on a running plugin
        let plugins: Vec<(String, Arc<dyn Plugin>)> = self
            .read()
            .iter()
            .map(|r| (r.name.clone(), Arc::clone(&r.plugin)))
            .collect();

        let mut executed = Vec::with_capacity(plugins.len());

        for (name, plugin) in plugins {
            let deadline = plugin.timeout().or(self.default_timeout);
            debug!(plugin = %name, "Running plugin");

            let result = match deadline {
                Some(limit) => match timeout(limit, plugin.run(context)).await {
                    Ok(result) => result.map_err(|source| PluginError::Failed {
                        plugin: name.clone(),
                        source,
                    }),
                    Err(_) => Err(PluginError::TimedOut {
                        plugin: name.clone(),
                        timeout: limit,
                    }),
                },
                None => plugin
                    .run(context)
                    .await
                    .map_err(|source| PluginError::Failed {
                        plugin: name.clone(),
                        source,
                    }),
            };

            executed.push(name.clone());

            if let Err(error) = result {
                return PipelineRun {
                    state: RunState::Failed(error),
                    executed,
                };
            }

            if context.cancel {
                debug!(plugin = %name, "Plugin cancelled the event");
                return PipelineRun {
                    state: RunState::Cancelled { plugin: name },
                    executed,
                };
            }
        }

        PipelineRun {
            state: RunState::Completed,
            executed,
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Vec<Registration>> {
        self.plugins.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Vec<Registration>> {
        self.plugins.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::{bail, Result};
    use async_trait::async_trait;
    use std::sync::Mutex;

    use crate::domain::{ContextData, Event};

    /// Records its name into a shared log when run
    struct Recorder {
        name: String,
        priority: i32,
        log: Arc<Mutex<Vec<String>>>,
        cancel: bool,
        fail: bool,
    }

    impl Recorder {
        fn new(name: &str, priority: i32, log: &Arc<Mutex<Vec<String>>>) -> Self {
            Self {
                name: name.to_string(),
                priority,
                log: Arc::clone(log),
                cancel: false,
                fail: false,
            }
        }
    }

    #[async_trait]
    impl Plugin for Recorder {
        fn name(&self) -> &str {
            &self.name
        }

        fn priority(&self) -> i32 {
            self.priority
        }

        async fn run(&self, context: &mut PluginContext) -> Result<()> {
            self.log.lock().unwrap().push(self.name.clone());
            if self.fail {
                bail!("{} exploded", self.name);
            }
            if self.cancel {
                context.cancel = true;
            }
            Ok(())
        }
    }

    struct Hang;

    #[async_trait]
    impl Plugin for Hang {
        fn name(&self) -> &str {
            "hang"
        }

        fn priority(&self) -> i32 {
            0
        }

        fn timeout(&self) -> Option<Duration> {
            Some(Duration::from_millis(20))
        }

        async fn run(&self, _context: &mut PluginContext) -> Result<()> {
            std::future::pending::<()>().await;
            Ok(())
        }
    }

    fn context() -> PluginContext {
        PluginContext::new(Event::new("log"), ContextData::new())
    }

    #[tokio::test]
    async fn test_priority_then_registration_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let manager = PluginManager::new();
        manager.register(Recorder::new("late", 20, &log));
        manager.register(Recorder::new("first-tie", 10, &log));
        manager.register(Recorder::new("second-tie", 10, &log));
        manager.register(Recorder::new("early", 1, &log));

        let run = manager.run(&mut context()).await;
        assert!(run.is_completed());
        assert_eq!(
            *log.lock().unwrap(),
            vec!["early", "first-tie", "second-tie", "late"]
        );
        assert_eq!(run.executed.len(), 4);
    }

    #[tokio::test]
    async fn test_cancel_stops_remaining_plugins() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let manager = PluginManager::new();
        let mut veto = Recorder::new("veto", 1, &log);
        veto.cancel = true;
        manager.register(veto);
        manager.register(Recorder::new("after", 2, &log));

        let mut ctx = context();
        let run = manager.run(&mut ctx).await;
        assert!(run.is_cancelled());
        assert!(ctx.cancel);
        assert_eq!(*log.lock().unwrap(), vec!["veto"]);
        assert!(matches!(run.state, RunState::Cancelled { ref plugin } if plugin == "veto"));
    }

    #[tokio::test]
    async fn test_failure_is_distinct_from_cancel() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let manager = PluginManager::new();
        let mut broken = Recorder::new("broken", 1, &log);
        broken.fail = true;
        manager.register(broken);
        manager.register(Recorder::new("after", 2, &log));

        let run = manager.run(&mut context()).await;
        assert!(run.is_failed());
        assert!(!run.is_cancelled());
        assert_eq!(run.executed, vec!["broken"]);
        match run.state {
            RunState::Failed(error) => {
                assert_eq!(error.plugin(), "broken");
                assert!(error.to_string().contains("broken exploded"));
            }
            other => panic!("unexpected state: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_reregistration_replaces() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let manager = PluginManager::new();
        manager.register(Recorder::new("a", 5, &log));
        manager.register(Recorder::new("b", 1, &log));
        manager.register(Recorder::new("a", 0, &log));

        assert_eq!(manager.len(), 2);
        assert_eq!(manager.plugin_names(), vec!["a", "b"]);

        assert!(manager.unregister("a"));
        assert!(!manager.unregister("a"));
        assert_eq!(manager.plugin_names(), vec!["b"]);
    }

    #[tokio::test]
    async fn test_plugin_deadline_forces_failure() {
        let manager = PluginManager::new();
        manager.register(Hang);

        let run = manager.run(&mut context()).await;
        assert!(matches!(
            run.state,
            RunState::Failed(PluginError::TimedOut { .. })
        ));
    }

    #[tokio::test]
    async fn test_default_deadline_applies() {
        struct Slow;

        #[async_trait]
        impl Plugin for Slow {
            fn name(&self) -> &str {
                "slow"
            }

            fn priority(&self) -> i32 {
                0
            }

            async fn run(&self, _context: &mut PluginContext) -> Result<()> {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            }
        }

        let manager = PluginManager::new().with_default_timeout(Some(Duration::from_millis(10)));
        manager.register(Slow);

        let run = manager.run(&mut context()).await;
        assert!(run.is_failed());
    }

    #[tokio::test]
    async fn test_empty_pipeline_completes() {
        let manager = PluginManager::new();
        let run = manager.run(&mut context()).await;
        assert!(run.is_completed());
        assert!(run.executed.is_empty());
    }
}
