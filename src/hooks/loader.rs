//! Hook mounting and initialization
//!
//! Walks the candidate hooks in order: validates, merges options, registers
//! scripts and mounts each one, then initializes all of them concurrently,
//! each bounded by the configured hook timeout. Validation failures skip
//! the hook with a warning; initialization failures and timeouts abort
//! instance startup.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::connection::ConnectionSupervisor;
use crate::core::config::{merge_options, Config};
use crate::core::error::{Error, Result};
use crate::core::types::CoreEvent;
use crate::scripts::ScriptRegistry;
use crate::transport::Transport;

use super::{Hook, HookContext, HookRecord, HookState};

/// Mounted hooks split by namespace: regular hooks live under the hooks
/// map, core-mounted built-ins attach to the root instance directly
#[derive(Default)]
pub(crate) struct HookSet {
    pub hooks: HashMap<String, HookRecord>,
    pub core_mounts: HashMap<String, HookRecord>,
}

pub(crate) struct LoaderDeps {
    pub config: Config,
    pub supervisor: Arc<ConnectionSupervisor>,
    pub scripts: Arc<ScriptRegistry>,
    pub transport: Arc<dyn Transport>,
    pub clock: Arc<dyn Clock>,
    pub events: broadcast::Sender<CoreEvent>,
}

/// Mount and initialize the given hooks. Errors abort instance startup.
pub(crate) async fn load_hooks(
    candidates: Vec<Arc<dyn Hook>>,
    deps: &LoaderDeps,
) -> Result<HookSet> {
    let mut set = HookSet::default();
    let mut pending: Vec<(String, HookContext, Arc<dyn Hook>)> = Vec::new();

    for hook in candidates {
        let name = hook.name().to_lowercase();
        if name.is_empty() {
            let err = Error::HookValidation {
                hook: "<unnamed>".to_string(),
                reason: "hook name must not be empty".to_string(),
            };
            warn!(error = %err, "skipping invalid hook");
            continue;
        }
        if matches!(deps.config.hook_options.get(&name), Some(Value::Bool(false))) {
            debug!(hook = %name, "hook disabled by configuration, skipped");
            continue;
        }

        let user_section = deps
            .config
            .hook_options
            .get(&name)
            .filter(|v| v.is_object())
            .cloned()
            .unwrap_or(Value::Object(serde_json::Map::new()));
        let options = merge_options(hook.defaults(), &user_section);

        let scripts = hook.scripts();
        if !scripts.is_empty() {
            deps.scripts.register_all(scripts).await;
            let default = deps.supervisor.client("default").await?;
            deps.scripts.apply("default", &default, false).await?;
            if let Ok(read_only) = deps.supervisor.client("readOnly").await {
                deps.scripts.apply("readOnly", &read_only, true).await?;
            }
        }

        let ctx = HookContext {
            name: name.clone(),
            options: options.clone(),
            config: deps.config.clone(),
            supervisor: Arc::clone(&deps.supervisor),
            scripts: Arc::clone(&deps.scripts),
            transport: Arc::clone(&deps.transport),
            clock: Arc::clone(&deps.clock),
            events: deps.events.clone(),
        };

        let record = HookRecord {
            hook: Arc::clone(&hook),
            state: HookState::Mounted,
            options,
            core_mounted: hook.core_mounted(),
        };
        let target = if record.core_mounted {
            &mut set.core_mounts
        } else {
            &mut set.hooks
        };
        if target.insert(name.clone(), record).is_some() {
            warn!(hook = %name, "replacing hook already mounted under this name");
        }
        let _ = deps.events.send(CoreEvent::HookMount { name: name.clone() });

        pending.push((name, ctx, hook));
    }

    // All hooks initialize concurrently, each under its own timeout.
    for (name, _, _) in &pending {
        let record = set
            .hooks
            .get_mut(name)
            .or_else(|| set.core_mounts.get_mut(name));
        if let Some(record) = record {
            record.state = HookState::Initializing;
        }
    }
    let window = deps.config.hook_timeout;
    let inits = pending.into_iter().map(|(name, ctx, hook)| async move {
        debug!(hook = %name, "initializing hook");
        match tokio::time::timeout(window, hook.initialize(ctx)).await {
            Ok(Ok(())) => Ok(name),
            Ok(Err(e)) => Err(Error::HookInitialization {
                hook: name,
                source: Box::new(e),
            }),
            Err(_) => Err(Error::HookTimeout { hook: name, window }),
        }
    });
    for result in futures::future::join_all(inits).await {
        let name = match result {
            Ok(name) => name,
            Err(e) => {
                for record in set.hooks.values_mut().chain(set.core_mounts.values_mut()) {
                    record.state = HookState::Failed;
                }
                return Err(e);
            }
        };
        let record = set
            .hooks
            .get_mut(&name)
            .or_else(|| set.core_mounts.get_mut(&name));
        if let Some(record) = record {
            record.state = HookState::Ready;
        }
        let _ = deps.events.send(CoreEvent::HookReady { name });
    }

    Ok(set)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::ClientOwner;
    use crate::testutil::{MockBus, MockTransport};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    struct RecordingHook {
        name: &'static str,
        defaults: Value,
        seen_options: Arc<std::sync::Mutex<Option<Value>>>,
        initialized: Arc<AtomicBool>,
    }

    impl RecordingHook {
        fn new(name: &'static str, defaults: Value) -> Self {
            Self {
                name,
                defaults,
                seen_options: Arc::new(std::sync::Mutex::new(None)),
                initialized: Arc::new(AtomicBool::new(false)),
            }
        }
    }

    #[async_trait]
    impl Hook for RecordingHook {
        fn name(&self) -> &str {
            self.name
        }

        fn defaults(&self) -> Value {
            self.defaults.clone()
        }

        async fn initialize(&self, ctx: HookContext) -> Result<()> {
            *self.seen_options.lock().unwrap() = Some(ctx.options().clone());
            self.initialized.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    struct SlowHook;

    #[async_trait]
    impl Hook for SlowHook {
        fn name(&self) -> &str {
            "slow"
        }

        async fn initialize(&self, _ctx: HookContext) -> Result<()> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(())
        }
    }

    struct FailingHook;

    #[async_trait]
    impl Hook for FailingHook {
        fn name(&self) -> &str {
            "failing"
        }

        async fn initialize(&self, _ctx: HookContext) -> Result<()> {
            Err(Error::Config("broken hook".to_string()))
        }
    }

    async fn deps(config: Config) -> LoaderDeps {
        let (events, _) = broadcast::channel(32);
        let transport: Arc<dyn Transport> = Arc::new(MockTransport::new(MockBus::new()));
        let supervisor = Arc::new(ConnectionSupervisor::new(
            config.clone(),
            Arc::clone(&transport),
            events.clone(),
        ));
        supervisor
            .create_client("default", ClientOwner::Core, false)
            .await
            .unwrap();
        LoaderDeps {
            config,
            supervisor,
            scripts: Arc::new(ScriptRegistry::new()),
            transport,
            clock: Arc::new(crate::clock::ManualClock::new(0)),
            events,
        }
    }

    #[tokio::test]
    async fn hooks_mount_and_initialize_with_merged_options() {
        let config = Config::default().with_hook_options(
            "cool",
            serde_json::json!({"nested": {"b": 2}, "extra": true}),
        );
        let deps = deps(config).await;
        let hook = Arc::new(RecordingHook::new(
            "cool",
            serde_json::json!({"nested": {"a": 1, "b": 0}}),
        ));
        let seen = Arc::clone(&hook.seen_options);
        let initialized = Arc::clone(&hook.initialized);

        let set = load_hooks(vec![hook], &deps).await.unwrap();

        assert!(initialized.load(Ordering::SeqCst));
        assert_eq!(set.hooks["cool"].state, HookState::Ready);
        assert!(set.core_mounts.is_empty());
        assert_eq!(
            seen.lock().unwrap().clone().unwrap(),
            serde_json::json!({"nested": {"a": 1, "b": 2}, "extra": true})
        );
    }

    #[tokio::test]
    async fn disabled_hooks_are_skipped() {
        let config = Config::default().with_hook_disabled("cool");
        let deps = deps(config).await;
        let hook = Arc::new(RecordingHook::new("cool", Value::Object(Default::default())));
        let initialized = Arc::clone(&hook.initialized);

        let set = load_hooks(vec![hook], &deps).await.unwrap();

        assert!(!initialized.load(Ordering::SeqCst));
        assert!(set.hooks.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn slow_hooks_fail_startup_with_a_timeout() {
        let config = Config::default().with_hook_timeout(Duration::from_secs(10));
        let deps = deps(config).await;

        let err = load_hooks(vec![Arc::new(SlowHook)], &deps)
            .await
            .err()
            .expect("slow hook should time out");
        match err {
            Error::HookTimeout { hook, window } => {
                assert_eq!(hook, "slow");
                assert_eq!(window, Duration::from_secs(10));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn initialize_errors_are_fatal_and_carry_the_hook_name() {
        let deps = deps(Config::default()).await;

        let err = load_hooks(vec![Arc::new(FailingHook)], &deps)
            .await
            .err()
            .expect("failing hook should abort startup");
        match err {
            Error::HookInitialization { hook, source } => {
                assert_eq!(hook, "failing");
                assert!(source.to_string().contains("broken hook"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn mount_events_are_emitted() {
        let deps = deps(Config::default()).await;
        let mut events = deps.events.subscribe();
        let hook = Arc::new(RecordingHook::new("watched", Value::Object(Default::default())));

        load_hooks(vec![hook], &deps).await.unwrap();

        let mut saw_mount = false;
        let mut saw_ready = false;
        while let Ok(event) = events.try_recv() {
            match event {
                CoreEvent::HookMount { name } if name == "watched" => saw_mount = true,
                CoreEvent::HookReady { name } if name == "watched" => saw_ready = true,
                _ => {}
            }
        }
        assert!(saw_mount);
        assert!(saw_ready);
    }
}
