//! The root instance
//!
//! [`Redikit`] owns the connection supervisor, the script registry and the
//! mounted hooks. Construction goes through [`RedikitBuilder`]: the default
//! client (and the read-only client, in scaled cluster mode) must report
//! ready within the connection timeout, then built-in and user hooks are
//! mounted and initialized, and finally a `ready` event carrying a
//! per-connection summary is broadcast.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Instant;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, info};
use uuid::Uuid;

use crate::clock::{CachedClock, Clock};
use crate::connection::ConnectionSupervisor;
use crate::core::config::Config;
use crate::core::error::{Error, Result};
use crate::core::types::{
    ClientOwner, CoreEvent, HostInfo, ProcessInfo, ReadySummary,
};
use crate::hooks::cluster::{ClusterHook, ClusterOps};
use crate::hooks::loader::{load_hooks, LoaderDeps};
use crate::hooks::pubsub::PubSubHook;
use crate::hooks::{Hook, HookRecord, HookState};
use crate::pubsub::PubSub;
use crate::scripts::{ScriptDefinition, ScriptRegistry};
use crate::transport::{CommandHandle, RedisTransport, Reply, Transport};

struct CoreShared {
    id: String,
    booted_at_ms: u64,
    started: Instant,
    config: Config,
    supervisor: Arc<ConnectionSupervisor>,
    scripts: Arc<ScriptRegistry>,
    clock: Arc<dyn Clock>,
    events: broadcast::Sender<CoreEvent>,
    hooks: RwLock<HashMap<String, HookRecord>>,
    core_mounts: RwLock<HashMap<String, HookRecord>>,
    pubsub: Arc<OnceLock<Arc<PubSub>>>,
    cluster: Arc<OnceLock<Arc<ClusterOps>>>,
    closed: AtomicBool,
}

/// Handle to a running instance. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct Redikit {
    shared: Arc<CoreShared>,
}

/// Builder for [`Redikit`]
pub struct RedikitBuilder {
    config: Config,
    hooks: Vec<Arc<dyn Hook>>,
    transport: Option<Arc<dyn Transport>>,
    clock: Option<Arc<dyn Clock>>,
    events: broadcast::Sender<CoreEvent>,
}

impl RedikitBuilder {
    fn new(config: Config) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            config,
            hooks: Vec::new(),
            transport: None,
            clock: None,
            events,
        }
    }

    /// Subscribe to lifecycle events before boot. Events emitted during
    /// [`connect`](Self::connect), the final `ready` event included, are
    /// only observable through a receiver taken here.
    #[must_use]
    pub fn events(&self) -> broadcast::Receiver<CoreEvent> {
        self.events.subscribe()
    }

    /// Mount a user hook at boot
    #[must_use]
    pub fn with_hook(mut self, hook: impl Hook) -> Self {
        self.hooks.push(Arc::new(hook));
        self
    }

    /// Substitute the connection factory, mainly for tests
    #[must_use]
    pub fn with_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Substitute the clock, mainly for tests
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Connect and boot. Resolves once every requested client is ready and
    /// every hook has initialized; fails if the default client is not ready
    /// within the connection timeout, or if any hook fails or times out.
    pub async fn connect(self) -> Result<Redikit> {
        let config = self.config;
        let events = self.events;
        let transport = self
            .transport
            .unwrap_or_else(|| Arc::new(RedisTransport::new(config.clone())));
        let clock = self
            .clock
            .unwrap_or_else(|| Arc::new(CachedClock::new(config.clock_cache_window)));
        let supervisor = Arc::new(ConnectionSupervisor::new(
            config.clone(),
            Arc::clone(&transport),
            events.clone(),
        ));

        let scaled_reads = config.is_cluster() && config.cluster_scale_reads;
        let boot = async {
            supervisor
                .create_client("default", ClientOwner::Core, false)
                .await?;
            if scaled_reads {
                supervisor
                    .create_client("readOnly", ClientOwner::Core, true)
                    .await?;
            }
            Ok::<(), Error>(())
        };
        tokio::select! {
            res = boot => res?,
            () = tokio::time::sleep(config.connection_timeout) => {
                supervisor.handle_error(Error::ConnectionTimeout(config.connection_timeout));
                return Err(Error::ConnectionTimeout(config.connection_timeout));
            }
        }

        let scripts = Arc::new(ScriptRegistry::new());
        scripts.register_all(ScriptRegistry::builtin()).await;
        let default = supervisor.client("default").await?;
        scripts.apply("default", &default, false).await?;
        if scaled_reads {
            let read_only = supervisor.client("readOnly").await?;
            scripts.apply("readOnly", &read_only, true).await?;
        }

        let pubsub_slot = Arc::new(OnceLock::new());
        let cluster_slot = Arc::new(OnceLock::new());
        let mut candidates: Vec<Arc<dyn Hook>> = vec![
            Arc::new(ClusterHook::new(Arc::clone(&cluster_slot))),
            Arc::new(PubSubHook::new(Arc::clone(&pubsub_slot))),
        ];
        candidates.extend(self.hooks);

        let deps = LoaderDeps {
            config: config.clone(),
            supervisor: Arc::clone(&supervisor),
            scripts: Arc::clone(&scripts),
            transport,
            clock: Arc::clone(&clock),
            events: events.clone(),
        };
        let hook_set = load_hooks(candidates, &deps).await?;

        let id = Uuid::new_v4().to_string();
        let shared = Arc::new(CoreShared {
            id,
            booted_at_ms: clock.now_ms(),
            started: Instant::now(),
            config,
            supervisor,
            scripts,
            clock,
            events,
            hooks: RwLock::new(hook_set.hooks),
            core_mounts: RwLock::new(hook_set.core_mounts),
            pubsub: pubsub_slot,
            cluster: cluster_slot,
            closed: AtomicBool::new(false),
        });

        let instance = Redikit { shared };
        let summary = instance.ready_summary().await;
        info!(id = %summary.id, clients = summary.clients.len(), "instance ready");
        let _ = instance.shared.events.send(CoreEvent::Ready(summary));
        Ok(instance)
    }
}

impl Redikit {
    /// Start building an instance with the given configuration
    #[must_use]
    pub fn builder(config: Config) -> RedikitBuilder {
        RedikitBuilder::new(config)
    }

    /// Connect with the given configuration and no user hooks
    pub async fn connect(config: Config) -> Result<Self> {
        Self::builder(config).connect().await
    }

    /// Unique id of this instance, stable for its lifetime
    #[must_use]
    pub fn id(&self) -> &str {
        &self.shared.id
    }

    /// The merged configuration
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.shared.config
    }

    /// Subscribe to instance lifecycle events
    #[must_use]
    pub fn events(&self) -> broadcast::Receiver<CoreEvent> {
        self.shared.events.subscribe()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(Error::Closed);
        }
        Ok(())
    }

    /// Open and register a new named client owned by the root instance.
    /// Replacing the default or read-only client re-applies the registered
    /// scripts, since the new connection starts with nothing defined.
    pub async fn create_client(&self, name: &str, read_only: bool) -> Result<Arc<dyn CommandHandle>> {
        self.ensure_open()?;
        let handle = self
            .shared
            .supervisor
            .create_client(name, ClientOwner::Core, read_only)
            .await?;
        self.shared.scripts.forget_client(name).await;
        if name == "default" || name == "readOnly" {
            self.shared.scripts.apply(name, &handle, read_only).await?;
        }
        Ok(handle)
    }

    /// Look up a client by its scoped name
    pub async fn client(&self, name: &str) -> Result<Arc<dyn CommandHandle>> {
        self.shared.supervisor.client(name).await
    }

    /// Whether the named client exists and currently reports ready
    pub async fn is_client_connected(&self, name: &str) -> bool {
        self.shared.supervisor.is_client_connected(name).await
    }

    /// Whether the instance targets a cluster
    #[must_use]
    pub fn is_cluster(&self) -> bool {
        self.shared.supervisor.is_cluster()
    }

    /// Addresses of every known cluster node. Empty when standalone.
    pub async fn get_nodes(&self) -> Result<Vec<String>> {
        self.shared.supervisor.get_nodes().await
    }

    /// Addresses of the cluster master nodes. Empty when standalone.
    pub async fn get_masters(&self) -> Result<Vec<String>> {
        self.shared.supervisor.get_masters().await
    }

    /// Addresses of the cluster replica nodes. Empty when standalone.
    pub async fn get_slaves(&self) -> Result<Vec<String>> {
        self.shared.supervisor.get_slaves().await
    }

    /// The pub/sub engine. Fails when the pubsub built-in was disabled.
    pub fn pubsub(&self) -> Result<Arc<PubSub>> {
        self.shared
            .pubsub
            .get()
            .cloned()
            .ok_or_else(|| Error::NotMounted("pubsub".to_string()))
    }

    /// Cluster utilities. Fails when the cluster built-in was disabled.
    pub fn cluster(&self) -> Result<Arc<ClusterOps>> {
        self.shared
            .cluster
            .get()
            .cloned()
            .ok_or_else(|| Error::NotMounted("cluster".to_string()))
    }

    /// A mounted user hook by name. Core-mounted built-ins are not in this
    /// namespace; use [`pubsub`](Self::pubsub) and
    /// [`cluster`](Self::cluster) for those.
    pub async fn hook(&self, name: &str) -> Option<Arc<dyn Hook>> {
        self.shared
            .hooks
            .read()
            .await
            .get(&name.to_lowercase())
            .map(|record| Arc::clone(&record.hook))
    }

    /// Lifecycle state of a mounted hook, core-mounted built-ins included
    pub async fn hook_state(&self, name: &str) -> Option<HookState> {
        let name = name.to_lowercase();
        if let Some(record) = self.shared.hooks.read().await.get(&name) {
            return Some(record.state);
        }
        self.shared
            .core_mounts
            .read()
            .await
            .get(&name)
            .map(|record| record.state)
    }

    /// Names of every mounted hook, core-mounted built-ins included
    pub async fn mounted_hooks(&self) -> Vec<String> {
        let mut names: Vec<String> = self.shared.hooks.read().await.keys().cloned().collect();
        names.extend(self.shared.core_mounts.read().await.keys().cloned());
        names.sort();
        names
    }

    /// Detach a hook from its mount point and emit an unmount event. The
    /// hook's connections stay open; close them through the supervisor if
    /// needed. Returns whether a hook was removed.
    pub async fn unmount_hook(&self, name: &str) -> bool {
        let name = name.to_lowercase();
        let removed = self.shared.hooks.write().await.remove(&name).is_some()
            || self.shared.core_mounts.write().await.remove(&name).is_some();
        if removed {
            debug!(hook = %name, "hook unmounted");
            let _ = self
                .shared
                .events
                .send(CoreEvent::HookUnmount { name });
        }
        removed
    }

    /// Define a script-backed command on the default client (and the
    /// read-only client when the definition is marked eligible and that
    /// client exists). Idempotent; returns whether the command is defined
    /// on every eligible client.
    pub async fn define_command(&self, def: ScriptDefinition) -> Result<bool> {
        self.ensure_open()?;
        let name = def.name.to_lowercase();
        let read_only_eligible = def.read_only;
        self.shared.scripts.register(def).await;
        if !self.shared.scripts.contains(&name).await {
            return Ok(false);
        }

        let default = self.shared.supervisor.client("default").await?;
        self.shared.scripts.apply("default", &default, false).await?;
        let mut defined = self.shared.scripts.is_applied("default", &name).await;
        if read_only_eligible {
            if let Ok(read_only) = self.shared.supervisor.client("readOnly").await {
                self.shared
                    .scripts
                    .apply("readOnly", &read_only, true)
                    .await?;
                defined = defined && self.shared.scripts.is_applied("readOnly", &name).await;
            }
        }
        Ok(defined)
    }

    /// Define several script-backed commands, skipping invalid definitions
    /// individually with a warning
    pub async fn define_commands(&self, defs: Vec<ScriptDefinition>) -> Result<()> {
        for def in defs {
            self.define_command(def).await?;
        }
        Ok(())
    }

    /// Invoke a previously defined script-backed command on the default
    /// client
    pub async fn run_command(
        &self,
        name: &str,
        keys: &[String],
        args: &[String],
    ) -> Result<Reply> {
        self.ensure_open()?;
        let default = self.shared.supervisor.client("default").await?;
        self.shared.scripts.invoke(&default, name, keys, args).await
    }

    /// Details about this instance and its host process
    pub fn host_info(&self) -> HostInfo {
        let host_name = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_default();
        let title = std::env::args().next().unwrap_or_default();
        HostInfo {
            id: self.shared.id.clone(),
            process: ProcessInfo {
                pid: std::process::id(),
                title,
                up_time: self.shared.started.elapsed().as_secs(),
                started_at: self.shared.booted_at_ms,
                host_name,
                version: env!("CARGO_PKG_VERSION").to_string(),
            },
            timestamp: self.shared.clock.now_ms(),
        }
    }

    /// Per-connection and hook summary, as carried by the `ready` event.
    /// Rebuilt from current state, so clients created after boot show up.
    pub async fn ready_summary(&self) -> ReadySummary {
        ReadySummary {
            id: self.shared.id.clone(),
            clients: self.shared.supervisor.statuses().await,
            hooks: self.mounted_hooks().await,
        }
    }

    /// Gracefully close every connection, waiting for in-flight replies.
    /// Safe to call more than once; later calls are no-ops.
    pub async fn quit(&self) -> Result<()> {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        debug!(id = %self.shared.id, "shutting down instance");
        self.shared.supervisor.quit_all().await;
        Ok(())
    }

    /// Forcibly drop every connection without waiting. Safe to call more
    /// than once.
    pub async fn disconnect(&self) {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!(id = %self.shared.id, "force disconnecting instance");
        self.shared.supervisor.disconnect_all().await;
    }
}
