//! Pluggable hook modules
//!
//! A hook extends the root instance with its own options, scripts and
//! connections. Built-in hooks cover cluster utilities and pub/sub; user
//! hooks implement [`Hook`] and are handed to the builder. Mounting,
//! options merging and initialization timeouts live in [`loader`].

pub mod cluster;
pub mod loader;
pub mod pubsub;

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::clock::Clock;
use crate::connection::ConnectionSupervisor;
use crate::core::config::Config;
use crate::core::error::{Error, Result};
use crate::core::types::{ClientOwner, CoreEvent};
use crate::scripts::{ScriptDefinition, ScriptRegistry};
use crate::transport::{CommandHandle, SubscriberHandle, Transport};

/// A pluggable module mounted onto the root instance.
///
/// Implementations declare their default options and any script-backed
/// commands, then receive a [`HookContext`] in `initialize` through which
/// they create connections and reach shared services.
#[async_trait]
pub trait Hook: Send + Sync + 'static {
    /// Mount-point name. Lowercased by the loader; also the key under
    /// which user options for this hook are looked up.
    fn name(&self) -> &str;

    /// Whether the hook mounts directly onto the root instance rather
    /// than under the hooks namespace. Reserved for built-ins.
    fn core_mounted(&self) -> bool {
        false
    }

    /// Default options, deep-merged with the user section of the same name
    fn defaults(&self) -> Value {
        Value::Object(serde_json::Map::new())
    }

    /// Script-backed commands this hook needs defined before it runs
    fn scripts(&self) -> Vec<ScriptDefinition> {
        Vec::new()
    }

    /// Bring the hook up. Runs after mounting, bounded by the configured
    /// hook timeout; an error here is fatal to instance startup.
    async fn initialize(&self, ctx: HookContext) -> Result<()>;
}

/// Lifecycle state of a mounted hook. Unmounting removes the record
/// entirely, so there is no terminal unmounted state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookState {
    /// Validated, options merged and mounted into its namespace
    Mounted,
    /// `initialize` in flight
    Initializing,
    /// Fully operational
    Ready,
    /// `initialize` failed or timed out
    Failed,
}

/// A mounted hook and its bookkeeping
pub struct HookRecord {
    /// The hook itself
    pub hook: Arc<dyn Hook>,
    /// Current lifecycle state
    pub state: HookState,
    /// Merged options (defaults deep-merged with the user section)
    pub options: Value,
    /// Whether the hook mounts onto the root instance directly
    pub core_mounted: bool,
}

/// Everything a hook may touch during and after initialization
#[derive(Clone)]
pub struct HookContext {
    pub(crate) name: String,
    pub(crate) options: Value,
    pub(crate) config: Config,
    pub(crate) supervisor: Arc<ConnectionSupervisor>,
    pub(crate) scripts: Arc<ScriptRegistry>,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) events: broadcast::Sender<CoreEvent>,
}

impl HookContext {
    /// The hook's (lowercased) mount name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Merged options for this hook
    #[must_use]
    pub fn options(&self) -> &Value {
        &self.options
    }

    /// The instance configuration
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The shared clock
    #[must_use]
    pub fn clock(&self) -> Arc<dyn Clock> {
        Arc::clone(&self.clock)
    }

    /// The shared script registry, for commands defined after boot
    #[must_use]
    pub fn scripts(&self) -> Arc<ScriptRegistry> {
        Arc::clone(&self.scripts)
    }

    /// Open a hook-owned named connection. The name is scoped by the hook
    /// name in the instance's client registry.
    pub async fn create_client(&self, name: &str, read_only: bool) -> Result<Arc<dyn CommandHandle>> {
        self.supervisor
            .create_client(name, ClientOwner::Hook(self.name.clone()), read_only)
            .await
    }

    /// The shared default client
    pub async fn default_client(&self) -> Result<Arc<dyn CommandHandle>> {
        self.supervisor.client("default").await
    }

    /// Open a dedicated subscriber connection owned by this hook
    pub async fn open_subscriber(&self) -> Result<SubscriberHandle> {
        let handle = self.transport.open_subscriber().await?;
        self.supervisor.note_auxiliary();
        Ok(handle)
    }

    /// Subscribe to instance lifecycle events
    #[must_use]
    pub fn events(&self) -> broadcast::Receiver<CoreEvent> {
        self.events.subscribe()
    }

    /// Route a runtime error through the instance's error funnel
    pub fn report_error(&self, err: Error) {
        self.supervisor.handle_error(err);
    }
}
