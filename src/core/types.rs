//! Shared types for connection state, cluster topology and lifecycle events

use serde::Serialize;
use std::sync::Arc;

use crate::core::error::Error;

/// Lifecycle state of a single client connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    /// Handshake in progress
    Connecting,
    /// Connected and able to serve commands
    Ready,
    /// The connection hit an unrecoverable error
    Error,
    /// The connection was closed deliberately
    Closed,
}

/// Role of a node within a cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeRole {
    /// Primary node, accepts writes
    Master,
    /// Replica node, read-only
    Replica,
}

/// Who requested the creation of a client connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientOwner {
    /// The root instance itself
    Core,
    /// A mounted hook, by name
    Hook(String),
}

impl ClientOwner {
    /// Registry key for a client name under this owner. Core-owned clients
    /// use the bare name, hook-owned clients are namespaced by hook name.
    #[must_use]
    pub fn scoped_name(&self, name: &str) -> String {
        match self {
            Self::Core => name.to_string(),
            Self::Hook(hook) => format!("{hook}:{name}"),
        }
    }
}

/// Status of one named client, as reported in the ready summary
#[derive(Debug, Clone)]
pub struct ClientStatus {
    /// Scoped client name (e.g. `default`, `readOnly`, `pubsub:subscriber`)
    pub name: String,
    /// Who owns the client
    pub owner: ClientOwner,
    /// Current connection state
    pub state: ClientState,
}

/// Per-connection summary emitted with the root `ready` event
#[derive(Debug, Clone)]
pub struct ReadySummary {
    /// Unique id of the instance
    pub id: String,
    /// Every client created so far, with its state
    pub clients: Vec<ClientStatus>,
    /// Names of all mounted hooks
    pub hooks: Vec<String>,
}

/// Process details reported by [`host_info`](crate::Redikit::host_info)
#[derive(Debug, Clone, Serialize)]
pub struct ProcessInfo {
    /// OS process id
    pub pid: u32,
    /// Program name, from the first process argument
    pub title: String,
    /// Seconds since the instance booted
    pub up_time: u64,
    /// Boot timestamp in unix milliseconds
    pub started_at: u64,
    /// Machine host name
    pub host_name: String,
    /// Crate version
    pub version: String,
}

/// Details about this host and instance, useful for targeted pub/sub and
/// inter-instance coordination
#[derive(Debug, Clone, Serialize)]
pub struct HostInfo {
    /// Unique id of the instance
    pub id: String,
    /// Process details
    pub process: ProcessInfo,
    /// Current timestamp in unix milliseconds
    pub timestamp: u64,
}

/// Lifecycle events emitted by the root instance
#[derive(Debug, Clone)]
pub enum CoreEvent {
    /// A named client reported ready
    ClientReady {
        /// Scoped client name
        name: String,
    },
    /// All requested clients are ready and every hook has initialized
    Ready(ReadySummary),
    /// An error was routed through the internal handler
    Error(Arc<Error>),
    /// A hook was attached to its mount point
    HookMount {
        /// Hook name
        name: String,
    },
    /// A hook was detached from its mount point
    HookUnmount {
        /// Hook name
        name: String,
    },
    /// A hook finished initializing
    HookReady {
        /// Hook name
        name: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scoped_names() {
        assert_eq!(ClientOwner::Core.scoped_name("default"), "default");
        assert_eq!(
            ClientOwner::Hook("pubsub".to_string()).scoped_name("subscriber"),
            "pubsub:subscriber"
        );
    }
}
