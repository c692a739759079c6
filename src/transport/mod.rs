//! Trait seam over the underlying redis-rs client
//!
//! Everything above this module talks to Redis through these traits. The
//! production implementation lives in [`driver`]; tests substitute mocks so
//! the supervision, pub/sub and hook logic can be exercised without a
//! server.

pub mod driver;

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::core::error::Result;
use crate::core::types::{ClientState, NodeRole};

pub use driver::RedisTransport;

/// Reply value from the underlying client
pub type Reply = redis::Value;

/// A raw pub/sub frame from the subscriber connection, before decoding
#[derive(Debug, Clone)]
pub struct RawMessage {
    /// Channel the message arrived on (still prefixed)
    pub channel: String,
    /// Raw payload string
    pub payload: String,
    /// The matched pattern, for pattern subscriptions
    pub pattern: Option<String>,
}

/// A command-capable client handle (standalone or cluster)
#[async_trait]
pub trait CommandHandle: Send + Sync {
    /// Current connection state
    fn state(&self) -> ClientState;

    /// Issue a command with string arguments and return the raw reply
    async fn command(&self, cmd: &str, args: &[String]) -> Result<Reply>;

    /// Addresses (`host:port`) of cluster nodes with the given role, or all
    /// nodes when `role` is `None`. Empty for standalone connections.
    async fn node_addresses(&self, role: Option<NodeRole>) -> Result<Vec<String>>;

    /// Issue a command against one specific cluster node
    async fn node_command(&self, addr: &str, cmd: &str, args: &[String]) -> Result<Reply>;

    /// Graceful close: wait for in-flight replies, then drop the connection
    async fn quit(&self) -> Result<()>;

    /// Forced close, immediately
    fn disconnect(&self);
}

/// Control half of a subscriber connection
#[async_trait]
pub trait SubscriberControl: Send + Sync {
    /// Subscribe to the given (already prefixed) channels
    async fn subscribe(&self, channels: &[String]) -> Result<()>;

    /// Unsubscribe from the given (already prefixed) channels
    async fn unsubscribe(&self, channels: &[String]) -> Result<()>;

    /// Subscribe to the given patterns
    async fn psubscribe(&self, patterns: &[String]) -> Result<()>;

    /// Unsubscribe from the given patterns
    async fn punsubscribe(&self, patterns: &[String]) -> Result<()>;
}

/// A subscriber connection: its control half plus the incoming frame stream
pub struct SubscriberHandle {
    /// Subscribe/unsubscribe control
    pub control: Arc<dyn SubscriberControl>,
    /// Stream of raw frames, FIFO per channel
    pub messages: mpsc::UnboundedReceiver<RawMessage>,
}

/// Factory for client connections, implemented by the production driver and
/// by test mocks
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Open a command connection. Resolves once the client reports ready.
    /// `read_only` requests replica-scaled reads (cluster mode only).
    async fn open(&self, name: &str, read_only: bool) -> Result<Arc<dyn CommandHandle>>;

    /// Open a dedicated subscriber connection
    async fn open_subscriber(&self) -> Result<SubscriberHandle>;
}
