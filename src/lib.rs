//! Connection management and extensibility layer for Redis
//!
//! `redikit` sits on top of the `redis` crate and handles the plumbing an
//! application otherwise repeats: named supervised connections (standalone
//! or cluster, detected from configuration), script-backed atomic commands
//! loaded exactly once per connection, prefixed pub/sub with once-only and
//! first-of-N delivery, and pluggable hook modules that extend the root
//! instance with their own options and connections.
//!
//! # Quick Start
//!
//! ```no_run
//! use redikit::{Config, Redikit};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let instance = Redikit::connect(Config::new("127.0.0.1", 6379)).await?;
//!
//!     let pubsub = instance.pubsub()?;
//!     pubsub
//!         .subscribe("orders", std::sync::Arc::new(|msg| {
//!             println!("order event: {}", msg.data);
//!         }))
//!         .await?;
//!     pubsub.publish("orders", &serde_json::json!({"id": 7})).await?;
//!
//!     instance.quit().await?;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::return_self_not_must_use)]

pub mod client;
pub mod clock;
pub mod connection;
pub mod core;
pub mod hooks;
pub mod pubsub;
pub mod scripts;
pub mod shutdown;
pub mod transport;

#[cfg(test)]
mod testutil;

pub use client::{Redikit, RedikitBuilder};
pub use shutdown::ShutdownRegistry;

pub use crate::core::{
    config::{Config, HostPort, LogConfig, ScaleReads},
    error::{Error, Result},
    types::{ClientOwner, ClientState, CoreEvent, HostInfo, NodeRole, ReadySummary},
};
pub use hooks::{Hook, HookContext, HookState};
pub use pubsub::{Channels, Listener, ListenerId, Message, PubSub};
pub use scripts::ScriptDefinition;
