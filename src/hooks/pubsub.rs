//! Pub/sub built-in hook
//!
//! Wires the engine's two connections at boot: a dedicated publisher
//! client when enabled (falling back to the shared default client) and a
//! dedicated subscriber connection when enabled. Mounts the engine directly
//! onto the root instance as `instance.pubsub()`.

use async_trait::async_trait;
use std::sync::{Arc, OnceLock};
use tracing::debug;

use crate::core::error::Result;
use crate::pubsub::{ErrorSink, PubSub};

use super::{Hook, HookContext};

/// Built-in hook that installs the [`PubSub`] engine at boot
pub struct PubSubHook {
    slot: Arc<OnceLock<Arc<PubSub>>>,
}

impl PubSubHook {
    pub(crate) fn new(slot: Arc<OnceLock<Arc<PubSub>>>) -> Self {
        Self { slot }
    }
}

#[async_trait]
impl Hook for PubSubHook {
    fn name(&self) -> &str {
        "pubsub"
    }

    fn core_mounted(&self) -> bool {
        true
    }

    async fn initialize(&self, ctx: HookContext) -> Result<()> {
        let publisher = if ctx.config.publisher {
            ctx.create_client("publisher", false).await?
        } else {
            debug!("publisher client disabled, publishing through the default client");
            ctx.default_client().await?
        };

        let subscriber = if ctx.config.subscriber {
            Some(ctx.open_subscriber().await?)
        } else {
            debug!("subscriber connection disabled, subscribe operations will fail");
            None
        };

        let errors: ErrorSink = {
            let ctx = ctx.clone();
            Arc::new(move |e| ctx.report_error(e))
        };
        let engine = PubSub::new(
            ctx.config.event_prefix.clone(),
            publisher,
            subscriber,
            ctx.clock(),
            errors,
        );
        let _ = self.slot.set(engine);
        Ok(())
    }
}
