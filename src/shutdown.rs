//! Shutdown coordination for embedding applications
//!
//! The library itself never touches process signals. An application that
//! wants SIGTERM/SIGINT handling registers its instances here and calls
//! [`ShutdownRegistry::shutdown_all`] from its own signal handler.

use std::sync::Mutex;
use tracing::debug;

use crate::client::Redikit;

/// Tracks live instances so one call can close them all
#[derive(Default)]
pub struct ShutdownRegistry {
    instances: Mutex<Vec<Redikit>>,
}

impl ShutdownRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Track an instance. Registering the same instance twice is harmless
    /// since shutdown is idempotent per instance.
    pub fn register(&self, instance: &Redikit) {
        self.instances
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(instance.clone());
    }

    /// Stop tracking an instance by id, without closing it
    pub fn deregister(&self, id: &str) {
        self.instances
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .retain(|i| i.id() != id);
    }

    /// Number of tracked instances
    #[must_use]
    pub fn len(&self) -> usize {
        self.instances
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len()
    }

    /// Whether no instances are tracked
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Gracefully quit every tracked instance and clear the registry
    pub async fn shutdown_all(&self) {
        let instances: Vec<Redikit> = self
            .instances
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .drain(..)
            .collect();
        debug!(count = instances.len(), "shutting down registered instances");
        for instance in instances {
            if let Err(e) = instance.quit().await {
                debug!(id = %instance.id(), error = %e, "error during shutdown");
            }
        }
    }
}
