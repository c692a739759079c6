//! Cluster utilities built-in hook
//!
//! Mounts directly onto the root instance so callers read it as
//! `instance.cluster()`. Thin typed wrappers over the supervisor's
//! topology accessors plus fan-out execution across masters.

use async_trait::async_trait;
use std::sync::{Arc, OnceLock};

use crate::connection::{ConnectionSupervisor, NodeClient};
use crate::core::config::ScaleReads;
use crate::core::error::Result;
use crate::transport::Reply;

use super::{Hook, HookContext};

/// Cluster operations exposed on the root instance
pub struct ClusterOps {
    supervisor: Arc<ConnectionSupervisor>,
    scale_reads: ScaleReads,
}

impl ClusterOps {
    /// Whether the instance is connected to a cluster
    #[must_use]
    pub fn is_cluster(&self) -> bool {
        self.supervisor.is_cluster()
    }

    /// How reads are routed. Standalone connections always read from the
    /// single node, reported as [`ScaleReads::All`].
    #[must_use]
    pub fn read_mode(&self) -> ScaleReads {
        if self.is_cluster() {
            self.scale_reads
        } else {
            ScaleReads::All
        }
    }

    /// Addresses of every known node. Empty when standalone.
    pub async fn get_nodes(&self) -> Result<Vec<String>> {
        self.supervisor.get_nodes().await
    }

    /// Addresses of the master nodes. Empty when standalone.
    pub async fn get_masters(&self) -> Result<Vec<String>> {
        self.supervisor.get_masters().await
    }

    /// Addresses of the replica nodes. Empty when standalone.
    pub async fn get_slaves(&self) -> Result<Vec<String>> {
        self.supervisor.get_slaves().await
    }

    /// A handle targeting one node, or `None` for unknown addresses
    pub async fn get_node_client(&self, addr: &str) -> Result<Option<NodeClient>> {
        self.supervisor.node_client(addr).await
    }

    /// Run a command on every master concurrently, replies in master order
    pub async fn exec(&self, cmd: &str, args: &[String]) -> Result<Vec<Reply>> {
        self.supervisor.exec_on_masters(cmd, args).await
    }
}

/// Built-in hook that installs [`ClusterOps`] at boot
pub struct ClusterHook {
    slot: Arc<OnceLock<Arc<ClusterOps>>>,
}

impl ClusterHook {
    pub(crate) fn new(slot: Arc<OnceLock<Arc<ClusterOps>>>) -> Self {
        Self { slot }
    }
}

#[async_trait]
impl Hook for ClusterHook {
    fn name(&self) -> &str {
        "cluster"
    }

    fn core_mounted(&self) -> bool {
        true
    }

    async fn initialize(&self, ctx: HookContext) -> Result<()> {
        let ops = Arc::new(ClusterOps {
            supervisor: Arc::clone(&ctx.supervisor),
            scale_reads: ctx.config.scale_reads,
        });
        let _ = self.slot.set(ops);
        Ok(())
    }
}
