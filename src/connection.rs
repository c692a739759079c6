//! Named client supervision
//!
//! The supervisor owns every command connection the instance creates, tracks
//! each one by a caller-chosen name with an owner tag, funnels runtime errors
//! to one place and provides the cluster node helpers built on top of the
//! default client.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, error, warn};

use crate::core::config::Config;
use crate::core::error::{Error, Result};
use crate::core::types::{ClientOwner, ClientState, ClientStatus, CoreEvent, NodeRole};
use crate::transport::{CommandHandle, Reply, Transport};

struct NamedClient {
    owner: ClientOwner,
    handle: Arc<dyn CommandHandle>,
}

/// A handle scoped to one cluster node, for targeted commands
pub struct NodeClient {
    addr: String,
    handle: Arc<dyn CommandHandle>,
}

impl NodeClient {
    /// The `host:port` address this handle targets
    #[must_use]
    pub fn address(&self) -> &str {
        &self.addr
    }

    /// Issue a command against this node only
    pub async fn command(&self, cmd: &str, args: &[String]) -> Result<Reply> {
        self.handle.node_command(&self.addr, cmd, args).await
    }
}

/// Owner of every named command connection
pub struct ConnectionSupervisor {
    config: Config,
    transport: Arc<dyn Transport>,
    clients: RwLock<HashMap<String, NamedClient>>,
    auxiliary: AtomicUsize,
    events: broadcast::Sender<CoreEvent>,
}

impl ConnectionSupervisor {
    /// Create a supervisor with no clients yet
    pub fn new(
        config: Config,
        transport: Arc<dyn Transport>,
        events: broadcast::Sender<CoreEvent>,
    ) -> Self {
        Self {
            config,
            transport,
            clients: RwLock::new(HashMap::new()),
            auxiliary: AtomicUsize::new(0),
            events,
        }
    }

    /// The configuration this supervisor was built with
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Whether the configuration targets a cluster
    #[must_use]
    pub fn is_cluster(&self) -> bool {
        self.config.is_cluster()
    }

    /// Open and register a named client. Resolves once the connection is
    /// ready. Re-using a name replaces the previous client for that name.
    pub async fn create_client(
        &self,
        name: &str,
        owner: ClientOwner,
        read_only: bool,
    ) -> Result<Arc<dyn CommandHandle>> {
        if name.is_empty() {
            return Err(Error::Config("client name must not be empty".to_string()));
        }
        let scoped = owner.scoped_name(name);
        debug!(client = %scoped, read_only, "creating new redis client");

        let handle = self.transport.open(&scoped, read_only).await?;

        let mut clients = self.clients.write().await;
        if clients.contains_key(&scoped) {
            warn!(client = %scoped, "replacing existing client with the same name");
        }
        clients.insert(
            scoped.clone(),
            NamedClient {
                owner,
                handle: Arc::clone(&handle),
            },
        );
        drop(clients);

        let _ = self.events.send(CoreEvent::ClientReady { name: scoped });
        Ok(handle)
    }

    /// Look up a client by its scoped name
    pub async fn client(&self, scoped_name: &str) -> Result<Arc<dyn CommandHandle>> {
        self.clients
            .read()
            .await
            .get(scoped_name)
            .map(|c| Arc::clone(&c.handle))
            .ok_or_else(|| Error::UnknownClient(scoped_name.to_string()))
    }

    /// Whether the named client exists and currently reports ready
    pub async fn is_client_connected(&self, scoped_name: &str) -> bool {
        self.clients
            .read()
            .await
            .get(scoped_name)
            .is_some_and(|c| c.handle.state() == ClientState::Ready)
    }

    /// Status snapshot of every registered client
    pub async fn statuses(&self) -> Vec<ClientStatus> {
        let clients = self.clients.read().await;
        let mut out: Vec<ClientStatus> = clients
            .iter()
            .map(|(name, c)| ClientStatus {
                name: name.clone(),
                owner: c.owner.clone(),
                state: c.handle.state(),
            })
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    /// Count auxiliary connections (the subscriber) that live outside the
    /// named-client map, so totals stay honest
    pub fn note_auxiliary(&self) {
        self.auxiliary.fetch_add(1, Ordering::Relaxed);
    }

    /// Total live connections, named clients plus auxiliaries
    pub async fn connection_count(&self) -> usize {
        self.clients.read().await.len() + self.auxiliary.load(Ordering::Relaxed)
    }

    /// Funnel for runtime errors from any connection.
    ///
    /// With `log_redis_errors` set the error is logged and swallowed.
    /// Otherwise it is broadcast as an event so callers can react; if nobody
    /// is listening it is logged anyway rather than dropped silently.
    pub fn handle_error(&self, err: Error) {
        if self.config.log_redis_errors {
            error!(error = %err, "redis error");
            return;
        }
        let err = Arc::new(err);
        let unheard = self.events.receiver_count() == 0
            || self.events.send(CoreEvent::Error(Arc::clone(&err))).is_err();
        if unheard {
            error!(error = %err, "redis error (no listeners attached)");
        }
    }

    /// Addresses of cluster nodes with the given role. Empty for standalone.
    pub async fn node_addresses(&self, role: Option<NodeRole>) -> Result<Vec<String>> {
        if !self.is_cluster() {
            return Ok(Vec::new());
        }
        let handle = self.client("default").await?;
        handle.node_addresses(role).await
    }

    /// Addresses of all known cluster nodes
    pub async fn get_nodes(&self) -> Result<Vec<String>> {
        self.node_addresses(None).await
    }

    /// Addresses of the cluster master nodes
    pub async fn get_masters(&self) -> Result<Vec<String>> {
        self.node_addresses(Some(NodeRole::Master)).await
    }

    /// Addresses of the cluster replica nodes
    pub async fn get_slaves(&self) -> Result<Vec<String>> {
        self.node_addresses(Some(NodeRole::Replica)).await
    }

    /// A handle scoped to one cluster node, or `None` when the address is
    /// not a known node
    pub async fn node_client(&self, addr: &str) -> Result<Option<NodeClient>> {
        if !self.is_cluster() {
            return Err(Error::NotCluster);
        }
        let handle = self.client("default").await?;
        let known = handle.node_addresses(None).await?;
        if !known.iter().any(|a| a == addr) {
            return Ok(None);
        }
        Ok(Some(NodeClient {
            addr: addr.to_string(),
            handle,
        }))
    }

    /// Run one command on every master node concurrently. Replies come back
    /// in master-address order.
    pub async fn exec_on_masters(&self, cmd: &str, args: &[String]) -> Result<Vec<Reply>> {
        if !self.is_cluster() {
            return Err(Error::NotCluster);
        }
        let handle = self.client("default").await?;
        let masters = handle.node_addresses(Some(NodeRole::Master)).await?;
        if masters.is_empty() {
            return Err(Error::NoMasterNodes);
        }
        let calls = masters
            .iter()
            .map(|addr| handle.node_command(addr, cmd, args));
        futures::future::try_join_all(calls).await
    }

    /// Gracefully close every client, waiting for in-flight replies
    pub async fn quit_all(&self) {
        let mut clients = self.clients.write().await;
        for (name, client) in clients.drain() {
            if let Err(e) = client.handle.quit().await {
                warn!(client = %name, error = %e, "error while quitting client");
            }
        }
    }

    /// Forcibly drop every client without waiting
    pub async fn disconnect_all(&self) {
        let mut clients = self.clients.write().await;
        for (_, client) in clients.drain() {
            client.handle.disconnect();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{MockBus, MockTransport};

    fn supervisor(config: Config) -> (Arc<ConnectionSupervisor>, broadcast::Receiver<CoreEvent>) {
        let (tx, rx) = broadcast::channel(16);
        let transport = Arc::new(MockTransport::new(MockBus::new()));
        (
            Arc::new(ConnectionSupervisor::new(config, transport, tx)),
            rx,
        )
    }

    #[tokio::test]
    async fn create_client_registers_and_announces() {
        let (sup, mut rx) = supervisor(Config::default());
        sup.create_client("default", ClientOwner::Core, false)
            .await
            .unwrap();

        assert!(sup.is_client_connected("default").await);
        assert_eq!(sup.connection_count().await, 1);
        match rx.recv().await.unwrap() {
            CoreEvent::ClientReady { name } => assert_eq!(name, "default"),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn hook_clients_are_scoped_by_owner() {
        let (sup, _rx) = supervisor(Config::default());
        sup.create_client("publisher", ClientOwner::Hook("queue".to_string()), false)
            .await
            .unwrap();

        assert!(sup.client("queue:publisher").await.is_ok());
        assert!(sup.client("publisher").await.is_err());
    }

    #[tokio::test]
    async fn empty_name_is_rejected() {
        let (sup, _rx) = supervisor(Config::default());
        let err = sup
            .create_client("", ClientOwner::Core, false)
            .await
            .err()
            .expect("empty client name should be rejected");
        assert!(matches!(err, Error::Config(_)));
    }

    #[tokio::test]
    async fn cluster_helpers_error_on_standalone() {
        let (sup, _rx) = supervisor(Config::default());
        sup.create_client("default", ClientOwner::Core, false)
            .await
            .unwrap();

        assert!(sup.get_nodes().await.unwrap().is_empty());
        assert!(matches!(
            sup.node_client("127.0.0.1:6379").await,
            Err(Error::NotCluster)
        ));
        assert!(matches!(
            sup.exec_on_masters("FLUSHALL", &[]).await,
            Err(Error::NotCluster)
        ));
    }

    #[tokio::test]
    async fn exec_on_masters_fans_out_in_order() {
        let bus = MockBus::new();
        bus.set_cluster(
            vec!["10.0.0.1:6379".to_string(), "10.0.0.2:6379".to_string()],
            vec!["10.0.0.3:6379".to_string()],
        );
        let config = Config::cluster(vec![crate::core::config::HostPort::new("10.0.0.1", 6379)]);
        let (tx, _rx) = broadcast::channel(16);
        let sup = ConnectionSupervisor::new(config, Arc::new(MockTransport::new(bus.clone())), tx);
        sup.create_client("default", ClientOwner::Core, false)
            .await
            .unwrap();

        let masters = sup.get_masters().await.unwrap();
        assert_eq!(masters, vec!["10.0.0.1:6379", "10.0.0.2:6379"]);
        assert_eq!(sup.get_slaves().await.unwrap(), vec!["10.0.0.3:6379"]);
        assert_eq!(sup.get_nodes().await.unwrap().len(), 3);

        let replies = sup.exec_on_masters("PING", &[]).await.unwrap();
        assert_eq!(replies.len(), 2);

        let node = sup.node_client("10.0.0.3:6379").await.unwrap();
        assert!(node.is_some());
        assert!(sup.node_client("10.9.9.9:6379").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn error_funnel_broadcasts_when_listeners_exist() {
        let (sup, mut rx) = supervisor(Config::default());
        sup.handle_error(Error::Client("boom".to_string()));
        match rx.recv().await.unwrap() {
            CoreEvent::Error(e) => assert!(e.to_string().contains("boom")),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn quit_all_empties_the_client_map() {
        let (sup, _rx) = supervisor(Config::default());
        sup.create_client("default", ClientOwner::Core, false)
            .await
            .unwrap();
        sup.quit_all().await;
        assert_eq!(sup.connection_count().await, 0);
        assert!(!sup.is_client_connected("default").await);
    }
}
