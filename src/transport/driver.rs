//! Production transport backed by the redis-rs client
//!
//! Standalone connections use a multiplexed async connection; cluster
//! connections use the cluster-async client with optional read-from-replica
//! routing. Per-node access (for master fan-out commands) opens dedicated
//! connections keyed by `host:port`, populated lazily from the cluster's
//! `CLUSTER NODES` table.

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::cluster::ClusterClientBuilder;
use redis::cluster_async::ClusterConnection;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

use crate::core::config::{Config, ScaleReads};
use crate::core::error::{Error, Result};
use crate::core::types::{ClientState, NodeRole};
use crate::transport::{
    CommandHandle, RawMessage, Reply, SubscriberControl, SubscriberHandle, Transport,
};

/// Transport backed by redis-rs, chosen automatically from configuration
/// (cluster iff a non-empty host list was supplied)
pub struct RedisTransport {
    config: Config,
}

impl RedisTransport {
    /// Create a transport for the given configuration
    #[must_use]
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    fn standalone_info(&self, host: &str, port: u16, db: i64) -> redis::ConnectionInfo {
        redis::ConnectionInfo {
            addr: redis::ConnectionAddr::Tcp(host.to_string(), port),
            redis: redis::RedisConnectionInfo {
                db,
                username: None,
                password: self.config.password.clone(),
                ..Default::default()
            },
        }
    }

    fn cluster_infos(&self) -> Vec<redis::ConnectionInfo> {
        self.config
            .hosts
            .iter()
            .map(|hp| self.standalone_info(&hp.host, hp.port, 0))
            .collect()
    }

    /// Host used for the subscriber connection. Regular pub/sub is
    /// cluster-global, so any single node will do; we use the first.
    fn subscriber_info(&self) -> redis::ConnectionInfo {
        if let Some(first) = self.config.hosts.first() {
            self.standalone_info(&first.host, first.port, 0)
        } else {
            self.standalone_info(&self.config.host, self.config.port, i64::from(self.config.db))
        }
    }
}

#[async_trait]
impl Transport for RedisTransport {
    async fn open(&self, name: &str, read_only: bool) -> Result<Arc<dyn CommandHandle>> {
        if self.config.is_cluster() {
            debug!(client = name, read_only, "creating redis CLUSTER client");
            let mut builder = ClusterClientBuilder::new(self.cluster_infos());
            if read_only || self.config.scale_reads == ScaleReads::All {
                builder = builder.read_from_replicas();
            }
            if let Some(password) = &self.config.password {
                builder = builder.password(password.clone());
            }
            let client = builder.build()?;
            let conn = client.get_async_connection().await?;
            Ok(Arc::new(ClusterHandle {
                conn,
                state: StateCell::ready(),
                node_conns: Mutex::new(HashMap::new()),
                password: self.config.password.clone(),
            }))
        } else {
            debug!(client = name, "creating redis client");
            let info = self.standalone_info(
                &self.config.host,
                self.config.port,
                i64::from(self.config.db),
            );
            let client = redis::Client::open(info)?;
            let conn = client.get_multiplexed_async_connection().await?;
            Ok(Arc::new(StandaloneHandle {
                conn,
                state: StateCell::ready(),
            }))
        }
    }

    async fn open_subscriber(&self) -> Result<SubscriberHandle> {
        let client = redis::Client::open(self.subscriber_info())?;
        let pubsub = client.get_async_pubsub().await?;
        let (sink, mut stream) = pubsub.split();

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            use futures::StreamExt;
            while let Some(msg) = stream.next().await {
                let channel = msg.get_channel_name().to_string();
                let payload: String = msg.get_payload().unwrap_or_default();
                let pattern = msg.get_pattern::<Option<String>>().ok().flatten();
                if tx
                    .send(RawMessage {
                        channel,
                        payload,
                        pattern,
                    })
                    .is_err()
                {
                    break;
                }
            }
            debug!("subscriber stream ended");
        });

        Ok(SubscriberHandle {
            control: Arc::new(PubSubControl {
                sink: Mutex::new(sink),
            }),
            messages: rx,
        })
    }
}

/// Connection state shared between a handle and its clones
#[derive(Clone)]
struct StateCell(Arc<AtomicU8>);

impl StateCell {
    fn ready() -> Self {
        Self(Arc::new(AtomicU8::new(1)))
    }

    fn get(&self) -> ClientState {
        match self.0.load(Ordering::SeqCst) {
            0 => ClientState::Connecting,
            1 => ClientState::Ready,
            2 => ClientState::Error,
            _ => ClientState::Closed,
        }
    }

    fn set(&self, state: ClientState) {
        let raw = match state {
            ClientState::Connecting => 0,
            ClientState::Ready => 1,
            ClientState::Error => 2,
            ClientState::Closed => 3,
        };
        self.0.store(raw, Ordering::SeqCst);
    }
}

fn build_cmd(cmd: &str, args: &[String]) -> redis::Cmd {
    let mut command = redis::cmd(cmd);
    for arg in args {
        command.arg(arg);
    }
    command
}

struct StandaloneHandle {
    conn: MultiplexedConnection,
    state: StateCell,
}

#[async_trait]
impl CommandHandle for StandaloneHandle {
    fn state(&self) -> ClientState {
        self.state.get()
    }

    async fn command(&self, cmd: &str, args: &[String]) -> Result<Reply> {
        if self.state.get() == ClientState::Closed {
            return Err(Error::Closed);
        }
        let mut conn = self.conn.clone();
        let reply: Reply = build_cmd(cmd, args)
            .query_async(&mut conn)
            .await
            .map_err(|e| {
                if e.is_io_error() {
                    self.state.set(ClientState::Error);
                }
                Error::Redis(e)
            })?;
        Ok(reply)
    }

    async fn node_addresses(&self, _role: Option<NodeRole>) -> Result<Vec<String>> {
        Ok(Vec::new())
    }

    async fn node_command(&self, _addr: &str, _cmd: &str, _args: &[String]) -> Result<Reply> {
        Err(Error::NotCluster)
    }

    async fn quit(&self) -> Result<()> {
        // In-flight replies complete on the multiplexed task; dropping the
        // last clone closes the socket.
        self.state.set(ClientState::Closed);
        Ok(())
    }

    fn disconnect(&self) {
        self.state.set(ClientState::Closed);
    }
}

struct ClusterHandle {
    conn: ClusterConnection,
    state: StateCell,
    node_conns: Mutex<HashMap<String, MultiplexedConnection>>,
    password: Option<String>,
}

#[async_trait]
impl CommandHandle for ClusterHandle {
    fn state(&self) -> ClientState {
        self.state.get()
    }

    async fn command(&self, cmd: &str, args: &[String]) -> Result<Reply> {
        if self.state.get() == ClientState::Closed {
            return Err(Error::Closed);
        }
        let mut conn = self.conn.clone();
        let reply: Reply = build_cmd(cmd, args)
            .query_async(&mut conn)
            .await
            .map_err(Error::Redis)?;
        Ok(reply)
    }

    async fn node_addresses(&self, role: Option<NodeRole>) -> Result<Vec<String>> {
        let reply = self
            .command("CLUSTER", &["NODES".to_string()])
            .await?;
        let text: String = redis::from_redis_value(&reply).map_err(Error::Redis)?;
        Ok(parse_cluster_nodes(&text)
            .into_iter()
            .filter(|(_, node_role)| role.is_none() || role == Some(*node_role))
            .map(|(addr, _)| addr)
            .collect())
    }

    async fn node_command(&self, addr: &str, cmd: &str, args: &[String]) -> Result<Reply> {
        let mut conns = self.node_conns.lock().await;
        if !conns.contains_key(addr) {
            let (host, port) = addr
                .rsplit_once(':')
                .ok_or_else(|| Error::Config(format!("invalid node address '{addr}'")))?;
            let port: u16 = port
                .parse()
                .map_err(|_| Error::Config(format!("invalid node address '{addr}'")))?;
            let info = redis::ConnectionInfo {
                addr: redis::ConnectionAddr::Tcp(host.to_string(), port),
                redis: redis::RedisConnectionInfo {
                    db: 0,
                    username: None,
                    password: self.password.clone(),
                    ..Default::default()
                },
            };
            let client = redis::Client::open(info)?;
            let conn = client.get_multiplexed_async_connection().await?;
            conns.insert(addr.to_string(), conn);
        }
        let mut conn = conns
            .get(addr)
            .cloned()
            .ok_or_else(|| Error::UnknownClient(addr.to_string()))?;
        drop(conns);
        let reply: Reply = build_cmd(cmd, args)
            .query_async(&mut conn)
            .await
            .map_err(Error::Redis)?;
        Ok(reply)
    }

    async fn quit(&self) -> Result<()> {
        self.state.set(ClientState::Closed);
        Ok(())
    }

    fn disconnect(&self) {
        self.state.set(ClientState::Closed);
    }
}

struct PubSubControl {
    sink: Mutex<redis::aio::PubSubSink>,
}

#[async_trait]
impl SubscriberControl for PubSubControl {
    async fn subscribe(&self, channels: &[String]) -> Result<()> {
        if channels.is_empty() {
            return Ok(());
        }
        let mut sink = self.sink.lock().await;
        sink.subscribe(channels).await.map_err(Error::Redis)
    }

    async fn unsubscribe(&self, channels: &[String]) -> Result<()> {
        if channels.is_empty() {
            return Ok(());
        }
        let mut sink = self.sink.lock().await;
        sink.unsubscribe(channels).await.map_err(Error::Redis)
    }

    async fn psubscribe(&self, patterns: &[String]) -> Result<()> {
        if patterns.is_empty() {
            return Ok(());
        }
        let mut sink = self.sink.lock().await;
        sink.psubscribe(patterns).await.map_err(Error::Redis)
    }

    async fn punsubscribe(&self, patterns: &[String]) -> Result<()> {
        if patterns.is_empty() {
            return Ok(());
        }
        let mut sink = self.sink.lock().await;
        sink.punsubscribe(patterns).await.map_err(Error::Redis)
    }
}

/// Parse a `CLUSTER NODES` reply into `(host:port, role)` pairs, in the
/// order the server listed them
fn parse_cluster_nodes(text: &str) -> Vec<(String, NodeRole)> {
    let mut nodes = Vec::new();
    for line in text.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 3 {
            continue;
        }
        let flags = fields[2];
        if flags.contains("noaddr") || flags.contains("handshake") {
            continue;
        }
        // addr field looks like `10.0.0.1:7000@17000`
        let addr = fields[1].split('@').next().unwrap_or(fields[1]);
        if addr.is_empty() {
            warn!(line, "skipping cluster node with empty address");
            continue;
        }
        let role = if flags.contains("master") {
            NodeRole::Master
        } else {
            NodeRole::Replica
        };
        nodes.push((addr.to_string(), role));
    }
    nodes
}

#[cfg(test)]
mod tests {
    use super::*;

    const NODES: &str = "\
07c3:2 10.0.0.1:7000@17000 myself,master - 0 0 1 connected 0-5460
9f1a:3 10.0.0.2:7000@17000 master - 0 1 2 connected 5461-10922
e7d1:4 10.0.0.3:7000@17000 master - 0 1 3 connected 10923-16383
aa01:5 10.0.0.4:7000@17000 slave 9f1a:3 0 1 2 connected
bb02:6 10.0.0.5:7000@17000 slave,fail? e7d1:4 0 1 3 connected
cc03:7 :0@0 handshake - 0 0 0 disconnected
";

    #[test]
    fn parses_masters_and_replicas() {
        let nodes = parse_cluster_nodes(NODES);
        assert_eq!(nodes.len(), 5);

        let masters: Vec<_> = nodes
            .iter()
            .filter(|(_, role)| *role == NodeRole::Master)
            .map(|(addr, _)| addr.as_str())
            .collect();
        assert_eq!(
            masters,
            vec!["10.0.0.1:7000", "10.0.0.2:7000", "10.0.0.3:7000"]
        );

        let replicas: Vec<_> = nodes
            .iter()
            .filter(|(_, role)| *role == NodeRole::Replica)
            .map(|(addr, _)| addr.as_str())
            .collect();
        assert_eq!(replicas, vec!["10.0.0.4:7000", "10.0.0.5:7000"]);
    }

    #[test]
    fn skips_handshake_entries() {
        let nodes = parse_cluster_nodes("x:1 :0@0 handshake - 0 0 0 disconnected\n");
        assert!(nodes.is_empty());
    }

    #[test]
    fn empty_input() {
        assert!(parse_cluster_nodes("").is_empty());
    }

    #[test]
    fn state_cell_transitions() {
        let cell = StateCell::ready();
        assert_eq!(cell.get(), ClientState::Ready);
        cell.set(ClientState::Error);
        assert_eq!(cell.get(), ClientState::Error);
        cell.set(ClientState::Closed);
        assert_eq!(cell.get(), ClientState::Closed);
    }
}
