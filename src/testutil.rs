//! In-memory transport doubles shared across unit tests

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

use crate::core::error::{Error, Result};
use crate::core::types::{ClientState, NodeRole};
use crate::scripts::script_sha;
use crate::transport::{
    CommandHandle, RawMessage, Reply, SubscriberControl, SubscriberHandle, Transport,
};

struct SubscriberEntry {
    channels: HashSet<String>,
    tx: mpsc::UnboundedSender<RawMessage>,
}

#[derive(Default)]
struct BusState {
    commands: Vec<(String, Vec<String>)>,
    published: HashMap<String, Vec<String>>,
    subscribers: Vec<SubscriberEntry>,
    script_cache: HashSet<String>,
    opened_clients: Vec<String>,
    masters: Vec<String>,
    replicas: Vec<String>,
}

/// A fake Redis server shared by every handle a test creates
#[derive(Clone, Default)]
pub struct MockBus {
    state: Arc<Mutex<BusState>>,
}

impl MockBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BusState> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// A command handle wired straight to this bus, without a transport
    pub fn handle(&self) -> Arc<dyn CommandHandle> {
        Arc::new(MockHandle {
            bus: self.clone(),
            closed: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Simulate a cluster with the given master and replica addresses
    pub fn set_cluster(&self, masters: Vec<String>, replicas: Vec<String>) {
        let mut state = self.lock();
        state.masters = masters;
        state.replicas = replicas;
    }

    /// Every invocation of the named command, with its arguments
    pub fn commands_named(&self, cmd: &str) -> Vec<Vec<String>> {
        self.lock()
            .commands
            .iter()
            .filter(|(name, _)| name == cmd)
            .map(|(_, args)| args.clone())
            .collect()
    }

    /// Payloads published to the given (prefixed) channel, in order
    pub fn published(&self, channel: &str) -> Vec<String> {
        self.lock()
            .published
            .get(channel)
            .cloned()
            .unwrap_or_default()
    }

    /// Whether any subscriber connection holds the (prefixed) channel
    pub fn is_subscribed(&self, channel: &str) -> bool {
        self.lock()
            .subscribers
            .iter()
            .any(|s| s.channels.contains(channel))
    }

    /// Re-add a channel to every subscriber connection, simulating an
    /// out-of-band resubscribe
    pub fn force_subscribe(&self, channel: &str) {
        for entry in &mut self.lock().subscribers {
            entry.channels.insert(channel.to_string());
        }
    }

    /// Names of every client opened through the transport, in order
    pub fn opened_clients(&self) -> Vec<String> {
        self.lock().opened_clients.clone()
    }

    fn publish(&self, channel: &str, payload: &str) -> i64 {
        let mut state = self.lock();
        state
            .published
            .entry(channel.to_string())
            .or_default()
            .push(payload.to_string());
        let mut receivers = 0;
        for entry in &state.subscribers {
            if !entry.channels.contains(channel) {
                continue;
            }
            let delivered = entry
                .tx
                .send(RawMessage {
                    channel: channel.to_string(),
                    payload: payload.to_string(),
                    pattern: None,
                })
                .is_ok();
            if delivered {
                receivers += 1;
            }
        }
        receivers
    }
}

struct MockHandle {
    bus: MockBus,
    closed: Arc<AtomicBool>,
}

#[async_trait]
impl CommandHandle for MockHandle {
    fn state(&self) -> ClientState {
        if self.closed.load(Ordering::SeqCst) {
            ClientState::Closed
        } else {
            ClientState::Ready
        }
    }

    async fn command(&self, cmd: &str, args: &[String]) -> Result<Reply> {
        self.bus
            .lock()
            .commands
            .push((cmd.to_string(), args.to_vec()));
        match cmd {
            "PUBLISH" => {
                let receivers = self.bus.publish(&args[0], &args[1]);
                Ok(Reply::Int(receivers))
            }
            "SCRIPT" if args.first().map(String::as_str) == Some("LOAD") => {
                let sha = script_sha(&args[1]);
                self.bus.lock().script_cache.insert(sha.clone());
                Ok(Reply::BulkString(sha.into_bytes()))
            }
            "EVALSHA" => {
                if self.bus.lock().script_cache.contains(&args[0]) {
                    Ok(Reply::Okay)
                } else {
                    Err(Error::Client(
                        "NOSCRIPT No matching script. Please use EVAL.".to_string(),
                    ))
                }
            }
            _ => Ok(Reply::Okay),
        }
    }

    async fn node_addresses(&self, role: Option<NodeRole>) -> Result<Vec<String>> {
        let state = self.bus.lock();
        Ok(match role {
            Some(NodeRole::Master) => state.masters.clone(),
            Some(NodeRole::Replica) => state.replicas.clone(),
            None => {
                let mut all = state.masters.clone();
                all.extend(state.replicas.clone());
                all
            }
        })
    }

    async fn node_command(&self, addr: &str, cmd: &str, args: &[String]) -> Result<Reply> {
        {
            let state = self.bus.lock();
            if !state.masters.iter().chain(&state.replicas).any(|a| a == addr) {
                return Err(Error::UnknownClient(addr.to_string()));
            }
        }
        let mut call = vec![addr.to_string()];
        call.extend_from_slice(args);
        self.bus.lock().commands.push((cmd.to_string(), call));
        Ok(Reply::Okay)
    }

    async fn quit(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn disconnect(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

struct MockControl {
    bus: MockBus,
    index: usize,
}

impl MockControl {
    fn update(&self, channels: &[String], add: bool) {
        let mut state = self.bus.lock();
        if let Some(entry) = state.subscribers.get_mut(self.index) {
            for channel in channels {
                if add {
                    entry.channels.insert(channel.clone());
                } else {
                    entry.channels.remove(channel);
                }
            }
        }
    }
}

#[async_trait]
impl SubscriberControl for MockControl {
    async fn subscribe(&self, channels: &[String]) -> Result<()> {
        self.update(channels, true);
        Ok(())
    }

    async fn unsubscribe(&self, channels: &[String]) -> Result<()> {
        self.update(channels, false);
        Ok(())
    }

    async fn psubscribe(&self, patterns: &[String]) -> Result<()> {
        self.update(patterns, true);
        Ok(())
    }

    async fn punsubscribe(&self, patterns: &[String]) -> Result<()> {
        self.update(patterns, false);
        Ok(())
    }
}

/// Transport double producing handles wired to one [`MockBus`]
pub struct MockTransport {
    bus: MockBus,
    reachable: bool,
}

impl MockTransport {
    pub fn new(bus: MockBus) -> Self {
        Self {
            bus,
            reachable: true,
        }
    }

    /// A transport whose connections never come up
    pub fn unreachable() -> Self {
        Self {
            bus: MockBus::new(),
            reachable: false,
        }
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn open(&self, name: &str, _read_only: bool) -> Result<Arc<dyn CommandHandle>> {
        if !self.reachable {
            futures::future::pending::<()>().await;
        }
        self.bus.lock().opened_clients.push(name.to_string());
        Ok(self.bus.handle())
    }

    async fn open_subscriber(&self) -> Result<SubscriberHandle> {
        if !self.reachable {
            futures::future::pending::<()>().await;
        }
        let (tx, messages) = mpsc::unbounded_channel();
        let index = {
            let mut state = self.bus.lock();
            state.subscribers.push(SubscriberEntry {
                channels: HashSet::new(),
                tx,
            });
            state.subscribers.len() - 1
        };
        Ok(SubscriberHandle {
            control: Arc::new(MockControl {
                bus: self.bus.clone(),
                index,
            }),
            messages,
        })
    }
}
