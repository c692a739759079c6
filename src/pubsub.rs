//! Channel-prefixed pub/sub with once-only and first-of-N semantics
//!
//! Channels are namespaced with the configured event prefix before they hit
//! Redis and stripped again on the way back, so callers only ever see their
//! own names. Beyond plain fan-out subscriptions the engine offers
//! [`PubSub::subscribe_once`] and [`PubSub::subscribe_once_of`], both with
//! optional timeout cancellation: exactly one of message or timeout wins,
//! and the loser is fully neutralized before any listener runs.

use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error};

use crate::clock::Clock;
use crate::core::error::{Error, Result};
use crate::transport::{CommandHandle, RawMessage, SubscriberControl, SubscriberHandle};

/// Extra window added to the first-of-N timeout to cover subscribe latency,
/// since that timer starts before the subscribe call is acknowledged
const SUBSCRIBE_GRACE: Duration = Duration::from_millis(50);

/// A listener callback invoked with every matching message
pub type Listener = Arc<dyn Fn(Message) + Send + Sync>;

/// Sink for errors that are reported rather than returned, such as publish
/// payloads that fail to serialize
pub type ErrorSink = Arc<dyn Fn(Error) + Send + Sync>;

/// Identifier for one `subscribe` call, usable for targeted unsubscribe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// A decoded pub/sub message as delivered to listeners
#[derive(Debug, Clone, Serialize)]
pub struct Message {
    /// Channel the message arrived on, with the event prefix stripped.
    /// Empty for a group timeout, which is not attributable to one channel.
    pub channel: String,
    /// Decoded payload. JSON when the payload parses, otherwise the raw
    /// string. Null for timeout markers.
    pub data: Value,
    /// The matched pattern for pattern subscriptions, prefix stripped
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
    /// Receipt timestamp in unix milliseconds
    pub timestamp: u64,
    /// True when this is a synthetic timeout marker, not a real message
    pub timeout: bool,
    /// The timeout window in milliseconds, set on timeout markers only
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_period: Option<u64>,
}

impl Message {
    fn timeout_marker(channel: String, timestamp: u64, timeout_period: u64) -> Self {
        Self {
            channel,
            data: Value::Null,
            pattern: None,
            timestamp,
            timeout: true,
            timeout_period: Some(timeout_period),
        }
    }
}

/// One channel or several, accepted anywhere the engine takes channels
#[derive(Debug, Clone)]
pub enum Channels {
    /// A single channel name
    One(String),
    /// Several channel names
    Many(Vec<String>),
}

impl Channels {
    fn into_vec(self) -> Vec<String> {
        match self {
            Self::One(c) => vec![c],
            Self::Many(cs) => cs,
        }
    }
}

impl From<&str> for Channels {
    fn from(c: &str) -> Self {
        Self::One(c.to_string())
    }
}

impl From<String> for Channels {
    fn from(c: String) -> Self {
        Self::One(c)
    }
}

impl From<Vec<String>> for Channels {
    fn from(cs: Vec<String>) -> Self {
        Self::Many(cs)
    }
}

impl From<&[&str]> for Channels {
    fn from(cs: &[&str]) -> Self {
        Self::Many(cs.iter().map(|c| (*c).to_string()).collect())
    }
}

impl<const N: usize> From<[&str; N]> for Channels {
    fn from(cs: [&str; N]) -> Self {
        Self::Many(cs.iter().map(|c| (*c).to_string()).collect())
    }
}

enum Sink {
    Fanout(Listener),
    Once(Arc<OnceSlot>),
}

struct Entry {
    id: u64,
    sink: Sink,
}

/// Single-shot delivery slot shared between the router and a supervising
/// task. Whoever takes the sender first wins; later fires are no-ops.
struct OnceSlot {
    tx: Mutex<Option<oneshot::Sender<Message>>>,
}

impl OnceSlot {
    fn new(tx: oneshot::Sender<Message>) -> Self {
        Self {
            tx: Mutex::new(Some(tx)),
        }
    }

    fn fire(&self, msg: Message) {
        let tx = self.tx.lock().unwrap_or_else(std::sync::PoisonError::into_inner).take();
        if let Some(tx) = tx {
            let _ = tx.send(msg);
        }
    }
}

/// Local routing table keyed by unprefixed channel name
#[derive(Default)]
struct Router {
    entries: Mutex<HashMap<String, Vec<Entry>>>,
}

impl Router {
    fn add(&self, channel: &str, entry: Entry) {
        self.entries
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .entry(channel.to_string())
            .or_default()
            .push(entry);
    }

    fn remove(&self, channel: &str, id: u64) {
        let mut entries = self
            .entries
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(list) = entries.get_mut(channel) {
            list.retain(|e| e.id != id);
            if list.is_empty() {
                entries.remove(channel);
            }
        }
    }

    fn remove_channel(&self, channel: &str) {
        self.entries
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(channel);
    }

    fn has_listeners(&self, channel: &str) -> bool {
        self.entries
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .contains_key(channel)
    }

    /// Deliver one message under the given key. One-shot entries are taken
    /// out of the table before firing so a second message cannot reach
    /// them; fan-out listeners run outside the lock.
    fn dispatch(&self, key: &str, msg: &Message) {
        let mut fanouts = Vec::new();
        let mut slots = Vec::new();
        {
            let mut entries = self
                .entries
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            if let Some(list) = entries.get_mut(key) {
                list.retain(|entry| match &entry.sink {
                    Sink::Fanout(listener) => {
                        fanouts.push(Arc::clone(listener));
                        true
                    }
                    Sink::Once(slot) => {
                        slots.push(Arc::clone(slot));
                        false
                    }
                });
                if list.is_empty() {
                    entries.remove(key);
                }
            }
        }
        for slot in slots {
            slot.fire(msg.clone());
        }
        for listener in fanouts {
            listener(msg.clone());
        }
    }
}

enum OnceOutcome {
    Message(Message),
    Timeout,
    Aborted,
}

/// The pub/sub engine, built on one publisher client and one dedicated
/// subscriber connection
pub struct PubSub {
    this: Weak<Self>,
    prefix: String,
    publisher: Arc<dyn CommandHandle>,
    control: Option<Arc<dyn SubscriberControl>>,
    router: Router,
    clock: Arc<dyn Clock>,
    errors: ErrorSink,
    next_id: AtomicU64,
}

impl PubSub {
    /// Build the engine and start its dispatch task. `subscriber` is `None`
    /// when the subscriber connection is disabled by configuration, in
    /// which case all subscribe operations fail.
    pub fn new(
        prefix: impl Into<String>,
        publisher: Arc<dyn CommandHandle>,
        subscriber: Option<SubscriberHandle>,
        clock: Arc<dyn Clock>,
        errors: ErrorSink,
    ) -> Arc<Self> {
        let (control, messages) = match subscriber {
            Some(handle) => (Some(handle.control), Some(handle.messages)),
            None => (None, None),
        };
        let prefix = prefix.into();
        let engine = Arc::new_cyclic(|this| Self {
            this: this.clone(),
            prefix,
            publisher,
            control,
            router: Router::default(),
            clock,
            errors,
            next_id: AtomicU64::new(1),
        });
        if let Some(messages) = messages {
            tokio::spawn(Arc::clone(&engine).run_dispatch(messages));
        }
        engine
    }

    fn control(&self) -> Result<Arc<dyn SubscriberControl>> {
        self.control
            .as_ref()
            .map(Arc::clone)
            .ok_or(Error::SubscriberDisabled)
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// The prefixed name a channel uses on the wire
    #[must_use]
    pub fn prefix_channel(&self, channel: &str) -> String {
        if self.prefix.is_empty() {
            channel.to_string()
        } else {
            format!("{}:{}", self.prefix, channel)
        }
    }

    fn strip_prefix<'a>(&self, channel: &'a str) -> &'a str {
        if self.prefix.is_empty() {
            return channel;
        }
        channel
            .strip_prefix(&self.prefix)
            .and_then(|rest| rest.strip_prefix(':'))
            .unwrap_or(channel)
    }

    /// Decode incoming frames and fan them out to the router. Runs until
    /// the subscriber connection closes.
    async fn run_dispatch(self: Arc<Self>, mut messages: mpsc::UnboundedReceiver<RawMessage>) {
        while let Some(raw) = messages.recv().await {
            let channel = self.strip_prefix(&raw.channel).to_string();
            let data = serde_json::from_str(&raw.payload)
                .unwrap_or_else(|_| Value::String(raw.payload.clone()));
            let msg = Message {
                channel: channel.clone(),
                data,
                pattern: raw
                    .pattern
                    .as_deref()
                    .map(|p| self.strip_prefix(p).to_string()),
                timestamp: self.clock.now_ms(),
                timeout: false,
                timeout_period: None,
            };
            self.router.dispatch(&channel, &msg);
            if let Some(pattern) = msg.pattern.clone() {
                if pattern != channel {
                    self.router.dispatch(&pattern, &msg);
                }
            }
        }
        debug!("pub/sub dispatch loop ended, subscriber connection closed");
    }

    /// Register a fan-out listener on the given channels. Every message on
    /// any of them invokes the listener; multiple listeners per channel all
    /// receive every message.
    pub async fn subscribe(
        &self,
        channels: impl Into<Channels>,
        listener: Listener,
    ) -> Result<ListenerId> {
        let control = self.control()?;
        let channels = channels.into().into_vec();
        let id = self.next_id();
        for channel in &channels {
            self.router.add(
                channel,
                Entry {
                    id,
                    sink: Sink::Fanout(Arc::clone(&listener)),
                },
            );
        }
        let prefixed: Vec<String> = channels.iter().map(|c| self.prefix_channel(c)).collect();
        if let Err(e) = control.subscribe(&prefixed).await {
            for channel in &channels {
                self.router.remove(channel, id);
            }
            return Err(e);
        }
        Ok(ListenerId(id))
    }

    /// Subscribe each channel for exactly one delivery. Per channel, either
    /// the first message invokes the listener once, or the timeout (when
    /// given) fires once with a synthetic marker carrying `timeout: true`
    /// and the window in milliseconds. Whichever happens first wins and the
    /// other branch is cancelled. The timer starts while the subscribe
    /// acknowledgment is still in flight.
    pub async fn subscribe_once(
        &self,
        channels: impl Into<Channels>,
        listener: Listener,
        timeout: Option<Duration>,
    ) -> Result<()> {
        let control = self.control()?;
        let this = self.this.upgrade().ok_or(Error::Closed)?;
        let channels = channels.into().into_vec();
        let mut registered = Vec::with_capacity(channels.len());
        for channel in &channels {
            let (tx, rx) = oneshot::channel();
            let id = self.next_id();
            self.router.add(
                channel,
                Entry {
                    id,
                    sink: Sink::Once(Arc::new(OnceSlot::new(tx))),
                },
            );
            registered.push((channel.clone(), id));
            tokio::spawn(Arc::clone(&this).supervise_once(
                channel.clone(),
                id,
                rx,
                timeout,
                Arc::clone(&listener),
            ));
        }
        let prefixed: Vec<String> = channels.iter().map(|c| self.prefix_channel(c)).collect();
        if let Err(e) = control.subscribe(&prefixed).await {
            // Dropping the slots ends the supervising tasks silently.
            for (channel, id) in &registered {
                self.router.remove(channel, *id);
            }
            return Err(e);
        }
        Ok(())
    }

    /// Subscribe a group of channels for a single shared delivery: the
    /// first message on any channel invokes the listener exactly once, then
    /// the whole group is unsubscribed. The timeout covers the group as a
    /// whole; its marker carries an empty channel name since no single
    /// channel timed out. A small grace is added to the timer because it
    /// runs concurrently with subscription setup.
    pub async fn subscribe_once_of(
        &self,
        channels: impl Into<Channels>,
        listener: Listener,
        timeout: Option<Duration>,
    ) -> Result<()> {
        let control = self.control()?;
        let this = self.this.upgrade().ok_or(Error::Closed)?;
        let channels = channels.into().into_vec();
        let (tx, rx) = oneshot::channel();
        let slot = Arc::new(OnceSlot::new(tx));
        let mut registered = Vec::with_capacity(channels.len());
        for channel in &channels {
            let id = self.next_id();
            self.router.add(
                channel,
                Entry {
                    id,
                    sink: Sink::Once(Arc::clone(&slot)),
                },
            );
            registered.push((channel.clone(), id));
        }
        drop(slot);
        tokio::spawn(this.supervise_once_of(
            registered.clone(),
            rx,
            timeout,
            listener,
        ));
        let prefixed: Vec<String> = channels.iter().map(|c| self.prefix_channel(c)).collect();
        if let Err(e) = control.subscribe(&prefixed).await {
            for (channel, id) in &registered {
                self.router.remove(channel, *id);
            }
            return Err(e);
        }
        Ok(())
    }

    async fn supervise_once(
        self: Arc<Self>,
        channel: String,
        id: u64,
        rx: oneshot::Receiver<Message>,
        timeout: Option<Duration>,
        listener: Listener,
    ) {
        let outcome = match timeout {
            // Biased with the message arm first, so a message already in
            // hand is never lost to a timer expiring at the same instant.
            Some(window) => tokio::select! {
                biased;
                res = rx => match res {
                    Ok(msg) => OnceOutcome::Message(msg),
                    Err(_) => OnceOutcome::Aborted,
                },
                () = tokio::time::sleep(window) => OnceOutcome::Timeout,
            },
            None => match rx.await {
                Ok(msg) => OnceOutcome::Message(msg),
                Err(_) => OnceOutcome::Aborted,
            },
        };
        match outcome {
            OnceOutcome::Aborted => {}
            OnceOutcome::Message(msg) => {
                self.release_channel(&channel).await;
                listener(msg);
            }
            OnceOutcome::Timeout => {
                self.router.remove(&channel, id);
                self.release_channel(&channel).await;
                let period = timeout.map_or(0, |t| t.as_millis() as u64);
                listener(Message::timeout_marker(channel, self.clock.now_ms(), period));
            }
        }
    }

    async fn supervise_once_of(
        self: Arc<Self>,
        registered: Vec<(String, u64)>,
        rx: oneshot::Receiver<Message>,
        timeout: Option<Duration>,
        listener: Listener,
    ) {
        let outcome = match timeout {
            Some(window) => tokio::select! {
                biased;
                res = rx => match res {
                    Ok(msg) => OnceOutcome::Message(msg),
                    Err(_) => OnceOutcome::Aborted,
                },
                () = tokio::time::sleep(window + SUBSCRIBE_GRACE) => OnceOutcome::Timeout,
            },
            None => match rx.await {
                Ok(msg) => OnceOutcome::Message(msg),
                Err(_) => OnceOutcome::Aborted,
            },
        };
        if matches!(outcome, OnceOutcome::Aborted) {
            return;
        }
        for (channel, id) in &registered {
            self.router.remove(channel, *id);
        }
        for (channel, _) in &registered {
            self.release_channel(channel).await;
        }
        match outcome {
            OnceOutcome::Message(msg) => listener(msg),
            OnceOutcome::Timeout => {
                let period = timeout.map_or(0, |t| t.as_millis() as u64);
                listener(Message::timeout_marker(
                    String::new(),
                    self.clock.now_ms(),
                    period,
                ));
            }
            OnceOutcome::Aborted => unreachable!(),
        }
    }

    /// Drop the Redis-side subscription for a channel if no local listeners
    /// remain on it. Failures are reported, not returned, since this runs
    /// after the caller's outcome is already decided.
    async fn release_channel(&self, channel: &str) {
        if self.router.has_listeners(channel) {
            return;
        }
        let Ok(control) = self.control() else { return };
        if let Err(e) = control.unsubscribe(&[self.prefix_channel(channel)]).await {
            (self.errors)(e);
        }
    }

    /// Publish a message to every given channel. Non-string values are
    /// JSON-encoded; encoding failures are reported through the error sink
    /// rather than returned.
    pub async fn publish<T: Serialize + ?Sized>(
        &self,
        channels: impl Into<Channels>,
        message: &T,
    ) -> Result<()> {
        let payload = match serde_json::to_value(message) {
            Ok(Value::String(s)) => s,
            Ok(v) => v.to_string(),
            Err(e) => {
                error!(error = %e, "failed to serialize pub/sub message");
                (self.errors)(Error::Serialization(e));
                return Ok(());
            }
        };
        for channel in channels.into().into_vec() {
            self.publisher
                .command("PUBLISH", &[self.prefix_channel(&channel), payload.clone()])
                .await?;
        }
        Ok(())
    }

    /// Remove listeners and drop the Redis-side subscriptions. With a
    /// listener id only that subscription's entries are removed, otherwise
    /// every local listener on the channels goes. The Redis-side
    /// unsubscribe is issued regardless of remaining local listeners.
    pub async fn unsubscribe(
        &self,
        channels: impl Into<Channels>,
        listener: Option<ListenerId>,
    ) -> Result<()> {
        let control = self.control()?;
        let channels = channels.into().into_vec();
        for channel in &channels {
            match listener {
                Some(ListenerId(id)) => self.router.remove(channel, id),
                None => self.router.remove_channel(channel),
            }
        }
        let prefixed: Vec<String> = channels.iter().map(|c| self.prefix_channel(c)).collect();
        control.unsubscribe(&prefixed).await
    }

    /// Subscribe to raw patterns (`PSUBSCRIBE`). Listeners are keyed by the
    /// pattern itself and also receive matches under the concrete channel.
    pub async fn psubscribe(
        &self,
        patterns: impl Into<Channels>,
        listener: Listener,
    ) -> Result<ListenerId> {
        let control = self.control()?;
        let patterns = patterns.into().into_vec();
        let id = self.next_id();
        for pattern in &patterns {
            self.router.add(
                pattern,
                Entry {
                    id,
                    sink: Sink::Fanout(Arc::clone(&listener)),
                },
            );
        }
        let prefixed: Vec<String> = patterns.iter().map(|p| self.prefix_channel(p)).collect();
        if let Err(e) = control.psubscribe(&prefixed).await {
            for pattern in &patterns {
                self.router.remove(pattern, id);
            }
            return Err(e);
        }
        Ok(ListenerId(id))
    }

    /// Remove pattern listeners and drop the Redis-side pattern
    /// subscriptions
    pub async fn punsubscribe(
        &self,
        patterns: impl Into<Channels>,
        listener: Option<ListenerId>,
    ) -> Result<()> {
        let control = self.control()?;
        let patterns = patterns.into().into_vec();
        for pattern in &patterns {
            match listener {
                Some(ListenerId(id)) => self.router.remove(pattern, id),
                None => self.router.remove_channel(pattern),
            }
        }
        let prefixed: Vec<String> = patterns.iter().map(|p| self.prefix_channel(p)).collect();
        control.punsubscribe(&prefixed).await
    }
}
