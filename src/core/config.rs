//! Configuration for the root instance and its connections

use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;

/// A cluster node address
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostPort {
    /// Host name or IP
    pub host: String,
    /// TCP port
    pub port: u16,
}

impl HostPort {
    /// Create a new host/port pair
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Render as `host:port`
    #[must_use]
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// How read traffic is routed in cluster mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ScaleReads {
    /// Reads may go to any node, master or replica
    All,
    /// Reads always go to master nodes
    #[default]
    Master,
}

/// Log verbosity configuration
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Log level for this crate's `tracing` output
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "warn".to_string(),
        }
    }
}

impl LogConfig {
    /// An `EnvFilter`-compatible directive scoping the level to this crate,
    /// for embedders installing a `tracing` subscriber.
    #[must_use]
    pub fn env_filter_directive(&self) -> String {
        format!("redikit={}", self.level)
    }
}

/// Configuration for a [`Redikit`](crate::Redikit) instance
#[derive(Debug, Clone)]
pub struct Config {
    /// How long the default client may take to report ready before boot fails
    pub connection_timeout: Duration,

    /// Host for standalone connections
    pub host: String,

    /// Port for standalone connections
    pub port: u16,

    /// Database number (standalone only)
    pub db: u8,

    /// Optional password for authentication
    pub password: Option<String>,

    /// Cluster node addresses. A non-empty list switches the instance into
    /// cluster mode; there is no independent cluster flag.
    pub hosts: Vec<HostPort>,

    /// Read scaling mode for cluster connections
    pub scale_reads: ScaleReads,

    /// Create a dedicated read-only connection in cluster mode
    pub cluster_scale_reads: bool,

    /// Prefix applied to all keys
    pub key_prefix: String,

    /// Prefix applied to all pub/sub channel names
    pub event_prefix: String,

    /// Create a dedicated publisher connection
    pub publisher: bool,

    /// Create a dedicated subscriber connection. Subscribing takes over a
    /// connection, so the subscriber is always separate when enabled.
    pub subscriber: bool,

    /// Log transport errors instead of emitting them as events
    pub log_redis_errors: bool,

    /// Log verbosity
    pub log: LogConfig,

    /// Window each hook is granted to resolve its `initialize`
    pub hook_timeout: Duration,

    /// How long a cached timestamp from the shared clock stays fresh
    pub clock_cache_window: Duration,

    /// User configuration per hook, keyed by hook name. `false` disables a
    /// hook; an object is deep-merged over the hook's declared defaults.
    pub hook_options: HashMap<String, Value>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            connection_timeout: Duration::from_millis(6000),
            host: "127.0.0.1".to_string(),
            port: 6379,
            db: 0,
            password: None,
            hosts: Vec::new(),
            scale_reads: ScaleReads::default(),
            cluster_scale_reads: true,
            key_prefix: "rdb:".to_string(),
            event_prefix: "rdb".to_string(),
            publisher: true,
            subscriber: true,
            log_redis_errors: false,
            log: LogConfig::default(),
            hook_timeout: Duration::from_secs(10),
            clock_cache_window: Duration::from_millis(50),
            hook_options: HashMap::new(),
        }
    }
}

impl Config {
    /// Create a configuration for a standalone server
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Default::default()
        }
    }

    /// Create a configuration for a cluster, from its node addresses
    #[must_use]
    pub fn cluster(hosts: Vec<HostPort>) -> Self {
        Self {
            hosts,
            ..Default::default()
        }
    }

    /// True iff a non-empty cluster host list was supplied
    #[must_use]
    pub fn is_cluster(&self) -> bool {
        !self.hosts.is_empty()
    }

    /// Set the connection timeout
    #[must_use]
    pub const fn with_connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = timeout;
        self
    }

    /// Set the database number
    #[must_use]
    pub const fn with_db(mut self, db: u8) -> Self {
        self.db = db;
        self
    }

    /// Set the password for authentication
    #[must_use]
    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    /// Set the read scaling mode
    #[must_use]
    pub const fn with_scale_reads(mut self, mode: ScaleReads) -> Self {
        self.scale_reads = mode;
        self
    }

    /// Toggle the dedicated read-only cluster connection
    #[must_use]
    pub const fn with_cluster_scale_reads(mut self, enabled: bool) -> Self {
        self.cluster_scale_reads = enabled;
        self
    }

    /// Set the key prefix
    #[must_use]
    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    /// Set the pub/sub channel prefix
    #[must_use]
    pub fn with_event_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.event_prefix = prefix.into();
        self
    }

    /// Toggle the dedicated publisher connection
    #[must_use]
    pub const fn with_publisher(mut self, enabled: bool) -> Self {
        self.publisher = enabled;
        self
    }

    /// Toggle the subscriber connection
    #[must_use]
    pub const fn with_subscriber(mut self, enabled: bool) -> Self {
        self.subscriber = enabled;
        self
    }

    /// Route transport errors to the log instead of the event stream
    #[must_use]
    pub const fn with_log_redis_errors(mut self, enabled: bool) -> Self {
        self.log_redis_errors = enabled;
        self
    }

    /// Set the per-hook initialization window
    #[must_use]
    pub const fn with_hook_timeout(mut self, timeout: Duration) -> Self {
        self.hook_timeout = timeout;
        self
    }

    /// Supply user configuration for a hook, looked up by hook name
    #[must_use]
    pub fn with_hook_options(mut self, name: impl Into<String>, options: Value) -> Self {
        self.hook_options.insert(name.into(), options);
        self
    }

    /// Disable a hook (built-in or user-supplied) by name
    #[must_use]
    pub fn with_hook_disabled(mut self, name: impl Into<String>) -> Self {
        self.hook_options.insert(name.into(), Value::Bool(false));
        self
    }

    /// User configuration section for a hook, if present
    #[must_use]
    pub fn hook_options(&self, name: &str) -> Option<&Value> {
        self.hook_options.get(name)
    }
}

/// Deep-merge `user` over `defaults`. Nested maps merge recursively, user
/// values win, and arrays replace rather than merge.
#[must_use]
pub fn merge_options(defaults: Value, user: &Value) -> Value {
    match (defaults, user) {
        (Value::Object(mut base), Value::Object(overrides)) => {
            for (key, value) in overrides {
                let merged = match base.remove(key) {
                    Some(existing) => merge_options(existing, value),
                    None => value.clone(),
                };
                base.insert(key.clone(), merged);
            }
            Value::Object(base)
        }
        (_, user) => user.clone(),
    }
}
