//! Error types for redikit operations

use std::time::Duration;
use thiserror::Error;

/// Result type for redikit operations
pub type Result<T> = std::result::Result<T, Error>;

/// Comprehensive error type covering connection supervision, pub/sub and
/// the hook lifecycle
#[derive(Error, Debug)]
pub enum Error {
    /// The default client did not report ready within the configured window
    #[error("failed to connect to redis within {0:?}, check your config / servers")]
    ConnectionTimeout(Duration),

    /// Transport-level error from an established connection
    #[error("redis client error: {0}")]
    Client(String),

    /// Error bubbled up from the underlying redis-rs client
    #[error(transparent)]
    Redis(#[from] redis::RedisError),

    /// A cluster-only operation was invoked on a standalone connection
    #[error("not a cluster connection")]
    NotCluster,

    /// A cluster operation found no master nodes to target
    #[error("no master nodes found")]
    NoMasterNodes,

    /// A candidate hook failed validation (non-fatal, the hook is skipped)
    #[error("hook '{hook}' failed validation: {reason}")]
    HookValidation {
        /// Name of the offending hook
        hook: String,
        /// Why the hook was rejected
        reason: String,
    },

    /// A hook did not resolve its `initialize` within the allowed window
    #[error("hook '{hook}' timed out while initializing ({window:?})")]
    HookTimeout {
        /// Name of the offending hook
        hook: String,
        /// The configured initialization window
        window: Duration,
    },

    /// A hook returned an error from `initialize` (fatal to startup)
    #[error("hook '{hook}' failed to initialize: {source}")]
    HookInitialization {
        /// Name of the offending hook
        hook: String,
        /// The underlying initialization error
        #[source]
        source: Box<Error>,
    },

    /// A pub/sub message could not be JSON-encoded for publishing
    #[error("failed to serialize pub/sub message: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A subscribe operation was attempted with the subscriber client disabled
    #[error("pub/sub 'subscriber' config is set to disabled")]
    SubscriberDisabled,

    /// A built-in was requested that is not mounted on this instance
    #[error("'{0}' is not mounted on this instance")]
    NotMounted(String),

    /// Invalid configuration
    #[error("invalid configuration: {0}")]
    Config(String),

    /// A named client was requested but does not exist
    #[error("no client named '{0}'")]
    UnknownClient(String),

    /// A script-backed command was invoked without being registered first
    #[error("no script-backed command named '{0}'")]
    UnknownCommand(String),

    /// The instance has been shut down
    #[error("instance is shut down")]
    Closed,
}

impl Error {
    /// True when this error is a missing-script response from the server,
    /// meaning an `EVALSHA` should be retried as a plain `EVAL`.
    #[must_use]
    pub fn is_noscript(&self) -> bool {
        match self {
            Self::Redis(e) => e.kind() == redis::ErrorKind::NoScriptError,
            Self::Client(msg) => msg.contains("NOSCRIPT"),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn noscript_detection() {
        let err = Error::Client("NOSCRIPT No matching script".to_string());
        assert!(err.is_noscript());

        let err = Error::Client("ERR wrong number of arguments".to_string());
        assert!(!err.is_noscript());

        assert!(!Error::NotCluster.is_noscript());
    }

    #[test]
    fn noscript_detection_uses_the_redis_error_kind() {
        let err = Error::Redis(redis::RedisError::from((
            redis::ErrorKind::NoScriptError,
            "No matching script",
        )));
        assert!(err.is_noscript());

        let err = Error::Redis(redis::RedisError::from((
            redis::ErrorKind::TypeError,
            "Response was of incompatible type",
        )));
        assert!(!err.is_noscript());
    }

    #[test]
    fn hook_errors_carry_context() {
        let err = Error::HookTimeout {
            hook: "queue".to_string(),
            window: Duration::from_secs(10),
        };
        let text = err.to_string();
        assert!(text.contains("queue"));
        assert!(text.contains("10s"));
    }
}
