//! Script-backed atomic command registration
//!
//! The registry holds named Lua scripts and loads them onto clients exactly
//! once per client. Invocation goes through `EVALSHA` with a plain `EVAL`
//! fallback when the server has not cached the script.

use sha1::{Digest, Sha1};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::core::error::Result;
use crate::transport::{CommandHandle, Reply};

/// A named Lua script definition, as declared by hooks or callers.
///
/// The key count and body are optional to mirror the loosely-shaped script
/// maps hooks can supply; definitions missing either field are skipped with
/// a warning rather than rejected hard.
#[derive(Debug, Clone)]
pub struct ScriptDefinition {
    /// Command name, matched case-insensitively
    pub name: String,
    /// How many of the arguments are key names
    pub key_count: Option<usize>,
    /// Lua source
    pub body: Option<String>,
    /// Whether the command is safe to define on the read-only client too
    pub read_only: bool,
}

impl ScriptDefinition {
    /// Create a complete script definition
    pub fn new(name: impl Into<String>, key_count: usize, body: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            key_count: Some(key_count),
            body: Some(body.into()),
            read_only: false,
        }
    }

    /// Mark the command as eligible for the read-only client
    #[must_use]
    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }
}

#[derive(Debug, Clone)]
struct Registered {
    key_count: usize,
    body: String,
    sha: String,
    read_only: bool,
}

/// Registry of script-backed commands with per-client tracking of which
/// scripts have already been defined
#[derive(Debug, Default)]
pub struct ScriptRegistry {
    scripts: RwLock<HashMap<String, Registered>>,
    applied: RwLock<HashMap<String, HashSet<String>>>,
}

impl ScriptRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The built-in scripts every instance registers at boot
    #[must_use]
    pub fn builtin() -> Vec<ScriptDefinition> {
        vec![
            ScriptDefinition::new(
                "setnxex",
                1,
                r"
                --[[
                  key 1 -> key name
                  arg 1 -> expires in seconds
                  arg 2 -> key value
                ]]
                if redis.call('exists',KEYS[1]) > 0 then
                  return 0
                else
                  redis.call('setex',KEYS[1],tonumber(ARGV[1]),ARGV[2])
                  return 1
                end
                ",
            ),
            ScriptDefinition::new(
                "psetnxex",
                1,
                r"
                --[[
                  key 1 -> key name
                  arg 1 -> expires in milliseconds
                  arg 2 -> key value
                ]]
                if redis.call('exists',KEYS[1]) > 0 then
                  return 0
                else
                  redis.call('psetex',KEYS[1],tonumber(ARGV[1]),ARGV[2])
                  return 1
                end
                ",
            ),
            // Capped list, useful for capped logs
            ScriptDefinition::new(
                "lcap",
                1,
                r#"
                local k = KEYS[1]
                local element = ARGV[1]
                local limit = tonumber(ARGV[2])
                redis.call("LPUSH",k,element)
                redis.call("LTRIM", k, 0, limit -1)
                "#,
            ),
        ]
    }

    /// Register a script definition. Returns `false` (after a warning) when
    /// the definition is missing its key count or script body, or when a
    /// script with the same name is already registered.
    pub async fn register(&self, def: ScriptDefinition) -> bool {
        let name = def.name.to_lowercase();

        let Some(key_count) = def.key_count else {
            warn!(script = %name, "script is missing required key count, skipped");
            return false;
        };
        let Some(body) = def.body.filter(|b| !b.trim().is_empty()) else {
            warn!(script = %name, "script is missing required script body, skipped");
            return false;
        };

        let mut scripts = self.scripts.write().await;
        if scripts.contains_key(&name) {
            return false;
        }
        let sha = script_sha(&body);
        scripts.insert(
            name,
            Registered {
                key_count,
                body,
                sha,
                read_only: def.read_only,
            },
        );
        true
    }

    /// Register several definitions, skipping invalid ones individually
    pub async fn register_all(&self, defs: Vec<ScriptDefinition>) {
        for def in defs {
            self.register(def).await;
        }
    }

    /// Load every registered script onto the named client, skipping scripts
    /// the client already has. Called whenever a client of a relevant role
    /// (default or read-only) becomes ready. On a read-only client only
    /// commands marked read-only eligible are defined.
    pub async fn apply(
        &self,
        client_name: &str,
        handle: &Arc<dyn CommandHandle>,
        read_only_client: bool,
    ) -> Result<()> {
        let scripts = self.scripts.read().await;
        for (name, registered) in scripts.iter() {
            if read_only_client && !registered.read_only {
                continue;
            }
            {
                let applied = self.applied.read().await;
                if applied
                    .get(client_name)
                    .is_some_and(|set| set.contains(name))
                {
                    continue;
                }
            }
            debug!(script = %name, client = client_name, "defining script-backed command");
            handle
                .command(
                    "SCRIPT",
                    &["LOAD".to_string(), registered.body.clone()],
                )
                .await?;
            self.applied
                .write()
                .await
                .entry(client_name.to_string())
                .or_default()
                .insert(name.clone());
        }
        Ok(())
    }

    /// Drop the applied-script bookkeeping for a client. Called when a
    /// named connection is replaced, since the replacement starts with
    /// nothing defined on it.
    pub async fn forget_client(&self, client_name: &str) {
        self.applied.write().await.remove(client_name);
    }

    /// Whether the named client already has the given command defined
    pub async fn is_applied(&self, client_name: &str, script: &str) -> bool {
        let script = script.to_lowercase();
        self.applied
            .read()
            .await
            .get(client_name)
            .is_some_and(|set| set.contains(&script))
    }

    /// Whether a command of this name is registered
    pub async fn contains(&self, name: &str) -> bool {
        self.scripts.read().await.contains_key(&name.to_lowercase())
    }

    /// Number of registered scripts
    pub async fn len(&self) -> usize {
        self.scripts.read().await.len()
    }

    /// Whether the registry holds no scripts
    pub async fn is_empty(&self) -> bool {
        self.scripts.read().await.is_empty()
    }

    /// Invoke a registered script on the given client. Tries `EVALSHA`
    /// first and falls back to `EVAL` when the server has not cached it.
    pub async fn invoke(
        &self,
        handle: &Arc<dyn CommandHandle>,
        name: &str,
        keys: &[String],
        args: &[String],
    ) -> Result<Reply> {
        let name = name.to_lowercase();
        let registered = {
            let scripts = self.scripts.read().await;
            scripts
                .get(&name)
                .cloned()
                .ok_or_else(|| crate::core::error::Error::UnknownCommand(name.clone()))?
        };

        let mut call = vec![registered.sha.clone(), registered.key_count.to_string()];
        call.extend_from_slice(keys);
        call.extend_from_slice(args);

        match handle.command("EVALSHA", &call).await {
            Ok(reply) => Ok(reply),
            Err(e) if e.is_noscript() => {
                let mut call = vec![registered.body.clone(), registered.key_count.to_string()];
                call.extend_from_slice(keys);
                call.extend_from_slice(args);
                handle.command("EVAL", &call).await
            }
            Err(e) => Err(e),
        }
    }
}

/// SHA1 hash of a script body, as Redis computes it for `EVALSHA`
#[must_use]
pub fn script_sha(body: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(body.as_bytes());
    hex::encode(hasher.finalize())
}
