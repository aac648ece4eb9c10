use std::time::Duration;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::{Client, RedisError, Script};

use crate::store::{LockScript, LockStore};
use crate::LockError;

/// Redis-backed lock store.
///
/// Uses atomic SET NX PX for plain acquisition and Lua scripts for
/// token-verified acquire/refresh/release, so only the lease holder can
/// modify its key.
#[derive(Clone)]
pub struct RedisLockStore {
    conn: MultiplexedConnection,
    key_prefix: String,
}

impl RedisLockStore {
    /// Create a new RedisLockStore from a Redis URL.
    ///
    /// # Arguments
    /// * `url` - Redis connection URL (e.g., "redis://127.0.0.1:6379")
    pub async fn new(url: &str) -> Result<Self, LockError> {
        let client = Client::open(url).map_err(map_redis_error)?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(map_redis_error)?;
        Ok(Self::from_connection(conn))
    }

    /// Create a new RedisLockStore from an existing multiplexed connection.
    pub fn from_connection(conn: MultiplexedConnection) -> Self {
        Self {
            conn,
            key_prefix: "lock".to_string(),
        }
    }

    /// Set a custom key prefix for lock keys.
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    fn lock_key(&self, key: &str) -> String {
        format_lock_key(&self.key_prefix, key)
    }
}

/// Sets the key only when absent. An existing key is left untouched, whoever owns it.
const ACQUIRE_SCRIPT: &str = r#"
if redis.call("set", KEYS[1], ARGV[1], "NX", "PX", ARGV[2]) then
    return 1
else
    return 0
end
"#;

/// Only extends the TTL if the stored value matches the token.
const REFRESH_SCRIPT: &str = r#"
if redis.call("get", KEYS[1]) == ARGV[1] then
    return redis.call("pexpire", KEYS[1], ARGV[2])
else
    return 0
end
"#;

/// Only deletes the key if the stored value matches the token.
const RELEASE_SCRIPT: &str = r#"
if redis.call("get", KEYS[1]) == ARGV[1] then
    return redis.call("del", KEYS[1])
else
    return 0
end
"#;

fn script_source(script: LockScript) -> &'static str {
    match script {
        LockScript::Acquire => ACQUIRE_SCRIPT,
        LockScript::Refresh => REFRESH_SCRIPT,
        LockScript::Release => RELEASE_SCRIPT,
    }
}

fn ttl_millis(ttl: Duration) -> u64 {
    // PX 0 is rejected by Redis
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}

#[async_trait]
impl LockStore for RedisLockStore {
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, LockError> {
        let mut conn = self.conn.clone();
        let full_key = self.lock_key(key);

        // Atomic SET key value NX PX milliseconds
        let result: Option<String> = redis::cmd("SET")
            .arg(&full_key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async(&mut conn)
            .await
            .map_err(map_redis_error)?;

        Ok(result.is_some())
    }

    async fn eval(
        &self,
        script: LockScript,
        key: &str,
        token: &str,
        ttl: Option<Duration>,
    ) -> Result<i64, LockError> {
        let mut conn = self.conn.clone();
        let full_key = self.lock_key(key);

        let lua = Script::new(script_source(script));
        let mut invocation = lua.key(&full_key);
        invocation.arg(token);
        match (script, ttl) {
            (LockScript::Release, _) => {}
            (_, Some(ttl)) => {
                invocation.arg(ttl_millis(ttl));
            }
            (_, None) => {
                return Err(LockError::InvalidArgument(format!(
                    "{script} スクリプトには TTL が必要です"
                )));
            }
        }

        let result: i64 = invocation
            .invoke_async(&mut conn)
            .await
            .map_err(map_redis_error)?;
        Ok(result)
    }
}

fn map_redis_error(err: RedisError) -> LockError {
    LockError::Store(err.to_string())
}

/// Helper function to format lock keys (exposed for testing without Redis connection).
pub fn format_lock_key(prefix: &str, key: &str) -> String {
    format!("{}:{}", prefix, key)
}
