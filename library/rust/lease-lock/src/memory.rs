use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::store::{LockScript, LockStore};
use crate::LockError;

struct LockEntry {
    token: String,
    /// 表現できないほど遠い期限は None（期限なし）として扱う
    expires_at: Option<Instant>,
}

impl LockEntry {
    fn is_expired(&self) -> bool {
        matches!(self.expires_at, Some(at) if Instant::now() >= at)
    }
}

fn expiry(ttl: Duration) -> Option<Instant> {
    Instant::now().checked_add(ttl)
}

/// プロセス内で完結する LockStore 実装。
///
/// 単一プロセス内のテストや開発用。Mutex の保持区間が各操作のアトミック性を保証する。
/// 期限は tokio の時計で判定するため、一時停止した時計でも期限切れを再現できる。
pub struct InMemoryLockStore {
    entries: Mutex<HashMap<String, LockEntry>>,
}

impl InMemoryLockStore {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// 期限内のエントリが保持しているトークンを返す。
    pub async fn current_token(&self, key: &str) -> Option<String> {
        let entries = self.entries.lock().await;
        entries
            .get(key)
            .filter(|entry| !entry.is_expired())
            .map(|entry| entry.token.clone())
    }

    /// 期限内のエントリ数を返す。
    pub async fn len(&self) -> usize {
        let entries = self.entries.lock().await;
        entries.values().filter(|entry| !entry.is_expired()).count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

impl Default for InMemoryLockStore {
    fn default() -> Self {
        Self::new()
    }
}

fn live_token<'a>(entries: &'a HashMap<String, LockEntry>, key: &str) -> Option<&'a str> {
    entries
        .get(key)
        .filter(|entry| !entry.is_expired())
        .map(|entry| entry.token.as_str())
}

fn require_ttl(script: LockScript, ttl: Option<Duration>) -> Result<Duration, LockError> {
    ttl.ok_or_else(|| LockError::InvalidArgument(format!("{script} スクリプトには TTL が必要です")))
}

#[async_trait]
impl LockStore for InMemoryLockStore {
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, LockError> {
        let mut entries = self.entries.lock().await;
        if live_token(&entries, key).is_some() {
            return Ok(false);
        }
        entries.insert(
            key.to_string(),
            LockEntry {
                token: value.to_string(),
                expires_at: expiry(ttl),
            },
        );
        Ok(true)
    }

    async fn eval(
        &self,
        script: LockScript,
        key: &str,
        token: &str,
        ttl: Option<Duration>,
    ) -> Result<i64, LockError> {
        let mut entries = self.entries.lock().await;
        let current = live_token(&entries, key);
        let owned = current == Some(token);

        match script {
            LockScript::Acquire => {
                let ttl = require_ttl(script, ttl)?;
                if current.is_some() {
                    return Ok(0);
                }
                entries.insert(
                    key.to_string(),
                    LockEntry {
                        token: token.to_string(),
                        expires_at: expiry(ttl),
                    },
                );
                Ok(1)
            }
            LockScript::Refresh => {
                let ttl = require_ttl(script, ttl)?;
                match entries.get_mut(key) {
                    Some(entry) if owned => {
                        entry.expires_at = expiry(ttl);
                        Ok(1)
                    }
                    _ => Ok(0),
                }
            }
            LockScript::Release => {
                if !owned {
                    return Ok(0);
                }
                entries.remove(key);
                Ok(1)
            }
        }
    }
}
