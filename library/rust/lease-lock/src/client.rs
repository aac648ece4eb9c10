use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;

use crate::context::LockContext;
use crate::lock::Lock;
use crate::retry::RetryStrategy;
use crate::store::{LockScript, LockStore};
use crate::{LockConfig, LockError};

/// LockClient はロック取得の入口。
///
/// ストアハンドルは明示的に渡す。グローバルな接続は持たない。
pub struct LockClient {
    store: Arc<dyn LockStore>,
    config: LockConfig,
}

impl LockClient {
    pub fn new(store: Arc<dyn LockStore>) -> Self {
        Self::with_config(store, LockConfig::default())
    }

    pub fn with_config(store: Arc<dyn LockStore>, config: LockConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &LockConfig {
        &self.config
    }

    /// 1 回だけ取得を試みる。既に保持されていれば `AcquisitionFailed` を返す。
    ///
    /// 返した Lock の自動更新は開始しない。
    pub async fn try_lock(&self, key: &str, lease: Duration) -> Result<Lock, LockError> {
        let token = new_token();
        let ctx = LockContext::with_timeout(self.config.operation_timeout());
        let acquired = ctx
            .bound(self.store.set_if_absent(key, &token, lease))
            .await?;
        if !acquired {
            tracing::debug!(key = %key, "ロックは既に保持されています");
            return Err(LockError::AcquisitionFailed {
                key: key.to_string(),
            });
        }
        tracing::debug!(key = %key, "ロックを取得しました");
        Ok(self.new_lock(key, token, lease))
    }

    /// 競合時に `retry` に従って再試行するブロッキング取得。
    ///
    /// 各試行は `ctx` から派生した `attempt_timeout` 以内の期限で実行する。
    /// 同じ呼び出しの試行はすべて同じトークンを使う。
    /// ストアエラーは競合とは扱わず、再試行せずにそのまま返す。
    /// バックオフ待機中に `ctx` がキャンセルまたは期限切れになった場合は直ちにその理由を返す。
    pub async fn lock<R>(
        &self,
        ctx: &LockContext,
        key: &str,
        lease: Duration,
        attempt_timeout: Duration,
        mut retry: R,
    ) -> Result<Lock, LockError>
    where
        R: RetryStrategy,
    {
        let token = new_token();
        let mut attempt: u32 = 0;

        loop {
            if let Some(err) = ctx.err() {
                return Err(err);
            }
            attempt += 1;

            let attempt_ctx = ctx.child_with_timeout(attempt_timeout);
            let result = attempt_ctx
                .bound(
                    self.store
                        .eval(LockScript::Acquire, key, &token, Some(lease)),
                )
                .await?;
            if result == 1 {
                tracing::debug!(key = %key, attempt, "ロックを取得しました");
                return Ok(self.new_lock(key, token, lease));
            }

            let Some(delay) = retry.next() else {
                tracing::warn!(key = %key, attempt, "ロック取得のリトライ回数を使い切りました");
                return Err(LockError::RetriesExhausted {
                    key: key.to_string(),
                    attempts: attempt,
                });
            };
            tracing::debug!(
                key = %key,
                attempt,
                delay = ?delay,
                "ロック競合のため再試行します"
            );

            tokio::select! {
                biased;
                err = ctx.done() => return Err(err),
                () = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// クライアント設定のリース期間・試行タイムアウト・固定間隔リトライで [`LockClient::lock`] を実行する。
    pub async fn lock_with_config(&self, ctx: &LockContext, key: &str) -> Result<Lock, LockError> {
        self.lock(
            ctx,
            key,
            self.config.lease(),
            self.config.attempt_timeout(),
            self.config.retry_strategy(),
        )
        .await
    }

    fn new_lock(&self, key: &str, token: String, lease: Duration) -> Lock {
        Lock::new(self.store.clone(), key, token, lease, &self.config)
    }
}

fn new_token() -> String {
    Uuid::new_v4().to_string()
}
