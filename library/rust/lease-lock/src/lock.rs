use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::{mpsc, Mutex};
use tokio::time::{Instant, Interval, MissedTickBehavior};

use crate::context::LockContext;
use crate::store::{LockScript, LockStore};
use crate::{LockConfig, LockError};

/// 自動更新ループの状態。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RenewState {
    /// 次のティックか解放シグナルを待っている
    Holding,
    /// 直前の更新が期限超過したため、待たずに再更新する
    RetryNow,
}

/// Lock は 1 回の取得成功を表すリースハンドル。
///
/// 更新・解放はすべてこのハンドルのトークンでストア側の所有者を検証してから行う。
/// `Arc` で共有し、あるタスクで [`Lock::auto_refresh`] を回しつつ別のタスクから
/// [`Lock::release`] を呼べる。`refresh` と `release` を並行して呼ぶのは呼び出し側の責任で避けること。
pub struct Lock {
    store: Arc<dyn LockStore>,
    key: String,
    token: String,
    lease: Duration,
    operation_timeout: Duration,
    refresh_interval: Duration,
    refresh_timeout: Duration,
    release_tx: mpsc::Sender<()>,
    release_rx: Mutex<mpsc::Receiver<()>>,
}

impl Lock {
    pub(crate) fn new(
        store: Arc<dyn LockStore>,
        key: &str,
        token: String,
        lease: Duration,
        config: &LockConfig,
    ) -> Self {
        let (release_tx, release_rx) = mpsc::channel(1);
        Self {
            store,
            key: key.to_string(),
            token,
            lease,
            operation_timeout: config.operation_timeout(),
            refresh_interval: config.refresh_interval(),
            refresh_timeout: config.refresh_timeout(),
            release_tx,
            release_rx: Mutex::new(release_rx),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn lease(&self) -> Duration {
        self.lease
    }

    /// ストア上の値がこのトークンと一致する場合のみ有効期限をリース期間へ戻す。
    ///
    /// 一致しなければ何も変更せず `LockLost` を返す。`Store` / `DeadlineExceeded` の場合、
    /// 所有状態は不明なので扱いは呼び出し側が決める。
    pub async fn refresh(&self, ctx: &LockContext) -> Result<(), LockError> {
        let result = ctx
            .bound(
                self.store
                    .eval(LockScript::Refresh, &self.key, &self.token, Some(self.lease)),
            )
            .await?;
        if result != 1 {
            tracing::warn!(key = %self.key, "ロックを喪失しました");
            return Err(LockError::LockLost {
                key: self.key.clone(),
            });
        }
        tracing::debug!(key = %self.key, "リースを更新しました");
        Ok(())
    }

    /// 所有者を検証したうえでキーを削除する。
    ///
    /// 先に解放シグナルを送り、動作中の自動更新ループを止める。
    /// ストア上のトークンが異なる場合は何も削除せず `LockLost` を返す。
    pub async fn release(&self) -> Result<(), LockError> {
        // 容量 1 のため、既にシグナル送信済みなら送信は失敗するが問題ない
        let _ = self.release_tx.try_send(());

        let ctx = LockContext::with_timeout(self.operation_timeout);
        let result = ctx
            .bound(
                self.store
                    .eval(LockScript::Release, &self.key, &self.token, None),
            )
            .await?;
        if result != 1 {
            tracing::warn!(key = %self.key, "解放時にロックを保持していませんでした");
            return Err(LockError::LockLost {
                key: self.key.clone(),
            });
        }
        tracing::debug!(key = %self.key, "ロックを解放しました");
        Ok(())
    }

    /// `interval` ごとにリースを更新し続けるブロッキングループ。
    ///
    /// - 更新が `refresh_timeout` 内に終わらなかった場合は次のティックを待たずに即時再更新する
    /// - それ以外のエラー（`LockLost` を含む）はループを抜けてそのまま返す
    /// - `release` が呼ばれると `Ok(())` で終了する。更新中に解放された場合も同様
    /// - 初回ティックの時刻が表現できないほど `interval` が長い場合は解放まで待つだけになる
    pub async fn auto_refresh(
        &self,
        interval: Duration,
        refresh_timeout: Duration,
    ) -> Result<(), LockError> {
        if interval.is_zero() {
            return Err(LockError::InvalidArgument(
                "自動更新の間隔は 0 より大きくする必要があります".to_string(),
            ));
        }

        let mut release_rx = self.release_rx.lock().await;
        let mut ticker = Instant::now().checked_add(interval).map(|start| {
            let mut ticker = tokio::time::interval_at(start, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker
        });
        let mut state = RenewState::Holding;

        loop {
            let released = match state {
                RenewState::Holding => tokio::select! {
                    biased;
                    _ = release_rx.recv() => true,
                    () = next_tick(&mut ticker) => false,
                },
                RenewState::RetryNow => release_requested(&mut release_rx),
            };
            if released {
                tracing::info!(key = %self.key, "自動更新を終了しました");
                return Ok(());
            }

            let ctx = LockContext::with_timeout(refresh_timeout);
            let outcome = self.refresh(&ctx).await;
            // 更新中に release が先にキーを削除した場合は喪失ではなく解放として扱う
            if outcome.is_err() && release_requested(&mut release_rx) {
                tracing::info!(key = %self.key, "更新中に解放されたため自動更新を終了しました");
                return Ok(());
            }
            state = match outcome {
                Ok(()) => RenewState::Holding,
                Err(err) if err.is_timeout() => {
                    tracing::warn!(key = %self.key, "リース更新がタイムアウトしたため即時に再試行します");
                    RenewState::RetryNow
                }
                Err(err) => return Err(err),
            };
        }
    }

    /// クライアント設定の更新間隔とタイムアウトで [`Lock::auto_refresh`] を実行する。
    pub async fn auto_refresh_with_config(&self) -> Result<(), LockError> {
        self.auto_refresh(self.refresh_interval, self.refresh_timeout)
            .await
    }
}

fn release_requested(release_rx: &mut mpsc::Receiver<()>) -> bool {
    match release_rx.try_recv() {
        Ok(()) | Err(TryRecvError::Disconnected) => true,
        Err(TryRecvError::Empty) => false,
    }
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}

impl fmt::Debug for Lock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lock")
            .field("key", &self.key)
            .field("token", &self.token)
            .field("lease", &self.lease)
            .finish_non_exhaustive()
    }
}
