use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::LockError;

/// LockContext はブロッキング操作に渡す外部キャンセルシグナルと期限を表す。
///
/// clone したコンテキストは同じキャンセルトークンを共有する。
/// `child_with_timeout` で作った子は親のキャンセルを引き継ぎ、期限は親と子の早い方になる。
#[derive(Debug, Clone, Default)]
pub struct LockContext {
    cancel: CancellationToken,
    deadline: Option<Instant>,
}

impl LockContext {
    /// 期限なし・未キャンセルのコンテキストを作成する。
    pub fn new() -> Self {
        Self::default()
    }

    /// 現在時刻から `timeout` 後を期限とする。表現できないほど長い場合は期限なしになる。
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            cancel: CancellationToken::new(),
            deadline: Instant::now().checked_add(timeout),
        }
    }

    pub fn with_deadline(deadline: Instant) -> Self {
        Self {
            cancel: CancellationToken::new(),
            deadline: Some(deadline),
        }
    }

    /// 既存の CancellationToken に連動するコンテキストを作成する。
    pub fn from_token(cancel: CancellationToken) -> Self {
        Self {
            cancel,
            deadline: None,
        }
    }

    pub fn child_with_timeout(&self, timeout: Duration) -> Self {
        let deadline = match (self.deadline, Instant::now().checked_add(timeout)) {
            (Some(parent), Some(candidate)) => Some(parent.min(candidate)),
            (parent, None) => parent,
            (None, candidate) => candidate,
        };
        Self {
            cancel: self.cancel.child_token(),
            deadline,
        }
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// 既に終了している場合はその理由を返す。キャンセルが期限超過より優先される。
    pub fn err(&self) -> Option<LockError> {
        if self.cancel.is_cancelled() {
            return Some(LockError::Canceled);
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Some(LockError::DeadlineExceeded),
            _ => None,
        }
    }

    /// キャンセルされるか期限に達するまで待機し、その理由を返す。
    pub async fn done(&self) -> LockError {
        match self.deadline {
            Some(deadline) => {
                tokio::select! {
                    () = self.cancel.cancelled() => LockError::Canceled,
                    () = tokio::time::sleep_until(deadline) => LockError::DeadlineExceeded,
                }
            }
            None => {
                self.cancel.cancelled().await;
                LockError::Canceled
            }
        }
    }

    /// ストア呼び出しを期限で打ち切る。
    /// 発行済みのストア操作はキャンセルでは中断せず、期限のみで打ち切る。
    pub(crate) async fn bound<F, T>(&self, operation: F) -> Result<T, LockError>
    where
        F: Future<Output = Result<T, LockError>>,
    {
        match self.deadline {
            Some(deadline) => tokio::time::timeout_at(deadline, operation)
                .await
                .map_err(|_| LockError::DeadlineExceeded)?,
            None => operation.await,
        }
    }
}
