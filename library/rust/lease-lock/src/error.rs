use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LockError {
    #[error("既にロック済みです: {key}")]
    AcquisitionFailed { key: String },
    #[error("ロック取得のリトライ回数を使い切りました: {key} ({attempts} 回)")]
    RetriesExhausted { key: String, attempts: u32 },
    #[error("操作がキャンセルされました")]
    Canceled,
    #[error("操作の期限を超過しました")]
    DeadlineExceeded,
    #[error("ロックを保持していません: {key}")]
    LockLost { key: String },
    #[error("ストアエラー: {0}")]
    Store(String),
    #[error("不正な引数です: {0}")]
    InvalidArgument(String),
}

impl LockError {
    /// 期限超過による失敗かどうかを返す。所有状態は不明のまま。
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::DeadlineExceeded)
    }

    /// キャンセルまたは期限超過による失敗かどうかを返す。
    pub fn is_context_error(&self) -> bool {
        matches!(self, Self::Canceled | Self::DeadlineExceeded)
    }
}
