use std::time::Duration;

use serde::Deserialize;

use crate::retry::FixedIntervalRetry;

/// LockConfig はロッククライアントの既定値をまとめた設定。
///
/// 設定ファイルの読み込みは呼び出し側で行う。各フィールドは個別に省略可能で、省略時は既定値になる。
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    /// リースの有効期間（ミリ秒）
    pub lease_ms: u64,
    /// try_lock と release の 1 往復あたりの上限（ミリ秒）
    pub operation_timeout_ms: u64,
    /// ブロッキング取得の 1 試行あたりの上限（ミリ秒）
    pub attempt_timeout_ms: u64,
    pub retry_interval_ms: u64,
    /// 初回試行を含む総試行回数
    pub max_attempts: u32,
    pub refresh_interval_ms: u64,
    pub refresh_timeout_ms: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            lease_ms: 30_000,
            operation_timeout_ms: 3_000,
            attempt_timeout_ms: 1_000,
            retry_interval_ms: 100,
            max_attempts: 10,
            refresh_interval_ms: 10_000,
            refresh_timeout_ms: 1_000,
        }
    }
}

impl LockConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease_ms = to_millis(lease);
        self
    }

    pub fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout_ms = to_millis(timeout);
        self
    }

    pub fn with_attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout_ms = to_millis(timeout);
        self
    }

    pub fn with_retry(mut self, interval: Duration, max_attempts: u32) -> Self {
        self.retry_interval_ms = to_millis(interval);
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_refresh(mut self, interval: Duration, timeout: Duration) -> Self {
        self.refresh_interval_ms = to_millis(interval);
        self.refresh_timeout_ms = to_millis(timeout);
        self
    }

    pub fn lease(&self) -> Duration {
        Duration::from_millis(self.lease_ms)
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }

    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.attempt_timeout_ms)
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_millis(self.refresh_interval_ms)
    }

    pub fn refresh_timeout(&self) -> Duration {
        Duration::from_millis(self.refresh_timeout_ms)
    }

    /// 設定値から 1 回の取得呼び出し用のリトライポリシーを生成する。
    pub fn retry_strategy(&self) -> FixedIntervalRetry {
        FixedIntervalRetry::new(
            Duration::from_millis(self.retry_interval_ms),
            self.max_attempts,
        )
    }
}

fn to_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
