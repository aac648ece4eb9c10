use std::time::Duration;

/// RetryStrategy は競合時の次の待機時間を決めるポリシー。
///
/// ブロッキング取得で試行が失敗するたびに呼ばれる。`Some(interval)` なら待機後に再試行し、
/// `None` ならリトライを打ち切る。打ち切り後も繰り返し `None` を返すこと。
/// `&mut self` を取るため、1 回の取得呼び出しごとに新しく生成して使う。
pub trait RetryStrategy: Send {
    fn next(&mut self) -> Option<Duration>;
}

impl<S: RetryStrategy + ?Sized> RetryStrategy for Box<S> {
    fn next(&mut self) -> Option<Duration> {
        (**self).next()
    }
}

impl<S: RetryStrategy + ?Sized> RetryStrategy for &mut S {
    fn next(&mut self) -> Option<Duration> {
        (**self).next()
    }
}

/// 固定間隔で最大 `max_attempts` 回まで試行するリトライポリシー。
///
/// カウンタは初回試行を含む試行回数を数えるため 1 から始まる。
#[derive(Debug, Clone)]
pub struct FixedIntervalRetry {
    pub interval: Duration,
    /// 初回試行を含む総試行回数の上限。リトライ回数ではない（3 なら初回 + 再試行 2 回）。
    pub max_attempts: u32,
    attempts: u32,
}

impl FixedIntervalRetry {
    pub fn new(interval: Duration, max_attempts: u32) -> Self {
        Self {
            interval,
            max_attempts,
            attempts: 1,
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}

impl RetryStrategy for FixedIntervalRetry {
    fn next(&mut self) -> Option<Duration> {
        if self.attempts >= self.max_attempts {
            return None;
        }
        self.attempts += 1;
        Some(self.interval)
    }
}

/// 指数バックオフ付きリトライポリシー。jitter 有効時は ±10% の揺らぎを加える。
#[derive(Debug, Clone)]
pub struct ExponentialBackoffRetry {
    /// 初回試行を含む総試行回数の上限。
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    pub jitter: bool,
    attempts: u32,
}

impl Default for ExponentialBackoffRetry {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(2),
            multiplier: 2.0,
            jitter: true,
            attempts: 1,
        }
    }
}

impl ExponentialBackoffRetry {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..Default::default()
        }
    }

    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_precision_loss,
        clippy::cast_possible_wrap
    )]
    fn compute_delay(&self, retry: u32) -> Duration {
        let base = self.initial_delay.as_millis() as f64 * self.multiplier.powi(retry as i32);
        let capped = base.min(self.max_delay.as_millis() as f64);
        let delay_ms = if self.jitter {
            let jitter_range = capped * 0.1;
            capped - jitter_range + (rand::random::<f64>() * jitter_range * 2.0)
        } else {
            capped
        };
        Duration::from_millis(delay_ms as u64)
    }
}

impl RetryStrategy for ExponentialBackoffRetry {
    fn next(&mut self) -> Option<Duration> {
        if self.attempts >= self.max_attempts {
            return None;
        }
        let delay = self.compute_delay(self.attempts - 1);
        self.attempts += 1;
        Some(delay)
    }
}
