use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k1s0_lease_lock::{
    FixedIntervalRetry, InMemoryLockStore, LockClient, LockConfig, LockContext, LockError,
    LockScript, LockStore,
};

const LEASE: Duration = Duration::from_secs(30);
const ATTEMPT: Duration = Duration::from_millis(200);

/// 更新回数を数え、指定回数だけ更新を遅延させるストア。
struct CountingStore {
    inner: InMemoryLockStore,
    refreshes: AtomicU32,
    slow_refreshes: AtomicU32,
    slow_delay: Duration,
}

impl CountingStore {
    fn new() -> Self {
        Self::with_slow_refreshes(0, Duration::ZERO)
    }

    fn with_slow_refreshes(count: u32, delay: Duration) -> Self {
        Self {
            inner: InMemoryLockStore::new(),
            refreshes: AtomicU32::new(0),
            slow_refreshes: AtomicU32::new(count),
            slow_delay: delay,
        }
    }

    fn refresh_count(&self) -> u32 {
        self.refreshes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LockStore for CountingStore {
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, LockError> {
        self.inner.set_if_absent(key, value, ttl).await
    }

    async fn eval(
        &self,
        script: LockScript,
        key: &str,
        token: &str,
        ttl: Option<Duration>,
    ) -> Result<i64, LockError> {
        if script == LockScript::Refresh {
            self.refreshes.fetch_add(1, Ordering::SeqCst);
            let slow = self
                .slow_refreshes
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if slow {
                tokio::time::sleep(self.slow_delay).await;
            }
        }
        self.inner.eval(script, key, token, ttl).await
    }
}

#[tokio::test]
async fn test_concurrent_try_lock_has_single_winner() {
    let client = Arc::new(LockClient::new(Arc::new(InMemoryLockStore::new())));

    let mut handles = Vec::new();
    for _ in 0..16 {
        let client = client.clone();
        handles.push(tokio::spawn(async move {
            client.try_lock("shared", LEASE).await
        }));
    }

    let mut winners = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => winners += 1,
            Err(err) => assert!(matches!(err, LockError::AcquisitionFailed { .. })),
        }
    }
    assert_eq!(winners, 1);
}

#[tokio::test]
async fn test_lock_tokens_are_distinct_per_acquisition() {
    let client = LockClient::new(Arc::new(InMemoryLockStore::new()));
    let ctx = LockContext::new();

    let mut tokens = HashSet::new();
    for _ in 0..5 {
        let lock = client
            .lock(
                &ctx,
                "jobs",
                LEASE,
                ATTEMPT,
                FixedIntervalRetry::new(Duration::from_millis(1), 3),
            )
            .await
            .unwrap();
        assert!(!lock.token().is_empty());
        assert!(tokens.insert(lock.token().to_string()));
        lock.release().await.unwrap();
    }
    assert_eq!(tokens.len(), 5);
}

#[tokio::test(start_paused = true)]
async fn test_expired_lease_is_lost_to_new_holder() {
    let store = Arc::new(InMemoryLockStore::new());
    let client = LockClient::new(store.clone());

    let stale = client
        .try_lock("jobs", Duration::from_millis(50))
        .await
        .unwrap();
    assert!(matches!(
        client.try_lock("jobs", LEASE).await,
        Err(LockError::AcquisitionFailed { .. })
    ));

    tokio::time::advance(Duration::from_millis(100)).await;
    let fresh = client.try_lock("jobs", LEASE).await.unwrap();

    let refreshed = stale.refresh(&LockContext::with_timeout(ATTEMPT)).await;
    assert!(matches!(refreshed, Err(LockError::LockLost { .. })));

    let released = stale.release().await;
    assert!(matches!(released, Err(LockError::LockLost { .. })));
    assert_eq!(
        store.current_token("jobs").await.as_deref(),
        Some(fresh.token())
    );

    fresh.release().await.unwrap();
    assert!(store.is_empty().await);
}

#[tokio::test(start_paused = true)]
async fn test_blocking_lock_waits_for_release() {
    let store = Arc::new(InMemoryLockStore::new());
    let client = Arc::new(LockClient::new(store.clone()));

    let holder = client.try_lock("jobs", LEASE).await.unwrap();
    let waiter = {
        let client = client.clone();
        tokio::spawn(async move {
            client
                .lock(
                    &LockContext::new(),
                    "jobs",
                    LEASE,
                    ATTEMPT,
                    FixedIntervalRetry::new(Duration::from_millis(10), 50),
                )
                .await
        })
    };

    tokio::time::sleep(Duration::from_millis(35)).await;
    holder.release().await.unwrap();

    let acquired = waiter.await.unwrap().unwrap();
    assert_ne!(acquired.token(), holder.token());
    assert_eq!(
        store.current_token("jobs").await.as_deref(),
        Some(acquired.token())
    );
}

#[tokio::test(start_paused = true)]
async fn test_cancel_during_backoff_stops_blocking_lock() {
    let client = LockClient::new(Arc::new(InMemoryLockStore::new()));
    let _holder = client.try_lock("jobs", LEASE).await.unwrap();

    let ctx = LockContext::new();
    let canceller = ctx.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(30)).await;
        canceller.cancel();
    });

    let started = tokio::time::Instant::now();
    let result = client
        .lock(
            &ctx,
            "jobs",
            LEASE,
            ATTEMPT,
            FixedIntervalRetry::new(Duration::from_millis(10), 100),
        )
        .await;
    assert_eq!(result.unwrap_err(), LockError::Canceled);
    assert!(started.elapsed() < Duration::from_millis(100));
}

#[tokio::test(start_paused = true)]
async fn test_auto_refresh_stops_after_release() {
    let store = Arc::new(CountingStore::new());
    let client = LockClient::new(store.clone());
    let lock = Arc::new(client.try_lock("jobs", LEASE).await.unwrap());

    let renewal = {
        let lock = lock.clone();
        tokio::spawn(async move {
            lock.auto_refresh(Duration::from_millis(10), Duration::from_millis(5))
                .await
        })
    };

    while store.refresh_count() < 5 {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    let released_at = tokio::time::Instant::now();
    lock.release().await.unwrap();
    let count_at_release = store.refresh_count();

    assert_eq!(renewal.await.unwrap(), Ok(()));
    assert!(released_at.elapsed() <= Duration::from_millis(10));

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(store.refresh_count(), count_at_release);
}

#[tokio::test(start_paused = true)]
async fn test_release_during_in_flight_refresh_ends_auto_refresh_cleanly() {
    // 10ms のティックで始まる更新が 15ms まで掛かる間に解放する
    let store = Arc::new(CountingStore::with_slow_refreshes(
        1,
        Duration::from_millis(5),
    ));
    let client = LockClient::new(store.clone());
    let lock = Arc::new(client.try_lock("jobs", LEASE).await.unwrap());

    let renewal = {
        let lock = lock.clone();
        tokio::spawn(async move {
            lock.auto_refresh(Duration::from_millis(10), Duration::from_millis(50))
                .await
        })
    };

    tokio::time::sleep(Duration::from_millis(12)).await;
    assert_eq!(store.refresh_count(), 1);
    lock.release().await.unwrap();
    assert!(store.inner.is_empty().await);

    assert_eq!(renewal.await.unwrap(), Ok(()));
    assert_eq!(store.refresh_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_lock_with_unbounded_timeouts_does_not_panic() {
    let store = Arc::new(InMemoryLockStore::new());
    let config = LockConfig::new()
        .with_operation_timeout(Duration::MAX)
        .with_refresh(Duration::MAX, Duration::MAX);
    let client = LockClient::with_config(store.clone(), config);
    let _holder = client.try_lock("jobs", LEASE).await.unwrap();

    let contender = client
        .lock(
            &LockContext::with_timeout(Duration::MAX),
            "jobs",
            LEASE,
            Duration::MAX,
            FixedIntervalRetry::new(Duration::from_millis(1), 1),
        )
        .await;
    assert_eq!(
        contender.unwrap_err(),
        LockError::RetriesExhausted {
            key: "jobs".to_string(),
            attempts: 1
        }
    );
}

#[tokio::test(start_paused = true)]
async fn test_auto_refresh_keeps_lease_alive_past_its_duration() {
    let store = Arc::new(CountingStore::new());
    let client = LockClient::new(store.clone());
    let lock = Arc::new(
        client
            .try_lock("jobs", Duration::from_millis(30))
            .await
            .unwrap(),
    );

    let renewal = {
        let lock = lock.clone();
        tokio::spawn(async move {
            lock.auto_refresh(Duration::from_millis(10), Duration::from_millis(5))
                .await
        })
    };

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(matches!(
        client.try_lock("jobs", LEASE).await,
        Err(LockError::AcquisitionFailed { .. })
    ));

    lock.release().await.unwrap();
    assert_eq!(renewal.await.unwrap(), Ok(()));
}

#[tokio::test(start_paused = true)]
async fn test_auto_refresh_retries_immediately_after_timeout() {
    let store = Arc::new(CountingStore::with_slow_refreshes(
        2,
        Duration::from_millis(50),
    ));
    let client = LockClient::new(store.clone());
    let lock = Arc::new(client.try_lock("jobs", LEASE).await.unwrap());

    let renewal = {
        let lock = lock.clone();
        tokio::spawn(async move {
            lock.auto_refresh(Duration::from_secs(1), Duration::from_millis(20))
                .await
        })
    };

    // 1 秒後のティックで 2 回タイムアウトし、次のティックを待たずに 3 回目で成功する
    tokio::time::sleep(Duration::from_millis(1100)).await;
    assert_eq!(store.refresh_count(), 3);
    assert!(!renewal.is_finished());

    lock.release().await.unwrap();
    assert_eq!(renewal.await.unwrap(), Ok(()));
}

#[tokio::test(start_paused = true)]
async fn test_auto_refresh_reports_lock_lost() {
    let store = Arc::new(CountingStore::new());
    let client = LockClient::new(store.clone());
    let lock = client
        .try_lock("jobs", Duration::from_millis(5))
        .await
        .unwrap();

    // 初回ティック前にリースが切れ、別の保持者が取得する
    tokio::time::advance(Duration::from_millis(6)).await;
    let _other = client.try_lock("jobs", LEASE).await.unwrap();

    let result = lock
        .auto_refresh(Duration::from_millis(10), Duration::from_millis(5))
        .await;
    assert!(matches!(result, Err(LockError::LockLost { .. })));
    assert_eq!(store.refresh_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_lock_with_config_and_auto_refresh_with_config() {
    let store = Arc::new(CountingStore::new());
    let config = LockConfig::new()
        .with_lease(Duration::from_millis(100))
        .with_retry(Duration::from_millis(5), 2)
        .with_refresh(Duration::from_millis(20), Duration::from_millis(10));
    let client = LockClient::with_config(store.clone(), config);

    let lock = Arc::new(
        client
            .lock_with_config(&LockContext::new(), "jobs")
            .await
            .unwrap(),
    );
    assert_eq!(lock.lease(), Duration::from_millis(100));

    let renewal = {
        let lock = lock.clone();
        tokio::spawn(async move { lock.auto_refresh_with_config().await })
    };
    tokio::time::sleep(Duration::from_millis(70)).await;
    assert_eq!(store.refresh_count(), 3);

    let contender = client.lock_with_config(&LockContext::new(), "jobs").await;
    assert_eq!(
        contender.unwrap_err(),
        LockError::RetriesExhausted {
            key: "jobs".to_string(),
            attempts: 2
        }
    );

    lock.release().await.unwrap();
    assert_eq!(renewal.await.unwrap(), Ok(()));
}
