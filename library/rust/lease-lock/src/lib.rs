//! k1s0-lease-lock: リースベースの分散ロックライブラリ。
//!
//! アトミックな条件付き操作を持つキーバリューストアを使い、複数プロセス間で名前付きリソースの排他を行う。
//! 所有権はトークンで証明し、更新と解放は必ずストア側でトークンを検証してから実行する。
//!
//! # 使用例
//!
//! ```ignore
//! use std::sync::Arc;
//! use std::time::Duration;
//! use k1s0_lease_lock::{FixedIntervalRetry, InMemoryLockStore, LockClient, LockContext};
//!
//! let client = LockClient::new(Arc::new(InMemoryLockStore::new()));
//! let ctx = LockContext::with_timeout(Duration::from_secs(5));
//! let lock = client
//!     .lock(&ctx, "jobs:nightly", Duration::from_secs(30), Duration::from_secs(1),
//!           FixedIntervalRetry::new(Duration::from_millis(100), 10))
//!     .await?;
//! // 排他区間
//! lock.release().await?;
//! ```

pub mod client;
pub mod config;
pub mod context;
pub mod error;
pub mod lock;
pub mod memory;
#[cfg(feature = "redis")]
pub mod redis;
pub mod retry;
pub mod store;

pub use client::LockClient;
pub use config::LockConfig;
pub use context::LockContext;
pub use error::LockError;
pub use lock::Lock;
pub use memory::InMemoryLockStore;
#[cfg(feature = "redis")]
pub use self::redis::RedisLockStore;
pub use retry::{ExponentialBackoffRetry, FixedIntervalRetry, RetryStrategy};
pub use store::{LockScript, LockStore};

#[cfg(feature = "mock")]
pub use store::MockLockStore;
