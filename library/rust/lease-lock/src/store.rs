use std::fmt;
use std::time::Duration;

use async_trait::async_trait;

use crate::LockError;

/// ストア側でアトミックに実行する条件付きスクリプトの種類。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockScript {
    /// キーが無ければトークンを TTL 付きで設定して 1、同じトークンを保持済みなら TTL を再設定して 1、それ以外は 0。
    Acquire,
    /// 保存値がトークンと一致すれば TTL を再設定して 1、それ以外は 0。
    Refresh,
    /// 保存値がトークンと一致すればキーを削除して 1、それ以外は 0。
    Release,
}

impl fmt::Display for LockScript {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Acquire => "acquire",
            Self::Refresh => "refresh",
            Self::Release => "release",
        };
        f.write_str(name)
    }
}

/// LockStore はロックが依存するキーバリューストアの能力を表す。
///
/// どの操作もストア側で単一のアトミック操作として実行されなければならない。
/// 実装は Redis などの外部ストアでも、テスト用のインメモリ実装でもよい。
#[cfg_attr(any(test, feature = "mock"), mockall::automock)]
#[async_trait]
pub trait LockStore: Send + Sync {
    /// キーが存在しない場合のみ TTL 付きで値を設定する。設定した場合 true を返す。
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, LockError>;

    async fn eval(
        &self,
        script: LockScript,
        key: &str,
        token: &str,
        ttl: Option<Duration>,
    ) -> Result<i64, LockError>;
}
