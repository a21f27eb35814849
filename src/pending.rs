// UDPリクエストと応答の対応付け

use bytes::Bytes;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::debug;

/// 応答待ちの結果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Awaited {
    Response(Bytes),
    /// 期限切れ。待機エントリは削除済み
    TimedOut,
    /// セッション終了などで破棄された
    Cancelled,
}

/// 応答待ちリクエストの管理
#[derive(Debug, Default)]
pub struct PendingRequests {
    next_id: AtomicU64,
    requests: DashMap<u64, oneshot::Sender<Bytes>>,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self::default()
    }

    /// 新しいリクエストIDを割り当てて登録
    pub fn register(&self) -> (u64, oneshot::Receiver<Bytes>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.requests.insert(id, tx);
        (id, rx)
    }

    /// 応答を待機中のリクエストへ渡す
    /// 該当するリクエストがなければ `Err` でペイロードを返す
    pub fn respond(&self, id: u64, payload: Bytes) -> Result<(), Bytes> {
        match self.requests.remove(&id) {
            Some((_, tx)) => tx.send(payload),
            None => Err(payload),
        }
    }

    pub fn cancel(&self, id: u64) {
        if self.requests.remove(&id).is_some() {
            debug!("Cancelled pending request {}", id);
        }
    }

    /// 全ての待機を破棄（受信側は `Cancelled` になる）
    pub fn cancel_all(&self) {
        self.requests.clear();
    }

    pub fn count(&self) -> usize {
        self.requests.len()
    }

    /// 期限付きで応答を待つ。期限切れの場合はエントリを削除する
    pub async fn wait(&self, id: u64, rx: oneshot::Receiver<Bytes>, deadline: Duration) -> Awaited {
        match tokio::time::timeout(deadline, rx).await {
            Ok(Ok(payload)) => Awaited::Response(payload),
            Ok(Err(_)) => Awaited::Cancelled,
            Err(_) => {
                self.cancel(id);
                Awaited::TimedOut
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_register_and_respond() {
        let pending = PendingRequests::new();
        let (id, rx) = pending.register();
        assert_eq!(pending.count(), 1);

        pending.respond(id, Bytes::from_static(b"pong")).unwrap();
        assert_eq!(pending.count(), 0);
        assert_eq!(
            pending.wait(id, rx, Duration::from_secs(1)).await,
            Awaited::Response(Bytes::from_static(b"pong"))
        );
    }

    #[tokio::test]
    async fn test_respond_unknown_returns_payload() {
        let pending = PendingRequests::new();
        let res = pending.respond(42, Bytes::from_static(b"late"));
        assert_eq!(res, Err(Bytes::from_static(b"late")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_times_out_and_removes_entry() {
        let pending = PendingRequests::new();
        let (id, rx) = pending.register();

        let result = pending.wait(id, rx, Duration::from_millis(100)).await;
        assert_eq!(result, Awaited::TimedOut);
        assert_eq!(pending.count(), 0);

        // 期限切れ後の応答は呼び出し元に戻される
        assert!(pending.respond(id, Bytes::new()).is_err());
    }

    #[tokio::test]
    async fn test_cancel_all_resolves_waiters() {
        let pending = Arc::new(PendingRequests::new());
        let (id, rx) = pending.register();

        let waiter = {
            let pending = pending.clone();
            tokio::spawn(async move { pending.wait(id, rx, Duration::from_secs(30)).await })
        };

        pending.cancel_all();
        assert_eq!(waiter.await.unwrap(), Awaited::Cancelled);
    }

    #[test]
    fn test_ids_are_unique() {
        let pending = PendingRequests::new();
        let (a, _ra) = pending.register();
        let (b, _rb) = pending.register();
        assert_ne!(a, b);
        assert_eq!(pending.count(), 2);
    }
}
