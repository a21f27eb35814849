// UDPのソフトステート管理
//
// 待ち受けポートごとに接続元ポートをキーとしたエントリを保持し、
// 一定時間アクティビティがなければエントリを破棄して相手側へ通知する。
//
// リフレッシュと、タイムアウトによる期限確認および削除は、どちらも
// 同じシャードのロック下で行うため、同じエントリに対して両者が交錯することはない。
// どちらのロックもI/Oをまたいで保持しない。

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::events::{EventFeed, TunnelEvent};
use crate::peer::TunnelPeer;
use crate::protocol::{FlowKey, Message};

/// UDPフロー一つ分の状態
#[derive(Debug)]
pub struct UdpFlowEntry<T> {
    origin_port: u16,
    resource: T,
    created: Instant,
    /// `created` からの経過ナノ秒
    last_activity: AtomicU64,
    alive: AtomicBool,
    cancel: CancellationToken,
}

impl<T> UdpFlowEntry<T> {
    fn new(origin_port: u16, resource: T, now: Instant, cancel: CancellationToken) -> Self {
        Self {
            origin_port,
            resource,
            created: now,
            last_activity: AtomicU64::new(0),
            alive: AtomicBool::new(true),
            cancel,
        }
    }

    pub fn origin_port(&self) -> u16 {
        self.origin_port
    }

    pub fn resource(&self) -> &T {
        &self.resource
    }

    /// 破棄済みのエントリに対する送信は行わないこと
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    pub fn last_activity(&self) -> Instant {
        self.created + Duration::from_nanos(self.last_activity.load(Ordering::Acquire))
    }

    /// エントリの寿命に紐づくキャンセルトークン
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    fn touch(&self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.created).as_nanos() as u64;
        self.last_activity.fetch_max(elapsed, Ordering::AcqRel);
    }

    fn deadline(&self, idle_timeout: Duration) -> Instant {
        self.last_activity() + idle_timeout
    }

    fn try_expire(&self, now: Instant, idle_timeout: Duration) -> bool {
        now >= self.deadline(idle_timeout) && self.kill()
    }

    /// 生存フラグを落とす。最初の一回だけ `true`
    fn kill(&self) -> bool {
        self.alive.swap(false, Ordering::AcqRel)
    }
}

/// 一つの待ち受けポートに属するUDPフローの表
pub struct UdpFlowTable<T> {
    listen_port: u16,
    idle_timeout: Duration,
    entries: Arc<DashMap<u16, Arc<UdpFlowEntry<T>>>>,
    peer: Arc<dyn TunnelPeer>,
    events: EventFeed,
    cancel: CancellationToken,
}

impl<T> UdpFlowTable<T>
where
    T: Send + Sync + 'static,
{
    pub fn new(
        listen_port: u16,
        idle_timeout: Duration,
        peer: Arc<dyn TunnelPeer>,
        events: EventFeed,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            listen_port,
            idle_timeout,
            entries: Arc::new(DashMap::new()),
            peer,
            events,
            cancel,
        }
    }

    pub fn listen_port(&self) -> u16 {
        self.listen_port
    }

    /// エントリを追加、既にあればアイドルタイマーをリセット
    ///
    /// `init` は新規作成時にだけ呼ばれる。戻り値の `bool` は新規作成されたか。
    pub fn add_or_refresh(
        &self,
        origin_port: u16,
        init: impl FnOnce() -> T,
    ) -> (Arc<UdpFlowEntry<T>>, bool) {
        let now = Instant::now();
        let (entry, created) = match self.entries.entry(origin_port) {
            Entry::Occupied(occupied) => {
                let entry = occupied.get().clone();
                entry.touch(now);
                (entry, false)
            }
            Entry::Vacant(vacant) => {
                let entry = Arc::new(UdpFlowEntry::new(
                    origin_port,
                    init(),
                    now,
                    self.cancel.child_token(),
                ));
                vacant.insert(entry.clone());
                (entry, true)
            }
        };

        if created {
            let key = FlowKey::udp(self.listen_port, origin_port);
            debug!("UDP flow {} created", key);
            self.events.emit(TunnelEvent::FlowOpened { key });
            self.spawn_idle_timer(entry.clone());
        }

        (entry, created)
    }

    /// 既存エントリのアイドルタイマーをリセット。なければ何も作らない
    pub fn refresh(&self, origin_port: u16) -> Option<Arc<UdpFlowEntry<T>>> {
        let entry = self.entries.get(&origin_port)?;
        entry.touch(Instant::now());
        Some(entry.value().clone())
    }

    pub fn get(&self, origin_port: u16) -> Option<Arc<UdpFlowEntry<T>>> {
        self.entries.get(&origin_port).map(|e| e.value().clone())
    }

    pub fn contains(&self, origin_port: u16) -> bool {
        self.entries.contains_key(&origin_port)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// 明示的な切断。相手側へは通知しない
    pub fn disconnect(&self, origin_port: u16) -> bool {
        match self.entries.remove_if(&origin_port, |_, entry| entry.kill()) {
            Some((_, entry)) => {
                entry.cancel.cancel();
                let key = FlowKey::udp(self.listen_port, origin_port);
                debug!("UDP flow {} disconnected", key);
                self.events.emit(TunnelEvent::UdpFlowClosed { key });
                true
            }
            None => false,
        }
    }

    /// 全エントリを破棄（セッション終了時）
    pub fn clear(&self) {
        let listen_port = self.listen_port;
        let events = &self.events;
        self.entries.retain(|origin_port, entry| {
            if entry.kill() {
                events.emit(TunnelEvent::UdpFlowClosed {
                    key: FlowKey::udp(listen_port, *origin_port),
                });
            }
            entry.cancel.cancel();
            false
        });
    }

    fn spawn_idle_timer(&self, entry: Arc<UdpFlowEntry<T>>) {
        let entries = self.entries.clone();
        let peer = self.peer.clone();
        let events = self.events.clone();
        let idle_timeout = self.idle_timeout;
        let listen_port = self.listen_port;

        tokio::spawn(async move {
            let origin_port = entry.origin_port;
            loop {
                let deadline = entry.deadline(idle_timeout);
                tokio::select! {
                    _ = entry.cancel.cancelled() => return,
                    _ = tokio::time::sleep_until(deadline) => {}
                }

                // 期限の確認と削除を同じロック内で行う
                let now = Instant::now();
                let evicted = entries
                    .remove_if(&origin_port, |_, current| {
                        Arc::ptr_eq(current, &entry) && current.try_expire(now, idle_timeout)
                    })
                    .is_some();

                if evicted {
                    entry.cancel.cancel();
                    let key = FlowKey::udp(listen_port, origin_port);
                    debug!("UDP flow {} idle for {:?}, evicted", key, idle_timeout);
                    events.emit(TunnelEvent::UdpFlowEvicted { key });
                    let _ = peer
                        .send(Message::UdpDisconnect {
                            listen_port,
                            origin_port,
                        })
                        .await;
                    return;
                }

                if !entry.is_alive() {
                    return;
                }
            }
        });
    }
}

impl<T> Drop for UdpFlowTable<T> {
    fn drop(&mut self) {
        for entry in self.entries.iter() {
            entry.cancel.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::ChannelPeer;
    use tokio::sync::mpsc;
    use tokio::time::sleep;

    fn table(idle_ms: u64) -> (UdpFlowTable<()>, mpsc::Receiver<Message>) {
        let (peer, rx) = ChannelPeer::new(64);
        let table = UdpFlowTable::new(
            5000,
            Duration::from_millis(idle_ms),
            Arc::new(peer),
            EventFeed::default(),
            CancellationToken::new(),
        );
        (table, rx)
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_eviction_per_origin() {
        let (table, mut rx) = table(500);

        table.add_or_refresh(1111, || ());
        sleep(Duration::from_millis(200)).await;
        table.add_or_refresh(2222, || ());

        sleep(Duration::from_millis(310)).await;
        assert!(!table.contains(1111));
        assert!(table.contains(2222));

        sleep(Duration::from_millis(200)).await;
        assert!(!table.contains(2222));
        assert!(table.is_empty());

        // 破棄ごとに相手側へ一度だけ通知される
        assert_eq!(
            rx.recv().await,
            Some(Message::UdpDisconnect {
                listen_port: 5000,
                origin_port: 1111
            })
        );
        assert_eq!(
            rx.recv().await,
            Some(Message::UdpDisconnect {
                listen_port: 5000,
                origin_port: 2222
            })
        );
        sleep(Duration::from_secs(5)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_extends_lifetime() {
        let (table, _rx) = table(500);

        let (_, created) = table.add_or_refresh(1111, || ());
        assert!(created);

        sleep(Duration::from_millis(300)).await;
        let (_, created) = table.add_or_refresh(1111, || unreachable!());
        assert!(!created);
        assert_eq!(table.len(), 1);

        sleep(Duration::from_millis(300)).await;
        assert!(table.contains(1111));

        sleep(Duration::from_millis(500)).await;
        assert!(!table.contains(1111));
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_at_idle_deadline() {
        let (table, mut rx) = table(500);
        let mut events = table.events.subscribe();

        let (first, _) = table.add_or_refresh(1111, || ());
        let mut created_total = 1;
        for _ in 0..20 {
            // アイドルタイマーと同じ時刻にリフレッシュが届く
            sleep(Duration::from_millis(500)).await;
            let (entry, created) = table.add_or_refresh(1111, || ());
            if created {
                created_total += 1;
            }
            assert_eq!(table.len(), 1);
            assert!(entry.is_alive());
            assert!(Arc::ptr_eq(&entry, &table.get(1111).unwrap()));
        }

        // 破棄された直後に届いたデータは新しいエントリになる
        sleep(Duration::from_millis(600)).await;
        assert!(table.is_empty());
        let (fresh, created) = table.add_or_refresh(1111, || ());
        assert!(created);
        assert!(fresh.is_alive());
        assert_eq!(table.len(), 1);
        created_total += 1;

        sleep(Duration::from_secs(2)).await;
        assert!(table.is_empty());
        assert!(!first.is_alive());
        assert!(!fresh.is_alive());

        // 破棄されたエントリ一つにつき通知はちょうど一回
        let mut disconnects = 0;
        while let Ok(msg) = rx.try_recv() {
            assert_eq!(
                msg,
                Message::UdpDisconnect {
                    listen_port: 5000,
                    origin_port: 1111
                }
            );
            disconnects += 1;
        }
        assert_eq!(disconnects, created_total);

        let mut opened = 0;
        let mut evicted = 0;
        while let Ok(event) = events.try_recv() {
            match event {
                TunnelEvent::FlowOpened { .. } => opened += 1,
                TunnelEvent::UdpFlowEvicted { .. } => evicted += 1,
                other => panic!("unexpected event: {:?}", other),
            }
        }
        assert_eq!(opened, created_total);
        assert_eq!(evicted, created_total);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_and_clear_report_closed_flows() {
        let (table, _rx) = table(500);
        let mut events = table.events.subscribe();

        table.add_or_refresh(1111, || ());
        table.add_or_refresh(2222, || ());
        table.add_or_refresh(3333, || ());
        assert!(table.disconnect(1111));
        table.clear();
        assert!(table.is_empty());

        let mut closed = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let TunnelEvent::UdpFlowClosed { key } = event {
                closed.push(key.origin_port);
            }
        }
        closed.sort_unstable();
        assert_eq!(closed, vec![1111, 2222, 3333]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_does_not_create() {
        let (table, _rx) = table(500);
        assert!(table.refresh(1111).is_none());
        assert!(table.is_empty());

        table.add_or_refresh(1111, || ());
        sleep(Duration::from_millis(400)).await;
        assert!(table.refresh(1111).is_some());
        sleep(Duration::from_millis(400)).await;
        assert!(table.contains(1111));
    }

    #[tokio::test(start_paused = true)]
    async fn test_explicit_disconnect_does_not_notify() {
        let (table, mut rx) = table(500);

        let (entry, _) = table.add_or_refresh(1111, || ());
        assert!(table.disconnect(1111));
        assert!(!table.disconnect(1111));
        assert!(!entry.is_alive());
        assert!(entry.cancellation().is_cancelled());

        sleep(Duration::from_secs(2)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_readd_after_eviction_is_fresh() {
        let (table, _rx) = table(500);

        let (first, _) = table.add_or_refresh(1111, || ());
        sleep(Duration::from_millis(600)).await;
        assert!(!first.is_alive());

        let (second, created) = table.add_or_refresh(1111, || ());
        assert!(created);
        assert!(second.is_alive());
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(table.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_cancel_stops_timers() {
        let (peer, mut rx) = ChannelPeer::new(8);
        let cancel = CancellationToken::new();
        let table = UdpFlowTable::new(
            5000,
            Duration::from_millis(500),
            Arc::new(peer),
            EventFeed::default(),
            cancel.clone(),
        );

        let (entry, _) = table.add_or_refresh(1111, || ());
        cancel.cancel();
        assert!(entry.cancellation().is_cancelled());

        sleep(Duration::from_secs(1)).await;
        assert!(rx.try_recv().is_err());
    }
}
