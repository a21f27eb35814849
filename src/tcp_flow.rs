// TCPフロー: 一つのソケットとコントロールチャネルの間の双方向中継
//
// 状態遷移: Connecting → Streaming → Disconnecting → Closed
//
// ソケットの読み込みは一つのタスクだけが行い、`TcpData` に連番を付けて送る。
// 受信した `TcpData` は並べ替えキューで順番を揃え、小さな書き込みチャネル経由で
// 一つの書き込み経路からソケットへ書き込まれる。並べ替えキューに残るのは
// 欠番の後ろで待っているフレームだけ。

use bytes::{Bytes, BytesMut};
use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::FlowError;
use crate::events::{EventFeed, FlowStats, TunnelEvent};
use crate::peer::TunnelPeer;
use crate::protocol::{FlowKey, Message};
use crate::reassembly::ReassemblyQueue;

const READ_BUF_SIZE: usize = 16 * 1024;
/// 順番の揃ったフレームのうち、ソケットへの書き込みを待てる数
const WRITE_QUEUE_SIZE: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FlowState {
    Connecting = 0,
    Streaming = 1,
    Disconnecting = 2,
    Closed = 3,
}

impl FlowState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => FlowState::Connecting,
            1 => FlowState::Streaming,
            2 => FlowState::Disconnecting,
            _ => FlowState::Closed,
        }
    }
}

/// フローが閉じた理由
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// ローカルソケットがEOFを返した
    LocalEof,
    /// ローカルソケットのエラーまたは書き込み不足
    LocalError(String),
    /// 宛先への接続に失敗した（クライアント側）
    ConnectFailed(String),
    /// 並べ替えキューへの投入に失敗した
    Protocol(String),
    /// 相手側からの明示的な切断
    Remote,
    /// セッションの終了
    Cancelled,
    /// コントロールチャネルへ送信できなくなった
    ChannelLost,
}

impl CloseReason {
    /// こちら側から切断を始めた場合は相手側へ `TcpDisconnect` を送る
    pub fn notifies_peer(&self) -> bool {
        matches!(
            self,
            CloseReason::LocalEof
                | CloseReason::LocalError(_)
                | CloseReason::ConnectFailed(_)
                | CloseReason::Protocol(_)
        )
    }
}

/// TCPフロー
pub struct TcpFlow {
    key: FlowKey,
    state: AtomicU8,
    bytes_tx: AtomicU64,
    bytes_rx: AtomicU64,
    inbound: ReassemblyQueue,
    // 相手側から切断されると None になり、書き込み側は残りを流してから閉じる
    writes: Mutex<Option<mpsc::Sender<Bytes>>>,
    writes_rx: Mutex<Option<mpsc::Receiver<Bytes>>>,
    fault_raised: Notify,
    fault: Mutex<Option<CloseReason>>,
    cancel: CancellationToken,
    peer: Arc<dyn TunnelPeer>,
    events: EventFeed,
}

impl TcpFlow {
    /// `Connecting` 状態のフローを作成
    pub fn new(
        key: FlowKey,
        peer: Arc<dyn TunnelPeer>,
        events: EventFeed,
        parent: &CancellationToken,
        reassembly_capacity: usize,
    ) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(WRITE_QUEUE_SIZE);
        Arc::new(Self {
            key,
            state: AtomicU8::new(FlowState::Connecting as u8),
            bytes_tx: AtomicU64::new(0),
            bytes_rx: AtomicU64::new(0),
            inbound: ReassemblyQueue::new(0, reassembly_capacity),
            writes: Mutex::new(Some(tx)),
            writes_rx: Mutex::new(Some(rx)),
            fault_raised: Notify::new(),
            fault: Mutex::new(None),
            cancel: parent.child_token(),
            peer,
            events,
        })
    }

    pub fn key(&self) -> FlowKey {
        self.key
    }

    pub fn state(&self) -> FlowState {
        FlowState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn stats(&self) -> FlowStats {
        FlowStats {
            bytes_tx: self.bytes_tx.load(Ordering::Relaxed),
            bytes_rx: self.bytes_rx.load(Ordering::Relaxed),
        }
    }

    /// 相手側から受け取ったフレームを書き込み待ちに追加
    ///
    /// 順番の揃ったフレームは書き込みチャネルに空きができるまで待つ。
    /// 上限に数えるのは欠番待ちのフレームだけ。
    /// 直前に書き込んだフレームの再送は黙って捨てる。
    /// エラーの場合、呼び出し側は `abort` でフローを閉じること。
    /// 一つのフローに対して同時に呼んではいけない。
    pub async fn deliver(&self, seq: u64, data: Bytes) -> Result<(), FlowError> {
        if self.inbound.was_last_released(seq) {
            debug!("TCP flow {}: dropping late duplicate frame {}", self.key, seq);
            return Ok(());
        }
        let tx = match self.writer() {
            Some(tx) => tx,
            None => {
                debug!("TCP flow {}: frame {} after disconnect, dropped", self.key, seq);
                return Ok(());
            }
        };
        self.inbound.enqueue(seq, data)?;
        while let Some(chunk) = self.inbound.try_dequeue() {
            tokio::select! {
                sent = tx.send(chunk) => {
                    if sent.is_err() {
                        return Ok(());
                    }
                }
                _ = self.cancel.cancelled() => return Ok(()),
            }
        }
        Ok(())
    }

    fn writer(&self) -> Option<mpsc::Sender<Bytes>> {
        self.writes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// 新しい接続が同じ接続元ポートを再利用しているか
    pub fn has_consumed_frames(&self) -> bool {
        self.inbound.has_released()
    }

    /// 相手側からの切断。書き込み待ちのデータを流してから閉じる
    pub fn close_by_peer(&self) {
        self.writes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }

    /// プロトコル違反などでフローを破棄し、相手側にも切断を通知する
    pub fn abort(&self, reason: CloseReason) {
        *self.fault.lock().unwrap_or_else(PoisonError::into_inner) = Some(reason);
        self.fault_raised.notify_one();
    }

    /// 相手側への通知なしで即座に閉じる
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// ローカルソケットへ書き込み、書き込んだバイト数を返す
    ///
    /// 全て書き込めなかった場合はエラーになる。
    pub async fn send<W>(&self, writer: &mut W, payload: &[u8]) -> Result<usize, FlowError>
    where
        W: AsyncWrite + Unpin,
    {
        let mut written = 0;
        while written < payload.len() {
            match writer.write(&payload[written..]).await? {
                0 => {
                    return Err(FlowError::ShortWrite {
                        written,
                        expected: payload.len(),
                    })
                }
                n => written += n,
            }
        }
        self.bytes_tx.fetch_add(written as u64, Ordering::Relaxed);
        Ok(written)
    }

    /// 宛先へ接続してからフローを駆動する（クライアント側）
    pub async fn connect_and_drive(
        self: Arc<Self>,
        addr: SocketAddr,
        connect_timeout: Duration,
        flows: TcpFlows,
    ) {
        let connected = tokio::select! {
            _ = self.cancel.cancelled() => Err(CloseReason::Cancelled),
            result = tokio::time::timeout(connect_timeout, TcpStream::connect(addr)) => match result {
                Ok(Ok(stream)) => Ok(stream),
                Ok(Err(e)) => Err(CloseReason::ConnectFailed(e.to_string())),
                Err(_) => Err(CloseReason::ConnectFailed(format!(
                    "timed out after {:?}",
                    connect_timeout
                ))),
            },
        };

        match connected {
            Ok(stream) => self.drive(stream, flows).await,
            Err(reason) => {
                warn!("TCP flow {}: failed to connect to {}: {:?}", self.key, addr, reason);
                self.finish(reason, &flows).await;
            }
        }
    }

    /// 接続済みソケットでフローを駆動し、終了処理まで行う
    pub async fn drive(self: Arc<Self>, stream: TcpStream, flows: TcpFlows) {
        let reason = self.run(stream).await;
        self.finish(reason, &flows).await;
    }

    async fn run(&self, stream: TcpStream) -> CloseReason {
        if self
            .state
            .compare_exchange(
                FlowState::Connecting as u8,
                FlowState::Streaming as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return CloseReason::Cancelled;
        }
        let writes = self
            .writes_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let writes = match writes {
            Some(rx) => rx,
            None => return CloseReason::Cancelled,
        };
        self.events.emit(TunnelEvent::FlowOpened { key: self.key });

        let _ = stream.set_nodelay(true);
        let (rd, wr) = stream.into_split();

        tokio::select! {
            reason = self.read_loop(rd) => reason,
            reason = self.write_loop(wr, writes) => reason,
            _ = self.cancel.cancelled() => CloseReason::Cancelled,
        }
    }

    async fn read_loop(&self, mut rd: OwnedReadHalf) -> CloseReason {
        let mut buf = BytesMut::with_capacity(READ_BUF_SIZE);
        let mut seq = 0u64;
        loop {
            buf.reserve(READ_BUF_SIZE);
            match rd.read_buf(&mut buf).await {
                Ok(0) => return CloseReason::LocalEof,
                Ok(n) => {
                    self.bytes_rx.fetch_add(n as u64, Ordering::Relaxed);
                    let msg = Message::TcpData {
                        listen_port: self.key.listen_port,
                        origin_port: self.key.origin_port,
                        seq,
                        data: buf.split().freeze(),
                    };
                    if self.peer.send(msg).await.is_err() {
                        return CloseReason::ChannelLost;
                    }
                    seq += 1;
                }
                Err(e) => return CloseReason::LocalError(e.to_string()),
            }
        }
    }

    async fn write_loop(
        &self,
        mut wr: OwnedWriteHalf,
        mut writes: mpsc::Receiver<Bytes>,
    ) -> CloseReason {
        loop {
            if let Some(reason) = self.take_fault() {
                return reason;
            }
            tokio::select! {
                chunk = writes.recv() => match chunk {
                    Some(chunk) => {
                        if let Err(e) = self.send(&mut wr, &chunk).await {
                            return CloseReason::LocalError(e.to_string());
                        }
                    }
                    None => {
                        let _ = wr.shutdown().await;
                        return CloseReason::Remote;
                    }
                },
                _ = self.fault_raised.notified() => {}
            }
        }
    }

    fn take_fault(&self) -> Option<CloseReason> {
        self.fault
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// Disconnecting への遷移は一度だけ成功する
    fn begin_disconnect(&self) -> bool {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            if current >= FlowState::Disconnecting as u8 {
                return false;
            }
            match self.state.compare_exchange(
                current,
                FlowState::Disconnecting as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    async fn finish(&self, reason: CloseReason, flows: &TcpFlows) {
        if !self.begin_disconnect() {
            return;
        }
        self.cancel.cancel();
        self.close_by_peer();
        self.writes_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        if reason.notifies_peer() {
            let _ = self
                .peer
                .send(Message::TcpDisconnect {
                    listen_port: self.key.listen_port,
                    origin_port: self.key.origin_port,
                })
                .await;
        }

        flows.remove(self);
        self.state
            .store(FlowState::Closed as u8, Ordering::Release);

        let stats = self.stats();
        debug!(
            "TCP flow {} closed ({:?}): {} bytes to socket, {} bytes from socket",
            self.key, reason, stats.bytes_tx, stats.bytes_rx
        );
        self.events.emit(TunnelEvent::FlowClosed {
            key: self.key,
            stats,
        });
    }
}

/// セッションが持つTCPフローの表
#[derive(Clone, Default)]
pub struct TcpFlows {
    inner: Arc<DashMap<FlowKey, Arc<TcpFlow>>>,
}

impl TcpFlows {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &FlowKey) -> Option<Arc<TcpFlow>> {
        self.inner.get(key).map(|f| f.value().clone())
    }

    /// フローを登録。同じキーの古いフローがあれば取り除いて返す
    pub fn insert(&self, flow: Arc<TcpFlow>) -> Option<Arc<TcpFlow>> {
        self.inner.insert(flow.key, flow)
    }

    fn remove(&self, flow: &TcpFlow) {
        self.inner
            .remove_if(&flow.key, |_, current| std::ptr::eq(current.as_ref(), flow));
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn stats(&self) -> Vec<(FlowKey, FlowStats)> {
        self.inner
            .iter()
            .map(|f| (*f.key(), f.value().stats()))
            .collect()
    }

    /// 全フローを通知なしで閉じる
    pub fn cancel_all(&self) {
        for flow in self.inner.iter() {
            flow.cancel();
        }
    }
}
