use bytes::Bytes;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, UdpSocket};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::FlowConfig;
use crate::error::{FlowError, PeerClosed};
use crate::events::EventFeed;
use crate::peer::TunnelPeer;
use crate::pending::{Awaited, PendingRequests};
use crate::protocol::{FlowKey, Message, Protocol, MAX_DATAGRAM_SIZE};
use crate::tcp_flow::{TcpFlow, TcpFlows};
use crate::udp_flow::{UdpFlowEntry, UdpFlowTable};

const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// リスナーが必要とするセッション側の依存
#[derive(Clone)]
pub struct ListenerContext {
    pub peer: Arc<dyn TunnelPeer>,
    pub events: EventFeed,
    /// セッションのキャンセルスコープ
    pub cancel: CancellationToken,
    pub flow: FlowConfig,
}

/// 待ち受けポート（TCPまたはUDP）
pub enum PortListener {
    Tcp(TcpPortListener),
    Udp(Arc<UdpPortListener>),
}

impl PortListener {
    pub fn protocol(&self) -> Protocol {
        match self {
            PortListener::Tcp(_) => Protocol::Tcp,
            PortListener::Udp(_) => Protocol::Udp,
        }
    }

    pub fn port(&self) -> u16 {
        match self {
            PortListener::Tcp(l) => l.port(),
            PortListener::Udp(l) => l.port(),
        }
    }

    pub fn local_addr(&self) -> SocketAddr {
        match self {
            PortListener::Tcp(l) => l.local_addr(),
            PortListener::Udp(l) => l.local_addr(),
        }
    }

    pub fn close(&self) {
        match self {
            PortListener::Tcp(l) => l.close(),
            PortListener::Udp(l) => l.close(),
        }
    }
}

/// TCPの待ち受けポート。接続ごとに `TcpFlow` を作る
pub struct TcpPortListener {
    port: u16,
    local_addr: SocketAddr,
    cancel: CancellationToken,
}

impl TcpPortListener {
    pub async fn bind(
        host: IpAddr,
        port: u16,
        flows: TcpFlows,
        ctx: ListenerContext,
    ) -> io::Result<Self> {
        let listener = TcpListener::bind((host, port)).await?;
        let local_addr = listener.local_addr()?;
        let port = local_addr.port();
        let cancel = ctx.cancel.child_token();

        info!("Listening on tcp {}", local_addr);
        tokio::spawn(accept_loop(listener, port, flows, ctx, cancel.clone()));

        Ok(Self {
            port,
            local_addr,
            cancel,
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn close(&self) {
        self.cancel.cancel();
    }
}

impl Drop for TcpPortListener {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn accept_loop(
    listener: TcpListener,
    port: u16,
    flows: TcpFlows,
    ctx: ListenerContext,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            result = listener.accept() => {
                match result {
                    Ok((stream, addr)) => {
                        let key = FlowKey::tcp(port, addr.port());
                        debug!("Visitor {} connected ({})", addr, key);

                        let flow = TcpFlow::new(
                            key,
                            ctx.peer.clone(),
                            ctx.events.clone(),
                            &cancel,
                            ctx.flow.reassembly_capacity,
                        );
                        // 同じ接続元ポートの古いフローは新しい接続で置き換える
                        if let Some(old) = flows.insert(flow.clone()) {
                            warn!("Origin port reused for {}, dropping previous flow", key);
                            old.cancel();
                        }
                        tokio::spawn(flow.drive(stream, flows.clone()));
                    }
                    Err(e) => {
                        // 一つの接続の失敗でループを止めない
                        error!("Failed to accept visitor on port {}: {}", port, e);
                        tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                    }
                }
            }
        }
    }
    info!("Listener for tcp port {} stopped", port);
}

/// UDPの待ち受けポート
///
/// 受信したデータグラムごとに接続元を `UdpFlowTable` に登録し、
/// `UdpData` として相手側へ中継する。
pub struct UdpPortListener {
    port: u16,
    local_addr: SocketAddr,
    socket: UdpSocket,
    table: UdpFlowTable<SocketAddr>,
    pending: PendingRequests,
    peer: Arc<dyn TunnelPeer>,
    flow: FlowConfig,
    cancel: CancellationToken,
}

impl UdpPortListener {
    pub async fn bind(host: IpAddr, port: u16, ctx: ListenerContext) -> io::Result<Arc<Self>> {
        let socket = UdpSocket::bind((host, port)).await?;
        let local_addr = socket.local_addr()?;
        let port = local_addr.port();
        let cancel = ctx.cancel.child_token();

        let table = UdpFlowTable::new(
            port,
            ctx.flow.udp_idle_timeout(),
            ctx.peer.clone(),
            ctx.events.clone(),
            cancel.clone(),
        );

        let listener = Arc::new(Self {
            port,
            local_addr,
            socket,
            table,
            pending: PendingRequests::new(),
            peer: ctx.peer,
            flow: ctx.flow,
            cancel,
        });

        info!("Listening on udp {}", local_addr);
        tokio::spawn(listener.clone().recv_loop());

        Ok(listener)
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn flows(&self) -> &UdpFlowTable<SocketAddr> {
        &self.table
    }

    pub fn pending_requests(&self) -> usize {
        self.pending.count()
    }

    pub fn close(&self) {
        self.cancel.cancel();
        self.table.clear();
        self.pending.cancel_all();
    }

    async fn recv_loop(self: Arc<Self>) {
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        loop {
            let (n, origin) = tokio::select! {
                _ = self.cancel.cancelled() => break,
                result = self.socket.recv_from(&mut buf) => match result {
                    Ok(received) => received,
                    Err(e) => {
                        // ICMP由来のエラーなどで受信ループを止めない
                        debug!("UDP receive error on port {}: {}", self.port, e);
                        continue;
                    }
                },
            };

            let (entry, _) = self.table.add_or_refresh(origin.port(), || origin);
            if *entry.resource() != origin {
                debug!(
                    "UDP origin port {} shared by {} and {}; replies go to the first",
                    origin.port(),
                    entry.resource(),
                    origin
                );
            }

            let data = Bytes::copy_from_slice(&buf[..n]);
            if self.relay(origin.port(), data).await.is_err() {
                debug!("Control channel closed, stopping udp port {}", self.port);
                break;
            }
        }
        self.close();
        info!("Listener for udp port {} stopped", self.port);
    }

    async fn relay(self: &Arc<Self>, origin_port: u16, data: Bytes) -> Result<(), PeerClosed> {
        if self.flow.udp_fire_and_forget {
            return self
                .peer
                .send(Message::UdpData {
                    listen_port: self.port,
                    origin_port,
                    data,
                    fire_and_forget: true,
                    request_id: None,
                })
                .await;
        }

        let (id, rx) = self.pending.register();
        let sent = self
            .peer
            .send(Message::UdpData {
                listen_port: self.port,
                origin_port,
                data,
                fire_and_forget: false,
                request_id: Some(id),
            })
            .await;
        if let Err(e) = sent {
            self.pending.cancel(id);
            return Err(e);
        }

        // リクエストごとに応答待ちタスクを一つ
        let this = self.clone();
        tokio::spawn(async move {
            let awaited = tokio::select! {
                _ = this.cancel.cancelled() => Awaited::Cancelled,
                awaited = this.pending.wait(id, rx, this.flow.udp_request_timeout()) => awaited,
            };
            let key = FlowKey::udp(this.port, origin_port);
            match awaited {
                Awaited::Response(payload) => {
                    if let Err(e) = this.send_response(origin_port, payload).await {
                        debug!("Dropping response for {}: {}", key, e);
                    }
                }
                Awaited::TimedOut => debug!("UDP request {} for {} timed out", id, key),
                Awaited::Cancelled => {}
            }
        });

        Ok(())
    }

    /// 相手側から届いた応答を処理
    ///
    /// 待機中のリクエストがあればそちらへ渡し、なければ直接送り返す。
    pub async fn deliver_response(
        &self,
        origin_port: u16,
        data: Bytes,
        request_id: Option<u64>,
    ) -> Result<(), FlowError> {
        let data = match request_id {
            Some(id) => match self.pending.respond(id, data) {
                Ok(()) => return Ok(()),
                Err(data) => data,
            },
            None => data,
        };
        self.send_response(origin_port, data).await.map(|_| ())
    }

    /// 接続元へ応答を送信
    ///
    /// エントリがなければ作らずに `FlowNotBound` を返し、相手側にも切断を通知する。
    pub async fn send_response(&self, origin_port: u16, payload: Bytes) -> Result<usize, FlowError> {
        let key = FlowKey::udp(self.port, origin_port);
        let entry = match self.table.refresh(origin_port) {
            Some(entry) => entry,
            None => {
                let _ = self
                    .peer
                    .send(Message::UdpDisconnect {
                        listen_port: self.port,
                        origin_port,
                    })
                    .await;
                return Err(FlowError::FlowNotBound(key));
            }
        };

        self.send_to_entry(&entry, &payload).await
    }

    async fn send_to_entry(
        &self,
        entry: &UdpFlowEntry<SocketAddr>,
        payload: &[u8],
    ) -> Result<usize, FlowError> {
        // 並行して切断されたエントリには送らない
        if !entry.is_alive() {
            return Err(FlowError::FlowNotBound(FlowKey::udp(
                self.port,
                entry.origin_port(),
            )));
        }
        let n = self.socket.send_to(payload, *entry.resource()).await?;
        Ok(n)
    }

    /// 相手側からの明示的な切断
    pub fn disconnect(&self, origin_port: u16) -> bool {
        self.table.disconnect(origin_port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::ChannelPeer;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;
    use tokio::sync::mpsc;

    const LOCALHOST: IpAddr = IpAddr::V4(std::net::Ipv4Addr::LOCALHOST);

    fn context(flow: FlowConfig) -> (ListenerContext, mpsc::Receiver<Message>) {
        let (peer, rx) = ChannelPeer::new(64);
        let ctx = ListenerContext {
            peer: Arc::new(peer),
            events: EventFeed::default(),
            cancel: CancellationToken::new(),
            flow,
        };
        (ctx, rx)
    }

    #[tokio::test]
    async fn test_tcp_accept_creates_flow_keyed_by_origin_port() {
        let (ctx, mut rx) = context(FlowConfig::default());
        let flows = TcpFlows::new();
        let listener = TcpPortListener::bind(LOCALHOST, 0, flows.clone(), ctx)
            .await
            .unwrap();

        let mut visitor = TcpStream::connect(listener.local_addr()).await.unwrap();
        let origin_port = visitor.local_addr().unwrap().port();
        visitor.write_all(b"ping").await.unwrap();

        match rx.recv().await {
            Some(Message::TcpData {
                origin_port: got,
                seq: 0,
                data,
                ..
            }) => {
                assert_eq!(got, origin_port);
                assert_eq!(&data[..], b"ping");
            }
            other => panic!("unexpected message: {:?}", other),
        }
        assert_eq!(flows.len(), 1);

        // 相手側の応答がソケットに書き込まれる
        let key = flows.stats()[0].0;
        flows
            .get(&key)
            .unwrap()
            .deliver(0, Bytes::from_static(b"pong"))
            .await
            .unwrap();
        let mut buf = [0u8; 4];
        visitor.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");
    }

    #[tokio::test]
    async fn test_tcp_listener_close_stops_accepting() {
        let (ctx, _rx) = context(FlowConfig::default());
        let listener = TcpPortListener::bind(LOCALHOST, 0, TcpFlows::new(), ctx)
            .await
            .unwrap();
        let addr = listener.local_addr();
        listener.close();

        // リスナーソケットが閉じられるまで待つ
        let mut refused = false;
        for _ in 0..50 {
            if TcpStream::connect(addr).await.is_err() {
                refused = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(refused);
    }

    #[tokio::test]
    async fn test_udp_request_response_roundtrip() {
        let (ctx, mut rx) = context(FlowConfig::default());
        let listener = UdpPortListener::bind(LOCALHOST, 0, ctx).await.unwrap();

        let origin = UdpSocket::bind((LOCALHOST, 0)).await.unwrap();
        origin
            .send_to(b"query", listener.local_addr())
            .await
            .unwrap();

        let (origin_port, request_id) = match rx.recv().await {
            Some(Message::UdpData {
                origin_port,
                data,
                fire_and_forget,
                request_id,
                ..
            }) => {
                assert_eq!(&data[..], b"query");
                assert!(!fire_and_forget);
                (origin_port, request_id)
            }
            other => panic!("unexpected message: {:?}", other),
        };
        assert!(request_id.is_some());
        assert_eq!(listener.flows().len(), 1);

        listener
            .deliver_response(origin_port, Bytes::from_static(b"answer"), request_id)
            .await
            .unwrap();

        let mut buf = [0u8; 64];
        let (n, from) = origin.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"answer");
        assert_eq!(from, listener.local_addr());
    }

    #[tokio::test]
    async fn test_udp_fire_and_forget_has_no_correlation() {
        let flow = FlowConfig {
            udp_fire_and_forget: true,
            ..FlowConfig::default()
        };
        let (ctx, mut rx) = context(flow);
        let listener = UdpPortListener::bind(LOCALHOST, 0, ctx).await.unwrap();

        let origin = UdpSocket::bind((LOCALHOST, 0)).await.unwrap();
        origin.send_to(b"log line", listener.local_addr()).await.unwrap();

        match rx.recv().await {
            Some(Message::UdpData {
                fire_and_forget,
                request_id,
                ..
            }) => {
                assert!(fire_and_forget);
                assert_eq!(request_id, None);
            }
            other => panic!("unexpected message: {:?}", other),
        }
        assert_eq!(listener.pending_requests(), 0);
    }

    #[tokio::test]
    async fn test_udp_response_for_unknown_origin_is_not_bound() {
        let (ctx, mut rx) = context(FlowConfig::default());
        let listener = UdpPortListener::bind(LOCALHOST, 0, ctx).await.unwrap();

        let err = listener
            .send_response(40000, Bytes::from_static(b"orphan"))
            .await
            .unwrap_err();
        assert!(matches!(err, FlowError::FlowNotBound(key) if key.origin_port == 40000));
        assert!(listener.flows().is_empty());
        assert_eq!(
            rx.recv().await,
            Some(Message::UdpDisconnect {
                listen_port: listener.port(),
                origin_port: 40000
            })
        );
    }

    #[tokio::test]
    async fn test_udp_disconnected_entry_is_not_sent_to() {
        let (ctx, mut rx) = context(FlowConfig::default());
        let listener = UdpPortListener::bind(LOCALHOST, 0, ctx).await.unwrap();

        let origin = UdpSocket::bind((LOCALHOST, 0)).await.unwrap();
        origin.send_to(b"ping", listener.local_addr()).await.unwrap();
        let origin_port = match rx.recv().await {
            Some(Message::UdpData { origin_port, .. }) => origin_port,
            other => panic!("unexpected message: {:?}", other),
        };

        // 応答の送信中に切断された場合と同じ状態を作る
        let entry = listener.flows().get(origin_port).unwrap();
        assert!(listener.disconnect(origin_port));
        let err = listener
            .send_to_entry(&entry, b"late")
            .await
            .unwrap_err();
        assert!(matches!(err, FlowError::FlowNotBound(key) if key.origin_port == origin_port));

        let mut buf = [0u8; 16];
        assert!(
            tokio::time::timeout(Duration::from_millis(100), origin.recv_from(&mut buf))
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_udp_request_timeout_removes_waiter() {
        let flow = FlowConfig {
            udp_request_timeout_ms: 50,
            ..FlowConfig::default()
        };
        let (ctx, mut rx) = context(flow);
        let listener = UdpPortListener::bind(LOCALHOST, 0, ctx).await.unwrap();

        let origin = UdpSocket::bind((LOCALHOST, 0)).await.unwrap();
        origin.send_to(b"query", listener.local_addr()).await.unwrap();
        assert!(matches!(rx.recv().await, Some(Message::UdpData { .. })));
        assert_eq!(listener.pending_requests(), 1);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(listener.pending_requests(), 0);
    }
}
