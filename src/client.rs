use anyhow::{Context, Result};
use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use bytes::Bytes;
use dashmap::DashMap;
use std::collections::VecDeque;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::{broadcast, oneshot};
use tokio::time::{timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{ClientConfig, FlowConfig};
use crate::error::FlowError;
use crate::events::EventFeed;
use crate::peer::{pump_outbound, ChannelPeer, TunnelPeer, OUTBOUND_QUEUE_SIZE};
use crate::protocol::{configure_control_stream, FlowKey, Message, MAX_DATAGRAM_SIZE};
use crate::tcp_flow::{CloseReason, TcpFlow, TcpFlows};
use crate::udp_flow::{UdpFlowEntry, UdpFlowTable};

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const INITIAL_RETRY_INTERVAL: Duration = Duration::from_millis(500);
/// 一つのUDPフローで応答待ちとして覚えておくリクエストIDの上限
const MAX_OUTSTANDING_REQUESTS: usize = 1024;

/// サーバーから割り当てられたセッション
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Granted {
    pub session_id: u64,
    pub tcp_ports: Vec<u16>,
    pub udp_ports: Vec<u16>,
}

/// 最初のハンドシェイクの結果（拒否された場合はサーバーのメッセージ）
pub type FirstHandshake = oneshot::Sender<Result<Granted, String>>;

/// クライアント側のUDPフロー: 接続元ごとに宛先へ接続したソケットを持つ
///
/// 応答待ちのリクエストIDは、サーバー側が待つのをやめた時点（`request_timeout`）で
/// 捨てる。一方向のトラフィックでも `MAX_OUTSTANDING_REQUESTS` を超えては溜まらない。
pub struct ClientUdpFlow {
    socket: Arc<UdpSocket>,
    request_timeout: Duration,
    /// 応答待ちのリクエストIDと受信時刻（古い順）
    requests: Mutex<VecDeque<(u64, Instant)>>,
}

impl ClientUdpFlow {
    fn new(socket: Arc<UdpSocket>, request_timeout: Duration) -> Self {
        Self {
            socket,
            request_timeout,
            requests: Mutex::new(VecDeque::new()),
        }
    }

    fn push_request(&self, id: u64) {
        let now = Instant::now();
        let mut requests = self.requests.lock().unwrap_or_else(PoisonError::into_inner);
        self.drop_expired(&mut requests, now);
        if requests.len() >= MAX_OUTSTANDING_REQUESTS {
            requests.pop_front();
        }
        requests.push_back((id, now));
    }

    fn pop_request(&self) -> Option<u64> {
        let mut requests = self.requests.lock().unwrap_or_else(PoisonError::into_inner);
        self.drop_expired(&mut requests, Instant::now());
        requests.pop_front().map(|(id, _)| id)
    }

    fn drop_expired(&self, requests: &mut VecDeque<(u64, Instant)>, now: Instant) {
        while let Some(&(_, received)) = requests.front() {
            if now.saturating_duration_since(received) < self.request_timeout {
                break;
            }
            requests.pop_front();
        }
    }

    /// 応答待ちのリクエスト数
    pub fn outstanding_requests(&self) -> usize {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

/// クライアント側のフロー管理
///
/// サーバーから届いたメッセージに応じて宛先への接続やソケットを作り、
/// 宛先からの応答を同じフローとして送り返す。
pub struct ClientTunnel {
    local_host: IpAddr,
    flow: FlowConfig,
    peer: Arc<dyn TunnelPeer>,
    events: EventFeed,
    tcp: TcpFlows,
    udp: DashMap<u16, Arc<UdpFlowTable<ClientUdpFlow>>>,
    cancel: CancellationToken,
}

impl ClientTunnel {
    pub fn new(
        local_host: IpAddr,
        flow: FlowConfig,
        peer: Arc<dyn TunnelPeer>,
        events: EventFeed,
        parent: &CancellationToken,
    ) -> Self {
        Self {
            local_host,
            flow,
            peer,
            events,
            tcp: TcpFlows::new(),
            udp: DashMap::new(),
            cancel: parent.child_token(),
        }
    }

    pub fn tcp_flows(&self) -> &TcpFlows {
        &self.tcp
    }

    /// UDPフローの数（全待ち受けポート合計）
    pub fn udp_flow_count(&self) -> usize {
        self.udp.iter().map(|t| t.value().len()).sum()
    }

    pub async fn dispatch(&self, msg: Message) -> Result<(), FlowError> {
        match msg {
            Message::TcpData {
                listen_port,
                origin_port,
                seq,
                data,
            } => self.on_tcp_data(listen_port, origin_port, seq, data).await,
            Message::TcpDisconnect {
                listen_port,
                origin_port,
            } => {
                let key = FlowKey::tcp(listen_port, origin_port);
                let flow = self.tcp.get(&key).ok_or(FlowError::FlowNotBound(key))?;
                flow.close_by_peer();
                Ok(())
            }
            Message::UdpData {
                listen_port,
                origin_port,
                data,
                fire_and_forget,
                request_id,
            } => {
                self.on_udp_data(listen_port, origin_port, data, fire_and_forget, request_id)
                    .await
            }
            Message::UdpDisconnect {
                listen_port,
                origin_port,
            } => {
                let removed = self
                    .udp
                    .get(&listen_port)
                    .map(|table| table.disconnect(origin_port))
                    .unwrap_or(false);
                if removed {
                    Ok(())
                } else {
                    Err(FlowError::FlowNotBound(FlowKey::udp(listen_port, origin_port)))
                }
            }
            Message::Heartbeat => Ok(()),
            other => {
                warn!("Unexpected message: {:?}", other);
                Ok(())
            }
        }
    }

    async fn on_tcp_data(
        &self,
        listen_port: u16,
        origin_port: u16,
        seq: u64,
        data: Bytes,
    ) -> Result<(), FlowError> {
        let key = FlowKey::tcp(listen_port, origin_port);
        let flow = match self.tcp.get(&key) {
            // seq 0 が再び届いたら、接続元ポートを再利用した新しい接続
            Some(flow) if !(seq == 0 && flow.has_consumed_frames()) => flow,
            existing => {
                if seq != 0 {
                    let _ = self
                        .peer
                        .send(Message::TcpDisconnect {
                            listen_port,
                            origin_port,
                        })
                        .await;
                    return Err(FlowError::FlowNotBound(key));
                }
                if let Some(old) = existing {
                    debug!("Origin port reused for {}, replacing flow", key);
                    old.cancel();
                }
                self.open_tcp_flow(key)
            }
        };

        if let Err(e) = flow.deliver(seq, data).await {
            warn!("TCP flow {}: {}, closing", key, e);
            flow.abort(CloseReason::Protocol(e.to_string()));
            return Err(e);
        }
        Ok(())
    }

    fn open_tcp_flow(&self, key: FlowKey) -> Arc<TcpFlow> {
        let flow = TcpFlow::new(
            key,
            self.peer.clone(),
            self.events.clone(),
            &self.cancel,
            self.flow.reassembly_capacity,
        );
        if let Some(old) = self.tcp.insert(flow.clone()) {
            old.cancel();
        }

        let addr = SocketAddr::new(self.local_host, key.listen_port);
        debug!("TCP flow {}: connecting to {}", key, addr);
        tokio::spawn(flow.clone().connect_and_drive(
            addr,
            self.flow.connect_timeout(),
            self.tcp.clone(),
        ));
        flow
    }

    async fn on_udp_data(
        &self,
        listen_port: u16,
        origin_port: u16,
        data: Bytes,
        fire_and_forget: bool,
        request_id: Option<u64>,
    ) -> Result<(), FlowError> {
        let table = self.udp_table(listen_port);
        let entry = match table.refresh(origin_port) {
            Some(entry) => entry,
            None => self.open_udp_flow(&table, origin_port).await?,
        };

        if !fire_and_forget {
            if let Some(id) = request_id {
                entry.resource().push_request(id);
            }
        }

        let socket = &entry.resource().socket;
        let n = socket.send(&data).await?;
        if n != data.len() {
            return Err(FlowError::ShortWrite {
                written: n,
                expected: data.len(),
            });
        }
        Ok(())
    }

    fn udp_table(&self, listen_port: u16) -> Arc<UdpFlowTable<ClientUdpFlow>> {
        self.udp
            .entry(listen_port)
            .or_insert_with(|| {
                Arc::new(UdpFlowTable::new(
                    listen_port,
                    self.flow.udp_idle_timeout(),
                    self.peer.clone(),
                    self.events.clone(),
                    self.cancel.child_token(),
                ))
            })
            .clone()
    }

    async fn open_udp_flow(
        &self,
        table: &Arc<UdpFlowTable<ClientUdpFlow>>,
        origin_port: u16,
    ) -> Result<Arc<UdpFlowEntry<ClientUdpFlow>>, FlowError> {
        let bind_addr: IpAddr = match self.local_host {
            IpAddr::V4(_) => Ipv4Addr::UNSPECIFIED.into(),
            IpAddr::V6(_) => Ipv6Addr::UNSPECIFIED.into(),
        };
        let socket = UdpSocket::bind((bind_addr, 0)).await?;
        socket
            .connect((self.local_host, table.listen_port()))
            .await?;
        let socket = Arc::new(socket);

        let request_timeout = self.flow.udp_request_timeout();
        let (entry, created) = table.add_or_refresh(origin_port, || {
            ClientUdpFlow::new(socket.clone(), request_timeout)
        });
        if created {
            tokio::spawn(udp_reply_loop(
                table.listen_port(),
                entry.clone(),
                table.clone(),
                self.peer.clone(),
            ));
        }
        Ok(entry)
    }

    /// 全フローを通知なしで閉じる
    pub fn close(&self) {
        self.cancel.cancel();
        self.tcp.cancel_all();
        for table in self.udp.iter() {
            table.clear();
        }
    }
}

impl Drop for ClientTunnel {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// 宛先からの応答をサーバーへ送り返す
async fn udp_reply_loop(
    listen_port: u16,
    entry: Arc<UdpFlowEntry<ClientUdpFlow>>,
    table: Arc<UdpFlowTable<ClientUdpFlow>>,
    peer: Arc<dyn TunnelPeer>,
) {
    let origin_port = entry.origin_port();
    let socket = entry.resource().socket.clone();
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
    loop {
        let n = tokio::select! {
            _ = entry.cancellation().cancelled() => break,
            result = socket.recv(&mut buf) => match result {
                Ok(n) => n,
                Err(e) => {
                    debug!("UDP flow {}: {}", FlowKey::udp(listen_port, origin_port), e);
                    continue;
                }
            },
        };

        table.refresh(origin_port);
        let request_id = entry.resource().pop_request();
        let sent = peer
            .send(Message::UdpData {
                listen_port,
                origin_port,
                data: Bytes::copy_from_slice(&buf[..n]),
                fire_and_forget: false,
                request_id,
            })
            .await;
        if sent.is_err() {
            break;
        }
    }
}

/// ハンドシェイクを行い、割り当てを受け取る
async fn handshake(config: &ClientConfig) -> Result<(TcpStream, Granted)> {
    debug!("Connecting to server: {}", config.remote_addr);
    let mut stream = TcpStream::connect(&config.remote_addr)
        .await
        .with_context(|| format!("Failed to connect to {}", config.remote_addr))?;
    if let Err(e) = configure_control_stream(&stream, config.heartbeat_interval()) {
        warn!("Failed to configure control channel: {}", e);
    }

    Message::Connect {
        tcp: config.tcp.to_string(),
        udp: config.udp.to_string(),
        client_id: config.client_id.clone(),
    }
    .write_to(&mut stream)
    .await
    .context("Failed to send Connect")?;

    let response = timeout(HANDSHAKE_TIMEOUT, Message::read_from(&mut stream))
        .await
        .context("Timeout waiting for Connected")??;

    match response {
        Message::Connected {
            session_id,
            tcp_ports,
            udp_ports,
        } => Ok((
            stream,
            Granted {
                session_id,
                tcp_ports,
                udp_ports,
            },
        )),
        Message::Errors { message } => Err(Rejected(message).into()),
        other => anyhow::bail!("Unexpected response from server: {:?}", other),
    }
}

/// サーバーによる受け入れ拒否
#[derive(Debug, thiserror::Error)]
#[error("server rejected the tunnel: {0}")]
pub struct Rejected(pub String);

/// 確立済みのコントロールチャネルを処理
async fn serve(
    stream: TcpStream,
    config: &ClientConfig,
    events: &EventFeed,
    cancel: &CancellationToken,
) -> Result<()> {
    let (peer, mut outbound) = ChannelPeer::new(OUTBOUND_QUEUE_SIZE);
    let tunnel = ClientTunnel::new(
        config.local_host,
        config.flow.clone(),
        Arc::new(peer),
        events.clone(),
        cancel,
    );

    let (mut rd, mut wr) = stream.into_split();
    let result = tokio::select! {
        r = read_loop(&mut rd, &tunnel, config.heartbeat_timeout()) => r,
        r = pump_outbound(&mut wr, &mut outbound, config.heartbeat_interval()) => r,
    };

    // 切断したらクライアント側のフローもすべて閉じる
    tunnel.close();
    result
}

async fn read_loop(
    rd: &mut OwnedReadHalf,
    tunnel: &ClientTunnel,
    heartbeat_timeout: Duration,
) -> Result<()> {
    loop {
        let msg = timeout(heartbeat_timeout, Message::read_from(rd))
            .await
            .context("Heartbeat timeout")??;
        if let Err(e) = tunnel.dispatch(msg).await {
            debug!("{}", e);
        }
    }
}

/// クライアントを実行（メインループ）
///
/// 切断されたら指数バックオフで再接続し、同じ `Connect` を送り直す。
/// `first` には最初のハンドシェイクの結果を一度だけ送る。
pub async fn run_client(
    config: ClientConfig,
    mut shutdown_rx: broadcast::Receiver<()>,
    events: EventFeed,
    mut first: Option<FirstHandshake>,
) -> Result<()> {
    config.validate()?;
    let cancel = CancellationToken::new();
    let mut backoff = ExponentialBackoff {
        initial_interval: INITIAL_RETRY_INTERVAL,
        max_interval: config.retry_interval().max(INITIAL_RETRY_INTERVAL),
        max_elapsed_time: None,
        ..Default::default()
    };

    loop {
        let attempt = async {
            let (stream, granted) = handshake(&config).await?;
            info!(
                "Tunnel established (session {}), tcp: {:?}, udp: {:?}",
                granted.session_id, granted.tcp_ports, granted.udp_ports
            );
            backoff.reset();
            if let Some(tx) = first.take() {
                let _ = tx.send(Ok(granted));
            }
            serve(stream, &config, &events, &cancel).await
        };

        tokio::select! {
            result = attempt => {
                if let Err(e) = result {
                    if let Some(Rejected(message)) = e.downcast_ref::<Rejected>() {
                        if let Some(tx) = first.take() {
                            let _ = tx.send(Err(message.clone()));
                            return Err(e);
                        }
                    }
                    error!("Client error: {:#}", e);
                }
            }
            _ = shutdown_rx.recv() => {
                info!("Client shutdown requested");
                cancel.cancel();
                return Ok(());
            }
        }

        let wait = backoff.next_backoff().unwrap_or(backoff.max_interval);
        info!("Reconnecting in {:?}...", wait);
        tokio::select! {
            _ = tokio::time::sleep(wait) => {}
            _ = shutdown_rx.recv() => {
                info!("Client shutdown requested");
                cancel.cancel();
                return Ok(());
            }
        }
    }
}
