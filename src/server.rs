use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::config::ServerConfig;
use crate::events::EventFeed;
use crate::peer::{pump_outbound, ChannelPeer, TunnelPeer, OUTBOUND_QUEUE_SIZE};
use crate::protocol::{configure_control_stream, Message};
use crate::registry::{ConnectRequest, SessionRegistry};
use crate::session::TunnelSession;

/// コントロールチャネルのサーバー
pub struct Server {
    listener: TcpListener,
    local_addr: SocketAddr,
    config: Arc<ServerConfig>,
    registry: Arc<SessionRegistry>,
}

impl Server {
    pub async fn bind(config: ServerConfig) -> Result<Self> {
        Self::with_events(config, EventFeed::default()).await
    }

    /// イベントの配信先を指定してbind
    pub async fn with_events(config: ServerConfig, events: EventFeed) -> Result<Self> {
        let listener = TcpListener::bind(&config.bind_addr)
            .await
            .with_context(|| format!("Failed to bind to {}", config.bind_addr))?;
        let local_addr = listener.local_addr()?;
        let registry = Arc::new(SessionRegistry::new(&config, events));

        Ok(Self {
            listener,
            local_addr,
            config: Arc::new(config),
            registry,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn registry(&self) -> Arc<SessionRegistry> {
        self.registry.clone()
    }

    /// シャットダウン要求まで接続を受け付ける
    pub async fn run(self, mut shutdown_rx: broadcast::Receiver<()>) -> Result<()> {
        info!("Server listening on {}", self.local_addr);
        if let Some(ports) = &self.config.tcp_ports {
            info!("Allowed tcp ports: {}", ports);
        }
        if let Some(ports) = &self.config.udp_ports {
            info!("Allowed udp ports: {}", ports);
        }

        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            debug!("New connection from {}", addr);
                            let registry = self.registry.clone();
                            let config = self.config.clone();
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, addr, registry, config).await {
                                    error!("Connection error from {}: {:#}", addr, e);
                                }
                            });
                        }
                        Err(e) => {
                            error!("Failed to accept connection: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Server shutdown requested");
                    self.registry.shutdown();
                    return Ok(());
                }
            }
        }
    }
}

/// サーバーを実行
pub async fn run_server(config: ServerConfig, shutdown_rx: broadcast::Receiver<()>) -> Result<()> {
    Server::bind(config).await?.run(shutdown_rx).await
}

/// 接続を処理
async fn handle_connection(
    mut stream: TcpStream,
    addr: SocketAddr,
    registry: Arc<SessionRegistry>,
    config: Arc<ServerConfig>,
) -> Result<()> {
    if let Err(e) = configure_control_stream(&stream, config.heartbeat_interval()) {
        warn!("Failed to configure control channel from {}: {}", addr, e);
    }

    // 最初のメッセージは Connect
    let msg = timeout(config.handshake_timeout(), Message::read_from(&mut stream))
        .await
        .context("Timeout waiting for Connect")??;

    let request = match msg {
        Message::Connect {
            tcp,
            udp,
            client_id,
        } => ConnectRequest::parse(&tcp, &udp, client_id),
        other => {
            let message = format!("expected Connect, got {:?}", other);
            Message::Errors {
                message: message.clone(),
            }
            .write_to(&mut stream)
            .await?;
            anyhow::bail!(message);
        }
    };

    let session_id = registry.next_session_id();
    let (peer, mut outbound) = ChannelPeer::new(OUTBOUND_QUEUE_SIZE);
    let peer: Arc<dyn TunnelPeer> = Arc::new(peer);

    let admitted = match request {
        Ok(request) => registry.connect(session_id, peer, request).await,
        Err(e) => Err(e),
    };
    let session = match admitted {
        Ok(session) => session,
        Err(e) => {
            // 受け入れ拒否はサーバーのエラーではない
            info!("Rejected {}: {}", addr, e);
            Message::Errors {
                message: e.to_string(),
            }
            .write_to(&mut stream)
            .await
            .context("Failed to send Errors")?;
            return Ok(());
        }
    };

    // フローのデータより先に Connected を書く
    let connected = Message::Connected {
        session_id,
        tcp_ports: session.tcp_ports().to_vec(),
        udp_ports: session.udp_ports().to_vec(),
    };
    if let Err(e) = connected.write_to(&mut stream).await {
        registry.disconnect(session_id);
        return Err(e).context("Failed to send Connected");
    }
    info!("Control channel from {} bound to session {}", addr, session_id);

    let (mut rd, mut wr) = stream.into_split();

    let result = tokio::select! {
        r = read_loop(&mut rd, &session, config.heartbeat_timeout()) => r,
        r = pump_outbound(&mut wr, &mut outbound, config.heartbeat_interval()) => r,
        _ = session.closed() => Ok(()),
    };

    // 切断時にはセッションの全フローを閉じる
    registry.disconnect(session_id);
    match result {
        Ok(()) => {
            info!("Session {} ended", session_id);
            Ok(())
        }
        Err(e) => Err(e).with_context(|| format!("Session {} lost", session_id)),
    }
}

/// クライアントからのメッセージをセッションへ振り分ける
async fn read_loop(
    rd: &mut OwnedReadHalf,
    session: &TunnelSession,
    heartbeat_timeout: Duration,
) -> Result<()> {
    loop {
        let msg = timeout(heartbeat_timeout, Message::read_from(rd))
            .await
            .context("Heartbeat timeout")??;
        if let Err(e) = session.dispatch(msg).await {
            debug!("Session {}: {}", session.id(), e);
        }
    }
}
