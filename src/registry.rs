// 受け入れ制御とセッションの生成・破棄

use dashmap::DashMap;
use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::claims::PortClaims;
use crate::config::{FlowConfig, ServerConfig};
use crate::error::AdmissionError;
use crate::events::{EventFeed, TunnelEvent};
use crate::peer::TunnelPeer;
use crate::ports::PortList;
use crate::protocol::Protocol;
use crate::session::TunnelSession;

/// 検証済みの接続要求
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectRequest {
    pub tcp: PortList,
    pub udp: PortList,
    pub client_id: Option<String>,
}

impl ConnectRequest {
    /// `Connect` メッセージのポートリスト文字列を解析
    pub fn parse(tcp: &str, udp: &str, client_id: Option<String>) -> Result<Self, AdmissionError> {
        let tcp = tcp.parse().map_err(|source| AdmissionError::InvalidPortList {
            protocol: Protocol::Tcp,
            source,
        })?;
        let udp = udp.parse().map_err(|source| AdmissionError::InvalidPortList {
            protocol: Protocol::Udp,
            source,
        })?;
        Ok(Self {
            tcp,
            udp,
            client_id,
        })
    }
}

pub struct SessionRegistry {
    tcp_allowed: Option<PortList>,
    udp_allowed: Option<PortList>,
    clients: Option<HashSet<String>>,
    listen_host: IpAddr,
    flow: FlowConfig,
    events: EventFeed,
    claims: PortClaims,
    sessions: DashMap<u64, Arc<TunnelSession>>,
    next_id: AtomicU64,
    cancel: CancellationToken,
}

impl SessionRegistry {
    pub fn new(config: &ServerConfig, events: EventFeed) -> Self {
        Self {
            tcp_allowed: config.tcp_ports.clone(),
            udp_allowed: config.udp_ports.clone(),
            clients: config
                .clients
                .as_ref()
                .map(|c| c.iter().cloned().collect()),
            listen_host: config.listen_host,
            flow: config.flow.clone(),
            events,
            claims: PortClaims::new(),
            sessions: DashMap::new(),
            next_id: AtomicU64::new(1),
            cancel: CancellationToken::new(),
        }
    }

    pub fn next_session_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn events(&self) -> &EventFeed {
        &self.events
    }

    /// 接続要求を検証してセッションを作る
    ///
    /// 最初に失敗した検証のエラーを返し、その場合は何の状態も残さない。
    pub async fn connect(
        &self,
        session_id: u64,
        peer: Arc<dyn TunnelPeer>,
        request: ConnectRequest,
    ) -> Result<Arc<TunnelSession>, AdmissionError> {
        match self.admit(session_id, peer, request).await {
            Ok(session) => {
                info!(
                    "Session {} connected (client: {:?}, tcp: {:?}, udp: {:?})",
                    session_id,
                    session.client_id(),
                    session.tcp_ports(),
                    session.udp_ports()
                );
                self.events.emit(TunnelEvent::SessionConnected {
                    session_id,
                    client_id: session.client_id().map(str::to_string),
                    tcp_ports: session.tcp_ports().to_vec(),
                    udp_ports: session.udp_ports().to_vec(),
                });
                Ok(session)
            }
            Err(e) => {
                warn!("Session {} rejected: {}", session_id, e);
                self.events.emit(TunnelEvent::SessionRejected {
                    reason: e.to_string(),
                });
                Err(e)
            }
        }
    }

    async fn admit(
        &self,
        session_id: u64,
        peer: Arc<dyn TunnelPeer>,
        request: ConnectRequest,
    ) -> Result<Arc<TunnelSession>, AdmissionError> {
        let ConnectRequest {
            tcp,
            udp,
            client_id,
        } = request;

        if tcp.is_empty() && udp.is_empty() {
            return Err(AdmissionError::PortsRequired);
        }

        if let Some(clients) = &self.clients {
            let id = client_id.as_deref().ok_or(AdmissionError::ClientIdRequired)?;
            if !clients.contains(id) {
                return Err(AdmissionError::ClientDenied(id.to_string()));
            }
        }

        for (protocol, requested, allowed) in [
            (Protocol::Tcp, &tcp, &self.tcp_allowed),
            (Protocol::Udp, &udp, &self.udp_allowed),
        ] {
            if let Some(allowed) = allowed {
                let banned = requested.missing_from(allowed);
                if !banned.is_empty() {
                    return Err(AdmissionError::BannedPorts {
                        protocol,
                        ports: banned,
                    });
                }
            }
        }

        self.claims.claim(session_id, &tcp, &udp)?;

        let opened = TunnelSession::open(
            session_id,
            client_id,
            &tcp,
            &udp,
            peer,
            self.listen_host,
            self.flow.clone(),
            self.events.clone(),
            &self.cancel,
        )
        .await;
        let session = match opened {
            Ok(session) => Arc::new(session),
            Err(e) => {
                self.claims.release(session_id);
                return Err(e);
            }
        };

        self.sessions.insert(session_id, session.clone());
        Ok(session)
    }

    /// セッションを破棄してポートを解放する。何度呼んでもよい
    pub fn disconnect(&self, session_id: u64) -> bool {
        let removed = self.sessions.remove(&session_id);
        self.claims.release(session_id);
        match removed {
            Some((_, session)) => {
                session.close();
                info!("Session {} disconnected", session_id);
                self.events
                    .emit(TunnelEvent::SessionDisconnected { session_id });
                true
            }
            None => false,
        }
    }

    pub fn get(&self, session_id: u64) -> Option<Arc<TunnelSession>> {
        self.sessions.get(&session_id).map(|s| s.value().clone())
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// ポートを使用中のセッション
    pub fn port_owner(&self, protocol: Protocol, port: u16) -> Option<u64> {
        self.claims.claimed_by(protocol, port)
    }

    /// 全セッションを閉じる（サーバー停止時）
    pub fn shutdown(&self) {
        let ids: Vec<u64> = self.sessions.iter().map(|s| *s.key()).collect();
        for id in ids {
            self.disconnect(id);
        }
        self.cancel.cancel();
    }
}
