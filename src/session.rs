use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::FlowConfig;
use crate::error::{AdmissionError, FlowError};
use crate::events::{EventFeed, FlowStats};
use crate::listener::{ListenerContext, PortListener, TcpPortListener, UdpPortListener};
use crate::peer::TunnelPeer;
use crate::ports::PortList;
use crate::protocol::{FlowKey, Message, Protocol};
use crate::tcp_flow::{CloseReason, TcpFlows};

/// 受け入れ済みクライアント一つ分の状態
///
/// 公開ポートのリスナーとTCPフローを所有し、コントロールチャネルから
/// 届いたメッセージを該当するフローへ振り分ける。
pub struct TunnelSession {
    id: u64,
    client_id: Option<String>,
    tcp_ports: Vec<u16>,
    udp_ports: Vec<u16>,
    peer: Arc<dyn TunnelPeer>,
    flows: TcpFlows,
    listeners: HashMap<(Protocol, u16), PortListener>,
    cancel: CancellationToken,
}

impl TunnelSession {
    /// 要求された全ポートをbindしてセッションを作る
    ///
    /// 一つでもbindできなければ、それまでのリスナーを閉じて `BindFailed` を返す。
    #[allow(clippy::too_many_arguments)]
    pub async fn open(
        id: u64,
        client_id: Option<String>,
        tcp: &PortList,
        udp: &PortList,
        peer: Arc<dyn TunnelPeer>,
        listen_host: IpAddr,
        flow: FlowConfig,
        events: EventFeed,
        parent: &CancellationToken,
    ) -> Result<Self, AdmissionError> {
        let cancel = parent.child_token();
        let flows = TcpFlows::new();
        let ctx = ListenerContext {
            peer: peer.clone(),
            events,
            cancel: cancel.clone(),
            flow,
        };

        let mut listeners = HashMap::new();
        for port in tcp.iter() {
            match TcpPortListener::bind(listen_host, port, flows.clone(), ctx.clone()).await {
                Ok(l) => {
                    listeners.insert((Protocol::Tcp, port), PortListener::Tcp(l));
                }
                Err(e) => {
                    cancel.cancel();
                    return Err(AdmissionError::BindFailed {
                        protocol: Protocol::Tcp,
                        port,
                        reason: e.to_string(),
                    });
                }
            }
        }
        for port in udp.iter() {
            match UdpPortListener::bind(listen_host, port, ctx.clone()).await {
                Ok(l) => {
                    listeners.insert((Protocol::Udp, port), PortListener::Udp(l));
                }
                Err(e) => {
                    // bind済みのリスナーは子トークン経由で止まる
                    cancel.cancel();
                    return Err(AdmissionError::BindFailed {
                        protocol: Protocol::Udp,
                        port,
                        reason: e.to_string(),
                    });
                }
            }
        }

        Ok(Self {
            id,
            client_id,
            tcp_ports: tcp.iter().collect(),
            udp_ports: udp.iter().collect(),
            peer,
            flows,
            listeners,
            cancel,
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn client_id(&self) -> Option<&str> {
        self.client_id.as_deref()
    }

    pub fn tcp_ports(&self) -> &[u16] {
        &self.tcp_ports
    }

    pub fn udp_ports(&self) -> &[u16] {
        &self.udp_ports
    }

    pub fn flows(&self) -> &TcpFlows {
        &self.flows
    }

    pub fn listener(&self, protocol: Protocol, port: u16) -> Option<&PortListener> {
        self.listeners.get(&(protocol, port))
    }

    /// フローごとの転送量（TCPのみ）
    pub fn flow_stats(&self) -> Vec<(FlowKey, FlowStats)> {
        self.flows.stats()
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// セッションが閉じられるまで待つ
    pub async fn closed(&self) {
        self.cancel.cancelled().await
    }

    /// コントロールチャネルから届いたメッセージを処理
    ///
    /// エラーはフロー単位で処理済み。呼び出し側はログに残すだけでよい。
    pub async fn dispatch(&self, msg: Message) -> Result<(), FlowError> {
        match msg {
            Message::TcpData {
                listen_port,
                origin_port,
                seq,
                data,
            } => {
                let key = FlowKey::tcp(listen_port, origin_port);
                let flow = match self.flows.get(&key) {
                    Some(flow) => flow,
                    None => {
                        self.notify_unbound(key).await;
                        return Err(FlowError::FlowNotBound(key));
                    }
                };
                if let Err(e) = flow.deliver(seq, data).await {
                    warn!("TCP flow {}: {}, closing", key, e);
                    flow.abort(CloseReason::Protocol(e.to_string()));
                    return Err(e);
                }
                Ok(())
            }
            Message::TcpDisconnect {
                listen_port,
                origin_port,
            } => {
                let key = FlowKey::tcp(listen_port, origin_port);
                match self.flows.get(&key) {
                    Some(flow) => {
                        flow.close_by_peer();
                        Ok(())
                    }
                    None => Err(FlowError::FlowNotBound(key)),
                }
            }
            Message::UdpData {
                listen_port,
                origin_port,
                data,
                request_id,
                ..
            } => match self.udp_listener(listen_port) {
                Some(listener) => {
                    listener
                        .deliver_response(origin_port, data, request_id)
                        .await
                }
                None => {
                    let key = FlowKey::udp(listen_port, origin_port);
                    self.notify_unbound(key).await;
                    Err(FlowError::FlowNotBound(key))
                }
            },
            Message::UdpDisconnect {
                listen_port,
                origin_port,
            } => {
                let key = FlowKey::udp(listen_port, origin_port);
                match self.udp_listener(listen_port) {
                    Some(listener) if listener.disconnect(origin_port) => Ok(()),
                    _ => Err(FlowError::FlowNotBound(key)),
                }
            }
            Message::Heartbeat => Ok(()),
            other => {
                warn!("Session {}: unexpected message {:?}", self.id, other);
                Ok(())
            }
        }
    }

    /// 全リスナーとフローを閉じる。何度呼んでもよい
    pub fn close(&self) {
        if self.cancel.is_cancelled() {
            return;
        }
        self.cancel.cancel();
        for listener in self.listeners.values() {
            listener.close();
        }
        self.flows.cancel_all();
        info!("Session {} closed", self.id);
    }

    fn udp_listener(&self, port: u16) -> Option<&Arc<UdpPortListener>> {
        match self.listeners.get(&(Protocol::Udp, port)) {
            Some(PortListener::Udp(l)) => Some(l),
            _ => None,
        }
    }

    /// 存在しないフロー宛てのメッセージ。相手側の状態を解放させる
    async fn notify_unbound(&self, key: FlowKey) {
        debug!("Session {}: no flow for {}", self.id, key);
        let msg = match key.protocol {
            Protocol::Tcp => Message::TcpDisconnect {
                listen_port: key.listen_port,
                origin_port: key.origin_port,
            },
            Protocol::Udp => Message::UdpDisconnect {
                listen_port: key.listen_port,
                origin_port: key.origin_port,
            },
        };
        let _ = self.peer.send(msg).await;
    }
}

impl fmt::Debug for TunnelSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TunnelSession")
            .field("id", &self.id)
            .field("client_id", &self.client_id)
            .field("tcp_ports", &self.tcp_ports)
            .field("udp_ports", &self.udp_ports)
            .field("flows", &self.flows.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Drop for TunnelSession {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::peer::ChannelPeer;
    use bytes::Bytes;
    use std::net::Ipv4Addr;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpStream, UdpSocket};
    use tokio::sync::mpsc;

    pub(crate) const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

    /// 空いているポートを一つ探す（TCP/UDP両方で空いているもの）
    pub(crate) fn free_port() -> u16 {
        loop {
            let tcp = std::net::TcpListener::bind((LOCALHOST, 0)).unwrap();
            let port = tcp.local_addr().unwrap().port();
            if std::net::UdpSocket::bind((LOCALHOST, port)).is_ok() {
                return port;
            }
        }
    }

    async fn open(
        tcp: &[u16],
        udp: &[u16],
    ) -> (TunnelSession, mpsc::Receiver<Message>, CancellationToken) {
        let (peer, rx) = ChannelPeer::new(64);
        let root = CancellationToken::new();
        let session = TunnelSession::open(
            1,
            Some("edge".into()),
            &PortList::new(tcp.iter().copied()),
            &PortList::new(udp.iter().copied()),
            Arc::new(peer),
            LOCALHOST,
            FlowConfig::default(),
            EventFeed::default(),
            &root,
        )
        .await
        .unwrap();
        (session, rx, root)
    }

    #[tokio::test]
    async fn test_dispatch_tcp_data_to_visitor() {
        let port = free_port();
        let (session, mut rx, _root) = open(&[port], &[]).await;
        assert_eq!(session.tcp_ports(), &[port]);

        let mut visitor = TcpStream::connect((LOCALHOST, port)).await.unwrap();
        let origin_port = visitor.local_addr().unwrap().port();
        visitor.write_all(b"hello").await.unwrap();
        assert!(matches!(rx.recv().await, Some(Message::TcpData { seq: 0, .. })));

        // 順不同で届いても順番通りに書き込まれる
        for (seq, chunk) in [(1, "world"), (0, "hello ")] {
            session
                .dispatch(Message::TcpData {
                    listen_port: port,
                    origin_port,
                    seq,
                    data: Bytes::from_static(chunk.as_bytes()),
                })
                .await
                .unwrap();
        }
        let mut buf = [0u8; 11];
        visitor.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello world");
        assert_eq!(session.flow_stats()[0].1.bytes_tx, 11);
    }

    #[tokio::test]
    async fn test_long_in_order_stream_to_slow_visitor() {
        let port = free_port();
        let (session, mut rx, _root) = open(&[port], &[]).await;
        let session = Arc::new(session);

        let mut visitor = TcpStream::connect((LOCALHOST, port)).await.unwrap();
        let origin_port = visitor.local_addr().unwrap().port();
        visitor.write_all(b"go").await.unwrap();
        assert!(matches!(rx.recv().await, Some(Message::TcpData { .. })));

        // 並べ替えキューの上限（1024）を大きく超えるフレーム数
        const FRAMES: u64 = 3000;
        const FRAME_SIZE: usize = 16 * 1024;
        let sender = {
            let session = session.clone();
            tokio::spawn(async move {
                for seq in 0..FRAMES {
                    session
                        .dispatch(Message::TcpData {
                            listen_port: port,
                            origin_port,
                            seq,
                            data: Bytes::from(vec![(seq % 7) as u8; FRAME_SIZE]),
                        })
                        .await?;
                }
                Ok::<_, FlowError>(())
            })
        };

        // 訪問者が読み始める前に大量に届いていても切断されない
        tokio::time::sleep(Duration::from_millis(200)).await;
        let mut buf = vec![0u8; FRAME_SIZE];
        for seq in 0..FRAMES {
            visitor.read_exact(&mut buf).await.unwrap();
            assert!(buf.iter().all(|&b| b == (seq % 7) as u8), "frame {}", seq);
        }
        sender.await.unwrap().unwrap();
        assert_eq!(session.flows().len(), 1);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_dispatch_to_unknown_flow_answers_disconnect() {
        let port = free_port();
        let (session, mut rx, _root) = open(&[port], &[port]).await;

        let err = session
            .dispatch(Message::TcpData {
                listen_port: port,
                origin_port: 40001,
                seq: 3,
                data: Bytes::from_static(b"x"),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, FlowError::FlowNotBound(_)));
        assert_eq!(
            rx.recv().await,
            Some(Message::TcpDisconnect {
                listen_port: port,
                origin_port: 40001
            })
        );

        let err = session
            .dispatch(Message::UdpData {
                listen_port: port,
                origin_port: 40002,
                data: Bytes::from_static(b"x"),
                fire_and_forget: false,
                request_id: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, FlowError::FlowNotBound(_)));
        assert_eq!(
            rx.recv().await,
            Some(Message::UdpDisconnect {
                listen_port: port,
                origin_port: 40002
            })
        );
    }

    #[tokio::test]
    async fn test_duplicate_frame_aborts_flow() {
        let port = free_port();
        let (session, mut rx, _root) = open(&[port], &[]).await;

        let mut visitor = TcpStream::connect((LOCALHOST, port)).await.unwrap();
        let origin_port = visitor.local_addr().unwrap().port();
        visitor.write_all(b"hi").await.unwrap();
        assert!(matches!(rx.recv().await, Some(Message::TcpData { .. })));

        let frame = |seq| Message::TcpData {
            listen_port: port,
            origin_port,
            seq,
            data: Bytes::from_static(b"x"),
        };
        session.dispatch(frame(5)).await.unwrap();
        assert!(session.dispatch(frame(5)).await.is_err());

        // フローは破棄され、相手側へ切断が通知される
        assert_eq!(
            rx.recv().await,
            Some(Message::TcpDisconnect {
                listen_port: port,
                origin_port
            })
        );
        let mut buf = [0u8; 8];
        assert_eq!(visitor.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_udp_disconnect_removes_entry() {
        let port = free_port();
        let (session, mut rx, _root) = open(&[], &[port]).await;

        let origin = UdpSocket::bind((LOCALHOST, 0)).await.unwrap();
        origin.send_to(b"q", (LOCALHOST, port)).await.unwrap();
        let origin_port = match rx.recv().await {
            Some(Message::UdpData { origin_port, .. }) => origin_port,
            other => panic!("unexpected message: {:?}", other),
        };

        session
            .dispatch(Message::UdpDisconnect {
                listen_port: port,
                origin_port,
            })
            .await
            .unwrap();
        assert!(session
            .dispatch(Message::UdpDisconnect {
                listen_port: port,
                origin_port,
            })
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_debug_shows_identity_and_ports() {
        let port = free_port();
        let (session, _rx, _root) = open(&[port], &[]).await;
        let shown = format!("{:?}", session);
        assert!(shown.contains("id: 1"), "{}", shown);
        assert!(shown.contains("\"edge\""), "{}", shown);
        assert!(shown.contains(&format!("tcp_ports: [{}]", port)), "{}", shown);
    }

    #[tokio::test]
    async fn test_bind_failure_is_reported() {
        let taken = std::net::TcpListener::bind((LOCALHOST, 0)).unwrap();
        let port = taken.local_addr().unwrap().port();
        let (peer, _rx) = ChannelPeer::new(8);

        let result = TunnelSession::open(
            1,
            None,
            &PortList::new([port]),
            &PortList::default(),
            Arc::new(peer),
            LOCALHOST,
            FlowConfig::default(),
            EventFeed::default(),
            &CancellationToken::new(),
        )
        .await;
        assert!(matches!(
            result,
            Err(AdmissionError::BindFailed { protocol: Protocol::Tcp, port: p, .. }) if p == port
        ));
    }

    #[tokio::test]
    async fn test_parent_cancel_closes_listeners() {
        let port = free_port();
        let (session, _rx, root) = open(&[port], &[]).await;
        root.cancel();
        assert!(session.is_closed());

        let mut refused = false;
        for _ in 0..50 {
            if TcpStream::connect((LOCALHOST, port)).await.is_err() {
                refused = true;
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert!(refused);
    }
}
