use tokio::sync::broadcast;

use crate::protocol::FlowKey;

/// フローの転送量
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlowStats {
    /// ローカルソケットへ書き込んだバイト数
    pub bytes_tx: u64,
    /// ローカルソケットから読み込んだバイト数
    pub bytes_rx: u64,
}

/// セッションとフローのライフサイクルイベント
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TunnelEvent {
    SessionConnected {
        session_id: u64,
        client_id: Option<String>,
        tcp_ports: Vec<u16>,
        udp_ports: Vec<u16>,
    },
    SessionRejected {
        reason: String,
    },
    SessionDisconnected {
        session_id: u64,
    },
    FlowOpened {
        key: FlowKey,
    },
    FlowClosed {
        key: FlowKey,
        stats: FlowStats,
    },
    /// アイドルタイムアウトで破棄されたUDPフロー
    UdpFlowEvicted {
        key: FlowKey,
    },
    /// 明示的な切断またはセッション終了で閉じたUDPフロー
    UdpFlowClosed {
        key: FlowKey,
    },
}

/// イベントの配信（購読者がいなければ捨てる）
#[derive(Debug, Clone)]
pub struct EventFeed {
    tx: broadcast::Sender<TunnelEvent>,
}

impl EventFeed {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn emit(&self, event: TunnelEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TunnelEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventFeed {
    fn default() -> Self {
        Self::new(256)
    }
}
