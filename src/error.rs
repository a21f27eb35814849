use thiserror::Error;

use crate::protocol::{FlowKey, Protocol};

/// ポートリストの文法エラー
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PortListError {
    #[error("empty token in port list")]
    EmptyToken,

    #[error("invalid port `{0}`: expected an integer in 1..65535 with no surrounding whitespace")]
    InvalidPort(String),

    #[error("invalid port range `{0}`: start must be lower than end")]
    InvalidRange(String),
}

/// セッション接続時の受け入れ拒否理由
///
/// どのバリアントもセッション状態が作られる前に返される。
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AdmissionError {
    #[error("at least one tcp or udp port must be requested")]
    PortsRequired,

    #[error("a client id is required by this server")]
    ClientIdRequired,

    #[error("client `{0}` is not allowed")]
    ClientDenied(String),

    #[error("{protocol} ports not allowed: {}", join_ports(.ports))]
    BannedPorts { protocol: Protocol, ports: Vec<u16> },

    #[error("{protocol} ports already in use: {}", join_ports(.ports))]
    PortsAlreadyInUse { protocol: Protocol, ports: Vec<u16> },

    #[error("invalid {protocol} port list: {source}")]
    InvalidPortList {
        protocol: Protocol,
        source: PortListError,
    },

    #[error("failed to bind {protocol} port {port}: {reason}")]
    BindFailed {
        protocol: Protocol,
        port: u16,
        reason: String,
    },
}

/// フロー単位のエラー
#[derive(Debug, Error)]
pub enum FlowError {
    #[error("no live flow for {0}")]
    FlowNotBound(FlowKey),

    #[error(transparent)]
    Reassembly(#[from] ReassemblyError),

    #[error("short write: {written} of {expected} bytes")]
    ShortWrite { written: usize, expected: usize },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    PeerClosed(#[from] PeerClosed),
}

/// 並べ替えバッファのプロトコル違反
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ReassemblyError {
    #[error("reassembly capacity of {capacity} frames exceeded")]
    CapacityExceeded { capacity: usize },

    #[error("duplicate frame {0}")]
    DuplicateFrame(u64),
}

/// コントロールチャネルが既に閉じている
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("control channel closed")]
pub struct PeerClosed;

fn join_ports(ports: &[u16]) -> String {
    ports
        .iter()
        .map(|p| p.to_string())
        .collect::<Vec<_>>()
        .join(",")
}
