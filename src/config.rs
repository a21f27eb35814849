use anyhow::{Context, Result};
use serde::Deserialize;
use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;
use std::time::Duration;

use crate::ports::PortList;
use crate::reassembly::DEFAULT_REASSEMBLY_CAPACITY;

pub const DEFAULT_BIND_ADDR: &str = "0.0.0.0:2333";

/// サーバー・クライアント共通のフロー設定
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FlowConfig {
    /// UDPフローのアイドルタイムアウト
    pub udp_idle_timeout_ms: u64,
    /// UDPリクエストの応答待ち期限
    pub udp_request_timeout_ms: u64,
    /// trueの場合、UDPリクエストの応答を待たない
    pub udp_fire_and_forget: bool,
    pub reassembly_capacity: usize,
    /// クライアントから宛先への接続タイムアウト
    pub connect_timeout_ms: u64,
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            udp_idle_timeout_ms: 30_000,
            udp_request_timeout_ms: 5_000,
            udp_fire_and_forget: false,
            reassembly_capacity: DEFAULT_REASSEMBLY_CAPACITY,
            connect_timeout_ms: 10_000,
        }
    }
}

impl FlowConfig {
    pub fn udp_idle_timeout(&self) -> Duration {
        Duration::from_millis(self.udp_idle_timeout_ms)
    }

    pub fn udp_request_timeout(&self) -> Duration {
        Duration::from_millis(self.udp_request_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

/// サーバー設定
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    /// コントロールチャネルの待ち受けアドレス
    pub bind_addr: String,
    /// 公開ポートをbindするアドレス
    pub listen_host: IpAddr,
    /// 許可するTCPポート（未指定なら制限なし）
    pub tcp_ports: Option<PortList>,
    /// 許可するUDPポート（未指定なら制限なし）
    pub udp_ports: Option<PortList>,
    /// 許可するクライアントID（未指定なら制限なし）
    pub clients: Option<Vec<String>>,
    pub heartbeat_interval_secs: u64,
    pub heartbeat_timeout_secs: u64,
    pub handshake_timeout_secs: u64,
    pub flow: FlowConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: DEFAULT_BIND_ADDR.to_string(),
            listen_host: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            tcp_ports: None,
            udp_ports: None,
            clients: None,
            heartbeat_interval_secs: 20,
            heartbeat_timeout_secs: 60,
            handshake_timeout_secs: 10,
            flow: FlowConfig::default(),
        }
    }
}

impl ServerConfig {
    /// TOMLファイルから読み込む
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        load_toml(path.as_ref())
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_secs)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }
}

/// クライアント設定
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ClientConfig {
    /// サーバーアドレス (例: myserver.com:2333)
    pub remote_addr: String,
    /// 公開を要求するTCPポート
    pub tcp: PortList,
    /// 公開を要求するUDPポート
    pub udp: PortList,
    pub client_id: Option<String>,
    /// 中継先のホスト。ポートは待ち受けポートと同じ
    pub local_host: IpAddr,
    pub heartbeat_interval_secs: u64,
    pub heartbeat_timeout_secs: u64,
    /// 再接続間隔の上限
    pub retry_interval_secs: u64,
    pub flow: FlowConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            remote_addr: String::new(),
            tcp: PortList::default(),
            udp: PortList::default(),
            client_id: None,
            local_host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            heartbeat_interval_secs: 20,
            heartbeat_timeout_secs: 60,
            retry_interval_secs: 30,
            flow: FlowConfig::default(),
        }
    }
}

impl ClientConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        load_toml(path.as_ref())
    }

    /// 接続前の検証
    pub fn validate(&self) -> Result<()> {
        if self.remote_addr.is_empty() {
            anyhow::bail!("remote_addr is required");
        }
        if self.tcp.is_empty() && self.udp.is_empty() {
            anyhow::bail!("at least one tcp or udp port must be requested");
        }
        Ok(())
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_secs)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_secs(self.retry_interval_secs)
    }
}

fn load_toml<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T> {
    let s = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config {}", path.display()))?;
    toml::from_str(&s).with_context(|| format!("Failed to parse config {}", path.display()))
}
