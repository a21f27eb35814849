use anyhow::Result;
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;

use crate::client::{self, Granted};
use crate::config::ClientConfig;
use crate::events::{EventFeed, TunnelEvent};

/// 確立されたトンネル
pub struct Tunnel {
    remote_addr: String,
    granted: Granted,
    events: EventFeed,
    shutdown_tx: broadcast::Sender<()>,
    handle: JoinHandle<Result<()>>,
}

impl Tunnel {
    /// 最初に割り当てられたセッションID
    pub fn session_id(&self) -> u64 {
        self.granted.session_id
    }

    /// 公開されたTCPポート
    pub fn tcp_ports(&self) -> &[u16] {
        &self.granted.tcp_ports
    }

    /// 公開されたUDPポート
    pub fn udp_ports(&self) -> &[u16] {
        &self.granted.udp_ports
    }

    pub fn remote_addr(&self) -> &str {
        &self.remote_addr
    }

    /// クライアント側のフローのイベントを購読
    pub fn subscribe(&self) -> broadcast::Receiver<TunnelEvent> {
        self.events.subscribe()
    }

    /// トンネルをシャットダウン
    pub async fn shutdown(self) -> Result<()> {
        let _ = self.shutdown_tx.send(());
        self.handle.await??;
        Ok(())
    }
}

/// トンネルを開始（メインAPI）
///
/// 最初のセッションが受け入れられるまで待ってから返る。
/// その後の切断はバックグラウンドで再接続される。
///
/// # 例
/// ```no_run
/// use revtun::{start_tunnel, ClientConfig};
///
/// #[tokio::main]
/// async fn main() -> anyhow::Result<()> {
///     let config = ClientConfig {
///         remote_addr: "myserver.com:2333".into(),
///         tcp: "8080".parse()?,
///         ..ClientConfig::default()
///     };
///     let tunnel = start_tunnel(config).await?;
///     println!("Remote tcp ports: {:?}", tunnel.tcp_ports());
///
///     tokio::signal::ctrl_c().await?;
///     tunnel.shutdown().await?;
///     Ok(())
/// }
/// ```
pub async fn start_tunnel(config: ClientConfig) -> Result<Tunnel> {
    config.validate()?;
    let remote_addr = config.remote_addr.clone();
    let events = EventFeed::default();
    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let (first_tx, first_rx) = oneshot::channel();

    // バックグラウンドでクライアントを実行
    let handle = tokio::spawn(client::run_client(
        config,
        shutdown_rx,
        events.clone(),
        Some(first_tx),
    ));

    let granted = match first_rx.await {
        Ok(Ok(granted)) => granted,
        Ok(Err(message)) => {
            let _ = handle.await;
            anyhow::bail!("Server rejected the tunnel: {}", message);
        }
        // 最初のハンドシェイク前にクライアントが終了した
        Err(_) => {
            handle.await??;
            anyhow::bail!("Client stopped before the tunnel was established");
        }
    };

    Ok(Tunnel {
        remote_addr,
        granted,
        events,
        shutdown_tx,
        handle,
    })
}
