use anyhow::Result;
use clap::{Parser, Subcommand};
use std::net::IpAddr;
use std::path::PathBuf;
use tokio::sync::broadcast;
use tracing::{debug, error, info};

use revtun::{ClientConfig, EventFeed, PortList, ServerConfig, TunnelEvent};

#[derive(Parser)]
#[clap(name = "revtun", version)]
#[clap(about = "Expose TCP/UDP ports of a NAT-ed host through a public server", long_about = None)]
struct Cli {
    #[clap(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// サーバーモード: クライアント接続を待機し、要求されたポートを公開
    Server {
        /// 設定ファイル (TOML)
        #[clap(short, long)]
        config: Option<PathBuf>,

        /// コントロールチャネルのバインドアドレス (例: 0.0.0.0:2333)
        #[clap(long)]
        bind_addr: Option<String>,

        /// 公開ポートをbindするアドレス
        #[clap(long)]
        listen_host: Option<IpAddr>,

        /// 許可するTCPポート (例: 80,443,8000-8100)
        #[clap(long)]
        tcp_ports: Option<PortList>,

        /// 許可するUDPポート
        #[clap(long)]
        udp_ports: Option<PortList>,

        /// 許可するクライアントID
        #[clap(long = "client")]
        clients: Vec<String>,
    },

    /// クライアントモード: ローカルのポートをサーバー経由で公開
    Client {
        /// サーバーアドレス (例: myserver.com:2333)
        remote_addr: Option<String>,

        /// 設定ファイル (TOML)
        #[clap(short, long)]
        config: Option<PathBuf>,

        /// 公開するTCPポート
        #[clap(long)]
        tcp: Option<PortList>,

        /// 公開するUDPポート
        #[clap(long)]
        udp: Option<PortList>,

        #[clap(long)]
        client_id: Option<String>,

        /// 中継先のホスト
        #[clap(long)]
        local_host: Option<IpAddr>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();

    #[cfg(unix)]
    {
        let _ = fdlimit::raise_fd_limit();
    }

    let cli = Cli::parse();

    // Ctrl+Cハンドラー
    let (shutdown_tx, shutdown_rx) = broadcast::channel::<()>(1);
    let ctrl_c_tx = shutdown_tx.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for ctrl-c signal: {:?}", e);
            return;
        }
        let _ = ctrl_c_tx.send(());
    });

    match cli.command {
        Commands::Server {
            config,
            bind_addr,
            listen_host,
            tcp_ports,
            udp_ports,
            clients,
        } => {
            let mut config = match config {
                Some(path) => ServerConfig::from_file(path)?,
                None => ServerConfig::default(),
            };
            if let Some(bind_addr) = bind_addr {
                config.bind_addr = bind_addr;
            }
            if let Some(listen_host) = listen_host {
                config.listen_host = listen_host;
            }
            if tcp_ports.is_some() {
                config.tcp_ports = tcp_ports;
            }
            if udp_ports.is_some() {
                config.udp_ports = udp_ports;
            }
            if !clients.is_empty() {
                config.clients = Some(clients);
            }

            let events = EventFeed::default();
            spawn_event_logger(&events);
            let server = revtun::Server::with_events(config, events).await?;
            server.run(shutdown_rx).await?;
        }
        Commands::Client {
            remote_addr,
            config,
            tcp,
            udp,
            client_id,
            local_host,
        } => {
            let mut config = match config {
                Some(path) => ClientConfig::from_file(path)?,
                None => ClientConfig::default(),
            };
            if let Some(remote_addr) = remote_addr {
                config.remote_addr = remote_addr;
            }
            if let Some(tcp) = tcp {
                config.tcp = tcp;
            }
            if let Some(udp) = udp {
                config.udp = udp;
            }
            if client_id.is_some() {
                config.client_id = client_id;
            }
            if let Some(local_host) = local_host {
                config.local_host = local_host;
            }

            let mut rx = shutdown_rx;
            let tunnel = tokio::select! {
                tunnel = revtun::start_tunnel(config) => tunnel?,
                _ = rx.recv() => return Ok(()),
            };
            spawn_event_logger_rx(tunnel.subscribe());
            println!(
                "Tunnel established! tcp: {:?}, udp: {:?}",
                tunnel.tcp_ports(),
                tunnel.udp_ports()
            );
            println!("Press Ctrl+C to stop...");

            // シャットダウン待機
            let _ = rx.recv().await;

            println!("Shutting down...");
            tunnel.shutdown().await?;
        }
    }

    Ok(())
}

fn init_logging() {
    #[cfg(feature = "console")]
    {
        console_subscriber::init();
    }
    #[cfg(not(feature = "console"))]
    {
        use tracing_subscriber::EnvFilter;

        let is_atty = atty::is(atty::Stream::Stdout);
        let level = "info";
        tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::from(level)),
            )
            .with_ansi(is_atty)
            .init();
    }
}

fn spawn_event_logger(events: &EventFeed) {
    spawn_event_logger_rx(events.subscribe());
}

fn spawn_event_logger_rx(mut rx: broadcast::Receiver<TunnelEvent>) {
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(TunnelEvent::FlowClosed { key, stats }) => debug!(
                    "Flow {} closed: {} bytes out, {} bytes in",
                    key, stats.bytes_tx, stats.bytes_rx
                ),
                Ok(event) => debug!("{:?}", event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    info!("Event logger lagged, {} events skipped", n)
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}
