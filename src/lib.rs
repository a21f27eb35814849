// NAT越しのクライアントへ公開TCP/UDPポートを中継するリバーストンネル

pub mod config;
pub mod error;
pub mod events;
pub mod peer;
pub mod ports;
pub mod protocol;
pub mod reassembly;
pub mod tcp_flow;
pub mod udp_flow;

#[cfg(feature = "server")]
pub mod claims;
#[cfg(feature = "server")]
pub mod listener;
#[cfg(feature = "server")]
pub mod pending;
#[cfg(feature = "server")]
pub mod registry;
#[cfg(feature = "server")]
mod server;
#[cfg(feature = "server")]
pub mod session;

#[cfg(feature = "client")]
pub mod client;
#[cfg(feature = "client")]
mod tunnel;

// パブリックAPI
pub use config::{ClientConfig, FlowConfig, ServerConfig};
pub use error::{AdmissionError, FlowError, PortListError, ReassemblyError};
pub use events::{EventFeed, FlowStats, TunnelEvent};
pub use ports::PortList;
pub use protocol::{FlowKey, Message, Protocol};

#[cfg(feature = "server")]
pub use registry::{ConnectRequest, SessionRegistry};
#[cfg(feature = "server")]
pub use server::{run_server, Server};

#[cfg(feature = "client")]
pub use client::{run_client, Granted};
#[cfg(feature = "client")]
pub use tunnel::{start_tunnel, Tunnel};
