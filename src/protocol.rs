use anyhow::{Context, Result};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use socket2::{SockRef, TcpKeepalive};
use std::fmt;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

/// フレームの最大長（DoS対策）
pub const MAX_FRAME_LEN: u32 = 1024 * 1024;

/// UDPデータグラムの最大長
pub const MAX_DATAGRAM_SIZE: usize = 65535;

/// 転送するプロトコルの種類
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Protocol {
    Tcp,
    Udp,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Tcp => f.write_str("tcp"),
            Protocol::Udp => f.write_str("udp"),
        }
    }
}

/// フローの識別子: (待ち受けポート, 接続元ポート, プロトコル)
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowKey {
    pub listen_port: u16,
    pub origin_port: u16,
    pub protocol: Protocol,
}

impl FlowKey {
    pub fn tcp(listen_port: u16, origin_port: u16) -> Self {
        Self {
            listen_port,
            origin_port,
            protocol: Protocol::Tcp,
        }
    }

    pub fn udp(listen_port: u16, origin_port: u16) -> Self {
        Self {
            listen_port,
            origin_port,
            protocol: Protocol::Udp,
        }
    }
}

impl fmt::Display for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}<-{}", self.protocol, self.listen_port, self.origin_port)
    }
}

/// コントロールチャネル上のメッセージ
/// bincodeでシリアライズされる
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// クライアント → サーバー: セッション作成リクエスト
    Connect {
        tcp: String,
        udp: String,
        client_id: Option<String>,
    },

    /// サーバー → クライアント: セッションが受け入れられた
    Connected {
        session_id: u64,
        tcp_ports: Vec<u16>,
        udp_ports: Vec<u16>,
    },

    /// 受け入れ拒否やプロトコルエラーの通知
    Errors { message: String },

    /// 双方向: TCPフローのデータ。`seq` はフロー・方向ごとに0から増える
    TcpData {
        listen_port: u16,
        origin_port: u16,
        seq: u64,
        data: Bytes,
    },

    /// 双方向: TCPフローの切断
    TcpDisconnect { listen_port: u16, origin_port: u16 },

    /// 双方向: UDPデータグラム
    UdpData {
        listen_port: u16,
        origin_port: u16,
        data: Bytes,
        fire_and_forget: bool,
        request_id: Option<u64>,
    },

    /// 双方向: UDPフローの解放
    UdpDisconnect { listen_port: u16, origin_port: u16 },

    /// 双方向: ハートビート
    Heartbeat,
}

impl Message {
    /// フローに属するメッセージならそのキーを返す
    pub fn flow_key(&self) -> Option<FlowKey> {
        match *self {
            Message::TcpData {
                listen_port,
                origin_port,
                ..
            }
            | Message::TcpDisconnect {
                listen_port,
                origin_port,
            } => Some(FlowKey::tcp(listen_port, origin_port)),
            Message::UdpData {
                listen_port,
                origin_port,
                ..
            }
            | Message::UdpDisconnect {
                listen_port,
                origin_port,
            } => Some(FlowKey::udp(listen_port, origin_port)),
            _ => None,
        }
    }

    /// メッセージを送信
    /// フォーマット: [length: u32 little-endian][bincode data]
    pub async fn write_to<W: AsyncWrite + Unpin>(&self, writer: &mut W) -> Result<()> {
        let data = bincode::serialize(self)
            .with_context(|| format!("Failed to serialize message: {:?}", self))?;

        if data.len() > MAX_FRAME_LEN as usize {
            anyhow::bail!("Message too large: {} bytes", data.len());
        }

        writer
            .write_u32_le(data.len() as u32)
            .await
            .with_context(|| "Failed to write message length")?;

        writer
            .write_all(&data)
            .await
            .with_context(|| "Failed to write message data")?;

        writer.flush().await?;

        Ok(())
    }

    /// メッセージを受信
    pub async fn read_from<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Self> {
        let len = reader
            .read_u32_le()
            .await
            .with_context(|| "Failed to read message length")?;

        if len > MAX_FRAME_LEN {
            anyhow::bail!("Message too large: {} bytes", len);
        }

        let mut buf = vec![0u8; len as usize];
        reader
            .read_exact(&mut buf)
            .await
            .with_context(|| "Failed to read message data")?;

        let msg = bincode::deserialize(&buf).with_context(|| "Failed to deserialize message")?;

        Ok(msg)
    }
}

/// コントロールチャネル用のソケット設定
pub fn configure_control_stream(stream: &TcpStream, keepalive: Duration) -> std::io::Result<()> {
    stream.set_nodelay(true)?;
    let keepalive = TcpKeepalive::new().with_time(keepalive);
    SockRef::from(stream).set_tcp_keepalive(&keepalive)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_message_roundtrip() {
        let messages = vec![
            Message::Connect {
                tcp: "80,443".into(),
                udp: String::new(),
                client_id: Some("edge-1".into()),
            },
            Message::TcpData {
                listen_port: 80,
                origin_port: 51000,
                seq: 7,
                data: Bytes::from_static(b"GET / HTTP/1.1\r\n"),
            },
            Message::UdpData {
                listen_port: 53,
                origin_port: 40000,
                data: Bytes::from_static(&[0, 1, 2]),
                fire_and_forget: false,
                request_id: Some(3),
            },
            Message::Heartbeat,
        ];

        // 連続したフレームを一つのバッファに書き込んで順に読み出す
        let mut buf = Vec::new();
        for msg in &messages {
            msg.write_to(&mut buf).await.unwrap();
        }

        let mut cursor = std::io::Cursor::new(buf);
        for msg in messages {
            let decoded = Message::read_from(&mut cursor).await.unwrap();
            assert_eq!(msg, decoded);
        }
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&(MAX_FRAME_LEN + 1).to_le_bytes());
        let mut cursor = std::io::Cursor::new(buf);
        let err = Message::read_from(&mut cursor).await.unwrap_err();
        assert!(err.to_string().contains("too large"));
    }

    #[test]
    fn test_flow_key() {
        let msg = Message::UdpDisconnect {
            listen_port: 53,
            origin_port: 1234,
        };
        assert_eq!(msg.flow_key(), Some(FlowKey::udp(53, 1234)));
        assert_eq!(Message::Heartbeat.flow_key(), None);
        assert_eq!(FlowKey::tcp(80, 5000).to_string(), "tcp:80<-5000");
    }
}
