use anyhow::{Context, Result};
use async_trait::async_trait;
use std::time::Duration;
use tokio::io::AsyncWrite;
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::debug;

use crate::error::PeerClosed;
use crate::protocol::Message;

/// 書き込みタスクへの送信キューの長さ
pub const OUTBOUND_QUEUE_SIZE: usize = 1024;

/// コントロールチャネルの相手側へメッセージを送る口
///
/// リスナーやフローはセッションへの参照ではなくこのトレイトだけを持つ。
#[async_trait]
pub trait TunnelPeer: Send + Sync {
    async fn send(&self, msg: Message) -> Result<(), PeerClosed>;
}

/// mpscチャネル経由で書き込みタスクへ渡す実装
#[derive(Clone, Debug)]
pub struct ChannelPeer {
    tx: mpsc::Sender<Message>,
}

impl ChannelPeer {
    /// 送信側と、書き込みタスクが読む受信側を作成
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<Message>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

#[async_trait]
impl TunnelPeer for ChannelPeer {
    async fn send(&self, msg: Message) -> Result<(), PeerClosed> {
        self.tx.send(msg).await.map_err(|_| PeerClosed)
    }
}

/// 送信キューの内容をコントロールチャネルへ書き出す
///
/// キューが空の間も `heartbeat_interval` ごとにハートビートを送る。
/// 送信側がすべて閉じると `Ok` で終わる。
pub async fn pump_outbound<W>(
    writer: &mut W,
    rx: &mut mpsc::Receiver<Message>,
    heartbeat_interval: Duration,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut heartbeat = interval_at(Instant::now() + heartbeat_interval, heartbeat_interval);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            msg = rx.recv() => match msg {
                Some(msg) => msg.write_to(writer).await.context("Failed to write message")?,
                None => return Ok(()),
            },
            _ = heartbeat.tick() => {
                debug!("Sending heartbeat");
                Message::Heartbeat
                    .write_to(writer)
                    .await
                    .context("Failed to send heartbeat")?;
            }
        }
    }
}
