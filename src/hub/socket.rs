//! Per-connection read and write pumps for push-only sockets.

use axum::extract::ws::{Message, WebSocket};
use futures_util::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval_at, timeout, timeout_at, Instant};

use super::{Frame, Hub, HubKey, Subscription};

/// Largest inbound message accepted from a push-only client.
pub const MAX_MESSAGE_SIZE: usize = 512;

#[derive(Debug, Clone, Copy)]
pub struct PumpConfig {
    /// Deadline for a single frame write.
    pub write_wait: Duration,
    /// Read deadline, pushed forward by every pong.
    pub pong_wait: Duration,
    /// Ping cadence. Must be shorter than `pong_wait`.
    pub ping_period: Duration,
}

impl Default for PumpConfig {
    fn default() -> Self {
        Self {
            write_wait: Duration::from_secs(10),
            pong_wait: Duration::from_secs(60),
            ping_period: Duration::from_secs(54),
        }
    }
}

/// Drive one connection until either side fails, then leave the hub.
pub async fn run<K: HubKey>(socket: WebSocket, hub: Hub<K>, subscription: Subscription<K>, config: PumpConfig) {
    let Subscription { id, key, rx } = subscription;
    let (sink, stream) = socket.split();

    let mut writer = tokio::spawn(write_pump(sink, rx, config));
    let mut reader = tokio::spawn(read_pump(stream, config.pong_wait));

    tokio::select! {
        _ = &mut writer => reader.abort(),
        _ = &mut reader => writer.abort(),
    }

    hub.unregister(id).await;
    tracing::debug!(client = id, key = ?key, "Socket closed");
}

async fn read_pump(mut stream: SplitStream<WebSocket>, pong_wait: Duration) {
    let mut deadline = Instant::now() + pong_wait;

    loop {
        match timeout_at(deadline, stream.next()).await {
            Err(_) => {
                tracing::debug!("Read deadline expired");
                break;
            }
            Ok(None) | Ok(Some(Ok(Message::Close(_)))) => break,
            Ok(Some(Err(e))) => {
                tracing::debug!("WebSocket read error: {}", e);
                break;
            }
            Ok(Some(Ok(Message::Pong(_)))) => deadline = Instant::now() + pong_wait,
            // push-only: anything else the client sends is ignored
            Ok(Some(Ok(_))) => {}
        }
    }
}

async fn write_pump(mut sink: SplitSink<WebSocket, Message>, mut rx: mpsc::Receiver<Frame>, config: PumpConfig) {
    let mut ping = interval_at(Instant::now() + config.ping_period, config.ping_period);

    loop {
        let message = tokio::select! {
            frame = rx.recv() => match frame {
                Some(frame) => Message::Text(coalesce(frame, &mut rx)),
                None => {
                    // evicted or unregistered
                    let _ = timeout(config.write_wait, sink.send(Message::Close(None))).await;
                    break;
                }
            },
            _ = ping.tick() => Message::Ping(Vec::new()),
        };

        match timeout(config.write_wait, sink.send(message)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::debug!("WebSocket write error: {}", e);
                break;
            }
            Err(_) => {
                tracing::debug!("Write deadline expired");
                break;
            }
        }
    }
}

/// Join `first` with every frame already waiting in the queue, newline separated.
pub fn coalesce(first: Frame, rx: &mut mpsc::Receiver<Frame>) -> String {
    let mut text = String::from(&*first);
    while let Ok(next) = rx.try_recv() {
        text.push('\n');
        text.push_str(&next);
    }
    text
}
