//! WebSocket transport
//!
//! Binary frames are Opus packets at 16 kHz mono / 20 ms; text frames are
//! control JSON. A reader task feeds the inbound channel and a writer task
//! drains the outbound one, so sends never block the socket reader.

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use bytes::Bytes;
use futures::{sink::SinkExt, stream::StreamExt};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info};

use super::{Inbound, Transport};
use crate::audio::AudioChunk;
use crate::error::TransportError;
use crate::protocol::ServerMessage;

enum OutboundFrame {
    Text(String),
    Binary(Bytes),
    Close,
}

pub struct WebSocketTransport {
    outbound: mpsc::Sender<OutboundFrame>,
    inbound: Mutex<mpsc::Receiver<Inbound>>,
}

impl WebSocketTransport {
    /// Take ownership of an upgraded socket and run its I/O tasks
    pub fn spawn(socket: WebSocket) -> Arc<Self> {
        let (mut ws_tx, mut ws_rx) = socket.split();
        let (outbound_tx, mut outbound_rx) = mpsc::channel::<OutboundFrame>(64);
        let (inbound_tx, inbound_rx) = mpsc::channel::<Inbound>(64);

        tokio::spawn(async move {
            while let Some(frame) = outbound_rx.recv().await {
                let result = match frame {
                    OutboundFrame::Text(text) => ws_tx.send(Message::Text(text.into())).await,
                    OutboundFrame::Binary(data) => ws_tx.send(Message::Binary(data)).await,
                    OutboundFrame::Close => {
                        let _ = ws_tx.send(Message::Close(None)).await;
                        break;
                    }
                };
                if result.is_err() {
                    break;
                }
            }
        });

        let started = Instant::now();
        tokio::spawn(async move {
            while let Some(result) = ws_rx.next().await {
                let message = match result {
                    Ok(message) => message,
                    Err(e) => {
                        debug!("websocket read error: {e}");
                        break;
                    }
                };
                let timestamp_ms = started.elapsed().as_millis() as u64;
                let inbound = match message {
                    Message::Binary(data) => Inbound::Audio(AudioChunk::opus(data, timestamp_ms)),
                    Message::Text(text) => Inbound::Control(text.to_string()),
                    Message::Close(_) => {
                        info!("websocket closed by client");
                        break;
                    }
                    // axum answers pings itself
                    Message::Ping(_) | Message::Pong(_) => continue,
                };
                if inbound_tx.send(inbound).await.is_err() {
                    break;
                }
            }
            // dropping inbound_tx ends the session's recv loop
        });

        Arc::new(Self { outbound: outbound_tx, inbound: Mutex::new(inbound_rx) })
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn send_control(&self, msg: &ServerMessage) -> Result<(), TransportError> {
        let json = serde_json::to_string(msg)
            .map_err(|e| TransportError::Protocol(e.to_string()))?;
        self.outbound
            .send(OutboundFrame::Text(json))
            .await
            .map_err(|_| TransportError::Closed)
    }

    async fn send_audio(&self, frame: Bytes) -> Result<(), TransportError> {
        self.outbound
            .send(OutboundFrame::Binary(frame))
            .await
            .map_err(|_| TransportError::Closed)
    }

    async fn recv(&self) -> Option<Inbound> {
        self.inbound.lock().await.recv().await
    }

    async fn close(&self) {
        let _ = self.outbound.send(OutboundFrame::Close).await;
    }

    fn kind(&self) -> &'static str {
        "websocket"
    }
}
