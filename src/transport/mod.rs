//! Transport abstraction
//!
//! One uniform interface over raw WebSocket and WebRTC: outbound control
//! JSON + Opus frames, and a single inbound stream of tagged payloads.
//! Nothing above this layer ever branches on the connection type.

pub mod websocket;
pub mod webrtc;

use async_trait::async_trait;
use bytes::Bytes;

use crate::audio::AudioChunk;
use crate::error::TransportError;
use crate::protocol::ServerMessage;

/// What a transport read produced
#[derive(Debug)]
pub enum Inbound {
    /// Text payload; parsed into a control message by the session
    Control(String),
    /// One audio chunk, format-tagged by the adapter
    Audio(AudioChunk),
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Send one control message
    async fn send_control(&self, msg: &ServerMessage) -> Result<(), TransportError>;

    /// Send one encoded Opus frame
    async fn send_audio(&self, frame: Bytes) -> Result<(), TransportError>;

    /// Next inbound payload; `None` once the connection is gone
    async fn recv(&self) -> Option<Inbound>;

    /// Tear the connection down
    async fn close(&self);

    /// "websocket" or "webrtc", for logs
    fn kind(&self) -> &'static str;
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use std::sync::Mutex as StdMutex;
    use std::time::Instant;
    use tokio::sync::{mpsc, Mutex};

    /// What a capturing transport recorded, with receive time
    #[derive(Debug, Clone)]
    pub enum Sent {
        Control(serde_json::Value, Instant),
        Audio(Bytes, Instant),
    }

    /// Test double: captures everything sent, replays injected inbound
    pub struct CapturingTransport {
        pub sent: StdMutex<Vec<Sent>>,
        inbound: Mutex<mpsc::Receiver<Inbound>>,
        closed: StdMutex<bool>,
    }

    impl CapturingTransport {
        pub fn new() -> (std::sync::Arc<Self>, mpsc::Sender<Inbound>) {
            let (tx, rx) = mpsc::channel(64);
            let transport = std::sync::Arc::new(Self {
                sent: StdMutex::new(Vec::new()),
                inbound: Mutex::new(rx),
                closed: StdMutex::new(false),
            });
            (transport, tx)
        }

        pub fn controls(&self) -> Vec<serde_json::Value> {
            self.sent
                .lock()
                .unwrap()
                .iter()
                .filter_map(|s| match s {
                    Sent::Control(v, _) => Some(v.clone()),
                    _ => None,
                })
                .collect()
        }

        pub fn audio_frames(&self) -> Vec<Bytes> {
            self.sent
                .lock()
                .unwrap()
                .iter()
                .filter_map(|s| match s {
                    Sent::Audio(b, _) => Some(b.clone()),
                    _ => None,
                })
                .collect()
        }

        pub fn is_closed(&self) -> bool {
            *self.closed.lock().unwrap()
        }
    }

    #[async_trait]
    impl Transport for CapturingTransport {
        async fn send_control(&self, msg: &ServerMessage) -> Result<(), TransportError> {
            let value = serde_json::to_value(msg)
                .map_err(|e| TransportError::Protocol(e.to_string()))?;
            self.sent
                .lock()
                .unwrap()
                .push(Sent::Control(value, Instant::now()));
            Ok(())
        }

        async fn send_audio(&self, frame: Bytes) -> Result<(), TransportError> {
            self.sent
                .lock()
                .unwrap()
                .push(Sent::Audio(frame, Instant::now()));
            Ok(())
        }

        async fn recv(&self) -> Option<Inbound> {
            self.inbound.lock().await.recv().await
        }

        async fn close(&self) {
            *self.closed.lock().unwrap() = true;
        }

        fn kind(&self) -> &'static str {
            "capture"
        }
    }
}
