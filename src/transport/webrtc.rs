//! WebRTC transport
//!
//! Inbound audio arrives as Opus RTP on the peer connection's audio track;
//! the payloads are preserved as-is so everything downstream sees the same
//! Opus frames the WebSocket path produces. Control JSON flows over the
//! client's SCTP data channel. Outbound audio goes on an outgoing track
//! when the offer negotiated one, otherwise as binary data-channel frames.

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS};
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::media::Sample;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

use super::{Inbound, Transport};
use crate::audio::{AudioChunk, FRAME_MS};
use crate::config::WebrtcConfig;
use crate::error::TransportError;
use crate::protocol::ServerMessage;

pub struct WebRtcTransport {
    pc: Arc<RTCPeerConnection>,
    /// Present when the offer negotiated a server->client audio track
    outbound_track: Option<Arc<TrackLocalStaticSample>>,
    data_channel: Mutex<Option<Arc<RTCDataChannel>>>,
    /// Control messages sent before the data channel opened
    pending_control: Mutex<Vec<String>>,
    inbound: Mutex<mpsc::Receiver<Inbound>>,
    closed: AtomicBool,
    /// Fired on connection death; wakes a blocked `recv` without touching
    /// the inbound mutex
    closed_token: CancellationToken,
}

impl WebRtcTransport {
    /// Build a peer connection from the client's offer and return the
    /// transport plus the local answer SDP (ICE candidates inlined).
    pub async fn connect(
        config: &WebrtcConfig,
        offer_sdp: &str,
    ) -> anyhow::Result<(Arc<Self>, String)> {
        let mut media = MediaEngine::default();
        media.register_default_codecs()?;
        let registry = register_default_interceptors(Registry::new(), &mut media)?;
        let api = APIBuilder::new()
            .with_media_engine(media)
            .with_interceptor_registry(registry)
            .build();

        let rtc_config = RTCConfiguration {
            ice_servers: ice_servers(config),
            ..Default::default()
        };
        let pc = Arc::new(api.new_peer_connection(rtc_config).await?);

        let (inbound_tx, inbound_rx) = mpsc::channel::<Inbound>(64);

        // offer with a media section -> answer with an outgoing track;
        // data-channel-only clients get framed binary audio instead
        let outbound_track = if offer_sdp.contains("m=audio") {
            let track = Arc::new(TrackLocalStaticSample::new(
                RTCRtpCodecCapability {
                    mime_type: MIME_TYPE_OPUS.to_owned(),
                    clock_rate: 48_000,
                    channels: 2,
                    sdp_fmtp_line: "minptime=10;useinbandfec=1".to_owned(),
                    ..Default::default()
                },
                "audio".to_owned(),
                "parley".to_owned(),
            ));
            pc.add_track(Arc::clone(&track) as Arc<dyn TrackLocal + Send + Sync>)
                .await?;
            Some(track)
        } else {
            None
        };

        let transport = Arc::new(Self {
            pc: pc.clone(),
            outbound_track,
            data_channel: Mutex::new(None),
            pending_control: Mutex::new(Vec::new()),
            inbound: Mutex::new(inbound_rx),
            closed: AtomicBool::new(false),
            closed_token: CancellationToken::new(),
        });

        // inbound audio: lift the Opus payload straight out of the RTP plane
        let audio_tx = inbound_tx.clone();
        let started = Instant::now();
        pc.on_track(Box::new(move |track, _receiver, _transceiver| {
            let audio_tx = audio_tx.clone();
            Box::pin(async move {
                info!("remote track attached: {}", track.id());
                while let Ok((rtp, _attributes)) = track.read_rtp().await {
                    if rtp.payload.is_empty() {
                        continue;
                    }
                    let timestamp_ms = started.elapsed().as_millis() as u64;
                    let chunk = AudioChunk::opus(rtp.payload, timestamp_ms);
                    if audio_tx.send(Inbound::Audio(chunk)).await.is_err() {
                        break;
                    }
                }
                debug!("remote track ended");
            })
        }));

        // the client opens the control channel; hook its messages up
        let dc_transport = Arc::downgrade(&transport);
        let control_tx = inbound_tx.clone();
        pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
            let dc_transport = dc_transport.clone();
            let control_tx = control_tx.clone();
            Box::pin(async move {
                info!("data channel opened by client: {}", dc.label());

                let message_tx = control_tx.clone();
                let dc_started = Instant::now();
                dc.on_message(Box::new(move |msg: DataChannelMessage| {
                    let message_tx = message_tx.clone();
                    Box::pin(async move {
                        let inbound = if msg.is_string {
                            Inbound::Control(String::from_utf8_lossy(&msg.data).to_string())
                        } else {
                            let timestamp_ms = dc_started.elapsed().as_millis() as u64;
                            Inbound::Audio(AudioChunk::opus(msg.data.clone(), timestamp_ms))
                        };
                        let _ = message_tx.send(inbound).await;
                    })
                }));

                if let Some(transport) = dc_transport.upgrade() {
                    let flush: Vec<String> = {
                        *transport.data_channel.lock().await = Some(dc.clone());
                        transport.pending_control.lock().await.drain(..).collect()
                    };
                    for json in flush {
                        if let Err(e) = dc.send_text(json).await {
                            warn!("flushing pending control failed: {e}");
                            break;
                        }
                    }
                }
            })
        }));

        // connection death ends the inbound stream, which ends the session
        let state_transport = Arc::downgrade(&transport);
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let state_transport = state_transport.clone();
            Box::pin(async move {
                debug!("peer connection state: {state}");
                if matches!(
                    state,
                    RTCPeerConnectionState::Failed
                        | RTCPeerConnectionState::Closed
                        | RTCPeerConnectionState::Disconnected
                ) {
                    if let Some(transport) = state_transport.upgrade() {
                        transport.closed.store(true, Ordering::SeqCst);
                        transport.closed_token.cancel();
                    }
                }
            })
        }));
        drop(inbound_tx);

        let offer = RTCSessionDescription::offer(offer_sdp.to_string())?;
        pc.set_remote_description(offer).await?;

        let answer = pc.create_answer(None).await?;
        let mut gather_complete = pc.gathering_complete_promise().await;
        pc.set_local_description(answer).await?;
        // candidates are inlined into the answer so clients that do not
        // trickle still connect
        let _ = gather_complete.recv().await;

        let local = pc
            .local_description()
            .await
            .ok_or_else(|| anyhow::anyhow!("no local description after answer"))?;

        Ok((transport, local.sdp))
    }

    /// Apply a trickled remote ICE candidate
    pub async fn add_ice_candidate(&self, candidate: RTCIceCandidateInit) -> anyhow::Result<()> {
        self.pc.add_ice_candidate(candidate).await?;
        Ok(())
    }
}

fn ice_servers(config: &WebrtcConfig) -> Vec<RTCIceServer> {
    let mut servers = Vec::new();
    if !config.stun_servers.is_empty() {
        servers.push(RTCIceServer {
            urls: config.stun_servers.clone(),
            ..Default::default()
        });
    }
    for turn in &config.turn_servers {
        servers.push(RTCIceServer {
            urls: vec![turn.urls.clone()],
            username: turn.username.clone(),
            credential: turn.credential.clone(),
            ..Default::default()
        });
    }
    servers
}

#[async_trait]
impl Transport for WebRtcTransport {
    async fn send_control(&self, msg: &ServerMessage) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        let json = serde_json::to_string(msg)
            .map_err(|e| TransportError::Protocol(e.to_string()))?;

        let dc = self.data_channel.lock().await.clone();
        match dc {
            Some(dc) => dc
                .send_text(json)
                .await
                .map(|_| ())
                .map_err(|_| TransportError::Closed),
            None => {
                // channel not open yet; hold the message until it is
                self.pending_control.lock().await.push(json);
                Ok(())
            }
        }
    }

    async fn send_audio(&self, frame: Bytes) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        if let Some(track) = &self.outbound_track {
            let sample = Sample {
                data: frame,
                duration: Duration::from_millis(FRAME_MS),
                ..Default::default()
            };
            return track
                .write_sample(&sample)
                .await
                .map_err(|_| TransportError::Closed);
        }

        let dc = self.data_channel.lock().await.clone();
        match dc {
            Some(dc) => dc
                .send(&frame)
                .await
                .map(|_| ())
                .map_err(|_| TransportError::Closed),
            None => Err(TransportError::Closed),
        }
    }

    async fn recv(&self) -> Option<Inbound> {
        let mut inbound = self.inbound.lock().await;
        tokio::select! {
            _ = self.closed_token.cancelled() => None,
            item = inbound.recv() => item,
        }
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.closed_token.cancel();
        if let Err(e) = self.pc.close().await {
            debug!("peer connection close: {e}");
        }
    }

    fn kind(&self) -> &'static str {
        "webrtc"
    }
}
