//! WebRTC signalling
//!
//! A dedicated WebSocket endpoint for SDP offer/answer and trickled ICE.
//! Messages arrive flat (`{type, sdp}`) or wrapped (`{type, payload:{sdp}}`)
//! depending on the client generation; both shapes are accepted. The answer
//! SDP carries an `a=x-session-id` attribute so the media session can be
//! correlated with this signalling socket — they are separate connections.

use axum::{
    extract::{ws::{Message, WebSocket, WebSocketUpgrade}, Query, State},
    response::Response,
    routing::get,
    Router,
};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;

use crate::server::AppState;
use crate::session::Session;
use crate::transport::webrtc::WebRtcTransport;

pub fn router(state: AppState) -> Router {
    let path = state.config.webrtc.signaling_path.clone();
    Router::new().route(&path, get(ws_handler)).with_state(state)
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<HashMap<String, String>>,
    State(state): State<AppState>,
) -> Response {
    let client_id = params
        .get("client_id")
        .cloned()
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    ws.on_upgrade(move |socket| handle_signaling(socket, state, client_id))
}

async fn handle_signaling(mut ws: WebSocket, state: AppState, client_id: String) {
    info!(client = %client_id, "signalling connected");
    let signaling_session = Uuid::new_v4().to_string();

    let connected = json!({
        "type": "connected",
        "client_id": client_id,
        "session_id": signaling_session,
        "server_info": { "timestamp": chrono::Utc::now().timestamp() },
    });
    if ws.send(Message::Text(connected.to_string().into())).await.is_err() {
        return;
    }

    // candidates that arrive before the peer connection exists
    let mut pending_candidates: Vec<RTCIceCandidateInit> = Vec::new();
    let mut transport: Option<Arc<WebRtcTransport>> = None;
    let mut session: Option<Arc<Session>> = None;

    while let Some(Ok(message)) = ws.recv().await {
        let text = match message {
            Message::Text(text) => text,
            Message::Close(_) => break,
            _ => continue,
        };

        let parsed: Value = match serde_json::from_str(&text) {
            Ok(value) => value,
            Err(_) => {
                let _ = ws
                    .send(Message::Text(
                        json!({"type": "error", "message": "invalid JSON"}).to_string().into(),
                    ))
                    .await;
                continue;
            }
        };

        let kind = parsed
            .get("type")
            .and_then(|t| t.as_str())
            .unwrap_or_default()
            .to_lowercase();
        let payload = parsed.get("payload").cloned().unwrap_or_else(|| parsed.clone());

        match kind.as_str() {
            "offer" | "sdp_offer" => {
                let Some(sdp) = payload.get("sdp").and_then(|s| s.as_str()) else {
                    let _ = ws
                        .send(Message::Text(
                            json!({"type": "error", "message": "offer has no sdp"})
                                .to_string()
                                .into(),
                        ))
                        .await;
                    continue;
                };

                match WebRtcTransport::connect(&state.config.webrtc, sdp).await {
                    Ok((new_transport, answer_sdp)) => {
                        let new_session = Session::new(
                            &client_id,
                            new_transport.clone(),
                            &state.config,
                        );
                        let answer = embed_session_id(&answer_sdp, &new_session.session_id);

                        state.registry.insert(new_session.clone()).await;
                        state.spawn_pipeline(new_session.clone());

                        for candidate in pending_candidates.drain(..) {
                            if let Err(e) = new_transport.add_ice_candidate(candidate).await {
                                warn!(client = %client_id, "buffered candidate rejected: {e}");
                            }
                        }

                        let reply = json!({
                            "type": "answer",
                            "sdp": answer,
                            "session_id": new_session.session_id,
                        });
                        transport = Some(new_transport);
                        session = Some(new_session);
                        if ws.send(Message::Text(reply.to_string().into())).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(client = %client_id, "offer failed: {e}");
                        let _ = ws
                            .send(Message::Text(
                                json!({"type": "error", "message": e.to_string()})
                                    .to_string()
                                    .into(),
                            ))
                            .await;
                    }
                }
            }
            kind if kind.contains("candidate") => {
                let Some(candidate) = parse_candidate_payload(&payload) else {
                    debug!(client = %client_id, "unparseable candidate: {payload}");
                    continue;
                };
                match &transport {
                    Some(transport) => {
                        if let Err(e) = transport.add_ice_candidate(candidate).await {
                            warn!(client = %client_id, "candidate rejected: {e}");
                        }
                    }
                    None => pending_candidates.push(candidate),
                }
            }
            "answer" | "sdp_answer" => {
                // the server is always the answerer; a client answer is a
                // protocol confusion worth logging, nothing more
                debug!(client = %client_id, "unexpected answer from client");
            }
            "ping" => {
                let pong = json!({
                    "type": "pong",
                    "timestamp": parsed
                        .get("timestamp")
                        .cloned()
                        .unwrap_or_else(|| json!(chrono::Utc::now().timestamp())),
                });
                let _ = ws.send(Message::Text(pong.to_string().into())).await;
            }
            "close" => {
                if let Some(session) = session.take() {
                    state.registry.remove(&session.device_id, &session.session_id).await;
                }
                let _ = ws
                    .send(Message::Text(json!({"type": "closed"}).to_string().into()))
                    .await;
                break;
            }
            other => {
                let _ = ws
                    .send(Message::Text(
                        json!({"type": "error", "message": format!("unsupported message type: {other}")})
                            .to_string()
                            .into(),
                    ))
                    .await;
            }
        }
    }

    // signalling going away tears the media session down with it
    if let Some(session) = session {
        state.registry.remove(&session.device_id, &session.session_id).await;
    }
    info!(client = %client_id, "signalling disconnected");
}

/// Pull an `RTCIceCandidateInit` out of the shapes clients actually send:
/// `{candidate, sdpMid, sdpMLineIndex}`, the same nested one level deeper
/// under `candidate`, or a bare candidate string.
pub fn parse_candidate_payload(payload: &Value) -> Option<RTCIceCandidateInit> {
    let object = match payload.get("candidate") {
        Some(Value::Object(_)) => payload.get("candidate").unwrap(),
        _ => payload,
    };

    let candidate = match object {
        Value::String(s) => s.clone(),
        Value::Object(_) => object.get("candidate")?.as_str()?.to_string(),
        _ => return None,
    };
    if parse_candidate_string(&candidate).is_none() {
        return None;
    }

    let sdp_mid = object
        .get("sdpMid")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());
    let sdp_mline_index = object
        .get("sdpMLineIndex")
        .and_then(|v| v.as_u64())
        .map(|v| v as u16);

    Some(RTCIceCandidateInit {
        candidate,
        sdp_mid,
        sdp_mline_index,
        username_fragment: None,
    })
}

/// Fields of an SDP candidate line
#[derive(Debug, PartialEq, Eq)]
pub struct ParsedCandidate {
    pub foundation: String,
    pub component: u16,
    pub protocol: String,
    pub priority: u64,
    pub address: String,
    pub port: u16,
    pub typ: String,
}

/// Validate `candidate:<foundation> <component> <proto> <priority> <ip>
/// <port> typ <type> ...`; the `candidate:` prefix is optional.
pub fn parse_candidate_string(candidate: &str) -> Option<ParsedCandidate> {
    let body = candidate.strip_prefix("candidate:").unwrap_or(candidate);
    let fields: Vec<&str> = body.split_whitespace().collect();
    if fields.len() < 8 || fields[6] != "typ" {
        return None;
    }
    Some(ParsedCandidate {
        foundation: fields[0].to_string(),
        component: fields[1].parse().ok()?,
        protocol: fields[2].to_lowercase(),
        priority: fields[3].parse().ok()?,
        address: fields[4].to_string(),
        port: fields[5].parse().ok()?,
        typ: fields[7].to_string(),
    })
}

/// Insert `a=x-session-id:<id>` at the session level (before the first
/// media section) so the client can correlate the answer with its audio.
pub fn embed_session_id(sdp: &str, session_id: &str) -> String {
    let attribute = format!("a=x-session-id:{session_id}");
    let mut lines: Vec<&str> = sdp.lines().collect();
    let insert_at = lines
        .iter()
        .position(|line| line.starts_with("m="))
        .unwrap_or(lines.len());
    lines.insert(insert_at, &attribute);
    let mut out = lines.join("\r\n");
    out.push_str("\r\n");
    out
}

/// Read the session-id attribute back out of an SDP
pub fn extract_session_id(sdp: &str) -> Option<String> {
    sdp.lines()
        .find_map(|line| line.strip_prefix("a=x-session-id:"))
        .map(|id| id.trim().to_string())
}
