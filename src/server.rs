//! Server assembly
//!
//! Three listeners: the primary audio WebSocket (`/xiaozhi/v1/`, device-id
//! header required), the role CRUD API on its own port, and — when enabled —
//! the WebRTC signalling endpoint. All sessions land in one registry and
//! run the same pipeline regardless of transport.

use anyhow::{Context, Result};
use axum::{
    extract::{
        ws::{WebSocket, WebSocketUpgrade},
        State,
    },
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::intent::IntentRegistry;
use crate::pipeline::SessionPipeline;
use crate::providers::Providers;
use crate::roles::{api as roles_api, RoleStore};
use crate::session::registry::SessionRegistry;
use crate::session::Session;
use crate::signaling;
use crate::transport::websocket::WebSocketTransport;
use crate::vad::{silero::SileroVad, VadModel};

/// Builds one VAD model instance per session (Silero keeps per-stream state)
pub type VadFactory = Arc<dyn Fn() -> Result<Box<dyn VadModel>> + Send + Sync>;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub registry: Arc<SessionRegistry>,
    pub providers: Providers,
    pub intents: Arc<IntentRegistry>,
    pub roles: Arc<RoleStore>,
    pub vad_factory: VadFactory,
}

impl AppState {
    pub fn new(mut config: Config) -> Result<Self> {
        let roles = Arc::new(RoleStore::load(
            Path::new(&config.roles_path),
            &config.prompt,
            &config.active_tts().voice,
        ));

        // the role sidecar owns the active persona; sessions start from it
        if let Some((id, role)) = roles.default_role() {
            info!("active role: {:?} ({id})", role.name);
            config.prompt = role.prompt.clone();
            if !role.voice.is_empty() {
                if let Some(tts) = config.tts.get_mut(&config.selected_module.tts) {
                    tts.voice = role.voice.clone();
                }
            }
        }

        let providers = Providers::from_config(&config);
        let intents = Arc::new(IntentRegistry::with_builtins(roles.clone()));

        let model_path = config.vad.model_path.clone();
        let threshold = config.vad.threshold;
        if !Path::new(&model_path).exists() {
            warn!("vad model {model_path:?} not found; sessions will fail to open");
        }
        let vad_factory: VadFactory = Arc::new(move || {
            Ok(Box::new(SileroVad::load(Path::new(&model_path), threshold)?)
                as Box<dyn VadModel>)
        });

        Ok(Self {
            config: Arc::new(config),
            registry: SessionRegistry::new(),
            providers,
            intents,
            roles,
            vad_factory,
        })
    }

    /// Run a session's pipeline in its own task and clean the registry up
    /// afterwards — the registry never holds a session whose transport is
    /// closed.
    pub fn spawn_pipeline(&self, session: Arc<Session>) {
        let state = self.clone();
        tokio::spawn(async move {
            state.run_pipeline(session).await;
        });
    }

    pub async fn run_pipeline(&self, session: Arc<Session>) {
        let vad_model = match (self.vad_factory)() {
            Ok(model) => model,
            Err(e) => {
                error!(session = %session.session_id, "vad unavailable: {e}");
                self.registry
                    .remove(&session.device_id, &session.session_id)
                    .await;
                return;
            }
        };
        let pipeline = match SessionPipeline::new(
            session.clone(),
            self.providers.clone(),
            self.intents.clone(),
            self.config.clone(),
            vad_model,
        ) {
            Ok(pipeline) => pipeline,
            Err(e) => {
                error!(session = %session.session_id, "pipeline init failed: {e}");
                self.registry
                    .remove(&session.device_id, &session.session_id)
                    .await;
                return;
            }
        };
        pipeline.run().await;
        self.registry
            .remove(&session.device_id, &session.session_id)
            .await;
    }
}

/// Start every listener and serve until the process is stopped
pub async fn start(config: Config) -> Result<()> {
    let state = AppState::new(config)?;
    let config = state.config.clone();

    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    println!("     Parley Dialogue Server");
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    // role CRUD sidecar
    let roles_addr: SocketAddr = format!("{}:{}", config.server.ip, config.role_api_port)
        .parse()
        .context("bad role api address")?;
    let roles_app = roles_api::router(state.roles.clone()).layer(
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any),
    );
    let roles_listener = tokio::net::TcpListener::bind(roles_addr)
        .await
        .with_context(|| format!("cannot bind role api on {roles_addr}"))?;
    println!("✓ Role API:    http://{roles_addr}/api/roles");
    tokio::spawn(async move {
        if let Err(e) = axum::serve(roles_listener, roles_app).await {
            error!("role api server stopped: {e}");
        }
    });

    // WebRTC signalling
    if config.webrtc.enabled {
        let signal_addr: SocketAddr = format!("{}:{}", config.server.ip, config.webrtc.port)
            .parse()
            .context("bad signalling address")?;
        let signal_app = signaling::router(state.clone());
        let signal_listener = tokio::net::TcpListener::bind(signal_addr)
            .await
            .with_context(|| format!("cannot bind signalling on {signal_addr}"))?;
        println!(
            "✓ Signalling:  ws://{signal_addr}{}",
            config.webrtc.signaling_path
        );
        tokio::spawn(async move {
            if let Err(e) = axum::serve(signal_listener, signal_app).await {
                error!("signalling server stopped: {e}");
            }
        });
    }

    // primary audio WebSocket
    let addr: SocketAddr = format!("{}:{}", config.server.ip, config.server.port)
        .parse()
        .context("bad server address")?;
    let app = Router::new()
        .route("/xiaozhi/v1/", get(audio_ws_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("cannot bind server on {addr}"))?;
    println!("✓ Audio WS:    ws://{addr}/xiaozhi/v1/");
    println!();

    axum::serve(listener, app).await.context("server stopped")
}

async fn audio_ws_handler(
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    State(state): State<AppState>,
) -> Response {
    let Some(device_id) = headers
        .get("device-id")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
        .filter(|s| !s.is_empty())
    else {
        return (StatusCode::BAD_REQUEST, "device-id header required").into_response();
    };
    let client_id = headers
        .get("client-id")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string());

    info!(device = %device_id, client = ?client_id, "websocket client connecting");
    ws.on_upgrade(move |socket| handle_audio_socket(socket, state, device_id))
}

async fn handle_audio_socket(socket: WebSocket, state: AppState, device_id: String) {
    let transport = WebSocketTransport::spawn(socket);
    let session = Session::new(&device_id, transport, &state.config);
    state.registry.insert(session.clone()).await;
    state.run_pipeline(session).await;
}
