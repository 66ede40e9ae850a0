//! Per-client session state
//!
//! The session is the single source of truth for one connected client: the
//! Idle/Listening/Thinking/Speaking machine, the listen mode, the utterance
//! buffer, the reply bookkeeping, and the cancellation tokens. Component
//! tasks gate on this state rather than on each other.

pub mod registry;
pub mod utterance;

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};
use uuid::Uuid;

use crate::config::Config;
use crate::error::IllegalTransition;
use crate::protocol::ListenMode;
use crate::transport::Transport;
use utterance::UtteranceBuffer;

/// The per-session state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Listening,
    Thinking,
    Speaking,
}

impl SessionState {
    fn name(self) -> &'static str {
        match self {
            SessionState::Idle => "Idle",
            SessionState::Listening => "Listening",
            SessionState::Thinking => "Thinking",
            SessionState::Speaking => "Speaking",
        }
    }
}

pub struct Session {
    /// Stable client identity from the connect handshake
    pub device_id: String,
    /// Per-connection id echoed in every outgoing control message
    pub session_id: String,

    state: Mutex<SessionState>,
    listen_mode: Mutex<ListenMode>,

    // VAD / push-to-talk flags
    pub have_voice: AtomicBool,
    pub voice_stop: AtomicBool,
    pub voice_stop_requested: AtomicBool,
    /// Barge-in requested; the pacer checks this between frames
    pub client_abort: AtomicBool,
    /// Back-pressure: false while an ASR dispatch is in flight
    pub asr_server_receive: AtomicBool,
    pub close_after_reply: AtomicBool,

    pub last_speech_ms: AtomicU64,

    // Which synthesised segment of the current reply is first/last.
    // 0 means "no reply in progress".
    pub tts_first_index: AtomicU32,
    pub tts_last_index: AtomicU32,

    system_prompt: Mutex<String>,
    voice_id: Mutex<String>,
    utterance: Mutex<UtteranceBuffer>,

    pub transport: Arc<dyn Transport>,
    /// Fires on transport close or replacement; everything observes it
    pub cancel: CancellationToken,
    /// Child token for the current reply; barge-in cancels only this
    speak_cancel: Mutex<CancellationToken>,
}

impl Session {
    pub fn new(device_id: &str, transport: Arc<dyn Transport>, config: &Config) -> Arc<Self> {
        let cancel = CancellationToken::new();
        let speak = cancel.child_token();
        Arc::new(Self {
            device_id: device_id.to_string(),
            session_id: Uuid::new_v4().to_string(),
            state: Mutex::new(SessionState::Idle),
            listen_mode: Mutex::new(ListenMode::Auto),
            have_voice: AtomicBool::new(false),
            voice_stop: AtomicBool::new(false),
            voice_stop_requested: AtomicBool::new(false),
            client_abort: AtomicBool::new(false),
            asr_server_receive: AtomicBool::new(true),
            close_after_reply: AtomicBool::new(false),
            last_speech_ms: AtomicU64::new(0),
            tts_first_index: AtomicU32::new(0),
            tts_last_index: AtomicU32::new(0),
            system_prompt: Mutex::new(config.prompt.clone()),
            voice_id: Mutex::new(config.active_tts().voice.clone()),
            utterance: Mutex::new(UtteranceBuffer::new(config.max_utterance_seconds)),
            transport,
            cancel,
            speak_cancel: Mutex::new(speak),
        })
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock().unwrap()
    }

    /// Attempt a transition. Illegal moves are a bug: they are logged and
    /// the session resets to Idle.
    pub fn transition(&self, to: SessionState) -> Result<(), IllegalTransition> {
        let mut state = self.state.lock().unwrap();
        let from = *state;
        let legal = matches!(
            (from, to),
            (_, SessionState::Idle)
                | (SessionState::Idle, SessionState::Listening)
                | (SessionState::Idle, SessionState::Thinking)
                | (SessionState::Listening, SessionState::Thinking)
                | (SessionState::Thinking, SessionState::Speaking)
        ) || from == to;

        if legal {
            if from != to {
                debug!(
                    session = %self.session_id,
                    "state {} -> {}",
                    from.name(),
                    to.name()
                );
            }
            *state = to;
            Ok(())
        } else {
            error!(
                session = %self.session_id,
                "illegal state transition {} -> {}, resetting to Idle",
                from.name(),
                to.name()
            );
            *state = SessionState::Idle;
            Err(IllegalTransition { from: from.name(), to: to.name() })
        }
    }

    pub fn listen_mode(&self) -> ListenMode {
        *self.listen_mode.lock().unwrap()
    }

    pub fn set_listen_mode(&self, mode: ListenMode) {
        *self.listen_mode.lock().unwrap() = mode;
    }

    pub fn system_prompt(&self) -> String {
        self.system_prompt.lock().unwrap().clone()
    }

    pub fn set_system_prompt(&self, prompt: &str) {
        *self.system_prompt.lock().unwrap() = prompt.to_string();
    }

    pub fn voice_id(&self) -> String {
        self.voice_id.lock().unwrap().clone()
    }

    pub fn set_voice_id(&self, voice: &str) {
        *self.voice_id.lock().unwrap() = voice.to_string();
    }

    pub fn utterance(&self) -> MutexGuard<'_, UtteranceBuffer> {
        self.utterance.lock().unwrap()
    }

    /// Fresh child token for a new reply. The previous one is left as-is;
    /// a still-running pacer for an aborted reply observes its own token.
    pub fn begin_reply(&self) -> CancellationToken {
        let token = self.cancel.child_token();
        *self.speak_cancel.lock().unwrap() = token.clone();
        token
    }

    /// Barge-in: cancel the current reply only. The session stays alive.
    pub fn abort_reply(&self) {
        self.client_abort.store(true, Ordering::SeqCst);
        self.speak_cancel.lock().unwrap().cancel();
    }

    /// Called when a reply finishes or is aborted: reset the segment
    /// indices and return to Idle.
    pub fn clear_speak_status(&self) {
        self.tts_first_index.store(0, Ordering::SeqCst);
        self.tts_last_index.store(0, Ordering::SeqCst);
        self.client_abort.store(false, Ordering::SeqCst);
        let _ = self.transition(SessionState::Idle);
    }

    /// Reset the VAD/push-to-talk flags for the next utterance
    pub fn reset_voice_flags(&self) {
        self.have_voice.store(false, Ordering::SeqCst);
        self.voice_stop.store(false, Ordering::SeqCst);
        self.voice_stop_requested.store(false, Ordering::SeqCst);
    }

    /// Terminal teardown: cancels every task owned by this session
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.utterance.lock().unwrap().clear();
        self.transport.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::test_support::CapturingTransport;

    fn test_session() -> Arc<Session> {
        let (transport, _tx) = CapturingTransport::new();
        Session::new("dev-1", transport, &Config::default())
    }

    #[test]
    fn test_initial_state() {
        let session = test_session();
        assert_eq!(session.state(), SessionState::Idle);
        assert_eq!(session.listen_mode(), ListenMode::Auto);
        assert!(session.asr_server_receive.load(Ordering::SeqCst));
        assert_eq!(session.tts_first_index.load(Ordering::SeqCst), 0);
        assert_eq!(session.tts_last_index.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_happy_path_transitions() {
        let session = test_session();
        session.transition(SessionState::Listening).unwrap();
        session.transition(SessionState::Thinking).unwrap();
        session.transition(SessionState::Speaking).unwrap();
        session.transition(SessionState::Idle).unwrap();
    }

    #[test]
    fn test_illegal_transition_resets_to_idle() {
        let session = test_session();
        session.transition(SessionState::Listening).unwrap();
        // Listening -> Speaking skips Thinking
        let err = session.transition(SessionState::Speaking).unwrap_err();
        assert_eq!(err.from, "Listening");
        assert_eq!(err.to, "Speaking");
        assert_eq!(session.state(), SessionState::Idle);
    }

    #[test]
    fn test_empty_transcript_returns_to_idle() {
        let session = test_session();
        session.transition(SessionState::Listening).unwrap();
        session.transition(SessionState::Idle).unwrap();
        assert_eq!(session.state(), SessionState::Idle);
    }

    #[test]
    fn test_abort_reply_cancels_only_speak_token() {
        let session = test_session();
        let speak = session.begin_reply();
        session.abort_reply();
        assert!(speak.is_cancelled());
        assert!(!session.cancel.is_cancelled());
        assert!(session.client_abort.load(Ordering::SeqCst));
    }

    #[test]
    fn test_clear_speak_status_resets_indices() {
        let session = test_session();
        session.tts_first_index.store(1, Ordering::SeqCst);
        session.tts_last_index.store(6, Ordering::SeqCst);
        session.client_abort.store(true, Ordering::SeqCst);
        session.clear_speak_status();
        assert_eq!(session.tts_first_index.load(Ordering::SeqCst), 0);
        assert_eq!(session.tts_last_index.load(Ordering::SeqCst), 0);
        assert!(!session.client_abort.load(Ordering::SeqCst));
        assert_eq!(session.state(), SessionState::Idle);
    }

    #[test]
    fn test_role_switch_updates_prompt_and_voice() {
        let session = test_session();
        session.set_system_prompt("you are a pirate");
        session.set_voice_id("en-US-Guy");
        assert_eq!(session.system_prompt(), "you are a pirate");
        assert_eq!(session.voice_id(), "en-US-Guy");
    }

    #[tokio::test]
    async fn test_shutdown_cancels_and_closes() {
        let (transport, _tx) = CapturingTransport::new();
        let session = Session::new("dev-1", transport.clone(), &Config::default());
        let speak = session.begin_reply();
        session.shutdown().await;
        assert!(session.cancel.is_cancelled());
        assert!(speak.is_cancelled());
        assert!(transport.is_closed());
    }
}
