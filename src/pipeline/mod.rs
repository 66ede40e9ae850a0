//! Per-session media pipeline
//!
//! One inbound dispatcher per session reads the transport and fans out:
//! audio goes through the codec and the VAD gate into the utterance buffer,
//! control messages drive the state machine. Utterance completion hands off
//! to the ASR dispatch task; a non-empty transcript starts the dialogue +
//! speak tasks. The inbound loop never blocks on a provider.

pub mod dispatch;
pub mod pacer;
pub mod speak;

use bytes::Bytes;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use crate::audio::codec::{self, StreamDecoder};
use crate::audio::AudioChunk;
use crate::config::Config;
use crate::dialogue::DialogueEngine;
use crate::intent::IntentRegistry;
use crate::protocol::{
    strip_punctuation, ClientMessage, ListenMode, ListenState, ServerMessage, TtsState,
};
use crate::providers::{Providers, TtsProvider};
use crate::session::{Session, SessionState};
use crate::transport::Inbound;
use crate::vad::{VadGate, VadModel};

pub struct SessionPipeline {
    session: Arc<Session>,
    providers: Providers,
    config: Arc<Config>,
    engine: Arc<Mutex<DialogueEngine>>,
    decoder: StreamDecoder,
    gate: VadGate,
    notify_frames: Option<Arc<Vec<Bytes>>>,
    started: Instant,
}

impl SessionPipeline {
    pub fn new(
        session: Arc<Session>,
        providers: Providers,
        intents: Arc<IntentRegistry>,
        config: Arc<Config>,
        vad_model: Box<dyn VadModel>,
    ) -> Result<Self, crate::error::MediaError> {
        let engine = DialogueEngine::new(session.clone(), providers.clone(), intents, &config);
        let gate = VadGate::new(vad_model, config.vad.min_silence_duration_ms);
        let notify_frames = load_notify_frames(&config);
        Ok(Self {
            session,
            providers,
            config,
            engine: Arc::new(Mutex::new(engine)),
            decoder: StreamDecoder::new()?,
            gate,
            notify_frames,
            started: Instant::now(),
        })
    }

    /// Run until the transport closes or the session is cancelled
    pub async fn run(mut self) {
        loop {
            let inbound = tokio::select! {
                _ = self.session.cancel.cancelled() => break,
                inbound = self.session.transport.recv() => inbound,
            };
            match inbound {
                None => {
                    info!(session = %self.session.session_id, "transport closed");
                    break;
                }
                Some(Inbound::Audio(chunk)) => self.handle_audio(chunk).await,
                Some(Inbound::Control(text)) => self.handle_control(&text).await,
            }
        }
    }

    fn now_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    async fn handle_audio(&mut self, chunk: AudioChunk) {
        let mode = self.session.listen_mode();
        if mode == ListenMode::Wakeword {
            // audio is ignored until a wakeword detect message arrives
            return;
        }

        let receiving = self.session.asr_server_receive.load(Ordering::SeqCst);
        // no VAD while a reply is playing out; the mic may be hearing our
        // own TTS through the client's speaker
        let vad_active = matches!(
            self.session.state(),
            SessionState::Idle | SessionState::Listening
        );

        if mode == ListenMode::Auto && receiving && vad_active {
            // run the gate on decoded PCM; frame-level failures drop the frame
            let pcm = match self.decoder.decode_to_pcm(&chunk) {
                Ok(pcm) => pcm,
                Err(e) => {
                    debug!(session = %self.session.session_id, "dropping frame: {e}");
                    return;
                }
            };
            let mut pcm_bytes = Vec::with_capacity(pcm.len() * 2);
            for sample in &pcm {
                pcm_bytes.extend_from_slice(&sample.to_le_bytes());
            }

            let now = self.now_ms();
            for event in self.gate.push(&pcm_bytes, now) {
                use crate::vad::VadEvent::*;
                match event {
                    SpeechStart => {
                        self.session.have_voice.store(true, Ordering::SeqCst);
                        self.session.last_speech_ms.store(now, Ordering::SeqCst);
                        if self.session.state() == SessionState::Idle {
                            let _ = self.session.transition(SessionState::Listening);
                        }
                    }
                    SpeechContinue => {
                        self.session.last_speech_ms.store(now, Ordering::SeqCst);
                    }
                    SpeechEnd => {
                        self.session.voice_stop.store(true, Ordering::SeqCst);
                    }
                }
            }
        }

        // buffer while the utterance is open, and keep buffering while an
        // ASR dispatch is in flight
        let buffering = self.session.have_voice.load(Ordering::SeqCst) || !receiving;
        let mut force = false;
        if buffering {
            force = self.session.utterance().push(chunk);
        }

        let vad_stop = mode == ListenMode::Auto && self.session.voice_stop.load(Ordering::SeqCst);
        if vad_stop || force {
            self.trigger_dispatch().await;
        }
    }

    async fn handle_control(&mut self, text: &str) {
        let message = match serde_json::from_str::<ClientMessage>(text) {
            Ok(message) => message,
            Err(e) => {
                debug!(session = %self.session.session_id, "bad control message: {e}");
                let reply = ServerMessage::Error {
                    message: format!("unrecognised control message: {e}"),
                };
                let _ = self.session.transport.send_control(&reply).await;
                return;
            }
        };

        match message {
            ClientMessage::Hello => {
                let welcome = ServerMessage::Welcome {
                    device_id: self.session.device_id.clone(),
                    session_id: self.session.session_id.clone(),
                };
                let _ = self.session.transport.send_control(&welcome).await;
            }
            ClientMessage::Abort => {
                info!(session = %self.session.session_id, "barge-in requested");
                self.session.abort_reply();
            }
            ClientMessage::Listen { state, mode, text } => {
                if let Some(mode) = mode {
                    self.session.set_listen_mode(mode);
                }
                match state {
                    ListenState::Start => {
                        self.session.have_voice.store(true, Ordering::SeqCst);
                        self.session.voice_stop.store(false, Ordering::SeqCst);
                        if self.session.state() == SessionState::Idle {
                            let _ = self.session.transition(SessionState::Listening);
                        }
                    }
                    ListenState::Stop => {
                        // VAD is authoritative in auto mode; a stray stop
                        // message must not end the utterance there
                        if self.session.listen_mode() == ListenMode::Manual {
                            self.session.have_voice.store(true, Ordering::SeqCst);
                            self.session.voice_stop.store(true, Ordering::SeqCst);
                            self.session
                                .voice_stop_requested
                                .store(true, Ordering::SeqCst);
                            self.trigger_dispatch().await;
                        }
                    }
                    ListenState::Detect => {
                        self.session.utterance().clear();
                        self.session.reset_voice_flags();
                        self.gate.reset();
                        if let Some(text) = text {
                            self.handle_wakeword(&text).await;
                        }
                    }
                }
            }
            ClientMessage::Iot { descriptors, states } => {
                // plugin territory; acknowledge by logging only
                debug!(
                    session = %self.session.session_id,
                    has_descriptors = descriptors.is_some(),
                    has_states = states.is_some(),
                    "iot message received"
                );
            }
        }
    }

    async fn handle_wakeword(&mut self, text: &str) {
        let stripped = strip_punctuation(text);
        let is_wakeword = self.config.wakeup_words.iter().any(|w| w == &stripped);

        if is_wakeword && !self.config.enable_greeting {
            // acknowledge without invoking the LLM
            let stt = ServerMessage::Stt {
                text: stripped,
                session_id: self.session.session_id.clone(),
            };
            let _ = self.session.transport.send_control(&stt).await;
            let stop = ServerMessage::tts(TtsState::Stop, &self.session.session_id);
            let _ = self.session.transport.send_control(&stop).await;
            return;
        }

        start_reply(
            self.session.clone(),
            self.engine.clone(),
            self.providers.tts.clone(),
            self.notify_frames.clone(),
            stripped,
        );
    }

    /// Claim the dispatch slot and hand the buffered utterance to ASR.
    /// A second trigger while one is in flight is a no-op.
    async fn trigger_dispatch(&mut self) {
        if !self.session.asr_server_receive.swap(false, Ordering::SeqCst) {
            debug!(session = %self.session.session_id, "asr already in flight");
            return;
        }

        let chunks = self.session.utterance().take_all();
        self.session.reset_voice_flags();
        self.gate.reset();

        if chunks.is_empty() {
            self.session.asr_server_receive.store(true, Ordering::SeqCst);
            let _ = self.session.transition(SessionState::Idle);
            return;
        }

        let session = self.session.clone();
        let asr = self.providers.asr.clone();
        let tts = self.providers.tts.clone();
        let engine = self.engine.clone();
        let notify = self.notify_frames.clone();
        let timeout_ms = self.config.active_asr().timeout_ms;

        tokio::spawn(async move {
            let transcript = dispatch::dispatch(&session, &asr, chunks, timeout_ms).await;
            session.asr_server_receive.store(true, Ordering::SeqCst);

            if transcript.is_empty() {
                debug!(session = %session.session_id, "empty transcript, back to idle");
                let _ = session.transition(SessionState::Idle);
                return;
            }
            start_reply(session, engine, tts, notify, transcript);
        });
    }
}

/// Kick off the reply tasks for one transcript: transcript echo, dialogue
/// engine, TTS streamer, pacer. Never blocks the caller.
fn start_reply(
    session: Arc<Session>,
    engine: Arc<Mutex<DialogueEngine>>,
    tts: Arc<dyn TtsProvider>,
    notify_frames: Option<Arc<Vec<Bytes>>>,
    transcript: String,
) {
    tokio::spawn(async move {
        info!(session = %session.session_id, "transcript: {transcript:?}");

        let stt = ServerMessage::Stt {
            text: strip_punctuation(&transcript),
            session_id: session.session_id.clone(),
        };
        if session.transport.send_control(&stt).await.is_err() {
            return;
        }
        let emotion = ServerMessage::Llm {
            text: "😊".to_string(),
            emotion: "happy".to_string(),
            session_id: session.session_id.clone(),
        };
        let _ = session.transport.send_control(&emotion).await;
        let start = ServerMessage::tts(TtsState::Start, &session.session_id);
        let _ = session.transport.send_control(&start).await;

        if session.transition(SessionState::Thinking).is_err() {
            // transition already reset the machine to Idle; recover and go on
            let _ = session.transition(SessionState::Thinking);
        }

        let token = session.begin_reply();
        let (reply_tx, reply_rx) = mpsc::channel(32);
        let speak_task = tokio::spawn(speak::run_reply(
            session.clone(),
            tts,
            reply_rx,
            token,
            notify_frames,
        ));

        engine.lock().await.respond(&transcript, reply_tx).await;
        let _ = speak_task.await;
    });
}

fn load_notify_frames(config: &Config) -> Option<Arc<Vec<Bytes>>> {
    if !config.enable_stop_tts_notify {
        return None;
    }
    match codec::encode_wav_file(std::path::Path::new(&config.stop_tts_notify_voice)) {
        Ok((frames, duration)) => {
            info!(
                "loaded stop-notify chime: {} frames ({duration:.2}s)",
                frames.len()
            );
            Some(Arc::new(frames))
        }
        Err(e) => {
            warn!(
                "stop-notify chime {:?} unusable, disabling: {e}",
                config.stop_tts_notify_voice
            );
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::{FRAME_BYTES, SAMPLE_RATE};
    use crate::error::ProviderError;
    use crate::providers::test_support::{FixedAsr, FixedLlm, FixedTts};
    use crate::providers::AsrProvider;
    use crate::transport::test_support::CapturingTransport;
    use crate::vad::test_support::ScriptedVad;
    use async_trait::async_trait;
    use std::time::Duration;

    fn providers(transcript: &str, reply: &str) -> Providers {
        Providers {
            asr: Arc::new(FixedAsr::new(transcript)),
            llm: Arc::new(FixedLlm { reply: reply.to_string() }),
            tts: Arc::new(FixedTts::new(2)),
        }
    }

    fn pcm_chunk(ts: u64) -> AudioChunk {
        AudioChunk::pcm16(Bytes::from(vec![0u8; FRAME_BYTES]), SAMPLE_RATE, 1, ts)
    }

    struct Harness {
        transport: Arc<CapturingTransport>,
        inbound: mpsc::Sender<Inbound>,
        session: Arc<Session>,
    }

    fn spawn_pipeline(config: Config, providers: Providers, vad: ScriptedVad) -> Harness {
        let config = Arc::new(config);
        let (transport, inbound) = CapturingTransport::new();
        let session = Session::new("dev-1", transport.clone(), &config);
        let pipeline = SessionPipeline::new(
            session.clone(),
            providers,
            Arc::new(IntentRegistry::new()),
            config,
            Box::new(vad),
        )
        .unwrap();
        tokio::spawn(pipeline.run());
        Harness { transport, inbound, session }
    }

    async fn send_control(h: &Harness, json: &str) {
        h.inbound
            .send(Inbound::Control(json.to_string()))
            .await
            .unwrap();
    }

    async fn wait_for_control(h: &Harness, kind: &str, state: Option<&str>) -> bool {
        for _ in 0..100 {
            let found = h.transport.controls().iter().any(|v| {
                v["type"] == kind
                    && state.map(|s| v["state"] == s).unwrap_or(true)
            });
            if found {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    #[tokio::test]
    async fn test_hello_gets_welcome() {
        let h = spawn_pipeline(
            Config::default(),
            providers("", "x"),
            ScriptedVad::new(vec![]),
        );
        send_control(&h, r#"{"type":"hello"}"#).await;
        assert!(wait_for_control(&h, "welcome", None).await);
    }

    #[tokio::test]
    async fn test_manual_mode_full_turn() {
        let h = spawn_pipeline(
            Config::default(),
            providers("turn on the lights", "Done."),
            ScriptedVad::new(vec![]),
        );

        send_control(&h, r#"{"type":"listen","state":"start","mode":"manual"}"#).await;
        for ts in 0..10 {
            h.inbound.send(Inbound::Audio(pcm_chunk(ts))).await.unwrap();
        }
        send_control(&h, r#"{"type":"listen","state":"stop"}"#).await;

        assert!(wait_for_control(&h, "stt", None).await);
        assert!(wait_for_control(&h, "llm", None).await);
        assert!(wait_for_control(&h, "tts", Some("sentence_start")).await);
        assert!(wait_for_control(&h, "tts", Some("stop")).await);

        // settle, then check ordering: stt before any sentence_start
        tokio::time::sleep(Duration::from_millis(50)).await;
        let controls = h.transport.controls();
        let stt_pos = controls.iter().position(|v| v["type"] == "stt").unwrap();
        let start_pos = controls
            .iter()
            .position(|v| v["state"] == "sentence_start")
            .unwrap();
        assert!(stt_pos < start_pos);
        assert_eq!(h.session.state(), SessionState::Idle);
    }

    #[tokio::test]
    async fn test_manual_stop_with_no_audio_stays_silent() {
        let h = spawn_pipeline(
            Config::default(),
            providers("ignored", "ignored"),
            ScriptedVad::new(vec![]),
        );
        send_control(&h, r#"{"type":"listen","state":"start","mode":"manual"}"#).await;
        send_control(&h, r#"{"type":"listen","state":"stop"}"#).await;

        tokio::time::sleep(Duration::from_millis(100)).await;
        let controls = h.transport.controls();
        assert!(
            !controls.iter().any(|v| v["type"] == "stt"),
            "no stt expected: {controls:?}"
        );
        assert_eq!(h.session.state(), SessionState::Idle);
    }

    #[tokio::test]
    async fn test_auto_mode_vad_drives_dispatch() {
        let mut config = Config::default();
        // keep the hangover short so the test does not wait a full second
        config.vad.min_silence_duration_ms = 30;

        // one window of speech, then silence
        let vad = ScriptedVad::new(vec![true, false, false, false, false, false]);
        let h = spawn_pipeline(config, providers("hello there", "Hi."), vad);

        // each pcm chunk is 640 bytes; a VAD window needs 1024, so feed
        // pairs with a pause in between to age the silence clock
        for ts in 0..12 {
            h.inbound.send(Inbound::Audio(pcm_chunk(ts))).await.unwrap();
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        assert!(wait_for_control(&h, "stt", None).await, "vad speech-end should dispatch");
        assert!(wait_for_control(&h, "tts", Some("stop")).await);
    }

    #[tokio::test]
    async fn test_auto_mode_ignores_listen_stop() {
        let h = spawn_pipeline(
            Config::default(),
            providers("should not run", "x"),
            ScriptedVad::new(vec![true, true, true]),
        );
        // speech begins in auto mode
        for ts in 0..4 {
            h.inbound.send(Inbound::Audio(pcm_chunk(ts))).await.unwrap();
        }
        // a stray stop must not dispatch while mode is auto
        send_control(&h, r#"{"type":"listen","state":"stop"}"#).await;

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!h.transport.controls().iter().any(|v| v["type"] == "stt"));
    }

    #[tokio::test]
    async fn test_wakeword_without_greeting_skips_llm() {
        let mut config = Config::default();
        config.enable_greeting = false;

        let h = spawn_pipeline(
            config,
            providers("unused", "must not be spoken"),
            ScriptedVad::new(vec![]),
        );
        send_control(&h, r#"{"type":"listen","state":"detect","text":"小智"}"#).await;

        assert!(wait_for_control(&h, "stt", None).await);
        assert!(wait_for_control(&h, "tts", Some("stop")).await);

        tokio::time::sleep(Duration::from_millis(50)).await;
        let controls = h.transport.controls();
        assert!(
            !controls.iter().any(|v| v["state"] == "sentence_start"),
            "no synthesis expected: {controls:?}"
        );
        let stt = controls.iter().find(|v| v["type"] == "stt").unwrap();
        assert_eq!(stt["text"], "小智");
    }

    #[tokio::test]
    async fn test_wakeword_with_greeting_starts_chat() {
        let h = spawn_pipeline(
            Config::default(),
            providers("unused", "你好呀。"),
            ScriptedVad::new(vec![]),
        );
        send_control(&h, r#"{"type":"listen","state":"detect","text":"小智"}"#).await;
        assert!(wait_for_control(&h, "tts", Some("sentence_start")).await);
    }

    #[tokio::test]
    async fn test_bad_control_message_gets_error_not_disconnect() {
        let h = spawn_pipeline(
            Config::default(),
            providers("", "x"),
            ScriptedVad::new(vec![]),
        );
        send_control(&h, "not json at all").await;
        assert!(wait_for_control(&h, "error", None).await);

        // session still alive
        send_control(&h, r#"{"type":"hello"}"#).await;
        assert!(wait_for_control(&h, "welcome", None).await);
    }

    struct SlowAsr {
        calls: std::sync::Mutex<usize>,
    }

    #[async_trait]
    impl AsrProvider for SlowAsr {
        async fn recognize(
            &self,
            _chunks: &[AudioChunk],
            _session_id: &str,
        ) -> Result<String, ProviderError> {
            *self.calls.lock().unwrap() += 1;
            tokio::time::sleep(Duration::from_millis(300)).await;
            Ok(String::new())
        }
    }

    #[tokio::test]
    async fn test_at_most_one_asr_dispatch_in_flight() {
        let slow = Arc::new(SlowAsr { calls: std::sync::Mutex::new(0) });
        let providers = Providers {
            asr: slow.clone(),
            llm: Arc::new(FixedLlm { reply: "x".to_string() }),
            tts: Arc::new(FixedTts::new(1)),
        };
        let h = spawn_pipeline(Config::default(), providers, ScriptedVad::new(vec![]));

        send_control(&h, r#"{"type":"listen","state":"start","mode":"manual"}"#).await;
        h.inbound.send(Inbound::Audio(pcm_chunk(0))).await.unwrap();
        send_control(&h, r#"{"type":"listen","state":"stop"}"#).await;

        // second press-and-release while the first dispatch is in flight
        send_control(&h, r#"{"type":"listen","state":"start"}"#).await;
        h.inbound.send(Inbound::Audio(pcm_chunk(1))).await.unwrap();
        send_control(&h, r#"{"type":"listen","state":"stop"}"#).await;

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(*slow.calls.lock().unwrap(), 1);
    }
}
