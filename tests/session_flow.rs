//! End-to-end session scenarios over the public pipeline API
//!
//! Drives a full SessionPipeline with fake providers, a scripted VAD model,
//! and a capturing transport, and checks the wire-visible behaviour: message
//! ordering, barge-in latency, and exit-phrase shutdown.

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex};

use parley::audio::{AudioChunk, FRAME_BYTES, SAMPLE_RATE};
use parley::config::Config;
use parley::error::{ProviderError, TransportError};
use parley::intent::IntentRegistry;
use parley::pipeline::SessionPipeline;
use parley::providers::{AsrProvider, ChatMessage, LlmOutcome, LlmProvider, Providers, TtsProvider};
use parley::protocol::ServerMessage;
use parley::session::{Session, SessionState};
use parley::transport::{Inbound, Transport};
use parley::vad::VadModel;

// ─── Test doubles ────────────────────────────────────────────

#[derive(Debug, Clone)]
enum Sent {
    Control(serde_json::Value, Instant),
    Audio(Instant),
}

struct TestTransport {
    sent: StdMutex<Vec<Sent>>,
    inbound: Mutex<mpsc::Receiver<Inbound>>,
    closed: StdMutex<bool>,
}

impl TestTransport {
    fn new() -> (Arc<Self>, mpsc::Sender<Inbound>) {
        let (tx, rx) = mpsc::channel(256);
        (
            Arc::new(Self {
                sent: StdMutex::new(Vec::new()),
                inbound: Mutex::new(rx),
                closed: StdMutex::new(false),
            }),
            tx,
        )
    }

    fn controls(&self) -> Vec<serde_json::Value> {
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

    fn records(&self) -> Vec<Sent> {
        self.sent.lock().unwrap().clone()
    }

    fn is_closed(&self) -> bool {
        *self.closed.lock().unwrap()
    }
}

#[async_trait]
impl Transport for TestTransport {
    async fn send_control(&self, msg: &ServerMessage) -> Result<(), TransportError> {
        let value = serde_json::to_value(msg).unwrap();
        self.sent
            .lock()
            .unwrap()
            .push(Sent::Control(value, Instant::now()));
        Ok(())
    }

    async fn send_audio(&self, _frame: Bytes) -> Result<(), TransportError> {
        self.sent.lock().unwrap().push(Sent::Audio(Instant::now()));
        Ok(())
    }

    async fn recv(&self) -> Option<Inbound> {
        self.inbound.lock().await.recv().await
    }

    async fn close(&self) {
        *self.closed.lock().unwrap() = true;
    }

    fn kind(&self) -> &'static str {
        "test"
    }
}

/// Scripted decisions per 512-sample window, silence once exhausted
struct ScriptedVad {
    decisions: Vec<bool>,
    cursor: StdMutex<usize>,
}

impl VadModel for ScriptedVad {
    fn is_speech(&mut self, _frame: &[f32]) -> anyhow::Result<(bool, f32)> {
        let mut cursor = self.cursor.lock().unwrap();
        let speech = self.decisions.get(*cursor).copied().unwrap_or(false);
        *cursor += 1;
        Ok((speech, if speech { 0.9 } else { 0.1 }))
    }
}

struct FakeAsr {
    transcript: String,
}

#[async_trait]
impl AsrProvider for FakeAsr {
    async fn recognize(
        &self,
        _chunks: &[AudioChunk],
        _session_id: &str,
    ) -> Result<String, ProviderError> {
        Ok(self.transcript.clone())
    }
}

struct FakeLlm {
    reply: String,
}

#[async_trait]
impl LlmProvider for FakeLlm {
    async fn chat_stream(
        &self,
        _messages: &[ChatMessage],
        tx: mpsc::Sender<String>,
    ) -> Result<String, ProviderError> {
        for chunk in self.reply.split_inclusive(' ') {
            let _ = tx.send(chunk.to_string()).await;
        }
        Ok(self.reply.clone())
    }

    async fn chat_with_functions(
        &self,
        _messages: &[ChatMessage],
        _tools: &[serde_json::Value],
    ) -> Result<LlmOutcome, ProviderError> {
        Ok(LlmOutcome::Text(self.reply.clone()))
    }
}

struct FakeTts {
    frames_per_segment: usize,
}

#[async_trait]
impl TtsProvider for FakeTts {
    async fn synthesize(
        &self,
        _text: &str,
        _voice: &str,
    ) -> Result<(Vec<Bytes>, f64), ProviderError> {
        let frames = (0..self.frames_per_segment)
            .map(|i| Bytes::from(vec![i as u8; 8]))
            .collect::<Vec<_>>();
        Ok((frames, self.frames_per_segment as f64 * 0.02))
    }
}

// ─── Harness ─────────────────────────────────────────────────

struct Harness {
    transport: Arc<TestTransport>,
    inbound: mpsc::Sender<Inbound>,
    session: Arc<Session>,
}

fn spawn(config: Config, providers: Providers, vad_decisions: Vec<bool>) -> Harness {
    let config = Arc::new(config);
    let (transport, inbound) = TestTransport::new();
    let session = Session::new("dev-1", transport.clone(), &config);
    let vad = ScriptedVad { decisions: vad_decisions, cursor: StdMutex::new(0) };
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

fn providers(transcript: &str, reply: &str, frames: usize) -> Providers {
    Providers {
        asr: Arc::new(FakeAsr { transcript: transcript.to_string() }),
        llm: Arc::new(FakeLlm { reply: reply.to_string() }),
        tts: Arc::new(FakeTts { frames_per_segment: frames }),
    }
}

fn pcm_chunk(ts: u64) -> AudioChunk {
    AudioChunk::pcm16(Bytes::from(vec![0u8; FRAME_BYTES]), SAMPLE_RATE, 1, ts)
}

async fn wait_for(h: &Harness, predicate: impl Fn(&[serde_json::Value]) -> bool) -> bool {
    for _ in 0..300 {
        if predicate(&h.transport.controls()) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

fn has_tts_state(controls: &[serde_json::Value], state: &str) -> bool {
    controls
        .iter()
        .any(|v| v["type"] == "tts" && v["state"] == state)
}

// ─── Scenarios ───────────────────────────────────────────────

/// Auto-mode short utterance: welcome, stt, llm, bracketed audio, stop,
/// session back to Idle.
#[tokio::test]
async fn auto_mode_short_utterance() {
    let mut config = Config::default();
    config.vad.min_silence_duration_ms = 40;

    let h = spawn(
        config,
        providers("hello there", "Hello! Nice to hear you.", 3),
        vec![true, true, false, false, false, false, false, false],
    );

    h.inbound
        .send(Inbound::Control(r#"{"type":"hello"}"#.to_string()))
        .await
        .unwrap();

    for ts in 0..16 {
        h.inbound.send(Inbound::Audio(pcm_chunk(ts))).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    assert!(wait_for(&h, |c| has_tts_state(c, "stop")).await, "reply never finished");

    let controls = h.transport.controls();
    assert!(controls.iter().any(|v| v["type"] == "welcome"));

    let stt = controls.iter().find(|v| v["type"] == "stt").unwrap();
    assert_eq!(stt["text"], "hello there");

    let llm = controls.iter().find(|v| v["type"] == "llm").unwrap();
    assert_eq!(llm["emotion"], "happy");

    // sentence brackets around every frame run
    let records = h.transport.records();
    let mut in_segment = false;
    let mut saw_audio = false;
    for record in &records {
        match record {
            Sent::Control(v, _) if v["state"] == "sentence_start" => in_segment = true,
            Sent::Control(v, _) if v["state"] == "sentence_end" => in_segment = false,
            Sent::Audio(_) => {
                saw_audio = true;
                assert!(in_segment, "audio frame outside a sentence bracket");
            }
            _ => {}
        }
    }
    assert!(saw_audio);

    // stop is the final tts marker and the machine is idle again
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(h.session.state(), SessionState::Idle);
}

/// Barge-in during a multi-segment reply: frames halt within one pacing
/// window, stop arrives, indices reset.
#[tokio::test]
async fn barge_in_cuts_reply_short() {
    let reply = "One. Two. Three. Four. Five. Six.";
    let h = spawn(Config::default(), providers("talk to me", reply, 40), vec![]);

    // manual mode so the utterance boundary is deterministic
    h.inbound
        .send(Inbound::Control(
            r#"{"type":"listen","state":"start","mode":"manual"}"#.to_string(),
        ))
        .await
        .unwrap();
    h.inbound.send(Inbound::Audio(pcm_chunk(0))).await.unwrap();
    h.inbound
        .send(Inbound::Control(r#"{"type":"listen","state":"stop"}"#.to_string()))
        .await
        .unwrap();

    assert!(
        wait_for(&h, |c| c
            .iter()
            .any(|v| v["state"] == "sentence_start"))
        .await,
        "playback never started"
    );
    // let some frames go out, then barge in
    tokio::time::sleep(Duration::from_millis(120)).await;
    let abort_at = Instant::now();
    h.inbound
        .send(Inbound::Control(r#"{"type":"abort"}"#.to_string()))
        .await
        .unwrap();

    assert!(wait_for(&h, |c| has_tts_state(c, "stop")).await, "stop never delivered");
    tokio::time::sleep(Duration::from_millis(150)).await;

    let records = h.transport.records();
    let late_audio = records.iter().any(|r| match r {
        Sent::Audio(t) => *t > abort_at + Duration::from_millis(100),
        _ => false,
    });
    assert!(!late_audio, "audio sent more than one pacing window after abort");

    use std::sync::atomic::Ordering;
    assert_eq!(h.session.tts_first_index.load(Ordering::SeqCst), 0);
    assert_eq!(h.session.tts_last_index.load(Ordering::SeqCst), 0);
    assert_eq!(h.session.state(), SessionState::Idle);
}

/// Exit phrase: goodbye is synthesised and played, then the server closes
/// the session after the stop marker.
#[tokio::test]
async fn exit_phrase_closes_session_after_reply() {
    let h = spawn(
        Config::default(),
        providers("再见", "unused llm reply", 2),
        vec![],
    );

    h.inbound
        .send(Inbound::Control(
            r#"{"type":"listen","state":"start","mode":"manual"}"#.to_string(),
        ))
        .await
        .unwrap();
    h.inbound.send(Inbound::Audio(pcm_chunk(0))).await.unwrap();
    h.inbound
        .send(Inbound::Control(r#"{"type":"listen","state":"stop"}"#.to_string()))
        .await
        .unwrap();

    assert!(wait_for(&h, |c| has_tts_state(c, "stop")).await);

    // goodbye audio was actually spoken before the close
    let controls = h.transport.controls();
    assert!(controls
        .iter()
        .any(|v| v["state"] == "sentence_start" && v["text"].as_str().unwrap().contains("再见")));

    for _ in 0..100 {
        if h.session.cancel.is_cancelled() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(h.session.cancel.is_cancelled(), "session should close after goodbye");
    assert!(h.transport.is_closed());
}
