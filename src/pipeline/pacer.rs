//! Play-out pacer
//!
//! Sends encoded frames to the client at wall-clock cadence: a short
//! back-to-back prime to fill the client jitter buffer, then one frame per
//! 20 ms against a per-segment clock. Barge-in is observed between frames
//! and drains everything still queued.

use bytes::Bytes;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::audio::FRAME_MS;
use crate::protocol::{ServerMessage, TtsState};
use crate::session::{Session, SessionState};

/// Frames sent back-to-back at segment start
const PRE_BUFFER_FRAMES: usize = 5;

/// Hard cap on a single pacing sleep
const MAX_SLEEP: Duration = Duration::from_millis(100);

const FRAME_DURATION: Duration = Duration::from_millis(FRAME_MS);

/// One synthesised segment ready for play-out
#[derive(Debug)]
pub struct SpeakItem {
    pub index: u32,
    pub text: String,
    pub frames: Vec<Bytes>,
}

/// Why a segment stopped short of its last frame
enum PaceOutcome {
    Completed,
    Aborted,
    TransportGone,
}

/// Consume one reply's segments in index order. Ends naturally when the
/// channel closes (reply complete) or early on barge-in / cancellation.
pub async fn run(
    session: Arc<Session>,
    mut rx: mpsc::Receiver<SpeakItem>,
    token: CancellationToken,
    notify_frames: Option<Arc<Vec<Bytes>>>,
) {
    loop {
        let item = tokio::select! {
            _ = token.cancelled() => {
                drain(&mut rx);
                abort_finish(&session).await;
                return;
            }
            item = rx.recv() => item,
        };

        let Some(item) = item else {
            // producer done: the whole reply has been paced out
            natural_finish(&session, notify_frames.as_deref()).await;
            return;
        };

        if session.state() == SessionState::Thinking {
            let _ = session.transition(SessionState::Speaking);
        }

        let start = ServerMessage::tts_sentence(TtsState::SentenceStart, &item.text, &session.session_id);
        if session.transport.send_control(&start).await.is_err() {
            return;
        }

        match pace_frames(&session, &token, &item.frames).await {
            PaceOutcome::Completed => {
                let end = ServerMessage::tts_sentence(TtsState::SentenceEnd, &item.text, &session.session_id);
                if session.transport.send_control(&end).await.is_err() {
                    return;
                }
                debug!(
                    session = %session.session_id,
                    "segment {} complete ({} frames)",
                    item.index,
                    item.frames.len()
                );
            }
            PaceOutcome::Aborted => {
                info!(session = %session.session_id, "barge-in during segment {}", item.index);
                drain(&mut rx);
                abort_finish(&session).await;
                return;
            }
            PaceOutcome::TransportGone => return,
        }
    }
}

/// Send frames at real-time rate against a per-segment clock
async fn pace_frames(
    session: &Session,
    token: &CancellationToken,
    frames: &[Bytes],
) -> PaceOutcome {
    let t0 = Instant::now();
    let mut play_position = Duration::ZERO;

    let prime = frames.len().min(PRE_BUFFER_FRAMES);
    for frame in &frames[..prime] {
        if session.transport.send_audio(frame.clone()).await.is_err() {
            return PaceOutcome::TransportGone;
        }
        play_position += FRAME_DURATION;
    }

    for frame in &frames[prime..] {
        if session.client_abort.load(Ordering::SeqCst) || token.is_cancelled() {
            return PaceOutcome::Aborted;
        }

        let expected = t0 + play_position;
        let now = Instant::now();
        if expected > now {
            tokio::time::sleep((expected - now).min(MAX_SLEEP)).await;
        }

        if session.client_abort.load(Ordering::SeqCst) || token.is_cancelled() {
            return PaceOutcome::Aborted;
        }
        if session.transport.send_audio(frame.clone()).await.is_err() {
            return PaceOutcome::TransportGone;
        }
        play_position += FRAME_DURATION;
    }

    PaceOutcome::Completed
}

/// Throw away everything still queued for this reply
fn drain(rx: &mut mpsc::Receiver<SpeakItem>) {
    while rx.try_recv().is_ok() {}
}

/// Reply finished on its own: optional stop chime, `tts stop`, state reset,
/// and session close when an exit phrase scheduled one.
async fn natural_finish(session: &Session, notify_frames: Option<&Vec<Bytes>>) {
    if let Some(frames) = notify_frames {
        let token = CancellationToken::new();
        if !matches!(pace_frames(session, &token, frames).await, PaceOutcome::Completed) {
            warn!(session = %session.session_id, "stop-notify chime interrupted");
        }
    }
    let stop = ServerMessage::tts(TtsState::Stop, &session.session_id);
    let _ = session.transport.send_control(&stop).await;
    session.clear_speak_status();

    if session.close_after_reply.load(Ordering::SeqCst) {
        info!(session = %session.session_id, "closing session after reply");
        session.shutdown().await;
    }
}

/// Barge-in or cancellation: immediate `tts stop`, no chime
async fn abort_finish(session: &Session) {
    let stop = ServerMessage::tts(TtsState::Stop, &session.session_id);
    let _ = session.transport.send_control(&stop).await;
    session.clear_speak_status();
}
