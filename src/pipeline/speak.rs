//! TTS streaming
//!
//! Consumes the dialogue engine's reply segments, synthesises each one, and
//! queues the result for the pacer in index order. Allocates the monotonic
//! segment indices and maintains the session's first/last bookkeeping.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::pacer::{self, SpeakItem};
use crate::dialogue::{ReplyEvent, APOLOGY_REPLY};
use crate::providers::TtsProvider;
use crate::session::Session;

/// Synthesis attempts per segment. Provider failures are typically fast and
/// transient, so there is no backoff gap.
const TTS_MAX_ATTEMPTS: usize = 5;

/// Segment queue depth between streamer and pacer
const SEGMENT_QUEUE: usize = 8;

/// Drive one reply end-to-end: spawn the pacer, synthesise each segment,
/// and let the pacer finish (stop marker, state reset) once the last
/// segment is queued. Returns when the reply is fully paced or aborted.
pub async fn run_reply(
    session: Arc<Session>,
    tts: Arc<dyn TtsProvider>,
    mut reply_rx: mpsc::Receiver<ReplyEvent>,
    token: CancellationToken,
    notify_frames: Option<Arc<Vec<bytes::Bytes>>>,
) {
    let (seg_tx, seg_rx) = mpsc::channel::<SpeakItem>(SEGMENT_QUEUE);
    let pacer_task = tokio::spawn(pacer::run(
        session.clone(),
        seg_rx,
        token.clone(),
        notify_frames,
    ));

    let mut next_index = 0u32;
    let mut apologized = false;

    while let Some(event) = reply_rx.recv().await {
        if token.is_cancelled() {
            break;
        }
        let text = match event {
            ReplyEvent::Segment(text) => text,
            ReplyEvent::Done => break,
        };
        if text.trim().is_empty() {
            continue;
        }

        next_index += 1;
        let index = next_index;
        session.tts_last_index.store(index, Ordering::SeqCst);

        match synthesize_with_retry(&session, &tts, &text).await {
            Some(frames) => {
                session
                    .tts_first_index
                    .compare_exchange(0, index, Ordering::SeqCst, Ordering::SeqCst)
                    .ok();
                if seg_tx
                    .send(SpeakItem { index, text, frames })
                    .await
                    .is_err()
                {
                    // pacer gone (barge-in); stop synthesising
                    break;
                }
            }
            None => {
                warn!(
                    session = %session.session_id,
                    "dropping segment {index} after {TTS_MAX_ATTEMPTS} tts attempts"
                );
                if !apologized {
                    apologized = true;
                    if let Some(frames) =
                        synthesize_with_retry(&session, &tts, APOLOGY_REPLY).await
                    {
                        session
                            .tts_first_index
                            .compare_exchange(0, index, Ordering::SeqCst, Ordering::SeqCst)
                            .ok();
                        let item = SpeakItem {
                            index,
                            text: APOLOGY_REPLY.to_string(),
                            frames,
                        };
                        if seg_tx.send(item).await.is_err() {
                            break;
                        }
                    }
                }
            }
        }
    }

    // closing the queue tells the pacer the reply is complete
    drop(seg_tx);
    let _ = pacer_task.await;
}

async fn synthesize_with_retry(
    session: &Session,
    tts: &Arc<dyn TtsProvider>,
    text: &str,
) -> Option<Vec<bytes::Bytes>> {
    let voice = session.voice_id();
    for attempt in 1..=TTS_MAX_ATTEMPTS {
        match tts.synthesize(text, &voice).await {
            Ok((frames, duration)) => {
                debug!(
                    session = %session.session_id,
                    "tts ok on attempt {attempt}: {} frames ({duration:.2}s)",
                    frames.len()
                );
                return Some(frames);
            }
            Err(e) => {
                warn!(
                    session = %session.session_id,
                    "tts attempt {attempt}/{TTS_MAX_ATTEMPTS} failed: {e}"
                );
            }
        }
    }
    None
}
