//! ASR dispatch
//!
//! Takes one completed utterance to the ASR provider. At most one dispatch
//! is in flight per session, enforced through `asr_server_receive`; timeouts
//! and provider failures come back as an empty transcript so the state
//! machine just returns to Idle.

use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::audio::AudioChunk;
use crate::providers::AsrProvider;
use crate::session::Session;

/// Run the utterance through ASR. Returns the transcript, empty on
/// timeout/failure/cancellation. The caller has already claimed the
/// dispatch slot by flipping `asr_server_receive` to false.
pub async fn dispatch(
    session: &Session,
    asr: &Arc<dyn AsrProvider>,
    chunks: Vec<AudioChunk>,
    timeout_ms: u64,
) -> String {
    if chunks.is_empty() {
        return String::new();
    }
    info!(
        session = %session.session_id,
        "dispatching {} chunks to ASR",
        chunks.len()
    );

    let recognize = asr.recognize(&chunks, &session.session_id);
    let result = tokio::select! {
        _ = session.cancel.cancelled() => {
            info!(session = %session.session_id, "asr dispatch cancelled");
            return String::new();
        }
        result = tokio::time::timeout(Duration::from_millis(timeout_ms), recognize) => result,
    };

    match result {
        Ok(Ok(text)) => text,
        Ok(Err(e)) => {
            warn!(session = %session.session_id, "asr failed: {e}");
            String::new()
        }
        Err(_) => {
            warn!(
                session = %session.session_id,
                "asr timed out after {timeout_ms} ms"
            );
            String::new()
        }
    }
}
