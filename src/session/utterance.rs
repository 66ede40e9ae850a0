//! Utterance buffer
//!
//! Ordered chunks for the utterance currently being spoken. Append is O(1);
//! take-and-clear hands the whole list to the ASR dispatcher atomically.

use tracing::warn;

use crate::audio::AudioChunk;

pub struct UtteranceBuffer {
    chunks: Vec<AudioChunk>,
    buffered_ms: u64,
    cap_ms: u64,
}

impl UtteranceBuffer {
    /// `cap_seconds`: force-dispatch threshold when no end event arrives
    pub fn new(cap_seconds: u64) -> Self {
        Self {
            chunks: Vec::new(),
            buffered_ms: 0,
            cap_ms: cap_seconds * 1000,
        }
    }

    /// Append one chunk. Returns true when the buffer has exceeded its cap
    /// and the caller must force-dispatch.
    pub fn push(&mut self, chunk: AudioChunk) -> bool {
        self.buffered_ms += chunk.duration_ms();
        self.chunks.push(chunk);
        if self.buffered_ms >= self.cap_ms {
            warn!(
                "utterance exceeded {} s without an end event, forcing dispatch",
                self.cap_ms / 1000
            );
            return true;
        }
        false
    }

    /// Take every buffered chunk, leaving the buffer empty
    pub fn take_all(&mut self) -> Vec<AudioChunk> {
        self.buffered_ms = 0;
        std::mem::take(&mut self.chunks)
    }

    pub fn clear(&mut self) {
        self.buffered_ms = 0;
        self.chunks.clear();
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn buffered_ms(&self) -> u64 {
        self.buffered_ms
    }
}
