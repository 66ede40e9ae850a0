//! Voice activity gate
//!
//! Accumulates raw PCM, runs the VAD model per 512-sample window, and emits
//! speech-start / speech-end events with a silence hangover. The gate is
//! advisory: manual push-to-talk ends utterances by explicit message, and
//! wakeword mode ignores audio entirely — the session decides which events
//! to honour.

pub mod silero;

use tracing::trace;

/// Samples per VAD window (32 ms at 16 kHz)
pub const WINDOW_SAMPLES: usize = 512;

/// Bytes per VAD window (s16le)
pub const WINDOW_BYTES: usize = WINDOW_SAMPLES * 2;

/// The model behind the gate. One implementation wraps Silero over ONNX;
/// tests use scripted fakes.
pub trait VadModel: Send {
    /// Classify one 512-sample 16 kHz window. Returns (is_speech, probability).
    fn is_speech(&mut self, frame: &[f32]) -> anyhow::Result<(bool, f32)>;

    /// Clear any internal model state between utterance streams
    fn reset(&mut self) {}
}

/// Events the gate emits, zero or more per `push`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VadEvent {
    SpeechStart,
    SpeechContinue,
    SpeechEnd,
}

/// Per-session gate state
pub struct VadGate {
    model: Box<dyn VadModel>,
    pending: Vec<u8>,
    in_speech: bool,
    last_speech_ms: u64,
    min_silence_ms: u64,
}

impl VadGate {
    pub fn new(model: Box<dyn VadModel>, min_silence_ms: u64) -> Self {
        Self {
            model,
            pending: Vec::with_capacity(WINDOW_BYTES * 4),
            in_speech: false,
            last_speech_ms: 0,
            min_silence_ms,
        }
    }

    /// Feed PCM bytes of arbitrary length; `now_ms` is the arrival clock
    /// used for the silence hangover.
    pub fn push(&mut self, pcm: &[u8], now_ms: u64) -> Vec<VadEvent> {
        self.pending.extend_from_slice(pcm);
        let mut events = Vec::new();

        while self.pending.len() >= WINDOW_BYTES {
            let window: Vec<u8> = self.pending.drain(..WINDOW_BYTES).collect();
            let floats: Vec<f32> = window
                .chunks_exact(2)
                .map(|b| i16::from_le_bytes([b[0], b[1]]) as f32 / 32768.0)
                .collect();

            let (speech, prob) = match self.model.is_speech(&floats) {
                Ok(r) => r,
                Err(e) => {
                    // inference failure: treat the window as silence and move on
                    trace!("vad inference error: {e}");
                    (false, 0.0)
                }
            };
            trace!("vad window: prob={prob:.3} speech={speech}");

            if speech {
                if !self.in_speech {
                    self.in_speech = true;
                    events.push(VadEvent::SpeechStart);
                } else {
                    events.push(VadEvent::SpeechContinue);
                }
                self.last_speech_ms = now_ms;
            } else if self.in_speech {
                let silence = now_ms.saturating_sub(self.last_speech_ms);
                if silence >= self.min_silence_ms {
                    self.in_speech = false;
                    events.push(VadEvent::SpeechEnd);
                }
                // shorter silences are within-utterance pauses
            }
        }

        events
    }

    pub fn in_speech(&self) -> bool {
        self.in_speech
    }

    pub fn last_speech_ms(&self) -> u64 {
        self.last_speech_ms
    }

    /// Forget buffered audio and speech state (utterance dispatched or
    /// session reset)
    pub fn reset(&mut self) {
        self.pending.clear();
        self.in_speech = false;
        self.last_speech_ms = 0;
        self.model.reset();
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::ScriptedVad;
    use super::*;

    fn window_bytes() -> Vec<u8> {
        vec![0u8; WINDOW_BYTES]
    }

    #[test]
    fn test_speech_start_emitted_once() {
        let model = ScriptedVad::new(vec![true, true, true]);
        let mut gate = VadGate::new(Box::new(model), 1000);

        let events = gate.push(&window_bytes(), 0);
        assert_eq!(events, vec![VadEvent::SpeechStart]);

        let events = gate.push(&window_bytes(), 32);
        assert_eq!(events, vec![VadEvent::SpeechContinue]);
        assert!(gate.in_speech());
        assert_eq!(gate.last_speech_ms(), 32);
    }

    #[test]
    fn test_short_silence_is_within_utterance_pause() {
        let model = ScriptedVad::new(vec![true, false, false, true]);
        let mut gate = VadGate::new(Box::new(model), 1000);

        gate.push(&window_bytes(), 0);
        // 500 ms of silence: below the hangover, no end event
        assert!(gate.push(&window_bytes(), 500).is_empty());
        assert!(gate.push(&window_bytes(), 900).is_empty());
        assert!(gate.in_speech());

        let events = gate.push(&window_bytes(), 950);
        assert_eq!(events, vec![VadEvent::SpeechContinue]);
    }

    #[test]
    fn test_long_silence_ends_speech() {
        let model = ScriptedVad::new(vec![true, false]);
        let mut gate = VadGate::new(Box::new(model), 1000);

        gate.push(&window_bytes(), 0);
        let events = gate.push(&window_bytes(), 1200);
        assert_eq!(events, vec![VadEvent::SpeechEnd]);
        assert!(!gate.in_speech());
    }

    #[test]
    fn test_partial_windows_are_buffered() {
        let model = ScriptedVad::new(vec![true]);
        let mut gate = VadGate::new(Box::new(model), 1000);

        // half a window: nothing to classify yet
        assert!(gate.push(&vec![0u8; WINDOW_BYTES / 2], 0).is_empty());
        // second half completes the window
        let events = gate.push(&vec![0u8; WINDOW_BYTES / 2], 10);
        assert_eq!(events, vec![VadEvent::SpeechStart]);
    }

    #[test]
    fn test_multiple_windows_per_push() {
        let model = ScriptedVad::new(vec![true, true, true]);
        let mut gate = VadGate::new(Box::new(model), 1000);

        let events = gate.push(&vec![0u8; WINDOW_BYTES * 3], 0);
        assert_eq!(
            events,
            vec![VadEvent::SpeechStart, VadEvent::SpeechContinue, VadEvent::SpeechContinue]
        );
    }

    #[test]
    fn test_reset_clears_state() {
        let model = ScriptedVad::new(vec![true, true]);
        let mut gate = VadGate::new(Box::new(model), 1000);
        gate.push(&window_bytes(), 0);
        assert!(gate.in_speech());

        gate.reset();
        assert!(!gate.in_speech());
        assert_eq!(gate.last_speech_ms(), 0);
    }
}
