//! Silero VAD over ONNX Runtime
//!
//! Wraps the Silero VAD v5 model. The hidden state tensor (2, 1, 128)
//! persists across calls, so each session gets its own instance; the model
//! file itself is shared on disk and pointed at by `vad.model_path`.

use anyhow::{Context, Result};
use ort::session::Session;
use std::path::Path;
use tracing::{debug, info};

use super::{VadModel, WINDOW_SAMPLES};

const SAMPLE_RATE: i64 = 16_000;
const STATE_LEN: usize = 2 * 1 * 128;

pub struct SileroVad {
    session: Session,
    /// Hidden state tensor (2, 1, 128), carried between windows
    state: Vec<f32>,
    threshold: f32,
}

impl SileroVad {
    /// Load the model from disk with the configured speech threshold
    pub fn load(model_path: &Path, threshold: f32) -> Result<Self> {
        let session = Session::builder()?
            .with_intra_threads(1)?
            .commit_from_file(model_path)
            .with_context(|| {
                format!("failed to create ONNX session for {}", model_path.display())
            })?;

        info!("Silero VAD loaded from {}", model_path.display());

        Ok(Self { session, state: vec![0.0f32; STATE_LEN], threshold })
    }

    fn run_inference(&mut self, audio: &[f32]) -> Result<f32> {
        use ort::value::Value;

        let input = Value::from_array(([1usize, audio.len()], audio.to_vec()))?;
        let state = Value::from_array(([2usize, 1usize, 128usize], self.state.clone()))?;
        let sr = Value::from_array(([1usize], vec![SAMPLE_RATE]))?;

        let outputs = self.session.run(ort::inputs![input, state, sr])?;

        // output 0 is the speech probability
        let (_prob_shape, prob_data) = outputs[0].try_extract_tensor::<f32>()?;
        let prob = prob_data.first().copied().unwrap_or(0.0);

        // output 1 is the new hidden state
        let (_state_shape, new_state) = outputs[1].try_extract_tensor::<f32>()?;
        if new_state.len() == self.state.len() {
            self.state.copy_from_slice(new_state);
        }

        Ok(prob)
    }
}

impl VadModel for SileroVad {
    fn is_speech(&mut self, frame: &[f32]) -> Result<(bool, f32)> {
        anyhow::ensure!(
            frame.len() == WINDOW_SAMPLES,
            "expected {} samples, got {}",
            WINDOW_SAMPLES,
            frame.len()
        );
        let prob = self.run_inference(frame)?;
        Ok((prob >= self.threshold, prob))
    }

    fn reset(&mut self) {
        self.state.fill(0.0);
        debug!("Silero VAD state reset");
    }
}
