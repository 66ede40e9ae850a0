//! Opus <-> PCM conversion and 20 ms framing
//!
//! Decoding is stateful: each session keeps one [`StreamDecoder`] and feeds
//! it every inbound chunk in order. Encoding frames PCM into exact
//! 320-sample windows (zero-padded tail) and produces one Opus packet per
//! window, the shape the play-out pacer expects.

use bytes::Bytes;
use rubato::{FastFixedIn, PolynomialDegree, Resampler};
use std::path::Path;
use tracing::{debug, warn};

use super::{AudioChunk, AudioFormat, FRAME_SAMPLES, SAMPLE_RATE};
use crate::error::MediaError;

/// Upper bound on decoded samples per Opus packet (120 ms at 16 kHz)
const MAX_DECODED_SAMPLES: usize = 1920;

/// Generous ceiling for an encoded Opus frame
const MAX_OPUS_PACKET_BYTES: usize = 4000;

/// Per-session stateful decoder: Opus packets or foreign-rate PCM in,
/// 16 kHz mono s16le out.
pub struct StreamDecoder {
    opus: opus::Decoder,
    resampler: Option<RateConverter>,
    resampler_rate: u32,
}

impl StreamDecoder {
    pub fn new() -> Result<Self, MediaError> {
        let opus = opus::Decoder::new(SAMPLE_RATE, opus::Channels::Mono)
            .map_err(|e| MediaError::DecodeFailed(format!("opus decoder init: {e}")))?;
        Ok(Self { opus, resampler: None, resampler_rate: 0 })
    }

    /// Decode one chunk to 16 kHz mono s16le samples
    pub fn decode_to_pcm(&mut self, chunk: &AudioChunk) -> Result<Vec<i16>, MediaError> {
        match chunk.format {
            AudioFormat::Opus | AudioFormat::OpusConverted => {
                let mut out = vec![0i16; MAX_DECODED_SAMPLES];
                let n = self
                    .opus
                    .decode(&chunk.data, &mut out, false)
                    .map_err(|e| MediaError::DecodeFailed(format!("opus decode: {e}")))?;
                out.truncate(n);
                Ok(out)
            }
            AudioFormat::Pcm16 => {
                if chunk.data.len() % 2 != 0 {
                    return Err(MediaError::DecodeFailed(format!(
                        "odd pcm16 payload length {}",
                        chunk.data.len()
                    )));
                }
                let interleaved: Vec<i16> = chunk
                    .data
                    .chunks_exact(2)
                    .map(|b| i16::from_le_bytes([b[0], b[1]]))
                    .collect();
                let mono = downmix(&interleaved, chunk.channels);
                if chunk.sample_rate == SAMPLE_RATE {
                    return Ok(mono);
                }
                if self.resampler.is_none() || self.resampler_rate != chunk.sample_rate {
                    self.resampler = Some(RateConverter::new(chunk.sample_rate, SAMPLE_RATE)?);
                    self.resampler_rate = chunk.sample_rate;
                }
                let converter = self.resampler.as_mut().expect("resampler just set");
                Ok(converter.process_i16(&mono))
            }
        }
    }
}

/// Average interleaved channels down to mono
fn downmix(interleaved: &[i16], channels: u16) -> Vec<i16> {
    if channels <= 1 {
        return interleaved.to_vec();
    }
    let ch = channels as usize;
    interleaved
        .chunks_exact(ch)
        .map(|frame| (frame.iter().map(|&s| s as i32).sum::<i32>() / ch as i32) as i16)
        .collect()
}

/// Converts f32 mono audio between fixed sample rates, accumulating partial
/// rubato chunks between calls. Passthrough when the rates already match.
pub struct RateConverter {
    resampler: Option<FastFixedIn<f32>>,
    input_buf: Vec<f32>,
    chunk_size: usize,
}

impl RateConverter {
    const CHUNK: usize = 960;

    pub fn new(from_rate: u32, to_rate: u32) -> Result<Self, MediaError> {
        if from_rate == to_rate {
            return Ok(Self { resampler: None, input_buf: Vec::new(), chunk_size: Self::CHUNK });
        }
        let ratio = to_rate as f64 / from_rate as f64;
        let resampler =
            FastFixedIn::<f32>::new(ratio, 1.0, PolynomialDegree::Septic, Self::CHUNK, 1)
                .map_err(|e| MediaError::ResampleFailed(e.to_string()))?;
        Ok(Self { resampler: Some(resampler), input_buf: Vec::new(), chunk_size: Self::CHUNK })
    }

    /// Feed samples, get whatever full chunks convert. Remainder is held
    /// for the next call.
    pub fn process(&mut self, samples: &[f32]) -> Vec<f32> {
        let Some(resampler) = self.resampler.as_mut() else {
            return samples.to_vec();
        };
        self.input_buf.extend_from_slice(samples);
        let mut out = Vec::new();
        while self.input_buf.len() >= self.chunk_size {
            let chunk: Vec<f32> = self.input_buf.drain(..self.chunk_size).collect();
            match resampler.process(&[chunk], None) {
                Ok(mut converted) => out.append(&mut converted.remove(0)),
                Err(e) => {
                    warn!("resampler error, dropping chunk: {e}");
                }
            }
        }
        out
    }

    /// i16 convenience wrapper used by the decode path
    fn process_i16(&mut self, samples: &[i16]) -> Vec<i16> {
        let float: Vec<f32> = samples.iter().map(|&s| s as f32 / 32768.0).collect();
        self.process(&float)
            .into_iter()
            .map(|s| (s * 32767.0).clamp(-32768.0, 32767.0) as i16)
            .collect()
    }

    /// Flush the tail by zero-padding to a full chunk
    pub fn finish(&mut self) -> Vec<f32> {
        if self.resampler.is_none() || self.input_buf.is_empty() {
            return Vec::new();
        }
        let pad = self.chunk_size - self.input_buf.len() % self.chunk_size;
        if pad < self.chunk_size {
            let zeros = vec![0.0f32; pad];
            self.input_buf.extend_from_slice(&zeros);
        }
        let tail: Vec<f32> = self.input_buf.drain(..).collect();
        // input_buf is now chunk-aligned, so process() consumes it fully
        self.process_tail(tail)
    }

    fn process_tail(&mut self, tail: Vec<f32>) -> Vec<f32> {
        let Some(resampler) = self.resampler.as_mut() else {
            return tail;
        };
        let mut out = Vec::new();
        for chunk in tail.chunks(self.chunk_size) {
            if chunk.len() < self.chunk_size {
                break;
            }
            if let Ok(mut converted) = resampler.process(&[chunk.to_vec()], None) {
                out.append(&mut converted.remove(0));
            }
        }
        out
    }
}

/// Frame 16 kHz mono s16le PCM into 20 ms windows and Opus-encode each.
/// Returns the packets and the audio duration in seconds.
pub fn encode_pcm_to_opus(pcm: &[i16]) -> Result<(Vec<Bytes>, f64), MediaError> {
    let mut encoder = opus::Encoder::new(SAMPLE_RATE, opus::Channels::Mono, opus::Application::Audio)
        .map_err(|e| MediaError::EncodeFailed(format!("opus encoder init: {e}")))?;

    let mut packets = Vec::with_capacity(pcm.len() / FRAME_SAMPLES + 1);
    let mut window = [0i16; FRAME_SAMPLES];
    for frame in pcm.chunks(FRAME_SAMPLES) {
        let input: &[i16] = if frame.len() == FRAME_SAMPLES {
            frame
        } else {
            // trailing window: zero-pad to a full 20 ms
            window.fill(0);
            window[..frame.len()].copy_from_slice(frame);
            &window
        };
        let packet = encoder
            .encode_vec(input, MAX_OPUS_PACKET_BYTES)
            .map_err(|e| MediaError::EncodeFailed(format!("opus encode: {e}")))?;
        packets.push(Bytes::from(packet));
    }

    let duration = pcm.len() as f64 / SAMPLE_RATE as f64;
    debug!("encoded {} opus frames ({duration:.2}s)", packets.len());
    Ok((packets, duration))
}

/// Read a WAV file, convert to 16 kHz mono, and Opus-encode it.
/// Used for the stop-notify chime.
pub fn encode_wav_file(path: &Path) -> Result<(Vec<Bytes>, f64), MediaError> {
    let bytes = std::fs::read(path)
        .map_err(|e| MediaError::DecodeFailed(format!("open wav {}: {e}", path.display())))?;
    let pcm = wav_bytes_to_pcm(&bytes)?;
    encode_pcm_to_opus(&pcm)
}

/// Decode an in-memory WAV to 16 kHz mono s16le. Used for file ingest and
/// for TTS providers that respond with WAV bodies.
pub fn wav_bytes_to_pcm(bytes: &[u8]) -> Result<Vec<i16>, MediaError> {
    let mut reader = hound::WavReader::new(std::io::Cursor::new(bytes))
        .map_err(|e| MediaError::DecodeFailed(format!("parse wav: {e}")))?;
    let spec = reader.spec();

    let interleaved: Vec<i16> = match spec.sample_format {
        hound::SampleFormat::Int => reader
            .samples::<i16>()
            .collect::<Result<_, _>>()
            .map_err(|e| MediaError::DecodeFailed(format!("read wav samples: {e}")))?,
        hound::SampleFormat::Float => reader
            .samples::<f32>()
            .map(|s| s.map(|v| (v.clamp(-1.0, 1.0) * 32767.0) as i16))
            .collect::<Result<_, _>>()
            .map_err(|e| MediaError::DecodeFailed(format!("read wav samples: {e}")))?,
    };

    let mono = downmix(&interleaved, spec.channels);
    if spec.sample_rate == SAMPLE_RATE {
        return Ok(mono);
    }
    let mut converter = RateConverter::new(spec.sample_rate, SAMPLE_RATE)?;
    let float: Vec<f32> = mono.iter().map(|&s| s as f32 / 32768.0).collect();
    let mut out = converter.process(&float);
    out.extend(converter.finish());
    Ok(out
        .into_iter()
        .map(|s| (s * 32767.0).clamp(-32768.0, 32767.0) as i16)
        .collect())
}

/// Concatenate utterance chunks into one 16 kHz mono s16le blob for ASR
pub fn chunks_to_pcm_blob(chunks: &[AudioChunk]) -> Vec<u8> {
    let mut decoder = match StreamDecoder::new() {
        Ok(d) => d,
        Err(e) => {
            warn!("decoder init for ASR blob failed: {e}");
            return Vec::new();
        }
    };
    let mut blob = Vec::new();
    for chunk in chunks {
        match decoder.decode_to_pcm(chunk) {
            Ok(pcm) => {
                for sample in pcm {
                    blob.extend_from_slice(&sample.to_le_bytes());
                }
            }
            Err(e) => debug!("dropping undecodable chunk in ASR blob: {e}"),
        }
    }
    blob
}
