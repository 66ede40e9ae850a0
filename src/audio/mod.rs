//! Audio types and codec
//!
//! Everything that crosses a module boundary as audio is an [`AudioChunk`]
//! with an explicit format tag. Conversions happen only in [`codec`].

pub mod codec;

use bytes::Bytes;

/// Target sample rate for the whole pipeline
pub const SAMPLE_RATE: u32 = 16_000;

/// Frame duration on the wire. Load-bearing: it matches the play-out
/// cadence and the Opus encoder window, and must not vary.
pub const FRAME_MS: u64 = 20;

/// Samples per 20 ms frame at 16 kHz
pub const FRAME_SAMPLES: usize = (SAMPLE_RATE as usize / 1000) * FRAME_MS as usize;

/// Bytes per 20 ms frame (s16le)
pub const FRAME_BYTES: usize = FRAME_SAMPLES * 2;

/// Encoding of an [`AudioChunk`]'s payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioFormat {
    /// Opus packet as received from the client
    Opus,
    /// Opus packet re-encoded server-side from decoded PCM
    OpusConverted,
    /// Raw s16le PCM
    Pcm16,
}

/// One tagged piece of audio, kept in arrival order by the utterance buffer
#[derive(Debug, Clone)]
pub struct AudioChunk {
    pub data: Bytes,
    pub format: AudioFormat,
    pub sample_rate: u32,
    pub channels: u16,
    pub timestamp_ms: u64,
}

impl AudioChunk {
    pub fn opus(data: Bytes, timestamp_ms: u64) -> Self {
        Self {
            data,
            format: AudioFormat::Opus,
            sample_rate: SAMPLE_RATE,
            channels: 1,
            timestamp_ms,
        }
    }

    pub fn opus_converted(data: Bytes, timestamp_ms: u64) -> Self {
        Self {
            data,
            format: AudioFormat::OpusConverted,
            sample_rate: SAMPLE_RATE,
            channels: 1,
            timestamp_ms,
        }
    }

    pub fn pcm16(data: Bytes, sample_rate: u32, channels: u16, timestamp_ms: u64) -> Self {
        Self {
            data,
            format: AudioFormat::Pcm16,
            sample_rate,
            channels,
            timestamp_ms,
        }
    }

    /// Approximate duration; exact for PCM, nominal 20 ms for Opus packets
    pub fn duration_ms(&self) -> u64 {
        match self.format {
            AudioFormat::Pcm16 => {
                let samples = self.data.len() as u64 / 2 / self.channels.max(1) as u64;
                samples * 1000 / self.sample_rate.max(1) as u64
            }
            AudioFormat::Opus | AudioFormat::OpusConverted => FRAME_MS,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_constants() {
        assert_eq!(FRAME_SAMPLES, 320);
        assert_eq!(FRAME_BYTES, 640);
    }

    #[test]
    fn test_chunk_duration() {
        let pcm = AudioChunk::pcm16(Bytes::from(vec![0u8; FRAME_BYTES]), SAMPLE_RATE, 1, 0);
        assert_eq!(pcm.duration_ms(), 20);

        let opus = AudioChunk::opus(Bytes::from_static(&[0xfc, 0xff, 0xfe]), 0);
        assert_eq!(opus.duration_ms(), 20);
    }
}
