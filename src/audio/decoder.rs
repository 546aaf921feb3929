//! # Audio Frame Decoding
//!
//! Turns the wire payload of an `audio_frame` message into float samples.
//!
//! ## Wire Format:
//! - **Encoding**: base64 (standard alphabet, padding optional)
//! - **Samples**: 16-bit signed PCM, little-endian, mono, 16kHz
//!
//! ## Leniency:
//! A trailing odd byte is dropped rather than rejected. Clients on lossy
//! networks sometimes cut a frame mid-sample; the whole samples before it are
//! still usable. Only malformed base64 is a decode error.

use super::normalizer::{downmix_to_mono, resample_linear, SAMPLE_RATE};
use crate::error::PipelineError;
use base64::alphabet;
use base64::engine::general_purpose::{GeneralPurpose, GeneralPurposeConfig};
use base64::engine::DecodePaddingMode;
use base64::Engine;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::Cursor;

/// Scale between i16 PCM and [-1, 1] floats.
pub const PCM_SCALE: f32 = 32768.0;

const PAYLOAD_ENGINE: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

/// Decoder for base64 PCM16 payloads.
#[derive(Debug, Default, Clone, Copy)]
pub struct AudioFrameDecoder;

impl AudioFrameDecoder {
    pub fn new() -> Self {
        Self
    }

    /// Decode a base64 payload into samples scaled to [-1, 1].
    ///
    /// An empty payload decodes to an empty sample sequence.
    pub fn decode(&self, payload: &str) -> Result<Vec<f32>, PipelineError> {
        let bytes = PAYLOAD_ENGINE
            .decode(payload.trim())
            .map_err(|e| PipelineError::Decode(e.to_string()))?;

        Ok(pcm16_to_float(&bytes))
    }
}

/// Convert little-endian PCM16 bytes to floats, dropping an incomplete trailing sample.
pub fn pcm16_to_float(bytes: &[u8]) -> Vec<f32> {
    let mut cursor = Cursor::new(bytes);
    let mut samples = Vec::with_capacity(bytes.len() / 2);

    while let Ok(sample) = cursor.read_i16::<LittleEndian>() {
        samples.push(sample as f32 / PCM_SCALE);
    }

    samples
}

/// Encode float samples as a base64 PCM16 payload (the client side of the wire format).
pub fn encode_pcm16(samples: &[f32]) -> String {
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for &sample in samples {
        let scaled = (sample * PCM_SCALE).round().clamp(-32768.0, 32767.0) as i16;
        // Writing into a Vec cannot fail.
        let _ = bytes.write_i16::<LittleEndian>(scaled);
    }
    PAYLOAD_ENGINE.encode(bytes)
}

/// An uploaded recording, mixed to mono and resampled to 16kHz.
#[derive(Debug, Clone)]
pub struct Recording {
    pub samples: Vec<f32>,
    pub source_sample_rate: u32,
    pub source_channels: u16,
}

/// Decode a RIFF/WAV file of any common bit depth.
pub fn decode_wav(bytes: &[u8]) -> Result<Recording, PipelineError> {
    let mut reader = Cursor::new(bytes);
    let (header, data) = wav::read(&mut reader).map_err(|e| PipelineError::Decode(format!("invalid WAV file: {}", e)))?;

    let interleaved: Vec<f32> = match data {
        wav::BitDepth::Eight(samples) => samples.iter().map(|&s| (s as f32 - 128.0) / 128.0).collect(),
        wav::BitDepth::Sixteen(samples) => samples.iter().map(|&s| s as f32 / PCM_SCALE).collect(),
        wav::BitDepth::TwentyFour(samples) => samples.iter().map(|&s| s as f32 / 8_388_608.0).collect(),
        wav::BitDepth::ThirtyTwoFloat(samples) => samples,
        wav::BitDepth::Empty => Vec::new(),
    };

    let mono = downmix_to_mono(&interleaved, header.channel_count);
    Ok(Recording {
        samples: resample_linear(&mono, header.sampling_rate, SAMPLE_RATE),
        source_sample_rate: header.sampling_rate,
        source_channels: header.channel_count,
    })
}
