//! # Frame Normalization
//!
//! The recurrent models are trained on fixed 32ms windows: 512 samples at 16kHz.
//! Every inbound frame is forced to that size before feature extraction or
//! inference. Windowing across frames is the caller's job; this never slides.

/// Samples per model frame (32ms at 16kHz).
pub const FRAME_SIZE: usize = 512;

/// Sample rate every model in this service expects.
pub const SAMPLE_RATE: u32 = 16_000;

/// Pads or truncates sample sequences to a fixed frame size.
#[derive(Debug, Clone, Copy)]
pub struct FrameNormalizer {
    frame_size: usize,
}

impl Default for FrameNormalizer {
    fn default() -> Self {
        Self::new(FRAME_SIZE)
    }
}

impl FrameNormalizer {
    pub fn new(frame_size: usize) -> Self {
        Self { frame_size }
    }

    /// Right-pad with zeros when short, keep the first `frame_size` samples when long.
    pub fn normalize(&self, samples: &[f32]) -> Vec<f32> {
        let mut frame = Vec::with_capacity(self.frame_size);
        let take = samples.len().min(self.frame_size);
        frame.extend_from_slice(&samples[..take]);
        frame.resize(self.frame_size, 0.0);
        frame
    }
}

/// Linear-interpolation resampler used for uploaded recordings.
///
/// Streaming frames are always 16kHz; only the WAV analysis path needs this.
pub fn resample_linear(samples: &[f32], from_rate: u32, to_rate: u32) -> Vec<f32> {
    if from_rate == to_rate || samples.is_empty() || from_rate == 0 {
        return samples.to_vec();
    }

    let ratio = to_rate as f64 / from_rate as f64;
    let out_len = (samples.len() as f64 * ratio) as usize;
    let last = samples.len() - 1;

    (0..out_len)
        .map(|i| {
            let position = i as f64 / ratio;
            let index = position.floor() as usize;
            if index >= last {
                return samples[last];
            }
            let frac = (position - index as f64) as f32;
            samples[index] * (1.0 - frac) + samples[index + 1] * frac
        })
        .collect()
}

/// Mix interleaved multi-channel samples down to mono by averaging.
pub fn downmix_to_mono(interleaved: &[f32], channels: u16) -> Vec<f32> {
    if channels <= 1 {
        return interleaved.to_vec();
    }
    interleaved
        .chunks(channels as usize)
        .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
        .collect()
}
