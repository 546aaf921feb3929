//! # Feature Extraction
//!
//! Models of the `ten` family consume a `[3, 41]` energy profile instead of the
//! raw waveform. Three coarse frequency regions are derived with cheap filters:
//!
//! - **low**: every 4th sample (crude decimation)
//! - **mid**: first difference, every 2nd sample (basic high-pass)
//! - **high**: second difference (stronger high-pass)
//!
//! Each region is split into 41 sub-frames and reduced to RMS energy; the whole
//! tensor is then standardized to zero mean and unit variance.
//!
//! The transform is a stand-in for a real spectral front end. Callers only rely
//! on the output shape and the standardization, so it can be swapped out behind
//! `FeatureExtractor::extract` without touching the pipeline.

use super::normalizer::FrameNormalizer;

/// Frequency regions in the feature tensor.
pub const FEATURE_BANDS: usize = 3;

/// Energy points per region.
pub const FEATURE_FRAMES: usize = 41;

const STD_EPSILON: f32 = 1e-8;

/// Row-major `[bands, frames]` feature tensor.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureTensor {
    pub data: Vec<f32>,
}

impl FeatureTensor {
    pub fn shape(&self) -> [usize; 2] {
        [FEATURE_BANDS, FEATURE_FRAMES]
    }

    pub fn band(&self, index: usize) -> &[f32] {
        &self.data[index * FEATURE_FRAMES..(index + 1) * FEATURE_FRAMES]
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct FeatureExtractor {
    normalizer: FrameNormalizer,
}

impl FeatureExtractor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Compute the standardized `[3, 41]` energy profile of one frame.
    ///
    /// Input of the wrong length is normalized to the model frame size first.
    pub fn extract(&self, samples: &[f32]) -> FeatureTensor {
        let frame = self.normalizer.normalize(samples);

        let low: Vec<f32> = frame.iter().step_by(4).copied().collect();

        let first_diff = difference(&frame, frame.first().copied().unwrap_or(0.0));
        let mid: Vec<f32> = first_diff.iter().step_by(2).copied().collect();

        let high = difference(&first_diff, 0.0);

        let mut data = Vec::with_capacity(FEATURE_BANDS * FEATURE_FRAMES);
        for band in [&low, &mid, &high] {
            data.extend(energy_profile(band, FEATURE_FRAMES));
        }

        standardize(&mut data);
        FeatureTensor { data }
    }
}

/// `out[i] = x[i] - x[i - 1]`, with `x[-1] = prepend`.
fn difference(signal: &[f32], prepend: f32) -> Vec<f32> {
    let mut previous = prepend;
    signal
        .iter()
        .map(|&value| {
            let delta = value - previous;
            previous = value;
            delta
        })
        .collect()
}

/// RMS energy of `num_frames` equal sub-frames.
fn energy_profile(signal: &[f32], num_frames: usize) -> Vec<f32> {
    let mut padded;
    let signal = if signal.len() < num_frames {
        padded = signal.to_vec();
        padded.resize(num_frames, 0.0);
        &padded[..]
    } else {
        signal
    };

    let frame_size = (signal.len() / num_frames).max(1);

    (0..num_frames)
        .map(|i| {
            let start = (i * frame_size).min(signal.len());
            let end = (start + frame_size).min(signal.len());
            let frame = &signal[start..end];
            if frame.is_empty() {
                0.0
            } else {
                (frame.iter().map(|s| s * s).sum::<f32>() / frame.len() as f32).sqrt()
            }
        })
        .collect()
}

fn standardize(values: &mut [f32]) {
    if values.is_empty() {
        return;
    }
    let n = values.len() as f32;
    let mean = values.iter().sum::<f32>() / n;
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f32>() / n;
    let denom = variance.sqrt() + STD_EPSILON;

    for value in values.iter_mut() {
        *value = (*value - mean) / denom;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::normalizer::FRAME_SIZE;

    fn tone(freq: f32, len: usize) -> Vec<f32> {
        (0..len)
            .map(|i| (2.0 * std::f32::consts::PI * freq * i as f32 / 16_000.0).sin() * 0.5)
            .collect()
    }

    #[test]
    fn test_output_shape() {
        let features = FeatureExtractor::new().extract(&tone(440.0, FRAME_SIZE));
        assert_eq!(features.shape(), [3, 41]);
        assert_eq!(features.data.len(), 123);
        assert_eq!(features.band(2).len(), 41);
    }

    #[test]
    fn test_standardized_to_zero_mean_unit_variance() {
        let mut samples = tone(300.0, FRAME_SIZE);
        for (i, s) in samples.iter_mut().enumerate().skip(256) {
            *s += tone(3000.0, FRAME_SIZE)[i] * ((i % 7) as f32 / 7.0);
        }

        let features = FeatureExtractor::new().extract(&samples);
        let n = features.data.len() as f32;
        let mean = features.data.iter().sum::<f32>() / n;
        let std = (features.data.iter().map(|v| (v - mean).powi(2)).sum::<f32>() / n).sqrt();

        assert!(mean.abs() < 1e-4, "mean {}", mean);
        assert!((std - 1.0).abs() < 1e-3, "std {}", std);
    }

    #[test]
    fn test_silence_stays_finite() {
        let features = FeatureExtractor::new().extract(&[0.0; FRAME_SIZE]);
        assert!(features.data.iter().all(|v| v.is_finite() && *v == 0.0));
    }

    #[test]
    fn test_short_input_is_padded_before_extraction() {
        let extractor = FeatureExtractor::new();
        let short = tone(440.0, 100);
        let mut padded = short.clone();
        padded.resize(FRAME_SIZE, 0.0);

        assert_eq!(extractor.extract(&short), extractor.extract(&padded));
    }

    #[test]
    fn test_energy_profile_pads_short_signals() {
        let profile = energy_profile(&[3.0, 4.0], 41);
        assert_eq!(profile.len(), 41);
        assert_eq!(profile[0], 3.0);
        assert_eq!(profile[1], 4.0);
        assert!(profile[2..].iter().all(|&e| e == 0.0));
    }

    #[test]
    fn test_difference_prepends() {
        assert_eq!(difference(&[1.0, 3.0, 6.0], 1.0), vec![0.0, 2.0, 3.0]);
        assert_eq!(difference(&[0.0, 2.0, 3.0], 0.0), vec![0.0, 2.0, 1.0]);
    }
}
