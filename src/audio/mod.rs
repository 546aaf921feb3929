//! # Audio Front End
//!
//! Everything between the wire payload and the model input tensor.
//!
//! ## Audio Format Requirements:
//! - **Sample Rate**: 16kHz (16,000 Hz)
//! - **Bit Depth**: 16-bit PCM
//! - **Channels**: Mono (1 channel)
//! - **Encoding**: Little-endian signed integers, base64 on the wire
//!
//! ## Stages:
//! - **decoder**: base64 PCM16 to float samples in [-1, 1]
//! - **normalizer**: fixed 512-sample frames, plus resampling for uploaded files
//! - **features**: `[3, 41]` energy profile for models that do not take raw audio

pub mod decoder;
pub mod features;
pub mod normalizer;

pub use decoder::AudioFrameDecoder;
pub use features::{FeatureExtractor, FeatureTensor};
pub use normalizer::{FrameNormalizer, FRAME_SIZE, SAMPLE_RATE};
