//! # Inference
//!
//! The model side of the pipeline: which model family is configured, the
//! per-session recurrent state, the lazily loaded engine and its stand-in.

pub mod architecture;
pub mod engine;
pub mod fallback;
pub mod onnx;
pub mod state;

#[cfg(test)]
pub mod testing;

pub use architecture::ModelFamily;
pub use engine::{InferenceEngine, ModelInput, ModelLoader, ModelStatus, VadModel};
pub use fallback::FallbackClassifier;
pub use onnx::OnnxModelLoader;
pub use state::{RecurrentState, RecurrentStateStore};
