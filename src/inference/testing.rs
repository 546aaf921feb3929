//! Test doubles for the model seams.

use super::architecture::ModelFamily;
use super::engine::{ModelInput, ModelLoader, VadModel};
use super::state::RecurrentState;
use crate::error::PipelineError;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Deterministic recurrent model that records every state it is handed.
///
/// The first tensor carries `h' = 0.5 * h + energy + 0.1`, the second keeps the
/// previous `h`, so the update is never idempotent and every step depends on the
/// one before it.
pub struct ScriptedModel {
    family: ModelFamily,
    seen: Mutex<Vec<RecurrentState>>,
    emitted: Mutex<Vec<RecurrentState>>,
    delay: Duration,
}

impl ScriptedModel {
    pub fn new(family: ModelFamily) -> Self {
        Self {
            family,
            seen: Mutex::new(Vec::new()),
            emitted: Mutex::new(Vec::new()),
            delay: Duration::from_millis(1),
        }
    }

    pub fn recorded_states(&self) -> Vec<RecurrentState> {
        self.seen.lock().unwrap().clone()
    }

    pub fn emitted_states(&self) -> Vec<RecurrentState> {
        self.emitted.lock().unwrap().clone()
    }
}

impl VadModel for ScriptedModel {
    fn family(&self) -> ModelFamily {
        self.family
    }

    fn infer(
        &self,
        input: &ModelInput,
        state: &RecurrentState,
    ) -> Result<(f32, RecurrentState), PipelineError> {
        self.seen.lock().unwrap().push(state.clone());
        std::thread::sleep(self.delay);

        let values: &[f32] = match input {
            ModelInput::Waveform(samples) => samples,
            ModelInput::Features(features) => &features.data,
        };
        let energy = values.iter().map(|v| v.abs()).sum::<f32>() / values.len().max(1) as f32;

        let previous = state.tensors[0].data[0];
        let carried = previous * 0.5 + energy + 0.1;

        let mut next = state.clone();
        for (index, tensor) in next.tensors.iter_mut().enumerate() {
            let value = if index == 0 { carried } else { previous };
            tensor.data.iter_mut().for_each(|v| *v = value);
        }

        let probability = 1.0 / (1.0 + (-(carried * 4.0 - 1.0)).exp());
        self.emitted.lock().unwrap().push(next.clone());
        Ok((probability, next))
    }
}

/// Model that loads fine but fails every frame.
pub struct BrokenModel(pub ModelFamily);

impl VadModel for BrokenModel {
    fn family(&self) -> ModelFamily {
        self.0
    }

    fn infer(&self, _: &ModelInput, _: &RecurrentState) -> Result<(f32, RecurrentState), PipelineError> {
        Err(PipelineError::Inference("graph evaluation failed".to_string()))
    }
}

pub struct FixedLoader {
    model: Arc<dyn VadModel>,
    loads: AtomicUsize,
}

impl FixedLoader {
    pub fn new(model: Arc<dyn VadModel>) -> Self {
        Self {
            model,
            loads: AtomicUsize::new(0),
        }
    }

    pub fn loads(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }
}

impl ModelLoader for FixedLoader {
    fn describe(&self) -> String {
        "test fixture".to_string()
    }

    fn load(&self) -> anyhow::Result<Arc<dyn VadModel>> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        Ok(self.model.clone())
    }
}

/// Loader whose artifact never resolves.
#[derive(Default)]
pub struct FailingLoader {
    attempts: AtomicUsize,
}

impl FailingLoader {
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

impl ModelLoader for FailingLoader {
    fn describe(&self) -> String {
        "/nonexistent/model.onnx".to_string()
    }

    fn load(&self) -> anyhow::Result<Arc<dyn VadModel>> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        Err(anyhow::anyhow!("Model artifact not found at /nonexistent/model.onnx"))
    }
}
