//! ONNX-backed VAD models evaluated with candle-onnx.
//!
//! The artifact comes from a local path when it exists, otherwise from the
//! Hugging Face Hub cache (`model.hub_repo` / `model.hub_file`).

use super::architecture::ModelFamily;
use super::engine::{ModelInput, ModelLoader, VadModel};
use super::state::{RecurrentState, StateTensor};
use crate::audio::features::{FEATURE_BANDS, FEATURE_FRAMES};
use crate::audio::SAMPLE_RATE;
use crate::config::ModelConfig;
use crate::error::PipelineError;
use anyhow::{anyhow, Context, Result};
use candle_core::{DType, Device, Tensor};
use candle_onnx::onnx::ModelProto;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

pub struct OnnxVadModel {
    family: ModelFamily,
    model: ModelProto,
    device: Device,
    /// Graph outputs in declaration order: probability, then next states.
    outputs: Vec<String>,
    /// Silero exports that take the sample rate as an input.
    takes_sample_rate: bool,
}

impl OnnxVadModel {
    pub fn load(family: ModelFamily, path: &Path) -> Result<Self> {
        let model = candle_onnx::read_file(path)
            .map_err(|e| anyhow!("Failed to read ONNX model {}: {}", path.display(), e))?;
        Self::from_proto(family, model).with_context(|| format!("Invalid VAD model {}", path.display()))
    }

    /// Check the graph signature against `family` and wrap the parsed model.
    pub fn from_proto(family: ModelFamily, model: ModelProto) -> Result<Self> {
        let graph = model
            .graph
            .as_ref()
            .ok_or_else(|| anyhow!("ONNX model has no graph"))?;

        let inputs: Vec<String> = graph.input.iter().map(|i| i.name.clone()).collect();
        let outputs: Vec<String> = graph.output.iter().map(|o| o.name.clone()).collect();
        debug!(?inputs, ?outputs, "ONNX graph signature");

        let required = std::iter::once(family.signal_input()).chain(family.state_inputs().iter().copied());
        for name in required {
            if !inputs.iter().any(|i| i == name) {
                return Err(anyhow!(
                    "ONNX model is not a {} VAD: missing input '{}' (found {:?})",
                    family,
                    name,
                    inputs
                ));
            }
        }

        let expected_outputs = 1 + family.state_shapes().len();
        if outputs.len() < expected_outputs {
            return Err(anyhow!(
                "ONNX model declares {} outputs, {} needs {}",
                outputs.len(),
                family,
                expected_outputs
            ));
        }

        Ok(Self {
            family,
            takes_sample_rate: inputs.iter().any(|i| i == "sr"),
            model,
            device: Device::Cpu,
            outputs,
        })
    }

    fn signal_tensor(&self, input: &ModelInput) -> Result<Tensor, PipelineError> {
        let tensor = match input {
            ModelInput::Waveform(samples) => {
                Tensor::from_vec(samples.clone(), (1, samples.len()), &self.device)?
            }
            ModelInput::Features(features) => Tensor::from_vec(
                features.data.clone(),
                (1, FEATURE_BANDS, FEATURE_FRAMES),
                &self.device,
            )?,
        };
        Ok(tensor)
    }

    fn output(&self, outputs: &HashMap<String, Tensor>, index: usize) -> Result<Tensor, PipelineError> {
        let name = &self.outputs[index];
        outputs
            .get(name)
            .cloned()
            .ok_or_else(|| PipelineError::Inference(format!("model produced no '{}' output", name)))
    }
}

impl VadModel for OnnxVadModel {
    fn family(&self) -> ModelFamily {
        self.family
    }

    fn infer(
        &self,
        input: &ModelInput,
        state: &RecurrentState,
    ) -> Result<(f32, RecurrentState), PipelineError> {
        let mut feed = HashMap::new();
        feed.insert(self.family.signal_input().to_string(), self.signal_tensor(input)?);

        for (name, tensor) in self.family.state_inputs().iter().zip(&state.tensors) {
            let value = Tensor::from_vec(tensor.data.clone(), tensor.shape.clone(), &self.device)?;
            feed.insert(name.to_string(), value);
        }

        if self.takes_sample_rate {
            feed.insert("sr".to_string(), Tensor::new(SAMPLE_RATE as i64, &self.device)?);
        }

        let outputs = candle_onnx::simple_eval(&self.model, feed)?;

        let probability = self
            .output(&outputs, 0)?
            .to_dtype(DType::F32)?
            .flatten_all()?
            .to_vec1::<f32>()?
            .first()
            .copied()
            .ok_or_else(|| PipelineError::Inference("empty probability output".to_string()))?;

        let mut tensors = Vec::with_capacity(self.family.state_shapes().len());
        for index in 0..self.family.state_shapes().len() {
            let tensor = self.output(&outputs, index + 1)?.to_dtype(DType::F32)?;
            tensors.push(StateTensor {
                shape: tensor.dims().to_vec(),
                data: tensor.flatten_all()?.to_vec1::<f32>()?,
            });
        }

        Ok((probability, RecurrentState { tensors }))
    }
}

/// Loads an [`OnnxVadModel`] from the configured artifact source.
pub struct OnnxModelLoader {
    family: ModelFamily,
    path: PathBuf,
    hub: Option<(String, String)>,
}

impl OnnxModelLoader {
    pub fn new(family: ModelFamily, config: &ModelConfig) -> Self {
        let hub = match (&config.hub_repo, &config.hub_file) {
            (Some(repo), Some(file)) => Some((repo.clone(), file.clone())),
            _ => None,
        };
        Self {
            family,
            path: PathBuf::from(&config.path),
            hub,
        }
    }

    fn resolve(&self) -> Result<PathBuf> {
        if self.path.is_file() {
            return Ok(self.path.clone());
        }

        let Some((repo, file)) = &self.hub else {
            return Err(anyhow!("Model artifact not found at {}", self.path.display()));
        };

        info!("{} not found locally, fetching {}/{} from the Hugging Face Hub", self.path.display(), repo, file);
        let api = hf_hub::api::sync::Api::new().context("Failed to create Hugging Face Hub client")?;
        api.model(repo.clone())
            .get(file)
            .with_context(|| format!("Failed to download {} from {}", file, repo))
    }
}

impl ModelLoader for OnnxModelLoader {
    fn describe(&self) -> String {
        match &self.hub {
            Some((repo, file)) => format!("{} (hub fallback {}/{})", self.path.display(), repo, file),
            None => self.path.display().to_string(),
        }
    }

    fn load(&self) -> Result<Arc<dyn VadModel>> {
        let path = self.resolve()?;
        let model = OnnxVadModel::load(self.family, &path)?;
        Ok(Arc::new(model))
    }
}
