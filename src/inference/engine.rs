//! # Inference Engine
//!
//! Wraps the external VAD model behind a lazy-load guard.
//!
//! ## Model lifecycle:
//! - **NotLoaded**: nothing attempted yet; the first `infer` call loads the model
//! - **Ready**: loaded once, shared by every session
//! - **Failed**: the last load failed; callers get `ModelUnavailable` immediately
//!   until `load_retry_secs` has passed, then one caller retries the load
//!
//! ## Concurrency:
//! Models are invoked on the blocking pool with the caller's own state tensors,
//! so sessions infer in parallel. When the runtime is not reentrant,
//! `serialize_inference` puts a global gate in front of every call.

use super::architecture::ModelFamily;
use super::state::RecurrentState;
use crate::audio::FeatureTensor;
use crate::error::PipelineError;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

/// What a model consumes for one frame.
#[derive(Debug, Clone)]
pub enum ModelInput {
    /// Normalized 512-sample frame.
    Waveform(Vec<f32>),
    /// `[3, 41]` energy features of the same frame.
    Features(FeatureTensor),
}

/// A loaded VAD model.
///
/// `infer` must be a pure function of its arguments: the same input and state
/// always produce the same probability and next state.
pub trait VadModel: Send + Sync {
    fn family(&self) -> ModelFamily;

    fn infer(
        &self,
        input: &ModelInput,
        state: &RecurrentState,
    ) -> Result<(f32, RecurrentState), PipelineError>;
}

/// Resolves the model artifact and builds a [`VadModel`]. Runs on the blocking pool.
pub trait ModelLoader: Send + Sync {
    fn describe(&self) -> String;

    fn load(&self) -> anyhow::Result<Arc<dyn VadModel>>;
}

enum ModelSlot {
    NotLoaded,
    Ready {
        model: Arc<dyn VadModel>,
        loaded_at: DateTime<Utc>,
    },
    Failed {
        at: Instant,
        since: DateTime<Utc>,
        reason: String,
    },
}

/// Model status as reported by the health endpoint.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ModelStatus {
    NotLoaded,
    Ready {
        family: String,
        loaded_at: DateTime<Utc>,
    },
    Unavailable {
        reason: String,
        since: DateTime<Utc>,
    },
}

#[derive(Debug, Default)]
struct EngineMetrics {
    load_attempts: u64,
    load_failures: u64,
    inferences: u64,
    inference_failures: u64,
    total_inference_us: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct EngineMetricsSnapshot {
    pub load_attempts: u64,
    pub load_failures: u64,
    pub inferences: u64,
    pub inference_failures: u64,
    pub avg_inference_ms: f64,
}

fn duration_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

pub struct InferenceEngine {
    family: ModelFamily,
    loader: Arc<dyn ModelLoader>,
    slot: RwLock<ModelSlot>,
    /// Milliseconds; adjustable while running.
    retry_after_ms: AtomicU64,
    gate: Option<Mutex<()>>,
    metrics: RwLock<EngineMetrics>,
}

impl InferenceEngine {
    pub fn new(
        family: ModelFamily,
        loader: Arc<dyn ModelLoader>,
        retry_after: Duration,
        serialize_inference: bool,
    ) -> Self {
        Self {
            family,
            loader,
            slot: RwLock::new(ModelSlot::NotLoaded),
            retry_after_ms: AtomicU64::new(duration_millis(retry_after)),
            gate: serialize_inference.then(|| Mutex::new(())),
            metrics: RwLock::new(EngineMetrics::default()),
        }
    }

    pub fn family(&self) -> ModelFamily {
        self.family
    }

    /// How long a failed load is remembered before the next attempt.
    pub fn retry_after(&self) -> Duration {
        Duration::from_millis(self.retry_after_ms.load(Ordering::Relaxed))
    }

    /// Takes effect for the current failure too.
    pub fn set_retry_after(&self, retry_after: Duration) {
        self.retry_after_ms.store(duration_millis(retry_after), Ordering::Relaxed);
    }

    /// The loaded model, loading it on first use.
    async fn model(&self) -> Result<Arc<dyn VadModel>, PipelineError> {
        {
            let slot = self.slot.read().await;
            match &*slot {
                ModelSlot::Ready { model, .. } => return Ok(model.clone()),
                ModelSlot::Failed { at, reason, .. } if at.elapsed() < self.retry_after() => {
                    return Err(PipelineError::ModelUnavailable(reason.clone()));
                }
                _ => {}
            }
        }

        // The write lock is the load guard: one loader, everyone else waits on it.
        let mut slot = self.slot.write().await;
        match &*slot {
            ModelSlot::Ready { model, .. } => return Ok(model.clone()),
            ModelSlot::Failed { at, reason, .. } if at.elapsed() < self.retry_after() => {
                return Err(PipelineError::ModelUnavailable(reason.clone()));
            }
            _ => {}
        }

        info!("Loading {} VAD model from {}", self.family, self.loader.describe());
        let started = Instant::now();
        self.metrics.write().await.load_attempts += 1;

        let loader = self.loader.clone();
        let loaded = tokio::task::spawn_blocking(move || loader.load())
            .await
            .map_err(|e| anyhow::anyhow!("model loader task failed: {}", e))
            .and_then(|result| result)
            .and_then(|model| {
                if model.family() == self.family {
                    Ok(model)
                } else {
                    Err(anyhow::anyhow!(
                        "loaded a {} model but {} was configured",
                        model.family(),
                        self.family
                    ))
                }
            });

        match loaded {
            Ok(model) => {
                info!("VAD model ready in {:.2}s", started.elapsed().as_secs_f64());
                *slot = ModelSlot::Ready {
                    model: model.clone(),
                    loaded_at: Utc::now(),
                };
                Ok(model)
            }
            Err(e) => {
                let reason = format!("{:#}", e);
                warn!("VAD model unavailable, retrying in {}s: {}", self.retry_after().as_secs(), reason);
                self.metrics.write().await.load_failures += 1;
                *slot = ModelSlot::Failed {
                    at: Instant::now(),
                    since: Utc::now(),
                    reason: reason.clone(),
                };
                Err(PipelineError::ModelUnavailable(reason))
            }
        }
    }

    /// Run one frame against `state`, returning the raw probability and the next state.
    ///
    /// The caller persists the next state before the session's following frame.
    pub async fn infer(
        &self,
        session_id: &str,
        input: ModelInput,
        state: &RecurrentState,
    ) -> Result<(f32, RecurrentState), PipelineError> {
        let shapes = self.family.state_shapes();
        if !state.matches(shapes) {
            return Err(PipelineError::SessionStateCorruption {
                session_id: session_id.to_string(),
                reason: format!(
                    "expected {} tensors shaped {:?}, found {:?}",
                    shapes.len(),
                    shapes,
                    state.tensors.iter().map(|t| t.shape.clone()).collect::<Vec<_>>()
                ),
            });
        }

        let model = self.model().await?;

        let _gate = match &self.gate {
            Some(gate) => Some(gate.lock().await),
            None => None,
        };

        let started = Instant::now();
        let state = state.clone();
        let result = tokio::task::spawn_blocking(move || model.infer(&input, &state))
            .await
            .map_err(|e| PipelineError::Inference(format!("inference task failed: {}", e)))
            .and_then(|result| result)
            .and_then(|(probability, next)| {
                if !probability.is_finite() || !(0.0..=1.0).contains(&probability) {
                    return Err(PipelineError::Inference(format!(
                        "model returned probability {} outside [0, 1]",
                        probability
                    )));
                }
                if !next.matches(shapes) {
                    return Err(PipelineError::Inference(
                        "model returned a next state of the wrong shape".to_string(),
                    ));
                }
                Ok((probability, next))
            });

        let elapsed_us = started.elapsed().as_micros() as u64;
        let mut metrics = self.metrics.write().await;
        match &result {
            Ok((probability, _)) => {
                metrics.inferences += 1;
                metrics.total_inference_us += elapsed_us;
                debug!(session_id = %session_id, probability, elapsed_us, "inference complete");
            }
            Err(_) => metrics.inference_failures += 1,
        }

        result
    }

    pub async fn status(&self) -> ModelStatus {
        match &*self.slot.read().await {
            ModelSlot::NotLoaded => ModelStatus::NotLoaded,
            ModelSlot::Ready { model, loaded_at } => ModelStatus::Ready {
                family: model.family().to_string(),
                loaded_at: *loaded_at,
            },
            ModelSlot::Failed { since, reason, .. } => ModelStatus::Unavailable {
                reason: reason.clone(),
                since: *since,
            },
        }
    }

    pub async fn metrics(&self) -> EngineMetricsSnapshot {
        let metrics = self.metrics.read().await;
        EngineMetricsSnapshot {
            load_attempts: metrics.load_attempts,
            load_failures: metrics.load_failures,
            inferences: metrics.inferences,
            inference_failures: metrics.inference_failures,
            avg_inference_ms: if metrics.inferences > 0 {
                metrics.total_inference_us as f64 / metrics.inferences as f64 / 1000.0
            } else {
                0.0
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::testing::{FailingLoader, FixedLoader, ScriptedModel};

    fn waveform(value: f32) -> ModelInput {
        ModelInput::Waveform(vec![value; 512])
    }

    #[tokio::test]
    async fn test_lazy_load_happens_once() {
        let model = Arc::new(ScriptedModel::new(ModelFamily::Silero));
        let loader = Arc::new(FixedLoader::new(model.clone()));
        let engine = InferenceEngine::new(ModelFamily::Silero, loader.clone(), Duration::from_secs(30), false);

        assert!(matches!(engine.status().await, ModelStatus::NotLoaded));

        let zeros = RecurrentState::zeros(ModelFamily::Silero);
        for _ in 0..3 {
            engine.infer("s1", waveform(0.0), &zeros).await.unwrap();
        }

        assert_eq!(loader.loads(), 1);
        assert!(matches!(engine.status().await, ModelStatus::Ready { .. }));
        assert_eq!(engine.metrics().await.inferences, 3);
    }

    #[tokio::test]
    async fn test_failed_load_is_not_retried_within_window() {
        let loader = Arc::new(FailingLoader::default());
        let engine = InferenceEngine::new(ModelFamily::Silero, loader.clone(), Duration::from_secs(30), false);
        let zeros = RecurrentState::zeros(ModelFamily::Silero);

        for _ in 0..3 {
            let result = engine.infer("s1", waveform(0.1), &zeros).await;
            assert!(matches!(result, Err(PipelineError::ModelUnavailable(_))));
        }

        assert_eq!(loader.attempts(), 1);
        assert!(matches!(engine.status().await, ModelStatus::Unavailable { .. }));
    }

    #[tokio::test]
    async fn test_failed_load_retried_after_window() {
        let loader = Arc::new(FailingLoader::default());
        let engine = InferenceEngine::new(ModelFamily::Silero, loader.clone(), Duration::ZERO, false);
        let zeros = RecurrentState::zeros(ModelFamily::Silero);

        let _ = engine.infer("s1", waveform(0.1), &zeros).await;
        let _ = engine.infer("s1", waveform(0.1), &zeros).await;

        assert_eq!(loader.attempts(), 2);
    }

    #[tokio::test]
    async fn test_retry_window_can_be_shortened() {
        let loader = Arc::new(FailingLoader::default());
        let engine = InferenceEngine::new(ModelFamily::Silero, loader.clone(), Duration::from_secs(30), false);
        let zeros = RecurrentState::zeros(ModelFamily::Silero);

        let _ = engine.infer("s1", waveform(0.1), &zeros).await;
        let _ = engine.infer("s1", waveform(0.1), &zeros).await;
        assert_eq!(loader.attempts(), 1);

        engine.set_retry_after(Duration::ZERO);
        assert_eq!(engine.retry_after(), Duration::ZERO);
        let _ = engine.infer("s1", waveform(0.1), &zeros).await;
        assert_eq!(loader.attempts(), 2);
    }

    #[tokio::test]
    async fn test_wrong_family_is_unavailable() {
        let model = Arc::new(ScriptedModel::new(ModelFamily::Ten));
        let engine = InferenceEngine::new(
            ModelFamily::Silero,
            Arc::new(FixedLoader::new(model)),
            Duration::from_secs(30),
            false,
        );

        let result = engine
            .infer("s1", waveform(0.0), &RecurrentState::zeros(ModelFamily::Silero))
            .await;
        assert!(matches!(result, Err(PipelineError::ModelUnavailable(_))));
    }

    #[tokio::test]
    async fn test_state_shape_mismatch_is_corruption() {
        let model = Arc::new(ScriptedModel::new(ModelFamily::Silero));
        let engine = InferenceEngine::new(
            ModelFamily::Silero,
            Arc::new(FixedLoader::new(model.clone())),
            Duration::from_secs(30),
            true,
        );

        let result = engine
            .infer("s9", waveform(0.0), &RecurrentState::zeros(ModelFamily::Ten))
            .await;

        match result {
            Err(PipelineError::SessionStateCorruption { session_id, .. }) => assert_eq!(session_id, "s9"),
            other => panic!("expected corruption, got {:?}", other),
        }
        assert!(model.recorded_states().is_empty());
    }

    #[tokio::test]
    async fn test_inference_is_deterministic() {
        let model = Arc::new(ScriptedModel::new(ModelFamily::Silero));
        let engine = InferenceEngine::new(
            ModelFamily::Silero,
            Arc::new(FixedLoader::new(model)),
            Duration::from_secs(30),
            false,
        );
        let zeros = RecurrentState::zeros(ModelFamily::Silero);

        let a = engine.infer("a", waveform(0.2), &zeros).await.unwrap();
        let b = engine.infer("b", waveform(0.2), &zeros).await.unwrap();
        assert_eq!(a, b);
    }
}
