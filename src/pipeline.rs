//! # Session Pipeline
//!
//! Orchestrates one inbound message end to end: parse, decode, normalize,
//! extract, infer, persist, reply.
//!
//! ## Session lifecycle:
//! - **Uninitialized → Active**: first frame or explicit open; zeroed state is created
//! - **Active → Active**: every frame yields a classification, from the model or,
//!   on any model error, from the fallback classifier
//! - **Active → Closed**: explicit close, delivery gone or registry expiry; the
//!   recurrent state is dropped. A later frame with the same id starts over.
//!
//! Control messages (`ping`, unknown types) never reach the state store.
//!
//! ## Wire protocol:
//! ```text
//! in:  { "type": "audio_frame" | "ping" | <other>, "data": { "audio": "<base64>", "timestamp": <int> } }
//! out: { "type": "noise_detection", "isNoisy", "confidence", "vad_probability", "timestamp" }
//!      { "type": "pong", "timestamp" }
//!      { "type": "error", "error" }
//! ```

use crate::audio::{AudioFrameDecoder, FeatureExtractor, FrameNormalizer, FRAME_SIZE, SAMPLE_RATE};
use crate::config::AppConfig;
use crate::error::PipelineError;
use crate::inference::state::SlotSnapshot;
use crate::inference::{
    FallbackClassifier, InferenceEngine, ModelInput, OnnxModelLoader, RecurrentState, RecurrentStateStore,
};
use crate::registry::{SessionEntry, SessionRegistry};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

/// Probabilities above this are speech; at or below it the frame is noisy.
pub const SPEECH_THRESHOLD: f32 = 0.5;

/// Hop between analysis windows for uploaded recordings (50% overlap).
pub const FRAMEWISE_HOP: usize = 256;

/// Round to the 4 decimals sent over the wire.
pub fn round_probability(probability: f32) -> f32 {
    (probability * 10_000.0).round() / 10_000.0
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultSource {
    Model,
    Fallback,
}

/// Classification of one frame.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClassificationResult {
    pub probability: f32,
    pub is_noisy: bool,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
    pub source: ResultSource,
}

impl ClassificationResult {
    /// The threshold sees the unrounded value; only the reported probability is rounded.
    fn new(raw_probability: f32, source: ResultSource) -> Self {
        let raw_probability = raw_probability.clamp(0.0, 1.0);
        Self {
            probability: round_probability(raw_probability),
            is_noisy: raw_probability <= SPEECH_THRESHOLD,
            timestamp: Utc::now().timestamp_millis(),
            source,
        }
    }
}

/// Messages sent back to a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundMessage {
    NoiseDetection {
        #[serde(rename = "isNoisy")]
        is_noisy: bool,
        confidence: f32,
        vad_probability: f32,
        timestamp: i64,
    },
    Pong {
        timestamp: i64,
    },
    Error {
        error: String,
    },
}

impl OutboundMessage {
    pub fn pong() -> Self {
        OutboundMessage::Pong {
            timestamp: Utc::now().timestamp_millis(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        OutboundMessage::Error { error: message.into() }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| {
            format!(r#"{{"type":"error","error":"serialization failed: {}"}}"#, e)
        })
    }
}

impl From<&ClassificationResult> for OutboundMessage {
    fn from(result: &ClassificationResult) -> Self {
        OutboundMessage::NoiseDetection {
            is_noisy: result.is_noisy,
            confidence: result.probability,
            vad_probability: result.probability,
            timestamp: result.timestamp,
        }
    }
}

/// `data` of an `audio_frame` message. A missing `audio` field is an empty frame.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AudioFramePayload {
    #[serde(default)]
    pub audio: String,
    #[serde(default)]
    pub timestamp: Option<i64>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    AudioFrame(AudioFramePayload),
    Ping,
    /// Anything else, carrying the offending type (`null` when absent).
    Unknown(String),
}

impl InboundMessage {
    /// Parse one text frame. The error is the text of the `error` reply.
    pub fn parse(text: &str) -> Result<Self, String> {
        let envelope: Value = serde_json::from_str(text).map_err(|e| format!("Invalid JSON: {}", e))?;

        let message_type = match envelope.get("type") {
            Some(Value::String(kind)) => kind.as_str(),
            Some(Value::Null) | None => return Ok(InboundMessage::Unknown("null".to_string())),
            Some(other) => return Ok(InboundMessage::Unknown(other.to_string())),
        };

        match message_type {
            "audio_frame" => {
                let payload = match envelope.get("data") {
                    None | Some(Value::Null) => AudioFramePayload::default(),
                    Some(data) => serde_json::from_value(data.clone())
                        .map_err(|e| format!("Invalid audio_frame data: {}", e))?,
                };
                Ok(InboundMessage::AudioFrame(payload))
            }
            "ping" => Ok(InboundMessage::Ping),
            other => Ok(InboundMessage::Unknown(other.to_string())),
        }
    }
}

/// Pushes replies to the remote end of a session.
pub trait DeliveryChannel: Send + Sync {
    /// `Err(PipelineError::DeliveryGone)` when the remote end is unreachable.
    fn send(&self, session_id: &str, message: &OutboundMessage) -> Result<(), PipelineError>;
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct PipelineMetrics {
    pub frames_received: u64,
    pub model_results: u64,
    pub fallback_results: u64,
    pub decode_errors: u64,
    pub deliveries_gone: u64,
    pub corruption_resets: u64,
    pub pings: u64,
    pub rejected_messages: u64,
    pub sessions_opened: u64,
    pub sessions_closed: u64,
    pub sessions_expired: u64,
}

/// A registry entry joined with its state slot.
#[derive(Debug, Clone, Serialize)]
pub struct SessionOverview {
    #[serde(flatten)]
    pub entry: SessionEntry,
    pub state: Option<SlotSnapshot>,
}

/// Per-window VAD over a whole recording.
#[derive(Debug, Clone, Serialize)]
pub struct FramewiseReport {
    pub frame_size: usize,
    pub hop: usize,
    pub sample_rate: u32,
    pub duration_secs: f64,
    pub frames: Vec<FramewiseFrame>,
    pub stats: ProbabilityStats,
}

#[derive(Debug, Clone, Serialize)]
pub struct FramewiseFrame {
    pub time_secs: f64,
    pub probability: f32,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProbabilityStats {
    pub count: usize,
    pub mean: f32,
    pub min: f32,
    pub max: f32,
    pub speech_frames: usize,
    pub speech_ratio: f32,
    /// Frame counts per 0.1-wide probability bucket.
    pub histogram: [usize; 10],
}

impl ProbabilityStats {
    fn from_probabilities(probabilities: &[f32]) -> Self {
        let count = probabilities.len();
        let mut histogram = [0usize; 10];
        for &p in probabilities {
            histogram[((p * 10.0) as usize).min(9)] += 1;
        }
        let speech_frames = probabilities.iter().filter(|&&p| p > SPEECH_THRESHOLD).count();

        if count == 0 {
            return Self {
                count,
                mean: 0.0,
                min: 0.0,
                max: 0.0,
                speech_frames,
                speech_ratio: 0.0,
                histogram,
            };
        }

        Self {
            count,
            mean: probabilities.iter().sum::<f32>() / count as f32,
            min: probabilities.iter().copied().fold(f32::INFINITY, f32::min),
            max: probabilities.iter().copied().fold(0.0, f32::max),
            speech_frames,
            speech_ratio: speech_frames as f32 / count as f32,
            histogram,
        }
    }
}

pub struct SessionPipeline {
    decoder: AudioFrameDecoder,
    normalizer: FrameNormalizer,
    features: FeatureExtractor,
    store: RecurrentStateStore,
    engine: InferenceEngine,
    fallback: FallbackClassifier,
    registry: SessionRegistry,
    metrics: RwLock<PipelineMetrics>,
}

impl SessionPipeline {
    pub fn new(engine: InferenceEngine, fallback: FallbackClassifier, registry: SessionRegistry) -> Self {
        Self {
            decoder: AudioFrameDecoder::new(),
            normalizer: FrameNormalizer::default(),
            features: FeatureExtractor::new(),
            store: RecurrentStateStore::new(engine.family()),
            engine,
            fallback,
            registry,
            metrics: RwLock::new(PipelineMetrics::default()),
        }
    }

    /// Build the production pipeline: ONNX model, OS-seeded fallback, in-process registry.
    pub fn from_config(config: &AppConfig) -> anyhow::Result<Self> {
        let family = config.model_family()?;
        let loader = Arc::new(OnnxModelLoader::new(family, &config.model));
        let engine = InferenceEngine::new(
            family,
            loader,
            Duration::from_secs(config.model.load_retry_secs),
            config.model.serialize_inference,
        );

        Ok(Self::new(
            engine,
            FallbackClassifier::new(config.fallback.clone()),
            SessionRegistry::new(&config.sessions),
        ))
    }

    pub fn store(&self) -> &RecurrentStateStore {
        &self.store
    }

    pub fn engine(&self) -> &InferenceEngine {
        &self.engine
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub async fn metrics(&self) -> PipelineMetrics {
        self.metrics.read().await.clone()
    }

    /// Push live-tunable settings into the running pipeline.
    pub async fn apply_config(&self, config: &AppConfig) {
        self.fallback.reconfigure(config.fallback.clone()).await;
        self.registry.reconfigure(&config.sessions).await;
        self.engine
            .set_retry_after(Duration::from_secs(config.model.load_retry_secs));
    }

    /// Register a session and create its zeroed state.
    pub async fn open_session(&self, session_id: &str) -> Result<(), String> {
        self.registry.connect(session_id).await?;
        self.store.get(session_id).await;
        self.metrics.write().await.sessions_opened += 1;
        info!(session_id = %session_id, "session opened");
        Ok(())
    }

    /// Forget a session and drop its state. Waits for an in-flight frame.
    pub async fn close_session(&self, session_id: &str) -> bool {
        let registered = self.registry.forget(session_id).await;
        let had_state = self.store.drop_session(session_id).await;
        if registered || had_state {
            self.metrics.write().await.sessions_closed += 1;
            info!(session_id = %session_id, "session closed");
        }
        registered || had_state
    }

    /// Zero a session's state. Returns false for unknown sessions.
    pub async fn reset_session(&self, session_id: &str) -> bool {
        let reset = self.store.reset(session_id).await;
        if reset {
            info!(session_id = %session_id, "session state reset");
        }
        reset
    }

    /// Drop every session whose registry entry has expired.
    pub async fn sweep_expired(&self) -> usize {
        let expired = self.registry.sweep_expired(Utc::now()).await;
        for session_id in &expired {
            self.store.drop_session(session_id).await;
            debug!(session_id = %session_id, "session expired");
        }
        if !expired.is_empty() {
            self.metrics.write().await.sessions_expired += expired.len() as u64;
            info!("Expired {} idle sessions", expired.len());
        }
        expired.len()
    }

    pub async fn sessions(&self) -> Vec<SessionOverview> {
        let mut overview = Vec::new();
        for entry in self.registry.list().await {
            let state = self.store.snapshot(&entry.session_id).await;
            overview.push(SessionOverview { entry, state });
        }
        overview
    }

    /// Classify one audio frame for a session.
    ///
    /// Only `Decode` errors escape; model trouble is answered by the fallback.
    pub async fn process_frame(
        &self,
        session_id: &str,
        payload: &AudioFramePayload,
    ) -> Result<ClassificationResult, PipelineError> {
        self.metrics.write().await.frames_received += 1;

        let samples = match self.decoder.decode(&payload.audio) {
            Ok(samples) => samples,
            Err(e) => {
                warn!(session_id = %session_id, "{}", e);
                self.metrics.write().await.decode_errors += 1;
                return Err(e);
            }
        };

        let frame = self.normalizer.normalize(&samples);
        let input = if self.engine.family().needs_features() {
            ModelInput::Features(self.features.extract(&frame))
        } else {
            ModelInput::Waveform(frame)
        };

        let outcome = {
            let mut session = self.store.acquire(session_id).await;
            let outcome = self.engine.infer(session_id, input, session.state()).await;
            match &outcome {
                Ok((_, next)) => session.commit(next.clone()),
                Err(PipelineError::SessionStateCorruption { .. }) => session.clear(),
                Err(_) => {}
            }
            outcome
        };

        if !self.registry.touch(session_id).await {
            if let Err(reason) = self.registry.connect(session_id).await {
                // Nothing would ever sweep a slot without a registry entry.
                warn!(session_id = %session_id, "session not registered, state discarded: {}", reason);
                self.store.drop_session(session_id).await;
            }
        }

        let result = match outcome {
            Ok((probability, _)) => {
                self.metrics.write().await.model_results += 1;
                ClassificationResult::new(probability, ResultSource::Model)
            }
            Err(e) if e.routes_to_fallback() => {
                match &e {
                    PipelineError::SessionStateCorruption { .. } => {
                        error!(session_id = %session_id, "{}; state reset", e);
                        self.metrics.write().await.corruption_resets += 1;
                    }
                    _ => warn!(session_id = %session_id, "{}; using fallback classifier", e),
                }
                let probability = self.fallback.classify().await;
                self.metrics.write().await.fallback_results += 1;
                ClassificationResult::new(probability, ResultSource::Fallback)
            }
            Err(e) => return Err(e),
        };

        if let Some(sent_at) = payload.timestamp {
            debug!(
                session_id = %session_id,
                probability = result.probability,
                client_latency_ms = result.timestamp - sent_at,
                "frame classified"
            );
        }

        Ok(result)
    }

    /// Turn one raw text message into its reply.
    pub async fn handle_text(&self, session_id: &str, text: &str) -> OutboundMessage {
        let message = match InboundMessage::parse(text) {
            Ok(message) => message,
            Err(reason) => {
                warn!(session_id = %session_id, "{}", reason);
                self.metrics.write().await.rejected_messages += 1;
                return OutboundMessage::error(reason);
            }
        };

        match message {
            InboundMessage::AudioFrame(payload) => match self.process_frame(session_id, &payload).await {
                Ok(result) => OutboundMessage::from(&result),
                Err(e) => OutboundMessage::error(e.to_string()),
            },
            InboundMessage::Ping => {
                self.metrics.write().await.pings += 1;
                OutboundMessage::pong()
            }
            InboundMessage::Unknown(kind) => {
                warn!(session_id = %session_id, "Unknown message type: {}", kind);
                self.metrics.write().await.rejected_messages += 1;
                OutboundMessage::error(format!("Unknown message type: {}", kind))
            }
        }
    }

    /// Handle one inbound message and deliver the reply.
    ///
    /// When the remote end is gone the session is forgotten and its state
    /// dropped; delivery is not retried.
    pub async fn dispatch(
        &self,
        session_id: &str,
        text: &str,
        channel: &dyn DeliveryChannel,
    ) -> Result<(), PipelineError> {
        let reply = self.handle_text(session_id, text).await;

        match channel.send(session_id, &reply) {
            Ok(()) => Ok(()),
            Err(PipelineError::DeliveryGone(id)) => {
                warn!(session_id = %session_id, "delivery target gone, purging session");
                self.metrics.write().await.deliveries_gone += 1;
                self.close_session(session_id).await;
                Err(PipelineError::DeliveryGone(id))
            }
            Err(e) => Err(e),
        }
    }

    /// Run a whole recording through the model with a fresh state.
    ///
    /// Windows of 512 samples advance by 256. A recording shorter than one
    /// window is analyzed as a single zero-padded frame. The fallback is never
    /// used here: without a model the analysis fails.
    pub async fn analyze_framewise(&self, samples: &[f32]) -> Result<FramewiseReport, PipelineError> {
        let starts: Vec<usize> = if samples.len() > FRAME_SIZE {
            (0..samples.len() - FRAME_SIZE).step_by(FRAMEWISE_HOP).collect()
        } else {
            vec![0]
        };

        let analysis_id = format!("framewise-{}", uuid::Uuid::new_v4());
        let mut state = RecurrentState::zeros(self.engine.family());
        let mut frames = Vec::with_capacity(starts.len());
        let mut probabilities = Vec::with_capacity(starts.len());

        for start in starts {
            let end = (start + FRAME_SIZE).min(samples.len());
            let frame = self.normalizer.normalize(&samples[start..end]);
            let input = if self.engine.family().needs_features() {
                ModelInput::Features(self.features.extract(&frame))
            } else {
                ModelInput::Waveform(frame)
            };

            let (probability, next) = self.engine.infer(&analysis_id, input, &state).await?;
            state = next;
            probabilities.push(probability.clamp(0.0, 1.0));
            frames.push(FramewiseFrame {
                time_secs: start as f64 / SAMPLE_RATE as f64,
                probability: round_probability(probability),
            });
        }

        Ok(FramewiseReport {
            frame_size: FRAME_SIZE,
            hop: FRAMEWISE_HOP,
            sample_rate: SAMPLE_RATE,
            duration_secs: samples.len() as f64 / SAMPLE_RATE as f64,
            stats: ProbabilityStats::from_probabilities(&probabilities),
            frames,
        })
    }
}
