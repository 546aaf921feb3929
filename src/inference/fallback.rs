//! # Fallback Classifier
//!
//! Stand-in used whenever the real model is unavailable or fails on a frame.
//! Results follow the normal response contract but carry no temporal context:
//! the classifier never reads or writes recurrent state.
//!
//! A fixed, bounded delay emulates model latency so load tests behave the same
//! with and without a model.

use crate::config::{FallbackConfig, MAX_FALLBACK_DELAY_MS};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::RwLock;

/// Smallest probability that still rounds to "not noisy" at 4 decimals.
const SPEECH_FLOOR: f32 = 0.5001;

pub struct FallbackClassifier {
    rng: Mutex<StdRng>,
    config: RwLock<FallbackConfig>,
}

impl FallbackClassifier {
    pub fn new(config: FallbackConfig) -> Self {
        Self::from_rng(config, StdRng::from_os_rng())
    }

    /// Reproducible draws for tests.
    pub fn with_seed(config: FallbackConfig, seed: u64) -> Self {
        Self::from_rng(config, StdRng::seed_from_u64(seed))
    }

    fn from_rng(config: FallbackConfig, rng: StdRng) -> Self {
        Self {
            rng: Mutex::new(rng),
            config: RwLock::new(config),
        }
    }

    pub async fn reconfigure(&self, config: FallbackConfig) {
        *self.config.write().await = config;
    }

    pub async fn config(&self) -> FallbackConfig {
        self.config.read().await.clone()
    }

    /// Draw one probability from the configured distribution after the emulated delay.
    pub async fn classify(&self) -> f32 {
        let config = self.config().await;

        let delay = config.delay_ms.min(MAX_FALLBACK_DELAY_MS);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }

        self.draw(&config)
    }

    fn draw(&self, config: &FallbackConfig) -> f32 {
        let (noisy, unit) = {
            let mut rng = self.rng.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            let noisy = rng.random_bool(config.noise_rate.clamp(0.0, 1.0) as f64);
            (noisy, rng.random::<f32>())
        };

        if noisy {
            let low = config.min_probability.min(0.5);
            low + unit * (0.5 - low)
        } else {
            let high = config.max_probability.max(SPEECH_FLOOR);
            SPEECH_FLOOR + unit * (high - SPEECH_FLOOR)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn config(noise_rate: f32, delay_ms: u64) -> FallbackConfig {
        FallbackConfig {
            min_probability: 0.1,
            max_probability: 0.9,
            noise_rate,
            delay_ms,
        }
    }

    #[tokio::test]
    async fn test_draws_stay_in_bounds() {
        let classifier = FallbackClassifier::with_seed(config(0.3, 0), 7);
        for _ in 0..500 {
            let p = classifier.classify().await;
            assert!((0.1..=0.9).contains(&p), "{} out of bounds", p);
        }
    }

    #[tokio::test]
    async fn test_noise_rate_extremes() {
        let always_noisy = FallbackClassifier::with_seed(config(1.0, 0), 1);
        let never_noisy = FallbackClassifier::with_seed(config(0.0, 0), 1);
        for _ in 0..100 {
            assert!(always_noisy.classify().await <= 0.5);
            assert!(never_noisy.classify().await > 0.5);
        }
    }

    #[tokio::test]
    async fn test_mostly_not_noisy_by_default() {
        let classifier = FallbackClassifier::with_seed(FallbackConfig { delay_ms: 0, ..FallbackConfig::default() }, 42);
        let mut speech = 0;
        for _ in 0..1000 {
            if classifier.classify().await > 0.5 {
                speech += 1;
            }
        }
        assert!(speech > 600 && speech < 800, "speech count {}", speech);
    }

    #[tokio::test]
    async fn test_delay_is_applied_and_bounded() {
        let classifier = FallbackClassifier::with_seed(config(0.3, 10), 3);
        let started = Instant::now();
        classifier.classify().await;
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(10));
        assert!(elapsed < Duration::from_millis(500));
    }

    #[tokio::test]
    async fn test_reconfigure() {
        let classifier = FallbackClassifier::with_seed(config(0.3, 0), 3);
        classifier.reconfigure(config(1.0, 0)).await;
        assert_eq!(classifier.config().await.noise_rate, 1.0);
        assert!(classifier.classify().await <= 0.5);
    }
}
