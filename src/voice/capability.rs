//! External capabilities consumed by the decision engine
//!
//! The engine never touches audio. Callers extract embeddings with an
//! [`EmbeddingExtractor`] and hand the engine a [`LivenessCheck`] that is
//! evaluated before any similarity comparison.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Outcome of an anti-spoof check
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LivenessVerdict {
    pub is_genuine: bool,
    /// Confidence in [0, 1]
    pub confidence: f64,
    pub detail: Option<String>,
}

impl LivenessVerdict {
    pub fn genuine(confidence: f64) -> Self {
        Self {
            is_genuine: true,
            confidence,
            detail: None,
        }
    }

    pub fn spoofed(confidence: f64, detail: impl Into<String>) -> Self {
        Self {
            is_genuine: false,
            confidence,
            detail: Some(detail.into()),
        }
    }
}

/// Liveness / anti-spoof gate.
///
/// Implementations that look at raw audio capture the samples themselves
/// (see [`SilenceGate`]); the engine only passes the embedding.
pub trait LivenessCheck {
    fn check(&self, embedding: &[f32]) -> LivenessVerdict;
}

impl<F> LivenessCheck for F
where
    F: Fn(&[f32]) -> LivenessVerdict,
{
    fn check(&self, embedding: &[f32]) -> LivenessVerdict {
        self(embedding)
    }
}

/// Liveness thresholds for the embedding-norm heuristic
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LivenessConfig {
    /// Embeddings with a smaller L2 norm are rejected
    pub min_norm: f64,
    /// Embeddings with a larger L2 norm are rejected
    pub max_norm: f64,
    /// Peak absolute amplitude below which audio counts as silence
    pub min_peak_amplitude: f32,
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            min_norm: 0.01,
            max_norm: 500.0,
            min_peak_amplitude: 0.01,
        }
    }
}

/// Accepts embeddings whose norm lies strictly inside `(min_norm, max_norm)`.
///
/// Degenerate (near-zero) or exploded embeddings are what replayed or
/// synthetic input tends to produce from the ECAPA extractor.
#[derive(Debug, Clone)]
pub struct NormRangeLiveness {
    pub min_norm: f64,
    pub max_norm: f64,
}

impl NormRangeLiveness {
    pub fn from_config(config: &LivenessConfig) -> Self {
        Self {
            min_norm: config.min_norm,
            max_norm: config.max_norm,
        }
    }
}

impl Default for NormRangeLiveness {
    fn default() -> Self {
        Self::from_config(&LivenessConfig::default())
    }
}

impl LivenessCheck for NormRangeLiveness {
    fn check(&self, embedding: &[f32]) -> LivenessVerdict {
        let norm = embedding
            .iter()
            .map(|&x| f64::from(x) * f64::from(x))
            .sum::<f64>()
            .sqrt();

        let is_genuine = self.min_norm < norm && norm < self.max_norm;
        log::debug!(
            "Liveness check - norm: {:.4}, thresholds: [{}, {}], is_genuine: {}",
            norm,
            self.min_norm,
            self.max_norm,
            is_genuine
        );

        if is_genuine {
            LivenessVerdict::genuine(0.8)
        } else {
            LivenessVerdict::spoofed(
                0.2,
                format!(
                    "Embedding norm {:.4} outside [{}, {}]",
                    norm, self.min_norm, self.max_norm
                ),
            )
        }
    }
}

/// Rejects silent captures before delegating to an inner check
pub struct SilenceGate<'a, L> {
    samples: &'a [f32],
    min_peak: f32,
    inner: L,
}

impl<'a, L: LivenessCheck> SilenceGate<'a, L> {
    pub fn new(samples: &'a [f32], min_peak: f32, inner: L) -> Self {
        Self {
            samples,
            min_peak,
            inner,
        }
    }
}

impl<L: LivenessCheck> LivenessCheck for SilenceGate<'_, L> {
    fn check(&self, embedding: &[f32]) -> LivenessVerdict {
        let peak = self
            .samples
            .iter()
            .fold(0.0f32, |acc, &s| acc.max(s.abs()));

        if peak < self.min_peak {
            log::warn!("Audio appears to be silent (max_amplitude: {})", peak);
            return LivenessVerdict::spoofed(0.0, "Audio is too quiet");
        }

        self.inner.check(embedding)
    }
}

#[derive(Error, Debug)]
#[error("Embedding extraction failed: {0}")]
pub struct ExtractionError(pub String);

/// Maps decoded mono PCM samples to a fixed-dimension embedding
pub trait EmbeddingExtractor {
    fn extract(&self, samples: &[f32], sample_rate: u32) -> Result<Vec<f32>, ExtractionError>;
}

impl<F> EmbeddingExtractor for F
where
    F: Fn(&[f32], u32) -> Result<Vec<f32>, ExtractionError>,
{
    fn extract(&self, samples: &[f32], sample_rate: u32) -> Result<Vec<f32>, ExtractionError> {
        self(samples, sample_rate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_norm_range_accepts_typical_embedding() {
        let check = NormRangeLiveness::default();
        let verdict = check.check(&[0.3, -0.4, 0.5]);
        assert!(verdict.is_genuine);
        assert_eq!(verdict.confidence, 0.8);
    }

    #[test]
    fn test_norm_range_rejects_degenerate_embedding() {
        let check = NormRangeLiveness::default();

        let zero = check.check(&[0.0, 0.0, 0.0]);
        assert!(!zero.is_genuine);
        assert_eq!(zero.confidence, 0.2);

        let huge = check.check(&[1000.0, 0.0, 0.0]);
        assert!(!huge.is_genuine);
    }

    #[test]
    fn test_silence_gate() {
        let quiet = vec![0.001f32; 160];
        let gate = SilenceGate::new(&quiet, 0.01, NormRangeLiveness::default());
        let verdict = gate.check(&[1.0, 0.0]);
        assert!(!verdict.is_genuine);
        assert_eq!(verdict.confidence, 0.0);
        assert_eq!(verdict.detail.as_deref(), Some("Audio is too quiet"));

        let loud: Vec<f32> = (0..160).map(|i| (i as f32 * 0.1).sin() * 0.5).collect();
        let gate = SilenceGate::new(&loud, 0.01, NormRangeLiveness::default());
        assert!(gate.check(&[1.0, 0.0]).is_genuine);
    }

    #[test]
    fn test_silence_gate_rejects_empty_audio() {
        let gate = SilenceGate::new(&[], 0.01, |_: &[f32]| LivenessVerdict::genuine(1.0));
        assert!(!gate.check(&[1.0]).is_genuine);
    }

    #[test]
    fn test_closure_capabilities() {
        let always = |_: &[f32]| LivenessVerdict::genuine(0.95);
        assert!(always.check(&[]).is_genuine);

        let extractor = |samples: &[f32], _rate: u32| -> Result<Vec<f32>, ExtractionError> {
            if samples.is_empty() {
                return Err(ExtractionError("no audio".to_string()));
            }
            Ok(vec![samples.iter().sum(), 1.0])
        };
        assert_eq!(extractor.extract(&[1.0, 2.0], 16_000).unwrap(), vec![3.0, 1.0]);
        assert!(extractor.extract(&[], 16_000).is_err());
    }
}
