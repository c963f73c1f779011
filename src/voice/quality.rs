//! Audio quality metrics recorded alongside an enrollment
//!
//! Operates on already-decoded mono `f32` PCM; decoding is the caller's job.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::validation::ValidationError;

/// Sample duration bounds for enrollment and verification captures
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QualityConfig {
    pub min_sample_secs: f64,
    pub max_sample_secs: f64,
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self {
            min_sample_secs: 3.0,
            max_sample_secs: 10.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityMetrics {
    /// Seconds
    pub duration: f64,
    pub sample_rate: u32,
    pub channels: u32,
    pub max_amplitude: f64,
    pub mean_amplitude: f64,
    /// dB
    pub signal_to_noise: f64,
}

impl QualityConfig {
    /// Reject captures outside the configured duration window
    pub fn check_duration(&self, duration: f64) -> Result<(), ValidationError> {
        if !(self.min_sample_secs..=self.max_sample_secs).contains(&duration) {
            return Err(ValidationError::InvalidRange(format!(
                "Voice sample must be between {:.1}s and {:.1}s, got {:.2}s",
                self.min_sample_secs, self.max_sample_secs, duration
            )));
        }
        Ok(())
    }
}

impl QualityMetrics {
    /// Metadata map in the shape `enroll` stores
    pub fn into_map(self) -> BTreeMap<String, f64> {
        BTreeMap::from([
            ("duration".to_string(), self.duration),
            ("sample_rate".to_string(), f64::from(self.sample_rate)),
            ("channels".to_string(), f64::from(self.channels)),
            ("max_amplitude".to_string(), self.max_amplitude),
            ("mean_amplitude".to_string(), self.mean_amplitude),
            ("signal_to_noise".to_string(), self.signal_to_noise),
        ])
    }

    pub fn check_duration(&self, config: &QualityConfig) -> Result<(), ValidationError> {
        config.check_duration(self.duration)
    }
}

/// Duration, amplitude statistics and SNR of a mono capture
pub fn analyze_quality(samples: &[f32], sample_rate: u32) -> QualityMetrics {
    let duration = if sample_rate == 0 {
        0.0
    } else {
        samples.len() as f64 / f64::from(sample_rate)
    };

    let metrics = QualityMetrics {
        duration,
        sample_rate,
        channels: 1,
        max_amplitude: samples
            .iter()
            .fold(0.0f64, |acc, &s| acc.max(f64::from(s.abs()))),
        mean_amplitude: mean(samples.iter().map(|&s| f64::from(s.abs())), samples.len()),
        signal_to_noise: signal_to_noise(samples),
    };

    log::debug!("Audio quality metrics: {:?}", metrics);
    metrics
}

/// `10 * log10(P_signal / (P_noise + 1e-10))`, noise being the signal with its
/// mean removed. Zero for empty input.
fn signal_to_noise(samples: &[f32]) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }

    let n = samples.len();
    let dc = mean(samples.iter().map(|&s| f64::from(s)), n);
    let signal_power = mean(samples.iter().map(|&s| f64::from(s).powi(2)), n);
    let noise_power = mean(samples.iter().map(|&s| (f64::from(s) - dc).powi(2)), n);

    let snr = 10.0 * (signal_power / (noise_power + 1e-10)).log10();
    if snr.is_finite() {
        snr
    } else {
        0.0
    }
}

fn mean(values: impl Iterator<Item = f64>, n: usize) -> f64 {
    if n == 0 {
        0.0
    } else {
        values.sum::<f64>() / n as f64
    }
}
