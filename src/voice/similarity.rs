//! Cosine similarity and score calibration

use serde::{Deserialize, Serialize};

/// Cosine similarity between two equal-length embeddings.
///
/// Each vector is normalized to unit length independently; a zero-norm vector
/// is treated as having norm 1. Result lies in [-1, 1].
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() {
        return 0.0;
    }

    let norm_a = l2_norm(a);
    let norm_b = l2_norm(b);

    let dot_product: f64 = a
        .iter()
        .zip(b.iter())
        .map(|(&x, &y)| (f64::from(x) / norm_a) * (f64::from(y) / norm_b))
        .sum();

    dot_product.clamp(-1.0, 1.0)
}

/// L2 norm, substituting 1.0 for a zero vector
pub fn l2_norm(v: &[f32]) -> f64 {
    let norm = v
        .iter()
        .map(|&x| f64::from(x) * f64::from(x))
        .sum::<f64>()
        .sqrt();

    if norm > 0.0 {
        norm
    } else {
        1.0
    }
}

/// Monotonic mapping from raw cosine similarity into a [0, 1] match score
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Calibration {
    /// `1 / (1 + exp(-steepness * (raw - midpoint)))`
    Logistic { midpoint: f64, steepness: f64 },
    /// `(raw + 1) / 2`
    Linear,
}

impl Default for Calibration {
    fn default() -> Self {
        Calibration::Logistic {
            midpoint: 0.0,
            steepness: 10.0,
        }
    }
}

impl Calibration {
    pub fn apply(&self, raw: f64) -> f64 {
        let score = match *self {
            Calibration::Logistic {
                midpoint,
                steepness,
            } => 1.0 / (1.0 + (-steepness * (raw - midpoint)).exp()),
            Calibration::Linear => (raw + 1.0) / 2.0,
        };

        if score.is_nan() {
            0.0
        } else {
            score.clamp(0.0, 1.0)
        }
    }

    /// Calibrated similarity between two embeddings
    pub fn score(&self, a: &[f32], b: &[f32]) -> f64 {
        self.apply(cosine_similarity(a, b))
    }

    /// Only strictly increasing mappings are accepted
    pub fn is_valid(&self) -> bool {
        match *self {
            Calibration::Logistic {
                midpoint,
                steepness,
            } => midpoint.is_finite() && steepness.is_finite() && steepness > 0.0,
            Calibration::Linear => true,
        }
    }
}


#[cfg(test)]
mod prop_tests {
    use super::*;
    use proptest::prelude::*;

    fn vec_pair() -> impl Strategy<Value = (Vec<f32>, Vec<f32>)> {
        (1usize..32).prop_flat_map(|d| {
            (
                prop::collection::vec(-100.0f32..100.0, d),
                prop::collection::vec(-100.0f32..100.0, d),
            )
        })
    }

    proptest! {
        #[test]
        fn similarity_is_symmetric((a, b) in vec_pair()) {
            prop_assert_eq!(cosine_similarity(&a, &b), cosine_similarity(&b, &a));
        }

        #[test]
        fn similarity_in_unit_range((a, b) in vec_pair()) {
            let s = cosine_similarity(&a, &b);
            prop_assert!((-1.0..=1.0).contains(&s));
        }

        #[test]
        fn calibrated_score_in_unit_interval(raw in -1.0f64..=1.0) {
            let s = Calibration::default().apply(raw);
            prop_assert!((0.0..=1.0).contains(&s));
        }

        #[test]
        fn calibration_is_monotonic(a in -1.0f64..=1.0, b in -1.0f64..=1.0) {
            let cal = Calibration::default();
            if a <= b {
                prop_assert!(cal.apply(a) <= cal.apply(b));
            } else {
                prop_assert!(cal.apply(a) >= cal.apply(b));
            }
        }
    }
}
