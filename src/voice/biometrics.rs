use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

use super::capability::LivenessCheck;
use super::coordinator::UserLocks;
use super::identity::{IdentityError, IdentityMap, IdentityRecord};
use super::index::{IndexError, Slot, VectorIndex};
use super::persistence::{Persistence, PersistenceError};
use super::similarity::Calibration;
use crate::validation::{
    validate_dimension, validate_embedding, validate_metrics, validate_threshold,
    validate_user_id, ValidationError,
};

/// Metric recorded at enrollment: calibrated score of the closest voiceprint
/// already in the store
pub const CLOSEST_ENROLLED_METRIC: &str = "closest_enrolled_score";

/// Configuration for speaker biometrics
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BiometricsConfig {
    /// Embedding dimension produced by the extractor (ECAPA-TDNN: 192)
    pub dimension: usize,
    /// Calibrated score in [0, 1] required for verification
    pub verify_threshold: f64,
    /// Raw cosine → match score mapping, shared by enrollment and verification
    pub calibration: Calibration,
}

impl Default for BiometricsConfig {
    fn default() -> Self {
        Self {
            dimension: 192,
            verify_threshold: 0.65,
            calibration: Calibration::default(),
        }
    }
}

impl BiometricsConfig {
    pub fn validate(&self) -> Result<(), ValidationError> {
        validate_dimension(self.dimension)?;
        validate_threshold(self.verify_threshold)?;
        if !self.calibration.is_valid() {
            return Err(ValidationError::InvalidRange(format!(
                "Calibration must be strictly increasing, got {:?}",
                self.calibration
            )));
        }
        Ok(())
    }
}

/// Why a verification ended the way it did
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerifyReason {
    Success,
    BelowThreshold,
    NotFound,
    SpoofSuspected,
}

impl fmt::Display for VerifyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            VerifyReason::Success => "Verification successful",
            VerifyReason::BelowThreshold => "Similarity below threshold",
            VerifyReason::NotFound => "User not found",
            VerifyReason::SpoofSuspected => "Voice sample appears to be spoofed",
        };
        f.write_str(s)
    }
}

/// Verification result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerifyOutcome {
    pub user_id: String,
    pub verified: bool,
    /// Calibrated match score, or liveness confidence for spoofed samples
    pub score: f64,
    pub threshold: f64,
    pub reason: VerifyReason,
    /// Human-readable explanation
    pub detail: String,
}

/// Store summary
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreStats {
    pub enrolled: usize,
    pub slots: usize,
    /// Slots left behind by enrollments that failed to persist
    pub tombstoned: usize,
    pub dimension: usize,
    pub generation: u64,
}

#[derive(Error, Debug)]
pub enum OpenError {
    #[error("Invalid biometrics configuration: {0}")]
    InvalidConfig(#[source] ValidationError),

    #[error("Stored voiceprints have dimension {stored}, configuration expects {configured}")]
    DimensionMismatch { configured: usize, stored: usize },

    #[error(transparent)]
    Persistence(#[from] PersistenceError),
}

#[derive(Error, Debug)]
pub enum EnrollError {
    #[error("User '{0}' is already enrolled")]
    AlreadyEnrolled(String),

    #[error("Invalid user id: {0}")]
    InvalidUserId(#[source] ValidationError),

    #[error("Invalid embedding: {0}")]
    InvalidEmbedding(#[source] ValidationError),

    #[error("Invalid quality metrics: {0}")]
    InvalidMetadata(#[source] ValidationError),

    #[error("Voice sample appears to be spoofed (confidence: {score:.2})")]
    SpoofSuspected { score: f64, detail: Option<String> },

    #[error("Slot {0} is already owned by another user")]
    SlotConflict(Slot),

    #[error(transparent)]
    Index(#[from] IndexError),

    #[error("Failed to persist enrollment: {0}")]
    PersistenceFailure(#[source] PersistenceError),
}

impl From<IdentityError> for EnrollError {
    fn from(e: IdentityError) -> Self {
        match e {
            IdentityError::AlreadyEnrolled(user) => EnrollError::AlreadyEnrolled(user),
            IdentityError::DuplicateSlot(slot) => EnrollError::SlotConflict(slot),
        }
    }
}

#[derive(Error, Debug)]
pub enum VerifyError {
    #[error("Invalid embedding: {0}")]
    InvalidEmbedding(#[source] ValidationError),

    #[error(transparent)]
    Index(#[from] IndexError),
}

/// Voiceprint identity store and decision engine.
///
/// Construct once per process and share by reference; every method takes
/// `&self` and is safe under concurrent callers.
pub struct SpeakerBiometrics {
    config: BiometricsConfig,
    index: VectorIndex,
    identities: IdentityMap,
    persistence: Box<dyn Persistence>,
    user_locks: UserLocks,
    /// Serializes append + save + publish; holds the generation
    commit: Mutex<u64>,
}

impl SpeakerBiometrics {
    /// Open the store, restoring the last committed snapshot if one exists
    pub fn open(
        config: BiometricsConfig,
        persistence: Box<dyn Persistence>,
    ) -> Result<Self, OpenError> {
        config.validate().map_err(OpenError::InvalidConfig)?;

        let (index, identities, generation) = match persistence.load()? {
            None => (VectorIndex::new(config.dimension), IdentityMap::new(), 0),
            Some(snapshot) => {
                if snapshot.index.dimension != config.dimension {
                    return Err(OpenError::DimensionMismatch {
                        configured: config.dimension,
                        stored: snapshot.index.dimension,
                    });
                }
                let index = VectorIndex::from_snapshot(snapshot.index)
                    .map_err(|e| PersistenceError::CorruptSnapshot(e.to_string()))?;
                let identities = IdentityMap::from_records(snapshot.records)
                    .map_err(|e| PersistenceError::CorruptSnapshot(e.to_string()))?;
                (index, identities, snapshot.generation)
            }
        };

        log::info!(
            "Speaker biometrics initialized: {} users, dimension={}, threshold={:.2}",
            identities.size(),
            config.dimension,
            config.verify_threshold
        );

        Ok(Self {
            config,
            index,
            identities,
            persistence,
            user_locks: UserLocks::new(),
            commit: Mutex::new(generation),
        })
    }

    pub fn config(&self) -> &BiometricsConfig {
        &self.config
    }

    /// Enroll a new user with an extracted voiceprint.
    ///
    /// Succeeds only once the updated store has been committed to disk.
    pub fn enroll(
        &self,
        user_id: &str,
        embedding: &[f32],
        liveness: &dyn LivenessCheck,
        quality_metrics: BTreeMap<String, f64>,
    ) -> Result<IdentityRecord, EnrollError> {
        validate_user_id(user_id).map_err(EnrollError::InvalidUserId)?;
        validate_metrics(&quality_metrics).map_err(EnrollError::InvalidMetadata)?;

        let _user = self.user_locks.acquire(user_id);
        log::info!("Starting enrollment for user: {}", user_id);

        if self.identities.contains(user_id) {
            log::warn!("User {} already enrolled", user_id);
            return Err(EnrollError::AlreadyEnrolled(user_id.to_string()));
        }

        validate_embedding(embedding, self.config.dimension)
            .map_err(EnrollError::InvalidEmbedding)?;

        let verdict = liveness.check(embedding);
        log::info!(
            "Liveness check - is_genuine: {}, confidence: {:.2}",
            verdict.is_genuine,
            verdict.confidence
        );
        if !verdict.is_genuine {
            log::warn!(
                "Voice sample for {} appears to be spoofed (confidence: {:.2})",
                user_id,
                verdict.confidence
            );
            return Err(EnrollError::SpoofSuspected {
                score: verdict.confidence.clamp(0.0, 1.0),
                detail: verdict.detail,
            });
        }

        let mut metrics = quality_metrics;
        if let Some((owner, score)) = self.closest_enrolled(embedding)? {
            if score >= self.config.verify_threshold {
                log::warn!(
                    "Voiceprint for {} already matches enrolled user {} (score={:.3})",
                    user_id,
                    owner,
                    score
                );
            }
            metrics.insert(CLOSEST_ENROLLED_METRIC.to_string(), score);
        }

        let mut generation = self.commit.lock();

        let slot = self.index.append(embedding)?;
        let pending = self.identities.prepare(user_id, slot, metrics)?;

        let committed = self
            .persistence
            .save(&self.index.snapshot(), &self.identities.snapshot_with(&pending))
            .map_err(|e| {
                log::error!(
                    "Failed to persist enrollment for {} (slot {} tombstoned): {}",
                    user_id,
                    slot,
                    e
                );
                EnrollError::PersistenceFailure(e)
            })?;

        *generation = committed;
        let record = self.identities.publish(pending)?;

        log::info!(
            "Enrollment complete for user '{}': slot {}, generation {}",
            user_id,
            slot,
            *generation
        );

        Ok(record)
    }

    /// Verify a voiceprint against the one enrolled for `user_id`.
    ///
    /// Unknown users and spoofed samples are ordinary outcomes, not errors.
    pub fn verify(
        &self,
        user_id: &str,
        embedding: &[f32],
        liveness: &dyn LivenessCheck,
    ) -> Result<VerifyOutcome, VerifyError> {
        let threshold = self.config.verify_threshold;

        let Some(record) = self.identities.lookup(user_id) else {
            log::info!("Verification for unknown user '{}'", user_id);
            return Ok(VerifyOutcome {
                user_id: user_id.to_string(),
                verified: false,
                score: 0.0,
                threshold,
                reason: VerifyReason::NotFound,
                detail: VerifyReason::NotFound.to_string(),
            });
        };

        validate_embedding(embedding, self.config.dimension)
            .map_err(VerifyError::InvalidEmbedding)?;

        let verdict = liveness.check(embedding);
        log::info!(
            "Liveness check - is_genuine: {}, confidence: {:.2}",
            verdict.is_genuine,
            verdict.confidence
        );
        if !verdict.is_genuine {
            let score = verdict.confidence.clamp(0.0, 1.0);
            let mut detail = format!(
                "{} (confidence: {:.2})",
                VerifyReason::SpoofSuspected,
                score
            );
            if let Some(extra) = verdict.detail {
                detail.push_str(": ");
                detail.push_str(&extra);
            }
            log::warn!("Verification for user '{}' rejected: {}", user_id, detail);

            return Ok(VerifyOutcome {
                user_id: user_id.to_string(),
                verified: false,
                score,
                threshold,
                reason: VerifyReason::SpoofSuspected,
                detail,
            });
        }

        let stored = self.index.get(record.slot)?;
        let score = self.config.calibration.score(embedding, &stored);
        let verified = score >= threshold;

        log::info!(
            "Verification for user '{}': score={:.3}, threshold={:.3}, result={}",
            user_id,
            score,
            threshold,
            if verified { "PASS" } else { "FAIL" }
        );

        let (reason, detail) = if verified {
            (VerifyReason::Success, VerifyReason::Success.to_string())
        } else {
            (
                VerifyReason::BelowThreshold,
                format!(
                    "Verification failed. Similarity {:.2}% below threshold {:.2}%",
                    score * 100.0,
                    threshold * 100.0
                ),
            )
        };

        Ok(VerifyOutcome {
            user_id: user_id.to_string(),
            verified,
            score,
            threshold,
            reason,
            detail,
        })
    }

    /// Enrollment record for a user
    pub fn lookup(&self, user_id: &str) -> Option<IdentityRecord> {
        self.identities.lookup(user_id)
    }

    /// Check if a profile exists for a user
    pub fn profile_exists(&self, user_id: &str) -> bool {
        self.identities.contains(user_id)
    }

    /// List all enrolled users
    pub fn list_profiles(&self) -> Vec<String> {
        self.identities.user_ids()
    }

    pub fn stats(&self) -> StoreStats {
        let generation = self.commit.lock();
        let slots = self.index.count();
        let enrolled = self.identities.size();

        StoreStats {
            enrolled,
            slots,
            tombstoned: slots.saturating_sub(enrolled),
            dimension: self.index.dimension(),
            generation: *generation,
        }
    }

    /// Best match among enrolled users, skipping tombstoned slots
    fn closest_enrolled(&self, embedding: &[f32]) -> Result<Option<(String, f64)>, IndexError> {
        let hits = self.index.search(embedding, self.index.count())?;

        Ok(hits.into_iter().find_map(|(slot, raw)| {
            self.identities
                .owner_of(slot)
                .map(|owner| (owner, self.config.calibration.apply(raw)))
        }))
    }
}
