//! Voice biometrics module
//!
//! Speaker enrollment and verification over caller-supplied embeddings,
//! backed by an encrypted, crash-safe snapshot store.

pub mod biometrics;
pub mod capability;
pub mod coordinator;
pub mod identity;
pub mod index;
pub mod persistence;
pub mod quality;
pub mod similarity;

pub use biometrics::{
    BiometricsConfig, EnrollError, OpenError, SpeakerBiometrics, StoreStats, VerifyError,
    VerifyOutcome, VerifyReason,
};
pub use capability::{
    EmbeddingExtractor, ExtractionError, LivenessCheck, LivenessConfig, LivenessVerdict,
    NormRangeLiveness, SilenceGate,
};
pub use identity::IdentityRecord;
pub use index::Slot;
pub use persistence::{Persistence, PersistenceError, SnapshotStore, StoreSnapshot};
pub use quality::{analyze_quality, QualityConfig, QualityMetrics};
pub use similarity::Calibration;
