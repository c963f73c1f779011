//! Emberleaf voiceprint store
//!
//! Enrollment and verification of speaker embeddings with per-user
//! serialization and atomic, encrypted snapshots on disk.

pub mod config;
pub mod paths;
pub mod validation;
pub mod voice;
