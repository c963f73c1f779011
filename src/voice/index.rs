//! Exact voiceprint index
//!
//! Stores fixed-dimension embeddings in one contiguous buffer, in slot order.
//! Slots are handed out monotonically and are never reused.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use super::similarity::cosine_similarity;

/// Append-only position of one embedding inside the index
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Slot(pub u64);

impl Slot {
    pub fn as_usize(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum IndexError {
    #[error("Embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("Slot {0} was never assigned")]
    SlotNotFound(Slot),
}

/// Owned copy of the index contents, used by persistence
#[derive(Debug, Clone, PartialEq)]
pub struct IndexSnapshot {
    pub dimension: usize,
    /// Flat `count * dimension` buffer in slot order
    pub vectors: Vec<f32>,
}

impl IndexSnapshot {
    pub fn count(&self) -> usize {
        if self.dimension == 0 {
            0
        } else {
            self.vectors.len() / self.dimension
        }
    }
}

/// Brute-force vector index over fixed-dimension embeddings.
///
/// Appends take the write lock, so slot assignment is atomic with `count()`.
/// Lookups and searches share the read lock.
pub struct VectorIndex {
    dimension: usize,
    vectors: RwLock<Vec<f32>>,
}

impl VectorIndex {
    pub fn new(dimension: usize) -> Self {
        debug_assert!(dimension > 0, "index dimension must be non-zero");
        Self {
            dimension,
            vectors: RwLock::new(Vec::new()),
        }
    }

    /// Rebuild an index from a persisted snapshot
    pub fn from_snapshot(snapshot: IndexSnapshot) -> Result<Self, IndexError> {
        if snapshot.dimension == 0 || snapshot.vectors.len() % snapshot.dimension != 0 {
            return Err(IndexError::DimensionMismatch {
                expected: snapshot.dimension,
                actual: snapshot.vectors.len(),
            });
        }

        Ok(Self {
            dimension: snapshot.dimension,
            vectors: RwLock::new(snapshot.vectors),
        })
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// Number of assigned slots
    pub fn count(&self) -> usize {
        self.vectors.read().len() / self.dimension
    }

    /// Store a vector at the next free slot
    pub fn append(&self, vector: &[f32]) -> Result<Slot, IndexError> {
        self.check_dimension(vector)?;

        let mut vectors = self.vectors.write();
        let slot = Slot((vectors.len() / self.dimension) as u64);
        vectors.extend_from_slice(vector);

        log::debug!("Index append: slot={} count={}", slot, slot.0 + 1);
        Ok(slot)
    }

    /// Copy of the vector stored at `slot`
    pub fn get(&self, slot: Slot) -> Result<Vec<f32>, IndexError> {
        let vectors = self.vectors.read();
        let start = slot
            .as_usize()
            .checked_mul(self.dimension)
            .filter(|start| {
                start
                    .checked_add(self.dimension)
                    .is_some_and(|end| end <= vectors.len())
            })
            .ok_or(IndexError::SlotNotFound(slot))?;

        Ok(vectors[start..start + self.dimension].to_vec())
    }

    /// Exact k-nearest-neighbour search by raw cosine similarity, best first
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<(Slot, f64)>, IndexError> {
        self.check_dimension(query)?;

        let vectors = self.vectors.read();
        let mut hits: Vec<(Slot, f64)> = vectors
            .chunks_exact(self.dimension)
            .enumerate()
            .map(|(i, stored)| (Slot(i as u64), cosine_similarity(query, stored)))
            .collect();

        hits.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
        hits.truncate(k);
        Ok(hits)
    }

    pub fn snapshot(&self) -> IndexSnapshot {
        IndexSnapshot {
            dimension: self.dimension,
            vectors: self.vectors.read().clone(),
        }
    }

    fn check_dimension(&self, vector: &[f32]) -> Result<(), IndexError> {
        if vector.len() != self.dimension {
            return Err(IndexError::DimensionMismatch {
                expected: self.dimension,
                actual: vector.len(),
            });
        }
        Ok(())
    }
}
