//! Crash-consistent snapshot storage for the voiceprint store
//!
//! A snapshot is two artifacts plus a commit marker:
//! - `vectors-<gen>.bin`: encrypted vector blob (header, nonce, ciphertext)
//! - `identities-<gen>.json`: identity records sorted by slot
//! - `CURRENT`: generation, artifact names and their SHA-256 digests
//!
//! Every file is written to a `.tmp` sibling, fsynced and renamed. Renaming
//! `CURRENT` is the single commit point; artifacts without a marker pointing
//! at them are ignored on load.

use chacha20poly1305::{
    aead::{Aead, KeyInit, OsRng, Payload},
    XChaCha20Poly1305, XNonce,
};
use parking_lot::Mutex;
use rand_core::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use zeroize::Zeroizing;

use super::identity::IdentityRecord;
use super::index::IndexSnapshot;

const MARKER_FILE: &str = "CURRENT";
const KEY_FILE: &str = ".key";
const BLOB_MAGIC: &[u8; 4] = b"EMVP";
const BLOB_VERSION: u32 = 1;
/// magic + version + generation + dimension + count
const HEADER_LEN: usize = 4 + 4 + 8 + 4 + 8;
const NONCE_LEN: usize = 24;

#[derive(Error, Debug)]
pub enum PersistenceError {
    #[error("Corrupt snapshot: {0}")]
    CorruptSnapshot(String),

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },

    #[error("Failed to encode snapshot: {0}")]
    Encode(String),
}

impl PersistenceError {
    fn io(context: impl Into<String>, source: io::Error) -> Self {
        PersistenceError::Io {
            context: context.into(),
            source,
        }
    }

    fn corrupt(msg: impl Into<String>) -> Self {
        PersistenceError::CorruptSnapshot(msg.into())
    }
}

/// A committed, mutually consistent pair of index and identity records
#[derive(Debug, Clone, PartialEq)]
pub struct StoreSnapshot {
    pub generation: u64,
    pub index: IndexSnapshot,
    pub records: Vec<IdentityRecord>,
}

/// Durable storage for (index, identity map) pairs
pub trait Persistence: Send + Sync {
    /// Atomically replace the previous snapshot, returning the new generation
    fn save(
        &self,
        index: &IndexSnapshot,
        records: &[IdentityRecord],
    ) -> Result<u64, PersistenceError>;

    /// Latest committed snapshot, or `None` when nothing was ever committed
    fn load(&self) -> Result<Option<StoreSnapshot>, PersistenceError>;
}

#[derive(Debug, Serialize, Deserialize)]
struct CommitMarker {
    generation: u64,
    vectors: String,
    identities: String,
    vectors_sha256: String,
    identities_sha256: String,
}

#[derive(Serialize, Deserialize)]
struct IdentityFile {
    generation: u64,
    dimension: usize,
    records: Vec<IdentityRecord>,
}

/// Artifacts written for a generation but not yet published by `CURRENT`
#[derive(Debug)]
pub(crate) struct StagedSnapshot {
    generation: u64,
    vectors_path: PathBuf,
    identities_path: PathBuf,
    marker: CommitMarker,
}

impl StagedSnapshot {
    #[cfg(test)]
    pub(crate) fn vectors_path(&self) -> &Path {
        &self.vectors_path
    }

    #[cfg(test)]
    pub(crate) fn identities_path(&self) -> &Path {
        &self.identities_path
    }
}

/// Filesystem snapshot store with voiceprint encryption at rest
pub struct SnapshotStore {
    root: PathBuf,
    encryption_key: Zeroizing<[u8; 32]>,
    /// Serializes writers; holds the last committed generation
    committed: Mutex<u64>,
}

impl SnapshotStore {
    /// Open (or create) a snapshot directory
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, PersistenceError> {
        let root = root.into();
        fs::create_dir_all(&root)
            .map_err(|e| PersistenceError::io("Failed to create voiceprint directory", e))?;

        let encryption_key = Self::get_or_create_encryption_key(&root)?;

        log::info!("Voiceprint snapshot store: {}", root.display());

        Ok(Self {
            root,
            encryption_key,
            committed: Mutex::new(0),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Get or create the encryption key for the vector blob
    fn get_or_create_encryption_key(
        root: &Path,
    ) -> Result<Zeroizing<[u8; 32]>, PersistenceError> {
        let key_path = root.join(KEY_FILE);

        let key = if key_path.exists() {
            let key_bytes = Zeroizing::new(
                fs::read(&key_path)
                    .map_err(|e| PersistenceError::io("Failed to read encryption key", e))?,
            );
            if key_bytes.len() != 32 {
                return Err(PersistenceError::corrupt("Invalid encryption key length"));
            }
            let mut key_array = Zeroizing::new([0u8; 32]);
            key_array.copy_from_slice(&key_bytes);
            key_array
        } else {
            let mut key_array = Zeroizing::new([0u8; 32]);
            OsRng.fill_bytes(&mut *key_array);

            write_durable(&key_path, &*key_array)?;

            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                fs::set_permissions(&key_path, fs::Permissions::from_mode(0o600))
                    .map_err(|e| PersistenceError::io("Failed to set key file permissions", e))?;
            }

            log::info!("Generated new voiceprint encryption key");
            key_array
        };

        Ok(key)
    }

    fn vectors_name(generation: u64) -> String {
        format!("vectors-{generation}.bin")
    }

    fn identities_name(generation: u64) -> String {
        format!("identities-{generation}.json")
    }

    /// Highest generation seen in the marker cache or on disk, plus one.
    /// Generation numbers are never reused, even for abandoned artifacts.
    fn next_generation(&self, committed: u64) -> Result<u64, PersistenceError> {
        let mut highest = committed;
        for name in self.list_files()? {
            if let Some(generation) = artifact_generation(&name) {
                highest = highest.max(generation);
            }
        }
        Ok(highest + 1)
    }

    fn list_files(&self) -> Result<Vec<String>, PersistenceError> {
        let entries = fs::read_dir(&self.root)
            .map_err(|e| PersistenceError::io("Failed to read voiceprint directory", e))?;

        let mut names = Vec::new();
        for entry in entries {
            let entry =
                entry.map_err(|e| PersistenceError::io("Failed to read directory entry", e))?;
            if let Some(name) = entry.file_name().to_str() {
                names.push(name.to_string());
            }
        }
        Ok(names)
    }

    /// Write both artifacts for the next generation without publishing them
    pub(crate) fn stage(
        &self,
        committed: u64,
        index: &IndexSnapshot,
        records: &[IdentityRecord],
    ) -> Result<StagedSnapshot, PersistenceError> {
        let generation = self.next_generation(committed)?;

        let blob = self.encode_vectors(generation, index)?;
        let vectors_name = Self::vectors_name(generation);
        let vectors_path = self.root.join(&vectors_name);
        write_durable(&vectors_path, &blob)?;

        let identities = serde_json::to_vec_pretty(&IdentityFile {
            generation,
            dimension: index.dimension,
            records: records.to_vec(),
        })
        .map_err(|e| PersistenceError::Encode(e.to_string()))?;
        let identities_name = Self::identities_name(generation);
        let identities_path = self.root.join(&identities_name);
        write_durable(&identities_path, &identities)?;
        // artifact renames must be durable before CURRENT can point at them
        sync_dir(&self.root);

        log::debug!(
            "Staged snapshot generation {}: {} vectors, {} records",
            generation,
            index.count(),
            records.len()
        );

        Ok(StagedSnapshot {
            generation,
            vectors_path,
            identities_path,
            marker: CommitMarker {
                generation,
                vectors: vectors_name,
                identities: identities_name,
                vectors_sha256: sha256_hex(&blob),
                identities_sha256: sha256_hex(&identities),
            },
        })
    }

    /// Publish a staged snapshot by replacing `CURRENT`
    pub(crate) fn commit(&self, staged: StagedSnapshot) -> Result<u64, PersistenceError> {
        let marker = serde_json::to_vec_pretty(&staged.marker)
            .map_err(|e| PersistenceError::Encode(e.to_string()))?;
        write_durable(&self.root.join(MARKER_FILE), &marker)?;
        sync_dir(&self.root);

        self.remove_stale(staged.generation);
        log::debug!(
            "Committed snapshot generation {} ({}, {})",
            staged.generation,
            staged.vectors_path.display(),
            staged.identities_path.display()
        );

        Ok(staged.generation)
    }

    /// Best-effort removal of older generations and leftover temp files
    fn remove_stale(&self, current: u64) {
        let names = match self.list_files() {
            Ok(names) => names,
            Err(e) => {
                log::warn!("Skipping snapshot cleanup: {}", e);
                return;
            }
        };

        for name in names {
            let stale = name.ends_with(".tmp")
                || artifact_generation(&name).is_some_and(|g| g != current);
            if stale {
                if let Err(e) = fs::remove_file(self.root.join(&name)) {
                    log::warn!("Failed to remove stale snapshot file {}: {}", name, e);
                }
            }
        }
    }

    fn encode_vectors(
        &self,
        generation: u64,
        index: &IndexSnapshot,
    ) -> Result<Vec<u8>, PersistenceError> {
        let mut header = Vec::with_capacity(HEADER_LEN);
        header.extend_from_slice(BLOB_MAGIC);
        header.extend_from_slice(&BLOB_VERSION.to_le_bytes());
        header.extend_from_slice(&generation.to_le_bytes());
        header.extend_from_slice(&(index.dimension as u32).to_le_bytes());
        header.extend_from_slice(&(index.count() as u64).to_le_bytes());

        let plaintext: Zeroizing<Vec<u8>> =
            Zeroizing::new(index.vectors.iter().flat_map(|f| f.to_le_bytes()).collect());

        let cipher = XChaCha20Poly1305::new((&*self.encryption_key).into());
        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = XNonce::from(nonce_bytes);

        let ciphertext = cipher
            .encrypt(
                &nonce,
                Payload {
                    msg: plaintext.as_slice(),
                    aad: header.as_slice(),
                },
            )
            .map_err(|e| PersistenceError::Encode(format!("Encryption failed: {:?}", e)))?;

        let mut blob = header;
        blob.extend_from_slice(&nonce_bytes);
        blob.extend_from_slice(&ciphertext);
        Ok(blob)
    }

    fn decode_vectors(
        &self,
        expected_generation: u64,
        blob: &[u8],
    ) -> Result<IndexSnapshot, PersistenceError> {
        if blob.len() < HEADER_LEN + NONCE_LEN {
            return Err(PersistenceError::corrupt("Vector blob is truncated"));
        }

        let (header, rest) = blob.split_at(HEADER_LEN);
        if &header[0..4] != BLOB_MAGIC {
            return Err(PersistenceError::corrupt("Vector blob has bad magic"));
        }

        let version = u32::from_le_bytes(le_array(&header[4..8]));
        if version != BLOB_VERSION {
            return Err(PersistenceError::corrupt(format!(
                "Unsupported vector blob version {}",
                version
            )));
        }

        let generation = u64::from_le_bytes(le_array(&header[8..16]));
        let dimension = u32::from_le_bytes(le_array(&header[16..20])) as usize;
        let count = u64::from_le_bytes(le_array(&header[20..28])) as usize;

        if generation != expected_generation {
            return Err(PersistenceError::corrupt(format!(
                "Vector blob generation {} does not match commit marker {}",
                generation, expected_generation
            )));
        }
        if dimension == 0 {
            return Err(PersistenceError::corrupt("Vector blob has zero dimension"));
        }

        let (nonce_bytes, ciphertext) = rest.split_at(NONCE_LEN);
        let nonce = XNonce::from_slice(nonce_bytes);
        let cipher = XChaCha20Poly1305::new((&*self.encryption_key).into());

        let plaintext = Zeroizing::new(
            cipher
                .decrypt(
                    nonce,
                    Payload {
                        msg: ciphertext,
                        aad: header,
                    },
                )
                .map_err(|_| PersistenceError::corrupt("Vector blob failed authentication"))?,
        );

        let expected_len = count
            .checked_mul(dimension)
            .and_then(|n| n.checked_mul(4))
            .ok_or_else(|| PersistenceError::corrupt("Vector blob header overflows"))?;
        if plaintext.len() != expected_len {
            return Err(PersistenceError::corrupt(format!(
                "Vector blob holds {} bytes, header declares {}",
                plaintext.len(),
                expected_len
            )));
        }

        let vectors = plaintext
            .chunks_exact(4)
            .map(|chunk| f32::from_le_bytes(le_array(chunk)))
            .collect();

        Ok(IndexSnapshot { dimension, vectors })
    }

    fn read_artifact(&self, name: &str, expected_sha256: &str) -> Result<Vec<u8>, PersistenceError> {
        let bytes = match fs::read(self.root.join(name)) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(PersistenceError::corrupt(format!(
                    "Committed artifact {} is missing",
                    name
                )))
            }
            Err(e) => return Err(PersistenceError::io(format!("Failed to read {}", name), e)),
        };

        if sha256_hex(&bytes) != expected_sha256 {
            return Err(PersistenceError::corrupt(format!(
                "Checksum mismatch for {}",
                name
            )));
        }
        Ok(bytes)
    }
}

impl Persistence for SnapshotStore {
    fn save(
        &self,
        index: &IndexSnapshot,
        records: &[IdentityRecord],
    ) -> Result<u64, PersistenceError> {
        let mut committed = self.committed.lock();
        let staged = self.stage(*committed, index, records)?;
        let generation = self.commit(staged)?;
        *committed = generation;
        Ok(generation)
    }

    fn load(&self) -> Result<Option<StoreSnapshot>, PersistenceError> {
        let mut committed = self.committed.lock();

        let marker_bytes = match fs::read(self.root.join(MARKER_FILE)) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                log::info!("No voiceprint snapshot found, starting empty");
                return Ok(None);
            }
            Err(e) => return Err(PersistenceError::io("Failed to read commit marker", e)),
        };

        let marker: CommitMarker = serde_json::from_slice(&marker_bytes)
            .map_err(|e| PersistenceError::corrupt(format!("Unreadable commit marker: {}", e)))?;

        if marker.vectors != Self::vectors_name(marker.generation)
            || marker.identities != Self::identities_name(marker.generation)
        {
            return Err(PersistenceError::corrupt(
                "Commit marker names artifacts from another generation",
            ));
        }

        let blob = self.read_artifact(&marker.vectors, &marker.vectors_sha256)?;
        let index = self.decode_vectors(marker.generation, &blob)?;

        let identity_bytes = self.read_artifact(&marker.identities, &marker.identities_sha256)?;
        let identities: IdentityFile = serde_json::from_slice(&identity_bytes)
            .map_err(|e| PersistenceError::corrupt(format!("Unreadable identity list: {}", e)))?;

        if identities.generation != marker.generation {
            return Err(PersistenceError::corrupt(format!(
                "Identity list generation {} does not match commit marker {}",
                identities.generation, marker.generation
            )));
        }
        if identities.dimension != index.dimension {
            return Err(PersistenceError::corrupt(format!(
                "Identity list dimension {} does not match vector blob {}",
                identities.dimension, index.dimension
            )));
        }

        check_references(&identities.records, index.count())?;

        *committed = marker.generation;
        log::info!(
            "Loaded voiceprint snapshot generation {}: {} users, {} slots",
            marker.generation,
            identities.records.len(),
            index.count()
        );

        Ok(Some(StoreSnapshot {
            generation: marker.generation,
            index,
            records: identities.records,
        }))
    }
}

/// Every record must point at an existing, unshared slot
fn check_references(records: &[IdentityRecord], count: usize) -> Result<(), PersistenceError> {
    let mut users = HashSet::with_capacity(records.len());
    let mut slots = HashSet::with_capacity(records.len());

    for record in records {
        if record.user_id.is_empty() {
            return Err(PersistenceError::corrupt("Identity record with empty user id"));
        }
        if record.slot.as_usize() >= count {
            return Err(PersistenceError::corrupt(format!(
                "User '{}' references slot {} but the index holds {} slots",
                record.user_id, record.slot, count
            )));
        }
        if !users.insert(record.user_id.as_str()) {
            return Err(PersistenceError::corrupt(format!(
                "User '{}' appears twice",
                record.user_id
            )));
        }
        if !slots.insert(record.slot) {
            return Err(PersistenceError::corrupt(format!(
                "Slot {} is shared by several users",
                record.slot
            )));
        }
    }
    Ok(())
}

/// Generation number encoded in a published artifact name
fn artifact_generation(name: &str) -> Option<u64> {
    let name = name.strip_suffix(".tmp").unwrap_or(name);
    name.strip_prefix("vectors-")
        .and_then(|rest| rest.strip_suffix(".bin"))
        .or_else(|| {
            name.strip_prefix("identities-")
                .and_then(|rest| rest.strip_suffix(".json"))
        })
        .and_then(|g| g.parse().ok())
}

/// Write to a `.tmp` sibling, fsync, then rename over `path`
fn write_durable(path: &Path, bytes: &[u8]) -> Result<(), PersistenceError> {
    let mut tmp_path = path.as_os_str().to_owned();
    tmp_path.push(".tmp");
    let tmp_path = PathBuf::from(tmp_path);

    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(&tmp_path)
        .map_err(|e| PersistenceError::io(format!("Failed to create {}", tmp_path.display()), e))?;
    file.write_all(bytes)
        .map_err(|e| PersistenceError::io(format!("Failed to write {}", tmp_path.display()), e))?;
    file.sync_all()
        .map_err(|e| PersistenceError::io(format!("Failed to sync {}", tmp_path.display()), e))?;
    drop(file);

    fs::rename(&tmp_path, path)
        .map_err(|e| PersistenceError::io(format!("Failed to publish {}", path.display()), e))?;
    trace_durable(|| format!("publish {}", file_name(path)));
    Ok(())
}

/// Make renames inside `dir` durable
fn sync_dir(dir: &Path) {
    #[cfg(unix)]
    if let Ok(handle) = File::open(dir) {
        if let Err(e) = handle.sync_all() {
            log::warn!("Failed to sync {}: {}", dir.display(), e);
        }
    }
    #[cfg(not(unix))]
    let _ = dir;
    trace_durable(|| "sync_dir".to_string());
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

#[cfg(test)]
thread_local! {
    /// Publish and directory-sync operations issued by this thread, in order
    static DURABLE_OPS: std::cell::RefCell<Vec<String>> = std::cell::RefCell::new(Vec::new());
}

#[cfg(test)]
fn trace_durable(op: impl FnOnce() -> String) {
    DURABLE_OPS.with(|ops| ops.borrow_mut().push(op()));
}

#[cfg(not(test))]
fn trace_durable(_op: impl FnOnce() -> String) {}

#[cfg(test)]
fn take_durable_ops() -> Vec<String> {
    DURABLE_OPS.with(|ops| std::mem::take(&mut *ops.borrow_mut()))
}

fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

fn le_array<const N: usize>(bytes: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&bytes[..N]);
    out
}
