//! Test harness: deterministic encoder + isolated service instances
//!
//! The encoder is a bag-of-words hashing projection: each lowercase token
//! bumps one dimension chosen by a stable FNV-1a hash, and the result is
//! L2-normalized. Texts sharing tokens score proportionally high cosine;
//! disjoint texts score near zero. Deterministic, fast, and dependency-free,
//! which is exactly what journey tests need from an embedding model.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use remanence_core::{Encoder, EncoderError, MemoryService, StoreConfig};
use tempfile::TempDir;

/// Dimension used by harness services
pub const TEST_DIMENSION: usize = 384;

/// Deterministic bag-of-words encoder
pub struct TestEncoder {
    dim: usize,
}

impl TestEncoder {
    pub fn new(dim: usize) -> Self {
        Self { dim }
    }

    pub fn standard() -> Self {
        Self::new(TEST_DIMENSION)
    }
}

impl Encoder for TestEncoder {
    fn embed(&self, text: &str) -> Result<Vec<f32>, EncoderError> {
        let mut vector = vec![0.0_f32; self.dim];
        for token in text.split(|c: char| !c.is_alphanumeric()) {
            if token.is_empty() {
                continue;
            }
            let token = token.to_lowercase();
            let mut h: u64 = 1469598103934665603;
            for b in token.bytes() {
                h ^= u64::from(b);
                h = h.wrapping_mul(1099511628211);
            }
            vector[(h % self.dim as u64) as usize] += 1.0;
        }
        if vector.iter().all(|v| *v == 0.0) {
            vector[0] = 1.0;
        }
        let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        for x in &mut vector {
            *x /= norm;
        }
        Ok(vector)
    }

    fn dimension(&self) -> usize {
        self.dim
    }

    fn model_identifier(&self) -> String {
        format!("e2e-hash-encoder-{}d", self.dim)
    }
}

/// An isolated service over a tempdir-backed store
pub struct TestService {
    pub service: MemoryService,
    pub db_path: PathBuf,
    // Kept alive so the directory survives the test body
    _dir: TempDir,
}

impl TestService {
    /// Open a fresh service in its own temporary directory
    pub fn open() -> Self {
        Self::open_with(|_| {})
    }

    /// Open with config adjustments applied before the store is created
    pub fn open_with(adjust: impl FnOnce(&mut StoreConfig)) -> Self {
        let dir = TempDir::new().expect("failed to create temp directory");
        let mut config = StoreConfig {
            data_dir: Some(dir.path().to_path_buf()),
            dimension: TEST_DIMENSION,
            ..StoreConfig::default()
        };
        adjust(&mut config);
        let db_path = dir.path().join(config.db_file_name.clone());
        let service = MemoryService::open(config, Arc::new(TestEncoder::standard()))
            .expect("failed to open test service");
        Self {
            service,
            db_path,
            _dir: dir,
        }
    }

    /// Reopen a second service over the same directory (another "client")
    pub fn reopen(&self) -> MemoryService {
        let config = StoreConfig {
            data_dir: Some(
                self.db_path
                    .parent()
                    .expect("db path has a parent")
                    .to_path_buf(),
            ),
            dimension: TEST_DIMENSION,
            ..StoreConfig::default()
        };
        MemoryService::open(config, Arc::new(TestEncoder::standard()))
            .expect("failed to reopen test service")
    }
}

/// Shift a stored memory's timestamps into the past, straight through the
/// database file. Fixture-only: production code never backdates.
pub fn backdate_days(db_path: &Path, content_hash: &str, days: f64) {
    let conn = rusqlite::Connection::open(db_path).expect("failed to open db for backdating");
    let shift = days * 86_400.0;

    let (created, updated): (f64, f64) = conn
        .query_row(
            "SELECT created_at, updated_at FROM memories WHERE content_hash = ?1",
            [content_hash],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .expect("memory to backdate must exist");

    let new_created = created - shift;
    let new_updated = updated - shift;
    conn.execute(
        "UPDATE memories SET created_at = ?1, created_at_iso = ?2,
                              updated_at = ?3, updated_at_iso = ?4
         WHERE content_hash = ?5",
        rusqlite::params![
            new_created,
            iso_of(new_created),
            new_updated,
            iso_of(new_updated),
            content_hash,
        ],
    )
    .expect("backdate update failed");
}

fn iso_of(epoch: f64) -> String {
    let secs = epoch.floor() as i64;
    let nanos = ((epoch - secs as f64) * 1e9) as u32;
    chrono::DateTime::<chrono::Utc>::from_timestamp(secs, nanos)
        .unwrap_or_default()
        .to_rfc3339()
}
