//! Durable buffer for measurements that could not be published.
//!
//! Each pending measurement is a file in one directory, named by the SHA-256 of its canonical
//! JSON. Queuing an identical measurement twice overwrites the same file, so the queue holds a
//! set of measurements rather than a sequence, and replays them in no particular order.
//!
//! Files are written to a temporary name and renamed into place; [`PendingQueue::drain`] only
//! looks at complete `.json` artifacts, so it never reads a partial write.

use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::future::Future;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info, warn};

use crate::measurement::StorableMeasurement;
use crate::publish::PublishError;

/// Extension of a complete pending artifact.
pub const FILE_EXT: &str = "json";
const TMP_EXT: &str = "tmp";

static TMP_COUNTER: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, thiserror::Error)]
pub enum PendingError {
    #[error("pending: I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("pending: failed to serialize measurement: {0}")]
    Serialize(#[source] serde_json::Error),
    #[error("pending: corrupt artifact {}: {source}", path.display())]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error(transparent)]
    Publish(#[from] PublishError),
}

impl PendingError {
    fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        PendingError::Io {
            path: path.into(),
            source,
        }
    }
}

/// Outcome of a drain that published everything.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct DrainSummary {
    pub published: usize,
}

/// Directory of content-addressed pending measurements.
#[derive(Debug, Clone)]
pub struct PendingQueue {
    dir: PathBuf,
}

impl PendingQueue {
    /// Open the queue, creating its directory if needed.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, PendingError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|e| PendingError::io(&dir, e))?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Bytes that identify a measurement. Equal measurements always serialize identically.
    ///
    /// Fails for a measurement whose bytes would not load back, so a drain never meets an
    /// artifact it can't read.
    pub fn canonical_bytes(m: &StorableMeasurement) -> Result<Vec<u8>, PendingError> {
        let mut m = m.clone();
        // -0.0 == 0.0, so both get the bytes of 0.0.
        if m.temp == 0.0 {
            m.temp = 0.0;
        }
        let bytes = serde_json::to_vec_pretty(&m).map_err(PendingError::Serialize)?;

        // serde_json writes NaN and infinities as null.
        serde_json::from_slice::<StorableMeasurement>(&bytes).map_err(PendingError::Serialize)?;
        Ok(bytes)
    }

    /// `<hex sha256>.json`
    pub fn artifact_name(bytes: &[u8]) -> String {
        format!("{}.{}", hex::encode(Sha256::digest(bytes)), FILE_EXT)
    }

    /// Persist a measurement. Returns the artifact path; queuing the same measurement again
    /// rewrites the same path.
    pub fn enqueue(&self, m: &StorableMeasurement) -> Result<PathBuf, PendingError> {
        let bytes = Self::canonical_bytes(m)?;
        let path = self.dir.join(Self::artifact_name(&bytes));

        let tmp = self.dir.join(format!(
            "{}.{}.{}.{}",
            Self::artifact_name(&bytes),
            std::process::id(),
            TMP_COUNTER.fetch_add(1, Ordering::Relaxed),
            TMP_EXT
        ));

        if let Err(e) = write_synced(&tmp, &bytes).and_then(|_| fs::rename(&tmp, &path)) {
            let _ = fs::remove_file(&tmp);
            return Err(PendingError::io(&path, e));
        }

        debug!(device_id = %m.device_id, path = %path.display(), "queued measurement");
        Ok(path)
    }

    /// Paths of all complete artifacts, sorted by name.
    pub fn list(&self) -> Result<Vec<PathBuf>, PendingError> {
        let entries = fs::read_dir(&self.dir).map_err(|e| PendingError::io(&self.dir, e))?;

        let mut paths = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| PendingError::io(&self.dir, e))?;
            let file_type = entry
                .file_type()
                .map_err(|e| PendingError::io(entry.path(), e))?;
            let path = entry.path();
            if file_type.is_file() && path.extension().is_some_and(|ext| ext == FILE_EXT) {
                paths.push(path);
            }
        }
        paths.sort();
        Ok(paths)
    }

    pub fn len(&self) -> Result<usize, PendingError> {
        self.list().map(|paths| paths.len())
    }

    pub fn is_empty(&self) -> Result<bool, PendingError> {
        self.len().map(|n| n == 0)
    }

    pub fn load(path: &Path) -> Result<StorableMeasurement, PendingError> {
        let bytes = fs::read(path).map_err(|e| PendingError::io(path, e))?;
        serde_json::from_slice(&bytes).map_err(|source| PendingError::Corrupt {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Hand every pending measurement to `publish`, one at a time, deleting each artifact once
    /// its publish succeeds.
    ///
    /// The first failure stops the drain and is returned; that artifact and every one not yet
    /// attempted stay queued for the next drain.
    #[tracing::instrument(name = "pending_drain", skip_all, fields(dir = %self.dir.display()))]
    pub async fn drain<F, Fut>(&self, mut publish: F) -> Result<DrainSummary, PendingError>
    where
        F: FnMut(StorableMeasurement) -> Fut,
        Fut: Future<Output = Result<(), PublishError>>,
    {
        let paths = self.list()?;
        if paths.is_empty() {
            return Ok(DrainSummary::default());
        }
        info!(pending = paths.len(), "draining pending measurements");

        let mut summary = DrainSummary::default();
        for path in paths {
            let m = Self::load(&path)?;

            if let Err(e) = publish(m).await {
                warn!(
                    path = %path.display(),
                    published = summary.published,
                    error = %e,
                    "publish failed, stopping drain"
                );
                return Err(e.into());
            }

            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(PendingError::io(&path, e)),
            }
            summary.published += 1;
        }

        info!(published = summary.published, "pending queue drained");
        Ok(summary)
    }
}

fn write_synced(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let mut file = File::create(path)?;
    file.write_all(bytes)?;
    file.sync_all()
}
