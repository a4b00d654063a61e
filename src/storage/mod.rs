//! Persistent experiment store.
//!
//! One file per experiment, keyed by `(solver name, problem name, factor
//! digest)`. Files are replaced atomically, so an interrupted save leaves the
//! previous record (or none) in place, never a partial one.

mod atomic;
pub mod codec;

use std::ffi::OsStr;
use std::fs::{self, File};
use std::io::{BufReader, ErrorKind, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{SimoptResult, StorageError};
use crate::experiment::result::ExperimentResult;
use crate::experiment::ExperimentState;
use crate::factors::Factors;

use atomic::{is_temp_file, AtomicFile};

/// Current schema version of [`ExperimentRecord`].
pub const RECORD_SCHEMA_VERSION: u32 = 2;

const RECORD_EXTENSION: &str = "simx";

/// Identity of a stored experiment.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StoreKey {
    /// Solver label.
    pub solver_name: String,
    /// Problem label.
    pub problem_name: String,
    /// BLAKE3 digest over the solver's and the problem's factor settings.
    pub factors_digest: String,
}

impl StoreKey {
    /// Key of a `(solver, problem)` pair under the given factor settings.
    #[must_use]
    pub fn new(
        solver_name: &str,
        problem_name: &str,
        solver_factors: &Factors,
        problem_factors: &Factors,
    ) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(b"simopt/store-key/v1");
        solver_factors.digest_into(&mut hasher);
        problem_factors.digest_into(&mut hasher);
        Self {
            solver_name: solver_name.to_string(),
            problem_name: problem_name.to_string(),
            factors_digest: hasher.finalize().to_hex().to_string(),
        }
    }

    /// File name of the record: readable name parts plus a hash of the full key.
    #[must_use]
    pub fn file_name(&self) -> String {
        let mut hasher = blake3::Hasher::new();
        for part in [&self.solver_name, &self.problem_name, &self.factors_digest] {
            hasher.update(&(part.len() as u64).to_le_bytes());
            hasher.update(part.as_bytes());
        }
        let hash = hasher.finalize().to_hex();
        format!(
            "{}__{}__{}.{RECORD_EXTENSION}",
            sanitize(&self.solver_name),
            sanitize(&self.problem_name),
            &hash[..16]
        )
    }
}

fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

/// Everything needed to restore an experiment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentRecord {
    /// Version of this schema the record was written with.
    pub schema_version: u32,
    /// Identity the record is stored under.
    pub key: StoreKey,
    /// Registry key of the solver.
    pub solver_key: String,
    /// Registry key of the problem.
    pub problem_key: String,
    /// Factor settings of the solver.
    pub solver_factors: Factors,
    /// Factor settings of the problem.
    pub problem_factors: Factors,
    /// Stream family the experiment drew from; restored experiments keep it.
    pub stream_family: u32,
    /// Lifecycle state when saved.
    pub state: ExperimentState,
    /// Time of the save.
    pub saved_at: DateTime<Utc>,
    /// Results up to the saved state.
    pub result: ExperimentResult,
}

impl ExperimentRecord {
    /// Record of the given state, stamped with the current time, in stream family 0.
    #[must_use]
    pub fn new(
        key: StoreKey,
        solver_key: impl Into<String>,
        problem_key: impl Into<String>,
        solver_factors: Factors,
        problem_factors: Factors,
        state: ExperimentState,
        result: ExperimentResult,
    ) -> Self {
        Self {
            schema_version: RECORD_SCHEMA_VERSION,
            key,
            solver_key: solver_key.into(),
            problem_key: problem_key.into(),
            solver_factors,
            problem_factors,
            stream_family: 0,
            state,
            saved_at: Utc::now(),
            result,
        }
    }

    /// Sets the stream family restored experiments draw from.
    #[must_use]
    pub const fn with_stream_family(mut self, family: u32) -> Self {
        self.stream_family = family;
        self
    }
}

/// Directory of experiment records.
#[derive(Debug, Clone)]
pub struct ExperimentStore {
    dir: PathBuf,
}

impl ExperimentStore {
    /// Opens (creating if needed) the store at `dir` and removes temp files
    /// left behind by interrupted saves.
    pub fn open(dir: impl AsRef<Path>) -> SimoptResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).map_err(StorageError::from)?;

        for entry in fs::read_dir(&dir).map_err(StorageError::from)? {
            let path = entry.map_err(StorageError::from)?.path();
            if is_temp_file(&path) {
                match fs::remove_file(&path) {
                    Ok(()) => info!(path = %path.display(), "removed stale temp file"),
                    Err(err) => warn!(path = %path.display(), error = %err, "could not remove stale temp file"),
                }
            }
        }
        Ok(Self { dir })
    }

    /// Directory holding the records.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// File the record under `key` lives in.
    #[must_use]
    pub fn path_for(&self, key: &StoreKey) -> PathBuf {
        self.dir.join(key.file_name())
    }

    /// Writes `record`, replacing any record with the same key.
    pub fn save(&self, record: &ExperimentRecord) -> SimoptResult<PathBuf> {
        let path = self.path_for(&record.key);
        let bytes = codec::encode(record.schema_version, record)
            .map_err(|e| StorageError::Serialization(e.to_string()))?;

        let mut file = AtomicFile::create(&path).map_err(StorageError::from)?;
        file.writer()
            .map_err(StorageError::from)?
            .write_all(&bytes)
            .map_err(StorageError::from)?;
        let path = file.commit().map_err(StorageError::from)?;

        info!(
            solver = %record.key.solver_name,
            problem = %record.key.problem_name,
            state = %record.state,
            path = %path.display(),
            "experiment saved"
        );
        Ok(path)
    }

    /// Reads the record stored under `key`.
    pub fn load(&self, key: &StoreKey) -> SimoptResult<ExperimentRecord> {
        let path = self.path_for(key);
        let record = Self::read(&path)?;
        if &record.key != key {
            return Err(StorageError::Corrupt {
                path,
                reason: "record key does not match its file name".to_string(),
            }
            .into());
        }
        debug!(path = %path.display(), "experiment loaded");
        Ok(record)
    }

    fn read(path: &Path) -> SimoptResult<ExperimentRecord> {
        let file = match File::open(path) {
            Ok(file) => file,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Err(StorageError::RecordNotFound {
                    path: path.to_path_buf(),
                }
                .into());
            }
            Err(err) => return Err(StorageError::Io(err).into()),
        };
        let corrupt = |reason: String| StorageError::Corrupt {
            path: path.to_path_buf(),
            reason,
        };

        let mut reader = BufReader::new(file);
        let header = codec::read_header(&mut reader).map_err(|e| corrupt(e.to_string()))?;
        if header.schema_version != RECORD_SCHEMA_VERSION {
            return Err(StorageError::UnsupportedSchema {
                found: header.schema_version,
                expected: RECORD_SCHEMA_VERSION,
            }
            .into());
        }
        let record: ExperimentRecord =
            codec::read_payload(&mut reader, &header).map_err(|e| corrupt(e.to_string()))?;
        if record.schema_version != header.schema_version {
            return Err(corrupt(format!(
                "header schema {} disagrees with record schema {}",
                header.schema_version, record.schema_version
            ))
            .into());
        }
        Ok(record)
    }

    /// Whether a record exists under `key`.
    #[must_use]
    pub fn contains(&self, key: &StoreKey) -> bool {
        self.path_for(key).is_file()
    }

    /// Deletes the record under `key`. Returns false if there was none.
    pub fn remove(&self, key: &StoreKey) -> SimoptResult<bool> {
        match fs::remove_file(self.path_for(key)) {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
            Err(err) => Err(StorageError::Io(err).into()),
        }
    }

    /// Keys of every readable record, sorted. Unreadable files are skipped.
    pub fn keys(&self) -> SimoptResult<Vec<StoreKey>> {
        let mut keys = Vec::new();
        for entry in fs::read_dir(&self.dir).map_err(StorageError::from)? {
            let path = entry.map_err(StorageError::from)?.path();
            if is_temp_file(&path) || path.extension() != Some(OsStr::new(RECORD_EXTENSION)) {
                continue;
            }
            match Self::read(&path) {
                Ok(record) => keys.push(record.key),
                Err(err) => warn!(path = %path.display(), error = %err, "skipping unreadable record"),
            }
        }
        keys.sort();
        Ok(keys)
    }
}
