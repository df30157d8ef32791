//! Durable append-only observation log.
//!
//! One JSON observation per line. Appends are synced before they return, so
//! an entry is either fully on disk or not there at all. A crash can still
//! leave a partial final line; [`ObservationLog::open`] repairs that by
//! truncating to the last newline before accepting new appends. Anything
//! malformed before the final line is corruption and refuses to load.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, warn};

use crate::observation::Observation;

/// Errors from the observation log.
#[derive(Debug, Error)]
pub enum RecorderError {
    /// Reading, writing, or syncing the log file failed.
    #[error("observation log i/o failed")]
    Io(#[from] std::io::Error),
    /// An observation could not be encoded for the log.
    #[error("observation could not be encoded")]
    Encode(#[source] serde_json::Error),
    /// A line before the repairable tail failed to parse.
    #[error("malformed observation log entry at line {line}")]
    Malformed {
        line: usize,
        #[source]
        source: serde_json::Error,
    },
}

/// Append-only JSONL observation log with synced writes.
pub struct ObservationLog {
    file: File,
    path: PathBuf,
    appended: u64,
}

impl ObservationLog {
    /// Open (or create) the log at `path`, repairing a torn final line left
    /// behind by a crashed writer.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, RecorderError> {
        let path = path.into();
        let discarded = repair_torn_tail(&path)?;
        if discarded > 0 {
            warn!(
                path = %path.display(),
                bytes = discarded,
                "discarded torn trailing entry from observation log"
            );
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            file,
            path,
            appended: 0,
        })
    }

    /// Path this log writes to.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Observations appended through this handle.
    pub fn appended(&self) -> u64 {
        self.appended
    }

    /// Append one observation and sync it to stable storage.
    pub fn append(&mut self, observation: &Observation) -> Result<(), RecorderError> {
        let mut line = serde_json::to_vec(observation).map_err(RecorderError::Encode)?;
        line.push(b'\n');
        self.file.write_all(&line)?;
        self.file.sync_data()?;
        self.appended += 1;
        debug!(
            record = %observation.record_id,
            outcome = ?observation.outcome,
            "recorded observation"
        );
        Ok(())
    }

    /// Force everything, metadata included, to stable storage.
    pub fn flush(&mut self) -> Result<(), RecorderError> {
        self.file.sync_all()?;
        Ok(())
    }
}

/// Truncate a torn (newline-less) final line, returning how many bytes were
/// discarded. A missing file needs no repair.
fn repair_torn_tail(path: &Path) -> Result<u64, RecorderError> {
    let data = match fs::read(path) {
        Ok(data) => data,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(err) => return Err(err.into()),
    };
    if data.is_empty() || data.ends_with(b"\n") {
        return Ok(0);
    }
    let keep = data
        .iter()
        .rposition(|byte| *byte == b'\n')
        .map(|at| at as u64 + 1)
        .unwrap_or(0);
    let file = OpenOptions::new().write(true).open(path)?;
    file.set_len(keep)?;
    file.sync_all()?;
    Ok(data.len() as u64 - keep)
}

/// Read every observation from a repaired log, in append order.
///
/// A missing file reads as empty: a study that has not started yet. Any line
/// that fails to parse is an error; [`ObservationLog::open`] has already
/// repaired the only damage a crash can cause, so replay gets to trust what
/// remains.
pub fn read_observations(path: impl AsRef<Path>) -> Result<Vec<Observation>, RecorderError> {
    let text = match fs::read_to_string(path.as_ref()) {
        Ok(text) => text,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err.into()),
    };
    let mut observations = Vec::new();
    for (index, line) in text.lines().enumerate() {
        if line.is_empty() {
            continue;
        }
        let observation =
            serde_json::from_str(line).map_err(|source| RecorderError::Malformed {
                line: index + 1,
                source,
            })?;
        observations.push(observation);
    }
    Ok(observations)
}
