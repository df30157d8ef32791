//! Study population seeding and the owner manifest.
//!
//! Probing a record later requires its owner secret, which the network hands
//! out exactly once at creation. Every record this module publishes is
//! therefore written to a manifest file before it is registered, one JSON
//! object per line, so a restarted study can keep probing records it created
//! in an earlier run.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::Path;

use rand::{Rng, RngCore};
use thiserror::Error;
use tracing::{debug, info};

use crate::client::{ClientError, DhtClient, RecordSchema};
use crate::config::StudyConfig;
use crate::observation::now_millis;
use crate::registry::{PayloadDigest, Record, RecordRegistry, RegistryError};

#[derive(Debug, Error)]
pub enum PopulationError {
    #[error("manifest io failed")]
    Io(#[from] io::Error),
    #[error("manifest line {line} is not a valid record")]
    Malformed {
        line: usize,
        #[source]
        source: serde_json::Error,
    },
    #[error("record could not be encoded for the manifest")]
    Encode(#[source] serde_json::Error),
    #[error(transparent)]
    Client(#[from] ClientError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// Read every record from a manifest. A missing file is an empty manifest.
pub fn load_manifest(path: &Path) -> Result<Vec<Record>, PopulationError> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let mut records = Vec::new();
    for (index, line) in contents.lines().enumerate() {
        if line.is_empty() {
            continue;
        }
        let record = serde_json::from_str(line).map_err(|source| PopulationError::Malformed {
            line: index + 1,
            source,
        })?;
        records.push(record);
    }
    Ok(records)
}

/// Append one record to the manifest and force it to disk.
fn append_manifest(path: &Path, record: &Record) -> Result<(), PopulationError> {
    let mut line = serde_json::to_vec(record).map_err(PopulationError::Encode)?;
    line.push(b'\n');
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    file.write_all(&line)?;
    file.sync_data()?;
    Ok(())
}

/// Publish records until the registry holds `population_size` of them.
///
/// Each new record gets a random payload within the configured size bounds.
/// The record goes to the manifest before the registry, so a crash between
/// the two leaves a record we can still open next run, never an orphan the
/// manifest has no secret for. Returns how many records were created; zero
/// when the registry is already full, which makes reseeding on resume a
/// no-op.
pub async fn seed_population<C: DhtClient>(
    client: &C,
    config: &StudyConfig,
    registry: &mut RecordRegistry,
) -> Result<usize, PopulationError> {
    let schema = RecordSchema {
        subkey_count: config.subkey_count,
    };
    let mut created = 0;
    while registry.len() < config.population_size {
        let payload = random_payload(config.payload_min_bytes, config.payload_max_bytes);
        let published = client.create_record(schema, &payload).await?;
        let record = Record {
            key: published.key,
            owner_secret: published.owner_secret,
            created_at: now_millis(),
            subkey_count: config.subkey_count,
            payload_digest: PayloadDigest::of(&payload),
            payload_len: payload.len() as u64,
        };
        append_manifest(&config.population_manifest, &record)?;
        let key = record.key.clone();
        registry.register(record)?;
        debug!(record = %key, bytes = payload.len(), "seeded record");
        created += 1;
    }
    if created > 0 {
        info!(created, total = registry.len(), "population seeded");
    }
    Ok(created)
}

/// A payload of random bytes, `min..=max` long.
fn random_payload(min: usize, max: usize) -> Vec<u8> {
    let mut rng = rand::thread_rng();
    let len = rng.gen_range(min..=max);
    let mut payload = vec![0u8; len];
    rng.fill_bytes(&mut payload);
    payload
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{OwnerSecret, RecordKey};

    fn make_record(name: &str) -> Record {
        let payload = name.as_bytes();
        Record {
            key: RecordKey::new(name),
            owner_secret: OwnerSecret::new(format!("secret-{name}")),
            created_at: 1_700_000_000_000,
            subkey_count: 1,
            payload_digest: PayloadDigest::of(payload),
            payload_len: payload.len() as u64,
        }
    }

    #[test]
    fn manifest_round_trips_records() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("manifest.jsonl");

        append_manifest(&path, &make_record("rec-a")).expect("append");
        append_manifest(&path, &make_record("rec-b")).expect("append");

        let records = load_manifest(&path).expect("load");
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].key, RecordKey::new("rec-a"));
        assert_eq!(records[1].key, RecordKey::new("rec-b"));
        assert_eq!(records[0].owner_secret.expose(), "secret-rec-a");
        assert_eq!(records[0].payload_digest, make_record("rec-a").payload_digest);
    }

    #[test]
    fn missing_manifest_reads_empty() {
        let dir = tempfile::tempdir().expect("tempdir");
        let records = load_manifest(&dir.path().join("absent.jsonl")).expect("load");
        assert!(records.is_empty());
    }

    #[test]
    fn malformed_manifest_line_is_an_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("manifest.jsonl");
        append_manifest(&path, &make_record("rec-a")).expect("append");
        std::fs::write(
            &path,
            [std::fs::read(&path).expect("read"), b"not json\n".to_vec()].concat(),
        )
        .expect("write");

        let err = load_manifest(&path).expect_err("malformed line must fail");
        assert!(
            matches!(err, PopulationError::Malformed { line: 2, .. }),
            "unexpected error: {err:?}"
        );
    }

    #[test]
    fn payloads_respect_configured_bounds() {
        for _ in 0..64 {
            let payload = random_payload(3, 9);
            assert!(
                (3..=9).contains(&payload.len()),
                "payload of {} bytes out of bounds",
                payload.len()
            );
        }
    }
}
