//! Record registry: the population under study and its lifecycle state.
//!
//! The registry owns every [`Record`] the study watches and drives a small
//! per-record state machine:
//!
//! - `Present` outcomes reset the consecutive-miss counter.
//! - `Absent` outcomes advance it; at the configured threshold the record
//!   becomes [`LifecycleState::ConfirmedAbsent`].
//! - `Error` outcomes touch nothing: an unreachable network is evidence of
//!   nothing.
//!
//! Terminal states ([`LifecycleState::ConfirmedAbsent`] and
//! [`LifecycleState::StudyEnded`]) never change. Replaying a recorded outcome
//! stream through [`RecordRegistry::rebuild`] reconstructs the same states,
//! which is how interrupted studies resume.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::observation::{Observation, ProbeOutcome};

// ============================================================================
// Identity Types
// ============================================================================

/// Opaque key identifying a record in the DHT.
///
/// Keys are minted by the network at creation time; this crate never
/// interprets their contents.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordKey(String);

impl RecordKey {
    /// Wrap a key string handed out by the network.
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// The key as text, for wire requests and log output.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RecordKey {
    fn from(key: &str) -> Self {
        Self(key.to_owned())
    }
}

/// Credential required to open a record.
///
/// Excluded from `Debug` output and from every tracing event; the only place
/// a secret is persisted is the population manifest.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OwnerSecret(String);

impl OwnerSecret {
    /// Wrap a credential handed out by the network.
    pub fn new(secret: impl Into<String>) -> Self {
        Self(secret.into())
    }

    /// The raw credential, for wire requests only.
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for OwnerSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("OwnerSecret(..)")
    }
}

/// BLAKE3 digest of the payload a record was created with.
///
/// Serialized as lowercase hex. The prober compares retrieved bytes against
/// this digest; a record whose content changed out from under the study no
/// longer counts as present.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct PayloadDigest([u8; 32]);

impl PayloadDigest {
    /// Digest of `payload`.
    pub fn of(payload: &[u8]) -> Self {
        Self(*blake3::hash(payload).as_bytes())
    }

    /// Whether `payload` hashes to this digest.
    pub fn matches(&self, payload: &[u8]) -> bool {
        Self::of(payload) == *self
    }
}

impl fmt::Debug for PayloadDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PayloadDigest({})", hex::encode(self.0))
    }
}

impl fmt::Display for PayloadDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl Serialize for PayloadDigest {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(self.0))
    }
}

impl<'de> Deserialize<'de> for PayloadDigest {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        let bytes = hex::decode(&text).map_err(serde::de::Error::custom)?;
        let digest: [u8; 32] = bytes
            .try_into()
            .map_err(|_| serde::de::Error::custom("digest must be 32 bytes"))?;
        Ok(Self(digest))
    }
}

// ============================================================================
// Records
// ============================================================================

/// One record under study, as persisted in the population manifest.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    /// Key the network serves the record under.
    pub key: RecordKey,
    /// Credential needed to reopen the record each round.
    pub owner_secret: OwnerSecret,
    /// Creation time in unix milliseconds.
    pub created_at: u64,
    /// Number of subkey slots the record was created with.
    pub subkey_count: u16,
    /// Digest of the payload written to the primary subkey.
    pub payload_digest: PayloadDigest,
    /// Byte length of that payload.
    pub payload_len: u64,
}

/// Where a record is in its study lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum LifecycleState {
    /// Still being probed.
    Active,
    /// Missed enough consecutive probes to be considered gone.
    ConfirmedAbsent,
    /// The study stopped while the record was still active.
    StudyEnded,
}

impl LifecycleState {
    /// Terminal states never change again.
    pub fn is_terminal(self) -> bool {
        !matches!(self, LifecycleState::Active)
    }
}

/// Per-state population counts, for summaries.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StateCounts {
    /// Records still being probed.
    pub active: usize,
    /// Records declared gone.
    pub confirmed_absent: usize,
    /// Records the study gave up on at deadline or shutdown.
    pub study_ended: usize,
}

/// Errors from registry operations. These indicate caller bugs or mismatched
/// persisted state, not network conditions.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// A record with this key is already registered.
    #[error("record {0} is already registered")]
    DuplicateRecord(RecordKey),
    /// No record with this key is registered.
    #[error("record {0} is not registered")]
    UnknownRecord(RecordKey),
}

// ============================================================================
// Registry
// ============================================================================

/// Tracked state for one registered record.
#[derive(Clone, Debug)]
struct RecordEntry {
    record: Record,
    state: LifecycleState,
    consecutive_misses: u32,
}

/// The population of records under study.
#[derive(Debug)]
pub struct RecordRegistry {
    entries: HashMap<RecordKey, RecordEntry>,
    miss_threshold: u32,
}

impl RecordRegistry {
    /// Empty registry that declares records gone after `miss_threshold`
    /// consecutive misses.
    pub fn new(miss_threshold: u32) -> Self {
        Self {
            entries: HashMap::new(),
            miss_threshold,
        }
    }

    /// Add a record to the study in [`LifecycleState::Active`] state.
    ///
    /// Keys are unique within a population; registering a key twice is an
    /// error.
    pub fn register(&mut self, record: Record) -> Result<(), RegistryError> {
        if self.entries.contains_key(&record.key) {
            return Err(RegistryError::DuplicateRecord(record.key));
        }
        let key = record.key.clone();
        debug!(record = %key, "registered record");
        self.entries.insert(
            key,
            RecordEntry {
                record,
                state: LifecycleState::Active,
                consecutive_misses: 0,
            },
        );
        Ok(())
    }

    /// Records currently being probed.
    ///
    /// An empty result is meaningful: the study has nothing left to do.
    pub fn active_records(&self) -> impl Iterator<Item = &Record> + '_ {
        self.entries
            .values()
            .filter(|entry| entry.state == LifecycleState::Active)
            .map(|entry| &entry.record)
    }

    /// Number of records still active.
    pub fn active_count(&self) -> usize {
        self.active_records().count()
    }

    /// Total number of registered records.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the registry holds no records at all.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Current lifecycle state of a record.
    pub fn state_of(&self, key: &RecordKey) -> Option<LifecycleState> {
        self.entries.get(key).map(|entry| entry.state)
    }

    /// Consecutive misses currently counted against a record.
    pub fn misses_of(&self, key: &RecordKey) -> Option<u32> {
        self.entries.get(key).map(|entry| entry.consecutive_misses)
    }

    /// Apply a probe outcome to a record's lifecycle state.
    ///
    /// `Present` resets the miss counter, `Absent` advances it (declaring the
    /// record [`LifecycleState::ConfirmedAbsent`] at the threshold), and
    /// `Error` changes nothing. Outcomes applied to a record already in a
    /// terminal state are ignored, which keeps log replay idempotent.
    pub fn apply_outcome(
        &mut self,
        key: &RecordKey,
        outcome: ProbeOutcome,
    ) -> Result<LifecycleState, RegistryError> {
        let threshold = self.miss_threshold;
        let entry = self
            .entries
            .get_mut(key)
            .ok_or_else(|| RegistryError::UnknownRecord(key.clone()))?;
        if entry.state.is_terminal() {
            debug!(record = %key, state = ?entry.state, "outcome for settled record ignored");
            return Ok(entry.state);
        }
        match outcome {
            ProbeOutcome::Present => {
                entry.consecutive_misses = 0;
            }
            ProbeOutcome::Absent => {
                entry.consecutive_misses += 1;
                if entry.consecutive_misses >= threshold {
                    entry.state = LifecycleState::ConfirmedAbsent;
                    info!(
                        record = %key,
                        misses = entry.consecutive_misses,
                        "record confirmed absent"
                    );
                }
            }
            ProbeOutcome::Error => {}
        }
        Ok(entry.state)
    }

    /// Force an active record into [`LifecycleState::StudyEnded`].
    ///
    /// Used when the study stops before the record reaches a verdict.
    /// Records already settled are left untouched.
    pub fn mark_study_ended(&mut self, key: &RecordKey) -> Result<(), RegistryError> {
        let entry = self
            .entries
            .get_mut(key)
            .ok_or_else(|| RegistryError::UnknownRecord(key.clone()))?;
        if entry.state.is_terminal() {
            return Ok(());
        }
        entry.state = LifecycleState::StudyEnded;
        info!(record = %key, "study ended with record still active");
        Ok(())
    }

    /// Population counts by lifecycle state.
    pub fn state_counts(&self) -> StateCounts {
        let mut counts = StateCounts::default();
        for entry in self.entries.values() {
            match entry.state {
                LifecycleState::Active => counts.active += 1,
                LifecycleState::ConfirmedAbsent => counts.confirmed_absent += 1,
                LifecycleState::StudyEnded => counts.study_ended += 1,
            }
        }
        counts
    }

    /// Rebuild a registry by replaying a recorded outcome stream.
    ///
    /// Registers every record, then applies the observations in log order.
    /// The result matches the registry at the moment the log was written,
    /// except that `StudyEnded` is not recorded in the log and is not
    /// reconstructed. An observation for an unregistered key means the log
    /// and manifest do not belong together.
    pub fn rebuild(
        records: impl IntoIterator<Item = Record>,
        observations: &[Observation],
        miss_threshold: u32,
    ) -> Result<Self, RegistryError> {
        let mut registry = Self::new(miss_threshold);
        for record in records {
            registry.register(record)?;
        }
        for observation in observations {
            registry.apply_outcome(&observation.record_id, observation.outcome)?;
        }
        Ok(registry)
    }
}
