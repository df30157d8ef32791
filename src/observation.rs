//! Probe observations and their wire encoding.
//!
//! Every probe of a record produces exactly one [`Observation`]. Observations
//! are the study's output: the recorder appends them to the observation log as
//! line-delimited JSON, and later runs replay them to rebuild registry state.
//! The serialized field names are stable; external tooling keys on them.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::registry::RecordKey;

/// The verdict of a single availability probe.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProbeOutcome {
    /// The network served the record's value and it matched what was written.
    Present,
    /// The network answered authoritatively that the record or value is gone.
    Absent,
    /// The probe could not get an answer (transport failure, timeout, bad
    /// response). Says nothing about the record itself.
    Error,
}

/// A single dated probe result for one record.
///
/// Field names are part of the on-disk log format and must not change:
/// `recordId`, `timestamp`, `outcome`, `latencyMillis`, `errorDetail`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Observation {
    /// Key of the probed record.
    pub record_id: RecordKey,
    /// When the verdict was reached, in unix milliseconds.
    pub timestamp: u64,
    /// What the probe concluded.
    pub outcome: ProbeOutcome,
    /// Probe round-trip time, omitted only when the probe itself failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latency_millis: Option<u64>,
    /// Human-readable cause, present only for [`ProbeOutcome::Error`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_detail: Option<String>,
}

impl Observation {
    /// Observation for a record the network still serves.
    pub fn present(record_id: RecordKey, latency_millis: u64) -> Self {
        Self {
            record_id,
            timestamp: now_millis(),
            outcome: ProbeOutcome::Present,
            latency_millis: Some(latency_millis),
            error_detail: None,
        }
    }

    /// Observation for a record the network no longer serves. The negative
    /// answer still took a round trip to obtain, so it carries a latency.
    pub fn absent(record_id: RecordKey, latency_millis: u64) -> Self {
        Self {
            record_id,
            timestamp: now_millis(),
            outcome: ProbeOutcome::Absent,
            latency_millis: Some(latency_millis),
            error_detail: None,
        }
    }

    /// Observation for a probe that could not reach a verdict.
    pub fn error(record_id: RecordKey, detail: impl Into<String>) -> Self {
        Self {
            record_id,
            timestamp: now_millis(),
            outcome: ProbeOutcome::Error,
            latency_millis: None,
            error_detail: Some(detail.into()),
        }
    }
}

/// Current wall-clock time in unix milliseconds.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
