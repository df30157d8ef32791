//! Daemon wire protocol message definitions.
//!
//! This module defines the request and response types exchanged with a local
//! DHT daemon, one JSON object per frame. Binary payloads travel hex-encoded
//! so the frames stay printable and inspectable.

use serde::{Deserialize, Serialize};

use crate::framing::MAX_FRAME_BYTES;
use crate::registry::{OwnerSecret, RecordKey};

/// Largest record payload the wire format can carry. Payload bytes double
/// when hex encoded, so a frame holds at most half its budget in raw
/// payload, less room for the surrounding envelope fields.
pub const MAX_PAYLOAD_BYTES: usize = MAX_FRAME_BYTES / 2 - 512;

/// A request sent to the daemon. Exactly one response comes back per request.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum DaemonRequest {
    /// Publish a new record and return its key and owner secret.
    CreateRecord {
        /// How many subkey slots the record carries.
        subkey_count: u16,
        /// Initial value for subkey zero.
        #[serde(with = "hex_bytes")]
        payload: Vec<u8>,
    },
    /// Open an existing record for reading.
    OpenRecord {
        /// The record to open.
        key: RecordKey,
        /// Proof of ownership issued at creation.
        secret: OwnerSecret,
    },
    /// Read one subkey slot of an open record.
    GetValue {
        /// Handle returned by a prior open.
        handle: u64,
        /// Which slot to read.
        subkey: u16,
    },
    /// Release an open handle.
    CloseRecord {
        /// Handle returned by a prior open.
        handle: u64,
    },
}

/// A response from the daemon.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum DaemonResponse {
    /// A record was published.
    RecordCreated {
        /// The new record's key.
        key: RecordKey,
        /// Secret required to open the record later.
        secret: OwnerSecret,
    },
    /// A record was opened.
    RecordOpened {
        /// Handle for subsequent reads.
        handle: u64,
    },
    /// A subkey slot was read. `data` is absent when the slot is empty.
    Value {
        #[serde(default, with = "opt_hex_bytes")]
        data: Option<Vec<u8>>,
    },
    /// The request completed with nothing to return.
    Done,
    /// The record is not on the network.
    NotFound,
    /// The daemon could not serve the request.
    Error {
        /// Human-readable failure description.
        message: String,
    },
}

/// Hex encoding for required byte fields.
mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        hex::decode(&text).map_err(serde::de::Error::custom)
    }
}

/// Hex encoding for optional byte fields.
mod opt_hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        bytes: &Option<Vec<u8>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match bytes {
            Some(bytes) => serializer.serialize_some(&hex::encode(bytes)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Vec<u8>>, D::Error> {
        let text: Option<String> = Option::deserialize(deserializer)?;
        match text {
            Some(text) => hex::decode(&text)
                .map(Some)
                .map_err(serde::de::Error::custom),
            None => Ok(None),
        }
    }
}
