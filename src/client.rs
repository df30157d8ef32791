//! DHT client facade.
//!
//! All network interaction goes through the [`DhtClient`] trait: a narrow,
//! transport-agnostic surface over whatever process actually speaks the DHT
//! protocol. Production uses [`crate::daemon::DaemonClient`]; tests script an
//! in-memory stand-in. The trait deliberately knows nothing about routing,
//! replication, or storage.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::registry::{OwnerSecret, RecordKey};

/// Subkey that holds the payload written at creation time.
pub const PRIMARY_SUBKEY: u16 = 0;

/// Shape of a record to create: how many value slots it carries.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RecordSchema {
    /// Number of subkey slots. The payload lands in subkey 0.
    pub subkey_count: u16,
}

impl Default for RecordSchema {
    fn default() -> Self {
        Self { subkey_count: 1 }
    }
}

/// A record freshly created on the network.
#[derive(Clone, Debug)]
pub struct CreatedRecord {
    /// Key under which the network serves the record.
    pub key: RecordKey,
    /// Credential required to reopen the record later.
    pub owner_secret: OwnerSecret,
}

/// An open session on one record.
///
/// Handles are opaque tokens minted by the client implementation and are only
/// valid until [`DhtClient::close_record`] consumes them.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecordHandle {
    raw: u64,
    key: RecordKey,
}

impl RecordHandle {
    /// Build a handle from an implementation-assigned session id.
    pub fn new(raw: u64, key: RecordKey) -> Self {
        Self { raw, key }
    }

    /// Implementation-assigned session id.
    pub fn raw(&self) -> u64 {
        self.raw
    }

    /// Key of the record this handle is open on.
    pub fn key(&self) -> &RecordKey {
        &self.key
    }
}

/// Errors surfaced by [`DhtClient`] implementations.
///
/// [`ClientError::NotFound`] is the authoritative absence signal and maps to
/// an `ABSENT` outcome; every other variant means the probe got no answer and
/// maps to `ERROR`.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The network answered: nobody serves this record.
    #[error("record not found on the network")]
    NotFound,
    /// No answer within the request timeout.
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    /// Connection-level failure talking to the DHT.
    #[error("transport failure: {0}")]
    Transport(String),
    /// The DHT answered with something this client cannot interpret.
    #[error("protocol violation: {0}")]
    Protocol(String),
}

impl ClientError {
    /// Whether this error is an authoritative "the record is gone" answer
    /// rather than a failure to get an answer.
    pub fn is_absence(&self) -> bool {
        matches!(self, ClientError::NotFound)
    }
}

/// Client-side surface of the DHT.
///
/// Implementations must not serve cached values: a successful
/// [`get_value`](Self::get_value) reflects what the network currently holds.
#[async_trait]
pub trait DhtClient: Send + Sync + 'static {
    /// Create a record with `schema.subkey_count` slots, write `payload` to
    /// subkey 0, and wait for the write to settle on the network.
    async fn create_record(
        &self,
        schema: RecordSchema,
        payload: &[u8],
    ) -> Result<CreatedRecord, ClientError>;

    /// Open an existing record for reading. Not-found here means the network
    /// no longer serves the record.
    async fn open_record(
        &self,
        key: &RecordKey,
        secret: &OwnerSecret,
    ) -> Result<RecordHandle, ClientError>;

    /// Fetch the value at `subkey` from the network. `Ok(None)` means the
    /// slot holds no value.
    async fn get_value(
        &self,
        handle: &RecordHandle,
        subkey: u16,
    ) -> Result<Option<Vec<u8>>, ClientError>;

    /// Release an open handle. Best effort.
    async fn close_record(&self, handle: RecordHandle) -> Result<(), ClientError>;
}
