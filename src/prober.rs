//! Availability probing.
//!
//! A probe answers one question: does the network still serve this record as
//! it was written? The prober opens the record, fetches the primary subkey,
//! verifies the payload digest, and classifies the result. Probing never
//! fails; anything that prevents a verdict becomes an `ERROR` observation for
//! the scheduler to weigh.

use std::sync::Arc;

use tokio::time::Instant;
use tracing::debug;

use crate::client::{DhtClient, RecordHandle, PRIMARY_SUBKEY};
use crate::observation::Observation;
use crate::registry::Record;

/// Probes records through a [`DhtClient`].
pub struct Prober<C> {
    client: Arc<C>,
}

impl<C> Clone for Prober<C> {
    fn clone(&self) -> Self {
        Self {
            client: Arc::clone(&self.client),
        }
    }
}

impl<C: DhtClient> Prober<C> {
    /// Prober issuing requests through `client`.
    pub fn new(client: Arc<C>) -> Self {
        Self { client }
    }

    /// Probe one record and classify the result.
    ///
    /// - The value is served and matches the recorded digest: `PRESENT`.
    /// - The network answers that the record or value is gone, or the bytes
    ///   no longer match the digest: `ABSENT`.
    /// - No answer (transport, timeout, protocol): `ERROR` with detail.
    ///
    /// `PRESENT` and `ABSENT` both carry the round-trip time that produced
    /// the answer; only `ERROR` goes without one.
    pub async fn probe(&self, record: &Record) -> Observation {
        let started = Instant::now();
        let handle = match self
            .client
            .open_record(&record.key, &record.owner_secret)
            .await
        {
            Ok(handle) => handle,
            Err(err) if err.is_absence() => {
                let latency_millis = started.elapsed().as_millis() as u64;
                return Observation::absent(record.key.clone(), latency_millis);
            }
            Err(err) => {
                return Observation::error(record.key.clone(), err.to_string());
            }
        };

        let fetched = self.client.get_value(&handle, PRIMARY_SUBKEY).await;
        let latency_millis = started.elapsed().as_millis() as u64;

        let observation = match fetched {
            Ok(Some(payload)) if record.payload_digest.matches(&payload) => {
                Observation::present(record.key.clone(), latency_millis)
            }
            Ok(Some(_)) => {
                debug!(
                    record = %record.key,
                    "retrieved payload no longer matches the creation digest"
                );
                Observation::absent(record.key.clone(), latency_millis)
            }
            Ok(None) => Observation::absent(record.key.clone(), latency_millis),
            Err(err) if err.is_absence() => {
                Observation::absent(record.key.clone(), latency_millis)
            }
            Err(err) => Observation::error(record.key.clone(), err.to_string()),
        };

        self.release(handle).await;
        observation
    }

    /// Close a handle without letting a close failure disturb the verdict.
    async fn release(&self, handle: RecordHandle) {
        let key = handle.key().clone();
        if let Err(err) = self.client.close_record(handle).await {
            debug!(record = %key, "closing record after probe failed: {err}");
        }
    }
}
