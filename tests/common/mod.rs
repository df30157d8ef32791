#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::Duration;

use dht_vigil::{
    now_millis, ClientError, CreatedRecord, DhtClient, OwnerSecret, PayloadDigest, Record,
    RecordHandle, RecordKey, RecordSchema, SchedulerSettings,
};

/// One scripted answer for the next probe of a record.
///
/// Scripts are consumed front to back; a record whose script has run dry
/// serves the payload it was seeded with.
#[derive(Clone, Copy, Debug)]
pub enum ProbeScript {
    /// Serve the payload stored at creation.
    Present,
    /// Serve bytes that do not match the record's digest.
    Corrupted,
    /// The subkey slot reads back empty.
    Absent,
    /// Opening the record reports it gone from the network.
    GoneAtOpen,
    /// Reading the value fails with a transport error.
    Unreachable,
    /// Reading the value times out.
    TimedOut,
    /// Reading the value never completes.
    Hang,
}

#[derive(Default)]
struct ScriptedState {
    payloads: HashMap<RecordKey, Vec<u8>>,
    scripts: HashMap<RecordKey, VecDeque<ProbeScript>>,
    created: u64,
    opens: Vec<RecordKey>,
    gets: Vec<RecordKey>,
    closes: Vec<RecordKey>,
    next_handle: u64,
}

/// In-memory stand-in for a DHT daemon with scriptable probe outcomes.
#[derive(Clone, Default)]
pub struct ScriptedDht {
    state: Arc<Mutex<ScriptedState>>,
}

impl ScriptedDht {
    pub fn new() -> Self {
        Self::default()
    }

    /// Plant a record directly in the network and return its registry entry.
    pub async fn seed_record(&self, name: &str, payload: &[u8]) -> Record {
        let key = RecordKey::new(name);
        let mut state = self.state.lock().await;
        state.payloads.insert(key.clone(), payload.to_vec());
        Record {
            key,
            owner_secret: OwnerSecret::new(format!("secret-{name}")),
            created_at: now_millis(),
            subkey_count: 1,
            payload_digest: PayloadDigest::of(payload),
            payload_len: payload.len() as u64,
        }
    }

    /// Queue scripted outcomes for the next probes of `key`.
    pub async fn script(&self, key: &RecordKey, steps: impl IntoIterator<Item = ProbeScript>) {
        let mut state = self.state.lock().await;
        state.scripts.entry(key.clone()).or_default().extend(steps);
    }

    /// Every get_value call so far, in arrival order.
    pub async fn get_calls(&self) -> Vec<RecordKey> {
        let state = self.state.lock().await;
        state.gets.clone()
    }

    /// Records created through the client interface.
    pub async fn created_count(&self) -> u64 {
        let state = self.state.lock().await;
        state.created
    }

    /// Handles opened but never closed.
    pub async fn unreleased_handles(&self) -> usize {
        let state = self.state.lock().await;
        state.opens.len().saturating_sub(state.closes.len())
    }
}

#[async_trait]
impl DhtClient for ScriptedDht {
    async fn create_record(
        &self,
        _schema: RecordSchema,
        payload: &[u8],
    ) -> Result<CreatedRecord, ClientError> {
        let mut state = self.state.lock().await;
        state.created += 1;
        let name = format!("rec-{:03}", state.created);
        let key = RecordKey::new(&name);
        state.payloads.insert(key.clone(), payload.to_vec());
        Ok(CreatedRecord {
            key,
            owner_secret: OwnerSecret::new(format!("secret-{name}")),
        })
    }

    async fn open_record(
        &self,
        key: &RecordKey,
        _secret: &OwnerSecret,
    ) -> Result<RecordHandle, ClientError> {
        let mut state = self.state.lock().await;
        if !state.payloads.contains_key(key) {
            return Err(ClientError::NotFound);
        }
        let gone = matches!(
            state.scripts.get(key).and_then(|s| s.front().copied()),
            Some(ProbeScript::GoneAtOpen)
        );
        if gone {
            if let Some(script) = state.scripts.get_mut(key) {
                script.pop_front();
            }
            return Err(ClientError::NotFound);
        }
        state.next_handle += 1;
        state.opens.push(key.clone());
        Ok(RecordHandle::new(state.next_handle, key.clone()))
    }

    async fn get_value(
        &self,
        handle: &RecordHandle,
        _subkey: u16,
    ) -> Result<Option<Vec<u8>>, ClientError> {
        let mut state = self.state.lock().await;
        let key = handle.key().clone();
        state.gets.push(key.clone());
        let step = state.scripts.get_mut(&key).and_then(|s| s.pop_front());
        match step {
            None | Some(ProbeScript::Present) => Ok(state.payloads.get(&key).cloned()),
            Some(ProbeScript::Corrupted) => Ok(Some(b"corrupted-bytes".to_vec())),
            Some(ProbeScript::Absent) => Ok(None),
            Some(ProbeScript::GoneAtOpen) => Err(ClientError::NotFound),
            Some(ProbeScript::Unreachable) => Err(ClientError::Transport(
                "injected transport failure".to_string(),
            )),
            Some(ProbeScript::TimedOut) => Err(ClientError::Timeout(Duration::from_millis(10))),
            Some(ProbeScript::Hang) => {
                // The guard must not be held across the permanent await.
                drop(state);
                std::future::pending().await
            }
        }
    }

    async fn close_record(&self, handle: RecordHandle) -> Result<(), ClientError> {
        let mut state = self.state.lock().await;
        state.closes.push(handle.key().clone());
        Ok(())
    }
}

/// A registry entry for a record the scripted network has never heard of.
pub fn unseeded_record(name: &str) -> Record {
    let payload = b"never published";
    Record {
        key: RecordKey::new(name),
        owner_secret: OwnerSecret::new(format!("secret-{name}")),
        created_at: now_millis(),
        subkey_count: 1,
        payload_digest: PayloadDigest::of(payload),
        payload_len: payload.len() as u64,
    }
}

/// Scheduler settings tightened for tests running under a paused clock.
pub fn test_settings() -> SchedulerSettings {
    SchedulerSettings {
        probe_interval: Duration::from_millis(50),
        max_concurrent_probes: 4,
        max_retries_per_probe: 3,
        retry_backoff_base: Duration::from_millis(10),
        study_duration: Duration::from_secs(3600),
        shutdown_grace: Duration::from_millis(100),
    }
}
