//! # DHT Vigil
//!
//! This crate measures how long records published to a distributed hash
//! table actually stay retrievable. It seeds a population of records through
//! a local DHT daemon, then probes each one on a fixed cadence, writing
//! every observation to an append-only log until the records disappear, the
//! study deadline passes, or an operator stops the run.
//!
//! The crate is split into a handful of modules that can be reused
//! independently:
//!
//! - [`registry`]: the record population and its lifecycle state machine,
//!   from `Active` through `ConfirmedAbsent` or `StudyEnded`.
//! - [`prober`]: one availability check, classifying each attempt as
//!   present, absent, or errored.
//! - [`scheduler`]: the round loop that drives probes with bounded
//!   concurrency, in-round retries, and clean shutdown.
//! - [`recorder`]: the durable JSONL observation log, including torn-tail
//!   repair and replay.
//! - [`client`]: the [`DhtClient`] trait the prober and seeder speak.
//! - [`protocol`], [`framing`], [`daemon`]: the JSON-over-TCP client for a
//!   local DHT daemon implementing that trait.
//! - [`population`]: record seeding and the owner manifest.
//! - [`config`]: the TOML-backed [`StudyConfig`].
//!
//! ## Getting started
//!
//! Construct a [`DaemonClient`] against a running daemon, seed the
//! population, and hand everything to a [`ProbeScheduler`]:
//!
//! ```no_run
//! use std::collections::HashMap;
//! use std::sync::Arc;
//!
//! use anyhow::Result;
//! use dht_vigil::{
//!     seed_population, DaemonClient, ObservationLog, ProbeScheduler, Prober, RecordRegistry,
//!     StudyConfig,
//! };
//! use tokio::sync::watch;
//!
//! # async fn run() -> Result<()> {
//! let config = StudyConfig::default();
//! let client = Arc::new(DaemonClient::new(config.daemon_addr, config.request_timeout()));
//!
//! let mut registry = RecordRegistry::new(config.consecutive_miss_threshold);
//! seed_population(client.as_ref(), &config, &mut registry).await?;
//!
//! let recorder = ObservationLog::open(&config.observation_log)?;
//! let (_stop, shutdown) = watch::channel(false);
//! let scheduler = ProbeScheduler::new(
//!     config.scheduler_settings(),
//!     registry,
//!     recorder,
//!     Prober::new(client),
//!     shutdown,
//!     HashMap::new(),
//! );
//! let summary = scheduler.run().await?;
//! println!("study stopped: {}", summary.stop_reason);
//! # Ok(())
//! # }
//! ```
//!
//! The binary in `src/main.rs` wires these pieces together behind a CLI,
//! including resuming an interrupted study from its observation log.

pub mod client;
pub mod config;
pub mod daemon;
pub mod framing;
pub mod observation;
pub mod population;
pub mod prober;
pub mod protocol;
pub mod recorder;
pub mod registry;
pub mod scheduler;

pub use client::{ClientError, CreatedRecord, DhtClient, RecordHandle, RecordSchema, PRIMARY_SUBKEY};
pub use config::{ConfigError, StudyConfig};
pub use daemon::DaemonClient;
pub use observation::{now_millis, Observation, ProbeOutcome};
pub use population::{load_manifest, seed_population, PopulationError};
pub use prober::Prober;
pub use protocol::{DaemonRequest, DaemonResponse, MAX_PAYLOAD_BYTES};
pub use recorder::{read_observations, ObservationLog, RecorderError};
pub use registry::{
    LifecycleState, OwnerSecret, PayloadDigest, Record, RecordKey, RecordRegistry, RegistryError,
    StateCounts,
};
pub use scheduler::{
    ProbeScheduler, SchedulerError, SchedulerSettings, StopReason, StudySummary,
};
