//! Record persistence study binary.
//!
//! This binary runs a complete study against a local DHT daemon: it seeds a
//! population of records, probes them on a fixed cadence, and appends every
//! observation to a durable JSONL log until the population settles, the
//! study deadline passes, or Ctrl-C asks it to stop. Re-running with the
//! same log and manifest resumes the interrupted study instead of starting
//! a new one.
//!
//! # Usage
//!
//! ```bash
//! cargo run --release -- --config study.toml
//! ```
//!
//! Every flag is optional; with none, the defaults probe a daemon on
//! 127.0.0.1:5959 hourly for a week. Log verbosity follows `RUST_LOG`
//! (default `info`).

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use dht_vigil::{
    load_manifest, read_observations, seed_population, DaemonClient, ObservationLog,
    ProbeScheduler, Prober, RecordKey, RecordRegistry, StudyConfig,
};

#[derive(Debug, Parser)]
#[command(name = "dht-vigil", version, about = "Measure how long DHT records stay retrievable")]
struct Cli {
    /// Path to a TOML config file. Flags below override its values.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Address of the DHT daemon's client API.
    #[arg(long)]
    daemon_addr: Option<SocketAddr>,
    /// Where observations are appended.
    #[arg(long)]
    observation_log: Option<PathBuf>,
    /// Where seeded records and their owner secrets are kept.
    #[arg(long)]
    population_manifest: Option<PathBuf>,
    /// Overall study length in seconds.
    #[arg(long)]
    study_duration_secs: Option<u64>,
}

impl Cli {
    fn into_config(self) -> Result<StudyConfig> {
        let mut config = match &self.config {
            Some(path) => StudyConfig::load(path)
                .with_context(|| format!("loading config from {}", path.display()))?,
            None => StudyConfig::default(),
        };
        if let Some(addr) = self.daemon_addr {
            config.daemon_addr = addr;
        }
        if let Some(path) = self.observation_log {
            config.observation_log = path;
        }
        if let Some(path) = self.population_manifest {
            config.population_manifest = path;
        }
        if let Some(secs) = self.study_duration_secs {
            config.study_duration_secs = secs;
        }
        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = Cli::parse().into_config()?;
    info!(
        daemon = %config.daemon_addr,
        population = config.population_size,
        interval_secs = config.probe_interval_secs,
        "dht-vigil starting"
    );

    let client = Arc::new(DaemonClient::new(config.daemon_addr, config.request_timeout()));

    // Opening the log repairs any torn tail left by a crash, so replay below
    // only ever sees complete lines.
    let recorder = ObservationLog::open(&config.observation_log).with_context(|| {
        format!("opening observation log {}", config.observation_log.display())
    })?;
    let history = read_observations(&config.observation_log).with_context(|| {
        format!("replaying observation log {}", config.observation_log.display())
    })?;
    let manifest = load_manifest(&config.population_manifest).with_context(|| {
        format!(
            "reading population manifest {}",
            config.population_manifest.display()
        )
    })?;
    if !history.is_empty() && manifest.is_empty() {
        bail!(
            "observation log {} holds {} observations but manifest {} is empty; \
             refusing to replay observations against an unknown population",
            config.observation_log.display(),
            history.len(),
            config.population_manifest.display()
        );
    }
    if !history.is_empty() {
        info!(
            observations = history.len(),
            records = manifest.len(),
            "resuming study from existing observation log"
        );
    }

    let mut last_recorded: HashMap<RecordKey, u64> = HashMap::new();
    for observation in &history {
        let newest = last_recorded
            .entry(observation.record_id.clone())
            .or_insert(0);
        *newest = (*newest).max(observation.timestamp);
    }

    let mut registry =
        RecordRegistry::rebuild(manifest, &history, config.consecutive_miss_threshold)
            .context("rebuilding registry from manifest and observation log")?;

    seed_population(client.as_ref(), &config, &mut registry)
        .await
        .context("seeding study population")?;
    if registry.active_count() == 0 {
        warn!("every record is already settled; nothing left to probe");
    }

    let (stop, shutdown) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown requested, stopping after the current round");
            let _ = stop.send(true);
        }
    });

    let scheduler = ProbeScheduler::new(
        config.scheduler_settings(),
        registry,
        recorder,
        Prober::new(client),
        shutdown,
        last_recorded,
    );
    let summary = scheduler.run().await?;
    info!(
        reason = %summary.stop_reason,
        rounds = summary.rounds,
        observations = summary.observations,
        present = summary.present,
        absent = summary.absent,
        errors = summary.errors,
        still_active = summary.final_states.active,
        confirmed_absent = summary.final_states.confirmed_absent,
        study_ended = summary.final_states.study_ended,
        "study complete"
    );
    Ok(())
}
