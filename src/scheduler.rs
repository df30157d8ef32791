//! Probe scheduling: rounds, concurrency, retries, and termination.
//!
//! The scheduler is the study's single thread of control. It owns the
//! registry and the observation log, drives probe rounds on a fixed cadence,
//! and is the only component that writes to either. Probes run with bounded
//! parallelism inside a round; transient failures retry with exponential
//! backoff before an `ERROR` is allowed to stand.

use std::collections::HashMap;
use std::fmt;

use futures::stream::{self, StreamExt};
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::{interval, sleep, sleep_until, Duration, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::client::DhtClient;
use crate::observation::{Observation, ProbeOutcome};
use crate::prober::Prober;
use crate::recorder::{ObservationLog, RecorderError};
use crate::registry::{Record, RecordKey, RecordRegistry, RegistryError, StateCounts};

/// Ceiling on any single retry backoff delay.
const MAX_RETRY_BACKOFF: Duration = Duration::from_secs(30);

// ─────────────────────────────────────────────────────────────────────────────
// Settings and results
// ─────────────────────────────────────────────────────────────────────────────

/// Timing and concurrency knobs for a study run.
#[derive(Clone, Copy, Debug)]
pub struct SchedulerSettings {
    /// Wall-clock spacing between round starts.
    pub probe_interval: Duration,
    /// Probes in flight at once within a round.
    pub max_concurrent_probes: usize,
    /// Extra attempts after the first when a probe errors.
    pub max_retries_per_probe: u32,
    /// First retry delay; doubles per attempt up to a fixed ceiling.
    pub retry_backoff_base: Duration,
    /// Overall deadline, measured from the start of the run.
    pub study_duration: Duration,
    /// How long an in-flight round may keep running after the deadline or a
    /// shutdown request.
    pub shutdown_grace: Duration,
}

/// Why a run stopped.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StopReason {
    /// Every record reached a terminal state.
    PopulationSettled,
    /// The configured study duration elapsed.
    DeadlineReached,
    /// An operator asked the run to stop.
    ShutdownRequested,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            StopReason::PopulationSettled => "population settled",
            StopReason::DeadlineReached => "deadline reached",
            StopReason::ShutdownRequested => "shutdown requested",
        };
        f.write_str(text)
    }
}

/// What a completed run did.
#[derive(Clone, Copy, Debug)]
pub struct StudySummary {
    /// Why the run stopped.
    pub stop_reason: StopReason,
    /// Rounds that ran to completion.
    pub rounds: u64,
    /// Observations appended to the log.
    pub observations: u64,
    /// Present observations among them.
    pub present: u64,
    /// Absent observations among them.
    pub absent: u64,
    /// Error observations among them.
    pub errors: u64,
    /// Final population counts by lifecycle state.
    pub final_states: StateCounts,
}

/// Errors that stop a run. A recorder failure means observations can no
/// longer be made durable; a registry rejection means the scheduler fed it a
/// record it does not know.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error(transparent)]
    Recorder(#[from] RecorderError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

// ─────────────────────────────────────────────────────────────────────────────
// Retry policy
// ─────────────────────────────────────────────────────────────────────────────

/// In-round retry budget for probes that error.
#[derive(Clone, Copy, Debug)]
struct RetryPolicy {
    max_retries: u32,
    backoff_base: Duration,
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (zero-based): the base doubled
    /// per attempt, capped at [`MAX_RETRY_BACKOFF`].
    fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.backoff_base
            .saturating_mul(factor)
            .min(MAX_RETRY_BACKOFF)
    }
}

/// Probe one record, retrying transient errors within the round.
///
/// `Present` and `Absent` are authoritative answers and return immediately.
/// Only the final attempt's observation survives; intermediate errors are
/// never recorded.
async fn probe_with_retry<C: DhtClient>(
    prober: Prober<C>,
    record: Record,
    policy: RetryPolicy,
) -> Observation {
    let mut attempt = 0;
    loop {
        let observation = prober.probe(&record).await;
        if observation.outcome != ProbeOutcome::Error || attempt >= policy.max_retries {
            return observation;
        }
        let delay = policy.delay_for(attempt);
        debug!(
            record = %record.key,
            attempt,
            delay_millis = delay.as_millis() as u64,
            "probe errored, retrying after backoff"
        );
        sleep(delay).await;
        attempt += 1;
    }
}

/// Resolve when an in-flight round must be abandoned: grace after either a
/// shutdown request or the study deadline.
async fn abandoned_round(
    shutdown: &mut watch::Receiver<bool>,
    deadline: Instant,
    grace: Duration,
) -> StopReason {
    let reason = tokio::select! {
        _ = shutdown.changed() => StopReason::ShutdownRequested,
        _ = sleep_until(deadline) => StopReason::DeadlineReached,
    };
    sleep(grace).await;
    reason
}

// ─────────────────────────────────────────────────────────────────────────────
// Scheduler
// ─────────────────────────────────────────────────────────────────────────────

/// Drives a study: owns the registry and the observation log, and feeds
/// every final probe result to the log first and the registry second.
pub struct ProbeScheduler<C: DhtClient> {
    settings: SchedulerSettings,
    registry: RecordRegistry,
    recorder: ObservationLog,
    prober: Prober<C>,
    shutdown: watch::Receiver<bool>,
    /// Newest recorded timestamp per record; appends are clamped past it so
    /// per-record timestamps stay strictly increasing across resumes.
    last_recorded: HashMap<RecordKey, u64>,
    rounds: u64,
    present: u64,
    absent: u64,
    errors: u64,
}

impl<C: DhtClient> ProbeScheduler<C> {
    /// Build a scheduler over an already-populated registry.
    ///
    /// `last_recorded` carries the newest logged timestamp per record when
    /// resuming from an existing log; a fresh study passes an empty map.
    pub fn new(
        settings: SchedulerSettings,
        registry: RecordRegistry,
        recorder: ObservationLog,
        prober: Prober<C>,
        shutdown: watch::Receiver<bool>,
        last_recorded: HashMap<RecordKey, u64>,
    ) -> Self {
        Self {
            settings,
            registry,
            recorder,
            prober,
            shutdown,
            last_recorded,
            rounds: 0,
            present: 0,
            absent: 0,
            errors: 0,
        }
    }

    /// Run the study to completion.
    ///
    /// The loop:
    /// 1. Wait for the next cadence tick. Rounds start at `t0 + n·interval`;
    ///    a round that overruns its interval skips the missed ticks instead
    ///    of bursting to catch up.
    /// 2. Snapshot the active records and probe them, at most
    ///    `max_concurrent_probes` in flight, retrying errors with backoff.
    /// 3. Append each final observation to the log, then apply it to the
    ///    registry.
    /// 4. Stop when no active records remain, the study deadline passes, or
    ///    shutdown is requested; a round already in flight gets
    ///    `shutdown_grace` to finish and is then abandoned.
    ///
    /// Records still active at deadline or shutdown are marked study-ended.
    /// The log is flushed on every exit path, including failure.
    pub async fn run(mut self) -> Result<StudySummary, SchedulerError> {
        let started = Instant::now();
        info!(
            records = self.registry.active_count(),
            interval_secs = self.settings.probe_interval.as_secs(),
            duration_secs = self.settings.study_duration.as_secs(),
            "study starting"
        );
        match self.drive(started).await {
            Ok(reason) => self.close_out(reason),
            Err(err) => {
                if let Err(flush_err) = self.recorder.flush() {
                    warn!("observation log flush failed during abort: {flush_err}");
                }
                Err(err)
            }
        }
    }

    /// The round loop. Returns why probing stopped.
    async fn drive(&mut self, started: Instant) -> Result<StopReason, SchedulerError> {
        let deadline = started + self.settings.study_duration;
        let grace = self.settings.shutdown_grace;
        let mut shutdown = self.shutdown.clone();
        let mut ticker = interval(self.settings.probe_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            if self.registry.active_count() == 0 {
                return Ok(StopReason::PopulationSettled);
            }
            if Instant::now() >= deadline {
                return Ok(StopReason::DeadlineReached);
            }
            tokio::select! {
                _ = ticker.tick() => {}
                _ = sleep_until(deadline) => return Ok(StopReason::DeadlineReached),
                _ = shutdown.changed() => return Ok(StopReason::ShutdownRequested),
            }

            let mut abandon = shutdown.clone();
            tokio::select! {
                result = self.run_round() => result?,
                reason = abandoned_round(&mut abandon, deadline, grace) => {
                    warn!(reason = %reason, "abandoning in-flight round after grace period");
                    return Ok(reason);
                }
            }
            self.rounds += 1;
        }
    }

    /// Probe every active record once (with retries) and commit the results
    /// as they complete.
    async fn run_round(&mut self) -> Result<(), SchedulerError> {
        let batch: Vec<Record> = self.registry.active_records().cloned().collect();
        debug!(round = self.rounds, records = batch.len(), "probe round starting");

        let prober = self.prober.clone();
        let policy = RetryPolicy {
            max_retries: self.settings.max_retries_per_probe,
            backoff_base: self.settings.retry_backoff_base,
        };
        let mut results = stream::iter(batch)
            .map(move |record| probe_with_retry(prober.clone(), record, policy))
            .buffer_unordered(self.settings.max_concurrent_probes.max(1));

        while let Some(observation) = results.next().await {
            self.commit(observation)?;
        }
        Ok(())
    }

    /// Make one observation durable, then apply it to the registry.
    ///
    /// The observation goes to the log before the registry; timestamps are
    /// clamped so each record's sequence stays strictly increasing.
    fn commit(&mut self, mut observation: Observation) -> Result<(), SchedulerError> {
        if let Some(last) = self.last_recorded.get(&observation.record_id) {
            observation.timestamp = observation.timestamp.max(last + 1);
        }
        self.recorder.append(&observation)?;
        self.last_recorded
            .insert(observation.record_id.clone(), observation.timestamp);
        match observation.outcome {
            ProbeOutcome::Present => self.present += 1,
            ProbeOutcome::Absent => self.absent += 1,
            ProbeOutcome::Error => self.errors += 1,
        }
        self.registry
            .apply_outcome(&observation.record_id, observation.outcome)?;
        Ok(())
    }

    /// Mark unfinished records, flush the log, and summarize.
    fn close_out(mut self, reason: StopReason) -> Result<StudySummary, SchedulerError> {
        let unfinished: Vec<RecordKey> = self
            .registry
            .active_records()
            .map(|record| record.key.clone())
            .collect();
        for key in &unfinished {
            self.registry.mark_study_ended(key)?;
        }
        self.recorder.flush()?;
        let summary = StudySummary {
            stop_reason: reason,
            rounds: self.rounds,
            observations: self.recorder.appended(),
            present: self.present,
            absent: self.absent,
            errors: self.errors,
            final_states: self.registry.state_counts(),
        };
        info!(
            reason = %summary.stop_reason,
            rounds = summary.rounds,
            observations = summary.observations,
            "study finished"
        );
        Ok(summary)
    }
}
