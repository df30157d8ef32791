#[path = "common/mod.rs"]
mod common;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use common::{test_settings, ProbeScript, ScriptedDht};
use dht_vigil::{
    read_observations, ObservationLog, ProbeOutcome, ProbeScheduler, Prober, Record,
    RecordRegistry, SchedulerSettings, StopReason, StudySummary,
};
use tempfile::TempDir;
use tokio::sync::watch;
use tokio::time::{Duration, Instant};

async fn run_study(
    dht: &ScriptedDht,
    records: Vec<Record>,
    miss_threshold: u32,
    settings: SchedulerSettings,
) -> (StudySummary, PathBuf, TempDir) {
    let mut registry = RecordRegistry::new(miss_threshold);
    for record in records {
        registry.register(record).expect("register record");
    }
    let dir = tempfile::tempdir().expect("tempdir");
    let log_path = dir.path().join("observations.jsonl");
    let recorder = ObservationLog::open(&log_path).expect("open log");
    let (_stop, shutdown) = watch::channel(false);
    let scheduler = ProbeScheduler::new(
        settings,
        registry,
        recorder,
        Prober::new(Arc::new(dht.clone())),
        shutdown,
        HashMap::new(),
    );
    let summary = scheduler.run().await.expect("study runs");
    (summary, log_path, dir)
}

#[tokio::test(start_paused = true)]
async fn consecutive_misses_confirm_a_record_absent() {
    let dht = ScriptedDht::new();
    let record = dht.seed_record("rec-a", b"payload-a").await;
    dht.script(
        &record.key,
        [ProbeScript::Present, ProbeScript::Absent, ProbeScript::Absent],
    )
    .await;

    let (summary, log_path, _dir) = run_study(&dht, vec![record.clone()], 2, test_settings()).await;

    assert_eq!(summary.stop_reason, StopReason::PopulationSettled);
    assert_eq!(summary.rounds, 3);
    assert_eq!(summary.observations, 3);
    assert_eq!(summary.present, 1);
    assert_eq!(summary.absent, 2);
    assert_eq!(summary.errors, 0);
    assert_eq!(summary.final_states.confirmed_absent, 1);
    assert_eq!(summary.final_states.active, 0);

    let logged = read_observations(&log_path).expect("replay log");
    let outcomes: Vec<ProbeOutcome> = logged.iter().map(|o| o.outcome).collect();
    assert_eq!(
        outcomes,
        [ProbeOutcome::Present, ProbeOutcome::Absent, ProbeOutcome::Absent]
    );
    assert!(logged.iter().all(|o| o.record_id == record.key));
}

#[tokio::test(start_paused = true)]
async fn transient_errors_retry_within_the_round() {
    let dht = ScriptedDht::new();
    let record = dht.seed_record("rec-a", b"payload-a").await;
    dht.script(&record.key, [ProbeScript::TimedOut, ProbeScript::TimedOut])
        .await;

    let settings = SchedulerSettings {
        study_duration: Duration::from_millis(40),
        ..test_settings()
    };
    let (summary, log_path, _dir) = run_study(&dht, vec![record], 3, settings).await;

    // Two timeouts then a clean read inside one round: only the final
    // outcome is recorded.
    assert_eq!(summary.stop_reason, StopReason::DeadlineReached);
    assert_eq!(summary.rounds, 1);
    assert_eq!(summary.observations, 1);
    assert_eq!(summary.present, 1);
    assert_eq!(summary.errors, 0);
    assert_eq!(dht.get_calls().await.len(), 3, "both retries reached the network");

    let logged = read_observations(&log_path).expect("replay log");
    assert_eq!(logged.len(), 1);
    assert_eq!(logged[0].outcome, ProbeOutcome::Present);
    assert!(logged[0].latency_millis.is_some());
}

#[tokio::test(start_paused = true)]
async fn exhausted_retries_record_a_single_error() {
    let dht = ScriptedDht::new();
    let record = dht.seed_record("rec-a", b"payload-a").await;
    dht.script(
        &record.key,
        [ProbeScript::Unreachable, ProbeScript::Unreachable],
    )
    .await;

    let settings = SchedulerSettings {
        max_retries_per_probe: 1,
        study_duration: Duration::from_millis(40),
        ..test_settings()
    };
    let (summary, log_path, _dir) = run_study(&dht, vec![record], 3, settings).await;

    assert_eq!(summary.rounds, 1);
    assert_eq!(summary.observations, 1);
    assert_eq!(summary.errors, 1);
    assert_eq!(summary.final_states.confirmed_absent, 0, "errors are not misses");
    assert_eq!(summary.final_states.study_ended, 1);
    assert_eq!(dht.get_calls().await.len(), 2);

    let logged = read_observations(&log_path).expect("replay log");
    assert_eq!(logged.len(), 1);
    assert_eq!(logged[0].outcome, ProbeOutcome::Error);
    let detail = logged[0].error_detail.as_deref().expect("error detail");
    assert!(detail.contains("injected"), "unexpected detail: {detail}");
}

#[tokio::test(start_paused = true)]
async fn deadline_marks_active_records_study_ended() {
    let dht = ScriptedDht::new();
    let healthy_a = dht.seed_record("rec-a", b"payload-a").await;
    let healthy_b = dht.seed_record("rec-b", b"payload-b").await;

    let settings = SchedulerSettings {
        study_duration: Duration::from_millis(120),
        ..test_settings()
    };
    let (summary, _log_path, _dir) =
        run_study(&dht, vec![healthy_a, healthy_b], 3, settings).await;

    // Rounds at 0, 50, and 100 milliseconds fit before the deadline.
    assert_eq!(summary.stop_reason, StopReason::DeadlineReached);
    assert_eq!(summary.rounds, 3);
    assert_eq!(summary.observations, 6);
    assert_eq!(summary.present, 6);
    assert_eq!(summary.final_states.study_ended, 2);
    assert_eq!(summary.final_states.active, 0);
    assert_eq!(dht.get_calls().await.len(), 6);
}

#[tokio::test(start_paused = true)]
async fn shutdown_request_stops_between_rounds() {
    let dht = ScriptedDht::new();
    let record = dht.seed_record("rec-a", b"steady payload").await;
    let mut registry = RecordRegistry::new(3);
    registry.register(record).expect("register record");

    let dir = tempfile::tempdir().expect("tempdir");
    let recorder = ObservationLog::open(&dir.path().join("observations.jsonl")).expect("open log");
    let (stop, shutdown) = watch::channel(false);
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(75)).await;
        let _ = stop.send(true);
    });

    let scheduler = ProbeScheduler::new(
        test_settings(),
        registry,
        recorder,
        Prober::new(Arc::new(dht.clone())),
        shutdown,
        HashMap::new(),
    );
    let summary = scheduler.run().await.expect("study runs");

    // The stop lands at 75ms, after the rounds at 0 and 50ms.
    assert_eq!(summary.stop_reason, StopReason::ShutdownRequested);
    assert_eq!(summary.rounds, 2);
    assert_eq!(summary.observations, 2);
    assert_eq!(summary.final_states.study_ended, 1);
}

#[tokio::test(start_paused = true)]
async fn shutdown_abandons_a_hung_round_after_the_grace_period() {
    let dht = ScriptedDht::new();
    let stuck = dht.seed_record("rec-stuck", b"payload-a").await;
    let healthy = dht.seed_record("rec-ok", b"payload-b").await;
    dht.script(&stuck.key, [ProbeScript::Hang]).await;

    let mut registry = RecordRegistry::new(3);
    registry.register(stuck).expect("register record");
    registry.register(healthy.clone()).expect("register record");

    let dir = tempfile::tempdir().expect("tempdir");
    let log_path = dir.path().join("observations.jsonl");
    let recorder = ObservationLog::open(&log_path).expect("open log");
    let (stop, shutdown) = watch::channel(false);
    let scheduler = ProbeScheduler::new(
        test_settings(),
        registry,
        recorder,
        Prober::new(Arc::new(dht.clone())),
        shutdown,
        HashMap::new(),
    );

    let started = Instant::now();
    let run = tokio::spawn(scheduler.run());
    tokio::time::sleep(Duration::from_millis(10)).await;
    stop.send(true).expect("send stop");
    let summary = run.await.expect("join").expect("study runs");

    // The stop lands at 10ms with one probe stuck in flight; the round gets
    // the 100ms grace and is then dropped.
    assert_eq!(summary.stop_reason, StopReason::ShutdownRequested);
    assert!(started.elapsed() >= Duration::from_millis(110), "grace elapsed first");
    assert_eq!(summary.rounds, 0, "an abandoned round never completes");
    assert_eq!(summary.observations, 1, "the probe that finished was committed");
    assert_eq!(summary.present, 1);
    assert_eq!(summary.final_states.study_ended, 2);
    assert_eq!(summary.final_states.active, 0);
    assert_eq!(
        dht.unreleased_handles().await,
        1,
        "the hung probe never reached its close"
    );

    let logged = read_observations(&log_path).expect("replay log");
    assert_eq!(logged.len(), 1);
    assert_eq!(logged[0].record_id, healthy.key);
}

#[tokio::test(start_paused = true)]
async fn deadline_abandons_a_round_stuck_past_the_grace_period() {
    let dht = ScriptedDht::new();
    let record = dht.seed_record("rec-stuck", b"payload-a").await;
    dht.script(&record.key, [ProbeScript::Hang]).await;

    let settings = SchedulerSettings {
        study_duration: Duration::from_millis(30),
        ..test_settings()
    };
    let started = Instant::now();
    let (summary, log_path, _dir) = run_study(&dht, vec![record], 3, settings).await;

    // The deadline fires at 30ms mid-round; after the 100ms grace the round
    // is dropped without ever producing an observation.
    assert_eq!(summary.stop_reason, StopReason::DeadlineReached);
    assert!(started.elapsed() >= Duration::from_millis(130));
    assert_eq!(summary.rounds, 0);
    assert_eq!(summary.observations, 0);
    assert_eq!(summary.final_states.study_ended, 1);
    assert_eq!(summary.final_states.active, 0);
    assert_eq!(dht.unreleased_handles().await, 1);
    assert!(read_observations(&log_path).expect("replay log").is_empty());
}

#[tokio::test(start_paused = true)]
async fn errors_do_not_advance_or_reset_the_miss_count() {
    let dht = ScriptedDht::new();
    let record = dht.seed_record("rec-a", b"payload-a").await;
    dht.script(
        &record.key,
        [ProbeScript::Absent, ProbeScript::Unreachable, ProbeScript::Absent],
    )
    .await;

    let settings = SchedulerSettings {
        max_retries_per_probe: 0,
        ..test_settings()
    };
    let (summary, log_path, _dir) = run_study(&dht, vec![record], 2, settings).await;

    // Miss, error, miss: the error neither clears the first miss nor counts
    // as the second, so the second absent closes the record.
    assert_eq!(summary.stop_reason, StopReason::PopulationSettled);
    assert_eq!(summary.observations, 3);
    assert_eq!(summary.absent, 2);
    assert_eq!(summary.errors, 1);
    assert_eq!(summary.final_states.confirmed_absent, 1);

    let logged = read_observations(&log_path).expect("replay log");
    let outcomes: Vec<ProbeOutcome> = logged.iter().map(|o| o.outcome).collect();
    assert_eq!(
        outcomes,
        [ProbeOutcome::Absent, ProbeOutcome::Error, ProbeOutcome::Absent]
    );
}
