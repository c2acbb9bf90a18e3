//! End-to-end scheduling against the in-memory cluster.
//!
//! Time is paused, so poll-interval and launch-retry sleeps advance
//! instantly while keeping their ordering.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::sync::Arc;
use std::time::Duration;

use replay_verify::cluster::memory::InMemoryCluster;
use replay_verify::cluster::{
    ClusterClient, PodSpec, PodStatus, RUN_LABEL_KEY, VolumeHandle, VolumeProvisioner,
    VolumeRequest,
};
use replay_verify::prelude::*;

const LABEL: &str = "rv-test";

fn config() -> ReplayConfig {
    ReplayConfig::for_network(Network::Testnet)
        .with_range_size(100)
        .with_min_range_size(10)
        .with_volume_pool_size(2)
}

fn options(worker_cnt: usize) -> SchedulerOptions {
    SchedulerOptions::new(worker_cnt, LABEL, "aptoslabs/tools:test")
        .with_poll_interval(Duration::from_secs(10))
        .with_launch_retry(5, Duration::from_secs(10))
}

fn scheduler(
    cluster: &Arc<InMemoryCluster>,
    worker_cnt: usize,
    interval: (u64, u64),
    skips: Vec<SkipRange>,
) -> ReplayScheduler {
    scheduler_with(cluster, options(worker_cnt), interval, skips)
}

fn scheduler_with(
    cluster: &Arc<InMemoryCluster>,
    options: SchedulerOptions,
    interval: (u64, u64),
    skips: Vec<SkipRange>,
) -> ReplayScheduler {
    ReplayScheduler::new(
        config(),
        options,
        VersionRange::new(interval.0, interval.1).unwrap(),
        skips,
        cluster.clone(),
        cluster.clone(),
    )
    .unwrap()
}

fn pod_name(start: u64, end: u64) -> String {
    format!("{LABEL}-{start}-{end}")
}

fn retry_name(start: u64, end: u64, retry: u32) -> String {
    format!("{LABEL}-{start}-{end}-retry-{retry}")
}

fn leftover_pod() -> PodSpec {
    PodSpec {
        name: pod_name(0, 100),
        namespace: "replay-verify".to_string(),
        image: "aptoslabs/tools:old".to_string(),
        labels: [(RUN_LABEL_KEY.to_string(), LABEL.to_string())]
            .into_iter()
            .collect(),
        command: vec![],
        volume: VolumeHandle::new("old-vol"),
        mount_path: "/mnt/archive/db".to_string(),
    }
}

fn created_names(cluster: &InMemoryCluster) -> Vec<String> {
    cluster
        .created_pods()
        .unwrap()
        .into_iter()
        .map(|spec| spec.name)
        .collect()
}

#[tokio::test(start_paused = true)]
async fn all_ranges_succeed_and_resources_are_released() {
    let cluster = Arc::new(InMemoryCluster::new());
    let mut scheduler = scheduler(&cluster, 3, (0, 1000), vec![]);

    let report = scheduler.run(false).await.unwrap();

    assert!(report.is_success());
    assert_eq!(report.tasks_planned, 10);
    assert!(report.failures.is_empty());
    assert_eq!(report.stats.len(), 10);
    assert_eq!(report.summary.total_retries, 0);
    assert_eq!(report.summary.attempt_count, 10);

    let expected: Vec<String> = (0..10).map(|i| pod_name(i * 100, i * 100 + 100)).collect();
    assert_eq!(created_names(&cluster), expected);

    assert_eq!(cluster.live_pod_count().unwrap(), 0);
    assert_eq!(cluster.volume_count().unwrap(), 0);
}

#[tokio::test(start_paused = true)]
async fn skip_ranges_are_never_dispatched() {
    let cluster = Arc::new(InMemoryCluster::new());
    let mut scheduler = scheduler(&cluster, 2, (0, 500), vec![SkipRange::new(150, 249)]);

    let report = scheduler.run(false).await.unwrap();

    assert!(report.is_success());
    assert_eq!(
        created_names(&cluster),
        vec![
            pod_name(0, 100),
            pod_name(100, 150),
            pod_name(250, 350),
            pod_name(350, 450),
            pod_name(450, 500),
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn evicted_range_is_retried_under_new_names_and_counted() {
    let cluster = Arc::new(InMemoryCluster::new());
    let first = pod_name(100, 200);
    let second = retry_name(100, 200, 1);
    let third = retry_name(100, 200, 2);
    cluster.script_pod(&first, vec![PodStatus::running(), PodStatus::evicted()]);
    cluster.script_pod(&second, vec![PodStatus::evicted()]);

    let mut scheduler = scheduler(&cluster, 2, (0, 400), vec![]);
    let report = scheduler.run(false).await.unwrap();

    assert!(report.is_success());
    assert!(report.failures.is_empty());
    for name in [&first, &second, &third] {
        assert_eq!(cluster.create_count(name).unwrap(), 1, "{name}");
    }
    assert_eq!(cluster.deleted_pods().unwrap(), vec![first.clone(), second.clone()]);
    assert_eq!(scheduler.retry_count(VersionRange::new(100, 200).unwrap()), 2);

    let retry_counts: Vec<u32> = [&first, &second, &third]
        .iter()
        .map(|name| report.stats.iter().find(|s| &&s.name == name).unwrap().retry_count)
        .collect();
    assert_eq!(retry_counts, vec![0, 1, 2]);
    for stats in &report.stats {
        assert_eq!(stats.durations.len(), 1);
        assert!(stats.end_time.is_some());
    }
    assert_eq!(report.summary.total_retries, 2);
    assert_eq!(report.stats.len(), 6);
}

#[tokio::test(start_paused = true)]
async fn failed_delete_of_evicted_pod_does_not_block_the_retry() {
    let cluster = Arc::new(InMemoryCluster::new());
    cluster.script_pod(pod_name(0, 100), vec![PodStatus::evicted()]);
    cluster.fail_next_deletes(u32::MAX);

    let mut scheduler = scheduler(&cluster, 2, (0, 400), vec![]);
    let report = scheduler.run(false).await.unwrap();

    assert!(report.is_success());
    assert!(report.failures.is_empty());
    assert_eq!(report.stats.len(), 5);
    assert!(cluster.deleted_pods().unwrap().is_empty());
    assert_eq!(cluster.create_count(&pod_name(0, 100)).unwrap(), 1);
    assert_eq!(cluster.create_count(&retry_name(0, 100, 1)).unwrap(), 1);
    // The undeleted pod still carries the run label and goes with the run.
    assert_eq!(cluster.live_pod_count().unwrap(), 0);
}

#[tokio::test(start_paused = true)]
async fn terminating_evicted_pod_does_not_block_the_retry() {
    let cluster = Arc::new(InMemoryCluster::new());
    cluster.script_pod(pod_name(100, 200), vec![PodStatus::running(), PodStatus::evicted()]);
    cluster.delay_deletions(u32::MAX);

    let mut scheduler = scheduler(&cluster, 2, (0, 300), vec![]);
    let report = scheduler.run(false).await.unwrap();

    assert!(report.is_success());
    assert_eq!(cluster.create_count(&retry_name(100, 200, 1)).unwrap(), 1);
}

#[tokio::test(start_paused = true)]
async fn evicted_range_goes_to_the_back_of_the_backlog() {
    let cluster = Arc::new(InMemoryCluster::new());
    cluster.script_pod(pod_name(0, 100), vec![PodStatus::evicted()]);

    let mut scheduler = scheduler(&cluster, 1, (0, 400), vec![]);
    scheduler.run(false).await.unwrap();

    assert_eq!(
        created_names(&cluster),
        vec![
            pod_name(0, 100),
            pod_name(100, 200),
            pod_name(200, 300),
            pod_name(300, 400),
            retry_name(0, 100, 1),
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn mismatch_is_recorded_and_never_retried() {
    let cluster = Arc::new(InMemoryCluster::new());
    let mismatched = pod_name(200, 300);
    cluster.script_pod(&mismatched, vec![PodStatus::running(), PodStatus::exited(2)]);

    let mut scheduler = scheduler(&cluster, 2, (0, 400), vec![]);
    let report = scheduler.run(false).await.unwrap();

    assert!(!report.is_success());
    assert_eq!(report.mismatches.len(), 1);
    assert_eq!(report.mismatches[0].pod, mismatched);
    assert_eq!(report.mismatches[0].range, VersionRange::new(200, 300).unwrap());
    assert_eq!(report.mismatches[0].exit_code, Some(2));
    assert!(report.failures.is_empty());

    assert_eq!(cluster.create_count(&mismatched).unwrap(), 1);
    let stats = report.stats.iter().find(|s| s.name == mismatched).unwrap();
    assert_eq!(stats.retry_count, 0);
}

#[tokio::test(start_paused = true)]
async fn hard_failure_is_recorded_without_failing_the_run() {
    let cluster = Arc::new(InMemoryCluster::new());
    let failed = pod_name(0, 100);
    cluster.script_pod(&failed, vec![PodStatus::exited(137)]);

    let mut scheduler = scheduler(&cluster, 2, (0, 300), vec![]);
    let report = scheduler.run(false).await.unwrap();

    assert!(report.is_success());
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].pod, failed);
    assert_eq!(report.failures[0].exit_code, Some(137));
    assert_eq!(report.failures[0].reason, "Error");
    assert_eq!(cluster.create_count(&failed).unwrap(), 1);
}

#[tokio::test(start_paused = true)]
async fn live_workers_never_exceed_worker_count() {
    let cluster = Arc::new(InMemoryCluster::with_default_script(vec![
        PodStatus::pending(),
        PodStatus::running(),
        PodStatus::running(),
        PodStatus::succeeded(),
    ]));
    cluster.script_pod(pod_name(300, 400), vec![PodStatus::running(), PodStatus::evicted()]);

    let mut scheduler = scheduler(&cluster, 3, (0, 2000), vec![]);
    let report = scheduler.run(false).await.unwrap();

    assert!(report.is_success());
    assert_eq!(report.tasks_planned, 20);
    assert_eq!(cluster.peak_active().unwrap(), 3);
}

#[tokio::test(start_paused = true)]
async fn drain_redispatches_ranges_evicted_after_backlog_empties() {
    let cluster = Arc::new(InMemoryCluster::new());
    let evicted = pod_name(100, 200);
    cluster.script_pod(&evicted, vec![PodStatus::running(), PodStatus::evicted()]);

    let mut scheduler = scheduler(&cluster, 2, (0, 200), vec![]);
    scheduler.schedule(false).await.unwrap();
    assert!(scheduler.backlog().is_empty());
    assert_eq!(scheduler.active_workers(), 2);

    let logs = scheduler.collect_all_failed_logs().await.unwrap();

    assert!(logs.mismatches.is_empty());
    assert!(logs.failures.is_empty());
    assert_eq!(scheduler.active_workers(), 0);
    assert!(scheduler.backlog().is_empty());
    assert_eq!(cluster.create_count(&evicted).unwrap(), 1);
    let retried = retry_name(100, 200, 1);
    assert_eq!(cluster.create_count(&retried).unwrap(), 1);
    assert_eq!(scheduler.task_stats()[&retried].retry_count, 1);
    assert_eq!(scheduler.retry_count(VersionRange::new(100, 200).unwrap()), 1);
    assert!(scheduler.task_stats().values().all(|s| !s.is_in_flight()));
}

#[tokio::test(start_paused = true)]
async fn transient_status_poll_failures_keep_the_worker() {
    let cluster = Arc::new(InMemoryCluster::new());
    let flaky = pod_name(0, 100);
    cluster.fail_status_polls(&flaky, 3);

    let mut scheduler = scheduler(&cluster, 1, (0, 200), vec![]);
    let report = scheduler.run(false).await.unwrap();

    assert!(report.is_success());
    assert!(report.failures.is_empty());
    assert_eq!(cluster.create_count(&flaky).unwrap(), 1);
}

#[tokio::test(start_paused = true)]
async fn launch_retries_absorb_transient_create_failures() {
    let cluster = Arc::new(InMemoryCluster::new());
    cluster.fail_next_creates(4);

    let mut scheduler = scheduler(&cluster, 2, (0, 300), vec![]);
    let report = scheduler.run(false).await.unwrap();

    assert!(report.is_success());
    assert_eq!(created_names(&cluster).len(), 3);
}

#[tokio::test(start_paused = true)]
async fn exhausted_launch_retries_abort_the_run_after_cleanup() {
    let cluster = Arc::new(InMemoryCluster::new());
    cluster.fail_next_creates(5);

    let mut scheduler = scheduler(&cluster, 2, (0, 300), vec![]);
    let err = scheduler.run(false).await.unwrap_err();

    match err {
        Error::LaunchFailed {
            pod,
            range,
            attempts,
            ..
        } => {
            assert_eq!(pod, pod_name(0, 100));
            assert_eq!(range, VersionRange::new(0, 100).unwrap());
            assert_eq!(attempts, 5);
        }
        other => panic!("expected launch failure, got {other}"),
    }
    assert_eq!(cluster.live_pod_count().unwrap(), 0);
    assert_eq!(cluster.volume_count().unwrap(), 0);
}

#[tokio::test(start_paused = true)]
async fn short_volume_pool_aborts_the_run() {
    let cluster = Arc::new(InMemoryCluster::new());
    cluster.short_volumes(1);

    let mut scheduler = scheduler(&cluster, 2, (0, 300), vec![]);
    let err = scheduler.run(false).await.unwrap_err();

    assert!(matches!(
        err,
        Error::VolumeCountMismatch {
            expected: 2,
            actual: 1
        }
    ));
    assert!(created_names(&cluster).is_empty());
    assert_eq!(cluster.volume_count().unwrap(), 0);
}

#[tokio::test(start_paused = true)]
async fn from_scratch_clears_leftovers_of_a_previous_run() {
    let cluster = Arc::new(InMemoryCluster::new());
    cluster.create_pod(&leftover_pod()).await.unwrap();

    let mut scheduler = scheduler(&cluster, 2, (0, 200), vec![]);
    let report = scheduler.run(true).await.unwrap();

    assert!(report.is_success());
    assert_eq!(cluster.create_count(&pod_name(0, 100)).unwrap(), 2);
}

#[tokio::test(start_paused = true)]
async fn from_scratch_waits_for_terminating_leftovers() {
    let cluster = Arc::new(InMemoryCluster::new());
    cluster.create_pod(&leftover_pod()).await.unwrap();
    let previous = VolumeRequest {
        run_id: LABEL.to_string(),
        snapshot_name: "snap".to_string(),
        namespace: "replay-verify".to_string(),
        count: 2,
        label: LABEL.to_string(),
    };
    cluster.create_volumes_from_snapshot(&previous).await.unwrap();
    cluster.delay_deletions(3);

    let mut scheduler = scheduler(&cluster, 2, (0, 200), vec![]);
    let started = tokio::time::Instant::now();
    let report = scheduler.run(true).await.unwrap();

    assert!(report.is_success());
    assert_eq!(cluster.create_count(&pod_name(0, 100)).unwrap(), 2);
    assert!(started.elapsed() >= Duration::from_secs(20));
}

#[tokio::test(start_paused = true)]
async fn from_scratch_gives_up_when_leftovers_never_terminate() {
    let cluster = Arc::new(InMemoryCluster::new());
    cluster.create_pod(&leftover_pod()).await.unwrap();
    cluster.delay_deletions(u32::MAX);

    let options = options(2).with_teardown_timeout(Duration::from_secs(60));
    let mut scheduler = scheduler_with(&cluster, options, (0, 200), vec![]);
    let err = scheduler.run(true).await.unwrap_err();

    match err {
        Error::TeardownTimeout {
            label,
            remaining,
            waited,
        } => {
            assert_eq!(label, LABEL);
            assert_eq!(remaining, 1);
            assert!(waited >= Duration::from_secs(60));
        }
        other => panic!("expected teardown timeout, got {other}"),
    }
    assert_eq!(cluster.create_count(&pod_name(0, 100)).unwrap(), 1);
    assert_eq!(cluster.volume_count().unwrap(), 0);
}

#[tokio::test(start_paused = true)]
async fn invalid_label_fails_before_any_launch() {
    let cluster = Arc::new(InMemoryCluster::new());
    let options = SchedulerOptions::new(2, "My_Run", "aptoslabs/tools:test");
    let result = ReplayScheduler::new(
        config(),
        options,
        VersionRange::new(0, 200).unwrap(),
        vec![],
        cluster.clone(),
        cluster.clone(),
    );

    assert!(matches!(result, Err(Error::Configuration { .. })));
    assert!(created_names(&cluster).is_empty());
}

#[tokio::test(start_paused = true)]
async fn leftover_pod_without_reset_fails_to_launch() {
    let cluster = Arc::new(InMemoryCluster::new());
    cluster.create_pod(&leftover_pod()).await.unwrap();

    let mut scheduler = scheduler(&cluster, 2, (0, 200), vec![]);
    let err = scheduler.run(false).await.unwrap_err();

    assert!(matches!(err, Error::LaunchFailed { attempts: 5, .. }));
}

#[tokio::test(start_paused = true)]
async fn sub_minimum_tail_is_reported_unverified() {
    let cluster = Arc::new(InMemoryCluster::new());
    let mut scheduler = scheduler(&cluster, 2, (0, 305), vec![]);

    let report = scheduler.run(false).await.unwrap();

    assert_eq!(report.tasks_planned, 3);
    assert_eq!(report.unverified, vec![VersionRange::new(300, 305).unwrap()]);
    assert!(!created_names(&cluster).contains(&pod_name(300, 305)));
}

#[tokio::test(start_paused = true)]
async fn workers_share_volumes_when_pool_is_smaller() {
    let cluster = Arc::new(InMemoryCluster::new());
    let mut scheduler = scheduler(&cluster, 5, (0, 500), vec![]);

    let report = scheduler.run(false).await.unwrap();

    assert!(report.is_success());
    let volumes: Vec<String> = cluster
        .created_pods()
        .unwrap()
        .into_iter()
        .map(|spec| spec.volume.as_str().to_string())
        .collect();
    assert_eq!(
        volumes,
        vec![
            "rv-test-vol-0",
            "rv-test-vol-1",
            "rv-test-vol-0",
            "rv-test-vol-1",
            "rv-test-vol-0",
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn report_serializes_to_json() {
    let cluster = Arc::new(InMemoryCluster::new());
    cluster.script_pod(pod_name(0, 100), vec![PodStatus::exited(2)]);

    let mut scheduler = scheduler(&cluster, 1, (0, 200), vec![]);
    let report = scheduler.run(false).await.unwrap();

    let json = serde_json::to_value(&report).unwrap();
    assert_eq!(json["label"], LABEL);
    assert_eq!(json["network"], "testnet");
    assert_eq!(json["mismatches"][0]["pod"], pod_name(0, 100));
    assert_eq!(json["stats"].as_array().unwrap().len(), 2);
}
