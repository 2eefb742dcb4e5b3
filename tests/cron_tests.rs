//! Recurring-job scenarios: arming, firing, re-arming and stopping.

mod test_harness;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use test_harness::{assert_eventually, shell_job, spawn_stub_worker, TestMaster};

#[tokio::test]
async fn cron_job_fires_and_rearms() {
    let runs = Arc::new(AtomicU32::new(0));
    let runs_clone = Arc::clone(&runs);
    let port = spawn_stub_worker(move |_task| {
        runs_clone.fetch_add(1, Ordering::SeqCst);
        0
    })
    .await;

    let master = TestMaster::start(port, vec!["127.0.0.1".into()], 1).await;

    let mut submission = shell_job("echo tick", 1, 0);
    submission.name = Some("tick".into());
    submission.cron = Some("* * * * * *".into());

    // Arming a recurring job queues nothing yet.
    let ids = master
        .manager
        .build_and_push(
            prexd::protocol::Submission::Single(submission),
            false,
            None,
        )
        .unwrap();
    assert!(ids.is_empty());
    assert!(master.cron.has_handler("tick"));

    // Within a few sweeps the schedule fires, the job runs and the handler
    // is re-armed for the next minute boundary.
    let runs_probe = Arc::clone(&runs);
    assert_eventually(
        || {
            let runs_probe = Arc::clone(&runs_probe);
            async move { runs_probe.load(Ordering::SeqCst) >= 1 }
        },
        Duration::from_secs(10),
        "cron job should execute at least once",
    )
    .await;

    let cron = Arc::clone(&master.cron);
    assert_eventually(
        || {
            let cron = Arc::clone(&cron);
            async move { cron.has_handler("tick") }
        },
        Duration::from_secs(10),
        "handler should re-arm after firing",
    )
    .await;
}

#[tokio::test]
async fn stopped_cron_job_stops_firing() {
    let runs = Arc::new(AtomicU32::new(0));
    let runs_clone = Arc::clone(&runs);
    let port = spawn_stub_worker(move |_task| {
        runs_clone.fetch_add(1, Ordering::SeqCst);
        0
    })
    .await;

    let master = TestMaster::start(port, vec!["127.0.0.1".into()], 1).await;

    let mut submission = shell_job("echo tick", 1, 0);
    submission.name = Some("doomed".into());
    submission.cron = Some("* * * * * *".into());
    master
        .manager
        .build_and_push(
            prexd::protocol::Submission::Single(submission),
            false,
            None,
        )
        .unwrap();

    master.manager.stop_job("doomed");
    assert!(!master.cron.has_handler("doomed"));

    // Two sweep periods later nothing has run.
    tokio::time::sleep(Duration::from_secs(3)).await;
    assert_eq!(runs.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn group_without_cron_runs_all_members() {
    let runs = Arc::new(AtomicU32::new(0));
    let runs_clone = Arc::clone(&runs);
    let port = spawn_stub_worker(move |_task| {
        runs_clone.fetch_add(1, Ordering::SeqCst);
        0
    })
    .await;

    let master = TestMaster::start(port, vec!["127.0.0.1".into()], 1).await;

    let group = prexd::protocol::GroupSubmission {
        name: "batch".into(),
        cron: None,
        jobs: vec![shell_job("echo a", 1, 0), shell_job("echo b", 1, 0)],
    };
    let ids = master
        .manager
        .build_and_push(prexd::protocol::Submission::Group(group), false, None)
        .unwrap();
    assert_eq!(ids.len(), 2);

    let runs_probe = Arc::clone(&runs);
    assert_eventually(
        || {
            let runs_probe = Arc::clone(&runs_probe);
            async move { runs_probe.load(Ordering::SeqCst) == 2 }
        },
        Duration::from_secs(5),
        "both group members should execute",
    )
    .await;
}
