#![forbid(unsafe_code)]

use sq_queue::{Guarded, QueueConfig, SqliteJobQueue, StatusGuard, run_guarded};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::PathBuf;

fn temp_dir(test_name: &str) -> PathBuf {
    let base = std::env::temp_dir();
    let pid = std::process::id();
    let nonce = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let dir = base.join(format!("sq_queue_{test_name}_{pid}_{nonce}"));
    std::fs::create_dir_all(&dir).expect("create temp dir");
    dir
}

fn open_queue(dir: &PathBuf) -> SqliteJobQueue {
    SqliteJobQueue::open(QueueConfig::new(dir.join("queue.db"), "test-host")).expect("open queue")
}

#[test]
fn successful_work_is_marked_finished() {
    let dir = temp_dir("guarded_success");
    let mut queue = open_queue(&dir);

    let outcome = run_guarded(&mut queue, &"S1", || Ok::<_, String>(42)).expect("run_guarded");
    assert_eq!(outcome, Guarded::Finished(42));

    let job = queue.get(&"S1").expect("get");
    assert_eq!(job.finished, Some(true));
    assert!(!queue.is_started(&"S1").expect("is_started"));
}

#[test]
fn work_failure_is_recorded_and_swallowed() {
    let dir = temp_dir("guarded_failure");
    let mut queue = open_queue(&dir);

    let outcome = run_guarded(&mut queue, &"S1", || {
        Err::<(), _>("payload exploded".to_string())
    })
    .expect("run_guarded returns normally on work failure");
    assert_eq!(outcome, Guarded::Errored("payload exploded".to_string()));

    let job = queue.get(&"S1").expect("get");
    assert_eq!(job.error.as_deref(), Some("payload exploded"));
    assert_eq!(job.finished, Some(false));
    assert!(job.started_ms.is_some(), "claim fields are not cleared");
    assert!(
        !queue.is_started(&"S1").expect("is_started"),
        "errored jobs are no longer classified in progress"
    );
}

#[test]
fn interruption_requeues_the_job_and_keeps_unwinding() {
    let dir = temp_dir("guarded_interruption");
    let mut queue = open_queue(&dir);

    let unwound = catch_unwind(AssertUnwindSafe(|| {
        let _ = run_guarded(&mut queue, &"S1", || -> Result<(), String> {
            panic!("forced cancellation")
        });
    }));
    assert!(unwound.is_err(), "the interruption is never swallowed");

    let job = queue.get(&"S1").expect("get");
    assert_eq!(job.started_ms, None);
    assert_eq!(job.hostname, None);
    assert_eq!(job.finished, None);
    assert_eq!(job.error, None);
}

#[test]
fn dropping_an_armed_guard_requeues() {
    let dir = temp_dir("guard_drop_requeues");
    let db_path = dir.join("queue.db");
    let mut queue = SqliteJobQueue::open(QueueConfig::new(&db_path, "test-host")).expect("open");
    let mut observer =
        SqliteJobQueue::open(QueueConfig::new(&db_path, "observer")).expect("open observer");

    let guard = StatusGuard::begin(&mut queue, &"S1").expect("begin");
    assert_eq!(guard.session(), "S1");
    assert!(observer.is_started(&"S1").expect("is_started"));

    drop(guard);
    let job = observer.get(&"S1").expect("get");
    assert_eq!(job.started_ms, None);
    assert_eq!(job.finished, None);
}

#[test]
fn explicit_fail_records_the_error_text() {
    let dir = temp_dir("guard_explicit_fail");
    let mut queue = open_queue(&dir);

    let guard = StatusGuard::begin(&mut queue, &"S1").expect("begin");
    let recorded = guard.fail("no probe data found").expect("fail");
    assert_eq!(recorded, "no probe data found");

    let job = queue.get(&"S1").expect("get");
    assert_eq!(job.error.as_deref(), Some("no probe data found"));
    assert!(job.started_ms.is_some(), "fail does not requeue");
}
