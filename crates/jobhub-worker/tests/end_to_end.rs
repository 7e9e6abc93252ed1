//! Submit → listen → run → acknowledge over the in-process sorted-set client.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{Value, json};

use jobhub_core::error::ErrorKind;
use jobhub_queue::{ClientOptions, QueueClient, QueueOptions, QueueRegistry, SortedSetClient};
use jobhub_worker::{JobRunner, Scheduler, TaskError, TaskRegistry};

struct Harness {
    scheduler: Scheduler,
    client: SortedSetClient,
    seen: Arc<Mutex<Vec<Value>>>,
}

async fn harness() -> Harness {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let mut tasks = TaskRegistry::new();
    let log = Arc::clone(&seen);
    tasks
        .register_fn("jobs.run_task", move |args: Value| {
            let log = Arc::clone(&log);
            async move {
                log.lock().unwrap().push(args);
                Ok(None)
            }
        })
        .unwrap();
    tasks
        .register_fn("jobs.flaky", |_| async { Err(TaskError::Retry("backend busy".into())) })
        .unwrap();

    let client = SortedSetClient::memory("default", ClientOptions::default());
    let queues = Arc::new(QueueRegistry::new());
    queues.insert(Arc::new(client.clone()));

    let runner = Arc::new(JobRunner::new(Arc::new(tasks), Some(Duration::from_secs(5))));
    let scheduler = Scheduler::new(queues, runner).await.unwrap();
    Harness { scheduler, client, seen }
}

fn listen_options() -> QueueOptions {
    QueueOptions {
        visibility_timeout: Some(Duration::from_secs(5)),
        interval: Some(Duration::from_millis(10)),
        retry_interval: Some(Duration::from_millis(10)),
        ..QueueOptions::default()
    }
}

async fn wait_for<F: Fn() -> bool>(check: F) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

#[tokio::test]
async fn test_submitted_job_runs_and_is_deleted() {
    let h = harness().await;
    h.scheduler.listen(&["default".to_string()], &listen_options()).await.unwrap();

    let receipt = h
        .scheduler
        .submit_job(&json!({ "jobs.run_task": { "x": 1 } }), &[], &QueueOptions::default())
        .await
        .unwrap();
    assert_eq!(receipt.queue, "default");

    let seen = Arc::clone(&h.seen);
    assert!(wait_for(|| !seen.lock().unwrap().is_empty()).await);
    assert_eq!(h.seen.lock().unwrap().as_slice(), &[json!({ "x": 1 })]);

    let client = h.client.clone();
    let mut depth = client.depth(None).await.unwrap();
    for _ in 0..200 {
        if depth.ready == 0 && depth.processing == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
        depth = client.depth(None).await.unwrap();
    }
    assert_eq!((depth.ready, depth.processing), (0, 0));

    h.scheduler.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn test_invalid_job_never_reaches_the_queue() {
    let h = harness().await;
    let err = h
        .scheduler
        .submit_job(&json!(["jobs.run_task", { "jobs.bad key": {} }]), &[], &QueueOptions::default())
        .await
        .unwrap_err();
    assert!(err.is(ErrorKind::Validation));

    let depth = h.client.depth(None).await.unwrap();
    assert_eq!((depth.ready, depth.processing), (0, 0));
}

#[tokio::test]
async fn test_transient_failure_keeps_the_message() {
    let h = harness().await;
    let options = QueueOptions {
        visibility_timeout: Some(Duration::from_secs(30)),
        ..listen_options()
    };
    h.scheduler.listen(&["default".to_string()], &options).await.unwrap();
    h.scheduler
        .submit_job(&json!("jobs.flaky"), &[], &QueueOptions::default())
        .await
        .unwrap();

    let client = h.client.clone();
    assert!(wait_for(|| client.stats().retried >= 1).await);

    let depth = h.client.depth(None).await.unwrap();
    assert_eq!(depth.ready + depth.processing, 1);

    h.scheduler.shutdown(Duration::from_secs(1)).await;
}
