use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use tokio::time::Instant;

use super::scheduler_with_workers;
use crate::scheduler::{
    SchedulerError, TaskArgs, TaskContext, TaskErrorKind, TaskOptions, TaskPriority, TaskStatus,
};
use crate::HandlerError;

async fn always_fails(_ctx: TaskContext, _args: TaskArgs) -> Result<Value, HandlerError> {
    Err("nope".into())
}

async fn fails_first_attempt(ctx: TaskContext, _args: TaskArgs) -> Result<Value, HandlerError> {
    if ctx.attempt() == 1 {
        return Err("transient".into());
    }
    Ok(json!({"attempt": ctx.attempt()}))
}

async fn sleeps_until_cancelled(ctx: TaskContext, _args: TaskArgs) -> Result<Value, HandlerError> {
    ctx.cancelled().await;
    Ok(json!("ignored"))
}

async fn never_finishes(_ctx: TaskContext, _args: TaskArgs) -> Result<Value, HandlerError> {
    std::future::pending::<()>().await;
    Ok(Value::Null)
}

#[tokio::test]
async fn test_retries_exhaust_after_max_plus_one_attempts() {
    let scheduler = scheduler_with_workers(1);
    scheduler.register("flaky", always_fails, TaskOptions::default().max_retries(2));
    scheduler.start();

    let id = scheduler.submit("flaky", TaskArgs::new(), None).unwrap();
    let result = scheduler
        .get_result(&id, Some(Duration::from_secs(5)))
        .await
        .unwrap();

    assert_eq!(result.status, TaskStatus::Failed);
    assert_eq!(result.attempts, 3);
    assert_eq!(result.error.as_deref(), Some("nope"));
    assert_eq!(result.error_kind, Some(TaskErrorKind::Handler));
    assert_eq!(scheduler.get_task(&id).unwrap().retries, 2);
    scheduler.stop(true).await;
}

#[tokio::test]
async fn test_single_failure_then_success_completes_on_second_attempt() {
    let scheduler = scheduler_with_workers(1);
    scheduler.register("once", fails_first_attempt, TaskOptions::default());
    scheduler.start();

    let id = scheduler.submit("once", TaskArgs::new(), None).unwrap();
    let result = scheduler
        .get_result(&id, Some(Duration::from_secs(5)))
        .await
        .unwrap();

    assert_eq!(result.status, TaskStatus::Completed);
    assert_eq!(result.attempts, 2);
    assert_eq!(result.result, Some(json!({"attempt": 2})));
    scheduler.stop(true).await;
}

#[tokio::test]
async fn test_running_count_never_exceeds_worker_count() {
    const WORKERS: usize = 3;
    let scheduler = scheduler_with_workers(WORKERS);
    let active = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let (a, p) = (active.clone(), peak.clone());
    scheduler.register(
        "busy",
        move |_ctx: TaskContext, _args: TaskArgs| {
            let (active, peak) = (a.clone(), p.clone());
            async move {
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                active.fetch_sub(1, Ordering::SeqCst);
                Ok::<_, HandlerError>(Value::Null)
            }
        },
        TaskOptions::default(),
    );

    let ids: Vec<String> = (0..12)
        .map(|_| scheduler.submit("busy", TaskArgs::new(), None).unwrap())
        .collect();
    scheduler.start();

    for id in &ids {
        assert!(scheduler.stats().running <= WORKERS);
        let result = scheduler
            .get_result(id, Some(Duration::from_secs(5)))
            .await
            .unwrap();
        assert_eq!(result.status, TaskStatus::Completed);
    }
    assert!(peak.load(Ordering::SeqCst) <= WORKERS);
    assert!(peak.load(Ordering::SeqCst) >= 1);
    scheduler.stop(true).await;
}

#[tokio::test]
async fn test_single_worker_runs_high_priority_first() {
    let scheduler = scheduler_with_workers(1);
    let order = Arc::new(Mutex::new(Vec::new()));

    let log = order.clone();
    scheduler.register(
        "record",
        move |_ctx: TaskContext, args: TaskArgs| {
            let log = log.clone();
            async move {
                let label = args.positional(0).cloned().unwrap_or(Value::Null);
                log.lock().unwrap().push(label.clone());
                Ok::<_, HandlerError>(label)
            }
        },
        TaskOptions::default(),
    );

    let low = scheduler
        .submit("record", TaskArgs::new().arg("low"), Some(TaskPriority::Low))
        .unwrap();
    let normal = scheduler
        .submit("record", TaskArgs::new().arg("normal"), Some(TaskPriority::Normal))
        .unwrap();
    let high = scheduler
        .submit("record", TaskArgs::new().arg("high"), Some(TaskPriority::High))
        .unwrap();
    let mut updates = scheduler.subscribe();
    scheduler.start();

    for id in [&low, &normal, &high] {
        scheduler
            .get_result(id, Some(Duration::from_secs(5)))
            .await
            .unwrap();
    }
    assert_eq!(
        *order.lock().unwrap(),
        vec![json!("high"), json!("normal"), json!("low")]
    );

    let first_completed = std::iter::from_fn(|| updates.try_recv().ok())
        .find(|update| update.status == TaskStatus::Completed)
        .unwrap();
    assert_eq!(first_completed.task_id, high);
    scheduler.stop(true).await;
}

#[tokio::test(start_paused = true)]
async fn test_get_result_timeout_leaves_task_untouched() {
    let scheduler = scheduler_with_workers(1);
    scheduler.register("stuck", never_finishes, TaskOptions::default());
    scheduler.start();

    let id = scheduler.submit("stuck", TaskArgs::new(), None).unwrap();
    let started = Instant::now();
    let err = scheduler
        .get_result(&id, Some(Duration::from_millis(250)))
        .await
        .unwrap_err();

    assert!(started.elapsed() >= Duration::from_millis(250));
    assert_eq!(
        err,
        SchedulerError::TimedOut {
            task_id: id.clone(),
            timeout: Duration::from_millis(250),
        }
    );
    assert_eq!(scheduler.get_status(&id), Some(TaskStatus::Running));
    scheduler.stop(false).await;
    assert_eq!(scheduler.get_status(&id), Some(TaskStatus::Cancelled));
}

#[tokio::test(start_paused = true)]
async fn test_timeout_fails_without_retry() {
    let scheduler = scheduler_with_workers(1);
    scheduler.register(
        "slow",
        never_finishes,
        TaskOptions::default().timeout(Duration::from_secs(1)),
    );
    scheduler.start();

    let id = scheduler.submit("slow", TaskArgs::new(), None).unwrap();
    let result = scheduler.get_result(&id, None).await.unwrap();

    assert_eq!(result.status, TaskStatus::Failed);
    assert_eq!(result.error_kind, Some(TaskErrorKind::Timeout));
    assert_eq!(result.attempts, 1);
    assert!(result.error.unwrap().contains("timed out"));
    scheduler.stop(true).await;
}

#[tokio::test]
async fn test_cancel_running_task_stays_cancelled() {
    let scheduler = scheduler_with_workers(1);
    scheduler.register("cooperative", sleeps_until_cancelled, TaskOptions::default());
    let mut updates = scheduler.subscribe();
    scheduler.start();

    let id = scheduler.submit("cooperative", TaskArgs::new(), None).unwrap();
    loop {
        let update = updates.recv().await.unwrap();
        if update.task_id == id && update.status == TaskStatus::Running {
            break;
        }
    }

    assert!(scheduler.cancel(&id));
    let result = scheduler
        .get_result(&id, Some(Duration::from_secs(5)))
        .await
        .unwrap();
    assert_eq!(result.status, TaskStatus::Cancelled);
    assert!(result.result.is_none());

    // The handler returns after the token fires; its value is discarded.
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(scheduler.get_status(&id), Some(TaskStatus::Cancelled));
    assert_eq!(scheduler.stats().running, 0);
    scheduler.stop(true).await;
}

#[tokio::test]
async fn test_panicking_handler_counts_as_failure() {
    let scheduler = scheduler_with_workers(1);
    scheduler.register(
        "explodes",
        |_ctx: TaskContext, _args: TaskArgs| async move {
            if true {
                panic!("boom");
            }
            Ok::<_, HandlerError>(Value::Null)
        },
        TaskOptions::default().max_retries(0),
    );
    scheduler.start();

    let id = scheduler.submit("explodes", TaskArgs::new(), None).unwrap();
    let result = scheduler
        .get_result(&id, Some(Duration::from_secs(5)))
        .await
        .unwrap();
    assert_eq!(result.status, TaskStatus::Failed);
    assert_eq!(result.error.as_deref(), Some("task handler panicked"));
    scheduler.stop(true).await;
}

#[tokio::test]
async fn test_stop_without_wait_keeps_queued_tasks() {
    let scheduler = scheduler_with_workers(1);
    scheduler.register("stuck", never_finishes, TaskOptions::default());
    let mut updates = scheduler.subscribe();
    scheduler.start();

    let running = scheduler.submit("stuck", TaskArgs::new(), None).unwrap();
    let queued = scheduler.submit("stuck", TaskArgs::new(), None).unwrap();
    loop {
        let update = updates.recv().await.unwrap();
        if update.task_id == running && update.status == TaskStatus::Running {
            break;
        }
    }

    scheduler.stop(false).await;
    assert_eq!(scheduler.get_status(&running), Some(TaskStatus::Cancelled));
    assert_eq!(scheduler.get_status(&queued), Some(TaskStatus::Queued));
    assert_eq!(scheduler.list_tasks(Some(TaskStatus::Queued)).len(), 1);
}

#[tokio::test]
async fn test_progress_is_visible_while_running() {
    let scheduler = scheduler_with_workers(1);
    let (tx, rx) = tokio::sync::oneshot::channel::<()>();
    let release = Arc::new(Mutex::new(Some(rx)));

    scheduler.register(
        "reporter",
        move |ctx: TaskContext, _args: TaskArgs| {
            let release = release.clone();
            async move {
                ctx.report_progress(0.5, "Halfway done");
                let rx = release.lock().unwrap().take();
                if let Some(rx) = rx {
                    let _ = rx.await;
                }
                ctx.report_progress(1.0, "");
                Ok::<_, HandlerError>(Value::Null)
            }
        },
        TaskOptions::default(),
    );
    scheduler.start();
    let id = scheduler.submit("reporter", TaskArgs::new(), None).unwrap();

    let deadline = Instant::now() + Duration::from_secs(5);
    while scheduler.get_progress(&id).map(|p| p.fraction) != Some(0.5) {
        assert!(Instant::now() < deadline, "progress never reported");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(scheduler.get_progress(&id).unwrap().message, "Halfway done");

    tx.send(()).unwrap();
    scheduler
        .get_result(&id, Some(Duration::from_secs(5)))
        .await
        .unwrap();
    let progress = scheduler.get_progress(&id).unwrap();
    assert_eq!(progress.fraction, 1.0);
    assert_eq!(progress.message, "Halfway done");
    scheduler.stop(true).await;
}
