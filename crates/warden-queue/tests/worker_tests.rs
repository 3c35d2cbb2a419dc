//! Worker pool behaviour against the in-memory store

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use serde_json::json;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use warden_queue::{
    content_reference, Exponential, FnObserver, JobContext, JobHandle, JobStatus, JobStore,
    MemoryQueue, NewJob, Processor, QueueError, WorkerConfig, WorkerPool,
};

type Work = Box<dyn Fn(&mut JobHandle) + Send + Sync>;

/// Processor driven by a closure, counting executions
struct TestProcessor {
    ty: &'static str,
    runs: Arc<AtomicU32>,
    work: Work,
}

impl TestProcessor {
    fn new(ty: &'static str, work: impl Fn(&mut JobHandle) + Send + Sync + 'static) -> Arc<Self> {
        Arc::new(Self {
            ty,
            runs: Arc::new(AtomicU32::new(0)),
            work: Box::new(work),
        })
    }
}

#[async_trait]
impl Processor for TestProcessor {
    fn job_type(&self) -> &str {
        self.ty
    }

    async fn run(&self, _ctx: &JobContext, job: &mut JobHandle) {
        self.runs.fetch_add(1, Ordering::SeqCst);
        (self.work)(job);
    }
}

/// Fails transiently until `fail_times` runs have happened
struct FlakyProcessor {
    runs: AtomicU32,
    fail_times: u32,
    backoff: Exponential,
}

#[async_trait]
impl Processor for FlakyProcessor {
    fn job_type(&self) -> &str {
        "Event-v1"
    }

    async fn run(&self, _ctx: &JobContext, job: &mut JobHandle) {
        let count = self.runs.fetch_add(1, Ordering::SeqCst);
        if count < self.fail_times {
            // simulated network failure
            job.retry(&self.backoff);
        } else {
            job.done();
        }
    }
}

struct PanicProcessor;

#[async_trait]
impl Processor for PanicProcessor {
    fn job_type(&self) -> &str {
        "panic/v1"
    }

    async fn run(&self, _ctx: &JobContext, _job: &mut JobHandle) {
        panic!("processor crashed");
    }
}

fn config() -> WorkerConfig {
    WorkerConfig::default()
        .with_workers(1, Duration::from_millis(10))
        .with_instance_name("test")
}

async fn enqueue(store: &MemoryQueue, ty: &str, reference: &str, args: serde_json::Value) {
    let now = Utc::now();
    store
        .enqueue(NewJob::new(ty, reference, args, now), now)
        .await
        .unwrap();
}

#[tokio::test]
async fn test_scenario_a_idempotent_enqueue() {
    let store = MemoryQueue::new();
    let t0 = Utc::now();
    let snapshot = |date: chrono::DateTime<Utc>| {
        json!({ "date": date.to_rfc3339(), "devices": { "tenant-1": 3, "tenant-2": 7 } })
    };

    let reference = content_reference("billing-update", 1, &snapshot(t0)).unwrap();
    let row = store
        .enqueue(NewJob::new("Event-v1", reference.clone(), snapshot(t0), t0), t0)
        .await
        .unwrap();
    assert_eq!(row.reference, reference);
    assert!(row.successful.is_none());
    assert_eq!(row.error_count, 0);
    assert_eq!(row.scheduled_at, t0);

    let dup = store
        .enqueue(NewJob::new("Event-v1", reference.clone(), snapshot(t0), t0), t0)
        .await;
    assert!(matches!(dup, Err(QueueError::Duplicate { .. })));

    let t1 = t0 + ChronoDuration::hours(1);
    let later = content_reference("billing-update", 1, &snapshot(t1)).unwrap();
    assert_ne!(later, reference);
    store
        .enqueue(NewJob::new("Event-v1", later, snapshot(t1), t0), t0)
        .await
        .unwrap();
    assert_eq!(store.len().await, 2);
}

#[tokio::test]
async fn test_scenarios_b_and_c_retry_then_succeed() {
    let store = Arc::new(MemoryQueue::new());
    let min = Duration::from_millis(100);
    let processor = Arc::new(FlakyProcessor {
        runs: AtomicU32::new(0),
        fail_times: 1,
        backoff: Exponential::new(min, Duration::from_secs(10)),
    });
    let observed = Arc::new(Mutex::new(Vec::<(String, String)>::new()));
    let seen = observed.clone();

    let pool = WorkerPool::builder(store.clone())
        .config(config())
        .processor(processor)
        .observer(Arc::new(FnObserver(move |ty: &str, reference: &str| {
            seen.lock().unwrap().push((ty.to_string(), reference.to_string()));
        })))
        .build()
        .unwrap();
    let cancel = CancellationToken::new();

    enqueue(&store, "Event-v1", "billing-update/1(abc)", json!({"n": 1})).await;

    // B: transient failure
    let before = Utc::now();
    assert!(pool.process_next("w", &cancel).await.unwrap());
    let after = Utc::now();

    let row = store.by_reference("Event-v1", "billing-update/1(abc)").await.unwrap();
    assert_eq!(row.error_count, 1);
    assert!(row.successful.is_none());
    assert!(row.finished_at.is_none());
    assert!(row.locked_by.is_none());
    let min = ChronoDuration::from_std(min).unwrap();
    assert!(row.next_run_at >= before + min);
    assert!(row.next_run_at <= after + min);
    assert_eq!(observed.lock().unwrap().len(), 1);

    // Not eligible before the backoff elapses
    assert!(!pool.process_next("w", &cancel).await.unwrap());

    tokio::time::sleep(Duration::from_millis(150)).await;

    // C: retried and now succeeding
    assert!(pool.process_next("w", &cancel).await.unwrap());
    let row = store.by_reference("Event-v1", "billing-update/1(abc)").await.unwrap();
    assert_eq!(row.successful, Some(true));
    assert!(row.finished_at.is_some());
    assert_eq!(row.error_count, 1);
    assert_eq!(row.status(), JobStatus::Done);

    let observed = observed.lock().unwrap();
    assert_eq!(observed.len(), 2);
    assert_eq!(
        observed[1],
        ("Event-v1".to_string(), "billing-update/1(abc)".to_string())
    );
}

#[tokio::test]
async fn test_done_row_never_reclaimed() {
    let store = Arc::new(MemoryQueue::new());
    let processor = TestProcessor::new("test/v1", |job| job.done());
    let runs = processor.runs.clone();
    let pool = WorkerPool::builder(store.clone())
        .config(config())
        .processor(processor)
        .build()
        .unwrap();
    let cancel = CancellationToken::new();

    enqueue(&store, "test/v1", "a", json!({})).await;

    assert!(pool.process_next("w", &cancel).await.unwrap());
    for _ in 0..3 {
        assert!(!pool.process_next("w", &cancel).await.unwrap());
    }
    assert_eq!(runs.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_failed_is_terminal() {
    let store = Arc::new(MemoryQueue::new());
    let pool = WorkerPool::builder(store.clone())
        .config(config())
        .processor(TestProcessor::new("test/v1", |job| {
            // malformed arguments are permanent
            match job.arguments::<Vec<u32>>() {
                Ok(_) => job.done(),
                Err(_) => job.failed(),
            }
        }))
        .build()
        .unwrap();
    let cancel = CancellationToken::new();

    enqueue(&store, "test/v1", "bad", json!({"not": "a list"})).await;
    assert!(pool.process_next("w", &cancel).await.unwrap());
    assert!(!pool.process_next("w", &cancel).await.unwrap());

    let row = store.by_reference("test/v1", "bad").await.unwrap();
    assert_eq!(row.successful, Some(false));
    assert!(row.finished_at.is_some());
    assert_eq!(row.error_count, 0);
}

#[tokio::test]
async fn test_unknown_job_type_fails_permanently() {
    let store = Arc::new(MemoryQueue::new());
    let pool = WorkerPool::builder(store.clone())
        .config(config())
        .processor(TestProcessor::new("test/v1", |job| job.done()))
        .build()
        .unwrap();
    let cancel = CancellationToken::new();

    enqueue(&store, "IntelTSC-v1", "vendor/serial", json!({})).await;
    assert!(pool.process_next("w", &cancel).await.unwrap());

    let row = store.by_reference("IntelTSC-v1", "vendor/serial").await.unwrap();
    assert_eq!(row.successful, Some(false));
    assert!(row.finished_at.is_some());
}

#[tokio::test]
async fn test_only_registered_types_leaves_unknown_rows() {
    let store = Arc::new(MemoryQueue::new());
    let mut cfg = config();
    cfg.only_registered_types = true;
    let pool = WorkerPool::builder(store.clone())
        .config(cfg)
        .processor(TestProcessor::new("test/v1", |job| job.done()))
        .build()
        .unwrap();
    let cancel = CancellationToken::new();

    enqueue(&store, "IntelTSC-v1", "vendor/serial", json!({})).await;
    assert!(!pool.process_next("w", &cancel).await.unwrap());

    let row = store.by_reference("IntelTSC-v1", "vendor/serial").await.unwrap();
    assert_eq!(row.status(), JobStatus::Queued);
}

#[tokio::test]
async fn test_backoff_increases_across_retries() {
    let store = Arc::new(MemoryQueue::new());
    let policy = Exponential::new(Duration::from_millis(1), Duration::from_millis(8));
    let pool = WorkerPool::builder(store.clone())
        .config(config())
        .processor(TestProcessor::new("test/v1", move |job| job.retry(&policy)))
        .build()
        .unwrap();
    let cancel = CancellationToken::new();

    enqueue(&store, "test/v1", "a", json!({})).await;

    let mut last = None;
    for n in 1..=6u32 {
        tokio::time::sleep(Duration::from_millis(10)).await;
        let before = Utc::now();
        assert!(pool.process_next("w", &cancel).await.unwrap());

        let row = store.by_reference("test/v1", "a").await.unwrap();
        assert_eq!(row.error_count, n);
        assert!(row.successful.is_none());

        let wait = ChronoDuration::from_std(policy.delay(n)).unwrap();
        assert!(row.next_run_at >= before + wait);
        if let Some(last) = last {
            assert!(row.next_run_at > last);
        }
        last = Some(row.next_run_at);
    }
}

#[tokio::test]
async fn test_claim_exclusivity() {
    let store = Arc::new(MemoryQueue::new());
    enqueue(&store, "test/v1", "contested", json!({})).await;

    let now = Utc::now();
    let mut claims = Vec::new();
    for i in 0..16 {
        let store = store.clone();
        claims.push(tokio::spawn(async move {
            store
                .claim(&format!("w{}", i), &[], now, Duration::from_secs(60))
                .await
                .unwrap()
        }));
    }

    let mut winners = 0;
    for claim in claims {
        if claim.await.unwrap().is_some() {
            winners += 1;
        }
    }
    assert_eq!(winners, 1);

    let row = store.by_reference("test/v1", "contested").await.unwrap();
    assert!(!row.is_eligible(now));
}

#[tokio::test]
async fn test_lease_recovery_after_crash() {
    let store = Arc::new(MemoryQueue::new());
    let lease = Duration::from_secs(300);
    let t0 = Utc::now() - ChronoDuration::minutes(10);
    store
        .enqueue(NewJob::new("test/v1", "a", json!([1, 2, 3, 4]), t0), t0)
        .await
        .unwrap();

    // crashed worker: claims and never releases
    let crashed = store.claim("crashed/0", &[], t0, lease).await.unwrap().unwrap();
    assert!(store
        .claim("w", &[], t0 + ChronoDuration::minutes(4), lease)
        .await
        .unwrap()
        .is_none());

    let recovered = store
        .claim("w", &[], t0 + ChronoDuration::minutes(5), lease)
        .await
        .unwrap()
        .expect("lease expired");
    assert_eq!(recovered.id, crashed.id);
    assert_eq!(recovered.error_count, 0);
    assert_eq!(recovered.args, json!([1, 2, 3, 4]));
    assert_eq!(recovered.locked_by.as_deref(), Some("w"));

    // the crashed worker can no longer write its outcome
    let mut stale = crashed;
    stale.successful = Some(true);
    stale.finished_at = Some(Utc::now());
    assert!(matches!(
        store.release(&stale).await,
        Err(QueueError::LockLost(_))
    ));
}

#[tokio::test]
async fn test_missing_outcome_leaves_lease() {
    let store = Arc::new(MemoryQueue::new());
    let pool = WorkerPool::builder(store.clone())
        .config(config())
        .processor(TestProcessor::new("test/v1", |_job| {}))
        .processor(Arc::new(PanicProcessor))
        .build()
        .unwrap();
    let cancel = CancellationToken::new();

    enqueue(&store, "test/v1", "silent", json!({})).await;
    enqueue(&store, "panic/v1", "boom", json!({})).await;

    assert!(pool.process_next("w", &cancel).await.unwrap());
    assert!(pool.process_next("w", &cancel).await.unwrap());
    assert!(!pool.process_next("w", &cancel).await.unwrap());

    for (ty, reference) in [("test/v1", "silent"), ("panic/v1", "boom")] {
        let row = store.by_reference(ty, reference).await.unwrap();
        assert_eq!(row.status(), JobStatus::Running);
        assert!(row.successful.is_none());
        assert_eq!(row.error_count, 0);
    }
}

#[tokio::test]
async fn test_pool_drains_queue() {
    let store = Arc::new(MemoryQueue::new());
    let policy = Exponential::new(Duration::from_millis(5), Duration::from_millis(20));
    let processor = TestProcessor::new("test/v1", move |job| {
        let n: u32 = job.arguments().unwrap();
        match (n % 3, job.error_count()) {
            (0, _) => job.done(),
            (1, 0) => job.retry(&policy),
            (1, _) => job.done(),
            _ => job.failed(),
        }
    });

    let pool = WorkerPool::builder(store.clone())
        .workers(4, Duration::from_millis(5))
        .instance_name("drain")
        .processor(processor)
        .build()
        .unwrap();

    for n in 0..30u32 {
        enqueue(&store, "test/v1", &format!("job-{}", n), json!(n)).await;
    }

    let cancel = CancellationToken::new();
    let handle = {
        let pool = pool.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { pool.start(cancel).await })
    };

    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let pending = store
            .list(&warden_queue::JobFilter {
                limit: 100,
                ..Default::default()
            })
            .await
            .unwrap()
            .into_iter()
            .filter(|row| row.successful.is_none())
            .count();
        if pending == 0 {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "queue not drained");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    cancel.cancel();
    handle.await.unwrap().unwrap();

    for n in 0..30u32 {
        let row = store
            .by_reference("test/v1", &format!("job-{}", n))
            .await
            .unwrap();
        assert_eq!(row.successful, Some(n % 3 != 2));
        assert_eq!(row.error_count, u32::from(n % 3 == 1));
        assert!(row.locked_by.is_none());
    }
}

#[tokio::test]
async fn test_waker_wakes_idle_worker() {
    let store = Arc::new(MemoryQueue::new());
    let processor = TestProcessor::new("test/v1", |job| job.done());
    let runs = processor.runs.clone();
    let pool = WorkerPool::builder(store.clone())
        .workers(1, Duration::from_secs(3600))
        .instance_name("wake")
        .processor(processor)
        .build()
        .unwrap();

    let cancel = CancellationToken::new();
    let handle = {
        let pool = pool.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { pool.start(cancel).await })
    };

    // let the worker find an empty queue and go idle
    tokio::time::sleep(Duration::from_millis(50)).await;
    enqueue(&store, "test/v1", "a", json!({})).await;
    pool.waker().notify_one();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while runs.load(Ordering::SeqCst) == 0 {
        assert!(tokio::time::Instant::now() < deadline, "worker not woken");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    cancel.cancel();
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_shutdown_reaches_running_processor() {
    struct Waiting;

    #[async_trait]
    impl Processor for Waiting {
        fn job_type(&self) -> &str {
            "wait/v1"
        }

        async fn run(&self, ctx: &JobContext, job: &mut JobHandle) {
            ctx.cancelled().await;
            job.retry_after(Duration::from_secs(1));
        }
    }

    let store = Arc::new(MemoryQueue::new());
    let pool = WorkerPool::builder(store.clone())
        .workers(1, Duration::from_millis(5))
        .instance_name("shutdown")
        .processor(Arc::new(Waiting))
        .build()
        .unwrap();
    enqueue(&store, "wait/v1", "a", json!({})).await;

    let cancel = CancellationToken::new();
    let handle = {
        let pool = pool.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { pool.start(cancel).await })
    };

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while store.by_reference("wait/v1", "a").await.unwrap().status() != JobStatus::Running {
        assert!(tokio::time::Instant::now() < deadline, "job not claimed");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    cancel.cancel();
    handle.await.unwrap().unwrap();

    let row = store.by_reference("wait/v1", "a").await.unwrap();
    assert_eq!(row.error_count, 1);
    assert!(row.successful.is_none());
    assert!(row.locked_by.is_none());
}

#[tokio::test]
async fn test_builder_rejects_bad_options() {
    let store: Arc<dyn JobStore> = Arc::new(MemoryQueue::new());

    let dup = WorkerPool::builder(store.clone())
        .processor(TestProcessor::new("a", |job| job.done()))
        .processor(TestProcessor::new("a", |job| job.done()))
        .build();
    assert!(matches!(dup, Err(QueueError::DuplicateProcessor(_))));

    let zero = WorkerPool::builder(store.clone())
        .workers(0, Duration::from_secs(1))
        .build();
    assert!(matches!(zero, Err(QueueError::InvalidConfig(_))));

    let lease = WorkerPool::builder(store.clone()).lease(Duration::ZERO).build();
    assert!(lease.is_err());

    let name = WorkerPool::builder(store.clone()).instance_name("").build();
    assert!(name.is_err());

    let mut cfg = WorkerConfig::default();
    cfg.only_registered_types = true;
    let nothing_to_claim = WorkerPool::builder(store.clone()).config(cfg).build();
    assert!(matches!(nothing_to_claim, Err(QueueError::InvalidConfig(_))));

    assert!(WorkerPool::builder(store).instance_name("a").build().is_ok());
}

#[tokio::test]
async fn test_observer_panic_does_not_stop_pool() {
    let store = Arc::new(MemoryQueue::new());
    let processor = TestProcessor::new("test/v1", |job| job.done());
    let runs = processor.runs.clone();
    let pool = WorkerPool::builder(store.clone())
        .workers(2, Duration::from_millis(5))
        .instance_name("observer")
        .processor(processor)
        .observer(Arc::new(FnObserver(|_: &str, _: &str| {
            panic!("observer bug");
        })))
        .build()
        .unwrap();

    enqueue(&store, "test/v1", "first", json!({})).await;

    let cancel = CancellationToken::new();
    let handle = {
        let pool = pool.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { pool.start(cancel).await })
    };

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while runs.load(Ordering::SeqCst) < 1 {
        assert!(tokio::time::Instant::now() < deadline, "first job not run");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    // the pool keeps serving after the hook blew up
    enqueue(&store, "test/v1", "second", json!({})).await;
    while runs.load(Ordering::SeqCst) < 2 {
        assert!(tokio::time::Instant::now() < deadline, "second job not run");
        assert!(!handle.is_finished(), "pool stopped");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    for reference in ["first", "second"] {
        let row = store.by_reference("test/v1", reference).await.unwrap();
        assert_eq!(row.successful, Some(true));
    }

    cancel.cancel();
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_late_release_cannot_reopen_finished_job() {
    let store = Arc::new(MemoryQueue::new());
    let pool = WorkerPool::builder(store.clone())
        .config(config())
        .processor(TestProcessor::new("test/v1", |job| job.done()))
        .build()
        .unwrap();
    let cancel = CancellationToken::new();

    let t0 = Utc::now() - ChronoDuration::minutes(10);
    store
        .enqueue(NewJob::new("test/v1", "slow", json!({}), t0), t0)
        .await
        .unwrap();
    let claimed = store
        .claim("crashed/0", &[], t0, Duration::from_secs(1))
        .await
        .unwrap()
        .unwrap();
    let mut late = JobHandle::new(claimed);

    // lease expired, another worker finishes the job
    assert!(pool.process_next("test/0", &cancel).await.unwrap());

    late.retry_after(Duration::ZERO);
    assert!(matches!(
        store.release(&late.into_row()).await,
        Err(QueueError::LockLost(_))
    ));

    let row = store.by_reference("test/v1", "slow").await.unwrap();
    assert_eq!(row.successful, Some(true));
    assert_eq!(row.error_count, 0);
    assert!(!pool.process_next("test/0", &cancel).await.unwrap());
}
