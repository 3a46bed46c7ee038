#![cfg(feature = "memory")]

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio_stream::StreamExt;
use tracing_test::traced_test;

use carbon_queue::{
    handler_fn, json_handler, presets, EngineConfig, JobError, JobEvent, JobId, JobOptions, JobRecord, JobState,
    LiveMetrics, MemoryStore, QueueEngine, QueueOptions, RetryPolicy,
};

fn fast_config() -> EngineConfig {
    EngineConfig {
        lease_duration: Duration::from_secs(5),
        heartbeat_interval: Duration::from_millis(500),
        reaper_interval: Duration::from_millis(100),
        poll_interval_min: Duration::from_millis(5),
        poll_interval_max: Duration::from_millis(20),
        store_retry_min: Duration::from_millis(5),
        store_retry_max: Duration::from_millis(50),
        ..EngineConfig::default()
    }
}

async fn eventually<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

#[derive(Debug, Serialize, Deserialize)]
struct Verification {
    seq: u32,
    email: String,
}

/// S1. Five emails, concurrency 2, the third always fails and exhausts its attempts
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_email_queue_scenario() {
    let calls: Arc<Mutex<HashMap<u32, Vec<Instant>>>> = Arc::default();
    let recorder = calls.clone();

    let engine = QueueEngine::builder(MemoryStore::new())
        .config(fast_config())
        .queue(
            presets::EMAIL,
            QueueOptions::default()
                .with_concurrency(2)
                .with_retry(RetryPolicy::exponential(3, Duration::from_millis(1000))),
            json_handler(move |job: Verification| {
                let recorder = recorder.clone();
                async move {
                    recorder.lock().entry(job.seq).or_default().push(Instant::now());
                    if job.seq == 3 {
                        Err(JobError::retryable(format!("smtp rejected {}", job.email)))
                    } else {
                        Ok(())
                    }
                }
            }),
        )
        .build()
        .unwrap();
    engine.start().unwrap();

    let mut ids = HashMap::new();
    for seq in 1..=5 {
        let payload = Verification {
            seq,
            email: format!("user{seq}@example.com"),
        };
        let id = engine
            .enqueue_json(presets::EMAIL, &payload, JobOptions::named("verification"))
            .await
            .unwrap();
        ids.insert(seq, id);
    }

    let admin = engine.admin();
    let settled = eventually(Duration::from_secs(10), || {
        let admin = admin.clone();
        async move {
            let stats = admin.get_queue_stats(presets::EMAIL).await.unwrap();
            stats.completed == 4 && stats.failed == 1
        }
    })
    .await;
    assert!(settled, "queue did not settle");
    engine.shutdown().await.unwrap();

    let failed = admin.list_failed_jobs(presets::EMAIL, 10, 0).await.unwrap();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].id, ids[&3]);
    assert_eq!(failed[0].attempts, 3);
    assert_eq!(failed[0].last_error.as_deref(), Some("smtp rejected user3@example.com"));

    let calls = calls.lock().clone();
    for seq in [1, 2, 4, 5] {
        assert_eq!(calls[&seq].len(), 1);
        let record = admin.get_job(presets::EMAIL, &ids[&seq]).await.unwrap();
        assert_eq!(record.state, JobState::Completed);
        assert!(record.last_error.is_none());
    }

    let third = &calls[&3];
    assert_eq!(third.len(), 3);
    let first_gap = third[1] - third[0];
    let second_gap = third[2] - third[1];
    assert!(first_gap >= Duration::from_millis(990), "first gap {first_gap:?}");
    assert!(first_gap < Duration::from_millis(1800), "first gap {first_gap:?}");
    assert!(second_gap >= Duration::from_millis(1990), "second gap {second_gap:?}");
    assert!(second_gap < Duration::from_millis(2800), "second gap {second_gap:?}");
}

/// S2. A hung handler is cut off by the job timeout and retried after its backoff
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_timeout_counts_as_retryable_failure() {
    let attempts = Arc::new(AtomicU32::new(0));
    let counter = attempts.clone();

    let engine = QueueEngine::builder(MemoryStore::new())
        .config(fast_config())
        .queue(
            presets::PDF_GENERATION,
            QueueOptions::default()
                .with_timeout(Duration::from_millis(100))
                .with_retry(RetryPolicy::fixed(3, Duration::from_millis(200))),
            handler_fn(move |_job: JobRecord| {
                let counter = counter.clone();
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                        tokio::time::sleep(Duration::from_secs(30)).await;
                    }
                    Ok(())
                }
            }),
        )
        .build()
        .unwrap();
    let mut events = engine.events().stream();
    engine.start().unwrap();

    let id = engine
        .enqueue(presets::PDF_GENERATION, b"{}".to_vec(), JobOptions::named("report"))
        .await
        .unwrap();

    let failure = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Some(JobEvent::Failed { error, retry_at, .. }) = events.next().await {
                return (error, retry_at);
            }
        }
    })
    .await
    .unwrap();
    assert!(failure.0.contains("timed out"));
    assert!(failure.1.is_some());

    let admin = engine.admin();
    let completed = eventually(Duration::from_secs(5), || {
        let admin = admin.clone();
        let id = id.clone();
        async move {
            admin.get_job(presets::PDF_GENERATION, &id).await.unwrap().state == JobState::Completed
        }
    })
    .await;
    assert!(completed);
    assert_eq!(attempts.load(Ordering::SeqCst), 2);
    engine.shutdown().await.unwrap();
}

/// S3. A job left active by a dead worker is requeued by the reaper and runs again
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_reaper_recovers_crashed_claim() {
    let store = MemoryStore::new();
    let runs = Arc::new(AtomicU32::new(0));
    let counter = runs.clone();

    let engine = QueueEngine::builder(store.clone())
        .config(fast_config())
        .queue(
            presets::DATA_EXPORT,
            QueueOptions::default().with_retry(RetryPolicy::fixed(3, Duration::from_millis(50))),
            handler_fn(move |_job: JobRecord| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            }),
        )
        .build()
        .unwrap();

    let id = engine
        .enqueue(presets::DATA_EXPORT, vec![], JobOptions::named("user-data-export"))
        .await
        .unwrap();

    // A worker claims and then dies without reporting
    let crashed = engine.broker().claim(presets::DATA_EXPORT).await.unwrap().unwrap();
    assert_eq!(crashed.id(), &id);
    store.force_lease_expiry(&id);

    engine.start().unwrap();
    let admin = engine.admin();
    let recovered = eventually(Duration::from_secs(5), || {
        let admin = admin.clone();
        let id = id.clone();
        async move { admin.get_job(presets::DATA_EXPORT, &id).await.unwrap().state == JobState::Completed }
    })
    .await;
    assert!(recovered);
    engine.shutdown().await.unwrap();

    let record = admin.get_job(presets::DATA_EXPORT, &id).await.unwrap();
    assert_eq!(record.attempts, 2);
    assert_eq!(runs.load(Ordering::SeqCst), 1);
}

/// S4. Events of one job arrive in transition order
#[tokio::test]
async fn test_event_order_for_single_job() {
    let seen: Arc<Mutex<Vec<(JobId, &'static str)>>> = Arc::default();
    let sink = seen.clone();

    let engine = QueueEngine::builder(MemoryStore::new())
        .config(fast_config())
        .queue(
            presets::NOTIFICATION,
            QueueOptions::default().with_retry(RetryPolicy::fixed(2, Duration::from_millis(20))),
            handler_fn(|job: JobRecord| async move {
                if job.attempts == 1 {
                    Err(JobError::retryable("push gateway busy"))
                } else {
                    Ok(())
                }
            }),
        )
        .build()
        .unwrap();
    engine
        .events()
        .subscribe_fn(move |event| sink.lock().push((event.job_id().clone(), event.event_name())));
    engine.start().unwrap();

    let id = engine
        .enqueue(presets::NOTIFICATION, vec![], JobOptions::new())
        .await
        .unwrap();
    let done = eventually(Duration::from_secs(5), || {
        let seen = seen.clone();
        async move { seen.lock().iter().any(|(_, kind)| *kind == "completed") }
    })
    .await;
    assert!(done);
    engine.shutdown().await.unwrap();

    let kinds: Vec<&str> = seen
        .lock()
        .iter()
        .filter(|(job, _)| job == &id)
        .map(|(_, kind)| *kind)
        .collect();
    assert_eq!(kinds, vec!["waiting", "active", "failed", "active", "completed"]);
}

/// S5. A panicking subscriber or handler never breaks the pipeline
#[tokio::test]
async fn test_panics_are_isolated() {
    let metrics = Arc::new(LiveMetrics::new());

    let engine = QueueEngine::builder(MemoryStore::new())
        .config(fast_config())
        .subscriber(metrics.clone())
        .queue(
            presets::EMISSION_CALCULATION,
            QueueOptions::default().with_retry(RetryPolicy::fixed(2, Duration::from_millis(10))),
            handler_fn(|job: JobRecord| async move {
                if job.attempts == 1 {
                    panic!("aggregate overflow");
                }
                Ok(())
            }),
        )
        .build()
        .unwrap();
    engine.events().subscribe_fn(|_| panic!("subscriber bug"));
    engine.start().unwrap();

    let id = engine
        .enqueue(presets::EMISSION_CALCULATION, vec![], JobOptions::new())
        .await
        .unwrap();
    let admin = engine.admin();
    let done = eventually(Duration::from_secs(5), || {
        let admin = admin.clone();
        let id = id.clone();
        async move { admin.get_job(presets::EMISSION_CALCULATION, &id).await.unwrap().state == JobState::Completed }
    })
    .await;
    assert!(done);
    engine.shutdown().await.unwrap();

    let counters = metrics.queue(presets::EMISSION_CALCULATION);
    assert_eq!(counters.retried, 1);
    assert_eq!(counters.completed, 1);
    assert_eq!(counters.failed, 0);
}

/// S6. An undecodable payload fails terminally after one attempt
#[tokio::test]
async fn test_bad_payload_is_terminal() {
    let engine = QueueEngine::builder(MemoryStore::new())
        .config(fast_config())
        .queue(
            presets::EMAIL,
            presets::default_queue_options(),
            json_handler(|_job: Verification| async move { Ok(()) }),
        )
        .build()
        .unwrap();
    engine.start().unwrap();

    let id = engine
        .enqueue(presets::EMAIL, b"not json".to_vec(), JobOptions::named("verification"))
        .await
        .unwrap();
    let admin = engine.admin();
    let failed = eventually(Duration::from_secs(5), || {
        let admin = admin.clone();
        async move { admin.get_queue_stats(presets::EMAIL).await.unwrap().failed == 1 }
    })
    .await;
    assert!(failed);
    engine.shutdown().await.unwrap();

    let record = admin.get_job(presets::EMAIL, &id).await.unwrap();
    assert_eq!(record.attempts, 1);
    assert!(record.last_error.unwrap().contains("deserialize"));
}

/// S7. Every job settles across independent queues
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_liveness_across_queues() {
    let flaky = || {
        handler_fn(|job: JobRecord| async move {
            if job.attempts == 1 && job.payload.first() == Some(&b'f') {
                Err(JobError::retryable("first attempt flakes"))
            } else {
                Ok(())
            }
        })
    };
    let options = || {
        QueueOptions::default()
            .with_concurrency(3)
            .with_retry(RetryPolicy::fixed(3, Duration::from_millis(10)))
    };

    let mut builder = QueueEngine::builder(MemoryStore::new()).config(fast_config());
    for queue in presets::STANDARD_QUEUES {
        builder = builder.queue(queue, options(), flaky());
    }
    let engine = builder.build().unwrap();
    engine.start().unwrap();

    for (i, queue) in presets::STANDARD_QUEUES.iter().cycle().take(40).enumerate() {
        let payload = if i % 2 == 0 { b"flaky".to_vec() } else { b"ok".to_vec() };
        engine.enqueue(queue, payload, JobOptions::new()).await.unwrap();
    }

    let admin = engine.admin();
    let settled = eventually(Duration::from_secs(10), || {
        let admin = admin.clone();
        async move {
            let mut completed = 0;
            for queue in admin.list_queues() {
                let stats = admin.get_queue_stats(&queue).await.unwrap();
                if stats.pending() > 0 {
                    return false;
                }
                completed += stats.completed;
            }
            completed == 40
        }
    })
    .await;
    assert!(settled);
    engine.shutdown().await.unwrap();
}

/// S8. Shutdown waits for the in-flight job to report
#[tokio::test]
async fn test_graceful_shutdown_drains_in_flight_job() {
    let started = Arc::new(AtomicU32::new(0));
    let flag = started.clone();

    let engine = QueueEngine::builder(MemoryStore::new())
        .config(fast_config())
        .queue(
            presets::PDF_GENERATION,
            QueueOptions::default(),
            handler_fn(move |_job: JobRecord| {
                let flag = flag.clone();
                async move {
                    flag.store(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(200)).await;
                    Ok(())
                }
            }),
        )
        .build()
        .unwrap();
    engine.start().unwrap();

    let id = engine
        .enqueue(presets::PDF_GENERATION, vec![], JobOptions::new())
        .await
        .unwrap();
    assert!(eventually(Duration::from_secs(5), || {
        let started = started.clone();
        async move { started.load(Ordering::SeqCst) == 1 }
    })
    .await);

    engine.shutdown().await.unwrap();
    let record = engine.admin().get_job(presets::PDF_GENERATION, &id).await.unwrap();
    assert_eq!(record.state, JobState::Completed);

    // No slot claims after shutdown
    let late = engine
        .enqueue(presets::PDF_GENERATION, vec![], JobOptions::new())
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    let record = engine.admin().get_job(presets::PDF_GENERATION, &late).await.unwrap();
    assert_eq!(record.state, JobState::Waiting);
}

/// S9. Lifecycle events are logged in the standard wording
#[traced_test]
#[tokio::test]
async fn test_lifecycle_logging() {
    let engine = QueueEngine::builder(MemoryStore::new())
        .config(fast_config())
        .queue(
            presets::EMAIL,
            presets::default_queue_options(),
            handler_fn(|_job: JobRecord| async { Ok(()) }),
        )
        .build()
        .unwrap();

    // Drive the broker from this task so every log line lands in the test span
    let broker = engine.broker();
    let id = broker
        .enqueue(presets::EMAIL, vec![], JobOptions::named("reset-password"))
        .await
        .unwrap();
    let job = broker.claim(presets::EMAIL).await.unwrap().unwrap();
    broker.complete(&job).await.unwrap();

    engine.start().unwrap();
    engine.shutdown().await.unwrap();

    assert!(logs_contain(&format!("Job {id} in queue email waiting")));
    assert!(logs_contain(&format!("Job {id} in queue email started processing")));
    assert!(logs_contain(&format!("Job {id} in queue email completed")));
    assert!(logs_contain("All queues initialized successfully"));
    assert!(logs_contain("Queue email closed successfully"));
}

/// S10. Per-job event order holds while many slots race on one queue
#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_event_order_under_contention() {
    const JOBS: usize = 1000;
    let seen: Arc<Mutex<HashMap<JobId, Vec<&'static str>>>> = Arc::default();
    let sink = seen.clone();

    let engine = QueueEngine::builder(MemoryStore::new())
        .config(fast_config())
        .log_events(false)
        .queue(
            presets::NOTIFICATION,
            QueueOptions::default()
                .with_concurrency(8)
                .with_retry(RetryPolicy::fixed(3, Duration::ZERO)),
            handler_fn(|job: JobRecord| async move {
                if job.attempts < 3 {
                    Err(JobError::retryable("push gateway busy"))
                } else {
                    Ok(())
                }
            }),
        )
        .build()
        .unwrap();
    engine.events().subscribe_fn(move |event| {
        sink.lock()
            .entry(event.job_id().clone())
            .or_default()
            .push(event.event_name());
    });
    engine.start().unwrap();

    for _ in 0..JOBS {
        engine
            .enqueue(presets::NOTIFICATION, vec![], JobOptions::new())
            .await
            .unwrap();
    }

    let admin = engine.admin();
    let settled = eventually(Duration::from_secs(30), || {
        let admin = admin.clone();
        async move { admin.get_queue_stats(presets::NOTIFICATION).await.unwrap().completed == JOBS }
    })
    .await;
    assert!(settled, "queue did not settle");
    engine.shutdown().await.unwrap();

    let expected = vec!["waiting", "active", "failed", "active", "failed", "active", "completed"];
    let seen = seen.lock();
    assert_eq!(seen.len(), JOBS);
    for (id, kinds) in seen.iter() {
        assert_eq!(kinds, &expected, "events out of order for job {id}");
    }
}

struct FlagOnDrop(Arc<AtomicBool>);

impl Drop for FlagOnDrop {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

/// S11. A worker whose claim was reaped stops its handler at the next heartbeat
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_fenced_worker_abandons_handler() {
    let store = MemoryStore::new();
    let abandoned = Arc::new(AtomicBool::new(false));
    let runs = Arc::new(AtomicU32::new(0));
    let (flag, counter) = (abandoned.clone(), runs.clone());

    let engine = QueueEngine::builder(store.clone())
        .config(EngineConfig {
            heartbeat_interval: Duration::from_secs(1),
            reaper_interval: Duration::from_secs(60),
            ..fast_config()
        })
        .queue(
            presets::EMISSION_CALCULATION,
            QueueOptions::default().with_retry(RetryPolicy::fixed(3, Duration::from_millis(10))),
            handler_fn(move |job: JobRecord| {
                let flag = flag.clone();
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    if job.attempts == 1 {
                        let _guard = FlagOnDrop(flag);
                        tokio::time::sleep(Duration::from_secs(30)).await;
                    }
                    Ok(())
                }
            }),
        )
        .build()
        .unwrap();
    engine.start().unwrap();

    let id = engine
        .enqueue(presets::EMISSION_CALCULATION, vec![], JobOptions::named("recalculate"))
        .await
        .unwrap();

    let admin = engine.admin();
    let in_state = |state: JobState| {
        let admin = admin.clone();
        let id = id.clone();
        async move { admin.get_job(presets::EMISSION_CALCULATION, &id).await.unwrap().state == state }
    };
    assert!(eventually(Duration::from_secs(5), || in_state(JobState::Active)).await);

    store.force_lease_expiry(&id);
    assert_eq!(engine.reap_stalled().await, 1);

    let stopped = eventually(Duration::from_secs(5), || {
        let abandoned = abandoned.clone();
        async move { abandoned.load(Ordering::SeqCst) }
    })
    .await;
    assert!(stopped, "handler kept running after its claim was reaped");

    assert!(eventually(Duration::from_secs(5), || in_state(JobState::Completed)).await);
    engine.shutdown().await.unwrap();
    assert_eq!(runs.load(Ordering::SeqCst), 2);
}
