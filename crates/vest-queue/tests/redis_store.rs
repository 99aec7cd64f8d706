//! Redis-backed queue tests.
//!
//! Run with a reachable Redis (`REDIS_URL`, default `redis://localhost:6379`):
//!   cargo test -p vest-queue --test redis_store -- --ignored

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use vest_queue::{
    JobOptionsOverride, JobState, QueueConfig, QueueError, QueueName, QueueRegistry, StoreBackend,
};

const LOCK: Duration = Duration::from_secs(30);

/// Registry over a key prefix no other test run uses.
async fn registry() -> QueueRegistry {
    dotenvy::dotenv().ok();
    let config = QueueConfig {
        key_prefix: format!("vest-test-{:08x}", rand::random::<u32>()),
        store: StoreBackend::Redis,
        ..QueueConfig::from_env()
    };
    let registry = QueueRegistry::from_config(config).expect("Failed to create registry");
    registry.initialize_queues().await.expect("Redis not reachable");
    registry
}

#[tokio::test]
#[ignore = "requires Redis"]
async fn test_enqueue_claim_complete() {
    let registry = registry().await;
    let queue = registry.get_queue(QueueName::Email);

    let id = queue.enqueue(json!({"to": "a@example.com"}), None).await.unwrap();
    assert_eq!(queue.get_stats().await.unwrap().waiting_count, 1);

    let lease = queue.claim("worker-1", LOCK).await.unwrap().expect("job available");
    assert_eq!(lease.id(), &id);
    assert_eq!(lease.attempt(), 1);
    assert!(queue.claim("worker-2", LOCK).await.unwrap().is_none());

    let job = queue.complete(lease, json!({"messageId": "m-1"})).await.unwrap();
    assert_eq!(job.state, JobState::Completed);
    assert_eq!(job.attempts_made, 1);

    let stats = queue.get_stats().await.unwrap();
    assert_eq!(stats.completed_count, 1);
    assert_eq!(stats.active_count, 0);

    registry.clear_queue("email").await.unwrap();
}

#[tokio::test]
#[ignore = "requires Redis"]
async fn test_concurrent_claims_are_exclusive() {
    let registry = Arc::new(registry().await);
    let queue = registry.get_queue(QueueName::DataExport);
    for n in 0..40 {
        queue.enqueue(json!({"n": n}), None).await.unwrap();
    }

    let mut handles = Vec::new();
    for w in 0..8 {
        let queue = queue.clone();
        handles.push(tokio::spawn(async move {
            let mut claimed = Vec::new();
            while let Some(lease) = queue.claim(&format!("worker-{}", w), LOCK).await.unwrap() {
                claimed.push(lease.id().clone());
                queue.complete(lease, json!(null)).await.unwrap();
            }
            claimed
        }));
    }

    let mut seen = HashSet::new();
    for handle in handles {
        for id in handle.await.unwrap() {
            assert!(seen.insert(id), "job claimed twice");
        }
    }
    assert_eq!(seen.len(), 40);

    registry.clear_queue("data-export").await.unwrap();
}

#[tokio::test]
#[ignore = "requires Redis"]
async fn test_retry_then_dead_letter() {
    let registry = registry().await;
    let queue = registry.get_queue(QueueName::DataImport);
    let options = JobOptionsOverride {
        attempts_allowed: Some(2),
        ..Default::default()
    };
    let id = queue.enqueue(json!({"file": "a.csv"}), Some(options)).await.unwrap();

    let lease = queue.claim("worker-1", LOCK).await.unwrap().unwrap();
    let job = queue.retry(lease, Duration::from_millis(10)).await.unwrap();
    assert_eq!(job.state, JobState::Delayed);
    assert_eq!(job.attempts_made, 1);

    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(queue.promote_delayed().await.unwrap(), 1);

    let lease = queue.claim("worker-1", LOCK).await.unwrap().unwrap();
    assert_eq!(lease.attempt(), 2);
    let entry = queue.fail(lease, "upstream returned 503").await.unwrap();
    assert_eq!(entry.job_id, id);
    assert_eq!(entry.attempts_made, 2);

    let dead = queue.dead_letters(10).await.unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].failed_reason, "upstream returned 503");

    registry.clear_queue("data-import").await.unwrap();
}

#[tokio::test]
#[ignore = "requires Redis"]
async fn test_stalled_job_is_requeued() {
    let registry = registry().await;
    let queue = registry.get_queue(QueueName::Notification);
    let id = queue.enqueue(json!({"userId": "u1"}), None).await.unwrap();

    let lease = queue
        .claim("crashed", Duration::from_millis(20))
        .await
        .unwrap()
        .unwrap();
    queue.abandon(lease);
    tokio::time::sleep(Duration::from_millis(50)).await;

    let report = queue.recover_stalled(1).await.unwrap();
    assert_eq!(report.requeued, vec![id.clone()]);

    let job = queue.get_job(&id).await.unwrap().unwrap();
    assert_eq!(job.state, JobState::Waiting);
    assert_eq!(job.attempts_made, 0);
    assert_eq!(job.stalled_count, 1);

    registry.clear_queue("notification").await.unwrap();
}

#[tokio::test]
#[ignore = "requires Redis"]
async fn test_lost_lock_rejects_completion() {
    let registry = registry().await;
    let queue = registry.get_queue(QueueName::Notification);
    queue.enqueue(json!({"userId": "u2"}), None).await.unwrap();

    let lease = queue
        .claim("slow", Duration::from_millis(20))
        .await
        .unwrap()
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    queue.recover_stalled(1).await.unwrap();

    let err = queue.complete(lease, json!(null)).await.unwrap_err();
    assert!(matches!(err, QueueError::LockLost(_)));

    registry.clear_queue("notification").await.unwrap();
}

#[tokio::test]
#[ignore = "requires Redis"]
async fn test_dedup_key_and_pause() {
    let registry = registry().await;
    let queue = registry.get_queue(QueueName::Email);
    let options = || {
        Some(JobOptionsOverride {
            dedup_key: Some("roi:1:2026-Q1:investor-1".to_string()),
            ..Default::default()
        })
    };

    let first = queue.enqueue(json!({"n": 1}), options()).await.unwrap();
    match queue.enqueue(json!({"n": 2}), options()).await {
        Err(QueueError::DuplicateJob(existing)) => assert_eq!(existing, first),
        other => panic!("expected duplicate, got {:?}", other),
    }

    queue.pause().await.unwrap();
    assert!(queue.claim("worker-1", LOCK).await.unwrap().is_none());
    let stats = queue.get_stats().await.unwrap();
    assert!(stats.is_paused);
    assert_eq!(stats.paused_count, 1);

    queue.resume().await.unwrap();
    assert!(queue.claim("worker-1", LOCK).await.unwrap().is_some());

    registry.clear_queue("email").await.unwrap();
}
