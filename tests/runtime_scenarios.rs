use portal_cache::CacheBackend;
use portal_config::{AppConfig, BatchConfig, CacheConfig, PoolConfig, TaskQueueConfig};
use portal_domain::{OutboundMessage, TaskPriority, TaskStatus, TaskType, WorkerError};
use portal_queue::to_payload;
use portal_testing_utils::{
    upload_items, InMemoryDatastore, InMemoryStorage, RecordingMessaging, RecordingRecordUpdater,
    TestEnv,
};
use portal_workers::{Collaborators, HealthStatus, WorkerRuntime};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

struct Fixture {
    messaging: Arc<RecordingMessaging>,
    storage: InMemoryStorage,
    datastore: InMemoryDatastore,
    records: Arc<RecordingRecordUpdater>,
}

impl Fixture {
    fn new() -> Self {
        Self {
            messaging: Arc::new(RecordingMessaging::new()),
            storage: InMemoryStorage::new(),
            datastore: InMemoryDatastore::new(),
            records: Arc::new(RecordingRecordUpdater::new()),
        }
    }

    fn collaborators(&self) -> Collaborators {
        Collaborators {
            messages: self.messaging.clone(),
            notifications: self.messaging.clone(),
            documents: self.messaging.clone(),
            uploads: self.messaging.clone(),
            storage: Arc::new(self.storage.clone()),
            records: Some(self.records.clone()),
            datastore: Arc::new(self.datastore.clone()),
        }
    }

    fn start(&self, config: AppConfig) -> WorkerRuntime {
        TestEnv::init_logging();
        WorkerRuntime::start(config, self.collaborators()).unwrap()
    }
}

fn test_config() -> AppConfig {
    AppConfig {
        pool: PoolConfig {
            pool_size: 2,
            max_overflow: 1,
            acquire_timeout_seconds: 1,
            retry_attempts: 2,
            retry_delay_ms: 10,
            ..PoolConfig::default()
        },
        cache: CacheConfig::in_memory(),
        task_queue: TaskQueueConfig {
            max_workers: 2,
            backoff_unit_ms: 10,
            poll_interval_ms: 10,
            group_message_delay_ms: 1,
            group_notification_delay_ms: 1,
            shutdown_timeout_seconds: 5,
            ..TaskQueueConfig::default()
        },
        batch: BatchConfig {
            max_workers: 2,
            item_timeout_seconds: 5,
            download_dir: None,
        },
        ..AppConfig::default()
    }
}

fn message(to: &str) -> OutboundMessage {
    OutboundMessage {
        phone_number: to.to_string(),
        message: "Your policy documents are ready".to_string(),
        media_urls: vec![],
    }
}

#[test]
fn test_enqueue_and_poll_task_result() {
    let fixture = Fixture::new();
    let runtime = fixture.start(test_config());

    let task_id = runtime
        .enqueue_task(
            TaskType::MessageSend,
            to_payload(&message("+15550001")).unwrap(),
            TaskPriority::High,
            None,
        )
        .unwrap();

    let result = TestEnv::wait_for_value(|| runtime.task_result(&task_id), Duration::from_secs(5))
        .expect("task did not finish");
    assert_eq!(result.status, TaskStatus::Completed);
    assert_eq!(result.attempts, 1);
    assert_eq!(fixture.messaging.messages().len(), 1);
    assert_eq!(runtime.task_status(&task_id), Some(TaskStatus::Completed));

    assert_eq!(runtime.remove_task_result(&task_id), Some(result));
    assert_eq!(runtime.task_result(&task_id), None);
    assert_eq!(runtime.task_status(&task_id), None);
}

#[test]
fn test_transient_provider_failure_is_retried() {
    let fixture = Fixture::new();
    fixture.messaging.fail_recipient("+15550002");
    let mut config = test_config();
    config.task_queue.backoff_unit_ms = 50;
    let runtime = fixture.start(config);

    let task_id = runtime
        .queue()
        .send_message_async(&message("+15550002"), TaskPriority::Medium, None)
        .unwrap();
    assert!(TestEnv::wait_for(
        || fixture.messaging.call_count() >= 2,
        Duration::from_secs(5)
    ));
    fixture.messaging.recover_recipient("+15550002");

    let result = TestEnv::wait_for_value(|| runtime.task_result(&task_id), Duration::from_secs(5))
        .expect("task did not finish");
    assert_eq!(result.status, TaskStatus::Completed);
    assert!(result.attempts >= 2);
    assert!(runtime.queue().dead_letters().is_empty());
}

#[test]
fn test_cache_and_rate_limit_boundary() {
    let fixture = Fixture::new();
    let runtime = fixture.start(test_config());

    let profile = json!({ "name": "Jane Doe", "policies": [1, 2, 3] });
    assert!(runtime.cache_set("profile:1", &profile, Some(Duration::from_secs(60))));
    assert_eq!(runtime.cache_get("profile:1"), Some(profile));
    assert_eq!(runtime.cache_increment("visits", 2, None), 2);
    assert!(runtime.cache_delete("profile:1"));
    assert_eq!(runtime.cache_get("profile:1"), None);

    for _ in 0..5 {
        assert!(!runtime.is_rate_limited("client-9", 5, 60));
    }
    assert!(runtime.is_rate_limited("client-9", 5, 60));
    assert!(!runtime.is_rate_limited("client-10", 5, 60));
}

#[test]
fn test_pool_acquire_respects_overflow_limit() {
    let fixture = Fixture::new();
    let runtime = fixture.start(test_config());

    let first = runtime.pool_acquire(None).unwrap();
    let second = runtime.pool_acquire(None).unwrap();
    let overflow = runtime.pool_acquire(None).unwrap();
    assert_eq!(runtime.datastore().stats().checked_out, 3);

    assert!(matches!(
        runtime.pool_acquire(Some(Duration::ZERO)),
        Err(WorkerError::PoolExhausted { .. })
    ));

    drop(first);
    second.release();
    overflow.release();
    assert_eq!(runtime.datastore().stats().checked_out, 0);
}

#[test]
fn test_execute_uses_pooled_session() {
    let fixture = Fixture::new();
    let runtime = fixture.start(test_config());

    let response = runtime.execute(&json!({ "table": "policies", "id": 7 })).unwrap();
    assert_eq!(response["echo"]["id"], json!(7));
    assert_eq!(fixture.datastore.executed(), 1);
}

#[test]
fn test_batch_upload_through_runtime() {
    let fixture = Fixture::new();
    let runtime = fixture.start(test_config());

    let batch_id = runtime.submit_uploads(upload_items(3), None).unwrap();
    let result = TestEnv::wait_for_value(|| runtime.batch_result(&batch_id), Duration::from_secs(5))
        .expect("batch did not finish");
    assert_eq!((result.successful, result.failed), (3, 0));
    assert_eq!(fixture.storage.files().len(), 3);
    assert!(runtime.require_batch_result("batch_upload_unknown").is_err());

    assert_eq!(runtime.take_batch_result(&batch_id).map(|b| b.successful), Some(3));
    assert!(runtime.batch_result(&batch_id).is_none());
}

#[test]
fn test_health_report_states() {
    let fixture = Fixture::new();
    let mut config = test_config();
    config.pool = PoolConfig {
        pool_size: 10,
        max_overflow: 0,
        acquire_timeout_seconds: 1,
        ..PoolConfig::default()
    };
    let runtime = fixture.start(config);

    let report = runtime.health();
    assert_eq!(report.status, HealthStatus::Healthy);
    assert_eq!(report.cache_backend, CacheBackend::Memory);
    assert_eq!(report.pool.checked_out, 0);

    // 9/10 个连接被占用
    let held: Vec<_> = (0..9).map(|_| runtime.pool_acquire(None).unwrap()).collect();
    assert_eq!(runtime.health().status, HealthStatus::Degraded);
    drop(held);

    fixture.datastore.set_unhealthy(true);
    assert_eq!(runtime.health().status, HealthStatus::Unhealthy);
    fixture.datastore.set_unhealthy(false);
    assert_eq!(runtime.health().status, HealthStatus::Healthy);
}

#[test]
fn test_startup_fails_without_datastore() {
    let fixture = Fixture::new();
    fixture.datastore.refuse_connections(true);
    assert!(matches!(
        WorkerRuntime::start(test_config(), fixture.collaborators()),
        Err(WorkerError::HandleCreation(_))
    ));
}

#[test]
fn test_invalid_config_is_rejected() {
    let fixture = Fixture::new();
    let mut config = test_config();
    config.task_queue.max_workers = 0;
    assert!(matches!(
        WorkerRuntime::start(config, fixture.collaborators()),
        Err(WorkerError::Configuration(_))
    ));
}

#[test]
fn test_shutdown_stops_every_component() {
    let fixture = Fixture::new();
    let runtime = fixture.start(test_config());
    runtime.shutdown();
    runtime.shutdown();

    assert!(!runtime.is_running());
    assert!(matches!(
        runtime.enqueue_task(
            TaskType::MessageSend,
            to_payload(&message("+15550003")).unwrap(),
            TaskPriority::Low,
            None,
        ),
        Err(WorkerError::Shutdown(_))
    ));
    assert!(matches!(
        runtime.submit_uploads(upload_items(1), None),
        Err(WorkerError::Shutdown(_))
    ));
    assert!(matches!(
        runtime.pool_acquire(Some(Duration::ZERO)),
        Err(WorkerError::Shutdown(_))
    ));
    assert_eq!(runtime.health().status, HealthStatus::Unhealthy);
}
