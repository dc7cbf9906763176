use crossbeam_channel::{bounded, unbounded};
use parking_lot::Mutex;
use portal_config::TaskQueueConfig;
use portal_domain::{
    Notification, OutboundMessage, Task, TaskCallback, TaskPayload, TaskPriority, TaskResult,
    TaskStatus, TaskType, WorkerError,
};
use portal_queue::{register_builtin, HandlerRegistry, MessagingPorts, TaskQueue};
use portal_testing_utils::{RecordingMessaging, TaskBuilder, TestEnv};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(5);

fn config(workers: usize) -> TaskQueueConfig {
    TaskQueueConfig {
        max_workers: workers,
        max_queue_size: 100,
        backoff_unit_ms: 1,
        poll_interval_ms: 10,
        group_message_delay_ms: 0,
        group_notification_delay_ms: 0,
        shutdown_timeout_seconds: 5,
        ..TaskQueueConfig::default()
    }
}

#[test]
fn test_drains_in_priority_order() {
    let (gate_tx, gate_rx) = bounded::<()>(0);
    let gate_rx = Mutex::new(gate_rx);
    let order = Arc::new(Mutex::new(Vec::new()));

    let handler_order = Arc::clone(&order);
    let mut registry = HandlerRegistry::new();
    registry.register_fn(TaskType::DocumentSend, move |_| {
        let _ = gate_rx.lock().recv_timeout(WAIT);
        Ok(Value::Null)
    });
    registry.register_fn(TaskType::MessageSend, move |task| {
        handler_order.lock().push(task.priority.level());
        Ok(Value::Null)
    });
    let queue = TaskQueue::start(config(1), registry).unwrap();

    // 唯一的工作线程先被阻塞，保证三个任务都已入队
    let (_, gate_done) = queue
        .enqueue_awaitable(TaskBuilder::new(TaskType::DocumentSend).build())
        .unwrap();
    assert!(TestEnv::wait_for(
        || queue.stats().active_workers == 1,
        WAIT
    ));

    let mut receivers = Vec::new();
    for level in [3, 1, 2] {
        let task = TaskBuilder::new(TaskType::MessageSend)
            .with_priority(TaskPriority::from_level(level))
            .build();
        receivers.push(queue.enqueue_awaitable(task).unwrap().1);
    }
    assert_eq!(queue.stats().queue_sizes, [1, 1, 1]);

    gate_tx.send(()).unwrap();
    gate_done.recv_timeout(WAIT).unwrap();
    for rx in receivers {
        rx.recv_timeout(WAIT).unwrap();
    }
    assert_eq!(*order.lock(), vec![1, 2, 3]);
}

#[test]
fn test_terminal_failure_after_max_retries_plus_one() {
    let attempts = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::clone(&attempts);
    let mut registry = HandlerRegistry::new();
    registry.register_fn(TaskType::ResourceUpload, move |task| {
        seen.lock().push(task.retry_count);
        Err(WorkerError::connection("storage offline"))
    });
    let queue = TaskQueue::start(config(2), registry).unwrap();

    let (done_tx, done_rx) = unbounded();
    let task_id = queue
        .enqueue_task(
            TaskType::ResourceUpload,
            TaskPayload::new(),
            TaskPriority::Low,
            Some(Box::new(move |task: &Task, result: &TaskResult| {
                let _ = done_tx.send((task.retry_count, result.clone()));
            })),
        )
        .unwrap();

    let (retry_count, result) = done_rx.recv_timeout(WAIT).unwrap();
    let max_retries = queue.config().max_retries;
    assert_eq!(retry_count, max_retries + 1);
    assert_eq!(result.attempts, max_retries + 1);
    assert_eq!(result.status, TaskStatus::Failed);
    assert_eq!(*attempts.lock(), vec![0, 1, 2, 3]);

    let stored = queue.get_task_result(&task_id).unwrap();
    assert_eq!(stored.task_id, task_id);
    assert_eq!(queue.dead_letters()[0].last_error.as_deref(), result.error.as_deref());
    assert!(done_rx.recv_timeout(Duration::from_millis(100)).is_err());
}

#[test]
fn test_builtin_handlers_through_helpers() {
    let messaging = Arc::new(RecordingMessaging::new());
    let ports = MessagingPorts {
        messages: messaging.clone(),
        notifications: messaging.clone(),
        documents: messaging.clone(),
        uploads: messaging.clone(),
    };
    let config = config(3);
    let mut registry = HandlerRegistry::new();
    register_builtin(&mut registry, &ports, &config);
    let queue = TaskQueue::start(config, registry).unwrap();

    let (tx, rx) = unbounded();
    let callback = |tx: crossbeam_channel::Sender<TaskResult>| -> Option<TaskCallback> {
        Some(Box::new(move |_: &Task, result: &TaskResult| {
            let _ = tx.send(result.clone());
        }))
    };

    let message = OutboundMessage {
        phone_number: "+15550100".into(),
        message: "policy renewed".into(),
        media_urls: vec![],
    };
    queue
        .send_message_async(&message, TaskPriority::Medium, callback(tx.clone()))
        .unwrap();

    let notifications: Vec<Notification> = ["a@example.com", "b@example.com"]
        .iter()
        .map(|email| Notification {
            to_email: email.to_string(),
            subject: "Renewal".into(),
            body: "Your policy was renewed".into(),
            attachments: vec![],
            recipient_name: "Customer".into(),
        })
        .collect();
    queue
        .send_grouped_notifications_async(&notifications, TaskPriority::Low, callback(tx.clone()))
        .unwrap();

    let mut results = vec![rx.recv_timeout(WAIT).unwrap(), rx.recv_timeout(WAIT).unwrap()];
    results.sort_by_key(|r| r.task_type.as_str());
    assert!(results.iter().all(|r| r.is_success()));
    assert_eq!(results[0].task_type, TaskType::GroupedNotificationSend);
    assert_eq!(results[0].output.as_ref().unwrap()["successful"], json!(2));

    assert_eq!(messaging.messages(), vec![message]);
    assert_eq!(messaging.notifications().len(), 2);
    assert_eq!(queue.stats().completed_tasks, 2);
}

#[test]
fn test_concurrent_producers() {
    let mut registry = HandlerRegistry::new();
    registry.register_fn(TaskType::MessageSend, |_| Ok(Value::Null));
    let queue = Arc::new(TaskQueue::start(config(4), registry).unwrap());

    let (tx, rx) = unbounded();
    let producers: Vec<_> = (0..4)
        .map(|_| {
            let queue = Arc::clone(&queue);
            let tx = tx.clone();
            std::thread::spawn(move || {
                for i in 0..25 {
                    let tx = tx.clone();
                    let task = TaskBuilder::new(TaskType::MessageSend)
                        .with_priority(TaskPriority::from_level(i % 3 + 1))
                        .build()
                        .with_callback(move |_, _| {
                            let _ = tx.send(());
                        });
                    queue.enqueue(task).unwrap();
                }
            })
        })
        .collect();
    for producer in producers {
        producer.join().unwrap();
    }

    for _ in 0..100 {
        rx.recv_timeout(WAIT).unwrap();
    }
    let stats = queue.stats();
    assert_eq!(stats.total_tasks, 100);
    assert_eq!(stats.completed_tasks, 100);
    assert_eq!(stats.total_queue_size, 0);
}

#[test]
fn test_task_status_follows_lifecycle() {
    let (gate_tx, gate_rx) = bounded::<()>(0);
    let gate_rx = Mutex::new(gate_rx);
    let mut registry = HandlerRegistry::new();
    registry.register_fn(TaskType::DocumentSend, move |_| {
        let _ = gate_rx.lock().recv_timeout(WAIT);
        Ok(Value::Null)
    });
    registry.register_fn(TaskType::MessageSend, |_| Ok(json!("sent")));
    let queue = TaskQueue::start(config(1), registry).unwrap();

    let blocking = queue
        .enqueue(TaskBuilder::new(TaskType::DocumentSend).build())
        .unwrap();
    assert!(TestEnv::wait_for(
        || queue.task_status(&blocking) == Some(TaskStatus::Running),
        WAIT
    ));

    let waiting = queue
        .enqueue(TaskBuilder::new(TaskType::MessageSend).build())
        .unwrap();
    assert_eq!(queue.task_status(&waiting), Some(TaskStatus::Queued));
    assert_eq!(queue.task_status("message_send_unknown"), None);

    gate_tx.send(()).unwrap();
    assert!(TestEnv::wait_for(
        || queue.task_status(&waiting) == Some(TaskStatus::Completed),
        WAIT
    ));
    assert_eq!(queue.task_status(&blocking), Some(TaskStatus::Completed));

    // 取走结果后任务不再可查
    let removed = queue.remove_task_result(&blocking).unwrap();
    assert_eq!(removed.task_id, blocking);
    assert_eq!(queue.get_task_result(&blocking), None);
    assert_eq!(queue.task_status(&blocking), None);
    assert!(queue.remove_task_result(&blocking).is_none());
    assert!(queue.get_task_result(&waiting).is_some());
}

#[test]
fn test_task_status_reports_pending_retry() {
    let mut registry = HandlerRegistry::new();
    registry.register_fn(TaskType::NotificationSend, |_| {
        Err(WorkerError::connection("smtp unreachable"))
    });
    let config = TaskQueueConfig {
        backoff_unit_ms: 60_000,
        ..config(1)
    };
    let queue = TaskQueue::start(config, registry).unwrap();

    let task_id = queue
        .enqueue(
            TaskBuilder::new(TaskType::NotificationSend)
                .with_max_retries(2)
                .build(),
        )
        .unwrap();
    assert!(TestEnv::wait_for(
        || queue.task_status(&task_id) == Some(TaskStatus::RetryScheduled),
        WAIT
    ));
    assert_eq!(queue.stats().pending_retries, 1);
    assert!(queue.get_task_result(&task_id).is_none());

    // 关闭时丢弃的重试任务没有结果
    queue.shutdown();
    assert_eq!(queue.task_status(&task_id), None);
}
