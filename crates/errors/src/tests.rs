use crate::*;

#[test]
fn test_worker_error_display() {
    let exhausted = WorkerError::PoolExhausted {
        checked_out: 3,
        limit: 3,
        waited_ms: 0,
    };
    assert_eq!(
        exhausted.to_string(),
        "资源池耗尽: 3/3 个连接已被占用，等待 0ms 后放弃"
    );

    let full = WorkerError::QueueFull {
        priority: 1,
        capacity: 100,
    };
    assert_eq!(full.to_string(), "队列已满: 优先级 1 队列容量 100");

    let missing = WorkerError::HandlerNotFound {
        task_type: "message_send".to_string(),
    };
    assert_eq!(missing.to_string(), "未注册的任务处理器: message_send");

    let config = WorkerError::config_error("pool_size 必须大于0");
    assert_eq!(config.to_string(), "配置错误: pool_size 必须大于0");
}

#[test]
fn test_error_kind_classification() {
    assert_eq!(WorkerError::connection("reset").kind(), ErrorKind::Connection);
    assert_eq!(WorkerError::timeout("read").kind(), ErrorKind::Timeout);
    assert_eq!(
        WorkerError::HandleCreation("refused".into()).kind(),
        ErrorKind::Connection
    );
    assert_eq!(
        WorkerError::PoolExhausted {
            checked_out: 1,
            limit: 1,
            waited_ms: 10
        }
        .kind(),
        ErrorKind::Exhausted
    );
    assert_eq!(
        WorkerError::invalid_payload("missing phone").kind(),
        ErrorKind::Permanent
    );
    assert_eq!(
        WorkerError::external(ErrorKind::Timeout, "provider slow").kind(),
        ErrorKind::Timeout
    );
}

#[test]
fn test_connection_related_errors() {
    assert!(WorkerError::connection("broken pipe").is_connection_related());
    assert!(WorkerError::timeout("socket").is_connection_related());
    assert!(WorkerError::external(ErrorKind::Connection, "dns").is_connection_related());

    // 池耗尽是瞬时错误但不需要丢弃句柄
    let exhausted = WorkerError::PoolExhausted {
        checked_out: 2,
        limit: 2,
        waited_ms: 5,
    };
    assert!(exhausted.is_transient());
    assert!(!exhausted.is_connection_related());

    // 消息文本中出现 "connection" 不影响分类
    let permanent = WorkerError::execution("connection string is malformed");
    assert!(!permanent.is_connection_related());
    assert!(!permanent.is_transient());
}

#[test]
fn test_fatal_errors() {
    assert!(WorkerError::config_error("bad").is_fatal());
    assert!(WorkerError::Internal("oops".into()).is_fatal());
    assert!(!WorkerError::connection("reset").is_fatal());
}

#[test]
fn test_from_serde_json_error() {
    let err = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
    let worker_err: WorkerError = err.into();
    assert!(matches!(worker_err, WorkerError::Serialization(_)));
}

#[test]
fn test_from_anyhow_error() {
    let err = anyhow::anyhow!("startup failed");
    let worker_err: WorkerError = err.into();
    assert_eq!(worker_err.to_string(), "内部错误: startup failed");
}

#[test]
fn test_error_kind_serde() {
    let json = serde_json::to_string(&ErrorKind::Exhausted).unwrap();
    assert_eq!(json, "\"exhausted\"");
    let kind: ErrorKind = serde_json::from_str("\"timeout\"").unwrap();
    assert_eq!(kind, ErrorKind::Timeout);
}
