use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use serde_json::json;
use tokio::{net::TcpListener, sync::broadcast};
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::runtime::WorkerRuntime;

/// 运维端点共享状态
#[derive(Clone)]
pub struct AppState {
    pub runtime: Arc<WorkerRuntime>,
    pub metrics: Option<PrometheusHandle>,
}

/// 运维 HTTP 服务：/health、/stats、/metrics
pub struct Application {
    state: AppState,
}

impl Application {
    pub fn new(runtime: Arc<WorkerRuntime>, metrics: Option<PrometheusHandle>) -> Self {
        Self {
            state: AppState { runtime, metrics },
        }
    }

    pub fn runtime(&self) -> &Arc<WorkerRuntime> {
        &self.state.runtime
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/health", get(health))
            .route("/stats", get(stats))
            .route("/metrics", get(render_metrics))
            .layer(TraceLayer::new_for_http())
            .with_state(self.state.clone())
    }

    /// 监听 `bind_address` 直到收到关闭信号
    pub async fn serve(
        &self,
        bind_address: &str,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) -> Result<()> {
        let listener = TcpListener::bind(bind_address)
            .await
            .with_context(|| format!("绑定地址失败: {bind_address}"))?;
        info!("运维端点启动在 http://{}", bind_address);

        axum::serve(listener, self.router())
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.recv().await;
                info!("运维端点收到关闭信号");
            })
            .await
            .context("运维端点运行失败")?;

        info!("运维端点已停止");
        Ok(())
    }
}

/// 健康检查会租用连接并访问缓存，放到阻塞线程池执行
async fn health(State(state): State<AppState>) -> Response {
    let runtime = Arc::clone(&state.runtime);
    match tokio::task::spawn_blocking(move || runtime.health()).await {
        Ok(report) => {
            let code = StatusCode::from_u16(report.status.http_status())
                .unwrap_or(StatusCode::SERVICE_UNAVAILABLE);
            (code, Json(report)).into_response()
        }
        Err(e) => {
            error!("健康检查失败: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "status": "unhealthy", "error": e.to_string() })),
            )
                .into_response()
        }
    }
}

async fn stats(State(state): State<AppState>) -> Response {
    let runtime = Arc::clone(&state.runtime);
    let collected = tokio::task::spawn_blocking(move || {
        json!({
            "queue": runtime.queue().status(),
            "pool": runtime.datastore().stats(),
            "cache": runtime.cache().report(),
            "batch": runtime.batch().stats(),
        })
    })
    .await;

    match collected {
        Ok(body) => Json(body).into_response(),
        Err(e) => {
            error!("统计信息查询失败: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": e.to_string() })),
            )
                .into_response()
        }
    }
}

async fn render_metrics(State(state): State<AppState>) -> Response {
    match &state.metrics {
        Some(handle) => handle.render().into_response(),
        None => (StatusCode::NOT_FOUND, "metrics exporter not installed").into_response(),
    }
}
