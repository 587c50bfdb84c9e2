use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use taskmgr_worker::ExecutionManager;

use crate::handlers::{
    cluster::{node_status, start_scheduler, stop_scheduler, stop_task},
    health::health_check,
};

/// API应用状态
#[derive(Clone)]
pub struct ApiState {
    pub execution: Arc<ExecutionManager>,
}

impl ApiState {
    pub fn new(execution: Arc<ExecutionManager>) -> Self {
        Self { execution }
    }
}

/// 创建API路由
pub fn create_routes(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/cluster/node", get(node_status))
        .route("/cluster/tasks/{oid}/stop", post(stop_task))
        .route("/cluster/scheduler/start", post(start_scheduler))
        .route("/cluster/scheduler/stop", post(stop_scheduler))
        .with_state(state)
}
