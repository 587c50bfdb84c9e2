use axum::extract::State;
use axum::Json;
use serde_json::{json, Value};

use crate::routes::ApiState;

pub async fn health_check(State(state): State<ApiState>) -> Json<Value> {
    let node = state.execution.node_state();
    Json(json!({
        "status": if node.error_status().is_ok() { "ok" } else { "degraded" },
        "node_id": node.node_id(),
        "error_status": node.error_status(),
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "service": "taskmgr",
        "version": env!("CARGO_PKG_VERSION")
    }))
}
