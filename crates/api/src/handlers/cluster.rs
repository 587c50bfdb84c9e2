use axum::extract::{Path, State};
use taskmgr_domain::NodeRuntimeStatus;
use tracing::info;

use crate::error::ApiResult;
use crate::response::ApiResponse;
use crate::routes::ApiState;

/// 本节点自报的运行时状态，供其他节点汇总集群状态
pub async fn node_status(State(state): State<ApiState>) -> ApiResponse<NodeRuntimeStatus> {
    ApiResponse::success(state.execution.local_node_status())
}

/// 停止本地运行的任务
pub async fn stop_task(
    State(state): State<ApiState>,
    Path(oid): Path<String>,
) -> ApiResponse<bool> {
    let was_running = state.execution.stop_local_task(&oid);
    if was_running {
        ApiResponse::success_with_message(true, format!("已请求任务 {oid} 停止"))
    } else {
        ApiResponse::success(false)
    }
}

pub async fn start_scheduler(State(state): State<ApiState>) -> ApiResult<ApiResponse<()>> {
    info!("收到远程请求: 启动本地调度");
    state.execution.start_local_scheduler()?;
    Ok(ApiResponse::success_empty_with_message(
        "本地调度已启动".to_string(),
    ))
}

pub async fn stop_scheduler(State(state): State<ApiState>) -> ApiResult<ApiResponse<()>> {
    info!("收到远程请求: 停止本地调度");
    state.execution.stop_local_scheduler().await?;
    Ok(ApiResponse::success_empty_with_message(
        "本地调度已停止".to_string(),
    ))
}
