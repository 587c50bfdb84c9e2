//! # 集群内部API
//!
//! 同一集群中的其他节点通过这些接口查询本节点的运行时状态、
//! 请求停止本地运行的任务以及远程启停本地调度。
//!
//! ## API 端点
//!
//! - `GET /health` - 健康检查
//! - `GET /cluster/node` - 本节点运行时状态
//! - `POST /cluster/tasks/{oid}/stop` - 停止本地运行的任务，返回任务是否在本节点运行
//! - `POST /cluster/scheduler/start` - 启动本地调度
//! - `POST /cluster/scheduler/stop` - 停止本地调度
//!
//! 所有响应都使用统一的 `{success, data, message, timestamp}` 格式。

pub mod error;
pub mod handlers;
pub mod middleware;
pub mod response;
pub mod routes;

use std::future::Future;

use axum::Router;
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tracing::info;

use middleware::{cors_layer, request_logging, trace_layer};
pub use routes::{create_routes, ApiState};

/// 创建带中间件的完整API应用
pub fn create_app(state: ApiState) -> Router {
    create_routes(state).layer(
        ServiceBuilder::new()
            .layer(trace_layer())
            .layer(cors_layer())
            .layer(axum::middleware::from_fn(request_logging)),
    )
}

/// 在指定地址上提供服务，直到 `shutdown` 完成
pub async fn serve<F>(bind_address: &str, app: Router, shutdown: F) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind(bind_address).await?;
    info!("集群API服务监听地址: {}", listener.local_addr()?);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
}
