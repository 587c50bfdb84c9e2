//! 访问其他节点的集群内部接口

use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use taskmgr_core::{TaskManagerError, TaskManagerResult};
use taskmgr_domain::{Node, NodeRuntimeStatus};
use tracing::debug;

/// 其他节点的远程控制接口
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RemoteNodeClient: Send + Sync {
    /// 查询节点自报的运行时状态
    async fn node_status(&self, node: &Node) -> TaskManagerResult<NodeRuntimeStatus>;

    /// 请求节点停止本地运行的任务，返回节点上是否确实有该任务在运行
    async fn stop_task(&self, node: &Node, oid: &str) -> TaskManagerResult<bool>;

    async fn start_scheduler(&self, node: &Node) -> TaskManagerResult<()>;

    async fn stop_scheduler(&self, node: &Node) -> TaskManagerResult<()>;
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    success: bool,
    data: Option<T>,
    message: Option<String>,
}

/// 基于HTTP的远程节点客户端
pub struct HttpNodeClient {
    http_client: reqwest::Client,
}

impl HttpNodeClient {
    pub fn new(timeout: Duration) -> TaskManagerResult<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TaskManagerError::Internal(format!("创建HTTP客户端失败: {e}")))?;
        Ok(Self { http_client })
    }

    fn endpoint(node: &Node, path: &str) -> TaskManagerResult<String> {
        let Some(base) = node.url.as_deref() else {
            return Err(Self::failure(node, "节点未配置访问URL"));
        };
        Ok(format!("{}{}", base.trim_end_matches('/'), path))
    }

    fn failure(node: &Node, message: impl Into<String>) -> TaskManagerError {
        TaskManagerError::CommunicationFailure {
            node: node.node_id.clone(),
            message: message.into(),
        }
    }

    async fn call<T: DeserializeOwned>(
        &self,
        node: &Node,
        request: reqwest::RequestBuilder,
    ) -> TaskManagerResult<Option<T>> {
        let response = request
            .send()
            .await
            .map_err(|e| Self::failure(node, format!("请求失败: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Self::failure(node, format!("HTTP {status} - {body}")));
        }

        let envelope: Envelope<T> = response
            .json()
            .await
            .map_err(|e| Self::failure(node, format!("响应格式无效: {e}")))?;
        if !envelope.success {
            return Err(Self::failure(
                node,
                envelope.message.unwrap_or_else(|| "远程节点返回失败".to_string()),
            ));
        }
        Ok(envelope.data)
    }
}

#[async_trait]
impl RemoteNodeClient for HttpNodeClient {
    async fn node_status(&self, node: &Node) -> TaskManagerResult<NodeRuntimeStatus> {
        let url = Self::endpoint(node, "/cluster/node")?;
        debug!(node_id = %node.node_id, url = %url, "查询远程节点状态");

        self.call::<NodeRuntimeStatus>(node, self.http_client.get(&url))
            .await?
            .ok_or_else(|| Self::failure(node, "响应缺少节点状态"))
    }

    async fn stop_task(&self, node: &Node, oid: &str) -> TaskManagerResult<bool> {
        let url = Self::endpoint(node, &format!("/cluster/tasks/{oid}/stop"))?;
        debug!(node_id = %node.node_id, task_oid = oid, "请求远程节点停止任务");

        Ok(self
            .call::<bool>(node, self.http_client.post(&url))
            .await?
            .unwrap_or(false))
    }

    async fn start_scheduler(&self, node: &Node) -> TaskManagerResult<()> {
        let url = Self::endpoint(node, "/cluster/scheduler/start")?;
        self.call::<serde_json::Value>(node, self.http_client.post(&url))
            .await
            .map(|_| ())
    }

    async fn stop_scheduler(&self, node: &Node) -> TaskManagerResult<()> {
        let url = Self::endpoint(node, "/cluster/scheduler/stop")?;
        self.call::<serde_json::Value>(node, self.http_client.post(&url))
            .await
            .map(|_| ())
    }
}
