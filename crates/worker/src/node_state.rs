use std::sync::{PoisonError, RwLock};

use taskmgr_domain::NodeErrorStatus;
use tracing::error;

/// 本节点的身份和错误状态，由集群管理器和执行管理器共享
#[derive(Debug)]
pub struct LocalNodeState {
    node_id: String,
    instance_token: String,
    error_status: RwLock<NodeErrorStatus>,
}

impl LocalNodeState {
    pub fn new(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            instance_token: uuid::Uuid::new_v4().to_string(),
            error_status: RwLock::new(NodeErrorStatus::Ok),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// 进程启动时生成的令牌
    pub fn instance_token(&self) -> &str {
        &self.instance_token
    }

    pub fn error_status(&self) -> NodeErrorStatus {
        *self
            .error_status
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// 设置错误状态；已处于错误状态时保持第一次的错误，返回是否发生变化
    pub fn set_error_status(&self, status: NodeErrorStatus) -> bool {
        let mut current = self
            .error_status
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if !current.is_ok() || status.is_ok() {
            return false;
        }
        *current = status;
        error!(node_id = %self.node_id, status = %status, "节点进入错误状态，本地调度被禁止");
        true
    }
}
