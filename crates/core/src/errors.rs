use thiserror::Error;

/// 任务管理错误类型定义
///
/// 存储层、调度引擎和集群通信产生的错误都归并到这一组封闭的错误种类中，
/// 调用方按种类处理，而不是按具体来源逐一捕获。
#[derive(Debug, Error)]
pub enum TaskManagerError {
    #[error("数据库错误: {0}")]
    Database(#[from] sqlx::Error),

    #[error("{kind}未找到: {id}")]
    ObjectNotFound { kind: &'static str, id: String },

    #[error("{kind}已存在: {id}")]
    AlreadyExists { kind: &'static str, id: String },

    #[error("数据结构校验失败: {0}")]
    SchemaViolation(String),

    #[error("任务 {id} 状态冲突: {message}")]
    StateConflict { id: String, message: String },

    #[error("与节点 {node} 通信失败: {message}")]
    CommunicationFailure { node: String, message: String },

    #[error("本地调度器错误: {0}")]
    Scheduler(String),

    #[error("无效的CRON表达式: {expr} - {message}")]
    InvalidCron { expr: String, message: String },

    #[error("配置错误: {0}")]
    Configuration(String),

    #[error("序列化错误: {0}")]
    Serialization(String),

    #[error("内部错误: {0}")]
    Internal(String),
}

impl TaskManagerError {
    pub fn task_not_found(oid: impl Into<String>) -> Self {
        Self::ObjectNotFound {
            kind: "任务",
            id: oid.into(),
        }
    }

    pub fn node_not_found(node_id: impl Into<String>) -> Self {
        Self::ObjectNotFound {
            kind: "节点",
            id: node_id.into(),
        }
    }

    pub fn job_not_found(job_key: impl Into<String>) -> Self {
        Self::ObjectNotFound {
            kind: "作业",
            id: job_key.into(),
        }
    }

    pub fn state_conflict(id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::StateConflict {
            id: id.into(),
            message: message.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::ObjectNotFound { .. })
    }

    pub fn is_state_conflict(&self) -> bool {
        matches!(self, Self::StateConflict { .. })
    }

    pub fn is_schema_violation(&self) -> bool {
        matches!(self, Self::SchemaViolation(_) | Self::InvalidCron { .. })
    }

    pub fn is_communication_failure(&self) -> bool {
        matches!(self, Self::CommunicationFailure { .. })
    }
}

impl From<serde_json::Error> for TaskManagerError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}
