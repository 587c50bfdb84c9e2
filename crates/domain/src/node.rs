use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeExecutionStatus {
    Up,
    Down,
    CommunicationError,
}

/// 节点错误状态，非 `Ok` 时禁止本地调度
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeErrorStatus {
    #[default]
    Ok,
    DuplicateNodeId,
    NonClusteredNodeWithOthers,
    JobStoreMismatch,
    LocalConfigurationError,
}

impl NodeErrorStatus {
    pub fn is_ok(&self) -> bool {
        *self == Self::Ok
    }
}

impl fmt::Display for NodeErrorStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::Ok => "正常",
            Self::DuplicateNodeId => "节点ID重复",
            Self::NonClusteredNodeWithOthers => "非集群节点发现了其他存活节点",
            Self::JobStoreMismatch => "作业存储配置与集群不一致",
            Self::LocalConfigurationError => "本地配置错误",
        };
        f.write_str(text)
    }
}

/// 集群节点记录
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub node_id: String,
    /// 其他节点访问该节点的基础URL
    pub url: Option<String>,
    pub hostname: Option<String>,
    /// 每次进程启动生成的令牌，用于识别重复的节点ID
    pub instance_token: String,
    pub clustered: bool,
    pub job_store_fingerprint: String,
    pub execution_status: NodeExecutionStatus,
    #[serde(default)]
    pub error_status: NodeErrorStatus,
    pub last_check_in_time: Option<DateTime<Utc>>,
    pub connection_result: Option<String>,
    pub build_version: Option<String>,
    pub registered_at: DateTime<Utc>,
}

impl Node {
    pub fn new(
        node_id: impl Into<String>,
        instance_token: impl Into<String>,
        job_store_fingerprint: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            url: None,
            hostname: None,
            instance_token: instance_token.into(),
            clustered: false,
            job_store_fingerprint: job_store_fingerprint.into(),
            execution_status: NodeExecutionStatus::Up,
            error_status: NodeErrorStatus::Ok,
            last_check_in_time: Some(now),
            connection_result: None,
            build_version: None,
            registered_at: now,
        }
    }

    /// 节点处于 Up 状态且在超时时间内签到过
    pub fn is_alive(&self, now: DateTime<Utc>, timeout: Duration) -> bool {
        self.execution_status == NodeExecutionStatus::Up
            && self
                .last_check_in_time
                .is_some_and(|checked_in| now - checked_in <= timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_liveness() {
        let now = Utc::now();
        let mut node = Node::new("node-1", "token", "memory", now);
        let timeout = Duration::seconds(30);

        assert!(node.is_alive(now + Duration::seconds(30), timeout));
        assert!(!node.is_alive(now + Duration::seconds(31), timeout));

        node.execution_status = NodeExecutionStatus::Down;
        assert!(!node.is_alive(now, timeout));
    }
}
