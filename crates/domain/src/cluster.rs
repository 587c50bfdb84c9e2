use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::node::{NodeErrorStatus, NodeExecutionStatus};

/// 节点上正在执行的任务
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutingTaskInfo {
    pub oid: Option<String>,
    pub lightweight_id: String,
    pub name: String,
    pub started_at: DateTime<Utc>,
    pub progress: u64,
    pub stalled_since: Option<DateTime<Utc>>,
}

/// 节点自报的运行时状态
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeRuntimeStatus {
    pub node_id: String,
    pub execution_status: NodeExecutionStatus,
    pub error_status: NodeErrorStatus,
    pub scheduler_running: bool,
    #[serde(default)]
    pub executing_tasks: Vec<ExecutingTaskInfo>,
    /// 查询失败时的错误信息
    pub communication_error: Option<String>,
}

impl NodeRuntimeStatus {
    /// 无法获取状态的节点
    pub fn unreachable(node_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            execution_status: NodeExecutionStatus::CommunicationError,
            error_status: NodeErrorStatus::Ok,
            scheduler_running: false,
            executing_tasks: Vec::new(),
            communication_error: Some(message.into()),
        }
    }
}

/// 集群状态快照
///
/// 尽力而为的近似视图，从不持久化：快照中查不到的任务或节点只表示"未知"。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterStatusInformation {
    pub timestamp: DateTime<Utc>,
    pub nodes: BTreeMap<String, NodeRuntimeStatus>,
    /// 任务oid → 正在执行它的节点
    pub task_to_node: BTreeMap<String, String>,
}

impl ClusterStatusInformation {
    pub fn new(timestamp: DateTime<Utc>) -> Self {
        Self {
            timestamp,
            nodes: BTreeMap::new(),
            task_to_node: BTreeMap::new(),
        }
    }

    pub fn add_node(&mut self, status: NodeRuntimeStatus) {
        for task in &status.executing_tasks {
            if let Some(oid) = &task.oid {
                self.task_to_node
                    .insert(oid.clone(), status.node_id.clone());
            }
        }
        self.nodes.insert(status.node_id.clone(), status);
    }

    pub fn find_node_running_task(&self, oid: &str) -> Option<&str> {
        self.task_to_node.get(oid).map(String::as_str)
    }

    pub fn is_task_running(&self, oid: &str) -> bool {
        self.task_to_node.contains_key(oid)
    }

    pub fn node(&self, node_id: &str) -> Option<&NodeRuntimeStatus> {
        self.nodes.get(node_id)
    }

    pub fn executing_tasks(&self) -> impl Iterator<Item = (&str, &ExecutingTaskInfo)> {
        self.nodes.values().flat_map(|node| {
            node.executing_tasks
                .iter()
                .map(move |task| (node.node_id.as_str(), task))
        })
    }

    pub fn has_communication_errors(&self) -> bool {
        self.nodes
            .values()
            .any(|n| n.execution_status == NodeExecutionStatus::CommunicationError)
    }
}
