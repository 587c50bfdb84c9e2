//! 条目级修改
//!
//! 仓储以增量方式修改对象：先把全部增量作用到副本并整体校验，成功后才提交，
//! 任何一个增量非法都不会留下部分修改。

use chrono::{DateTime, Utc};
use serde_json::Value;
use taskmgr_core::{TaskManagerError, TaskManagerResult};

use crate::node::{Node, NodeErrorStatus, NodeExecutionStatus};
use crate::state::TaskExecutionStatus;
use crate::task::{
    OperationResult, ScheduleSpec, Task, TaskBinding, TaskRecurrence, ThreadStopAction,
    UriStackEntry, WaitingReason,
};

#[derive(Debug, Clone, PartialEq)]
pub enum TaskDelta {
    Name(String),
    HandlerUri(Option<String>),
    OtherHandlersUriStack(Vec<UriStackEntry>),
    Category(Option<String>),
    ObjectRef(Option<String>),
    ExecutionStatus(TaskExecutionStatus),
    WaitingReason(Option<WaitingReason>),
    Recurrence(TaskRecurrence),
    Binding(TaskBinding),
    Schedule(Option<ScheduleSpec>),
    LastRunStartTimestamp(Option<DateTime<Utc>>),
    LastRunFinishTimestamp(Option<DateTime<Utc>>),
    CompletionTimestamp(Option<DateTime<Utc>>),
    StalledSince(Option<DateTime<Utc>>),
    ThreadStopAction(ThreadStopAction),
    Node(Option<String>),
    DependsOn(Vec<String>),
    Parent(Option<String>),
    Owner(Option<String>),
    Progress(u64),
    Result(Option<OperationResult>),
    /// 设置或删除（`None`）一个扩展属性
    Extension { name: String, value: Option<Value> },
}

impl TaskDelta {
    /// 修改后是否需要重新同步调度触发器
    pub fn touches_scheduling(&self) -> bool {
        matches!(
            self,
            Self::ExecutionStatus(_) | Self::Recurrence(_) | Self::Binding(_) | Self::Schedule(_)
        )
    }

    pub fn apply_to(&self, task: &mut Task) -> TaskManagerResult<()> {
        match self.clone() {
            Self::Name(name) => {
                if name.trim().is_empty() {
                    return Err(TaskManagerError::SchemaViolation(
                        "任务名称不能为空".to_string(),
                    ));
                }
                task.name = name;
            }
            Self::HandlerUri(uri) => task.handler_uri = uri,
            Self::OtherHandlersUriStack(stack) => task.other_handlers_uri_stack = stack,
            Self::Category(category) => task.category = category,
            Self::ObjectRef(object_ref) => task.object_ref = object_ref,
            Self::ExecutionStatus(status) => task.execution_status = status,
            Self::WaitingReason(reason) => task.waiting_reason = reason,
            Self::Recurrence(recurrence) => task.recurrence = recurrence,
            Self::Binding(binding) => task.binding = binding,
            Self::Schedule(schedule) => {
                if let Some(schedule) = &schedule {
                    schedule.validate()?;
                }
                task.schedule = schedule;
            }
            Self::LastRunStartTimestamp(ts) => task.last_run_start_timestamp = ts,
            Self::LastRunFinishTimestamp(ts) => task.last_run_finish_timestamp = ts,
            Self::CompletionTimestamp(ts) => task.completion_timestamp = ts,
            Self::StalledSince(ts) => task.stalled_since = ts,
            Self::ThreadStopAction(action) => task.thread_stop_action = action,
            Self::Node(node) => task.node = node,
            Self::DependsOn(deps) => {
                if task.oid.as_ref().is_some_and(|oid| deps.contains(oid)) {
                    return Err(TaskManagerError::SchemaViolation(
                        "任务不能依赖自身".to_string(),
                    ));
                }
                task.depends_on = deps;
            }
            Self::Parent(parent) => {
                if parent.is_some() && parent == task.oid {
                    return Err(TaskManagerError::SchemaViolation(
                        "任务不能是自身的父任务".to_string(),
                    ));
                }
                task.parent = parent;
            }
            Self::Owner(owner) => task.owner = owner,
            Self::Progress(progress) => task.progress = progress,
            Self::Result(result) => task.result = result,
            Self::Extension { name, value } => {
                if name.is_empty() {
                    return Err(TaskManagerError::SchemaViolation(
                        "扩展属性名不能为空".to_string(),
                    ));
                }
                match value {
                    Some(value) => {
                        task.extension.insert(name, value);
                    }
                    None => {
                        task.extension.remove(&name);
                    }
                }
            }
        }
        Ok(())
    }

    /// 在副本上应用全部增量并整体校验，返回修改后的任务
    pub fn apply_all(task: &Task, deltas: &[TaskDelta]) -> TaskManagerResult<Task> {
        let mut updated = task.clone();
        for delta in deltas {
            delta.apply_to(&mut updated)?;
        }
        updated.validate()?;
        Ok(updated)
    }
}

/// 与修改原子执行的前置条件
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModifyGuard {
    pub allowed_statuses: Option<Vec<TaskExecutionStatus>>,
    pub expected_version: Option<u64>,
}

impl ModifyGuard {
    pub fn status_in(statuses: &[TaskExecutionStatus]) -> Self {
        Self {
            allowed_statuses: Some(statuses.to_vec()),
            expected_version: None,
        }
    }

    pub fn status(status: TaskExecutionStatus) -> Self {
        Self::status_in(&[status])
    }

    pub fn version(version: u64) -> Self {
        Self {
            allowed_statuses: None,
            expected_version: Some(version),
        }
    }

    pub fn check(&self, task: &Task) -> TaskManagerResult<()> {
        if let Some(allowed) = &self.allowed_statuses {
            if !allowed.contains(&task.execution_status) {
                return Err(TaskManagerError::state_conflict(
                    task.display_id(),
                    format!(
                        "当前状态 {} 不在允许的状态 {:?} 中",
                        task.execution_status, allowed
                    ),
                ));
            }
        }

        if let Some(expected) = self.expected_version {
            if task.version != expected {
                return Err(TaskManagerError::state_conflict(
                    task.display_id(),
                    format!("版本不一致: 期望 {expected}，实际 {}", task.version),
                ));
            }
        }

        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum NodeDelta {
    Url(Option<String>),
    Hostname(Option<String>),
    InstanceToken(String),
    Clustered(bool),
    JobStoreFingerprint(String),
    ExecutionStatus(NodeExecutionStatus),
    ErrorStatus(NodeErrorStatus),
    LastCheckInTime(DateTime<Utc>),
    ConnectionResult(Option<String>),
    BuildVersion(Option<String>),
}

impl NodeDelta {
    pub fn apply_to(&self, node: &mut Node) {
        match self.clone() {
            Self::Url(url) => node.url = url,
            Self::Hostname(hostname) => node.hostname = hostname,
            Self::InstanceToken(token) => node.instance_token = token,
            Self::Clustered(clustered) => node.clustered = clustered,
            Self::JobStoreFingerprint(fp) => node.job_store_fingerprint = fp,
            Self::ExecutionStatus(status) => node.execution_status = status,
            Self::ErrorStatus(status) => node.error_status = status,
            Self::LastCheckInTime(ts) => node.last_check_in_time = Some(ts),
            Self::ConnectionResult(result) => node.connection_result = result,
            Self::BuildVersion(version) => node.build_version = version,
        }
    }
}
