use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use taskmgr_core::{TaskManagerError, TaskManagerResult};

use crate::state::{TaskEvent, TaskExecutionStatus};

/// 扩展属性名：只模拟执行
pub const EXTENSION_DRY_RUN: &str = "dry_run";
/// 扩展属性名：处理器可使用的工作线程数
pub const EXTENSION_WORKER_THREADS: &str = "worker_threads";

/// 调度间隔上限（100年）
pub const MAX_INTERVAL_SECONDS: u64 = 100 * 365 * 24 * 60 * 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskRecurrence {
    Single,
    Recurring,
}

/// 循环任务的下一次触发是否依赖上一次运行的结束
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskBinding {
    /// 按固定间隔触发，与上次运行是否结束无关
    Tight,
    /// 上次运行结束后才计算下一次触发
    Loose,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MisfireAction {
    #[default]
    ExecuteImmediately,
    Reschedule,
}

/// 节点关闭时对正在运行任务的处理方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ThreadStopAction {
    #[default]
    Restart,
    Reschedule,
    Close,
    Suspend,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WaitingReason {
    /// 等待依赖任务或子任务完成
    OtherTasks,
    Other(String),
}

/// 调度设置
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ScheduleSpec {
    pub interval_seconds: Option<u64>,
    /// 6段CRON表达式（含秒）
    pub cron_like_pattern: Option<String>,
    pub earliest_start: Option<DateTime<Utc>>,
    pub latest_start: Option<DateTime<Utc>>,
    #[serde(default)]
    pub misfire_action: MisfireAction,
}

impl ScheduleSpec {
    pub fn interval(seconds: u64) -> Self {
        Self {
            interval_seconds: Some(seconds),
            ..Default::default()
        }
    }

    pub fn cron(pattern: impl Into<String>) -> Self {
        Self {
            cron_like_pattern: Some(pattern.into()),
            ..Default::default()
        }
    }

    pub fn with_earliest_start(mut self, at: DateTime<Utc>) -> Self {
        self.earliest_start = Some(at);
        self
    }

    pub fn with_latest_start(mut self, at: DateTime<Utc>) -> Self {
        self.latest_start = Some(at);
        self
    }

    pub fn with_misfire_action(mut self, action: MisfireAction) -> Self {
        self.misfire_action = action;
        self
    }

    pub fn has_recurrence(&self) -> bool {
        self.interval_seconds.is_some() || self.cron_like_pattern.is_some()
    }

    /// `base` 之后一个调度间隔的时间，间隔超出范围或结果溢出时返回 SchemaViolation
    pub fn interval_after(
        base: DateTime<Utc>,
        interval_seconds: u64,
    ) -> TaskManagerResult<DateTime<Utc>> {
        i64::try_from(interval_seconds)
            .ok()
            .and_then(chrono::TimeDelta::try_seconds)
            .and_then(|interval| base.checked_add_signed(interval))
            .ok_or_else(|| {
                TaskManagerError::SchemaViolation(format!(
                    "调度间隔 {interval_seconds} 秒超出可表示的时间范围"
                ))
            })
    }

    pub fn validate(&self) -> TaskManagerResult<()> {
        if self.interval_seconds == Some(0) {
            return Err(TaskManagerError::SchemaViolation(
                "调度间隔必须大于0".to_string(),
            ));
        }

        if let Some(seconds) = self.interval_seconds.filter(|s| *s > MAX_INTERVAL_SECONDS) {
            return Err(TaskManagerError::SchemaViolation(format!(
                "调度间隔 {seconds} 秒超过上限 {MAX_INTERVAL_SECONDS} 秒"
            )));
        }

        if self.interval_seconds.is_some() && self.cron_like_pattern.is_some() {
            return Err(TaskManagerError::SchemaViolation(
                "调度间隔和CRON表达式不能同时设置".to_string(),
            ));
        }

        if let Some(pattern) = &self.cron_like_pattern {
            if pattern.trim().is_empty() {
                return Err(TaskManagerError::SchemaViolation(
                    "CRON表达式不能为空".to_string(),
                ));
            }
        }

        if let (Some(earliest), Some(latest)) = (self.earliest_start, self.latest_start) {
            if earliest > latest {
                return Err(TaskManagerError::SchemaViolation(format!(
                    "最早开始时间 {earliest} 晚于最晚开始时间 {latest}"
                )));
            }
        }

        Ok(())
    }
}

/// 处理器栈中的一项，成为当前处理器时可同时切换调度设置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UriStackEntry {
    pub handler_uri: String,
    pub recurrence: Option<TaskRecurrence>,
    pub binding: Option<TaskBinding>,
    pub schedule: Option<ScheduleSpec>,
}

impl UriStackEntry {
    pub fn new(handler_uri: impl Into<String>) -> Self {
        Self {
            handler_uri: handler_uri.into(),
            recurrence: None,
            binding: None,
            schedule: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperationResultStatus {
    InProgress,
    Success,
    Warning,
    PartialError,
    HandledError,
    FatalError,
    NotApplicable,
}

/// 任务运行的操作结果
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationResult {
    pub status: OperationResultStatus,
    pub message: Option<String>,
}

impl OperationResult {
    pub fn in_progress() -> Self {
        Self {
            status: OperationResultStatus::InProgress,
            message: None,
        }
    }

    pub fn success() -> Self {
        Self {
            status: OperationResultStatus::Success,
            message: None,
        }
    }

    pub fn with_status(status: OperationResultStatus, message: impl Into<String>) -> Self {
        Self {
            status,
            message: Some(message.into()),
        }
    }

    pub fn fatal_error(message: impl Into<String>) -> Self {
        Self::with_status(OperationResultStatus::FatalError, message)
    }
}

/// 进程内唯一的轻量级标识
///
/// 格式为 `<进程启动毫秒>-<序号>`，不持久化，用于关联内存中的任务实例。
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LightweightIdentifier(String);

impl LightweightIdentifier {
    pub fn generate() -> Self {
        static PROCESS_START: OnceLock<i64> = OnceLock::new();
        static SEQUENCE: AtomicU64 = AtomicU64::new(0);

        let start = *PROCESS_START.get_or_init(|| Utc::now().timestamp_millis());
        let seq = SEQUENCE.fetch_add(1, Ordering::Relaxed);
        Self(format!("{start}-{seq}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for LightweightIdentifier {
    fn default() -> Self {
        Self::generate()
    }
}

impl fmt::Display for LightweightIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// 任务
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// 持久化对象ID，轻量级任务为空
    pub oid: Option<String>,
    #[serde(skip)]
    pub lightweight_id: LightweightIdentifier,
    #[serde(default)]
    pub version: u64,
    pub name: String,
    pub handler_uri: Option<String>,
    #[serde(default)]
    pub other_handlers_uri_stack: Vec<UriStackEntry>,
    pub category: Option<String>,
    pub object_ref: Option<String>,
    pub execution_status: TaskExecutionStatus,
    pub waiting_reason: Option<WaitingReason>,
    pub recurrence: TaskRecurrence,
    pub binding: TaskBinding,
    pub schedule: Option<ScheduleSpec>,
    pub last_run_start_timestamp: Option<DateTime<Utc>>,
    pub last_run_finish_timestamp: Option<DateTime<Utc>>,
    pub completion_timestamp: Option<DateTime<Utc>>,
    pub stalled_since: Option<DateTime<Utc>>,
    #[serde(default)]
    pub thread_stop_action: ThreadStopAction,
    /// 正在运行或最后运行该任务的节点
    pub node: Option<String>,
    #[serde(default)]
    pub depends_on: Vec<String>,
    pub parent: Option<String>,
    pub owner: Option<String>,
    #[serde(default)]
    pub progress: u64,
    pub result: Option<OperationResult>,
    #[serde(default)]
    pub extension: BTreeMap<String, Value>,
    pub created_at: Option<DateTime<Utc>>,

    /// 集群状态中观察到正在执行该任务的节点（不持久化）
    #[serde(skip)]
    pub node_as_observed: Option<String>,
    /// 计算得到的下次运行时间（不持久化）
    #[serde(skip)]
    pub next_run_start_time: Option<DateTime<Utc>>,
}

impl Task {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            oid: None,
            lightweight_id: LightweightIdentifier::generate(),
            version: 0,
            name: name.into(),
            handler_uri: None,
            other_handlers_uri_stack: Vec::new(),
            category: None,
            object_ref: None,
            execution_status: TaskExecutionStatus::Runnable,
            waiting_reason: None,
            recurrence: TaskRecurrence::Single,
            binding: TaskBinding::Loose,
            schedule: None,
            last_run_start_timestamp: None,
            last_run_finish_timestamp: None,
            completion_timestamp: None,
            stalled_since: None,
            thread_stop_action: ThreadStopAction::default(),
            node: None,
            depends_on: Vec::new(),
            parent: None,
            owner: None,
            progress: 0,
            result: None,
            extension: BTreeMap::new(),
            created_at: None,
            node_as_observed: None,
            next_run_start_time: None,
        }
    }

    pub fn with_handler(mut self, handler_uri: impl Into<String>) -> Self {
        self.handler_uri = Some(handler_uri.into());
        self
    }

    pub fn with_oid(mut self, oid: impl Into<String>) -> Self {
        self.oid = Some(oid.into());
        self
    }

    /// 设为循环任务
    pub fn recurring(mut self, binding: TaskBinding, schedule: ScheduleSpec) -> Self {
        self.recurrence = TaskRecurrence::Recurring;
        self.binding = binding;
        self.schedule = Some(schedule);
        self
    }

    pub fn with_schedule(mut self, schedule: ScheduleSpec) -> Self {
        self.schedule = Some(schedule);
        self
    }

    pub fn with_status(mut self, status: TaskExecutionStatus) -> Self {
        self.execution_status = status;
        self
    }

    pub fn with_parent(mut self, parent: impl Into<String>) -> Self {
        self.parent = Some(parent.into());
        self
    }

    pub fn with_depends_on(mut self, oid: impl Into<String>) -> Self {
        self.depends_on.push(oid.into());
        self
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = Some(owner.into());
        self
    }

    pub fn with_object_ref(mut self, object_ref: impl Into<String>) -> Self {
        self.object_ref = Some(object_ref.into());
        self
    }

    pub fn with_thread_stop_action(mut self, action: ThreadStopAction) -> Self {
        self.thread_stop_action = action;
        self
    }

    pub fn with_extension(mut self, name: impl Into<String>, value: Value) -> Self {
        self.extension.insert(name.into(), value);
        self
    }

    pub fn is_persistent(&self) -> bool {
        self.oid.is_some()
    }

    pub fn is_recurring(&self) -> bool {
        self.recurrence == TaskRecurrence::Recurring
    }

    pub fn is_single(&self) -> bool {
        self.recurrence == TaskRecurrence::Single
    }

    pub fn is_tight_bound(&self) -> bool {
        self.binding == TaskBinding::Tight
    }

    pub fn is_loose_bound(&self) -> bool {
        self.binding == TaskBinding::Loose
    }

    pub fn is_closed(&self) -> bool {
        self.execution_status == TaskExecutionStatus::Closed
    }

    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }

    /// 用于日志和错误信息的标识
    pub fn display_id(&self) -> String {
        match &self.oid {
            Some(oid) => oid.clone(),
            None => format!("轻量级:{}", self.lightweight_id),
        }
    }

    pub fn dry_run(&self) -> bool {
        self.extension
            .get(EXTENSION_DRY_RUN)
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    pub fn worker_threads(&self) -> Option<u32> {
        self.extension
            .get(EXTENSION_WORKER_THREADS)
            .and_then(Value::as_u64)
            .and_then(|n| u32::try_from(n).ok())
    }

    pub fn extension_value(&self, name: &str) -> Option<&Value> {
        self.extension.get(name)
    }

    /// 计算事件作用后的执行状态，不修改任务本身
    pub fn next_status(&self, event: TaskEvent) -> TaskManagerResult<TaskExecutionStatus> {
        self.execution_status
            .apply(event, self.recurrence)
            .map_err(|e| TaskManagerError::state_conflict(self.display_id(), e.to_string()))
    }

    /// 弹出处理器栈，切换到下一个处理器及其调度设置；栈为空时返回 false
    pub fn pop_handler(&mut self) -> bool {
        let Some(entry) = self.other_handlers_uri_stack.pop() else {
            return false;
        };

        self.handler_uri = Some(entry.handler_uri);
        if let Some(recurrence) = entry.recurrence {
            self.recurrence = recurrence;
        }
        if let Some(binding) = entry.binding {
            self.binding = binding;
        }
        if entry.schedule.is_some() {
            self.schedule = entry.schedule;
        }
        true
    }

    pub fn validate(&self) -> TaskManagerResult<()> {
        if self.name.trim().is_empty() {
            return Err(TaskManagerError::SchemaViolation(
                "任务名称不能为空".to_string(),
            ));
        }

        if let Some(schedule) = &self.schedule {
            schedule.validate()?;
        }

        if self.is_recurring()
            && !self
                .schedule
                .as_ref()
                .is_some_and(ScheduleSpec::has_recurrence)
        {
            return Err(TaskManagerError::SchemaViolation(format!(
                "循环任务 {} 必须设置调度间隔或CRON表达式",
                self.name
            )));
        }

        Ok(())
    }
}
