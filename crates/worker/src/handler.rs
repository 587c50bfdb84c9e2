//! 任务处理器及其注册表

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use taskmgr_core::{TaskManagerError, TaskManagerResult};
use taskmgr_domain::{OperationResult, OperationResultStatus};
use tracing::debug;

use crate::running_task::RunningTask;

/// 内置空处理器的URI
pub const NOOP_HANDLER_URI: &str = "taskmgr:noop";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskRunResultStatus {
    /// 本次运行完成
    Finished,
    /// 当前处理器已完成，继续处理器栈中的下一个
    FinishedHandler,
    /// 被取消请求中断
    Interrupted,
    /// 无法恢复的错误，任务将被挂起
    PermanentError,
    /// 临时错误，循环任务在下次调度时重试
    TemporaryError,
}

impl TaskRunResultStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Finished => "finished",
            Self::FinishedHandler => "finished_handler",
            Self::Interrupted => "interrupted",
            Self::PermanentError => "permanent_error",
            Self::TemporaryError => "temporary_error",
        }
    }
}

/// 一次处理器运行的结果
#[derive(Debug, Clone, PartialEq)]
pub struct TaskRunResult {
    pub status: TaskRunResultStatus,
    pub progress: Option<u64>,
    pub operation_result: Option<OperationResult>,
    pub message: Option<String>,
}

impl TaskRunResult {
    pub fn new(status: TaskRunResultStatus) -> Self {
        Self {
            status,
            progress: None,
            operation_result: None,
            message: None,
        }
    }

    pub fn finished() -> Self {
        Self::new(TaskRunResultStatus::Finished)
    }

    pub fn finished_handler() -> Self {
        Self::new(TaskRunResultStatus::FinishedHandler)
    }

    pub fn interrupted() -> Self {
        Self::new(TaskRunResultStatus::Interrupted)
    }

    pub fn permanent_error(message: impl Into<String>) -> Self {
        Self::new(TaskRunResultStatus::PermanentError).with_message(message)
    }

    pub fn temporary_error(message: impl Into<String>) -> Self {
        Self::new(TaskRunResultStatus::TemporaryError).with_message(message)
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_progress(mut self, progress: u64) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn with_operation_result(mut self, result: OperationResult) -> Self {
        self.operation_result = Some(result);
        self
    }

    /// 写回任务的操作结果，处理器未提供时按运行结果生成
    pub fn effective_operation_result(&self) -> OperationResult {
        if let Some(result) = &self.operation_result {
            return result.clone();
        }

        let message = self.message.clone();
        let status = match self.status {
            TaskRunResultStatus::Finished | TaskRunResultStatus::FinishedHandler => {
                OperationResultStatus::Success
            }
            TaskRunResultStatus::Interrupted => OperationResultStatus::Warning,
            TaskRunResultStatus::TemporaryError => OperationResultStatus::PartialError,
            TaskRunResultStatus::PermanentError => OperationResultStatus::FatalError,
        };
        OperationResult { status, message }
    }
}

/// 任务处理器
///
/// 按处理器URI注册，任务触发时以正在运行的任务实例调用。
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn run(&self, task: Arc<RunningTask>) -> TaskRunResult;

    /// 处理器的默认任务类别
    fn category(&self) -> Option<&str> {
        None
    }
}

/// 处理器URI到处理器的注册表，只允许追加
#[derive(Default)]
pub struct TaskHandlerRegistry {
    handlers: RwLock<HashMap<String, Arc<dyn TaskHandler>>>,
}

impl TaskHandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &self,
        uri: impl Into<String>,
        handler: Arc<dyn TaskHandler>,
    ) -> TaskManagerResult<()> {
        let uri = uri.into();
        let mut handlers = self.handlers.write().unwrap_or_else(PoisonError::into_inner);
        if handlers.contains_key(&uri) {
            return Err(TaskManagerError::AlreadyExists {
                kind: "处理器",
                id: uri,
            });
        }
        debug!(handler_uri = %uri, "注册任务处理器");
        handlers.insert(uri, handler);
        Ok(())
    }

    pub fn get(&self, uri: &str) -> Option<Arc<dyn TaskHandler>> {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(uri)
            .cloned()
    }

    pub fn contains(&self, uri: &str) -> bool {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(uri)
    }

    pub fn uris(&self) -> Vec<String> {
        let mut uris: Vec<String> = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        uris.sort();
        uris
    }
}

/// 空处理器
///
/// 按扩展属性 `steps`（默认1）和 `delay_ms`（默认0）执行若干空步骤，每步汇报一次进度，
/// 收到取消请求时立即中断。用于演示和测试。
#[derive(Debug, Default, Clone, Copy)]
pub struct NoOpTaskHandler;

impl NoOpTaskHandler {
    fn extension_u64(task: &taskmgr_domain::Task, name: &str, default: u64) -> u64 {
        task.extension_value(name)
            .and_then(Value::as_u64)
            .unwrap_or(default)
    }
}

#[async_trait]
impl TaskHandler for NoOpTaskHandler {
    async fn run(&self, task: Arc<RunningTask>) -> TaskRunResult {
        let snapshot = task.task();
        let steps = Self::extension_u64(&snapshot, "steps", 1);
        let delay = Duration::from_millis(Self::extension_u64(&snapshot, "delay_ms", 0));

        for _ in 0..steps {
            if task.is_cancelled() {
                return TaskRunResult::interrupted().with_progress(task.progress());
            }
            if !delay.is_zero() {
                tokio::select! {
                    _ = task.cancelled() => {
                        return TaskRunResult::interrupted().with_progress(task.progress());
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            task.increment_progress();
        }

        TaskRunResult::finished().with_progress(task.progress())
    }

    fn category(&self) -> Option<&str> {
        Some("demo")
    }
}
