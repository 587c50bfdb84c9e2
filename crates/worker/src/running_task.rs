//! 内存中正在运行的任务实例

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError, RwLock, Weak};

use chrono::{DateTime, Utc};
use taskmgr_core::{Clock, TaskManagerError, TaskManagerResult};
use taskmgr_domain::{ExecutingTaskInfo, Task, TaskExecutionStatus};
use tokio_util::sync::CancellationToken;

use crate::handler::TaskHandler;
use crate::subtask_runner::{LightweightTaskHandle, LightweightTaskRunner};

/// 一个正在运行的任务实例
///
/// 处理器通过它读取任务快照、汇报进度并观察取消请求。取消是协作式的：
/// 处理器需要定期检查 [`RunningTask::is_cancelled`] 并自行退出。
#[derive(Debug)]
pub struct RunningTask {
    task: RwLock<Task>,
    lightweight_id: String,
    oid: Option<String>,
    cancel: CancellationToken,
    clock: Arc<dyn Clock>,
    started_at: DateTime<Utc>,
    progress: AtomicU64,
    last_progress_at: Mutex<DateTime<Utc>>,
    stalled_since: Mutex<Option<DateTime<Utc>>>,
    children: Mutex<Vec<String>>,
    subtask_runner: OnceLock<Weak<LightweightTaskRunner>>,
}

impl RunningTask {
    pub fn new(task: Task, cancel: CancellationToken, clock: Arc<dyn Clock>) -> Self {
        let now = clock.now();
        Self {
            lightweight_id: task.lightweight_id.to_string(),
            oid: task.oid.clone(),
            progress: AtomicU64::new(task.progress),
            task: RwLock::new(task),
            cancel,
            clock,
            started_at: now,
            last_progress_at: Mutex::new(now),
            stalled_since: Mutex::new(None),
            children: Mutex::new(Vec::new()),
            subtask_runner: OnceLock::new(),
        }
    }

    pub fn lightweight_id(&self) -> &str {
        &self.lightweight_id
    }

    pub fn oid(&self) -> Option<&str> {
        self.oid.as_deref()
    }

    pub fn display_id(&self) -> String {
        match &self.oid {
            Some(oid) => oid.clone(),
            None => format!("轻量级:{}", self.lightweight_id),
        }
    }

    /// 任务快照
    pub fn task(&self) -> Task {
        let mut task = self
            .task
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        task.progress = self.progress();
        task
    }

    pub fn update_task<R>(&self, f: impl FnOnce(&mut Task) -> R) -> R {
        let mut task = self.task.write().unwrap_or_else(PoisonError::into_inner);
        f(&mut task)
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// 请求处理器停止
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// 等待取消请求
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    pub fn progress(&self) -> u64 {
        self.progress.load(Ordering::Relaxed)
    }

    pub fn record_progress(&self, progress: u64) {
        self.progress.store(progress, Ordering::Relaxed);
        *self
            .last_progress_at
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = self.clock.now();
    }

    pub fn increment_progress(&self) -> u64 {
        let progress = self.progress.fetch_add(1, Ordering::Relaxed) + 1;
        *self
            .last_progress_at
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = self.clock.now();
        progress
    }

    pub fn last_progress_at(&self) -> DateTime<Utc> {
        *self
            .last_progress_at
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn stalled_since(&self) -> Option<DateTime<Utc>> {
        *self
            .stalled_since
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_stalled_since(&self, since: Option<DateTime<Utc>>) {
        *self
            .stalled_since
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = since;
    }

    pub fn add_child(&self, lightweight_id: impl Into<String>) {
        self.children
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(lightweight_id.into());
    }

    /// 轻量级子任务的标识
    pub fn children(&self) -> Vec<String> {
        self.children
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// 绑定启动子任务用的运行器，只有第一次绑定生效
    pub fn attach_subtask_runner(&self, runner: &Arc<LightweightTaskRunner>) {
        let _ = self.subtask_runner.set(Arc::downgrade(runner));
    }

    /// 以当前任务为父任务启动轻量级子任务
    ///
    /// 子任务继承父任务的取消；父任务结束前会等待全部子任务结束。
    pub fn start_transient_subtask(
        self: &Arc<Self>,
        task: Task,
        handler: Arc<dyn TaskHandler>,
    ) -> TaskManagerResult<LightweightTaskHandle> {
        let runner = self
            .subtask_runner
            .get()
            .and_then(Weak::upgrade)
            .ok_or_else(|| {
                TaskManagerError::state_conflict(self.display_id(), "任务没有可用的子任务运行器")
            })?;
        runner.start(task, handler, Some(self))
    }

    /// 关闭任务，仅第一次调用生效并返回关闭后的快照
    pub fn close(&self, now: DateTime<Utc>) -> Option<Task> {
        let mut task = self.task.write().unwrap_or_else(PoisonError::into_inner);
        if task.execution_status == TaskExecutionStatus::Closed {
            return None;
        }
        task.execution_status = TaskExecutionStatus::Closed;
        task.completion_timestamp = Some(now);
        task.last_run_finish_timestamp = Some(now);
        task.progress = self.progress();
        Some(task.clone())
    }

    pub fn executing_info(&self) -> ExecutingTaskInfo {
        let name = self
            .task
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .name
            .clone();
        ExecutingTaskInfo {
            oid: self.oid.clone(),
            lightweight_id: self.lightweight_id.clone(),
            name,
            started_at: self.started_at,
            progress: self.progress(),
            stalled_since: self.stalled_since(),
        }
    }
}

/// 本节点正在运行的持久化任务实例，按轻量级标识索引
#[derive(Debug, Default)]
pub struct LocalRunningTasks {
    tasks: Mutex<HashMap<String, Arc<RunningTask>>>,
}

impl LocalRunningTasks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, task: Arc<RunningTask>) {
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(task.lightweight_id().to_string(), task);
    }

    pub fn remove(&self, lightweight_id: &str) -> Option<Arc<RunningTask>> {
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(lightweight_id)
    }

    pub fn get(&self, lightweight_id: &str) -> Option<Arc<RunningTask>> {
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(lightweight_id)
            .cloned()
    }

    pub fn find_by_oid(&self, oid: &str) -> Option<Arc<RunningTask>> {
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .find(|task| task.oid() == Some(oid))
            .cloned()
    }

    pub fn list(&self) -> Vec<Arc<RunningTask>> {
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use taskmgr_core::ManualClock;

    #[test]
    fn test_progress_updates_last_progress_time() {
        let clock = Arc::new(ManualClock::starting_now());
        let task = RunningTask::new(Task::new("t"), CancellationToken::new(), clock.clone());
        let started = task.last_progress_at();

        clock.advance(Duration::seconds(5));
        assert_eq!(task.increment_progress(), 1);
        assert_eq!(task.last_progress_at(), started + Duration::seconds(5));
        assert_eq!(task.task().progress, 1);
    }

    #[test]
    fn test_close_happens_once() {
        let clock = Arc::new(ManualClock::starting_now());
        let task = RunningTask::new(Task::new("t"), CancellationToken::new(), clock.clone());

        let closed = task.close(clock.now()).unwrap();
        assert_eq!(closed.execution_status, TaskExecutionStatus::Closed);
        assert!(task.close(clock.now()).is_none());
    }

    #[test]
    fn test_registry_lookup_by_oid() {
        let clock = Arc::new(ManualClock::starting_now());
        let registry = LocalRunningTasks::new();
        let task = Arc::new(RunningTask::new(
            Task::new("t").with_oid("t1"),
            CancellationToken::new(),
            clock,
        ));
        registry.register(task.clone());

        assert!(registry.find_by_oid("t1").is_some());
        assert!(registry.find_by_oid("t2").is_none());
        registry.remove(task.lightweight_id());
        assert!(registry.is_empty());
    }
}
