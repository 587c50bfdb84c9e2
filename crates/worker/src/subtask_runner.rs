//! 轻量级子任务运行器
//!
//! 在有界的执行池上运行不持久化的子任务。每个子任务返回一个可等待、可取消的句柄；
//! 无论正常结束、出错、panic还是被取消，任务都只会被关闭一次。

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt, Shared};
use taskmgr_core::{Clock, TaskManagerError, TaskManagerResult};
use taskmgr_domain::{Task, TaskExecutionStatus};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::handler::{TaskHandler, TaskRunResult};
use crate::running_task::RunningTask;

/// 子任务结束后的结果
#[derive(Debug, Clone)]
pub struct LightweightOutcome {
    /// 关闭后的任务
    pub task: Task,
    /// 处理器正常返回时的结果
    pub result: Option<TaskRunResult>,
    /// 处理器panic等异常结束时的错误信息
    pub error: Option<String>,
}

impl LightweightOutcome {
    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

type Completion = Shared<BoxFuture<'static, Arc<LightweightOutcome>>>;

struct LightweightEntry {
    running: Arc<RunningTask>,
    completion: Completion,
}

/// 轻量级子任务句柄
#[derive(Clone)]
pub struct LightweightTaskHandle {
    running: Arc<RunningTask>,
    completion: Completion,
}

impl LightweightTaskHandle {
    pub fn lightweight_id(&self) -> &str {
        self.running.lightweight_id()
    }

    pub fn running_task(&self) -> &Arc<RunningTask> {
        &self.running
    }

    /// 请求协作式停止
    pub fn cancel(&self) {
        self.running.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.completion.peek().is_some()
    }

    pub async fn wait(&self) -> Arc<LightweightOutcome> {
        self.completion.clone().await
    }

    /// 请求停止并等待处理器真正退出，超时返回 None
    pub async fn cancel_and_wait(&self, timeout: Duration) -> Option<Arc<LightweightOutcome>> {
        self.cancel();
        tokio::time::timeout(timeout, self.wait()).await.ok()
    }
}

impl fmt::Debug for LightweightTaskHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LightweightTaskHandle")
            .field("lightweight_id", &self.lightweight_id())
            .field("finished", &self.is_finished())
            .finish()
    }
}

pub struct LightweightTaskRunner {
    permits: Arc<Semaphore>,
    registry: Arc<Mutex<HashMap<String, LightweightEntry>>>,
    clock: Arc<dyn Clock>,
}

impl LightweightTaskRunner {
    pub fn new(pool_size: usize, clock: Arc<dyn Clock>) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(pool_size.max(1))),
            registry: Arc::new(Mutex::new(HashMap::new())),
            clock,
        }
    }

    /// 启动一个轻量级任务；`parent` 为发起它的运行中任务，取消会传递给子任务
    pub fn start(
        self: &Arc<Self>,
        task: Task,
        handler: Arc<dyn TaskHandler>,
        parent: Option<&Arc<RunningTask>>,
    ) -> TaskManagerResult<LightweightTaskHandle> {
        if task.is_persistent() {
            return Err(TaskManagerError::SchemaViolation(format!(
                "任务 {} 已持久化，不能作为轻量级任务运行",
                task.display_id()
            )));
        }
        if task.execution_status != TaskExecutionStatus::Runnable {
            return Err(TaskManagerError::state_conflict(
                task.display_id(),
                format!("任务已启动或已结束，当前状态 {}", task.execution_status),
            ));
        }

        let lightweight_id = task.lightweight_id.to_string();
        let mut registry = self.registry.lock().unwrap_or_else(PoisonError::into_inner);
        if registry.contains_key(&lightweight_id) {
            return Err(TaskManagerError::state_conflict(
                task.display_id(),
                "轻量级任务已经启动",
            ));
        }

        let now = self.clock.now();
        let mut task = task;
        task.execution_status = TaskExecutionStatus::Running;
        task.last_run_start_timestamp = Some(now);
        if let Some(parent) = parent {
            if task.parent.is_none() {
                task.parent = parent.oid().map(str::to_string);
            }
        }

        let cancel = parent.map_or_else(CancellationToken::new, |p| {
            p.cancellation_token().child_token()
        });
        let running = Arc::new(RunningTask::new(task, cancel, self.clock.clone()));
        running.attach_subtask_runner(self);
        if let Some(parent) = parent {
            parent.add_child(lightweight_id.clone());
        }

        let join = tokio::spawn(Self::run(
            running.clone(),
            handler,
            self.permits.clone(),
            self.registry.clone(),
            self.clock.clone(),
        ));

        let fallback = running.clone();
        let fallback_clock = self.clock.clone();
        let completion: Completion = async move {
            match join.await {
                Ok(outcome) => outcome,
                Err(e) => {
                    // 运行时关闭等情况下执行体没有完成，仍然保证任务被关闭
                    let task = fallback
                        .close(fallback_clock.now())
                        .unwrap_or_else(|| fallback.task());
                    Arc::new(LightweightOutcome {
                        task,
                        result: None,
                        error: Some(format!("轻量级任务执行体异常结束: {e}")),
                    })
                }
            }
        }
        .boxed()
        .shared();

        registry.insert(
            lightweight_id.clone(),
            LightweightEntry {
                running: running.clone(),
                completion: completion.clone(),
            },
        );
        debug!(lightweight_id = %lightweight_id, "轻量级任务已启动");

        Ok(LightweightTaskHandle {
            running,
            completion,
        })
    }

    async fn run(
        running: Arc<RunningTask>,
        handler: Arc<dyn TaskHandler>,
        permits: Arc<Semaphore>,
        registry: Arc<Mutex<HashMap<String, LightweightEntry>>>,
        clock: Arc<dyn Clock>,
    ) -> Arc<LightweightOutcome> {
        let (result, error) = match permits.acquire_owned().await {
            Ok(_permit) => {
                if running.is_cancelled() {
                    (Some(TaskRunResult::interrupted()), None)
                } else {
                    match std::panic::AssertUnwindSafe(handler.run(running.clone()))
                        .catch_unwind()
                        .await
                    {
                        Ok(result) => (Some(result), None),
                        Err(_) => (None, Some("轻量级任务处理器发生panic".to_string())),
                    }
                }
            }
            Err(e) => (None, Some(format!("轻量级任务执行池已关闭: {e}"))),
        };

        let task = running
            .close(clock.now())
            .unwrap_or_else(|| running.task());
        registry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(running.lightweight_id());

        if let Some(error) = &error {
            warn!(lightweight_id = %running.lightweight_id(), "{}", error);
        } else {
            debug!(lightweight_id = %running.lightweight_id(), "轻量级任务已结束");
        }

        Arc::new(LightweightOutcome {
            task,
            result,
            error,
        })
    }

    pub fn get(&self, lightweight_id: &str) -> Option<LightweightTaskHandle> {
        self.registry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(lightweight_id)
            .map(|entry| LightweightTaskHandle {
                running: entry.running.clone(),
                completion: entry.completion.clone(),
            })
    }

    pub fn cancel(&self, lightweight_id: &str) -> bool {
        match self.get(lightweight_id) {
            Some(handle) => {
                handle.cancel();
                true
            }
            None => false,
        }
    }

    pub fn running_tasks(&self) -> Vec<Arc<RunningTask>> {
        self.registry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(|entry| entry.running.clone())
            .collect()
    }

    pub fn running_count(&self) -> usize {
        self.registry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// 等待父任务的全部轻量级子任务结束
    ///
    /// 子任务自身的错误只记录日志；等待期间新启动的子任务同样会被等待。返回等待的子任务数。
    pub async fn wait_for_transient_children(&self, parent: &RunningTask) -> usize {
        let mut waited = 0;
        loop {
            let pending: Vec<Completion> = {
                let registry = self.registry.lock().unwrap_or_else(PoisonError::into_inner);
                parent
                    .children()
                    .iter()
                    .filter_map(|id| registry.get(id))
                    .map(|entry| entry.completion.clone())
                    .collect()
            };
            if pending.is_empty() {
                return waited;
            }

            for completion in pending {
                let outcome = completion.await;
                waited += 1;
                if let Some(error) = &outcome.error {
                    warn!(
                        parent = %parent.lightweight_id(),
                        child = %outcome.task.lightweight_id,
                        "轻量级子任务异常结束: {}",
                        error
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use taskmgr_core::ManualClock;

    use crate::handler::{NoOpTaskHandler, TaskRunResultStatus};

    struct Panicking;

    #[async_trait]
    impl TaskHandler for Panicking {
        async fn run(&self, _task: Arc<RunningTask>) -> TaskRunResult {
            panic!("处理器崩溃")
        }
    }

    /// 睡眠一段时间后结束并计数
    struct Sleeping {
        delay: Duration,
        finished: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl TaskHandler for Sleeping {
        async fn run(&self, _task: Arc<RunningTask>) -> TaskRunResult {
            tokio::time::sleep(self.delay).await;
            self.finished.fetch_add(1, Ordering::SeqCst);
            TaskRunResult::finished()
        }
    }

    /// 等到取消后退出
    struct UntilCancelled;

    #[async_trait]
    impl TaskHandler for UntilCancelled {
        async fn run(&self, task: Arc<RunningTask>) -> TaskRunResult {
            task.cancelled().await;
            TaskRunResult::interrupted()
        }
    }

    fn parent_task(runner: &Arc<LightweightTaskRunner>) -> Arc<RunningTask> {
        let parent = Arc::new(RunningTask::new(
            Task::new("父任务").with_oid("p1"),
            CancellationToken::new(),
            Arc::new(ManualClock::starting_now()),
        ));
        parent.attach_subtask_runner(runner);
        parent
    }

    fn runner(pool_size: usize) -> Arc<LightweightTaskRunner> {
        Arc::new(LightweightTaskRunner::new(
            pool_size,
            Arc::new(ManualClock::starting_now()),
        ))
    }

    #[tokio::test]
    async fn test_completion_closes_task() {
        let runner = runner(2);
        let handle = runner
            .start(Task::new("子任务"), Arc::new(NoOpTaskHandler), None)
            .unwrap();

        let outcome = handle.wait().await;
        assert_eq!(outcome.task.execution_status, TaskExecutionStatus::Closed);
        assert!(outcome.task.completion_timestamp.is_some());
        assert!(!outcome.is_error());
        assert_eq!(runner.running_count(), 0);
    }

    #[tokio::test]
    async fn test_panic_still_closes_task() {
        let runner = runner(2);
        let handle = runner
            .start(Task::new("崩溃子任务"), Arc::new(Panicking), None)
            .unwrap();

        let outcome = handle.wait().await;
        assert!(outcome.is_error());
        assert_eq!(outcome.task.execution_status, TaskExecutionStatus::Closed);
    }

    #[tokio::test]
    async fn test_refuses_persistent_and_started_tasks() {
        let runner = runner(2);
        assert!(runner
            .start(Task::new("持久化").with_oid("t1"), Arc::new(NoOpTaskHandler), None)
            .is_err());

        let running = Task::new("运行中").with_status(TaskExecutionStatus::Running);
        assert!(runner
            .start(running, Arc::new(NoOpTaskHandler), None)
            .unwrap_err()
            .is_state_conflict());
    }

    #[tokio::test]
    async fn test_parent_waits_for_transient_children() {
        let runner = runner(4);
        let parent = parent_task(&runner);
        let finished = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for delay in [50, 150] {
            let handler = Arc::new(Sleeping {
                delay: Duration::from_millis(delay),
                finished: finished.clone(),
            });
            handles.push(
                parent
                    .start_transient_subtask(Task::new("子任务"), handler)
                    .unwrap(),
            );
        }
        assert_eq!(parent.children().len(), 2);

        assert_eq!(runner.wait_for_transient_children(&parent).await, 2);
        assert_eq!(finished.load(Ordering::SeqCst), 2);
        for handle in &handles {
            assert!(handle.is_finished());
            let outcome = handle.wait().await;
            assert_eq!(outcome.task.parent.as_deref(), Some("p1"));
            assert_eq!(outcome.task.execution_status, TaskExecutionStatus::Closed);
        }
        assert_eq!(runner.running_count(), 0);

        // 子任务都结束后不再等待
        assert_eq!(runner.wait_for_transient_children(&parent).await, 0);
    }

    #[tokio::test]
    async fn test_parent_cancellation_reaches_children() {
        let runner = runner(4);
        let parent = parent_task(&runner);
        let child = parent
            .start_transient_subtask(Task::new("等待取消"), Arc::new(UntilCancelled))
            .unwrap();
        let unrelated = runner
            .start(Task::new("独立任务"), Arc::new(UntilCancelled), None)
            .unwrap();

        parent.cancel();
        let outcome = tokio::time::timeout(Duration::from_secs(5), child.wait())
            .await
            .unwrap();
        assert_eq!(
            outcome.result.as_ref().unwrap().status,
            TaskRunResultStatus::Interrupted
        );
        assert!(!unrelated.running_task().is_cancelled());

        unrelated
            .cancel_and_wait(Duration::from_secs(5))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_child_panic_does_not_reach_parent() {
        let runner = runner(4);
        let parent = parent_task(&runner);
        let finished = Arc::new(AtomicUsize::new(0));

        let crashed = parent
            .start_transient_subtask(Task::new("崩溃子任务"), Arc::new(Panicking))
            .unwrap();
        parent
            .start_transient_subtask(
                Task::new("慢子任务"),
                Arc::new(Sleeping {
                    delay: Duration::from_millis(100),
                    finished: finished.clone(),
                }),
            )
            .unwrap();

        assert_eq!(runner.wait_for_transient_children(&parent).await, 2);
        assert_eq!(finished.load(Ordering::SeqCst), 1);
        assert!(crashed.wait().await.is_error());
        assert!(!parent.is_cancelled());
    }

    #[tokio::test]
    async fn test_subtask_needs_attached_runner() {
        let parent = Arc::new(RunningTask::new(
            Task::new("未绑定"),
            CancellationToken::new(),
            Arc::new(ManualClock::starting_now()),
        ));
        let err = parent
            .start_transient_subtask(Task::new("子任务"), Arc::new(NoOpTaskHandler))
            .unwrap_err();
        assert!(err.is_state_conflict());
    }
}
