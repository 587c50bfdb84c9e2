//! 作业执行器
//!
//! 调度引擎触发作业时运行：认领任务、运行处理器链、写回运行结果并重新同步触发器。
//! 所有状态写入都带状态守卫，运行期间被并发挂起的任务保持挂起。

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use taskmgr_core::{Clock, TaskManagerResult};
use taskmgr_dispatcher::{JobExecutionContext, JobRunner, ScheduleAnchor, TaskSynchronizer};
use taskmgr_domain::{
    LightweightIdentifier, ModifyGuard, OperationResult, OperationResultStatus, Task, TaskDelta,
    TaskExecutionStatus, TaskRepository,
};
use taskmgr_infrastructure::MetricsCollector;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::dependencies::DependencyResolver;
use crate::handler::{TaskHandlerRegistry, TaskRunResult, TaskRunResultStatus};
use crate::listeners::TaskListenerRegistry;
use crate::recovery::TaskRecovery;
use crate::running_task::{LocalRunningTasks, RunningTask};
use crate::subtask_runner::LightweightTaskRunner;

/// 处理器链的执行结果
#[derive(Debug, Clone, PartialEq)]
pub enum ChainOutcome {
    Completed(TaskRunResult),
    /// 当前处理器URI没有注册处理器
    MissingHandler(Option<String>),
}

pub struct TaskJobExecutor {
    node_id: String,
    tasks: Arc<dyn TaskRepository>,
    synchronizer: Arc<TaskSynchronizer>,
    handlers: Arc<TaskHandlerRegistry>,
    running: Arc<LocalRunningTasks>,
    listeners: Arc<TaskListenerRegistry>,
    lightweight: Arc<LightweightTaskRunner>,
    recovery: Arc<TaskRecovery>,
    dependencies: Arc<DependencyResolver>,
    clock: Arc<dyn Clock>,
    metrics: MetricsCollector,
}

impl TaskJobExecutor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        node_id: impl Into<String>,
        tasks: Arc<dyn TaskRepository>,
        synchronizer: Arc<TaskSynchronizer>,
        handlers: Arc<TaskHandlerRegistry>,
        running: Arc<LocalRunningTasks>,
        listeners: Arc<TaskListenerRegistry>,
        lightweight: Arc<LightweightTaskRunner>,
        recovery: Arc<TaskRecovery>,
        dependencies: Arc<DependencyResolver>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            tasks,
            synchronizer,
            handlers,
            running,
            listeners,
            lightweight,
            recovery,
            dependencies,
            clock,
            metrics: MetricsCollector::new(),
        }
    }

    /// 运行一个任务作业，返回本节点是否实际运行了它
    pub async fn run_job(&self, oid: &str) -> TaskManagerResult<bool> {
        let task = match self.tasks.get(oid).await {
            Ok(task) => task,
            Err(e) if e.is_not_found() => {
                warn!(task_oid = oid, "作业对应的任务不存在，删除调度作业");
                self.synchronizer.remove_task(oid).await?;
                return Ok(false);
            }
            Err(e) => return Err(e),
        };

        if task.execution_status != TaskExecutionStatus::Runnable {
            debug!(
                task_oid = oid,
                status = %task.execution_status,
                "任务不处于可运行状态，跳过本次触发"
            );
            return Ok(false);
        }

        let now = self.clock.now();
        if task.is_single()
            && task
                .schedule
                .as_ref()
                .and_then(|s| s.latest_start)
                .is_some_and(|latest| now > latest)
        {
            self.close_expired(&task, now).await?;
            return Ok(false);
        }

        let claimed = match self
            .tasks
            .modify(
                oid,
                &[
                    TaskDelta::ExecutionStatus(TaskExecutionStatus::Running),
                    TaskDelta::Node(Some(self.node_id.clone())),
                    TaskDelta::LastRunStartTimestamp(Some(now)),
                    TaskDelta::Result(Some(OperationResult::in_progress())),
                    TaskDelta::StalledSince(None),
                    TaskDelta::Progress(0),
                ],
                Some(&ModifyGuard::status(TaskExecutionStatus::Runnable)),
            )
            .await
        {
            Ok(task) => task,
            Err(e) if e.is_state_conflict() || e.is_not_found() => {
                debug!(task_oid = oid, "任务已被并发修改，放弃本次运行: {}", e);
                return Ok(false);
            }
            Err(e) => return Err(e),
        };

        self.run_claimed(claimed).await;
        Ok(true)
    }

    async fn close_expired(&self, task: &Task, now: DateTime<Utc>) -> TaskManagerResult<()> {
        let oid = task.oid.as_deref().unwrap_or_default();
        let closed = match self
            .tasks
            .modify(
                oid,
                &[
                    TaskDelta::ExecutionStatus(TaskExecutionStatus::Closed),
                    TaskDelta::CompletionTimestamp(Some(now)),
                    TaskDelta::Result(Some(OperationResult::with_status(
                        OperationResultStatus::NotApplicable,
                        "已超过最晚开始时间，任务未运行",
                    ))),
                ],
                Some(&ModifyGuard::status(TaskExecutionStatus::Runnable)),
            )
            .await
        {
            Ok(task) => task,
            Err(e) if e.is_state_conflict() => return Ok(()),
            Err(e) => return Err(e),
        };

        info!(task_oid = oid, "单次任务已超过最晚开始时间，直接关闭");
        self.synchronizer.synchronize_task(&closed).await?;
        self.unpause_dependents(&closed).await;
        Ok(())
    }

    async fn run_claimed(&self, mut task: Task) {
        task.lightweight_id = LightweightIdentifier::generate();
        let oid = task.oid.clone().unwrap_or_default();
        let running = Arc::new(RunningTask::new(
            task,
            CancellationToken::new(),
            self.clock.clone(),
        ));
        running.attach_subtask_runner(&self.lightweight);
        self.running.register(running.clone());
        self.metrics.record_task_started();
        info!(task_oid = %oid, node_id = %self.node_id, "任务开始运行");

        let snapshot = running.task();
        self.listeners.task_thread_started(&snapshot);

        let initial_stack = snapshot.other_handlers_uri_stack.len();
        let outcome = self.run_handler_chain(&running).await;
        let handler_switched = running.task().other_handlers_uri_stack.len() != initial_stack;
        let children = self.lightweight.wait_for_transient_children(&running).await;
        if children > 0 {
            debug!(task_oid = %oid, children, "轻量级子任务已全部结束");
        }

        let finished_at = self.clock.now();
        let outcome_label = match &outcome {
            ChainOutcome::Completed(result) => result.status.as_str(),
            ChainOutcome::MissingHandler(_) => "missing_handler",
        };
        if let Err(e) = self
            .persist_outcome(&running, &outcome, handler_switched, finished_at)
            .await
        {
            error!(task_oid = %oid, "写回任务运行结果失败: {}", e);
        }

        self.running.remove(running.lightweight_id());
        self.metrics.record_task_finished(outcome_label);
        self.listeners.task_thread_finished(&running.task());
        info!(task_oid = %oid, outcome = outcome_label, "任务运行结束");
    }

    /// 依次运行处理器栈，`FinishedHandler` 时切换到下一个处理器
    pub async fn run_handler_chain(&self, running: &Arc<RunningTask>) -> ChainOutcome {
        loop {
            let snapshot = running.task();
            let Some(handler) = snapshot
                .handler_uri
                .as_deref()
                .and_then(|uri| self.handlers.get(uri))
            else {
                return ChainOutcome::MissingHandler(snapshot.handler_uri.clone());
            };

            self.listeners.task_started(&snapshot);
            let result = match AssertUnwindSafe(handler.run(running.clone()))
                .catch_unwind()
                .await
            {
                Ok(result) => result,
                Err(_) => {
                    error!(task = %snapshot.display_id(), "任务处理器发生panic");
                    TaskRunResult::permanent_error("任务处理器异常终止")
                }
            };
            if let Some(progress) = result.progress {
                running.record_progress(progress);
            }
            self.listeners.task_finished(&running.task(), &result);

            if result.status == TaskRunResultStatus::FinishedHandler {
                if running.is_cancelled() {
                    return ChainOutcome::Completed(TaskRunResult::interrupted());
                }
                if running.update_task(Task::pop_handler) {
                    debug!(task = %snapshot.display_id(), "切换到处理器栈中的下一个处理器");
                    continue;
                }
                return ChainOutcome::Completed(TaskRunResult {
                    status: TaskRunResultStatus::Finished,
                    ..result
                });
            }
            return ChainOutcome::Completed(result);
        }
    }

    async fn persist_outcome(
        &self,
        running: &RunningTask,
        outcome: &ChainOutcome,
        handler_switched: bool,
        finished_at: DateTime<Utc>,
    ) -> TaskManagerResult<()> {
        let task = running.task();
        let oid = task.oid.clone().unwrap_or_default();

        let mut deltas = vec![
            TaskDelta::LastRunFinishTimestamp(Some(finished_at)),
            TaskDelta::Progress(running.progress()),
            TaskDelta::StalledSince(None),
        ];
        if handler_switched {
            deltas.extend([
                TaskDelta::HandlerUri(task.handler_uri.clone()),
                TaskDelta::OtherHandlersUriStack(task.other_handlers_uri_stack.clone()),
                TaskDelta::Recurrence(task.recurrence),
                TaskDelta::Binding(task.binding),
                TaskDelta::Schedule(task.schedule.clone()),
            ]);
        }

        let mut stop_action = None;
        let status = match outcome {
            ChainOutcome::MissingHandler(uri) => {
                let message = format!("未找到处理器: {}", uri.as_deref().unwrap_or("<空>"));
                error!(task_oid = %oid, "{}", message);
                deltas.push(TaskDelta::Result(Some(OperationResult::fatal_error(message))));
                TaskExecutionStatus::Suspended
            }
            ChainOutcome::Completed(result) => {
                deltas.push(TaskDelta::Result(Some(result.effective_operation_result())));
                match result.status {
                    TaskRunResultStatus::PermanentError => TaskExecutionStatus::Suspended,
                    TaskRunResultStatus::Interrupted => {
                        let action = task.thread_stop_action;
                        stop_action = Some(action);
                        let (status, extra) =
                            TaskRecovery::stop_action_deltas(action, finished_at, "任务运行被中断");
                        deltas.extend(
                            extra
                                .into_iter()
                                .filter(|d| !matches!(d, TaskDelta::ExecutionStatus(_))),
                        );
                        status
                    }
                    TaskRunResultStatus::Finished
                    | TaskRunResultStatus::FinishedHandler
                    | TaskRunResultStatus::TemporaryError => {
                        if task.is_recurring() {
                            TaskExecutionStatus::Runnable
                        } else {
                            deltas.push(TaskDelta::CompletionTimestamp(Some(finished_at)));
                            TaskExecutionStatus::Closed
                        }
                    }
                }
            }
        };
        deltas.insert(0, TaskDelta::ExecutionStatus(status));

        let updated = match self
            .tasks
            .modify(
                &oid,
                &deltas,
                Some(&ModifyGuard::status(TaskExecutionStatus::Running)),
            )
            .await
        {
            Ok(updated) => updated,
            Err(e) if e.is_state_conflict() => {
                // 运行期间任务被挂起或关闭：保留当前状态，只记录本次运行信息
                info!(task_oid = %oid, "任务状态已被并发修改，保留当前状态");
                let run_info: Vec<TaskDelta> = deltas
                    .into_iter()
                    .filter(|d| {
                        matches!(
                            d,
                            TaskDelta::LastRunFinishTimestamp(_)
                                | TaskDelta::Progress(_)
                                | TaskDelta::Result(_)
                        )
                    })
                    .collect();
                match self.tasks.modify(&oid, &run_info, None).await {
                    Ok(_) => {}
                    Err(e) if e.is_not_found() => {}
                    Err(e) => return Err(e),
                }
                return Ok(());
            }
            Err(e) if e.is_not_found() => {
                info!(task_oid = %oid, "任务在运行期间被删除");
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        if status == TaskExecutionStatus::Suspended {
            self.metrics.record_task_suspended();
        }

        match stop_action {
            Some(action) => {
                self.recovery.after_stop(&updated, action, finished_at).await;
            }
            None => {
                let synced = if updated.execution_status == TaskExecutionStatus::Runnable
                    && updated.is_loose_bound()
                {
                    self.synchronizer
                        .reschedule_task(&updated, ScheduleAnchor::AfterRun(finished_at))
                        .await
                        .map(|_| ())
                } else {
                    self.synchronizer.synchronize_task(&updated).await.map(|_| ())
                };
                if let Err(e) = synced {
                    warn!(task_oid = %oid, "运行结束后同步触发器失败: {}", e);
                }
            }
        }

        if updated.execution_status == TaskExecutionStatus::Closed {
            self.unpause_dependents(&updated).await;
        }
        Ok(())
    }

    async fn unpause_dependents(&self, closed: &Task) {
        match self.dependencies.on_task_closed(closed).await {
            Ok(unpaused) if !unpaused.is_empty() => {
                debug!(task_oid = ?closed.oid, ?unpaused, "已恢复等待中的任务");
            }
            Ok(_) => {}
            Err(e) => warn!(task_oid = ?closed.oid, "恢复等待中的任务失败: {}", e),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }
}

#[async_trait]
impl JobRunner for TaskJobExecutor {
    async fn execute(&self, context: JobExecutionContext) {
        debug!(
            job = %context.job_key,
            trigger = %context.trigger.key.name,
            scheduled = %context.scheduled_fire_time,
            "作业被触发"
        );
        if let Err(e) = self.run_job(&context.job_key).await {
            error!(task_oid = %context.job_key, "运行任务作业失败: {}", e);
        }
    }
}
