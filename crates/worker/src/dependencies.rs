use std::sync::Arc;

use taskmgr_core::TaskManagerResult;
use taskmgr_dispatcher::TaskSynchronizer;
use taskmgr_domain::{
    ModifyGuard, Task, TaskDelta, TaskExecutionStatus, TaskQuery, TaskRepository,
};
use tracing::{debug, info, warn};

/// 前置任务全部关闭后恢复等待中的任务
pub struct DependencyResolver {
    tasks: Arc<dyn TaskRepository>,
    synchronizer: Arc<TaskSynchronizer>,
}

impl DependencyResolver {
    pub fn new(tasks: Arc<dyn TaskRepository>, synchronizer: Arc<TaskSynchronizer>) -> Self {
        Self {
            tasks,
            synchronizer,
        }
    }

    /// 任务关闭后检查依赖它的任务和它的父任务，返回被恢复的任务oid
    pub async fn on_task_closed(&self, closed: &Task) -> TaskManagerResult<Vec<String>> {
        let Some(oid) = closed.oid.as_deref() else {
            return Ok(Vec::new());
        };

        let mut candidates = self
            .tasks
            .search(
                &TaskQuery::all()
                    .depending_on(oid)
                    .with_statuses(&[TaskExecutionStatus::Waiting]),
            )
            .await?;

        if let Some(parent) = closed.parent.as_deref() {
            match self.tasks.get(parent).await {
                Ok(parent) if parent.execution_status == TaskExecutionStatus::Waiting => {
                    candidates.push(parent);
                }
                Ok(_) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
        }

        let mut unpaused = Vec::new();
        for candidate in candidates {
            let Some(candidate_oid) = candidate.oid.clone() else {
                continue;
            };
            if unpaused.contains(&candidate_oid) {
                continue;
            }

            match self.try_unpause(&candidate).await {
                Ok(true) => unpaused.push(candidate_oid),
                Ok(false) => {}
                Err(e) => warn!(task_oid = %candidate_oid, "恢复等待中的任务失败: {}", e),
            }
        }
        Ok(unpaused)
    }

    /// 全部前置任务和子任务都已关闭时返回 true
    pub async fn prerequisites_closed(&self, task: &Task) -> TaskManagerResult<bool> {
        for dependency in &task.depends_on {
            match self.tasks.get(dependency).await {
                Ok(dep) if !dep.is_closed() => return Ok(false),
                Ok(_) => {}
                // 已删除的前置任务视为已完成
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
        }

        if let Some(oid) = task.oid.as_deref() {
            let open_children = self
                .tasks
                .search(&TaskQuery::children_of(oid))
                .await?
                .into_iter()
                .any(|child| !child.is_closed());
            if open_children {
                return Ok(false);
            }
        }
        Ok(true)
    }

    async fn try_unpause(&self, task: &Task) -> TaskManagerResult<bool> {
        if !self.prerequisites_closed(task).await? {
            debug!(task_oid = ?task.oid, "前置任务尚未全部关闭");
            return Ok(false);
        }

        let oid = task.oid.as_deref().unwrap_or_default();
        let updated = match self
            .tasks
            .modify(
                oid,
                &[
                    TaskDelta::ExecutionStatus(TaskExecutionStatus::Runnable),
                    TaskDelta::WaitingReason(None),
                ],
                Some(&ModifyGuard::status(TaskExecutionStatus::Waiting)),
            )
            .await
        {
            Ok(updated) => updated,
            // 并发恢复或已被挂起
            Err(e) if e.is_state_conflict() => return Ok(false),
            Err(e) => return Err(e),
        };

        self.synchronizer.synchronize_task(&updated).await?;
        info!(task_oid = %oid, "前置任务已全部关闭，任务恢复运行");
        Ok(true)
    }
}
