use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, PoisonError, RwLock};

use taskmgr_domain::Task;
use tracing::warn;

use crate::handler::TaskRunResult;

/// 任务运行事件监听器
///
/// 事件在执行线程上同步投递；监听器返回的错误和panic只记录日志，不影响任务运行。
pub trait TaskListener: Send + Sync {
    fn on_task_start(&self, _task: &Task) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_task_finish(&self, _task: &Task, _result: &TaskRunResult) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_task_thread_start(&self, _task: &Task) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_task_thread_finish(&self, _task: &Task) -> anyhow::Result<()> {
        Ok(())
    }
}

#[derive(Default)]
pub struct TaskListenerRegistry {
    listeners: RwLock<Vec<Arc<dyn TaskListener>>>,
}

impl TaskListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, listener: Arc<dyn TaskListener>) {
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(listener);
    }

    pub fn len(&self) -> usize {
        self.listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn task_started(&self, task: &Task) {
        self.deliver("on_task_start", task, |l| l.on_task_start(task));
    }

    pub fn task_finished(&self, task: &Task, result: &TaskRunResult) {
        self.deliver("on_task_finish", task, |l| l.on_task_finish(task, result));
    }

    pub fn task_thread_started(&self, task: &Task) {
        self.deliver("on_task_thread_start", task, |l| l.on_task_thread_start(task));
    }

    pub fn task_thread_finished(&self, task: &Task) {
        self.deliver("on_task_thread_finish", task, |l| l.on_task_thread_finish(task));
    }

    fn deliver<F>(&self, event: &str, task: &Task, call: F)
    where
        F: Fn(&dyn TaskListener) -> anyhow::Result<()>,
    {
        let listeners = self
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        for listener in listeners {
            match catch_unwind(AssertUnwindSafe(|| call(listener.as_ref()))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!(event, task = %task.display_id(), "任务监听器返回错误: {:#}", e);
                }
                Err(_) => {
                    warn!(event, task = %task.display_id(), "任务监听器发生panic");
                }
            }
        }
    }
}
