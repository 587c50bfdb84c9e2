use std::collections::BTreeMap;

use async_trait::async_trait;
use taskmgr_core::{TaskManagerError, TaskManagerResult};
use taskmgr_domain::{LightweightIdentifier, ModifyGuard, Task, TaskDelta, TaskQuery, TaskRepository};
use tokio::sync::RwLock;
use tracing::debug;

/// 内存任务仓储
///
/// 单把粗粒度锁保护全部记录，每次修改版本号加一。
#[derive(Debug, Default)]
pub struct InMemoryTaskRepository {
    tasks: RwLock<BTreeMap<String, Task>>,
}

impl InMemoryTaskRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

/// 返回给调用方的实例拥有自己的轻量级标识，与从持久化存储读出的对象一致
fn detached(task: &Task) -> Task {
    let mut copy = task.clone();
    copy.lightweight_id = LightweightIdentifier::generate();
    copy.node_as_observed = None;
    copy.next_run_start_time = None;
    copy
}

#[async_trait]
impl TaskRepository for InMemoryTaskRepository {
    async fn get(&self, oid: &str) -> TaskManagerResult<Task> {
        let tasks = self.tasks.read().await;
        tasks
            .get(oid)
            .map(detached)
            .ok_or_else(|| TaskManagerError::task_not_found(oid))
    }

    async fn search(&self, query: &TaskQuery) -> TaskManagerResult<Vec<Task>> {
        let tasks = self.tasks.read().await;
        let matching = tasks
            .values()
            .filter(|task| query.matches(task))
            .map(detached)
            .collect();
        Ok(query.paginate(matching))
    }

    async fn count(&self, query: &TaskQuery) -> TaskManagerResult<usize> {
        let tasks = self.tasks.read().await;
        Ok(tasks.values().filter(|task| query.matches(task)).count())
    }

    async fn add(&self, mut task: Task) -> TaskManagerResult<String> {
        task.validate()?;
        let oid = task
            .oid
            .get_or_insert_with(|| uuid::Uuid::new_v4().to_string())
            .clone();

        let mut tasks = self.tasks.write().await;
        if tasks.contains_key(&oid) {
            return Err(TaskManagerError::AlreadyExists {
                kind: "任务",
                id: oid,
            });
        }

        task.version = 1;
        tasks.insert(oid.clone(), task);
        debug!(task_oid = %oid, "任务已保存");
        Ok(oid)
    }

    async fn modify(
        &self,
        oid: &str,
        deltas: &[TaskDelta],
        guard: Option<&ModifyGuard>,
    ) -> TaskManagerResult<Task> {
        let mut tasks = self.tasks.write().await;
        let current = tasks
            .get(oid)
            .ok_or_else(|| TaskManagerError::task_not_found(oid))?;

        if let Some(guard) = guard {
            guard.check(current)?;
        }

        let mut updated = TaskDelta::apply_all(current, deltas)?;
        updated.version = current.version + 1;
        tasks.insert(oid.to_string(), updated.clone());
        Ok(detached(&updated))
    }

    async fn delete(&self, oid: &str) -> TaskManagerResult<()> {
        let mut tasks = self.tasks.write().await;
        tasks
            .remove(oid)
            .map(|_| ())
            .ok_or_else(|| TaskManagerError::task_not_found(oid))
    }
}
