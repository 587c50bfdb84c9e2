//! 任务存储端口
//!
//! 持久化的任务和节点记录是唯一可信来源，所有修改都以条目增量的方式进行，
//! 并由存储自身的乐观并发控制保证原子性。

use async_trait::async_trait;
use taskmgr_core::TaskManagerResult;

use crate::delta::{ModifyGuard, NodeDelta, TaskDelta};
use crate::node::Node;
use crate::query::TaskQuery;
use crate::task::Task;

/// 任务仓储
#[async_trait]
pub trait TaskRepository: Send + Sync {
    async fn get(&self, oid: &str) -> TaskManagerResult<Task>;

    async fn search(&self, query: &TaskQuery) -> TaskManagerResult<Vec<Task>>;

    async fn count(&self, query: &TaskQuery) -> TaskManagerResult<usize>;

    /// 保存新任务并返回其oid，缺少oid时自动分配
    async fn add(&self, task: Task) -> TaskManagerResult<String>;

    /// 应用增量修改；`guard` 与修改原子执行，不满足时不做任何修改
    async fn modify(
        &self,
        oid: &str,
        deltas: &[TaskDelta],
        guard: Option<&ModifyGuard>,
    ) -> TaskManagerResult<Task>;

    async fn delete(&self, oid: &str) -> TaskManagerResult<()>;
}

/// 节点仓储
#[async_trait]
pub trait NodeRepository: Send + Sync {
    async fn get(&self, node_id: &str) -> TaskManagerResult<Node>;

    async fn list(&self) -> TaskManagerResult<Vec<Node>>;

    async fn add(&self, node: Node) -> TaskManagerResult<()>;

    async fn modify(&self, node_id: &str, deltas: &[NodeDelta]) -> TaskManagerResult<Node>;

    async fn delete(&self, node_id: &str) -> TaskManagerResult<()>;
}
