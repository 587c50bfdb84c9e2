//! 任务存储适配器实现
//!
//! 任务/节点仓储与作业存储各有进程内和SQLite两种实现，
//! [`Storage`] 根据数据库配置组装同一存储上的三者。

pub mod database;
pub mod memory;
pub mod metrics;

use std::sync::Arc;

use taskmgr_core::{DatabaseConfig, TaskManagerResult};
use taskmgr_domain::{JobStore, NodeRepository, TaskRepository};

pub use database::{DatabaseManager, SqliteJobStore, SqliteNodeRepository, SqliteTaskRepository};
pub use memory::{InMemoryJobStore, InMemoryNodeRepository, InMemoryTaskRepository};
pub use metrics::MetricsCollector;

/// 共享存储：任务仓储、节点仓储和作业存储
#[derive(Clone)]
pub struct Storage {
    pub tasks: Arc<dyn TaskRepository>,
    pub nodes: Arc<dyn NodeRepository>,
    pub job_store: Arc<dyn JobStore>,
}

impl Storage {
    pub fn in_memory() -> Self {
        Self {
            tasks: Arc::new(InMemoryTaskRepository::new()),
            nodes: Arc::new(InMemoryNodeRepository::new()),
            job_store: Arc::new(InMemoryJobStore::new()),
        }
    }

    pub async fn from_config(config: &DatabaseConfig) -> TaskManagerResult<Self> {
        if config.is_in_memory() {
            return Ok(Self::in_memory());
        }

        let manager = DatabaseManager::new(config).await?;
        let pool = manager.pool().clone();
        Ok(Self {
            tasks: Arc::new(SqliteTaskRepository::new(pool.clone())),
            nodes: Arc::new(SqliteNodeRepository::new(pool.clone())),
            job_store: Arc::new(SqliteJobStore::new(pool)),
        })
    }
}
