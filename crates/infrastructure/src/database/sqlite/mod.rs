mod sqlite_job_store;
mod sqlite_node_repository;
mod sqlite_task_repository;

pub use sqlite_job_store::SqliteJobStore;
pub use sqlite_node_repository::SqliteNodeRepository;
pub use sqlite_task_repository::SqliteTaskRepository;

use taskmgr_core::TaskManagerError;

/// 唯一约束冲突映射为 AlreadyExists，其余数据库错误原样返回
pub(crate) fn map_insert_error(
    err: sqlx::Error,
    kind: &'static str,
    id: &str,
) -> TaskManagerError {
    match &err {
        sqlx::Error::Database(db_err) if db_err.is_unique_violation() => {
            TaskManagerError::AlreadyExists {
                kind,
                id: id.to_string(),
            }
        }
        _ => TaskManagerError::Database(err),
    }
}
