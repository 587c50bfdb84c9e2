use async_trait::async_trait;
use sqlx::{sqlite::SqliteRow, Row, SqlitePool};
use taskmgr_core::{TaskManagerError, TaskManagerResult};
use taskmgr_domain::{
    ModifyGuard, Task, TaskDelta, TaskExecutionStatus, TaskQuery, TaskRepository,
};
use tracing::{debug, instrument, warn};

use super::map_insert_error;

/// 乐观并发冲突时的最大重试次数
const MAX_MODIFY_ATTEMPTS: usize = 5;

/// 动态查询的绑定参数
enum SqlValue {
    Text(String),
    Int(i64),
}

/// SQLite任务仓储
///
/// 任务以JSON存放在 `body` 列，查询用到的字段另存为索引列；
/// 修改通过 `UPDATE … WHERE version = ?` 实现乐观并发。
pub struct SqliteTaskRepository {
    pool: SqlitePool,
}

impl SqliteTaskRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn row_to_task(row: &SqliteRow) -> TaskManagerResult<Task> {
        let body: String = row.try_get("body")?;
        let version: i64 = row.try_get("version")?;
        let mut task: Task = serde_json::from_str(&body)?;
        task.version = version as u64;
        Ok(task)
    }

    /// 由查询条件构造 `WHERE` 子句，条件都落在索引列上
    fn where_clause(query: &TaskQuery) -> (String, Vec<SqlValue>) {
        let mut sql = String::from(" WHERE 1=1");
        let mut binds = Vec::new();
        let mut push = |sql: &mut String, clause: &str, value: SqlValue| {
            binds.push(value);
            sql.push_str(&clause.replace('?', &format!("?{}", binds.len())));
        };

        if let Some(oids) = &query.oids {
            if oids.is_empty() {
                sql.push_str(" AND 0");
            } else {
                sql.push_str(" AND oid IN (");
                for (i, oid) in oids.iter().enumerate() {
                    if i > 0 {
                        sql.push_str(", ");
                    }
                    push(&mut sql, "?", SqlValue::Text(oid.clone()));
                }
                sql.push(')');
            }
        }

        if let Some(statuses) = &query.execution_statuses {
            if statuses.is_empty() {
                sql.push_str(" AND 0");
            } else {
                sql.push_str(" AND execution_status IN (");
                for (i, status) in statuses.iter().enumerate() {
                    if i > 0 {
                        sql.push_str(", ");
                    }
                    push(&mut sql, "?", SqlValue::Text(status.as_str().to_string()));
                }
                sql.push(')');
            }
        }

        if let Some(parent) = &query.parent {
            push(&mut sql, " AND parent = ?", SqlValue::Text(parent.clone()));
        }
        if query.root_only {
            sql.push_str(" AND parent IS NULL");
        }
        if let Some(category) = &query.category {
            push(&mut sql, " AND category = ?", SqlValue::Text(category.clone()));
        }
        if let Some(uri) = &query.handler_uri {
            push(&mut sql, " AND handler_uri = ?", SqlValue::Text(uri.clone()));
        }
        if let Some(fragment) = &query.name_contains {
            // instr 区分大小写且不解释通配符，与字符串包含一致
            push(&mut sql, " AND instr(name, ?) > 0", SqlValue::Text(fragment.clone()));
        }
        if let Some(node) = &query.executing_node {
            push(
                &mut sql,
                " AND execution_status = ?",
                SqlValue::Text(TaskExecutionStatus::Running.as_str().to_string()),
            );
            push(&mut sql, " AND node = ?", SqlValue::Text(node.clone()));
        }
        if let Some(before) = query.completed_before {
            push(
                &mut sql,
                " AND completion_ts IS NOT NULL AND completion_ts < ?",
                SqlValue::Int(before.timestamp_millis()),
            );
        }
        if let Some(dep) = &query.depends_on {
            push(
                &mut sql,
                " AND EXISTS (SELECT 1 FROM json_each(tasks.depends_on) WHERE json_each.value = ?)",
                SqlValue::Text(dep.clone()),
            );
        }

        (sql, binds)
    }

    async fn fetch_row(&self, oid: &str) -> TaskManagerResult<Task> {
        let row = sqlx::query("SELECT body, version FROM tasks WHERE oid = ?1")
            .bind(oid)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => Self::row_to_task(&row),
            None => Err(TaskManagerError::task_not_found(oid)),
        }
    }
}

#[async_trait]
impl TaskRepository for SqliteTaskRepository {
    async fn get(&self, oid: &str) -> TaskManagerResult<Task> {
        self.fetch_row(oid).await
    }

    #[instrument(skip(self), fields(offset = query.offset, limit = ?query.limit))]
    async fn search(&self, query: &TaskQuery) -> TaskManagerResult<Vec<Task>> {
        let (filter, mut binds) = Self::where_clause(query);
        let mut sql = format!("SELECT body, version FROM tasks{filter} ORDER BY oid");
        if query.limit.is_some() || query.offset > 0 {
            // SQLite 的 LIMIT -1 表示不限制
            let limit = query
                .limit
                .map_or(-1, |limit| i64::try_from(limit).unwrap_or(i64::MAX));
            binds.push(SqlValue::Int(limit));
            sql.push_str(&format!(" LIMIT ?{}", binds.len()));
            binds.push(SqlValue::Int(
                i64::try_from(query.offset).unwrap_or(i64::MAX),
            ));
            sql.push_str(&format!(" OFFSET ?{}", binds.len()));
        }

        let mut sqlx_query = sqlx::query(&sql);
        for value in binds {
            sqlx_query = match value {
                SqlValue::Text(text) => sqlx_query.bind(text),
                SqlValue::Int(number) => sqlx_query.bind(number),
            };
        }
        let rows = sqlx_query.fetch_all(&self.pool).await?;

        let tasks = rows
            .iter()
            .map(Self::row_to_task)
            .collect::<TaskManagerResult<Vec<_>>>()?;
        debug!(count = tasks.len(), "任务查询完成");
        Ok(tasks)
    }

    async fn count(&self, query: &TaskQuery) -> TaskManagerResult<usize> {
        let (filter, binds) = Self::where_clause(query);
        let sql = format!("SELECT COUNT(*) FROM tasks{filter}");

        let mut sqlx_query = sqlx::query_scalar::<sqlx::Sqlite, i64>(&sql);
        for value in binds {
            sqlx_query = match value {
                SqlValue::Text(text) => sqlx_query.bind(text),
                SqlValue::Int(number) => sqlx_query.bind(number),
            };
        }
        let count = sqlx_query.fetch_one(&self.pool).await?;
        Ok(usize::try_from(count).unwrap_or_default())
    }

    #[instrument(skip(self, task), fields(task_name = %task.name))]
    async fn add(&self, mut task: Task) -> TaskManagerResult<String> {
        task.validate()?;
        let oid = task
            .oid
            .get_or_insert_with(|| uuid::Uuid::new_v4().to_string())
            .clone();
        task.version = 1;

        let body = serde_json::to_string(&task)?;
        sqlx::query(
            r#"
            INSERT INTO tasks (oid, name, execution_status, parent, node, category, handler_uri,
                               depends_on, completion_ts, version, body)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
            "#,
        )
        .bind(&oid)
        .bind(&task.name)
        .bind(task.execution_status.as_str())
        .bind(&task.parent)
        .bind(&task.node)
        .bind(&task.category)
        .bind(&task.handler_uri)
        .bind(serde_json::to_string(&task.depends_on)?)
        .bind(task.completion_timestamp.map(|ts| ts.timestamp_millis()))
        .bind(1_i64)
        .bind(body)
        .execute(&self.pool)
        .await
        .map_err(|e| map_insert_error(e, "任务", &oid))?;

        debug!(task_oid = %oid, "任务已保存");
        Ok(oid)
    }

    async fn modify(
        &self,
        oid: &str,
        deltas: &[TaskDelta],
        guard: Option<&ModifyGuard>,
    ) -> TaskManagerResult<Task> {
        for attempt in 1..=MAX_MODIFY_ATTEMPTS {
            let current = self.fetch_row(oid).await?;
            if let Some(guard) = guard {
                guard.check(&current)?;
            }

            let mut updated = TaskDelta::apply_all(&current, deltas)?;
            updated.version = current.version + 1;
            let body = serde_json::to_string(&updated)?;

            let result = sqlx::query(
                r#"
                UPDATE tasks
                SET name = ?1, execution_status = ?2, parent = ?3, node = ?4,
                    category = ?5, handler_uri = ?6, depends_on = ?7,
                    completion_ts = ?8, version = ?9, body = ?10
                WHERE oid = ?11 AND version = ?12
                "#,
            )
            .bind(&updated.name)
            .bind(updated.execution_status.as_str())
            .bind(&updated.parent)
            .bind(&updated.node)
            .bind(&updated.category)
            .bind(&updated.handler_uri)
            .bind(serde_json::to_string(&updated.depends_on)?)
            .bind(updated.completion_timestamp.map(|ts| ts.timestamp_millis()))
            .bind(updated.version as i64)
            .bind(body)
            .bind(oid)
            .bind(current.version as i64)
            .execute(&self.pool)
            .await?;

            if result.rows_affected() == 1 {
                return Ok(updated);
            }

            warn!(task_oid = oid, attempt, "任务并发修改冲突，重试");
        }

        Err(TaskManagerError::state_conflict(
            oid,
            format!("并发修改冲突，重试 {MAX_MODIFY_ATTEMPTS} 次后仍未成功"),
        ))
    }

    async fn delete(&self, oid: &str) -> TaskManagerResult<()> {
        let result = sqlx::query("DELETE FROM tasks WHERE oid = ?1")
            .bind(oid)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(TaskManagerError::task_not_found(oid));
        }
        Ok(())
    }
}
