use std::str::FromStr;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use taskmgr_core::{DatabaseConfig, TaskManagerResult};
use tracing::{debug, info};

/// SQLite 连接池与表结构管理
pub struct DatabaseManager {
    pool: SqlitePool,
}

impl DatabaseManager {
    pub async fn new(config: &DatabaseConfig) -> TaskManagerResult<Self> {
        Self::connect(&config.url, config.max_connections).await
    }

    pub async fn connect(url: &str, max_connections: u32) -> TaskManagerResult<Self> {
        debug!("连接SQLite数据库: {}", url);

        let connect_options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));

        // 内存数据库每个连接各自独立，只能使用单连接
        let max_connections = if url.contains(":memory:") {
            1
        } else {
            max_connections
        };

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .min_connections(1)
            .connect_with(connect_options)
            .await?;

        let manager = Self { pool };
        manager.run_migrations().await?;
        info!("SQLite数据库已就绪: {}", url);
        Ok(manager)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn run_migrations(&self) -> TaskManagerResult<()> {
        debug!("执行SQLite数据库迁移");

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS tasks (
                oid TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                execution_status TEXT NOT NULL,
                parent TEXT,
                node TEXT,
                category TEXT,
                handler_uri TEXT,
                depends_on TEXT NOT NULL DEFAULT '[]',
                completion_ts INTEGER,
                version INTEGER NOT NULL,
                body TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS nodes (
                node_id TEXT PRIMARY KEY,
                body TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS jobs (
                job_key TEXT PRIMARY KEY,
                body TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS triggers (
                job_key TEXT NOT NULL,
                name TEXT NOT NULL,
                state TEXT NOT NULL,
                next_fire INTEGER NOT NULL,
                acquired_by TEXT,
                body TEXT NOT NULL,
                PRIMARY KEY (job_key, name)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        let indexes = [
            "CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(execution_status)",
            "CREATE INDEX IF NOT EXISTS idx_tasks_parent ON tasks(parent)",
            "CREATE INDEX IF NOT EXISTS idx_tasks_completion ON tasks(completion_ts)",
            "CREATE INDEX IF NOT EXISTS idx_tasks_node ON tasks(node, execution_status)",
            "CREATE INDEX IF NOT EXISTS idx_triggers_due ON triggers(state, next_fire)",
        ];

        for index_sql in indexes {
            sqlx::query(index_sql).execute(&self.pool).await?;
        }

        debug!("SQLite数据库迁移完成");
        Ok(())
    }

    pub async fn health_check(&self) -> TaskManagerResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}
