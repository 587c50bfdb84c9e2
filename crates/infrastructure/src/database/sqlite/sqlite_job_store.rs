use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqliteRow, Row, Sqlite, SqlitePool, Transaction};
use taskmgr_core::{TaskManagerError, TaskManagerResult};
use taskmgr_domain::{
    complete_trigger, JobDetail, JobStore, Trigger, TriggerCompletion, TriggerKey, TriggerState,
};
use tracing::debug;

use super::map_insert_error;

/// SQLite作业存储
///
/// 使用同一个数据库文件的多个进程共享调度状态，触发器认领通过带状态条件的
/// `UPDATE` 完成，只有一个实例能把某个触发器从 WAITING 改为 ACQUIRED。
pub struct SqliteJobStore {
    pool: SqlitePool,
}

impl SqliteJobStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn row_to_trigger(row: &SqliteRow) -> TaskManagerResult<Trigger> {
        let body: String = row.try_get("body")?;
        Ok(serde_json::from_str(&body)?)
    }

    async fn write_trigger(
        tx: &mut Transaction<'_, Sqlite>,
        trigger: &Trigger,
    ) -> TaskManagerResult<()> {
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO triggers (job_key, name, state, next_fire, acquired_by, body)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
        )
        .bind(&trigger.key.job)
        .bind(&trigger.key.name)
        .bind(trigger.state.as_str())
        .bind(trigger.next_fire_time.timestamp_millis())
        .bind(&trigger.acquired_by)
        .bind(serde_json::to_string(trigger)?)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    async fn set_job_trigger_state(
        &self,
        job_key: &str,
        from: &[TriggerState],
        to: TriggerState,
    ) -> TaskManagerResult<()> {
        let mut tx = self.pool.begin().await?;

        let exists = sqlx::query("SELECT 1 FROM jobs WHERE job_key = ?1")
            .bind(job_key)
            .fetch_optional(&mut *tx)
            .await?
            .is_some();
        if !exists {
            return Err(TaskManagerError::job_not_found(job_key));
        }

        let rows = sqlx::query("SELECT body FROM triggers WHERE job_key = ?1")
            .bind(job_key)
            .fetch_all(&mut *tx)
            .await?;

        for row in rows {
            let mut trigger = Self::row_to_trigger(&row)?;
            if from.contains(&trigger.state) {
                trigger.state = to;
                if to == TriggerState::Waiting {
                    trigger.acquired_by = None;
                }
                Self::write_trigger(&mut tx, &trigger).await?;
            }
        }

        tx.commit().await?;
        Ok(())
    }
}

#[async_trait]
impl JobStore for SqliteJobStore {
    async fn store_job(&self, job: JobDetail, replace: bool) -> TaskManagerResult<()> {
        let body = serde_json::to_string(&job)?;
        let sql = if replace {
            "INSERT OR REPLACE INTO jobs (job_key, body) VALUES (?1, ?2)"
        } else {
            "INSERT INTO jobs (job_key, body) VALUES (?1, ?2)"
        };

        sqlx::query(sql)
            .bind(&job.key)
            .bind(body)
            .execute(&self.pool)
            .await
            .map_err(|e| map_insert_error(e, "作业", &job.key))?;
        Ok(())
    }

    async fn remove_job(&self, job_key: &str) -> TaskManagerResult<bool> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM triggers WHERE job_key = ?1")
            .bind(job_key)
            .execute(&mut *tx)
            .await?;
        let result = sqlx::query("DELETE FROM jobs WHERE job_key = ?1")
            .bind(job_key)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(result.rows_affected() > 0)
    }

    async fn job_exists(&self, job_key: &str) -> TaskManagerResult<bool> {
        let row = sqlx::query("SELECT 1 FROM jobs WHERE job_key = ?1")
            .bind(job_key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    async fn job_keys(&self) -> TaskManagerResult<Vec<String>> {
        let rows = sqlx::query("SELECT job_key FROM jobs ORDER BY job_key")
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| row.try_get("job_key").map_err(TaskManagerError::from))
            .collect()
    }

    async fn store_trigger(&self, trigger: Trigger, replace: bool) -> TaskManagerResult<()> {
        let mut tx = self.pool.begin().await?;

        let job_exists = sqlx::query("SELECT 1 FROM jobs WHERE job_key = ?1")
            .bind(&trigger.key.job)
            .fetch_optional(&mut *tx)
            .await?
            .is_some();
        if !job_exists {
            return Err(TaskManagerError::job_not_found(&trigger.key.job));
        }

        if !replace {
            let existing = sqlx::query("SELECT 1 FROM triggers WHERE job_key = ?1 AND name = ?2")
                .bind(&trigger.key.job)
                .bind(&trigger.key.name)
                .fetch_optional(&mut *tx)
                .await?;
            if existing.is_some() {
                return Err(TaskManagerError::AlreadyExists {
                    kind: "触发器",
                    id: trigger.key.to_string(),
                });
            }
        }

        Self::write_trigger(&mut tx, &trigger).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn remove_trigger(&self, key: &TriggerKey) -> TaskManagerResult<bool> {
        let result = sqlx::query("DELETE FROM triggers WHERE job_key = ?1 AND name = ?2")
            .bind(&key.job)
            .bind(&key.name)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn get_trigger(&self, key: &TriggerKey) -> TaskManagerResult<Option<Trigger>> {
        let row = sqlx::query("SELECT body FROM triggers WHERE job_key = ?1 AND name = ?2")
            .bind(&key.job)
            .bind(&key.name)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::row_to_trigger).transpose()
    }

    async fn triggers_of_job(&self, job_key: &str) -> TaskManagerResult<Vec<Trigger>> {
        let rows = sqlx::query("SELECT body FROM triggers WHERE job_key = ?1 ORDER BY name")
            .bind(job_key)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(Self::row_to_trigger).collect()
    }

    async fn pause_job(&self, job_key: &str) -> TaskManagerResult<()> {
        self.set_job_trigger_state(
            job_key,
            &[TriggerState::Waiting, TriggerState::Acquired],
            TriggerState::Paused,
        )
        .await
    }

    async fn resume_job(&self, job_key: &str) -> TaskManagerResult<()> {
        self.set_job_trigger_state(job_key, &[TriggerState::Paused], TriggerState::Waiting)
            .await
    }

    async fn acquire_next_triggers(
        &self,
        instance_id: &str,
        no_later_than: DateTime<Utc>,
        max_count: usize,
    ) -> TaskManagerResult<Vec<Trigger>> {
        let candidates = sqlx::query(
            r#"
            SELECT body FROM triggers
            WHERE state = 'WAITING' AND next_fire <= ?1
            ORDER BY next_fire
            LIMIT ?2
            "#,
        )
        .bind(no_later_than.timestamp_millis())
        .bind(max_count as i64)
        .fetch_all(&self.pool)
        .await?;

        let mut acquired = Vec::new();
        for row in candidates {
            let mut trigger = Self::row_to_trigger(&row)?;
            let expected_next_fire = trigger.next_fire_time.timestamp_millis();
            trigger.state = TriggerState::Acquired;
            trigger.acquired_by = Some(instance_id.to_string());

            // 条件更新：其他实例已认领或触发器已被替换时影响行数为0
            let result = sqlx::query(
                r#"
                UPDATE triggers SET state = 'ACQUIRED', acquired_by = ?1, body = ?2
                WHERE job_key = ?3 AND name = ?4 AND state = 'WAITING' AND next_fire = ?5
                "#,
            )
            .bind(instance_id)
            .bind(serde_json::to_string(&trigger)?)
            .bind(&trigger.key.job)
            .bind(&trigger.key.name)
            .bind(expected_next_fire)
            .execute(&self.pool)
            .await?;

            if result.rows_affected() == 1 {
                acquired.push(trigger);
            }
        }

        if !acquired.is_empty() {
            debug!(instance_id, count = acquired.len(), "认领触发器");
        }
        Ok(acquired)
    }

    async fn triggered_job_complete(
        &self,
        trigger: &Trigger,
        next_fire_time: Option<DateTime<Utc>>,
    ) -> TaskManagerResult<()> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query("SELECT body FROM triggers WHERE job_key = ?1 AND name = ?2")
            .bind(&trigger.key.job)
            .bind(&trigger.key.name)
            .fetch_optional(&mut *tx)
            .await?;
        let Some(row) = row else {
            return Ok(());
        };
        let current = Self::row_to_trigger(&row)?;

        match complete_trigger(&current, trigger, next_fire_time) {
            TriggerCompletion::Untouched => {}
            TriggerCompletion::Remove => {
                sqlx::query("DELETE FROM triggers WHERE job_key = ?1 AND name = ?2")
                    .bind(&trigger.key.job)
                    .bind(&trigger.key.name)
                    .execute(&mut *tx)
                    .await?;
            }
            TriggerCompletion::Rearm(updated) => {
                Self::write_trigger(&mut tx, &updated).await?;
            }
        }

        tx.commit().await?;
        Ok(())
    }

    async fn release_acquired_triggers(&self, instance_id: &str) -> TaskManagerResult<usize> {
        let mut tx = self.pool.begin().await?;
        let rows = sqlx::query(
            "SELECT body FROM triggers WHERE state = 'ACQUIRED' AND acquired_by = ?1",
        )
        .bind(instance_id)
        .fetch_all(&mut *tx)
        .await?;

        let released = rows.len();
        for row in rows {
            let mut trigger = Self::row_to_trigger(&row)?;
            trigger.state = TriggerState::Waiting;
            trigger.acquired_by = None;
            Self::write_trigger(&mut tx, &trigger).await?;
        }

        tx.commit().await?;
        Ok(released)
    }
}
