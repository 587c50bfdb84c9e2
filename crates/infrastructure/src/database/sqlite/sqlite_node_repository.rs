use async_trait::async_trait;
use sqlx::{Row, SqlitePool};
use taskmgr_core::{TaskManagerError, TaskManagerResult};
use taskmgr_domain::{Node, NodeDelta, NodeRepository};

use super::map_insert_error;

pub struct SqliteNodeRepository {
    pool: SqlitePool,
}

impl SqliteNodeRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl NodeRepository for SqliteNodeRepository {
    async fn get(&self, node_id: &str) -> TaskManagerResult<Node> {
        let row = sqlx::query("SELECT body FROM nodes WHERE node_id = ?1")
            .bind(node_id)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => {
                let body: String = row.try_get("body")?;
                Ok(serde_json::from_str(&body)?)
            }
            None => Err(TaskManagerError::node_not_found(node_id)),
        }
    }

    async fn list(&self) -> TaskManagerResult<Vec<Node>> {
        let rows = sqlx::query("SELECT body FROM nodes ORDER BY node_id")
            .fetch_all(&self.pool)
            .await?;

        let mut nodes = Vec::with_capacity(rows.len());
        for row in rows {
            let body: String = row.try_get("body")?;
            nodes.push(serde_json::from_str(&body)?);
        }
        Ok(nodes)
    }

    async fn add(&self, node: Node) -> TaskManagerResult<()> {
        let body = serde_json::to_string(&node)?;
        sqlx::query("INSERT INTO nodes (node_id, body) VALUES (?1, ?2)")
            .bind(&node.node_id)
            .bind(body)
            .execute(&self.pool)
            .await
            .map_err(|e| map_insert_error(e, "节点", &node.node_id))?;
        Ok(())
    }

    async fn modify(&self, node_id: &str, deltas: &[NodeDelta]) -> TaskManagerResult<Node> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query("SELECT body FROM nodes WHERE node_id = ?1")
            .bind(node_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| TaskManagerError::node_not_found(node_id))?;

        let body: String = row.try_get("body")?;
        let mut node: Node = serde_json::from_str(&body)?;
        for delta in deltas {
            delta.apply_to(&mut node);
        }

        sqlx::query("UPDATE nodes SET body = ?1 WHERE node_id = ?2")
            .bind(serde_json::to_string(&node)?)
            .bind(node_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(node)
    }

    async fn delete(&self, node_id: &str) -> TaskManagerResult<()> {
        let result = sqlx::query("DELETE FROM nodes WHERE node_id = ?1")
            .bind(node_id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(TaskManagerError::node_not_found(node_id));
        }
        Ok(())
    }
}
