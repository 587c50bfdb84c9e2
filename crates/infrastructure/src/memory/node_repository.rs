use std::collections::BTreeMap;

use async_trait::async_trait;
use taskmgr_core::{TaskManagerError, TaskManagerResult};
use taskmgr_domain::{Node, NodeDelta, NodeRepository};
use tokio::sync::RwLock;

#[derive(Debug, Default)]
pub struct InMemoryNodeRepository {
    nodes: RwLock<BTreeMap<String, Node>>,
}

impl InMemoryNodeRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl NodeRepository for InMemoryNodeRepository {
    async fn get(&self, node_id: &str) -> TaskManagerResult<Node> {
        let nodes = self.nodes.read().await;
        nodes
            .get(node_id)
            .cloned()
            .ok_or_else(|| TaskManagerError::node_not_found(node_id))
    }

    async fn list(&self) -> TaskManagerResult<Vec<Node>> {
        let nodes = self.nodes.read().await;
        Ok(nodes.values().cloned().collect())
    }

    async fn add(&self, node: Node) -> TaskManagerResult<()> {
        let mut nodes = self.nodes.write().await;
        if nodes.contains_key(&node.node_id) {
            return Err(TaskManagerError::AlreadyExists {
                kind: "节点",
                id: node.node_id,
            });
        }
        nodes.insert(node.node_id.clone(), node);
        Ok(())
    }

    async fn modify(&self, node_id: &str, deltas: &[NodeDelta]) -> TaskManagerResult<Node> {
        let mut nodes = self.nodes.write().await;
        let node = nodes
            .get_mut(node_id)
            .ok_or_else(|| TaskManagerError::node_not_found(node_id))?;
        for delta in deltas {
            delta.apply_to(node);
        }
        Ok(node.clone())
    }

    async fn delete(&self, node_id: &str) -> TaskManagerResult<()> {
        let mut nodes = self.nodes.write().await;
        nodes
            .remove(node_id)
            .map(|_| ())
            .ok_or_else(|| TaskManagerError::node_not_found(node_id))
    }
}
