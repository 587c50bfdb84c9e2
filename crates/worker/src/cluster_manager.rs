//! 集群管理器
//!
//! 负责节点身份、周期心跳、集群配置检查和失联节点的任务恢复。
//! 配置错误会让节点进入错误状态并停止本地调度，读取和管理操作不受影响。

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration as StdDuration;

use chrono::Duration;
use taskmgr_core::{AppConfig, Clock, TaskManagerError, TaskManagerResult};
use taskmgr_domain::{
    JobStore, Node, NodeDelta, NodeErrorStatus, NodeExecutionStatus, NodeRepository, TaskQuery,
    TaskRepository,
};
use taskmgr_infrastructure::MetricsCollector;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::execution_manager::ExecutionManager;
use crate::node_state::LocalNodeState;
use crate::recovery::TaskRecovery;

#[derive(Debug, Clone)]
pub struct ClusterManagerConfig {
    pub url: Option<String>,
    pub clustered: bool,
    pub heartbeat_interval: StdDuration,
    /// 超过该时长未签到的节点视为失联
    pub node_timeout: Duration,
    pub job_store_fingerprint: String,
    /// 作业存储能否被其他节点共享
    pub job_store_shareable: bool,
}

impl ClusterManagerConfig {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            url: config.node.url.clone(),
            clustered: config.node.clustered,
            heartbeat_interval: StdDuration::from_secs(config.cluster.heartbeat_interval_seconds),
            node_timeout: Duration::seconds(config.cluster.node_timeout_seconds),
            job_store_fingerprint: config.database.job_store_fingerprint(),
            job_store_shareable: !config.database.is_in_memory(),
        }
    }
}

struct HeartbeatLoop {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

pub struct ClusterManager {
    config: ClusterManagerConfig,
    node: Arc<LocalNodeState>,
    nodes: Arc<dyn NodeRepository>,
    tasks: Arc<dyn TaskRepository>,
    job_store: Arc<dyn JobStore>,
    execution: Arc<ExecutionManager>,
    recovery: Arc<TaskRecovery>,
    clock: Arc<dyn Clock>,
    metrics: MetricsCollector,
    heartbeat: Mutex<Option<HeartbeatLoop>>,
}

impl ClusterManager {
    pub fn new(
        config: ClusterManagerConfig,
        nodes: Arc<dyn NodeRepository>,
        tasks: Arc<dyn TaskRepository>,
        job_store: Arc<dyn JobStore>,
        execution: Arc<ExecutionManager>,
        recovery: Arc<TaskRecovery>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            config,
            node: execution.node_state().clone(),
            nodes,
            tasks,
            job_store,
            execution,
            recovery,
            clock,
            metrics: MetricsCollector::new(),
            heartbeat: Mutex::new(None),
        }
    }

    pub fn node_id(&self) -> &str {
        self.node.node_id()
    }

    pub fn is_current_node(&self, node_id: &str) -> bool {
        self.node.node_id() == node_id
    }

    pub fn error_status(&self) -> NodeErrorStatus {
        self.node.error_status()
    }

    fn hostname() -> Option<String> {
        hostname::get().ok().and_then(|h| h.into_string().ok())
    }

    /// 节点启动时登记本节点
    pub async fn register_node(&self) -> TaskManagerResult<()> {
        let now = self.clock.now();
        let node_id = self.node.node_id();

        let existing = match self.nodes.get(node_id).await {
            Ok(node) => Some(node),
            Err(e) if e.is_not_found() => None,
            Err(e) => return Err(e),
        };

        let Some(existing) = existing else {
            let mut node = Node::new(
                node_id,
                self.node.instance_token(),
                &self.config.job_store_fingerprint,
                now,
            );
            node.url = self.config.url.clone();
            node.hostname = Self::hostname();
            node.clustered = self.config.clustered;
            node.build_version = Some(env!("CARGO_PKG_VERSION").to_string());
            self.nodes.add(node).await?;
            info!(node_id, "节点已登记");
            return Ok(());
        };

        if existing.is_alive(now, self.config.node_timeout) {
            // 另一个存活的进程正在使用同一个节点ID
            self.enter_error_state(NodeErrorStatus::DuplicateNodeId).await;
            return Ok(());
        }

        if existing.execution_status == NodeExecutionStatus::Up {
            warn!(node_id, "本节点上次未正常关闭，恢复遗留的任务");
            self.recover_tasks_of(node_id, "节点上次未正常关闭").await;
        }

        self.nodes
            .modify(
                node_id,
                &[
                    NodeDelta::InstanceToken(self.node.instance_token().to_string()),
                    NodeDelta::Url(self.config.url.clone()),
                    NodeDelta::Hostname(Self::hostname()),
                    NodeDelta::Clustered(self.config.clustered),
                    NodeDelta::JobStoreFingerprint(self.config.job_store_fingerprint.clone()),
                    NodeDelta::ExecutionStatus(NodeExecutionStatus::Up),
                    NodeDelta::ErrorStatus(NodeErrorStatus::Ok),
                    NodeDelta::LastCheckInTime(now),
                    NodeDelta::BuildVersion(Some(env!("CARGO_PKG_VERSION").to_string())),
                ],
            )
            .await?;
        info!(node_id, "节点重新登记");
        Ok(())
    }

    /// 一次心跳：签到、检查集群配置、处理失联节点
    pub async fn heartbeat(&self) -> TaskManagerResult<()> {
        let node_id = self.node.node_id();
        let own = match self.nodes.get(node_id).await {
            Ok(node) => node,
            Err(e) if e.is_not_found() => {
                warn!(node_id, "节点记录不存在，重新登记");
                return self.register_node().await;
            }
            Err(e) => return Err(e),
        };

        if own.instance_token != self.node.instance_token() {
            self.enter_error_state(NodeErrorStatus::DuplicateNodeId).await;
            return Ok(());
        }

        let now = self.clock.now();
        self.nodes
            .modify(
                node_id,
                &[
                    NodeDelta::LastCheckInTime(now),
                    NodeDelta::ExecutionStatus(NodeExecutionStatus::Up),
                ],
            )
            .await?;
        self.metrics.record_heartbeat();
        debug!(node_id, "节点心跳");

        let all_nodes = self.nodes.list().await?;
        if let Some(problem) = self.verify_configuration(&all_nodes) {
            self.enter_error_state(problem).await;
        }
        self.detect_dead_nodes(&all_nodes).await;
        Ok(())
    }

    /// 检查集群配置，返回发现的问题
    pub fn verify_configuration(&self, all_nodes: &[Node]) -> Option<NodeErrorStatus> {
        let now = self.clock.now();
        let others: Vec<&Node> = all_nodes
            .iter()
            .filter(|node| !self.is_current_node(&node.node_id))
            .filter(|node| node.is_alive(now, self.config.node_timeout))
            .collect();

        if !self.config.clustered && !others.is_empty() {
            return Some(NodeErrorStatus::NonClusteredNodeWithOthers);
        }
        if let Some(other) = others
            .iter()
            .find(|node| node.job_store_fingerprint != self.config.job_store_fingerprint)
        {
            warn!(
                node_id = %other.node_id,
                theirs = %other.job_store_fingerprint,
                ours = %self.config.job_store_fingerprint,
                "节点的作业存储配置不一致"
            );
            return Some(NodeErrorStatus::JobStoreMismatch);
        }
        if self.config.clustered && !self.config.job_store_shareable {
            return Some(NodeErrorStatus::LocalConfigurationError);
        }
        None
    }

    async fn enter_error_state(&self, status: NodeErrorStatus) {
        if !self.node.set_error_status(status) {
            return;
        }

        // 重复ID时节点记录属于另一个进程，不覆盖
        if status != NodeErrorStatus::DuplicateNodeId {
            if let Err(e) = self
                .nodes
                .modify(self.node.node_id(), &[NodeDelta::ErrorStatus(status)])
                .await
            {
                warn!("写入节点错误状态失败: {}", e);
            }
        }

        if let Err(e) = self.execution.stop_local_scheduler().await {
            error!("停止本地调度失败: {}", e);
        }
    }

    /// 把签到超时的节点标记为失联并恢复它们的任务，返回处理的节点数
    pub async fn detect_dead_nodes(&self, all_nodes: &[Node]) -> usize {
        let now = self.clock.now();
        let mut detected = 0;

        for node in all_nodes {
            if self.is_current_node(&node.node_id)
                || node.execution_status != NodeExecutionStatus::Up
                || node.is_alive(now, self.config.node_timeout)
            {
                continue;
            }

            warn!(node_id = %node.node_id, last_check_in = ?node.last_check_in_time, "节点失联");
            if let Err(e) = self
                .nodes
                .modify(
                    &node.node_id,
                    &[NodeDelta::ExecutionStatus(NodeExecutionStatus::Down)],
                )
                .await
            {
                warn!(node_id = %node.node_id, "标记节点失联失败: {}", e);
                continue;
            }
            detected += 1;

            match self.job_store.release_acquired_triggers(&node.node_id).await {
                Ok(0) => {}
                Ok(released) => info!(node_id = %node.node_id, released, "已释放失联节点认领的触发器"),
                Err(e) => warn!(node_id = %node.node_id, "释放失联节点的触发器失败: {}", e),
            }
            self.recover_tasks_of(&node.node_id, "运行任务的节点失联").await;
        }

        if detected > 0 {
            self.execution.invalidate_status_cache();
        }
        detected
    }

    /// 对记录为在指定节点上运行的任务执行线程停止动作
    async fn recover_tasks_of(&self, node_id: &str, reason: &str) {
        let tasks = match self
            .tasks
            .search(&TaskQuery::all().executing_on(node_id))
            .await
        {
            Ok(tasks) => tasks,
            Err(e) => {
                warn!(node_id, "查询节点上运行的任务失败: {}", e);
                return;
            }
        };

        for task in tasks {
            match self.recovery.apply_thread_stop_action(&task, reason).await {
                Ok(_) => {}
                // 其他节点已经处理
                Err(e) if e.is_state_conflict() || e.is_not_found() => {}
                Err(e) => warn!(task_oid = ?task.oid, "恢复任务失败: {}", e),
            }
        }
    }

    /// 启动心跳循环
    pub fn start_heartbeat(self: &Arc<Self>) {
        let mut heartbeat = self.heartbeat.lock().unwrap_or_else(PoisonError::into_inner);
        if heartbeat.is_some() {
            return;
        }

        let cancel = CancellationToken::new();
        let manager = Arc::clone(self);
        let loop_cancel = cancel.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(manager.config.heartbeat_interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = manager.heartbeat().await {
                            warn!("节点心跳失败: {}", e);
                        }
                    }
                    _ = loop_cancel.cancelled() => {
                        debug!("心跳循环已停止");
                        break;
                    }
                }
            }
        });

        *heartbeat = Some(HeartbeatLoop { cancel, handle });
        info!(
            node_id = %self.node.node_id(),
            interval = ?self.config.heartbeat_interval,
            "心跳循环已启动"
        );
    }

    pub async fn stop_heartbeat(&self) {
        let heartbeat = self
            .heartbeat
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(HeartbeatLoop { cancel, handle }) = heartbeat {
            cancel.cancel();
            if let Err(e) = handle.await {
                warn!("心跳循环异常退出: {}", e);
            }
        }
    }

    /// 节点正常关闭时标记为 Down
    pub async fn record_node_shutdown(&self) -> TaskManagerResult<()> {
        let node_id = self.node.node_id();
        match self.nodes.get(node_id).await {
            Ok(node) if node.instance_token == self.node.instance_token() => {}
            Ok(_) => return Ok(()),
            Err(e) if e.is_not_found() => return Ok(()),
            Err(e) => return Err(e),
        }

        self.nodes
            .modify(
                node_id,
                &[
                    NodeDelta::ExecutionStatus(NodeExecutionStatus::Down),
                    NodeDelta::LastCheckInTime(self.clock.now()),
                ],
            )
            .await?;
        info!(node_id, "节点已标记为关闭");
        Ok(())
    }

    /// 删除节点记录；当前节点和仍然存活的节点不能删除
    pub async fn delete_node(&self, node_id: &str) -> TaskManagerResult<()> {
        if self.is_current_node(node_id) {
            return Err(TaskManagerError::state_conflict(
                node_id,
                "不能删除当前节点",
            ));
        }

        let node = self.nodes.get(node_id).await?;
        if node.is_alive(self.clock.now(), self.config.node_timeout) {
            return Err(TaskManagerError::state_conflict(
                node_id,
                "节点仍然存活，不能删除",
            ));
        }

        self.nodes.delete(node_id).await?;
        info!(node_id, "节点记录已删除");
        Ok(())
    }
}
