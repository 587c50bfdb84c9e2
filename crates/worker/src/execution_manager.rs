//! 执行管理器
//!
//! 本节点和跨节点的控制面：启停本地调度、暂停和恢复单个作业、停止任务运行并
//! 按等待策略确认停止，以及汇总集群状态快照。
//!
//! 作业暂停/恢复失败只记录日志。任务停止的权威机制是任务自身观察到执行状态
//! 或取消请求后退出。

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use taskmgr_core::{Clock, TaskManagerError, TaskManagerResult, TtlCache};
use taskmgr_dispatcher::{SchedulerEngine, TaskSynchronizer};
use taskmgr_domain::{
    ClusterStatusInformation, NodeExecutionStatus, NodeRepository, NodeRuntimeStatus, Task,
};
use tracing::{debug, info, warn};

use crate::node_client::RemoteNodeClient;
use crate::node_state::LocalNodeState;
use crate::recovery::TaskRecovery;
use crate::running_task::{LocalRunningTasks, RunningTask};
use crate::subtask_runner::LightweightTaskRunner;

/// 停止任务时的等待策略
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitPolicy {
    /// 只暂停触发器，不向运行中的任务发停止请求
    DoNotStop,
    /// 发出停止请求后立即返回
    DoNotWait,
    WaitFor(Duration),
    /// 一直等到集群中没有节点报告任务在运行
    WaitIndefinitely,
}

impl WaitPolicy {
    /// 由毫秒数构造：负数表示不停止，0 表示一直等待
    pub fn from_millis(timeout: i64) -> Self {
        match timeout {
            t if t < 0 => Self::DoNotStop,
            0 => Self::WaitIndefinitely,
            t => Self::WaitFor(Duration::from_millis(t as u64)),
        }
    }
}

/// 执行管理器依赖的组件
pub struct ExecutionComponents {
    pub node: Arc<LocalNodeState>,
    pub engine: Arc<SchedulerEngine>,
    pub synchronizer: Arc<TaskSynchronizer>,
    pub nodes: Arc<dyn NodeRepository>,
    pub running: Arc<LocalRunningTasks>,
    pub lightweight: Arc<LightweightTaskRunner>,
    pub recovery: Arc<TaskRecovery>,
    pub remote: Arc<dyn RemoteNodeClient>,
    pub clock: Arc<dyn Clock>,
}

pub struct ExecutionManager {
    node: Arc<LocalNodeState>,
    engine: Arc<SchedulerEngine>,
    synchronizer: Arc<TaskSynchronizer>,
    nodes: Arc<dyn NodeRepository>,
    running: Arc<LocalRunningTasks>,
    lightweight: Arc<LightweightTaskRunner>,
    recovery: Arc<TaskRecovery>,
    remote: Arc<dyn RemoteNodeClient>,
    clock: Arc<dyn Clock>,
    status_cache: TtlCache<(), ClusterStatusInformation>,
    stop_poll_interval: Duration,
}

impl ExecutionManager {
    pub fn new(
        components: ExecutionComponents,
        status_cache_ttl: chrono::Duration,
        stop_poll_interval: Duration,
    ) -> Self {
        let ExecutionComponents {
            node,
            engine,
            synchronizer,
            nodes,
            running,
            lightweight,
            recovery,
            remote,
            clock,
        } = components;

        Self {
            status_cache: TtlCache::new(status_cache_ttl, clock.clone()),
            node,
            engine,
            synchronizer,
            nodes,
            running,
            lightweight,
            recovery,
            remote,
            clock,
            stop_poll_interval,
        }
    }

    pub fn node_id(&self) -> &str {
        self.node.node_id()
    }

    pub fn node_state(&self) -> &Arc<LocalNodeState> {
        &self.node
    }

    // ---- 本地调度 ----

    /// 启动本地调度；节点处于错误状态时拒绝
    pub fn start_local_scheduler(&self) -> TaskManagerResult<()> {
        let status = self.node.error_status();
        if !status.is_ok() {
            return Err(TaskManagerError::Scheduler(format!(
                "节点 {} 处于错误状态({status})，不能启动本地调度",
                self.node.node_id()
            )));
        }

        self.engine.start()?;
        self.status_cache.invalidate_all();
        info!(node_id = %self.node.node_id(), "本地调度已启动");
        Ok(())
    }

    pub async fn stop_local_scheduler(&self) -> TaskManagerResult<()> {
        self.engine.standby().await;
        self.status_cache.invalidate_all();
        info!(node_id = %self.node.node_id(), "本地调度已停止");
        Ok(())
    }

    pub fn is_local_scheduler_running(&self) -> bool {
        self.engine.is_started()
    }

    // ---- 单个作业 ----

    pub async fn pause_job(&self, oid: &str) {
        if let Err(e) = self.engine.pause_job(oid).await {
            warn!(task_oid = oid, "暂停作业失败: {}", e);
        }
    }

    pub async fn resume_job(&self, oid: &str) {
        if let Err(e) = self.engine.resume_job(oid).await {
            warn!(task_oid = oid, "恢复作业失败: {}", e);
        }
    }

    /// 绕过正常触发时间立即运行任务
    pub async fn schedule_task_now(&self, task: &Task) -> TaskManagerResult<()> {
        self.synchronizer.synchronize_task(task).await?;
        self.synchronizer.trigger_now(task).await?;
        debug!(task_oid = ?task.oid, "已添加立即运行触发器");
        Ok(())
    }

    // ---- 状态 ----

    /// 本节点自报的运行时状态
    pub fn local_node_status(&self) -> NodeRuntimeStatus {
        NodeRuntimeStatus {
            node_id: self.node.node_id().to_string(),
            execution_status: NodeExecutionStatus::Up,
            error_status: self.node.error_status(),
            scheduler_running: self.engine.is_started(),
            executing_tasks: self
                .running
                .list()
                .iter()
                .map(|task| task.executing_info())
                .collect(),
            communication_error: None,
        }
    }

    /// 汇总集群状态；单个节点查询失败只影响该节点在快照中的状态
    pub async fn get_cluster_status(
        &self,
        allow_cached: bool,
    ) -> TaskManagerResult<ClusterStatusInformation> {
        if allow_cached {
            if let Some(cached) = self.status_cache.get(&()) {
                return Ok(cached);
            }
        }

        let mut info = ClusterStatusInformation::new(self.clock.now());
        info.add_node(self.local_node_status());

        let others: Vec<_> = self
            .nodes
            .list()
            .await?
            .into_iter()
            .filter(|node| node.node_id != self.node.node_id())
            .collect();

        let queries = others.iter().map(|node| async move {
            if node.execution_status != NodeExecutionStatus::Up {
                return NodeRuntimeStatus {
                    node_id: node.node_id.clone(),
                    execution_status: node.execution_status,
                    error_status: node.error_status,
                    scheduler_running: false,
                    executing_tasks: Vec::new(),
                    communication_error: None,
                };
            }
            match self.remote.node_status(node).await {
                Ok(status) => status,
                Err(e) => {
                    warn!(node_id = %node.node_id, "查询节点状态失败: {}", e);
                    NodeRuntimeStatus::unreachable(node.node_id.clone(), e.to_string())
                }
            }
        });
        for status in join_all(queries).await {
            info.add_node(status);
        }

        self.status_cache.insert((), info.clone());
        Ok(info)
    }

    pub fn invalidate_status_cache(&self) {
        self.status_cache.invalidate_all();
    }

    // ---- 停止任务 ----

    /// 通知本地运行的任务停止，返回任务是否在本节点运行
    pub fn stop_local_task(&self, oid: &str) -> bool {
        match self.running.find_by_oid(oid) {
            Some(task) => {
                task.cancel();
                info!(task_oid = oid, "已请求本地任务停止");
                true
            }
            None => false,
        }
    }

    /// 停止一组任务的运行，返回按等待策略确认时是否全部已停止
    ///
    /// 调用方应先把任务持久化为 SUSPENDED，这里只负责暂停触发器、通知运行中的
    /// 节点并按策略等待。
    pub async fn stop_task_runs(
        &self,
        oids: &[String],
        policy: WaitPolicy,
    ) -> TaskManagerResult<bool> {
        for oid in oids {
            self.pause_job(oid).await;
        }

        let status = self.get_cluster_status(false).await?;
        let running: Vec<&String> = oids
            .iter()
            .filter(|oid| status.is_task_running(oid))
            .collect();
        if running.is_empty() {
            return Ok(true);
        }
        if policy == WaitPolicy::DoNotStop {
            return Ok(false);
        }

        for oid in &running {
            let Some(node_id) = status.find_node_running_task(oid) else {
                continue;
            };
            if node_id == self.node.node_id() {
                self.stop_local_task(oid);
                continue;
            }
            if let Err(e) = self.stop_remote_task(node_id, oid).await {
                warn!(task_oid = %oid, node_id, "请求远程节点停止任务失败: {}", e);
            }
        }

        let pending: HashSet<String> = running.into_iter().cloned().collect();
        match policy {
            WaitPolicy::DoNotStop | WaitPolicy::DoNotWait => Ok(false),
            WaitPolicy::WaitFor(timeout) => self.wait_until_stopped(pending, Some(timeout)).await,
            WaitPolicy::WaitIndefinitely => self.wait_until_stopped(pending, None).await,
        }
    }

    async fn stop_remote_task(&self, node_id: &str, oid: &str) -> TaskManagerResult<bool> {
        let node = self.nodes.get(node_id).await?;
        self.remote.stop_task(&node, oid).await
    }

    async fn wait_until_stopped(
        &self,
        mut pending: HashSet<String>,
        timeout: Option<Duration>,
    ) -> TaskManagerResult<bool> {
        let deadline = timeout.map(|t| tokio::time::Instant::now() + t);
        loop {
            let status = self.get_cluster_status(false).await?;
            pending.retain(|oid| status.is_task_running(oid));
            if pending.is_empty() {
                return Ok(true);
            }

            if deadline.is_some_and(|d| tokio::time::Instant::now() >= d) {
                debug!(tasks = ?pending, "等待任务停止超时");
                return Ok(false);
            }
            tokio::time::sleep(self.stop_poll_interval).await;
        }
    }

    /// 停止本地调度和全部本地任务
    ///
    /// 超时后仍在运行的任务直接按线程停止动作处理，返回是否全部在超时前停止。
    pub async fn stop_scheduler_and_tasks_locally(&self, timeout: Duration) -> bool {
        self.engine.standby().await;

        let running = self.running.list();
        if running.is_empty() {
            return true;
        }
        info!(count = running.len(), "请求本地运行中的任务停止");
        for task in &running {
            task.cancel();
        }
        for task in self.lightweight.running_tasks() {
            task.cancel();
        }

        let deadline = tokio::time::Instant::now() + timeout;
        while !self.running.is_empty() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(self.stop_poll_interval).await;
        }

        let leftovers = self.running.list();
        if leftovers.is_empty() {
            return true;
        }

        warn!(count = leftovers.len(), "部分任务未能在超时前停止，执行线程停止动作");
        for task in leftovers {
            let snapshot = task.task();
            if snapshot.oid.is_none() {
                continue;
            }
            match self
                .recovery
                .apply_thread_stop_action(&snapshot, "节点关闭时任务仍在运行")
                .await
            {
                Ok(_) => {}
                Err(e) if e.is_state_conflict() || e.is_not_found() => {}
                Err(e) => warn!(task = %task.display_id(), "执行线程停止动作失败: {}", e),
            }
        }
        false
    }

    /// 关闭本地调度引擎
    pub async fn shutdown(&self, timeout: Duration) {
        let all_stopped = self.stop_scheduler_and_tasks_locally(timeout).await;
        self.engine.shutdown(all_stopped).await;
        self.status_cache.invalidate_all();
    }

    // ---- 远程节点调度控制 ----

    pub async fn start_scheduler_on(&self, node_id: &str) -> TaskManagerResult<()> {
        if node_id == self.node.node_id() {
            return self.start_local_scheduler();
        }
        let node = self.nodes.get(node_id).await?;
        self.remote.start_scheduler(&node).await?;
        self.status_cache.invalidate_all();
        info!(node_id, "已请求远程节点启动调度");
        Ok(())
    }

    pub async fn stop_scheduler_on(&self, node_id: &str) -> TaskManagerResult<()> {
        if node_id == self.node.node_id() {
            return self.stop_local_scheduler().await;
        }
        let node = self.nodes.get(node_id).await?;
        self.remote.stop_scheduler(&node).await?;
        self.status_cache.invalidate_all();
        info!(node_id, "已请求远程节点停止调度");
        Ok(())
    }

    /// 任务是否在本节点运行
    pub fn is_running_locally(&self, oid: &str) -> bool {
        self.running.find_by_oid(oid).is_some()
    }

    /// 本节点上该任务正在运行的实例
    pub fn local_running_task(&self, oid: &str) -> Option<Arc<RunningTask>> {
        self.running.find_by_oid(oid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use chrono::Utc;
    use taskmgr_core::{ManualClock, SchedulerConfig};
    use taskmgr_dispatcher::{JobExecutionContext, JobRunner, SchedulerEngineConfig};
    use taskmgr_domain::{ExecutingTaskInfo, Node, NodeErrorStatus};
    use taskmgr_infrastructure::{InMemoryJobStore, InMemoryNodeRepository, InMemoryTaskRepository};
    use tokio_util::sync::CancellationToken;

    use crate::node_client::MockRemoteNodeClient;
    use crate::running_task::RunningTask;

    struct IdleRunner;

    #[async_trait]
    impl JobRunner for IdleRunner {
        async fn execute(&self, _context: JobExecutionContext) {}
    }

    struct Fixture {
        manager: ExecutionManager,
        nodes: Arc<InMemoryNodeRepository>,
        running: Arc<LocalRunningTasks>,
        clock: Arc<ManualClock>,
    }

    fn fixture(remote: MockRemoteNodeClient) -> Fixture {
        let clock = Arc::new(ManualClock::starting_now());
        let tasks = Arc::new(InMemoryTaskRepository::new());
        let nodes = Arc::new(InMemoryNodeRepository::new());
        let job_store = Arc::new(InMemoryJobStore::new());
        let synchronizer = Arc::new(TaskSynchronizer::new(job_store.clone(), clock.clone()));
        let engine = Arc::new(SchedulerEngine::new(
            SchedulerEngineConfig::from_config(&SchedulerConfig::default(), "node-1"),
            job_store,
            Arc::new(IdleRunner),
            clock.clone(),
        ));
        let running = Arc::new(LocalRunningTasks::new());

        let manager = ExecutionManager::new(
            ExecutionComponents {
                node: Arc::new(LocalNodeState::new("node-1")),
                engine,
                synchronizer: synchronizer.clone(),
                nodes: nodes.clone(),
                running: running.clone(),
                lightweight: Arc::new(LightweightTaskRunner::new(4, clock.clone())),
                recovery: Arc::new(TaskRecovery::new(tasks, synchronizer, clock.clone())),
                remote: Arc::new(remote),
                clock: clock.clone(),
            },
            chrono::Duration::seconds(1),
            Duration::from_millis(10),
        );
        Fixture {
            manager,
            nodes,
            running,
            clock,
        }
    }

    fn remote_node(id: &str) -> Node {
        let mut node = Node::new(id, "token", "memory", Utc::now());
        node.url = Some(format!("http://{id}:8080"));
        node
    }

    fn remote_status(node_id: &str, oids: &[&str]) -> NodeRuntimeStatus {
        NodeRuntimeStatus {
            node_id: node_id.to_string(),
            execution_status: NodeExecutionStatus::Up,
            error_status: NodeErrorStatus::Ok,
            scheduler_running: true,
            executing_tasks: oids
                .iter()
                .map(|oid| ExecutingTaskInfo {
                    oid: Some(oid.to_string()),
                    lightweight_id: format!("lw-{oid}"),
                    name: oid.to_string(),
                    started_at: Utc::now(),
                    progress: 0,
                    stalled_since: None,
                })
                .collect(),
            communication_error: None,
        }
    }

    #[tokio::test]
    async fn test_cluster_status_tolerates_unreachable_nodes() {
        let mut remote = MockRemoteNodeClient::new();
        remote.expect_node_status().returning(|node| {
            if node.node_id == "node-2" {
                Ok(remote_status("node-2", &["t2"]))
            } else {
                Err(TaskManagerError::CommunicationFailure {
                    node: node.node_id.clone(),
                    message: "connection refused".into(),
                })
            }
        });
        let fx = fixture(remote);
        fx.nodes.add(remote_node("node-2")).await.unwrap();
        fx.nodes.add(remote_node("node-3")).await.unwrap();
        let mut down = remote_node("node-4");
        down.execution_status = NodeExecutionStatus::Down;
        fx.nodes.add(down).await.unwrap();

        let status = fx.manager.get_cluster_status(false).await.unwrap();
        assert_eq!(status.nodes.len(), 4);
        assert_eq!(status.find_node_running_task("t2"), Some("node-2"));
        assert_eq!(
            status.node("node-3").unwrap().execution_status,
            NodeExecutionStatus::CommunicationError
        );
        assert_eq!(
            status.node("node-4").unwrap().execution_status,
            NodeExecutionStatus::Down
        );
        assert!(!status.node("node-1").unwrap().scheduler_running);
    }

    #[tokio::test]
    async fn test_cluster_status_is_cached_briefly() {
        let mut remote = MockRemoteNodeClient::new();
        remote
            .expect_node_status()
            .times(2)
            .returning(|_| Ok(remote_status("node-2", &[])));
        let fx = fixture(remote);
        fx.nodes.add(remote_node("node-2")).await.unwrap();

        fx.manager.get_cluster_status(true).await.unwrap();
        fx.manager.get_cluster_status(true).await.unwrap();

        fx.clock.advance(chrono::Duration::seconds(2));
        fx.manager.get_cluster_status(true).await.unwrap();
    }

    #[tokio::test]
    async fn test_scheduler_refuses_to_start_in_error_state() {
        let fx = fixture(MockRemoteNodeClient::new());
        fx.manager
            .node_state()
            .set_error_status(NodeErrorStatus::DuplicateNodeId);

        let err = fx.manager.start_local_scheduler().unwrap_err();
        assert!(matches!(err, TaskManagerError::Scheduler(_)));
        assert!(!fx.manager.is_local_scheduler_running());
    }

    #[tokio::test]
    async fn test_stop_waits_for_local_task() {
        let fx = fixture(MockRemoteNodeClient::new());
        let task = Arc::new(RunningTask::new(
            Task::new("本地任务").with_oid("t1"),
            CancellationToken::new(),
            fx.clock.clone(),
        ));
        fx.running.register(task.clone());

        // 模拟处理器观察到取消请求后退出
        let running = fx.running.clone();
        tokio::spawn(async move {
            task.cancelled().await;
            tokio::time::sleep(Duration::from_millis(30)).await;
            running.remove(task.lightweight_id());
        });

        let stopped = fx
            .manager
            .stop_task_runs(&["t1".to_string()], WaitPolicy::WaitFor(Duration::from_secs(2)))
            .await
            .unwrap();
        assert!(stopped);
        assert!(!fx.manager.is_running_locally("t1"));
    }

    #[tokio::test]
    async fn test_stop_signals_remote_node_and_times_out() {
        let stop_calls = Arc::new(AtomicUsize::new(0));
        let mut remote = MockRemoteNodeClient::new();
        remote
            .expect_node_status()
            .returning(|_| Ok(remote_status("node-2", &["t2"])));
        let calls = stop_calls.clone();
        remote.expect_stop_task().returning(move |_, oid| {
            assert_eq!(oid, "t2");
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(true)
        });
        let fx = fixture(remote);
        fx.nodes.add(remote_node("node-2")).await.unwrap();

        let stopped = fx
            .manager
            .stop_task_runs(
                &["t2".to_string()],
                WaitPolicy::WaitFor(Duration::from_millis(50)),
            )
            .await
            .unwrap();
        assert!(!stopped);
        assert_eq!(stop_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_stop_of_idle_task_returns_immediately() {
        let fx = fixture(MockRemoteNodeClient::new());
        let stopped = fx
            .manager
            .stop_task_runs(&["t9".to_string()], WaitPolicy::WaitIndefinitely)
            .await
            .unwrap();
        assert!(stopped);
    }

    #[test]
    fn test_wait_policy_from_millis() {
        assert_eq!(WaitPolicy::from_millis(-1), WaitPolicy::DoNotStop);
        assert_eq!(WaitPolicy::from_millis(0), WaitPolicy::WaitIndefinitely);
        assert_eq!(
            WaitPolicy::from_millis(5000),
            WaitPolicy::WaitFor(Duration::from_secs(5))
        );
    }
}
