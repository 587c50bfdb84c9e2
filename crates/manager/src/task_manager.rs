use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration as StdDuration;

use taskmgr_core::{AppConfig, Clock, TaskManagerError, TaskManagerResult};
use taskmgr_dispatcher::TaskSynchronizer;
use taskmgr_domain::{
    ClusterStatusInformation, Node, NodeRepository, Task, TaskQuery, TaskRepository,
};
use taskmgr_infrastructure::{MetricsCollector, Storage};
use taskmgr_worker::{
    ClusterManager, ExecutionManager, LightweightTaskHandle, LightweightTaskRunner,
    StalledScanReport, StalledTaskWatcher, TaskHandler, TaskHandlerRegistry, TaskListener,
    TaskListenerRegistry,
};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::options::TaskRetrieveOptions;

pub(crate) struct TaskManagerParts {
    pub config: AppConfig,
    pub storage: Storage,
    pub synchronizer: Arc<TaskSynchronizer>,
    pub handlers: Arc<TaskHandlerRegistry>,
    pub listeners: Arc<TaskListenerRegistry>,
    pub lightweight: Arc<LightweightTaskRunner>,
    pub execution: Arc<ExecutionManager>,
    pub cluster: Arc<ClusterManager>,
    pub stalled: Arc<StalledTaskWatcher>,
    pub clock: Arc<dyn Clock>,
}

struct WatcherLoop {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// 任务管理器
///
/// 一个节点上所有管理操作的入口。通过 [`crate::TaskManagerBuilder`] 创建，
/// `start` 后节点加入集群并开始调度。
pub struct TaskManager {
    pub(crate) config: AppConfig,
    pub(crate) tasks: Arc<dyn TaskRepository>,
    pub(crate) nodes: Arc<dyn NodeRepository>,
    pub(crate) synchronizer: Arc<TaskSynchronizer>,
    pub(crate) handlers: Arc<TaskHandlerRegistry>,
    pub(crate) listeners: Arc<TaskListenerRegistry>,
    pub(crate) lightweight: Arc<LightweightTaskRunner>,
    pub(crate) execution: Arc<ExecutionManager>,
    pub(crate) cluster: Arc<ClusterManager>,
    pub(crate) stalled: Arc<StalledTaskWatcher>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) metrics: MetricsCollector,
    watcher: Mutex<Option<WatcherLoop>>,
}

impl TaskManager {
    pub(crate) fn from_parts(parts: TaskManagerParts) -> Self {
        Self {
            config: parts.config,
            tasks: parts.storage.tasks,
            nodes: parts.storage.nodes,
            synchronizer: parts.synchronizer,
            handlers: parts.handlers,
            listeners: parts.listeners,
            lightweight: parts.lightweight,
            execution: parts.execution,
            cluster: parts.cluster,
            stalled: parts.stalled,
            clock: parts.clock,
            metrics: MetricsCollector::new(),
            watcher: Mutex::new(None),
        }
    }

    // ---- 节点生命周期 ----

    /// 注册节点、整体同步作业存储并启动后台循环
    ///
    /// 本地调度启动失败只记录日志，节点以错误状态继续提供管理操作。
    pub async fn start(&self) -> TaskManagerResult<()> {
        info!(node_id = %self.node_id(), "启动任务管理器");
        self.cluster.register_node().await?;

        let tasks = self.tasks.search(&TaskQuery::all()).await?;
        self.synchronizer.synchronize_job_store(&tasks).await;

        if self.config.scheduler.enabled {
            if let Err(e) = self.execution.start_local_scheduler() {
                error!("本地调度未能启动: {}", e);
            }
        } else {
            info!("配置禁用了本地调度");
        }

        self.cluster.start_heartbeat();
        if self.config.stalled_tasks.enabled {
            self.start_stalled_watcher();
        }
        Ok(())
    }

    fn start_stalled_watcher(&self) {
        let mut watcher = self.watcher.lock().unwrap_or_else(PoisonError::into_inner);
        if watcher.is_some() {
            return;
        }
        let cancel = CancellationToken::new();
        let interval = StdDuration::from_secs(self.config.stalled_tasks.check_interval_seconds);
        let handle = self.stalled.clone().spawn(interval, cancel.clone());
        *watcher = Some(WatcherLoop { cancel, handle });
        debug!(interval = ?interval, "停滞任务检查已启动");
    }

    /// 停止后台循环和本地调度，超时仍未结束的任务按线程停止动作处理，最后标记节点下线
    pub async fn shutdown(&self, timeout: StdDuration) {
        info!(node_id = %self.node_id(), "关闭任务管理器");
        let watcher = self
            .watcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(WatcherLoop { cancel, handle }) = watcher {
            cancel.cancel();
            if let Err(e) = handle.await {
                warn!("停滞任务检查异常退出: {}", e);
            }
        }

        self.cluster.stop_heartbeat().await;
        self.execution.shutdown(timeout).await;
        if let Err(e) = self.cluster.record_node_shutdown().await {
            warn!("记录节点下线失败: {}", e);
        }
        info!(node_id = %self.node_id(), "任务管理器已关闭");
    }

    pub fn node_id(&self) -> &str {
        self.cluster.node_id()
    }

    pub fn is_current_node(&self, node_id: &str) -> bool {
        self.cluster.is_current_node(node_id)
    }

    pub fn execution_manager(&self) -> &Arc<ExecutionManager> {
        &self.execution
    }

    pub fn cluster_manager(&self) -> &Arc<ClusterManager> {
        &self.cluster
    }

    // ---- 处理器和监听器 ----

    pub fn register_handler(
        &self,
        uri: impl Into<String>,
        handler: Arc<dyn TaskHandler>,
    ) -> TaskManagerResult<()> {
        self.handlers.register(uri, handler)
    }

    pub fn register_listener(&self, listener: Arc<dyn TaskListener>) {
        self.listeners.register(listener);
    }

    // ---- 读取任务 ----

    /// 创建一个未持久化的任务实例
    pub fn create_task_instance(&self, name: impl Into<String>) -> Task {
        let mut task = Task::new(name);
        task.created_at = Some(self.clock.now());
        task
    }

    pub async fn get_task(
        &self,
        oid: &str,
        options: TaskRetrieveOptions,
    ) -> TaskManagerResult<Task> {
        let task = self.tasks.get(oid).await?;
        let mut enriched = self.enrich(vec![task], options).await;
        enriched
            .pop()
            .ok_or_else(|| TaskManagerError::task_not_found(oid))
    }

    pub async fn search_tasks(
        &self,
        query: &TaskQuery,
        options: TaskRetrieveOptions,
    ) -> TaskManagerResult<Vec<Task>> {
        let tasks = self.tasks.search(query).await?;
        Ok(self.enrich(tasks, options).await)
    }

    pub async fn count_tasks(&self, query: &TaskQuery) -> TaskManagerResult<usize> {
        self.tasks.count(query).await
    }

    /// 列出子任务；`deep` 时包含全部后代，按层次顺序
    pub async fn list_subtasks(&self, oid: &str, deep: bool) -> TaskManagerResult<Vec<Task>> {
        let mut result = Vec::new();
        let mut pending = VecDeque::from([oid.to_string()]);

        while let Some(parent) = pending.pop_front() {
            let children = self.tasks.search(&TaskQuery::children_of(parent)).await?;
            for child in children {
                if deep {
                    if let Some(child_oid) = &child.oid {
                        pending.push_back(child_oid.clone());
                    }
                }
                result.push(child);
            }
        }
        Ok(result)
    }

    /// 按选项填充集群中观察到的执行节点和下次运行时间；附加信息获取失败只记录日志
    async fn enrich(&self, mut tasks: Vec<Task>, options: TaskRetrieveOptions) -> Vec<Task> {
        if options.is_plain() || tasks.is_empty() {
            return tasks;
        }

        if options.include_cluster_status {
            match self
                .execution
                .get_cluster_status(options.allow_cached_status)
                .await
            {
                Ok(status) => {
                    for task in &mut tasks {
                        task.node_as_observed = task
                            .oid
                            .as_deref()
                            .and_then(|oid| status.find_node_running_task(oid))
                            .map(str::to_string);
                    }
                }
                Err(e) => warn!("获取集群状态失败: {}", e),
            }
        }

        if options.include_next_run_time {
            for task in &mut tasks {
                let Some(oid) = task.oid.as_deref() else {
                    continue;
                };
                match self.synchronizer.next_run_start_time(oid).await {
                    Ok(next) => task.next_run_start_time = next,
                    Err(e) => warn!(task_oid = oid, "读取下次运行时间失败: {}", e),
                }
            }
        }
        tasks
    }

    // ---- 节点 ----

    pub async fn get_node(&self, node_id: &str) -> TaskManagerResult<Node> {
        self.nodes.get(node_id).await
    }

    pub async fn search_nodes(&self) -> TaskManagerResult<Vec<Node>> {
        let mut nodes = self.nodes.list().await?;
        nodes.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        Ok(nodes)
    }

    pub async fn delete_node(&self, node_id: &str) -> TaskManagerResult<()> {
        self.cluster.delete_node(node_id).await
    }

    // ---- 集群和调度 ----

    pub async fn get_cluster_status(
        &self,
        allow_cached: bool,
    ) -> TaskManagerResult<ClusterStatusInformation> {
        self.execution.get_cluster_status(allow_cached).await
    }

    pub async fn start_scheduler(&self, node_id: &str) -> TaskManagerResult<()> {
        self.execution.start_scheduler_on(node_id).await
    }

    pub async fn stop_scheduler(&self, node_id: &str) -> TaskManagerResult<()> {
        self.execution.stop_scheduler_on(node_id).await
    }

    pub fn is_local_scheduler_running(&self) -> bool {
        self.execution.is_local_scheduler_running()
    }

    // ---- 轻量级任务和停滞检测 ----

    /// 在本节点启动一个不持久化的任务，处理器按任务的处理器URI查找
    ///
    /// 设置了父任务且父任务正在本节点运行时，子任务随父任务取消，父任务结束前会等待它。
    pub fn start_lightweight_task(&self, task: Task) -> TaskManagerResult<LightweightTaskHandle> {
        let Some(uri) = task.handler_uri.clone() else {
            return Err(TaskManagerError::SchemaViolation(format!(
                "轻量级任务 {} 没有设置处理器URI",
                task.display_id()
            )));
        };
        let handler = self.handlers.get(&uri).ok_or(TaskManagerError::ObjectNotFound {
            kind: "处理器",
            id: uri,
        })?;
        let parent = task
            .parent
            .as_deref()
            .and_then(|oid| self.execution.local_running_task(oid));
        if parent.is_none() && task.parent.is_some() {
            debug!(task = %task.display_id(), "父任务不在本节点运行，子任务独立运行");
        }
        self.lightweight.start(task, handler, parent.as_ref())
    }

    pub async fn check_stalled_tasks(&self) -> StalledScanReport {
        self.stalled.scan().await
    }
}
