use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::Duration;
use taskmgr_core::{AppConfig, Clock, SystemClock, TaskManagerResult};
use taskmgr_dispatcher::{SchedulerEngine, SchedulerEngineConfig, TaskSynchronizer};
use taskmgr_infrastructure::Storage;
use taskmgr_worker::{
    ClusterManager, ClusterManagerConfig, DependencyResolver, ExecutionComponents,
    ExecutionManager, HttpNodeClient, LightweightTaskRunner, LocalNodeState, LocalRunningTasks,
    RemoteNodeClient, StalledTaskWatcher, TaskHandler, TaskHandlerRegistry, TaskJobExecutor,
    TaskListener, TaskListenerRegistry, TaskRecovery,
};
use tokio::sync::Notify;
use tracing::info;

use crate::task_manager::{TaskManager, TaskManagerParts};

/// 组装一个节点的全部组件
pub struct TaskManagerBuilder {
    config: AppConfig,
    storage: Option<Storage>,
    clock: Arc<dyn Clock>,
    remote: Option<Arc<dyn RemoteNodeClient>>,
    handlers: Vec<(String, Arc<dyn TaskHandler>)>,
    listeners: Vec<Arc<dyn TaskListener>>,
    job_store_shareable: Option<bool>,
}

impl TaskManagerBuilder {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config,
            storage: None,
            clock: Arc::new(SystemClock),
            remote: None,
            handlers: Vec::new(),
            listeners: Vec::new(),
            job_store_shareable: None,
        }
    }

    /// 使用已创建的存储；未设置时按数据库配置创建
    pub fn storage(mut self, storage: Storage) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// 访问其他节点的客户端；未设置时使用HTTP客户端
    pub fn remote_client(mut self, remote: Arc<dyn RemoteNodeClient>) -> Self {
        self.remote = Some(remote);
        self
    }

    pub fn register_handler(mut self, uri: impl Into<String>, handler: Arc<dyn TaskHandler>) -> Self {
        self.handlers.push((uri.into(), handler));
        self
    }

    pub fn register_listener(mut self, listener: Arc<dyn TaskListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    /// 覆盖作业存储能否被多个节点共享的判断，进程内共享内存存储的集群需要设置
    pub fn job_store_shareable(mut self, shareable: bool) -> Self {
        self.job_store_shareable = Some(shareable);
        self
    }

    pub async fn build(self) -> TaskManagerResult<TaskManager> {
        let config = self.config;
        let clock = self.clock;
        let node_id = config.node.resolved_node_id();

        let storage = match self.storage {
            Some(storage) => storage,
            None => Storage::from_config(&config.database).await?,
        };

        let handlers = Arc::new(TaskHandlerRegistry::new());
        for (uri, handler) in self.handlers {
            handlers.register(uri, handler)?;
        }
        let listeners = Arc::new(TaskListenerRegistry::new());
        for listener in self.listeners {
            listeners.register(listener);
        }

        let wakeup = Arc::new(Notify::new());
        let synchronizer = Arc::new(
            TaskSynchronizer::new(storage.job_store.clone(), clock.clone())
                .with_wakeup(wakeup.clone()),
        );
        let running = Arc::new(LocalRunningTasks::new());
        let lightweight = Arc::new(LightweightTaskRunner::new(
            config.lightweight.pool_size,
            clock.clone(),
        ));
        let recovery = Arc::new(TaskRecovery::new(
            storage.tasks.clone(),
            synchronizer.clone(),
            clock.clone(),
        ));
        let dependencies = Arc::new(DependencyResolver::new(
            storage.tasks.clone(),
            synchronizer.clone(),
        ));

        let executor = Arc::new(TaskJobExecutor::new(
            node_id.clone(),
            storage.tasks.clone(),
            synchronizer.clone(),
            handlers.clone(),
            running.clone(),
            listeners.clone(),
            lightweight.clone(),
            recovery.clone(),
            dependencies,
            clock.clone(),
        ));
        let engine = Arc::new(
            SchedulerEngine::new(
                SchedulerEngineConfig::from_config(&config.scheduler, node_id.clone()),
                storage.job_store.clone(),
                executor,
                clock.clone(),
            )
            .with_wakeup(wakeup),
        );

        let remote: Arc<dyn RemoteNodeClient> = match self.remote {
            Some(remote) => remote,
            None => Arc::new(HttpNodeClient::new(StdDuration::from_millis(
                config.cluster.remote_request_timeout_ms,
            ))?),
        };

        let execution = Arc::new(ExecutionManager::new(
            ExecutionComponents {
                node: Arc::new(LocalNodeState::new(node_id.clone())),
                engine,
                synchronizer: synchronizer.clone(),
                nodes: storage.nodes.clone(),
                running: running.clone(),
                lightweight: lightweight.clone(),
                recovery: recovery.clone(),
                remote,
                clock: clock.clone(),
            },
            Duration::milliseconds(config.cluster.status_cache_ttl_ms as i64),
            StdDuration::from_millis(config.cluster.stop_poll_interval_ms),
        ));

        let mut cluster_config = ClusterManagerConfig::from_config(&config);
        if let Some(shareable) = self.job_store_shareable {
            cluster_config.job_store_shareable = shareable;
        }
        let cluster = Arc::new(ClusterManager::new(
            cluster_config,
            storage.nodes.clone(),
            storage.tasks.clone(),
            storage.job_store.clone(),
            execution.clone(),
            recovery,
            clock.clone(),
        ));

        let stalled = Arc::new(StalledTaskWatcher::new(
            storage.tasks.clone(),
            running,
            clock.clone(),
            Duration::seconds(config.stalled_tasks.threshold_seconds),
        ));

        info!(node_id = %node_id, handlers = ?handlers.uris(), "任务管理器组装完成");

        Ok(TaskManager::from_parts(TaskManagerParts {
            config,
            storage,
            synchronizer,
            handlers,
            listeners,
            lightweight,
            execution,
            cluster,
            stalled,
            clock,
        }))
    }
}
