#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration as StdDuration;

    use async_trait::async_trait;
    use chrono::{Duration, TimeZone, Utc};
    use taskmgr_core::{Clock, ManualClock, SchedulerConfig, TaskManagerError, TaskManagerResult};
    use taskmgr_dispatcher::{
        JobExecutionContext, JobRunner, SchedulerEngine, SchedulerEngineConfig, TaskSynchronizer,
    };
    use taskmgr_domain::{
        JobStore, Node, NodeErrorStatus, NodeExecutionStatus, NodeRepository, NodeRuntimeStatus,
        Task, TaskExecutionStatus, TaskRepository,
    };
    use taskmgr_infrastructure::{InMemoryJobStore, InMemoryNodeRepository, InMemoryTaskRepository};
    use taskmgr_worker::{
        ClusterManager, ClusterManagerConfig, ExecutionComponents, ExecutionManager,
        LightweightTaskRunner, LocalNodeState, LocalRunningTasks, RemoteNodeClient, TaskRecovery,
    };

    struct IdleRunner;

    #[async_trait]
    impl JobRunner for IdleRunner {
        async fn execute(&self, _context: JobExecutionContext) {}
    }

    /// 所有远程节点都不可达
    struct OfflineClient;

    #[async_trait]
    impl RemoteNodeClient for OfflineClient {
        async fn node_status(&self, node: &Node) -> TaskManagerResult<NodeRuntimeStatus> {
            Err(offline(node))
        }

        async fn stop_task(&self, node: &Node, _oid: &str) -> TaskManagerResult<bool> {
            Err(offline(node))
        }

        async fn start_scheduler(&self, node: &Node) -> TaskManagerResult<()> {
            Err(offline(node))
        }

        async fn stop_scheduler(&self, node: &Node) -> TaskManagerResult<()> {
            Err(offline(node))
        }
    }

    fn offline(node: &Node) -> TaskManagerError {
        TaskManagerError::CommunicationFailure {
            node: node.node_id.clone(),
            message: "offline".into(),
        }
    }

    struct Shared {
        tasks: Arc<InMemoryTaskRepository>,
        nodes: Arc<InMemoryNodeRepository>,
        job_store: Arc<InMemoryJobStore>,
        clock: Arc<ManualClock>,
    }

    fn shared() -> Shared {
        Shared {
            tasks: Arc::new(InMemoryTaskRepository::new()),
            nodes: Arc::new(InMemoryNodeRepository::new()),
            job_store: Arc::new(InMemoryJobStore::new()),
            clock: Arc::new(ManualClock::new(
                Utc.with_ymd_and_hms(2024, 7, 1, 10, 0, 0).unwrap(),
            )),
        }
    }

    fn config(clustered: bool) -> ClusterManagerConfig {
        ClusterManagerConfig {
            url: Some("http://127.0.0.1:8080".into()),
            clustered,
            heartbeat_interval: StdDuration::from_secs(10),
            node_timeout: Duration::seconds(30),
            job_store_fingerprint: "memory".into(),
            job_store_shareable: true,
        }
    }

    fn cluster_manager(
        shared: &Shared,
        node_id: &str,
        config: ClusterManagerConfig,
    ) -> (Arc<ClusterManager>, Arc<ExecutionManager>) {
        let clock: Arc<dyn Clock> = shared.clock.clone();
        let synchronizer = Arc::new(TaskSynchronizer::new(
            shared.job_store.clone(),
            clock.clone(),
        ));
        let engine = Arc::new(SchedulerEngine::new(
            SchedulerEngineConfig::from_config(&SchedulerConfig::default(), node_id),
            shared.job_store.clone(),
            Arc::new(IdleRunner),
            clock.clone(),
        ));
        let recovery = Arc::new(TaskRecovery::new(
            shared.tasks.clone(),
            synchronizer.clone(),
            clock.clone(),
        ));
        let execution = Arc::new(ExecutionManager::new(
            ExecutionComponents {
                node: Arc::new(LocalNodeState::new(node_id)),
                engine,
                synchronizer,
                nodes: shared.nodes.clone(),
                running: Arc::new(LocalRunningTasks::new()),
                lightweight: Arc::new(LightweightTaskRunner::new(2, clock.clone())),
                recovery: recovery.clone(),
                remote: Arc::new(OfflineClient),
                clock: clock.clone(),
            },
            Duration::seconds(1),
            StdDuration::from_millis(10),
        ));
        let manager = Arc::new(ClusterManager::new(
            config,
            shared.nodes.clone(),
            shared.tasks.clone(),
            shared.job_store.clone(),
            execution.clone(),
            recovery,
            clock,
        ));
        (manager, execution)
    }

    fn other_node(id: &str, last_check_in: chrono::DateTime<Utc>) -> Node {
        let mut node = Node::new(id, format!("token-{id}"), "memory", last_check_in);
        node.clustered = true;
        node
    }

    #[tokio::test]
    async fn test_duplicate_node_id_blocks_scheduling() {
        let shared = shared();
        let (first, _) = cluster_manager(&shared, "node-1", config(true));
        let (second, second_execution) = cluster_manager(&shared, "node-1", config(true));

        first.register_node().await.unwrap();
        let original = shared.nodes.get("node-1").await.unwrap();

        second.register_node().await.unwrap();
        assert_eq!(second.error_status(), NodeErrorStatus::DuplicateNodeId);
        assert!(first.error_status().is_ok());
        assert!(second_execution.start_local_scheduler().is_err());

        // 另一个进程的节点记录不被覆盖
        let record = shared.nodes.get("node-1").await.unwrap();
        assert_eq!(record.instance_token, original.instance_token);
    }

    #[tokio::test]
    async fn test_dead_node_is_marked_down_and_its_tasks_recovered() {
        let shared = shared();
        let (manager, _) = cluster_manager(&shared, "node-1", config(true));
        manager.register_node().await.unwrap();

        let stale = shared.clock.now() - Duration::seconds(120);
        shared.nodes.add(other_node("node-2", stale)).await.unwrap();
        let mut orphan = Task::new("失联节点上的任务").with_status(TaskExecutionStatus::Running);
        orphan.node = Some("node-2".into());
        let oid = shared.tasks.add(orphan).await.unwrap();

        manager.heartbeat().await.unwrap();

        let node = shared.nodes.get("node-2").await.unwrap();
        assert_eq!(node.execution_status, NodeExecutionStatus::Down);
        let task = shared.tasks.get(&oid).await.unwrap();
        assert_eq!(task.execution_status, TaskExecutionStatus::Runnable);
        assert!(!shared.job_store.triggers_of_job(&oid).await.unwrap().is_empty());
        assert!(manager.error_status().is_ok());
    }

    #[tokio::test]
    async fn test_non_clustered_node_with_live_peers_enters_error_state() {
        let shared = shared();
        let (manager, execution) = cluster_manager(&shared, "node-1", config(false));
        manager.register_node().await.unwrap();
        execution.start_local_scheduler().unwrap();

        shared
            .nodes
            .add(other_node("node-2", shared.clock.now()))
            .await
            .unwrap();
        manager.heartbeat().await.unwrap();

        assert_eq!(
            manager.error_status(),
            NodeErrorStatus::NonClusteredNodeWithOthers
        );
        assert!(!execution.is_local_scheduler_running());
        let record = shared.nodes.get("node-1").await.unwrap();
        assert_eq!(record.error_status, NodeErrorStatus::NonClusteredNodeWithOthers);
    }

    #[tokio::test]
    async fn test_job_store_mismatch_is_detected() {
        let shared = shared();
        let (manager, _) = cluster_manager(&shared, "node-1", config(true));
        let mut peer = other_node("node-2", shared.clock.now());
        peer.job_store_fingerprint = "sqlite://other.db".into();

        assert_eq!(
            manager.verify_configuration(&[peer]),
            Some(NodeErrorStatus::JobStoreMismatch)
        );

        let mut unshared = config(true);
        unshared.job_store_shareable = false;
        let (manager, _) = cluster_manager(&shared, "node-3", unshared);
        assert_eq!(
            manager.verify_configuration(&[]),
            Some(NodeErrorStatus::LocalConfigurationError)
        );
    }

    #[tokio::test]
    async fn test_delete_node_rules() {
        let shared = shared();
        let (manager, _) = cluster_manager(&shared, "node-1", config(true));
        manager.register_node().await.unwrap();
        shared
            .nodes
            .add(other_node("node-2", shared.clock.now()))
            .await
            .unwrap();
        shared
            .nodes
            .add(other_node(
                "node-3",
                shared.clock.now() - Duration::minutes(10),
            ))
            .await
            .unwrap();

        assert!(manager
            .delete_node("node-1")
            .await
            .unwrap_err()
            .is_state_conflict());
        assert!(manager
            .delete_node("node-2")
            .await
            .unwrap_err()
            .is_state_conflict());
        manager.delete_node("node-3").await.unwrap();
        assert!(shared.nodes.get("node-3").await.unwrap_err().is_not_found());
        assert!(manager.delete_node("node-9").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_graceful_restart_is_not_a_duplicate() {
        let shared = shared();
        let (before, _) = cluster_manager(&shared, "node-1", config(true));
        before.register_node().await.unwrap();
        before.record_node_shutdown().await.unwrap();
        assert_eq!(
            shared.nodes.get("node-1").await.unwrap().execution_status,
            NodeExecutionStatus::Down
        );

        let (after, _) = cluster_manager(&shared, "node-1", config(true));
        after.register_node().await.unwrap();
        assert!(after.error_status().is_ok());
        let record = shared.nodes.get("node-1").await.unwrap();
        assert_eq!(record.execution_status, NodeExecutionStatus::Up);
    }

    #[tokio::test]
    async fn test_crashed_predecessor_tasks_are_recovered_on_register() {
        let shared = shared();
        let crashed = other_node("node-1", shared.clock.now() - Duration::minutes(5));
        shared.nodes.add(crashed).await.unwrap();
        let mut leftover = Task::new("上次遗留").with_status(TaskExecutionStatus::Running);
        leftover.node = Some("node-1".into());
        let oid = shared.tasks.add(leftover).await.unwrap();

        let (manager, _) = cluster_manager(&shared, "node-1", config(true));
        manager.register_node().await.unwrap();

        assert!(manager.error_status().is_ok());
        assert_eq!(
            shared.tasks.get(&oid).await.unwrap().execution_status,
            TaskExecutionStatus::Runnable
        );
    }
}
