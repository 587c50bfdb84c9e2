#[cfg(test)]
mod tests {
    use std::collections::{HashMap, HashSet};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration as StdDuration;

    use async_trait::async_trait;
    use chrono::{Duration, TimeZone, Utc};
    use serde_json::json;
    use taskmgr_core::{AppConfig, Clock, ManualClock, TaskManagerError, TaskManagerResult};
    use taskmgr_domain::{
        JobStore, ModifyGuard, Node, NodeRuntimeStatus, OperationResult, OperationResultStatus,
        ScheduleSpec, Task, TaskBinding, TaskDelta, TaskExecutionStatus, TaskQuery,
        TaskRepository, TriggerState, WaitingReason,
    };
    use taskmgr_infrastructure::{
        InMemoryJobStore, InMemoryNodeRepository, InMemoryTaskRepository, Storage,
    };
    use taskmgr_manager::{TaskManager, TaskManagerBuilder, TaskRetrieveOptions};
    use taskmgr_worker::{
        ExecutionManager, NoOpTaskHandler, RemoteNodeClient, RunningTask, TaskHandler,
        TaskListener, TaskRunResult, WaitPolicy, NOOP_HANDLER_URI,
    };

    /// 进程内集群：直接调用其他节点的执行管理器
    #[derive(Default)]
    struct InProcessClient {
        nodes: Mutex<HashMap<String, Arc<ExecutionManager>>>,
    }

    impl InProcessClient {
        fn join(&self, execution: &Arc<ExecutionManager>) {
            self.nodes
                .lock()
                .unwrap()
                .insert(execution.node_id().to_string(), execution.clone());
        }

        fn lookup(&self, node: &Node) -> TaskManagerResult<Arc<ExecutionManager>> {
            self.nodes
                .lock()
                .unwrap()
                .get(&node.node_id)
                .cloned()
                .ok_or_else(|| TaskManagerError::CommunicationFailure {
                    node: node.node_id.clone(),
                    message: "节点不在进程内集群中".into(),
                })
        }
    }

    #[async_trait]
    impl RemoteNodeClient for InProcessClient {
        async fn node_status(&self, node: &Node) -> TaskManagerResult<NodeRuntimeStatus> {
            Ok(self.lookup(node)?.local_node_status())
        }

        async fn stop_task(&self, node: &Node, oid: &str) -> TaskManagerResult<bool> {
            Ok(self.lookup(node)?.stop_local_task(oid))
        }

        async fn start_scheduler(&self, node: &Node) -> TaskManagerResult<()> {
            self.lookup(node)?.start_local_scheduler()
        }

        async fn stop_scheduler(&self, node: &Node) -> TaskManagerResult<()> {
            self.lookup(node)?.stop_local_scheduler().await
        }
    }

    /// 一直运行到收到停止请求
    struct BlockingHandler;

    #[async_trait]
    impl TaskHandler for BlockingHandler {
        async fn run(&self, task: Arc<RunningTask>) -> TaskRunResult {
            while !task.is_cancelled() {
                task.increment_progress();
                tokio::time::sleep(StdDuration::from_millis(10)).await;
            }
            TaskRunResult::interrupted()
        }
    }

    #[derive(Default)]
    struct CountingListener {
        started: AtomicUsize,
        finished: AtomicUsize,
    }

    impl TaskListener for CountingListener {
        fn on_task_start(&self, _task: &Task) -> anyhow::Result<()> {
            self.started.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn on_task_finish(&self, _task: &Task, _result: &TaskRunResult) -> anyhow::Result<()> {
            self.finished.fetch_add(1, Ordering::SeqCst);
            anyhow::bail!("监听器错误不影响调用方")
        }
    }

    /// 对指定任务的删除总是失败
    struct FailingDeleteRepository {
        inner: Arc<InMemoryTaskRepository>,
        failing: HashSet<String>,
    }

    #[async_trait]
    impl TaskRepository for FailingDeleteRepository {
        async fn get(&self, oid: &str) -> TaskManagerResult<Task> {
            self.inner.get(oid).await
        }

        async fn search(&self, query: &TaskQuery) -> TaskManagerResult<Vec<Task>> {
            self.inner.search(query).await
        }

        async fn count(&self, query: &TaskQuery) -> TaskManagerResult<usize> {
            self.inner.count(query).await
        }

        async fn add(&self, task: Task) -> TaskManagerResult<String> {
            self.inner.add(task).await
        }

        async fn modify(
            &self,
            oid: &str,
            deltas: &[TaskDelta],
            guard: Option<&ModifyGuard>,
        ) -> TaskManagerResult<Task> {
            self.inner.modify(oid, deltas, guard).await
        }

        async fn delete(&self, oid: &str) -> TaskManagerResult<()> {
            if self.failing.contains(oid) {
                return Err(TaskManagerError::Internal(format!("无法删除 {oid}")));
            }
            self.inner.delete(oid).await
        }
    }

    struct Fixture {
        manager: Arc<TaskManager>,
        tasks: Arc<InMemoryTaskRepository>,
        job_store: Arc<InMemoryJobStore>,
        clock: Arc<ManualClock>,
        listener: Arc<CountingListener>,
    }

    fn config(node_id: &str, scheduler_enabled: bool) -> AppConfig {
        let mut config = AppConfig::default();
        config.node.node_id = Some(node_id.to_string());
        config.node.clustered = true;
        config.scheduler.enabled = scheduler_enabled;
        config.scheduler.thread_count = 2;
        config.scheduler.idle_wait_ms = 20;
        config.cluster.heartbeat_interval_seconds = 3600;
        config.cluster.status_cache_ttl_ms = 0;
        config.cluster.stop_poll_interval_ms = 10;
        config.stalled_tasks.enabled = false;
        config
    }

    fn clock() -> Arc<ManualClock> {
        Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 8, 1, 12, 0, 0).unwrap(),
        ))
    }

    async fn fixture_with(
        scheduler_enabled: bool,
        tasks: Arc<InMemoryTaskRepository>,
        task_repository: Arc<dyn TaskRepository>,
    ) -> Fixture {
        let clock = clock();
        let job_store = Arc::new(InMemoryJobStore::new());
        let listener = Arc::new(CountingListener::default());
        let storage = Storage {
            tasks: task_repository,
            nodes: Arc::new(InMemoryNodeRepository::new()),
            job_store: job_store.clone(),
        };

        let manager = TaskManagerBuilder::new(config("node-1", scheduler_enabled))
            .storage(storage)
            .clock(clock.clone())
            .remote_client(Arc::new(InProcessClient::default()))
            .register_handler(NOOP_HANDLER_URI, Arc::new(NoOpTaskHandler))
            .register_listener(listener.clone())
            .job_store_shareable(true)
            .build()
            .await
            .unwrap();
        let manager = Arc::new(manager);
        manager.start().await.unwrap();

        Fixture {
            manager,
            tasks,
            job_store,
            clock,
            listener,
        }
    }

    async fn fixture(scheduler_enabled: bool) -> Fixture {
        let tasks = Arc::new(InMemoryTaskRepository::new());
        fixture_with(scheduler_enabled, tasks.clone(), tasks).await
    }

    fn recurring_task(name: &str) -> Task {
        Task::new(name)
            .with_handler(NOOP_HANDLER_URI)
            .recurring(TaskBinding::Loose, ScheduleSpec::interval(60))
    }

    impl Fixture {
        async fn task(&self, oid: &str) -> Task {
            self.tasks.get(oid).await.unwrap()
        }

        async fn trigger_count(&self, oid: &str) -> usize {
            self.job_store.triggers_of_job(oid).await.unwrap().len()
        }

        async fn wait_for_status(&self, oid: &str, status: TaskExecutionStatus) -> Task {
            tokio::time::timeout(StdDuration::from_secs(5), async {
                loop {
                    let task = self.task(oid).await;
                    if task.execution_status == status {
                        return task;
                    }
                    tokio::time::sleep(StdDuration::from_millis(10)).await;
                }
            })
            .await
            .expect("任务未在预期时间内进入目标状态")
        }
    }

    #[tokio::test]
    async fn test_recurring_loose_task_suspend_and_resume() {
        let fixture = fixture(false).await;
        let now = fixture.clock.now();
        let oid = fixture
            .manager
            .add_task(recurring_task("每分钟同步"))
            .await
            .unwrap();

        let task = fixture
            .manager
            .get_task(&oid, TaskRetrieveOptions::default().with_next_run_time())
            .await
            .unwrap();
        assert_eq!(task.execution_status, TaskExecutionStatus::Runnable);
        assert_eq!(fixture.trigger_count(&oid).await, 1);
        assert!(task.next_run_start_time.unwrap() <= now + Duration::seconds(60));

        let stopped = fixture
            .manager
            .suspend_task(&oid, WaitPolicy::WaitFor(StdDuration::from_millis(5000)))
            .await
            .unwrap();
        assert!(stopped);
        assert_eq!(
            fixture.task(&oid).await.execution_status,
            TaskExecutionStatus::Suspended
        );
        assert_eq!(fixture.trigger_count(&oid).await, 0);

        fixture.clock.advance(Duration::seconds(30));
        fixture.manager.resume_task(&oid).await.unwrap();
        let resumed = fixture
            .manager
            .get_task(&oid, TaskRetrieveOptions::default().with_next_run_time())
            .await
            .unwrap();
        assert_eq!(resumed.execution_status, TaskExecutionStatus::Runnable);
        assert_eq!(fixture.trigger_count(&oid).await, 1);
        assert_eq!(
            resumed.next_run_start_time,
            Some(fixture.clock.now() + Duration::seconds(60))
        );
        assert_eq!(resumed.result, Some(OperationResult::in_progress()));
    }

    #[tokio::test]
    async fn test_repeated_suspend_and_resume_are_noops() {
        let fixture = fixture(false).await;
        let oid = fixture
            .manager
            .add_task(recurring_task("重复操作"))
            .await
            .unwrap();

        let before = fixture.task(&oid).await;
        fixture.manager.resume_task(&oid).await.unwrap();
        let after = fixture.task(&oid).await;
        assert_eq!(after.version, before.version);
        assert_eq!(after.execution_status, TaskExecutionStatus::Runnable);

        fixture
            .manager
            .suspend_task(&oid, WaitPolicy::DoNotWait)
            .await
            .unwrap();
        let suspended = fixture.task(&oid).await;
        fixture
            .manager
            .suspend_task(&oid, WaitPolicy::DoNotWait)
            .await
            .unwrap();
        let again = fixture.task(&oid).await;
        assert_eq!(again.version, suspended.version);
        assert_eq!(again.execution_status, TaskExecutionStatus::Suspended);
    }

    #[tokio::test]
    async fn test_invalid_unpause_has_no_side_effects() {
        let fixture = fixture(false).await;
        let oid = fixture
            .manager
            .add_task(recurring_task("不能取消暂停"))
            .await
            .unwrap();
        fixture
            .tasks
            .modify(
                &oid,
                &[TaskDelta::Result(Some(OperationResult::success()))],
                None,
            )
            .await
            .unwrap();
        let before = fixture.task(&oid).await;
        let triggers_before = fixture.job_store.triggers_of_job(&oid).await.unwrap();

        let err = fixture.manager.unpause_task(&oid).await.unwrap_err();
        assert!(err.is_state_conflict());

        let after = fixture.task(&oid).await;
        assert_eq!(after.version, before.version);
        assert_eq!(after.execution_status, TaskExecutionStatus::Runnable);
        assert_eq!(after.result, Some(OperationResult::success()));
        let triggers_after = fixture.job_store.triggers_of_job(&oid).await.unwrap();
        assert_eq!(triggers_after.len(), triggers_before.len());
        assert_eq!(
            triggers_after[0].next_fire_time,
            triggers_before[0].next_fire_time
        );
    }

    #[tokio::test]
    async fn test_pause_keeps_paused_trigger_and_unpause_keeps_result() {
        let fixture = fixture(false).await;
        let oid = fixture
            .manager
            .add_task(recurring_task("等待依赖"))
            .await
            .unwrap();
        fixture
            .tasks
            .modify(
                &oid,
                &[TaskDelta::Result(Some(OperationResult::success()))],
                None,
            )
            .await
            .unwrap();

        fixture
            .manager
            .pause_task(&oid, WaitingReason::OtherTasks)
            .await
            .unwrap();
        let waiting = fixture.task(&oid).await;
        assert_eq!(waiting.execution_status, TaskExecutionStatus::Waiting);
        assert_eq!(waiting.waiting_reason, Some(WaitingReason::OtherTasks));
        let triggers = fixture.job_store.triggers_of_job(&oid).await.unwrap();
        assert_eq!(triggers.len(), 1);
        assert_eq!(triggers[0].state, TriggerState::Paused);

        assert!(fixture
            .manager
            .pause_task(&oid, WaitingReason::OtherTasks)
            .await
            .unwrap_err()
            .is_state_conflict());

        fixture.manager.unpause_task(&oid).await.unwrap();
        let runnable = fixture.task(&oid).await;
        assert_eq!(runnable.execution_status, TaskExecutionStatus::Runnable);
        assert_eq!(runnable.waiting_reason, None);
        assert_eq!(runnable.result, Some(OperationResult::success()));
        let triggers = fixture.job_store.triggers_of_job(&oid).await.unwrap();
        assert_eq!(triggers[0].state, TriggerState::Waiting);
    }

    #[tokio::test]
    async fn test_batch_suspend_continues_past_missing_task() {
        let fixture = fixture(false).await;
        let mut oids = Vec::new();
        for i in 0..3 {
            oids.push(
                fixture
                    .manager
                    .add_task(recurring_task(&format!("批量任务{i}")))
                    .await
                    .unwrap(),
            );
        }
        oids.insert(1, "missing".to_string());

        let outcome = fixture
            .manager
            .suspend_tasks(&oids, WaitPolicy::DoNotWait)
            .await;
        assert_eq!(outcome.batch.succeeded.len(), 3);
        assert_eq!(outcome.batch.failed_oids(), vec!["missing"]);
        assert!(outcome.batch.failed[0].error.is_not_found());
        assert_eq!(
            outcome.batch.overall_status(),
            OperationResultStatus::PartialError
        );

        for oid in oids.iter().filter(|oid| *oid != "missing") {
            assert_eq!(
                fixture.task(oid).await.execution_status,
                TaskExecutionStatus::Suspended
            );
            assert_eq!(fixture.trigger_count(oid).await, 0);
        }
    }

    #[tokio::test]
    async fn test_single_task_closes_after_run() {
        let fixture = fixture(true).await;
        let oid = fixture
            .manager
            .add_task(Task::new("一次性任务").with_handler(NOOP_HANDLER_URI))
            .await
            .unwrap();

        let closed = fixture
            .wait_for_status(&oid, TaskExecutionStatus::Closed)
            .await;
        assert!(closed.completion_timestamp.is_some());
        assert_eq!(fixture.trigger_count(&oid).await, 0);
        assert_eq!(fixture.listener.started.load(Ordering::SeqCst), 1);
        assert_eq!(fixture.listener.finished.load(Ordering::SeqCst), 1);

        let err = fixture.manager.resume_task(&oid).await.unwrap_err();
        assert!(err.is_state_conflict());
        assert!(fixture
            .manager
            .schedule_task_now(&oid)
            .await
            .unwrap_err()
            .is_state_conflict());

        fixture.manager.shutdown(StdDuration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_schedule_now_reactivates_closed_recurring_task() {
        let fixture = fixture(false).await;
        let oid = fixture
            .manager
            .add_task(recurring_task("每日报表"))
            .await
            .unwrap();
        fixture
            .tasks
            .modify(
                &oid,
                &[
                    TaskDelta::ExecutionStatus(TaskExecutionStatus::Closed),
                    TaskDelta::CompletionTimestamp(Some(fixture.clock.now())),
                    TaskDelta::Result(Some(OperationResult::fatal_error("上次失败"))),
                ],
                None,
            )
            .await
            .unwrap();

        fixture.manager.schedule_task_now(&oid).await.unwrap();

        let task = fixture.task(&oid).await;
        assert_eq!(task.execution_status, TaskExecutionStatus::Runnable);
        assert_eq!(task.completion_timestamp, None);
        assert_eq!(task.result, Some(OperationResult::in_progress()));
        let next = fixture
            .job_store
            .next_fire_time(&oid)
            .await
            .unwrap()
            .unwrap();
        assert!(next <= fixture.clock.now());

        fixture
            .manager
            .suspend_task(&oid, WaitPolicy::DoNotWait)
            .await
            .unwrap();
        assert!(fixture
            .manager
            .schedule_task_now(&oid)
            .await
            .unwrap_err()
            .is_state_conflict());
    }

    #[tokio::test]
    async fn test_modify_task_resynchronizes_schedule() {
        let fixture = fixture(false).await;
        let oid = fixture
            .manager
            .add_task(
                Task::new("整点任务")
                    .with_handler(NOOP_HANDLER_URI)
                    .recurring(TaskBinding::Tight, ScheduleSpec::interval(60)),
            )
            .await
            .unwrap();

        let err = fixture
            .manager
            .modify_task(
                &oid,
                &[TaskDelta::ExecutionStatus(TaskExecutionStatus::Closed)],
            )
            .await
            .unwrap_err();
        assert!(matches!(err, TaskManagerError::SchemaViolation(_)));

        let before = fixture.job_store.triggers_of_job(&oid).await.unwrap();
        let updated = fixture
            .manager
            .modify_task(
                &oid,
                &[TaskDelta::Schedule(Some(ScheduleSpec::cron("0 0 * * * *")))],
            )
            .await
            .unwrap();
        assert!(updated.schedule.unwrap().cron_like_pattern.is_some());

        let after = fixture.job_store.triggers_of_job(&oid).await.unwrap();
        assert_eq!(after.len(), 1);
        assert_ne!(after[0].fingerprint, before[0].fingerprint);

        let renamed = fixture
            .manager
            .modify_task(&oid, &[TaskDelta::Name("每小时任务".into())])
            .await
            .unwrap();
        assert_eq!(renamed.name, "每小时任务");
    }

    #[tokio::test]
    async fn test_suspend_task_tree_skips_closed_subtasks() {
        let fixture = fixture(false).await;
        let root = fixture
            .manager
            .add_task(recurring_task("父任务"))
            .await
            .unwrap();
        let child = fixture
            .manager
            .add_task(Task::new("子任务").with_parent(root.clone()))
            .await
            .unwrap();
        let grandchild = fixture
            .manager
            .add_task(Task::new("孙任务").with_parent(child.clone()))
            .await
            .unwrap();
        let closed = fixture
            .tasks
            .add(
                Task::new("已完成的子任务")
                    .with_parent(root.clone())
                    .with_status(TaskExecutionStatus::Closed),
            )
            .await
            .unwrap();

        let subtasks = fixture.manager.list_subtasks(&root, false).await.unwrap();
        assert_eq!(subtasks.len(), 2);
        let all = fixture.manager.list_subtasks(&root, true).await.unwrap();
        assert_eq!(all.len(), 3);

        let outcome = fixture
            .manager
            .suspend_task_tree(&root, WaitPolicy::DoNotWait)
            .await
            .unwrap();
        assert!(outcome.batch.is_success());
        assert_eq!(outcome.batch.succeeded.len(), 3);
        for oid in [&root, &child, &grandchild] {
            assert_eq!(
                fixture.task(oid).await.execution_status,
                TaskExecutionStatus::Suspended
            );
        }
        assert_eq!(
            fixture.task(&closed).await.execution_status,
            TaskExecutionStatus::Closed
        );
    }

    #[tokio::test]
    async fn test_suspend_and_delete_removes_tasks_and_jobs() {
        let fixture = fixture(false).await;
        let a = fixture.manager.add_task(recurring_task("a")).await.unwrap();
        let b = fixture.manager.add_task(recurring_task("b")).await.unwrap();

        let outcome = fixture
            .manager
            .suspend_and_delete_tasks(
                &[a.clone(), "missing".to_string(), b.clone()],
                StdDuration::from_millis(200),
            )
            .await;
        assert_eq!(outcome.succeeded, vec![a.clone(), b.clone()]);
        assert_eq!(outcome.failed_oids(), vec!["missing"]);

        for oid in [&a, &b] {
            assert!(fixture.tasks.get(oid).await.unwrap_err().is_not_found());
            assert!(!fixture.job_store.job_exists(oid).await.unwrap());
        }
        assert_eq!(fixture.manager.count_tasks(&TaskQuery::all()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_cleanup_deletes_old_closed_trees_and_continues_after_failure() {
        let tasks = Arc::new(InMemoryTaskRepository::new());
        let now = clock().now();
        let old = now - Duration::days(40);
        let recent = now - Duration::days(10);

        async fn closed(
            tasks: &InMemoryTaskRepository,
            oid: &str,
            parent: Option<&str>,
            at: chrono::DateTime<Utc>,
        ) {
            let mut task = Task::new(oid)
                .with_oid(oid)
                .with_status(TaskExecutionStatus::Closed);
            task.parent = parent.map(str::to_string);
            task.completion_timestamp = Some(at);
            tasks.add(task).await.unwrap();
        }

        closed(&tasks, "a", None, old).await;
        closed(&tasks, "a1", Some("a"), old).await;
        closed(&tasks, "a2", Some("a1"), old).await;
        closed(&tasks, "b", None, recent).await;
        closed(&tasks, "c", None, old).await;
        tasks
            .add(Task::new("c1").with_oid("c1").with_parent("c"))
            .await
            .unwrap();
        closed(&tasks, "d", None, old).await;
        closed(&tasks, "e", None, old).await;

        let failing = Arc::new(FailingDeleteRepository {
            inner: tasks.clone(),
            failing: HashSet::from(["d".to_string()]),
        });
        let fixture = fixture_with(false, tasks.clone(), failing).await;

        let outcome = fixture
            .manager
            .cleanup_tasks(Duration::days(30))
            .await
            .unwrap();
        assert_eq!(outcome.deleted_trees, 2);
        assert_eq!(outcome.deleted_tasks, 4);
        assert_eq!(outcome.skipped_trees, 1);
        assert_eq!(outcome.failed.len(), 1);
        assert_eq!(outcome.failed[0].oid, "d");
        assert_eq!(outcome.overall_status(), OperationResultStatus::PartialError);

        for oid in ["a", "a1", "a2", "e"] {
            assert!(tasks.get(oid).await.unwrap_err().is_not_found());
        }
        for oid in ["b", "c", "c1", "d"] {
            assert!(tasks.get(oid).await.is_ok());
        }
    }

    #[tokio::test]
    async fn test_lightweight_task_runs_with_registered_handler() {
        let fixture = fixture(false).await;

        let task = fixture
            .manager
            .create_task_instance("轻量级任务")
            .with_handler(NOOP_HANDLER_URI)
            .with_extension("steps", json!(2));
        let handle = fixture.manager.start_lightweight_task(task).unwrap();
        let outcome = handle.wait().await;
        assert!(!outcome.is_error());
        assert_eq!(outcome.task.execution_status, TaskExecutionStatus::Closed);

        let missing = fixture
            .manager
            .create_task_instance("没有处理器")
            .with_handler("test:unknown");
        assert!(fixture
            .manager
            .start_lightweight_task(missing)
            .unwrap_err()
            .is_not_found());

        let persistent = Task::new("已持久化")
            .with_oid("t1")
            .with_handler(NOOP_HANDLER_URI);
        assert!(fixture.manager.start_lightweight_task(persistent).is_err());
    }

    #[tokio::test]
    async fn test_lightweight_child_follows_running_parent() {
        let clock = clock();
        let manager = TaskManagerBuilder::new(config("node-1", true))
            .storage(Storage::in_memory())
            .clock(clock.clone())
            .remote_client(Arc::new(InProcessClient::default()))
            .register_handler("test:blocking", Arc::new(BlockingHandler))
            .job_store_shareable(true)
            .build()
            .await
            .unwrap();
        manager.start().await.unwrap();

        let oid = manager
            .add_task(Task::new("父任务").with_handler("test:blocking"))
            .await
            .unwrap();
        let parent = tokio::time::timeout(StdDuration::from_secs(5), async {
            loop {
                if let Some(parent) = manager.execution_manager().local_running_task(&oid) {
                    return parent;
                }
                tokio::time::sleep(StdDuration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        let child = manager
            .create_task_instance("子任务")
            .with_handler("test:blocking")
            .with_parent(oid.clone());
        let handle = manager.start_lightweight_task(child).unwrap();
        assert_eq!(parent.children(), vec![handle.lightweight_id().to_string()]);

        // 父任务被挂起时子任务一起停止
        assert!(manager
            .suspend_task(&oid, WaitPolicy::WaitFor(StdDuration::from_secs(5)))
            .await
            .unwrap());
        let outcome = tokio::time::timeout(StdDuration::from_secs(5), handle.wait())
            .await
            .unwrap();
        assert_eq!(outcome.task.parent.as_deref(), Some(oid.as_str()));
        assert_eq!(outcome.task.execution_status, TaskExecutionStatus::Closed);

        // 父任务不在本节点运行时独立启动
        let orphan = manager
            .create_task_instance("独立子任务")
            .with_handler("test:blocking")
            .with_parent("missing");
        let orphan = manager.start_lightweight_task(orphan).unwrap();
        assert!(!orphan.running_task().is_cancelled());
        assert!(orphan
            .cancel_and_wait(StdDuration::from_secs(5))
            .await
            .is_some());

        manager.shutdown(StdDuration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_oversized_interval_is_rejected() {
        let fixture = fixture(false).await;
        let huge = Task::new("超长间隔")
            .with_handler(NOOP_HANDLER_URI)
            .recurring(TaskBinding::Loose, ScheduleSpec::interval(10_000_000_000_000));
        let err = fixture.manager.add_task(huge).await.unwrap_err();
        assert!(err.is_schema_violation());
        assert!(fixture
            .tasks
            .search(&TaskQuery::default())
            .await
            .unwrap()
            .is_empty());

        // 修改为超长间隔同样被拒绝，原有调度不变
        let oid = fixture
            .manager
            .add_task(recurring_task("每分钟同步"))
            .await
            .unwrap();
        let err = fixture
            .manager
            .modify_task(
                &oid,
                &[TaskDelta::Schedule(Some(ScheduleSpec::interval(
                    10_000_000_000_000,
                )))],
            )
            .await
            .unwrap_err();
        assert!(err.is_schema_violation());
        let task = fixture.task(&oid).await;
        assert_eq!(task.schedule.unwrap().interval_seconds, Some(60));
        assert_eq!(fixture.trigger_count(&oid).await, 1);
    }

    #[tokio::test]
    async fn test_suspend_stops_task_running_on_other_node() {
        let storage = Storage::in_memory();
        let clock = clock();
        let client = Arc::new(InProcessClient::default());

        let build = |node_id: &str, scheduler_enabled: bool| {
            TaskManagerBuilder::new(config(node_id, scheduler_enabled))
                .storage(storage.clone())
                .clock(clock.clone())
                .remote_client(client.clone())
                .register_handler("test:blocking", Arc::new(BlockingHandler))
                .job_store_shareable(true)
                .build()
        };
        let admin = build("node-1", false).await.unwrap();
        let worker = build("node-2", true).await.unwrap();
        client.join(admin.execution_manager());
        client.join(worker.execution_manager());
        admin.start().await.unwrap();
        worker.start().await.unwrap();

        let oid = admin
            .add_task(Task::new("长时间运行").with_handler("test:blocking"))
            .await
            .unwrap();

        let observed = tokio::time::timeout(StdDuration::from_secs(5), async {
            loop {
                let task = admin
                    .get_task(&oid, TaskRetrieveOptions::default().with_cluster_status())
                    .await
                    .unwrap();
                if task.node_as_observed.is_some() {
                    return task.node_as_observed;
                }
                tokio::time::sleep(StdDuration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(observed.as_deref(), Some("node-2"));

        let stopped = admin
            .suspend_task(&oid, WaitPolicy::WaitFor(StdDuration::from_secs(5)))
            .await
            .unwrap();
        assert!(stopped);

        let status = admin.get_cluster_status(false).await.unwrap();
        assert!(!status.is_task_running(&oid));
        let task = storage.tasks.get(&oid).await.unwrap();
        assert_eq!(task.execution_status, TaskExecutionStatus::Suspended);

        let nodes = admin.search_nodes().await.unwrap();
        assert_eq!(nodes.len(), 2);
        assert!(admin.is_current_node("node-1"));
        assert!(admin
            .delete_node("node-2")
            .await
            .unwrap_err()
            .is_state_conflict());

        worker.shutdown(StdDuration::from_secs(1)).await;
        admin.shutdown(StdDuration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_remote_scheduler_control() {
        let storage = Storage::in_memory();
        let clock = clock();
        let client = Arc::new(InProcessClient::default());
        let mut managers = Vec::new();
        for node_id in ["node-1", "node-2"] {
            let manager = TaskManagerBuilder::new(config(node_id, false))
                .storage(storage.clone())
                .clock(clock.clone())
                .remote_client(client.clone())
                .job_store_shareable(true)
                .build()
                .await
                .unwrap();
            client.join(manager.execution_manager());
            manager.start().await.unwrap();
            managers.push(manager);
        }

        managers[0].start_scheduler("node-2").await.unwrap();
        assert!(managers[1].is_local_scheduler_running());
        assert!(!managers[0].is_local_scheduler_running());

        let status = managers[0].get_cluster_status(false).await.unwrap();
        assert!(status.node("node-2").unwrap().scheduler_running);

        managers[0].stop_scheduler("node-2").await.unwrap();
        assert!(!managers[1].is_local_scheduler_running());
        assert!(managers[0]
            .start_scheduler("node-9")
            .await
            .unwrap_err()
            .is_not_found());

        for manager in &managers {
            manager.shutdown(StdDuration::from_secs(1)).await;
        }
        let node = storage.nodes.get("node-1").await.unwrap();
        assert_eq!(
            node.execution_status,
            taskmgr_domain::NodeExecutionStatus::Down
        );
    }
}
