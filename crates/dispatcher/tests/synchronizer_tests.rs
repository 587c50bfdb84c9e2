#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::{Duration, TimeZone, Utc};
    use taskmgr_core::{Clock, ManualClock};
    use taskmgr_dispatcher::{ScheduleAnchor, TaskSynchronizer};
    use taskmgr_domain::{
        JobDetail, JobStore, ScheduleSpec, Task, TaskBinding, TaskExecutionStatus, TriggerKey,
        TriggerSchedule, TriggerState,
    };
    use taskmgr_infrastructure::InMemoryJobStore;

    fn setup() -> (TaskSynchronizer, Arc<InMemoryJobStore>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 5, 10, 12, 0, 0).unwrap(),
        ));
        let store = Arc::new(InMemoryJobStore::new());
        let synchronizer = TaskSynchronizer::new(store.clone(), clock.clone());
        (synchronizer, store, clock)
    }

    fn loose_interval(oid: &str, seconds: u64) -> Task {
        Task::new("周期清理")
            .with_oid(oid)
            .recurring(TaskBinding::Loose, ScheduleSpec::interval(seconds))
    }

    #[tokio::test]
    async fn test_loose_interval_initial_and_resumed() {
        let (sync, store, clock) = setup();
        let now = clock.now();
        let task = loose_interval("t1", 60);

        assert!(sync.synchronize_task(&task).await.unwrap());
        let trigger = store.get_trigger(&TriggerKey::main("t1")).await.unwrap().unwrap();
        assert_eq!(trigger.next_fire_time, now);
        assert_eq!(trigger.schedule, TriggerSchedule::Once);

        let next = sync
            .reschedule_task(&task, ScheduleAnchor::Resumed(now))
            .await
            .unwrap();
        assert_eq!(next, Some(now + Duration::seconds(60)));
    }

    #[tokio::test]
    async fn test_loose_interval_after_run() {
        let (sync, _store, clock) = setup();
        let finished = clock.now() - Duration::seconds(10);
        let task = loose_interval("t1", 60);

        let next = sync
            .reschedule_task(&task, ScheduleAnchor::AfterRun(finished))
            .await
            .unwrap();
        assert_eq!(next, Some(finished + Duration::seconds(60)));
    }

    #[tokio::test]
    async fn test_synchronize_is_idempotent() {
        let (sync, store, clock) = setup();
        let task = loose_interval("t1", 60);

        assert!(sync.synchronize_task(&task).await.unwrap());
        let first = store.get_trigger(&TriggerKey::main("t1")).await.unwrap().unwrap();

        clock.advance(Duration::seconds(5));
        assert!(!sync.synchronize_task(&task).await.unwrap());
        let second = store.get_trigger(&TriggerKey::main("t1")).await.unwrap().unwrap();
        assert_eq!(first.next_fire_time, second.next_fire_time);

        // 调度设置变化后重新布置
        let changed = Task::new("周期清理")
            .with_oid("t1")
            .recurring(TaskBinding::Loose, ScheduleSpec::interval(120));
        assert!(sync.synchronize_task(&changed).await.unwrap());
    }

    #[tokio::test]
    async fn test_status_drives_trigger_presence() {
        let (sync, store, _clock) = setup();
        let task = loose_interval("t1", 60);
        sync.synchronize_task(&task).await.unwrap();

        let waiting = task.clone().with_status(TaskExecutionStatus::Waiting);
        assert!(sync.synchronize_task(&waiting).await.unwrap());
        let trigger = store.get_trigger(&TriggerKey::main("t1")).await.unwrap().unwrap();
        assert_eq!(trigger.state, TriggerState::Paused);

        assert!(sync.synchronize_task(&task).await.unwrap());
        let trigger = store.get_trigger(&TriggerKey::main("t1")).await.unwrap().unwrap();
        assert_eq!(trigger.state, TriggerState::Waiting);

        let suspended = task.clone().with_status(TaskExecutionStatus::Suspended);
        assert!(sync.synchronize_task(&suspended).await.unwrap());
        assert!(store.triggers_of_job("t1").await.unwrap().is_empty());
        assert!(store.job_exists("t1").await.unwrap());
        assert_eq!(sync.next_run_start_time("t1").await.unwrap(), None);

        let closed = task.with_status(TaskExecutionStatus::Closed);
        assert!(sync.synchronize_task(&closed).await.unwrap());
        assert!(!store.job_exists("t1").await.unwrap());
    }

    #[tokio::test]
    async fn test_new_waiting_task_gets_paused_trigger() {
        let (sync, store, _clock) = setup();
        let task = Task::new("等待子任务")
            .with_oid("t1")
            .with_status(TaskExecutionStatus::Waiting);

        sync.synchronize_task(&task).await.unwrap();
        let trigger = store.get_trigger(&TriggerKey::main("t1")).await.unwrap().unwrap();
        assert!(trigger.is_paused());
    }

    #[tokio::test]
    async fn test_tight_interval_trigger() {
        let (sync, store, clock) = setup();
        let now = clock.now();
        let task = Task::new("心跳")
            .with_oid("t1")
            .recurring(TaskBinding::Tight, ScheduleSpec::interval(30));

        sync.synchronize_task(&task).await.unwrap();
        let trigger = store.get_trigger(&TriggerKey::main("t1")).await.unwrap().unwrap();
        assert_eq!(trigger.schedule, TriggerSchedule::Interval { interval_seconds: 30 });
        assert_eq!(trigger.next_fire_time, now);

        let next = sync
            .reschedule_task(&task, ScheduleAnchor::Resumed(now))
            .await
            .unwrap();
        assert_eq!(next, Some(now + Duration::seconds(30)));

        // 运行中的紧绑定任务保留已有触发器
        let running = task.with_status(TaskExecutionStatus::Running);
        assert!(!sync.synchronize_task(&running).await.unwrap());
    }

    #[tokio::test]
    async fn test_tight_cron_trigger() {
        let (sync, store, clock) = setup();
        let task = Task::new("整点报表")
            .with_oid("t1")
            .recurring(TaskBinding::Tight, ScheduleSpec::cron("0 0 * * * *"));

        sync.synchronize_task(&task).await.unwrap();
        let trigger = store.get_trigger(&TriggerKey::main("t1")).await.unwrap().unwrap();
        assert!(matches!(trigger.schedule, TriggerSchedule::Cron { .. }));
        // 当前时间正好是整点
        assert_eq!(trigger.next_fire_time, clock.now());
    }

    #[tokio::test]
    async fn test_invalid_cron_is_rejected() {
        let task = Task::new("错误调度")
            .with_oid("t1")
            .recurring(TaskBinding::Tight, ScheduleSpec::cron("not a cron"));
        let err = TaskSynchronizer::validate_schedule(&task).unwrap_err();
        assert!(err.is_schema_violation());
    }

    #[tokio::test]
    async fn test_oversized_interval_is_rejected_without_panic() {
        let (sync, store, clock) = setup();
        let task = loose_interval("t1", 10_000_000_000_000);
        assert!(TaskSynchronizer::validate_schedule(&task)
            .unwrap_err()
            .is_schema_violation());

        // 绕过校验直接重新布置，也只返回错误
        let err = sync
            .reschedule_task(&task, ScheduleAnchor::Resumed(clock.now()))
            .await
            .unwrap_err();
        assert!(err.is_schema_violation());

        let tight = Task::new("紧密周期")
            .with_oid("t2")
            .recurring(TaskBinding::Tight, ScheduleSpec::interval(10_000_000_000_000));
        let err = sync
            .reschedule_task(&tight, ScheduleAnchor::Resumed(clock.now()))
            .await
            .unwrap_err();
        assert!(err.is_schema_violation());
        assert!(store.get_trigger(&TriggerKey::main("t2")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_single_task_respects_earliest_start() {
        let (sync, store, clock) = setup();
        let earliest = clock.now() + Duration::hours(2);
        let task = Task::new("延迟执行")
            .with_oid("t1")
            .with_schedule(ScheduleSpec::default().with_earliest_start(earliest));

        sync.synchronize_task(&task).await.unwrap();
        let trigger = store.get_trigger(&TriggerKey::main("t1")).await.unwrap().unwrap();
        assert_eq!(trigger.next_fire_time, earliest);
        assert_eq!(sync.next_run_start_time("t1").await.unwrap(), Some(earliest));
    }

    #[tokio::test]
    async fn test_recurring_task_past_latest_start_has_no_trigger() {
        let (sync, store, clock) = setup();
        let latest = clock.now() - Duration::minutes(1);
        let task = Task::new("已过期").with_oid("t1").recurring(
            TaskBinding::Loose,
            ScheduleSpec::interval(60).with_latest_start(latest),
        );

        let next = sync
            .reschedule_task(&task, ScheduleAnchor::AfterRun(clock.now()))
            .await
            .unwrap();
        assert_eq!(next, None);
        assert!(store.triggers_of_job("t1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_lightweight_tasks_are_ignored() {
        let (sync, store, _clock) = setup();
        let task = Task::new("轻量级");

        assert!(!sync.synchronize_task(&task).await.unwrap());
        assert!(sync.trigger_now(&task).await.is_err());
        assert!(store.job_keys().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_trigger_now_adds_transient_trigger() {
        let (sync, store, _clock) = setup();
        let task = loose_interval("t1", 3600);
        sync.reschedule_task(&task, ScheduleAnchor::AfterRun(Utc::now()))
            .await
            .unwrap();

        let key = sync.trigger_now(&task).await.unwrap();
        assert!(!key.is_main());
        assert_eq!(store.triggers_of_job("t1").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_synchronize_job_store_removes_orphans() {
        let (sync, store, _clock) = setup();
        store.store_job(JobDetail::new("orphan"), false).await.unwrap();

        let tasks = vec![
            loose_interval("t1", 60),
            Task::new("已关闭")
                .with_oid("t2")
                .with_status(TaskExecutionStatus::Closed),
            Task::new("轻量级"),
        ];
        let report = sync.synchronize_job_store(&tasks).await;

        assert_eq!(report.synchronized, 2);
        assert_eq!(report.changed, 1);
        assert_eq!(report.removed_orphans, 1);
        assert_eq!(report.failed, 0);
        assert_eq!(store.job_keys().await.unwrap(), vec!["t1".to_string()]);
    }
}
