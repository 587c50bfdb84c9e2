//! 任务与调度触发器的同步
//!
//! 每个持久化任务对应作业存储中的一个作业和至多一个主触发器，
//! 触发器的存在与形态由任务的执行状态、循环方式、绑定方式和调度设置决定：
//!
//! | 执行状态 | 触发器 |
//! |---|---|
//! | CLOSED | 删除作业 |
//! | SUSPENDED | 删除全部触发器 |
//! | RUNNABLE | 一个正常的主触发器 |
//! | WAITING | 一个暂停的主触发器 |
//! | RUNNING | 不干预正在触发的状态，紧绑定循环任务确保存在触发器 |

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use taskmgr_core::{Clock, TaskManagerError, TaskManagerResult};
use taskmgr_domain::{
    JobDetail, JobStore, ScheduleSpec, Task, TaskExecutionStatus, Trigger, TriggerKey,
    TriggerSchedule, TriggerState,
};
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::cron_utils::CronScheduler;

/// 计算触发时间的基准
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleAnchor {
    /// 首次调度或配置变化后的调度
    Initial,
    /// 一次运行在给定时间结束之后
    AfterRun(DateTime<Utc>),
    /// 在给定时间被恢复
    Resumed(DateTime<Utc>),
}

/// 整体同步的结果
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct JobStoreSyncReport {
    pub synchronized: usize,
    pub changed: usize,
    pub removed_orphans: usize,
    pub failed: usize,
}

pub struct TaskSynchronizer {
    job_store: Arc<dyn JobStore>,
    clock: Arc<dyn Clock>,
    wakeup: Option<Arc<Notify>>,
}

impl TaskSynchronizer {
    pub fn new(job_store: Arc<dyn JobStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            job_store,
            clock,
            wakeup: None,
        }
    }

    /// 新增触发器后唤醒本地调度引擎
    pub fn with_wakeup(mut self, wakeup: Arc<Notify>) -> Self {
        self.wakeup = Some(wakeup);
        self
    }

    pub fn job_store(&self) -> &Arc<dyn JobStore> {
        &self.job_store
    }

    fn notify_engine(&self) {
        if let Some(wakeup) = &self.wakeup {
            wakeup.notify_one();
        }
    }

    /// 调度设置摘要，设置不变时重复同步不会移动触发时间
    pub fn schedule_fingerprint(task: &Task) -> String {
        format!(
            "{:?}|{:?}|{:?}",
            task.recurrence,
            task.binding,
            task.schedule.as_ref()
        )
    }

    /// 校验任务的调度设置，包括CRON表达式
    pub fn validate_schedule(task: &Task) -> TaskManagerResult<()> {
        task.validate()?;
        if let Some(pattern) = task
            .schedule
            .as_ref()
            .and_then(|s| s.cron_like_pattern.as_deref())
        {
            CronScheduler::validate_cron_expression(pattern)?;
        }
        Ok(())
    }

    /// 使触发器与任务状态一致，返回是否做了修改
    pub async fn synchronize_task(&self, task: &Task) -> TaskManagerResult<bool> {
        let Some(oid) = task.oid.as_deref() else {
            // 轻量级任务没有触发器
            return Ok(false);
        };

        let changed = match task.execution_status {
            TaskExecutionStatus::Closed => {
                let removed = self.job_store.remove_job(oid).await?;
                if removed {
                    debug!(task_oid = oid, "任务已关闭，删除调度作业");
                }
                removed
            }
            TaskExecutionStatus::Suspended => self.remove_triggers(oid).await? > 0,
            TaskExecutionStatus::Runnable | TaskExecutionStatus::Waiting => {
                self.ensure_main_trigger(task, oid).await?
            }
            TaskExecutionStatus::Running => {
                if task.is_recurring() && task.is_tight_bound() {
                    let fingerprint = Self::schedule_fingerprint(task);
                    let main = self.job_store.get_trigger(&TriggerKey::main(oid)).await?;
                    if main.is_some_and(|t| t.fingerprint == fingerprint) {
                        false
                    } else {
                        self.install_main_trigger(task, oid, ScheduleAnchor::Initial)
                            .await?;
                        true
                    }
                } else {
                    false
                }
            }
        };

        if changed {
            self.notify_engine();
        }
        Ok(changed)
    }

    async fn ensure_main_trigger(&self, task: &Task, oid: &str) -> TaskManagerResult<bool> {
        let want_paused = task.execution_status == TaskExecutionStatus::Waiting;
        let fingerprint = Self::schedule_fingerprint(task);

        let existing = if self.job_store.job_exists(oid).await? {
            self.job_store.get_trigger(&TriggerKey::main(oid)).await?
        } else {
            None
        };

        match existing {
            Some(trigger) if trigger.fingerprint == fingerprint => {
                let paused = trigger.state == TriggerState::Paused;
                if want_paused && !paused {
                    self.job_store.pause_job(oid).await?;
                    Ok(true)
                } else if !want_paused && paused {
                    self.job_store.resume_job(oid).await?;
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
            _ => {
                self.install_main_trigger(task, oid, ScheduleAnchor::Initial)
                    .await?;
                Ok(true)
            }
        }
    }

    /// 替换主触发器，返回新的触发时间
    async fn install_main_trigger(
        &self,
        task: &Task,
        oid: &str,
        anchor: ScheduleAnchor,
    ) -> TaskManagerResult<Option<DateTime<Utc>>> {
        // 先计算触发器，计算失败时保留原有触发器
        let trigger = self.create_trigger_for_task(task, anchor)?;

        self.job_store
            .store_job(
                JobDetail::new(oid).with_description(task.name.clone()),
                true,
            )
            .await?;

        let key = TriggerKey::main(oid);
        self.job_store.remove_trigger(&key).await?;

        let Some(mut trigger) = trigger else {
            debug!(task_oid = oid, "调度时间已超出结束时间，不创建触发器");
            return Ok(None);
        };

        if task.execution_status == TaskExecutionStatus::Waiting {
            trigger.state = TriggerState::Paused;
        }

        let next = trigger.next_fire_time;
        self.job_store.store_trigger(trigger, true).await?;
        debug!(task_oid = oid, next_fire_time = %next, "已布置主触发器");
        Ok(Some(next))
    }

    async fn remove_triggers(&self, oid: &str) -> TaskManagerResult<usize> {
        let mut removed = 0;
        for trigger in self.job_store.triggers_of_job(oid).await? {
            if self.job_store.remove_trigger(&trigger.key).await? {
                removed += 1;
            }
        }
        if removed > 0 {
            debug!(task_oid = oid, removed, "已删除任务的触发器");
        }
        Ok(removed)
    }

    /// 强制按给定基准重新计算并替换主触发器
    pub async fn reschedule_task(
        &self,
        task: &Task,
        anchor: ScheduleAnchor,
    ) -> TaskManagerResult<Option<DateTime<Utc>>> {
        let Some(oid) = task.oid.as_deref() else {
            return Ok(None);
        };

        match task.execution_status {
            TaskExecutionStatus::Closed | TaskExecutionStatus::Suspended => {
                self.synchronize_task(task).await?;
                Ok(None)
            }
            _ => {
                let next = self.install_main_trigger(task, oid, anchor).await?;
                self.notify_engine();
                Ok(next)
            }
        }
    }

    /// 添加一个立即触发的一次性触发器，不影响主触发器
    pub async fn trigger_now(&self, task: &Task) -> TaskManagerResult<TriggerKey> {
        let oid = task.oid.as_deref().ok_or_else(|| {
            TaskManagerError::SchemaViolation("轻量级任务不能通过调度器运行".to_string())
        })?;

        self.job_store
            .store_job(
                JobDetail::new(oid).with_description(task.name.clone()),
                true,
            )
            .await?;

        let key = TriggerKey::run_now(oid);
        let trigger = Trigger::once(key.clone(), self.clock.now()).with_fingerprint("run-now");
        self.job_store.store_trigger(trigger, false).await?;
        self.notify_engine();
        info!(task_oid = oid, "已添加立即运行触发器");
        Ok(key)
    }

    pub async fn remove_task(&self, oid: &str) -> TaskManagerResult<bool> {
        self.job_store.remove_job(oid).await
    }

    pub async fn next_run_start_time(&self, oid: &str) -> TaskManagerResult<Option<DateTime<Utc>>> {
        self.job_store.next_fire_time(oid).await
    }

    /// 启动时整体同步：逐个同步任务并删除没有对应任务的作业，单个失败不影响其他任务
    pub async fn synchronize_job_store(&self, tasks: &[Task]) -> JobStoreSyncReport {
        let mut report = JobStoreSyncReport::default();
        let mut known = HashSet::new();

        for task in tasks {
            let Some(oid) = task.oid.as_deref() else {
                continue;
            };
            known.insert(oid.to_string());

            match self.synchronize_task(task).await {
                Ok(changed) => {
                    report.synchronized += 1;
                    if changed {
                        report.changed += 1;
                    }
                }
                Err(e) => {
                    warn!(task_oid = oid, "同步任务触发器失败: {}", e);
                    report.failed += 1;
                }
            }
        }

        match self.job_store.job_keys().await {
            Ok(keys) => {
                for key in keys.into_iter().filter(|k| !known.contains(k)) {
                    match self.job_store.remove_job(&key).await {
                        Ok(_) => {
                            info!(job = %key, "删除没有对应任务的调度作业");
                            report.removed_orphans += 1;
                        }
                        Err(e) => {
                            warn!(job = %key, "删除孤立作业失败: {}", e);
                            report.failed += 1;
                        }
                    }
                }
            }
            Err(e) => {
                warn!("读取作业列表失败: {}", e);
                report.failed += 1;
            }
        }

        info!(
            synchronized = report.synchronized,
            changed = report.changed,
            removed_orphans = report.removed_orphans,
            failed = report.failed,
            "作业存储同步完成"
        );
        report
    }

    /// 根据任务设置生成主触发器；调度已结束时返回 None
    pub fn create_trigger_for_task(
        &self,
        task: &Task,
        anchor: ScheduleAnchor,
    ) -> TaskManagerResult<Option<Trigger>> {
        let oid = task.oid.as_deref().ok_or_else(|| {
            TaskManagerError::SchemaViolation("轻量级任务没有调度触发器".to_string())
        })?;

        let now = self.clock.now();
        let schedule = task.schedule.clone().unwrap_or_default();
        let key = TriggerKey::main(oid);
        let not_before = schedule.earliest_start.map_or(now, |earliest| earliest.max(now));

        let (trigger_schedule, fire_at) = if task.is_single() {
            (TriggerSchedule::Once, Some(not_before))
        } else if task.is_tight_bound() {
            Self::tight_schedule(&schedule, anchor, not_before)?
        } else {
            Self::loose_schedule(task, &schedule, anchor, not_before)?
        };

        let Some(fire_at) = fire_at else {
            return Ok(None);
        };

        // 单次任务超过最晚开始时间仍然布置触发器，由执行时关闭任务
        if !task.is_single() && schedule.latest_start.is_some_and(|end| fire_at > end) {
            return Ok(None);
        }

        let trigger = Trigger::once(key, fire_at)
            .with_schedule(trigger_schedule)
            .with_end_time(schedule.latest_start)
            .with_misfire_action(schedule.misfire_action)
            .with_fingerprint(Self::schedule_fingerprint(task));
        Ok(Some(trigger))
    }

    fn tight_schedule(
        schedule: &ScheduleSpec,
        anchor: ScheduleAnchor,
        not_before: DateTime<Utc>,
    ) -> TaskManagerResult<(TriggerSchedule, Option<DateTime<Utc>>)> {
        if let Some(interval_seconds) = schedule.interval_seconds {
            let fire_at = match anchor {
                ScheduleAnchor::Resumed(at) => ScheduleSpec::interval_after(at, interval_seconds)?,
                ScheduleAnchor::Initial | ScheduleAnchor::AfterRun(_) => not_before,
            };
            return Ok((
                TriggerSchedule::Interval { interval_seconds },
                Some(fire_at.max(not_before)),
            ));
        }

        let expression = Self::cron_pattern(schedule)?;
        let cron = CronScheduler::new(&expression)?;
        // CRON 的 after 不包含起点本身
        let fire_at = cron.next_execution_time(not_before - Duration::milliseconds(1));
        Ok((TriggerSchedule::Cron { expression }, fire_at))
    }

    fn loose_schedule(
        task: &Task,
        schedule: &ScheduleSpec,
        anchor: ScheduleAnchor,
        not_before: DateTime<Utc>,
    ) -> TaskManagerResult<(TriggerSchedule, Option<DateTime<Utc>>)> {
        let base = match anchor {
            ScheduleAnchor::AfterRun(finished) => Some(finished),
            ScheduleAnchor::Resumed(at) => Some(at),
            ScheduleAnchor::Initial => task.last_run_finish_timestamp,
        };

        let fire_at = if let Some(interval_seconds) = schedule.interval_seconds {
            match base {
                Some(base) => ScheduleSpec::interval_after(base, interval_seconds)?.max(not_before),
                None => not_before,
            }
        } else {
            let expression = Self::cron_pattern(schedule)?;
            let cron = CronScheduler::new(&expression)?;
            let from = base.map_or(not_before, |base| base.max(not_before));
            match cron.next_execution_time(from) {
                Some(next) => next,
                None => return Ok((TriggerSchedule::Once, None)),
            }
        };

        Ok((TriggerSchedule::Once, Some(fire_at)))
    }

    fn cron_pattern(schedule: &ScheduleSpec) -> TaskManagerResult<String> {
        schedule.cron_like_pattern.clone().ok_or_else(|| {
            TaskManagerError::SchemaViolation("循环任务必须设置调度间隔或CRON表达式".to_string())
        })
    }
}
