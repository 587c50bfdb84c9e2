//! 嵌入式调度引擎
//!
//! 从共享作业存储中认领到期触发器，在有界的执行池上触发作业。
//! 跨节点的互斥完全由作业存储的原子认领保证。

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use taskmgr_core::{Clock, SchedulerConfig, TaskManagerError, TaskManagerResult};
use taskmgr_domain::{JobStore, MisfireAction, Trigger, TriggerKey, TriggerSchedule};
use taskmgr_infrastructure::MetricsCollector;
use tokio::sync::{Notify, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::cron_utils::CronScheduler;

/// 一次作业触发的上下文
#[derive(Debug, Clone)]
pub struct JobExecutionContext {
    pub job_key: String,
    pub trigger: Trigger,
    /// 触发器计划的触发时间
    pub scheduled_fire_time: DateTime<Utc>,
    pub fire_time: DateTime<Utc>,
    pub next_fire_time: Option<DateTime<Utc>>,
}

/// 作业被触发时执行的逻辑
#[async_trait]
pub trait JobRunner: Send + Sync {
    async fn execute(&self, context: JobExecutionContext);
}

#[derive(Debug, Clone)]
pub struct SchedulerEngineConfig {
    /// 调度实例标识，通常为节点ID
    pub instance_id: String,
    pub thread_count: usize,
    pub idle_wait: StdDuration,
    pub misfire_threshold: Duration,
}

impl SchedulerEngineConfig {
    pub fn from_config(config: &SchedulerConfig, instance_id: impl Into<String>) -> Self {
        Self {
            instance_id: instance_id.into(),
            thread_count: config.thread_count,
            idle_wait: StdDuration::from_millis(config.idle_wait_ms),
            misfire_threshold: Duration::seconds(config.misfire_threshold_seconds as i64),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Standby,
    Started,
    Shutdown,
}

/// 正在执行的作业
#[derive(Debug, Clone)]
pub struct ExecutingJob {
    pub job_key: String,
    pub trigger_key: TriggerKey,
    pub fire_time: DateTime<Utc>,
}

struct EngineControl {
    state: EngineState,
    loop_cancel: Option<CancellationToken>,
    loop_handle: Option<JoinHandle<()>>,
}

type ExecutingMap = Arc<Mutex<HashMap<u64, ExecutingJob>>>;

/// 从执行表中移除作业，作业异常结束时同样生效
struct ExecutingGuard {
    id: u64,
    executing: ExecutingMap,
}

impl Drop for ExecutingGuard {
    fn drop(&mut self) {
        self.executing
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.id);
    }
}

pub struct SchedulerEngine {
    config: SchedulerEngineConfig,
    job_store: Arc<dyn JobStore>,
    runner: Arc<dyn JobRunner>,
    clock: Arc<dyn Clock>,
    permits: Arc<Semaphore>,
    wakeup: Arc<Notify>,
    tracker: TaskTracker,
    control: Mutex<EngineControl>,
    executing: ExecutingMap,
    fire_sequence: std::sync::atomic::AtomicU64,
    metrics: MetricsCollector,
}

impl SchedulerEngine {
    pub fn new(
        config: SchedulerEngineConfig,
        job_store: Arc<dyn JobStore>,
        runner: Arc<dyn JobRunner>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let permits = Arc::new(Semaphore::new(config.thread_count.max(1)));
        Self {
            config,
            job_store,
            runner,
            clock,
            permits,
            wakeup: Arc::new(Notify::new()),
            tracker: TaskTracker::new(),
            control: Mutex::new(EngineControl {
                state: EngineState::Standby,
                loop_cancel: None,
                loop_handle: None,
            }),
            executing: Arc::new(Mutex::new(HashMap::new())),
            fire_sequence: std::sync::atomic::AtomicU64::new(0),
            metrics: MetricsCollector::new(),
        }
    }

    /// 与 [`crate::TaskSynchronizer`] 共用唤醒句柄
    pub fn with_wakeup(mut self, wakeup: Arc<Notify>) -> Self {
        self.wakeup = wakeup;
        self
    }

    pub fn instance_id(&self) -> &str {
        &self.config.instance_id
    }

    /// 调度变化通知句柄，新增触发器后唤醒认领循环
    pub fn wakeup_handle(&self) -> Arc<Notify> {
        self.wakeup.clone()
    }

    pub fn state(&self) -> EngineState {
        self.control
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .state
    }

    pub fn is_started(&self) -> bool {
        self.state() == EngineState::Started
    }

    /// 启动认领循环；已关闭的引擎不能再启动
    pub fn start(self: &Arc<Self>) -> TaskManagerResult<()> {
        let mut control = self.control.lock().unwrap_or_else(PoisonError::into_inner);
        match control.state {
            EngineState::Shutdown => {
                return Err(TaskManagerError::Scheduler(
                    "调度引擎已关闭，无法启动".to_string(),
                ))
            }
            EngineState::Started => return Ok(()),
            EngineState::Standby => {}
        }

        let cancel = CancellationToken::new();
        let engine = Arc::clone(self);
        let loop_cancel = cancel.clone();
        control.loop_handle = Some(tokio::spawn(async move {
            engine.acquisition_loop(loop_cancel).await;
        }));
        control.loop_cancel = Some(cancel);
        control.state = EngineState::Started;

        info!(instance_id = %self.config.instance_id, "调度引擎已启动");
        Ok(())
    }

    /// 停止认领新的触发器，正在执行的作业继续运行
    pub async fn standby(&self) {
        let handle = {
            let mut control = self.control.lock().unwrap_or_else(PoisonError::into_inner);
            if control.state == EngineState::Started {
                control.state = EngineState::Standby;
            }
            if let Some(cancel) = control.loop_cancel.take() {
                cancel.cancel();
            }
            control.loop_handle.take()
        };

        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!("调度循环异常退出: {}", e);
            }
            info!(instance_id = %self.config.instance_id, "调度引擎进入待机状态");
        }
    }

    /// 关闭引擎，`wait_for_jobs` 为真时等待正在执行的作业结束
    pub async fn shutdown(&self, wait_for_jobs: bool) {
        self.standby().await;
        {
            let mut control = self.control.lock().unwrap_or_else(PoisonError::into_inner);
            control.state = EngineState::Shutdown;
        }

        self.tracker.close();
        if wait_for_jobs {
            self.tracker.wait().await;
        }

        match self
            .job_store
            .release_acquired_triggers(&self.config.instance_id)
            .await
        {
            Ok(0) => {}
            Ok(released) => debug!("释放了 {} 个已认领的触发器", released),
            Err(e) => warn!("释放已认领触发器失败: {}", e),
        }

        info!(instance_id = %self.config.instance_id, "调度引擎已关闭");
    }

    async fn acquisition_loop(&self, cancel: CancellationToken) {
        loop {
            if cancel.is_cancelled() {
                break;
            }

            let fired = match self.run_once().await {
                Ok(fired) => fired,
                Err(e) => {
                    error!("认领触发器失败: {}", e);
                    0
                }
            };

            if fired == 0 {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = self.wakeup.notified() => {}
                    _ = tokio::time::sleep(self.config.idle_wait) => {}
                }
            }
        }
        debug!("调度循环已退出");
    }

    /// 执行一轮认领和触发，返回触发的作业数
    pub async fn run_once(&self) -> TaskManagerResult<usize> {
        let available = self.permits.available_permits();
        if available == 0 {
            return Ok(0);
        }

        let now = self.clock.now();
        let triggers = self
            .job_store
            .acquire_next_triggers(&self.config.instance_id, now, available)
            .await?;

        let mut fired = 0;
        for trigger in triggers {
            let misfired = now - trigger.next_fire_time > self.config.misfire_threshold;
            let next_fire_time = self.compute_next_fire_time(&trigger, now);

            // 先重新布置触发器再执行，执行期间其他实例可以认领下一次触发
            if let Err(e) = self
                .job_store
                .triggered_job_complete(&trigger, next_fire_time)
                .await
            {
                warn!(trigger = %trigger.key, "更新触发器失败: {}", e);
            }

            if misfired {
                self.metrics.record_trigger_misfire();
                let skip = trigger.misfire_action == MisfireAction::Reschedule
                    && trigger.schedule != TriggerSchedule::Once;
                if skip {
                    info!(
                        trigger = %trigger.key,
                        scheduled = %trigger.next_fire_time,
                        "错过触发，跳到下一次触发时间"
                    );
                    continue;
                }
                info!(trigger = %trigger.key, scheduled = %trigger.next_fire_time, "错过触发，立即执行");
            }

            self.fire(trigger, now, next_fire_time).await?;
            fired += 1;
        }

        Ok(fired)
    }

    async fn fire(
        &self,
        trigger: Trigger,
        now: DateTime<Utc>,
        next_fire_time: Option<DateTime<Utc>>,
    ) -> TaskManagerResult<()> {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|e| TaskManagerError::Scheduler(format!("执行池已关闭: {e}")))?;

        let id = self
            .fire_sequence
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        self.executing
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                id,
                ExecutingJob {
                    job_key: trigger.key.job.clone(),
                    trigger_key: trigger.key.clone(),
                    fire_time: now,
                },
            );
        let guard = ExecutingGuard {
            id,
            executing: self.executing.clone(),
        };

        let context = JobExecutionContext {
            job_key: trigger.key.job.clone(),
            scheduled_fire_time: trigger.next_fire_time,
            fire_time: now,
            next_fire_time,
            trigger,
        };

        debug!(job = %context.job_key, trigger = %context.trigger.key.name, "触发作业");
        self.metrics.record_trigger_fired();

        let runner = self.runner.clone();
        self.tracker.spawn(async move {
            let _permit = permit;
            let _guard = guard;
            runner.execute(context).await;
        });
        Ok(())
    }

    /// 计算触发后的下一次触发时间，超过结束时间时返回 None
    pub fn compute_next_fire_time(
        &self,
        trigger: &Trigger,
        now: DateTime<Utc>,
    ) -> Option<DateTime<Utc>> {
        let next = match &trigger.schedule {
            TriggerSchedule::Once => None,
            TriggerSchedule::Interval { interval_seconds } => {
                let next =
                    Self::next_interval_time(trigger.next_fire_time, *interval_seconds, now);
                if next.is_none() {
                    warn!(
                        trigger = %trigger.key,
                        interval_seconds,
                        "调度间隔无效或超出时间范围，触发器不再布置"
                    );
                }
                next
            }
            TriggerSchedule::Cron { expression } => match CronScheduler::new(expression) {
                Ok(cron) => cron.next_execution_time(now),
                Err(e) => {
                    warn!(trigger = %trigger.key, "触发器的CRON表达式无效: {}", e);
                    None
                }
            },
        };

        next.filter(|next| trigger.end_time.map_or(true, |end| *next <= end))
    }

    /// `scheduled` 之后、晚于 `now` 的第一个间隔点
    fn next_interval_time(
        scheduled: DateTime<Utc>,
        interval_seconds: u64,
        now: DateTime<Utc>,
    ) -> Option<DateTime<Utc>> {
        let interval = i64::try_from(interval_seconds).ok().filter(|s| *s > 0)?;
        let elapsed = (now - scheduled).num_seconds().max(0);
        let periods = elapsed / interval + 1;
        let offset = Duration::try_seconds(interval.checked_mul(periods)?)?;
        scheduled.checked_add_signed(offset)
    }

    /// 暂停作业的全部触发器
    pub async fn pause_job(&self, job_key: &str) -> TaskManagerResult<()> {
        self.job_store.pause_job(job_key).await
    }

    pub async fn resume_job(&self, job_key: &str) -> TaskManagerResult<()> {
        self.job_store.resume_job(job_key).await?;
        self.wakeup.notify_one();
        Ok(())
    }

    /// 为已有作业添加一个立即触发的一次性触发器
    pub async fn trigger_job_now(&self, job_key: &str) -> TaskManagerResult<TriggerKey> {
        if !self.job_store.job_exists(job_key).await? {
            return Err(TaskManagerError::job_not_found(job_key));
        }

        let key = TriggerKey::run_now(job_key);
        let trigger = Trigger::once(key.clone(), self.clock.now()).with_fingerprint("run-now");
        self.job_store.store_trigger(trigger, false).await?;
        self.wakeup.notify_one();
        Ok(key)
    }

    pub fn executing_jobs(&self) -> Vec<ExecutingJob> {
        self.executing
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    pub fn is_job_executing(&self, job_key: &str) -> bool {
        self.executing
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .any(|job| job.job_key == job_key)
    }
}
