//! 调度引擎与任务触发器同步

pub mod cron_utils;
pub mod engine;
pub mod synchronizer;

pub use cron_utils::CronScheduler;
pub use engine::{
    EngineState, ExecutingJob, JobExecutionContext, JobRunner, SchedulerEngine,
    SchedulerEngineConfig,
};
pub use synchronizer::{JobStoreSyncReport, ScheduleAnchor, TaskSynchronizer};
