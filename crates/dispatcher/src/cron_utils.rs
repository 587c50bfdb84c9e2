use chrono::{DateTime, Duration, Utc};
use cron::Schedule;
use std::str::FromStr;

use taskmgr_core::{TaskManagerError, TaskManagerResult};

/// CRON表达式解析和调度工具
///
/// 表达式为6段格式（秒 分 时 日 月 周），可选第7段年份。
pub struct CronScheduler {
    schedule: Schedule,
}

impl CronScheduler {
    pub fn new(cron_expr: &str) -> TaskManagerResult<Self> {
        let schedule =
            Schedule::from_str(cron_expr).map_err(|e| TaskManagerError::InvalidCron {
                expr: cron_expr.to_string(),
                message: e.to_string(),
            })?;

        Ok(Self { schedule })
    }

    /// 严格晚于 `from` 的下一次执行时间
    pub fn next_execution_time(&self, from: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule.after(&from).next()
    }

    pub fn upcoming_times(&self, from: DateTime<Utc>, count: usize) -> Vec<DateTime<Utc>> {
        self.schedule.after(&from).take(count).collect()
    }

    pub fn validate_cron_expression(cron_expr: &str) -> TaskManagerResult<()> {
        Self::new(cron_expr).map(|_| ())
    }

    pub fn time_until_next_execution(&self, now: DateTime<Utc>) -> Option<Duration> {
        self.next_execution_time(now).map(|next| next - now)
    }
}
