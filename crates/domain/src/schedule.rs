//! 调度作业与触发器
//!
//! 每个持久化任务对应一个作业（作业键即任务oid），作业下至多一个主触发器
//! （名称同为任务oid），以及"立即运行"时临时添加的一次性触发器。

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use taskmgr_core::TaskManagerResult;

use crate::task::MisfireAction;

/// 立即运行触发器的名称前缀
pub const RUN_NOW_TRIGGER_PREFIX: &str = "now-";

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TriggerKey {
    pub job: String,
    pub name: String,
}

impl TriggerKey {
    pub fn new(job: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            job: job.into(),
            name: name.into(),
        }
    }

    /// 任务的主触发器
    pub fn main(task_oid: &str) -> Self {
        Self::new(task_oid, task_oid)
    }

    pub fn run_now(task_oid: &str) -> Self {
        Self::new(
            task_oid,
            format!("{RUN_NOW_TRIGGER_PREFIX}{}", uuid::Uuid::new_v4()),
        )
    }

    pub fn is_main(&self) -> bool {
        self.job == self.name
    }
}

impl fmt::Display for TriggerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.job, self.name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TriggerSchedule {
    Once,
    Interval { interval_seconds: u64 },
    Cron { expression: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TriggerState {
    Waiting,
    Paused,
    /// 已被某个调度实例认领，正在触发
    Acquired,
}

impl TriggerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Waiting => "WAITING",
            Self::Paused => "PAUSED",
            Self::Acquired => "ACQUIRED",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trigger {
    pub key: TriggerKey,
    pub schedule: TriggerSchedule,
    pub state: TriggerState,
    pub next_fire_time: DateTime<Utc>,
    pub previous_fire_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub misfire_action: MisfireAction,
    /// 生成该触发器的调度设置摘要，用于幂等同步
    pub fingerprint: String,
    pub acquired_by: Option<String>,
}

impl Trigger {
    pub fn once(key: TriggerKey, fire_at: DateTime<Utc>) -> Self {
        Self {
            key,
            schedule: TriggerSchedule::Once,
            state: TriggerState::Waiting,
            next_fire_time: fire_at,
            previous_fire_time: None,
            end_time: None,
            misfire_action: MisfireAction::ExecuteImmediately,
            fingerprint: String::new(),
            acquired_by: None,
        }
    }

    pub fn with_schedule(mut self, schedule: TriggerSchedule) -> Self {
        self.schedule = schedule;
        self
    }

    pub fn with_end_time(mut self, end_time: Option<DateTime<Utc>>) -> Self {
        self.end_time = end_time;
        self
    }

    pub fn with_misfire_action(mut self, action: MisfireAction) -> Self {
        self.misfire_action = action;
        self
    }

    pub fn with_fingerprint(mut self, fingerprint: impl Into<String>) -> Self {
        self.fingerprint = fingerprint.into();
        self
    }

    pub fn paused(mut self) -> Self {
        self.state = TriggerState::Paused;
        self
    }

    pub fn is_paused(&self) -> bool {
        self.state == TriggerState::Paused
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobDetail {
    pub key: String,
    pub description: Option<String>,
}

impl JobDetail {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            description: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// 作业存储
///
/// 集群中所有节点共享同一个作业存储，跨节点的互斥完全依赖
/// `acquire_next_triggers` 的原子认领。
#[async_trait]
pub trait JobStore: Send + Sync {
    /// 保存作业；`replace` 为 false 且作业已存在时返回 AlreadyExists
    async fn store_job(&self, job: JobDetail, replace: bool) -> TaskManagerResult<()>;

    /// 删除作业及其全部触发器，返回作业是否存在
    async fn remove_job(&self, job_key: &str) -> TaskManagerResult<bool>;

    async fn job_exists(&self, job_key: &str) -> TaskManagerResult<bool>;

    async fn job_keys(&self) -> TaskManagerResult<Vec<String>>;

    /// 保存触发器，所属作业不存在时返回 ObjectNotFound
    async fn store_trigger(&self, trigger: Trigger, replace: bool) -> TaskManagerResult<()>;

    async fn remove_trigger(&self, key: &TriggerKey) -> TaskManagerResult<bool>;

    async fn get_trigger(&self, key: &TriggerKey) -> TaskManagerResult<Option<Trigger>>;

    async fn triggers_of_job(&self, job_key: &str) -> TaskManagerResult<Vec<Trigger>>;

    /// 暂停作业的全部触发器
    async fn pause_job(&self, job_key: &str) -> TaskManagerResult<()>;

    async fn resume_job(&self, job_key: &str) -> TaskManagerResult<()>;

    /// 原子认领到期的触发器，按触发时间排序
    async fn acquire_next_triggers(
        &self,
        instance_id: &str,
        no_later_than: DateTime<Utc>,
        max_count: usize,
    ) -> TaskManagerResult<Vec<Trigger>>;

    /// 触发后重新布置触发器；`next_fire_time` 为空时删除触发器。
    ///
    /// 认领期间被替换的触发器保持不变，被暂停的触发器更新时间但保持暂停。
    async fn triggered_job_complete(
        &self,
        trigger: &Trigger,
        next_fire_time: Option<DateTime<Utc>>,
    ) -> TaskManagerResult<()>;

    /// 释放某个实例认领的触发器，返回释放数量
    async fn release_acquired_triggers(&self, instance_id: &str) -> TaskManagerResult<usize>;

    /// 作业最近一次触发时间
    async fn next_fire_time(&self, job_key: &str) -> TaskManagerResult<Option<DateTime<Utc>>> {
        let triggers = self.triggers_of_job(job_key).await?;
        Ok(triggers
            .iter()
            .filter(|t| t.state != TriggerState::Paused)
            .map(|t| t.next_fire_time)
            .min())
    }
}

/// 触发器状态迁移规则，供各作业存储实现共用
pub fn complete_trigger(
    current: &Trigger,
    fired: &Trigger,
    next_fire_time: Option<DateTime<Utc>>,
) -> TriggerCompletion {
    let still_ours = match current.state {
        TriggerState::Acquired => current.acquired_by == fired.acquired_by,
        TriggerState::Paused => current.fingerprint == fired.fingerprint,
        TriggerState::Waiting => false,
    };

    if !still_ours {
        return TriggerCompletion::Untouched;
    }

    match next_fire_time {
        None => TriggerCompletion::Remove,
        Some(next) => {
            let mut updated = current.clone();
            updated.previous_fire_time = Some(fired.next_fire_time);
            updated.next_fire_time = next;
            updated.acquired_by = None;
            if updated.state == TriggerState::Acquired {
                updated.state = TriggerState::Waiting;
            }
            TriggerCompletion::Rearm(updated)
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TriggerCompletion {
    Untouched,
    Remove,
    Rearm(Trigger),
}
