use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use taskmgr_core::{TaskManagerError, TaskManagerResult};
use taskmgr_domain::{
    complete_trigger, JobDetail, JobStore, Trigger, TriggerCompletion, TriggerKey, TriggerState,
};
use tokio::sync::Mutex;
use tracing::debug;

#[derive(Debug, Default)]
struct JobStoreState {
    jobs: BTreeMap<String, JobDetail>,
    triggers: BTreeMap<TriggerKey, Trigger>,
}

impl JobStoreState {
    fn job_triggers_mut(&mut self, job_key: &str) -> impl Iterator<Item = &mut Trigger> {
        let job_key = job_key.to_string();
        self.triggers
            .values_mut()
            .filter(move |t| t.key.job == job_key)
    }
}

/// 内存作业存储
///
/// 所有操作在同一把锁内完成，认领天然是原子的；同一进程中的多个调度实例共享一个实例即可互斥。
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    state: Mutex<JobStoreState>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn store_job(&self, job: JobDetail, replace: bool) -> TaskManagerResult<()> {
        let mut state = self.state.lock().await;
        if !replace && state.jobs.contains_key(&job.key) {
            return Err(TaskManagerError::AlreadyExists {
                kind: "作业",
                id: job.key,
            });
        }
        state.jobs.insert(job.key.clone(), job);
        Ok(())
    }

    async fn remove_job(&self, job_key: &str) -> TaskManagerResult<bool> {
        let mut state = self.state.lock().await;
        state.triggers.retain(|key, _| key.job != job_key);
        Ok(state.jobs.remove(job_key).is_some())
    }

    async fn job_exists(&self, job_key: &str) -> TaskManagerResult<bool> {
        Ok(self.state.lock().await.jobs.contains_key(job_key))
    }

    async fn job_keys(&self) -> TaskManagerResult<Vec<String>> {
        Ok(self.state.lock().await.jobs.keys().cloned().collect())
    }

    async fn store_trigger(&self, trigger: Trigger, replace: bool) -> TaskManagerResult<()> {
        let mut state = self.state.lock().await;
        if !state.jobs.contains_key(&trigger.key.job) {
            return Err(TaskManagerError::job_not_found(&trigger.key.job));
        }
        if !replace && state.triggers.contains_key(&trigger.key) {
            return Err(TaskManagerError::AlreadyExists {
                kind: "触发器",
                id: trigger.key.to_string(),
            });
        }
        state.triggers.insert(trigger.key.clone(), trigger);
        Ok(())
    }

    async fn remove_trigger(&self, key: &TriggerKey) -> TaskManagerResult<bool> {
        Ok(self.state.lock().await.triggers.remove(key).is_some())
    }

    async fn get_trigger(&self, key: &TriggerKey) -> TaskManagerResult<Option<Trigger>> {
        Ok(self.state.lock().await.triggers.get(key).cloned())
    }

    async fn triggers_of_job(&self, job_key: &str) -> TaskManagerResult<Vec<Trigger>> {
        let state = self.state.lock().await;
        Ok(state
            .triggers
            .values()
            .filter(|t| t.key.job == job_key)
            .cloned()
            .collect())
    }

    async fn pause_job(&self, job_key: &str) -> TaskManagerResult<()> {
        let mut state = self.state.lock().await;
        if !state.jobs.contains_key(job_key) {
            return Err(TaskManagerError::job_not_found(job_key));
        }
        for trigger in state.job_triggers_mut(job_key) {
            trigger.state = TriggerState::Paused;
        }
        Ok(())
    }

    async fn resume_job(&self, job_key: &str) -> TaskManagerResult<()> {
        let mut state = self.state.lock().await;
        if !state.jobs.contains_key(job_key) {
            return Err(TaskManagerError::job_not_found(job_key));
        }
        for trigger in state.job_triggers_mut(job_key) {
            if trigger.state == TriggerState::Paused {
                trigger.state = TriggerState::Waiting;
                trigger.acquired_by = None;
            }
        }
        Ok(())
    }

    async fn acquire_next_triggers(
        &self,
        instance_id: &str,
        no_later_than: DateTime<Utc>,
        max_count: usize,
    ) -> TaskManagerResult<Vec<Trigger>> {
        let mut state = self.state.lock().await;
        let mut due: Vec<&mut Trigger> = state
            .triggers
            .values_mut()
            .filter(|t| t.state == TriggerState::Waiting && t.next_fire_time <= no_later_than)
            .collect();
        due.sort_by_key(|t| t.next_fire_time);

        let acquired: Vec<Trigger> = due
            .into_iter()
            .take(max_count)
            .map(|trigger| {
                trigger.state = TriggerState::Acquired;
                trigger.acquired_by = Some(instance_id.to_string());
                trigger.clone()
            })
            .collect();

        if !acquired.is_empty() {
            debug!(instance_id, count = acquired.len(), "认领触发器");
        }
        Ok(acquired)
    }

    async fn triggered_job_complete(
        &self,
        trigger: &Trigger,
        next_fire_time: Option<DateTime<Utc>>,
    ) -> TaskManagerResult<()> {
        let mut state = self.state.lock().await;
        let Some(current) = state.triggers.get(&trigger.key) else {
            return Ok(());
        };

        match complete_trigger(current, trigger, next_fire_time) {
            TriggerCompletion::Untouched => {}
            TriggerCompletion::Remove => {
                state.triggers.remove(&trigger.key);
            }
            TriggerCompletion::Rearm(updated) => {
                state.triggers.insert(trigger.key.clone(), updated);
            }
        }
        Ok(())
    }

    async fn release_acquired_triggers(&self, instance_id: &str) -> TaskManagerResult<usize> {
        let mut state = self.state.lock().await;
        let mut released = 0;
        for trigger in state.triggers.values_mut() {
            if trigger.state == TriggerState::Acquired
                && trigger.acquired_by.as_deref() == Some(instance_id)
            {
                trigger.state = TriggerState::Waiting;
                trigger.acquired_by = None;
                released += 1;
            }
        }
        Ok(released)
    }
}
