//! 任务执行相关的指标
//!
//! 指标通过 `metrics` 门面记录，是否导出由二进制程序安装的记录器决定。

use metrics::{counter, gauge, Counter, Gauge};

#[derive(Clone)]
pub struct MetricsCollector {
    task_starts_total: Counter,
    task_suspends_total: Counter,
    stalled_tasks_total: Counter,
    trigger_fires_total: Counter,
    trigger_misfires_total: Counter,
    heartbeats_total: Counter,
    running_tasks: Gauge,
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            task_starts_total: counter!("taskmgr_task_starts_total"),
            task_suspends_total: counter!("taskmgr_task_suspends_total"),
            stalled_tasks_total: counter!("taskmgr_stalled_tasks_total"),
            trigger_fires_total: counter!("taskmgr_trigger_fires_total"),
            trigger_misfires_total: counter!("taskmgr_trigger_misfires_total"),
            heartbeats_total: counter!("taskmgr_node_heartbeats_total"),
            running_tasks: gauge!("taskmgr_running_tasks"),
        }
    }

    pub fn record_task_started(&self) {
        self.task_starts_total.increment(1);
        self.running_tasks.increment(1.0);
    }

    /// 记录一次运行结束，`outcome` 为运行结果分类
    pub fn record_task_finished(&self, outcome: &'static str) {
        counter!("taskmgr_task_finishes_total", "outcome" => outcome).increment(1);
        self.running_tasks.decrement(1.0);
    }

    pub fn record_task_suspended(&self) {
        self.task_suspends_total.increment(1);
    }

    pub fn record_stalled_task(&self) {
        self.stalled_tasks_total.increment(1);
    }

    pub fn record_trigger_fired(&self) {
        self.trigger_fires_total.increment(1);
    }

    pub fn record_trigger_misfire(&self) {
        self.trigger_misfires_total.increment(1);
    }

    pub fn record_heartbeat(&self) {
        self.heartbeats_total.increment(1);
    }
}
