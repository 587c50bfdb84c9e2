use std::fmt;

use serde::{Deserialize, Serialize};

use crate::task::TaskRecurrence;

/// 任务执行状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskExecutionStatus {
    Runnable,
    Running,
    Waiting,
    Suspended,
    Closed,
}

/// 引起状态迁移的事件
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskEvent {
    /// 调度触发，节点认领任务
    Start,
    /// 循环任务本次运行结束
    FinishRun,
    Close,
    Suspend,
    Resume,
    /// 等待依赖
    Pause,
    Unpause,
    ScheduleNow,
}

/// 非法的状态迁移
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidTransition {
    pub from: TaskExecutionStatus,
    pub event: TaskEvent,
    pub recurrence: TaskRecurrence,
}

impl fmt::Display for InvalidTransition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.event, self.from) {
            (TaskEvent::Resume, TaskExecutionStatus::Closed) => write!(
                f,
                "单次任务已关闭，无法恢复（只有 SUSPENDED 或已关闭的循环任务可以恢复）"
            ),
            (TaskEvent::Resume, from) => write!(f, "只有 SUSPENDED 状态的任务可以恢复，当前状态: {from}"),
            (TaskEvent::Pause, from) => write!(f, "只有 RUNNABLE 状态的任务可以暂停等待，当前状态: {from}"),
            (TaskEvent::Unpause, from) => {
                write!(f, "只有 WAITING 状态的任务可以取消暂停，当前状态: {from}")
            }
            (event, from) => write!(
                f,
                "不允许的状态迁移: {from} 上的 {event:?} 事件（{:?}）",
                self.recurrence
            ),
        }
    }
}

impl TaskExecutionStatus {
    /// 计算事件作用后的状态，非法迁移返回错误且不产生任何副作用
    pub fn apply(
        self,
        event: TaskEvent,
        recurrence: TaskRecurrence,
    ) -> Result<TaskExecutionStatus, InvalidTransition> {
        use TaskEvent as E;
        use TaskExecutionStatus as S;

        let recurring = recurrence == TaskRecurrence::Recurring;
        let next = match (self, event) {
            (S::Runnable, E::Start) => Some(S::Running),
            (S::Running, E::FinishRun) if recurring => Some(S::Runnable),
            (S::Running, E::Close) => Some(S::Closed),
            (S::Runnable | S::Running | S::Waiting, E::Suspend) => Some(S::Suspended),
            (S::Suspended, E::Resume) => Some(S::Runnable),
            (S::Closed, E::Resume) if recurring => Some(S::Runnable),
            (S::Runnable, E::Pause) => Some(S::Waiting),
            (S::Waiting, E::Unpause) => Some(S::Runnable),
            (S::Runnable, E::ScheduleNow) => Some(S::Runnable),
            (S::Closed, E::ScheduleNow) if recurring => Some(S::Runnable),
            _ => None,
        };

        next.ok_or(InvalidTransition {
            from: self,
            event,
            recurrence,
        })
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Runnable => "RUNNABLE",
            Self::Running => "RUNNING",
            Self::Waiting => "WAITING",
            Self::Suspended => "SUSPENDED",
            Self::Closed => "CLOSED",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "RUNNABLE" => Some(Self::Runnable),
            "RUNNING" => Some(Self::Running),
            "WAITING" => Some(Self::Waiting),
            "SUSPENDED" => Some(Self::Suspended),
            "CLOSED" => Some(Self::Closed),
            _ => None,
        }
    }
}

impl fmt::Display for TaskExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use TaskExecutionStatus as S;

    const ALL: [S; 5] = [S::Runnable, S::Running, S::Waiting, S::Suspended, S::Closed];

    #[test]
    fn test_valid_transitions() {
        let single = TaskRecurrence::Single;
        let recurring = TaskRecurrence::Recurring;

        assert_eq!(S::Runnable.apply(TaskEvent::Start, single), Ok(S::Running));
        assert_eq!(S::Running.apply(TaskEvent::Close, single), Ok(S::Closed));
        assert_eq!(S::Running.apply(TaskEvent::FinishRun, recurring), Ok(S::Runnable));
        assert_eq!(S::Waiting.apply(TaskEvent::Suspend, single), Ok(S::Suspended));
        assert_eq!(S::Suspended.apply(TaskEvent::Resume, single), Ok(S::Runnable));
        assert_eq!(S::Closed.apply(TaskEvent::Resume, recurring), Ok(S::Runnable));
        assert_eq!(S::Runnable.apply(TaskEvent::Pause, single), Ok(S::Waiting));
        assert_eq!(S::Waiting.apply(TaskEvent::Unpause, single), Ok(S::Runnable));
        assert_eq!(S::Closed.apply(TaskEvent::ScheduleNow, recurring), Ok(S::Runnable));
    }

    #[test]
    fn test_closed_single_task_cannot_resume() {
        let err = S::Closed
            .apply(TaskEvent::Resume, TaskRecurrence::Single)
            .unwrap_err();
        assert!(err.to_string().contains("单次任务"));
        assert!(S::Closed
            .apply(TaskEvent::ScheduleNow, TaskRecurrence::Single)
            .is_err());
    }

    #[test]
    fn test_pause_and_unpause_are_guarded() {
        for from in ALL {
            let pause = from.apply(TaskEvent::Pause, TaskRecurrence::Single);
            assert_eq!(pause.is_ok(), from == S::Runnable, "pause from {from}");

            let unpause = from.apply(TaskEvent::Unpause, TaskRecurrence::Single);
            assert_eq!(unpause.is_ok(), from == S::Waiting, "unpause from {from}");
        }
    }

    #[test]
    fn test_finish_run_of_single_task_is_invalid() {
        assert!(S::Running
            .apply(TaskEvent::FinishRun, TaskRecurrence::Single)
            .is_err());
    }

    #[test]
    fn test_status_string_round_trip() {
        for status in ALL {
            assert_eq!(S::parse(status.as_str()), Some(status));
        }
        assert_eq!(S::parse("PAUSED"), None);
    }
}
