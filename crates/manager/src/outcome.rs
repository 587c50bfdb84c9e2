use taskmgr_core::TaskManagerError;
use taskmgr_domain::OperationResultStatus;

/// 批量操作中失败的一项
#[derive(Debug)]
pub struct BatchFailure {
    pub oid: String,
    pub error: TaskManagerError,
}

/// 批量操作结果，单项失败不影响其余项
#[derive(Debug, Default)]
pub struct BatchOutcome {
    pub succeeded: Vec<String>,
    pub failed: Vec<BatchFailure>,
}

impl BatchOutcome {
    pub fn record(&mut self, oid: &str, result: Result<(), TaskManagerError>) {
        match result {
            Ok(()) => self.succeeded.push(oid.to_string()),
            Err(error) => self.failed.push(BatchFailure {
                oid: oid.to_string(),
                error,
            }),
        }
    }

    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn failed_oids(&self) -> Vec<&str> {
        self.failed.iter().map(|f| f.oid.as_str()).collect()
    }

    pub fn overall_status(&self) -> OperationResultStatus {
        match (self.succeeded.is_empty(), self.failed.is_empty()) {
            (_, true) => OperationResultStatus::Success,
            (true, false) => OperationResultStatus::FatalError,
            (false, false) => OperationResultStatus::PartialError,
        }
    }
}

/// 批量挂起结果
#[derive(Debug, Default)]
pub struct SuspendOutcome {
    pub batch: BatchOutcome,
    /// 按等待策略确认全部已停止
    pub stopped: bool,
}

/// 按时间清理已关闭任务树的结果
#[derive(Debug, Default)]
pub struct CleanupOutcome {
    pub deleted_trees: usize,
    pub deleted_tasks: usize,
    /// 子任务尚未全部关闭而跳过的任务树
    pub skipped_trees: usize,
    pub failed: Vec<BatchFailure>,
}

impl CleanupOutcome {
    pub fn overall_status(&self) -> OperationResultStatus {
        match (self.deleted_trees, self.failed.is_empty()) {
            (_, true) => OperationResultStatus::Success,
            (0, false) => OperationResultStatus::FatalError,
            (_, false) => OperationResultStatus::PartialError,
        }
    }
}
