//! 任务管理门面
//!
//! 对外提供任务和节点的全部管理操作。所有操作先修改持久化状态，
//! 再尽力同步调度触发器和运行中的任务。

pub mod builder;
pub mod operations;
pub mod options;
pub mod outcome;
pub mod task_manager;

pub use builder::TaskManagerBuilder;
pub use options::TaskRetrieveOptions;
pub use outcome::{BatchFailure, BatchOutcome, CleanupOutcome, SuspendOutcome};
pub use task_manager::TaskManager;
