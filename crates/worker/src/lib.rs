//! 任务执行
//!
//! 处理器注册表、作业执行器、轻量级子任务、停滞检测，以及节点级的执行管理器和
//! 集群管理器。

pub mod cluster_manager;
pub mod dependencies;
pub mod execution_manager;
pub mod handler;
pub mod job_executor;
pub mod listeners;
pub mod node_client;
pub mod node_state;
pub mod recovery;
pub mod running_task;
pub mod stalled_watcher;
pub mod subtask_runner;

pub use cluster_manager::{ClusterManager, ClusterManagerConfig};
pub use dependencies::DependencyResolver;
pub use execution_manager::{ExecutionComponents, ExecutionManager, WaitPolicy};
pub use handler::{
    NoOpTaskHandler, TaskHandler, TaskHandlerRegistry, TaskRunResult, TaskRunResultStatus,
    NOOP_HANDLER_URI,
};
pub use job_executor::{ChainOutcome, TaskJobExecutor};
pub use listeners::{TaskListener, TaskListenerRegistry};
pub use node_client::{HttpNodeClient, RemoteNodeClient};
pub use node_state::LocalNodeState;
pub use recovery::TaskRecovery;
pub use running_task::{LocalRunningTasks, RunningTask};
pub use stalled_watcher::{StalledScanReport, StalledTaskWatcher};
pub use subtask_runner::{LightweightOutcome, LightweightTaskHandle, LightweightTaskRunner};
