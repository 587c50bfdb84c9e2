//! 任务调度领域模型
//!
//! 任务与节点实体、执行状态机、条目增量、查询条件、集群状态快照，
//! 以及存储和调度的端口定义。

pub mod cluster;
pub mod delta;
pub mod node;
pub mod query;
pub mod repositories;
pub mod schedule;
pub mod state;
pub mod task;

pub use cluster::*;
pub use delta::*;
pub use node::*;
pub use query::*;
pub use repositories::*;
pub use schedule::*;
pub use state::*;
pub use task::*;
