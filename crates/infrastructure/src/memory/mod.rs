//! 进程内存储实现
//!
//! 同一进程内的多个节点可以共享同一组实例，用于嵌入式部署和测试。

mod job_store;
mod node_repository;
mod task_repository;

pub use job_store::InMemoryJobStore;
pub use node_repository::InMemoryNodeRepository;
pub use task_repository::InMemoryTaskRepository;
