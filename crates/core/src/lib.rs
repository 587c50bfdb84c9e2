pub mod cache;
pub mod clock;
pub mod config;
pub mod errors;
pub mod logging;

pub use cache::TtlCache;
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::*;
pub use errors::*;
pub use logging::init_logging;

/// 统一的Result类型
pub type TaskManagerResult<T> = std::result::Result<T, TaskManagerError>;
