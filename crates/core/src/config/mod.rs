//! 节点配置
//!
//! 配置加载顺序：默认值 → TOML 配置文件 → 环境变量（前缀 `TASKMGR_`，层级分隔符 `__`）。

pub mod models;

pub use models::*;
