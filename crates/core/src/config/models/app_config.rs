use anyhow::{Context, Result};
use config::{Config as ConfigBuilder, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::path::Path;

use super::{
    api_observability::{ApiConfig, ObservabilityConfig},
    database::DatabaseConfig,
    node_cluster::{
        ClusterConfig, LightweightConfig, NodeConfig, SchedulerConfig, StalledTasksConfig,
    },
};

/// 默认配置文件搜索路径
const DEFAULT_CONFIG_PATHS: [&str; 3] = [
    "config/taskmgr.toml",
    "taskmgr.toml",
    "/etc/taskmgr/config.toml",
];

/// 节点配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub node: NodeConfig,
    pub scheduler: SchedulerConfig,
    pub cluster: ClusterConfig,
    pub stalled_tasks: StalledTasksConfig,
    pub lightweight: LightweightConfig,
    pub database: DatabaseConfig,
    pub api: ApiConfig,
    pub observability: ObservabilityConfig,
}

impl AppConfig {
    /// 从配置文件和环境变量加载配置
    ///
    /// 加载顺序：
    /// 1. 默认配置
    /// 2. 配置文件（TOML格式）
    /// 3. 环境变量覆盖（前缀: TASKMGR_，层级分隔符: __）
    ///
    /// 指定的配置文件不存在时返回错误；未指定时按默认路径搜索，找不到则只使用默认值。
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_path {
            if Path::new(path).exists() {
                builder = builder.add_source(File::new(path, FileFormat::Toml));
            } else {
                return Err(anyhow::anyhow!("配置文件不存在: {}", path));
            }
        } else if let Some(path) = DEFAULT_CONFIG_PATHS
            .iter()
            .find(|path| Path::new(path).exists())
        {
            builder = builder.add_source(File::new(path, FileFormat::Toml));
        }

        builder = builder.add_source(
            Environment::with_prefix("TASKMGR")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config: AppConfig = builder
            .build()
            .context("构建配置失败")?
            .try_deserialize()
            .context("反序列化配置失败")?;

        config.validate()?;

        Ok(config)
    }

    pub fn from_toml(toml_str: &str) -> Result<Self> {
        let config: AppConfig = toml::from_str(toml_str).context("解析TOML配置失败")?;

        config.validate()?;
        Ok(config)
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("序列化配置为TOML失败")
    }

    pub fn validate(&self) -> Result<()> {
        self.node.validate().context("节点配置验证失败")?;
        self.scheduler.validate().context("调度器配置验证失败")?;
        self.cluster.validate().context("集群配置验证失败")?;
        self.stalled_tasks
            .validate()
            .context("停滞任务检测配置验证失败")?;
        self.lightweight
            .validate()
            .context("轻量级任务配置验证失败")?;
        self.database.validate().context("数据库配置验证失败")?;
        self.api.validate().context("API配置验证失败")?;
        self.observability
            .validate()
            .context("可观测性配置验证失败")?;

        if self.node.clustered && self.database.is_in_memory() {
            tracing::warn!("集群模式下使用进程内存储，只有同一进程内的节点能共享调度状态");
        }

        Ok(())
    }
}
