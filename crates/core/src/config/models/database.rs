use serde::{Deserialize, Serialize};

/// 共享存储配置
///
/// 任务/节点仓储与调度作业存储使用同一个存储：`memory` 表示进程内存储，
/// 否则为 SQLite 连接串（如 `sqlite://data/taskmgr.db`）。
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "memory".to_string(),
            max_connections: 5,
        }
    }
}

impl DatabaseConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.url.is_empty() {
            return Err(anyhow::anyhow!("数据库URL不能为空"));
        }

        if !self.is_in_memory() && !self.url.starts_with("sqlite:") {
            return Err(anyhow::anyhow!(
                "数据库URL必须是 memory 或 SQLite 格式: {}",
                self.url
            ));
        }

        if self.max_connections == 0 {
            return Err(anyhow::anyhow!("最大连接数必须大于0"));
        }

        Ok(())
    }

    pub fn is_in_memory(&self) -> bool {
        self.url == "memory"
    }

    /// 作业存储指纹，集群内所有节点必须一致
    pub fn job_store_fingerprint(&self) -> String {
        if self.is_in_memory() {
            "memory".to_string()
        } else {
            self.url.clone()
        }
    }
}
