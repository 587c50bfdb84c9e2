use serde::{Deserialize, Serialize};

/// 节点身份配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// 集群内唯一的节点标识，未配置时使用主机名
    pub node_id: Option<String>,
    /// 其他节点访问本节点的基础URL
    pub url: Option<String>,
    pub clustered: bool,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: None,
            url: None,
            clustered: false,
        }
    }
}

impl NodeConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if let Some(id) = &self.node_id {
            if id.trim().is_empty() {
                return Err(anyhow::anyhow!("节点ID不能为空"));
            }
        }

        if let Some(url) = &self.url {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                return Err(anyhow::anyhow!("节点URL格式无效: {url}"));
            }
        }

        Ok(())
    }

    pub fn resolved_node_id(&self) -> String {
        self.node_id.clone().unwrap_or_else(|| {
            hostname::get()
                .ok()
                .and_then(|h| h.into_string().ok())
                .unwrap_or_else(|| "localhost".to_string())
        })
    }
}

/// 本地调度引擎配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// 节点启动时是否启动本地调度
    pub enabled: bool,
    /// 同时执行的作业数上限
    pub thread_count: usize,
    /// 空闲时两次扫描触发器之间的等待时间（毫秒）
    pub idle_wait_ms: u64,
    /// 超过该时长未触发的触发器视为错过触发
    pub misfire_threshold_seconds: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            thread_count: 10,
            idle_wait_ms: 1000,
            misfire_threshold_seconds: 60,
        }
    }
}

impl SchedulerConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.thread_count == 0 {
            return Err(anyhow::anyhow!("调度线程数必须大于0"));
        }

        if self.idle_wait_ms == 0 {
            return Err(anyhow::anyhow!("空闲等待时间必须大于0"));
        }

        Ok(())
    }
}

/// 集群心跳与状态查询配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    pub heartbeat_interval_seconds: u64,
    /// 超过该时长未签到的节点视为宕机
    pub node_timeout_seconds: i64,
    pub status_cache_ttl_ms: u64,
    /// 等待任务停止时轮询集群状态的间隔
    pub stop_poll_interval_ms: u64,
    pub remote_request_timeout_ms: u64,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_seconds: 10,
            node_timeout_seconds: 30,
            status_cache_ttl_ms: 1000,
            stop_poll_interval_ms: 200,
            remote_request_timeout_ms: 5000,
        }
    }
}

impl ClusterConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.heartbeat_interval_seconds == 0 {
            return Err(anyhow::anyhow!("心跳间隔必须大于0"));
        }

        if self.node_timeout_seconds <= self.heartbeat_interval_seconds as i64 {
            return Err(anyhow::anyhow!("节点超时时间必须大于心跳间隔"));
        }

        if self.stop_poll_interval_ms == 0 {
            return Err(anyhow::anyhow!("停止轮询间隔必须大于0"));
        }

        Ok(())
    }
}

/// 停滞任务检测配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StalledTasksConfig {
    pub enabled: bool,
    pub check_interval_seconds: u64,
    /// 超过该时长没有进度即视为停滞
    pub threshold_seconds: i64,
}

impl Default for StalledTasksConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            check_interval_seconds: 60,
            threshold_seconds: 600,
        }
    }
}

impl StalledTasksConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.check_interval_seconds == 0 {
            return Err(anyhow::anyhow!("停滞检测间隔必须大于0"));
        }

        if self.threshold_seconds <= 0 {
            return Err(anyhow::anyhow!("停滞阈值必须大于0"));
        }

        Ok(())
    }
}

/// 轻量级子任务线程池配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LightweightConfig {
    pub pool_size: usize,
}

impl Default for LightweightConfig {
    fn default() -> Self {
        Self { pool_size: 16 }
    }
}

impl LightweightConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.pool_size == 0 {
            return Err(anyhow::anyhow!("轻量级任务线程池大小必须大于0"));
        }
        Ok(())
    }
}
