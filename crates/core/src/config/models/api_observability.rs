use serde::{Deserialize, Serialize};

/// 集群内部HTTP接口配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub enabled: bool,
    pub bind_address: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind_address: "0.0.0.0:8080".to_string(),
        }
    }
}

impl ApiConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.enabled && self.bind_address.parse::<std::net::SocketAddr>().is_err() {
            return Err(anyhow::anyhow!("无效的监听地址: {}", self.bind_address));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    pub log_level: String,
    pub log_format: String,
    /// Prometheus 指标监听地址，未设置时不导出
    pub metrics_listen_address: Option<String>,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: "pretty".to_string(),
            metrics_listen_address: None,
        }
    }
}

impl ObservabilityConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.log_level.as_str()) {
            return Err(anyhow::anyhow!(
                "无效的日志级别: {}，支持的级别: {:?}",
                self.log_level,
                valid_levels
            ));
        }

        let valid_formats = ["json", "pretty"];
        if !valid_formats.contains(&self.log_format.as_str()) {
            return Err(anyhow::anyhow!("无效的日志格式: {}", self.log_format));
        }

        if let Some(addr) = &self.metrics_listen_address {
            if addr.parse::<std::net::SocketAddr>().is_err() {
                return Err(anyhow::anyhow!("无效的指标监听地址: {addr}"));
            }
        }

        Ok(())
    }
}
