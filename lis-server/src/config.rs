//! 服务配置
//!
//! 配置来源（后者覆盖前者）：内置默认值、TOML配置文件、`LIS__` 前缀的环境变量，
//! 例如 `LIS__DATABASE__URL=postgres://...`。

use anyhow::{Context, Result};
use config::{Config, Environment, File};
use lis_integration::{ManagerSettings, ReconnectPolicy, TimeoutSettings};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{error, info};

/// LIS服务完整配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LisConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub integration: IntegrationConfig,
    pub events: EventsConfig,
    pub logging: LoggingConfig,
}

/// 服务器配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// 实例名称
    pub name: String,
}

/// 数据库配置
///
/// 未配置 `url` 时使用内存存储，可从 `seed_file` 加载设备与患者。
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: Option<String>,
    pub max_connections: u32,
    pub connect_timeout_secs: u64,
    pub seed_file: Option<PathBuf>,
}

/// 仪器接入配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IntegrationConfig {
    /// 每台设备的消息队列容量
    pub queue_capacity: usize,
    pub connect_timeout_ms: u64,
    pub patient_lookup_timeout_ms: u64,
    pub persistence_timeout_ms: u64,
    pub telemetry_timeout_ms: u64,
    pub reconnect: ReconnectConfig,
    /// 待匹配结果的定期重试间隔，未设置则不启用
    pub pending_sweep_interval_secs: Option<u64>,
}

/// 重连策略
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
    /// 0 表示无限重试
    pub max_attempts: u32,
}

/// 新结果通知配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EventsConfig {
    pub webhook_url: Option<String>,
    pub webhook_secret: Option<String>,
    /// 进程内广播通道容量
    pub broadcast_capacity: usize,
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    /// `text` 或 `json`
    pub format: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            name: "lis-server".to_string(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            max_connections: 10,
            connect_timeout_secs: 30,
            seed_file: None,
        }
    }
}

impl Default for IntegrationConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 64,
            connect_timeout_ms: 5_000,
            patient_lookup_timeout_ms: 3_000,
            persistence_timeout_ms: 5_000,
            telemetry_timeout_ms: 3_000,
            reconnect: ReconnectConfig::default(),
            pending_sweep_interval_secs: None,
        }
    }
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 1_000,
            max_delay_ms: 60_000,
            multiplier: 2.0,
            max_attempts: 0,
        }
    }
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            webhook_url: None,
            webhook_secret: None,
            broadcast_capacity: 256,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
        }
    }
}

impl LisConfig {
    /// 加载并验证配置
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::with_name(path));
        }

        let config: LisConfig = builder
            .add_source(Environment::with_prefix("LIS").separator("__"))
            .build()
            .context("读取配置失败")?
            .try_deserialize()
            .context("解析配置失败")?;

        ConfigValidator::new().validate(&config)?;
        Ok(config)
    }
}

impl IntegrationConfig {
    pub fn timeouts(&self) -> TimeoutSettings {
        TimeoutSettings {
            connect: Duration::from_millis(self.connect_timeout_ms),
            patient_lookup: Duration::from_millis(self.patient_lookup_timeout_ms),
            persistence: Duration::from_millis(self.persistence_timeout_ms),
            telemetry: Duration::from_millis(self.telemetry_timeout_ms),
        }
    }

    pub fn manager_settings(&self) -> ManagerSettings {
        ManagerSettings {
            queue_capacity: self.queue_capacity,
            reconnect: ReconnectPolicy::from_config(
                self.reconnect.initial_delay_ms,
                self.reconnect.max_delay_ms,
                self.reconnect.multiplier,
                self.reconnect.max_attempts,
            ),
        }
    }
}

/// 验证规则
struct ValidationRule {
    field_path: &'static str,
    validator: fn(&LisConfig) -> Result<()>,
}

/// 配置验证器
pub struct ConfigValidator {
    validation_rules: Vec<ValidationRule>,
}

impl ConfigValidator {
    pub fn new() -> Self {
        let validation_rules = vec![
            ValidationRule {
                field_path: "database.max_connections",
                validator: |config| {
                    if config.database.url.is_some() && config.database.max_connections == 0 {
                        anyhow::bail!("最大连接数不能为0");
                    }
                    Ok(())
                },
            },
            ValidationRule {
                field_path: "integration.queue_capacity",
                validator: |config| {
                    if config.integration.queue_capacity == 0 {
                        anyhow::bail!("队列容量不能为0");
                    }
                    Ok(())
                },
            },
            ValidationRule {
                field_path: "integration.*_timeout_ms",
                validator: |config| {
                    let integration = &config.integration;
                    let timeouts = [
                        integration.connect_timeout_ms,
                        integration.patient_lookup_timeout_ms,
                        integration.persistence_timeout_ms,
                        integration.telemetry_timeout_ms,
                    ];
                    if timeouts.contains(&0) {
                        anyhow::bail!("超时时间必须大于0");
                    }
                    Ok(())
                },
            },
            ValidationRule {
                field_path: "integration.reconnect",
                validator: |config| {
                    let reconnect = &config.integration.reconnect;
                    if reconnect.initial_delay_ms == 0 || reconnect.max_delay_ms < reconnect.initial_delay_ms {
                        anyhow::bail!("重连延迟配置无效");
                    }
                    if reconnect.multiplier < 1.0 {
                        anyhow::bail!("重连倍数不能小于1");
                    }
                    Ok(())
                },
            },
            ValidationRule {
                field_path: "integration.pending_sweep_interval_secs",
                validator: |config| match config.integration.pending_sweep_interval_secs {
                    Some(0) => anyhow::bail!("重试间隔必须大于0"),
                    _ => Ok(()),
                },
            },
            ValidationRule {
                field_path: "logging.format",
                validator: |config| match config.logging.format.as_str() {
                    "text" | "json" => Ok(()),
                    other => anyhow::bail!("不支持的日志格式: {}", other),
                },
            },
        ];

        Self { validation_rules }
    }

    pub fn validate(&self, config: &LisConfig) -> Result<()> {
        for rule in &self.validation_rules {
            if let Err(e) = (rule.validator)(config) {
                error!("Configuration validation failed for {}: {}", rule.field_path, e);
                return Err(e.context(format!("配置项 {} 无效", rule.field_path)));
            }
        }

        info!("Configuration validation passed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config_is_valid() {
        let config = LisConfig::default();
        assert!(ConfigValidator::new().validate(&config).is_ok());
        assert!(config.database.url.is_none());
        assert!(config.integration.pending_sweep_interval_secs.is_none());
    }

    #[test]
    fn test_validation_rules() {
        let mut config = LisConfig::default();
        config.integration.queue_capacity = 0;
        assert!(ConfigValidator::new().validate(&config).is_err());

        let mut config = LisConfig::default();
        config.logging.format = "xml".to_string();
        assert!(ConfigValidator::new().validate(&config).is_err());

        let mut config = LisConfig::default();
        config.integration.pending_sweep_interval_secs = Some(0);
        assert!(ConfigValidator::new().validate(&config).is_err());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[database]
seed_file = "seed.json"

[integration]
patient_lookup_timeout_ms = 1500
pending_sweep_interval_secs = 30

[integration.reconnect]
initial_delay_ms = 500

[logging]
format = "json"
"#
        )
        .unwrap();

        let config = LisConfig::load(file.path().to_str()).unwrap();
        assert_eq!(config.database.seed_file, Some(PathBuf::from("seed.json")));
        assert_eq!(config.integration.timeouts().patient_lookup, Duration::from_millis(1500));
        assert_eq!(config.integration.pending_sweep_interval_secs, Some(30));
        assert_eq!(config.integration.manager_settings().reconnect.initial_delay, Duration::from_millis(500));
        assert_eq!(config.integration.reconnect.max_delay_ms, 60_000);
        assert_eq!(config.logging.format, "json");
    }
}
