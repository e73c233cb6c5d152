use std::path::Path;

use anyhow::Result;
use config::{Config as ConfigBuilder, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};

use taskhub_errors::{HubError, HubResult};

/// 应用配置；TOML文件加载，TASKHUB__前缀环境变量覆盖
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub queue: QueueConfig,
    pub scheduler: SchedulerConfig,
    pub runner: RunnerConfig,
    pub api: ApiConfig,
    pub observability: ObservabilityConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub connection_timeout_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// 进程内队列的单队列容量上限
    pub capacity: usize,
    /// 消费空转时的轮询间隔
    pub poll_interval_ms: u64,
    /// 消息处理失败的最大重投次数
    pub max_retries: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    pub enabled: bool,
    /// 到期扫描周期（秒）
    pub scan_interval_seconds: u64,
    /// 单轮扫描最多处理的到期任务数
    pub scan_batch_size: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerConfig {
    pub enabled: bool,
    /// 为空时取"主机名-进程号"
    pub runner_id: Option<String>,
    pub max_concurrent_runs: usize,
    pub poll_interval_seconds: u64,
    /// 取消后留给子进程自行退出的宽限期
    pub cancel_grace_seconds: u64,
    pub python_bin: String,
    /// 脚本和临时产物的工作目录
    pub work_dir: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    pub enabled: bool,
    pub bind_address: String,
    pub cors_enabled: bool,
    pub cors_origins: Vec<String>,
    pub request_timeout_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    pub log_level: String,
    /// "text"或"json"
    pub log_format: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig {
                url: "sqlite://taskhub.db?mode=rwc".to_string(),
                max_connections: 10,
                connection_timeout_seconds: 30,
            },
            queue: QueueConfig {
                capacity: 1000,
                poll_interval_ms: 200,
                max_retries: 3,
            },
            scheduler: SchedulerConfig {
                enabled: true,
                scan_interval_seconds: 5,
                scan_batch_size: 100,
            },
            runner: RunnerConfig {
                enabled: true,
                runner_id: None,
                max_concurrent_runs: 8,
                poll_interval_seconds: 1,
                cancel_grace_seconds: 10,
                python_bin: "python3".to_string(),
                work_dir: std::env::temp_dir().to_string_lossy().to_string(),
            },
            api: ApiConfig {
                enabled: true,
                bind_address: "0.0.0.0:8080".to_string(),
                cors_enabled: true,
                cors_origins: vec!["*".to_string()],
                request_timeout_seconds: 30,
            },
            observability: ObservabilityConfig {
                log_level: "info".to_string(),
                log_format: "text".to_string(),
            },
        }
    }
}

impl AppConfig {
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let defaults_toml = toml::to_string(&AppConfig::default())?;
        // 优先级：环境变量 > 配置文件 > 内置默认值
        let mut builder = ConfigBuilder::builder()
            .add_source(File::from_str(&defaults_toml, FileFormat::Toml));

        if let Some(path) = config_path {
            if !Path::new(path).exists() {
                return Err(anyhow::anyhow!("配置文件不存在: {}", path));
            }
            builder = builder.add_source(File::new(path, FileFormat::Toml));
        } else {
            let default_paths = ["config/taskhub.toml", "taskhub.toml", "/etc/taskhub/config.toml"];
            if let Some(found) = default_paths.iter().find(|p| Path::new(p).exists()) {
                builder = builder.add_source(File::new(found, FileFormat::Toml));
            }
        }

        let config = builder
            .add_source(Environment::with_prefix("TASKHUB").separator("__"))
            .build()?;

        let app_config: AppConfig = config.try_deserialize()?;
        app_config.validate()?;
        Ok(app_config)
    }

    pub fn validate(&self) -> HubResult<()> {
        if self.database.url.is_empty() {
            return Err(HubError::config_error("database.url 不能为空"));
        }
        if self.database.max_connections == 0 {
            return Err(HubError::config_error("database.max_connections 必须大于0"));
        }
        if self.queue.capacity == 0 {
            return Err(HubError::config_error("queue.capacity 必须大于0"));
        }
        if self.scheduler.scan_interval_seconds == 0 {
            return Err(HubError::config_error("scheduler.scan_interval_seconds 必须大于0"));
        }
        if self.scheduler.scan_batch_size <= 0 {
            return Err(HubError::config_error("scheduler.scan_batch_size 必须大于0"));
        }
        if self.runner.max_concurrent_runs == 0 {
            return Err(HubError::config_error("runner.max_concurrent_runs 必须大于0"));
        }
        if self.api.enabled && self.api.bind_address.parse::<std::net::SocketAddr>().is_err() {
            return Err(HubError::config_error(format!(
                "api.bind_address 不是合法的监听地址: {}",
                self.api.bind_address
            )));
        }
        match self.observability.log_format.as_str() {
            "text" | "json" => {}
            other => {
                return Err(HubError::config_error(format!(
                    "observability.log_format 只支持 text/json: {other}"
                )))
            }
        }
        Ok(())
    }

    /// 运行期runner标识；未配置时由主机名和进程号拼出
    pub fn effective_runner_id(&self) -> String {
        if let Some(id) = &self.runner.runner_id {
            return id.clone();
        }
        let host = hostname::get()
            .map(|h| h.to_string_lossy().to_string())
            .unwrap_or_else(|_| "unknown-host".to_string());
        format!("{}-{}", host, std::process::id())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config_is_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation_rejects_bad_bind_address() {
        let mut config = AppConfig::default();
        config.api.bind_address = "not-an-address".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_zero_scan_interval() {
        let mut config = AppConfig::default();
        config.scheduler.scan_interval_seconds = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_toml_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[scheduler]
scan_interval_seconds = 30

[api]
bind_address = "127.0.0.1:9090"
"#
        )
        .unwrap();

        let config = AppConfig::load(Some(file.path().to_str().unwrap())).unwrap();
        assert_eq!(config.scheduler.scan_interval_seconds, 30);
        assert_eq!(config.api.bind_address, "127.0.0.1:9090");
        // 未覆盖的键保持默认值
        assert_eq!(config.queue.max_retries, 3);
    }

    #[test]
    fn test_load_missing_file_fails() {
        assert!(AppConfig::load(Some("/nonexistent/taskhub.toml")).is_err());
    }

    #[test]
    fn test_effective_runner_id_prefers_configured() {
        let mut config = AppConfig::default();
        config.runner.runner_id = Some("runner-a".to_string());
        assert_eq!(config.effective_runner_id(), "runner-a");
    }
}
