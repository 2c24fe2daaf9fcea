//! # 引擎配置
//!
//! 加载顺序（后者覆盖前者）：
//!
//! 1. 内置默认值
//! 2. 可选的 TOML 配置文件
//! 3. 环境变量 `WEALTHWISE_MIGRATION__*`（`__` 分隔嵌套字段，如
//!    `WEALTHWISE_MIGRATION__RETENTION__KEEP_LATEST=5`）
//!
//! 读取环境变量前会先加载当前目录的 `.env`（存在时）。

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::backup::RetentionPolicy;

/// 环境变量前缀
pub const ENV_PREFIX: &str = "WEALTHWISE_MIGRATION";

/// 配置错误
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("Configuration file not found: {0}")]
    FileNotFound(PathBuf),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// 备份保留策略配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionConfig {
    /// 始终保留的最新活跃备份数
    pub keep_latest: usize,
    /// 超过该天数的活跃备份可被清理
    pub max_age_days: i64,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            keep_latest: 3,
            max_age_days: 30,
        }
    }
}

/// 迁移引擎配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// 数据根目录
    pub data_dir: PathBuf,
    /// 存储文件名（相对 `data_dir`）
    pub store_file: String,
    /// 版本元数据文件名（相对 `data_dir`）
    pub version_file: String,
    /// 备份目录；未设置时为 `<data_dir>/backups`
    pub backup_dir: Option<PathBuf>,
    /// 运行记录文件名；设为空字符串时不落盘
    pub run_log_file: Option<String>,
    pub retention: RetentionConfig,
    /// 迁移成功后多久才允许自动清理备份
    pub prune_grace_period_hours: i64,
    /// 磁盘空间检查的额外余量
    pub min_free_space_margin_mb: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("."),
            store_file: "wealthwise.db".to_string(),
            version_file: "version.json".to_string(),
            backup_dir: None,
            run_log_file: Some("migration_runs.db".to_string()),
            retention: RetentionConfig::default(),
            prune_grace_period_hours: 72,
            min_free_space_margin_mb: 50,
        }
    }
}

impl EngineConfig {
    /// 指定数据目录、其余取默认值
    pub fn for_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Self::default()
        }
    }

    /// 从默认值 / 配置文件 / 环境变量加载
    pub fn load(file: Option<&Path>) -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let defaults = EngineConfig::default();
        let mut builder = config::Config::builder()
            .set_default("data_dir", defaults.data_dir.to_string_lossy().to_string())?
            .set_default("store_file", defaults.store_file.clone())?
            .set_default("version_file", defaults.version_file.clone())?
            .set_default("retention.keep_latest", defaults.retention.keep_latest as i64)?
            .set_default("retention.max_age_days", defaults.retention.max_age_days)?
            .set_default("prune_grace_period_hours", defaults.prune_grace_period_hours)?
            .set_default(
                "min_free_space_margin_mb",
                defaults.min_free_space_margin_mb as i64,
            )?;

        if let Some(path) = file {
            if !path.exists() {
                return Err(ConfigError::FileNotFound(path.to_path_buf()));
            }
            builder = builder.add_source(config::File::from(path).format(config::FileFormat::Toml));
        }

        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let loaded: EngineConfig = builder.build()?.try_deserialize()?;
        loaded.validate()?;
        Ok(loaded)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.store_file.trim().is_empty() {
            return Err(ConfigError::Invalid("store_file must not be empty".to_string()));
        }
        if self.version_file.trim().is_empty() {
            return Err(ConfigError::Invalid("version_file must not be empty".to_string()));
        }
        if self.retention.max_age_days < 0 {
            return Err(ConfigError::Invalid(
                "retention.max_age_days must not be negative".to_string(),
            ));
        }
        if self.prune_grace_period_hours < 0 {
            return Err(ConfigError::Invalid(
                "prune_grace_period_hours must not be negative".to_string(),
            ));
        }
        Ok(())
    }

    // ========================================================================
    // 路径
    // ========================================================================

    pub fn store_path(&self) -> PathBuf {
        self.data_dir.join(&self.store_file)
    }

    pub fn version_path(&self) -> PathBuf {
        self.data_dir.join(&self.version_file)
    }

    pub fn backup_dir(&self) -> PathBuf {
        self.backup_dir
            .clone()
            .unwrap_or_else(|| self.data_dir.join("backups"))
    }

    /// 运行记录路径；未配置时返回 `None`
    pub fn run_log_path(&self) -> Option<PathBuf> {
        self.run_log_file
            .as_deref()
            .filter(|name| !name.trim().is_empty())
            .map(|name| self.data_dir.join(name))
    }

    pub fn retention_policy(&self) -> RetentionPolicy {
        RetentionPolicy {
            max_age: chrono::Duration::days(self.retention.max_age_days),
            keep_latest: self.retention.keep_latest,
        }
    }

    pub fn prune_grace_period(&self) -> chrono::Duration {
        chrono::Duration::hours(self.prune_grace_period_hours)
    }

    pub fn free_space_margin_bytes(&self) -> u64 {
        self.min_free_space_margin_mb.saturating_mul(1024 * 1024)
    }
}
