//! # Version Registry (版本注册表)
//!
//! 记录本地数据存储的当前 schema 版本，以及本应用支持的有序版本列表。
//!
//! ## 设计原则
//!
//! **单一受控写入路径**：
//! - 版本元数据是一条小记录（当前版本字符串 + 最近一次迁移时间），
//!   在构造时加载并交由 `VersionRegistry` 独占持有
//! - 唯一的写入口是 `set_version`，由协调器在校验通过后调用
//! - 记录以 JSON 形式原子写入 `version.json`
//!
//! ## 版本比较
//!
//! 采用语义化版本优先级：先比较 major，再 minor，最后 patch。
//! `-pre` / `+build` 之类的附加信息在解析时被忽略，三元组相同即视为相等。

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::backup_common::write_json_atomic;
use crate::migration::MigrationError;

/// 语义化版本三元组
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Version {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl Version {
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// 版本字符串解析错误
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Invalid version string '{0}': expected MAJOR.MINOR.PATCH")]
pub struct VersionParseError(pub String);

impl FromStr for Version {
    type Err = VersionParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let without_prefix = trimmed
            .strip_prefix('v')
            .or_else(|| trimmed.strip_prefix('V'))
            .unwrap_or(trimmed);

        // 预发布 / 构建元数据不参与比较
        let core = without_prefix
            .split(|c| c == '-' || c == '+')
            .next()
            .unwrap_or_default();

        let parts: Vec<&str> = core.split('.').collect();
        if parts.len() != 3 {
            return Err(VersionParseError(s.to_string()));
        }

        let mut numbers = [0u32; 3];
        for (slot, part) in numbers.iter_mut().zip(parts.iter()) {
            if part.is_empty() || !part.chars().all(|c| c.is_ascii_digit()) {
                return Err(VersionParseError(s.to_string()));
            }
            *slot = part
                .parse::<u32>()
                .map_err(|_| VersionParseError(s.to_string()))?;
        }

        Ok(Version::new(numbers[0], numbers[1], numbers[2]))
    }
}

impl TryFrom<String> for Version {
    type Error = VersionParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Version> for String {
    fn from(version: Version) -> Self {
        version.to_string()
    }
}

/// 持久化的版本元数据记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionMetadata {
    /// 当前 schema 版本（字符串形式，如 "1.2.0"）
    pub current_version: String,
    /// 最近一次成功迁移的时间
    #[serde(default)]
    pub last_migration_at: Option<DateTime<Utc>>,
}

impl VersionMetadata {
    /// 从文件加载；文件不存在时返回 `None`（全新安装）
    pub fn load(path: &Path) -> Result<Option<Self>, MigrationError> {
        if !path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(path)?;
        let metadata = serde_json::from_str(&content).map_err(|e| {
            MigrationError::Metadata(format!("解析版本元数据失败 {}: {}", path.display(), e))
        })?;
        Ok(Some(metadata))
    }

    /// 原子保存到文件
    pub fn save(&self, path: &Path) -> Result<(), MigrationError> {
        write_json_atomic(path, self).map_err(|e| {
            MigrationError::Metadata(format!("写入版本元数据失败 {}: {}", path.display(), e))
        })
    }
}

/// 迁移状态概览
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MigrationStatus {
    pub current: Version,
    pub latest: Version,
    /// 当前版本与最新版本之间相差的受支持版本数
    pub versions_behind: usize,
}

/// 版本注册表
#[derive(Debug)]
pub struct VersionRegistry {
    /// 元数据文件路径
    metadata_path: PathBuf,
    /// 独占持有的元数据记录（`None` 表示全新安装）
    metadata: Option<VersionMetadata>,
    /// 已解析的当前版本（与 `metadata` 保持一致）
    current: Option<Version>,
    /// 支持的版本列表（严格递增）
    supported: Vec<Version>,
}

impl VersionRegistry {
    /// 使用已加载的元数据记录构造注册表
    pub fn new(
        metadata_path: PathBuf,
        metadata: Option<VersionMetadata>,
        supported: Vec<Version>,
    ) -> Result<Self, MigrationError> {
        if supported.is_empty() {
            return Err(MigrationError::Metadata(
                "支持的版本列表为空".to_string(),
            ));
        }
        if supported.windows(2).any(|pair| pair[0] >= pair[1]) {
            return Err(MigrationError::Metadata(
                "支持的版本列表必须严格递增".to_string(),
            ));
        }

        let current = match &metadata {
            Some(record) => Some(record.current_version.parse::<Version>().map_err(|e| {
                MigrationError::Metadata(format!("版本元数据损坏: {}", e))
            })?),
            None => None,
        };

        Ok(Self {
            metadata_path,
            metadata,
            current,
            supported,
        })
    }

    /// 从磁盘加载元数据并构造注册表
    pub fn open(
        metadata_path: impl Into<PathBuf>,
        supported: Vec<Version>,
    ) -> Result<Self, MigrationError> {
        let metadata_path = metadata_path.into();
        let metadata = VersionMetadata::load(&metadata_path)?;
        debug!(
            "[VersionRegistry] 加载版本元数据: {} ({:?})",
            metadata_path.display(),
            metadata.as_ref().map(|m| m.current_version.as_str())
        );
        Self::new(metadata_path, metadata, supported)
    }

    /// 当前版本；全新安装时为最低受支持版本
    pub fn current_version(&self) -> Version {
        self.current.unwrap_or_else(|| self.lowest_supported_version())
    }

    /// 是否为全新安装（没有任何版本元数据）
    pub fn is_fresh_install(&self) -> bool {
        self.metadata.is_none()
    }

    pub fn lowest_supported_version(&self) -> Version {
        self.supported[0]
    }

    pub fn latest_supported_version(&self) -> Version {
        self.supported[self.supported.len() - 1]
    }

    pub fn supported_versions(&self) -> &[Version] {
        &self.supported
    }

    pub fn is_supported(&self, version: Version) -> bool {
        self.supported.binary_search(&version).is_ok()
    }

    pub fn last_migration_at(&self) -> Option<DateTime<Utc>> {
        self.metadata.as_ref().and_then(|m| m.last_migration_at)
    }

    pub fn metadata_path(&self) -> &Path {
        &self.metadata_path
    }

    pub fn migration_needed(&self) -> bool {
        self.current_version() != self.latest_supported_version()
    }

    pub fn migration_status(&self) -> MigrationStatus {
        let current = self.current_version();
        let versions_behind = self.supported.iter().filter(|v| **v > current).count();
        MigrationStatus {
            current,
            latest: self.latest_supported_version(),
            versions_behind,
        }
    }

    /// 持久化新的当前版本
    ///
    /// 只有协调器（迁移校验通过后）和回滚管理器（人工恢复）会调用此方法。
    /// 先写盘，成功后再更新内存状态。
    pub fn set_version(&mut self, version: Version) -> Result<(), MigrationError> {
        if !self.is_supported(version) {
            return Err(MigrationError::UnsupportedVersion(version));
        }

        let record = VersionMetadata {
            current_version: version.to_string(),
            last_migration_at: Some(Utc::now()),
        };
        record.save(&self.metadata_path)?;

        info!(
            "[VersionRegistry] 版本指针更新: {} -> {}",
            self.current_version(),
            version
        );
        self.metadata = Some(record);
        self.current = Some(version);
        Ok(())
    }
}
