//! # Backup 模块
//!
//! 迁移前快照的创建、校验、恢复与保留策略。
//!
//! ## 设计原则
//!
//! 1. **一致性**：快照由存储引擎生成（SQLite 使用 Online Backup API）
//! 2. **可验证**：所有快照文件的 SHA256 聚合为一个校验和，写入清单和独立的 `checksum.sha256`
//! 3. **不可变**：清单写入后不再修改；回滚消费通过单独的 `CONSUMED` 标记文件记录
//! 4. **先验后用**：恢复前重新计算校验和，损坏的备份永远不会覆盖当前数据
//!
//! ## 目录结构
//!
//! ```text
//! backups/
//! └── 20260301_101500_ab12cd34_123/
//!     ├── wealthwise.db
//!     ├── manifest.json
//!     ├── checksum.sha256
//!     └── CONSUMED          (仅在被回滚使用后出现)
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::backup_common::{
    calculate_files_checksum, directory_size, get_available_disk_space, log_and_skip_entry_err,
    write_bytes_atomic, write_json_atomic,
};
use crate::migration::MigrationError;
use crate::store::{StoreEngine, StoreError};
use crate::version_registry::Version;

/// 清单文件名
const MANIFEST_FILENAME: &str = "manifest.json";

/// 校验和旁路文件名
const CHECKSUM_FILENAME: &str = "checksum.sha256";

/// 回滚消费标记
const CONSUMED_MARKER: &str = "CONSUMED";

/// 备份所需空间 = 存储大小 × 1.2 + 余量
const BACKUP_SPACE_FACTOR: f64 = 1.2;

/// 生成带时间戳前缀的备份 ID（目录名）
///
/// 仅包含 `[0-9a-z_]`，按字典序即按时间排序。
fn generate_backup_id_at(now: DateTime<Utc>) -> String {
    let timestamp = now.format("%Y%m%d_%H%M%S").to_string();
    let millis = now.timestamp_subsec_millis();
    let rand8 = &Uuid::new_v4().simple().to_string()[..8];
    format!("{}_{}_{:03}", timestamp, rand8, millis)
}

/// 单个备份的元数据（即 `manifest.json` 的内容）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Backup {
    /// 备份 ID（与目录名一致）
    pub id: String,
    pub created_at: DateTime<Utc>,
    /// 备份时存储所处的版本
    pub source_version: Version,
    /// 备份目录
    pub storage_location: PathBuf,
    /// 所有快照文件的聚合 SHA256
    pub checksum: String,
    /// 存储的逻辑内容校验和（恢复后用于比对）
    pub content_checksum: String,
    pub size_bytes: u64,
    /// 快照文件名（相对于备份目录）
    pub files: Vec<String>,
}

impl Backup {
    fn file_paths(&self) -> Vec<PathBuf> {
        self.files
            .iter()
            .map(|name| self.storage_location.join(name))
            .collect()
    }
}

/// 备份保留策略
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    /// 超过此时长的活跃备份可被清理
    pub max_age: chrono::Duration,
    /// 无论多旧，始终保留最新的 N 个活跃备份
    pub keep_latest: usize,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            max_age: chrono::Duration::days(30),
            keep_latest: 3,
        }
    }
}

/// 备份错误
#[derive(Debug, thiserror::Error)]
pub enum BackupError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Insufficient disk space for backup: {available} bytes available, {required} bytes required")]
    InsufficientSpace { available: u64, required: u64 },

    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("Manifest error: {0}")]
    Manifest(String),

    #[error("Backup not found: {0}")]
    NotFound(String),

    #[error("Backup directory error: {0}")]
    BackupDirectory(String),

    #[error("Backup {0} failed verification")]
    Corrupted(String),
}

impl From<BackupError> for MigrationError {
    fn from(err: BackupError) -> Self {
        MigrationError::BackupFailed(err.to_string())
    }
}

/// 备份管理器
#[derive(Debug, Clone)]
pub struct BackupManager {
    /// 备份根目录
    backup_dir: PathBuf,
    /// 空间检查的固定余量（字节）
    free_space_margin: u64,
}

impl BackupManager {
    pub fn new(backup_dir: PathBuf, free_space_margin: u64) -> Self {
        Self {
            backup_dir,
            free_space_margin,
        }
    }

    pub fn backup_dir(&self) -> &Path {
        &self.backup_dir
    }

    /// 创建一个新的、不会与现有备份冲突的备份子目录
    ///
    /// 使用 `create_dir` 而不是 `create_dir_all`，目录已存在时换一个 ID 重试。
    fn create_unique_backup_subdir(&self) -> Result<(String, PathBuf), BackupError> {
        fs::create_dir_all(&self.backup_dir)?;

        for _ in 0..10 {
            let backup_id = generate_backup_id_at(Utc::now());
            let backup_subdir = self.backup_dir.join(&backup_id);

            match fs::create_dir(&backup_subdir) {
                Ok(()) => return Ok((backup_id, backup_subdir)),
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(BackupError::Io(e)),
            }
        }

        Err(BackupError::BackupDirectory(
            "无法生成唯一备份目录（多次尝试均冲突）".to_string(),
        ))
    }

    /// 备份所需的磁盘空间（字节）
    pub fn required_space(&self, store_size: u64) -> u64 {
        (store_size as f64 * BACKUP_SPACE_FACTOR).ceil() as u64 + self.free_space_margin
    }

    // ========================================================================
    // 创建
    // ========================================================================

    /// 创建完整备份
    ///
    /// 空间不足、复制失败或写入后校验不通过都会返回错误；
    /// 失败时已创建的备份目录会被删除，不会留下半成品。
    pub fn create_backup(
        &self,
        store: &mut dyn StoreEngine,
        source_version: Version,
    ) -> Result<Backup, BackupError> {
        let store_size = store.size_on_disk()?;
        let required = self.required_space(store_size);
        fs::create_dir_all(&self.backup_dir)?;
        let available = get_available_disk_space(&self.backup_dir)?;
        if available < required {
            warn!(
                "[Backup] 磁盘空间不足: available={} required={}",
                available, required
            );
            return Err(BackupError::InsufficientSpace {
                available,
                required,
            });
        }

        let (backup_id, backup_subdir) = self.create_unique_backup_subdir()?;
        match self.write_backup(store, &backup_id, &backup_subdir, source_version) {
            Ok(backup) => {
                info!(
                    backup_id = %backup.id,
                    source_version = %backup.source_version,
                    size_bytes = backup.size_bytes,
                    "[Backup] 备份完成"
                );
                Ok(backup)
            }
            Err(e) => {
                warn!("[Backup] 备份失败，清理目录 {}: {}", backup_subdir.display(), e);
                if let Err(cleanup) = fs::remove_dir_all(&backup_subdir) {
                    warn!("[Backup] 清理失败的备份目录出错: {}", cleanup);
                }
                Err(e)
            }
        }
    }

    fn write_backup(
        &self,
        store: &mut dyn StoreEngine,
        backup_id: &str,
        backup_subdir: &Path,
        source_version: Version,
    ) -> Result<Backup, BackupError> {
        let copied = store.copy_files(backup_subdir)?;
        let checksum = calculate_files_checksum(&copied)?;
        let content_checksum = store.content_checksum()?;

        let mut files = Vec::with_capacity(copied.len());
        let mut size_bytes = 0u64;
        for path in &copied {
            size_bytes += fs::metadata(path)?.len();
            let name = path
                .strip_prefix(backup_subdir)
                .map_err(|_| {
                    BackupError::BackupDirectory(format!(
                        "快照文件不在备份目录内: {}",
                        path.display()
                    ))
                })?
                .to_string_lossy()
                .to_string();
            files.push(name);
        }

        let backup = Backup {
            id: backup_id.to_string(),
            created_at: Utc::now(),
            source_version,
            storage_location: backup_subdir.to_path_buf(),
            checksum: checksum.clone(),
            content_checksum,
            size_bytes,
            files,
        };

        write_json_atomic(&backup_subdir.join(MANIFEST_FILENAME), &backup)?;
        write_bytes_atomic(
            &backup_subdir.join(CHECKSUM_FILENAME),
            format!("{}\n", checksum).as_bytes(),
        )?;

        // 写入后立即复核，确保备份可用
        if !self.verify(&backup)? {
            return Err(BackupError::Corrupted(backup.id));
        }
        Ok(backup)
    }

    // ========================================================================
    // 校验 / 恢复
    // ========================================================================

    /// 重新计算校验和并与清单、旁路文件比对
    ///
    /// 文件缺失或校验和不一致返回 `Ok(false)`。
    pub fn verify(&self, backup: &Backup) -> Result<bool, BackupError> {
        let paths = backup.file_paths();
        if let Some(missing) = paths.iter().find(|p| !p.is_file()) {
            warn!("[Backup] 备份文件缺失: {}", missing.display());
            return Ok(false);
        }

        let sidecar_path = backup.storage_location.join(CHECKSUM_FILENAME);
        let sidecar = match fs::read_to_string(&sidecar_path) {
            Ok(content) => content.trim().to_string(),
            Err(e) => {
                warn!("[Backup] 读取校验和文件失败 {}: {}", sidecar_path.display(), e);
                return Ok(false);
            }
        };
        if sidecar != backup.checksum {
            warn!(
                "[Backup] 校验和文件与清单不一致: {} (manifest={}, sidecar={})",
                backup.id, backup.checksum, sidecar
            );
            return Ok(false);
        }

        let actual = calculate_files_checksum(&paths)?;
        if actual != backup.checksum {
            warn!(
                "[Backup] 校验和不匹配: {} expected={} actual={}",
                backup.id, backup.checksum, actual
            );
            return Ok(false);
        }

        debug!("[Backup] 备份验证通过: {}", backup.id);
        Ok(true)
    }

    /// 用备份替换存储
    ///
    /// 校验失败时不会触碰存储。替换后执行引擎自检并比对内容校验和，
    /// 全部通过才把备份标记为已消费。
    pub fn restore(&self, store: &mut dyn StoreEngine, backup: &Backup) -> Result<(), BackupError> {
        if !self.verify(backup)? {
            return Err(BackupError::Corrupted(backup.id.clone()));
        }

        info!(
            backup_id = %backup.id,
            "[Backup] 开始恢复: {} <- {}",
            store.location().display(),
            backup.storage_location.display()
        );
        store.replace_files(&backup.storage_location)?;
        store.integrity_check()?;

        let actual = store.content_checksum()?;
        if actual != backup.content_checksum {
            return Err(BackupError::ChecksumMismatch {
                expected: backup.content_checksum.clone(),
                actual,
            });
        }

        if let Err(e) = self.mark_consumed(backup) {
            warn!("[Backup] 写入消费标记失败 {}: {}", backup.id, e);
        }
        info!(backup_id = %backup.id, "[Backup] 恢复完成");
        Ok(())
    }

    fn mark_consumed(&self, backup: &Backup) -> Result<(), BackupError> {
        write_bytes_atomic(
            &backup.storage_location.join(CONSUMED_MARKER),
            Utc::now().to_rfc3339().as_bytes(),
        )?;
        Ok(())
    }

    /// 是否已被回滚消费
    pub fn is_consumed(&self, backup: &Backup) -> bool {
        backup.storage_location.join(CONSUMED_MARKER).exists()
    }

    // ========================================================================
    // 查询 / 删除
    // ========================================================================

    /// 列出全部备份（含已消费），最新的在前
    pub fn list_all_backups(&self) -> Result<Vec<Backup>, BackupError> {
        let mut backups = Vec::new();
        if !self.backup_dir.exists() {
            return Ok(backups);
        }

        for entry in fs::read_dir(&self.backup_dir)?.filter_map(log_and_skip_entry_err) {
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            let manifest_path = path.join(MANIFEST_FILENAME);
            if !manifest_path.exists() {
                continue;
            }
            match Self::load_manifest(&manifest_path) {
                Ok(mut backup) => {
                    // 以实际目录为准，兼容被整体移动过的备份目录
                    if let Some(dir_name) = path.file_name().map(|n| n.to_string_lossy().to_string())
                    {
                        if backup.id != dir_name {
                            warn!(
                                "[Backup] 清单 id 与目录名不一致，以目录名为准: manifest.id={}, dir={}",
                                backup.id, dir_name
                            );
                            backup.id = dir_name;
                        }
                    }
                    backup.storage_location = path;
                    backups.push(backup);
                }
                Err(e) => {
                    warn!("[Backup] 无法加载备份清单 {}: {}", manifest_path.display(), e);
                }
            }
        }

        backups.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(backups)
    }

    /// 列出活跃备份（未被回滚消费），最新的在前
    pub fn list_backups(&self) -> Result<Vec<Backup>, BackupError> {
        Ok(self
            .list_all_backups()?
            .into_iter()
            .filter(|b| !self.is_consumed(b))
            .collect())
    }

    /// 备份目录占用的总字节数（含已消费的备份）
    pub fn total_size(&self) -> u64 {
        directory_size(&self.backup_dir)
    }

    /// 指定源版本的最新活跃备份
    pub fn find_latest_for_version(&self, version: Version) -> Result<Option<Backup>, BackupError> {
        Ok(self
            .list_backups()?
            .into_iter()
            .find(|b| b.source_version == version))
    }

    fn load_manifest(path: &Path) -> Result<Backup, BackupError> {
        let content = fs::read_to_string(path)?;
        serde_json::from_str(&content)
            .map_err(|e| BackupError::Manifest(format!("解析清单失败: {}", e)))
    }

    /// 删除指定的备份
    pub fn delete_backup(&self, backup_id: &str) -> Result<(), BackupError> {
        if backup_id.is_empty()
            || !backup_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            return Err(BackupError::NotFound(backup_id.to_string()));
        }
        let backup_subdir = self.backup_dir.join(backup_id);
        if !backup_subdir.is_dir() {
            return Err(BackupError::NotFound(backup_id.to_string()));
        }

        fs::remove_dir_all(&backup_subdir)?;
        info!("[Backup] 已删除备份: {}", backup_id);
        Ok(())
    }

    // ========================================================================
    // 保留策略
    // ========================================================================

    /// 按保留策略清理备份，返回被删除的备份 ID
    ///
    /// - 已消费的备份总是删除
    /// - 没有清单的目录（备份中途崩溃的残留）总是删除
    /// - 活跃备份中，最新的 `keep_latest` 个始终保留，其余超过 `max_age` 的删除
    ///
    /// 调用方必须保证此时没有迁移在运行。
    pub fn prune(&self, policy: &RetentionPolicy) -> Result<Vec<String>, BackupError> {
        self.prune_at(policy, Utc::now())
    }

    pub(crate) fn prune_at(
        &self,
        policy: &RetentionPolicy,
        now: DateTime<Utc>,
    ) -> Result<Vec<String>, BackupError> {
        let mut deleted = Vec::new();
        if !self.backup_dir.exists() {
            return Ok(deleted);
        }

        for entry in fs::read_dir(&self.backup_dir)?.filter_map(log_and_skip_entry_err) {
            let path = entry.path();
            if path.is_dir() && !path.join(MANIFEST_FILENAME).exists() {
                match fs::remove_dir_all(&path) {
                    Ok(()) => info!("[Backup] 清理不完整的备份目录: {}", path.display()),
                    Err(e) => warn!("[Backup] 清理不完整的备份目录失败 {}: {}", path.display(), e),
                }
            }
        }

        let mut active_seen = 0usize;
        for backup in self.list_all_backups()? {
            let expired = if self.is_consumed(&backup) {
                true
            } else {
                active_seen += 1;
                active_seen > policy.keep_latest && now - backup.created_at > policy.max_age
            };
            if !expired {
                continue;
            }
            match self.delete_backup(&backup.id) {
                Ok(()) => deleted.push(backup.id),
                Err(e) => warn!("[Backup] 删除旧备份失败 {}: {}", backup.id, e),
            }
        }

        info!("[Backup] 清理旧备份完成，删除 {} 个", deleted.len());
        Ok(deleted)
    }
}
