//! # Rollback Manager (回滚)
//!
//! 两种回滚入口：
//!
//! - `rollback_to`：迁移运行失败后自动调用，恢复本次运行的备份，版本指针保持不变
//! - `rollback_to_version`：人工 / 诊断触发，恢复到指定版本的最新活跃备份并重置版本指针

use tracing::{error, info, warn};

use super::MigrationError;
use crate::backup::{Backup, BackupManager};
use crate::store::StoreEngine;
use crate::version_registry::{Version, VersionRegistry};

/// 回滚管理器
#[derive(Debug, Clone, Copy, Default)]
pub struct RollbackManager;

impl RollbackManager {
    pub fn new() -> Self {
        Self
    }

    /// 用本次运行的备份恢复存储
    ///
    /// 成功返回 `RolledBack{cause}`，恢复失败返回 `RollbackFailed`。
    /// 两种情况都是运行的最终错误，不会再向上包装。
    pub fn rollback_to(
        &self,
        store: &mut dyn StoreEngine,
        backups: &BackupManager,
        backup: &Backup,
        cause: MigrationError,
    ) -> MigrationError {
        warn!(
            backup_id = %backup.id,
            "[Rollback] 迁移失败，恢复备份: {}",
            cause
        );

        match backups.restore(store, backup) {
            Ok(()) => {
                info!(backup_id = %backup.id, "[Rollback] 已恢复到迁移前状态");
                MigrationError::RolledBack {
                    cause: Box::new(cause),
                    backup_id: backup.id.clone(),
                }
            }
            Err(e) => {
                error!(
                    backup_id = %backup.id,
                    original_error = %cause,
                    "[Rollback] 恢复失败，数据需要人工恢复: {}",
                    e
                );
                MigrationError::RollbackFailed(format!(
                    "restoring backup {} failed: {} (original error: {})",
                    backup.id, e, cause
                ))
            }
        }
    }

    /// 恢复到 `target` 版本的最新活跃备份，并把版本指针设为 `target`
    pub fn rollback_to_version(
        &self,
        store: &mut dyn StoreEngine,
        backups: &BackupManager,
        registry: &mut VersionRegistry,
        target: Version,
    ) -> Result<Backup, MigrationError> {
        if !registry.is_supported(target) {
            return Err(MigrationError::UnsupportedVersion(target));
        }

        let backup = backups
            .find_latest_for_version(target)
            .map_err(MigrationError::from)?
            .ok_or(MigrationError::NoBackupAvailable { version: target })?;

        info!(
            backup_id = %backup.id,
            "[Rollback] 人工回滚: {} -> {}",
            registry.current_version(),
            target
        );
        backups.restore(store, &backup).map_err(|e| {
            error!(backup_id = %backup.id, "[Rollback] 人工回滚恢复失败: {}", e);
            MigrationError::RollbackFailed(format!("restoring backup {} failed: {}", backup.id, e))
        })?;

        registry.set_version(target).map_err(|e| {
            error!(
                backup_id = %backup.id,
                "[Rollback] 数据已恢复到 {} 但版本指针写入失败，存储与元数据不一致: {}",
                target,
                e
            );
            MigrationError::RollbackFailed(format!(
                "restored backup {} but recording version {} failed: {}",
                backup.id, target, e
            ))
        })?;
        Ok(backup)
    }
}
