//! # Migration 模块
//!
//! 本地财务数据的版本化迁移框架：计划、备份、执行、校验、回滚。
//!
//! ---
//!
//! # ⚠️ 迁移步骤编写规范（必读）
//!
//! ## 核心原则
//!
//! 1. **事务原子性**：每个步骤的 SQL 脚本 / 数据变换在单个事务中执行，失败自动回滚
//! 2. **局部补偿**：除 hop 的第一个步骤外，每个步骤都必须声明 `rollback`
//! 3. **幂等设计**：补偿动作使用 `IF EXISTS`，可以在任意中间状态下安全执行
//! 4. **永不修改历史**：已发布的 hop 不可修改，通过新 hop 修复问题
//!
//! ## 表重建模板（SQLite 不支持修改列约束）
//!
//! ```sql
//! DROP TABLE IF EXISTS target_new;      -- 中间状态清理
//! CREATE TABLE target_new (...);        -- 新结构
//! INSERT INTO target_new SELECT ...;    -- 复制数据
//! DROP TABLE target;                    -- 替换表
//! ALTER TABLE target_new RENAME TO target;
//! CREATE INDEX IF NOT EXISTS ...;       -- 重建索引
//! ```
//!
//! ## 组件
//!
//! - `definitions`: 步骤 / hop / 目录声明
//! - `wealthwise`: WealthWise 各版本的 hop 声明
//! - `planner`: 版本区间 → 扁平化迁移计划
//! - `executor`: 按顺序执行步骤并上报进度
//! - `verifier`: 迁移后结构性校验
//! - `rollback`: 从备份恢复
//! - `state`: 单次运行的状态机与进度上报
//! - `coordinator`: `ensure_up_to_date` 入口
//!
//! ## 使用示例
//!
//! ```rust,ignore
//! use wealthwise_migration::migration::MigrationCoordinator;
//!
//! let coordinator = MigrationCoordinator::new(config, Box::new(store), catalog)?;
//! let outcome = coordinator.ensure_up_to_date(&|fraction, message| {
//!     println!("{:>5.1}% {}", fraction * 100.0, message);
//! })?;
//! ```

// ============================================================================
// 子模块
// ============================================================================

pub mod coordinator;
pub mod definitions;
pub mod executor;
pub mod planner;
pub mod rollback;
pub mod state;
pub mod verifier;
pub mod wealthwise;

// ============================================================================
// Re-exports
// ============================================================================

pub use coordinator::{MigrationCoordinator, RunOutcome};
pub use definitions::{
    CatalogError, CountBound, HopChecks, HopDecl, MigrationCatalog, MigrationStep,
    ReferenceCheck, RequiredField, SchemaChange, StepAction, Strategy, TransformId,
    ValidationSpec,
};
pub use executor::{ExecutionReport, MigrationExecutor, RunLease};
pub use planner::{MigrationPlan, MigrationPlanner, PlannedHop};
pub use rollback::RollbackManager;
pub use state::{
    MigrationProgress, ProgressFn, ProgressReporter, RunContext, RunState, RunStateMachine,
};
pub use verifier::{CountSnapshot, ValidationResult, Validator};

use crate::store::StoreError;
use crate::version_registry::Version;

// ============================================================================
// 错误类型
// ============================================================================

/// 迁移错误
#[derive(Debug, thiserror::Error)]
pub enum MigrationError {
    #[error("Unsupported data version {0}: this build of the app cannot read it")]
    UnsupportedVersion(Version),

    #[error("Cannot migrate from {from} to {to}: {reason}")]
    IncompatibleVersion {
        from: Version,
        to: Version,
        reason: String,
    },

    #[error("Insufficient disk space: {available_mb}MB available, need at least {required_mb}MB. Please free up disk space and retry.")]
    InsufficientStorage { available_mb: u64, required_mb: u64 },

    #[error("Backup failed: {0}")]
    BackupFailed(String),

    #[error("Migration step '{step}' failed: {reason}")]
    MigrationFailed { step: String, reason: String },

    #[error("Post-migration validation failed: {}", .issues.join("; "))]
    ValidationFailed { issues: Vec<String> },

    #[error("Migration rolled back to backup {backup_id}: {cause}")]
    RolledBack {
        cause: Box<MigrationError>,
        backup_id: String,
    },

    #[error("Rollback failed, manual recovery required: {0}")]
    RollbackFailed(String),

    #[error("A migration is already in progress")]
    MigrationAlreadyInProgress,

    #[error("No backup available for version {version}")]
    NoBackupAvailable { version: Version },

    #[error("Invalid migration catalog: {0}")]
    Catalog(#[from] CatalogError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Version metadata error: {0}")]
    Metadata(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl MigrationError {
    /// 自动回滚后的原始错误；其他错误返回自身
    pub fn cause(&self) -> &MigrationError {
        match self {
            MigrationError::RolledBack { cause, .. } => cause.cause(),
            other => other,
        }
    }

    /// 数据已恢复到迁移前状态，应用可以继续以旧版本运行（或稍后重试）
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            MigrationError::RolledBack { .. }
                | MigrationError::InsufficientStorage { .. }
                | MigrationError::BackupFailed(_)
                | MigrationError::MigrationAlreadyInProgress
        )
    }

    /// 数据处于未知状态，需要用户介入（导出 / 联系支持）
    pub fn requires_manual_recovery(&self) -> bool {
        matches!(self, MigrationError::RollbackFailed(_))
    }
}

// ============================================================================
// 测试
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rolled_back_exposes_original_cause() {
        let err = MigrationError::RolledBack {
            cause: Box::new(MigrationError::MigrationFailed {
                step: "compute_current_balances".to_string(),
                reason: "disk I/O error".to_string(),
            }),
            backup_id: "20260301_101500_ab12cd34_123".to_string(),
        };

        assert!(matches!(
            err.cause(),
            MigrationError::MigrationFailed { step, .. } if step == "compute_current_balances"
        ));
        assert!(err.is_recoverable());
        assert!(!err.requires_manual_recovery());
        assert!(err.to_string().contains("compute_current_balances"));
    }

    #[test]
    fn test_validation_failed_message_lists_issues() {
        let err = MigrationError::ValidationFailed {
            issues: vec![
                "transactions: 3 records, expected at least 5".to_string(),
                "accounts.current_balance_paise: 2 records missing".to_string(),
            ],
        };
        let message = err.to_string();
        assert!(message.contains("expected at least 5"));
        assert!(message.contains("; accounts.current_balance_paise"));
    }

    #[test]
    fn test_classification() {
        assert!(MigrationError::RollbackFailed("checksum mismatch".into()).requires_manual_recovery());
        assert!(!MigrationError::UnsupportedVersion(Version::new(9, 0, 0)).is_recoverable());
        assert!(MigrationError::InsufficientStorage {
            available_mb: 10,
            required_mb: 200
        }
        .is_recoverable());
    }
}
