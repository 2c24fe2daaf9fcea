//! # Migration Coordinator (迁移协调器)
//!
//! 宿主应用的入口。启动时调用 `ensure_up_to_date()`：
//!
//! ```text
//! 获取运行锁 → 读取版本 → 已是最新：宽限期清理后返回
//!           → 计划 → 预检（磁盘空间）→ 全新安装时建基线 → 迁移前计数
//!           → BackingUp → Executing → Validating → 提交版本 → Committed
//!                 │            │           │
//!                 ▼            └─────┬─────┘
//!          FailedNoBackup      从备份恢复 → RolledBack / RollbackFailed
//! ```
//!
//! 版本指针只在校验通过后更新；任何失败都不会让指针与数据不一致。

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::definitions::MigrationCatalog;
use super::executor::{MigrationExecutor, RunLease};
use super::planner::{MigrationPlan, MigrationPlanner};
use super::rollback::RollbackManager;
use super::state::{ProgressFn, RunContext, RunState};
use super::verifier::{CountSnapshot, Validator};
use super::MigrationError;
use crate::audit::{RunEventKind, RunLog};
use crate::backup::{Backup, BackupManager};
use crate::backup_common::get_available_disk_space;
use crate::config::EngineConfig;
use crate::store::StoreEngine;
use crate::version_registry::{MigrationStatus, Version, VersionRegistry};

/// 迁移期间需要的空间 = 存储大小 × 2（备份 + 重建余量）+ 配置余量
const PREFLIGHT_SIZE_FACTOR: u64 = 2;

/// 单次 `ensure_up_to_date` 的结果摘要
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunOutcome {
    pub run_id: String,
    pub from: Version,
    pub to: Version,
    pub final_state: RunState,
    /// 本次运行创建的备份
    pub backup_id: Option<String>,
    pub duration_ms: u64,
    /// 已是最新版本时为 `false`
    pub migrated: bool,
}

/// 迁移协调器
pub struct MigrationCoordinator {
    config: EngineConfig,
    catalog: Arc<MigrationCatalog>,
    registry: Mutex<VersionRegistry>,
    store: Mutex<Box<dyn StoreEngine>>,
    backups: BackupManager,
    planner: MigrationPlanner,
    executor: MigrationExecutor,
    validator: Validator,
    rollback: RollbackManager,
    run_log: RunLog,
}

impl MigrationCoordinator {
    pub fn new(
        config: EngineConfig,
        mut store: Box<dyn StoreEngine>,
        catalog: MigrationCatalog,
    ) -> Result<Self, MigrationError> {
        let catalog = Arc::new(catalog);
        let registry = VersionRegistry::open(
            config.version_path(),
            catalog.supported_versions().to_vec(),
        )?;
        if !store.is_open() {
            store.open()?;
        }

        let backups = BackupManager::new(config.backup_dir(), config.free_space_margin_bytes());
        let run_log = match config.run_log_path() {
            Some(path) => RunLog::open(path),
            None => RunLog::disabled(),
        };

        info!(
            "[MigrationCoordinator] 初始化: store={}, current={}, latest={}",
            store.location().display(),
            registry.current_version(),
            catalog.latest_version()
        );

        Ok(Self {
            planner: MigrationPlanner::new(Arc::clone(&catalog)),
            config,
            catalog,
            registry: Mutex::new(registry),
            store: Mutex::new(store),
            backups,
            executor: MigrationExecutor::new(),
            validator: Validator::new(),
            rollback: RollbackManager::new(),
            run_log,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn catalog(&self) -> &MigrationCatalog {
        &self.catalog
    }

    pub fn run_log(&self) -> &RunLog {
        &self.run_log
    }

    /// 是否有迁移正在运行
    pub fn is_running(&self) -> bool {
        self.executor.is_running()
    }

    // ========================================================================
    // 入口
    // ========================================================================

    /// 把存储迁移到最新受支持版本
    pub fn ensure_up_to_date(&self, progress: &ProgressFn<'_>) -> Result<RunOutcome, MigrationError> {
        let lease = self.executor.try_lock()?;
        let mut registry = lock(&self.registry, "registry")?;
        let mut store_guard = lock(&self.store, "store")?;
        let store: &mut dyn StoreEngine = &mut **store_guard;
        if !store.is_open() {
            store.open()?;
        }

        let start = Instant::now();
        let current = registry.current_version();
        if !registry.is_supported(current) {
            error!(
                "[MigrationCoordinator] 数据版本 {} 不受当前程序支持（可能是降级安装）",
                current
            );
            return Err(MigrationError::UnsupportedVersion(current));
        }
        let target = registry.latest_supported_version();

        if current == target {
            self.infer_baseline_if_fresh(&registry, store)?;
            debug!("[MigrationCoordinator] 数据已是最新版本 {}", current);
            self.prune_after_grace_period(&registry);
            progress(1.0, "Data is up to date");
            return Ok(RunOutcome {
                run_id: Uuid::new_v4().to_string(),
                from: current,
                to: current,
                final_state: RunState::Committed,
                backup_id: None,
                duration_ms: start.elapsed().as_millis() as u64,
                migrated: false,
            });
        }

        let plan = self.planner.plan(current, target)?;
        info!("[MigrationCoordinator] 迁移计划: {}", plan.describe());

        self.preflight_disk_space_check(store)?;
        self.infer_baseline_if_fresh(&registry, store)?;
        let before = self.validator.capture_counts(&plan, store)?;

        let run_id = Uuid::new_v4().to_string();
        let mut ctx = RunContext::new(run_id.clone(), progress, &self.run_log);
        ctx.record(RunEventKind::RunStarted {
            from: plan.from(),
            to: plan.to(),
            strategy: plan.strategy().as_str().to_string(),
            step_count: plan.steps().len(),
            plan: plan.describe(),
        });

        let result = self.run_plan(&plan, store, &mut registry, &mut ctx, &before, &lease);
        let duration_ms = start.elapsed().as_millis() as u64;
        ctx.record(RunEventKind::RunFinished {
            final_state: ctx.state(),
            duration_ms,
            error: result.as_ref().err().map(|e| e.to_string()),
        });

        match result {
            Ok(backup) => {
                info!(
                    run_id = %run_id,
                    "[MigrationCoordinator] 迁移完成: {} -> {}, 耗时 {}ms",
                    plan.from(),
                    plan.to(),
                    duration_ms
                );
                Ok(RunOutcome {
                    run_id,
                    from: plan.from(),
                    to: plan.to(),
                    final_state: ctx.state(),
                    backup_id: Some(backup.id),
                    duration_ms,
                    migrated: true,
                })
            }
            Err(e) => {
                error!(
                    run_id = %run_id,
                    final_state = %ctx.state(),
                    "[MigrationCoordinator] 迁移失败: {}",
                    e
                );
                Err(e)
            }
        }
    }

    /// 备份 → 执行 → 校验 → 提交；执行 / 校验阶段的失败会从备份恢复
    fn run_plan(
        &self,
        plan: &MigrationPlan,
        store: &mut dyn StoreEngine,
        registry: &mut VersionRegistry,
        ctx: &mut RunContext<'_>,
        before: &CountSnapshot,
        lease: &RunLease,
    ) -> Result<Backup, MigrationError> {
        let backup = match self.executor.backup(plan, store, &self.backups, ctx, lease) {
            Ok(backup) => backup,
            Err(e) => {
                if ctx.state() == RunState::BackingUp {
                    ctx.advance(RunState::FailedNoBackup)?;
                }
                return Err(e);
            }
        };

        match self.execute_and_commit(plan, store, registry, ctx, before, lease) {
            Ok(()) => Ok(backup),
            Err(cause) => {
                let outcome = self.rollback.rollback_to(store, &self.backups, &backup, cause);
                let terminal = if matches!(outcome, MigrationError::RolledBack { .. }) {
                    RunState::RolledBack
                } else {
                    RunState::RollbackFailed
                };
                if let Err(e) = ctx.advance(terminal) {
                    warn!(run_id = %ctx.run_id(), "[MigrationCoordinator] {}", e);
                }
                Err(outcome)
            }
        }
    }

    fn execute_and_commit(
        &self,
        plan: &MigrationPlan,
        store: &mut dyn StoreEngine,
        registry: &mut VersionRegistry,
        ctx: &mut RunContext<'_>,
        before: &CountSnapshot,
        lease: &RunLease,
    ) -> Result<(), MigrationError> {
        self.executor.execute(plan, store, ctx, lease)?;

        ctx.advance(RunState::Validating)?;
        ctx.report(0.9, "Validating migrated data");
        let result = self.validator.validate(plan, store, before)?;
        if !result.is_valid {
            for issue in &result.issues {
                ctx.record(RunEventKind::ValidationIssue {
                    issue: issue.clone(),
                });
            }
            return Err(MigrationError::ValidationFailed {
                issues: result.issues,
            });
        }

        registry.set_version(plan.to())?;
        ctx.advance(RunState::Committed)?;
        ctx.report(1.0, &format!("Data migrated to {}", plan.to()));
        Ok(())
    }

    /// 迁移前磁盘空间预检（不修改任何数据）
    fn preflight_disk_space_check(&self, store: &dyn StoreEngine) -> Result<(), MigrationError> {
        let store_size = store.size_on_disk()?;
        let required_bytes = store_size
            .saturating_mul(PREFLIGHT_SIZE_FACTOR)
            .saturating_add(self.config.free_space_margin_bytes());

        let available = match get_available_disk_space(&self.config.data_dir) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("[MigrationCoordinator] 无法获取磁盘可用空间，跳过预检: {}", e);
                u64::MAX
            }
        };

        let required_mb = required_bytes / (1024 * 1024);
        let available_mb = available / (1024 * 1024);
        if available < required_bytes {
            error!(
                available_mb = available_mb,
                required_mb = required_mb,
                store_size_mb = store_size / (1024 * 1024),
                "[MigrationCoordinator] 磁盘空间不足，无法安全执行迁移"
            );
            return Err(MigrationError::InsufficientStorage {
                available_mb,
                required_mb,
            });
        }

        debug!(
            available_mb = available_mb,
            required_mb = required_mb,
            "[MigrationCoordinator] 磁盘空间预检查通过"
        );
        Ok(())
    }

    /// 全新安装时按基线版本建出集合；必须在预检查之后调用，预检查失败不能改动存储
    fn infer_baseline_if_fresh(
        &self,
        registry: &VersionRegistry,
        store: &mut dyn StoreEngine,
    ) -> Result<(), MigrationError> {
        if !registry.is_fresh_install() {
            return Ok(());
        }
        let created = store.infer_schema(self.catalog.baseline())?;
        info!(
            "[MigrationCoordinator] 全新安装，基线 {} 创建 {} 个对象",
            registry.current_version(),
            created
        );
        Ok(())
    }

    /// 上次迁移超过宽限期后按保留策略清理备份；失败只记录警告
    fn prune_after_grace_period(&self, registry: &VersionRegistry) {
        let Some(last_migration_at) = registry.last_migration_at() else {
            return;
        };
        if Utc::now() - last_migration_at < self.config.prune_grace_period() {
            debug!(
                "[MigrationCoordinator] 仍在清理宽限期内（上次迁移 {}）",
                last_migration_at.to_rfc3339()
            );
            return;
        }
        match self.backups.prune(&self.config.retention_policy()) {
            Ok(deleted) if !deleted.is_empty() => {
                info!("[MigrationCoordinator] 宽限期后清理备份: {:?}", deleted)
            }
            Ok(_) => {}
            Err(e) => warn!("[MigrationCoordinator] 清理备份失败: {}", e),
        }
    }

    // ========================================================================
    // 查询 / 运维
    // ========================================================================

    pub fn migration_status(&self) -> Result<MigrationStatus, MigrationError> {
        Ok(lock(&self.registry, "registry")?.migration_status())
    }

    /// 活跃备份（未被回滚消费），最新的在前
    pub fn list_backups(&self) -> Result<Vec<Backup>, MigrationError> {
        Ok(self.backups.list_backups()?)
    }

    /// 全部备份（含已消费）
    pub fn list_all_backups(&self) -> Result<Vec<Backup>, MigrationError> {
        Ok(self.backups.list_all_backups()?)
    }

    /// 备份目录占用的磁盘空间（字节）
    pub fn backup_storage_bytes(&self) -> u64 {
        self.backups.total_size()
    }

    /// 人工回滚到指定版本的最新活跃备份
    pub fn rollback_to_version(&self, target: Version) -> Result<Backup, MigrationError> {
        let _lease = self.executor.try_lock()?;
        let mut registry = lock(&self.registry, "registry")?;
        let mut store_guard = lock(&self.store, "store")?;
        let store: &mut dyn StoreEngine = &mut **store_guard;
        if !store.is_open() {
            store.open()?;
        }

        let backup =
            self.rollback
                .rollback_to_version(store, &self.backups, &mut registry, target)?;
        self.run_log.record(
            &Uuid::new_v4().to_string(),
            RunEventKind::ManualRollback {
                target,
                backup_id: backup.id.clone(),
            },
        );
        Ok(backup)
    }

    /// 立即按保留策略清理备份（迁移运行中拒绝执行）
    pub fn prune_backups(&self) -> Result<Vec<String>, MigrationError> {
        let _lease = self.executor.try_lock()?;
        Ok(self.backups.prune(&self.config.retention_policy())?)
    }

    /// 在运行锁之外访问存储（诊断 / 测试用）
    ///
    /// 迁移运行中返回 `MigrationAlreadyInProgress`。
    pub fn with_store<R>(
        &self,
        f: impl FnOnce(&mut dyn StoreEngine) -> R,
    ) -> Result<R, MigrationError> {
        let _lease = self.executor.try_lock()?;
        let mut store_guard = lock(&self.store, "store")?;
        Ok(f(&mut **store_guard))
    }
}

impl std::fmt::Debug for MigrationCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MigrationCoordinator")
            .field("data_dir", &self.config.data_dir)
            .field("latest", &self.catalog.latest_version())
            .field("running", &self.is_running())
            .finish()
    }
}

fn lock<'a, T: ?Sized>(
    mutex: &'a Mutex<T>,
    name: &str,
) -> Result<MutexGuard<'a, T>, MigrationError> {
    mutex
        .lock()
        .map_err(|_| MigrationError::Internal(format!("{} lock poisoned", name)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SqliteStore;
    use tempfile::TempDir;

    fn coordinator(dir: &TempDir) -> MigrationCoordinator {
        let config = EngineConfig::for_data_dir(dir.path());
        let store = SqliteStore::new(config.store_path());
        MigrationCoordinator::new(config, Box::new(store), MigrationCatalog::wealthwise().unwrap())
            .unwrap()
    }

    #[test]
    fn test_fresh_install_migrates_to_latest() {
        let dir = TempDir::new().unwrap();
        let coordinator = coordinator(&dir);

        let outcome = coordinator.ensure_up_to_date(&|_, _| {}).unwrap();
        assert!(outcome.migrated);
        assert_eq!(outcome.final_state, RunState::Committed);
        assert_eq!(outcome.to, coordinator.catalog().latest_version());

        let status = coordinator.migration_status().unwrap();
        assert_eq!(status.versions_behind, 0);
    }

    #[test]
    fn test_second_call_is_a_no_op() {
        let dir = TempDir::new().unwrap();
        let coordinator = coordinator(&dir);
        coordinator.ensure_up_to_date(&|_, _| {}).unwrap();

        let outcome = coordinator.ensure_up_to_date(&|_, _| {}).unwrap();
        assert!(!outcome.migrated);
        assert_eq!(outcome.from, outcome.to);
        assert_eq!(outcome.backup_id, None);
        assert_eq!(coordinator.list_backups().unwrap().len(), 1);
    }

    #[test]
    fn test_downgraded_metadata_is_unsupported() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("version.json"),
            r#"{"current_version":"2.0.0","last_migration_at":null}"#,
        )
        .unwrap();
        let coordinator = coordinator(&dir);

        let err = coordinator.ensure_up_to_date(&|_, _| {}).unwrap_err();
        assert!(matches!(
            err,
            MigrationError::UnsupportedVersion(v) if v == Version::new(2, 0, 0)
        ));
    }

    #[test]
    fn test_operations_refused_while_running() {
        let dir = TempDir::new().unwrap();
        let coordinator = coordinator(&dir);
        let _lease = coordinator.executor.try_lock().unwrap();

        assert!(matches!(
            coordinator.ensure_up_to_date(&|_, _| {}),
            Err(MigrationError::MigrationAlreadyInProgress)
        ));
        assert!(matches!(
            coordinator.prune_backups(),
            Err(MigrationError::MigrationAlreadyInProgress)
        ));
        assert!(coordinator.is_running());
    }
}
