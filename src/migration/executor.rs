//! # Migration Executor (迁移执行)
//!
//! 按计划顺序执行迁移：
//!
//! 1. `backup`：进入 `BackingUp`，创建完整备份（进度 0.1）
//! 2. `execute`：进入 `Executing`，逐个 hop 先执行追加式 schema 推断，再执行自定义步骤
//!
//! 步骤失败时只执行该步骤自身的补偿动作，然后停止；整库恢复由调用方负责。
//! 同一存储同时只允许一次运行（单许可信号量）。

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{error, info, warn};

use super::definitions::StepAction;
use super::planner::MigrationPlan;
use super::state::{RunContext, RunState};
use super::MigrationError;
use crate::audit::RunEventKind;
use crate::backup::{Backup, BackupManager};
use crate::store::StoreEngine;

/// 备份完成时的进度
pub const PROGRESS_AFTER_BACKUP: f64 = 0.1;
/// 执行阶段占用的进度区间
pub const PROGRESS_EXECUTION_SPAN: f64 = 0.8;

/// 运行锁（持有期间其他运行无法开始）
#[derive(Debug)]
pub struct RunLease {
    _permit: OwnedSemaphorePermit,
}

/// 执行结果
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionReport {
    pub steps_completed: usize,
    /// 推断钩子实际创建的对象数
    pub objects_inferred: usize,
    pub duration_ms: u64,
}

/// 迁移执行器
#[derive(Debug, Clone)]
pub struct MigrationExecutor {
    lock: Arc<Semaphore>,
}

impl Default for MigrationExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl MigrationExecutor {
    pub fn new() -> Self {
        Self {
            lock: Arc::new(Semaphore::new(1)),
        }
    }

    /// 尝试获取运行锁，已有运行进行中时立即失败
    pub fn try_lock(&self) -> Result<RunLease, MigrationError> {
        let permit = Arc::clone(&self.lock)
            .try_acquire_owned()
            .map_err(|_| MigrationError::MigrationAlreadyInProgress)?;
        Ok(RunLease { _permit: permit })
    }

    /// 是否有运行持有锁
    pub fn is_running(&self) -> bool {
        self.lock.available_permits() == 0
    }

    // ========================================================================
    // 备份阶段
    // ========================================================================

    /// `NotStarted → BackingUp`，创建备份
    ///
    /// 失败统一映射为 `BackupFailed`，存储未被修改。
    pub fn backup(
        &self,
        plan: &MigrationPlan,
        store: &mut dyn StoreEngine,
        backups: &BackupManager,
        ctx: &mut RunContext<'_>,
        _lease: &RunLease,
    ) -> Result<Backup, MigrationError> {
        ctx.advance(RunState::BackingUp)?;
        ctx.report(0.0, &format!("Backing up data ({})", plan.from()));

        let backup = backups
            .create_backup(store, plan.from())
            .map_err(MigrationError::from)?;

        ctx.report(PROGRESS_AFTER_BACKUP, &format!("Backup {} created", backup.id));
        Ok(backup)
    }

    // ========================================================================
    // 执行阶段
    // ========================================================================

    /// `BackingUp → Executing`，按 hop 顺序执行
    pub fn execute(
        &self,
        plan: &MigrationPlan,
        store: &mut dyn StoreEngine,
        ctx: &mut RunContext<'_>,
        _lease: &RunLease,
    ) -> Result<ExecutionReport, MigrationError> {
        let start = Instant::now();
        ctx.advance(RunState::Executing)?;

        let total_steps = plan.steps().len();
        let total_hops = plan.hops().len();
        let mut objects_inferred = 0usize;

        for (hop_index, hop) in plan.hops().iter().enumerate() {
            if !hop.schema_changes.is_empty() {
                let created = store.infer_schema(hop.schema_changes).map_err(|e| {
                    error!(
                        run_id = %ctx.run_id(),
                        "[MigrationExecutor] {} -> {} schema 推断失败: {}",
                        hop.from,
                        hop.to,
                        e
                    );
                    MigrationError::MigrationFailed {
                        step: format!("infer_schema {} -> {}", hop.from, hop.to),
                        reason: e.to_string(),
                    }
                })?;
                objects_inferred += created;
                info!(
                    run_id = %ctx.run_id(),
                    "[MigrationExecutor] {} -> {} 推断创建 {} 个对象",
                    hop.from,
                    hop.to,
                    created
                );
                if total_steps > 0 {
                    ctx.report(
                        PROGRESS_AFTER_BACKUP
                            + PROGRESS_EXECUTION_SPAN * hop.step_range.start as f64
                                / total_steps as f64,
                        &format!("Updated data structure to {}", hop.to),
                    );
                }
            }

            for index in hop.step_range.clone() {
                let step = &plan.steps()[index];
                info!(
                    run_id = %ctx.run_id(),
                    step = step.name,
                    "[MigrationExecutor] 步骤 {}/{}: {}",
                    index + 1,
                    total_steps,
                    step.action.describe()
                );

                if let Err(e) = store.run_action(&step.action) {
                    let reason = e.to_string();
                    error!(
                        run_id = %ctx.run_id(),
                        step = step.name,
                        "[MigrationExecutor] 步骤失败: {}",
                        reason
                    );
                    ctx.record(RunEventKind::StepFailed {
                        index,
                        step: step.name.to_string(),
                        reason: reason.clone(),
                    });
                    Self::compensate(store, ctx, index, step.name, step.rollback.as_ref());
                    return Err(MigrationError::MigrationFailed {
                        step: step.name.to_string(),
                        reason,
                    });
                }

                ctx.record(RunEventKind::StepSucceeded {
                    index,
                    step: step.name.to_string(),
                });
                ctx.report(
                    PROGRESS_AFTER_BACKUP
                        + PROGRESS_EXECUTION_SPAN * (index + 1) as f64 / total_steps as f64,
                    &format!("Migrating to {}: {}", hop.to, step.description),
                );
            }

            // 没有自定义步骤的计划按 hop 上报进度
            if total_steps == 0 {
                ctx.report(
                    PROGRESS_AFTER_BACKUP
                        + PROGRESS_EXECUTION_SPAN * (hop_index + 1) as f64 / total_hops as f64,
                    &format!("Updated data structure to {}", hop.to),
                );
            }
        }

        Ok(ExecutionReport {
            steps_completed: total_steps,
            objects_inferred,
            duration_ms: start.elapsed().as_millis() as u64,
        })
    }

    /// 执行失败步骤的补偿动作；补偿失败只记录，不向上抛出
    fn compensate(
        store: &mut dyn StoreEngine,
        ctx: &RunContext<'_>,
        index: usize,
        step: &'static str,
        rollback: Option<&StepAction>,
    ) {
        let Some(rollback) = rollback else {
            return;
        };
        match store.run_action(rollback) {
            Ok(()) => {
                info!(run_id = %ctx.run_id(), step, "[MigrationExecutor] 步骤补偿完成");
                ctx.record(RunEventKind::StepCompensated {
                    index,
                    step: step.to_string(),
                    succeeded: true,
                    detail: None,
                });
            }
            Err(e) => {
                warn!(
                    run_id = %ctx.run_id(),
                    step,
                    "[MigrationExecutor] 步骤补偿失败（等待整库恢复）: {}",
                    e
                );
                ctx.record(RunEventKind::StepCompensated {
                    index,
                    step: step.to_string(),
                    succeeded: false,
                    detail: Some(e.to_string()),
                });
            }
        }
    }
}
