//! # Run State (运行状态)
//!
//! 单次迁移运行的状态机、进度上报和运行上下文。
//!
//! ```text
//! NotStarted → BackingUp → Executing → Validating → Committed
//!                  │            │           │
//!                  ▼            ▼           ▼
//!           FailedNoBackup   RolledBack / RollbackFailed
//! ```

use std::cell::Cell;
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::MigrationError;
use crate::audit::{RunEventKind, RunLog};

/// 运行状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    NotStarted,
    BackingUp,
    Executing,
    Validating,
    Committed,
    RolledBack,
    /// 备份阶段失败，存储未被修改
    FailedNoBackup,
    /// 恢复失败，需要人工介入
    RollbackFailed,
}

impl RunState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunState::NotStarted => "not_started",
            RunState::BackingUp => "backing_up",
            RunState::Executing => "executing",
            RunState::Validating => "validating",
            RunState::Committed => "committed",
            RunState::RolledBack => "rolled_back",
            RunState::FailedNoBackup => "failed_no_backup",
            RunState::RollbackFailed => "rollback_failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunState::Committed
                | RunState::RolledBack
                | RunState::FailedNoBackup
                | RunState::RollbackFailed
        )
    }

    /// 是否允许从 `self` 迁移到 `next`
    pub fn can_transition_to(&self, next: RunState) -> bool {
        use RunState::*;
        matches!(
            (self, next),
            (NotStarted, BackingUp)
                | (BackingUp, Executing)
                | (BackingUp, FailedNoBackup)
                | (Executing, Validating)
                | (Executing, RolledBack)
                | (Executing, RollbackFailed)
                | (Validating, Committed)
                | (Validating, RolledBack)
                | (Validating, RollbackFailed)
        )
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 只允许合法转换的状态机
#[derive(Debug)]
pub struct RunStateMachine {
    state: RunState,
}

impl Default for RunStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl RunStateMachine {
    pub fn new() -> Self {
        Self {
            state: RunState::NotStarted,
        }
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    /// 转换到下一状态，返回转换前的状态
    pub fn advance(&mut self, next: RunState) -> Result<RunState, MigrationError> {
        if !self.state.can_transition_to(next) {
            return Err(MigrationError::Internal(format!(
                "illegal run state transition {} -> {}",
                self.state, next
            )));
        }
        let previous = self.state;
        self.state = next;
        Ok(previous)
    }
}

/// 进度事件（用于跨线程传递）
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MigrationProgress {
    /// 0.0 - 1.0
    pub fraction: f64,
    pub message: String,
}

/// 进度回调：`(fraction, message)`
pub type ProgressFn<'a> = dyn Fn(f64, &str) + 'a;

/// 单调进度上报器
///
/// 上报值被限制在 `[0, 1]`，且永不回退（回退的值按上次的值上报）。
pub struct ProgressReporter<'a> {
    sink: &'a ProgressFn<'a>,
    last: Cell<f64>,
}

impl<'a> ProgressReporter<'a> {
    pub fn new(sink: &'a ProgressFn<'a>) -> Self {
        Self {
            sink,
            last: Cell::new(0.0),
        }
    }

    pub fn report(&self, fraction: f64, message: &str) {
        let clamped = if fraction.is_finite() {
            fraction.clamp(0.0, 1.0)
        } else {
            self.last.get()
        };
        let value = clamped.max(self.last.get());
        self.last.set(value);
        debug!("[Progress] {:.3} {}", value, message);
        (self.sink)(value, message);
    }

    pub fn last(&self) -> f64 {
        self.last.get()
    }
}

/// 单次运行的上下文：运行 ID、状态机、进度上报、运行记录
pub struct RunContext<'a> {
    run_id: String,
    machine: RunStateMachine,
    reporter: ProgressReporter<'a>,
    log: &'a RunLog,
}

impl<'a> RunContext<'a> {
    pub fn new(run_id: impl Into<String>, progress: &'a ProgressFn<'a>, log: &'a RunLog) -> Self {
        Self {
            run_id: run_id.into(),
            machine: RunStateMachine::new(),
            reporter: ProgressReporter::new(progress),
            log,
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn state(&self) -> RunState {
        self.machine.state()
    }

    /// 状态转换（同时写入运行记录）
    pub fn advance(&mut self, next: RunState) -> Result<(), MigrationError> {
        let previous = self.machine.advance(next)?;
        info!(
            run_id = %self.run_id,
            "[MigrationRun] 状态 {} -> {}",
            previous,
            next
        );
        self.log.record(
            &self.run_id,
            RunEventKind::StateChanged {
                from: previous,
                to: next,
            },
        );
        Ok(())
    }

    pub fn report(&self, fraction: f64, message: &str) {
        self.reporter.report(fraction, message);
    }

    pub fn record(&self, event: RunEventKind) {
        self.log.record(&self.run_id, event);
    }
}
