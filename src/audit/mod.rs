//! # Audit 模块
//!
//! 迁移运行记录（run log）。
//!
//! ## 设计原则
//!
//! 1. **只追加**：每个运行事件一行，写入后不可修改（触发器拒绝 UPDATE / DELETE）
//! 2. **不影响运行**：日志写入失败只记录 `warn!`，迁移照常继续
//! 3. **只读诊断**：引擎从不读取运行记录，读取接口只给诊断工具和测试使用
//!
//! ## 事件
//!
//! `run_started` → `state_changed`* → `step_succeeded` / `step_failed` /
//! `step_compensated` / `validation_issue` → `run_finished`

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, Row};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::migration::state::RunState;
use crate::version_registry::Version;

/// 运行事件
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunEventKind {
    RunStarted {
        from: Version,
        to: Version,
        strategy: String,
        step_count: usize,
        plan: String,
    },
    StateChanged {
        from: RunState,
        to: RunState,
    },
    StepSucceeded {
        index: usize,
        step: String,
    },
    StepFailed {
        index: usize,
        step: String,
        reason: String,
    },
    StepCompensated {
        index: usize,
        step: String,
        succeeded: bool,
        #[serde(default)]
        detail: Option<String>,
    },
    ValidationIssue {
        issue: String,
    },
    ManualRollback {
        target: Version,
        backup_id: String,
    },
    RunFinished {
        final_state: RunState,
        duration_ms: u64,
        #[serde(default)]
        error: Option<String>,
    },
}

impl RunEventKind {
    fn type_str(&self) -> &'static str {
        match self {
            RunEventKind::RunStarted { .. } => "run_started",
            RunEventKind::StateChanged { .. } => "state_changed",
            RunEventKind::StepSucceeded { .. } => "step_succeeded",
            RunEventKind::StepFailed { .. } => "step_failed",
            RunEventKind::StepCompensated { .. } => "step_compensated",
            RunEventKind::ValidationIssue { .. } => "validation_issue",
            RunEventKind::ManualRollback { .. } => "manual_rollback",
            RunEventKind::RunFinished { .. } => "run_finished",
        }
    }
}

/// 已持久化的运行事件
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunEvent {
    pub seq: i64,
    pub run_id: String,
    pub timestamp: DateTime<Utc>,
    pub event: RunEventKind,
}

/// 单个步骤的结果
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepOutcome {
    pub index: usize,
    pub step: String,
    pub succeeded: bool,
    /// 失败原因
    pub reason: Option<String>,
    /// 局部补偿是否成功（未执行补偿时为 `None`）
    pub compensated: Option<bool>,
}

/// 由事件聚合出的单次运行记录
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MigrationRunRecord {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub from: Option<Version>,
    pub to: Option<Version>,
    pub plan: Option<String>,
    pub steps: Vec<StepOutcome>,
    pub validation_issues: Vec<String>,
    /// 依次经过的状态
    pub states: Vec<RunState>,
    pub final_state: Option<RunState>,
    pub duration_ms: Option<u64>,
    pub error: Option<String>,
}

impl MigrationRunRecord {
    fn from_events(run_id: &str, events: &[RunEvent]) -> Option<Self> {
        let first = events.first()?;
        let mut record = MigrationRunRecord {
            run_id: run_id.to_string(),
            started_at: first.timestamp,
            from: None,
            to: None,
            plan: None,
            steps: Vec::new(),
            validation_issues: Vec::new(),
            states: Vec::new(),
            final_state: None,
            duration_ms: None,
            error: None,
        };

        for event in events {
            match &event.event {
                RunEventKind::RunStarted { from, to, plan, .. } => {
                    record.from = Some(*from);
                    record.to = Some(*to);
                    record.plan = Some(plan.clone());
                }
                RunEventKind::StateChanged { to, .. } => record.states.push(*to),
                RunEventKind::StepSucceeded { index, step } => record.steps.push(StepOutcome {
                    index: *index,
                    step: step.clone(),
                    succeeded: true,
                    reason: None,
                    compensated: None,
                }),
                RunEventKind::StepFailed {
                    index,
                    step,
                    reason,
                } => record.steps.push(StepOutcome {
                    index: *index,
                    step: step.clone(),
                    succeeded: false,
                    reason: Some(reason.clone()),
                    compensated: None,
                }),
                RunEventKind::StepCompensated {
                    index, succeeded, ..
                } => {
                    if let Some(outcome) = record.steps.iter_mut().rev().find(|s| s.index == *index) {
                        outcome.compensated = Some(*succeeded);
                    }
                }
                RunEventKind::ValidationIssue { issue } => {
                    record.validation_issues.push(issue.clone())
                }
                RunEventKind::ManualRollback { target, .. } => record.to = Some(*target),
                RunEventKind::RunFinished {
                    final_state,
                    duration_ms,
                    error,
                } => {
                    record.final_state = Some(*final_state);
                    record.duration_ms = Some(*duration_ms);
                    record.error = error.clone();
                }
            }
        }
        Some(record)
    }
}

/// 运行记录错误
#[derive(Debug, thiserror::Error)]
pub enum RunLogError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid timestamp: {0}")]
    Timestamp(String),
}

/// 运行记录仓库（直接操作连接的无状态函数集合）
pub struct RunLogRepository;

impl RunLogRepository {
    /// 创建运行事件表的 SQL
    pub const CREATE_TABLE_SQL: &'static str = r#"
        CREATE TABLE IF NOT EXISTS __migration_run_events (
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            run_id TEXT NOT NULL,
            timestamp TEXT NOT NULL,
            event_type TEXT NOT NULL,
            event_data TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_run_events_run_id ON __migration_run_events(run_id);
        CREATE INDEX IF NOT EXISTS idx_run_events_event_type ON __migration_run_events(event_type);

        CREATE TRIGGER IF NOT EXISTS trg_run_events_no_update
        BEFORE UPDATE ON __migration_run_events
        BEGIN
            SELECT RAISE(ABORT, 'migration run events are append-only');
        END;

        CREATE TRIGGER IF NOT EXISTS trg_run_events_no_delete
        BEFORE DELETE ON __migration_run_events
        BEGIN
            SELECT RAISE(ABORT, 'migration run events are append-only');
        END;
    "#;

    const INSERT_SQL: &'static str = r#"
        INSERT INTO __migration_run_events (run_id, timestamp, event_type, event_data)
        VALUES (?1, ?2, ?3, ?4)
    "#;

    pub fn init(conn: &Connection) -> Result<(), RunLogError> {
        conn.execute_batch(Self::CREATE_TABLE_SQL)?;
        Ok(())
    }

    /// 追加一条事件，返回序号
    pub fn append(
        conn: &Connection,
        run_id: &str,
        event: &RunEventKind,
    ) -> Result<i64, RunLogError> {
        let event_data = serde_json::to_string(event)?;
        conn.execute(
            Self::INSERT_SQL,
            params![run_id, Utc::now().to_rfc3339(), event.type_str(), event_data],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// 某次运行的全部事件（按写入顺序）
    pub fn events_for_run(conn: &Connection, run_id: &str) -> Result<Vec<RunEvent>, RunLogError> {
        let mut stmt = conn.prepare(
            "SELECT seq, run_id, timestamp, event_data
             FROM __migration_run_events WHERE run_id = ?1 ORDER BY seq",
        )?;
        let rows = stmt.query_map([run_id], Self::row_to_event)?;
        let mut events = Vec::new();
        for row in rows {
            events.push(row??);
        }
        Ok(events)
    }

    /// 最近的运行 ID（最新的在前）
    pub fn recent_runs(conn: &Connection, limit: usize) -> Result<Vec<String>, RunLogError> {
        let mut stmt = conn.prepare(
            "SELECT run_id FROM __migration_run_events
             GROUP BY run_id ORDER BY MIN(seq) DESC LIMIT ?1",
        )?;
        let ids = stmt
            .query_map(params![limit as i64], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ids)
    }

    /// 聚合某次运行的记录；没有任何事件时返回 `None`
    pub fn load_run(
        conn: &Connection,
        run_id: &str,
    ) -> Result<Option<MigrationRunRecord>, RunLogError> {
        let events = Self::events_for_run(conn, run_id)?;
        Ok(MigrationRunRecord::from_events(run_id, &events))
    }

    fn row_to_event(row: &Row) -> rusqlite::Result<Result<RunEvent, RunLogError>> {
        let seq: i64 = row.get(0)?;
        let run_id: String = row.get(1)?;
        let timestamp_str: String = row.get(2)?;
        let event_data: String = row.get(3)?;

        let timestamp = match DateTime::parse_from_rfc3339(&timestamp_str) {
            Ok(dt) => dt.with_timezone(&Utc),
            Err(e) => return Ok(Err(RunLogError::Timestamp(e.to_string()))),
        };
        let event = match serde_json::from_str(&event_data) {
            Ok(event) => event,
            Err(e) => return Ok(Err(RunLogError::Serialization(e))),
        };

        Ok(Ok(RunEvent {
            seq,
            run_id,
            timestamp,
            event,
        }))
    }
}

/// 引擎使用的运行记录写入端
///
/// 打开失败时退化为仅输出 tracing 日志。
pub struct RunLog {
    path: Option<PathBuf>,
    conn: Mutex<Option<Connection>>,
}

impl RunLog {
    /// 打开（必要时创建）运行记录数据库
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let conn = match Self::open_connection(&path) {
            Ok(conn) => Some(conn),
            Err(e) => {
                warn!(
                    "[RunLog] 无法打开运行记录数据库 {}，仅输出日志: {}",
                    path.display(),
                    e
                );
                None
            }
        };
        Self {
            path: Some(path),
            conn: Mutex::new(conn),
        }
    }

    /// 不落盘的运行记录
    pub fn disabled() -> Self {
        Self {
            path: None,
            conn: Mutex::new(None),
        }
    }

    fn open_connection(path: &Path) -> Result<Connection, RunLogError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        RunLogRepository::init(&conn)?;
        Ok(conn)
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// 追加事件；失败只记录警告
    pub fn record(&self, run_id: &str, event: RunEventKind) {
        debug!(run_id = %run_id, event = event.type_str(), "[RunLog] {:?}", event);

        let guard = match self.conn.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let Some(conn) = guard.as_ref() else {
            return;
        };
        if let Err(e) = RunLogRepository::append(conn, run_id, &event) {
            warn!(
                run_id = %run_id,
                "[RunLog] 写入运行事件失败 ({}): {}",
                event.type_str(),
                e
            );
        }
    }
}

impl std::fmt::Debug for RunLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunLog").field("path", &self.path).finish()
    }
}
