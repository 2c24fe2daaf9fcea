//! 集成测试共享工具
//!
//! - `FaultyStore`：包装 `SqliteStore`，按配置注入步骤失败 / 数据破坏 / 备份失败 / 恢复失败 / 阻塞
//! - `seed_ledger`：在 1.0.0 基线上写入一份示例账本
//! - `coordinator_with`：按给定 hop 子集构造协调器（模拟不同版本的应用）

#![allow(dead_code)]

use std::io;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{Receiver, Sender};
use std::sync::{Arc, Mutex};

use tempfile::TempDir;

use wealthwise_migration::config::EngineConfig;
use wealthwise_migration::migration::wealthwise::BASELINE_SCHEMA;
use wealthwise_migration::migration::{
    HopDecl, MigrationCatalog, MigrationCoordinator, ReferenceCheck, RequiredField,
    SchemaChange, StepAction,
};
use wealthwise_migration::store::{SqliteStore, StoreEngine, StoreError};

/// 在某个动作开始执行时暂停，直到测试放行
pub struct Gate {
    pub action: StepAction,
    pub entered: Sender<()>,
    pub release: Receiver<()>,
}

#[derive(Default)]
pub struct Faults {
    /// 执行到该动作时直接失败（不执行）
    pub fail_on: Option<StepAction>,
    /// 该动作成功后，直接在存储上执行这段 SQL
    pub sabotage_after: Option<(StepAction, &'static str)>,
    /// `copy_files` 失败（备份阶段）
    pub fail_copy: bool,
    /// `replace_files` 失败
    pub fail_restore: bool,
    pub gate: Option<Gate>,
}

pub type FaultHandle = Arc<Mutex<Faults>>;

pub struct FaultyStore {
    inner: SqliteStore,
    faults: FaultHandle,
}

impl FaultyStore {
    pub fn new(path: impl Into<PathBuf>) -> (Self, FaultHandle) {
        let faults = FaultHandle::default();
        (
            Self {
                inner: SqliteStore::new(path),
                faults: Arc::clone(&faults),
            },
            faults,
        )
    }
}

fn injected(what: &str) -> StoreError {
    StoreError::Io(io::Error::new(io::ErrorKind::Other, format!("injected fault: {}", what)))
}

impl StoreEngine for FaultyStore {
    fn open(&mut self) -> Result<(), StoreError> {
        self.inner.open()
    }

    fn close(&mut self) -> Result<(), StoreError> {
        self.inner.close()
    }

    fn is_open(&self) -> bool {
        self.inner.is_open()
    }

    fn location(&self) -> &Path {
        self.inner.location()
    }

    fn size_on_disk(&self) -> Result<u64, StoreError> {
        self.inner.size_on_disk()
    }

    fn copy_files(&mut self, dest_dir: &Path) -> Result<Vec<PathBuf>, StoreError> {
        if self.faults.lock().unwrap().fail_copy {
            return Err(injected("copy_files"));
        }
        self.inner.copy_files(dest_dir)
    }

    fn replace_files(&mut self, source_dir: &Path) -> Result<(), StoreError> {
        if self.faults.lock().unwrap().fail_restore {
            return Err(injected("replace_files"));
        }
        self.inner.replace_files(source_dir)
    }

    fn run_action(&mut self, action: &StepAction) -> Result<(), StoreError> {
        let gate = {
            let mut faults = self.faults.lock().unwrap();
            if faults.fail_on.as_ref() == Some(action) {
                return Err(injected(&action.describe()));
            }
            match &faults.gate {
                Some(gate) if gate.action == *action => faults.gate.take(),
                _ => None,
            }
        };
        if let Some(gate) = gate {
            gate.entered.send(()).unwrap();
            gate.release.recv().unwrap();
        }

        self.inner.run_action(action)?;

        let sabotage = {
            let faults = self.faults.lock().unwrap();
            match &faults.sabotage_after {
                Some((after, sql)) if after == action => Some(*sql),
                _ => None,
            }
        };
        if let Some(sql) = sabotage {
            self.inner.connection()?.execute_batch(sql)?;
        }
        Ok(())
    }

    fn infer_schema(&mut self, changes: &[SchemaChange]) -> Result<usize, StoreError> {
        self.inner.infer_schema(changes)
    }

    fn count_records(&mut self, collection: &str) -> Result<Option<u64>, StoreError> {
        self.inner.count_records(collection)
    }

    fn count_dangling(&mut self, check: &ReferenceCheck) -> Result<Option<u64>, StoreError> {
        self.inner.count_dangling(check)
    }

    fn count_missing(&mut self, field: &RequiredField) -> Result<Option<u64>, StoreError> {
        self.inner.count_missing(field)
    }

    fn integrity_check(&mut self) -> Result<(), StoreError> {
        self.inner.integrity_check()
    }

    fn content_checksum(&mut self) -> Result<String, StoreError> {
        self.inner.content_checksum()
    }
}

// ============================================================================
// 数据准备
// ============================================================================

pub const SAMPLE_LEDGER: &str = "
    INSERT INTO accounts (id, name, account_type, currency, opening_balance_paise, created_at) VALUES
        ('acc-savings', 'HDFC Savings', 'bank', 'INR', 2500000, '2024-04-01T09:00:00Z'),
        ('acc-card', 'ICICI Credit Card', 'credit_card', 'INR', 0, '2024-04-01T09:05:00Z'),
        ('acc-cash', 'Wallet', 'cash', 'INR', 150000, '2024-04-02T18:30:00Z');
    INSERT INTO transactions (id, account_id, amount_paise, category, description, occurred_at) VALUES
        ('txn-001', 'acc-savings', 8500000, 'Salary', 'April salary', '2024-04-30T10:00:00Z'),
        ('txn-002', 'acc-savings', -2200000, 'Rent', 'Flat rent', '2024-05-01T08:00:00Z'),
        ('txn-003', 'acc-card', -45000, ' Food ', 'Swiggy', '2024-05-02T21:15:00Z'),
        ('txn-004', 'acc-card', -129900, 'Shopping', NULL, '2024-05-03T13:40:00Z'),
        ('txn-005', 'acc-cash', -6000, NULL, 'Auto fare', '2024-05-03T19:00:00Z'),
        ('txn-006', 'acc-cash', -2500, '', 'Chai', '2024-05-04T17:20:00Z'),
        ('txn-007', 'acc-savings', -500000, 'Investments', 'SIP', '2024-05-05T09:30:00Z');
";

pub fn test_config(dir: &TempDir) -> EngineConfig {
    let mut config = EngineConfig::for_data_dir(dir.path());
    config.min_free_space_margin_mb = 0;
    config
}

/// 写入 1.0.0 基线和示例账本（不写版本元数据，等同于首次使用版本化引擎）
pub fn seed_ledger(config: &EngineConfig) -> String {
    let mut store = SqliteStore::open_at(config.store_path()).unwrap();
    store.infer_schema(BASELINE_SCHEMA).unwrap();
    store.connection().unwrap().execute_batch(SAMPLE_LEDGER).unwrap();
    let checksum = store.content_checksum().unwrap();
    store.close().unwrap();
    checksum
}

/// 使用给定 hop 子集的协调器
pub fn coordinator_with(
    config: &EngineConfig,
    hops: &[HopDecl],
) -> (MigrationCoordinator, FaultHandle) {
    let (store, faults) = FaultyStore::new(config.store_path());
    let catalog = MigrationCatalog::new(BASELINE_SCHEMA, hops).unwrap();
    let coordinator = MigrationCoordinator::new(config.clone(), Box::new(store), catalog).unwrap();
    (coordinator, faults)
}

pub fn no_progress() -> impl Fn(f64, &str) {
    |_, _| {}
}

pub fn checksum_of(coordinator: &MigrationCoordinator) -> String {
    coordinator
        .with_store(|store| store.content_checksum())
        .unwrap()
        .unwrap()
}

pub fn count_of(coordinator: &MigrationCoordinator, collection: &str) -> Option<u64> {
    coordinator
        .with_store(|store| store.count_records(collection))
        .unwrap()
        .unwrap()
}
