//! 迁移引擎集成测试
//!
//! 通过公开 API（`MigrationCoordinator`）驱动完整的迁移运行，
//! 使用 `common::FaultyStore` 在指定步骤注入失败。
//!
//! ## 测试覆盖
//!
//! 1. 全新安装 / 已是最新 / 多版本跨越 / 单版本升级
//! 2. 直接迁移与逐版本迁移结果一致
//! 3. 任一步骤失败：版本指针不变，数据恢复到迁移前
//! 4. 校验失败触发回滚
//! 5. 并发运行被拒绝
//! 6. 备份失败 / 恢复失败 / 磁盘空间不足 / 人工回滚 / 运行记录
//! 7. 宽限期后清理备份

mod common;

use std::sync::mpsc;
use std::thread;

use assert_matches::assert_matches;
use rusqlite::Connection;
use tempfile::TempDir;

use common::{
    checksum_of, coordinator_with, count_of, no_progress, seed_ledger, test_config, Gate,
};
use wealthwise_migration::audit::RunLogRepository;
use wealthwise_migration::migration::wealthwise::{
    HOP_1_0_TO_1_1, HOP_1_1_TO_1_2, HOP_1_2_TO_1_3, V1_0_0, V1_1_0, V1_2_0, V1_3_0,
    WEALTHWISE_HOPS,
};
use wealthwise_migration::migration::{MigrationError, RunState, StepAction};
use wealthwise_migration::MigrationCoordinator;

/// 通过独立连接读取账户余额（协调器只暴露 `StoreEngine` 接口）
fn balance_of(coordinator: &MigrationCoordinator, account_id: &str) -> i64 {
    let conn = Connection::open(coordinator.config().store_path()).unwrap();
    conn.query_row(
        "SELECT current_balance_paise FROM accounts WHERE id = ?1",
        [account_id],
        |row| row.get(0),
    )
    .unwrap()
}

// ============================================================================
// 场景
// ============================================================================

#[test]
fn test_fresh_install_reports_lowest_version() {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir);
    let (coordinator, _) = coordinator_with(&config, WEALTHWISE_HOPS);

    let status = coordinator.migration_status().unwrap();
    assert_eq!(status.current, V1_0_0);
    assert_eq!(status.latest, V1_3_0);
    assert_eq!(status.versions_behind, 3);
}

#[test]
fn test_up_to_date_store_is_untouched() {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir);
    seed_ledger(&config);
    let (coordinator, _) = coordinator_with(&config, WEALTHWISE_HOPS);
    coordinator.ensure_up_to_date(&no_progress()).unwrap();
    let checksum = checksum_of(&coordinator);

    let messages = std::sync::Mutex::new(Vec::new());
    let outcome = coordinator
        .ensure_up_to_date(&|fraction, message| {
            messages.lock().unwrap().push((fraction, message.to_string()));
        })
        .unwrap();

    assert!(!outcome.migrated);
    assert_eq!(outcome.final_state, RunState::Committed);
    assert_eq!(outcome.backup_id, None);
    assert_eq!(checksum_of(&coordinator), checksum);
    assert_eq!(coordinator.list_backups().unwrap().len(), 1);
    assert_eq!(
        messages.into_inner().unwrap(),
        vec![(1.0, "Data is up to date".to_string())]
    );
}

#[test]
fn test_multi_version_jump_migrates_ledger() {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir);
    seed_ledger(&config);
    let (coordinator, _) = coordinator_with(&config, WEALTHWISE_HOPS);

    let fractions = std::sync::Mutex::new(Vec::new());
    let outcome = coordinator
        .ensure_up_to_date(&|fraction, _| fractions.lock().unwrap().push(fraction))
        .unwrap();

    assert!(outcome.migrated);
    assert_eq!((outcome.from, outcome.to), (V1_0_0, V1_3_0));
    assert_eq!(outcome.final_state, RunState::Committed);
    assert_eq!(coordinator.migration_status().unwrap().current, V1_3_0);

    let fractions = fractions.into_inner().unwrap();
    assert!(fractions.windows(2).all(|w| w[0] <= w[1]));
    assert_eq!(fractions.last().copied(), Some(1.0));

    // 只有一份备份，来源是迁移前的 1.0.0
    let backups = coordinator.list_backups().unwrap();
    assert_eq!(backups.len(), 1);
    assert_eq!(backups[0].source_version, V1_0_0);
    assert_eq!(outcome.backup_id.as_deref(), Some(backups[0].id.as_str()));

    assert_eq!(count_of(&coordinator, "transactions"), Some(7));
    // Salary, Rent, Food, Shopping, Investments + Uncategorized
    assert_eq!(count_of(&coordinator, "categories"), Some(6));
    // 2500000 + 8500000 - 2200000 - 500000
    assert_eq!(balance_of(&coordinator, "acc-savings"), 8_300_000);
    assert_eq!(balance_of(&coordinator, "acc-card"), -174_900);
}

#[test]
fn test_single_version_upgrade_from_intermediate_version() {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir);
    seed_ledger(&config);

    // 旧版本应用只认识到 1.2.0
    {
        let (older, _) = coordinator_with(&config, &[HOP_1_0_TO_1_1, HOP_1_1_TO_1_2]);
        older.ensure_up_to_date(&no_progress()).unwrap();
        assert_eq!(older.migration_status().unwrap().current, V1_2_0);
    }

    let (coordinator, _) = coordinator_with(&config, WEALTHWISE_HOPS);
    let outcome = coordinator.ensure_up_to_date(&no_progress()).unwrap();

    assert_eq!((outcome.from, outcome.to), (V1_2_0, V1_3_0));
    let backups = coordinator.list_backups().unwrap();
    assert_eq!(backups.len(), 2);
    assert_eq!(backups[0].source_version, V1_2_0);
}

#[test]
fn test_failed_upgrade_keeps_previous_version() {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir);
    seed_ledger(&config);

    {
        let (older, _) = coordinator_with(&config, &[HOP_1_0_TO_1_1]);
        older.ensure_up_to_date(&no_progress()).unwrap();
    }

    let (coordinator, faults) = coordinator_with(&config, &[HOP_1_0_TO_1_1, HOP_1_1_TO_1_2]);
    let before = checksum_of(&coordinator);
    faults.lock().unwrap().fail_on = Some(HOP_1_1_TO_1_2.steps[1].action);

    let err = coordinator.ensure_up_to_date(&no_progress()).unwrap_err();

    assert_matches!(&err, MigrationError::RolledBack { .. });
    assert_matches!(
        err.cause(),
        MigrationError::MigrationFailed { step, .. } if step == "link_transaction_categories"
    );
    assert!(err.is_recoverable());
    assert_eq!(coordinator.migration_status().unwrap().current, V1_1_0);
    assert_eq!(checksum_of(&coordinator), before);

    // 被回滚使用的备份不再出现在活跃列表中
    let active = coordinator.list_backups().unwrap();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].source_version, V1_0_0);
    let all = coordinator.list_all_backups().unwrap();
    assert_eq!(all.len(), 2);
    assert_eq!(all[0].source_version, V1_1_0);
}

#[test]
fn test_manual_rollback_without_backup() {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir);
    seed_ledger(&config);
    let (coordinator, _) = coordinator_with(&config, WEALTHWISE_HOPS);
    coordinator.ensure_up_to_date(&no_progress()).unwrap();

    let err = coordinator.rollback_to_version(V1_2_0).unwrap_err();

    assert_matches!(&err, MigrationError::NoBackupAvailable { version } if *version == V1_2_0);
    assert_eq!(coordinator.migration_status().unwrap().current, V1_3_0);
}

// ============================================================================
// 组合 / 原子性 / 校验
// ============================================================================

#[test]
fn test_direct_and_sequential_migrations_converge() {
    let direct_dir = TempDir::new().unwrap();
    let direct_config = test_config(&direct_dir);
    seed_ledger(&direct_config);
    let (direct, _) = coordinator_with(&direct_config, WEALTHWISE_HOPS);
    direct.ensure_up_to_date(&no_progress()).unwrap();

    let stepwise_dir = TempDir::new().unwrap();
    let stepwise_config = test_config(&stepwise_dir);
    seed_ledger(&stepwise_config);
    for count in 1..=WEALTHWISE_HOPS.len() {
        let (coordinator, _) = coordinator_with(&stepwise_config, &WEALTHWISE_HOPS[..count]);
        let outcome = coordinator.ensure_up_to_date(&no_progress()).unwrap();
        assert_eq!(outcome.to, WEALTHWISE_HOPS[count - 1].to);
    }
    let (stepwise, _) = coordinator_with(&stepwise_config, WEALTHWISE_HOPS);

    assert_eq!(checksum_of(&direct), checksum_of(&stepwise));
    assert_eq!(stepwise.list_backups().unwrap().len(), 3);
}

#[test]
fn test_any_failed_step_restores_original_data() {
    let steps: Vec<(&str, StepAction)> = [HOP_1_1_TO_1_2, HOP_1_2_TO_1_3]
        .iter()
        .flat_map(|hop| hop.steps.iter().map(|s| (s.name, s.action)))
        .collect();
    assert_eq!(steps.len(), 5);

    for (name, action) in steps {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);
        let seeded = seed_ledger(&config);
        let (coordinator, faults) = coordinator_with(&config, WEALTHWISE_HOPS);
        faults.lock().unwrap().fail_on = Some(action);

        let err = coordinator.ensure_up_to_date(&no_progress()).unwrap_err();

        assert_matches!(
            err.cause(),
            MigrationError::MigrationFailed { step, .. } if step == name,
            "failing step {}",
            name
        );
        assert_eq!(coordinator.migration_status().unwrap().current, V1_0_0);
        assert_eq!(checksum_of(&coordinator), seeded, "failing step {}", name);
    }
}

#[test]
fn test_validation_failure_rolls_back() {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir);
    let seeded = seed_ledger(&config);
    let (coordinator, faults) = coordinator_with(&config, WEALTHWISE_HOPS);
    // 步骤本身成功，但悄悄丢了一条交易
    faults.lock().unwrap().sabotage_after = Some((
        HOP_1_1_TO_1_2.steps[2].action,
        "DELETE FROM transactions WHERE id = 'txn-007';",
    ));

    let err = coordinator.ensure_up_to_date(&no_progress()).unwrap_err();

    assert_matches!(&err, MigrationError::RolledBack { .. });
    match err.cause() {
        MigrationError::ValidationFailed { issues } => {
            assert!(
                issues.iter().any(|i| i.contains("'transactions' lost records")),
                "{:?}",
                issues
            );
        }
        other => panic!("unexpected cause: {}", other),
    }
    assert_eq!(coordinator.migration_status().unwrap().current, V1_0_0);
    assert_eq!(checksum_of(&coordinator), seeded);
    assert_eq!(count_of(&coordinator, "transactions"), Some(7));
}

// ============================================================================
// 并发 / 故障
// ============================================================================

#[test]
fn test_concurrent_run_is_rejected() {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir);
    seed_ledger(&config);
    let (coordinator, faults) = coordinator_with(&config, WEALTHWISE_HOPS);

    let (entered_tx, entered_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel();
    faults.lock().unwrap().gate = Some(Gate {
        action: HOP_1_1_TO_1_2.steps[0].action,
        entered: entered_tx,
        release: release_rx,
    });

    thread::scope(|s| {
        let first = s.spawn(|| coordinator.ensure_up_to_date(&no_progress()));
        entered_rx.recv().unwrap();

        assert!(coordinator.is_running());
        assert_matches!(
            coordinator.ensure_up_to_date(&no_progress()),
            Err(MigrationError::MigrationAlreadyInProgress)
        );
        assert_matches!(
            coordinator.rollback_to_version(V1_0_0),
            Err(MigrationError::MigrationAlreadyInProgress)
        );
        assert_matches!(
            coordinator.prune_backups(),
            Err(MigrationError::MigrationAlreadyInProgress)
        );

        release_tx.send(()).unwrap();
        let outcome = first.join().unwrap().unwrap();
        assert_eq!(outcome.final_state, RunState::Committed);
    });

    assert!(!coordinator.is_running());
    assert_eq!(coordinator.list_all_backups().unwrap().len(), 1);
}

#[test]
fn test_failed_restore_requires_manual_recovery() {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir);
    seed_ledger(&config);
    let (coordinator, faults) = coordinator_with(&config, WEALTHWISE_HOPS);
    {
        let mut faults = faults.lock().unwrap();
        faults.fail_on = Some(HOP_1_2_TO_1_3.steps[1].action);
        faults.fail_restore = true;
    }

    let err = coordinator.ensure_up_to_date(&no_progress()).unwrap_err();

    assert_matches!(&err, MigrationError::RollbackFailed(_));
    assert!(err.requires_manual_recovery());
    assert!(!err.is_recoverable());
    // 指针从未前移
    assert_eq!(coordinator.migration_status().unwrap().current, V1_0_0);
    // 备份保持活跃，供人工恢复
    assert_eq!(coordinator.list_backups().unwrap().len(), 1);
}

#[test]
fn test_insufficient_storage_aborts_before_backup() {
    let dir = TempDir::new().unwrap();
    let mut config = test_config(&dir);
    // 1 PB 余量
    config.min_free_space_margin_mb = 1_000_000_000;
    let seeded = seed_ledger(&config);
    let (coordinator, _) = coordinator_with(&config, WEALTHWISE_HOPS);

    let err = coordinator.ensure_up_to_date(&no_progress()).unwrap_err();

    assert_matches!(&err, MigrationError::InsufficientStorage { .. });
    assert!(err.is_recoverable());
    assert!(coordinator.list_all_backups().unwrap().is_empty());
    assert_eq!(coordinator.migration_status().unwrap().current, V1_0_0);
    assert_eq!(checksum_of(&coordinator), seeded);
}

#[test]
fn test_insufficient_storage_leaves_fresh_store_empty() {
    let dir = TempDir::new().unwrap();
    let mut config = test_config(&dir);
    config.min_free_space_margin_mb = 1_000_000_000;
    let (coordinator, _) = coordinator_with(&config, WEALTHWISE_HOPS);

    let err = coordinator.ensure_up_to_date(&no_progress()).unwrap_err();

    assert_matches!(&err, MigrationError::InsufficientStorage { .. });
    // 预检查失败时不建基线
    assert_eq!(count_of(&coordinator, "accounts"), None);
    assert_eq!(count_of(&coordinator, "transactions"), None);
    assert!(!coordinator.config().version_path().exists());
}

#[test]
fn test_backup_failure_leaves_store_untouched() {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir);
    let seeded = seed_ledger(&config);
    let (coordinator, faults) = coordinator_with(&config, WEALTHWISE_HOPS);
    faults.lock().unwrap().fail_copy = true;

    let err = coordinator.ensure_up_to_date(&no_progress()).unwrap_err();

    assert_matches!(&err, MigrationError::BackupFailed(_));
    assert!(err.is_recoverable());
    assert_eq!(checksum_of(&coordinator), seeded);
    assert_eq!(coordinator.migration_status().unwrap().current, V1_0_0);
    assert!(coordinator.list_all_backups().unwrap().is_empty());

    let conn = Connection::open(config.run_log_path().unwrap()).unwrap();
    let runs = RunLogRepository::recent_runs(&conn, 10).unwrap();
    let record = RunLogRepository::load_run(&conn, &runs[0]).unwrap().unwrap();
    assert_eq!(record.final_state, Some(RunState::FailedNoBackup));
    assert_eq!(record.states, vec![RunState::BackingUp, RunState::FailedNoBackup]);
    assert!(record.steps.is_empty());
}

#[test]
fn test_backups_pruned_after_grace_period() {
    let dir = TempDir::new().unwrap();
    let mut config = test_config(&dir);
    config.prune_grace_period_hours = 0;
    config.retention.keep_latest = 0;
    config.retention.max_age_days = 0;
    seed_ledger(&config);
    let (coordinator, _) = coordinator_with(&config, WEALTHWISE_HOPS);
    coordinator.ensure_up_to_date(&no_progress()).unwrap();
    assert_eq!(coordinator.list_all_backups().unwrap().len(), 1);

    let outcome = coordinator.ensure_up_to_date(&no_progress()).unwrap();

    assert!(!outcome.migrated);
    assert!(coordinator.list_all_backups().unwrap().is_empty());
}

#[test]
fn test_backups_kept_within_grace_period() {
    let dir = TempDir::new().unwrap();
    let mut config = test_config(&dir);
    config.retention.keep_latest = 0;
    config.retention.max_age_days = 0;
    seed_ledger(&config);
    let (coordinator, _) = coordinator_with(&config, WEALTHWISE_HOPS);
    coordinator.ensure_up_to_date(&no_progress()).unwrap();

    let outcome = coordinator.ensure_up_to_date(&no_progress()).unwrap();

    assert!(!outcome.migrated);
    assert_eq!(coordinator.list_all_backups().unwrap().len(), 1);
    assert_eq!(coordinator.list_backups().unwrap().len(), 1);
}

#[test]
fn test_manual_rollback_restores_backup() {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir);
    let seeded = seed_ledger(&config);
    let (coordinator, _) = coordinator_with(&config, WEALTHWISE_HOPS);
    coordinator.ensure_up_to_date(&no_progress()).unwrap();
    assert_ne!(checksum_of(&coordinator), seeded);

    let backup = coordinator.rollback_to_version(V1_0_0).unwrap();

    assert_eq!(backup.source_version, V1_0_0);
    assert_eq!(backup.content_checksum, seeded);
    assert_eq!(checksum_of(&coordinator), seeded);
    assert_eq!(coordinator.migration_status().unwrap().current, V1_0_0);
    assert!(coordinator.list_backups().unwrap().is_empty());

    // 回滚后再次启动会重新迁移
    let outcome = coordinator.ensure_up_to_date(&no_progress()).unwrap();
    assert!(outcome.migrated);
    assert_eq!(coordinator.migration_status().unwrap().current, V1_3_0);
}

#[test]
fn test_run_log_records_failed_run() {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir);
    seed_ledger(&config);
    let (coordinator, faults) = coordinator_with(&config, WEALTHWISE_HOPS);
    faults.lock().unwrap().fail_on = Some(HOP_1_2_TO_1_3.steps[0].action);

    coordinator.ensure_up_to_date(&no_progress()).unwrap_err();

    let conn = Connection::open(config.run_log_path().unwrap()).unwrap();
    let runs = RunLogRepository::recent_runs(&conn, 10).unwrap();
    assert_eq!(runs.len(), 1);
    let record = RunLogRepository::load_run(&conn, &runs[0]).unwrap().unwrap();

    assert_eq!(record.from, Some(V1_0_0));
    assert_eq!(record.to, Some(V1_3_0));
    assert_eq!(record.final_state, Some(RunState::RolledBack));
    assert!(record.error.is_some());
    let failed = record.steps.iter().find(|s| !s.succeeded).unwrap();
    assert_eq!(failed.step, "add_current_balance_column");
    // 1.1.0 -> 1.2.0 的三个步骤都已成功
    assert_eq!(record.steps.iter().filter(|s| s.succeeded).count(), 3);
}
