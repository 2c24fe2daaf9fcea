//! # WealthWise Migration Definitions
//!
//! WealthWise 本地账本的版本声明。
//!
//! ## 版本概述
//!
//! | 版本 | 策略 | 变更 |
//! |------|------|------|
//! | 1.0.0 | 基线 | `accounts` / `transactions`（分类为自由文本） |
//! | 1.1.0 | Lightweight | 账户开户机构、预算表、交易时间索引 |
//! | 1.2.0 | Heavyweight | 分类拆分为独立表，交易改为引用 `category_id` |
//! | 1.3.0 | DataTransformation | 回填账户当前余额 |
//!
//! 金额一律以 paise（1/100 卢比）整数存储。

use std::time::Duration;

use super::definitions::{
    CatalogError, CountBound, HopChecks, HopDecl, MigrationCatalog, MigrationStep,
    ReferenceCheck, RequiredField, SchemaChange, StepAction, Strategy, TransformId,
};
use crate::version_registry::Version;

pub const V1_0_0: Version = Version::new(1, 0, 0);
pub const V1_1_0: Version = Version::new(1, 1, 0);
pub const V1_2_0: Version = Version::new(1, 2, 0);
pub const V1_3_0: Version = Version::new(1, 3, 0);

/// 分类为空时使用的默认分类名
pub const UNCATEGORIZED: &str = "Uncategorized";

// ============================================================================
// 基线 1.0.0
// ============================================================================

pub const BASELINE_SCHEMA: &[SchemaChange] = &[
    SchemaChange::AddTable {
        name: "accounts",
        ddl: "CREATE TABLE IF NOT EXISTS accounts (
            id TEXT PRIMARY KEY NOT NULL,
            name TEXT NOT NULL,
            account_type TEXT NOT NULL,
            currency TEXT NOT NULL DEFAULT 'INR',
            opening_balance_paise INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL
        )",
    },
    SchemaChange::AddTable {
        name: "transactions",
        ddl: "CREATE TABLE IF NOT EXISTS transactions (
            id TEXT PRIMARY KEY NOT NULL,
            account_id TEXT NOT NULL,
            amount_paise INTEGER NOT NULL,
            category TEXT,
            description TEXT,
            occurred_at TEXT NOT NULL
        )",
    },
    SchemaChange::AddIndex {
        name: "idx_transactions_account",
        ddl: "CREATE INDEX IF NOT EXISTS idx_transactions_account ON transactions(account_id)",
    },
];

const LEDGER_NO_LOSS: &[CountBound] = &[
    CountBound::no_loss("accounts"),
    CountBound::no_loss("transactions"),
];

const ACCOUNT_REFERENCE: ReferenceCheck =
    ReferenceCheck::new("transactions", "account_id", "accounts", "id");

// ============================================================================
// 1.0.0 -> 1.1.0: Lightweight
// ============================================================================

const V1_1_0_SCHEMA_CHANGES: &[SchemaChange] = &[
    SchemaChange::AddColumn {
        table: "accounts",
        column: "institution",
        definition: "TEXT",
    },
    SchemaChange::AddTable {
        name: "budgets",
        ddl: "CREATE TABLE IF NOT EXISTS budgets (
            id TEXT PRIMARY KEY NOT NULL,
            category TEXT NOT NULL,
            month TEXT NOT NULL,
            limit_paise INTEGER NOT NULL
        )",
    },
    SchemaChange::AddIndex {
        name: "idx_transactions_occurred_at",
        ddl: "CREATE INDEX IF NOT EXISTS idx_transactions_occurred_at ON transactions(occurred_at)",
    },
];

pub const HOP_1_0_TO_1_1: HopDecl = HopDecl::new(V1_0_0, V1_1_0, Strategy::Lightweight)
    .with_schema_changes(V1_1_0_SCHEMA_CHANGES)
    .with_estimate(Duration::from_secs(2))
    .with_checks(HopChecks {
        count_bounds: LEDGER_NO_LOSS,
        references: &[ACCOUNT_REFERENCE],
        required_fields: &[],
    });

// ============================================================================
// 1.1.0 -> 1.2.0: Heavyweight（分类规范化）
// ============================================================================

const V1_2_0_STEPS: &[MigrationStep] = &[
    MigrationStep::new(
        "create_categories",
        "Create the categories table from distinct transaction categories",
        StepAction::Sql(
            "CREATE TABLE IF NOT EXISTS categories (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL UNIQUE
            );
            INSERT OR IGNORE INTO categories (name) VALUES ('Uncategorized');
            INSERT OR IGNORE INTO categories (name)
                SELECT DISTINCT COALESCE(NULLIF(TRIM(category), ''), 'Uncategorized')
                FROM transactions
                ORDER BY 1;",
        ),
    )
    .with_rollback(StepAction::Sql("DROP TABLE IF EXISTS categories;")),
    MigrationStep::new(
        "link_transaction_categories",
        "Add category_id to transactions and backfill it by category name",
        StepAction::Transform(TransformId::BackfillCategoryIds),
    )
    .with_rollback(StepAction::Transform(TransformId::DropTransactionCategoryLink)),
    MigrationStep::new(
        "rebuild_transactions_table",
        "Rebuild transactions with a mandatory category_id and without the legacy category text",
        StepAction::Sql(
            "DROP TABLE IF EXISTS transactions_new;
            CREATE TABLE transactions_new (
                id TEXT PRIMARY KEY NOT NULL,
                account_id TEXT NOT NULL,
                amount_paise INTEGER NOT NULL,
                category_id INTEGER NOT NULL REFERENCES categories(id),
                description TEXT,
                occurred_at TEXT NOT NULL
            );
            INSERT INTO transactions_new (id, account_id, amount_paise, category_id, description, occurred_at)
                SELECT id, account_id, amount_paise, category_id, description, occurred_at
                FROM transactions;
            DROP TABLE transactions;
            ALTER TABLE transactions_new RENAME TO transactions;
            CREATE INDEX IF NOT EXISTS idx_transactions_account ON transactions(account_id);
            CREATE INDEX IF NOT EXISTS idx_transactions_occurred_at ON transactions(occurred_at);
            CREATE INDEX IF NOT EXISTS idx_transactions_category ON transactions(category_id);",
        ),
    )
    .with_rollback(StepAction::Sql("DROP TABLE IF EXISTS transactions_new;")),
];

pub const HOP_1_1_TO_1_2: HopDecl = HopDecl::new(V1_1_0, V1_2_0, Strategy::Heavyweight)
    .with_steps(V1_2_0_STEPS)
    .with_estimate(Duration::from_secs(15))
    .with_checks(HopChecks {
        count_bounds: LEDGER_NO_LOSS,
        references: &[
            ACCOUNT_REFERENCE,
            ReferenceCheck::new("transactions", "category_id", "categories", "id"),
        ],
        required_fields: &[RequiredField::new("transactions", "category_id")],
    });

// ============================================================================
// 1.2.0 -> 1.3.0: DataTransformation（账户余额）
// ============================================================================

const V1_3_0_STEPS: &[MigrationStep] = &[
    MigrationStep::new(
        "add_current_balance_column",
        "Add the current_balance_paise column to accounts",
        StepAction::Sql("ALTER TABLE accounts ADD COLUMN current_balance_paise INTEGER;"),
    )
    .with_rollback(StepAction::Transform(TransformId::DropAccountBalanceColumn)),
    MigrationStep::new(
        "compute_current_balances",
        "Compute each account's balance from its opening balance and transactions",
        StepAction::Transform(TransformId::ComputeAccountBalances),
    )
    .with_rollback(StepAction::Sql(
        "UPDATE accounts SET current_balance_paise = NULL;",
    )),
];

pub const HOP_1_2_TO_1_3: HopDecl = HopDecl::new(V1_2_0, V1_3_0, Strategy::DataTransformation)
    .with_steps(V1_3_0_STEPS)
    .with_estimate(Duration::from_secs(10))
    .with_checks(HopChecks {
        count_bounds: LEDGER_NO_LOSS,
        references: &[ACCOUNT_REFERENCE],
        required_fields: &[RequiredField::new("accounts", "current_balance_paise")],
    });

/// 全部 hop，按版本顺序排列
pub const WEALTHWISE_HOPS: &[HopDecl] = &[HOP_1_0_TO_1_1, HOP_1_1_TO_1_2, HOP_1_2_TO_1_3];

impl MigrationCatalog {
    /// WealthWise 账本的迁移目录
    pub fn wealthwise() -> Result<Self, CatalogError> {
        MigrationCatalog::new(BASELINE_SCHEMA, WEALTHWISE_HOPS)
    }
}
