//! # 命名数据变换
//!
//! `StepAction::Transform` 在 SQLite 上的实现。
//! 调用方（`SqliteStore::run_action`）负责事务，这里只做记录级读写。

use std::collections::HashMap;

use rusqlite::{params, Connection};
use tracing::debug;

use super::sqlite::{column_exists, quote_ident, table_exists};
use super::StoreError;
use crate::migration::definitions::TransformId;
use crate::migration::wealthwise::UNCATEGORIZED;

pub(crate) fn apply(conn: &Connection, id: TransformId) -> Result<(), StoreError> {
    debug!("[Transforms] 执行数据变换: {}", id.as_str());
    match id {
        TransformId::BackfillCategoryIds => backfill_category_ids(conn),
        TransformId::DropTransactionCategoryLink => {
            conn.execute_batch("DROP INDEX IF EXISTS idx_transactions_category;")?;
            drop_column_if_exists(conn, "transactions", "category_id")
        }
        TransformId::ComputeAccountBalances => compute_account_balances(conn),
        TransformId::DropAccountBalanceColumn => {
            drop_column_if_exists(conn, "accounts", "current_balance_paise")
        }
    }
}

fn transform_error(id: TransformId, reason: impl Into<String>) -> StoreError {
    StoreError::Transform {
        transform: id.as_str(),
        reason: reason.into(),
    }
}

/// 为每笔交易写入 `category_id`
///
/// 分类名去掉首尾空格后匹配 `categories.name`；空值归入 "Uncategorized"。
/// 列不带 REFERENCES 约束：SQLite 无法 DROP 被外键引用的列，补偿动作会失败。
fn backfill_category_ids(conn: &Connection) -> Result<(), StoreError> {
    const ID: TransformId = TransformId::BackfillCategoryIds;

    if !table_exists(conn, "categories")? {
        return Err(transform_error(ID, "categories table does not exist"));
    }
    if !column_exists(conn, "transactions", "category_id")? {
        conn.execute_batch("ALTER TABLE transactions ADD COLUMN category_id INTEGER;")?;
    }

    let mut categories: HashMap<String, i64> = HashMap::new();
    {
        let mut stmt = conn.prepare("SELECT id, name FROM categories")?;
        let rows = stmt.query_map([], |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?)))?;
        for row in rows {
            let (id, name) = row?;
            categories.insert(name, id);
        }
    }

    let pending: Vec<(String, Option<String>)> = {
        let mut stmt = conn.prepare("SELECT id, category FROM transactions")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, Option<String>>(1)?))
        })?;
        rows.collect::<Result<_, _>>()?
    };

    let mut update = conn.prepare("UPDATE transactions SET category_id = ?1 WHERE id = ?2")?;
    for (txn_id, category) in &pending {
        let name = category
            .as_deref()
            .map(|c| c.trim_matches(' '))
            .filter(|c| !c.is_empty())
            .unwrap_or(UNCATEGORIZED);
        let category_id = categories.get(name).ok_or_else(|| {
            transform_error(
                ID,
                format!("transaction {} refers to unknown category '{}'", txn_id, name),
            )
        })?;
        update.execute(params![category_id, txn_id])?;
    }

    debug!(
        "[Transforms] backfill_category_ids: {} transactions, {} categories",
        pending.len(),
        categories.len()
    );
    Ok(())
}

/// 当前余额 = 期初余额 + 该账户全部交易金额之和
fn compute_account_balances(conn: &Connection) -> Result<(), StoreError> {
    const ID: TransformId = TransformId::ComputeAccountBalances;

    if !column_exists(conn, "accounts", "current_balance_paise")? {
        return Err(transform_error(ID, "accounts.current_balance_paise does not exist"));
    }

    let accounts: Vec<(String, i64)> = {
        let mut stmt = conn.prepare("SELECT id, opening_balance_paise FROM accounts")?;
        let rows =
            stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?;
        rows.collect::<Result<_, _>>()?
    };

    let mut sum_stmt = conn.prepare(
        "SELECT COALESCE(SUM(amount_paise), 0) FROM transactions WHERE account_id = ?1",
    )?;
    let mut update =
        conn.prepare("UPDATE accounts SET current_balance_paise = ?1 WHERE id = ?2")?;

    for (account_id, opening) in &accounts {
        let movement: i64 = sum_stmt.query_row([account_id], |row| row.get(0))?;
        let balance = opening.checked_add(movement).ok_or_else(|| {
            transform_error(ID, format!("balance overflow for account {}", account_id))
        })?;
        update.execute(params![balance, account_id])?;
    }

    debug!(
        "[Transforms] compute_account_balances: {} accounts",
        accounts.len()
    );
    Ok(())
}

fn drop_column_if_exists(conn: &Connection, table: &str, column: &str) -> Result<(), StoreError> {
    if column_exists(conn, table, column)? {
        conn.execute_batch(&format!(
            "ALTER TABLE {} DROP COLUMN {};",
            quote_ident(table),
            quote_ident(column)
        ))?;
    }
    Ok(())
}
