//! # SQLite Store
//!
//! 基于单个 SQLite 文件的 `StoreEngine` 实现。
//!
//! ## 约定
//!
//! - 使用 `DELETE` 日志模式：存储只有一个主文件，快照 / 替换不需要处理 WAL 检查点
//! - 外键检查保持关闭：表重建（CREATE-COPY-SWAP）期间父子表会短暂不一致，
//!   引用完整性由迁移后的校验负责
//! - 快照使用 SQLite Online Backup API，保证复制到的是一致状态
//! - 内容校验和是逻辑值（schema + 排序后的记录），与页布局无关，
//!   因此恢复后可以直接与备份时的值比较

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use rusqlite::types::ValueRef;
use rusqlite::Connection;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use super::transforms;
use super::{StoreEngine, StoreError};
use crate::backup_common::log_and_skip_entry_err;
use crate::migration::definitions::{ReferenceCheck, RequiredField, SchemaChange, StepAction};

/// SQLite 附属文件后缀（恢复前必须清理，否则会被当作热日志回放）
const SIDECAR_SUFFIXES: &[&str] = &["-journal", "-wal", "-shm"];

/// 基于 SQLite 的本地存储
#[derive(Debug)]
pub struct SqliteStore {
    path: PathBuf,
    conn: Option<Connection>,
}

impl SqliteStore {
    /// 创建（不打开）
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            conn: None,
        }
    }

    /// 创建并立即打开
    pub fn open_at(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let mut store = Self::new(path);
        store.open()?;
        Ok(store)
    }

    /// 当前连接（供测试和诊断工具直接查询）
    pub fn connection(&self) -> Result<&Connection, StoreError> {
        self.conn.as_ref().ok_or(StoreError::NotOpen)
    }

    fn connection_mut(&mut self) -> Result<&mut Connection, StoreError> {
        self.conn.as_mut().ok_or(StoreError::NotOpen)
    }

    fn file_name(&self) -> Result<&std::ffi::OsStr, StoreError> {
        self.path.file_name().ok_or_else(|| {
            StoreError::Snapshot(format!("存储路径没有文件名: {}", self.path.display()))
        })
    }

    fn sidecar_path(&self, suffix: &str) -> PathBuf {
        let mut name = self.path.as_os_str().to_os_string();
        name.push(suffix);
        PathBuf::from(name)
    }

    fn configure(conn: &Connection) -> Result<(), rusqlite::Error> {
        conn.pragma_update(None, "journal_mode", &"DELETE")?;
        conn.pragma_update(None, "synchronous", &"FULL")?;
        conn.pragma_update(None, "foreign_keys", &"OFF")?;
        conn.pragma_update(None, "busy_timeout", &3000i64)?;
        Ok(())
    }
}

impl StoreEngine for SqliteStore {
    fn open(&mut self) -> Result<(), StoreError> {
        if self.conn.is_some() {
            return Ok(());
        }
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(&self.path)?;
        Self::configure(&conn)?;
        debug!("[SqliteStore] 打开存储: {}", self.path.display());
        self.conn = Some(conn);
        Ok(())
    }

    fn close(&mut self) -> Result<(), StoreError> {
        if let Some(conn) = self.conn.take() {
            conn.close().map_err(|(_, e)| StoreError::Database(e))?;
            debug!("[SqliteStore] 关闭存储: {}", self.path.display());
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.conn.is_some()
    }

    fn location(&self) -> &Path {
        &self.path
    }

    fn size_on_disk(&self) -> Result<u64, StoreError> {
        let mut total = 0u64;
        if self.path.exists() {
            total += fs::metadata(&self.path)?.len();
        }
        for suffix in SIDECAR_SUFFIXES {
            if let Ok(meta) = fs::metadata(self.sidecar_path(suffix)) {
                total += meta.len();
            }
        }
        Ok(total)
    }

    fn copy_files(&mut self, dest_dir: &Path) -> Result<Vec<PathBuf>, StoreError> {
        let dest = dest_dir.join(self.file_name()?);
        fs::create_dir_all(dest_dir)?;
        if dest.exists() {
            fs::remove_file(&dest)?;
        }

        let src_conn = self.connection()?;
        let mut dst_conn = Connection::open(&dest)?;
        {
            let backup = rusqlite::backup::Backup::new(src_conn, &mut dst_conn)?;
            backup.run_to_completion(50, Duration::from_millis(20), None)?;
        } // drop backup，释放 dst_conn 的可变借用

        // quick_check 跳过索引验证，仍能发现 B-tree 结构和行格式错误
        let check: String = dst_conn.query_row("PRAGMA quick_check", [], |row| row.get(0))?;
        if check != "ok" {
            return Err(StoreError::Integrity(format!(
                "快照完整性校验不通过 {}: {}",
                dest.display(),
                check
            )));
        }
        dst_conn.close().map_err(|(_, e)| StoreError::Database(e))?;

        debug!(
            "[SqliteStore] 快照完成: {} -> {}",
            self.path.display(),
            dest.display()
        );
        Ok(vec![dest])
    }

    fn replace_files(&mut self, source_dir: &Path) -> Result<(), StoreError> {
        let source = source_dir.join(self.file_name()?);
        if !source.is_file() {
            return Err(StoreError::Snapshot(format!(
                "快照中缺少存储文件: {}",
                source.display()
            )));
        }

        self.close()?;

        for suffix in SIDECAR_SUFFIXES {
            let sidecar = self.sidecar_path(suffix);
            if sidecar.exists() {
                fs::remove_file(&sidecar)?;
            }
        }

        // 先复制到同目录临时文件，再原子重命名覆盖
        let mut temp_name = self.file_name()?.to_os_string();
        temp_name.push(".restore-tmp");
        let temp_path = self.path.with_file_name(temp_name);
        fs::copy(&source, &temp_path)?;
        fs::File::open(&temp_path)?.sync_all()?;
        if let Err(e) = fs::rename(&temp_path, &self.path) {
            let _ = fs::remove_file(&temp_path);
            return Err(e.into());
        }

        info!(
            "[SqliteStore] 存储文件已替换: {} <- {}",
            self.path.display(),
            source.display()
        );
        self.open()
    }

    fn run_action(&mut self, action: &StepAction) -> Result<(), StoreError> {
        let conn = self.connection_mut()?;
        let tx = conn.transaction()?;
        match action {
            StepAction::Sql(script) => tx.execute_batch(script)?,
            StepAction::Transform(id) => transforms::apply(&tx, *id)?,
        }
        tx.commit()?;
        Ok(())
    }

    fn infer_schema(&mut self, changes: &[SchemaChange]) -> Result<usize, StoreError> {
        let conn = self.connection_mut()?;
        let tx = conn.transaction()?;
        let mut created = 0usize;

        for change in changes {
            match change {
                SchemaChange::AddTable { name, ddl } => {
                    if !table_exists(&tx, name)? {
                        tx.execute_batch(ddl)?;
                        created += 1;
                    }
                }
                SchemaChange::AddColumn {
                    table,
                    column,
                    definition,
                } => {
                    if !table_exists(&tx, table)? {
                        return Err(StoreError::Schema(format!(
                            "无法添加列 {}.{}: 表不存在",
                            table, column
                        )));
                    }
                    if !column_exists(&tx, table, column)? {
                        tx.execute_batch(&format!(
                            "ALTER TABLE {} ADD COLUMN {} {}",
                            quote_ident(table),
                            quote_ident(column),
                            definition
                        ))?;
                        created += 1;
                    }
                }
                SchemaChange::AddIndex { name, ddl } => {
                    if !index_exists(&tx, name)? {
                        tx.execute_batch(ddl)?;
                        created += 1;
                    }
                }
            }
        }

        tx.commit()?;
        Ok(created)
    }

    fn count_records(&mut self, collection: &str) -> Result<Option<u64>, StoreError> {
        let conn = self.connection()?;
        if !table_exists(conn, collection)? {
            return Ok(None);
        }
        let count: i64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM {}", quote_ident(collection)),
            [],
            |row| row.get(0),
        )?;
        Ok(Some(count.max(0) as u64))
    }

    fn count_dangling(&mut self, check: &ReferenceCheck) -> Result<Option<u64>, StoreError> {
        let conn = self.connection()?;
        if !column_exists(conn, check.child, check.column)?
            || !column_exists(conn, check.parent, check.parent_column)?
        {
            return Ok(None);
        }
        let sql = format!(
            "SELECT COUNT(*) FROM {child} c
             WHERE c.{col} IS NOT NULL
               AND NOT EXISTS (SELECT 1 FROM {parent} p WHERE p.{pcol} = c.{col})",
            child = quote_ident(check.child),
            col = quote_ident(check.column),
            parent = quote_ident(check.parent),
            pcol = quote_ident(check.parent_column),
        );
        let count: i64 = conn.query_row(&sql, [], |row| row.get(0))?;
        Ok(Some(count.max(0) as u64))
    }

    fn count_missing(&mut self, field: &RequiredField) -> Result<Option<u64>, StoreError> {
        let conn = self.connection()?;
        if !column_exists(conn, field.collection, field.field)? {
            return Ok(None);
        }
        let sql = format!(
            "SELECT COUNT(*) FROM {} WHERE {} IS NULL",
            quote_ident(field.collection),
            quote_ident(field.field)
        );
        let count: i64 = conn.query_row(&sql, [], |row| row.get(0))?;
        Ok(Some(count.max(0) as u64))
    }

    fn integrity_check(&mut self) -> Result<(), StoreError> {
        let conn = self.connection()?;
        let mut stmt = conn.prepare("PRAGMA integrity_check")?;
        let problems: Vec<String> = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .filter_map(log_and_skip_entry_err)
            .filter(|line| line != "ok")
            .collect();
        if problems.is_empty() {
            Ok(())
        } else {
            warn!("[SqliteStore] integrity_check 发现问题: {:?}", problems);
            Err(StoreError::Integrity(problems.join("; ")))
        }
    }

    fn content_checksum(&mut self) -> Result<String, StoreError> {
        let conn = self.connection()?;
        let canonical = canonical_content(conn)?;
        let mut hasher = Sha256::new();
        hasher.update(canonical.as_bytes());
        Ok(format!("{:x}", hasher.finalize()))
    }
}

// ============================================================================
// 辅助函数
// ============================================================================

/// 标识符加双引号（内部双引号转义）
pub(crate) fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

pub(crate) fn table_exists(conn: &Connection, table: &str) -> Result<bool, rusqlite::Error> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name=?1",
        [table],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

pub(crate) fn column_exists(
    conn: &Connection,
    table: &str,
    column: &str,
) -> Result<bool, rusqlite::Error> {
    if !table_exists(conn, table)? {
        return Ok(false);
    }
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", quote_ident(table)))?;
    let columns: Vec<String> = stmt
        .query_map([], |row| row.get::<_, String>(1))?
        .filter_map(log_and_skip_entry_err)
        .collect();
    Ok(columns.iter().any(|c| c == column))
}

pub(crate) fn index_exists(conn: &Connection, index: &str) -> Result<bool, rusqlite::Error> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type='index' AND name=?1",
        [index],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

/// 规范化的 schema + 记录文本
///
/// 表按名称排序；每张表依次输出列定义、索引、触发器，最后是排序后的记录。
/// `sqlite_` 前缀的内部表（如 `sqlite_sequence`）不参与计算。
fn canonical_content(conn: &Connection) -> Result<String, rusqlite::Error> {
    let mut canonical = String::new();

    let mut tables_stmt = conn.prepare(
        "SELECT name FROM sqlite_master
         WHERE type='table' AND name NOT LIKE 'sqlite_%'
         ORDER BY name",
    )?;
    let tables: Vec<String> = tables_stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<Result<_, _>>()?;

    for table in &tables {
        canonical.push_str("table:");
        canonical.push_str(table);
        canonical.push('\n');

        let mut columns_stmt = conn.prepare(&format!("PRAGMA table_info({})", quote_ident(table)))?;
        let columns = columns_stmt.query_map([], |row| {
            Ok((
                row.get::<_, i32>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, Option<String>>(2)?.unwrap_or_default(),
                row.get::<_, i32>(3)?,
                row.get::<_, Option<String>>(4)?.unwrap_or_default(),
                row.get::<_, i32>(5)?,
            ))
        })?;
        for column in columns {
            let (cid, name, ty, not_null, default_val, pk) = column?;
            canonical.push_str(&format!(
                "col:{}:{}:{}:{}:{}:{}\n",
                cid, name, ty, not_null, default_val, pk
            ));
        }

        let mut objects_stmt = conn.prepare(
            "SELECT type, name, IFNULL(sql, '') FROM sqlite_master
             WHERE type IN ('index', 'trigger') AND tbl_name = ?1
               AND name NOT LIKE 'sqlite_autoindex%'
             ORDER BY type, name",
        )?;
        let objects = objects_stmt.query_map([table.as_str()], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?;
        for object in objects {
            let (kind, name, sql) = object?;
            canonical.push_str(&format!("{}:{}:{}\n", kind, name, sql));
        }

        let mut rows_stmt = conn.prepare(&format!("SELECT * FROM {}", quote_ident(table)))?;
        let column_count = rows_stmt.column_count();
        let mut rows = rows_stmt.query([])?;
        let mut encoded_rows: Vec<String> = Vec::new();
        while let Some(row) = rows.next()? {
            let mut fields = Vec::with_capacity(column_count);
            for idx in 0..column_count {
                fields.push(encode_value(row.get_ref(idx)?));
            }
            encoded_rows.push(fields.join("|"));
        }
        encoded_rows.sort();
        for encoded in encoded_rows {
            canonical.push_str("row:");
            canonical.push_str(&encoded);
            canonical.push('\n');
        }
    }

    Ok(canonical)
}

fn encode_value(value: ValueRef<'_>) -> String {
    match value {
        ValueRef::Null => "N".to_string(),
        ValueRef::Integer(i) => format!("I{}", i),
        ValueRef::Real(f) => format!("R{:016x}", f.to_bits()),
        ValueRef::Text(bytes) => format!("T{}", hex::encode(bytes)),
        ValueRef::Blob(bytes) => format!("B{}", hex::encode(bytes)),
    }
}
