//! # Store 模块
//!
//! 本地财务数据存储的引擎边界。
//!
//! 迁移引擎本身不理解具体的存储格式，只通过 `StoreEngine` 提供的原语操作存储：
//! - 文件级：快照复制、整体替换、磁盘占用
//! - 结构级：追加式 schema 推断（Lightweight hop）
//! - 记录级：执行步骤动作、计数、引用 / 必填字段检查
//! - 完整性：引擎自检、逻辑内容校验和
//!
//! `SqliteStore` 是随 crate 提供的参考实现，测试均基于它运行。

pub mod sqlite;
pub mod transforms;

pub use sqlite::SqliteStore;

use std::path::{Path, PathBuf};

use crate::migration::definitions::{ReferenceCheck, RequiredField, SchemaChange, StepAction};

/// 存储引擎错误
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Store is not open")]
    NotOpen,

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Schema error: {0}")]
    Schema(String),

    #[error("Integrity check failed: {0}")]
    Integrity(String),

    #[error("Transform '{transform}' failed: {reason}")]
    Transform {
        transform: &'static str,
        reason: String,
    },

    #[error("Snapshot error: {0}")]
    Snapshot(String),
}

/// 存储引擎抽象
///
/// 实现方必须保证：
/// - `run_action` 要么完整生效，要么不留下任何痕迹
/// - `infer_schema` 幂等，重复执行不会报错
/// - `copy_files` 得到的是一致性快照（不会复制到写了一半的页）
pub trait StoreEngine: Send {
    fn open(&mut self) -> Result<(), StoreError>;

    fn close(&mut self) -> Result<(), StoreError>;

    fn is_open(&self) -> bool;

    /// 存储主文件位置（用于日志和磁盘空间检查）
    fn location(&self) -> &Path;

    /// 存储在磁盘上的总字节数
    fn size_on_disk(&self) -> Result<u64, StoreError>;

    /// 将存储的一致性快照写入 `dest_dir`，返回写入的文件列表
    fn copy_files(&mut self, dest_dir: &Path) -> Result<Vec<PathBuf>, StoreError>;

    /// 用 `source_dir` 中的快照替换存储文件（关闭 → 替换 → 重新打开）
    fn replace_files(&mut self, source_dir: &Path) -> Result<(), StoreError>;

    /// 执行一个步骤动作
    fn run_action(&mut self, action: &StepAction) -> Result<(), StoreError>;

    /// 应用缺失的追加式变更，返回实际创建的对象数量
    fn infer_schema(&mut self, changes: &[SchemaChange]) -> Result<usize, StoreError>;

    /// 集合记录数；集合不存在时返回 `None`
    fn count_records(&mut self, collection: &str) -> Result<Option<u64>, StoreError>;

    /// 悬空引用数；子 / 父集合或列不存在时返回 `None`
    fn count_dangling(&mut self, check: &ReferenceCheck) -> Result<Option<u64>, StoreError>;

    /// 必填字段缺失的记录数；集合或字段不存在时返回 `None`
    fn count_missing(&mut self, field: &RequiredField) -> Result<Option<u64>, StoreError>;

    /// 引擎自检
    fn integrity_check(&mut self) -> Result<(), StoreError>;

    /// 与物理布局无关的逻辑内容校验和（schema + 全部记录）
    fn content_checksum(&mut self) -> Result<String, StoreError>;
}
