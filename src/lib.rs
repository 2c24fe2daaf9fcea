// WealthWise migration library entry
// 本地财务数据的版本化迁移引擎：备份 / 执行 / 校验 / 回滚。
// 宿主应用通过 init::initialize + MigrationCoordinator::ensure_up_to_date 接入。

pub mod audit; // 迁移运行记录（只追加）
pub mod backup;
pub mod backup_common; // 校验和 / 原子写入 / 磁盘空间
pub mod config;
pub mod init;
pub mod migration;
pub mod store; // StoreEngine 边界 + SQLite 实现
pub mod version_registry;

pub use config::EngineConfig;
pub use migration::{MigrationCoordinator, MigrationError, MigrationProgress, RunOutcome};
pub use version_registry::{MigrationStatus, Version};
