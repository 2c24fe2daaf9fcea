//! # 宿主初始化
//!
//! 宿主应用启动时：
//!
//! ```rust,ignore
//! let coordinator = Arc::new(init::initialize(EngineConfig::load(None)?)?);
//! let mut handle = init::spawn_migration(Arc::clone(&coordinator));
//! while let Some(p) = handle.progress.recv().await {
//!     splash.set_progress(p.fraction, &p.message);
//! }
//! let outcome = handle.wait().await?;
//! ```
//!
//! 迁移在阻塞线程池中运行，UI 线程只接收进度。开始后不支持取消。

use std::sync::Arc;

use tokio::sync::mpsc::{self, UnboundedReceiver};
use tokio::task::JoinHandle;
use tracing::info;

use crate::config::EngineConfig;
use crate::migration::{
    MigrationCatalog, MigrationCoordinator, MigrationError, MigrationProgress, RunOutcome,
};
use crate::store::SqliteStore;

/// 用 SQLite 存储和 WealthWise 迁移目录创建协调器
pub fn initialize(config: EngineConfig) -> Result<MigrationCoordinator, MigrationError> {
    let catalog = MigrationCatalog::wealthwise()?;
    let store = SqliteStore::new(config.store_path());
    info!(
        "[Init] 数据目录: {}, 目标版本: {}",
        config.data_dir.display(),
        catalog.latest_version()
    );
    MigrationCoordinator::new(config, Box::new(store), catalog)
}

/// 后台迁移句柄
#[derive(Debug)]
pub struct MigrationHandle {
    pub progress: UnboundedReceiver<MigrationProgress>,
    pub result: JoinHandle<Result<RunOutcome, MigrationError>>,
}

impl MigrationHandle {
    /// 等待迁移结束（未读取的进度事件会被丢弃）
    pub async fn wait(self) -> Result<RunOutcome, MigrationError> {
        self.result
            .await
            .map_err(|e| MigrationError::Internal(format!("migration task failed: {}", e)))?
    }
}

/// 在阻塞线程池中运行 `ensure_up_to_date`
pub fn spawn_migration(coordinator: Arc<MigrationCoordinator>) -> MigrationHandle {
    let (tx, rx) = mpsc::unbounded_channel::<MigrationProgress>();
    let result = tokio::task::spawn_blocking(move || {
        let sink = move |fraction: f64, message: &str| {
            // 接收端已关闭时忽略
            let _ = tx.send(MigrationProgress {
                fraction,
                message: message.to_string(),
            });
        };
        coordinator.ensure_up_to_date(&sink)
    });
    MigrationHandle {
        progress: rx,
        result,
    }
}
