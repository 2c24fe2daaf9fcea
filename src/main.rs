//! wealthwise-migrate: 迁移引擎运维命令行
//!
//! ```text
//! wealthwise-migrate --data-dir ~/.wealthwise status
//! wealthwise-migrate migrate
//! wealthwise-migrate backups --all
//! wealthwise-migrate rollback 1.2.0
//! wealthwise-migrate prune
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::EnvFilter;

use wealthwise_migration::backup::Backup;
use wealthwise_migration::init::{initialize, spawn_migration};
use wealthwise_migration::{EngineConfig, Version};

#[derive(Parser)]
#[command(name = "wealthwise-migrate")]
#[command(about = "Inspect and migrate WealthWise local data")]
struct Cli {
    /// TOML 配置文件
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// 覆盖配置中的数据目录
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// 当前版本 / 最新版本
    Status,
    /// 迁移到最新版本
    Migrate,
    /// 列出备份
    Backups {
        /// 包含已被回滚使用的备份
        #[arg(long)]
        all: bool,
    },
    /// 恢复到指定版本的最新备份
    Rollback { version: Version },
    /// 按保留策略清理备份
    Prune,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(LevelFilter::INFO.into()))
        .init();

    let cli = Cli::parse();
    let mut config = EngineConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;
    if let Some(data_dir) = cli.data_dir {
        config.data_dir = data_dir;
    }
    let coordinator = Arc::new(initialize(config).context("Failed to open WealthWise data")?);

    match cli.command {
        Command::Status => {
            let status = coordinator.migration_status()?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        Command::Migrate => {
            let mut handle = spawn_migration(Arc::clone(&coordinator));
            while let Some(progress) = handle.progress.recv().await {
                println!("{:>5.1}% {}", progress.fraction * 100.0, progress.message);
            }
            match handle.wait().await {
                Ok(outcome) => println!("{}", serde_json::to_string_pretty(&outcome)?),
                Err(e) if e.requires_manual_recovery() => {
                    eprintln!("Data could not be restored automatically. Export your data and contact support.");
                    return Err(e.into());
                }
                Err(e) => return Err(e.into()),
            }
        }
        Command::Backups { all } => {
            let backups = if all {
                coordinator.list_all_backups()?
            } else {
                coordinator.list_backups()?
            };
            print_backups(&backups);
            println!("Backup storage: {} bytes", coordinator.backup_storage_bytes());
        }
        Command::Rollback { version } => {
            let backup = coordinator.rollback_to_version(version)?;
            println!("Restored backup {} ({})", backup.id, backup.source_version);
        }
        Command::Prune => {
            let deleted = coordinator.prune_backups()?;
            println!("Deleted {} backup(s)", deleted.len());
            for id in deleted {
                println!("  {}", id);
            }
        }
    }
    Ok(())
}

fn print_backups(backups: &[Backup]) {
    if backups.is_empty() {
        println!("No backups");
        return;
    }
    for backup in backups {
        println!(
            "{}  {}  {:>10} bytes  {}",
            backup.id,
            backup.source_version,
            backup.size_bytes,
            backup.created_at.to_rfc3339()
        );
    }
}
