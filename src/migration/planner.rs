//! # Migration Planner (迁移计划)
//!
//! 把 `(from, to)` 版本区间展开为一个扁平化的 `MigrationPlan`。
//!
//! - 沿受支持版本列表逐个相邻版本对取 hop
//! - 步骤按版本顺序拼接
//! - 策略取所有 hop 中要求最高的
//! - 预计耗时为各 hop 静态估计之和
//! - 每个 hop 的检查合并为计划级 `ValidationSpec`

use std::ops::Range;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use super::definitions::{MigrationCatalog, MigrationStep, SchemaChange, Strategy, ValidationSpec};
use super::MigrationError;
use crate::version_registry::Version;

/// 计划内保留的 hop 边界
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlannedHop {
    pub from: Version,
    pub to: Version,
    pub strategy: Strategy,
    /// 由推断钩子在本 hop 步骤之前应用
    pub schema_changes: &'static [SchemaChange],
    /// 本 hop 的步骤在 `MigrationPlan::steps` 中的下标区间
    pub step_range: Range<usize>,
    pub estimated_duration: Duration,
}

/// 迁移计划（创建后不可变）
#[derive(Debug, Clone, Serialize)]
pub struct MigrationPlan {
    from: Version,
    to: Version,
    strategy: Strategy,
    steps: Vec<MigrationStep>,
    estimated_duration: Duration,
    backup_required: bool,
    hops: Vec<PlannedHop>,
    checks: ValidationSpec,
}

impl MigrationPlan {
    pub fn from(&self) -> Version {
        self.from
    }

    pub fn to(&self) -> Version {
        self.to
    }

    pub fn strategy(&self) -> Strategy {
        self.strategy
    }

    pub fn steps(&self) -> &[MigrationStep] {
        &self.steps
    }

    pub fn estimated_duration(&self) -> Duration {
        self.estimated_duration
    }

    pub fn backup_required(&self) -> bool {
        self.backup_required
    }

    pub fn hops(&self) -> &[PlannedHop] {
        &self.hops
    }

    pub fn checks(&self) -> &ValidationSpec {
        &self.checks
    }

    /// 日志 / 运行记录用的一行摘要
    pub fn describe(&self) -> String {
        let hops = self
            .hops
            .iter()
            .map(|h| format!("{}->{} ({})", h.from, h.to, h.strategy.as_str()))
            .collect::<Vec<_>>()
            .join(", ");
        format!(
            "{} -> {} [{}], {} step(s), ~{}s: {}",
            self.from,
            self.to,
            self.strategy.as_str(),
            self.steps.len(),
            self.estimated_duration.as_secs(),
            hops
        )
    }
}

/// 迁移计划器
#[derive(Debug, Clone)]
pub struct MigrationPlanner {
    catalog: Arc<MigrationCatalog>,
}

impl MigrationPlanner {
    pub fn new(catalog: Arc<MigrationCatalog>) -> Self {
        Self { catalog }
    }

    pub fn catalog(&self) -> &MigrationCatalog {
        &self.catalog
    }

    pub fn plan(&self, from: Version, to: Version) -> Result<MigrationPlan, MigrationError> {
        let incompatible = |reason: String| MigrationError::IncompatibleVersion { from, to, reason };

        if from >= to {
            return Err(incompatible(format!(
                "target version {} is not newer than {}",
                to, from
            )));
        }
        for version in [from, to] {
            if !self.catalog.is_supported(version) {
                return Err(incompatible(format!("version {} is not supported", version)));
            }
        }

        let mut steps: Vec<MigrationStep> = Vec::new();
        let mut hops: Vec<PlannedHop> = Vec::new();
        let mut checks = ValidationSpec::default();
        let mut strategy = Strategy::Lightweight;
        let mut estimated_duration = Duration::ZERO;

        for hop in self
            .catalog
            .hops()
            .iter()
            .filter(|h| h.from >= from && h.to <= to)
        {
            let start = steps.len();
            for step in hop.steps {
                // 计划中第一个之后的步骤必须可以局部补偿
                if !steps.is_empty() && step.rollback.is_none() {
                    return Err(incompatible(format!(
                        "step '{}' has no rollback and cannot run after earlier steps",
                        step.name
                    )));
                }
                steps.push(step.clone());
            }

            hops.push(PlannedHop {
                from: hop.from,
                to: hop.to,
                strategy: hop.strategy,
                schema_changes: hop.schema_changes,
                step_range: start..steps.len(),
                estimated_duration: hop.estimated_duration,
            });
            checks.merge(&hop.checks);
            strategy = strategy.max(hop.strategy);
            estimated_duration += hop.estimated_duration;
        }

        // 目录保证 hop 连续；这里再确认一次路径首尾相接
        let connected = hops.first().map(|h| h.from) == Some(from)
            && hops.last().map(|h| h.to) == Some(to)
            && hops.windows(2).all(|w| w[0].to == w[1].from);
        if !connected {
            return Err(incompatible("no migration path".to_string()));
        }

        Ok(MigrationPlan {
            from,
            to,
            strategy,
            steps,
            estimated_duration,
            // 所有策略都会修改存储，一律先备份
            backup_required: true,
            hops,
            checks,
        })
    }
}
