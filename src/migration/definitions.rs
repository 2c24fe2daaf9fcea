//! # Migration Definitions (迁移定义)
//!
//! 每个版本跃迁（hop）的静态声明，包含策略、步骤和验证配置。
//!
//! ## 设计原则
//!
//! - 策略是 hop 的静态属性，不在运行时通过 schema diff 推断
//! - 步骤是带标签的命令对象（`StepAction`），可检查、可记录、可单独测试
//! - 每个 hop 必须声明迁移后需要满足的结构性检查（`HopChecks`）
//! - 整个目录（`MigrationCatalog`）在构造时校验，错误的声明无法进入运行期

use std::time::Duration;

use serde::Serialize;

use crate::version_registry::Version;

// ============================================================================
// 策略
// ============================================================================

/// 迁移策略
///
/// 声明顺序即"要求程度"：`Lightweight < Heavyweight < DataTransformation`。
/// 多 hop 计划取其中要求最高的策略。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum Strategy {
    /// 仅追加式 schema 变更，由存储引擎的推断钩子完成
    Lightweight,
    /// 结构 / 关系变更，需要自定义步骤
    Heavyweight,
    /// 业务数据重算 / 回填，需要自定义步骤
    DataTransformation,
}

impl Strategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Strategy::Lightweight => "lightweight",
            Strategy::Heavyweight => "heavyweight",
            Strategy::DataTransformation => "data_transformation",
        }
    }

    /// 是否需要自定义步骤
    pub fn requires_custom_steps(&self) -> bool {
        !matches!(self, Strategy::Lightweight)
    }
}

// ============================================================================
// Schema 变更（推断钩子输入）
// ============================================================================

/// 追加式 schema 变更
///
/// 推断钩子按"缺什么补什么"的方式应用，重复执行无副作用。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SchemaChange {
    /// 新建表（`ddl` 为完整的 CREATE TABLE 语句）
    AddTable {
        name: &'static str,
        ddl: &'static str,
    },
    /// 新增可空列或带默认值的列
    AddColumn {
        table: &'static str,
        column: &'static str,
        definition: &'static str,
    },
    /// 新建索引（`ddl` 为完整的 CREATE INDEX 语句）
    AddIndex {
        name: &'static str,
        ddl: &'static str,
    },
}

impl SchemaChange {
    pub fn describe(&self) -> String {
        match self {
            SchemaChange::AddTable { name, .. } => format!("add table {}", name),
            SchemaChange::AddColumn { table, column, .. } => {
                format!("add column {}.{}", table, column)
            }
            SchemaChange::AddIndex { name, .. } => format!("add index {}", name),
        }
    }
}

// ============================================================================
// 步骤
// ============================================================================

/// 命名数据变换
///
/// 由存储引擎基于记录级读写原语实现（见 `store::transforms`）。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum TransformId {
    /// 为每笔交易写入 `category_id`（按分类名称匹配）
    BackfillCategoryIds,
    /// 撤销 `category_id` 列（存在时删除）
    DropTransactionCategoryLink,
    /// 计算每个账户的当前余额
    ComputeAccountBalances,
    /// 撤销 `current_balance_paise` 列（存在时删除）
    DropAccountBalanceColumn,
}

impl TransformId {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransformId::BackfillCategoryIds => "backfill_category_ids",
            TransformId::DropTransactionCategoryLink => "drop_transaction_category_link",
            TransformId::ComputeAccountBalances => "compute_account_balances",
            TransformId::DropAccountBalanceColumn => "drop_account_balance_column",
        }
    }
}

/// 步骤动作（带标签的命令对象）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum StepAction {
    /// 在单个事务中执行的 SQL 脚本
    Sql(&'static str),
    /// 命名的记录级数据变换
    Transform(TransformId),
}

impl StepAction {
    /// 日志用的简短描述
    pub fn describe(&self) -> String {
        match self {
            StepAction::Sql(script) => {
                const MAX_LEN: usize = 72;
                let compact = script.split_whitespace().collect::<Vec<_>>().join(" ");
                if compact.len() <= MAX_LEN {
                    format!("sql: {}", compact)
                } else {
                    let cut = compact
                        .char_indices()
                        .map(|(i, _)| i)
                        .take_while(|i| *i <= MAX_LEN)
                        .last()
                        .unwrap_or(0);
                    format!("sql: {}...", &compact[..cut])
                }
            }
            StepAction::Transform(id) => format!("transform: {}", id.as_str()),
        }
    }
}

/// 迁移步骤
///
/// `rollback` 是该步骤自身的局部补偿动作，仅在该步骤失败时执行。
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MigrationStep {
    pub name: &'static str,
    pub description: &'static str,
    pub action: StepAction,
    pub rollback: Option<StepAction>,
}

impl MigrationStep {
    pub const fn new(name: &'static str, description: &'static str, action: StepAction) -> Self {
        Self {
            name,
            description,
            action,
            rollback: None,
        }
    }

    /// 设置补偿动作
    pub const fn with_rollback(mut self, rollback: StepAction) -> Self {
        self.rollback = Some(rollback);
        self
    }
}

// ============================================================================
// 验证配置
// ============================================================================

/// 记录数下限：迁移后数量 / 迁移前数量 必须 ≥ `min_ratio`
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CountBound {
    pub collection: &'static str,
    pub min_ratio: f64,
}

impl CountBound {
    /// 不允许任何记录丢失
    pub const fn no_loss(collection: &'static str) -> Self {
        Self {
            collection,
            min_ratio: 1.0,
        }
    }
}

/// 引用完整性检查：`child.column` 的非空值必须能在 `parent.parent_column` 中找到
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct ReferenceCheck {
    pub child: &'static str,
    pub column: &'static str,
    pub parent: &'static str,
    pub parent_column: &'static str,
}

impl ReferenceCheck {
    pub const fn new(
        child: &'static str,
        column: &'static str,
        parent: &'static str,
        parent_column: &'static str,
    ) -> Self {
        Self {
            child,
            column,
            parent,
            parent_column,
        }
    }
}

/// 必填字段检查：`collection` 中所有记录的 `field` 都不为空
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct RequiredField {
    pub collection: &'static str,
    pub field: &'static str,
}

impl RequiredField {
    pub const fn new(collection: &'static str, field: &'static str) -> Self {
        Self { collection, field }
    }
}

/// 单个 hop 声明的迁移后检查
#[derive(Debug, Clone, Copy, Serialize)]
pub struct HopChecks {
    pub count_bounds: &'static [CountBound],
    pub references: &'static [ReferenceCheck],
    pub required_fields: &'static [RequiredField],
}

impl HopChecks {
    pub const fn none() -> Self {
        Self {
            count_bounds: &[],
            references: &[],
            required_fields: &[],
        }
    }
}

/// 计划级验证配置（合并计划内所有 hop 的检查）
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ValidationSpec {
    pub count_bounds: Vec<CountBound>,
    pub references: Vec<ReferenceCheck>,
    pub required_fields: Vec<RequiredField>,
}

impl ValidationSpec {
    /// 合并一个 hop 的检查
    ///
    /// 同一集合的记录数下限取最严格值；引用和必填字段去重。
    pub fn merge(&mut self, checks: &HopChecks) {
        for bound in checks.count_bounds {
            match self
                .count_bounds
                .iter_mut()
                .find(|b| b.collection == bound.collection)
            {
                Some(existing) => existing.min_ratio = existing.min_ratio.max(bound.min_ratio),
                None => self.count_bounds.push(*bound),
            }
        }
        for reference in checks.references {
            if !self.references.contains(reference) {
                self.references.push(*reference);
            }
        }
        for field in checks.required_fields {
            if !self.required_fields.contains(field) {
                self.required_fields.push(*field);
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.count_bounds.is_empty() && self.references.is_empty() && self.required_fields.is_empty()
    }
}

// ============================================================================
// Hop 声明
// ============================================================================

/// 单个版本跃迁的静态声明
#[derive(Debug, Clone, Copy)]
pub struct HopDecl {
    pub from: Version,
    pub to: Version,
    pub strategy: Strategy,
    /// 由推断钩子应用的追加式变更（在本 hop 的自定义步骤之前执行）
    pub schema_changes: &'static [SchemaChange],
    /// 自定义步骤（Lightweight 必须为空）
    pub steps: &'static [MigrationStep],
    /// 静态耗时估计，仅用于进度展示
    pub estimated_duration: Duration,
    pub checks: HopChecks,
}

impl HopDecl {
    pub const fn new(from: Version, to: Version, strategy: Strategy) -> Self {
        Self {
            from,
            to,
            strategy,
            schema_changes: &[],
            steps: &[],
            estimated_duration: Duration::from_secs(1),
            checks: HopChecks::none(),
        }
    }

    pub const fn with_schema_changes(mut self, changes: &'static [SchemaChange]) -> Self {
        self.schema_changes = changes;
        self
    }

    pub const fn with_steps(mut self, steps: &'static [MigrationStep]) -> Self {
        self.steps = steps;
        self
    }

    pub const fn with_estimate(mut self, estimate: Duration) -> Self {
        self.estimated_duration = estimate;
        self
    }

    pub const fn with_checks(mut self, checks: HopChecks) -> Self {
        self.checks = checks;
        self
    }
}

// ============================================================================
// 目录
// ============================================================================

/// 目录声明错误
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CatalogError {
    #[error("Catalog declares no hops")]
    Empty,

    #[error("Hop {from} -> {to} does not move forward")]
    NonIncreasing { from: Version, to: Version },

    #[error("Gap between hops: {previous_to} is followed by a hop starting at {next_from}")]
    Gap {
        previous_to: Version,
        next_from: Version,
    },

    #[error("Lightweight hop {from} -> {to} must not declare custom steps")]
    LightweightWithSteps { from: Version, to: Version },

    #[error("{strategy} hop {from} -> {to} must declare at least one step")]
    MissingSteps {
        from: Version,
        to: Version,
        strategy: &'static str,
    },

    #[error("Step '{step}' in hop {from} -> {to} has no rollback and is not the first step")]
    UncompensatedStep {
        from: Version,
        to: Version,
        step: &'static str,
    },

    #[error("Duplicate step name '{step}' in hop {from} -> {to}")]
    DuplicateStep {
        from: Version,
        to: Version,
        step: &'static str,
    },
}

/// 迁移目录：受支持的版本 + 每个相邻版本对的 hop 声明
#[derive(Debug, Clone)]
pub struct MigrationCatalog {
    /// 最低版本的基线 schema（全新安装时由推断钩子创建）
    baseline: &'static [SchemaChange],
    hops: Vec<HopDecl>,
    supported: Vec<Version>,
}

impl MigrationCatalog {
    /// 构造并校验目录
    ///
    /// 支持的版本列表由 hop 链推导：第一个 hop 的 `from` 加上每个 hop 的 `to`。
    pub fn new(
        baseline: &'static [SchemaChange],
        hops: &[HopDecl],
    ) -> Result<Self, CatalogError> {
        let first = hops.first().ok_or(CatalogError::Empty)?;

        let mut supported = vec![first.from];
        for (idx, hop) in hops.iter().enumerate() {
            if hop.from >= hop.to {
                return Err(CatalogError::NonIncreasing {
                    from: hop.from,
                    to: hop.to,
                });
            }
            if idx > 0 && hops[idx - 1].to != hop.from {
                return Err(CatalogError::Gap {
                    previous_to: hops[idx - 1].to,
                    next_from: hop.from,
                });
            }
            Self::check_hop_steps(hop)?;
            supported.push(hop.to);
        }

        Ok(Self {
            baseline,
            hops: hops.to_vec(),
            supported,
        })
    }

    fn check_hop_steps(hop: &HopDecl) -> Result<(), CatalogError> {
        match hop.strategy {
            Strategy::Lightweight if !hop.steps.is_empty() => {
                return Err(CatalogError::LightweightWithSteps {
                    from: hop.from,
                    to: hop.to,
                });
            }
            strategy if strategy.requires_custom_steps() && hop.steps.is_empty() => {
                return Err(CatalogError::MissingSteps {
                    from: hop.from,
                    to: hop.to,
                    strategy: strategy.as_str(),
                });
            }
            _ => {}
        }

        for (idx, step) in hop.steps.iter().enumerate() {
            if idx > 0 && step.rollback.is_none() {
                return Err(CatalogError::UncompensatedStep {
                    from: hop.from,
                    to: hop.to,
                    step: step.name,
                });
            }
            if hop.steps[..idx].iter().any(|s| s.name == step.name) {
                return Err(CatalogError::DuplicateStep {
                    from: hop.from,
                    to: hop.to,
                    step: step.name,
                });
            }
        }
        Ok(())
    }

    pub fn baseline(&self) -> &'static [SchemaChange] {
        self.baseline
    }

    pub fn hops(&self) -> &[HopDecl] {
        &self.hops
    }

    pub fn supported_versions(&self) -> &[Version] {
        &self.supported
    }

    pub fn latest_version(&self) -> Version {
        self.supported[self.supported.len() - 1]
    }

    pub fn is_supported(&self, version: Version) -> bool {
        self.supported.contains(&version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const V1: Version = Version::new(1, 0, 0);
    const V2: Version = Version::new(1, 1, 0);
    const V3: Version = Version::new(1, 2, 0);

    const CREATE_STEP: MigrationStep = MigrationStep::new(
        "create_tags",
        "create tags table",
        StepAction::Sql("CREATE TABLE tags (id INTEGER PRIMARY KEY);"),
    );
    const FILL_STEP: MigrationStep = MigrationStep::new(
        "fill_tags",
        "seed tags",
        StepAction::Sql("INSERT INTO tags (id) VALUES (1);"),
    )
    .with_rollback(StepAction::Sql("DELETE FROM tags;"));

    #[test]
    fn test_strategy_demand_ordering() {
        assert!(Strategy::Lightweight < Strategy::Heavyweight);
        assert!(Strategy::Heavyweight < Strategy::DataTransformation);
        assert_eq!(
            [Strategy::Heavyweight, Strategy::Lightweight, Strategy::DataTransformation]
                .into_iter()
                .max(),
            Some(Strategy::DataTransformation)
        );
    }

    #[test]
    fn test_catalog_derives_supported_versions() {
        static STEPS: [MigrationStep; 2] = [CREATE_STEP, FILL_STEP];
        let catalog = MigrationCatalog::new(
            &[],
            &[
                HopDecl::new(V1, V2, Strategy::Lightweight),
                HopDecl::new(V2, V3, Strategy::Heavyweight).with_steps(&STEPS),
            ],
        )
        .unwrap();

        assert_eq!(catalog.supported_versions(), &[V1, V2, V3]);
        assert_eq!(catalog.latest_version(), V3);
        assert!(catalog.is_supported(V2));
        assert!(!catalog.is_supported(Version::new(1, 5, 0)));
    }

    #[test]
    fn test_catalog_rejects_gap() {
        let err = MigrationCatalog::new(
            &[],
            &[
                HopDecl::new(V1, V2, Strategy::Lightweight),
                HopDecl::new(Version::new(1, 1, 5), V3, Strategy::Lightweight),
            ],
        )
        .unwrap_err();
        assert!(matches!(err, CatalogError::Gap { .. }));
    }

    #[test]
    fn test_catalog_rejects_lightweight_with_steps() {
        static STEPS: [MigrationStep; 1] = [CREATE_STEP];
        let err = MigrationCatalog::new(
            &[],
            &[HopDecl::new(V1, V2, Strategy::Lightweight).with_steps(&STEPS)],
        )
        .unwrap_err();
        assert!(matches!(err, CatalogError::LightweightWithSteps { .. }));
    }

    #[test]
    fn test_catalog_rejects_heavyweight_without_steps() {
        let err =
            MigrationCatalog::new(&[], &[HopDecl::new(V1, V2, Strategy::Heavyweight)]).unwrap_err();
        assert!(matches!(err, CatalogError::MissingSteps { .. }));
    }

    #[test]
    fn test_catalog_rejects_uncompensated_middle_step() {
        static STEPS: [MigrationStep; 2] = [FILL_STEP, CREATE_STEP];
        let err = MigrationCatalog::new(
            &[],
            &[HopDecl::new(V1, V2, Strategy::DataTransformation).with_steps(&STEPS)],
        )
        .unwrap_err();
        assert_eq!(
            err,
            CatalogError::UncompensatedStep {
                from: V1,
                to: V2,
                step: "create_tags"
            }
        );
    }

    #[test]
    fn test_validation_spec_merge_keeps_strictest_bound() {
        static LOOSE: [CountBound; 1] = [CountBound {
            collection: "transactions",
            min_ratio: 0.5,
        }];
        static STRICT: [CountBound; 1] = [CountBound::no_loss("transactions")];
        static REFS: [ReferenceCheck; 1] =
            [ReferenceCheck::new("transactions", "account_id", "accounts", "id")];

        let mut merged = ValidationSpec::default();
        merged.merge(&HopChecks {
            count_bounds: &LOOSE,
            references: &REFS,
            required_fields: &[],
        });
        merged.merge(&HopChecks {
            count_bounds: &STRICT,
            references: &REFS,
            required_fields: &[],
        });

        assert_eq!(merged.count_bounds.len(), 1);
        assert_eq!(merged.count_bounds[0].min_ratio, 1.0);
        assert_eq!(merged.references.len(), 1);
    }

    #[test]
    fn test_step_action_describe_truncates_long_sql() {
        let action = StepAction::Sql(
            "INSERT INTO categories (name) SELECT DISTINCT COALESCE(NULLIF(TRIM(category), ''), 'Uncategorized') FROM transactions;",
        );
        let described = action.describe();
        assert!(described.starts_with("sql: INSERT INTO categories"));
        assert!(described.ends_with("..."));
        assert_eq!(
            StepAction::Transform(TransformId::BackfillCategoryIds).describe(),
            "transform: backfill_category_ids"
        );
    }
}
