//! # Migration Validator (迁移验证)
//!
//! 迁移执行完毕后的结构性检查。
//!
//! ## 验证内容
//!
//! - 记录数下限（相对迁移前的计数）
//! - 引用完整性（无悬空引用）
//! - 必填字段存在且非空
//! - 存储引擎自检
//!
//! 所有问题都会收集到 `ValidationResult::issues`，不会在第一个问题处停止。

use std::collections::BTreeMap;

use serde::Serialize;
use tracing::{debug, warn};

use super::planner::MigrationPlan;
use crate::store::{StoreEngine, StoreError};

/// 迁移前的记录数快照
///
/// 集合不存在时记录为 `None`。
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CountSnapshot {
    counts: BTreeMap<String, Option<u64>>,
}

impl CountSnapshot {
    pub fn get(&self, collection: &str) -> Option<u64> {
        self.counts.get(collection).copied().flatten()
    }

    pub fn len(&self) -> usize {
        self.counts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }
}

/// 验证结果
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValidationResult {
    pub is_valid: bool,
    pub issues: Vec<String>,
}

impl ValidationResult {
    fn from_issues(issues: Vec<String>) -> Self {
        Self {
            is_valid: issues.is_empty(),
            issues,
        }
    }
}

/// 迁移验证器
#[derive(Debug, Clone, Copy, Default)]
pub struct Validator;

impl Validator {
    pub fn new() -> Self {
        Self
    }

    /// 记录计划检查涉及的所有集合的当前记录数
    pub fn capture_counts(
        &self,
        plan: &MigrationPlan,
        store: &mut dyn StoreEngine,
    ) -> Result<CountSnapshot, StoreError> {
        let mut snapshot = CountSnapshot::default();
        for bound in &plan.checks().count_bounds {
            let count = store.count_records(bound.collection)?;
            snapshot.counts.insert(bound.collection.to_string(), count);
        }
        debug!("[Validator] 迁移前记录数: {:?}", snapshot.counts);
        Ok(snapshot)
    }

    /// 对迁移后的存储执行计划中的全部检查
    ///
    /// 只有存储本身不可访问时返回 `Err`；检查不通过记录为 issue。
    pub fn validate(
        &self,
        plan: &MigrationPlan,
        store: &mut dyn StoreEngine,
        before: &CountSnapshot,
    ) -> Result<ValidationResult, StoreError> {
        let checks = plan.checks();
        let mut issues = Vec::new();

        // 1. 记录数下限
        for bound in &checks.count_bounds {
            let Some(pre) = before.get(bound.collection) else {
                // 迁移前不存在的集合没有基准
                continue;
            };
            match store.count_records(bound.collection)? {
                None => issues.push(format!(
                    "collection '{}' is missing after migration",
                    bound.collection
                )),
                Some(post) => {
                    if pre > 0 && (post as f64) < (pre as f64) * bound.min_ratio {
                        issues.push(format!(
                            "collection '{}' lost records: {} before, {} after (minimum ratio {})",
                            bound.collection, pre, post, bound.min_ratio
                        ));
                    }
                }
            }
        }

        // 2. 引用完整性
        for reference in &checks.references {
            match store.count_dangling(reference)? {
                None => issues.push(format!(
                    "reference {}.{} -> {}.{} cannot be checked: collection or field missing",
                    reference.child, reference.column, reference.parent, reference.parent_column
                )),
                Some(0) => {}
                Some(dangling) => issues.push(format!(
                    "{} record(s) in '{}' reference a missing {}.{}",
                    dangling, reference.child, reference.parent, reference.parent_column
                )),
            }
        }

        // 3. 必填字段
        for field in &checks.required_fields {
            match store.count_missing(field)? {
                None => issues.push(format!(
                    "required field {}.{} does not exist",
                    field.collection, field.field
                )),
                Some(0) => {}
                Some(missing) => issues.push(format!(
                    "{} record(s) in '{}' have no value for '{}'",
                    missing, field.collection, field.field
                )),
            }
        }

        // 4. 引擎自检
        match store.integrity_check() {
            Ok(()) => {}
            Err(StoreError::Integrity(detail)) => {
                issues.push(format!("store integrity check failed: {}", detail))
            }
            Err(e) => return Err(e),
        }

        for issue in &issues {
            warn!("[Validator] {}", issue);
        }
        Ok(ValidationResult::from_issues(issues))
    }
}
