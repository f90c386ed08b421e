//! Derived-field expansion over a dedup table.

use std::sync::Arc;
use tagsync_db::{DerivedFieldRule, DerivedProjection, Ident, TableRef, WarehouseStore};
use tracing::info;

use crate::error::{ConfigError, StagingError, SyncError};

/// Validated form of a [`DerivedFieldRule`] against a header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DerivedExpansion {
    pub derived_field: Ident,
    pub projections: Vec<DerivedProjection>,
}

impl DerivedExpansion {
    pub fn from_rule(rule: &DerivedFieldRule, columns: &[Ident]) -> Result<Self, ConfigError> {
        if rule.mappings.is_empty() {
            return Err(ConfigError::EmptyDerivedRule(rule.rule_id.clone()));
        }
        let derived_field = Ident::parse(&rule.derived_field).map_err(ConfigError::Identifier)?;

        let mut projections = Vec::with_capacity(rule.mappings.len());
        for mapping in &rule.mappings {
            let source_column =
                Ident::parse(&mapping.source_column).map_err(ConfigError::Identifier)?;
            if !columns.contains(&source_column) {
                return Err(ConfigError::Invalid(format!(
                    "derived-field rule {} reads column {} which the extract does not have",
                    rule.rule_id, source_column
                )));
            }
            projections.push(DerivedProjection {
                source_column,
                derived_value: mapping.derived_value.clone(),
                tag_name: mapping.tag_name.clone(),
            });
        }

        Ok(Self {
            derived_field,
            projections,
        })
    }
}

pub struct DerivedFieldExpander {
    warehouse: Arc<dyn WarehouseStore>,
}

impl DerivedFieldExpander {
    pub fn new(warehouse: Arc<dyn WarehouseStore>) -> Self {
        Self { warehouse }
    }

    /// Build `<dedup table>_derived` (minus the `_dedup` suffix) with one row
    /// per matching mapping, the derived field holding the mapping's tag name.
    pub async fn expand(
        &self,
        dedup: &TableRef,
        columns: &[Ident],
        rule: &DerivedFieldRule,
    ) -> Result<TableRef, SyncError> {
        let expansion = DerivedExpansion::from_rule(rule, columns)?;
        let target = TableRef::new(dedup.schema.clone(), derived_table_name(&dedup.table)?);

        let rows = self
            .warehouse
            .build_derived_table(
                dedup,
                &target,
                columns,
                &expansion.derived_field,
                &expansion.projections,
            )
            .await
            .map_err(StagingError::Warehouse)?;

        info!(
            table = %target,
            rule = %rule.rule_id,
            field = %expansion.derived_field,
            rows,
            "Derived fields expanded"
        );
        Ok(target)
    }
}

pub(crate) fn derived_table_name(dedup: &Ident) -> Result<Ident, StagingError> {
    let base = dedup.as_str().strip_suffix("_dedup").unwrap_or(dedup.as_str());
    Ok(Ident::parse(base)?.with_suffix("_derived")?)
}
