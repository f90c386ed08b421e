//! Read-only tag sync configuration: tasks, primary keys and derived rules.

use async_trait::async_trait;
use sqlx::Row;
use std::collections::BTreeMap;

use crate::error::{DbError, Result};
use crate::log_store::StoreTables;
use crate::pool::LogPool;
use crate::types::{DerivedFieldRule, DerivedMapping, PrimaryKeyRule, TagSyncTask};

/// Lookup of tag sync configuration.
#[async_trait]
pub trait TaskCatalog: Send + Sync {
    async fn task(&self, task_id: &str, tag_name: &str) -> Result<Option<TagSyncTask>>;

    async fn primary_key(&self, table_name: &str) -> Result<Option<PrimaryKeyRule>>;

    /// All derived rules configured for one target table and source file.
    ///
    /// More than one rule is a configuration error the caller reports.
    async fn derived_rules(
        &self,
        schema_name: &str,
        table_name: &str,
        file_name: &str,
    ) -> Result<Vec<DerivedFieldRule>>;
}

/// [`TaskCatalog`] over the log/config database.
#[derive(Debug, Clone)]
pub struct SqlTaskCatalog {
    pool: LogPool,
    tables: StoreTables,
}

impl SqlTaskCatalog {
    pub fn new(pool: LogPool, tables: StoreTables) -> Self {
        Self { pool, tables }
    }

    /// Create the configuration tables if they do not exist.
    pub async fn ensure_schema(&self) -> Result<()> {
        sqlx::query(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS {} (
                task_id TEXT NOT NULL,
                tag_name_en TEXT NOT NULL,
                src_file_name TEXT NOT NULL,
                src_file_path TEXT NOT NULL,
                schema_name TEXT NOT NULL,
                table_name TEXT NOT NULL,
                tag_data_type TEXT NOT NULL,
                tag_storage_type TEXT NOT NULL DEFAULT 'tag',
                upload_method TEXT NOT NULL DEFAULT 'incremental',
                PRIMARY KEY (task_id, tag_name_en)
            )
            "#,
            self.tables.sync_rule.quoted()
        ))
        .execute(&self.pool)
        .await?;

        sqlx::query(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS {} (
                table_name TEXT PRIMARY KEY,
                primary_key TEXT NOT NULL
            )
            "#,
            self.tables.primary_key.quoted()
        ))
        .execute(&self.pool)
        .await?;

        sqlx::query(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS {} (
                rule_id TEXT NOT NULL,
                schema_name TEXT NOT NULL,
                table_name TEXT NOT NULL,
                src_file_name TEXT NOT NULL,
                derived_field TEXT NOT NULL,
                source_column TEXT NOT NULL,
                derived_value TEXT NOT NULL,
                tag_name TEXT NOT NULL,
                mapping_order INTEGER NOT NULL DEFAULT 0
            )
            "#,
            self.tables.derived_rule.quoted()
        ))
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[async_trait]
impl TaskCatalog for SqlTaskCatalog {
    async fn task(&self, task_id: &str, tag_name: &str) -> Result<Option<TagSyncTask>> {
        let row = sqlx::query(&format!(
            r#"
            SELECT task_id, tag_name_en, src_file_name, src_file_path, schema_name, table_name,
                   tag_data_type, tag_storage_type, upload_method
            FROM {}
            WHERE task_id = $1 AND tag_name_en = $2
            "#,
            self.tables.sync_rule.quoted()
        ))
        .bind(task_id)
        .bind(tag_name)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let storage: String = row.try_get("tag_storage_type")?;
        let upload: String = row.try_get("upload_method")?;
        Ok(Some(TagSyncTask {
            task_id: row.try_get("task_id")?,
            tag_name: row.try_get("tag_name_en")?,
            file_name: row.try_get("src_file_name")?,
            file_path: row.try_get("src_file_path")?,
            target_schema: row.try_get("schema_name")?,
            target_table: row.try_get("table_name")?,
            tag_data_type: row.try_get("tag_data_type")?,
            tag_storage_type: storage.parse().map_err(DbError::conversion)?,
            upload_method: upload.parse().map_err(DbError::conversion)?,
        }))
    }

    async fn primary_key(&self, table_name: &str) -> Result<Option<PrimaryKeyRule>> {
        let list: Option<String> = sqlx::query_scalar(&format!(
            "SELECT primary_key FROM {} WHERE table_name = $1",
            self.tables.primary_key.quoted()
        ))
        .bind(table_name)
        .fetch_optional(&self.pool)
        .await?;

        Ok(list
            .map(|list| PrimaryKeyRule::from_list(table_name, &list))
            .filter(|rule| !rule.primary_key.is_empty()))
    }

    async fn derived_rules(
        &self,
        schema_name: &str,
        table_name: &str,
        file_name: &str,
    ) -> Result<Vec<DerivedFieldRule>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT rule_id, derived_field, source_column, derived_value, tag_name
            FROM {}
            WHERE schema_name = $1 AND table_name = $2 AND src_file_name = $3
            ORDER BY rule_id, mapping_order
            "#,
            self.tables.derived_rule.quoted()
        ))
        .bind(schema_name)
        .bind(table_name)
        .bind(file_name)
        .fetch_all(&self.pool)
        .await?;

        let mut rules: BTreeMap<String, DerivedFieldRule> = BTreeMap::new();
        for row in &rows {
            let rule_id: String = row.try_get("rule_id")?;
            let derived_field: String = row.try_get("derived_field")?;
            let rule = rules
                .entry(rule_id.clone())
                .or_insert_with(|| DerivedFieldRule {
                    rule_id,
                    derived_field: derived_field.clone(),
                    mappings: Vec::new(),
                });
            if rule.derived_field != derived_field {
                return Err(DbError::invalid_state(format!(
                    "derived rule {} names two fields: {} and {}",
                    rule.rule_id, rule.derived_field, derived_field
                )));
            }
            rule.mappings.push(DerivedMapping {
                source_column: row.try_get("source_column")?,
                derived_value: row.try_get("derived_value")?,
                tag_name: row.try_get("tag_name")?,
            });
        }
        Ok(rules.into_values().collect())
    }
}
