use async_trait::async_trait;
use std::collections::HashMap;
use tagsync_db::{DerivedFieldRule, PrimaryKeyRule, Result, TagSyncTask, TaskCatalog};

/// Fixed [`TaskCatalog`] assembled with builder calls.
#[derive(Debug, Default, Clone)]
pub struct MemoryCatalog {
    tasks: HashMap<(String, String), TagSyncTask>,
    primary_keys: HashMap<String, PrimaryKeyRule>,
    derived: Vec<(String, String, String, DerivedFieldRule)>,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_task(mut self, task: TagSyncTask) -> Self {
        self.tasks
            .insert((task.task_id.clone(), task.tag_name.clone()), task);
        self
    }

    /// `primary_key` uses the comma separated catalog form.
    pub fn with_primary_key(mut self, table_name: &str, primary_key: &str) -> Self {
        self.primary_keys.insert(
            table_name.to_string(),
            PrimaryKeyRule::from_list(table_name, primary_key),
        );
        self
    }

    pub fn with_derived_rule(
        mut self,
        schema_name: &str,
        table_name: &str,
        file_name: &str,
        rule: DerivedFieldRule,
    ) -> Self {
        self.derived.push((
            schema_name.to_string(),
            table_name.to_string(),
            file_name.to_string(),
            rule,
        ));
        self
    }
}

#[async_trait]
impl TaskCatalog for MemoryCatalog {
    async fn task(&self, task_id: &str, tag_name: &str) -> Result<Option<TagSyncTask>> {
        Ok(self
            .tasks
            .get(&(task_id.to_string(), tag_name.to_string()))
            .cloned())
    }

    async fn primary_key(&self, table_name: &str) -> Result<Option<PrimaryKeyRule>> {
        Ok(self
            .primary_keys
            .get(table_name)
            .filter(|rule| !rule.primary_key.is_empty())
            .cloned())
    }

    async fn derived_rules(
        &self,
        schema_name: &str,
        table_name: &str,
        file_name: &str,
    ) -> Result<Vec<DerivedFieldRule>> {
        Ok(self
            .derived
            .iter()
            .filter(|(schema, table, file, _)| {
                schema == schema_name && table == table_name && file == file_name
            })
            .map(|(_, _, _, rule)| rule.clone())
            .collect())
    }
}
