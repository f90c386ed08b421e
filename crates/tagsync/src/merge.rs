//! Single-column upsert from a staged table into a wide target table.

use std::sync::Arc;
use std::time::Instant;
use tagsync_db::{ColumnExpr, Ident, MergePlan, SqlType, TableRef, TagDataType, UploadMethod, WarehouseStore};
use tracing::info;

use crate::error::MergeError;

/// Primary-key projection: `geo_point` becomes a geometry, `level` an integer.
pub fn key_projection(primary_key: &[Ident]) -> Vec<ColumnExpr> {
    primary_key
        .iter()
        .map(|column| match column.as_str() {
            "geo_point" => ColumnExpr::GeoPoint(column.clone()),
            "level" => ColumnExpr::Cast {
                column: column.clone(),
                sql_type: SqlType::Integer,
            },
            _ => ColumnExpr::Column(column.clone()),
        })
        .collect()
}

/// Tag value projection for a configured data type.
pub fn value_projection(tag: &Ident, tag_data_type: &str) -> Result<ColumnExpr, MergeError> {
    let data_type: TagDataType = tag_data_type
        .parse()
        .map_err(|_| MergeError::UnknownDataType(tag_data_type.to_string()))?;
    Ok(match data_type {
        TagDataType::String | TagDataType::Enum => ColumnExpr::Column(tag.clone()),
        TagDataType::Numeric => ColumnExpr::Cast {
            column: tag.clone(),
            sql_type: SqlType::Numeric,
        },
        TagDataType::Bool => ColumnExpr::Cast {
            column: tag.clone(),
            sql_type: SqlType::Boolean,
        },
    })
}

#[derive(Debug, Clone)]
pub struct MergeRequest {
    pub source: TableRef,
    pub target: TableRef,
    pub primary_key: Vec<Ident>,
    pub tag_name: Ident,
    pub tag_data_type: String,
    pub upload_method: UploadMethod,
}

impl MergeRequest {
    pub fn plan(&self) -> Result<MergePlan, MergeError> {
        Ok(MergePlan {
            source: self.source.clone(),
            target: self.target.clone(),
            keys: key_projection(&self.primary_key),
            value: value_projection(&self.tag_name, &self.tag_data_type)?,
            reset_column_first: self.upload_method == UploadMethod::Full,
        })
    }
}

pub struct MergeEngine {
    warehouse: Arc<dyn WarehouseStore>,
}

impl MergeEngine {
    pub fn new(warehouse: Arc<dyn WarehouseStore>) -> Self {
        Self { warehouse }
    }

    /// Upsert the tag column; other target columns are left as they are.
    pub async fn merge(&self, request: &MergeRequest) -> Result<u64, MergeError> {
        let started = Instant::now();
        let plan = request.plan()?;
        let rows = self.warehouse.merge_column(&plan).await?;
        info!(
            source = %plan.source,
            target = %plan.target,
            tag = %plan.tag_column(),
            upload_method = %request.upload_method,
            rows,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Tag merged"
        );
        Ok(rows)
    }
}
