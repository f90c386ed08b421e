//! Staging loader: CSV into an all-text table, then one row per primary key.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tagsync_db::{Ident, TableRef, TagStorageType, WarehouseStore};
use tracing::{debug, info};

use crate::error::StagingError;
use crate::hashing::DetailHasher;

/// Tables produced by one staging run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagingReport {
    pub raw: TableRef,
    pub dedup: TableRef,
    /// Header columns in file order.
    pub columns: Vec<Ident>,
    pub rows_loaded: u64,
    pub dedup_rows: u64,
}

/// A parsed extract.
#[derive(Debug)]
struct CsvData {
    columns: Vec<Ident>,
    rows: Vec<Vec<Option<String>>>,
}

/// Staging table name for a file: everything before the first dot.
pub fn staging_table_name(file_name: &str) -> Result<Ident, StagingError> {
    let stem = file_name.split('.').next().unwrap_or(file_name);
    Ident::parse(stem).map_err(|source| StagingError::TableName {
        file_name: file_name.to_string(),
        source,
    })
}

pub struct StagingLoader {
    warehouse: Arc<dyn WarehouseStore>,
    hasher: Arc<dyn DetailHasher>,
    schema: Ident,
}

impl StagingLoader {
    pub fn new(
        warehouse: Arc<dyn WarehouseStore>,
        hasher: Arc<dyn DetailHasher>,
        schema: Ident,
    ) -> Self {
        Self {
            warehouse,
            hasher,
            schema,
        }
    }

    pub fn schema(&self) -> &Ident {
        &self.schema
    }

    /// Stage `local_path` into `<schema>.<table>` and `<schema>.<table>_dedup`.
    ///
    /// Both tables are dropped and rebuilt. Among rows sharing a primary key
    /// the first one in file order is kept.
    pub async fn load(
        &self,
        table: &Ident,
        local_path: &Path,
        primary_key: &[Ident],
        storage_type: TagStorageType,
    ) -> Result<StagingReport, StagingError> {
        let started = Instant::now();
        let source = match storage_type {
            TagStorageType::Detail => {
                let detail = self.hasher.hash(local_path).await;
                if !tokio::fs::try_exists(&detail).await.unwrap_or(false) {
                    return Err(StagingError::DetailFileMissing { path: detail });
                }
                detail
            }
            TagStorageType::Tag => local_path.to_path_buf(),
        };
        debug!(path = %source.display(), "Reading extract");

        let path = source.clone();
        let data = tokio::task::spawn_blocking(move || read_csv(&path)).await??;
        for key in primary_key {
            if !data.columns.contains(key) {
                return Err(StagingError::MissingPrimaryKeyColumn(key.to_string()));
            }
        }

        let raw = TableRef::new(self.schema.clone(), table.clone());
        let dedup = TableRef::new(self.schema.clone(), table.with_suffix("_dedup")?);

        self.warehouse
            .recreate_staging_table(&raw, &data.columns)
            .await?;
        let rows_loaded = self
            .warehouse
            .bulk_load(&raw, &data.columns, &data.rows)
            .await?;
        let dedup_rows = self
            .warehouse
            .build_dedup_table(&raw, &dedup, &data.columns, primary_key)
            .await?;

        info!(
            table = %raw,
            rows_loaded,
            dedup_rows,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Staging complete"
        );

        Ok(StagingReport {
            raw,
            dedup,
            columns: data.columns,
            rows_loaded,
            dedup_rows,
        })
    }
}

fn read_csv(path: &Path) -> Result<CsvData, StagingError> {
    let csv_err = |source: csv::Error| StagingError::Csv {
        path: path.to_path_buf(),
        source,
    };

    let file = std::fs::File::open(path).map_err(|source| StagingError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let mut reader = csv::ReaderBuilder::new().has_headers(true).from_reader(file);

    let header = reader.headers().map_err(csv_err)?.clone();
    if header.is_empty() || header.iter().all(str::is_empty) {
        return Err(StagingError::MissingHeader {
            path: PathBuf::from(path),
        });
    }

    let mut columns = Vec::with_capacity(header.len());
    let mut seen = HashSet::new();
    for raw in header.iter() {
        let column = Ident::parse(raw).map_err(|source| StagingError::InvalidColumn {
            column: raw.to_string(),
            source,
        })?;
        if !seen.insert(column.clone()) {
            return Err(StagingError::DuplicateColumn(column.to_string()));
        }
        columns.push(column);
    }

    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record.map_err(csv_err)?;
        rows.push(
            record
                .iter()
                .map(|value| (!value.is_empty()).then(|| value.to_string()))
                .collect(),
        );
    }

    Ok(CsvData { columns, rows })
}
