use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use tagsync_db::{
    check_staging_width, ColumnExpr, DbError, DerivedProjection, Ident, MergePlan, Result,
    SqlType, TableRef, WarehouseStore,
};

use super::poison_err;

type Row = Vec<Option<String>>;

#[derive(Debug, Clone, Default)]
struct Table {
    columns: Vec<String>,
    rows: Vec<Row>,
    primary_key: Vec<String>,
}

impl Table {
    fn position(&self, column: &str) -> Result<usize> {
        self.columns
            .iter()
            .position(|c| c == column)
            .ok_or_else(|| DbError::not_found(format!("column \"{}\" does not exist", column)))
    }
}

/// [`WarehouseStore`] that mimics the PostgreSQL behaviour the merge relies
/// on: casts reject bad input, null keys violate the primary key, and one
/// statement may not upsert the same key twice.
#[derive(Debug, Default)]
pub struct MemoryWarehouse {
    tables: Mutex<HashMap<String, Table>>,
    operations: Mutex<Vec<String>>,
}

impl MemoryWarehouse {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a permanent target table with a primary key.
    pub fn create_target(&self, table: &TableRef, primary_key: &[&str], columns: &[&str]) {
        let mut all: Vec<String> = primary_key.iter().map(|c| c.to_string()).collect();
        all.extend(columns.iter().map(|c| c.to_string()));
        if let Ok(mut tables) = self.tables.lock() {
            tables.insert(
                table.to_string(),
                Table {
                    columns: all,
                    rows: Vec::new(),
                    primary_key: primary_key.iter().map(|c| c.to_string()).collect(),
                },
            );
        }
    }

    /// Insert a row into a target table directly, by column name.
    pub fn insert_row(&self, table: &TableRef, values: &[(&str, &str)]) -> Result<()> {
        let mut tables = self.tables.lock().map_err(poison_err)?;
        let target = tables
            .get_mut(&table.to_string())
            .ok_or_else(|| DbError::not_found(format!("relation {} does not exist", table)))?;
        let mut row: Row = vec![None; target.columns.len()];
        for (column, value) in values {
            row[target.position(column)?] = Some(value.to_string());
        }
        target.rows.push(row);
        Ok(())
    }

    pub fn has_table(&self, table: &TableRef) -> bool {
        self.tables
            .lock()
            .map(|t| t.contains_key(&table.to_string()))
            .unwrap_or(false)
    }

    pub fn row_count(&self, table: &TableRef) -> usize {
        self.tables
            .lock()
            .ok()
            .and_then(|t| t.get(&table.to_string()).map(|t| t.rows.len()))
            .unwrap_or(0)
    }

    /// Rows as column-name maps, in storage order.
    pub fn rows(&self, table: &TableRef) -> Vec<HashMap<String, Option<String>>> {
        let Ok(tables) = self.tables.lock() else {
            return Vec::new();
        };
        let Some(t) = tables.get(&table.to_string()) else {
            return Vec::new();
        };
        t.rows
            .iter()
            .map(|row| t.columns.iter().cloned().zip(row.iter().cloned()).collect())
            .collect()
    }

    /// Value of `column` in the row whose `key_column` equals `key`.
    pub fn value(&self, table: &TableRef, key_column: &str, key: &str, column: &str) -> Option<String> {
        self.rows(table)
            .into_iter()
            .find(|row| row.get(key_column).cloned().flatten().as_deref() == Some(key))
            .and_then(|row| row.get(column).cloned().flatten())
    }

    /// Operation log such as `bulk_load tmp.sales`.
    pub fn operations(&self) -> Vec<String> {
        self.operations
            .lock()
            .map(|ops| ops.clone())
            .unwrap_or_default()
    }

    fn record(&self, op: &str, table: &TableRef) -> Result<()> {
        self.operations
            .lock()
            .map_err(poison_err)?
            .push(format!("{} {}", op, table));
        Ok(())
    }
}

fn lookup<'a>(tables: &'a HashMap<String, Table>, table: &TableRef) -> Result<&'a Table> {
    tables
        .get(&table.to_string())
        .ok_or_else(|| DbError::not_found(format!("relation {} does not exist", table)))
}

fn project(source: &Table, columns: &[Ident]) -> Result<Vec<usize>> {
    columns.iter().map(|c| source.position(c.as_str())).collect()
}

fn cast(raw: Option<&String>, sql_type: SqlType) -> Result<Option<String>> {
    let Some(raw) = raw else {
        return Ok(None);
    };
    let text = raw.trim();
    let invalid = || {
        DbError::conversion(format!(
            "invalid input syntax for type {}: \"{}\"",
            sql_type.as_str(),
            raw
        ))
    };
    let value = match sql_type {
        SqlType::Numeric => {
            text.parse::<f64>().map_err(|_| invalid())?;
            text.to_string()
        }
        SqlType::Integer => text.parse::<i64>().map_err(|_| invalid())?.to_string(),
        SqlType::Boolean => match text.to_ascii_lowercase().as_str() {
            "t" | "true" | "y" | "yes" | "on" | "1" => "true".to_string(),
            "f" | "false" | "n" | "no" | "off" | "0" => "false".to_string(),
            _ => return Err(invalid()),
        },
    };
    Ok(Some(value))
}

fn eval(source: &Table, row: &Row, expr: &ColumnExpr) -> Result<Option<String>> {
    let raw = row[source.position(expr.column().as_str())?].as_ref();
    match expr {
        ColumnExpr::Column(_) => Ok(raw.cloned()),
        ColumnExpr::Cast { sql_type, .. } => cast(raw, *sql_type),
        ColumnExpr::GeoPoint(_) => match raw {
            Some(wkt) if wkt.trim().to_ascii_uppercase().starts_with("POINT") => {
                Ok(Some(wkt.clone()))
            }
            Some(wkt) => Err(DbError::conversion(format!("parse error - invalid geometry: {}", wkt))),
            None => Ok(None),
        },
    }
}

#[async_trait]
impl WarehouseStore for MemoryWarehouse {
    async fn recreate_staging_table(&self, table: &TableRef, columns: &[Ident]) -> Result<()> {
        check_staging_width(table, columns)?;
        self.record("create_staging", table)?;
        self.tables.lock().map_err(poison_err)?.insert(
            table.to_string(),
            Table {
                columns: columns.iter().map(|c| c.to_string()).collect(),
                ..Table::default()
            },
        );
        Ok(())
    }

    async fn bulk_load(
        &self,
        table: &TableRef,
        columns: &[Ident],
        rows: &[Vec<Option<String>>],
    ) -> Result<u64> {
        self.record("bulk_load", table)?;
        let mut tables = self.tables.lock().map_err(poison_err)?;
        let staging = tables
            .get_mut(&table.to_string())
            .ok_or_else(|| DbError::not_found(format!("relation {} does not exist", table)))?;
        let positions = project(staging, columns)?;
        for row in rows {
            if row.len() != columns.len() {
                return Err(DbError::invalid_state(format!(
                    "row has {} values, {} expects {}",
                    row.len(),
                    table,
                    columns.len()
                )));
            }
            let mut stored: Row = vec![None; staging.columns.len()];
            for (value, &pos) in row.iter().zip(&positions) {
                stored[pos] = value.clone();
            }
            staging.rows.push(stored);
        }
        Ok(rows.len() as u64)
    }

    async fn build_dedup_table(
        &self,
        source: &TableRef,
        target: &TableRef,
        columns: &[Ident],
        primary_key: &[Ident],
    ) -> Result<u64> {
        self.record("dedup", target)?;
        let mut tables = self.tables.lock().map_err(poison_err)?;
        let raw = lookup(&tables, source)?;
        let keep = project(raw, columns)?;
        let keys = project(raw, primary_key)?;

        let mut seen = HashSet::new();
        let mut rows = Vec::new();
        for row in &raw.rows {
            let key: Vec<Option<String>> = keys.iter().map(|&k| row[k].clone()).collect();
            if key.iter().any(Option::is_none) || !seen.insert(key) {
                continue;
            }
            rows.push(keep.iter().map(|&k| row[k].clone()).collect());
        }

        let count = rows.len() as u64;
        tables.insert(
            target.to_string(),
            Table {
                columns: columns.iter().map(|c| c.to_string()).collect(),
                rows,
                primary_key: Vec::new(),
            },
        );
        Ok(count)
    }

    async fn build_derived_table(
        &self,
        source: &TableRef,
        target: &TableRef,
        columns: &[Ident],
        derived_field: &Ident,
        projections: &[DerivedProjection],
    ) -> Result<u64> {
        self.record("derive", target)?;
        if projections.is_empty() {
            return Err(DbError::invalid_state(format!(
                "derived table {} needs at least one projection",
                target
            )));
        }
        let mut tables = self.tables.lock().map_err(poison_err)?;
        let dedup = lookup(&tables, source)?;
        let kept: Vec<Ident> = columns
            .iter()
            .filter(|c| *c != derived_field)
            .cloned()
            .collect();
        let positions = project(dedup, &kept)?;

        let mut rows = Vec::new();
        for projection in projections {
            let filter = dedup.position(projection.source_column.as_str())?;
            for row in &dedup.rows {
                if row[filter].as_deref() != Some(projection.derived_value.as_str()) {
                    continue;
                }
                let mut out: Row = positions.iter().map(|&p| row[p].clone()).collect();
                out.push(Some(projection.tag_name.clone()));
                rows.push(out);
            }
        }

        let mut out_columns: Vec<String> = kept.iter().map(|c| c.to_string()).collect();
        out_columns.push(derived_field.to_string());
        let count = rows.len() as u64;
        tables.insert(
            target.to_string(),
            Table {
                columns: out_columns,
                rows,
                primary_key: Vec::new(),
            },
        );
        Ok(count)
    }

    async fn merge_column(&self, plan: &MergePlan) -> Result<u64> {
        self.record("merge", &plan.target)?;
        let mut tables = self.tables.lock().map_err(poison_err)?;
        let source = lookup(&tables, &plan.source)?.clone();
        // Work on a copy so a failed statement leaves the target untouched.
        let mut target = lookup(&tables, &plan.target)?.clone();

        let key_columns: Vec<String> = plan.keys.iter().map(|k| k.column().to_string()).collect();
        if target.primary_key != key_columns {
            return Err(DbError::invalid_state(format!(
                "there is no unique constraint matching the ON CONFLICT specification on {}",
                plan.target
            )));
        }
        let key_pos: Vec<usize> = key_columns
            .iter()
            .map(|c| target.position(c))
            .collect::<Result<_>>()?;
        let tag_pos = target.position(plan.tag_column().as_str())?;

        if plan.reset_column_first {
            for row in &mut target.rows {
                row[tag_pos] = None;
            }
        }

        let mut touched = HashSet::new();
        for row in &source.rows {
            let key = plan
                .keys
                .iter()
                .map(|k| eval(&source, row, k))
                .collect::<Result<Vec<_>>>()?;
            if key.iter().any(Option::is_none) {
                return Err(DbError::invalid_state(format!(
                    "null value in primary key of {}",
                    plan.target
                )));
            }
            let value = eval(&source, row, &plan.value)?;
            if !touched.insert(key.clone()) {
                return Err(DbError::invalid_state(
                    "ON CONFLICT DO UPDATE command cannot affect row a second time",
                ));
            }

            let existing = target
                .rows
                .iter_mut()
                .find(|r| key_pos.iter().zip(&key).all(|(&p, k)| &r[p] == k));
            match existing {
                Some(existing) => existing[tag_pos] = value,
                None => {
                    let mut fresh: Row = vec![None; target.columns.len()];
                    for (&p, k) in key_pos.iter().zip(key) {
                        fresh[p] = k;
                    }
                    fresh[tag_pos] = value;
                    target.rows.push(fresh);
                }
            }
        }

        let merged = touched.len() as u64;
        tables.insert(plan.target.to_string(), target);
        Ok(merged)
    }

    async fn table_exists(&self, table: &TableRef) -> Result<bool> {
        Ok(self.has_table(table))
    }
}
