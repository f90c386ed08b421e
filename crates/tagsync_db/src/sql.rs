//! Identifier-safe statement builders for the warehouse.
//!
//! Values travel as bind parameters. Identifiers cannot be bound, so every
//! table and column name passes through [`Ident`] first and is rendered
//! double-quoted. String literals only appear where PostgreSQL refuses
//! parameters (`CREATE TABLE ... AS`) and go through [`quote_literal`].

use crate::error::{DbError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Hidden column carrying the 1-based CSV line of each staged row.
pub const LINE_COLUMN: &str = "_tagsync_line";

const MAX_IDENT_LEN: usize = 63;

/// A validated, lower-cased SQL identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Ident(String);

impl Ident {
    pub fn parse(raw: &str) -> Result<Self> {
        let name = raw.trim();
        let mut chars = name.chars();
        let head_ok = chars
            .next()
            .map_or(false, |c| c.is_ascii_alphabetic() || c == '_');
        let tail_ok = chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
        if !head_ok || !tail_ok || name.len() > MAX_IDENT_LEN {
            return Err(DbError::InvalidIdentifier(raw.to_string()));
        }
        Ok(Self(name.to_ascii_lowercase()))
    }

    /// Wrap a literal name known to be a valid lower-case identifier.
    pub fn from_static(name: &'static str) -> Self {
        debug_assert!(Self::parse(name).map_or(false, |ident| ident.0 == name));
        Self(name.to_string())
    }

    /// Derive a sibling name such as `sales_dedup`.
    pub fn with_suffix(&self, suffix: &str) -> Result<Self> {
        Self::parse(&format!("{}{}", self.0, suffix))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn quoted(&self) -> String {
        format!("\"{}\"", self.0)
    }
}

impl fmt::Display for Ident {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for Ident {
    type Error = DbError;

    fn try_from(value: String) -> Result<Self> {
        Ident::parse(&value)
    }
}

impl From<Ident> for String {
    fn from(value: Ident) -> Self {
        value.0
    }
}

/// Schema-qualified table name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TableRef {
    pub schema: Ident,
    pub table: Ident,
}

impl TableRef {
    pub fn new(schema: Ident, table: Ident) -> Self {
        Self { schema, table }
    }

    pub fn parse(schema: &str, table: &str) -> Result<Self> {
        Ok(Self::new(Ident::parse(schema)?, Ident::parse(table)?))
    }

    pub fn quoted(&self) -> String {
        format!("{}.{}", self.schema.quoted(), self.table.quoted())
    }
}

impl fmt::Display for TableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.schema, self.table)
    }
}

/// Casts applied when moving text staging data into typed targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlType {
    Numeric,
    Boolean,
    Integer,
}

impl SqlType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SqlType::Numeric => "numeric",
            SqlType::Boolean => "boolean",
            SqlType::Integer => "integer",
        }
    }
}

/// A projected staging column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ColumnExpr {
    Column(Ident),
    Cast { column: Ident, sql_type: SqlType },
    /// WKT text turned into a PostGIS geometry
    GeoPoint(Ident),
}

impl ColumnExpr {
    /// Column the expression reads and writes.
    pub fn column(&self) -> &Ident {
        match self {
            ColumnExpr::Column(column)
            | ColumnExpr::Cast { column, .. }
            | ColumnExpr::GeoPoint(column) => column,
        }
    }

    pub fn render(&self) -> String {
        match self {
            ColumnExpr::Column(column) => column.quoted(),
            ColumnExpr::Cast { column, sql_type } => {
                format!("CAST({} AS {})", column.quoted(), sql_type.as_str())
            }
            ColumnExpr::GeoPoint(column) => format!(
                "CAST(public.st_pointfromtext({}) AS \"public\".\"geometry\")",
                column.quoted()
            ),
        }
    }
}

/// One branch of a derived-field expansion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DerivedProjection {
    pub source_column: Ident,
    pub derived_value: String,
    pub tag_name: String,
}

/// Everything needed to upsert one tag column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergePlan {
    pub source: TableRef,
    pub target: TableRef,
    pub keys: Vec<ColumnExpr>,
    pub value: ColumnExpr,
    /// Null the tag column for all target rows first.
    pub reset_column_first: bool,
}

impl MergePlan {
    pub fn tag_column(&self) -> &Ident {
        self.value.column()
    }
}

/// Quote a string literal, doubling embedded quotes.
pub fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

fn column_list(columns: &[Ident]) -> String {
    columns
        .iter()
        .map(Ident::quoted)
        .collect::<Vec<_>>()
        .join(", ")
}

pub fn drop_table(table: &TableRef) -> String {
    format!("DROP TABLE IF EXISTS {}", table.quoted())
}

pub fn create_staging_table(table: &TableRef, columns: &[Ident]) -> String {
    let mut defs = vec![format!("\"{}\" bigint NOT NULL", LINE_COLUMN)];
    defs.extend(columns.iter().map(|c| format!("{} text", c.quoted())));
    format!("CREATE TABLE {} ({})", table.quoted(), defs.join(", "))
}

/// Prefix for a multi-row insert; values are appended by the caller.
pub fn insert_staging_prefix(table: &TableRef, columns: &[Ident]) -> String {
    format!(
        "INSERT INTO {} (\"{}\", {}) ",
        table.quoted(),
        LINE_COLUMN,
        column_list(columns)
    )
}

/// Keep the first-seen row per primary key; rows with a null key are dropped.
pub fn create_dedup_table(
    source: &TableRef,
    target: &TableRef,
    columns: &[Ident],
    primary_key: &[Ident],
) -> String {
    let not_null = primary_key
        .iter()
        .map(|k| format!("{} IS NOT NULL", k.quoted()))
        .collect::<Vec<_>>()
        .join(" AND ");
    format!(
        "CREATE TABLE {target} AS SELECT {cols} FROM (\
         SELECT {cols}, row_number() OVER (PARTITION BY {pk} ORDER BY \"{line}\") AS rrn \
         FROM {source} WHERE {not_null}) ranked WHERE rrn = 1",
        target = target.quoted(),
        cols = column_list(columns),
        pk = column_list(primary_key),
        line = LINE_COLUMN,
        source = source.quoted(),
        not_null = not_null,
    )
}

/// Union of one filtered projection per mapping, tagging each row.
///
/// An existing column named like the derived field is replaced.
pub fn create_derived_table(
    source: &TableRef,
    target: &TableRef,
    columns: &[Ident],
    derived_field: &Ident,
    projections: &[DerivedProjection],
) -> String {
    let kept: Vec<Ident> = columns
        .iter()
        .filter(|c| *c != derived_field)
        .cloned()
        .collect();
    let selects = projections
        .iter()
        .map(|p| {
            format!(
                "SELECT {cols}{sep}{tag} AS {field} FROM {source} WHERE {col} = {value}",
                cols = column_list(&kept),
                sep = if kept.is_empty() { "" } else { ", " },
                tag = quote_literal(&p.tag_name),
                field = derived_field.quoted(),
                source = source.quoted(),
                col = p.source_column.quoted(),
                value = quote_literal(&p.derived_value),
            )
        })
        .collect::<Vec<_>>()
        .join(" UNION ALL ");
    format!("CREATE TABLE {} AS {}", target.quoted(), selects)
}

pub fn reset_column(target: &TableRef, column: &Ident) -> String {
    format!("UPDATE {} SET {} = NULL", target.quoted(), column.quoted())
}

/// Insert projected rows, updating only the tag column on key conflict.
pub fn upsert_column(plan: &MergePlan) -> String {
    let key_columns: Vec<Ident> = plan.keys.iter().map(|k| k.column().clone()).collect();
    let tag = plan.tag_column().quoted();
    let projection = plan
        .keys
        .iter()
        .chain(std::iter::once(&plan.value))
        .map(ColumnExpr::render)
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "INSERT INTO {target} ({keys}, {tag}) SELECT {projection} FROM {source} \
         ON CONFLICT ({keys}) DO UPDATE SET {tag} = EXCLUDED.{tag}",
        target = plan.target.quoted(),
        keys = column_list(&key_columns),
        tag = tag,
        projection = projection,
        source = plan.source.quoted(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ident(name: &str) -> Ident {
        Ident::parse(name).unwrap()
    }

    fn table(schema: &str, name: &str) -> TableRef {
        TableRef::parse(schema, name).unwrap()
    }

    #[test]
    fn test_ident_validation() {
        assert_eq!(ident("Amt").as_str(), "amt");
        assert_eq!(ident(" _x1 ").quoted(), "\"_x1\"");
        let too_long = "x".repeat(64);
        for bad in ["", "1abc", "a;drop", "a b", "ä", "a\"b", too_long.as_str()] {
            assert!(
                matches!(Ident::parse(bad), Err(DbError::InvalidIdentifier(_))),
                "accepted {bad:?}"
            );
        }
    }

    #[test]
    fn test_ident_with_suffix() {
        assert_eq!(ident("sales").with_suffix("_dedup").unwrap().as_str(), "sales_dedup");
        assert!(ident(&"s".repeat(60)).with_suffix("_dedup").is_err());
    }

    #[test]
    fn test_quote_literal() {
        assert_eq!(quote_literal("o'brien"), "'o''brien'");
    }

    #[test]
    fn test_column_expr_render() {
        assert_eq!(ColumnExpr::Column(ident("id")).render(), "\"id\"");
        assert_eq!(
            ColumnExpr::Cast { column: ident("level"), sql_type: SqlType::Integer }.render(),
            "CAST(\"level\" AS integer)"
        );
        assert_eq!(
            ColumnExpr::GeoPoint(ident("geo_point")).render(),
            "CAST(public.st_pointfromtext(\"geo_point\") AS \"public\".\"geometry\")"
        );
    }

    #[test]
    fn test_create_staging_table() {
        let sql = create_staging_table(&table("tmp", "sales"), &[ident("id"), ident("amt")]);
        assert_eq!(
            sql,
            "CREATE TABLE \"tmp\".\"sales\" (\"_tagsync_line\" bigint NOT NULL, \"id\" text, \"amt\" text)"
        );
    }

    #[test]
    fn test_create_dedup_table() {
        let sql = create_dedup_table(
            &table("tmp", "sales"),
            &table("tmp", "sales_dedup"),
            &[ident("id"), ident("amt")],
            &[ident("id")],
        );
        assert!(sql.starts_with("CREATE TABLE \"tmp\".\"sales_dedup\" AS SELECT \"id\", \"amt\" FROM ("));
        assert!(sql.contains("PARTITION BY \"id\" ORDER BY \"_tagsync_line\""));
        assert!(sql.contains("WHERE \"id\" IS NOT NULL"));
        assert!(sql.ends_with("ranked WHERE rrn = 1"));
    }

    #[test]
    fn test_create_derived_table() {
        let sql = create_derived_table(
            &table("tmp", "sales_dedup"),
            &table("tmp", "sales_derived"),
            &[ident("id"), ident("kind"), ident("label")],
            &ident("label"),
            &[
                DerivedProjection {
                    source_column: ident("kind"),
                    derived_value: "a".into(),
                    tag_name: "alpha".into(),
                },
                DerivedProjection {
                    source_column: ident("kind"),
                    derived_value: "b'".into(),
                    tag_name: "beta".into(),
                },
            ],
        );
        assert_eq!(
            sql,
            "CREATE TABLE \"tmp\".\"sales_derived\" AS \
             SELECT \"id\", \"kind\", 'alpha' AS \"label\" FROM \"tmp\".\"sales_dedup\" WHERE \"kind\" = 'a' \
             UNION ALL \
             SELECT \"id\", \"kind\", 'beta' AS \"label\" FROM \"tmp\".\"sales_dedup\" WHERE \"kind\" = 'b'''"
        );
    }

    #[test]
    fn test_upsert_column() {
        let plan = MergePlan {
            source: table("tmp", "sales_dedup"),
            target: table("dw", "wide"),
            keys: vec![
                ColumnExpr::Column(ident("id")),
                ColumnExpr::Cast { column: ident("level"), sql_type: SqlType::Integer },
            ],
            value: ColumnExpr::Cast { column: ident("amt"), sql_type: SqlType::Numeric },
            reset_column_first: false,
        };
        assert_eq!(
            upsert_column(&plan),
            "INSERT INTO \"dw\".\"wide\" (\"id\", \"level\", \"amt\") \
             SELECT \"id\", CAST(\"level\" AS integer), CAST(\"amt\" AS numeric) FROM \"tmp\".\"sales_dedup\" \
             ON CONFLICT (\"id\", \"level\") DO UPDATE SET \"amt\" = EXCLUDED.\"amt\""
        );
        assert_eq!(
            reset_column(&plan.target, plan.tag_column()),
            "UPDATE \"dw\".\"wide\" SET \"amt\" = NULL"
        );
    }
}
