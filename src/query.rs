//! Query builder: turn a processor's declared filters into catalog queries.
//!
//! Each filter clause becomes one query over live URIs. Requested metadata
//! keys are pivoted from key/value rows into one named column per key
//! (`MAX(CASE WHEN key = ? THEN value END) AS "key"`); URI metadata and
//! latest-version metadata pivots are both LEFT JOINed onto the same base
//! query. Every value is a bound parameter. Pivot column names are the
//! only interpolated identifiers, and they are validated and quoted.

use serde_json::Value;
use sqlx::{Row, SqlitePool};
use std::collections::BTreeMap;

use crate::error::Result;
use crate::models::WorkItem;
use crate::processor::FilterClause;

/// Columns of the base projection; pivot keys may not shadow them.
const BASE_COLUMNS: &[&str] = &["uri_id", "uri", "uri_type", "domain"];

/// URI columns a `uris` filter may compare against.
const URI_FIELDS: &[&str] = &["id", "uri", "uri_type", "container", "root", "domain_id"];

/// Metadata columns a metadata filter may compare against.
const METADATA_FIELDS: &[&str] = &["key", "value"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableClass {
    Uris,
    UriMetadata,
    VersionMetadata,
}

impl TableClass {
    /// Accepts table names and their short aliases, case-insensitively.
    pub fn parse(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "uris" | "uri" => Some(TableClass::Uris),
            "uri_metadata" | "urimd" | "uri_md" => Some(TableClass::UriMetadata),
            "version_metadata" | "versionmd" | "versionsmd" | "version_md" => {
                Some(TableClass::VersionMetadata)
            }
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum QueryParam {
    Int(i64),
    Real(f64),
    Text(String),
}

impl QueryParam {
    fn from_json(value: &Value) -> Option<Self> {
        match value {
            Value::Bool(b) => Some(QueryParam::Int(i64::from(*b))),
            Value::Number(n) => n
                .as_i64()
                .map(QueryParam::Int)
                .or_else(|| n.as_f64().map(QueryParam::Real)),
            Value::String(s) => Some(QueryParam::Text(s.clone())),
            _ => None,
        }
    }
}

/// A ready-to-run query plus the pivot keys it projects.
#[derive(Debug, Clone, PartialEq)]
pub struct CatalogQuery {
    pub sql: String,
    pub params: Vec<QueryParam>,
    pub uri_metadata_keys: Vec<String>,
    pub version_metadata_keys: Vec<String>,
}

/// Builds one query per filter clause, dropping clauses that cannot be
/// expressed.
pub fn build_queries(
    filters: &[FilterClause],
    uri_metadata_keys: &[String],
    version_metadata_keys: &[String],
) -> Vec<CatalogQuery> {
    filters
        .iter()
        .filter_map(|clause| build_query(clause, uri_metadata_keys, version_metadata_keys))
        .collect()
}

/// Builds the query for one filter clause.
///
/// Returns `None` for an unrecognised table class, a field not valid for
/// that class, a non-scalar `select`, or an invalid pivot key. `filter`
/// applies to the metadata classes only.
pub fn build_query(
    clause: &FilterClause,
    uri_metadata_keys: &[String],
    version_metadata_keys: &[String],
) -> Option<CatalogQuery> {
    let Some(table) = TableClass::parse(&clause.table) else {
        tracing::warn!(table = %clause.table, "unrecognised filter table");
        return None;
    };

    let allowed = match table {
        TableClass::Uris => URI_FIELDS,
        TableClass::UriMetadata | TableClass::VersionMetadata => METADATA_FIELDS,
    };
    if !allowed.contains(&clause.field.as_str()) {
        tracing::warn!(table = %clause.table, field = %clause.field, "filter field not allowed");
        return None;
    }

    let Some(select) = QueryParam::from_json(&clause.select) else {
        tracing::warn!(select = %clause.select, "filter select must be a scalar");
        return None;
    };

    let uri_keys = pivot_keys(uri_metadata_keys, &[])?;
    let version_keys = pivot_keys(version_metadata_keys, &uri_keys)?;

    let mut params = Vec::new();
    let mut columns = String::from(
        "SELECT u.id AS uri_id, u.uri AS uri, u.uri_type AS uri_type, d.name AS domain",
    );
    let mut joins = String::from("\nFROM uris u\nJOIN domains d ON d.id = u.domain_id");

    if !uri_keys.is_empty() {
        let mut pivots = Vec::new();
        for key in &uri_keys {
            columns.push_str(&format!(", pumd.\"{}\"", key));
            pivots.push(format!(
                "MAX(CASE WHEN ium.key = ? THEN ium.value END) AS \"{}\"",
                key
            ));
            params.push(QueryParam::Text(key.clone()));
        }
        joins.push_str(&format!(
            "\nLEFT JOIN (SELECT ium.uri_id AS uri_id, {} FROM uri_metadata ium GROUP BY ium.uri_id) pumd\n    ON pumd.uri_id = u.id",
            pivots.join(", ")
        ));
    }

    if !version_keys.is_empty() {
        let mut pivots = Vec::new();
        for key in &version_keys {
            columns.push_str(&format!(", pvmd.\"{}\"", key));
            pivots.push(format!(
                "MAX(CASE WHEN ivm.key = ? THEN ivm.value END) AS \"{}\"",
                key
            ));
            params.push(QueryParam::Text(key.clone()));
        }
        joins.push_str(
            "\nLEFT JOIN (SELECT rv.uri_id AS uri_id, rv.id AS version_id FROM (\n        SELECT id, uri_id, RANK() OVER (PARTITION BY uri_id ORDER BY modified DESC, id ASC) AS rnk\n        FROM versions) rv WHERE rv.rnk = 1) lv\n    ON lv.uri_id = u.id",
        );
        joins.push_str(&format!(
            "\nLEFT JOIN (SELECT ivm.version_id AS version_id, {} FROM version_metadata ivm GROUP BY ivm.version_id) pvmd\n    ON pvmd.version_id = lv.version_id",
            pivots.join(", ")
        ));
    }

    let mut condition = String::from("\nWHERE u.deleted IS NULL AND ");
    match table {
        TableClass::Uris => {
            condition.push_str(&format!("u.\"{}\" = ?", clause.field));
            params.push(select);
        }
        TableClass::UriMetadata => {
            condition.push_str(&format!(
                "EXISTS (SELECT 1 FROM uri_metadata fm WHERE fm.uri_id = u.id AND fm.\"{}\" = ?",
                clause.field
            ));
            params.push(select);
            push_value_filter(&mut condition, &mut params, "fm", clause.filter.as_deref());
            condition.push(')');
        }
        TableClass::VersionMetadata => {
            condition.push_str(&format!(
                "EXISTS (SELECT 1 FROM version_metadata fvm JOIN versions fv ON fv.id = fvm.version_id WHERE fv.uri_id = u.id AND fvm.\"{}\" = ?",
                clause.field
            ));
            params.push(select);
            push_value_filter(&mut condition, &mut params, "fvm", clause.filter.as_deref());
            condition.push(')');
        }
    }

    let sql = format!("{}{}{}\nORDER BY u.id", columns, joins, condition);
    tracing::debug!(sql = %sql, "built catalog query");

    Some(CatalogQuery {
        sql,
        params,
        uri_metadata_keys: uri_keys,
        version_metadata_keys: version_keys,
    })
}

fn push_value_filter(
    condition: &mut String,
    params: &mut Vec<QueryParam>,
    alias: &str,
    filter: Option<&[String]>,
) {
    let Some(values) = filter else {
        return;
    };
    let placeholders = vec!["?"; values.len()].join(", ");
    condition.push_str(&format!(" AND {}.value IN ({})", alias, placeholders));
    params.extend(values.iter().cloned().map(QueryParam::Text));
}

/// Validates pivot keys, dropping duplicates and keys already in `taken`.
fn pivot_keys(keys: &[String], taken: &[String]) -> Option<Vec<String>> {
    let mut out: Vec<String> = Vec::new();
    for key in keys {
        if !is_identifier(key) || BASE_COLUMNS.contains(&key.as_str()) {
            tracing::warn!(key = %key, "invalid metadata pivot key");
            return None;
        }
        if out.contains(key) || taken.contains(key) {
            continue;
        }
        out.push(key.clone());
    }
    Some(out)
}

fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

impl CatalogQuery {
    /// Runs the query, returning one work item per matching URI with its
    /// non-null pivot columns in `metadata`.
    pub async fn fetch(&self, pool: &SqlitePool) -> Result<Vec<WorkItem>> {
        let mut query = sqlx::query(&self.sql);
        for param in &self.params {
            query = match param {
                QueryParam::Int(i) => query.bind(*i),
                QueryParam::Real(f) => query.bind(*f),
                QueryParam::Text(s) => query.bind(s.as_str()),
            };
        }

        let rows = query.fetch_all(pool).await?;
        let mut items = Vec::with_capacity(rows.len());
        for row in rows {
            let mut metadata = BTreeMap::new();
            for key in self
                .uri_metadata_keys
                .iter()
                .chain(self.version_metadata_keys.iter())
            {
                if let Some(value) = row.try_get::<Option<String>, _>(key.as_str())? {
                    metadata.insert(key.clone(), value);
                }
            }
            items.push(WorkItem {
                uri_id: Some(row.try_get("uri_id")?),
                uri: row.try_get("uri")?,
                uri_type: row.try_get("uri_type")?,
                domain: Some(row.try_get("domain")?),
                metadata,
            });
        }
        Ok(items)
    }
}
