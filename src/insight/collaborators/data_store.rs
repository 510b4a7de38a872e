use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use serde_json::{Number, Value};
use tracing::{debug, info, warn};

use super::{cell_text, row_date, DataAccess, DateRange, Row, TableSchema};
use crate::shared::config::DataConfig;

struct Table {
    columns: Vec<String>,
    rows: Vec<Row>,
    date_column: Option<String>,
}

/// In-memory [`DataAccess`] over `.csv` and `.json` files. Each file becomes a
/// table named after its stem. Loaded once, then read concurrently.
pub struct TableStore {
    tables: BTreeMap<String, Table>,
    subject_column: String,
}

impl TableStore {
    pub fn new(subject_column: impl Into<String>) -> Self {
        Self {
            tables: BTreeMap::new(),
            subject_column: subject_column.into(),
        }
    }

    pub fn load_dir(dir: &Path, config: &DataConfig) -> Result<Self> {
        let mut store = Self::new(config.subject_column.clone());
        let entries = fs::read_dir(dir)
            .with_context(|| format!("Failed to read data directory {}", dir.display()))?;

        let mut paths: Vec<_> = entries
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| path.is_file())
            .collect();
        paths.sort();

        for path in paths {
            let Some(name) = path.file_stem().and_then(|s| s.to_str()).map(str::to_string) else {
                continue;
            };
            let extension = path
                .extension()
                .and_then(|e| e.to_str())
                .map(|e| e.to_ascii_lowercase());
            let rows = match extension.as_deref() {
                Some("csv") => load_csv(&path)?,
                Some("json") => load_json(&path)?,
                _ => {
                    debug!("Skipping non-table file {}", path.display());
                    continue;
                }
            };
            let date_column = config.date_columns.get(&name).cloned();
            info!("Loaded table '{}' ({} rows) from {}", name, rows.len(), path.display());
            store.insert_table(name, rows, date_column);
        }

        if store.tables.is_empty() {
            warn!("No tables found in {}", dir.display());
        }
        Ok(store)
    }

    /// Registers a table. Without an explicit `date_column` the first column
    /// named like `*_time`, `*_date` or `date` is used for range filtering.
    pub fn insert_table(&mut self, name: impl Into<String>, rows: Vec<Row>, date_column: Option<String>) {
        let mut columns: Vec<String> = Vec::new();
        for row in &rows {
            for key in row.keys() {
                if !columns.iter().any(|c| c == key) {
                    columns.push(key.clone());
                }
            }
        }
        let date_column = date_column.or_else(|| detect_date_column(&columns));
        self.tables.insert(
            name.into(),
            Table {
                columns,
                rows,
                date_column,
            },
        );
    }
}

impl DataAccess for TableStore {
    fn tables(&self) -> Vec<TableSchema> {
        self.tables
            .iter()
            .map(|(name, table)| TableSchema {
                name: name.clone(),
                columns: table.columns.clone(),
                date_column: table.date_column.clone(),
            })
            .collect()
    }

    fn query(&self, table: &str, subject_id: &str, range: DateRange) -> Result<Vec<Row>> {
        let data = self.tables.get(table).ok_or_else(|| {
            anyhow!(
                "Unknown table '{}'. Available tables: {}",
                table,
                self.tables.keys().cloned().collect::<Vec<_>>().join(", ")
            )
        })?;

        let scoped = data.columns.iter().any(|c| c == &self.subject_column);
        let date_column = data.date_column.as_deref().filter(|_| !range.is_unbounded());

        Ok(data
            .rows
            .iter()
            .filter(|row| {
                !scoped
                    || row
                        .get(&self.subject_column)
                        .and_then(cell_text)
                        .map(|v| v == subject_id)
                        .unwrap_or(false)
            })
            .filter(|row| match date_column {
                Some(column) => row_date(row, column).map_or(false, |d| range.contains(d)),
                None => true,
            })
            .cloned()
            .collect())
    }
}

fn detect_date_column(columns: &[String]) -> Option<String> {
    columns
        .iter()
        .find(|c| {
            let lower = c.to_ascii_lowercase();
            lower == "date" || lower.ends_with("_date") || lower.ends_with("_time")
        })
        .cloned()
}

fn load_csv(path: &Path) -> Result<Vec<Row>> {
    let mut reader = csv::Reader::from_path(path)
        .with_context(|| format!("Failed to open {}", path.display()))?;
    let headers: Vec<String> = reader
        .headers()
        .with_context(|| format!("Failed to read header of {}", path.display()))?
        .iter()
        .map(|h| h.trim().to_string())
        .collect();

    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record.with_context(|| format!("Malformed record in {}", path.display()))?;
        let row: Row = headers
            .iter()
            .zip(record.iter())
            .map(|(header, cell)| (header.clone(), parse_cell(cell)))
            .collect();
        rows.push(row);
    }
    Ok(rows)
}

fn load_json(path: &Path) -> Result<Vec<Row>> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let value: Value = serde_json::from_str(&text)
        .with_context(|| format!("Failed to parse JSON table {}", path.display()))?;
    match value {
        Value::Array(items) => items
            .into_iter()
            .map(|item| match item {
                Value::Object(row) => Ok(row),
                other => Err(anyhow!(
                    "{} must hold an array of objects, found {}",
                    path.display(),
                    other
                )),
            })
            .collect(),
        _ => Err(anyhow!("{} must hold an array of objects", path.display())),
    }
}

/// CSV cells arrive untyped. Integers, floats and booleans are promoted so
/// snippets can do arithmetic without casting.
fn parse_cell(raw: &str) -> Value {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Value::Null;
    }
    if let Ok(i) = trimmed.parse::<i64>() {
        return Value::Number(i.into());
    }
    if let Ok(f) = trimmed.parse::<f64>() {
        if let Some(n) = Number::from_f64(f) {
            return Value::Number(n);
        }
    }
    match trimmed {
        "true" | "True" | "TRUE" => Value::Bool(true),
        "false" | "False" | "FALSE" => Value::Bool(false),
        _ => Value::String(trimmed.to_string()),
    }
}

/// Convenience for building a store from literal rows.
pub fn rows_from_json(value: Value) -> Vec<Row> {
    match value {
        Value::Array(items) => items
            .into_iter()
            .filter_map(|item| match item {
                Value::Object(row) => Some(row),
                _ => None,
            })
            .collect(),
        _ => Vec::new(),
    }
}

pub(crate) fn group_sum_by_date(
    rows: &[Row],
    date_column: &str,
    amount_column: &str,
) -> HashMap<chrono::NaiveDate, (usize, f64)> {
    let mut totals: HashMap<chrono::NaiveDate, (usize, f64)> = HashMap::new();
    for row in rows {
        if let Some(date) = row_date(row, date_column) {
            let entry = totals.entry(date).or_insert((0, 0.0));
            entry.0 += 1;
            entry.1 += super::row_number(row, amount_column).unwrap_or(0.0);
        }
    }
    totals
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use serde_json::json;
    use std::io::Write;

    fn d(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    #[test]
    fn loads_csv_and_json_tables_from_directory() {
        let dir = tempfile::tempdir().unwrap();
        let mut csv_file = fs::File::create(dir.path().join("transaction_data.csv")).unwrap();
        writeln!(csv_file, "order_id,merchant_id,order_time,total_amount").unwrap();
        writeln!(csv_file, "1,m1,2024-05-01T09:00:00Z,10.5").unwrap();
        writeln!(csv_file, "2,m2,2024-05-01T10:00:00Z,4").unwrap();
        writeln!(csv_file, "3,m1,2024-05-02T11:00:00Z,7").unwrap();
        fs::write(
            dir.path().join("inventory.json"),
            r#"[{"merchant_id": "m1", "item_id": "i1", "current_stock": 3}]"#,
        )
        .unwrap();
        fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let store = TableStore::load_dir(dir.path(), &DataConfig::default()).unwrap();

        let names: Vec<String> = store.tables().into_iter().map(|s| s.name).collect();
        assert_eq!(names, vec!["inventory", "transaction_data"]);

        let schema = store.schema("transaction_data").unwrap();
        assert_eq!(schema.date_column.as_deref(), Some("order_time"));

        let rows = store
            .query("transaction_data", "m1", DateRange::unbounded())
            .unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["total_amount"], json!(10.5));
        assert_eq!(rows[0]["order_id"], json!(1));
    }

    #[test]
    fn query_filters_by_subject_and_date_range() {
        let mut store = TableStore::new("merchant_id");
        store.insert_table(
            "transaction_data",
            rows_from_json(json!([
                { "merchant_id": "m1", "order_time": "2024-05-01T09:00:00Z" },
                { "merchant_id": "m1", "order_time": "2024-05-02T09:00:00Z" },
                { "merchant_id": "m1", "order_time": "2024-05-03T09:00:00Z" },
                { "merchant_id": "m2", "order_time": "2024-05-02T09:00:00Z" }
            ])),
            None,
        );

        let range = DateRange::new(Some(d("2024-05-02")), Some(d("2024-05-03")));
        let rows = store.query("transaction_data", "m1", range).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["order_time"], json!("2024-05-02T09:00:00Z"));
    }

    #[test]
    fn unscoped_tables_are_shared_and_unknown_tables_fail() {
        let mut store = TableStore::new("merchant_id");
        store.insert_table("holidays", rows_from_json(json!([{ "date": "2024-12-25" }])), None);

        assert_eq!(store.query("holidays", "anyone", DateRange::unbounded()).unwrap().len(), 1);
        let err = store
            .query("missing", "m1", DateRange::unbounded())
            .unwrap_err();
        assert!(err.to_string().contains("holidays"));
    }
}
