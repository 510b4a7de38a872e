//! Seams to the systems the engine talks to but does not own: tabular data,
//! report generation, anomaly scanning and the text-generation service.

pub mod anomalies;
pub mod data_store;
pub mod reports;

use async_trait::async_trait;
use chrono::NaiveDate;
use serde::Serialize;
use serde_json::{Map, Value};

use super::error::Result;

pub use anomalies::ThresholdAnomalyScanner;
pub use data_store::TableStore;
pub use reports::DailyReportGenerator;

pub type Row = Map<String, Value>;

/// Half-open date window `[start, end)`. Either bound may be absent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DateRange {
    pub start: Option<NaiveDate>,
    pub end: Option<NaiveDate>,
}

impl DateRange {
    pub fn new(start: Option<NaiveDate>, end: Option<NaiveDate>) -> Self {
        Self { start, end }
    }

    pub fn unbounded() -> Self {
        Self::default()
    }

    pub fn is_unbounded(&self) -> bool {
        self.start.is_none() && self.end.is_none()
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        self.start.map_or(true, |start| date >= start) && self.end.map_or(true, |end| date < end)
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct TableSchema {
    pub name: String,
    pub columns: Vec<String>,
    pub date_column: Option<String>,
}

/// Read-only access to business tables, scoped to one subject per query.
/// Implementations are shared across conversations and must tolerate
/// concurrent readers.
pub trait DataAccess: Send + Sync {
    fn tables(&self) -> Vec<TableSchema>;

    fn query(&self, table: &str, subject_id: &str, range: DateRange) -> anyhow::Result<Vec<Row>>;

    fn schema(&self, table: &str) -> Option<TableSchema> {
        self.tables().into_iter().find(|schema| schema.name == table)
    }
}

#[async_trait]
pub trait ReportGenerator: Send + Sync {
    /// Returns the report document. A document whose `error` field is set
    /// describes why no report could be produced.
    async fn generate(&self, subject_id: &str, report_date: Option<NaiveDate>)
        -> anyhow::Result<Value>;
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct AnomalyFinding {
    #[serde(rename = "type")]
    pub kind: String,
    pub metric: String,
    pub current_value: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub baseline_value: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub change_percent: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub threshold: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub period: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub item_id: Option<String>,
}

#[async_trait]
pub trait AnomalyScanner: Send + Sync {
    async fn scan(&self, subject_id: &str) -> anyhow::Result<Vec<AnomalyFinding>>;
}

#[async_trait]
pub trait TextGenerator: Send + Sync {
    async fn generate(&self, prompt: &str) -> Result<String>;
}

pub(crate) fn cell_text(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

/// Reads the calendar date from a `YYYY-MM-DD...` cell.
pub(crate) fn row_date(row: &Row, column: &str) -> Option<NaiveDate> {
    let text = row.get(column).and_then(Value::as_str)?;
    let head = text.trim().get(..10)?;
    NaiveDate::parse_from_str(head, "%Y-%m-%d").ok()
}

pub(crate) fn row_number(row: &Row, column: &str) -> Option<f64> {
    match row.get(column)? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

pub(crate) fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn date_range_is_half_open() {
        let d = |s: &str| NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap();
        let range = DateRange::new(Some(d("2024-05-01")), Some(d("2024-05-03")));
        assert!(range.contains(d("2024-05-01")));
        assert!(range.contains(d("2024-05-02")));
        assert!(!range.contains(d("2024-05-03")));
        assert!(DateRange::unbounded().contains(d("1999-01-01")));
    }

    #[test]
    fn row_helpers_read_loose_cells() {
        let row = json!({
            "order_time": "2024-05-01T09:49:00Z",
            "total_amount": "12.5",
            "merchant_id": 7
        });
        let row = row.as_object().unwrap();
        assert_eq!(
            row_date(row, "order_time"),
            NaiveDate::from_ymd_opt(2024, 5, 1)
        );
        assert_eq!(row_number(row, "total_amount"), Some(12.5));
        assert_eq!(cell_text(&row["merchant_id"]).as_deref(), Some("7"));
    }
}
