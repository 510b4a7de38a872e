use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration, NaiveDate};
use tracing::debug;

use super::data_store::group_sum_by_date;
use super::{cell_text, round2, row_date, row_number, AnomalyFinding, AnomalyScanner, DataAccess, DateRange};
use crate::shared::config::{AnomaliesConfig, ReportsConfig};

const MAX_LOW_STOCK_FINDINGS: usize = 3;

/// Threshold checks: day-over-day sales drop on the latest day with data,
/// and items whose latest recorded stock is under the low-stock threshold.
pub struct ThresholdAnomalyScanner {
    data: Arc<dyn DataAccess>,
    thresholds: AnomaliesConfig,
    reports: ReportsConfig,
}

impl ThresholdAnomalyScanner {
    pub fn new(data: Arc<dyn DataAccess>, thresholds: AnomaliesConfig, reports: ReportsConfig) -> Self {
        Self {
            data,
            thresholds,
            reports,
        }
    }

    fn sales_drop(&self, subject_id: &str) -> anyhow::Result<Option<AnomalyFinding>> {
        let table = &self.reports.transactions_table;
        let Some(date_column) = self.data.schema(table).and_then(|s| s.date_column) else {
            debug!("Skipping sales drop check: '{}' has no date column", table);
            return Ok(None);
        };

        let rows = self.data.query(table, subject_id, DateRange::unbounded())?;
        let daily = group_sum_by_date(&rows, &date_column, &self.reports.amount_column);
        let Some(latest) = daily.keys().max().copied() else {
            return Ok(None);
        };

        let current = daily.get(&latest).map(|(_, s)| *s).unwrap_or(0.0);
        let baseline = daily
            .get(&(latest - Duration::days(1)))
            .map(|(_, s)| *s)
            .unwrap_or(0.0);
        if baseline <= 0.0 {
            return Ok(None);
        }

        let change = (current - baseline) / baseline * 100.0;
        if change >= self.thresholds.sales_drop_threshold_percent {
            return Ok(None);
        }

        Ok(Some(AnomalyFinding {
            kind: "sales_drop_dod".to_string(),
            metric: "Sales".to_string(),
            current_value: round2(current),
            baseline_value: Some(round2(baseline)),
            change_percent: Some((change * 10.0).round() / 10.0),
            threshold: Some(self.thresholds.sales_drop_threshold_percent),
            period: Some(format!("Day-over-Day ({})", latest.format("%Y-%m-%d"))),
            item_id: None,
        }))
    }

    fn low_stock(&self, subject_id: &str) -> anyhow::Result<Vec<AnomalyFinding>> {
        let table = &self.thresholds.inventory_table;
        let Some(schema) = self.data.schema(table) else {
            debug!("Skipping low stock check: no '{}' table", table);
            return Ok(Vec::new());
        };

        let rows = self.data.query(table, subject_id, DateRange::unbounded())?;

        // Inventory rows form a change log; the latest row per item is current.
        let mut latest: HashMap<String, (Option<NaiveDate>, usize, f64)> = HashMap::new();
        for (position, row) in rows.iter().enumerate() {
            let Some(item) = row.get(&self.thresholds.item_column).and_then(cell_text) else {
                continue;
            };
            let Some(stock) = row_number(row, &self.thresholds.stock_column) else {
                continue;
            };
            let date = schema.date_column.as_deref().and_then(|c| row_date(row, c));
            let replace = match latest.get(&item) {
                Some((seen_date, seen_pos, _)) => (date, position) >= (*seen_date, *seen_pos),
                None => true,
            };
            if replace {
                latest.insert(item, (date, position, stock));
            }
        }

        let mut low: Vec<(String, f64)> = latest
            .into_iter()
            .filter(|(_, (_, _, stock))| *stock < self.thresholds.low_stock_threshold)
            .map(|(item, (_, _, stock))| (item, stock))
            .collect();
        low.sort_by(|a, b| a.1.total_cmp(&b.1).then_with(|| a.0.cmp(&b.0)));

        Ok(low
            .into_iter()
            .take(MAX_LOW_STOCK_FINDINGS)
            .map(|(item, stock)| AnomalyFinding {
                kind: "low_stock".to_string(),
                metric: "Inventory".to_string(),
                current_value: stock,
                baseline_value: None,
                change_percent: None,
                threshold: Some(self.thresholds.low_stock_threshold),
                period: None,
                item_id: Some(item),
            })
            .collect())
    }
}

#[async_trait]
impl AnomalyScanner for ThresholdAnomalyScanner {
    async fn scan(&self, subject_id: &str) -> anyhow::Result<Vec<AnomalyFinding>> {
        let mut findings = Vec::new();
        findings.extend(self.sales_drop(subject_id)?);
        findings.extend(self.low_stock(subject_id)?);
        Ok(findings)
    }
}
