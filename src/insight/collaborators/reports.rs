use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration, NaiveDate, Utc};
use serde_json::{json, Value};
use tracing::info;

use super::data_store::group_sum_by_date;
use super::{round2, DataAccess, DateRange, ReportGenerator};
use crate::shared::config::ReportsConfig;

/// Builds the daily sales report from the transactions table.
///
/// Date policy: a requested date on or before the latest day with data is
/// honoured; an omitted date or one past the latest data day falls back to
/// that latest day. The date actually used is returned as
/// `effective_report_date`.
pub struct DailyReportGenerator {
    data: Arc<dyn DataAccess>,
    config: ReportsConfig,
}

impl DailyReportGenerator {
    pub fn new(data: Arc<dyn DataAccess>, config: ReportsConfig) -> Self {
        Self { data, config }
    }

    fn build(&self, subject_id: &str, requested: Option<NaiveDate>) -> anyhow::Result<Value> {
        let table = &self.config.transactions_table;
        let requested_text = requested.map(|d| d.format("%Y-%m-%d").to_string());

        let Some(date_column) = self.data.schema(table).and_then(|s| s.date_column) else {
            return Ok(error_report(
                requested_text,
                format!("Table '{table}' has no date column to build a daily report from."),
            ));
        };

        let today = Utc::now().date_naive();
        let window = DateRange::new(
            Some(today - Duration::days(self.config.lookback_days)),
            Some(today + Duration::days(1)),
        );
        let rows = self.data.query(table, subject_id, window)?;
        let daily = group_sum_by_date(&rows, &date_column, &self.config.amount_column);

        let Some(latest) = daily.keys().max().copied() else {
            return Ok(error_report(
                requested_text,
                format!(
                    "No recent transaction data found for {subject_id} in the last {} days to generate a report.",
                    self.config.lookback_days
                ),
            ));
        };

        let effective = match requested {
            Some(date) if date <= latest => date,
            _ => latest,
        };
        let previous = effective - Duration::days(1);

        let (orders, sales) = daily.get(&effective).copied().unwrap_or((0, 0.0));
        let previous_sales = daily.get(&previous).map(|(_, s)| *s).unwrap_or(0.0);
        let average_order_value = if orders > 0 {
            sales / orders as f64
        } else {
            0.0
        };
        let change_percent = if previous_sales > 0.0 {
            Some(round2((sales - previous_sales) / previous_sales * 100.0))
        } else {
            None
        };

        let trend_days = self.config.sales_trend_days.max(1);
        let mut labels = Vec::new();
        let mut data = Vec::new();
        for offset in (0..trend_days).rev() {
            let day = effective - Duration::days(offset);
            labels.push(day.format("%Y-%m-%d").to_string());
            data.push(round2(daily.get(&day).map(|(_, s)| *s).unwrap_or(0.0)));
        }

        info!(
            "Daily report for {} built for {} (requested {:?})",
            subject_id, effective, requested_text
        );

        Ok(json!({
            "report_date": requested_text,
            "effective_report_date": effective.format("%Y-%m-%d").to_string(),
            "error": null,
            "orders_on_report_date": orders,
            "sales_on_report_date": round2(sales),
            "average_order_value": round2(average_order_value),
            "previous_day_sales": round2(previous_sales),
            "day_over_day_change_percent": change_percent,
            "sales_trend_data": { "labels": labels, "data": data },
        }))
    }
}

fn error_report(requested: Option<String>, message: String) -> Value {
    json!({
        "report_date": requested,
        "error": message,
    })
}

#[async_trait]
impl ReportGenerator for DailyReportGenerator {
    async fn generate(&self, subject_id: &str, report_date: Option<NaiveDate>) -> anyhow::Result<Value> {
        self.build(subject_id, report_date)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::insight::collaborators::data_store::{rows_from_json, TableStore};

    fn fmt(date: NaiveDate) -> String {
        date.format("%Y-%m-%dT12:00:00Z").to_string()
    }

    fn generator_with_sales(days_ago_amounts: &[(i64, f64)]) -> (DailyReportGenerator, NaiveDate) {
        let today = Utc::now().date_naive();
        let rows: Vec<Value> = days_ago_amounts
            .iter()
            .map(|(ago, amount)| {
                json!({
                    "merchant_id": "m1",
                    "order_time": fmt(today - Duration::days(*ago)),
                    "total_amount": amount
                })
            })
            .collect();
        let mut store = TableStore::new("merchant_id");
        store.insert_table("transaction_data", rows_from_json(Value::Array(rows)), None);
        let config = ReportsConfig {
            sales_trend_days: 3,
            ..ReportsConfig::default()
        };
        (DailyReportGenerator::new(Arc::new(store), config), today)
    }

    #[tokio::test]
    async fn omitted_date_uses_latest_day_with_data() {
        let (generator, today) = generator_with_sales(&[(3, 10.0), (3, 30.0), (4, 50.0)]);
        let report = generator.generate("m1", None).await.unwrap();

        let latest = (today - Duration::days(3)).format("%Y-%m-%d").to_string();
        assert_eq!(report["effective_report_date"], json!(latest));
        assert_eq!(report["report_date"], Value::Null);
        assert_eq!(report["orders_on_report_date"], json!(2));
        assert_eq!(report["sales_on_report_date"], json!(40.0));
        assert_eq!(report["average_order_value"], json!(20.0));
        assert_eq!(report["previous_day_sales"], json!(50.0));
        assert_eq!(report["day_over_day_change_percent"], json!(-20.0));
        assert_eq!(report["sales_trend_data"]["data"], json!([0.0, 50.0, 40.0]));
    }

    #[tokio::test]
    async fn future_date_falls_back_and_past_date_is_kept() {
        let (generator, today) = generator_with_sales(&[(2, 10.0), (5, 8.0)]);

        let future = generator
            .generate("m1", Some(today + Duration::days(30)))
            .await
            .unwrap();
        let latest = (today - Duration::days(2)).format("%Y-%m-%d").to_string();
        assert_eq!(future["effective_report_date"], json!(latest));

        let past_day = today - Duration::days(5);
        let past = generator.generate("m1", Some(past_day)).await.unwrap();
        assert_eq!(
            past["effective_report_date"],
            json!(past_day.format("%Y-%m-%d").to_string())
        );
        assert_eq!(past["sales_on_report_date"], json!(8.0));
    }

    #[tokio::test]
    async fn subject_without_data_gets_error_document() {
        let (generator, _) = generator_with_sales(&[(1, 10.0)]);
        let report = generator.generate("nobody", None).await.unwrap();
        assert!(report["error"].as_str().unwrap().contains("nobody"));
    }
}
