//! Agent orchestration: the conversation loop, reply parsing, tool dispatch
//! and the code sandbox, plus the collaborators a standalone deployment
//! wires in.

pub mod chart;
pub mod collaborators;
pub mod command;
pub mod conversation;
pub mod error;
pub mod executors;
pub mod inference;
pub mod inference_templates;
pub mod prompts;
pub mod response;
pub mod toolkit;

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;

use crate::shared::config::InsightConfig;
use collaborators::{DailyReportGenerator, DataAccess, TableStore, ThresholdAnomalyScanner};
use conversation::ConversationDriver;
use inference::InferenceClient;
use toolkit::ToolCatalog;

/// Loads the tables under `data_dir` and wires the collaborators, tool
/// catalog and inference client into a driver.
pub fn build_driver(config: &InsightConfig, data_dir: &Path) -> Result<ConversationDriver> {
    let store = TableStore::load_dir(data_dir, &config.data)?;
    let data: Arc<dyn DataAccess> = Arc::new(store);
    info!("Data tables: {}", table_names(data.as_ref()));

    let reports = Arc::new(DailyReportGenerator::new(data.clone(), config.reports.clone()));
    let anomalies = Arc::new(ThresholdAnomalyScanner::new(
        data.clone(),
        config.anomalies.clone(),
        config.reports.clone(),
    ));
    let catalog = Arc::new(ToolCatalog::new(data, reports, anomalies));

    let client = InferenceClient::new(&config.inference).context("Failed to initialize inference client")?;
    info!(
        "Inference endpoint: {} (model {})",
        client.endpoint(),
        config.inference.model
    );

    Ok(ConversationDriver::from_config(Arc::new(client), catalog, config))
}

fn table_names(data: &dyn DataAccess) -> String {
    let names: Vec<String> = data.tables().into_iter().map(|t| t.name).collect();
    if names.is_empty() {
        "(none)".to_string()
    } else {
        names.join(", ")
    }
}
