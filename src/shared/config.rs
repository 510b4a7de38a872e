use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Result};
use serde::Deserialize;

pub const CONFIG_PATH_ENV: &str = "INSIGHT_CONFIG";
pub const API_KEY_ENV: &str = "INSIGHT_INFERENCE_API_KEY";

#[derive(Debug, Clone, Deserialize, Default)]
pub struct InsightConfig {
    #[serde(default)]
    pub assistant: AssistantConfig,
    #[serde(default)]
    pub inference: InferenceConfig,
    #[serde(default)]
    pub conversation: ConversationConfig,
    #[serde(default)]
    pub data: DataConfig,
    #[serde(default)]
    pub reports: ReportsConfig,
    #[serde(default)]
    pub anomalies: AnomaliesConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AssistantConfig {
    #[serde(default = "default_assistant_name")]
    pub name: String,
    #[serde(default)]
    pub briefing: Option<String>,
}

impl Default for AssistantConfig {
    fn default() -> Self {
        Self {
            name: default_assistant_name(),
            briefing: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TemplateKind {
    #[default]
    Openai,
    Gemini,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InferenceConfig {
    #[serde(default)]
    pub template: TemplateKind,
    #[serde(default = "default_inference_url")]
    pub url: String,
    #[serde(default = "default_inference_model")]
    pub model: String,
    /// Unbounded when absent.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(skip)]
    pub api_key: Option<String>,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            template: TemplateKind::default(),
            url: default_inference_url(),
            model: default_inference_model(),
            timeout_secs: None,
            api_key: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConversationConfig {
    #[serde(default = "default_max_turns")]
    pub max_turns: usize,
    #[serde(default = "default_result_preview_chars")]
    pub result_preview_chars: usize,
}

impl Default for ConversationConfig {
    fn default() -> Self {
        Self {
            max_turns: default_max_turns(),
            result_preview_chars: default_result_preview_chars(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DataConfig {
    #[serde(default = "default_data_dir")]
    pub dir: PathBuf,
    #[serde(default = "default_subject_column")]
    pub subject_column: String,
    /// Table name -> column used for date range filtering.
    #[serde(default)]
    pub date_columns: std::collections::HashMap<String, String>,
    /// Table holding one descriptive row per subject, shown to the model.
    #[serde(default = "default_profile_table")]
    pub profile_table: String,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            dir: default_data_dir(),
            subject_column: default_subject_column(),
            date_columns: Default::default(),
            profile_table: default_profile_table(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReportsConfig {
    #[serde(default = "default_transactions_table")]
    pub transactions_table: String,
    #[serde(default = "default_amount_column")]
    pub amount_column: String,
    #[serde(default = "default_sales_trend_days")]
    pub sales_trend_days: i64,
    #[serde(default = "default_lookback_days")]
    pub lookback_days: i64,
}

impl Default for ReportsConfig {
    fn default() -> Self {
        Self {
            transactions_table: default_transactions_table(),
            amount_column: default_amount_column(),
            sales_trend_days: default_sales_trend_days(),
            lookback_days: default_lookback_days(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AnomaliesConfig {
    #[serde(default = "default_sales_drop_threshold")]
    pub sales_drop_threshold_percent: f64,
    #[serde(default = "default_low_stock_threshold")]
    pub low_stock_threshold: f64,
    #[serde(default = "default_inventory_table")]
    pub inventory_table: String,
    #[serde(default = "default_stock_column")]
    pub stock_column: String,
    #[serde(default = "default_item_column")]
    pub item_column: String,
}

impl Default for AnomaliesConfig {
    fn default() -> Self {
        Self {
            sales_drop_threshold_percent: default_sales_drop_threshold(),
            low_stock_threshold: default_low_stock_threshold(),
            inventory_table: default_inventory_table(),
            stock_column: default_stock_column(),
            item_column: default_item_column(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_dir")]
    pub dir: String,
    #[serde(default = "default_service_name")]
    pub service_name: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            dir: default_log_dir(),
            service_name: default_service_name(),
        }
    }
}

impl InsightConfig {
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let data = fs::read_to_string(path)
            .map_err(|e| anyhow!("Failed to read config at {}: {}", path.display(), e))?;
        let config: InsightConfig = serde_json::from_str(&data)
            .map_err(|e| anyhow!("Failed to parse config JSON at {}: {}", path.display(), e))?;
        config.normalized()
    }

    /// Loads the resolved config path if the file exists, defaults otherwise.
    pub fn load_default() -> Result<(Self, PathBuf)> {
        let path = resolve_config_path();
        let config = if path.exists() {
            Self::load_from_path(&path)?
        } else {
            Self::default().normalized()?
        };
        Ok((config, path))
    }

    fn normalized(mut self) -> Result<Self> {
        self.assistant.name = self.assistant.name.trim().to_string();
        if self.assistant.name.is_empty() {
            self.assistant.name = default_assistant_name();
        }
        self.assistant.briefing = self
            .assistant
            .briefing
            .take()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty());

        self.inference.url = self.inference.url.trim().trim_end_matches('/').to_string();
        if self.inference.url.is_empty() {
            self.inference.url = default_inference_url();
        }
        self.inference.model = self.inference.model.trim().to_string();
        if self.inference.model.is_empty() {
            self.inference.model = default_inference_model();
        }
        self.inference.api_key = std::env::var(API_KEY_ENV)
            .ok()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty());

        if self.conversation.max_turns == 0 {
            return Err(anyhow!("conversation.max_turns must be at least 1"));
        }

        self.data.subject_column = self.data.subject_column.trim().to_string();
        if self.data.subject_column.is_empty() {
            self.data.subject_column = default_subject_column();
        }

        Ok(self)
    }
}

fn default_assistant_name() -> String {
    "Insight".to_string()
}

fn default_inference_url() -> String {
    "http://localhost:11434/v1/chat/completions".to_string()
}

fn default_inference_model() -> String {
    "gemini-2.0-flash".to_string()
}

fn default_max_turns() -> usize {
    crate::insight::conversation::MAX_TURNS
}

fn default_result_preview_chars() -> usize {
    1000
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

fn default_subject_column() -> String {
    "merchant_id".to_string()
}

fn default_profile_table() -> String {
    "merchant".to_string()
}

fn default_transactions_table() -> String {
    "transaction_data".to_string()
}

fn default_amount_column() -> String {
    "total_amount".to_string()
}

fn default_sales_trend_days() -> i64 {
    14
}

fn default_lookback_days() -> i64 {
    1095
}

fn default_sales_drop_threshold() -> f64 {
    -20.0
}

fn default_low_stock_threshold() -> f64 {
    5.0
}

fn default_inventory_table() -> String {
    "inventory".to_string()
}

fn default_stock_column() -> String {
    "current_stock".to_string()
}

fn default_item_column() -> String {
    "item_id".to_string()
}

fn default_log_dir() -> String {
    "logs".to_string()
}

fn default_service_name() -> String {
    "insight".to_string()
}

pub fn resolve_config_path() -> PathBuf {
    if let Ok(path) = std::env::var(CONFIG_PATH_ENV) {
        return expand_path(path);
    }

    PathBuf::from("insight.json")
}

pub fn expand_path(input: String) -> PathBuf {
    if let Some(stripped) = input.strip_prefix("~/") {
        if let Some(home) = home_dir() {
            return home.join(stripped);
        }
    }
    PathBuf::from(input)
}

fn home_dir() -> Option<PathBuf> {
    if cfg!(windows) {
        std::env::var_os("USERPROFILE").map(PathBuf::from)
    } else {
        std::env::var_os("HOME").map(PathBuf::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn empty_object_yields_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{{}}").unwrap();

        let config = InsightConfig::load_from_path(file.path()).unwrap();
        assert_eq!(config.conversation.max_turns, 10);
        assert_eq!(config.conversation.result_preview_chars, 1000);
        assert_eq!(config.data.subject_column, "merchant_id");
        assert_eq!(config.anomalies.sales_drop_threshold_percent, -20.0);
        assert_eq!(config.anomalies.low_stock_threshold, 5.0);
        assert_eq!(config.inference.template, TemplateKind::Openai);
        assert!(config.inference.timeout_secs.is_none());
    }

    #[test]
    fn values_are_trimmed_and_blank_fields_fall_back() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                "assistant": {{ "name": "  ", "briefing": "  Be brief.  " }},
                "inference": {{ "template": "gemini", "url": " https://example.test/ ", "model": "" }}
            }}"#
        )
        .unwrap();

        let config = InsightConfig::load_from_path(file.path()).unwrap();
        assert_eq!(config.assistant.name, "Insight");
        assert_eq!(config.assistant.briefing.as_deref(), Some("Be brief."));
        assert_eq!(config.inference.template, TemplateKind::Gemini);
        assert_eq!(config.inference.url, "https://example.test");
        assert_eq!(config.inference.model, "gemini-2.0-flash");
    }

    #[test]
    fn zero_turn_budget_is_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{ "conversation": {{ "max_turns": 0 }} }}"#).unwrap();

        assert!(InsightConfig::load_from_path(file.path()).is_err());
    }
}
