use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const DEFAULT_CHART_TITLE: &str = "Sales Data";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChartType {
    Bar,
    Line,
}

impl ChartType {
    pub const SUPPORTED: [ChartType; 2] = [ChartType::Bar, ChartType::Line];

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "bar" => Some(ChartType::Bar),
            "line" => Some(ChartType::Line),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ChartType::Bar => "bar",
            ChartType::Line => "line",
        }
    }
}

/// Discriminator serialized as `"type": "chart"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChartCommandKind {
    #[serde(rename = "chart")]
    Chart,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChartOptions {
    pub title: String,
    pub x_label: Option<String>,
    pub y_label: Option<String>,
}

impl Default for ChartOptions {
    fn default() -> Self {
        Self {
            title: DEFAULT_CHART_TITLE.to_string(),
            x_label: None,
            y_label: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChartPayload {
    pub chart_type: ChartType,
    pub chart_data: Value,
    pub options: ChartOptions,
}

/// Instruction for the UI to render a chart. Wire shape:
/// `{"type": "chart", "payload": {"chart_type", "chart_data", "options"}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChartCommand {
    #[serde(rename = "type")]
    pub kind: ChartCommandKind,
    pub payload: ChartPayload,
}

impl ChartCommand {
    pub fn new(chart_type: ChartType, chart_data: Value, options: ChartOptions) -> Self {
        Self {
            kind: ChartCommandKind::Chart,
            payload: ChartPayload {
                chart_type,
                chart_data,
                options,
            },
        }
    }

    pub fn chart_type(&self) -> ChartType {
        self.payload.chart_type
    }
}
