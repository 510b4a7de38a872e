use serde::{Deserialize, Serialize};

use super::chart::ChartCommand;
use super::tool::{ToolCallRequest, ToolResult};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationRequest {
    pub subject_id: String,
    pub question_text: String,
}

impl ConversationRequest {
    pub fn new(subject_id: impl Into<String>, question_text: impl Into<String>) -> Self {
        Self {
            subject_id: subject_id.into(),
            question_text: question_text.into(),
        }
    }
}

/// One prompt -> model -> action round trip. Kept in memory for the lifetime
/// of a single request only.
#[derive(Debug, Clone, Serialize)]
pub struct TurnRecord {
    pub index: usize,
    pub prompt_sent: String,
    pub raw_model_output: String,
    pub thinking_text: String,
    pub tool_call: Option<ToolCallRequest>,
    pub tool_result: Option<ToolResult>,
    pub final_answer: Option<String>,
}

/// How a conversation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Termination {
    Answered,
    Charted,
    Ambiguous,
    ServiceFailure,
    TurnLimit,
}

/// Outbound payload: `{"answer": ..., "chart_command"?: ...}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinalResponse {
    #[serde(rename = "answer")]
    pub answer_text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chart_command: Option<ChartCommand>,
}

impl FinalResponse {
    pub fn text(answer_text: impl Into<String>) -> Self {
        Self {
            answer_text: answer_text.into(),
            chart_command: None,
        }
    }

    pub fn with_chart(answer_text: impl Into<String>, chart_command: ChartCommand) -> Self {
        Self {
            answer_text: answer_text.into(),
            chart_command: Some(chart_command),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shared::models::{ChartOptions, ChartType};
    use serde_json::json;

    #[test]
    fn text_response_omits_chart_command() {
        let value = serde_json::to_value(FinalResponse::text("Your sales were $120.")).unwrap();
        assert_eq!(value, json!({ "answer": "Your sales were $120." }));
    }

    #[test]
    fn chart_response_uses_wire_shape() {
        let chart = ChartCommand::new(
            ChartType::Line,
            json!({ "labels": ["Mon"], "data": [5] }),
            ChartOptions {
                title: "Trend".to_string(),
                x_label: Some("Day".to_string()),
                y_label: None,
            },
        );
        let value = serde_json::to_value(FinalResponse::with_chart("Here", chart)).unwrap();
        assert_eq!(
            value,
            json!({
                "answer": "Here",
                "chart_command": {
                    "type": "chart",
                    "payload": {
                        "chart_type": "line",
                        "chart_data": { "labels": ["Mon"], "data": [5] },
                        "options": { "title": "Trend", "x_label": "Day", "y_label": null }
                    }
                }
            })
        );
    }
}
