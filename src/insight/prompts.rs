use tracing::warn;

use super::collaborators::{cell_text, DataAccess, DateRange};
use crate::shared::config::{AssistantConfig, DataConfig};

const MAX_SCHEMA_COLUMNS: usize = 40;

const CORE_PRINCIPLES: &str = "\
- Be proactive: point out issues or opportunities even when not asked directly.
- Be actionable: give concrete recommendations, not just numbers.
- Be personal: use the context about this user's business.
- Be clear and simple: plain language, short answers, no jargon.
- Be accurate: rely only on the listed data and on tool results. Never invent data or tools.
- Be strategic: think step by step and call only one tool at a time.
";

const CHART_INSTRUCTION: &str = "Charts: first use `run_code` to compute the data and print it as JSON. Once the result is back, reply with a textual `ANSWER:` that explains the chart, immediately followed by `CALL_FUNCTION: display_chart(...)` with that JSON. Keep charts simple; a bar chart should have at most about 20 labels.";

const REPORT_INSTRUCTION: &str = "Daily reports: when `get_daily_report` returns JSON, format it as a Markdown summary in `ANSWER:`. Use the `effective_report_date` it reports. Present the figures without further analysis.";

/// Static context for one conversation plus the two prompt shapes: the full
/// opening prompt and the shorter continuation prompt used after a tool ran.
#[derive(Debug, Clone)]
pub struct PromptBuilder {
    briefing: String,
    subject_context: String,
    current_date: String,
    data_schemas: String,
    tool_descriptions: String,
    result_preview_chars: usize,
}

impl PromptBuilder {
    pub fn new(
        assistant: &AssistantConfig,
        subject_context: String,
        data_schemas: String,
        tool_descriptions: String,
        result_preview_chars: usize,
    ) -> Self {
        Self {
            briefing: briefing(assistant),
            subject_context,
            current_date: chrono::Utc::now().format("%Y-%m-%d").to_string(),
            data_schemas,
            tool_descriptions,
            result_preview_chars,
        }
    }

    pub fn with_current_date(mut self, date: impl Into<String>) -> Self {
        self.current_date = date.into();
        self
    }

    pub fn initial(&self, question: &str) -> String {
        let mut prompt = self.header();
        prompt.push_str("**Instructions:**\n");
        prompt.push_str(&format!("1. Analyze the question: \"{question}\".\n"));
        prompt.push_str("2. Think step by step under `Thinking:`.\n");
        prompt.push_str("3. Decide the first tool call you need and write `CALL_FUNCTION: ...`, or write `ANSWER: ...` if no tool is needed.\n");
        prompt.push_str("4. `run_code` rules: no plotting, print every result, print JSON for chart data, treat timestamps as UTC.\n");
        prompt.push_str(&format!("5. {CHART_INSTRUCTION}\n"));
        prompt.push_str(&format!("6. {REPORT_INSTRUCTION}\n"));
        prompt.push_str("7. Format: `Thinking: ...` then `CALL_FUNCTION: ...` or `ANSWER: ...`.\n\n");
        prompt.push_str(&format!("**User's Question:**\n{question}\n\n"));
        prompt.push_str("**Your Response:**\nThinking:\n");
        prompt
    }

    pub fn intermediate(&self, question: &str, previous_thinking: &str, provided_data: &str) -> String {
        let mut prompt = self.header();
        prompt.push_str(&format!("Continue answering: \"{question}\"\n\n"));
        prompt.push_str("**Conversation So Far:**\n");
        prompt.push_str(&format!("- Previous Thinking: {previous_thinking}\n"));
        prompt.push_str(&format!(
            "- Data/Result Provided:\n{}\n\n",
            truncate_preview(provided_data, self.result_preview_chars)
        ));
        prompt.push_str("**Instructions:**\n");
        prompt.push_str("1. Review the provided data.\n");
        prompt.push_str("2. Reason under `Thinking:` about the next step, based only on the provided data and the question.\n");
        prompt.push_str("3. Choose the next step:\n");
        prompt.push_str("   - Need more data or a calculation? `CALL_FUNCTION: run_code(...)`.\n");
        prompt.push_str("   - Ready to show a chart? `ANSWER: ...` and then `CALL_FUNCTION: display_chart(...)`.\n");
        prompt.push_str("   - Ready to answer? `ANSWER: ...`.\n");
        prompt.push_str("   - The data is an 'Execution Failed' report? Explain the fix under `Thinking:` and retry with a corrected call. Give up after one or two attempts and say so in `ANSWER:`.\n");
        prompt.push_str(&format!("4. {CHART_INSTRUCTION}\n"));
        prompt.push_str(&format!("5. {REPORT_INSTRUCTION}\n\n"));
        prompt.push_str("**Your Response:**\nThinking:\n");
        prompt
    }

    fn header(&self) -> String {
        let mut prompt = String::new();
        prompt.push_str(&self.briefing);
        prompt.push_str("\n\n**Core Principles:**\n");
        prompt.push_str(CORE_PRINCIPLES);
        prompt.push_str(&format!("\n**User Context:**\n{}\n", self.subject_context));
        prompt.push_str(&format!("\n**Current Date:** {}\n", self.current_date));
        prompt.push_str(&format!("\n**Data Schemas:**\n{}\n", self.data_schemas));
        prompt.push_str(&format!("\n**Available Tools:**\n{}\n", self.tool_descriptions));
        prompt
    }
}

fn briefing(assistant: &AssistantConfig) -> String {
    match &assistant.briefing {
        Some(text) => text.clone(),
        None => format!(
            "You are {}, an assistant that helps a business owner understand their own sales, stock and \
             operations data. Give practical, personalised guidance in a friendly, conversational tone.",
            assistant.name
        ),
    }
}

/// Keeps the first `max_chars` characters of a tool result.
pub fn truncate_preview(text: &str, max_chars: usize) -> String {
    let mut iter = text.chars();
    let mut preview: String = iter.by_ref().take(max_chars).collect();
    if iter.next().is_some() {
        preview.push_str("...[truncated]");
    }
    preview
}

/// Lists every table the `loader` exposes with its columns.
pub fn data_schemas_prompt(data: &dyn DataAccess) -> String {
    let tables = data.tables();
    if tables.is_empty() {
        return "No data tables are loaded.".to_string();
    }

    let mut text = String::from("Tables available through `loader` inside `run_code` (rows are scoped to the current user):\n");
    for schema in tables {
        text.push_str(&format!("--- loader.get_{}() ---\n", schema.name));
        let mut columns: Vec<&str> = schema.columns.iter().map(String::as_str).take(MAX_SCHEMA_COLUMNS).collect();
        if schema.columns.len() > MAX_SCHEMA_COLUMNS {
            columns.push("...");
        }
        text.push_str(&format!("  Columns: {}\n", columns.join(", ")));
        if let Some(date_column) = &schema.date_column {
            text.push_str(&format!(
                "  Date column: {date_column} (start_date/end_date filter on it, end exclusive)\n"
            ));
        }
    }
    text
}

/// One-line description of the subject from the profile table, when present.
pub fn subject_context_prompt(data: &dyn DataAccess, config: &DataConfig, subject_id: &str) -> String {
    if data.schema(&config.profile_table).is_none() {
        return format!("User ID: {subject_id}.");
    }

    match data.query(&config.profile_table, subject_id, DateRange::unbounded()) {
        Ok(rows) => match rows.first() {
            Some(row) => {
                let details: Vec<String> = row
                    .iter()
                    .filter(|(key, _)| key.as_str() != config.subject_column)
                    .filter_map(|(key, value)| cell_text(value).map(|v| format!("{key}: {v}")))
                    .collect();
                format!("User ID: {subject_id}. {}", details.join(". "))
            }
            None => format!("User ID: {subject_id}. (Details not found)."),
        },
        Err(err) => {
            warn!("Failed to load profile for {}: {}", subject_id, err);
            format!("User ID: {subject_id}. (Error retrieving details: {err})")
        }
    }
}
