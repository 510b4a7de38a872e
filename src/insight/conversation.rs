//! The bounded question-answering loop.
//!
//! Each turn sends a prompt to the text generator, parses the reply and
//! either finishes (answer, answer with chart, ambiguous reply) or runs the
//! requested tool and feeds its output into the next prompt. Text generation
//! faults and running out of turns are the only fatal outcomes.

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use super::collaborators::TextGenerator;
use super::command::split_call;
use super::error::EngineError;
use super::prompts::{data_schemas_prompt, subject_context_prompt, PromptBuilder};
use super::response::{parse_model_output, NO_THINKING};
use super::toolkit::{ToolCatalog, ToolKind};
use crate::shared::config::{AssistantConfig, ConversationConfig, DataConfig, InsightConfig};
use crate::shared::models::{ConversationRequest, FinalResponse, Termination, TurnRecord};

/// Upper bound on prompt -> model -> action round trips per question.
pub const MAX_TURNS: usize = 10;

const PREVIEW_CHARS: usize = 200;

/// Everything that happened while answering one question.
#[derive(Debug, Clone, Serialize)]
pub struct ConversationTranscript {
    pub request_id: Uuid,
    pub request: ConversationRequest,
    pub turns: Vec<TurnRecord>,
    pub termination: Termination,
    pub response: FinalResponse,
}

pub struct ConversationDriver {
    generator: Arc<dyn TextGenerator>,
    catalog: Arc<ToolCatalog>,
    assistant: AssistantConfig,
    data_config: DataConfig,
    settings: ConversationConfig,
}

impl ConversationDriver {
    pub fn new(generator: Arc<dyn TextGenerator>, catalog: Arc<ToolCatalog>) -> Self {
        Self {
            generator,
            catalog,
            assistant: AssistantConfig::default(),
            data_config: DataConfig::default(),
            settings: ConversationConfig::default(),
        }
    }

    pub fn from_config(
        generator: Arc<dyn TextGenerator>,
        catalog: Arc<ToolCatalog>,
        config: &InsightConfig,
    ) -> Self {
        Self {
            generator,
            catalog,
            assistant: config.assistant.clone(),
            data_config: config.data.clone(),
            settings: config.conversation.clone(),
        }
    }

    pub async fn process_question(&self, subject_id: &str, question_text: &str) -> FinalResponse {
        self.run_conversation(ConversationRequest::new(subject_id, question_text))
            .await
            .response
    }

    pub async fn run_conversation(&self, request: ConversationRequest) -> ConversationTranscript {
        let request_id = Uuid::new_v4();
        let span = info_span!(
            "conversation",
            request_id = %request_id,
            subject_id = %request.subject_id
        );
        let (turns, termination, response) = self.drive(&request).instrument(span).await;
        ConversationTranscript {
            request_id,
            request,
            turns,
            termination,
            response,
        }
    }

    async fn drive(&self, request: &ConversationRequest) -> (Vec<TurnRecord>, Termination, FinalResponse) {
        let subject_id = request.subject_id.as_str();
        let question = request.question_text.as_str();
        let prompts = self.prompt_builder(subject_id);

        let mut turns: Vec<TurnRecord> = Vec::new();
        let mut last_thinking = String::from(NO_THINKING);
        let mut pending_result: Option<String> = None;

        info!("Processing question: {}", preview(question));

        for index in 0..self.settings.max_turns {
            let prompt = match &pending_result {
                None => prompts.initial(question),
                Some(result) => prompts.intermediate(question, &last_thinking, result),
            };
            info!("Turn {}/{}", index + 1, self.settings.max_turns);

            let raw = match self.generator.generate(&prompt).await {
                Ok(raw) => raw,
                Err(err) => {
                    error!("Text generation failed on turn {}: {}", index + 1, err);
                    let response = service_failure(&err, &turns);
                    return (turns, Termination::ServiceFailure, response);
                }
            };
            debug!("Model output: {}", preview(&raw));

            let parsed = parse_model_output(&raw);
            last_thinking = parsed.thinking_text.clone();
            let mut turn = TurnRecord {
                index,
                prompt_sent: prompt,
                raw_model_output: raw,
                thinking_text: parsed.thinking_text,
                tool_call: None,
                tool_result: None,
                final_answer: None,
            };

            match (parsed.answer_text, parsed.tool_call_text) {
                (Some(answer), Some(call)) => {
                    let (termination, response) = self.answer_with_call(subject_id, answer, &call, &mut turn).await;
                    turn.final_answer = Some(response.answer_text.clone());
                    turns.push(turn);
                    return (turns, termination, response);
                }
                (Some(answer), None) => {
                    info!("Answer produced on turn {}", index + 1);
                    turn.final_answer = Some(answer.clone());
                    turns.push(turn);
                    return (turns, Termination::Answered, FinalResponse::text(answer));
                }
                (None, Some(call)) => {
                    let invocation = self.catalog.dispatch(subject_id, &call).await;
                    if !invocation.result.succeeded {
                        warn!("Tool call failed on turn {}; feeding error back", index + 1);
                    }
                    pending_result = Some(invocation.result.output_text.clone());
                    turn.tool_call = invocation.request;
                    turn.tool_result = Some(invocation.result);
                    turns.push(turn);
                }
                (None, None) => {
                    warn!("Reply on turn {} had neither a tool call nor an answer", index + 1);
                    let answer = format!(
                        "Thinking: {}\n(Couldn't determine the next step. Please try rephrasing your question.)",
                        turn.thinking_text
                    );
                    turn.final_answer = Some(answer.clone());
                    turns.push(turn);
                    return (turns, Termination::Ambiguous, FinalResponse::text(answer));
                }
            }
        }

        error!("Gave up after {} turns", self.settings.max_turns);
        let response = FinalResponse::text(format!(
            "Sorry, I got stuck processing that. Last thought: {last_thinking}"
        ));
        (turns, Termination::TurnLimit, response)
    }

    /// An answer arrived together with a tool call. Only `display_chart` is
    /// honoured here; any other call is dropped and the answer stands alone.
    async fn answer_with_call(
        &self,
        subject_id: &str,
        answer: String,
        call: &str,
        turn: &mut TurnRecord,
    ) -> (Termination, FinalResponse) {
        let is_chart = split_call(call)
            .map(|request| request.function_name.eq_ignore_ascii_case(ToolKind::DisplayChart.name()))
            .unwrap_or(false);
        if !is_chart {
            info!("Ignoring non-chart tool call that accompanied an answer");
            return (Termination::Answered, FinalResponse::text(answer));
        }

        let invocation = self.catalog.dispatch(subject_id, call).await;
        turn.tool_call = invocation.request;
        let result = invocation.result;
        let response = match &result.chart_command {
            Some(command) if result.succeeded => {
                info!("Chart command validated ({})", command.chart_type().as_str());
                (Termination::Charted, FinalResponse::with_chart(answer, command.clone()))
            }
            _ => {
                warn!("Chart request rejected: {}", failure_message(&result.output_text));
                let text = format!(
                    "{answer}\n\n[Chart display failed: {}]",
                    failure_message(&result.output_text)
                );
                (Termination::Answered, FinalResponse::text(text))
            }
        };
        turn.tool_result = Some(result);
        response
    }

    fn prompt_builder(&self, subject_id: &str) -> PromptBuilder {
        let data = self.catalog.data();
        PromptBuilder::new(
            &self.assistant,
            subject_context_prompt(data.as_ref(), &self.data_config, subject_id),
            data_schemas_prompt(data.as_ref()),
            self.catalog.command_catalog_prompt(),
            self.settings.result_preview_chars,
        )
    }
}

fn service_failure(err: &EngineError, turns: &[TurnRecord]) -> FinalResponse {
    let mut text = format!("Sorry, error reaching AI service: {err}");
    if let Some(turn) = turns.last() {
        text.push_str(&format!("\nLast thought: {}", turn.thinking_text));
    }
    FinalResponse::text(text)
}

/// Message section of a failure payload, or the whole payload when it has none.
fn failure_message(output: &str) -> &str {
    output
        .rsplit_once("--- Error Message ---\n")
        .map(|(_, message)| message.trim())
        .unwrap_or(output.trim())
}

fn preview(text: &str) -> String {
    let mut out: String = text.chars().take(PREVIEW_CHARS).collect();
    if text.chars().count() > PREVIEW_CHARS {
        out.push_str("...");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::insight::error::Result;
    use crate::insight::toolkit::tests::test_catalog;
    use crate::shared::models::{ChartType, ErrorKind, FAILURE_MARKER};
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Replays canned replies in order, repeating the last one once the
    /// script runs out.
    struct ScriptedModel {
        replies: Mutex<VecDeque<Result<String>>>,
        last: Mutex<Option<String>>,
        prompts: Mutex<Vec<String>>,
    }

    impl ScriptedModel {
        fn new(replies: Vec<Result<String>>) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies.into()),
                last: Mutex::new(None),
                prompts: Mutex::new(Vec::new()),
            })
        }

        fn replying(replies: &[&str]) -> Arc<Self> {
            Self::new(replies.iter().map(|r| Ok(r.to_string())).collect())
        }

        fn calls(&self) -> usize {
            self.prompts.lock().unwrap().len()
        }

        fn prompt(&self, index: usize) -> String {
            self.prompts.lock().unwrap()[index].clone()
        }
    }

    #[async_trait]
    impl TextGenerator for ScriptedModel {
        async fn generate(&self, prompt: &str) -> Result<String> {
            self.prompts.lock().unwrap().push(prompt.to_string());
            match self.replies.lock().unwrap().pop_front() {
                Some(Ok(text)) => {
                    *self.last.lock().unwrap() = Some(text.clone());
                    Ok(text)
                }
                Some(Err(err)) => Err(err),
                None => Ok(self.last.lock().unwrap().clone().unwrap_or_default()),
            }
        }
    }

    fn driver(model: Arc<ScriptedModel>) -> ConversationDriver {
        ConversationDriver::new(model, Arc::new(test_catalog()))
    }

    #[tokio::test]
    async fn answer_only_finishes_after_one_turn() {
        let model = ScriptedModel::replying(&["ANSWER: Your sales were $120."]);
        let transcript = driver(model.clone())
            .run_conversation(ConversationRequest::new("m1", "How were sales?"))
            .await;

        assert_eq!(transcript.response, FinalResponse::text("Your sales were $120."));
        assert_eq!(transcript.termination, Termination::Answered);
        assert_eq!(transcript.turns.len(), 1);
        assert_eq!(model.calls(), 1);
    }

    #[tokio::test]
    async fn answer_with_chart_returns_chart_command() {
        let model = ScriptedModel::replying(&[
            "Thinking: show it\nANSWER: Here is the trend\nCALL_FUNCTION: display_chart(chart_type='bar', chart_data='{\"labels\":[\"Mon\"],\"data\":[5]}')",
        ]);
        let transcript = driver(model)
            .run_conversation(ConversationRequest::new("m1", "Chart my week"))
            .await;

        assert_eq!(transcript.termination, Termination::Charted);
        assert_eq!(transcript.response.answer_text, "Here is the trend");
        let chart = transcript.response.chart_command.expect("chart command");
        assert_eq!(chart.chart_type(), ChartType::Bar);
    }

    #[tokio::test]
    async fn prose_between_chart_call_and_answer_still_charts() {
        let model = ScriptedModel::replying(&[
            "CALL_FUNCTION: display_chart(chart_type='line', chart_data='{\"labels\":[\"Mon\"],\"data\":[5]}')\nThat's the chart.\nANSWER: Here is the trend",
        ]);
        let transcript = driver(model.clone())
            .run_conversation(ConversationRequest::new("m1", "Chart my week"))
            .await;

        assert_eq!(transcript.termination, Termination::Charted);
        assert_eq!(transcript.response.answer_text, "Here is the trend");
        assert_eq!(model.calls(), 1);
    }

    #[tokio::test]
    async fn invalid_chart_appends_failure_note() {
        let model = ScriptedModel::replying(&[
            "ANSWER: Here is the trend\nCALL_FUNCTION: display_chart(chart_type='bar', chart_data='{\"data\":[5]}')",
        ]);
        let response = driver(model).process_question("m1", "Chart my week").await;

        assert!(response.chart_command.is_none());
        assert!(response.answer_text.starts_with("Here is the trend\n\n[Chart display failed: "));
        assert!(!response.answer_text.contains(FAILURE_MARKER));
    }

    #[tokio::test]
    async fn answer_with_other_tool_keeps_answer_only() {
        let model = ScriptedModel::replying(&[
            "ANSWER: Done.\nCALL_FUNCTION: run_code(code_string='print(1)')",
        ]);
        let transcript = driver(model)
            .run_conversation(ConversationRequest::new("m1", "q"))
            .await;

        assert_eq!(transcript.response, FinalResponse::text("Done."));
        assert!(transcript.turns[0].tool_result.is_none());
    }

    #[tokio::test]
    async fn tool_result_feeds_next_turn() {
        let model = ScriptedModel::replying(&[
            "Thinking: compute total\nCALL_FUNCTION: run_code(code_string='print(40+2)')",
            "Thinking: got it\nANSWER: The total is 42.",
        ]);
        let transcript = driver(model.clone())
            .run_conversation(ConversationRequest::new("m1", "What is the total?"))
            .await;

        assert_eq!(transcript.response.answer_text, "The total is 42.");
        assert_eq!(transcript.turns.len(), 2);
        let second_prompt = model.prompt(1);
        assert!(second_prompt.contains("Previous Thinking: compute total"));
        assert!(second_prompt.contains("--- stdout ---\n42"));
        let first = &transcript.turns[0];
        assert_eq!(first.tool_call.as_ref().map(|c| c.function_name.as_str()), Some("run_code"));
        assert!(first.tool_result.as_ref().is_some_and(|r| r.succeeded));
    }

    #[tokio::test]
    async fn format_error_is_fed_back_instead_of_terminating() {
        let model = ScriptedModel::replying(&[
            "CALL_FUNCTION: run_code(code_string='print(1)'",
            "ANSWER: Recovered.",
        ]);
        let transcript = driver(model.clone())
            .run_conversation(ConversationRequest::new("m1", "q"))
            .await;

        let failed = transcript.turns[0].tool_result.as_ref().expect("tool result");
        assert_eq!(failed.error_kind, Some(ErrorKind::FormatError));
        assert!(model.prompt(1).contains(FAILURE_MARKER));
        assert_eq!(transcript.response.answer_text, "Recovered.");
    }

    #[tokio::test]
    async fn failing_code_every_turn_stops_at_turn_limit() {
        let model = ScriptedModel::replying(&[
            "Thinking: try dividing\nCALL_FUNCTION: run_code(code_string='print(1/0)')",
        ]);
        let transcript = driver(model.clone())
            .run_conversation(ConversationRequest::new("m1", "q"))
            .await;

        assert_eq!(transcript.termination, Termination::TurnLimit);
        assert_eq!(transcript.turns.len(), MAX_TURNS);
        assert_eq!(model.calls(), MAX_TURNS);
        assert!(transcript
            .turns
            .iter()
            .all(|t| t.tool_result.as_ref().is_some_and(|r| !r.succeeded)));
        assert_eq!(
            transcript.response.answer_text,
            "Sorry, I got stuck processing that. Last thought: try dividing"
        );
    }

    #[tokio::test]
    async fn stuck_message_is_returned_once_after_ten_failures() {
        let model = ScriptedModel::replying(&["Thinking: again\nCALL_FUNCTION: launch_rocket()"]);
        let transcript = driver(model.clone())
            .run_conversation(ConversationRequest::new("m1", "q"))
            .await;

        assert_eq!(model.calls(), 10);
        assert_eq!(transcript.turns.len(), 10);
        assert!(transcript.turns.iter().all(|t| t.final_answer.is_none()));
        assert_eq!(transcript.response.answer_text.matches("got stuck").count(), 1);
    }

    #[tokio::test]
    async fn reply_without_markers_is_ambiguous() {
        let model = ScriptedModel::replying(&["Thinking: not sure what to do"]);
        let transcript = driver(model)
            .run_conversation(ConversationRequest::new("m1", "q"))
            .await;

        assert_eq!(transcript.termination, Termination::Ambiguous);
        assert!(transcript.response.answer_text.starts_with("Thinking: not sure what to do\n"));
        assert!(transcript.response.answer_text.contains("Couldn't determine"));
    }

    #[tokio::test]
    async fn service_fault_is_fatal_and_carries_last_thought() {
        let model = ScriptedModel::new(vec![
            Ok("Thinking: look first\nCALL_FUNCTION: check_for_anomalies()".to_string()),
            Err(EngineError::Service("connection refused".to_string())),
        ]);
        let transcript = driver(model.clone())
            .run_conversation(ConversationRequest::new("m1", "q"))
            .await;

        assert_eq!(transcript.termination, Termination::ServiceFailure);
        assert_eq!(model.calls(), 2);
        let text = &transcript.response.answer_text;
        assert!(text.starts_with("Sorry, error reaching AI service: connection refused"));
        assert!(text.contains("Last thought: look first"));
    }

    #[test]
    fn failure_message_extracts_message_section() {
        let block = crate::insight::error::failure_block("ParameterError", "labels missing");
        assert_eq!(failure_message(&block), "labels missing");
        assert_eq!(failure_message("plain"), "plain");
    }
}
