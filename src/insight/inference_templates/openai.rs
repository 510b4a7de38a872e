use super::super::error::{EngineError, Result};
use super::super::inference::ModelResponse;
use super::InferenceTemplate;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize)]
struct ChatRequestMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatRequestMessage<'a>>,
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct Usage {
    prompt_tokens: Option<i64>,
    completion_tokens: Option<i64>,
    total_tokens: Option<i64>,
}

/// OpenAI-compatible `chat/completions`. The prompt goes out as one user
/// message.
pub struct OpenAiTemplate {}

impl OpenAiTemplate {
    pub fn new() -> Self {
        Self {}
    }
}

#[async_trait]
impl InferenceTemplate for OpenAiTemplate {
    fn endpoint(&self, base_url: &str, _model_name: &str) -> String {
        base_url.trim_end_matches('/').to_string()
    }

    fn auth_header(&self, api_key: &str) -> (&'static str, String) {
        ("Authorization", format!("Bearer {}", api_key.trim()))
    }

    async fn build_request(&self, prompt: &str, model_name: &str) -> Result<serde_json::Value> {
        if prompt.trim().is_empty() {
            return Err(EngineError::Service("No prompt provided".to_string()));
        }

        let req = ChatRequest {
            model: model_name,
            messages: vec![ChatRequestMessage {
                role: "user",
                content: prompt,
            }],
            stream: false,
        };

        serde_json::to_value(&req)
            .map_err(|e| EngineError::Service(format!("Failed to serialize request: {}", e)))
    }

    async fn parse_response(&self, response_text: &str) -> Result<ModelResponse> {
        let parsed: ChatResponse = serde_json::from_str(response_text)
            .map_err(|e| EngineError::Service(format!("Failed to parse response: {}", e)))?;

        let choice = parsed
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| EngineError::Service("Inference response missing choices".into()))?;

        let content = choice.message.content.unwrap_or_default();
        if content.trim().is_empty() {
            return Err(EngineError::Service(format!(
                "Inference response was empty (finish reason: {})",
                choice.finish_reason.as_deref().unwrap_or("unknown")
            )));
        }

        let usage = parsed.usage.unwrap_or_default();
        Ok(ModelResponse {
            content: content.trim().to_string(),
            total_tokens: usage.total_tokens,
            prompt_tokens: usage.prompt_tokens,
            completion_tokens: usage.completion_tokens,
        })
    }
}
