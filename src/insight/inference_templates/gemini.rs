use super::super::error::{EngineError, Result};
use super::super::inference::ModelResponse;
use super::InferenceTemplate;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

const MODEL_PLACEHOLDER: &str = "{model}";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    prompt_feedback: Option<PromptFeedback>,
    usage_metadata: Option<UsageMetadata>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    content: Option<Content>,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Content {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Deserialize)]
struct Part {
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PromptFeedback {
    block_reason: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct UsageMetadata {
    prompt_token_count: Option<i64>,
    candidates_token_count: Option<i64>,
    total_token_count: Option<i64>,
}

/// Gemini `generateContent`. The configured URL may contain `{model}`;
/// otherwise the standard `models/<model>:generateContent` path is appended.
pub struct GeminiTemplate {}

impl GeminiTemplate {
    pub fn new() -> Self {
        Self {}
    }
}

#[async_trait]
impl InferenceTemplate for GeminiTemplate {
    fn endpoint(&self, base_url: &str, model_name: &str) -> String {
        if base_url.contains(MODEL_PLACEHOLDER) {
            base_url.replace(MODEL_PLACEHOLDER, model_name)
        } else if base_url.ends_with(":generateContent") {
            base_url.to_string()
        } else {
            format!("{}/models/{}:generateContent", base_url.trim_end_matches('/'), model_name)
        }
    }

    fn auth_header(&self, api_key: &str) -> (&'static str, String) {
        ("x-goog-api-key", api_key.trim().to_string())
    }

    async fn build_request(&self, prompt: &str, _model_name: &str) -> Result<serde_json::Value> {
        if prompt.trim().is_empty() {
            return Err(EngineError::Service("No prompt provided".to_string()));
        }
        Ok(json!({
            "contents": [{ "role": "user", "parts": [{ "text": prompt }] }]
        }))
    }

    async fn parse_response(&self, response_text: &str) -> Result<ModelResponse> {
        let parsed: GenerateResponse = serde_json::from_str(response_text)
            .map_err(|e| EngineError::Service(format!("Failed to parse response: {}", e)))?;

        if let Some(reason) = parsed.prompt_feedback.and_then(|f| f.block_reason) {
            return Err(EngineError::Service(format!("Prompt was blocked: {}", reason)));
        }

        let candidate = parsed
            .candidates
            .into_iter()
            .next()
            .ok_or_else(|| EngineError::Service("Inference response missing candidates".into()))?;

        let text: String = candidate
            .content
            .map(|content| content.parts.into_iter().filter_map(|p| p.text).collect())
            .unwrap_or_default();
        if text.trim().is_empty() {
            return Err(EngineError::Service(format!(
                "Inference response was empty (finish reason: {})",
                candidate.finish_reason.as_deref().unwrap_or("unknown")
            )));
        }

        let usage = parsed.usage_metadata.unwrap_or_default();
        Ok(ModelResponse {
            content: text.trim().to_string(),
            total_tokens: usage.total_token_count,
            prompt_tokens: usage.prompt_token_count,
            completion_tokens: usage.candidates_token_count,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_fills_model() {
        let template = GeminiTemplate::new();
        assert_eq!(
            template.endpoint("https://host/v1beta/", "gemini-2.0-flash"),
            "https://host/v1beta/models/gemini-2.0-flash:generateContent"
        );
        assert_eq!(
            template.endpoint("https://host/v1beta/models/{model}:generateContent", "g"),
            "https://host/v1beta/models/g:generateContent"
        );
    }

    #[tokio::test]
    async fn joins_candidate_parts() {
        let body = r#"{"candidates":[{"content":{"parts":[{"text":"Thinking: a\n"},{"text":"ANSWER: b"}]},"finishReason":"STOP"}],"usageMetadata":{"totalTokenCount":9}}"#;
        let response = GeminiTemplate::new().parse_response(body).await.unwrap();
        assert_eq!(response.content, "Thinking: a\nANSWER: b");
        assert_eq!(response.total_tokens, Some(9));
    }

    #[tokio::test]
    async fn blocked_or_empty_candidates_fail() {
        let template = GeminiTemplate::new();
        let err = template
            .parse_response(r#"{"candidates":[],"promptFeedback":{"blockReason":"SAFETY"}}"#)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("SAFETY"));

        let err = template
            .parse_response(r#"{"candidates":[{"content":{"parts":[]},"finishReason":"SAFETY"}]}"#)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("empty"));
    }
}
