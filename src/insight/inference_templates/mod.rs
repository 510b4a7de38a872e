pub mod gemini;
pub mod openai;

use super::error::Result;
use super::inference::ModelResponse;
use crate::shared::config::TemplateKind;
use async_trait::async_trait;

#[async_trait]
pub trait InferenceTemplate: Send + Sync {
    /// Endpoint for one completion against `model_name`.
    fn endpoint(&self, base_url: &str, model_name: &str) -> String;

    /// Header carrying the API key.
    fn auth_header(&self, api_key: &str) -> (&'static str, String);

    /// Build the request payload for the inference API
    async fn build_request(&self, prompt: &str, model_name: &str) -> Result<serde_json::Value>;

    /// Parse the response from the inference API
    async fn parse_response(&self, response_text: &str) -> Result<ModelResponse>;
}

pub fn get_template(kind: TemplateKind) -> Box<dyn InferenceTemplate> {
    match kind {
        TemplateKind::Openai => Box::new(openai::OpenAiTemplate::new()),
        TemplateKind::Gemini => Box::new(gemini::GeminiTemplate::new()),
    }
}
