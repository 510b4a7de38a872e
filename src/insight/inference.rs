use super::collaborators::TextGenerator;
use super::error::{EngineError, Result};
use super::inference_templates::{get_template, InferenceTemplate};
use crate::shared::config::InferenceConfig;
use async_trait::async_trait;
use reqwest::Client;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

#[derive(Debug, Clone)]
pub struct ModelResponse {
    pub content: String,
    pub total_tokens: Option<i64>,
    pub prompt_tokens: Option<i64>,
    pub completion_tokens: Option<i64>,
}

/// HTTP text-generation client. One request per call, no retries: a failed
/// round trip ends the conversation.
#[derive(Clone)]
pub struct InferenceClient {
    client: Client,
    url: String,
    model: String,
    auth_header: Option<(&'static str, String)>,
    template: Arc<dyn InferenceTemplate>,
    log_seq: Arc<AtomicU64>,
}

impl InferenceClient {
    pub fn new(config: &InferenceConfig) -> Result<Self> {
        let mut builder = Client::builder();
        if let Some(secs) = config.timeout_secs {
            builder = builder.timeout(std::time::Duration::from_secs(secs));
        }
        let client = builder
            .build()
            .map_err(|e| EngineError::Service(format!("Failed to create inference client: {}", e)))?;

        let template: Arc<dyn InferenceTemplate> = Arc::from(get_template(config.template));
        let auth_header = config
            .api_key
            .as_deref()
            .filter(|key| !key.trim().is_empty())
            .map(|key| template.auth_header(key));

        Ok(Self {
            client,
            url: template.endpoint(&config.url, &config.model),
            model: config.model.clone(),
            auth_header,
            template,
            log_seq: Arc::new(AtomicU64::new(0)),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.url
    }

    pub async fn complete(&self, prompt: &str) -> Result<ModelResponse> {
        let req_value = self.template.build_request(prompt, &self.model).await?;

        let log_id = self.log_seq.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(
            "Inference request #{} to {} ({} prompt chars)",
            log_id,
            self.url,
            prompt.chars().count()
        );

        let mut request_builder = self.client.post(&self.url).json(&req_value);
        if let Some((name, value)) = &self.auth_header {
            request_builder = request_builder.header(*name, value);
        }

        let resp = request_builder.send().await.map_err(EngineError::Request)?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp
                .text()
                .await
                .unwrap_or_else(|_| "<failed to read response>".to_string());
            return Err(EngineError::Service(format!(
                "Inference service error ({}): {}",
                status, text
            )));
        }

        let response_text = resp
            .text()
            .await
            .map_err(|e| EngineError::Service(format!("Failed to read response text: {}", e)))?;

        let response = self.template.parse_response(&response_text).await?;
        info!(
            "Inference response #{}: {} chars, tokens={}",
            log_id,
            response.content.chars().count(),
            response
                .total_tokens
                .map(|t| t.to_string())
                .unwrap_or_else(|| "?".to_string())
        );
        Ok(response)
    }
}

#[async_trait]
impl TextGenerator for InferenceClient {
    async fn generate(&self, prompt: &str) -> Result<String> {
        self.complete(prompt).await.map(|response| response.content)
    }
}
