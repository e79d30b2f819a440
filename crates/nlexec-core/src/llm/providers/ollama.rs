use crate::config::LlmConfig;
use crate::errors::ModelError;
use crate::llm::{CompletionParams, LanguageModel};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};

pub const DEFAULT_OLLAMA_URL: &str = "http://localhost:11434";

/// Client for a local Ollama server's non-streaming generate endpoint.
#[derive(Debug, Clone)]
pub struct OllamaClient {
    client: Client,
    base_url: String,
    model: String,
}

impl OllamaClient {
    pub fn new(model: String) -> Self {
        Self {
            client: Client::new(),
            base_url: DEFAULT_OLLAMA_URL.to_string(),
            model,
        }
    }

    pub fn with_base_url(mut self, base_url: String) -> Self {
        self.base_url = base_url.trim_end_matches('/').to_string();
        self
    }

    fn build_request_body(&self, prompt: &str, params: &CompletionParams) -> Value {
        json!({
            "model": self.model,
            "prompt": prompt,
            "system": params.system_prompt,
            "stream": false,
            "options": {
                "temperature": params.temperature,
                "num_predict": params.max_tokens,
            },
        })
    }
}

#[async_trait]
impl LanguageModel for OllamaClient {
    fn model_id(&self) -> &str {
        &self.model
    }

    async fn complete(&self, prompt: &str, params: &CompletionParams) -> Result<String, ModelError> {
        let url = format!("{}/api/generate", self.base_url);
        log::debug!("Ollama request to {} (model {})", url, self.model);

        let unavailable = |e: reqwest::Error| {
            if e.is_timeout() {
                ModelError::Timeout {
                    model: self.model.clone(),
                    seconds: params.timeout.as_secs(),
                }
            } else {
                ModelError::Unavailable {
                    model: self.model.clone(),
                    message: e.to_string(),
                }
            }
        };

        let response = self
            .client
            .post(&url)
            .timeout(params.timeout)
            .json(&self.build_request_body(prompt, params))
            .send()
            .await
            .map_err(unavailable)?;
        let status = response.status();
        let response_text = response.text().await.map_err(unavailable)?;

        if !status.is_success() {
            // Ollama answers 404 for models that are not pulled.
            return Err(ModelError::Unavailable {
                model: self.model.clone(),
                message: format!("status {}: {}", status, response_text),
            });
        }

        let response_json: Value = serde_json::from_str(&response_text)
            .map_err(|e| ModelError::InvalidResponse(format!("Invalid JSON response: {}", e)))?;
        response_json["response"]
            .as_str()
            .map(|s| s.to_string())
            .ok_or_else(|| ModelError::InvalidResponse("Response has no 'response' field".to_string()))
    }
}

pub fn create_client(config: &LlmConfig, model: &str) -> OllamaClient {
    let client = OllamaClient::new(model.to_string());
    match &config.base_url {
        Some(base_url) => client.with_base_url(base_url.clone()),
        None => client,
    }
}
