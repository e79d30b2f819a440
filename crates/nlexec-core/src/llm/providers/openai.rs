use crate::config::LlmConfig;
use crate::errors::ModelError;
use crate::llm::{CompletionParams, LanguageModel};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use std::collections::HashMap;

/// Client for the OpenAI chat completions API and compatible servers.
#[derive(Debug, Clone)]
pub struct OpenAIClient {
    client: Client,
    api_key: Option<String>,
    api_base: String,
    model: String,
    headers: HashMap<String, String>,
}

impl OpenAIClient {
    pub fn new(api_key: Option<String>, model: String) -> Self {
        Self {
            client: Client::new(),
            api_key,
            api_base: "https://api.openai.com/v1".to_string(),
            model,
            headers: HashMap::new(),
        }
    }

    pub fn with_api_base(mut self, api_base: String) -> Self {
        self.api_base = api_base.trim_end_matches('/').to_string();
        self
    }

    pub fn with_headers(mut self, headers: HashMap<String, String>) -> Self {
        self.headers = headers;
        self
    }

    fn build_request_body(&self, prompt: &str, params: &CompletionParams) -> Value {
        json!({
            "model": self.model,
            "messages": [
                { "role": "system", "content": params.system_prompt },
                { "role": "user", "content": prompt },
            ],
            "temperature": params.temperature,
            "max_tokens": params.max_tokens,
        })
    }

    fn parse_response(&self, response: &Value) -> Result<String, ModelError> {
        let choices = response["choices"]
            .as_array()
            .ok_or_else(|| ModelError::InvalidResponse("No choices in response".to_string()))?;
        let choice = choices
            .first()
            .ok_or_else(|| ModelError::InvalidResponse("Empty choices array".to_string()))?;
        choice["message"]["content"]
            .as_str()
            .map(|s| s.to_string())
            .ok_or_else(|| ModelError::InvalidResponse("Response has no message content".to_string()))
    }
}

#[async_trait]
impl LanguageModel for OpenAIClient {
    fn model_id(&self) -> &str {
        &self.model
    }

    async fn complete(&self, prompt: &str, params: &CompletionParams) -> Result<String, ModelError> {
        let url = format!("{}/chat/completions", self.api_base);
        let body = self.build_request_body(prompt, params);
        log::debug!("OpenAI-compatible request to {} (model {})", url, self.model);

        let mut request = self
            .client
            .post(&url)
            .header("Content-Type", "application/json")
            .timeout(params.timeout)
            .json(&body);
        if let Some(api_key) = &self.api_key {
            request = request.header("Authorization", format!("Bearer {}", api_key));
        }
        for (name, value) in &self.headers {
            request = request.header(name.as_str(), value.as_str());
        }

        let response = request.send().await.map_err(|e| self.transport_error(e, params))?;
        let status = response.status();
        let response_text = response
            .text()
            .await
            .map_err(|e| self.transport_error(e, params))?;
        log::debug!("OpenAI-compatible response ({}): {} bytes", status, response_text.len());

        if !status.is_success() {
            let message = format!("API request failed with status {}: {}", status, response_text);
            return Err(if status.is_server_error() || status.as_u16() == 429 || status.as_u16() == 404 {
                ModelError::Unavailable {
                    model: self.model.clone(),
                    message,
                }
            } else {
                ModelError::InvalidResponse(message)
            });
        }

        let response_json: Value = serde_json::from_str(&response_text)
            .map_err(|e| ModelError::InvalidResponse(format!("Invalid JSON response: {}", e)))?;
        self.parse_response(&response_json)
    }
}

impl OpenAIClient {
    fn transport_error(&self, err: reqwest::Error, params: &CompletionParams) -> ModelError {
        if err.is_timeout() {
            ModelError::Timeout {
                model: self.model.clone(),
                seconds: params.timeout.as_secs(),
            }
        } else {
            ModelError::Unavailable {
                model: self.model.clone(),
                message: err.to_string(),
            }
        }
    }
}

pub fn create_client(config: &LlmConfig, model: &str) -> OpenAIClient {
    let mut client = OpenAIClient::new(config.auth.api_key.clone(), model.to_string())
        .with_headers(config.auth.headers.clone());
    if let Some(base_url) = &config.base_url {
        client = client.with_api_base(base_url.clone());
    }
    client
}

pub fn create_custom_client(config: &LlmConfig, base_url: &str, model: &str) -> OpenAIClient {
    create_client(config, model).with_api_base(base_url.to_string())
}
