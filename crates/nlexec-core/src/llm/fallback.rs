use crate::errors::{ModelError, PipelineError};
use crate::llm::{CompletionParams, LanguageModel};
use async_trait::async_trait;
use std::sync::Arc;

/// Tries each model in order; moves on only for unavailability or timeouts.
pub struct FallbackModel {
    models: Vec<Arc<dyn LanguageModel>>,
}

impl FallbackModel {
    pub fn new(models: Vec<Arc<dyn LanguageModel>>) -> Result<Self, PipelineError> {
        if models.is_empty() {
            return Err(PipelineError::ConfigError(
                "A model chain needs at least one model".to_string(),
            ));
        }
        Ok(Self { models })
    }

    pub fn model_ids(&self) -> Vec<&str> {
        self.models.iter().map(|m| m.model_id()).collect()
    }
}

#[async_trait]
impl LanguageModel for FallbackModel {
    fn model_id(&self) -> &str {
        self.models[0].model_id()
    }

    async fn complete(&self, prompt: &str, params: &CompletionParams) -> Result<String, ModelError> {
        let mut last_error = None;
        for (index, model) in self.models.iter().enumerate() {
            let attempt = tokio::time::timeout(params.timeout, model.complete(prompt, params)).await;
            let error = match attempt {
                Ok(Ok(text)) => {
                    if index > 0 {
                        log::info!("Alternate model '{}' answered", model.model_id());
                    }
                    return Ok(text);
                }
                Ok(Err(e)) => e,
                Err(_) => ModelError::Timeout {
                    model: model.model_id().to_string(),
                    seconds: params.timeout.as_secs(),
                },
            };
            if !error.is_retryable() {
                return Err(error);
            }
            log::warn!("Model '{}' failed: {}", model.model_id(), error);
            last_error = Some(error);
        }
        Err(last_error.unwrap_or_else(|| {
            ModelError::InvalidResponse("No model was attempted".to_string())
        }))
    }
}
