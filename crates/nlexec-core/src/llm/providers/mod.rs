//! Model provider implementations
//!
//! Each provider implements `LanguageModel` over its own HTTP protocol. The
//! factory builds one client per configured model identifier and chains them
//! so that an unavailable primary falls through to the alternates.

use crate::config::{LlmConfig, LlmProvider};
use crate::errors::PipelineError;
use crate::llm::{FallbackModel, LanguageModel};
use std::sync::Arc;

pub mod ollama;
pub mod openai;

fn create_single(config: &LlmConfig, model: &str) -> Arc<dyn LanguageModel> {
    match &config.provider {
        LlmProvider::OpenAI => Arc::new(openai::create_client(config, model)),
        LlmProvider::Ollama => Arc::new(ollama::create_client(config, model)),
        LlmProvider::Custom { base_url } => {
            Arc::new(openai::create_custom_client(config, base_url, model))
        }
    }
}

/// Builds the model chain for `config`; `model_override` replaces the primary.
pub fn create_model(
    config: &LlmConfig,
    model_override: Option<&str>,
) -> Result<Arc<dyn LanguageModel>, PipelineError> {
    let primary = model_override
        .filter(|m| !m.trim().is_empty())
        .unwrap_or_else(|| config.effective_model());
    if primary.trim().is_empty() {
        return Err(PipelineError::ConfigError("No model identifier configured".to_string()));
    }
    if config.provider == LlmProvider::OpenAI && config.auth.api_key.is_none() && config.base_url.is_none() {
        log::warn!("No API key configured for the OpenAI provider; requests will be rejected");
    }

    let mut chain = vec![create_single(config, primary)];
    for alternate in config.fallback_models.iter().filter(|m| m.as_str() != primary) {
        chain.push(create_single(config, alternate));
    }
    log::info!(
        "Using {:?} model '{}' with {} alternate(s)",
        config.provider,
        primary,
        chain.len() - 1
    );

    if chain.len() == 1 {
        Ok(chain.remove(0))
    } else {
        Ok(Arc::new(FallbackModel::new(chain)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_override_replaces_primary() {
        let config = LlmConfig {
            provider: LlmProvider::Ollama,
            model: "llama3.1".to_string(),
            fallback_models: vec!["qwen2.5-coder".to_string()],
            ..Default::default()
        };
        let model = create_model(&config, Some("codellama")).unwrap();
        assert_eq!(model.model_id(), "codellama");

        let model = create_model(&config, None).unwrap();
        assert_eq!(model.model_id(), "llama3.1");
    }

    #[test]
    fn test_default_model_per_provider() {
        let config = LlmConfig::default();
        assert_eq!(create_model(&config, None).unwrap().model_id(), "gpt-4.1-mini");
    }
}
