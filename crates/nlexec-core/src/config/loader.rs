//! Configuration loader for YAML files and environment resolution

use crate::config::types::*;
use crate::errors::PipelineError;
use std::env;
use std::path::Path;
use tokio::fs;

pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration from a YAML file
    pub async fn from_file<P: AsRef<Path>>(path: P) -> Result<NlexecConfig, PipelineError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).await.map_err(|e| {
            PipelineError::ConfigError(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;
        Self::from_str(&content)
    }

    /// Load configuration from a YAML string
    pub fn from_str(content: &str) -> Result<NlexecConfig, PipelineError> {
        let mut config: NlexecConfig = if content.trim().is_empty() {
            NlexecConfig::default()
        } else {
            serde_yaml::from_str(content).map_err(|e| {
                PipelineError::ConfigError(format!("Failed to parse YAML config: {}", e))
            })?
        };
        Self::resolve_llm_auth(&mut config.llm);
        config.validate()?;
        Ok(config)
    }

    /// Defaults used when no configuration file is given.
    pub fn defaults() -> Result<NlexecConfig, PipelineError> {
        Self::from_str("")
    }

    fn resolve_llm_auth(llm: &mut LlmConfig) {
        if let Some(env_var) = &llm.auth.api_key_env {
            match env::var(env_var) {
                Ok(api_key) => llm.auth.api_key = Some(api_key),
                Err(_) => log::warn!("API key variable {} is not set", env_var),
            }
        }
        if llm.auth.api_key.is_none()
            && llm.auth.api_key_env.is_none()
            && llm.provider != LlmProvider::Ollama
        {
            if let Ok(api_key) = env::var("OPENAI_API_KEY") {
                llm.auth.api_key = Some(api_key);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_types::SandboxBackend;
    use crate::deps::Lookup;
    use serial_test::serial;
    use std::io::Write;
    use std::time::Duration;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = ConfigLoader::from_str("").unwrap();
        assert_eq!(config.llm.provider, LlmProvider::OpenAI);
        assert_eq!(config.llm.effective_model(), "gpt-4.1-mini");
        assert_eq!(config.llm.timeout_seconds, 60);
        assert_eq!(config.sandbox.backend, SandboxBackend::Docker);
        assert_eq!(config.sandbox.image, "python:3.11-slim");
        assert_eq!(config.sandbox.limits().wall_clock_timeout, Duration::from_secs(10));
        assert_eq!(config.sandbox.memory_mb, 256);
        assert!(!config.sandbox.allow_network);
        assert_eq!(config.pipeline.max_repair_attempts, 1);
        assert!(config.pipeline.static_repair);
    }

    #[test]
    fn test_full_config_parses() {
        let yaml = r#"
llm:
  provider: ollama
  model: qwen2.5-coder
  fallback_models: [llama3.1]
  temperature: 0.0
  timeout_seconds: 30
sandbox:
  backend: process
  cpu: 0.5
  memory_mb: 128
  timeout_seconds: 3
pipeline:
  max_repair_attempts: 2
  static_repair: false
  history_file: /tmp/nlexec-history.jsonl
imports:
  entries:
    sqrt: "from math import sqrt"
  ambiguous: [random]
"#;
        let config = ConfigLoader::from_str(yaml).unwrap();
        assert_eq!(config.llm.provider, LlmProvider::Ollama);
        assert_eq!(config.llm.fallback_models, vec!["llama3.1".to_string()]);
        assert_eq!(config.sandbox.backend, SandboxBackend::Process);
        assert_eq!(config.pipeline.max_repair_attempts, 2);
        assert!(!config.pipeline.static_repair);

        let table = config.imports.build_table();
        assert!(matches!(table.lookup("sqrt"), Lookup::Resolved(_)));
        assert!(matches!(table.lookup("random"), Lookup::Ambiguous(_)));
    }

    #[test]
    fn test_custom_provider() {
        let yaml = "llm:\n  provider:\n    custom:\n      base_url: http://localhost:8000/v1\n";
        let config = ConfigLoader::from_str(yaml).unwrap();
        assert_eq!(
            config.llm.provider,
            LlmProvider::Custom {
                base_url: "http://localhost:8000/v1".to_string()
            }
        );
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        for yaml in [
            "sandbox:\n  timeout_seconds: 0\n",
            "sandbox:\n  cpu: 0\n",
            "sandbox:\n  memory_mb: 4\n",
            "imports:\n  entries:\n    foo: bar\n",
            "llm:\n  provider:\n    custom:\n      base_url: localhost\n",
        ] {
            let err = ConfigLoader::from_str(yaml).unwrap_err();
            assert!(matches!(err, PipelineError::ConfigError(_)), "{}", yaml);
        }
        assert!(ConfigLoader::from_str("llm: [").is_err());
    }

    #[test]
    #[serial]
    fn test_api_key_env_is_resolved() {
        std::env::set_var("NLEXEC_TEST_KEY", "sk-test");
        let config =
            ConfigLoader::from_str("llm:\n  auth:\n    api_key_env: NLEXEC_TEST_KEY\n").unwrap();
        assert_eq!(config.llm.auth.api_key.as_deref(), Some("sk-test"));
        std::env::remove_var("NLEXEC_TEST_KEY");
    }

    #[tokio::test]
    async fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "sandbox:\n  backend: process").unwrap();
        let config = ConfigLoader::from_file(file.path()).await.unwrap();
        assert_eq!(config.sandbox.backend, SandboxBackend::Process);

        let missing = ConfigLoader::from_file("/nonexistent/nlexec.yaml").await;
        assert!(matches!(missing, Err(PipelineError::ConfigError(_))));
    }
}
