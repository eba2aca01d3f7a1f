use super::anthropic::AnthropicProvider;
use super::gemini::GeminiProvider;
use super::mock::MockProvider;
use super::ollama::OllamaProvider;
use super::openai::OpenAiProvider;
use super::traits::ChatProvider;
use crate::config::Config;
use crate::error::ConfigError;
use std::sync::Arc;

/// Default model per provider when the config names none.
fn default_model(provider: &str) -> &'static str {
    match provider {
        "anthropic" | "claude" => "claude-sonnet-4-5",
        "gemini" | "google" => "gemini-2.0-flash",
        "ollama" => "llama3.1",
        _ => "gpt-4o-mini",
    }
}

/// Build the configured provider. `mock` needs no credentials; every remote
/// provider requires a resolvable API key except Ollama.
pub fn create_provider(config: &Config) -> Result<Arc<dyn ChatProvider>, ConfigError> {
    let model = config
        .model
        .clone()
        .unwrap_or_else(|| default_model(&config.provider).to_string());
    let window = config.context_window;

    let provider: Arc<dyn ChatProvider> = match config.provider.as_str() {
        "mock" => Arc::new(MockProvider::new()),

        "ollama" => Arc::new(OllamaProvider::new(config.base_url.as_deref(), model, window)),

        "openai" => {
            let key = require_key(config)?;
            match config.base_url.as_deref() {
                Some(base) => Arc::new(OpenAiProvider::compatible("openai", base, key, model, window)),
                None => Arc::new(OpenAiProvider::new(key, model, window)),
            }
        }

        "azure-openai" | "azure" => {
            let key = require_key(config)?;
            let resource = config.base_url.as_deref().ok_or_else(|| {
                ConfigError::Validation("azure-openai requires base_url (resource URL)".into())
            })?;
            Arc::new(OpenAiProvider::azure(
                resource,
                &model,
                "2024-06-01",
                key,
                window,
            ))
        }

        "anthropic" | "claude" => {
            let key = require_key(config)?;
            match config.base_url.as_deref() {
                Some(base) => Arc::new(AnthropicProvider::with_base_url(base, key, model, window)),
                None => Arc::new(AnthropicProvider::new(key, model, window)),
            }
        }

        "gemini" | "google" => {
            let key = require_key(config)?;
            match config.base_url.as_deref() {
                Some(base) => Arc::new(GeminiProvider::with_base_url(base, key, model, window)),
                None => Arc::new(GeminiProvider::new(key, model, window)),
            }
        }

        other => {
            return Err(ConfigError::Validation(format!(
                "unknown provider '{other}' (expected openai, azure-openai, anthropic, gemini, ollama or mock)"
            )))
        }
    };

    Ok(provider)
}

fn require_key(config: &Config) -> Result<String, ConfigError> {
    config.resolve_api_key().ok_or_else(|| {
        ConfigError::Validation(format!(
            "provider '{}' requires an API key (config or environment)",
            config.provider
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mock_provider_needs_no_key() {
        let config = Config {
            provider: "mock".into(),
            ..Config::default()
        };
        let provider = create_provider(&config).unwrap();
        assert_eq!(provider.name(), "mock");
    }

    #[test]
    fn ollama_needs_no_key() {
        let config = Config {
            provider: "ollama".into(),
            ..Config::default()
        };
        let provider = create_provider(&config).unwrap();
        assert_eq!(provider.name(), "ollama");
    }

    #[test]
    fn openai_with_explicit_key() {
        let config = Config {
            provider: "openai".into(),
            api_key: Some("sk-test".into()),
            model: Some("gpt-4o".into()),
            ..Config::default()
        };
        let provider = create_provider(&config).unwrap();
        assert_eq!(provider.name(), "openai");
        assert_eq!(provider.context_window(), 8192);
    }

    #[test]
    fn azure_requires_base_url() {
        let config = Config {
            provider: "azure-openai".into(),
            api_key: Some("key".into()),
            ..Config::default()
        };
        assert!(create_provider(&config).is_err());
    }

    #[test]
    fn unknown_provider_rejected() {
        let config = Config {
            provider: "teapot".into(),
            api_key: Some("key".into()),
            ..Config::default()
        };
        assert!(create_provider(&config).is_err());
    }
}
