//! Configuration and lookup for the set of available provider adapters.

use super::anthropic::{AnthropicAdapter, AnthropicModel};
use super::gemini::{GeminiAdapter, GeminiModel};
use super::openai::{OpenAIAdapter, OpenAIModel};
use super::ProviderAdapter;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provider {
    Anthropic,
    OpenAI,
    Gemini,
}

impl Provider {
    pub fn display_name(self) -> &'static str {
        match self {
            Provider::Anthropic => "Anthropic",
            Provider::OpenAI => "OpenAI",
            Provider::Gemini => "Gemini",
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct LlmConfig {
    pub anthropic_api_key: Option<String>,
    pub openai_api_key: Option<String>,
    pub gemini_api_key: Option<String>,
    pub gateway: Option<String>,
    pub default_model: Option<String>,
}

impl LlmConfig {
    pub fn from_env() -> Self {
        Self {
            anthropic_api_key: std::env::var("ANTHROPIC_API_KEY").ok(),
            openai_api_key: std::env::var("OPENAI_API_KEY").ok(),
            gemini_api_key: std::env::var("GEMINI_API_KEY").ok(),
            gateway: std::env::var("IKIGAI_GATEWAY").ok(),
            default_model: std::env::var("IKIGAI_DEFAULT_MODEL").ok(),
        }
    }
}

/// Registry of available provider adapters, keyed by model id.
pub struct ModelRegistry {
    adapters: HashMap<String, Arc<dyn ProviderAdapter>>,
    default_model: String,
}

impl ModelRegistry {
    pub fn new_empty() -> Self {
        ModelRegistry {
            adapters: HashMap::new(),
            default_model: "test-model".to_string(),
        }
    }

    pub fn new(config: &LlmConfig) -> Self {
        let mut adapters: HashMap<String, Arc<dyn ProviderAdapter>> = HashMap::new();
        let gateway = config.gateway.as_deref();

        if let Some(key) = Self::resolve_key(&config.anthropic_api_key, gateway) {
            for model in [
                AnthropicModel::Claude4Opus,
                AnthropicModel::Claude4Sonnet,
                AnthropicModel::Claude35Haiku,
            ] {
                let adapter = AnthropicAdapter::new(key.clone(), model, gateway);
                adapters.insert(adapter.model_id().to_string(), Arc::new(adapter));
            }
        }
        if let Some(key) = Self::resolve_key(&config.openai_api_key, gateway) {
            for model in [OpenAIModel::Gpt5Codex, OpenAIModel::FireworksQwenCoder] {
                let adapter = OpenAIAdapter::new(key.clone(), model, gateway);
                adapters.insert(adapter.model_id().to_string(), Arc::new(adapter));
            }
        }
        if let Some(key) = Self::resolve_key(&config.gemini_api_key, gateway) {
            for model in [GeminiModel::Gemini2Pro, GeminiModel::Gemini2Flash] {
                let adapter = GeminiAdapter::new(key.clone(), model, gateway);
                adapters.insert(adapter.model_id().to_string(), Arc::new(adapter));
            }
        }

        let default_model = config
            .default_model
            .clone()
            .or_else(|| {
                if adapters.contains_key("claude-4.5-sonnet") {
                    Some("claude-4.5-sonnet".to_string())
                } else {
                    let mut keys: Vec<_> = adapters.keys().cloned().collect();
                    keys.sort();
                    keys.into_iter().next()
                }
            })
            .unwrap_or_else(|| "claude-4.5-sonnet".to_string());

        ModelRegistry {
            adapters,
            default_model,
        }
    }

    /// In gateway mode, the gateway performs authentication, so any
    /// model becomes reachable with a placeholder key; in direct mode a
    /// real, non-empty key is required.
    fn resolve_key(key: &Option<String>, gateway: Option<&str>) -> Option<String> {
        if gateway.is_some() {
            Some("implicit".to_string())
        } else {
            key.clone().filter(|k| !k.is_empty())
        }
    }

    pub fn get(&self, model_id: &str) -> Option<Arc<dyn ProviderAdapter>> {
        self.adapters.get(model_id).cloned()
    }

    pub fn default(&self) -> Option<Arc<dyn ProviderAdapter>> {
        self.get(&self.default_model)
    }

    pub fn default_model_id(&self) -> &str {
        &self.default_model
    }

    pub fn available_models(&self) -> Vec<String> {
        let mut models: Vec<_> = self.adapters.keys().cloned().collect();
        models.sort();
        models
    }

    pub fn has_models(&self) -> bool {
        !self.adapters.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_api_keys_means_no_models() {
        let config = LlmConfig::default();
        let registry = ModelRegistry::new(&config);
        assert!(registry.available_models().is_empty());
    }

    #[test]
    fn anthropic_key_enables_only_claude_models() {
        let config = LlmConfig {
            anthropic_api_key: Some("test-key".to_string()),
            ..Default::default()
        };
        let registry = ModelRegistry::new(&config);
        let models = registry.available_models();
        assert!(!models.is_empty());
        for model_id in &models {
            assert!(model_id.contains("claude"));
        }
    }

    #[test]
    fn gateway_enables_all_providers_without_direct_keys() {
        let config = LlmConfig {
            gateway: Some("https://example.com".to_string()),
            ..Default::default()
        };
        let registry = ModelRegistry::new(&config);
        assert!(registry.get("claude-4.5-sonnet").is_some());
        assert!(registry.get("gpt-5.2-codex").is_some());
        assert!(registry.get("gemini-2.5-pro").is_some());
    }

    #[test]
    fn default_model_prefers_sonnet_then_falls_back() {
        let config = LlmConfig {
            anthropic_api_key: Some("test-key".to_string()),
            ..Default::default()
        };
        let registry = ModelRegistry::new(&config);
        assert_eq!(registry.default_model_id(), "claude-4.5-sonnet");
    }

    #[test]
    fn custom_default_model_is_honored() {
        let config = LlmConfig {
            anthropic_api_key: Some("test-key".to_string()),
            default_model: Some("claude-4.5-opus".to_string()),
            ..Default::default()
        };
        let registry = ModelRegistry::new(&config);
        assert_eq!(registry.default_model_id(), "claude-4.5-opus");
    }
}
