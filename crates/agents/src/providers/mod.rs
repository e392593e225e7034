pub mod anthropic;
pub mod openai;

use std::collections::HashMap;
use std::sync::Arc;

use moltis_config::schema::ProvidersConfig;

use crate::model::LlmProvider;

/// Info about an available model.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ModelInfo {
    pub id: String,
    pub provider: String,
    pub display_name: String,
}

/// Registry of available LLM providers, keyed by model ID.
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn LlmProvider>>,
    models: Vec<ModelInfo>,
}

impl ProviderRegistry {
    /// Register a provider manually.
    pub fn register(&mut self, info: ModelInfo, provider: Arc<dyn LlmProvider>) {
        self.providers.insert(info.id.clone(), provider);
        self.models.push(info);
    }

    /// Auto-discover providers from environment variables.
    /// Uses default config (all providers enabled).
    pub fn from_env() -> Self {
        Self::from_env_with_config(&ProvidersConfig::default())
    }

    /// Auto-discover providers from environment variables,
    /// respecting the given config for enable/disable and overrides.
    pub fn from_env_with_config(config: &ProvidersConfig) -> Self {
        let mut reg = Self {
            providers: HashMap::new(),
            models: Vec::new(),
        };

        reg.register_builtin_providers(config);
        reg
    }

    fn register_builtin_providers(&mut self, config: &ProvidersConfig) {
        // Anthropic
        if config.is_enabled("anthropic") {
            let key = config
                .get("anthropic")
                .and_then(|e| e.api_key.clone())
                .or_else(|| std::env::var("ANTHROPIC_API_KEY").ok());

            if let Some(key) = key.filter(|k| !k.is_empty()) {
                let model_id = config
                    .get("anthropic")
                    .and_then(|e| e.model.as_deref())
                    .unwrap_or("claude-sonnet-4-20250514");

                if !self.providers.contains_key(model_id) {
                    let base_url = config
                        .get("anthropic")
                        .and_then(|e| e.base_url.clone())
                        .or_else(|| std::env::var("ANTHROPIC_BASE_URL").ok())
                        .unwrap_or_else(|| "https://api.anthropic.com".into());

                    let provider = Arc::new(anthropic::AnthropicProvider::new(
                        key,
                        model_id.into(),
                        base_url,
                    ));
                    self.register(
                        ModelInfo {
                            id: model_id.into(),
                            provider: "anthropic".into(),
                            display_name: "Claude Sonnet 4".into(),
                        },
                        provider,
                    );
                }
            }
        }

        // OpenAI
        if config.is_enabled("openai") {
            let key = config
                .get("openai")
                .and_then(|e| e.api_key.clone())
                .or_else(|| std::env::var("OPENAI_API_KEY").ok());

            if let Some(key) = key.filter(|k| !k.is_empty()) {
                let model_id = config
                    .get("openai")
                    .and_then(|e| e.model.as_deref())
                    .unwrap_or("gpt-4o");

                if !self.providers.contains_key(model_id) {
                    let base_url = config
                        .get("openai")
                        .and_then(|e| e.base_url.clone())
                        .or_else(|| std::env::var("OPENAI_BASE_URL").ok())
                        .unwrap_or_else(|| "https://api.openai.com/v1".into());

                    let provider = Arc::new(openai::OpenAiProvider::new(
                        key,
                        model_id.into(),
                        base_url,
                    ));
                    self.register(
                        ModelInfo {
                            id: model_id.into(),
                            provider: "openai".into(),
                            display_name: "GPT-4o".into(),
                        },
                        provider,
                    );
                }
            }
        }
    }

    pub fn get(&self, model_id: &str) -> Option<Arc<dyn LlmProvider>> {
        self.providers.get(model_id).cloned()
    }

    pub fn first(&self) -> Option<Arc<dyn LlmProvider>> {
        self.models
            .first()
            .and_then(|m| self.providers.get(&m.id))
            .cloned()
    }

    /// Return the first provider that supports tool calling,
    /// falling back to the first provider overall.
    pub fn first_with_tools(&self) -> Option<Arc<dyn LlmProvider>> {
        self.models
            .iter()
            .filter_map(|m| self.providers.get(&m.id))
            .find(|p| p.supports_tools())
            .cloned()
            .or_else(|| self.first())
    }

    pub fn list_models(&self) -> &[ModelInfo] {
        &self.models
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    pub fn provider_summary(&self) -> String {
        if self.models.is_empty() {
            return "no LLM providers configured".into();
        }
        self.models
            .iter()
            .map(|m| format!("{}: {}", m.provider, m.id))
            .collect::<Vec<_>>()
            .join(", ")
    }
}
