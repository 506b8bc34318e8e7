//! LLM integration for AI Dispatch.
//!
//! Supports:
//! - **OpenAI-compatible**: any `/chat/completions` endpoint (LM Studio, vLLM, gateways)
//! - **Anthropic**: the messages API
//!
//! Both are rig-core clients behind `RigAdapter`. `FallbackChain` layers
//! tiered failover on top for the conversational path; subagents pick a
//! backend through a `BackendResolver`.

pub mod failover;
pub mod models;
pub mod provider;
pub mod resolver;
mod rig_adapter;

pub use failover::{FallbackChain, Tier};
pub use models::ModelCatalog;
pub use provider::*;
pub use resolver::{BackendResolver, ModelRouter};
pub use rig_adapter::RigAdapter;

use std::sync::Arc;

use secrecy::ExposeSecret;

use crate::error::LlmError;

/// Supported backend classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LlmBackend {
    OpenAiCompatible,
    Anthropic,
}

impl std::fmt::Display for LlmBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::OpenAiCompatible => write!(f, "openai_compatible"),
            Self::Anthropic => write!(f, "anthropic"),
        }
    }
}

impl std::str::FromStr for LlmBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "openai_compatible" | "openai" | "custom" | "lmstudio" => Ok(Self::OpenAiCompatible),
            "anthropic" => Ok(Self::Anthropic),
            other => Err(format!("unknown backend '{other}'")),
        }
    }
}

/// Configuration for creating an LLM provider.
#[derive(Debug, Clone)]
pub struct BackendConfig {
    pub backend: LlmBackend,
    pub model: String,
    pub api_base: String,
    pub api_key: secrecy::SecretString,
}

/// Create an LLM provider from configuration.
pub fn create_provider(config: &BackendConfig) -> Result<Arc<dyn LlmProvider>, LlmError> {
    match config.backend {
        LlmBackend::OpenAiCompatible => create_openai_compatible_provider(config),
        LlmBackend::Anthropic => create_anthropic_provider(config),
    }
}

fn create_openai_compatible_provider(
    config: &BackendConfig,
) -> Result<Arc<dyn LlmProvider>, LlmError> {
    use rig::providers::openai;

    let client: rig::client::Client<openai::client::OpenAICompletionsExt> = openai::Client::builder()
        .api_key(config.api_key.expose_secret())
        .base_url(config.api_base.trim_end_matches('/'))
        .build()
        .map_err(|e| LlmError::RequestFailed {
            provider: "openai_compatible".to_string(),
            reason: format!("Failed to create OpenAI-compatible client: {}", e),
        })?
        .completions_api();
    tracing::info!(
        "Using OpenAI-compatible endpoint {} (model: {})",
        config.api_base,
        config.model
    );
    let adapter = RigAdapter::new(client, "openai_compatible", &config.model)
        .with_catalog(ModelCatalog::new(config)?);
    Ok(Arc::new(adapter))
}

fn create_anthropic_provider(config: &BackendConfig) -> Result<Arc<dyn LlmProvider>, LlmError> {
    use rig::providers::anthropic;

    // rig appends `/v1/messages` itself.
    let base = config.api_base.trim_end_matches('/').trim_end_matches("/v1");
    let client: rig::client::Client<anthropic::client::AnthropicExt> = anthropic::Client::builder()
        .api_key(config.api_key.expose_secret())
        .base_url(base)
        .build()
        .map_err(|e| LlmError::RequestFailed {
            provider: "anthropic".to_string(),
            reason: format!("Failed to create Anthropic client: {}", e),
        })?;
    tracing::info!("Using Anthropic (model: {})", config.model);
    let adapter = RigAdapter::new(client, "anthropic", &config.model)
        .with_catalog(ModelCatalog::new(config)?);
    Ok(Arc::new(adapter))
}

/// Map a provider failure message onto the error taxonomy.
pub(crate) fn classify_error_text(provider: &str, text: &str) -> LlmError {
    let lower = text.to_ascii_lowercase();
    let provider = provider.to_string();
    let has = |needles: &[&str]| needles.iter().any(|n| lower.contains(n));

    if has(&["quota", "insufficient"]) {
        LlmError::QuotaExceeded {
            provider,
            reason: snippet(text),
        }
    } else if has(&["rate limit", "rate_limit", "too many requests", "429"]) {
        LlmError::RateLimited {
            provider,
            retry_after: None,
        }
    } else if has(&[
        "unauthorized",
        "authentication",
        "invalid api key",
        "invalid x-api-key",
        "401",
        "403",
    ]) {
        LlmError::AuthFailed { provider }
    } else if has(&["overloaded", "503", "529"]) {
        LlmError::Overloaded { provider }
    } else {
        LlmError::RequestFailed {
            provider,
            reason: snippet(text),
        }
    }
}

fn snippet(body: &str) -> String {
    const MAX: usize = 500;
    if body.chars().count() <= MAX {
        body.to_string()
    } else {
        let head: String = body.chars().take(MAX).collect();
        format!("{head}...")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_parsing() {
        assert_eq!("anthropic".parse::<LlmBackend>().unwrap(), LlmBackend::Anthropic);
        assert_eq!("LMStudio".parse::<LlmBackend>().unwrap(), LlmBackend::OpenAiCompatible);
        assert_eq!(
            LlmBackend::OpenAiCompatible.to_string().parse::<LlmBackend>().unwrap(),
            LlmBackend::OpenAiCompatible
        );
        assert!("bedrock".parse::<LlmBackend>().is_err());
    }

    #[test]
    fn error_text_classification() {
        assert!(matches!(
            classify_error_text("p", "HttpError: 429 Too Many Requests"),
            LlmError::RateLimited { .. }
        ));
        assert!(matches!(
            classify_error_text("p", "You exceeded your current quota"),
            LlmError::QuotaExceeded { .. }
        ));
        assert!(matches!(
            classify_error_text("p", "ProviderError: invalid x-api-key"),
            LlmError::AuthFailed { .. }
        ));
        assert!(matches!(
            classify_error_text("p", "{\"type\":\"overloaded_error\"}"),
            LlmError::Overloaded { .. }
        ));
        let other = classify_error_text("p", "ProviderError: context length exceeded");
        assert!(!other.is_retryable());
        assert!(other.to_string().contains("context length"));
    }

    #[test]
    fn create_provider_constructs_each_backend() {
        for backend in [LlmBackend::OpenAiCompatible, LlmBackend::Anthropic] {
            let config = BackendConfig {
                backend,
                model: "test-model".to_string(),
                api_base: "http://localhost:1234/v1".to_string(),
                api_key: secrecy::SecretString::from("test-key"),
            };
            let provider = create_provider(&config).unwrap();
            assert_eq!(provider.model_name(), "test-model");
            assert_eq!(provider.name(), backend.to_string());
        }
    }
}
