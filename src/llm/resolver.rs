//! Backend selection for subagents.

use std::collections::HashMap;
use std::sync::Arc;

use crate::llm::provider::LlmProvider;

/// Picks the backend that should service a model hint.
pub trait BackendResolver: Send + Sync {
    fn resolve(&self, model_hint: Option<&str>) -> Arc<dyn LlmProvider>;
}

/// Routes explicit model names to dedicated providers, everything else to a
/// default provider.
pub struct ModelRouter {
    default: Arc<dyn LlmProvider>,
    routes: HashMap<String, Arc<dyn LlmProvider>>,
}

impl ModelRouter {
    pub fn new(default: Arc<dyn LlmProvider>) -> Self {
        Self {
            default,
            routes: HashMap::new(),
        }
    }

    pub fn route(mut self, model: impl Into<String>, provider: Arc<dyn LlmProvider>) -> Self {
        self.routes.insert(model.into(), provider);
        self
    }
}

impl BackendResolver for ModelRouter {
    fn resolve(&self, model_hint: Option<&str>) -> Arc<dyn LlmProvider> {
        model_hint
            .and_then(|model| self.routes.get(model))
            .map(Arc::clone)
            .unwrap_or_else(|| Arc::clone(&self.default))
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::*;
    use crate::error::LlmError;
    use crate::llm::provider::{ChatRequest, ChatResponse};

    struct Named(&'static str);

    #[async_trait]
    impl LlmProvider for Named {
        fn name(&self) -> &str {
            self.0
        }
        fn model_name(&self) -> &str {
            self.0
        }
        async fn chat(&self, _request: ChatRequest) -> Result<ChatResponse, LlmError> {
            Ok(ChatResponse::text(self.0))
        }
    }

    #[test]
    fn routes_known_models_and_defaults_the_rest() {
        let router = ModelRouter::new(Arc::new(Named("local")))
            .route("claude-sonnet-4-6", Arc::new(Named("anthropic")));

        assert_eq!(router.resolve(Some("claude-sonnet-4-6")).name(), "anthropic");
        assert_eq!(router.resolve(Some("qwen3-coder-next")).name(), "local");
        assert_eq!(router.resolve(None).name(), "local");
    }
}
