//! Three-tier fallback for the conversational path.
//!
//! The primary is always tried first. Only outage-class failures (rate
//! limit, authentication, overload, quota) move on to the secondary, and any
//! secondary failure moves on to the tertiary. The first success wins.

use std::sync::Arc;

use crate::error::LlmError;
use crate::llm::LlmBackend;
use crate::llm::provider::{ChatRequest, ChatResponse, LlmProvider};

/// Prefix used when a provider error is rendered as an in-band response.
pub const LLM_ERROR_PREFIX: &str = "Error calling LLM:";

/// Fragments of in-band error text that mark an outage-class failure.
const RETRYABLE_MARKERS: &[&str] = &[
    "rate_limit",
    "ratelimit",
    "rate limit",
    "overloaded",
    "authentication",
    "quota",
];

/// One ranked backend in the chain.
#[derive(Clone)]
pub struct Tier {
    pub kind: LlmBackend,
    pub provider: Arc<dyn LlmProvider>,
}

impl Tier {
    pub fn new(kind: LlmBackend, provider: Arc<dyn LlmProvider>) -> Self {
        Self { kind, provider }
    }
}

/// A failed call, either raised or reported in-band.
enum Failure {
    Raised(LlmError),
    InBand(ChatResponse),
}

impl Failure {
    fn is_retryable(&self) -> bool {
        match self {
            Self::Raised(e) => e.is_retryable(),
            Self::InBand(response) => response
                .content
                .as_deref()
                .is_some_and(is_retryable_text),
        }
    }

    fn describe(&self) -> String {
        match self {
            Self::Raised(e) => e.to_string(),
            Self::InBand(response) => response
                .content
                .clone()
                .unwrap_or_else(|| "unknown error".to_string()),
        }
    }

    fn into_response(self) -> ChatResponse {
        match self {
            Self::Raised(e) => ChatResponse::error(format!("{LLM_ERROR_PREFIX} {e}")),
            Self::InBand(response) => response,
        }
    }
}

/// True when in-band error text names an outage-class failure.
pub fn is_retryable_text(text: &str) -> bool {
    let lower = text.to_ascii_lowercase();
    RETRYABLE_MARKERS.iter().any(|marker| lower.contains(marker))
}

async fn attempt(tier: &Tier, request: ChatRequest) -> Result<ChatResponse, Failure> {
    match tier.provider.chat(request).await {
        Ok(response) if response.is_error() => Err(Failure::InBand(response)),
        Ok(response) => Ok(response),
        Err(e) => Err(Failure::Raised(e)),
    }
}

/// Primary backend plus up to two ordered fallbacks.
pub struct FallbackChain {
    primary: Tier,
    fallbacks: Vec<Tier>,
    /// Backend class of the configured last resort, kept even when that
    /// tier is disabled.
    final_kind: LlmBackend,
}

impl FallbackChain {
    pub fn new(primary: Tier, secondary: Option<Tier>, tertiary: Option<Tier>) -> Self {
        let final_kind = tertiary
            .as_ref()
            .map(|tier| tier.kind)
            .unwrap_or(LlmBackend::Anthropic);
        Self {
            primary,
            fallbacks: secondary.into_iter().chain(tertiary).collect(),
            final_kind,
        }
    }

    /// Set the last-resort backend class when the tertiary tier is not
    /// constructed (for example, missing credentials).
    pub fn with_final_kind(mut self, kind: LlmBackend) -> Self {
        self.final_kind = kind;
        self
    }

    pub fn primary(&self) -> &Tier {
        &self.primary
    }

    /// Run `request` through the tiers. Always returns a response; when
    /// every tier fails it carries `FinishReason::Error` and names each
    /// failure.
    pub async fn call_with_fallback(&self, request: ChatRequest) -> ChatResponse {
        let primary_failure = match attempt(&self.primary, request.clone()).await {
            Ok(response) => return response,
            Err(failure) => failure,
        };

        if !primary_failure.is_retryable() {
            return primary_failure.into_response();
        }

        if self.fallbacks.is_empty() {
            return primary_failure.into_response();
        }
        // The primary already is the last resort: falling back would loop.
        if self.primary.kind == self.final_kind {
            tracing::warn!(
                backend = %self.primary.kind,
                "Primary is already the final fallback backend, not retrying"
            );
            return primary_failure.into_response();
        }

        let mut causes = vec![primary_failure.describe()];
        for (index, tier) in self.fallbacks.iter().enumerate() {
            let tier_no = index + 2;
            tracing::warn!(
                tier = tier_no,
                provider = tier.provider.name(),
                model = tier.provider.model_name(),
                "Falling back after: {}",
                causes.last().map(String::as_str).unwrap_or_default()
            );
            match attempt(tier, request.clone()).await {
                Ok(response) => return response,
                Err(failure) => causes.push(failure.describe()),
            }
        }

        let mut message = if causes.len() == 3 {
            format!("All three providers failed: {}", causes[0])
        } else {
            format!("All providers failed: {}", causes[0])
        };
        for (index, cause) in causes.iter().enumerate().skip(1) {
            message.push_str(&format!("; Tier{}: {cause}", index + 1));
        }
        tracing::error!("{}", message);
        ChatResponse::error(message)
    }
}
