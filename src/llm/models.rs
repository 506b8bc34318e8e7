//! Model listing over the backends' `/models` endpoints.

use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;

use crate::error::LlmError;
use crate::llm::{BackendConfig, LlmBackend};

const LIST_TIMEOUT: Duration = Duration::from_secs(30);
const ANTHROPIC_VERSION: &str = "2023-06-01";

#[derive(Deserialize)]
struct ModelList {
    data: Vec<ModelEntry>,
}

#[derive(Deserialize)]
struct ModelEntry {
    id: String,
}

/// Lists the model ids a backend currently serves.
pub struct ModelCatalog {
    client: reqwest::Client,
    backend: LlmBackend,
    url: String,
    api_key: SecretString,
}

impl ModelCatalog {
    pub fn new(config: &BackendConfig) -> Result<Self, LlmError> {
        let client = reqwest::Client::builder()
            .timeout(LIST_TIMEOUT)
            .build()
            .map_err(|e| LlmError::RequestFailed {
                provider: config.backend.to_string(),
                reason: format!("Failed to build HTTP client: {e}"),
            })?;
        Ok(Self {
            client,
            backend: config.backend,
            url: models_url(config.backend, &config.api_base),
            api_key: config.api_key.clone(),
        })
    }

    pub async fn list(&self) -> Result<Vec<String>, LlmError> {
        let request = self.client.get(&self.url);
        let request = match self.backend {
            LlmBackend::OpenAiCompatible => request.bearer_auth(self.api_key.expose_secret()),
            LlmBackend::Anthropic => request
                .header("x-api-key", self.api_key.expose_secret())
                .header("anthropic-version", ANTHROPIC_VERSION),
        };

        let failed = |reason: String| LlmError::ModelListFailed {
            provider: self.backend.to_string(),
            reason,
        };
        let response = request.send().await.map_err(|e| failed(e.to_string()))?;
        if !response.status().is_success() {
            return Err(failed(format!("HTTP {}", response.status().as_u16())));
        }
        let list: ModelList = response.json().await.map_err(|e| failed(e.to_string()))?;
        Ok(list.data.into_iter().map(|m| m.id).collect())
    }
}

/// OpenAI-compatible bases already carry the `/v1` prefix; the Anthropic
/// base is the bare host.
fn models_url(backend: LlmBackend, api_base: &str) -> String {
    let base = api_base.trim_end_matches('/');
    match backend {
        LlmBackend::OpenAiCompatible => format!("{base}/models"),
        LlmBackend::Anthropic if base.ends_with("/v1") => format!("{base}/models"),
        LlmBackend::Anthropic => format!("{base}/v1/models"),
    }
}
