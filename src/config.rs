//! Configuration types.
//!
//! Every section has a `Default` and a `from_env()` reading `AI_DISPATCH_*`
//! variables. Unparseable values fall back to the default with a warning.

use std::collections::HashMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;

use crate::llm::{BackendConfig, LlmBackend};

/// Top-level configuration for the dispatcher binary.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Agent name for identification.
    pub name: String,
    /// Path of the libSQL task database.
    pub db_path: PathBuf,
    /// Workspace root (backlog and memory files live under it).
    pub workspace: PathBuf,
    /// Primary backend used by the conversational path and by subagents.
    pub primary: BackendConfig,
    pub capacity: CapacityConfig,
    pub subagent: SubagentConfig,
    pub fallback: FallbackConfig,
    pub dispatch: DispatchConfig,
    pub consolidation: ConsolidationConfig,
}

impl Default for AgentConfig {
    fn default() -> Self {
        let workspace = PathBuf::from("./workspace");
        Self {
            name: "ai-dispatch".to_string(),
            db_path: workspace.join("subagents.db"),
            dispatch: DispatchConfig::for_workspace(&workspace),
            workspace,
            primary: BackendConfig {
                backend: LlmBackend::OpenAiCompatible,
                model: "zai-org/glm-4.7-flash".to_string(),
                api_base: "http://localhost:1234/v1".to_string(),
                api_key: SecretString::from("lm-studio"),
            },
            capacity: CapacityConfig::default(),
            subagent: SubagentConfig::default(),
            fallback: FallbackConfig::default(),
            consolidation: ConsolidationConfig::default(),
        }
    }
}

impl AgentConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let workspace = std::env::var("AI_DISPATCH_WORKSPACE")
            .map(PathBuf::from)
            .unwrap_or(defaults.workspace);
        let db_path = std::env::var("AI_DISPATCH_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| workspace.join("subagents.db"));

        Self {
            name: env_or("AI_DISPATCH_NAME", &defaults.name),
            db_path,
            primary: BackendConfig::from_env("AI_DISPATCH", defaults.primary),
            capacity: CapacityConfig::from_env(),
            subagent: SubagentConfig::from_env(),
            fallback: FallbackConfig::from_env(),
            dispatch: DispatchConfig::from_env(&workspace),
            consolidation: ConsolidationConfig::from_env(),
            workspace,
        }
    }
}

/// Admission limits.
#[derive(Debug, Clone)]
pub struct CapacityConfig {
    /// Maximum number of pending + running tasks across all classes.
    pub max_concurrent: usize,
    /// Tighter limits for specific task classes (keyed by model name).
    pub per_class: HashMap<String, usize>,
}

impl Default for CapacityConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 3,
            per_class: HashMap::new(),
        }
    }
}

impl CapacityConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            max_concurrent: env_parse("AI_DISPATCH_MAX_CONCURRENT", defaults.max_concurrent),
            per_class: std::env::var("AI_DISPATCH_CLASS_LIMITS")
                .map(|raw| parse_model_table(&raw))
                .unwrap_or_default(),
        }
    }
}

/// Subagent execution limits.
#[derive(Debug, Clone)]
pub struct SubagentConfig {
    /// Hard ceiling on model calls per task.
    pub max_iterations: usize,
    /// Per-model overrides of `max_iterations`.
    pub model_iterations: HashMap<String, usize>,
    /// Pending tasks older than this are reaped.
    pub pending_timeout: Duration,
    /// Running tasks older than this are reaped.
    pub execution_timeout: Duration,
    /// Scheduled tasks are requeued at most this many times before being marked lost.
    pub max_retry_count: u32,
    /// How often the reaper sweeps active tasks.
    pub reaper_interval: Duration,
}

impl Default for SubagentConfig {
    fn default() -> Self {
        Self {
            max_iterations: 15,
            model_iterations: HashMap::new(),
            pending_timeout: Duration::from_secs(300),
            execution_timeout: Duration::from_secs(1200),
            max_retry_count: 3,
            reaper_interval: Duration::from_secs(60),
        }
    }
}

impl SubagentConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            max_iterations: env_parse("AI_DISPATCH_MAX_ITERATIONS", defaults.max_iterations),
            model_iterations: std::env::var("AI_DISPATCH_MODEL_ITERATIONS")
                .map(|raw| parse_model_table(&raw))
                .unwrap_or_default(),
            pending_timeout: Duration::from_secs(env_parse(
                "AI_DISPATCH_PENDING_TIMEOUT_SECS",
                defaults.pending_timeout.as_secs(),
            )),
            execution_timeout: Duration::from_secs(env_parse(
                "AI_DISPATCH_EXECUTION_TIMEOUT_SECS",
                defaults.execution_timeout.as_secs(),
            )),
            max_retry_count: env_parse("AI_DISPATCH_MAX_RETRY_COUNT", defaults.max_retry_count),
            reaper_interval: Duration::from_secs(env_parse(
                "AI_DISPATCH_REAPER_INTERVAL_SECS",
                defaults.reaper_interval.as_secs(),
            )),
        }
    }

    /// Iteration ceiling for a given model.
    pub fn iterations_for(&self, model: &str) -> usize {
        self.model_iterations
            .get(model)
            .copied()
            .unwrap_or(self.max_iterations)
    }
}

/// Secondary and tertiary backends for the conversational path.
#[derive(Debug, Clone)]
pub struct FallbackConfig {
    pub tier2: BackendConfig,
    pub tier3: BackendConfig,
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            tier2: BackendConfig {
                backend: LlmBackend::OpenAiCompatible,
                model: "zai-org/glm-4.7-flash".to_string(),
                api_base: "http://localhost:1234/v1".to_string(),
                api_key: SecretString::from("lm-studio"),
            },
            tier3: BackendConfig {
                backend: LlmBackend::Anthropic,
                model: "claude-sonnet-4-6".to_string(),
                api_base: "https://api.anthropic.com".to_string(),
                api_key: SecretString::from(""),
            },
        }
    }
}

impl FallbackConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            tier2: BackendConfig::from_env("AI_DISPATCH_TIER2", defaults.tier2),
            tier3: BackendConfig::from_env("AI_DISPATCH_TIER3", defaults.tier3),
        }
    }
}

/// Backlog dispatch settings.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Whether the cron ticker runs at all.
    pub enabled: bool,
    pub backlog_path: PathBuf,
    /// Dedicated lock file, never the backlog itself.
    pub lock_path: PathBuf,
    /// External pre-clean script. The built-in review runs when unset.
    pub review_script: Option<PathBuf>,
    pub review_timeout: Duration,
    /// Cron expression (with seconds field) for the dispatch ticker.
    pub schedule: String,
    /// Model dispatched milestones run on. The resolver default when unset.
    pub model: Option<String>,
    /// Where subagent results of dispatched milestones are announced.
    pub notify_channel: String,
    pub notify_chat_id: String,
}

impl DispatchConfig {
    pub fn for_workspace(workspace: &std::path::Path) -> Self {
        let memory = workspace.join("memory");
        Self {
            enabled: false,
            backlog_path: memory.join("BACKLOG.md"),
            lock_path: memory.join(".backlog.lock"),
            review_script: None,
            review_timeout: Duration::from_secs(30),
            schedule: "0 */5 * * * *".to_string(),
            model: None,
            notify_channel: "cli".to_string(),
            notify_chat_id: "direct".to_string(),
        }
    }

    pub fn from_env(workspace: &std::path::Path) -> Self {
        let defaults = Self::for_workspace(workspace);
        let backlog_path = std::env::var("AI_DISPATCH_BACKLOG")
            .map(PathBuf::from)
            .unwrap_or(defaults.backlog_path);
        let lock_path = std::env::var("AI_DISPATCH_BACKLOG_LOCK")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                backlog_path
                    .parent()
                    .map(|p| p.join(".backlog.lock"))
                    .unwrap_or(defaults.lock_path)
            });

        Self {
            enabled: env_parse("AI_DISPATCH_ENABLED", defaults.enabled),
            backlog_path,
            lock_path,
            review_script: std::env::var("AI_DISPATCH_REVIEW_SCRIPT")
                .ok()
                .map(PathBuf::from),
            review_timeout: Duration::from_secs(env_parse(
                "AI_DISPATCH_REVIEW_TIMEOUT_SECS",
                defaults.review_timeout.as_secs(),
            )),
            schedule: env_or("AI_DISPATCH_SCHEDULE", &defaults.schedule),
            model: std::env::var("AI_DISPATCH_MODEL")
                .ok()
                .filter(|m| !m.trim().is_empty()),
            notify_channel: env_or("AI_DISPATCH_NOTIFY_CHANNEL", &defaults.notify_channel),
            notify_chat_id: env_or("AI_DISPATCH_NOTIFY_CHAT_ID", &defaults.notify_chat_id),
        }
    }
}

/// Session memory consolidation.
#[derive(Debug, Clone)]
pub struct ConsolidationConfig {
    /// Sessions with more messages than this are consolidated.
    pub memory_window: usize,
}

impl Default for ConsolidationConfig {
    fn default() -> Self {
        Self { memory_window: 50 }
    }
}

impl ConsolidationConfig {
    pub fn from_env() -> Self {
        Self {
            memory_window: env_parse("AI_DISPATCH_MEMORY_WINDOW", Self::default().memory_window),
        }
    }
}

impl BackendConfig {
    /// Read `{prefix}_BACKEND`, `{prefix}_MODEL`, `{prefix}_API_BASE` and
    /// `{prefix}_API_KEY`, keeping `defaults` for anything unset.
    pub fn from_env(prefix: &str, defaults: BackendConfig) -> Self {
        let backend = match std::env::var(format!("{prefix}_BACKEND")) {
            Ok(raw) => raw.parse().unwrap_or_else(|e| {
                tracing::warn!("{prefix}_BACKEND: {e}, using {}", defaults.backend);
                defaults.backend
            }),
            Err(_) => defaults.backend,
        };
        Self {
            backend,
            model: std::env::var(format!("{prefix}_MODEL")).unwrap_or(defaults.model),
            api_base: std::env::var(format!("{prefix}_API_BASE")).unwrap_or(defaults.api_base),
            api_key: std::env::var(format!("{prefix}_API_KEY"))
                .map(SecretString::from)
                .unwrap_or(defaults.api_key),
        }
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: FromStr + std::fmt::Display>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(raw) => raw.trim().parse().unwrap_or_else(|_| {
            tracing::warn!("Invalid value for {key}: {raw:?}, using {default}");
            default
        }),
        Err(_) => default,
    }
}

/// Parse `"model-a=1,model-b=2"` into a map. Malformed entries are skipped.
pub fn parse_model_table(raw: &str) -> HashMap<String, usize> {
    raw.split(',')
        .filter_map(|entry| {
            let (name, value) = entry.split_once('=')?;
            let name = name.trim();
            if name.is_empty() {
                return None;
            }
            value.trim().parse().ok().map(|v| (name.to_string(), v))
        })
        .collect()
}
