use std::sync::Arc;

use anyhow::Context;
use secrecy::ExposeSecret;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use ai_dispatch::agent::{ConsolidationScheduler, Conversation, LlmConsolidator};
use ai_dispatch::backlog::{BacklogDispatcher, PreCleanHook, ReviewBacklog, ScriptHook, spawn_dispatch_ticker};
use ai_dispatch::channels::cli;
use ai_dispatch::channels::MessageBus;
use ai_dispatch::config::AgentConfig;
use ai_dispatch::llm::BackendConfig;
use ai_dispatch::llm::{FallbackChain, LlmBackend, ModelRouter, Tier, create_provider};
use ai_dispatch::store::{LibSqlTaskStore, TaskStore};
use ai_dispatch::tools::ToolRegistry;
use ai_dispatch::tools::builtin::{EditFileTool, ReadFileTool, SpawnTool, WriteFileTool};
use ai_dispatch::worker::{AdmissionController, SubagentRuntime, spawn_reaper};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _log_guard = init_tracing();

    let config = AgentConfig::from_env();

    eprintln!("🤖 AI Dispatch v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Model: {} ({})", config.primary.model, config.primary.backend);
    eprintln!("   Workspace: {}", config.workspace.display());

    // ── Task store ───────────────────────────────────────────────────────
    if let Err(e) = std::fs::create_dir_all(&config.workspace) {
        eprintln!("   Warning: Could not create workspace dir: {}", e);
    }
    let store = Arc::new(
        LibSqlTaskStore::open(&config.db_path, config.capacity.clone())
            .await
            .with_context(|| format!("failed to open task store at {}", config.db_path.display()))?,
    );
    eprintln!("   Database: {}", config.db_path.display());

    // Nothing may be admitted before this runs.
    let recovered = store
        .recover_on_startup()
        .await
        .context("startup recovery failed")?;
    if recovered > 0 {
        eprintln!("   Recovered {} abandoned subagents as lost", recovered);
    }
    let store: Arc<dyn TaskStore> = store;

    // ── Backends ─────────────────────────────────────────────────────────
    let primary = create_provider(&config.primary)?;
    let tier2 = create_provider(&config.fallback.tier2)?;
    let tier3 = if has_credentials(&config.fallback.tier3) {
        Some(create_provider(&config.fallback.tier3)?)
    } else {
        eprintln!("   Tier 3: disabled (no API key)");
        None
    };

    let chain = Arc::new(FallbackChain::new(
        Tier::new(config.primary.backend, Arc::clone(&primary)),
        Some(Tier::new(config.fallback.tier2.backend, Arc::clone(&tier2))),
        tier3
            .as_ref()
            .map(|p| Tier::new(config.fallback.tier3.backend, Arc::clone(p))),
    )
    .with_final_kind(config.fallback.tier3.backend));

    let mut router = ModelRouter::new(Arc::clone(&primary));
    if config.fallback.tier2.model != config.primary.model {
        router = router.route(&config.fallback.tier2.model, tier2);
    }
    if let Some(tier3) = tier3 {
        router = router.route(&config.fallback.tier3.model, tier3);
    }

    // ── Subagent runtime ─────────────────────────────────────────────────
    let (bus, mut inbound) = MessageBus::new(64);

    let subagent_tools = Arc::new(ToolRegistry::new());
    subagent_tools.register_sync(Arc::new(ReadFileTool::new(&config.workspace)));
    subagent_tools.register_sync(Arc::new(WriteFileTool::new(&config.workspace)));
    subagent_tools.register_sync(Arc::new(EditFileTool::new(&config.workspace)));

    let runtime = Arc::new(SubagentRuntime::new(
        AdmissionController::new(Arc::clone(&store)),
        Arc::new(router),
        subagent_tools,
        Arc::new(bus.clone()),
        config.subagent.clone(),
    ));
    eprintln!(
        "   Subagents: {} concurrent, {} iterations max",
        config.capacity.max_concurrent, config.subagent.max_iterations
    );

    let _reaper = spawn_reaper(Arc::clone(&runtime), config.subagent.reaper_interval);

    // ── Backlog dispatch ─────────────────────────────────────────────────
    if config.dispatch.enabled {
        let hook: Arc<dyn PreCleanHook> = match &config.dispatch.review_script {
            Some(script) => Arc::new(ScriptHook::new(script, config.dispatch.review_timeout)),
            None => Arc::new(ReviewBacklog::new(
                &config.dispatch.backlog_path,
                &config.dispatch.lock_path,
                Arc::clone(&store),
            )),
        };
        let dispatcher = Arc::new(BacklogDispatcher::from_config(&config.dispatch).with_hook(hook));
        spawn_dispatch_ticker(dispatcher, Arc::clone(&runtime), &config.dispatch.schedule)?;
        eprintln!(
            "   Dispatch: {} ({})",
            config.dispatch.backlog_path.display(),
            config.dispatch.schedule
        );
    } else {
        eprintln!("   Dispatch: disabled");
    }

    // ── Conversation ─────────────────────────────────────────────────────
    let tools = Arc::new(ToolRegistry::new());
    tools.register_sync(Arc::new(ReadFileTool::new(&config.workspace)));
    tools.register_sync(Arc::new(WriteFileTool::new(&config.workspace)));
    tools.register_sync(Arc::new(EditFileTool::new(&config.workspace)));
    tools.register_sync(Arc::new(SpawnTool::new(Arc::clone(&runtime))));
    eprintln!("   Tools: {} registered", tools.count());

    let consolidator = Arc::new(LlmConsolidator::new(
        Arc::clone(&chain),
        config.workspace.join("memory").join("HISTORY.md"),
    ));
    let conversation = Conversation::new(
        chain,
        tools,
        ConsolidationScheduler::new(consolidator, config.consolidation.memory_window),
        config.consolidation.memory_window,
        config.subagent.max_iterations,
    );

    let stdin = cli::spawn_stdin_reader(bus);
    eprintln!("   Type a message and press Enter. /quit to exit.\n");

    let shutdown = async move {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => tracing::info!("Ctrl+C received, shutting down..."),
            _ = stdin => tracing::info!("Input closed, shutting down..."),
        }
    };
    conversation
        .serve(&mut inbound, shutdown, |response| cli::print_response(&response))
        .await;

    let in_flight = runtime.in_flight().await;
    if in_flight > 0 {
        eprintln!("   {} subagents still running; they will be recovered as lost on next start", in_flight);
    }

    store.close().await;
    tracing::info!("Shut down");
    Ok(())
}

/// Console logging, plus a daily rolling file when `AI_DISPATCH_LOG_DIR` is set.
fn init_tracing() -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let console = tracing_subscriber::fmt::layer().with_target(false);

    match std::env::var("AI_DISPATCH_LOG_DIR") {
        Ok(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "ai-dispatch.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::registry()
                .with(filter)
                .with(console)
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(false)
                        .with_writer(writer),
                )
                .init();
            Some(guard)
        }
        Err(_) => {
            tracing_subscriber::registry().with(filter).with(console).init();
            None
        }
    }
}

fn has_credentials(config: &BackendConfig) -> bool {
    config.backend != LlmBackend::Anthropic || !config.api_key.expose_secret().is_empty()
}
