use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, anyhow, bail};
use tracing_appender::non_blocking::WorkerGuard;

use outreach_engine::capability::{CapabilityKind, CapabilityRegistry, PromptCapability};
use outreach_engine::config::EngineConfig;
use outreach_engine::engine::{CampaignEngine, CampaignRequest, CancelToken};
use outreach_engine::llm::{LlmBackend, LlmConfig, LlmProvider, create_provider};
use outreach_engine::store::{InMemoryStore, KeyValueStore, LibSqlStore};
use outreach_engine::validator::{LlmValidator, RuleValidator, Validator};

const DEFAULT_MODEL: &str = "claude-sonnet-4-20250514";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install rustls crypto provider before any TLS usage
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow!("Failed to install rustls crypto provider"))?;

    let _log_guard = init_tracing();

    let request_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .context("usage: outreach-engine <campaign-request.json>")?;
    let raw = tokio::fs::read_to_string(&request_path)
        .await
        .with_context(|| format!("Failed to read {}", request_path.display()))?;
    let request: CampaignRequest = serde_json::from_str(&raw)
        .with_context(|| format!("Invalid campaign request in {}", request_path.display()))?;

    let config = EngineConfig::from_env().context("Invalid engine configuration")?;
    let llm = create_provider(&llm_config_from_env()?).context("Failed to create LLM provider")?;

    eprintln!("Outreach engine v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Model: {}", llm.model_name());
    eprintln!("   Entities: {}", request.entities.len());

    // ── Capabilities ─────────────────────────────────────────────────────
    let mut registry = CapabilityRegistry::new();
    for kind in CapabilityKind::ALL {
        registry
            .register(Arc::new(PromptCapability::new(kind, Arc::clone(&llm))))
            .with_context(|| format!("Failed to register {kind}"))?;
    }

    // ── Validator ────────────────────────────────────────────────────────
    let validator: Arc<dyn Validator> =
        match std::env::var("OUTREACH_VALIDATOR").as_deref().unwrap_or("rules") {
            "rules" => Arc::new(RuleValidator::from_config(&config)),
            "llm" => Arc::new(LlmValidator::new(Arc::clone(&llm))),
            other => bail!("OUTREACH_VALIDATOR must be 'rules' or 'llm', got '{other}'"),
        };
    eprintln!("   Validator: {}", validator.name());

    // ── Result cache ─────────────────────────────────────────────────────
    let store: Arc<dyn KeyValueStore> = match std::env::var("OUTREACH_CACHE_DB") {
        Ok(path) if !path.trim().is_empty() => {
            let path = PathBuf::from(path);
            eprintln!("   Cache: {}", path.display());
            Arc::new(
                LibSqlStore::new_local(&path)
                    .await
                    .with_context(|| format!("Failed to open cache at {}", path.display()))?,
            )
        }
        _ => {
            eprintln!("   Cache: in-memory");
            Arc::new(InMemoryStore::new())
        }
    };

    let engine = CampaignEngine::new(config, registry, validator, store)?;

    // Ctrl-C stops dispatching; in-flight entities finish.
    let cancel = CancelToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("Interrupt received, finishing in-flight entities");
                cancel.cancel();
            }
        });
    }

    let result = engine.run(request, &cancel).await?;
    eprintln!(
        "   Done: {}/{} accepted, {} below threshold, {} failed, {} skipped",
        result.success_count,
        result.total,
        result.exhausted_count,
        result.failed_count,
        result.skipped_count
    );
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}

/// Log to stderr, and to a daily rolling file when `OUTREACH_LOG_DIR` is
/// set. The returned guard must live until exit to flush the file writer.
fn init_tracing() -> Option<WorkerGuard> {
    let filter = || {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"))
    };

    match std::env::var("OUTREACH_LOG_DIR") {
        Ok(dir) if !dir.trim().is_empty() => {
            let appender = tracing_appender::rolling::daily(dir, "outreach.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt()
                .with_env_filter(filter())
                .with_target(false)
                .with_ansi(false)
                .with_writer(writer)
                .init();
            Some(guard)
        }
        _ => {
            tracing_subscriber::fmt()
                .with_env_filter(filter())
                .with_target(false)
                .with_writer(std::io::stderr)
                .init();
            None
        }
    }
}

/// Anthropic when `ANTHROPIC_API_KEY` is set, otherwise OpenAI.
fn llm_config_from_env() -> anyhow::Result<LlmConfig> {
    let (backend, api_key) = if let Ok(key) = std::env::var("ANTHROPIC_API_KEY") {
        (LlmBackend::Anthropic, key)
    } else if let Ok(key) = std::env::var("OPENAI_API_KEY") {
        (LlmBackend::OpenAi, key)
    } else {
        bail!("Set ANTHROPIC_API_KEY or OPENAI_API_KEY");
    };

    let model = std::env::var("OUTREACH_MODEL").unwrap_or_else(|_| match backend {
        LlmBackend::Anthropic => DEFAULT_MODEL.to_string(),
        LlmBackend::OpenAi => "gpt-4o-mini".to_string(),
    });

    Ok(LlmConfig {
        backend,
        api_key: secrecy::SecretString::from(api_key),
        model,
    })
}
