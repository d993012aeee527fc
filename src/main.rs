//! Relaybot CLI entry point.

use anyhow::Context as _;
use clap::Parser;
use relaybot::agent::{
    ActiveSessions, Orchestrator, OrchestratorConfig, RequestPipeline, RequestQueue,
};
use relaybot::config::Config;
use relaybot::conversation::{HistoryStore, RedbStateStore};
use relaybot::ingest::{
    AttachmentIngestor, DocumentExtractor, FfmpegConverter, HttpDownloader, PollPolicy,
};
use relaybot::llm::GeminiClient;
use relaybot::messaging::{DiscordTransport, Handler, RelayState, TransportDyn};
use relaybot::prompts::PromptEngine;
use relaybot::settings::SettingsResolver;
use serenity::all::{Client, GatewayIntents};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;

#[derive(Parser)]
#[command(name = "relaybot")]
#[command(about = "Relays Discord mentions to a streaming Gemini model")]
struct Cli {
    /// Path to config file (optional)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = Config::load(cli.config.as_deref()).with_context(|| match &cli.config {
        Some(path) => format!("failed to load config from {}", path.display()),
        None => "failed to load configuration".to_string(),
    })?;

    let _log_guard = init_logging(cli.debug, &config);
    tracing::info!(data_dir = %config.data_dir.display(), "configuration loaded");

    // Leftovers from a previous run are never referenced again.
    let temp_dir = config.temp_dir();
    let _ = tokio::fs::remove_dir_all(&temp_dir).await;
    tokio::fs::create_dir_all(&temp_dir)
        .await
        .with_context(|| format!("failed to create {}", temp_dir.display()))?;

    let gemini = Arc::new(
        GeminiClient::new(config.gemini.api_key.clone(), config.gemini.base_url.clone())
            .context("failed to build Gemini client")?,
    );

    let history_path = config.history_db_path();
    let store = RedbStateStore::new(&history_path)
        .with_context(|| format!("failed to open {}", history_path.display()))?;
    let history = Arc::new(HistoryStore::new(Arc::new(store)));
    let prompts = Arc::new(PromptEngine::new().context("failed to build prompt templates")?);
    let settings = Arc::new(SettingsResolver::new(
        config.defaults.clone(),
        config.overrides.clone(),
    ));

    let intents = GatewayIntents::GUILDS
        | GatewayIntents::GUILD_MESSAGES
        | GatewayIntents::DIRECT_MESSAGES
        | GatewayIntents::MESSAGE_CONTENT;
    let mut client = Client::builder(&config.discord.token, intents)
        .event_handler(Handler)
        .await
        .context("failed to create Discord client")?;

    let transport: Arc<dyn TransportDyn> = Arc::new(DiscordTransport::new(client.http.clone()));

    let ingestor = Arc::new(AttachmentIngestor::new(
        gemini.clone(),
        Arc::new(HttpDownloader::new(
            gemini.http_client().clone(),
            config.limits.max_attachment_bytes,
        )),
        Arc::new(FfmpegConverter::default()),
        Arc::new(DocumentExtractor),
        temp_dir,
        PollPolicy::from(&config.limits),
    )
    .with_size_limit(config.limits.max_attachment_bytes));
    let orchestrator = Arc::new(Orchestrator::new(
        gemini,
        transport.clone(),
        history,
        prompts,
        OrchestratorConfig::from_config(&config),
    ));
    let sessions = ActiveSessions::default();
    let pipeline = Arc::new(RequestPipeline::new(
        ingestor,
        orchestrator,
        transport.clone(),
        sessions.clone(),
        config.limits.typing_timeout,
    ));
    let queue = Arc::new(RequestQueue::new(pipeline, config.limits.queue_depth));

    {
        let mut data = client.data.write().await;
        data.insert::<RelayState>(Arc::new(RelayState {
            queue,
            sessions,
            settings: settings.clone(),
            transport,
        }));
    }

    #[cfg(unix)]
    spawn_settings_reload(cli.config.clone(), settings);

    let shard_manager = client.shard_manager.clone();
    tokio::spawn(async move {
        if let Err(error) = tokio::signal::ctrl_c().await {
            tracing::error!(%error, "failed to listen for shutdown signal");
            return;
        }
        tracing::info!("shutdown signal received, stopping Discord client");
        shard_manager.shutdown_all().await;
    });

    tracing::info!(models = ?config.gemini.models, "starting Discord gateway connection");
    client.start().await.context("Discord client error")?;

    tracing::info!("relaybot stopped");
    Ok(())
}

/// Console logging, plus a daily-rotated file when `log_dir` is set.
fn init_logging(
    debug: bool,
    config: &Config,
) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = if debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    let registry = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer());

    match &config.log_dir {
        Some(log_dir) => {
            let appender = tracing_appender::rolling::daily(log_dir, "relaybot.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            registry
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(false)
                        .with_writer(writer),
                )
                .init();
            Some(guard)
        }
        None => {
            registry.init();
            None
        }
    }
}

/// Re-read per-user and per-guild overrides on SIGHUP.
#[cfg(unix)]
fn spawn_settings_reload(path: Option<PathBuf>, settings: Arc<SettingsResolver>) {
    use tokio::signal::unix::{SignalKind, signal};

    tokio::spawn(async move {
        let mut hangup = match signal(SignalKind::hangup()) {
            Ok(hangup) => hangup,
            Err(error) => {
                tracing::warn!(%error, "settings reload on SIGHUP unavailable");
                return;
            }
        };
        while hangup.recv().await.is_some() {
            match Config::load(path.as_deref()) {
                Ok(config) => {
                    settings.replace(config.overrides);
                    tracing::info!("settings overrides reloaded");
                }
                Err(error) => tracing::warn!(%error, "failed to reload settings overrides"),
            }
        }
    });
}
