use clap::Parser;
use futures::StreamExt;
use model_bridge::config::print_search_paths;
use model_bridge::translate::openai_types::ChatMessage;
use model_bridge::{
    build_router, AppState, BridgeClient, BridgeConfig, ChatRequest, ModelEvent, Orchestrator,
    SharedLogger,
};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(
    name = "model-bridge",
    about = "Stream one conversation to OpenAI- and Anthropic-style models at once",
    version
)]
struct Cli {
    /// Path to config file (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Port to listen on (overrides config)
    #[arg(short, long)]
    port: Option<u16>,

    /// Log file path
    #[arg(long, default_value = "model-bridge.log")]
    log_file: PathBuf,

    /// Print config search paths and exit
    #[arg(long)]
    show_config_paths: bool,

    /// Send one prompt and print the updates instead of serving
    #[arg(long, requires = "model")]
    prompt: Option<String>,

    /// Model key to query in one-shot mode (repeatable)
    #[arg(short, long)]
    model: Vec<String>,

    /// System prompt for one-shot mode
    #[arg(long)]
    system: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "model_bridge=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    if cli.show_config_paths {
        print_search_paths();
        return Ok(());
    }

    let mut config = BridgeConfig::find_and_load(cli.config.as_deref())?;
    if let Some(port) = cli.port {
        config.port = port;
    }
    let config = Arc::new(config);

    let http = config.http_client()?;

    if let Some(prompt) = cli.prompt {
        let logger = SharedLogger::in_memory();
        let orchestrator = Orchestrator::new(config.clone(), BridgeClient::new(http, logger))
            .with_idle_timeout(config.idle_timeout());
        return run_prompt(&orchestrator, &cli.model, cli.system, prompt).await;
    }

    let logger = SharedLogger::new(&cli.log_file)?;

    info!("model-bridge v{}", env!("CARGO_PKG_VERSION"));
    info!("  Port:         {}", config.port);
    info!("  Idle timeout: {}s", config.idle_timeout_secs);
    info!("  Log file:     {}", cli.log_file.display());
    for (key, entry) in &config.models {
        match entry.resolve(key) {
            Ok(target) => info!("  Model {key}: {} via {} ({})", target.model, target.api_url, target.protocol),
            Err(e) => tracing::warn!("  Model {key}: {e}"),
        }
    }

    logger.info(
        "startup",
        format!(
            "Starting model-bridge port={} models={}",
            config.port,
            config.models.len()
        ),
    );

    let orchestrator = Orchestrator::new(config.clone(), BridgeClient::new(http, logger.clone()))
        .with_idle_timeout(config.idle_timeout());

    let state = Arc::new(AppState {
        config: config.clone(),
        orchestrator,
        logger,
    });

    let app = build_router(state);
    let bind_addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;

    info!("Listening on http://{}", bind_addr);

    axum::serve(listener, app).await?;

    Ok(())
}

/// One-shot mode: text goes to stdout as it streams, everything else is tagged.
async fn run_prompt(
    orchestrator: &Orchestrator<BridgeConfig>,
    models: &[String],
    system: Option<String>,
    prompt: String,
) -> anyhow::Result<()> {
    let mut messages = Vec::new();
    if let Some(system) = system {
        messages.push(ChatMessage::system(system));
    }
    messages.push(ChatMessage::user(prompt));

    let cancel = CancellationToken::new();
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            ctrl_c.cancel();
        }
    });

    let mut failed = false;
    let mut updates = Box::pin(orchestrator.stream_many(models, ChatRequest::new(messages), cancel));
    let mut stdout = std::io::stdout();

    while let Some(update) = updates.next().await {
        let key = &update.model_key;
        match update.event {
            ModelEvent::Content { content } => {
                if models.len() == 1 {
                    write!(stdout, "{content}")?;
                    stdout.flush()?;
                } else {
                    writeln!(stdout, "[{key}] {content}")?;
                }
            }
            ModelEvent::Reasoning { reasoning } => eprintln!("[{key}] (reasoning) {reasoning}"),
            ModelEvent::ToolCalls { tool_calls } => {
                for call in tool_calls {
                    eprintln!("[{key}] tool call {}({})", call.function.name, call.function.arguments);
                }
            }
            ModelEvent::Retry => eprintln!("[{key}] retrying with fallback messages"),
            ModelEvent::Done { content, .. } => {
                if models.len() == 1 {
                    writeln!(stdout)?;
                }
                eprintln!("[{key}] done ({} chars)", content.chars().count());
            }
            ModelEvent::Error { message } => {
                failed = true;
                eprintln!("[{key}] error: {message}");
            }
        }
    }

    if failed {
        anyhow::bail!("one or more models failed");
    }
    Ok(())
}
