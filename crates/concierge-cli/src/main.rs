use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

use concierge_core::{
    AgentProtocol, AgentRegistry, AgentRequest, CompletionAgent, CompletionConfig, Domain,
    ExecutorConfig, HttpCompletionClient, IntentAnalyzer, IntentConfig, IntentType, TaskExecutor,
};

mod config;

use config::ConciergeConfig;

#[derive(Parser)]
#[command(name = "concierge")]
#[command(version)]
#[command(about = "Concierge — a multi-agent personal assistant")]
struct Cli {
    /// Path to config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize config directory and default config
    Init,

    /// Show current configuration
    Config,

    /// Send a one-shot request to the assistant
    Ask {
        /// The message to send
        message: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Set up logging
    let filter = if cli.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .init();

    match cli.command {
        Commands::Init => cmd_init().await,
        Commands::Config => cmd_config(&cli.config),
        Commands::Ask { message } => cmd_ask(&cli.config, &message).await,
    }
}

async fn cmd_init() -> Result<()> {
    let config_dir = config::config_dir();
    tokio::fs::create_dir_all(&config_dir)
        .await
        .with_context(|| format!("Failed to create config dir: {}", config_dir.display()))?;

    let config_path = config_dir.join("config.toml");
    if config_path.exists() {
        println!("Config already exists at {}", config_path.display());
    } else {
        let default_config = include_str!("../../../config/default.toml");
        tokio::fs::write(&config_path, default_config).await?;
        info!("Created default config at {}", config_path.display());
        println!("Concierge initialized at {}", config_dir.display());
        println!(
            "Edit {} to configure your API key.",
            config_path.display()
        );
    }
    Ok(())
}

fn cmd_config(custom_path: &Option<PathBuf>) -> Result<()> {
    let config = ConciergeConfig::load(custom_path)?;
    println!("{:#?}", config);
    Ok(())
}

async fn cmd_ask(custom_path: &Option<PathBuf>, message: &str) -> Result<()> {
    let config = ConciergeConfig::load(custom_path)?;

    let client = Arc::new(
        HttpCompletionClient::new(
            config.provider.api_key.clone(),
            Some(config.provider.model.clone()),
        )
        .with_base_url(config.provider.base_url.clone()),
    );

    let analyzer = IntentAnalyzer::new(
        client.clone(),
        IntentConfig {
            enabled: config.intent.enabled,
            min_length: config.intent.min_length,
            ..Default::default()
        },
    );

    let generalist: Arc<CompletionAgent> = Arc::new(
        CompletionAgent::new("generalist", "general", client.clone()).with_config(
            CompletionConfig {
                max_tokens: config.provider.max_tokens,
                ..Default::default()
            },
        ),
    );

    let analysis = analyzer.analyze(message).await;
    match analysis.intent_type {
        IntentType::Single => {
            let reply = generalist
                .as_ref()
                .execute(AgentRequest::from_message(message))
                .await?;
            println!("{}", reply.raw_message);
        }
        IntentType::Multi => {
            info!(
                "Decomposed request into {} sub-tasks across {:?}",
                analysis.sub_tasks.len(),
                analysis.domains
            );
            let mut registry = AgentRegistry::new();
            registry.register(Domain::General, generalist)?;

            let executor = TaskExecutor::new(
                Arc::new(registry),
                ExecutorConfig {
                    max_concurrent: config.executor.max_concurrent,
                    task_timeout_secs: config.executor.task_timeout_secs,
                },
            );
            let report = executor.run(&analysis.sub_tasks).await?;
            println!("{}", report.format_summary());
        }
    }
    Ok(())
}
