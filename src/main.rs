use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use answer_harness::{config, health, server, startup, store};

#[derive(Parser)]
#[command(
    name = "rag",
    about = "Answer Harness — a multi-source retrieval-augmented generation service",
    version
)]
struct Cli {
    /// Path to configuration file
    #[arg(long, global = true, default_value = "./config/rag.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the document and conversation store
    Init,

    /// Start the HTTP service (watchers, MCP, and schema analysis included)
    Serve,

    /// Show the intent and generated SQL for a query without executing it
    Analyze {
        /// The natural-language question to inspect
        query: String,
    },

    /// Probe every configured dependency and print the result
    Health,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            let pool = store::connect(&cfg).await?;
            store::run_migrations(&pool).await?;
            println!("Store initialized at {}", cfg.storage.db_path.display());
        }
        Commands::Serve => {
            let ctx = startup::build_context(cfg).await?;
            let handle = startup::run_startup(&ctx).await?;
            let result = server::run_server(ctx).await;
            handle.stop();
            result?;
        }
        Commands::Analyze { query } => {
            let ctx = startup::build_context(cfg).await?;
            // Analysis needs the catalog; run it inline rather than detached.
            ctx.catalog
                .analyze_all(&ctx.config.databases, Some(&ctx.documents))
                .await;
            let analysis = ctx.orchestrator.analyze_query(&query).await?;
            println!("{}", serde_json::to_string_pretty(&analysis)?);
        }
        Commands::Health => {
            let ctx = startup::build_context(cfg).await?;
            let report = health::check(
                &ctx.gateway,
                &ctx.documents,
                &ctx.conversations,
                &ctx.config.databases,
                &ctx.catalog,
            )
            .await;
            println!("{}", serde_json::to_string_pretty(&report)?);
            if !report.healthy {
                std::process::exit(1);
            }
        }
    }

    Ok(())
}
