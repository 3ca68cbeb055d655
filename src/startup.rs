//! Startup coordination: wire the component graph and run the one-shot
//! lifecycle hook.
//!
//! The hook connects auto-connect MCP servers, arms folder watchers, and
//! kicks schema analysis into a detached task so startup latency stays
//! bounded. Stop is a no-op beyond dropping the per-component handles.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::Config;
use crate::dbquery::{QueryCoordinator, SchemaCatalog};
use crate::error::Result;
use crate::ingest::Ingestor;
use crate::mcp::McpClient;
use crate::orchestrator::Orchestrator;
use crate::providers::AiGateway;
use crate::store::{self, ConversationStore, DocumentStore};
use crate::watcher::{FileWatcher, WatcherHandle};

/// The fully wired component graph. Options are immutable snapshots;
/// everything here is cheap to clone or share.
pub struct AppContext {
    pub config: Arc<Config>,
    pub gateway: Arc<AiGateway>,
    pub documents: DocumentStore,
    pub conversations: ConversationStore,
    pub catalog: Arc<SchemaCatalog>,
    pub coordinator: Arc<QueryCoordinator>,
    pub mcp: Arc<McpClient>,
    pub ingestor: Arc<Ingestor>,
    pub orchestrator: Arc<Orchestrator>,
}

/// Build every component from configuration and run store migrations.
pub async fn build_context(config: Config) -> Result<Arc<AppContext>> {
    let config = Arc::new(config);
    let pool = store::connect(&config).await?;
    store::run_migrations(&pool).await?;

    let gateway = Arc::new(AiGateway::new(&config.ai)?);
    let documents = DocumentStore::new(pool.clone());
    let conversations =
        ConversationStore::new(pool, config.conversation.max_conversation_length);
    let catalog = Arc::new(SchemaCatalog::new());
    let coordinator = Arc::new(QueryCoordinator::new(
        gateway.clone(),
        catalog.clone(),
        config.databases.clone(),
        Duration::from_secs(config.routing.query_timeout_secs),
    ));
    let mcp = Arc::new(McpClient::new());
    let ingestor = Arc::new(Ingestor::new(
        documents.clone(),
        gateway.clone(),
        config.chunking.clone(),
    ));
    let orchestrator = Arc::new(Orchestrator::new(
        config.clone(),
        gateway.clone(),
        documents.clone(),
        conversations.clone(),
        catalog.clone(),
        coordinator.clone(),
        mcp.clone(),
    ));

    Ok(Arc::new(AppContext {
        config,
        gateway,
        documents,
        conversations,
        catalog,
        coordinator,
        mcp,
        ingestor,
        orchestrator,
    }))
}

/// Live resources released on shutdown.
pub struct StartupHandle {
    pub watchers: Option<WatcherHandle>,
    pub schema_task: Option<JoinHandle<()>>,
}

impl StartupHandle {
    pub fn stop(self) {
        if let Some(watchers) = self.watchers {
            watchers.stop();
        }
        // The schema task is detached on purpose; a running analysis
        // finishes on its own.
    }
}

/// The one-shot lifecycle hook, run once after wiring.
pub async fn run_startup(ctx: &Arc<AppContext>) -> Result<StartupHandle> {
    if ctx.config.features.mcp {
        for server in ctx
            .config
            .mcp_servers
            .iter()
            .filter(|s| s.auto_connect)
        {
            if let Err(e) = ctx.mcp.connect(server.clone()).await {
                warn!(server = %server.server_id, error = %e, "MCP auto-connect failed");
            }
        }
    }

    let watchers = if ctx.config.features.file_watcher && !ctx.config.watched_folders.is_empty() {
        let base_dir = std::env::current_dir()?;
        let watcher = FileWatcher::new(
            ctx.ingestor.clone(),
            ctx.config.watched_folders.clone(),
            base_dir,
        );
        Some(watcher.start().await?)
    } else {
        None
    };

    let schema_task = if !ctx.config.databases.is_empty() {
        let catalog = ctx.catalog.clone();
        let databases = ctx.config.databases.clone();
        let documents = ctx.documents.clone();
        Some(tokio::spawn(async move {
            catalog.analyze_all(&databases, Some(&documents)).await;
            info!("schema analysis finished");
        }))
    } else {
        None
    };

    Ok(StartupHandle {
        watchers,
        schema_task,
    })
}
