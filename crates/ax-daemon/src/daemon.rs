use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use ax_core::config::Config;
use ax_core::store::{ExecutionStore, SqliteExecutionStore};
use ax_engine::approval::ApprovalDesk;
use ax_engine::collaborators::StaticAgentDirectory;
use ax_engine::events::EventBus;
use ax_engine::orchestrator::{Collaborators, ExecutionOrchestrator};
use ax_engine::remote::HttpExecutionService;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Replace a leading `~/` with `home`.
pub fn expand_home(path: &str, home: &Path) -> PathBuf {
    match path.strip_prefix("~/") {
        Some(rest) => home.join(rest),
        None => PathBuf::from(path),
    }
}

/// Hosts one orchestrator until shutdown is requested.
///
/// Startup fails executions left in flight by a previous process; shutdown
/// cancels every background activity the orchestrator still tracks.
pub struct Daemon {
    config: Config,
    orchestrator: Arc<ExecutionOrchestrator>,
    event_bus: EventBus,
    approvals: ApprovalDesk,
    shutdown: CancellationToken,
}

impl Daemon {
    /// Build a daemon on top of an already opened store.
    pub fn with_store(config: Config, store: Arc<dyn ExecutionStore>) -> Self {
        let event_bus = EventBus::new();
        let approvals = ApprovalDesk::new();
        let deps = Collaborators {
            events: Arc::new(event_bus.clone()),
            agents: Arc::new(StaticAgentDirectory::from_entries(config.agents.clone())),
            executor: Arc::new(HttpExecutionService::from_config(&config.remote)),
            human: Some(Arc::new(approvals.clone())),
        };
        let orchestrator = Arc::new(ExecutionOrchestrator::new(
            store,
            deps,
            config.runner.clone(),
        ));
        Self {
            config,
            orchestrator,
            event_bus,
            approvals,
            shutdown: CancellationToken::new(),
        }
    }

    /// Open (or create) the SQLite store named in the config.
    pub async fn new(config: Config) -> Result<Self> {
        let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
        let path = expand_home(&config.store.path, &home);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let store = SqliteExecutionStore::new(&path)
            .await
            .with_context(|| format!("failed to open execution store at {}", path.display()))?;
        info!(path = %path.display(), "execution store opened");
        Ok(Self::with_store(config, Arc::new(store)))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn orchestrator(&self) -> &Arc<ExecutionOrchestrator> {
        &self.orchestrator
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.event_bus
    }

    pub fn approvals(&self) -> &ApprovalDesk {
        &self.approvals
    }

    /// Returns a token that stops [`Daemon::run`] when cancelled.
    pub fn shutdown_handle(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Recover, then serve until shutdown.
    pub async fn run(&self) -> Result<()> {
        let recovered = self
            .orchestrator
            .recover_interrupted()
            .await
            .context("failed to recover interrupted executions")?;
        info!(
            recovered = recovered.len(),
            agents = self.config.agents.len(),
            "daemon ready"
        );

        let events = self.event_bus.subscribe();
        let stop = self.shutdown.clone();
        let logger = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    event = events.recv_async() => match event {
                        Ok(event) => debug!(topic = %event.topic, payload = %event.payload, "lifecycle event"),
                        Err(_) => break,
                    },
                }
            }
        });

        self.shutdown.cancelled().await;
        info!("shutdown requested, stopping background activities");
        let stopped = self.orchestrator.shutdown().await;
        logger.await.ok();
        info!(stopped, "daemon stopped");
        Ok(())
    }
}
