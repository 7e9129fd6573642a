//! Wiring of the long-running service.
//!
//! Builds the orchestrator and its collaborators from configuration, then runs
//! the HTTP intake, the message consumer and (optionally) the build poller
//! until shutdown.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use notify::Notifier;
use scm::GitHubProvider;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::ci::{
    run_server, FixOrchestrator, HttpTaskExecutor, MessageBus, MessageConsumer,
    OrchestratorSettings, ServerState,
};
use crate::config::RemediationConfig;
use crate::sensors::BuildPoller;
use crate::store::{self, Store};

/// Everything the service runs on.
pub struct Service {
    config: RemediationConfig,
    orchestrator: Arc<FixOrchestrator>,
    store: Arc<dyn Store>,
    provider: Arc<GitHubProvider>,
}

impl Service {
    /// Connect the store and build the HTTP clients.
    pub async fn build(config: RemediationConfig, notifier: Notifier) -> Result<Self> {
        let classifier = Arc::new(config.classifier()?);
        let store = store::open(&config.store)
            .await
            .context("Failed to open store")?;

        let provider = Arc::new(
            GitHubProvider::new(
                &config.github.api_url,
                config.github.token.clone(),
                Duration::from_secs(config.github.timeout_secs),
            )
            .context("Failed to build GitHub client")?,
        );
        let executor = Arc::new(
            HttpTaskExecutor::new(
                &config.task_service.url,
                config.task_service.api_key.clone(),
                Duration::from_secs(config.task_service.timeout_secs),
            )
            .context("Failed to build task service client")?,
        );

        let orchestrator = Arc::new(FixOrchestrator::new(
            classifier,
            store.clone(),
            executor,
            provider.clone(),
            Arc::new(notifier),
            OrchestratorSettings::from(&config),
        ));

        Ok(Self {
            config,
            orchestrator,
            store,
            provider,
        })
    }

    #[must_use]
    pub fn config(&self) -> &RemediationConfig {
        &self.config
    }

    #[must_use]
    pub fn orchestrator(&self) -> &Arc<FixOrchestrator> {
        &self.orchestrator
    }

    #[must_use]
    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// Poller over the configured repositories.
    #[must_use]
    pub fn poller(&self) -> BuildPoller {
        BuildPoller::new(
            self.config.poller.clone(),
            self.provider.clone(),
            self.orchestrator.clone(),
        )
    }

    /// Run intake, consumer and poller until `shutdown` fires.
    ///
    /// The consumer drains in-flight messages before this returns.
    pub async fn serve(&self, addr: &str, with_poller: bool, shutdown: CancellationToken) -> Result<()> {
        let (bus, receiver) = MessageBus::channel(self.config.consumer.queue_capacity);
        let consumer = Arc::new(MessageConsumer::new(
            self.orchestrator.clone(),
            bus.clone(),
            self.config.consumer.clone(),
        ));
        let consumer_task = tokio::spawn(consumer.run(receiver, shutdown.clone()));

        let poller_task = if with_poller && !self.config.poller.repositories.is_empty() {
            let mut poller = self.poller();
            let token = shutdown.clone();
            Some(tokio::spawn(async move { poller.run(token).await }))
        } else {
            info!("Build poller disabled");
            None
        };

        let state = Arc::new(ServerState {
            bus,
            store: self.store.clone(),
            patterns: self
                .orchestrator
                .classifier()
                .labels()
                .map(ToString::to_string)
                .collect(),
        });
        let served = run_server(state, addr, shutdown.clone()).await;

        // Server exit (clean or not) stops the other tasks.
        shutdown.cancel();
        if let Err(e) = consumer_task.await {
            error!(error = %e, "Message consumer task failed");
        }
        if let Some(task) = poller_task {
            match task.await {
                Ok(Err(e)) => error!("Build poller failed: {e}"),
                Err(e) => error!(error = %e, "Build poller task failed"),
                Ok(Ok(())) => {}
            }
        }

        served
    }
}
