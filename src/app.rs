use std::net::SocketAddr;
use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::chain::{ChainClient, LcdClient};
use crate::config::Settings;
use crate::engine::Aggregator;
use crate::errors::{AppError, AppResult};
use crate::hub::ConnectionHub;
use crate::marketdata::PriceStore;
use crate::server::Server;

pub struct App {
    settings: Settings,
    chain_endpoint: String,
}

/// A started service; resolves once both the server and the aggregator stop.
pub struct RunningApp {
    pub local_addr: SocketAddr,
    pub store: Arc<PriceStore>,
    pub hub: Arc<ConnectionHub>,
    task: JoinHandle<AppResult<()>>,
}

impl RunningApp {
    pub async fn wait(self) -> AppResult<()> {
        self.task
            .await
            .map_err(|e| AppError::Other(format!("service task failed: {e}")))?
    }
}

impl App {
    pub fn new(settings: Settings, chain_endpoint: impl Into<String>) -> Self {
        Self {
            settings,
            chain_endpoint: chain_endpoint.into(),
        }
    }

    /// Validates configuration, connects to the chain and serves until
    /// `shutdown` fires. Only startup failures are returned as errors.
    pub async fn run(self, shutdown: CancellationToken) -> AppResult<()> {
        self.settings.validate()?;
        let client =
            LcdClient::connect(&self.chain_endpoint, &self.settings.chain.headers).await?;
        let running = Self::start(&self.settings, Arc::new(client), shutdown).await?;
        running.wait().await
    }

    /// Wires store, hub, aggregator and server around an existing chain client.
    pub async fn start(
        settings: &Settings,
        client: Arc<dyn ChainClient>,
        shutdown: CancellationToken,
    ) -> AppResult<RunningApp> {
        let specs = settings.pair_specs()?;
        let aggregator_config = settings.aggregator_config()?;
        let hub_config = settings.hub_config()?;
        let server_config = settings.server_config()?;

        let store = Arc::new(PriceStore::new(specs.iter().map(|s| s.pair.clone())));
        let hub = Arc::new(ConnectionHub::new(hub_config, Arc::clone(&store)));
        let server = Server::bind(server_config, Arc::clone(&hub), Arc::clone(&store)).await?;
        let local_addr = server.local_addr()?;

        let aggregator = Aggregator::new(
            client,
            Arc::clone(&store),
            Arc::clone(&hub),
            specs,
            aggregator_config,
        );
        info!(pairs = store.len(), %local_addr, "starting price feed");

        let aggregator_task = tokio::spawn(aggregator.run(shutdown.clone()));
        let task = tokio::spawn(async move {
            let served = server.run(shutdown.clone()).await;
            // the aggregator must not outlive the server
            shutdown.cancel();
            if let Err(e) = aggregator_task.await {
                warn!(error = %e, "aggregator task failed");
            }
            served
        });

        Ok(RunningApp {
            local_addr,
            store,
            hub,
            task,
        })
    }
}
