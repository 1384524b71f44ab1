use crate::config::Config;
use crate::correlator::{CallCorrelator, CorrelatorConfig};
use crate::identity::IdentityResolver;
use crate::publisher::{amqp::AmqpPublisher, TransactionPublisher};
use crate::server::{PacketHandler, Server, ServerBuilder};
use crate::state::{create_store, StateStore};
use anyhow::{anyhow, Result};
use std::sync::Arc;
use tokio::select;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub struct App {
    pub config: Arc<Config>,
    pub store: Arc<dyn StateStore>,
    pub publisher: Arc<dyn TransactionPublisher>,
    pub token: CancellationToken,
    server: Server,
}

pub struct AppBuilder {
    config: Option<Config>,
    store: Option<Arc<dyn StateStore>>,
    publisher: Option<Arc<dyn TransactionPublisher>>,
    cancel_token: Option<CancellationToken>,
}

impl Default for AppBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl AppBuilder {
    pub fn new() -> Self {
        Self {
            config: None,
            store: None,
            publisher: None,
            cancel_token: None,
        }
    }

    pub fn with_config(mut self, config: Config) -> Self {
        self.config = Some(config);
        self
    }

    /// Overrides the store selected by `state_manager`.
    pub fn with_store(mut self, store: Arc<dyn StateStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Overrides the AMQP publisher built from `messagebus_uri`.
    pub fn with_publisher(mut self, publisher: Arc<dyn TransactionPublisher>) -> Self {
        self.publisher = Some(publisher);
        self
    }

    pub fn with_cancel_token(mut self, token: CancellationToken) -> Self {
        self.cancel_token = Some(token);
        self
    }

    /// Validates the configuration and binds the listeners; nothing is
    /// connected until [`App::run`].
    pub async fn build(self) -> Result<App> {
        let config = Arc::new(self.config.unwrap_or_default());
        let token = self.cancel_token.unwrap_or_default();

        let resolver = IdentityResolver::new(&config.identity)?;
        let store = match self.store {
            Some(store) => store,
            None => create_store(&config.state_manager)?,
        };
        let publisher = match self.publisher {
            Some(publisher) => publisher,
            None => Arc::new(AmqpPublisher::new(config.messagebus_uri.clone())),
        };

        let correlator = CallCorrelator::new(
            CorrelatorConfig::from(config.as_ref()),
            store.clone(),
            publisher.clone(),
        );
        let server = ServerBuilder::new()
            .with_udp_addr(config.udp_addr())
            .with_tcp_addr(config.tcp_addr())
            .with_handler(Arc::new(PacketHandler::new(resolver, correlator)))
            .with_cancel_token(token.child_token())
            .build()
            .await?;

        Ok(App {
            config,
            store,
            publisher,
            token,
            server,
        })
    }
}

impl App {
    pub fn server(&self) -> &Server {
        &self.server
    }

    /// Connects the state store and the publisher, then serves until the
    /// token is cancelled. Connection failures are fatal.
    pub async fn run(self) -> Result<()> {
        let App {
            store,
            publisher,
            token,
            server,
            ..
        } = self;

        store
            .connect()
            .await
            .map_err(|e| anyhow!("unable to connect the {} state store: {}", store.name(), e))?;
        if let Err(e) = publisher.connect().await {
            close_store(store.as_ref()).await;
            return Err(anyhow!("unable to connect the message bus: {}", e));
        }
        info!("rating agent started");

        let result = select! {
            r = server.serve() => r,
            _ = token.cancelled() => {
                info!("application shutting down due to cancellation");
                Ok(())
            }
        };
        token.cancel();

        if let Err(e) = publisher.close().await {
            warn!("error closing the message bus connection: {}", e);
        }
        close_store(store.as_ref()).await;
        result
    }
}

async fn close_store(store: &dyn StateStore) {
    if let Err(e) = store.close().await {
        warn!("error closing the {} state store: {}", store.name(), e);
    }
}
