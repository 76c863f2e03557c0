//! # Sync Service
//!
//! Wires the stores, router, state machine, download queue and expiration
//! sweeper from a [`CoreConfig`] and owns their background tasks.
//!
//! ## Usage
//!
//! ```ignore
//! let service = SyncService::builder(config)
//!     .transport(transport)
//!     .build()
//!     .await?;
//!
//! service.start().await?;
//! service.dispatch(r#"{"topic":"WATCH","filePath":"bucket/a.png","from":"player"}"#);
//! // ...
//! service.shutdown().await;
//! ```

use core_runtime::config::CoreConfig;
use core_runtime::events::EventBus;
use parking_lot::Mutex;
use sqlx::SqlitePool;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::broadcast::{BroadcastRouter, MessageTransport};
use crate::credentials::{CredentialProvider, HttpCredentialProvider};
use crate::download_queue::DownloadQueue;
use crate::error::{Result, SyncError};
use crate::expiration::ExpirationSweeper;
use crate::fetcher::FileFetcher;
use crate::messages::InboundMessage;
use crate::paths::CacheLayout;
use crate::repositories::{open_pool, Stores};
use crate::state_machine::SyncStateMachine;

pub struct SyncServiceBuilder {
    config: CoreConfig,
    transport: Option<Arc<dyn MessageTransport>>,
    pool: Option<SqlitePool>,
    credentials: Option<Arc<dyn CredentialProvider>>,
    events: Option<EventBus>,
}

impl SyncServiceBuilder {
    /// Transport carrying outbound messages. Required.
    pub fn transport(mut self, transport: Arc<dyn MessageTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Use an existing pool instead of opening `config.database_path`.
    pub fn pool(mut self, pool: SqlitePool) -> Self {
        self.pool = Some(pool);
        self
    }

    /// Replace the HTTP credential exchange.
    pub fn credentials(mut self, credentials: Arc<dyn CredentialProvider>) -> Self {
        self.credentials = Some(credentials);
        self
    }

    pub fn event_bus(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    pub async fn build(self) -> Result<SyncService> {
        let config = self.config;
        config.validate()?;

        let transport = self
            .transport
            .ok_or_else(|| SyncError::Config("A message transport is required".to_string()))?;

        let pool = match self.pool {
            Some(pool) => pool,
            None => open_pool(&config.database_path).await?,
        };
        let stores = Stores::sqlite(pool);
        stores.initialize().await?;

        let fs = config.file_system.clone();
        fs.create_dir_all(&config.cache_dir)
            .await
            .map_err(SyncError::io)?;
        fs.create_dir_all(&config.download_dir)
            .await
            .map_err(SyncError::io)?;

        let layout = CacheLayout::new(&config.cache_dir, &config.download_dir);
        let events = self.events.unwrap_or_default();

        let router = Arc::new(BroadcastRouter::new(
            stores.owners.clone(),
            transport.clone(),
            config.direct_channel_id.clone(),
            layout.clone(),
        ));

        let state_machine = Arc::new(SyncStateMachine::new(
            stores.clone(),
            router,
            transport,
            fs.clone(),
            layout.clone(),
            config.display_id.clone(),
            events.clone(),
        ));

        let credentials = self.credentials.unwrap_or_else(|| {
            Arc::new(HttpCredentialProvider::new(
                config.http_client.clone(),
                config.credential_endpoint.clone(),
            ))
        });

        let fetcher = Arc::new(FileFetcher::new(
            config.http_client.clone(),
            fs.clone(),
            config.scheduler.clone(),
            credentials,
            layout.clone(),
            config.download.clone(),
        ));

        let queue = Arc::new(DownloadQueue::new(
            stores.metadata.clone(),
            fetcher,
            state_machine.clone(),
            config.scheduler.clone(),
            config.download.clone(),
            events.clone(),
        ));

        let sweeper = Arc::new(ExpirationSweeper::new(
            stores.clone(),
            fs,
            layout,
            config.expiration.clone(),
            config.scheduler.clone(),
            events.clone(),
        ));

        info!(display_id = %config.display_id, "Sync service ready");

        Ok(SyncService {
            stores,
            state_machine,
            queue,
            sweeper,
            events,
            shutdown: CancellationToken::new(),
            compare_sent: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
        })
    }
}

/// The running sync daemon.
pub struct SyncService {
    stores: Stores,
    state_machine: Arc<SyncStateMachine>,
    queue: Arc<DownloadQueue>,
    sweeper: Arc<ExpirationSweeper>,
    events: EventBus,
    shutdown: CancellationToken,
    compare_sent: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SyncService {
    pub fn builder(config: CoreConfig) -> SyncServiceBuilder {
        SyncServiceBuilder {
            config,
            transport: None,
            pool: None,
            credentials: None,
            events: None,
        }
    }

    /// Send the startup watchlist compare and start the background loops.
    ///
    /// The compare goes out once per service. Calling `start` again is a
    /// no-op.
    pub async fn start(&self) -> Result<()> {
        if !self.compare_sent.swap(true, Ordering::SeqCst) {
            if let Err(compare_error) = self.state_machine.send_watchlist_compare().await {
                self.compare_sent.store(false, Ordering::SeqCst);
                return Err(compare_error);
            }
        }

        let mut tasks = self.tasks.lock();
        if !tasks.is_empty() {
            return Ok(());
        }

        tasks.push(tokio::spawn(
            self.queue.clone().run(self.shutdown.child_token()),
        ));
        tasks.push(tokio::spawn(
            self.sweeper.clone().run_epoch_ticker(self.shutdown.child_token()),
        ));
        tasks.push(tokio::spawn(
            self.sweeper.clone().run_sweeper(self.shutdown.child_token()),
        ));

        info!("Sync service started");
        Ok(())
    }

    /// Parse and apply a raw inbound message on its own task.
    ///
    /// Failures are logged, never returned. Returns the task handle, or
    /// `None` when the message could not be parsed.
    pub fn dispatch(&self, raw: &str) -> Option<JoinHandle<()>> {
        let message = match InboundMessage::from_json(raw) {
            Ok(message) => message,
            Err(parse_error) => {
                warn!(error = %parse_error, "Rejected inbound message");
                return None;
            }
        };

        let state_machine = self.state_machine.clone();
        Some(tokio::spawn(async move {
            let topic = message.topic();
            let file_path = message.file_path().to_string();
            if let Err(handle_error) = state_machine.handle(message).await {
                error!(
                    topic,
                    file_path = %file_path,
                    error = %handle_error,
                    "Failed to handle message"
                );
            }
        }))
    }

    /// Apply a parsed message and wait for it.
    pub async fn handle(&self, message: InboundMessage) -> Result<()> {
        self.state_machine.handle(message).await
    }

    /// Stop the background loops and wait for them to finish.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(join_error) = task.await {
                error!(error = %join_error, "Background task failed");
            }
        }
        info!("Sync service stopped");
    }

    pub fn stores(&self) -> &Stores {
        &self.stores
    }

    pub fn state_machine(&self) -> &Arc<SyncStateMachine> {
        &self.state_machine
    }

    pub fn download_queue(&self) -> &Arc<DownloadQueue> {
        &self.queue
    }

    pub fn sweeper(&self) -> &Arc<ExpirationSweeper> {
        &self.sweeper
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }
}
