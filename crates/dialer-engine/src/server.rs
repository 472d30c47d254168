//! # Dialer Server
//!
//! Runs the engine's loops as tokio tasks:
//!
//! - one scheduler loop ticking every active campaign
//! - per telephony server, one reader task fanning events out to
//!   `matcher.event_workers` worker tasks, sharded by channel id so the
//!   events of a channel stay in order
//! - one reaper loop
//! - the HTTP API, when enabled
//!
//! ```rust,no_run
//! use autodialer_engine::prelude::*;
//!
//! # async fn example() -> autodialer_engine::error::Result<()> {
//! let mut server = DialerServerBuilder::new()
//!     .with_config(EngineConfig::for_testing())
//!     .with_in_memory_database()
//!     .build()
//!     .await?;
//!
//! server.start().await?;
//! // ... runs until stopped
//! server.stop().await?;
//! # Ok(())
//! # }
//! ```

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::api::{self, AgentApi};
use crate::config::EngineConfig;
use crate::database::DatabaseManager;
use crate::engine::DialerEngine;
use crate::error::{DialerError, Result};
use crate::gateway::{GatewayEvent, GatewayPool, TelephonyGateway};
use crate::notify::BroadcastNotifier;

/// A complete dialer: engine, background loops and API
pub struct DialerServer {
    engine: Arc<DialerEngine>,
    api: AgentApi,
    notifier: Arc<BroadcastNotifier>,
    config: EngineConfig,

    scheduler_handle: Option<JoinHandle<()>>,
    reaper_handle: Option<JoinHandle<()>>,
    event_handles: Vec<JoinHandle<()>>,
    http_handle: Option<JoinHandle<()>>,
}

impl DialerServer {
    /// Create a server from configuration, opening the database and
    /// connecting the configured telephony servers
    pub async fn new(config: EngineConfig) -> Result<Self> {
        config.validate().map_err(DialerError::config)?;

        let db = if config.database.path == ":memory:" {
            DatabaseManager::new_in_memory().await?
        } else {
            DatabaseManager::new(&config.database).await?
        };
        let gateways = GatewayPool::from_config(&config.gateways)?;
        Ok(Self::with_parts(config, db, gateways, Arc::new(BroadcastNotifier::default())))
    }

    /// Assemble a server from already built parts
    pub fn with_parts(
        config: EngineConfig,
        db: DatabaseManager,
        gateways: GatewayPool,
        notifier: Arc<BroadcastNotifier>,
    ) -> Self {
        info!("🚀 Creating dialer engine on node {}", config.general.node_name);
        let engine = Arc::new(DialerEngine::new(
            config.clone(),
            db,
            gateways,
            notifier.clone(),
        ));
        let api = AgentApi::new(engine.clone());

        Self {
            engine,
            api,
            notifier,
            config,
            scheduler_handle: None,
            reaper_handle: None,
            event_handles: Vec::new(),
            http_handle: None,
        }
    }

    /// Start every loop
    pub async fn start(&mut self) -> Result<()> {
        for gateway in self.engine.gateways().all() {
            self.start_event_consumer(gateway).await?;
        }

        let engine = self.engine.clone();
        let tick = self.config.scheduler.tick_interval();
        self.scheduler_handle = Some(tokio::spawn(async move {
            Self::scheduler_loop(engine, tick).await;
        }));
        info!("✅ Started scheduler ticking every {:?}", tick);

        let engine = self.engine.clone();
        let period = self.config.reaper.interval();
        self.reaper_handle = Some(tokio::spawn(async move {
            Self::reaper_loop(engine, period).await;
        }));
        info!("✅ Started session reaper every {:?}", period);

        if self.config.api.enabled {
            let addr = self.config.api.bind_addr;
            let listener = tokio::net::TcpListener::bind(addr)
                .await
                .map_err(|e| DialerError::config(format!("cannot bind API on {}: {}", addr, e)))?;
            let app = api::router(self.api.clone());
            self.http_handle = Some(tokio::spawn(async move {
                if let Err(e) = axum::serve(listener, app).await {
                    error!("API server failed: {}", e);
                }
            }));
            info!("✅ Agent API listening on {}", addr);
        }

        Ok(())
    }

    /// Stop every loop. Calls in flight are left to the telephony server.
    pub async fn stop(&mut self) -> Result<()> {
        info!("🛑 Stopping dialer server...");

        let handles = self
            .scheduler_handle
            .take()
            .into_iter()
            .chain(self.reaper_handle.take())
            .chain(self.http_handle.take())
            .chain(self.event_handles.drain(..));
        for handle in handles {
            handle.abort();
            let _ = handle.await;
        }

        info!("✅ Dialer server stopped");
        Ok(())
    }

    /// Run until the task is cancelled, logging a status line every minute
    pub async fn run(&self) -> Result<()> {
        info!("📞 Dialer server is running");

        loop {
            sleep(Duration::from_secs(60)).await;

            let stats = self.engine.stats();
            info!(
                "📊 Stats - Sessions: {}, Ready: {}, Calls in flight: {}",
                stats.active_sessions, stats.ready_agents, stats.calls_in_flight
            );
        }
    }

    pub fn api(&self) -> &AgentApi {
        &self.api
    }

    pub fn engine(&self) -> &Arc<DialerEngine> {
        &self.engine
    }

    /// Notification feed for agent desktops and wallboards
    pub fn notifier(&self) -> &Arc<BroadcastNotifier> {
        &self.notifier
    }

    async fn start_event_consumer(&mut self, gateway: Arc<dyn TelephonyGateway>) -> Result<()> {
        let server_id = gateway.server_id().to_string();
        let mut events = gateway.events().await?;

        let workers = self.config.matcher.event_workers.max(1);
        let queue_size = self.config.matcher.event_queue_size.max(1);
        let mut shards = Vec::with_capacity(workers);

        for worker in 0..workers {
            let (tx, mut rx) = mpsc::channel::<GatewayEvent>(queue_size);
            let engine = self.engine.clone();
            let server_id = server_id.clone();
            self.event_handles.push(tokio::spawn(async move {
                debug!("Event worker {} for {} started", worker, server_id);
                while let Some(event) = rx.recv().await {
                    engine.handle_gateway_event(&server_id, event).await;
                }
            }));
            shards.push(tx);
        }

        let reader_server = server_id.clone();
        self.event_handles.push(tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let shard = shard_for(&event, shards.len());
                if shards[shard].send(event).await.is_err() {
                    warn!("Event worker {} for {} is gone", shard, reader_server);
                    break;
                }
            }
            warn!("📡 Event stream of {} closed", reader_server);
        }));

        info!("✅ Consuming events of {} with {} worker(s)", server_id, workers);
        Ok(())
    }

    async fn scheduler_loop(engine: Arc<DialerEngine>, tick: Duration) {
        info!("🔄 Starting dial scheduler");
        let mut interval = interval(tick);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            interval.tick().await;
            match engine.run_scheduler_tick().await {
                Ok(0) => {}
                Ok(placed) => debug!("📞 Tick placed {} call(s)", placed),
                Err(e) => error!("Scheduler tick failed: {}", e),
            }
        }
    }

    async fn reaper_loop(engine: Arc<DialerEngine>, period: Duration) {
        info!("🧹 Starting session reaper");
        let mut interval = interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            interval.tick().await;
            if let Err(e) = engine.run_reaper_sweep().await {
                error!("Reaper sweep failed: {}", e);
            }
        }
    }
}

/// Worker index for an event. Channel events always land on the same
/// worker; endpoint events go to the first.
fn shard_for(event: &GatewayEvent, workers: usize) -> usize {
    match event.channel_id() {
        Some(channel_id) => {
            let mut hasher = DefaultHasher::new();
            channel_id.hash(&mut hasher);
            (hasher.finish() % workers as u64) as usize
        }
        None => 0,
    }
}

/// Builder for [`DialerServer`]
pub struct DialerServerBuilder {
    config: Option<EngineConfig>,
    db_path: Option<String>,
    gateways: Vec<Arc<dyn TelephonyGateway>>,
}

impl DialerServerBuilder {
    pub fn new() -> Self {
        Self {
            config: None,
            db_path: None,
            gateways: Vec::new(),
        }
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn with_in_memory_database(mut self) -> Self {
        self.db_path = Some(":memory:".to_string());
        self
    }

    /// Use this gateway instead of the configured ones
    pub fn with_gateway(mut self, gateway: Arc<dyn TelephonyGateway>) -> Self {
        self.gateways.push(gateway);
        self
    }

    pub async fn build(self) -> Result<DialerServer> {
        let mut config = self
            .config
            .ok_or_else(|| DialerError::config("Configuration not provided"))?;
        if let Some(path) = self.db_path {
            config.database.path = path;
        }

        if self.gateways.is_empty() {
            return DialerServer::new(config).await;
        }

        config.validate().map_err(DialerError::config)?;
        let db = if config.database.path == ":memory:" {
            DatabaseManager::new_in_memory().await?
        } else {
            DatabaseManager::new(&config.database).await?
        };
        let gateways = self
            .gateways
            .into_iter()
            .fold(GatewayPool::new(), |pool, gateway| pool.with_gateway(gateway));
        Ok(DialerServer::with_parts(
            config,
            db,
            gateways,
            Arc::new(BroadcastNotifier::default()),
        ))
    }
}

impl Default for DialerServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}
