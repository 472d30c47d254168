//! # Autodialer Engine
//!
//! Outbound predictive dialing for a call center. The engine decides how many
//! customer calls to place for a campaign, places them through an external
//! telephony server, and when a customer answers hands the call to exactly one
//! ready agent sitting in a standing conference bridge.
//!
//! ## Features
//!
//! - **Lead Hopper**: short per-campaign queue of dialable leads with an
//!   atomic pop, the only duplicate-dial guard
//! - **Dial-Ratio Scheduler**: progressive and predictive pacing, self-tuning
//!   the ratio from the rolling abandon rate
//! - **Call-Agent Matching**: longest-idle-first selection with a
//!   compare-and-swap claim per agent
//! - **Agent Sessions**: login into a standing bridge, wrap-up, availability,
//!   deferred logout
//! - **Dispositions**: lead outcomes, callbacks, do-not-call, sales
//! - **Session Reaper**: heartbeat, stuck-state and lost-call cleanup, lead
//!   recycling
//! - **Telephony Gateway**: Asterisk ARI client and an in-process loopback
//! - **Persistence**: SQLite through sqlx
//!
//! ## Architecture
//!
//! - [`engine`]: [`DialerEngine`], the shared state every loop works on
//! - [`hopper`], [`scheduler`], [`orchestrator`], [`agent`], [`disposition`],
//!   [`reaper`]: engine behavior
//! - [`gateway`]: telephony control plane clients
//! - [`database`]: campaigns, leads, call records, dispositions
//! - [`api`]: programmatic and HTTP agent API
//! - [`server`]: runs the loops
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use autodialer_engine::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> autodialer_engine::error::Result<()> {
//!     let mut server = DialerServerBuilder::new()
//!         .with_config(EngineConfig::for_testing())
//!         .with_in_memory_database()
//!         .build()
//!         .await?;
//!
//!     let campaign = server
//!         .engine()
//!         .database()
//!         .create_campaign(&Campaign::new("spring-renewals"))
//!         .await?;
//!     println!("Campaign {} created", campaign);
//!
//!     server.start().await?;
//!     server.run().await
//! }
//! ```

// Core modules
pub mod config;
pub mod error;
pub mod logging;
pub mod types;

// Dialer functionality
pub mod agent;
pub mod disposition;
pub mod engine;
pub mod hopper;
pub mod orchestrator;
pub mod reaper;
pub mod scheduler;
pub mod stats;

// External interfaces
pub mod api;
pub mod gateway;
pub mod notify;
pub mod server;

// Database integration
pub mod database;

pub use config::EngineConfig;
pub use engine::DialerEngine;
pub use error::{DialerError, Result};

/// Common imports
pub mod prelude {
    pub use crate::{DialerEngine, DialerError, EngineConfig, Result};

    pub use crate::config::{
        ApiConfig, DatabaseConfig, GatewayConfig, GatewayKind, GeneralConfig, LogConfig,
        MatcherConfig, ReaperConfig, RecycleConfig, RecycleRule, SchedulerConfig,
    };

    pub use crate::agent::{AgentSession, LoginRequest, SessionState};
    pub use crate::api::AgentApi;
    pub use crate::database::campaigns::{Campaign, CampaignStatus, DialMethod};
    pub use crate::database::dispositions::Disposition;
    pub use crate::database::leads::{Lead, LeadStatus, NewLead};
    pub use crate::database::DatabaseManager;
    pub use crate::disposition::{DispositionRequest, DispositionResult, RecyclePolicy};
    pub use crate::engine::CampaignHealth;
    pub use crate::gateway::loopback::LoopbackGateway;
    pub use crate::gateway::{GatewayEvent, GatewayPool, HangupCause, TelephonyGateway};
    pub use crate::notify::{Audience, BroadcastNotifier, DialerNotification, NotificationSink};
    pub use crate::orchestrator::{AttemptState, CallOutcome};
    pub use crate::reaper::ReaperReport;
    pub use crate::server::{DialerServer, DialerServerBuilder};
    pub use crate::stats::{CampaignStats, DialerStats};
    pub use crate::types::{AgentId, BridgeId, CallId, CampaignId, ChannelId, LeadId};
}
