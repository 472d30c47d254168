use thiserror::Error;

use crate::gateway::GatewayError;

/// Dialer engine errors
#[derive(Error, Debug)]
pub enum DialerError {
    /// Database errors
    #[error("Database error: {0}")]
    Database(#[from] anyhow::Error),

    /// Telephony control plane errors
    #[error("Gateway error: {0}")]
    Gateway(#[from] GatewayError),

    /// Agent session errors
    #[error("Agent error: {0}")]
    Agent(String),

    /// Hopper errors
    #[error("Hopper error: {0}")]
    Hopper(String),

    /// Call/agent matching errors
    #[error("Matching error: {0}")]
    Matching(String),

    /// Disposition errors
    #[error("Disposition error: {0}")]
    Disposition(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Already exists
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// A state machine refused the requested transition
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Timeout
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl DialerError {
    /// Create a new Agent error
    pub fn agent<S: Into<String>>(msg: S) -> Self {
        Self::Agent(msg.into())
    }

    /// Create a new Hopper error
    pub fn hopper<S: Into<String>>(msg: S) -> Self {
        Self::Hopper(msg.into())
    }

    /// Create a new Matching error
    pub fn matching<S: Into<String>>(msg: S) -> Self {
        Self::Matching(msg.into())
    }

    /// Create a new Disposition error
    pub fn disposition<S: Into<String>>(msg: S) -> Self {
        Self::Disposition(msg.into())
    }

    /// Create a new Config error
    pub fn config<S: Into<String>>(msg: S) -> Self {
        Self::Config(msg.into())
    }

    /// Create a new NotFound error
    pub fn not_found<S: Into<String>>(msg: S) -> Self {
        Self::NotFound(msg.into())
    }

    /// Create a new AlreadyExists error
    pub fn already_exists<S: Into<String>>(msg: S) -> Self {
        Self::AlreadyExists(msg.into())
    }

    /// Create a new InvalidState error
    pub fn invalid_state<S: Into<String>>(msg: S) -> Self {
        Self::InvalidState(msg.into())
    }

    /// Create a new Timeout error
    pub fn timeout<S: Into<String>>(msg: S) -> Self {
        Self::Timeout(msg.into())
    }

    /// Create a new Internal error
    pub fn internal<S: Into<String>>(msg: S) -> Self {
        Self::Internal(msg.into())
    }

    /// Campaign-level failures that should pause the campaign instead of
    /// being retried on the next tick.
    pub fn is_fatal_config(&self) -> bool {
        match self {
            Self::Config(_) => true,
            Self::Gateway(e) => e.is_fatal(),
            _ => false,
        }
    }
}

/// Result type for dialer operations
pub type Result<T> = std::result::Result<T, DialerError>;
