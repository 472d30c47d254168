//! # Call Orchestration
//!
//! Reacts to the telephony event stream and drives every customer call from
//! origination to its outcome.
//!
//! ```text
//! initiated ─▶ ringing ─▶ answered ─▶ matched ─▶ bridged ─▶ completed
//!     │           │          │           │
//!     └───────────┴──────────┴───────────┴──▶ failed / abandoned
//! ```
//!
//! - [`calls`]: the attempt state machine and the in-flight tracker
//! - [`matcher`]: on answer, claims exactly one ready agent and bridges the
//!   customer into that agent's standing bridge, or abandons the call
//! - [`events`]: routes gateway events to the matcher, the session lifecycle
//!   or call finalization
//!
//! Events of one channel are handled in order by one worker; duplicated
//! events find the attempt already moved on and are dropped by the
//! compare-and-swap in [`calls::CallTracker::advance`].

pub mod calls;
pub mod events;
pub mod matcher;

pub use calls::{AttemptState, CallOutcome, CallTracker, DialAttempt};
