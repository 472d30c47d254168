//! # Dial-Ratio Scheduler
//!
//! One global loop walks the active campaigns every tick. For each
//! progressive or predictive campaign it refills the hopper, works out how
//! many calls the ready agents can absorb and originates that many.
//!
//! Campaign pacing is read from the store at the start of every tick, so
//! ratio bounds, thresholds and limits change without a restart. Predictive
//! campaigns tune their own ratio from the abandon rate after the target for
//! the current tick is computed; progressive campaigns always dial one call
//! per ready agent.
//!
//! Gateway failures during a tick are compensated locally and never stop the
//! loop. A campaign whose telephony server is not configured is paused and
//! reported on the health surface.

pub mod dialer;
pub mod pacing;

pub use pacing::{compute_dial_target, AbandonWindow, RatioStepPolicy};
