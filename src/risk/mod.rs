//! Risk Management Module
//!
//! Pure validation of proposed position changes plus conviction-scaled
//! position sizing. No I/O and no suspension points; the orchestrator hands
//! in the book and account state explicitly.

mod manager;
mod sizer;

pub use manager::{Decision, DriftAction, DriftBreach, RiskConfig, RiskManager};
pub use sizer::{round_to_step, PositionSizer, SizerConfig};
