//! Insight engine: lets a backend hand open-ended business questions to a text
//! model that can call a small, auditable set of tools (sandboxed code, reports,
//! anomaly scans, chart requests) over a bounded number of turns.

pub mod insight;
pub mod shared;

pub use insight::conversation::{ConversationDriver, MAX_TURNS};
pub use shared::models::{ChartCommand, FinalResponse};
