//! The iterative research loop
//!
//! - `knowledge`: findings, sources and open questions of one session
//! - `planner`: decides the next batch of actions
//! - `synthesizer`: merges tool results into the knowledge state
//! - `gap`: convergence verdicts and the effort policy state machine
//! - `steering`: operator guidance delivered at loop boundaries
//! - `controller`: orchestrates a session from start to report

pub mod controller;
pub mod gap;
pub mod history;
pub mod knowledge;
pub mod planner;
pub mod prompts;
pub mod report;
pub mod steering;
pub mod synthesizer;
pub mod types;

pub use controller::{ResearchController, ResearchRun};
pub use gap::{ConvergenceTracker, GapAnalyzer};
pub use history::AuditTrail;
pub use knowledge::{content_hash, dedup_key, KnowledgeSnapshot, KnowledgeState};
pub use planner::{PlanOutcome, PlanRequest, QueryPlanner};
pub use steering::{steering_channel, SteeringHandle, SteeringInbox};
pub use synthesizer::{SynthesisOutcome, Synthesizer};
pub use types::*;
