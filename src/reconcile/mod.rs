//! The control loop that keeps every subscription's fleet-side state in line
//! with the store: collect counters, aggregate usage, converge clients.

pub mod engine;
pub mod scheduler;
pub mod state;

pub use engine::{quota_hint, EngineSettings, ReconcileEngine, ReconcileError, TickReport};
pub use scheduler::ReconcileScheduler;
pub use state::{SubscriptionState, SuspendReason};
