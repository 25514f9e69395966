pub mod model;
pub mod repo;
pub mod roster;
pub mod scheduler;
pub mod store;

/// Advisory lock key shared by every assignment run.
pub const DEFAULT_LOCK_KEY: i64 = 0x5EED_A551_6000;

pub use model::{AgentProfile, AssignFailure, AssignSummary, Conversation, RunStatus};
pub use repo::AssignmentRepo;
pub use scheduler::{AssignmentScheduler, SchedulerConfig};
pub use store::{AssignmentStore, RunLease};
