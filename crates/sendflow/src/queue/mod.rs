pub mod backoff;
pub mod delivery;
pub mod error_codes;
pub mod model;
pub mod payload;
pub mod processor;
pub mod repo;
pub mod store;

pub use delivery::{DeliveryClient, DeliveryResult, GraphApiClient};
pub use model::{NewQueueItem, QueueItem, QueueStatus, SendOutcome};
pub use processor::{ProcessorConfig, QueueProcessor, RunSummary};
pub use repo::QueueRepo;
pub use store::QueueStore;
