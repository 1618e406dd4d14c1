pub mod bucket;
pub mod executor;
pub mod health;
pub mod ledger;
pub mod session;
pub mod store;

pub use executor::{ProgressEvent, ProgressTx, RetryPolicy, SequenceExecutor, SequenceReport};
pub use session::{DeviceSession, FeedContext, TriggerReport};

use serial_link::TransportError;
use store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum IntakeError {
    #[error("a sequence is already running on {0}")]
    Busy(String),
    #[error("all buckets are full; the unit needs collection")]
    AllBucketsFull,
    #[error("daily limit of {cap_kg} kg already reached")]
    DailyCapReached { cap_kg: f64 },
    #[error("cancelled")]
    Cancelled,
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl IntakeError {
    /// Terminal business states the caller should surface instead of retrying.
    pub fn is_business(&self) -> bool {
        matches!(
            self,
            IntakeError::AllBucketsFull | IntakeError::DailyCapReached { .. }
        )
    }
}
