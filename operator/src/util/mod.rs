use std::time::Duration;

#[cfg(feature = "metrics")]
pub mod metrics;
pub mod patch;

mod error;

pub use error::*;

/// Name of the kubernetes resource manager.
pub(crate) const MANAGER_NAME: &str = "hibernator-controller";

/// Requeue while a stage has unfilled concurrency slots.
pub(crate) const REQUEUE_DURING_STAGE: Duration = Duration::from_secs(5);
/// Requeue while runner jobs are in flight.
pub(crate) const REQUEUE_ON_EXECUTION: Duration = Duration::from_secs(10);
/// Requeue after a schedule evaluation failure.
pub(crate) const REQUEUE_ON_SCHEDULE_ERROR: Duration = Duration::from_secs(180);
/// Requeue while an exception is near its boundary.
pub(crate) const REQUEUE_FOR_SCHEDULE_EXCEPTION: Duration = Duration::from_secs(60);
/// Requeue while suspended or parked in Hibernated.
pub(crate) const REQUEUE_WHILE_PARKED: Duration = Duration::from_secs(300);

/// Short stable digest used to truncate over-long job names deterministically.
pub fn hash_suffix(input: &str) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    let result = hasher.finalize();
    hex::encode(result)[..8].to_string()
}
