pub mod advisor;
pub mod arbiter;
pub mod executor;
pub mod sync;

pub use advisor::{Advisor, AdvisorHandle, AdvisorSettings, FeedKey, RestoreReport};
pub use arbiter::{ActionArbitrator, Submission};
pub use executor::{TraderCommand, TraderExecutor};
pub use sync::{DoneOutcome, SyncScope, SyncTracker};
