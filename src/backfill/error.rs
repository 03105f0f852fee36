//! Engine error taxonomy

use uuid::Uuid;

use crate::backfill::store::StoreError;
use crate::backfill::types::{BackfillStrategy, JobStatus};

#[derive(Debug, Clone, thiserror::Error)]
pub enum BackfillError {
    #[error("connector '{0}' is not registered as supported")]
    UnsupportedConnector(String),
    #[error("connector '{connector}' does not support strategy '{strategy}'")]
    UnsupportedStrategy {
        connector: String,
        strategy: BackfillStrategy,
    },
    #[error("concurrency limit of {limit} running jobs reached")]
    ConcurrencyLimitExceeded { limit: usize },
    #[error("job {0} is still winding down its previous run, retry shortly")]
    PreviousRunActive(Uuid),
    #[error("cannot {action} a job in state '{from}'")]
    InvalidStateTransition {
        from: JobStatus,
        action: &'static str,
    },
    #[error("job {0} not found")]
    JobNotFound(Uuid),
    #[error("downtime record {0} not found")]
    DowntimeNotFound(Uuid),
    #[error("downtime record {0} is already resolved")]
    DowntimeAlreadyResolved(Uuid),
    #[error("invalid window: {0}")]
    InvalidWindow(String),
    #[error("window starts before the {max_lookback_hours}h lookback of connector '{connector}'")]
    WindowExceedsLookback {
        connector: String,
        max_lookback_hours: u32,
    },
    #[error("job {job_id} already used {max_retries} retries")]
    RetryLimitReached { job_id: Uuid, max_retries: u32 },
    #[error(transparent)]
    Storage(#[from] StoreError),
}
