//! Per-run context passed explicitly to every engine call

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

/// Namespace prefix under which runs keep their artifacts
pub const RUNS_NAMESPACE: &str = "runs";

/// Identity and control handle of one suite run.
///
/// Each run owns its working namespace, so concurrent runs never share
/// captures, diffs or reports.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    cancel: CancellationToken,
}

impl RunContext {
    pub fn new() -> Self {
        Self::with_cancel(CancellationToken::new())
    }

    /// Context driven by an externally owned token (Ctrl-C, HTTP abort)
    pub fn with_cancel(cancel: CancellationToken) -> Self {
        let started_at = Utc::now();
        Self {
            run_id: format!(
                "{}-{}",
                started_at.format("%Y%m%dT%H%M%SZ"),
                &uuid::Uuid::new_v4().simple().to_string()[..8]
            ),
            started_at,
            cancel,
        }
    }

    /// Blob namespace holding this run's artifacts
    pub fn namespace(&self) -> String {
        format!("{}/{}", RUNS_NAMESPACE, self.run_id)
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }
}

impl Default for RunContext {
    fn default() -> Self {
        Self::new()
    }
}
