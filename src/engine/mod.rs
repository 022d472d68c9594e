mod error;
mod mutations;
mod queries;
mod rules;

pub use error::EngineError;
pub use crate::store::Deadline;

use std::sync::Arc;
use std::time::Duration;

use crate::model::*;
use crate::store::{ReservationLedger, ResourceDayRegistry, Store};

/// Orchestrates bookings against a resource-day registry and a reservation
/// ledger. Holds no locks of its own: every occupancy decision is made by the
/// ledger's conditional writes, so any number of tasks may share one engine.
pub struct BookingEngine {
    days: Arc<dyn ResourceDayRegistry>,
    ledger: Arc<dyn ReservationLedger>,
    op_timeout: Duration,
}

impl BookingEngine {
    pub fn new(
        days: Arc<dyn ResourceDayRegistry>,
        ledger: Arc<dyn ReservationLedger>,
        op_timeout: Duration,
    ) -> Self {
        Self {
            days,
            ledger,
            op_timeout,
        }
    }

    /// Engine over a single store serving as both registry and ledger.
    pub fn with_store(store: Store, op_timeout: Duration) -> Self {
        Self::new(Arc::new(store.clone()), Arc::new(store), op_timeout)
    }

    /// Deadline for an operation starting now, from the configured timeout.
    pub fn deadline(&self) -> Deadline {
        Deadline::after(self.op_timeout)
    }

    async fn resolve_day(
        &self,
        day: &DayRef,
        deadline: Deadline,
    ) -> Result<ResourceDay, EngineError> {
        Ok(deadline.run(self.days.get(day)).await??)
    }
}

/// Count a failed operation before handing the error back.
fn observe<T>(op: &'static str, result: Result<T, EngineError>) -> Result<T, EngineError> {
    if let Err(e) = &result {
        metrics::counter!(
            crate::observability::ENGINE_REJECTIONS_TOTAL,
            "op" => op,
            "reason" => e.kind()
        )
        .increment(1);
        if e.is_retryable() {
            tracing::warn!(op, error = %e, "storage unavailable");
        } else {
            tracing::debug!(op, reason = e.kind(), error = %e, "request refused");
        }
    }
    result
}
