use chrono::NaiveDate;
use tracing::info;
use ulid::Ulid;

use crate::model::*;
use crate::observability::{
    RESERVATIONS_CANCELLED_TOTAL, RESERVATIONS_COMMITTED_TOTAL, RESERVATIONS_MOVED_TOTAL,
};
use crate::store::StoreError;

use super::rules::{authorize, check_booking_date, now_ms, require_admin, today};
use super::{BookingEngine, Deadline, EngineError, observe};

impl BookingEngine {
    /// Book one unit of the resource-day labelled `label` on `date` for `vendor_id`.
    ///
    /// Checks run in order: date floor, caller authority, label resolution,
    /// then the rolling-week and capacity predicates, which the ledger
    /// evaluates atomically with the insert (rolling week first).
    pub async fn create_reservation(
        &self,
        vendor_id: VendorId,
        label: &str,
        date: NaiveDate,
        caller: &Caller,
        deadline: Deadline,
    ) -> Result<Reservation, EngineError> {
        observe("create", self.try_create(vendor_id, label, date, caller, deadline).await)
    }

    async fn try_create(
        &self,
        vendor_id: VendorId,
        label: &str,
        date: NaiveDate,
        caller: &Caller,
        deadline: Deadline,
    ) -> Result<Reservation, EngineError> {
        let now = now_ms();
        check_booking_date(date, today(now))?;
        authorize(caller, vendor_id)?;
        let day = self.resolve_day(&DayRef::Label(label.to_string()), deadline).await?;

        let reservation = Reservation {
            id: Ulid::new(),
            resource_day_id: day.id,
            vendor_id,
            booked_by: caller.id,
            date,
            created_at: now,
        };
        let committed = self
            .ledger
            .insert_if(reservation, Admission::booking(day.capacity, date), deadline)
            .await?;

        metrics::counter!(RESERVATIONS_COMMITTED_TOTAL).increment(1);
        info!(
            reservation = %committed.id,
            vendor = %vendor_id,
            day = %day.label,
            %date,
            "reservation committed"
        );
        Ok(committed)
    }

    /// Move a reservation to another resource-day and/or date. The move is
    /// admitted against the target slot with the reservation itself excluded;
    /// on refusal the reservation keeps its current slot.
    pub async fn update_reservation(
        &self,
        id: ReservationId,
        caller: &Caller,
        patch: ReservationPatch,
        deadline: Deadline,
    ) -> Result<Reservation, EngineError> {
        observe("update", self.try_update(id, caller, patch, deadline).await)
    }

    async fn try_update(
        &self,
        id: ReservationId,
        caller: &Caller,
        patch: ReservationPatch,
        deadline: Deadline,
    ) -> Result<Reservation, EngineError> {
        let existing = deadline.run(self.ledger.find_by_id(id)).await??;
        authorize(caller, existing.vendor_id)?;
        if patch.is_empty() {
            return Ok(existing);
        }

        let target = patch
            .resource_day
            .unwrap_or(DayRef::Id(existing.resource_day_id));
        let day = self.resolve_day(&target, deadline).await?;
        let date = patch.date.unwrap_or(existing.date);
        if day.id == existing.resource_day_id && date == existing.date {
            return Ok(existing);
        }
        check_booking_date(date, today(now_ms()))?;

        let change = SlotChange {
            resource_day_id: day.id,
            date,
        };
        let moved = self
            .ledger
            .update_if(id, change, Admission::booking(day.capacity, date), deadline)
            .await?;

        metrics::counter!(RESERVATIONS_MOVED_TOTAL).increment(1);
        info!(
            reservation = %id,
            from_date = %existing.date,
            to_date = %moved.date,
            day = %day.label,
            "reservation moved"
        );
        Ok(moved)
    }

    /// Owner or admin cancels; the unit is free again once this returns.
    pub async fn cancel_reservation(
        &self,
        id: ReservationId,
        caller: &Caller,
        deadline: Deadline,
    ) -> Result<Reservation, EngineError> {
        let result: Result<Reservation, EngineError> = async {
            let existing = deadline.run(self.ledger.find_by_id(id)).await??;
            authorize(caller, existing.vendor_id)?;
            self.remove(id, "cancel", deadline).await
        }
        .await;
        observe("cancel", result)
    }

    /// Cancel without an ownership check. The caller's role is enforced by the
    /// request layer.
    pub async fn admin_cancel_reservation(
        &self,
        id: ReservationId,
        deadline: Deadline,
    ) -> Result<Reservation, EngineError> {
        observe("admin_cancel", self.remove(id, "admin_cancel", deadline).await)
    }

    async fn remove(
        &self,
        id: ReservationId,
        how: &'static str,
        deadline: Deadline,
    ) -> Result<Reservation, EngineError> {
        let removed = self.ledger.delete(id, deadline).await?;
        metrics::counter!(RESERVATIONS_CANCELLED_TOTAL, "by" => how).increment(1);
        info!(reservation = %id, vendor = %removed.vendor_id, date = %removed.date, how, "reservation cancelled");
        Ok(removed)
    }

    pub async fn create_resource_day(
        &self,
        label: &str,
        capacity: i64,
        caller: &Caller,
    ) -> Result<ResourceDay, EngineError> {
        let result: Result<ResourceDay, EngineError> = async {
            require_admin(caller)?;
            let day = self.days.create(label, capacity).await?;
            info!(id = %day.id, label = %day.label, capacity = day.capacity, "resource day created");
            Ok(day)
        }
        .await;
        observe("create_resource_day", result)
    }

    /// Change a resource-day's capacity. Existing reservations are kept even
    /// if they now exceed it; new bookings see the new value.
    pub async fn update_resource_day(
        &self,
        label: &str,
        capacity: i64,
        caller: &Caller,
        deadline: Deadline,
    ) -> Result<ResourceDay, EngineError> {
        let result: Result<ResourceDay, EngineError> = async {
            require_admin(caller)?;
            let day = self.resolve_day(&DayRef::Label(label.to_string()), deadline).await?;
            let updated = self.days.set_capacity(day.id, capacity).await?;
            info!(id = %day.id, label = %day.label, from = day.capacity, to = updated.capacity, "resource day capacity changed");
            Ok(updated)
        }
        .await;
        observe("update_resource_day", result)
    }

    /// Create whichever of the seven weekday resource-days are missing.
    /// Returns the days created by this call.
    pub async fn seed_weekdays(&self) -> Result<Vec<ResourceDay>, EngineError> {
        let mut created = Vec::new();
        for weekday in WEEK {
            let label = weekday_label(weekday);
            let capacity = i64::from(default_weekday_capacity(weekday));
            match self.days.create(label, capacity).await {
                Ok(day) => {
                    info!(label, capacity, "seeded resource day");
                    created.push(day);
                }
                Err(StoreError::DuplicateLabel(_)) => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(created)
    }
}
