use async_trait::async_trait;
use chrono::NaiveDate;

use crate::model::*;

use super::{Deadline, Slot, Store, StoreError, VendorBook, detached};

/// Reservation records plus the `(resource_day_id, date)` and per-vendor
/// indexes. Storage only: callers own the business rules and pass them in as
/// an [`Admission`] when a write must be conditional.
#[async_trait]
pub trait ReservationLedger: Send + Sync {
    /// Unconditional insert.
    async fn insert(&self, reservation: Reservation) -> Result<Reservation, StoreError>;

    /// Insert iff `admission` holds for the target slot and vendor, evaluated
    /// atomically with the write. Refusals are `StoreError::Rejected`.
    async fn insert_if(
        &self,
        reservation: Reservation,
        admission: Admission,
        deadline: Deadline,
    ) -> Result<Reservation, StoreError>;

    async fn find_by_id(&self, id: ReservationId) -> Result<Reservation, StoreError>;

    /// Ordered by date. `window` restricts to dates inside it.
    async fn find_by_vendor(
        &self,
        vendor_id: VendorId,
        window: Option<DateWindow>,
        deadline: Deadline,
    ) -> Result<Vec<Reservation>, StoreError>;

    async fn find_by_resource_day_and_date(
        &self,
        resource_day_id: ResourceDayId,
        date: NaiveDate,
        deadline: Deadline,
    ) -> Result<Vec<Reservation>, StoreError>;

    async fn count_by_resource_day_and_date(
        &self,
        resource_day_id: ResourceDayId,
        date: NaiveDate,
        deadline: Deadline,
    ) -> Result<u32, StoreError>;

    /// Every reservation dated on or after `from`, ordered by date.
    async fn find_from(&self, from: NaiveDate) -> Result<Vec<Reservation>, StoreError>;

    async fn find_all(&self) -> Result<Vec<Reservation>, StoreError>;

    /// Unconditional move.
    async fn update(&self, id: ReservationId, change: SlotChange)
    -> Result<Reservation, StoreError>;

    /// Move iff `admission` holds for the target slot, with the reservation
    /// itself excluded from both counts. Moving to the current slot is a no-op.
    async fn update_if(
        &self,
        id: ReservationId,
        change: SlotChange,
        admission: Admission,
        deadline: Deadline,
    ) -> Result<Reservation, StoreError>;

    /// Remove and return the reservation.
    async fn delete(&self, id: ReservationId, deadline: Deadline)
    -> Result<Reservation, StoreError>;
}

fn admit(
    admission: &Admission,
    slot: &Slot,
    book: &VendorBook,
    moving: Option<ReservationId>,
) -> Result<(), StoreError> {
    if let Some(window) = admission.vendor_window
        && let Some(conflicting) = book.first_in(window, moving)
    {
        return Err(StoreError::Rejected(Rejection::VendorWindow { conflicting }));
    }
    if let Some(capacity) = admission.capacity
        && slot.count_excluding(moving) >= capacity
    {
        return Err(StoreError::Rejected(Rejection::SlotFull { capacity }));
    }
    Ok(())
}

impl Store {
    fn reservations_by_id(&self, ids: &[ReservationId]) -> Vec<Reservation> {
        let reservations = &self.tables().reservations;
        ids.iter()
            .filter_map(|id| reservations.get(id).map(|r| r.value().clone()))
            .collect()
    }

    fn scan(&self, keep: impl Fn(&Reservation) -> bool) -> Vec<Reservation> {
        let mut out: Vec<Reservation> = self
            .tables()
            .reservations
            .iter()
            .filter(|r| keep(r.value()))
            .map(|r| r.value().clone())
            .collect();
        out.sort_by_key(|r| (r.date, r.id));
        out
    }

    fn vendor_of(&self, id: ReservationId) -> Result<VendorId, StoreError> {
        self.tables()
            .reservations
            .get(&id)
            .map(|r| r.vendor_id)
            .ok_or(StoreError::ReservationNotFound(id))
    }

    fn current(&self, id: ReservationId) -> Result<Reservation, StoreError> {
        self.tables()
            .reservations
            .get(&id)
            .map(|r| r.value().clone())
            .ok_or(StoreError::ReservationNotFound(id))
    }

    async fn insert_admitted(
        &self,
        reservation: Reservation,
        admission: Admission,
        deadline: Deadline,
    ) -> Result<Reservation, StoreError> {
        let tables = self.tables();
        if !tables.days.contains_key(&reservation.resource_day_id) {
            return Err(StoreError::ResourceDayNotFound(
                reservation.resource_day_id.to_string(),
            ));
        }
        if tables.reservations.contains_key(&reservation.id) {
            return Err(StoreError::AlreadyExists(reservation.id));
        }

        let mut book = self.lock_vendor(reservation.vendor_id, deadline).await?;
        let mut slot = self.lock_slot(reservation.slot(), deadline).await?;
        admit(&admission, &slot, &book, None)?;

        let event = Event::ReservationCommitted {
            reservation: reservation.clone(),
        };
        self.commit(event, deadline, |t| {
            slot.push(reservation.id);
            book.insert(reservation.date, reservation.id);
            t.reservations.insert(reservation.id, reservation.clone());
        })
        .await?;
        Ok(reservation)
    }

    async fn move_admitted(
        &self,
        id: ReservationId,
        change: SlotChange,
        admission: Admission,
        deadline: Deadline,
    ) -> Result<Reservation, StoreError> {
        let vendor_id = self.vendor_of(id)?;
        if !self.tables().days.contains_key(&change.resource_day_id) {
            return Err(StoreError::ResourceDayNotFound(
                change.resource_day_id.to_string(),
            ));
        }

        let mut book = self.lock_vendor(vendor_id, deadline).await?;
        // Every write to this reservation holds its vendor book, so it is stable from here.
        let current = self.current(id)?;
        let from = current.slot();
        let to = SlotKey::new(change.resource_day_id, change.date);
        if from == to {
            return Ok(current);
        }

        let (mut from_slot, mut to_slot) = self.lock_slot_pair(from, to, deadline).await?;
        admit(&admission, &to_slot, &book, Some(id))?;

        let moved = Reservation {
            resource_day_id: change.resource_day_id,
            date: change.date,
            ..current.clone()
        };
        let event = Event::ReservationMoved {
            id,
            resource_day_id: change.resource_day_id,
            date: change.date,
        };
        self.commit(event, deadline, |t| {
            from_slot.remove(id);
            to_slot.push(id);
            book.remove(current.date, id);
            book.insert(moved.date, id);
            t.reservations.insert(id, moved.clone());
        })
        .await?;
        Ok(moved)
    }

    async fn remove(&self, id: ReservationId, deadline: Deadline) -> Result<Reservation, StoreError> {
        let vendor_id = self.vendor_of(id)?;
        let mut book = self.lock_vendor(vendor_id, deadline).await?;
        let current = self.current(id)?;
        let mut slot = self.lock_slot(current.slot(), deadline).await?;

        self.commit(Event::ReservationCancelled { id }, deadline, |t| {
            slot.remove(id);
            book.remove(current.date, id);
            t.reservations.remove(&id);
        })
        .await?;
        Ok(current)
    }
}

#[async_trait]
impl ReservationLedger for Store {
    async fn insert(&self, reservation: Reservation) -> Result<Reservation, StoreError> {
        self.insert_if(reservation, Admission::any(), Deadline::none())
            .await
    }

    async fn insert_if(
        &self,
        reservation: Reservation,
        admission: Admission,
        deadline: Deadline,
    ) -> Result<Reservation, StoreError> {
        let store = self.clone();
        detached(async move { store.insert_admitted(reservation, admission, deadline).await }).await
    }

    async fn find_by_id(&self, id: ReservationId) -> Result<Reservation, StoreError> {
        self.current(id)
    }

    async fn find_by_vendor(
        &self,
        vendor_id: VendorId,
        window: Option<DateWindow>,
        deadline: Deadline,
    ) -> Result<Vec<Reservation>, StoreError> {
        let Some(handle) = self.tables().vendors.get(&vendor_id).map(|b| b.value().clone()) else {
            return Ok(Vec::new());
        };
        let ids = deadline.run(handle.lock()).await?.ids(window);
        Ok(self.reservations_by_id(&ids))
    }

    async fn find_by_resource_day_and_date(
        &self,
        resource_day_id: ResourceDayId,
        date: NaiveDate,
        deadline: Deadline,
    ) -> Result<Vec<Reservation>, StoreError> {
        let key = SlotKey::new(resource_day_id, date);
        let Some(handle) = self.tables().slots.get(&key).map(|s| s.value().clone()) else {
            return Ok(Vec::new());
        };
        let ids = deadline.run(handle.lock()).await?.members.clone();
        Ok(self.reservations_by_id(&ids))
    }

    async fn count_by_resource_day_and_date(
        &self,
        resource_day_id: ResourceDayId,
        date: NaiveDate,
        deadline: Deadline,
    ) -> Result<u32, StoreError> {
        let key = SlotKey::new(resource_day_id, date);
        let Some(handle) = self.tables().slots.get(&key).map(|s| s.value().clone()) else {
            return Ok(0);
        };
        let count = deadline.run(handle.lock()).await?.count_excluding(None);
        Ok(count)
    }

    async fn find_from(&self, from: NaiveDate) -> Result<Vec<Reservation>, StoreError> {
        Ok(self.scan(|r| r.date >= from))
    }

    async fn find_all(&self) -> Result<Vec<Reservation>, StoreError> {
        Ok(self.scan(|_| true))
    }

    async fn update(
        &self,
        id: ReservationId,
        change: SlotChange,
    ) -> Result<Reservation, StoreError> {
        self.update_if(id, change, Admission::any(), Deadline::none())
            .await
    }

    async fn update_if(
        &self,
        id: ReservationId,
        change: SlotChange,
        admission: Admission,
        deadline: Deadline,
    ) -> Result<Reservation, StoreError> {
        let store = self.clone();
        detached(async move { store.move_admitted(id, change, admission, deadline).await }).await
    }

    async fn delete(
        &self,
        id: ReservationId,
        deadline: Deadline,
    ) -> Result<Reservation, StoreError> {
        let store = self.clone();
        detached(async move { store.remove(id, deadline).await }).await
    }
}
