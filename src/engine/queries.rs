use chrono::NaiveDate;
use futures::stream::BoxStream;

use crate::model::*;

use super::rules::{authorize, now_ms, require_admin, today};
use super::{BookingEngine, Deadline, EngineError};

impl BookingEngine {
    /// Every reservation dated today or later, by date.
    pub async fn list_upcoming_reservations(
        &self,
        deadline: Deadline,
    ) -> Result<Vec<Reservation>, EngineError> {
        let from = today(now_ms());
        Ok(deadline.run(self.ledger.find_from(from)).await??)
    }

    pub fn list_resource_days(&self, label: Option<&str>) -> BoxStream<'static, ResourceDay> {
        self.days.list(label)
    }

    pub async fn check_availability(
        &self,
        day: &DayRef,
        date: NaiveDate,
        deadline: Deadline,
    ) -> Result<Availability, EngineError> {
        let day = self.resolve_day(day, deadline).await?;
        let booked = self
            .ledger
            .count_by_resource_day_and_date(day.id, date, deadline)
            .await?;
        Ok(Availability {
            resource_day_id: day.id,
            date,
            capacity: day.capacity,
            booked,
        })
    }

    pub async fn get_reservation(
        &self,
        id: ReservationId,
        caller: &Caller,
        deadline: Deadline,
    ) -> Result<Reservation, EngineError> {
        let reservation = deadline.run(self.ledger.find_by_id(id)).await??;
        authorize(caller, reservation.vendor_id)?;
        Ok(reservation)
    }

    pub async fn list_vendor_reservations(
        &self,
        vendor_id: VendorId,
        caller: &Caller,
        deadline: Deadline,
    ) -> Result<Vec<Reservation>, EngineError> {
        authorize(caller, vendor_id)?;
        Ok(self.ledger.find_by_vendor(vendor_id, None, deadline).await?)
    }

    pub async fn list_all_reservations(
        &self,
        caller: &Caller,
        deadline: Deadline,
    ) -> Result<Vec<Reservation>, EngineError> {
        require_admin(caller)?;
        Ok(deadline.run(self.ledger.find_all()).await??)
    }
}
