use chrono::{DateTime, Days, NaiveDate};

use crate::limits::MIN_LEAD_DAYS;
use crate::model::*;

use super::EngineError;

pub(crate) fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as Ms)
        .unwrap_or(0)
}

/// Calendar date in UTC at `now`.
pub(crate) fn today(now: Ms) -> NaiveDate {
    DateTime::from_timestamp_millis(now)
        .map(|t| t.date_naive())
        .unwrap_or(NaiveDate::MIN)
}

/// A booking date must be strictly after tomorrow.
pub(crate) fn check_booking_date(date: NaiveDate, today: NaiveDate) -> Result<(), EngineError> {
    let floor = today
        .checked_add_days(Days::new(MIN_LEAD_DAYS))
        .unwrap_or(NaiveDate::MAX);
    if date <= floor {
        return Err(EngineError::InvalidDate {
            date,
            reason: "must be later than tomorrow",
        });
    }
    Ok(())
}

pub(crate) fn authorize(caller: &Caller, vendor_id: VendorId) -> Result<(), EngineError> {
    if caller.may_act_for(vendor_id) {
        Ok(())
    } else {
        Err(EngineError::Forbidden)
    }
}

pub(crate) fn require_admin(caller: &Caller) -> Result<(), EngineError> {
    if caller.is_admin() {
        Ok(())
    } else {
        Err(EngineError::Forbidden)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ulid::Ulid;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    #[test]
    fn date_floor_rejects_today_and_tomorrow() {
        let today = d(2030, 2, 27);
        assert!(matches!(
            check_booking_date(today, today),
            Err(EngineError::InvalidDate { .. })
        ));
        assert!(matches!(
            check_booking_date(d(2030, 2, 28), today),
            Err(EngineError::InvalidDate { .. })
        ));
        assert!(check_booking_date(d(2030, 3, 1), today).is_ok());
        assert!(check_booking_date(d(2029, 1, 1), today).is_err());
    }

    #[test]
    fn far_future_dates_are_accepted() {
        let today = d(2030, 1, 1);
        assert!(check_booking_date(d(2032, 6, 1), today).is_ok());
        assert!(check_booking_date(NaiveDate::MAX, today).is_ok());
        assert!(check_booking_date(d(2030, 1, 2), NaiveDate::MAX).is_err());
    }

    #[test]
    fn today_is_utc_calendar_date() {
        // 2030-03-01T23:59:59.999Z
        assert_eq!(today(1_898_639_999_999), d(2030, 3, 1));
        assert_eq!(today(1_898_640_000_000), d(2030, 3, 2));
    }

    #[test]
    fn authorization() {
        let vendor = Ulid::new();
        assert!(authorize(&Caller::vendor(vendor), vendor).is_ok());
        assert!(matches!(
            authorize(&Caller::vendor(Ulid::new()), vendor),
            Err(EngineError::Forbidden)
        ));
        assert!(authorize(&Caller::admin(Ulid::new()), vendor).is_ok());
        assert!(require_admin(&Caller::vendor(vendor)).is_err());
    }
}
