use chrono::{Days, NaiveDate, Weekday};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds. Used for timestamps; calendar dates are `NaiveDate`.
pub type Ms = i64;

pub type ResourceDayId = Ulid;
pub type ReservationId = Ulid;
pub type VendorId = Ulid;

/// How far a vendor's reservations must be spread apart, in days on each side.
pub const ROLLING_WEEK_DAYS: u64 = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    Vendor,
    Admin,
}

/// Identity resolved by the request layer before it calls into the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Caller {
    pub id: Ulid,
    pub role: Role,
}

impl Caller {
    pub fn vendor(id: Ulid) -> Self {
        Self { id, role: Role::Vendor }
    }

    pub fn admin(id: Ulid) -> Self {
        Self { id, role: Role::Admin }
    }

    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }

    /// Owners act on their own records; admins act on anyone's.
    pub fn may_act_for(&self, vendor_id: VendorId) -> bool {
        self.is_admin() || self.id == vendor_id
    }
}

/// A bookable day-type (e.g. "Monday") with a fixed number of units.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceDay {
    pub id: ResourceDayId,
    pub label: String,
    pub capacity: u32,
}

/// Reference to a resource-day by either of its unique keys.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DayRef {
    Id(ResourceDayId),
    Label(String),
}

impl std::fmt::Display for DayRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DayRef::Id(id) => write!(f, "{id}"),
            DayRef::Label(label) => write!(f, "{label}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: ReservationId,
    pub resource_day_id: ResourceDayId,
    pub vendor_id: VendorId,
    /// Caller that created the reservation; differs from `vendor_id` when an
    /// admin booked on the vendor's behalf.
    pub booked_by: Ulid,
    pub date: NaiveDate,
    pub created_at: Ms,
}

impl Reservation {
    pub fn slot(&self) -> SlotKey {
        SlotKey::new(self.resource_day_id, self.date)
    }
}

/// One concrete instance of a resource-day: the unit capacity is counted against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SlotKey {
    pub resource_day_id: ResourceDayId,
    pub date: NaiveDate,
}

impl SlotKey {
    pub fn new(resource_day_id: ResourceDayId, date: NaiveDate) -> Self {
        Self { resource_day_id, date }
    }
}

/// Inclusive date range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateWindow {
    pub first: NaiveDate,
    pub last: NaiveDate,
}

impl DateWindow {
    pub fn new(first: NaiveDate, last: NaiveDate) -> Self {
        debug_assert!(first <= last, "DateWindow first must not be after last");
        Self { first, last }
    }

    /// The `[date - 6, date + 6]` window a vendor may hold only one booking in.
    pub fn rolling_week(date: NaiveDate) -> Self {
        let first = date
            .checked_sub_days(Days::new(ROLLING_WEEK_DAYS))
            .unwrap_or(NaiveDate::MIN);
        let last = date
            .checked_add_days(Days::new(ROLLING_WEEK_DAYS))
            .unwrap_or(NaiveDate::MAX);
        Self { first, last }
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        self.first <= date && date <= self.last
    }
}

/// Requested changes to a reservation. `None` leaves a field as is.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReservationPatch {
    pub resource_day: Option<DayRef>,
    pub date: Option<NaiveDate>,
}

impl ReservationPatch {
    pub fn is_empty(&self) -> bool {
        self.resource_day.is_none() && self.date.is_none()
    }
}

/// Storage-level move: the target slot of an existing reservation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotChange {
    pub resource_day_id: ResourceDayId,
    pub date: NaiveDate,
}

/// Predicate a conditional ledger write must satisfy, evaluated atomically
/// with the write itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Admission {
    /// Maximum live reservations in the target slot after the write.
    pub capacity: Option<u32>,
    /// Vendor must hold no other reservation dated inside this window.
    pub vendor_window: Option<DateWindow>,
}

impl Admission {
    /// Unconditional write.
    pub fn any() -> Self {
        Self {
            capacity: None,
            vendor_window: None,
        }
    }

    pub fn booking(capacity: u32, date: NaiveDate) -> Self {
        Self {
            capacity: Some(capacity),
            vendor_window: Some(DateWindow::rolling_week(date)),
        }
    }
}

/// Why a conditional write was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    SlotFull { capacity: u32 },
    VendorWindow { conflicting: ReservationId },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Availability {
    pub resource_day_id: ResourceDayId,
    pub date: NaiveDate,
    pub capacity: u32,
    pub booked: u32,
}

impl Availability {
    pub fn remaining(&self) -> u32 {
        self.capacity.saturating_sub(self.booked)
    }

    pub fn is_available(&self) -> bool {
        self.remaining() > 0
    }
}

/// WAL record format. Flat, one variant per state change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    ResourceDayCreated {
        id: ResourceDayId,
        label: String,
        capacity: u32,
    },
    CapacityChanged {
        id: ResourceDayId,
        capacity: u32,
    },
    ReservationCommitted {
        reservation: Reservation,
    },
    ReservationMoved {
        id: ReservationId,
        resource_day_id: ResourceDayId,
        date: NaiveDate,
    },
    ReservationCancelled {
        id: ReservationId,
    },
}

/// Canonical form used for the label uniqueness index.
pub fn label_key(label: &str) -> String {
    label.trim().to_lowercase()
}

/// Units a weekday gets when the daemon seeds the default week.
pub fn default_weekday_capacity(day: Weekday) -> u32 {
    match day {
        Weekday::Fri => 6,
        _ => 7,
    }
}

pub fn weekday_label(day: Weekday) -> &'static str {
    match day {
        Weekday::Mon => "Monday",
        Weekday::Tue => "Tuesday",
        Weekday::Wed => "Wednesday",
        Weekday::Thu => "Thursday",
        Weekday::Fri => "Friday",
        Weekday::Sat => "Saturday",
        Weekday::Sun => "Sunday",
    }
}

pub const WEEK: [Weekday; 7] = [
    Weekday::Mon,
    Weekday::Tue,
    Weekday::Wed,
    Weekday::Thu,
    Weekday::Fri,
    Weekday::Sat,
    Weekday::Sun,
];
