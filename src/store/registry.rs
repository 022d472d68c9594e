use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::{self, BoxStream};
use ulid::Ulid;

use crate::limits::MAX_LABEL_LEN;
use crate::model::*;

use super::{Deadline, Store, StoreError, detached};

/// Bookable resource-days and their capacities.
#[async_trait]
pub trait ResourceDayRegistry: Send + Sync {
    /// Fails with `DuplicateLabel` if another day already uses `label`
    /// (case-insensitive, trimmed) and `InvalidCapacity` unless
    /// `capacity` is positive and fits a `u32`.
    async fn create(&self, label: &str, capacity: i64) -> Result<ResourceDay, StoreError>;

    async fn get(&self, day: &DayRef) -> Result<ResourceDay, StoreError>;

    /// Days ordered by label. Each call takes a fresh snapshot when first
    /// polled, so the stream can be restarted by calling `list` again.
    fn list(&self, label: Option<&str>) -> BoxStream<'static, ResourceDay>;

    async fn set_capacity(&self, id: ResourceDayId, capacity: i64)
    -> Result<ResourceDay, StoreError>;
}

pub(crate) fn validate_label(label: &str) -> Result<&str, StoreError> {
    let label = label.trim();
    if label.is_empty() {
        return Err(StoreError::InvalidLabel("label is empty"));
    }
    if label.len() > MAX_LABEL_LEN {
        return Err(StoreError::InvalidLabel("label too long"));
    }
    if label.chars().any(char::is_control) {
        return Err(StoreError::InvalidLabel("label contains control characters"));
    }
    Ok(label)
}

pub(crate) fn validate_capacity(capacity: i64) -> Result<u32, StoreError> {
    match u32::try_from(capacity) {
        Ok(units) if units > 0 => Ok(units),
        _ => Err(StoreError::InvalidCapacity(capacity)),
    }
}

impl Store {
    fn lookup_day(&self, day: &DayRef) -> Option<ResourceDay> {
        let tables = self.tables();
        let id = match day {
            DayRef::Id(id) => *id,
            DayRef::Label(label) => *tables.labels.get(&label_key(label))?,
        };
        tables.days.get(&id).map(|d| d.value().clone())
    }

    fn day_snapshot(&self, label: Option<&str>) -> Vec<ResourceDay> {
        let wanted = label.map(label_key);
        let mut days: Vec<ResourceDay> = self
            .tables()
            .days
            .iter()
            .filter(|d| wanted.as_deref().is_none_or(|w| label_key(&d.label) == w))
            .map(|d| d.value().clone())
            .collect();
        days.sort_by(|a, b| label_key(&a.label).cmp(&label_key(&b.label)));
        days
    }
}

#[async_trait]
impl ResourceDayRegistry for Store {
    async fn create(&self, label: &str, capacity: i64) -> Result<ResourceDay, StoreError> {
        let label = validate_label(label)?.to_string();
        let capacity = validate_capacity(capacity)?;

        let store = self.clone();
        detached(async move {
            let _writer = store.inner.registry_writes.lock().await;
            let key = label_key(&label);
            if store.tables().labels.contains_key(&key) {
                return Err(StoreError::DuplicateLabel(label));
            }

            let day = ResourceDay {
                id: Ulid::new(),
                label,
                capacity,
            };
            let event = Event::ResourceDayCreated {
                id: day.id,
                label: day.label.clone(),
                capacity,
            };
            store
                .commit(event, Deadline::none(), |t| {
                    t.labels.insert(key, day.id);
                    t.days.insert(day.id, day.clone());
                })
                .await?;
            Ok(day)
        })
        .await
    }

    async fn get(&self, day: &DayRef) -> Result<ResourceDay, StoreError> {
        self.lookup_day(day)
            .ok_or_else(|| StoreError::ResourceDayNotFound(day.to_string()))
    }

    fn list(&self, label: Option<&str>) -> BoxStream<'static, ResourceDay> {
        let store = self.clone();
        let label = label.map(str::to_string);
        stream::once(async move { store.day_snapshot(label.as_deref()) })
            .flat_map(stream::iter)
            .boxed()
    }

    async fn set_capacity(
        &self,
        id: ResourceDayId,
        capacity: i64,
    ) -> Result<ResourceDay, StoreError> {
        let capacity = validate_capacity(capacity)?;

        let store = self.clone();
        detached(async move {
            let _writer = store.inner.registry_writes.lock().await;
            let mut day = store
                .lookup_day(&DayRef::Id(id))
                .ok_or_else(|| StoreError::ResourceDayNotFound(id.to_string()))?;
            if day.capacity == capacity {
                return Ok(day);
            }
            day.capacity = capacity;
            store
                .commit(Event::CapacityChanged { id, capacity }, Deadline::none(), |t| {
                    if let Some(mut d) = t.days.get_mut(&id) {
                        d.capacity = capacity;
                    }
                })
                .await?;
            Ok(day)
        })
        .await
    }
}
