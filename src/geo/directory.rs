use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use uuid::Uuid;

use crate::error::DirectoryError;
use crate::models::courier::{Courier, CourierStatus, GeoPoint};

/// Read side of the courier directory, as seen by dispatch.
#[async_trait]
pub trait CourierDirectory: Send + Sync {
    /// Every courier currently flagged available, in no particular order.
    async fn available_couriers(&self) -> Result<Vec<Courier>, DirectoryError>;

    async fn courier(&self, id: Uuid) -> Result<Option<Courier>, DirectoryError>;
}

/// Directory kept current by courier heartbeats (status and location updates).
#[derive(Default)]
pub struct InMemoryCourierDirectory {
    couriers: DashMap<Uuid, Courier>,
}

impl InMemoryCourierDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, name: String, location: GeoPoint) -> Courier {
        let courier = Courier {
            id: Uuid::new_v4(),
            name,
            location,
            status: CourierStatus::Available,
            updated_at: Utc::now(),
        };
        self.couriers.insert(courier.id, courier.clone());
        courier
    }

    pub fn upsert(&self, courier: Courier) {
        self.couriers.insert(courier.id, courier);
    }

    pub fn set_status(&self, id: Uuid, status: CourierStatus) -> Option<Courier> {
        let mut courier = self.couriers.get_mut(&id)?;
        courier.status = status;
        courier.updated_at = Utc::now();
        Some(courier.clone())
    }

    pub fn set_location(&self, id: Uuid, location: GeoPoint) -> Option<Courier> {
        let mut courier = self.couriers.get_mut(&id)?;
        courier.location = location;
        courier.updated_at = Utc::now();
        Some(courier.clone())
    }

    pub fn list(&self) -> Vec<Courier> {
        self.couriers
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.couriers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.couriers.is_empty()
    }
}

#[async_trait]
impl CourierDirectory for InMemoryCourierDirectory {
    async fn available_couriers(&self) -> Result<Vec<Courier>, DirectoryError> {
        Ok(self
            .couriers
            .iter()
            .filter(|entry| entry.value().is_available())
            .map(|entry| entry.value().clone())
            .collect())
    }

    async fn courier(&self, id: Uuid) -> Result<Option<Courier>, DirectoryError> {
        Ok(self.couriers.get(&id).map(|entry| entry.value().clone()))
    }
}
