//! External collaborator contracts.
//!
//! User/device CRUD, dog/metric/schedule persistence and password hashing
//! are out of scope for the relay core; this module declares the narrow
//! traits the router consumes instead, plus a minimal in-memory
//! implementation of each, so the crate builds and its tests run
//! standalone without a real backing database.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::ids::{DeviceId, UserId};

/// The persistent, cross-restart source of truth for device ownership.
/// `ConnectionManager`'s in-memory ownership map is seeded from this store
/// at startup and kept in sync with it by the router on every pair/unpair.
#[async_trait(?Send)]
pub trait PairingStore {
    async fn get_device_owner(&self, device_id: &DeviceId) -> Option<UserId>;

    async fn create_device_pairing(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
    );

    async fn delete_device_pairing(&self, device_id: &DeviceId);

    async fn get_all_device_pairings(&self) -> HashMap<DeviceId, UserId>;
}

/// One dog's daily metric rollup, as sent in a `metrics_sync` frame.
#[derive(Clone, Debug, Serialize)]
pub struct Dog {
    pub dog_id: String,
    pub name: String,
}

/// A single logged metric sample.
#[derive(Clone, Debug, Serialize)]
pub struct Metric {
    pub metric_type: String,
    pub value: f64,
    pub recorded_at: DateTime<Utc>,
}

/// Dog ownership and the metric/mission event log a robot's `metric_event`
/// frames are persisted into.
#[async_trait(?Send)]
pub trait DogMetricsStore {
    async fn get_user_dogs(&self, user_id: &UserId) -> Vec<Dog>;

    async fn get_metrics(
        &self,
        dog_id: &str,
        user_id: &UserId,
        since: DateTime<Utc>,
    ) -> Vec<Metric>;

    async fn log_metric(
        &self,
        dog_id: &str,
        user_id: &UserId,
        metric_type: &str,
        value: f64,
    ) -> Result<(), crate::error::Error>;

    async fn log_mission(
        &self,
        dog_id: &str,
        user_id: &UserId,
        mission_type: &str,
        result: &str,
        details: serde_json::Value,
    ) -> Result<(), crate::error::Error>;
}

/// The device-registration record the router reads/writes around connect
/// and disconnect.
#[async_trait(?Send)]
pub trait DeviceStatusStore {
    async fn update_device_online_status(
        &self,
        device_id: &DeviceId,
        is_online: bool,
    );

    async fn get_device_data(
        &self,
        device_id: &DeviceId,
    ) -> Option<serde_json::Value>;
}

/// In-memory [`PairingStore`] backing the crate's tests and its default
/// standalone binary. Not durable across restarts; a real deployment swaps
/// this for a database-backed implementation without touching the core.
#[derive(Default)]
pub struct InMemoryPairingStore {
    pairings: Mutex<HashMap<DeviceId, UserId>>,
}

impl InMemoryPairingStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn seeded(pairings: HashMap<DeviceId, UserId>) -> Self {
        Self {
            pairings: Mutex::new(pairings),
        }
    }
}

#[async_trait(?Send)]
impl PairingStore for InMemoryPairingStore {
    async fn get_device_owner(&self, device_id: &DeviceId) -> Option<UserId> {
        self.pairings.lock().unwrap().get(device_id).cloned()
    }

    async fn create_device_pairing(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
    ) {
        self.pairings
            .lock()
            .unwrap()
            .insert(device_id.clone(), user_id.clone());
    }

    async fn delete_device_pairing(&self, device_id: &DeviceId) {
        self.pairings.lock().unwrap().remove(device_id);
    }

    async fn get_all_device_pairings(&self) -> HashMap<DeviceId, UserId> {
        self.pairings.lock().unwrap().clone()
    }
}

/// In-memory [`DogMetricsStore`]. `log_metric`/`log_mission` never fail in
/// this implementation; a database-backed one can surface
/// [`crate::error::Error::Store`] on write failure, which the router (§7)
/// treats as "drop the metric, still forward the event".
#[derive(Default)]
pub struct InMemoryDogMetricsStore {
    dogs: Mutex<HashMap<UserId, Vec<Dog>>>,
    metrics: Mutex<Vec<(String, UserId, Metric)>>,
}

impl InMemoryDogMetricsStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait(?Send)]
impl DogMetricsStore for InMemoryDogMetricsStore {
    async fn get_user_dogs(&self, user_id: &UserId) -> Vec<Dog> {
        self.dogs.lock().unwrap().get(user_id).cloned().unwrap_or_default()
    }

    async fn get_metrics(
        &self,
        dog_id: &str,
        user_id: &UserId,
        since: DateTime<Utc>,
    ) -> Vec<Metric> {
        self.metrics
            .lock()
            .unwrap()
            .iter()
            .filter(|(d, u, m)| {
                d == dog_id && u == user_id && m.recorded_at >= since
            })
            .map(|(_, _, m)| m.clone())
            .collect()
    }

    async fn log_metric(
        &self,
        dog_id: &str,
        user_id: &UserId,
        metric_type: &str,
        value: f64,
    ) -> Result<(), crate::error::Error> {
        self.metrics.lock().unwrap().push((
            dog_id.to_owned(),
            user_id.clone(),
            Metric {
                metric_type: metric_type.to_owned(),
                value,
                recorded_at: Utc::now(),
            },
        ));
        Ok(())
    }

    async fn log_mission(
        &self,
        dog_id: &str,
        user_id: &UserId,
        mission_type: &str,
        result: &str,
        _details: serde_json::Value,
    ) -> Result<(), crate::error::Error> {
        self.metrics.lock().unwrap().push((
            dog_id.to_owned(),
            user_id.clone(),
            Metric {
                metric_type: format!("mission:{}:{}", mission_type, result),
                value: 0.0,
                recorded_at: Utc::now(),
            },
        ));
        Ok(())
    }
}

/// In-memory [`DeviceStatusStore`].
#[derive(Default)]
pub struct InMemoryDeviceStatusStore {
    online: Mutex<HashMap<DeviceId, bool>>,
}

impl InMemoryDeviceStatusStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait(?Send)]
impl DeviceStatusStore for InMemoryDeviceStatusStore {
    async fn update_device_online_status(
        &self,
        device_id: &DeviceId,
        is_online: bool,
    ) {
        self.online.lock().unwrap().insert(device_id.clone(), is_online);
    }

    async fn get_device_data(
        &self,
        device_id: &DeviceId,
    ) -> Option<serde_json::Value> {
        let online = *self.online.lock().unwrap().get(device_id)?;
        Some(serde_json::json!({ "device_id": device_id.as_str(), "is_online": online }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device(s: &str) -> DeviceId {
        DeviceId(s.to_owned())
    }
    fn user(s: &str) -> UserId {
        UserId(s.to_owned())
    }

    #[actix_rt::test]
    async fn pairing_store_round_trips_and_lists_all() {
        let store = InMemoryPairingStore::new();
        store.create_device_pairing(&user("u1"), &device("d1")).await;
        store.create_device_pairing(&user("u2"), &device("d2")).await;
        assert_eq!(store.get_device_owner(&device("d1")).await, Some(user("u1")));
        assert_eq!(store.get_all_device_pairings().await.len(), 2);

        store.delete_device_pairing(&device("d1")).await;
        assert_eq!(store.get_device_owner(&device("d1")).await, None);
        assert_eq!(store.get_all_device_pairings().await.len(), 1);
    }

    #[actix_rt::test]
    async fn pairing_store_seeded_is_preloaded() {
        let mut seed = HashMap::new();
        seed.insert(device("d1"), user("u1"));
        let store = InMemoryPairingStore::seeded(seed);
        assert_eq!(store.get_device_owner(&device("d1")).await, Some(user("u1")));
    }

    #[actix_rt::test]
    async fn dog_metrics_store_filters_by_dog_user_and_time() {
        let store = InMemoryDogMetricsStore::new();
        store.log_metric("dog1", &user("u1"), "weight", 12.5).await.unwrap();
        store.log_metric("dog2", &user("u1"), "weight", 9.0).await.unwrap();
        store.log_metric("dog1", &user("u2"), "weight", 20.0).await.unwrap();

        let since = Utc::now() - chrono::Duration::days(1);
        let metrics = store.get_metrics("dog1", &user("u1"), since).await;
        assert_eq!(metrics.len(), 1);
        assert_eq!(metrics[0].value, 12.5);
    }

    #[actix_rt::test]
    async fn device_status_store_reports_none_until_updated() {
        let store = InMemoryDeviceStatusStore::new();
        assert!(store.get_device_data(&device("d1")).await.is_none());
        store.update_device_online_status(&device("d1"), true).await;
        let data = store.get_device_data(&device("d1")).await.unwrap();
        assert_eq!(data["is_online"], true);
    }
}
