//! Storage façade (C1): read-through over SQLite plus JSON overlay files,
//! with TTL'd in-memory device/observer caches so hot-path handlers never
//! open a fresh read transaction per request.

pub mod devices;
pub mod messages;
pub mod observers;

use std::path::PathBuf;
use std::sync::Mutex;

use crate::db::{Db, DbError};
use devices::{DeviceCache, DeviceSnapshot};
use observers::{ObserverCache, ObserverSnapshot};

pub struct Storage {
    pub db: Mutex<Db>,
    device_cache: Mutex<DeviceCache>,
    observer_cache: Mutex<ObserverCache>,
    devices_overlay_path: PathBuf,
}

impl Storage {
    pub fn new(db: Db, data_dir: &std::path::Path) -> Self {
        Self {
            db: Mutex::new(db),
            device_cache: Mutex::new(DeviceCache::default()),
            observer_cache: Mutex::new(ObserverCache::default()),
            devices_overlay_path: data_dir.join("devices.json"),
        }
    }

    pub fn read_devices(&self) -> Result<DeviceSnapshot, DbError> {
        let db = self.db.lock().expect("db mutex poisoned");
        let mut cache = self.device_cache.lock().expect("device cache poisoned");
        cache.read(db.conn(), &self.devices_overlay_path)
    }

    pub fn read_observers(&self) -> Result<ObserverSnapshot, DbError> {
        let db = self.db.lock().expect("db mutex poisoned");
        let mut cache = self.observer_cache.lock().expect("observer cache poisoned");
        cache.read(db.conn())
    }

    /// Called after any admin mutation to device/observer rows so the next
    /// read bypasses the TTL instead of serving stale data.
    pub fn invalidate_device_observer_caches(&self) {
        self.device_cache
            .lock()
            .expect("device cache poisoned")
            .invalidate();
        self.observer_cache
            .lock()
            .expect("observer cache poisoned")
            .invalidate();
    }
}
