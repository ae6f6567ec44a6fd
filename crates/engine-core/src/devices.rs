//! System device monitoring
//!
//! Hotplug detection is a periodic snapshot diff driven by the stats
//! collector's 1 Hz tick; cpal exposes no portable notification API.

use parking_lot::Mutex;
use wavecast_transport_core::receiver::{CaptureRegistry, SystemDeviceInfo};

use crate::notifications::{EngineNotification, NotificationQueue};

/// Tracks the device set between collector ticks
pub struct DeviceMonitor {
    last: Mutex<Vec<SystemDeviceInfo>>,
}

impl DeviceMonitor {
    /// Monitor starting from the current device set
    pub fn new() -> Self {
        Self {
            last: Mutex::new(CaptureRegistry::list_devices()),
        }
    }

    /// The most recent snapshot
    pub fn snapshot(&self) -> Vec<SystemDeviceInfo> {
        self.last.lock().clone()
    }

    /// Re-list devices and queue add/remove notifications for the diff
    pub fn poll(&self, notifications: &NotificationQueue) {
        let current = CaptureRegistry::list_devices();
        let mut last = self.last.lock();
        for device in current.iter() {
            if !last.iter().any(|d| d.name == device.name && d.direction == device.direction) {
                notifications.push(EngineNotification::DeviceAdded {
                    device: device.clone(),
                });
            }
        }
        for device in last.iter() {
            if !current
                .iter()
                .any(|d| d.name == device.name && d.direction == device.direction)
            {
                notifications.push(EngineNotification::DeviceRemoved {
                    device: device.clone(),
                });
            }
        }
        *last = current;
    }
}

impl Default for DeviceMonitor {
    fn default() -> Self {
        Self::new()
    }
}
