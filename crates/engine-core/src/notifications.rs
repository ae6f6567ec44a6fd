//! Engine notifications
//!
//! Components that fail in ways the control plane should hear about
//! (rather than just counters) enqueue a notification here; the
//! control plane drains the queue on its own schedule. The queue is
//! bounded and drops oldest on overflow.

use std::collections::VecDeque;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use wavecast_packet_core::SinkId;
use wavecast_transport_core::receiver::SystemDeviceInfo;

/// Events surfaced to the control plane
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EngineNotification {
    /// A sender failed setup and was removed from its sink
    SenderSetupFailed {
        /// The affected sink
        sink_id: SinkId,
        /// What failed
        reason: String,
    },
    /// A system audio device appeared
    DeviceAdded {
        /// The new device
        device: SystemDeviceInfo,
    },
    /// A system audio device disappeared
    DeviceRemoved {
        /// The vanished device
        device: SystemDeviceInfo,
    },
    /// A component was torn down after an unrecoverable failure
    ComponentFailed {
        /// Component description
        component: String,
        /// Why it was removed
        reason: String,
    },
}

/// Bounded drop-oldest notification queue
pub struct NotificationQueue {
    entries: Mutex<VecDeque<EngineNotification>>,
    capacity: usize,
}

impl NotificationQueue {
    /// Queue bounded to `capacity` entries
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::new()),
            capacity,
        }
    }

    /// Enqueue, dropping the oldest entry when full
    pub fn push(&self, notification: EngineNotification) {
        let mut entries = self.entries.lock();
        if entries.len() >= self.capacity {
            entries.pop_front();
        }
        entries.push_back(notification);
    }

    /// Take everything queued so far
    pub fn drain(&self) -> Vec<EngineNotification> {
        self.entries.lock().drain(..).collect()
    }

    /// Queued entry count
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overflow_drops_oldest() {
        let queue = NotificationQueue::new(2);
        for i in 0..3 {
            queue.push(EngineNotification::ComponentFailed {
                component: format!("c{i}"),
                reason: String::new(),
            });
        }
        let drained = queue.drain();
        assert_eq!(drained.len(), 2);
        match &drained[0] {
            EngineNotification::ComponentFailed { component, .. } => {
                assert_eq!(component, "c1");
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(queue.len(), 0);
    }
}
