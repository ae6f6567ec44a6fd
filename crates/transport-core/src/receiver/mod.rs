//! Packet intake
//!
//! Every receiver runs one thread: parse the wire format, tag the
//! packet with a stable source identity, stamp it with the monotonic
//! clock on arrival, and push it into the timeshift manager. Receivers
//! never block the manager; overflow is the manager's inbound drop
//! accounting.

pub mod capture;
pub mod per_process;
pub mod rtp;
pub mod scream;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

pub use capture::{CaptureRegistry, SystemDeviceInfo};
pub use per_process::PROCESS_TAG_LEN;
pub use rtp::RtpReceiverConfig;

/// Counters every receiver keeps
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReceiverStats {
    /// Packets accepted and forwarded
    pub packets_received: u64,
    /// Payload bytes forwarded
    pub bytes_received: u64,
    /// Datagrams rejected as malformed
    pub malformed_packets: u64,
}

#[derive(Default)]
pub(crate) struct SharedReceiverStats {
    pub packets_received: AtomicU64,
    pub bytes_received: AtomicU64,
    pub malformed_packets: AtomicU64,
}

impl SharedReceiverStats {
    pub(crate) fn snapshot(&self) -> ReceiverStats {
        ReceiverStats {
            packets_received: self.packets_received.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            malformed_packets: self.malformed_packets.load(Ordering::Relaxed),
        }
    }
}

/// Control handle for a running receiver thread
pub struct ReceiverHandle {
    running: Arc<AtomicBool>,
    join: Mutex<Option<JoinHandle<()>>>,
    stats: Arc<SharedReceiverStats>,
}

impl ReceiverHandle {
    pub(crate) fn new(
        running: Arc<AtomicBool>,
        join: JoinHandle<()>,
        stats: Arc<SharedReceiverStats>,
    ) -> Self {
        Self {
            running,
            join: Mutex::new(Some(join)),
            stats,
        }
    }

    /// Snapshot counters
    pub fn stats(&self) -> ReceiverStats {
        self.stats.snapshot()
    }

    /// Stop the receiver thread and join it
    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
        if let Some(handle) = self.join.lock().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for ReceiverHandle {
    fn drop(&mut self) {
        self.stop();
    }
}
