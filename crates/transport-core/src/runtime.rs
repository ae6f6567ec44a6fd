//! Shared async runtime for the WebRTC stack
//!
//! The peer-connection library is async; everything else in the
//! engine runs on plain threads. One lazily started multi-thread
//! runtime hosts all peer connections, and the mixer threads cross
//! into it with short bounded `block_on` calls.

use once_cell::sync::Lazy;
use tokio::runtime::{Builder, Runtime};

static RUNTIME: Lazy<Runtime> = Lazy::new(|| {
    Builder::new_multi_thread()
        .worker_threads(2)
        .thread_name("wavecast-webrtc")
        .enable_all()
        .build()
        .expect("building the transport runtime cannot fail")
});

/// Handle to the shared transport runtime
pub fn handle() -> tokio::runtime::Handle {
    RUNTIME.handle().clone()
}
