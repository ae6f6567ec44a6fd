//! Multi-sink playback synchronization
//!
//! One global sync clock exists per output sample rate. The first
//! barrier establishes a reference mapping from the RTP timestamp
//! space onto the monotonic clock; every later timestamp has a
//! computable release instant. A sink's coordinator blocks at the
//! barrier until all enrolled sinks reach the timestamp, the reference
//! release time passes, or the timeout expires, so audio is never
//! stalled longer than the timeout.
//!
//! Coordinators also report how far off their actual release was; the
//! clock feeds back a bounded, smoothed per-sink rate trim that the
//! processors feeding the sink add onto their resampler ratio.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};
use wavecast_packet_core::SinkId;
use wavecast_timeshift_core::RateHandle;

use crate::config::SyncTuning;
use crate::error::{MixerError, Result};

/// Why a barrier wait returned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BarrierOutcome {
    /// Every enrolled sink reached the timestamp
    AllReached,
    /// The reference release instant passed first
    ReferenceElapsed,
    /// The timeout expired first
    TimedOut,
}

#[derive(Debug)]
struct ClockInner {
    /// Reference mapping: this RTP timestamp released at this instant
    reference: Option<(u32, Instant)>,
    /// Latest timestamp each enrolled sink has reached
    reached: HashMap<SinkId, u32>,
}

/// The per-sample-rate clock shared by a sync group
#[derive(Debug)]
pub struct GlobalSyncClock {
    sample_rate: u32,
    tuning: SyncTuning,
    inner: Mutex<ClockInner>,
    barrier: Condvar,
}

impl GlobalSyncClock {
    /// A clock for one output sample rate
    pub fn new(sample_rate: u32, tuning: SyncTuning) -> Self {
        Self {
            sample_rate,
            tuning,
            inner: Mutex::new(ClockInner {
                reference: None,
                reached: HashMap::new(),
            }),
            barrier: Condvar::new(),
        }
    }

    /// The group's output sample rate
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Enrolled sink count
    pub fn member_count(&self) -> usize {
        self.inner.lock().reached.len()
    }

    /// Expected wall-clock release instant for a timestamp
    fn release_time(&self, reference: (u32, Instant), rtp: u32) -> Instant {
        let (rtp0, t0) = reference;
        // Wrapping difference keeps long sessions correct.
        let delta = rtp.wrapping_sub(rtp0) as i32 as i64;
        let nanos = delta * 1_000_000_000 / self.sample_rate as i64;
        if nanos >= 0 {
            t0 + Duration::from_nanos(nanos as u64)
        } else {
            t0 - Duration::from_nanos((-nanos) as u64)
        }
    }
}

/// Per-sink member of a sync group
#[derive(Debug)]
pub struct SinkSyncCoordinator {
    clock: Arc<GlobalSyncClock>,
    sink_id: SinkId,
    /// Additive resampler trim shared with the processors feeding the
    /// sink
    trim: RateHandle,
    stats: Mutex<CoordinatorStats>,
}

/// Coordinator counters
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CoordinatorStats {
    /// Barriers that released with every member present
    pub barriers_reached: u64,
    /// Barriers released by the reference clock
    pub barriers_elapsed: u64,
    /// Barriers abandoned on timeout
    pub total_barrier_timeouts: u64,
    /// Last reported release error, ms (positive = late)
    pub last_error_ms: f64,
}

impl SinkSyncCoordinator {
    /// Enroll a sink into a group clock; rejected when the sink's
    /// output rate differs from the group's
    pub fn enable(
        clock: Arc<GlobalSyncClock>,
        sink_id: SinkId,
        sink_rate: u32,
    ) -> Result<Arc<Self>> {
        if sink_rate != clock.sample_rate {
            return Err(MixerError::SyncRateMismatch {
                sink_rate,
                group_rate: clock.sample_rate,
            });
        }
        {
            let mut inner = clock.inner.lock();
            inner.reached.entry(sink_id.clone()).or_insert(0);
        }
        debug!(sink = %sink_id, rate = sink_rate, "sink enrolled in sync group");
        Ok(Arc::new(Self {
            clock,
            sink_id,
            trim: RateHandle::new(),
            stats: Mutex::new(CoordinatorStats::default()),
        }))
    }

    /// Leave the group
    pub fn disable(&self) {
        let mut inner = self.clock.inner.lock();
        inner.reached.remove(&self.sink_id);
        drop(inner);
        self.clock.barrier.notify_all();
        self.trim.set(1.0);
        debug!(sink = %self.sink_id, "sink left sync group");
    }

    /// The rate trim the sink's feeding processors should apply
    pub fn trim(&self) -> RateHandle {
        self.trim.clone()
    }

    /// Snapshot counters
    pub fn stats(&self) -> CoordinatorStats {
        self.stats.lock().clone()
    }

    /// Block until the group reaches `target_rtp`, its reference
    /// release time arrives, or the timeout expires
    pub fn wait_for_barrier(&self, target_rtp: u32) -> BarrierOutcome {
        let timeout = Duration::from_millis(self.clock.tuning.barrier_timeout_ms);
        let deadline = Instant::now() + timeout;

        let mut inner = self.clock.inner.lock();
        let reference = *inner
            .reference
            .get_or_insert_with(|| (target_rtp, Instant::now()));
        let release_at = self.clock.release_time(reference, target_rtp);

        inner.reached.insert(self.sink_id.clone(), target_rtp);
        self.clock.barrier.notify_all();

        let outcome = loop {
            let all_reached = inner.reached.values().all(|&reached| {
                // Wrapping comparison: reached >= target.
                reached.wrapping_sub(target_rtp) as i32 >= 0
            });
            if all_reached {
                break BarrierOutcome::AllReached;
            }
            let now = Instant::now();
            if now >= release_at {
                break BarrierOutcome::ReferenceElapsed;
            }
            if now >= deadline {
                break BarrierOutcome::TimedOut;
            }
            let wait_until = release_at.min(deadline);
            self.clock.barrier.wait_until(&mut inner, wait_until);
        };
        drop(inner);

        let mut stats = self.stats.lock();
        match outcome {
            BarrierOutcome::AllReached => stats.barriers_reached += 1,
            BarrierOutcome::ReferenceElapsed => stats.barriers_elapsed += 1,
            BarrierOutcome::TimedOut => {
                stats.total_barrier_timeouts += 1;
                trace!(sink = %self.sink_id, target_rtp, "barrier timeout");
            }
        }
        drop(stats);

        // Drift feedback: how far off the reference release were we?
        let now = Instant::now();
        let error = if now >= release_at {
            (now - release_at).as_secs_f64()
        } else {
            -(release_at - now).as_secs_f64()
        };
        self.report_release_error(error);
        outcome
    }

    /// Fold an observed release error into the bounded, smoothed trim
    fn report_release_error(&self, error_secs: f64) {
        let tuning = &self.clock.tuning;
        let mut stats = self.stats.lock();
        stats.last_error_ms = error_secs * 1_000.0;
        drop(stats);

        // Late release (positive error) means the sink should consume
        // slightly faster, so the trim rises above unity.
        let suggestion = 1.0
            + (error_secs * 0.1).clamp(-tuning.max_rate_adjustment, tuning.max_rate_adjustment);
        let current = self.trim.get();
        let smoothed =
            current + (suggestion - current) * tuning.sync_smoothing_factor;
        self.trim.set(smoothed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn clock() -> Arc<GlobalSyncClock> {
        Arc::new(GlobalSyncClock::new(48_000, SyncTuning::default()))
    }

    #[test]
    fn rate_mismatch_is_rejected() {
        let clock = clock();
        let err = SinkSyncCoordinator::enable(clock, SinkId::new("s1"), 44_100).unwrap_err();
        assert!(matches!(err, MixerError::SyncRateMismatch { .. }));
    }

    #[test]
    fn single_member_barriers_release_immediately() {
        let clock = clock();
        let coord = SinkSyncCoordinator::enable(clock, SinkId::new("s1"), 48_000).unwrap();
        let outcome = coord.wait_for_barrier(0);
        assert_eq!(outcome, BarrierOutcome::AllReached);
        assert_eq!(coord.stats().barriers_reached, 1);
    }

    #[test]
    fn two_members_meet_at_the_barrier() {
        let clock = clock();
        let a = SinkSyncCoordinator::enable(Arc::clone(&clock), SinkId::new("a"), 48_000).unwrap();
        let b = SinkSyncCoordinator::enable(Arc::clone(&clock), SinkId::new("b"), 48_000).unwrap();

        let b_thread = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(5));
            b.wait_for_barrier(4_800)
        });
        let a_outcome = a.wait_for_barrier(4_800);
        let b_outcome = b_thread.join().unwrap();
        assert_eq!(a_outcome, BarrierOutcome::AllReached);
        assert_eq!(b_outcome, BarrierOutcome::AllReached);
    }

    #[test]
    fn stalled_peer_cannot_hold_the_group_past_the_timeout() {
        let clock = clock();
        let a = SinkSyncCoordinator::enable(Arc::clone(&clock), SinkId::new("a"), 48_000).unwrap();
        // Enroll a second member that never waits.
        let _b = SinkSyncCoordinator::enable(Arc::clone(&clock), SinkId::new("b"), 48_000).unwrap();

        // Establish the reference at 0 so a future timestamp has a
        // bounded release time; the wait must not exceed roughly the
        // barrier timeout.
        a.wait_for_barrier(0);
        let start = Instant::now();
        let outcome = a.wait_for_barrier(48_000 * 60); // a minute ahead
        let waited = start.elapsed();
        assert_eq!(outcome, BarrierOutcome::TimedOut);
        assert!(waited < Duration::from_millis(200), "waited {waited:?}");
        assert_eq!(a.stats().total_barrier_timeouts, 1);
    }

    #[test]
    fn disable_removes_the_member_and_resets_trim() {
        let clock = clock();
        let a = SinkSyncCoordinator::enable(Arc::clone(&clock), SinkId::new("a"), 48_000).unwrap();
        assert_eq!(clock.member_count(), 1);
        a.trim().set(1.0003);
        a.disable();
        assert_eq!(clock.member_count(), 0);
        assert_eq!(a.trim().get(), 1.0);
    }

    #[test]
    fn trim_stays_within_bounds_under_feedback() {
        let clock = clock();
        let a = SinkSyncCoordinator::enable(clock, SinkId::new("a"), 48_000).unwrap();
        for _ in 0..200 {
            a.report_release_error(5.0); // grossly late
        }
        let tuning = SyncTuning::default();
        assert!(a.trim().get() <= 1.0 + tuning.max_rate_adjustment + 1e-9);
        for _ in 0..200 {
            a.report_release_error(-5.0);
        }
        assert!(a.trim().get() >= 1.0 - tuning.max_rate_adjustment - 1e-9);
    }
}
