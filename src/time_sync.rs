//! Drift-aware clock synchronization over ping/pong samples.
//!
//! Every pong yields a sample `(delta, rtt, when)` where
//!  `delta = t_server_recv - t0 - rtt/2` is the server-minus-client clock
//!  offset at the midpoint of the exchange. The best-RTT quarter of the
//!  sample ring feeds a least-squares fit `Di = B0 * Ti + B1`, so a client
//!  clock ticking faster than the server's is modeled as drift instead of
//!  polluting the offset. A constant-rate speed cheat is corrected out the
//!  same way.
//!
//! All `Ti` are rebased to a recent `base_time` so 32-bit timestamp rollover
//!  inside the sample window is a non-issue.

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::transport::elapsed_ms;
use crate::wire::{MAX_TS_SAMPLES, MIN_DRIFT_SAMPLES, MIN_TS_SAMPLES, TIMEOUT_DISCONNECT_MS, TIME_SYNC_INTERVAL_MS};

#[derive(Clone, Copy, Debug)]
struct TimeSample {
    delta: i32,
    rtt: u32,
    when: u32,
}

/// The published conversion triple. Readers never see mixed fields from two
///  updates; the whole triple swaps under the mutex.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
struct Published {
    base_time: u32,
    b0: f64,
    b1: i32,
}

pub struct ClockSync {
    samples: Mutex<SampleRing>,
    published: Mutex<Published>,
}

struct SampleRing {
    samples: [Option<TimeSample>; MAX_TS_SAMPLES],
    next_index: usize,
    count: usize,
}

impl Default for ClockSync {
    fn default() -> Self {
        ClockSync::new()
    }
}

impl ClockSync {
    pub fn new() -> ClockSync {
        ClockSync {
            samples: Mutex::new(SampleRing {
                samples: [None; MAX_TS_SAMPLES],
                next_index: 0,
                count: 0,
            }),
            published: Mutex::new(Published::default()),
        }
    }

    /// Feed a pong: `t0` is the echoed local ping send time, `server_recv`
    ///  the server's receive timestamp, `now` the local pong receive time.
    pub fn on_pong(&self, t0: u32, server_recv: u32, now: u32) {
        let Some(rtt) = elapsed_ms(t0, now) else {
            trace!("pong echoes a timestamp from the future - ignoring");
            return;
        };
        if rtt >= TIMEOUT_DISCONNECT_MS {
            debug!("pong with impossible rtt {} - ignoring", rtt);
            return;
        }

        // server clock minus client clock at the exchange midpoint
        let delta = server_recv.wrapping_sub(t0).wrapping_sub(rtt / 2) as i32;
        self.update(now, rtt, delta);
    }

    fn update(&self, pong_time: u32, rtt: u32, delta: i32) {
        let mut guard = self.samples.lock();
        let ring = &mut *guard;

        let index = ring.next_index;
        ring.samples[index] = Some(TimeSample { delta, rtt, when: pong_time });
        ring.next_index = (index + 1) % MAX_TS_SAMPLES;
        ring.count = (ring.count + 1).min(MAX_TS_SAMPLES);

        // keep the lowest-RTT quarter of the ring, at least MIN_TS_SAMPLES
        let mut best: Vec<TimeSample> = ring.samples.iter().flatten().cloned().collect();
        best.sort_by_key(|s| s.rtt);
        let keep = (MAX_TS_SAMPLES / 4).max(MIN_TS_SAMPLES).min(ring.count);
        best.truncate(keep);
        drop(guard);

        if best.len() < MIN_DRIFT_SAMPLES {
            // too few measurements to trust a drift estimate
            let avg_delta = (best.iter().map(|s| s.delta as i64).sum::<i64>() / best.len() as i64) as i32;
            self.publish(Published { base_time: pong_time, b0: 0.0, b1: avg_delta });
            trace!("published average delta {} from {} samples, no drift", avg_delta, best.len());
            return;
        }

        // rebase times into a window that cannot straddle a rollover
        let base_time = pong_time
            .wrapping_sub((MAX_TS_SAMPLES as u32 + 1).wrapping_mul(TIME_SYNC_INTERVAL_MS));

        let n = best.len() as i64;
        let sum_when: i64 = best.iter().map(|s| s.when.wrapping_sub(base_time) as i64).sum();
        let sum_delta: i64 = best.iter().map(|s| s.delta as i64).sum();

        let mut numerator = 0i64;
        let mut denominator = 0i64;
        for sample in &best {
            let when_term = sample.when.wrapping_sub(base_time) as i64 * n - sum_when;
            let delta_term = sample.delta as i64 * n - sum_delta;
            numerator += when_term * delta_term;
            denominator += when_term * when_term;
        }

        if denominator <= 0 {
            self.publish(Published { base_time: pong_time, b0: 0.0, b1: delta });
            trace!("degenerate drift denominator, published latest delta {}", delta);
            return;
        }

        let b0 = numerator as f64 / denominator as f64;
        let b1 = ((sum_delta as f64 - b0 * sum_when as f64) / n as f64) as i32;
        self.publish(Published { base_time, b0, b1 });
        debug!("published drift b0={:e} b1={}", b0, b1);
    }

    fn publish(&self, published: Published) {
        *self.published.lock() = published;
    }

    /// Convert a local timestamp to server time. The drift term uses the
    ///  request's local time, not any sample's.
    pub fn server_time(&self, local_ms: u32) -> u32 {
        let p = *self.published.lock();
        let drift = p.b0 * local_ms.wrapping_sub(p.base_time) as f64;
        local_ms
            .wrapping_add(drift as i64 as u32)
            .wrapping_add(p.b1 as u32)
    }

    /// Convert a server timestamp back to local time, evaluated at the local
    ///  time of the request.
    pub fn local_time(&self, server_ms: u32, request_local_ms: u32) -> u32 {
        let p = *self.published.lock();
        let drift = p.b0 * request_local_ms.wrapping_sub(p.base_time) as f64;
        server_ms
            .wrapping_sub(drift as i64 as u32)
            .wrapping_sub(p.b1 as u32)
    }
}
