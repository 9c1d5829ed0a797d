// This file is part of Argus NVR, a lightweight network video recorder.
// Copyright (C) 2026 The Argus NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Clock access for the recording core, mockable for tests.
//!
//! Recording logic needs two clocks at once: the monotonic clock orders
//! packets and drives timeouts, the realtime clock names recordings. They
//! are read together as one [`Now`] snapshot so a packet's two arrival
//! stamps can never straddle a clock adjustment. Tests substitute
//! [`SimulatedClocks`] and advance time explicitly, so nothing in the core
//! ever actually waits.

use std::sync::{mpsc, Arc, Mutex};
use std::time::Duration as StdDuration;
use tracing::warn;

use crate::time::{Duration, Time, TIME_UNITS_PER_SEC};

/// A paired reading of both clocks.
#[derive(Copy, Clone, Debug)]
pub struct Now {
    /// Monotonic time since an unspecified origin (boot, on Linux, where it
    /// also advances across suspend).
    pub mono: Duration,

    /// `CLOCK_REALTIME`-style wall time.
    pub wall: Time,
}

/// Abstract interface to the system clocks. This is for testability.
pub trait Clocks: Send + Sync + 'static {
    fn now(&self) -> Now;

    /// Causes the current thread to sleep for the specified time.
    fn sleep(&self, how_long: Duration);

    /// Calls `rcv.recv_timeout` or substitutes a test implementation.
    fn recv_timeout<T>(
        &self,
        rcv: &mpsc::Receiver<T>,
        timeout: StdDuration,
    ) -> Result<T, mpsc::RecvTimeoutError>;
}

#[cfg(target_os = "linux")]
const MONO_CLOCK: libc::clockid_t = libc::CLOCK_BOOTTIME;
#[cfg(not(target_os = "linux"))]
const MONO_CLOCK: libc::clockid_t = libc::CLOCK_MONOTONIC;

fn ticks_of(ts: libc::timespec) -> i64 {
    // On 32-bit arm builds, `tv_sec` is an `i32` and requires conversion.
    #[allow(clippy::useless_conversion)]
    let secs = i64::from(ts.tv_sec);
    secs * TIME_UNITS_PER_SEC + (ts.tv_nsec as i64) * 9 / 100_000
}

#[derive(Copy, Clone)]
pub struct RealClocks {}

impl Clocks for RealClocks {
    fn now(&self) -> Now {
        let mut mono = libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        };
        let rc = unsafe { libc::clock_gettime(MONO_CLOCK, &mut mono) };
        assert_eq!(rc, 0, "clock_gettime failed");
        let wall = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| Time(0) + Duration::from_std(d))
            // A pre-1970 clock is a misconfigured host; saturate rather
            // than panic in the packet path.
            .unwrap_or(Time(0));
        Now {
            mono: Duration(ticks_of(mono)),
            wall,
        }
    }

    fn sleep(&self, how_long: Duration) {
        std::thread::sleep(how_long.to_std())
    }

    fn recv_timeout<T>(
        &self,
        rcv: &mpsc::Receiver<T>,
        timeout: StdDuration,
    ) -> Result<T, mpsc::RecvTimeoutError> {
        rcv.recv_timeout(timeout)
    }
}

/// Runs `f`, logging a warning with `label` if it took a second or longer.
/// For wrapping the blocking calls in the ingest path that are normally
/// fast but can stall on a misbehaving camera or disk.
pub fn warn_if_slow<C: Clocks + ?Sized, T>(clocks: &C, label: &str, f: impl FnOnce() -> T) -> T {
    let start = clocks.now().mono;
    let out = f();
    let took = clocks.now().mono - start;
    if took >= Duration::from_secs(1) {
        warn!("{label} took {took}!");
    }
    out
}

/// Simulated clock for testing. Both clocks start at a fixed point and
/// advance only via `sleep`, in lockstep.
#[derive(Clone)]
pub struct SimulatedClocks(Arc<Mutex<Now>>);

impl SimulatedClocks {
    pub fn new(wall: Time) -> Self {
        SimulatedClocks(Arc::new(Mutex::new(Now {
            mono: Duration(0),
            wall,
        })))
    }
}

impl Clocks for SimulatedClocks {
    fn now(&self) -> Now {
        *self.0.lock().expect("clock lock poisoned")
    }

    /// Advances both clocks by the specified amount without actually
    /// sleeping.
    fn sleep(&self, how_long: Duration) {
        let mut l = self.0.lock().expect("clock lock poisoned");
        l.mono += how_long;
        l.wall += how_long;
    }

    /// Returns immediately; on empty channels the clocks advance by the
    /// full timeout, as if the wait had happened.
    fn recv_timeout<T>(
        &self,
        rcv: &mpsc::Receiver<T>,
        timeout: StdDuration,
    ) -> Result<T, mpsc::RecvTimeoutError> {
        match rcv.try_recv() {
            Ok(v) => Ok(v),
            Err(mpsc::TryRecvError::Empty) => {
                self.sleep(Duration::from_std(timeout));
                Err(mpsc::RecvTimeoutError::Timeout)
            }
            Err(mpsc::TryRecvError::Disconnected) => Err(mpsc::RecvTimeoutError::Disconnected),
        }
    }
}
