// This file is part of Argus NVR, a lightweight network video recorder.
// Copyright (C) 2026 The Argus NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Tools for propagating a graceful shutdown signal through the program.
//!
//! The receiver can be cloned, polled cheaply from synchronous loops, awaited
//! from async code, and blocked on (with a timeout) from ingestor threads.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};

#[derive(Debug)]
pub struct ShutdownError;

impl std::fmt::Display for ShutdownError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("shutdown requested")
    }
}

impl std::error::Error for ShutdownError {}

struct Inner {
    /// Set exactly once, before the notifications fire.
    shut: AtomicBool,

    /// Guards sync waiters; the bool mirrors `shut` under the lock.
    sync_state: Mutex<bool>,
    condvar: Condvar,

    /// Wakes async waiters.
    notify: tokio::sync::Notify,
}

pub struct Sender(Arc<Inner>);

impl Drop for Sender {
    fn drop(&mut self) {
        // Note sequencing: set the flag, then notify sync and async waiters.
        // The opposite order would create a race in which something might
        // never wake.
        self.0.shut.store(true, Ordering::SeqCst);
        {
            let mut l = self.0.sync_state.lock().expect("shutdown lock poisoned");
            *l = true;
        }
        self.0.condvar.notify_all();
        self.0.notify.notify_waiters();
    }
}

#[derive(Clone)]
pub struct Receiver(Arc<Inner>);

impl Receiver {
    /// Returns an error iff shutdown has been requested. Never blocks.
    pub fn check(&self) -> Result<(), ShutdownError> {
        if self.0.shut.load(Ordering::SeqCst) {
            Err(ShutdownError)
        } else {
            Ok(())
        }
    }

    /// Blocks the current thread until shutdown or until `timeout` elapses.
    /// Returns `Ok` on timeout, `Err(ShutdownError)` on shutdown, matching
    /// `check`'s convention.
    pub fn wait_for(&self, timeout: std::time::Duration) -> Result<(), ShutdownError> {
        let l = self.0.sync_state.lock().expect("shutdown lock poisoned");
        let result = self
            .0
            .condvar
            .wait_timeout_while(l, timeout, |shut| !*shut)
            .expect("shutdown lock poisoned");
        if result.1.timed_out() {
            Ok(())
        } else {
            Err(ShutdownError)
        }
    }

    /// Completes when shutdown is requested; for use in `select!`.
    pub async fn wait(&self) {
        loop {
            if self.0.shut.load(Ordering::SeqCst) {
                return;
            }
            let notified = self.0.notify.notified();
            // Re-check: the flag may have been set between the load and the
            // `notified()` registration.
            if self.0.shut.load(Ordering::SeqCst) {
                return;
            }
            notified.await;
        }
    }
}

/// Returns a sender and receiver for graceful shutdown.
///
/// Dropping the sender will request shutdown.
pub fn channel() -> (Sender, Receiver) {
    let inner = Arc::new(Inner {
        shut: AtomicBool::new(false),
        sync_state: Mutex::new(false),
        condvar: Condvar::new(),
        notify: tokio::sync::Notify::new(),
    });
    (Sender(inner.clone()), Receiver(inner))
}

#[cfg(test)]
mod tests {
    #[test]
    fn simple_check() {
        let (tx, rx) = super::channel();
        rx.check().unwrap();
        drop(tx);
        rx.check().unwrap_err();
    }

    #[test]
    fn blocking() {
        let (tx, rx) = super::channel();
        rx.wait_for(std::time::Duration::from_secs(0)).unwrap();
        let h = std::thread::spawn(move || {
            rx.wait_for(std::time::Duration::from_secs(1000))
                .unwrap_err()
        });

        // Make it likely that rx has done its initial check and is waiting on
        // the Condvar.
        std::thread::sleep(std::time::Duration::from_millis(10));

        drop(tx);
        h.join().unwrap();
    }

    #[tokio::test]
    async fn async_wait() {
        let (tx, rx) = super::channel();
        let rx2 = rx.clone();
        let h = tokio::spawn(async move { rx2.wait().await });
        drop(tx);
        h.await.unwrap();
        rx.check().unwrap_err();
    }
}
