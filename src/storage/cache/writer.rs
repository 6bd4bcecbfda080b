//! Background write-back thread.
//!
//! Sleeps on a condition variable for `interval`, or until [`Writer::wake`],
//! then runs one [`ObjectCache::write_back_pass`]. Shutdown is cooperative:
//! the loop polls a running flag and exits at its next wakeup.

use super::ObjectCache;
use crate::storage::error::{fatal, StoreResult};
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

struct Shared {
    running: AtomicBool,
    woken: Mutex<bool>,
    cond: Condvar,
}

pub struct Writer {
    shared: Arc<Shared>,
    handle: Option<JoinHandle<()>>,
}

impl Writer {
    pub fn spawn(cache: ObjectCache, interval: Duration) -> StoreResult<Self> {
        let shared = Arc::new(Shared {
            running: AtomicBool::new(true),
            woken: Mutex::new(false),
            cond: Condvar::new(),
        });
        let thread_shared = shared.clone();
        let handle = thread::Builder::new()
            .name("objdb-writer".to_string())
            .spawn(move || run(cache, thread_shared, interval))?;
        log::info!("background writer started, interval {:?}", interval);

        Ok(Self {
            shared,
            handle: Some(handle),
        })
    }

    /// Cut the current sleep short.
    pub fn wake(&self) {
        *self.shared.woken.lock() = true;
        self.shared.cond.notify_one();
    }

    pub fn is_running(&self) -> bool {
        self.handle.is_some()
    }

    /// Ask the thread to exit and wait for it.
    pub fn stop(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        self.shared.running.store(false, Ordering::SeqCst);
        self.wake();
        if handle.join().is_err() {
            log::error!("background writer panicked");
        } else {
            log::info!("background writer stopped");
        }
    }
}

impl Drop for Writer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run(cache: ObjectCache, shared: Arc<Shared>, interval: Duration) {
    while shared.running.load(Ordering::SeqCst) {
        {
            let mut woken = shared.woken.lock();
            if !*woken {
                shared.cond.wait_for(&mut woken, interval);
            }
            *woken = false;
        }
        if !shared.running.load(Ordering::SeqCst) {
            break;
        }
        match cache.write_back_pass() {
            Ok(0) => {}
            Ok(n) => log::debug!("background writer wrote {} records", n),
            Err(e) => fatal(&e, "background write-back"),
        }
    }
}
