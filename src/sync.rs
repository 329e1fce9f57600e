//! # Threading Primitives
//!
//! The harness runs on a handful of native threads: the orchestrator loop,
//! an optional receive thread per reader and short-lived timer threads. This
//! module holds the few primitives they share:
//!
//! - [`BinarySemaphore`]: the ping/pong hand-off between the send loop and
//!   the latency listener
//! - [`Timeout`]: a cancellable timer that raises an atomic flag when it fires
//! - [`wall_clock_usec`]: the microsecond clock stamped into messages
//! - [`spawn_named`]: thread creation with optional core pinning
//! - [`spin`] / [`calibrate_spins_per_usec`]: busy-wait pacing

use anyhow::{Context, Result};
use crossbeam::channel::{self, RecvTimeoutError, Sender};
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

/// A semaphore whose count saturates at one.
///
/// `give` on an already signalled semaphore is a no-op, so a late pong can
/// never release more than one waiting ping.
#[derive(Debug, Default)]
pub struct BinarySemaphore {
    signalled: Mutex<bool>,
    condvar: Condvar,
}

impl BinarySemaphore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn give(&self) {
        let mut signalled = self.signalled.lock();
        *signalled = true;
        self.condvar.notify_one();
    }

    /// Take the semaphore, waiting at most `timeout` (forever when `None`).
    ///
    /// Returns false if the timeout elapsed first.
    pub fn take(&self, timeout: Option<Duration>) -> bool {
        let mut signalled = self.signalled.lock();
        match timeout {
            None => {
                while !*signalled {
                    self.condvar.wait(&mut signalled);
                }
            }
            Some(timeout) => {
                let deadline = Instant::now() + timeout;
                while !*signalled {
                    if self
                        .condvar
                        .wait_until(&mut signalled, deadline)
                        .timed_out()
                    {
                        break;
                    }
                }
            }
        }
        std::mem::replace(&mut *signalled, false)
    }

    /// Like [`take`](Self::take), but an unbounded wait wakes every `poll`
    /// and gives up once `cancelled` returns true.
    pub fn take_unless(
        &self,
        timeout: Option<Duration>,
        poll: Duration,
        cancelled: impl Fn() -> bool,
    ) -> bool {
        if timeout.is_some() {
            return self.take(timeout);
        }
        loop {
            if self.take(Some(poll)) {
                return true;
            }
            if cancelled() {
                return false;
            }
        }
    }
}

/// Microseconds since the Unix epoch.
///
/// Pings are stamped with this clock and pongs are compared against it, so
/// publisher and subscribers on different hosts must share a synchronized
/// wall clock. A clock that goes backwards shows up as clock skew in the
/// latency summary.
pub fn wall_clock_usec() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_micros() as u64)
        .unwrap_or(0)
}

/// A one-shot timer that sets a shared flag when it fires.
///
/// Dropping the handle before the deadline cancels the timer without
/// touching the flag.
pub struct Timeout {
    cancel: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl Timeout {
    pub fn start(duration: Duration, flag: Arc<AtomicBool>) -> Result<Self> {
        let (cancel, cancelled) = channel::bounded::<()>(1);
        let handle = thread::Builder::new()
            .name("perftest-timer".to_string())
            .spawn(move || {
                if let Err(RecvTimeoutError::Timeout) = cancelled.recv_timeout(duration) {
                    debug!("Timer fired after {:?}", duration);
                    flag.store(true, Ordering::Release);
                }
            })
            .context("Failed to spawn timer thread")?;
        Ok(Self {
            cancel: Some(cancel),
            handle: Some(handle),
        })
    }
}

impl Drop for Timeout {
    fn drop(&mut self) {
        // Disconnecting the channel wakes the timer thread immediately.
        self.cancel.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// Spawn a named thread, optionally pinned to a CPU core.
pub fn spawn_named<F, T>(name: &str, core: Option<usize>, f: F) -> Result<JoinHandle<T>>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    let thread_name = name.to_string();
    thread::Builder::new()
        .name(thread_name.clone())
        .spawn(move || {
            if let Some(core) = core {
                pin_current_thread(&thread_name, core);
            }
            f()
        })
        .with_context(|| format!("Failed to spawn thread '{}'", name))
}

fn pin_current_thread(name: &str, core: usize) {
    let cores = core_affinity::get_core_ids().unwrap_or_default();
    match cores.into_iter().find(|id| id.id == core) {
        Some(core_id) => {
            if core_affinity::set_for_current(core_id) {
                debug!("Pinned thread '{}' to core {}", name, core);
            } else {
                warn!("Failed to pin thread '{}' to core {}", name, core);
            }
        }
        None => warn!("Core {} is not available, thread '{}' is not pinned", core, name),
    }
}

/// Busy-wait for `count` iterations.
#[inline]
pub fn spin(count: u64) {
    for i in 0..count {
        std::hint::black_box(i);
        std::hint::spin_loop();
    }
}

/// Measure how many [`spin`] iterations fit into one microsecond.
pub fn calibrate_spins_per_usec() -> u64 {
    const CALIBRATION_SPINS: u64 = 20_000_000;
    let start = Instant::now();
    spin(CALIBRATION_SPINS);
    let elapsed = start.elapsed().as_micros() as u64;
    if elapsed == 0 {
        return CALIBRATION_SPINS;
    }
    CALIBRATION_SPINS / elapsed
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn semaphore_saturates_at_one() {
        let semaphore = BinarySemaphore::new();
        semaphore.give();
        semaphore.give();
        assert!(semaphore.take(Some(Duration::from_millis(1))));
        assert!(!semaphore.take(Some(Duration::from_millis(5))));
    }

    #[test]
    fn semaphore_wakes_waiter() {
        let semaphore = Arc::new(BinarySemaphore::new());
        let giver = Arc::clone(&semaphore);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            giver.give();
        });
        assert!(semaphore.take(None));
        handle.join().unwrap();
    }

    #[test]
    fn unbounded_take_gives_up_when_cancelled() {
        let semaphore = BinarySemaphore::new();
        let cancel = Arc::new(AtomicBool::new(false));
        let setter = Arc::clone(&cancel);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            setter.store(true, Ordering::Release);
        });
        let taken = semaphore.take_unless(None, Duration::from_millis(5), || {
            cancel.load(Ordering::Acquire)
        });
        assert!(!taken);
        handle.join().unwrap();

        semaphore.give();
        assert!(semaphore.take_unless(None, Duration::from_millis(5), || true));
    }

    #[test]
    fn timeout_sets_flag() {
        let flag = Arc::new(AtomicBool::new(false));
        let _timer = Timeout::start(Duration::from_millis(10), Arc::clone(&flag)).unwrap();
        let deadline = Instant::now() + Duration::from_secs(2);
        while !flag.load(Ordering::Acquire) && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
        assert!(flag.load(Ordering::Acquire));
    }

    #[test]
    fn dropped_timeout_never_fires() {
        let flag = Arc::new(AtomicBool::new(false));
        let timer = Timeout::start(Duration::from_millis(50), Arc::clone(&flag)).unwrap();
        drop(timer);
        thread::sleep(Duration::from_millis(80));
        assert!(!flag.load(Ordering::Acquire));
    }

    #[test]
    fn named_thread_keeps_name() {
        let handle = spawn_named("perftest-test", None, || {
            thread::current().name().map(str::to_string)
        })
        .unwrap();
        assert_eq!(handle.join().unwrap().as_deref(), Some("perftest-test"));
    }

    #[test]
    fn wall_clock_moves_forward() {
        let first = wall_clock_usec();
        thread::sleep(Duration::from_millis(2));
        assert!(wall_clock_usec() > first);
    }
}
