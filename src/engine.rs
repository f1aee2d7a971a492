//! The host event engine seam.
//!
//! The driver needs three capabilities from its host: run a closure on
//! some worker, run a closure after a delay, and try to cancel such a
//! delayed closure. [`EventEngine`] captures exactly those three.
//! [`TokioEngine`] implements them on a tokio runtime and is what
//! production setups will normally use; tests substitute a recording
//! engine.

#![warn(missing_docs)]
#![warn(clippy::missing_docs_in_private_items)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::task::JoinHandle;

/// A closure posted to the engine.
pub type TaskFn = Box<dyn FnOnce() + Send + 'static>;

//------------ TaskHandle ----------------------------------------------------

/// Identifies a delayed closure for cancellation.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct TaskHandle(u64);

#[cfg(test)]
impl TaskHandle {
    /// Wraps an engine-assigned id.
    pub(crate) fn from_raw(id: u64) -> Self {
        TaskHandle(id)
    }

    /// Returns the engine-assigned id.
    pub(crate) fn raw(self) -> u64 {
        self.0
    }
}

//------------ EventEngine ---------------------------------------------------

/// The capabilities the driver consumes from its host event loop.
///
/// Implementations must be callable from arbitrary threads and must
/// tolerate arbitrarily large delays passed to
/// [`run_after`][Self::run_after]; the driver uses `Duration::MAX` for
/// "effectively never".
pub trait EventEngine: Send + Sync {
    /// Runs a closure on some worker, outside the caller's stack.
    fn run(&self, f: TaskFn);

    /// Runs a closure after the given delay.
    fn run_after(&self, delay: Duration, f: TaskFn) -> TaskHandle;

    /// Attempts to cancel a delayed closure.
    ///
    /// Returns `true` iff the closure is guaranteed to never run. On
    /// `false` the closure has already run or is about to.
    fn cancel(&self, handle: TaskHandle) -> bool;
}

//------------ TokioEngine ---------------------------------------------------

/// An [`EventEngine`] running on a tokio runtime.
#[derive(Debug)]
pub struct TokioEngine {
    /// The runtime that executes posted closures.
    runtime: Handle,

    /// Source of task handle values.
    next_id: AtomicU64,

    /// Armed timers that have neither fired nor been cancelled.
    ///
    /// The entry is the claim: whoever removes it decides the timer's
    /// fate. The fire path runs the closure only if it could remove the
    /// entry; `cancel` reports success only if it could. The value is
    /// `None` for the moment between arming and the spawn returning.
    pending: Arc<Mutex<HashMap<u64, Option<JoinHandle<()>>>>>,
}

impl TokioEngine {
    /// Creates an engine on the current tokio runtime.
    ///
    /// # Panics
    ///
    /// Panics when called outside a tokio runtime.
    pub fn new() -> Self {
        Self::with_runtime(Handle::current())
    }

    /// Creates an engine on the given runtime.
    pub fn with_runtime(runtime: Handle) -> Self {
        TokioEngine {
            runtime,
            next_id: AtomicU64::new(1),
            pending: Default::default(),
        }
    }
}

impl EventEngine for TokioEngine {
    fn run(&self, f: TaskFn) {
        self.runtime.spawn(async move { f() });
    }

    fn run_after(&self, delay: Duration, f: TaskFn) -> TaskHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        // Arm before spawning so a zero-delay task finds its entry.
        self.pending.lock().expect("pending lock").insert(id, None);
        let pending = self.pending.clone();
        let join = self.runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            let claimed = pending
                .lock()
                .expect("pending lock")
                .remove(&id)
                .is_some();
            if claimed {
                f()
            }
        });
        let mut pending = self.pending.lock().expect("pending lock");
        if let Some(entry) = pending.get_mut(&id) {
            *entry = Some(join);
        }
        TaskHandle(id)
    }

    fn cancel(&self, handle: TaskHandle) -> bool {
        match self.pending.lock().expect("pending lock").remove(&handle.0) {
            Some(join) => {
                if let Some(join) = join {
                    // Dropping the aborted task also drops the closure
                    // and whatever it captured.
                    join.abort();
                }
                true
            }
            None => false,
        }
    }
}

//============ Tests =========================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    fn flag_task(flag: &Arc<AtomicBool>) -> TaskFn {
        let flag = flag.clone();
        Box::new(move || flag.store(true, Ordering::SeqCst))
    }

    #[tokio::test(start_paused = true)]
    async fn run_posts_to_a_worker() {
        let engine = TokioEngine::new();
        let fired = Arc::new(AtomicBool::new(false));
        engine.run(flag_task(&fired));
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert!(fired.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn run_after_fires_once_delay_passes() {
        let engine = TokioEngine::new();
        let fired = Arc::new(AtomicBool::new(false));
        engine.run_after(Duration::from_millis(10), flag_task(&fired));
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(!fired.load(Ordering::SeqCst));
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(fired.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn run_after_zero_delay_fires() {
        let engine = TokioEngine::new();
        let fired = Arc::new(AtomicBool::new(false));
        engine.run_after(Duration::ZERO, flag_task(&fired));
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert!(fired.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_before_fire_suppresses_the_closure() {
        let engine = TokioEngine::new();
        let fired = Arc::new(AtomicBool::new(false));
        let handle =
            engine.run_after(Duration::from_secs(3600), flag_task(&fired));
        assert!(engine.cancel(handle));
        tokio::time::sleep(Duration::from_secs(7200)).await;
        assert!(!fired.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_after_fire_reports_failure() {
        let engine = TokioEngine::new();
        let fired = Arc::new(AtomicBool::new(false));
        let handle =
            engine.run_after(Duration::from_millis(1), flag_task(&fired));
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(fired.load(Ordering::SeqCst));
        assert!(!engine.cancel(handle));
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_closure_is_dropped() {
        let engine = TokioEngine::new();
        let witness = Arc::new(());
        let captured = witness.clone();
        let handle = engine.run_after(
            Duration::from_secs(3600),
            Box::new(move || drop(captured)),
        );
        assert!(engine.cancel(handle));
        // Give the aborted task a chance to unwind.
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(Arc::strong_count(&witness), 1);
    }
}
