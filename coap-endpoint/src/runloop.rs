// Copyright 2019 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//

//! The single-threaded cooperative loop.
//!
//! All protocol state in this crate is mutated from one thread: the thread
//! that calls [`RunLoop::run`]. Other threads reach that thread through a
//! [`LoopHandle`], either fire-and-forget ([`LoopHandle::invoke_async`]) or
//! blocking for a result ([`LoopHandle::invoke_sync`]). Work items are
//! executed in FIFO order and always run to completion; waiting happens only
//! through [timers](crate::timer) or by returning to the loop's drain.
//!
//! ```
//! use coap_endpoint::runloop::RunLoop;
//!
//! let mut run_loop = RunLoop::new();
//! let handle = run_loop.handle();
//!
//! let thread = std::thread::spawn(move || run_loop.run());
//!
//! let answer = handle.invoke_sync(|| 6 * 7).unwrap();
//! assert_eq!(answer, 42);
//!
//! handle.request_termination();
//! thread.join().unwrap();
//! ```

use crate::timer::TimerScheduler;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError, Sender};
use std::sync::{mpsc, Arc, Condvar, Mutex, OnceLock};
use std::thread::ThreadId;
use std::time::{Duration, Instant};

use crate::Error;

type WorkItem = Box<dyn FnOnce() + Send>;

/// Idle poll period used when no timer deadline is pending.
const IDLE_POLL_MS: u64 = 250;

/// The cooperative loop. Owns the work queue consumer and the
/// [`TimerScheduler`] that all endpoint timers fire on.
#[derive(Debug)]
pub struct RunLoop {
    shared: Arc<LoopShared>,
    queue: Receiver<WorkItem>,
}

struct LoopShared {
    sender: Mutex<Option<Sender<WorkItem>>>,
    scheduler: TimerScheduler,
    loop_thread: Mutex<Option<ThreadId>>,
    terminating: AtomicBool,
}

impl std::fmt::Debug for LoopShared {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopShared")
            .field("terminating", &self.terminating)
            .finish()
    }
}

/// Clonable handle used to submit work to a [`RunLoop`] from any thread.
#[derive(Debug, Clone)]
pub struct LoopHandle {
    shared: Arc<LoopShared>,
}

impl Default for RunLoop {
    fn default() -> Self {
        RunLoop::new()
    }
}

impl RunLoop {
    /// Creates a new loop. It does nothing until [`RunLoop::run`] is called.
    pub fn new() -> RunLoop {
        let (sender, queue) = mpsc::channel();
        RunLoop {
            shared: Arc::new(LoopShared {
                sender: Mutex::new(Some(sender)),
                scheduler: TimerScheduler::new(),
                loop_thread: Mutex::new(None),
                terminating: AtomicBool::new(false),
            }),
            queue,
        }
    }

    /// Returns a handle for submitting work from other threads.
    pub fn handle(&self) -> LoopHandle {
        LoopHandle {
            shared: self.shared.clone(),
        }
    }

    /// The scheduler whose clock this loop advances while running.
    pub fn timer_scheduler(&self) -> TimerScheduler {
        self.shared.scheduler.clone()
    }

    /// Runs the loop on the calling thread until termination is requested.
    ///
    /// Drains queued work items in FIFO order, advances the timer clock with
    /// wall time, and sleeps until the next deadline or the next submission.
    pub fn run(&mut self) {
        *self
            .shared
            .loop_thread
            .lock()
            .expect("loop thread slot poisoned") = Some(std::thread::current().id());

        let origin = Instant::now();

        loop {
            // Run everything that is already queued.
            while let Ok(item) = self.queue.try_recv() {
                item();
            }

            self.shared
                .scheduler
                .advance_to(origin.elapsed().as_millis() as u64);

            if self.shared.terminating.load(Ordering::Acquire) {
                break;
            }

            let now = origin.elapsed().as_millis() as u64;
            let sleep_ms = match self.shared.scheduler.next_deadline() {
                Some(deadline) => deadline.saturating_sub(now),
                None => IDLE_POLL_MS,
            };

            match self.queue.recv_timeout(Duration::from_millis(sleep_ms)) {
                Ok(item) => item(),
                Err(RecvTimeoutError::Timeout) => (),
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        // Unblock any `invoke_sync` callers still queued: dropping the
        // unexecuted closures signals their completion cells.
        *self
            .shared
            .sender
            .lock()
            .expect("loop sender slot poisoned") = None;
        while let Ok(item) = self.queue.try_recv() {
            drop(item);
        }

        *self
            .shared
            .loop_thread
            .lock()
            .expect("loop thread slot poisoned") = None;

        log::debug!("loop terminated");
    }

    /// Convenience for the common case: creates a loop and runs it on a
    /// dedicated thread, returning the handle and the join handle.
    pub fn spawn() -> (LoopHandle, std::thread::JoinHandle<()>) {
        let mut run_loop = RunLoop::new();
        let handle = run_loop.handle();
        let thread = std::thread::Builder::new()
            .name("coap-loop".into())
            .spawn(move || run_loop.run())
            .expect("loop thread spawn failed");
        (handle, thread)
    }

    /// The process-wide shared loop, created (and its thread started) on
    /// first use. Prefer explicit loops; this exists for callers with a
    /// single stack and no place to put one.
    pub fn global() -> &'static LoopHandle {
        static GLOBAL: OnceLock<LoopHandle> = OnceLock::new();
        GLOBAL.get_or_init(|| RunLoop::spawn().0)
    }
}

impl LoopHandle {
    /// The scheduler whose clock the owning loop advances.
    pub fn timer_scheduler(&self) -> TimerScheduler {
        self.shared.scheduler.clone()
    }

    /// Returns true if the calling thread is the loop thread.
    pub fn is_loop_thread(&self) -> bool {
        *self
            .shared
            .loop_thread
            .lock()
            .expect("loop thread slot poisoned")
            == Some(std::thread::current().id())
    }

    /// Enqueues `work` to run on the loop thread and returns immediately.
    ///
    /// Items submitted from one thread run in submission order.
    pub fn invoke_async<F>(&self, work: F) -> Result<(), Error>
    where
        F: FnOnce() + Send + 'static,
    {
        self.submit(Box::new(work))
    }

    /// Runs `work` on the loop thread, blocking the caller until it has run
    /// to completion, and returns its result.
    ///
    /// When called from the loop thread itself, `work` runs inline. Fails
    /// with [`Error::InvalidState`] once the loop is terminating.
    pub fn invoke_sync<R, F>(&self, work: F) -> Result<R, Error>
    where
        R: Send + 'static,
        F: FnOnce() -> R + Send + 'static,
    {
        if self.is_loop_thread() {
            return Ok(work());
        }

        let cell = Arc::new(CompletionCell::new());
        let completion = Completion { cell: cell.clone() };

        self.submit(Box::new(move || {
            let value = work();
            completion.complete(value);
        }))?;

        cell.wait()
    }

    /// Asks the loop to stop after draining the work already queued.
    /// Idempotent; safe to call from any thread, including the loop itself.
    pub fn request_termination(&self) {
        self.shared.terminating.store(true, Ordering::Release);

        // Wake the loop if it is sleeping in the queue.
        let sender = self
            .shared
            .sender
            .lock()
            .expect("loop sender slot poisoned")
            .clone();
        if let Some(sender) = sender {
            let _ = sender.send(Box::new(|| ()));
        }
    }

    fn submit(&self, item: WorkItem) -> Result<(), Error> {
        if self.shared.terminating.load(Ordering::Acquire) {
            return Err(Error::InvalidState);
        }

        let sender = self
            .shared
            .sender
            .lock()
            .expect("loop sender slot poisoned")
            .clone();

        match sender {
            Some(sender) => sender.send(item).map_err(|_| Error::InvalidState),
            None => Err(Error::InvalidState),
        }
    }
}

struct CompletionCell<R> {
    state: Mutex<CompletionState<R>>,
    cond: Condvar,
}

struct CompletionState<R> {
    done: bool,
    value: Option<R>,
}

impl<R> CompletionCell<R> {
    fn new() -> CompletionCell<R> {
        CompletionCell {
            state: Mutex::new(CompletionState {
                done: false,
                value: None,
            }),
            cond: Condvar::new(),
        }
    }

    fn signal(&self, value: Option<R>) {
        let mut state = self.state.lock().expect("completion cell poisoned");
        if !state.done {
            state.done = true;
            state.value = value;
            self.cond.notify_all();
        }
    }

    fn wait(&self) -> Result<R, Error> {
        let mut state = self.state.lock().expect("completion cell poisoned");
        while !state.done {
            state = self
                .cond
                .wait(state)
                .expect("completion cell poisoned");
        }
        state.value.take().ok_or(Error::InvalidState)
    }
}

/// Completion guard: signals a value when the work item runs, or signals
/// abandonment when the item is dropped unexecuted (loop shut down first).
struct Completion<R> {
    cell: Arc<CompletionCell<R>>,
}

impl<R> Completion<R> {
    fn complete(&self, value: R) {
        self.cell.signal(Some(value));
    }
}

impl<R> Drop for Completion<R> {
    fn drop(&mut self) {
        // No-op when the value was already delivered; unblocks the caller
        // with an error when the closure never ran.
        self.cell.signal(None);
    }
}
