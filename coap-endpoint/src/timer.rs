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

//! Millisecond-resolution timer scheduling.
//!
//! A [`TimerScheduler`] hands out a monotonically increasing `now` and
//! one-shot [`Timer`]s. Timers never fire spontaneously: the owner of the
//! scheduler (normally the [loop](crate::runloop)) advances the clock with
//! [`TimerScheduler::advance_to`], which fires every callback whose deadline
//! has been reached. Tests drive the clock by hand to get deterministic
//! timing.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// A timer callback. Always invoked on the thread that advances the
/// scheduler's clock.
pub type TimerCallback = Box<dyn FnOnce() + Send>;

/// Shared, clonable handle to a timer scheduler.
#[derive(Debug, Clone)]
pub struct TimerScheduler {
    inner: Arc<SchedulerInner>,
}

#[derive(Debug)]
struct SchedulerInner {
    now_ms: AtomicU64,
    queue: Mutex<TimerQueue>,
}

struct TimerQueue {
    next_timer_id: u64,
    next_seq: u64,
    heap: BinaryHeap<Reverse<Deadline>>,
    armed: HashMap<u64, ArmedTimer>,
}

impl std::fmt::Debug for TimerQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimerQueue")
            .field("armed", &self.armed.keys())
            .finish()
    }
}

#[derive(Debug, Eq, PartialEq, Ord, PartialOrd)]
struct Deadline {
    when: u64,
    seq: u64,
    timer_id: u64,
}

struct ArmedTimer {
    seq: u64,
    when: u64,
    callback: TimerCallback,
}

impl Default for TimerScheduler {
    fn default() -> Self {
        TimerScheduler::new()
    }
}

impl TimerScheduler {
    /// Creates a new scheduler with its clock at zero.
    pub fn new() -> TimerScheduler {
        TimerScheduler {
            inner: Arc::new(SchedulerInner {
                now_ms: AtomicU64::new(0),
                queue: Mutex::new(TimerQueue {
                    next_timer_id: 1,
                    next_seq: 0,
                    heap: BinaryHeap::new(),
                    armed: HashMap::new(),
                }),
            }),
        }
    }

    /// The current time, in milliseconds relative to the scheduler's origin.
    pub fn now(&self) -> u64 {
        self.inner.now_ms.load(Ordering::Acquire)
    }

    /// Creates a new, unscheduled one-shot timer.
    pub fn create_timer(&self) -> Timer {
        let mut queue = self.inner.queue.lock().expect("timer queue poisoned");
        let id = queue.next_timer_id;
        queue.next_timer_id += 1;
        Timer {
            id,
            scheduler: self.clone(),
        }
    }

    /// The deadline of the earliest armed timer, if any.
    pub fn next_deadline(&self) -> Option<u64> {
        let queue = self.inner.queue.lock().expect("timer queue poisoned");
        queue.armed.values().map(|armed| armed.when).min()
    }

    /// Moves the clock forward to `now_ms` and fires every timer whose
    /// deadline has been reached, in deadline order (schedule order on ties).
    ///
    /// The clock never moves backwards; an older `now_ms` only fires what is
    /// already due. Returns the number of timers fired.
    pub fn advance_to(&self, now_ms: u64) -> usize {
        let prev = self.inner.now_ms.load(Ordering::Acquire);
        if now_ms > prev {
            self.inner.now_ms.store(now_ms, Ordering::Release);
        }
        let now_ms = self.now();

        let mut fired = 0;
        loop {
            let callback = {
                let mut queue = self.inner.queue.lock().expect("timer queue poisoned");
                match queue.pop_due(now_ms) {
                    Some(x) => x,
                    None => break,
                }
            };

            // The lock is released while user code runs, so a callback may
            // re-schedule its own timer.
            callback();
            fired += 1;
        }
        fired
    }

    /// Moves the clock forward by `delta_ms`. See [`TimerScheduler::advance_to`].
    pub fn advance(&self, delta_ms: u64) -> usize {
        self.advance_to(self.now() + delta_ms)
    }

    fn schedule(&self, timer_id: u64, delay_ms: u64, callback: TimerCallback) {
        let when = self.now() + delay_ms;
        let mut queue = self.inner.queue.lock().expect("timer queue poisoned");
        let seq = queue.next_seq;
        queue.next_seq += 1;

        // Re-arming replaces any pending deadline; the stale heap entry is
        // skipped by the seq check on pop.
        queue.armed.insert(
            timer_id,
            ArmedTimer {
                seq,
                when,
                callback,
            },
        );
        queue.heap.push(Reverse(Deadline {
            when,
            seq,
            timer_id,
        }));
    }

    fn unschedule(&self, timer_id: u64) {
        let mut queue = self.inner.queue.lock().expect("timer queue poisoned");
        queue.armed.remove(&timer_id);
    }

    fn is_scheduled(&self, timer_id: u64) -> bool {
        let queue = self.inner.queue.lock().expect("timer queue poisoned");
        queue.armed.contains_key(&timer_id)
    }
}

impl TimerQueue {
    fn pop_due(&mut self, now_ms: u64) -> Option<TimerCallback> {
        while let Some(Reverse(deadline)) = self.heap.peek() {
            if deadline.when > now_ms {
                return None;
            }
            let Reverse(deadline) = self.heap.pop().expect("peeked entry present");

            match self.armed.get(&deadline.timer_id) {
                Some(armed) if armed.seq == deadline.seq => {
                    let armed = self
                        .armed
                        .remove(&deadline.timer_id)
                        .expect("armed entry just matched");
                    return Some(armed.callback);
                }
                // Stale entry from a re-arm or an unschedule.
                _ => continue,
            }
        }
        None
    }
}

/// A one-shot timer tied to a [`TimerScheduler`].
///
/// At most one deadline is pending per timer: scheduling again replaces the
/// previous deadline and callback. Dropping the timer unschedules it.
#[derive(Debug)]
pub struct Timer {
    id: u64,
    scheduler: TimerScheduler,
}

impl Timer {
    /// Arms this timer to invoke `callback` once `delay_ms` milliseconds have
    /// elapsed on the owning scheduler's clock.
    pub fn schedule<F>(&self, delay_ms: u64, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.scheduler
            .schedule(self.id, delay_ms, Box::new(callback));
    }

    /// Cancels any pending deadline. A no-op if the timer is not armed.
    pub fn unschedule(&self) {
        self.scheduler.unschedule(self.id);
    }

    /// Returns true if a deadline is currently pending.
    pub fn is_scheduled(&self) -> bool {
        self.scheduler.is_scheduled(self.id)
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.unschedule();
    }
}
