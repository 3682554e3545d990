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

//! Reliable CoAP event emission.
//!
//! A [`CoapEventEmitter`] delivers a coalesced set of event-type identifiers
//! to a remote CoAP resource, at least once each. Events are set with a
//! latency window; when the earliest window closes, every currently-set
//! event is POSTed in one request. The set is only cleared once the server
//! answers `2.04 Changed`, so events survive timeouts, transport errors, and
//! process-visible failures in between:
//!
//! * `2.04 Changed` clears exactly the events that were in flight.
//! * A 4.xx response gives up on the in-flight events (the server has
//!   rejected them; retrying cannot help).
//! * Any other response, or a non-timeout error, re-emits after
//!   `retry_delay`.
//! * A timeout re-emits immediately (the retransmission back-off already
//!   spaced the attempts).
//!
//! The request payload is a protobuf message holding one varint field
//! (field number 1) per event. It is encoded by hand so this crate carries
//! no schema or protobuf runtime; the format is a single tag byte `0x08`
//! followed by a minimal-length varint, repeated.

#![warn(rust_2018_idioms)]
#![warn(missing_debug_implementations)]
#![warn(clippy::all)]
#![warn(missing_docs)]

use coap_endpoint::buffer_source::BufferSource;
use coap_endpoint::endpoint::{
    ClientParameters, Endpoint, RequestHandle, ResponseListener,
};
use coap_endpoint::inspect::{Inspectable, Inspector};
use coap_endpoint::message::{MessageRead, MsgCode};
use coap_endpoint::option::{split_path_or_query, OptionNumber, OptionParam};
use coap_endpoint::timer::{Timer, TimerScheduler};
use coap_endpoint::Error;
use std::sync::{Arc, Mutex, Weak};

/// Default pause before re-emitting after a failure, in milliseconds.
pub const DEFAULT_RETRY_DELAY_MS: u64 = 30_000;

/// Default age below which an in-flight request is not preempted by a new
/// event, in milliseconds.
pub const DEFAULT_MIN_REQUEST_AGE_MS: u64 = 5_000;

/// Maximum number of path segments in the emitter's target resource path.
pub const MAX_PATH_SEGMENTS: usize = 4;

#[derive(Debug, Copy, Clone, Default)]
struct Entry {
    /// Event type, or 0 when the slot is free.
    event_type: u32,

    /// Window end in scheduler time.
    window_end: u64,

    /// True when the event is part of the outgoing request.
    in_flight: bool,
}

#[derive(Debug)]
struct InFlight {
    handle: RequestHandle,
    sent_at: u64,
}

#[derive(Debug)]
struct State {
    entries: Vec<Entry>,
    request: Option<InFlight>,

    /// Bumped on every terminal request outcome, so an emission can tell
    /// whether its own request completed while it was being submitted.
    completions: u64,
}

/// Reliable, coalescing event-delivery service over a CoAP endpoint.
pub struct CoapEventEmitter {
    inner: Arc<EmitterInner>,
}

impl std::fmt::Debug for CoapEventEmitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock().expect("emitter state poisoned");
        f.debug_struct("CoapEventEmitter")
            .field("events", &state.entries.iter().filter(|e| e.event_type != 0).count())
            .field("in_flight", &state.request.is_some())
            .finish()
    }
}

struct EmitterInner {
    self_weak: Weak<EmitterInner>,
    endpoint: Endpoint,
    scheduler: TimerScheduler,
    timer: Timer,
    path_options: Vec<OptionParam>,
    retry_delay_ms: u64,
    min_request_age_ms: u64,
    state: Mutex<State>,
}

enum UpdateStep {
    CancelStale(RequestHandle),
    Emit,
    Schedule(u64),
    Idle,
}

impl CoapEventEmitter {
    /// Creates an emitter POSTing to `path` on the peer reachable through
    /// `endpoint`.
    ///
    /// `max_events` fixes the size of the event table. Zero values for
    /// `retry_delay_ms` and `min_request_age_ms` select
    /// [`DEFAULT_RETRY_DELAY_MS`] and [`DEFAULT_MIN_REQUEST_AGE_MS`].
    /// The path may have at most [`MAX_PATH_SEGMENTS`] segments.
    pub fn new(
        endpoint: Endpoint,
        path: &str,
        scheduler: TimerScheduler,
        max_events: usize,
        retry_delay_ms: u64,
        min_request_age_ms: u64,
    ) -> Result<CoapEventEmitter, Error> {
        if max_events == 0 {
            return Err(Error::InvalidParameters);
        }

        let path_options =
            split_path_or_query(path, '/', OptionNumber::URI_PATH, MAX_PATH_SEGMENTS)?;

        let timer = scheduler.create_timer();

        let inner = Arc::new_cyclic(|self_weak| EmitterInner {
            self_weak: self_weak.clone(),
            endpoint,
            scheduler,
            timer,
            path_options,
            retry_delay_ms: if retry_delay_ms == 0 {
                DEFAULT_RETRY_DELAY_MS
            } else {
                retry_delay_ms
            },
            min_request_age_ms: if min_request_age_ms == 0 {
                DEFAULT_MIN_REQUEST_AGE_MS
            } else {
                min_request_age_ms
            },
            state: Mutex::new(State {
                entries: vec![Entry::default(); max_events],
                request: None,
                completions: 0,
            }),
        });

        Ok(CoapEventEmitter { inner })
    }

    /// Sets (or refreshes) an event.
    ///
    /// The event will be delivered no later than `max_latency_ms` from now,
    /// coalesced with whatever else is set by then. Setting an event that is
    /// already present only moves its window; it does not clear its
    /// in-flight mark. Fails with [`Error::OutOfResources`] when the table
    /// is full, and [`Error::InvalidParameters`] for the reserved type 0.
    pub fn set_event(&self, event_type: u32, max_latency_ms: u64) -> Result<(), Error> {
        if event_type == 0 {
            return Err(Error::InvalidParameters);
        }

        let window_end = self.inner.scheduler.now() + max_latency_ms;

        {
            let mut state = self.inner.state.lock().expect("emitter state poisoned");

            let existing = state
                .entries
                .iter_mut()
                .find(|e| e.event_type == event_type);
            match existing {
                Some(entry) => {
                    entry.window_end = window_end;
                }
                None => {
                    let free = state.entries.iter_mut().find(|e| e.event_type == 0);
                    match free {
                        Some(entry) => {
                            *entry = Entry {
                                event_type,
                                window_end,
                                in_flight: false,
                            };
                        }
                        None => {
                            log::error!("no space for event 0x{:08x}", event_type);
                            return Err(Error::OutOfResources);
                        }
                    }
                }
            }
        }

        self.inner.update();
        Ok(())
    }

    /// Clears an event that has not yet been confirmed delivered.
    /// Fails with [`Error::NoSuchItem`] when the event is not set.
    pub fn unset_event(&self, event_type: u32) -> Result<(), Error> {
        {
            let mut state = self.inner.state.lock().expect("emitter state poisoned");
            let entry = state
                .entries
                .iter_mut()
                .find(|e| e.event_type == event_type && event_type != 0);
            match entry {
                Some(entry) => *entry = Entry::default(),
                None => return Err(Error::NoSuchItem),
            }
        }

        self.inner.update();
        Ok(())
    }

    /// Returns true while `event_type` is set (delivery not yet confirmed).
    pub fn event_is_set(&self, event_type: u32) -> bool {
        self.inner
            .state
            .lock()
            .expect("emitter state poisoned")
            .entries
            .iter()
            .any(|e| e.event_type == event_type && event_type != 0)
    }
}

impl Drop for CoapEventEmitter {
    fn drop(&mut self) {
        let request = self
            .inner
            .state
            .lock()
            .expect("emitter state poisoned")
            .request
            .take();
        if let Some(request) = request {
            let _ = self.inner.endpoint.cancel_request(request.handle);
        }
        self.inner.timer.unschedule();
    }
}

impl Inspectable for CoapEventEmitter {
    fn inspect(&self, inspector: &mut dyn Inspector) {
        let state = self.inner.state.lock().expect("emitter state poisoned");
        inspector.on_object_start("event_emitter");
        inspector.on_bool("request_in_flight", state.request.is_some());
        for entry in state.entries.iter().filter(|e| e.event_type != 0) {
            inspector.on_object_start("event");
            inspector.on_uint("type", entry.event_type as u64);
            inspector.on_uint("window_end", entry.window_end);
            inspector.on_bool("in_flight", entry.in_flight);
            inspector.on_object_end();
        }
        inspector.on_object_end();
    }
}

impl EmitterInner {
    fn arc(&self) -> Arc<EmitterInner> {
        self.self_weak.upgrade().expect("emitter alive")
    }

    /// Reconciles timers and the outgoing request with the event table.
    fn update(&self) {
        loop {
            let step = {
                let mut state = self.state.lock().expect("emitter state poisoned");
                let now = self.scheduler.now();

                if let Some(request) = &state.request {
                    let age = now.saturating_sub(request.sent_at);
                    if age > self.min_request_age_ms {
                        log::debug!("in-flight request is old enough to be canceled");
                        let handle = request.handle;
                        state.request = None;
                        UpdateStep::CancelStale(handle)
                    } else {
                        log::debug!("request still in flight");
                        UpdateStep::Idle
                    }
                } else {
                    match state
                        .entries
                        .iter()
                        .filter(|e| e.event_type != 0)
                        .map(|e| e.window_end)
                        .min()
                    {
                        None => UpdateStep::Idle,
                        Some(next_window_end) if next_window_end <= now => UpdateStep::Emit,
                        Some(next_window_end) => UpdateStep::Schedule(next_window_end - now),
                    }
                }
            };

            match step {
                UpdateStep::CancelStale(handle) => {
                    if let Err(e) = self.endpoint.cancel_request(handle) {
                        log::debug!("stale cancel came too late: {}", e);
                    }
                    // Re-evaluate with the request slot now free.
                    continue;
                }
                UpdateStep::Emit => {
                    self.emit();
                    return;
                }
                UpdateStep::Schedule(delay) => {
                    log::debug!("scheduling emission in {} ms", delay);
                    let weak = self.self_weak.clone();
                    self.timer.schedule(delay, move || {
                        if let Some(inner) = weak.upgrade() {
                            inner.update();
                        }
                    });
                    return;
                }
                UpdateStep::Idle => return,
            }
        }
    }

    /// Marks every set event in-flight and POSTs the set.
    fn emit(&self) {
        let completions_before = {
            let mut state = self.state.lock().expect("emitter state poisoned");
            for entry in state.entries.iter_mut() {
                if entry.event_type != 0 {
                    entry.in_flight = true;
                }
            }
            state.completions
        };

        let listener = self.arc() as Arc<dyn ResponseListener>;
        let result = self.endpoint.send_request_from_buffer_source(
            MsgCode::MethodPost,
            &self.path_options,
            self,
            Some(ClientParameters::default()),
            listener,
        );

        let now = self.scheduler.now();
        match result {
            Ok(handle) => {
                let mut state = self.state.lock().expect("emitter state poisoned");
                if state.completions == completions_before {
                    state.request = Some(InFlight {
                        handle,
                        sent_at: now,
                    });
                    if self.timer.is_scheduled() {
                        self.timer.unschedule();
                    }
                } else {
                    // The request already came to an outcome while it was
                    // being submitted; the handle is stale.
                    drop(state);
                    self.update();
                }
            }
            Err(e) => {
                log::warn!("emission failed ({}), will retry later", e);
                let weak = self.self_weak.clone();
                self.timer.schedule(self.retry_delay_ms, move || {
                    if let Some(inner) = weak.upgrade() {
                        inner.update();
                    }
                });
            }
        }
    }

    fn clear_in_flight_entries(state: &mut State) {
        for entry in state.entries.iter_mut() {
            if entry.in_flight {
                log::trace!("clearing event 0x{:08x}", entry.event_type);
                *entry = Entry::default();
            }
        }
    }

    fn schedule_retry(&self) {
        let weak = self.self_weak.clone();
        self.timer.schedule(self.retry_delay_ms, move || {
            if let Some(inner) = weak.upgrade() {
                inner.update();
            }
        });
    }
}

impl BufferSource for EmitterInner {
    fn data_size(&self) -> usize {
        let state = self.state.lock().expect("emitter state poisoned");
        state
            .entries
            .iter()
            .filter(|e| e.in_flight)
            .map(|e| 1 + varint_size(e.event_type))
            .sum()
    }

    fn fill_data(&self, out: &mut [u8]) -> Result<(), Error> {
        let state = self.state.lock().expect("emitter state poisoned");
        let mut at = 0;
        for entry in state.entries.iter().filter(|e| e.in_flight) {
            if at >= out.len() {
                return Err(Error::NotEnoughSpace);
            }
            out[at] = 1 << 3; // field_number = 1, wire_type = 0 (varint)
            at += 1;
            at += write_varint(entry.event_type, &mut out[at..])?;
        }
        if at != out.len() {
            return Err(Error::Internal);
        }
        Ok(())
    }
}

impl ResponseListener for EmitterInner {
    fn on_ack(&self) {}

    fn on_next(&self, message: &dyn MessageRead) {
        let code = message.msg_code();

        {
            let mut state = self.state.lock().expect("emitter state poisoned");
            state.completions += 1;
            state.request = None;

            if code == MsgCode::SuccessChanged {
                EmitterInner::clear_in_flight_entries(&mut state);
            } else if code.is_client_error() {
                // The server rejected the emission; retrying the same set
                // cannot succeed.
                log::error!("event emission rejected ({}), giving up", code);
                EmitterInner::clear_in_flight_entries(&mut state);
            } else {
                log::warn!("unexpected emission response: {}", code);
                drop(state);
                self.schedule_retry();
                return;
            }
        }

        self.update();
    }

    fn on_complete(&self) {}

    fn on_error(&self, error: Error, message: &str) {
        log::debug!("emission error {} ({}), will retry", error, message);

        {
            let mut state = self.state.lock().expect("emitter state poisoned");
            state.completions += 1;
            state.request = None;
        }

        if error == Error::Timeout {
            // The retransmission back-off already paced the attempts.
            self.update();
        } else {
            self.schedule_retry();
        }
    }
}

/// The encoded size of `value` as a protobuf varint.
fn varint_size(mut value: u32) -> usize {
    let mut size = 1;
    while value >= 0x80 {
        value >>= 7;
        size += 1;
    }
    size
}

/// Writes `value` as a protobuf varint, returning the number of bytes used.
fn write_varint(mut value: u32, out: &mut [u8]) -> Result<usize, Error> {
    let mut at = 0;
    loop {
        if at >= out.len() {
            return Err(Error::NotEnoughSpace);
        }
        if value >= 0x80 {
            out[at] = (value as u8 & 0x7F) | 0x80;
            value >>= 7;
            at += 1;
        } else {
            out[at] = value as u8;
            return Ok(at + 1);
        }
    }
}
