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

//! The byte-oriented transport seam.
//!
//! An endpoint neither owns a socket nor knows what is below it: it writes
//! outbound datagrams into a [`DataSink`] and is fed inbound datagrams as a
//! `DataSink` itself, by whatever [`DataSource`] the transport stack exposes.
//! Back-pressure is explicit: a sink that cannot accept a buffer returns
//! [`Error::WouldBlock`] and later wakes its registered
//! [`DataSinkListener`] when it can make progress again.

use crate::Error;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, Weak};

/// Metadata accompanying a buffer across the transport seam.
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct BufferMetadata {
    /// Transport-defined peer identity, when the link distinguishes peers.
    pub peer: Option<String>,
}

/// Consumer side of the byte pump.
pub trait DataSink: Send + Sync {
    /// Hands one datagram to the sink.
    ///
    /// Returns [`Error::WouldBlock`] when the sink is congested; the caller
    /// should hold the buffer and retry after
    /// [`DataSinkListener::on_can_put`] fires.
    fn put_data(&self, data: &[u8], metadata: Option<&BufferMetadata>) -> Result<(), Error>;

    /// Registers the listener to wake when the sink can accept data again.
    /// Passing `None` clears it.
    fn set_listener(&self, listener: Option<Weak<dyn DataSinkListener>>);
}

/// Wake-up callback registered with a [`DataSink`].
pub trait DataSinkListener: Send + Sync {
    /// The sink that previously returned [`Error::WouldBlock`] can accept
    /// data again.
    fn on_can_put(&self);
}

/// Producer side of the byte pump.
pub trait DataSource: Send + Sync {
    /// Connects the sink that will receive this source's datagrams.
    /// Passing `None` disconnects.
    fn set_data_sink(&self, sink: Option<Arc<dyn DataSink>>);
}

/// An in-memory sink that records every datagram it accepts.
///
/// Congestion is scriptable: [`MemorySink::reject_next`] makes the next
/// `put_data` calls fail with [`Error::WouldBlock`], and
/// [`MemorySink::notify_can_put`] fires the registered listener the way a
/// real transport would once it drains.
#[derive(Default)]
pub struct MemorySink {
    state: Mutex<MemorySinkState>,
}

#[derive(Default)]
struct MemorySinkState {
    datagrams: VecDeque<Vec<u8>>,
    reject_count: usize,
    listener: Option<Weak<dyn DataSinkListener>>,
}

impl std::fmt::Debug for MemorySink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock().expect("sink state poisoned");
        f.debug_struct("MemorySink")
            .field("queued", &state.datagrams.len())
            .field("reject_count", &state.reject_count)
            .finish()
    }
}

impl MemorySink {
    /// Creates an empty sink that accepts everything.
    pub fn new() -> Arc<MemorySink> {
        Arc::new(MemorySink::default())
    }

    /// Makes the next `count` calls to `put_data` fail with `WouldBlock`.
    pub fn reject_next(&self, count: usize) {
        self.state.lock().expect("sink state poisoned").reject_count = count;
    }

    /// Removes and returns the oldest accepted datagram.
    pub fn pop(&self) -> Option<Vec<u8>> {
        self.state
            .lock()
            .expect("sink state poisoned")
            .datagrams
            .pop_front()
    }

    /// Removes and returns every accepted datagram, oldest first.
    pub fn take_all(&self) -> Vec<Vec<u8>> {
        self.state
            .lock()
            .expect("sink state poisoned")
            .datagrams
            .drain(..)
            .collect()
    }

    /// Number of datagrams currently held.
    pub fn len(&self) -> usize {
        self.state
            .lock()
            .expect("sink state poisoned")
            .datagrams
            .len()
    }

    /// Returns true when no datagrams are held.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Fires the registered listener, as a draining transport would.
    pub fn notify_can_put(&self) {
        let listener = self
            .state
            .lock()
            .expect("sink state poisoned")
            .listener
            .clone();
        if let Some(listener) = listener.and_then(|weak| weak.upgrade()) {
            listener.on_can_put();
        }
    }
}

impl DataSink for MemorySink {
    fn put_data(&self, data: &[u8], _metadata: Option<&BufferMetadata>) -> Result<(), Error> {
        let mut state = self.state.lock().expect("sink state poisoned");
        if state.reject_count > 0 {
            state.reject_count -= 1;
            return Err(Error::WouldBlock);
        }
        state.datagrams.push_back(data.to_vec());
        Ok(())
    }

    fn set_listener(&self, listener: Option<Weak<dyn DataSinkListener>>) {
        self.state.lock().expect("sink state poisoned").listener = listener;
    }
}

/// One end of an in-memory datagram link.
///
/// Datagrams put into this end are delivered, synchronously and in order, to
/// the sink registered on the *other* end. Two ends form a full link; see
/// [`pipe`].
pub struct PipeEnd {
    peer: Mutex<Weak<PipeEnd>>,
    local_sink: Mutex<Option<Arc<dyn DataSink>>>,
}

impl std::fmt::Debug for PipeEnd {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipeEnd").finish()
    }
}

/// Creates a symmetric in-memory link: datagrams put into one end come out of
/// the sink registered (via [`DataSource::set_data_sink`]) on the other end.
pub fn pipe() -> (Arc<PipeEnd>, Arc<PipeEnd>) {
    let a = Arc::new(PipeEnd {
        peer: Mutex::new(Weak::new()),
        local_sink: Mutex::new(None),
    });
    let b = Arc::new(PipeEnd {
        peer: Mutex::new(Weak::new()),
        local_sink: Mutex::new(None),
    });
    *a.peer.lock().expect("pipe peer poisoned") = Arc::downgrade(&b);
    *b.peer.lock().expect("pipe peer poisoned") = Arc::downgrade(&a);
    (a, b)
}

impl DataSource for PipeEnd {
    fn set_data_sink(&self, sink: Option<Arc<dyn DataSink>>) {
        *self.local_sink.lock().expect("pipe sink poisoned") = sink;
    }
}

impl DataSink for PipeEnd {
    fn put_data(&self, data: &[u8], metadata: Option<&BufferMetadata>) -> Result<(), Error> {
        let peer = self.peer.lock().expect("pipe peer poisoned").upgrade();
        let sink = peer.and_then(|peer| {
            peer.local_sink
                .lock()
                .expect("pipe sink poisoned")
                .clone()
        });
        match sink {
            Some(sink) => sink.put_data(data, metadata),
            // No receiver: the link drops the datagram, like an unconnected
            // datagram socket.
            None => Ok(()),
        }
    }

    fn set_listener(&self, _listener: Option<Weak<dyn DataSinkListener>>) {}
}
