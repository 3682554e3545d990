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

//! Lazy payload materialization.
//!
//! A [`BufferSource`] produces a request body on demand, at the moment the
//! message is serialized, so the body can reflect state that changes between
//! submission and transmission. The [event
//! emitter](../../coap_event_emitter/index.html) is the main client: its
//! payload is the set of events in flight when the request hits the wire.

use crate::Error;

/// A payload produced on demand.
///
/// [`data_size`](BufferSource::data_size) is called first to size the
/// message buffer; [`fill_data`](BufferSource::fill_data) is then handed a
/// buffer of exactly that many bytes. Both calls happen back-to-back on the
/// loop thread.
pub trait BufferSource: Send + Sync {
    /// The exact number of payload bytes [`fill_data`](BufferSource::fill_data)
    /// will produce right now.
    fn data_size(&self) -> usize;

    /// Writes the payload into `out`, whose length equals the preceding
    /// [`data_size`](BufferSource::data_size) result.
    fn fill_data(&self, out: &mut [u8]) -> Result<(), Error>;
}

/// A [`BufferSource`] over a fixed byte buffer.
#[derive(Debug, Clone)]
pub struct VecBufferSource {
    data: Vec<u8>,
}

impl VecBufferSource {
    /// Creates a source yielding the given bytes.
    pub fn new(data: impl Into<Vec<u8>>) -> VecBufferSource {
        VecBufferSource { data: data.into() }
    }
}

impl BufferSource for VecBufferSource {
    fn data_size(&self) -> usize {
        self.data.len()
    }

    fn fill_data(&self, out: &mut [u8]) -> Result<(), Error> {
        if out.len() != self.data.len() {
            return Err(Error::InvalidParameters);
        }
        out.copy_from_slice(&self.data);
        Ok(())
    }
}
