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

use std::fmt::{Debug, Display, Formatter};

/// Type for errors encountered while operating the endpoint, the loop, or the
/// transport seam.
#[derive(Debug, Eq, PartialEq, Hash, Copy, Clone)]
pub enum Error {
    /// An allocation failed or a fixed-size table is full.
    OutOfMemory,

    /// One or more of the supplied arguments are not valid for the given operation.
    InvalidParameters,

    /// The operation is not legal in the object's current state.
    InvalidState,

    /// The data could not be parsed.
    InvalidFormat,

    /// An offset or size falls outside of the addressable range.
    OutOfRange,

    /// There is not enough space in the given buffer to complete the operation.
    NotEnoughSpace,

    /// Operation timed out waiting for a response.
    Timeout,

    /// The transaction was reset by the peer.
    Reset,

    /// The operation cannot make progress right now and should be retried
    /// after the sink signals readiness. Not a terminal failure.
    WouldBlock,

    /// The referenced item does not exist (or no longer exists).
    NoSuchItem,

    /// A fixed-capacity resource pool is exhausted.
    OutOfResources,

    /// An internal inconsistency was detected.
    Internal,
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), std::fmt::Error> {
        <Self as Debug>::fmt(self, f)
    }
}

impl std::error::Error for Error {}

impl Default for Error {
    fn default() -> Self {
        Error::Internal
    }
}

impl std::convert::From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::WouldBlock {
            Error::WouldBlock
        } else {
            Error::Internal
        }
    }
}

impl From<std::fmt::Error> for Error {
    fn from(_err: std::fmt::Error) -> Self {
        Error::NotEnoughSpace
    }
}
