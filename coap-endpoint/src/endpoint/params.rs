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

//! Per-request transmission parameters and the retransmission schedule.

/// Default number of CON retransmit attempts (RFC 7252 `MAX_RETRANSMIT`).
pub const DEFAULT_MAX_RESEND_COUNT: u32 = 4;

/// Default initial CON retransmit timer, in milliseconds (RFC 7252
/// `ACK_TIMEOUT`).
pub const DEFAULT_ACK_TIMEOUT_MS: u64 = 2000;

/// Upper bound on the back-off doubling, expressed as a shift count.
const MAX_BACKOFF_SHIFT: u32 = 16;

/// Per-request transmission parameters.
///
/// A zero or negative field selects the default, so `Default::default()`
/// asks for standard RFC 7252 behavior.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct ClientParameters {
    /// Maximum CON retransmit attempts; `<= 0` selects
    /// [`DEFAULT_MAX_RESEND_COUNT`].
    pub max_resend_count: i32,

    /// Initial CON retransmit timer in milliseconds; `<= 0` selects
    /// [`DEFAULT_ACK_TIMEOUT_MS`].
    pub ack_timeout_ms: i64,

    /// When false the request is sent non-confirmable (NON): no
    /// retransmission, no ACK expected.
    pub confirmable: bool,
}

impl Default for ClientParameters {
    fn default() -> Self {
        ClientParameters {
            max_resend_count: 0,
            ack_timeout_ms: 0,
            confirmable: true,
        }
    }
}

impl ClientParameters {
    /// Parameters for a non-confirmable request with default timing.
    pub fn non_confirmable() -> ClientParameters {
        ClientParameters {
            confirmable: false,
            ..Default::default()
        }
    }

    pub(crate) fn resolve(&self) -> ResolvedParams {
        ResolvedParams {
            max_resend_count: if self.max_resend_count <= 0 {
                DEFAULT_MAX_RESEND_COUNT
            } else {
                self.max_resend_count as u32
            },
            ack_timeout_ms: if self.ack_timeout_ms <= 0 {
                DEFAULT_ACK_TIMEOUT_MS
            } else {
                self.ack_timeout_ms as u64
            },
            confirmable: self.confirmable,
        }
    }
}

/// Parameters with the defaults substituted in.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) struct ResolvedParams {
    pub max_resend_count: u32,
    pub ack_timeout_ms: u64,
    pub confirmable: bool,
}

impl ResolvedParams {
    /// The delay before the next retransmission, given how many resends have
    /// already happened: `ack_timeout` after the initial transmission, then
    /// doubling (capped) so the k-th resend goes out at
    /// `ack_timeout * 2^(k-1)` after the initial write.
    pub fn retransmit_delay(&self, resends_done: u32) -> u64 {
        let shift = resends_done.saturating_sub(1).min(MAX_BACKOFF_SHIFT);
        self.ack_timeout_ms << shift
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_selects_defaults() {
        let resolved = ClientParameters::default().resolve();
        assert_eq!(resolved.max_resend_count, DEFAULT_MAX_RESEND_COUNT);
        assert_eq!(resolved.ack_timeout_ms, DEFAULT_ACK_TIMEOUT_MS);
        assert!(resolved.confirmable);

        let resolved = ClientParameters {
            max_resend_count: -3,
            ack_timeout_ms: -1,
            confirmable: true,
        }
        .resolve();
        assert_eq!(resolved.max_resend_count, DEFAULT_MAX_RESEND_COUNT);
        assert_eq!(resolved.ack_timeout_ms, DEFAULT_ACK_TIMEOUT_MS);
    }

    #[test]
    fn backoff_schedule() {
        let resolved = ClientParameters {
            max_resend_count: 4,
            ack_timeout_ms: 200,
            confirmable: true,
        }
        .resolve();

        // Resend k goes out ack_timeout * 2^(k-1) after the initial write:
        // writes land at t = 0, 200, 400, 800, 1600, timeout at 3200.
        assert_eq!(resolved.retransmit_delay(0), 200);
        assert_eq!(resolved.retransmit_delay(1), 200);
        assert_eq!(resolved.retransmit_delay(2), 400);
        assert_eq!(resolved.retransmit_delay(3), 800);
        assert_eq!(resolved.retransmit_delay(4), 1600);
    }

    #[test]
    fn backoff_is_capped() {
        let resolved = ClientParameters {
            max_resend_count: 64,
            ack_timeout_ms: 1000,
            confirmable: true,
        }
        .resolve();
        assert_eq!(resolved.retransmit_delay(63), 1000 << MAX_BACKOFF_SHIFT);
    }
}
