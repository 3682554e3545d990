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

/// CoAP option number newtype (RFC 7252 §5.10, RFC 7959 §2.1).
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Default)]
pub struct OptionNumber(pub u16);

impl OptionNumber {
    /// If-Match (RFC 7252).
    pub const IF_MATCH: OptionNumber = OptionNumber(1);

    /// Uri-Host (RFC 7252).
    pub const URI_HOST: OptionNumber = OptionNumber(3);

    /// ETag (RFC 7252).
    pub const ETAG: OptionNumber = OptionNumber(4);

    /// If-None-Match (RFC 7252).
    pub const IF_NONE_MATCH: OptionNumber = OptionNumber(5);

    /// Uri-Port (RFC 7252).
    pub const URI_PORT: OptionNumber = OptionNumber(7);

    /// Location-Path (RFC 7252).
    pub const LOCATION_PATH: OptionNumber = OptionNumber(8);

    /// Uri-Path (RFC 7252).
    pub const URI_PATH: OptionNumber = OptionNumber(11);

    /// Content-Format (RFC 7252).
    pub const CONTENT_FORMAT: OptionNumber = OptionNumber(12);

    /// Max-Age (RFC 7252).
    pub const MAX_AGE: OptionNumber = OptionNumber(14);

    /// Uri-Query (RFC 7252).
    pub const URI_QUERY: OptionNumber = OptionNumber(15);

    /// Accept (RFC 7252).
    pub const ACCEPT: OptionNumber = OptionNumber(17);

    /// Location-Query (RFC 7252).
    pub const LOCATION_QUERY: OptionNumber = OptionNumber(20);

    /// Block2: response payload fragmentation (RFC 7959).
    pub const BLOCK2: OptionNumber = OptionNumber(23);

    /// Block1: request payload fragmentation (RFC 7959).
    pub const BLOCK1: OptionNumber = OptionNumber(27);

    /// Size2 (RFC 7959).
    pub const SIZE2: OptionNumber = OptionNumber(28);

    /// Proxy-Uri (RFC 7252).
    pub const PROXY_URI: OptionNumber = OptionNumber(35);

    /// Proxy-Scheme (RFC 7252).
    pub const PROXY_SCHEME: OptionNumber = OptionNumber(39);

    /// Size1 (RFC 7252/7959).
    pub const SIZE1: OptionNumber = OptionNumber(60);

    /// Returns true if this option is critical: a receiver that does not
    /// understand it must reject the message.
    pub fn is_critical(self) -> bool {
        self.0 & 0b01 != 0
    }

    /// Returns true if this option is elective: unknown instances are
    /// silently skipped.
    pub fn is_elective(self) -> bool {
        !self.is_critical()
    }

    /// Returns true if this option is unsafe to forward through a proxy that
    /// does not understand it.
    pub fn is_unsafe_to_forward(self) -> bool {
        self.0 & 0b10 != 0
    }

    /// Returns true if this option may legally appear more than once in a
    /// message.
    pub fn is_repeatable(self) -> bool {
        matches!(
            self,
            OptionNumber::IF_MATCH
                | OptionNumber::ETAG
                | OptionNumber::LOCATION_PATH
                | OptionNumber::URI_PATH
                | OptionNumber::URI_QUERY
                | OptionNumber::LOCATION_QUERY
        )
    }
}

impl Display for OptionNumber {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), std::fmt::Error> {
        match *self {
            OptionNumber::IF_MATCH => f.write_str("If-Match"),
            OptionNumber::URI_HOST => f.write_str("Uri-Host"),
            OptionNumber::ETAG => f.write_str("ETag"),
            OptionNumber::IF_NONE_MATCH => f.write_str("If-None-Match"),
            OptionNumber::URI_PORT => f.write_str("Uri-Port"),
            OptionNumber::LOCATION_PATH => f.write_str("Location-Path"),
            OptionNumber::URI_PATH => f.write_str("Uri-Path"),
            OptionNumber::CONTENT_FORMAT => f.write_str("Content-Format"),
            OptionNumber::MAX_AGE => f.write_str("Max-Age"),
            OptionNumber::URI_QUERY => f.write_str("Uri-Query"),
            OptionNumber::ACCEPT => f.write_str("Accept"),
            OptionNumber::LOCATION_QUERY => f.write_str("Location-Query"),
            OptionNumber::BLOCK2 => f.write_str("Block2"),
            OptionNumber::BLOCK1 => f.write_str("Block1"),
            OptionNumber::SIZE2 => f.write_str("Size2"),
            OptionNumber::PROXY_URI => f.write_str("Proxy-Uri"),
            OptionNumber::PROXY_SCHEME => f.write_str("Proxy-Scheme"),
            OptionNumber::SIZE1 => f.write_str("Size1"),
            OptionNumber(x) => write!(f, "Option({})", x),
        }
    }
}

impl Debug for OptionNumber {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), std::fmt::Error> {
        write!(f, "OptionNumber({}/{})", self.0, self)
    }
}

impl From<u16> for OptionNumber {
    fn from(x: u16) -> Self {
        OptionNumber(x)
    }
}
