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

use crate::block::BlockInfo;
use crate::message::codec::{encode_u32, try_decode_u32};

/// A borrowed, type-discriminated CoAP option value.
///
/// The wire representation carries no type tag: the type is a property of
/// the option number. Unsigned values are encoded big-endian with no leading
/// zero bytes (zero is a zero-length value); strings are raw UTF-8 with no
/// terminator; empty options carry presence only.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum OptionValue<'a> {
    /// Presence-only option.
    Empty,

    /// Unsigned integer option (0–4 bytes on the wire).
    Uint(u32),

    /// UTF-8 string option.
    Str(&'a str),

    /// Opaque byte-string option.
    Opaque(&'a [u8]),
}

impl<'a> OptionValue<'a> {
    /// The number of bytes this value occupies on the wire.
    pub fn encoded_len(&self) -> usize {
        match *self {
            OptionValue::Empty => 0,
            OptionValue::Uint(x) => (4 - (x.leading_zeros() / 8) as usize).min(4),
            OptionValue::Str(s) => s.len(),
            OptionValue::Opaque(b) => b.len(),
        }
    }

    /// Writes this value into `scratch` and returns the used prefix.
    /// `scratch` must be at least [`encoded_len`](OptionValue::encoded_len)
    /// bytes for `Uint` values; string and opaque values are returned
    /// directly without copying.
    pub fn to_bytes<'b>(&'b self, scratch: &'b mut [u8; 4]) -> &'b [u8] {
        match *self {
            OptionValue::Empty => &[],
            OptionValue::Uint(x) => encode_u32(x, scratch),
            OptionValue::Str(s) => s.as_bytes(),
            OptionValue::Opaque(b) => b,
        }
    }
}

impl<'a> From<()> for OptionValue<'a> {
    fn from(_: ()) -> Self {
        OptionValue::Empty
    }
}

impl<'a> From<u32> for OptionValue<'a> {
    fn from(x: u32) -> Self {
        OptionValue::Uint(x)
    }
}

impl<'a> From<u16> for OptionValue<'a> {
    fn from(x: u16) -> Self {
        OptionValue::Uint(x as u32)
    }
}

impl<'a> From<BlockInfo> for OptionValue<'a> {
    fn from(x: BlockInfo) -> Self {
        OptionValue::Uint(x.raw())
    }
}

impl<'a> From<&'a str> for OptionValue<'a> {
    fn from(x: &'a str) -> Self {
        OptionValue::Str(x)
    }
}

impl<'a> From<&'a [u8]> for OptionValue<'a> {
    fn from(x: &'a [u8]) -> Self {
        OptionValue::Opaque(x)
    }
}

/// Trait for types that can be parsed out of a raw option value.
pub trait TryOptionValueFrom<'a>: Sized {
    /// Attempts to interpret the raw option value as `Self`.
    fn try_option_value_from(buffer: &'a [u8]) -> Option<Self>;
}

impl<'a> TryOptionValueFrom<'a> for &'a [u8] {
    fn try_option_value_from(buffer: &'a [u8]) -> Option<Self> {
        Some(buffer)
    }
}

impl<'a> TryOptionValueFrom<'a> for u32 {
    fn try_option_value_from(buffer: &'a [u8]) -> Option<Self> {
        try_decode_u32(buffer)
    }
}

impl<'a> TryOptionValueFrom<'a> for u16 {
    fn try_option_value_from(buffer: &'a [u8]) -> Option<Self> {
        crate::message::codec::try_decode_u16(buffer)
    }
}

impl<'a> TryOptionValueFrom<'a> for &'a str {
    fn try_option_value_from(buffer: &'a [u8]) -> Option<Self> {
        core::str::from_utf8(buffer).ok()
    }
}

impl<'a> TryOptionValueFrom<'a> for BlockInfo {
    fn try_option_value_from(buffer: &'a [u8]) -> Option<Self> {
        BlockInfo::from_raw(try_decode_u32(buffer)?)
    }
}

impl<'a> TryOptionValueFrom<'a> for () {
    fn try_option_value_from(buffer: &'a [u8]) -> Option<Self> {
        if buffer.is_empty() {
            Some(())
        } else {
            None
        }
    }
}
