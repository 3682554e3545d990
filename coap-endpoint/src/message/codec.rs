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

//! Low-level codec functions: option delta-length encoding (RFC 7252 §3.1)
//! and the minimal big-endian unsigned integer representation used by
//! uint-valued options.
//!
//! Encoding is append-only: options are written in ascending number order by
//! [`append_option`]. Out-of-order construction is handled above this layer,
//! by the [encoder](super::MessageEncoder)'s staged option list.

use crate::option::OptionNumber;
use crate::Error;

/// Encodes an unsigned 32-bit number into the given buffer, returning the
/// used prefix of `dst`. The result has no leading zero bytes; zero encodes
/// to an empty slice.
pub fn encode_u32(value: u32, dst: &mut [u8]) -> &mut [u8] {
    let len = (4 - (value.leading_zeros() / 8) as usize).min(4);
    for (i, byte) in dst[..len].iter_mut().enumerate() {
        *byte = (value >> ((len - 1 - i) * 8)) as u8;
    }
    &mut dst[..len]
}

/// Attempts to decode a big-endian unsigned integer of up to four bytes.
/// An empty slice decodes to zero. Longer input returns `None`.
pub fn try_decode_u32(src: &[u8]) -> Option<u32> {
    if src.len() > 4 {
        return None;
    }
    Some(src.iter().fold(0u32, |acc, &b| (acc << 8) | b as u32))
}

/// Attempts to decode a big-endian unsigned integer of up to two bytes.
/// An empty slice decodes to zero. Longer input returns `None`.
pub fn try_decode_u16(src: &[u8]) -> Option<u16> {
    if src.len() > 2 {
        return None;
    }
    Some(src.iter().fold(0u16, |acc, &b| (acc << 8) | b as u16))
}

/// Extension-byte count for one 4-bit delta or length field.
fn field_ext_len(field: usize) -> usize {
    match field {
        0..=12 => 0,
        13..=268 => 1,
        _ => 2,
    }
}

/// The encoded size of one option, header and value included, when it
/// follows an option numbered `prev_key`.
pub fn calc_option_size(prev_key: OptionNumber, key: OptionNumber, value_len: usize) -> usize {
    let delta = (key.0 - prev_key.0) as usize;
    1 + field_ext_len(delta) + field_ext_len(value_len) + value_len
}

/// Appends one 4-bit field's extension bytes to `out` and returns the
/// nibble that selects that extension form (the value itself below 13,
/// 13 for one extension byte, 14 for two).
fn push_field(out: &mut Vec<u8>, field: usize) -> u8 {
    match field {
        0..=12 => field as u8,
        13..=268 => {
            out.push((field - 13) as u8);
            13
        }
        _ => {
            let wide = field - 269;
            out.push((wide >> 8) as u8);
            out.push(wide as u8);
            14
        }
    }
}

/// Appends one option to an encoded option buffer whose highest option
/// number so far is `prev_key`.
///
/// The wire format only expresses non-negative deltas, so `key` must not be
/// below `prev_key`; callers produce ascending order.
pub fn append_option(
    out: &mut Vec<u8>,
    prev_key: OptionNumber,
    key: OptionNumber,
    value: &[u8],
) -> Result<(), Error> {
    if key < prev_key {
        return Err(Error::InvalidParameters);
    }
    if value.len() > crate::option::MAX_OPTION_VALUE_SIZE {
        return Err(Error::InvalidParameters);
    }

    let header_at = out.len();
    out.push(0);

    // Extension bytes land in wire order: delta's first, then the length's.
    let delta_nibble = push_field(out, (key.0 - prev_key.0) as usize);
    let len_nibble = push_field(out, value.len());
    out[header_at] = (delta_nibble << 4) | len_nibble;

    out.extend_from_slice(value);
    Ok(())
}

/// Decodes one option from a `core::slice::Iter`, which can be obtained from
/// a byte slice. The iterator is then advanced to the next option.
///
/// Will return `Ok(None)` if it either encounters the end-of-options marker
/// (0xFF) or if the given iterator has been fully consumed.
pub fn decode_option<'a>(
    iter: &mut core::slice::Iter<'a, u8>,
    last_option: OptionNumber,
) -> Result<Option<(OptionNumber, &'a [u8])>, Error> {
    macro_rules! try_next {
        ($iter:expr, $none:expr) => {
            match ($iter).next() {
                Some(x) => *x,
                None => return $none,
            }
        };
    }

    let header: u8 = try_next!(iter, Ok(None));

    if header == 0xFF {
        // End of options marker.
        return Ok(None);
    }

    let key_delta: u16 = match header >> 4 {
        13 => 13u16 + try_next!(iter, Err(Error::InvalidFormat)) as u16,
        14 => {
            let msb = try_next!(iter, Err(Error::InvalidFormat)) as u16;
            269u16 + try_next!(iter, Err(Error::InvalidFormat)) as u16 + (msb << 8)
        }
        15 => return Err(Error::InvalidFormat),
        key => key as u16,
    };

    let len = match header & 0xF {
        13 => (13 + try_next!(iter, Err(Error::InvalidFormat))) as usize,
        14 => {
            let msb = try_next!(iter, Err(Error::InvalidFormat)) as u16;
            (269u16 + try_next!(iter, Err(Error::InvalidFormat)) as u16 + (msb << 8)) as usize
        }
        15 => return Err(Error::InvalidFormat),
        len => len as usize,
    };

    if last_option.0 > core::u16::MAX - key_delta {
        // Don't let the key wrap.
        return Err(Error::InvalidFormat);
    }

    let key = OptionNumber(last_option.0 + key_delta);

    if len == 0 {
        return Ok(Some((key, &[])));
    }

    if len > iter.as_slice().len() {
        return Err(Error::InvalidFormat);
    }

    let value: &'a [u8] = &iter.as_slice()[..len];

    iter.nth(len - 1);

    Ok(Some((key, value)))
}
