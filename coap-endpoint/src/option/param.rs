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

use super::*;
use crate::Error;

/// An owned, type-discriminated option value. The owned counterpart of
/// [`OptionValue`], used where option lists outlive the borrow they were
/// built from.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum OwnedOptionValue {
    /// Presence-only option.
    Empty,

    /// Unsigned integer option.
    Uint(u32),

    /// UTF-8 string option.
    Str(String),

    /// Opaque byte-string option.
    Opaque(Vec<u8>),
}

impl OwnedOptionValue {
    /// Borrows this value as an [`OptionValue`].
    pub fn borrow(&self) -> OptionValue<'_> {
        match self {
            OwnedOptionValue::Empty => OptionValue::Empty,
            OwnedOptionValue::Uint(x) => OptionValue::Uint(*x),
            OwnedOptionValue::Str(s) => OptionValue::Str(s),
            OwnedOptionValue::Opaque(b) => OptionValue::Opaque(b),
        }
    }
}

/// One option of an outgoing message: an option number plus an owned value.
///
/// Requests are described by a slice of these; the encoder consumes them in
/// ascending option-number order regardless of the slice order.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct OptionParam {
    /// The option number.
    pub number: OptionNumber,

    /// The option value.
    pub value: OwnedOptionValue,
}

impl OptionParam {
    /// Creates a presence-only option.
    pub fn empty(number: OptionNumber) -> OptionParam {
        OptionParam {
            number,
            value: OwnedOptionValue::Empty,
        }
    }

    /// Creates an unsigned-integer option.
    pub fn uint(number: OptionNumber, value: u32) -> OptionParam {
        OptionParam {
            number,
            value: OwnedOptionValue::Uint(value),
        }
    }

    /// Creates a string option.
    pub fn string(number: OptionNumber, value: impl Into<String>) -> OptionParam {
        OptionParam {
            number,
            value: OwnedOptionValue::Str(value.into()),
        }
    }

    /// Creates an opaque option.
    pub fn opaque(number: OptionNumber, value: impl Into<Vec<u8>>) -> OptionParam {
        OptionParam {
            number,
            value: OwnedOptionValue::Opaque(value.into()),
        }
    }
}

/// Writes an option parameter list into `target` in canonical (ascending
/// number, stable) order.
pub fn write_option_params(
    params: &[OptionParam],
    target: &mut dyn OptionInsert,
) -> Result<(), Error> {
    let mut order: Vec<&OptionParam> = params.iter().collect();
    order.sort_by_key(|param| param.number);

    for param in order {
        let mut scratch = [0u8; 4];
        let bytes = param.value.borrow().to_bytes(&mut scratch).to_vec();
        target.insert_option_with_bytes(param.number, &bytes)?;
    }
    Ok(())
}

/// Splits a path (`separator = '/'`) or query (`separator = '&'`) string into
/// repeated options of the given number, one per segment.
///
/// A leading separator is ignored; empty interior segments are rejected.
/// Fails with [`Error::NotEnoughSpace`] when the input has more than
/// `max_segments` segments.
pub fn split_path_or_query(
    input: &str,
    separator: char,
    number: OptionNumber,
    max_segments: usize,
) -> Result<Vec<OptionParam>, Error> {
    let trimmed = input.strip_prefix(separator).unwrap_or(input);

    let mut params = Vec::new();
    if trimmed.is_empty() {
        return Ok(params);
    }

    for segment in trimmed.split(separator) {
        if segment.is_empty() {
            return Err(Error::InvalidParameters);
        }
        if params.len() == max_segments {
            return Err(Error::NotEnoughSpace);
        }
        params.push(OptionParam::string(number, segment));
    }

    Ok(params)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessageEncoder;

    #[test]
    fn split_path() {
        let params =
            split_path_or_query("/alpha/beta", '/', OptionNumber::URI_PATH, 4).unwrap();
        assert_eq!(
            params,
            vec![
                OptionParam::string(OptionNumber::URI_PATH, "alpha"),
                OptionParam::string(OptionNumber::URI_PATH, "beta"),
            ]
        );

        assert_eq!(
            split_path_or_query("/", '/', OptionNumber::URI_PATH, 4).unwrap(),
            vec![]
        );
        assert_eq!(
            split_path_or_query("", '/', OptionNumber::URI_PATH, 4).unwrap(),
            vec![]
        );
    }

    #[test]
    fn split_limits() {
        assert_eq!(
            split_path_or_query("a/b/c/d/e", '/', OptionNumber::URI_PATH, 4),
            Err(Error::NotEnoughSpace)
        );
        assert_eq!(
            split_path_or_query("a//b", '/', OptionNumber::URI_PATH, 4),
            Err(Error::InvalidParameters)
        );
    }

    #[test]
    fn writes_in_canonical_order() {
        let params = vec![
            OptionParam::uint(OptionNumber::BLOCK1, 0x0E),
            OptionParam::string(OptionNumber::URI_PATH, "upload"),
            OptionParam::uint(OptionNumber::CONTENT_FORMAT, 42),
        ];

        let mut encoder = MessageEncoder::new();
        write_option_params(&params, &mut encoder).unwrap();

        let numbers: Vec<_> = encoder
            .option_entries()
            .map(|(number, _)| number)
            .collect();
        assert_eq!(
            numbers,
            vec![
                OptionNumber::URI_PATH,
                OptionNumber::CONTENT_FORMAT,
                OptionNumber::BLOCK1,
            ]
        );
    }
}
