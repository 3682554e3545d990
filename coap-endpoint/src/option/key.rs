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

use super::OptionNumber;
use crate::block::BlockInfo;
use std::marker::PhantomData;

/// A typed [`OptionNumber`]: associates the number with the Rust type its
/// value decodes to, so lookups and insertions are type-checked.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct OptionKey<T>(pub OptionNumber, PhantomData<fn() -> T>);

impl<T> OptionKey<T> {
    /// Creates a typed key for the given option number.
    pub const fn new(number: OptionNumber) -> OptionKey<T> {
        OptionKey(number, PhantomData)
    }

    /// The raw option number.
    pub fn number(self) -> OptionNumber {
        self.0
    }
}

/// Typed key for If-Match.
pub const IF_MATCH: OptionKey<&[u8]> = OptionKey::new(OptionNumber::IF_MATCH);

/// Typed key for Uri-Host.
pub const URI_HOST: OptionKey<&str> = OptionKey::new(OptionNumber::URI_HOST);

/// Typed key for ETag.
pub const ETAG: OptionKey<&[u8]> = OptionKey::new(OptionNumber::ETAG);

/// Typed key for If-None-Match.
pub const IF_NONE_MATCH: OptionKey<()> = OptionKey::new(OptionNumber::IF_NONE_MATCH);

/// Typed key for Uri-Port.
pub const URI_PORT: OptionKey<u16> = OptionKey::new(OptionNumber::URI_PORT);

/// Typed key for Location-Path.
pub const LOCATION_PATH: OptionKey<&str> = OptionKey::new(OptionNumber::LOCATION_PATH);

/// Typed key for Uri-Path.
pub const URI_PATH: OptionKey<&str> = OptionKey::new(OptionNumber::URI_PATH);

/// Typed key for Content-Format.
pub const CONTENT_FORMAT: OptionKey<u16> = OptionKey::new(OptionNumber::CONTENT_FORMAT);

/// Typed key for Max-Age.
pub const MAX_AGE: OptionKey<u32> = OptionKey::new(OptionNumber::MAX_AGE);

/// Typed key for Uri-Query.
pub const URI_QUERY: OptionKey<&str> = OptionKey::new(OptionNumber::URI_QUERY);

/// Typed key for Accept.
pub const ACCEPT: OptionKey<u16> = OptionKey::new(OptionNumber::ACCEPT);

/// Typed key for Location-Query.
pub const LOCATION_QUERY: OptionKey<&str> = OptionKey::new(OptionNumber::LOCATION_QUERY);

/// Typed key for Block2.
pub const BLOCK2: OptionKey<BlockInfo> = OptionKey::new(OptionNumber::BLOCK2);

/// Typed key for Block1.
pub const BLOCK1: OptionKey<BlockInfo> = OptionKey::new(OptionNumber::BLOCK1);

/// Typed key for Size2.
pub const SIZE2: OptionKey<u32> = OptionKey::new(OptionNumber::SIZE2);

/// Typed key for Size1.
pub const SIZE1: OptionKey<u32> = OptionKey::new(OptionNumber::SIZE1);
