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

/// Trait for objects that can have CoAP options inserted into them, most
/// notably the message encoders.
pub trait OptionInsert {
    /// Inserts an option with the given raw value bytes. Inserting in
    /// ascending number order is cheap; any other order works but pays a
    /// re-encoding penalty.
    fn insert_option_with_bytes(&mut self, key: OptionNumber, value: &[u8]) -> Result<(), Error>;
}

/// Typed extension methods over [`OptionInsert`].
pub trait OptionInsertExt {
    /// Inserts an option with a value of the type associated with `key`.
    fn insert_option<'a, T>(&mut self, key: OptionKey<T>, value: T) -> Result<(), Error>
    where
        T: Into<OptionValue<'a>>;

    /// Inserts a presence-only option.
    fn insert_option_empty(&mut self, key: OptionNumber) -> Result<(), Error>;
}

impl<O: OptionInsert + ?Sized> OptionInsertExt for O {
    fn insert_option<'a, T>(&mut self, key: OptionKey<T>, value: T) -> Result<(), Error>
    where
        T: Into<OptionValue<'a>>,
    {
        let value = value.into();
        let mut scratch = [0u8; 4];
        let bytes = value.to_bytes(&mut scratch);
        self.insert_option_with_bytes(key.0, bytes)
    }

    fn insert_option_empty(&mut self, key: OptionNumber) -> Result<(), Error> {
        self.insert_option_with_bytes(key, &[])
    }
}
