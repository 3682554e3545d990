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
use crate::message::codec::decode_option;
use crate::Error;

/// Selects which options an iteration visits.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum OptionFilter {
    /// Visit every option.
    Any,

    /// Visit only options with this number.
    Number(OptionNumber),
}

impl OptionFilter {
    fn matches(self, number: OptionNumber) -> bool {
        match self {
            OptionFilter::Any => true,
            OptionFilter::Number(x) => x == number,
        }
    }
}

/// An iterator that parses options out of an encoded option buffer, in the
/// ascending number order the wire format guarantees.
#[derive(Debug, Clone)]
pub struct OptionIterator<'a> {
    iter: core::slice::Iter<'a, u8>,
    last_option: OptionNumber,
    filter: OptionFilter,
}

impl<'a> Default for OptionIterator<'a> {
    fn default() -> Self {
        OptionIterator::new(&[])
    }
}

impl<'a> OptionIterator<'a> {
    /// Creates a new instance of an `OptionIterator` over the given encoded
    /// option buffer.
    pub fn new(buffer: &'a [u8]) -> OptionIterator<'a> {
        OptionIterator {
            iter: buffer.iter(),
            last_option: Default::default(),
            filter: OptionFilter::Any,
        }
    }

    /// Restricts this iterator to options matching `filter`.
    pub fn filtered(self, filter: OptionFilter) -> OptionIterator<'a> {
        OptionIterator { filter, ..self }
    }

    /// Returns the unparsed remainder as a byte slice.
    pub fn as_slice(&self) -> &'a [u8] {
        self.iter.as_slice()
    }

    /// Peek ahead to the next matching option without moving the iterator
    /// forward.
    pub fn peek(&self) -> Option<Result<(OptionNumber, &'a [u8]), Error>> {
        self.clone().next()
    }
}

impl<'a> Iterator for OptionIterator<'a> {
    type Item = Result<(OptionNumber, &'a [u8]), Error>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let ret = decode_option(&mut self.iter, self.last_option).transpose();
            match ret {
                Some(Ok((key, value))) => {
                    self.last_option = key;
                    if self.filter.matches(key) {
                        return Some(Ok((key, value)));
                    }
                    // Ascending order: once past the filtered number there is
                    // nothing left to find.
                    if let OptionFilter::Number(wanted) = self.filter {
                        if key > wanted {
                            return None;
                        }
                    }
                }
                other => return other,
            }
        }
    }
}

impl AsRef<[u8]> for OptionIterator<'_> {
    fn as_ref(&self) -> &[u8] {
        self.as_slice()
    }
}

/// Extension trait providing typed and keyed lookups over option iterators.
pub trait OptionIteratorExt<'a>: Iterator<Item = Result<(OptionNumber, &'a [u8]), Error>> {
    /// Moves the iterator forward until it finds a matching key or the spot
    /// where it would have been.
    ///
    /// If found, returns the option number and a byte slice of the value.
    /// Does not consume any options after the matching key.
    fn find_next(&mut self, key: OptionNumber) -> Option<Result<(OptionNumber, &'a [u8]), Error>>;

    /// Typed version of [`OptionIteratorExt::find_next`]: returns the decoded
    /// value of the option.
    fn find_next_of<T>(&mut self, key: OptionKey<T>) -> Option<Result<T, Error>>
    where
        T: TryOptionValueFrom<'a> + Sized,
    {
        match self.find_next(key.0)? {
            Ok((_, value)) => match T::try_option_value_from(value) {
                Some(x) => Some(Ok(x)),
                None => Some(Err(Error::InvalidFormat)),
            },
            Err(e) => Some(Err(e)),
        }
    }

    /// Concatenates the remaining URI-PATH options into a `/`-joined path
    /// string (no leading slash), moving past them.
    fn collect_uri_path(&mut self) -> Result<String, Error>
    where
        Self: Sized,
    {
        let mut buf = String::new();
        while let Some(seg) = self.find_next_of(URI_PATH).transpose()? {
            if !buf.is_empty() {
                buf.push('/');
            }
            buf.push_str(seg);
        }
        Ok(buf)
    }

    /// Concatenates the remaining URI-QUERY options into a `&`-joined query
    /// string, moving past them.
    fn collect_uri_query(&mut self) -> Result<String, Error>
    where
        Self: Sized,
    {
        let mut buf = String::new();
        while let Some(item) = self.find_next_of(URI_QUERY).transpose()? {
            if !buf.is_empty() {
                buf.push('&');
            }
            buf.push_str(item);
        }
        Ok(buf)
    }
}

impl<'a, I> OptionIteratorExt<'a> for I
where
    I: Iterator<Item = Result<(OptionNumber, &'a [u8]), Error>> + Sized + Clone,
{
    fn find_next(&mut self, key: OptionNumber) -> Option<Result<(OptionNumber, &'a [u8]), Error>> {
        loop {
            let mut iter = self.clone();

            match iter.next()? {
                Err(x) => return Some(Err(x)),
                Ok((number, value)) => {
                    if number == key {
                        *self = iter;
                        return Some(Ok((key, value)));
                    }
                    if number < key {
                        *self = iter;
                        continue;
                    }
                }
            };

            return None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::codec::append_option;

    fn encode(options: &[(OptionNumber, &[u8])]) -> Vec<u8> {
        let mut buffer = Vec::new();
        let mut prev = OptionNumber(0);
        for &(key, value) in options {
            append_option(&mut buffer, prev, key, value).unwrap();
            prev = key;
        }
        buffer
    }

    #[test]
    fn iterates_in_ascending_order() {
        let buffer = encode(&[
            (OptionNumber::URI_PATH, b"alpha"),
            (OptionNumber::URI_PATH, b"beta"),
            (OptionNumber::BLOCK2, &[0x06]),
        ]);

        let collected: Vec<_> = OptionIterator::new(&buffer)
            .map(|x| x.unwrap())
            .collect();
        assert_eq!(
            collected,
            vec![
                (OptionNumber::URI_PATH, &b"alpha"[..]),
                (OptionNumber::URI_PATH, &b"beta"[..]),
                (OptionNumber::BLOCK2, &[0x06][..]),
            ]
        );
    }

    #[test]
    fn filtered_by_number() {
        let buffer = encode(&[
            (OptionNumber::URI_PATH, b"a"),
            (OptionNumber::CONTENT_FORMAT, &[]),
            (OptionNumber::URI_QUERY, b"k=v"),
        ]);

        let only_path: Vec<_> = OptionIterator::new(&buffer)
            .filtered(OptionFilter::Number(OptionNumber::URI_PATH))
            .map(|x| x.unwrap())
            .collect();
        assert_eq!(only_path, vec![(OptionNumber::URI_PATH, &b"a"[..])]);

        let any = OptionIterator::new(&buffer)
            .filtered(OptionFilter::Any)
            .count();
        assert_eq!(any, 3);
    }

    #[test]
    fn typed_lookup() {
        let buffer = encode(&[
            (OptionNumber::URI_PATH, b"upload"),
            (OptionNumber::BLOCK1, &[0x0E]),
        ]);

        let mut iter = OptionIterator::new(&buffer);
        assert_eq!(
            iter.find_next_of(URI_PATH).transpose().unwrap(),
            Some("upload")
        );
        let block1 = iter.find_next_of(BLOCK1).transpose().unwrap().unwrap();
        assert_eq!(block1.num(), 0);
        assert!(block1.more_flag());
        assert_eq!(block1.szx(), 6);
    }

    #[test]
    fn collects_path_and_query() {
        let buffer = encode(&[
            (OptionNumber::URI_PATH, b"a"),
            (OptionNumber::URI_PATH, b"b"),
            (OptionNumber::URI_QUERY, b"x=1"),
            (OptionNumber::URI_QUERY, b"y=2"),
        ]);

        let mut iter = OptionIterator::new(&buffer);
        assert_eq!(iter.collect_uri_path().unwrap(), "a/b");
        assert_eq!(iter.collect_uri_query().unwrap(), "x=1&y=2");
    }
}
