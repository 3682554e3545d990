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

//! Blockwise-transfer building blocks (RFC 7959): the `block1`/`block2`
//! option value, the application-side [`BlockSource`] contract, and ordering
//! helpers shared by the client and server state machines.

use crate::Error;
use std::fmt::{Debug, Display, Formatter};

/// One `block1`/`block2` option value, held in decoded form.
///
/// On the wire the option packs `(num, m, szx)` into an unsigned integer:
/// the low three bits are the size exponent, bit 3 is the more-flag, the
/// rest is the block number. This type keeps the three fields apart and
/// converts at the option boundary through [`BlockInfo::raw`] and
/// [`BlockInfo::from_raw`], so invalid wire values are rejected exactly
/// once, at decode time.
#[derive(Copy, Clone, Eq, PartialEq, Hash)]
pub struct BlockInfo {
    num: u32,
    more: bool,
    szx: u8,
}

impl BlockInfo {
    /// Largest block number the 20-bit field can carry.
    pub const NUM_MAX: u32 = (1 << 20) - 1;

    /// Builds a block descriptor, rejecting out-of-range fields
    /// (`num` beyond [`BlockInfo::NUM_MAX`], `szx` beyond 6).
    pub fn new(num: u32, more: bool, szx: u8) -> Option<BlockInfo> {
        if num > Self::NUM_MAX || block_size(szx).is_none() {
            return None;
        }
        Some(BlockInfo { num, more, szx })
    }

    /// Builds the descriptor covering the byte at `offset`, which must be
    /// aligned to the block size of `szx`.
    pub fn for_offset(offset: usize, more: bool, szx: u8) -> Option<BlockInfo> {
        let size = block_size(szx)?;
        if offset % size != 0 {
            return None;
        }
        Self::new((offset / size) as u32, more, szx)
    }

    /// Decodes a wire option value. `None` for the reserved size exponent
    /// or an overlong block number.
    pub fn from_raw(raw: u32) -> Option<BlockInfo> {
        Self::new(raw >> 4, raw & 0b1000 != 0, (raw & 0b0111) as u8)
    }

    /// The wire encoding of this descriptor.
    pub fn raw(self) -> u32 {
        (self.num << 4) | ((self.more as u32) << 3) | self.szx as u32
    }

    /// Block number.
    pub fn num(self) -> u32 {
        self.num
    }

    /// More-flag: further blocks follow this one.
    pub fn more_flag(self) -> bool {
        self.more
    }

    /// Size exponent.
    pub fn szx(self) -> u8 {
        self.szx
    }

    /// Size of one block at this exponent, in bytes.
    pub fn size(self) -> usize {
        block_size(self.szx).expect("constructed szx is in range")
    }

    /// Byte offset where this block starts.
    pub fn offset(self) -> usize {
        self.num as usize * self.size()
    }

    /// The same block with the more-flag replaced.
    pub fn with_more(self, more: bool) -> BlockInfo {
        BlockInfo { more, ..self }
    }

    /// This block's position re-expressed at another size exponent.
    /// `None` when the exponent is out of range or the offset is not
    /// representable at the new size.
    pub fn at_szx(self, szx: u8) -> Option<BlockInfo> {
        Self::for_offset(self.offset(), self.more, szx)
    }
}

impl Default for BlockInfo {
    /// Block zero, no more-flag, 1024-byte blocks.
    fn default() -> Self {
        BlockInfo {
            num: 0,
            more: false,
            szx: DEFAULT_BLOCK_SZX,
        }
    }
}

impl Display for BlockInfo {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), std::fmt::Error> {
        // The conventional num/more/size rendering from RFC 7959 examples.
        write!(f, "{}/{}/{}", self.num, self.more as u8, self.size())
    }
}

impl Debug for BlockInfo {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), std::fmt::Error> {
        write!(f, "BlockInfo({})", self)
    }
}

/// The default block size exponent: `2^(6+4)` = 1024-byte blocks.
pub const DEFAULT_BLOCK_SZX: u8 = 6;

/// The block size in bytes for a given size exponent, or `None` for the
/// reserved exponent.
pub fn block_size(szx: u8) -> Option<usize> {
    if szx >= 0b111 {
        None
    } else {
        Some(1 << (szx as usize + 4))
    }
}

/// The largest legal size exponent whose block size is at most `size`
/// bytes, or `None` when `size` is under the 16-byte minimum.
pub fn szx_for_size(size: usize) -> Option<u8> {
    (0..0b111u8)
        .rev()
        .find(|&szx| 1usize << (szx as usize + 4) <= size)
}

/// Describes one slice of a [`BlockSource`]'s data, as negotiated by
/// [`BlockSource::get_data_size`].
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct BlockSize {
    /// The number of bytes available at the requested offset.
    pub size: usize,

    /// True when data exists past `offset + size`.
    pub more: bool,

    /// False when the requested offset lies outside the data. Signals
    /// end-of-range to the puller.
    pub in_range: bool,
}

/// Application-provided source of a large payload, pulled one block at a
/// time.
///
/// Implementations MUST return the same bytes for a given `(offset, size)`
/// for the duration of one blockwise transfer; retransmissions re-read them.
pub trait BlockSource: Send + Sync {
    /// Negotiates the slice at `offset`: the caller proposes `requested`
    /// bytes and the source answers with what it can provide there.
    fn get_data_size(&self, offset: usize, requested: usize) -> BlockSize;

    /// Copies the slice at `(offset, size)` into `out`, which is exactly
    /// `size` bytes long.
    fn get_data(&self, offset: usize, size: usize, out: &mut [u8]) -> Result<(), Error>;
}

/// A [`BlockSource`] over an in-memory buffer.
#[derive(Debug, Clone)]
pub struct VecBlockSource {
    data: Vec<u8>,
}

impl VecBlockSource {
    /// Creates a source yielding the given bytes.
    pub fn new(data: impl Into<Vec<u8>>) -> VecBlockSource {
        VecBlockSource { data: data.into() }
    }

    /// Total number of bytes this source holds.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns true when the source holds no bytes.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl BlockSource for VecBlockSource {
    fn get_data_size(&self, offset: usize, requested: usize) -> BlockSize {
        if offset > self.data.len() {
            return BlockSize {
                size: 0,
                more: false,
                in_range: false,
            };
        }
        let remaining = self.data.len() - offset;
        let size = remaining.min(requested);
        BlockSize {
            size,
            more: remaining > size,
            in_range: true,
        }
    }

    fn get_data(&self, offset: usize, size: usize, out: &mut [u8]) -> Result<(), Error> {
        if size != out.len() {
            return Err(Error::InvalidParameters);
        }
        let end = offset.checked_add(size).ok_or(Error::OutOfRange)?;
        if end > self.data.len() {
            return Err(Error::OutOfRange);
        }
        out.copy_from_slice(&self.data[offset..end]);
        Ok(())
    }
}

/// Tracks the in-order arrival of a blockwise stream.
///
/// Used on the receiving side of both `block1` uploads and `block2`
/// downloads: blocks before the cursor are duplicates, blocks past it are
/// holes, and a block with the more-flag clear finishes the stream.
#[derive(Debug, Default)]
pub struct BlockReassembler {
    next_offset: usize,
    finished: bool,
}

/// The verdict [`BlockReassembler::feed`] renders for one block.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum BlockDisposition {
    /// The block is the one expected next; consume it.
    Consume,

    /// A retransmission of data already consumed; ignore it.
    Duplicate,

    /// The stream is complete (this block had the more-flag clear).
    Finished,
}

impl BlockReassembler {
    /// Creates a reassembler expecting offset zero.
    pub fn new() -> BlockReassembler {
        Default::default()
    }

    /// The offset the next consumable block must start at.
    pub fn next_offset(&self) -> usize {
        self.next_offset
    }

    /// Returns true once the final block has been consumed.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Judges one arriving block of `payload_len` bytes.
    ///
    /// Fails with [`Error::OutOfRange`] on a hole (block starts past the
    /// cursor) and [`Error::InvalidFormat`] when a non-final block's payload
    /// does not fill its block size.
    pub fn feed(&mut self, block: BlockInfo, payload_len: usize) -> Result<BlockDisposition, Error> {
        if self.finished {
            return Ok(BlockDisposition::Finished);
        }

        if block.offset() < self.next_offset {
            return Ok(BlockDisposition::Duplicate);
        }

        if block.offset() > self.next_offset {
            return Err(Error::OutOfRange);
        }

        if block.more_flag() {
            if payload_len != block.size() {
                return Err(Error::InvalidFormat);
            }
            self.next_offset += payload_len;
            Ok(BlockDisposition::Consume)
        } else {
            if payload_len > block.size() {
                return Err(Error::InvalidFormat);
            }
            self.next_offset += payload_len;
            self.finished = true;
            Ok(BlockDisposition::Consume)
        }
    }
}
