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

//! Message encoding.
//!
//! [`MessageEncoder`] does not write wire bytes as the fields arrive.
//! It stages the parts of the message — header fields, token, a
//! number-ordered option list, payload — and serializes the whole datagram
//! the first time the bytes are asked for. Staging keeps the wire image
//! consistent regardless of the order the parts were supplied in, and makes
//! option insertion order-independent: the list is held sorted, so the
//! append-only wire format (ascending option numbers) falls out of a single
//! forward pass.

use super::codec::{append_option, calc_option_size};
use super::*;
use crate::option::{OptionInsert, OptionNumber};
use crate::Error;

/// A CoAP message encoder.
#[derive(Debug, Clone)]
pub struct MessageEncoder {
    msg_type: MsgType,
    msg_code: MsgCode,
    msg_id: MsgId,
    token: MsgToken,
    options: Vec<StagedOption>,
    payload: Vec<u8>,

    /// Serialized image of the fields above; rebuilt when `stale`.
    wire: Vec<u8>,
    stale: bool,
}

#[derive(Debug, Clone)]
struct StagedOption {
    number: OptionNumber,
    value: Vec<u8>,
}

impl MessageEncoder {
    /// Creates an empty encoder: CON, empty code, zero message id, no
    /// token, no options, no payload.
    pub fn new() -> MessageEncoder {
        Self::with_payload_capacity(0)
    }

    /// Creates an empty encoder whose payload storage is pre-sized for
    /// `capacity` bytes.
    pub fn with_payload_capacity(capacity: usize) -> MessageEncoder {
        MessageEncoder {
            msg_type: MsgType::Con,
            msg_code: MsgCode::Empty,
            msg_id: 0,
            token: MsgToken::EMPTY,
            options: Vec::new(),
            payload: Vec::with_capacity(capacity),
            wire: Vec::new(),
            stale: true,
        }
    }

    /// The serialized message. Rebuilds the wire image if any part changed
    /// since the last call.
    pub fn as_bytes(&mut self) -> &[u8] {
        if self.stale {
            self.render();
        }
        &self.wire
    }

    /// Consumes the encoder, returning the serialized message.
    pub fn into_bytes(mut self) -> Vec<u8> {
        if self.stale {
            self.render();
        }
        self.wire
    }

    /// The token staged for this message.
    pub fn msg_token(&self) -> MsgToken {
        self.token
    }

    /// The staged options, in the ascending number order they will be
    /// serialized in.
    pub fn option_entries(&self) -> impl Iterator<Item = (OptionNumber, &[u8])> + '_ {
        self.options
            .iter()
            .map(|option| (option.number, option.value.as_slice()))
    }

    fn encoded_len(&self) -> usize {
        let mut len = 4 + self.token.len();
        let mut prev = OptionNumber(0);
        for option in &self.options {
            len += calc_option_size(prev, option.number, option.value.len());
            prev = option.number;
        }
        if !self.payload.is_empty() {
            len += 1 + self.payload.len();
        }
        len
    }

    fn render(&mut self) {
        let mut wire = Vec::with_capacity(self.encoded_len());

        // Version 1 in the top two bits, then type and token length.
        wire.push(0b0100_0000 | (self.msg_type as u8) << 4 | self.token.len() as u8);
        wire.push(self.msg_code as u8);
        wire.extend_from_slice(&self.msg_id.to_be_bytes());
        wire.extend_from_slice(self.token.as_bytes());

        let mut prev = OptionNumber(0);
        for option in &self.options {
            append_option(&mut wire, prev, option.number, &option.value)
                .expect("staged options are sorted and size-checked");
            prev = option.number;
        }

        if !self.payload.is_empty() {
            wire.push(0xFF);
            wire.extend_from_slice(&self.payload);
        }

        self.wire = wire;
        self.stale = false;
    }
}

impl Default for MessageEncoder {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageWrite for MessageEncoder {
    fn set_msg_type(&mut self, tt: MsgType) {
        self.msg_type = tt;
        self.stale = true;
    }

    fn set_msg_code(&mut self, code: MsgCode) {
        self.msg_code = code;
        self.stale = true;
    }

    fn set_msg_id(&mut self, msg_id: MsgId) {
        self.msg_id = msg_id;
        self.stale = true;
    }

    fn set_msg_token(&mut self, token: MsgToken) {
        self.token = token;
        self.stale = true;
    }

    fn append_payload_bytes(&mut self, body: &[u8]) -> Result<(), Error> {
        self.payload.extend_from_slice(body);
        self.stale = true;
        Ok(())
    }

    fn clear(&mut self) {
        *self = MessageEncoder::new();
    }
}

impl OptionInsert for MessageEncoder {
    fn insert_option_with_bytes(&mut self, key: OptionNumber, value: &[u8]) -> Result<(), Error> {
        if value.len() > crate::option::MAX_OPTION_VALUE_SIZE {
            return Err(Error::InvalidParameters);
        }
        if !key.is_repeatable() && self.options.iter().any(|option| option.number == key) {
            return Err(Error::InvalidParameters);
        }

        // Stable position among equal numbers keeps repeatable options in
        // insertion order.
        let at = self.options.partition_point(|option| option.number <= key);
        self.options.insert(
            at,
            StagedOption {
                number: key,
                value: value.to_vec(),
            },
        );
        self.stale = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::option::{OptionInsertExt, OptionNumber, BLOCK2, URI_PATH};

    #[test]
    fn minimal_message() {
        let mut encoder = MessageEncoder::new();
        encoder.set_msg_type(MsgType::Con);
        encoder.set_msg_code(MsgCode::MethodGet);
        encoder.set_msg_id(0x1234);

        assert_eq!(encoder.as_bytes(), &[0x40, 0x01, 0x12, 0x34]);
    }

    #[test]
    fn full_message_layout() {
        let mut encoder = MessageEncoder::new();
        encoder.set_msg_type(MsgType::Con);
        encoder.set_msg_code(MsgCode::MethodPost);
        encoder.set_msg_id(0xBEEF);
        encoder.set_msg_token(MsgToken::try_new(&[0xAA, 0xBB]).unwrap());
        encoder.insert_option(URI_PATH, "upload").unwrap();
        encoder.append_payload_bytes(b"hello").unwrap();

        let bytes = encoder.as_bytes();
        // Header: ver=1, type=CON, tkl=2.
        assert_eq!(bytes[0], 0x42);
        assert_eq!(bytes[1], 0x02);
        assert_eq!(&bytes[4..6], &[0xAA, 0xBB]);
        // Option: delta=11, len=6, "upload".
        assert_eq!(bytes[6], 0xB6);
        assert_eq!(&bytes[7..13], b"upload");
        // Payload marker and payload.
        assert_eq!(bytes[13], 0xFF);
        assert_eq!(&bytes[14..], b"hello");
    }

    #[test]
    fn staging_is_order_independent() {
        // Parts arrive backwards; the serialized message is still canonical.
        let mut backwards = MessageEncoder::new();
        backwards.append_payload_bytes(b"body").unwrap();
        backwards
            .insert_option(BLOCK2, crate::block::BlockInfo::default())
            .unwrap();
        backwards.insert_option(URI_PATH, "a").unwrap();
        backwards.set_msg_token(MsgToken::try_new(&[1]).unwrap());
        backwards.set_msg_code(MsgCode::MethodGet);
        backwards.set_msg_id(7);

        let mut forwards = MessageEncoder::new();
        forwards.set_msg_code(MsgCode::MethodGet);
        forwards.set_msg_id(7);
        forwards.set_msg_token(MsgToken::try_new(&[1]).unwrap());
        forwards.insert_option(URI_PATH, "a").unwrap();
        forwards
            .insert_option(BLOCK2, crate::block::BlockInfo::default())
            .unwrap();
        forwards.append_payload_bytes(b"body").unwrap();

        assert_eq!(backwards.as_bytes(), forwards.as_bytes());

        let numbers: Vec<OptionNumber> = backwards
            .option_entries()
            .map(|(number, _)| number)
            .collect();
        assert_eq!(numbers, vec![OptionNumber::URI_PATH, OptionNumber::BLOCK2]);
    }

    #[test]
    fn repeatable_options_keep_insertion_order() {
        let mut encoder = MessageEncoder::new();
        encoder.insert_option(URI_PATH, "first").unwrap();
        encoder.insert_option(URI_PATH, "second").unwrap();

        let values: Vec<&[u8]> = encoder.option_entries().map(|(_, value)| value).collect();
        assert_eq!(values, vec![&b"first"[..], &b"second"[..]]);
    }

    #[test]
    fn rejects_duplicate_nonrepeatable_option() {
        let mut encoder = MessageEncoder::new();
        encoder
            .insert_option(BLOCK2, crate::block::BlockInfo::default())
            .unwrap();
        assert_eq!(
            encoder.insert_option(BLOCK2, crate::block::BlockInfo::default()),
            Err(Error::InvalidParameters)
        );
    }

    #[test]
    fn mutation_after_read_refreshes_the_wire() {
        let mut encoder = MessageEncoder::new();
        encoder.set_msg_code(MsgCode::MethodGet);
        encoder.set_msg_id(1);
        let before = encoder.as_bytes().to_vec();

        encoder.append_payload_bytes(b"x").unwrap();
        let after = encoder.as_bytes().to_vec();

        assert_ne!(before, after);
        assert_eq!(&after[..4], &before[..4]);
        assert_eq!(&after[4..], &[0xFF, b'x']);
    }

    #[test]
    fn clear_resets_everything() {
        let mut encoder = MessageEncoder::new();
        encoder.set_msg_code(MsgCode::SuccessContent);
        encoder.set_msg_token(MsgToken::try_new(&[9]).unwrap());
        encoder.insert_option(URI_PATH, "x").unwrap();
        encoder.append_payload_bytes(b"p").unwrap();

        encoder.clear();
        assert_eq!(encoder.as_bytes(), &[0x40, 0x00, 0x00, 0x00]);
    }
}
