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
use crate::block::BlockInfo;
use crate::option::{OptionIterator, OptionNumber};
use crate::Error;

/// The result of a full validation pass over an encoded message.
struct ParsedFields {
    msg_type: MsgType,
    msg_code: MsgCode,
    msg_id: MsgId,
    token: MsgToken,
    block1: Option<BlockInfo>,
    block2: Option<BlockInfo>,
    option_start: usize,
    payload_start: usize,
}

fn parse_fields(buffer: &[u8]) -> Result<ParsedFields, Error> {
    if buffer.len() < 4 {
        return Err(Error::InvalidFormat);
    }

    if (buffer[0] & COAP_MSG_VER_MASK) >> COAP_MSG_VER_OFFS != 1 {
        return Err(Error::InvalidFormat);
    }

    let msg_type = MsgType::try_from((buffer[0] & COAP_MSG_T_MASK) >> COAP_MSG_T_OFFS)
        .expect("two-bit field is always in range");
    let msg_code = MsgCode::try_from(buffer[1]).ok_or(Error::InvalidFormat)?;
    let msg_id = ((buffer[2] as u16) << 8) | buffer[3] as u16;

    let token_len = (buffer[0] & COAP_MSG_TKL_MASK) as usize;
    if token_len > 8 || 4 + token_len > buffer.len() {
        return Err(Error::InvalidFormat);
    }
    let token =
        MsgToken::try_new(&buffer[4..4 + token_len]).expect("token length already checked");

    let mut block1 = None;
    let mut block2 = None;

    let mut iter = OptionIterator::new(&buffer[4 + token_len..]);

    for result in &mut iter {
        match result? {
            (OptionNumber::BLOCK1, value) => {
                let raw = codec::try_decode_u32(value).ok_or(Error::InvalidFormat)?;
                block1 = Some(BlockInfo::from_raw(raw).ok_or(Error::InvalidFormat)?);
            }
            (OptionNumber::BLOCK2, value) => {
                let raw = codec::try_decode_u32(value).ok_or(Error::InvalidFormat)?;
                block2 = Some(BlockInfo::from_raw(raw).ok_or(Error::InvalidFormat)?);
            }
            _ => (),
        }
    }

    let payload_start = buffer.len() - iter.as_slice().len();

    Ok(ParsedFields {
        msg_type,
        msg_code,
        msg_id,
        token,
        block1,
        block2,
        option_start: 4 + token_len,
        payload_start,
    })
}

/// A zero-copy view of a CoAP message parsed out of a transport buffer.
///
/// The view borrows the buffer it was decoded from: callers must not retain
/// it beyond the callback in which it was delivered. Use
/// [`ParsedMessage::to_owned`] to keep a copy.
#[derive(Debug)]
pub struct ParsedMessage<'buf> {
    buffer: &'buf [u8],
    fields: ParsedFields,
}

impl std::fmt::Debug for ParsedFields {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParsedFields")
            .field("msg_type", &self.msg_type)
            .field("msg_code", &self.msg_code)
            .field("msg_id", &self.msg_id)
            .field("token", &self.token)
            .finish()
    }
}

impl<'buf> ParsedMessage<'buf> {
    /// Parses and validates the given encoded message.
    pub fn new(buffer: &'buf [u8]) -> Result<ParsedMessage<'buf>, Error> {
        Ok(ParsedMessage {
            buffer,
            fields: parse_fields(buffer)?,
        })
    }

    /// Returns a byte slice containing the whole encoded message.
    pub fn as_bytes(&self) -> &'buf [u8] {
        self.buffer
    }

    /// Copies this view into an [`OwnedMessage`].
    pub fn to_owned(&self) -> OwnedMessage {
        OwnedMessage::new(self.buffer.to_vec()).expect("already validated")
    }
}

impl<'buf> MessageRead for ParsedMessage<'buf> {
    fn msg_type(&self) -> MsgType {
        self.fields.msg_type
    }

    fn msg_code(&self) -> MsgCode {
        self.fields.msg_code
    }

    fn msg_id(&self) -> MsgId {
        self.fields.msg_id
    }

    fn msg_token(&self) -> MsgToken {
        self.fields.token
    }

    fn payload(&self) -> &[u8] {
        &self.buffer[self.fields.payload_start..]
    }

    fn options(&self) -> OptionIterator<'_> {
        OptionIterator::new(&self.buffer[self.fields.option_start..])
    }

    fn block1(&self) -> Option<BlockInfo> {
        self.fields.block1
    }

    fn block2(&self) -> Option<BlockInfo> {
        self.fields.block2
    }
}

/// An immutable, heap-allocated CoAP message.
#[derive(Debug)]
pub struct OwnedMessage {
    buffer: Vec<u8>,
    fields: ParsedFields,
}

impl OwnedMessage {
    /// Validates the given encoded message and takes ownership of it.
    pub fn new(buffer: Vec<u8>) -> Result<OwnedMessage, Error> {
        let fields = parse_fields(&buffer)?;
        Ok(OwnedMessage { buffer, fields })
    }

    /// Returns a byte slice containing the whole encoded message.
    pub fn as_bytes(&self) -> &[u8] {
        &self.buffer
    }
}

impl Clone for OwnedMessage {
    fn clone(&self) -> Self {
        OwnedMessage::new(self.buffer.clone()).expect("already validated")
    }
}

impl PartialEq for OwnedMessage {
    fn eq(&self, other: &Self) -> bool {
        self.buffer == other.buffer
    }
}

impl Eq for OwnedMessage {}

impl MessageRead for OwnedMessage {
    fn msg_type(&self) -> MsgType {
        self.fields.msg_type
    }

    fn msg_code(&self) -> MsgCode {
        self.fields.msg_code
    }

    fn msg_id(&self) -> MsgId {
        self.fields.msg_id
    }

    fn msg_token(&self) -> MsgToken {
        self.fields.token
    }

    fn payload(&self) -> &[u8] {
        &self.buffer[self.fields.payload_start..]
    }

    fn options(&self) -> OptionIterator<'_> {
        OptionIterator::new(&self.buffer[self.fields.option_start..])
    }

    fn block1(&self) -> Option<BlockInfo> {
        self.fields.block1
    }

    fn block2(&self) -> Option<BlockInfo> {
        self.fields.block2
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::option::{OptionInsertExt, BLOCK2, URI_PATH};

    #[test]
    fn round_trip_preserves_all_fields() {
        let mut encoder = MessageEncoder::new();
        encoder.set_msg_type(MsgType::Non);
        encoder.set_msg_code(MsgCode::MethodPut);
        encoder.set_msg_id(0xCAFE);
        encoder.set_msg_token(MsgToken::try_new(&[1, 2, 3, 4]).unwrap());
        encoder.insert_option(URI_PATH, "a").unwrap();
        encoder.insert_option(URI_PATH, "b").unwrap();
        encoder
            .insert_option(BLOCK2, BlockInfo::new(3, true, 4).unwrap())
            .unwrap();
        encoder.append_payload_bytes(b"payload bytes").unwrap();

        let bytes = encoder.into_bytes();
        let parsed = ParsedMessage::new(&bytes).unwrap();

        assert_eq!(parsed.msg_type(), MsgType::Non);
        assert_eq!(parsed.msg_code(), MsgCode::MethodPut);
        assert_eq!(parsed.msg_id(), 0xCAFE);
        assert_eq!(parsed.msg_token().as_bytes(), &[1, 2, 3, 4]);
        assert_eq!(parsed.payload(), b"payload bytes");
        assert_eq!(parsed.block2(), BlockInfo::new(3, true, 4));
        assert_eq!(parsed.block1(), None);

        let options: Vec<_> = parsed.options().map(|x| x.unwrap()).collect();
        assert_eq!(
            options,
            vec![
                (crate::option::OptionNumber::URI_PATH, &b"a"[..]),
                (crate::option::OptionNumber::URI_PATH, &b"b"[..]),
                (crate::option::OptionNumber::BLOCK2, &[0x3C][..]),
            ]
        );
    }

    #[test]
    fn rewrite_yields_identical_bytes() {
        let mut encoder = MessageEncoder::new();
        encoder.set_msg_type(MsgType::Con);
        encoder.set_msg_code(MsgCode::SuccessContent);
        encoder.set_msg_id(7);
        encoder.set_msg_token(MsgToken::try_new(&[9]).unwrap());
        encoder.insert_option(URI_PATH, "x").unwrap();
        encoder.append_payload_bytes(b"pong").unwrap();

        let bytes = encoder.into_bytes();
        let parsed = ParsedMessage::new(&bytes).unwrap();

        let mut copy = MessageEncoder::new();
        parsed.write_msg_to(&mut copy).unwrap();
        assert_eq!(copy.as_bytes(), &bytes[..]);
    }

    #[test]
    fn rejects_bad_version() {
        // Version 0.
        assert_eq!(
            ParsedMessage::new(&[0x00, 0x01, 0x00, 0x01]).err(),
            Some(Error::InvalidFormat)
        );
    }

    #[test]
    fn rejects_truncated_token() {
        // Header claims an 8-byte token but only 2 bytes follow.
        assert_eq!(
            ParsedMessage::new(&[0x48, 0x01, 0x00, 0x01, 0xAA, 0xBB]).err(),
            Some(Error::InvalidFormat)
        );
    }

    #[test]
    fn rejects_reserved_token_length() {
        assert_eq!(
            ParsedMessage::new(&[0x4D, 0x01, 0x00, 0x01]).err(),
            Some(Error::InvalidFormat)
        );
    }

    #[test]
    fn empty_payload_without_marker() {
        let parsed = ParsedMessage::new(&[0x40, 0x01, 0x00, 0x01]).unwrap();
        assert_eq!(parsed.payload(), b"");
    }
}
