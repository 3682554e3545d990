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
use crate::option::{OptionIterator, OptionIteratorExt};
use crate::Error;

/// Trait for reading the fields of a CoAP message.
pub trait MessageRead {
    /// The message type.
    fn msg_type(&self) -> MsgType;

    /// The message code.
    fn msg_code(&self) -> MsgCode;

    /// The message id.
    fn msg_id(&self) -> MsgId;

    /// The message token.
    fn msg_token(&self) -> MsgToken;

    /// The payload bytes. Empty when the message has no payload.
    fn payload(&self) -> &[u8];

    /// An iterator over the options, in ascending number order.
    fn options(&self) -> OptionIterator<'_>;

    /// The BLOCK1 option value, if present and valid.
    fn block1(&self) -> Option<BlockInfo> {
        self.options()
            .find_next_of(crate::option::BLOCK1)
            .and_then(|x| x.ok())
    }

    /// The BLOCK2 option value, if present and valid.
    fn block2(&self) -> Option<BlockInfo> {
        self.options()
            .find_next_of(crate::option::BLOCK2)
            .and_then(|x| x.ok())
    }

    /// Copies this message (type, code, id, token, options, payload) into
    /// `target`.
    fn write_msg_to(&self, target: &mut dyn MessageBuild) -> Result<(), Error> {
        target.clear();
        target.set_msg_type(self.msg_type());
        target.set_msg_code(self.msg_code());
        target.set_msg_id(self.msg_id());
        target.set_msg_token(self.msg_token());
        for option in self.options() {
            let (key, value) = option?;
            target.insert_option_with_bytes(key, value)?;
        }
        let payload = self.payload();
        if !payload.is_empty() {
            target.append_payload_bytes(payload)?;
        }
        Ok(())
    }
}

/// An empty acknowledgement message for the given message id.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct AckMessage(pub MsgId);

impl AckMessage {
    /// Writes this message into `target`.
    pub fn write_msg_to(&self, target: &mut dyn MessageBuild) -> Result<(), Error> {
        target.clear();
        target.set_msg_type(MsgType::Ack);
        target.set_msg_code(MsgCode::Empty);
        target.set_msg_id(self.0);
        Ok(())
    }
}

/// A reset message for the given message id.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct ResetMessage(pub MsgId);

impl ResetMessage {
    /// Writes this message into `target`.
    pub fn write_msg_to(&self, target: &mut dyn MessageBuild) -> Result<(), Error> {
        target.clear();
        target.set_msg_type(MsgType::Rst);
        target.set_msg_code(MsgCode::Empty);
        target.set_msg_id(self.0);
        Ok(())
    }
}
