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
use crate::option::OptionInsert;
use crate::Error;

/// Trait for objects that messages can be written to, such as the encoders.
pub trait MessageWrite {
    /// Sets the message type.
    fn set_msg_type(&mut self, tt: MsgType);

    /// Sets the message code.
    fn set_msg_code(&mut self, code: MsgCode);

    /// Sets the message id.
    fn set_msg_id(&mut self, msg_id: MsgId);

    /// Sets the message token.
    fn set_msg_token(&mut self, token: MsgToken);

    /// Appends bytes to the payload.
    fn append_payload_bytes(&mut self, body: &[u8]) -> Result<(), Error>;

    /// Resets the object to an empty message.
    fn clear(&mut self);
}

/// Composite trait for sinks a complete message can be built into: header
/// fields plus options.
pub trait MessageBuild: MessageWrite + OptionInsert {}

impl<T: MessageWrite + OptionInsert + ?Sized> MessageBuild for T {}
