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

use std::fmt::{Display, Formatter};

/// Enum representing a CoAP message code: a 3-bit class and a 5-bit detail,
/// conventionally written `c.dd` (`0.01` for GET, `2.05` for Content, ...).
#[derive(Debug, Copy, Eq, PartialEq, Clone, Hash)]
#[allow(missing_docs)]
pub enum MsgCode {
    /// Code `0.00`: empty messages (pings, pure ACKs, resets).
    Empty = 0x00,

    MethodGet = 0x01,
    MethodPost = 0x02,
    MethodPut = 0x03,
    MethodDelete = 0x04,

    SuccessCreated = 0x41,
    SuccessDeleted = 0x42,
    SuccessValid = 0x43,
    SuccessChanged = 0x44,
    SuccessContent = 0x45,
    SuccessContinue = 0x5F,

    ClientErrorBadRequest = 0x80,
    ClientErrorUnauthorized = 0x81,
    ClientErrorBadOption = 0x82,
    ClientErrorForbidden = 0x83,
    ClientErrorNotFound = 0x84,
    ClientErrorMethodNotAllowed = 0x85,
    ClientErrorNotAcceptable = 0x86,
    ClientErrorRequestEntityIncomplete = 0x88,
    ClientErrorPreconditionFailed = 0x8C,
    ClientErrorRequestEntityTooLarge = 0x8D,
    ClientErrorUnsupportedContentFormat = 0x8F,

    ServerErrorInternalServerError = 0xA0,
    ServerErrorNotImplemented = 0xA1,
    ServerErrorBadGateway = 0xA2,
    ServerErrorServiceUnavailable = 0xA3,
    ServerErrorGatewayTimeout = 0xA4,
    ServerErrorProxyingNotSupported = 0xA5,
}

/// Enum representing the class of a [`MsgCode`]: the upper three bits.
#[derive(Debug, Copy, Eq, PartialEq, Clone, Hash)]
pub enum MsgCodeClass {
    /// Class 0: requests (and the empty code).
    Method = 0,

    /// Class 2: success responses.
    Success = 2,

    /// Class 4: client error responses.
    ClientError = 4,

    /// Class 5: server error responses.
    ServerError = 5,
}

impl MsgCodeClass {
    /// Creates a `MsgCodeClass` from a class value, returning `None` for
    /// reserved classes.
    pub fn try_from(class: u8) -> Option<MsgCodeClass> {
        match class {
            0 => Some(MsgCodeClass::Method),
            2 => Some(MsgCodeClass::Success),
            4 => Some(MsgCodeClass::ClientError),
            5 => Some(MsgCodeClass::ServerError),
            _ => None,
        }
    }
}

impl MsgCode {
    /// Creates a `MsgCode` from a wire byte, returning `None` for codes this
    /// crate does not recognize.
    pub fn try_from(code: u8) -> Option<MsgCode> {
        use MsgCode::*;
        match code {
            0x00 => Some(Empty),
            0x01 => Some(MethodGet),
            0x02 => Some(MethodPost),
            0x03 => Some(MethodPut),
            0x04 => Some(MethodDelete),
            0x41 => Some(SuccessCreated),
            0x42 => Some(SuccessDeleted),
            0x43 => Some(SuccessValid),
            0x44 => Some(SuccessChanged),
            0x45 => Some(SuccessContent),
            0x5F => Some(SuccessContinue),
            0x80 => Some(ClientErrorBadRequest),
            0x81 => Some(ClientErrorUnauthorized),
            0x82 => Some(ClientErrorBadOption),
            0x83 => Some(ClientErrorForbidden),
            0x84 => Some(ClientErrorNotFound),
            0x85 => Some(ClientErrorMethodNotAllowed),
            0x86 => Some(ClientErrorNotAcceptable),
            0x88 => Some(ClientErrorRequestEntityIncomplete),
            0x8C => Some(ClientErrorPreconditionFailed),
            0x8D => Some(ClientErrorRequestEntityTooLarge),
            0x8F => Some(ClientErrorUnsupportedContentFormat),
            0xA0 => Some(ServerErrorInternalServerError),
            0xA1 => Some(ServerErrorNotImplemented),
            0xA2 => Some(ServerErrorBadGateway),
            0xA3 => Some(ServerErrorServiceUnavailable),
            0xA4 => Some(ServerErrorGatewayTimeout),
            0xA5 => Some(ServerErrorProxyingNotSupported),
            _ => None,
        }
    }

    /// The class of this code (upper three bits).
    pub fn class(self) -> MsgCodeClass {
        MsgCodeClass::try_from((self as u8) >> 5).expect("constructed code has valid class")
    }

    /// The detail of this code (lower five bits).
    pub fn detail(self) -> u8 {
        (self as u8) & 0x1F
    }

    /// Returns true if this is the empty code (`0.00`).
    pub fn is_empty(self) -> bool {
        self == MsgCode::Empty
    }

    /// Returns true if this code is a request method.
    pub fn is_method(self) -> bool {
        self.class() == MsgCodeClass::Method && !self.is_empty()
    }

    /// Returns true if this code is any kind of response.
    pub fn is_response(self) -> bool {
        !matches!(self.class(), MsgCodeClass::Method)
    }

    /// Returns true if this code is a success response (class 2).
    pub fn is_success(self) -> bool {
        self.class() == MsgCodeClass::Success
    }

    /// Returns true if this code is a client error response (class 4).
    pub fn is_client_error(self) -> bool {
        self.class() == MsgCodeClass::ClientError
    }

    /// Returns true if this code is a server error response (class 5).
    pub fn is_server_error(self) -> bool {
        self.class() == MsgCodeClass::ServerError
    }
}

impl Default for MsgCode {
    fn default() -> Self {
        MsgCode::Empty
    }
}

impl Display for MsgCode {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), std::fmt::Error> {
        write!(f, "{}.{:02} ({:?})", self.class() as u8, self.detail(), self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_byte_round_trip() {
        for byte in 0u8..=0xFF {
            if let Some(code) = MsgCode::try_from(byte) {
                assert_eq!(code as u8, byte);
                assert_eq!(
                    (code.class() as u8) << 5 | code.detail(),
                    byte,
                    "class/detail split broken for {:?}",
                    code
                );
            }
        }
    }

    #[test]
    fn classification() {
        assert!(MsgCode::MethodGet.is_method());
        assert!(!MsgCode::MethodGet.is_response());
        assert!(MsgCode::SuccessContent.is_success());
        assert!(MsgCode::ClientErrorNotFound.is_client_error());
        assert!(MsgCode::ServerErrorInternalServerError.is_server_error());
        assert!(MsgCode::Empty.is_empty());
        assert!(!MsgCode::Empty.is_method());
    }
}
