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
use std::fmt::{Display, Formatter};

/// Wrapper that displays any [`MessageRead`] in a compact, log-friendly form.
pub struct MessageDisplay<'a, T: MessageRead + ?Sized>(pub &'a T);

impl<'a, T: MessageRead + ?Sized> Display for MessageDisplay<'a, T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), std::fmt::Error> {
        let msg = self.0;
        write!(
            f,
            "{:?} {} mid={:04X} tok={}",
            msg.msg_type(),
            msg.msg_code(),
            msg.msg_id(),
            msg.msg_token(),
        )?;

        for option in msg.options() {
            match option {
                Ok((key, value)) => write!(f, " {}:{:02x?}", key, value)?,
                Err(_) => return f.write_str(" <corrupt options>"),
            }
        }

        if !msg.payload().is_empty() {
            write!(f, " pl={}B", msg.payload().len())?;
        }
        Ok(())
    }
}

/// Wrapper that displays a raw datagram as a parsed message when possible,
/// falling back to a hex dump.
pub struct DatagramDisplay<'a>(pub &'a [u8]);

impl<'a> Display for DatagramDisplay<'a> {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), std::fmt::Error> {
        match ParsedMessage::new(self.0) {
            Ok(parsed) => MessageDisplay(&parsed).fmt(f),
            Err(_) => {
                f.write_str("<unparsable>")?;
                for byte in self.0.iter().take(32) {
                    write!(f, " {:02X}", byte)?;
                }
                if self.0.len() > 32 {
                    f.write_str(" ...")?;
                }
                Ok(())
            }
        }
    }
}
