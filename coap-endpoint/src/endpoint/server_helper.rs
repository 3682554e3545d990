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

//! Server-side blockwise assistance.
//!
//! One helper is kept per registered handler. For PUT/POST it tracks `block1`
//! reassembly: the expected offset plus an etag identifying the reassembly
//! session. For GET it turns a handler's [`BlockSource`] (or flat payload)
//! into `block2`-windowed Content responses. Responses are a pure function of
//! the request and the helper state, so a retransmitted request produces a
//! byte-identical response.

use super::*;
use crate::block::{block_size, BlockInfo, BlockSize, BlockSource, VecBlockSource};
use crate::message::{MessageRead, MsgCode};
use crate::option::{OptionNumber, OptionParam};
use rand::Rng;
use std::sync::Mutex;

#[derive(Debug, Default, Copy, Clone)]
struct Block1State {
    active: bool,
    next_offset: usize,
    etag: u32,
}

/// Per-handler blockwise reassembly and windowing state.
#[derive(Debug)]
pub struct BlockwiseServerHelper {
    block1: Mutex<Block1State>,
}

impl Default for BlockwiseServerHelper {
    fn default() -> Self {
        BlockwiseServerHelper::new()
    }
}

impl BlockwiseServerHelper {
    /// Creates a helper with no reassembly in progress.
    pub fn new() -> BlockwiseServerHelper {
        BlockwiseServerHelper {
            block1: Mutex::new(Block1State::default()),
        }
    }

    /// The etag identifying the current (or last) `block1` reassembly
    /// session.
    pub fn etag(&self) -> u32 {
        self.block1.lock().expect("block1 state poisoned").etag
    }

    /// Applies `block1` continuity tracking to a PUT/POST fragment,
    /// rewriting the handler's response accordingly.
    ///
    /// A fragment at offset zero starts a fresh session (with a fresh etag),
    /// aborting any prior one. An out-of-sequence fragment yields
    /// `4.08 Request Entity Incomplete`. In-sequence fragments yield
    /// `2.31 Continue` while more are coming, and the handler's own response
    /// once the final fragment has arrived.
    pub fn on_block1_request(
        &self,
        request: &dyn MessageRead,
        mut response: OutgoingResponse,
    ) -> OutgoingResponse {
        let block1 = match request.block1() {
            Some(x) => x,
            None => return response,
        };
        let payload_len = request.payload().len();

        let mut state = self.block1.lock().expect("block1 state poisoned");

        if block1.offset() == 0 {
            if state.active {
                log::debug!("block1 restart at offset 0, aborting prior reassembly");
            }
            *state = Block1State {
                active: true,
                next_offset: 0,
                etag: rand::thread_rng().gen(),
            };
        }

        let in_sequence = state.active && block1.offset() == state.next_offset;
        let fragment_fills_block = payload_len == block1.size();
        let oversized_tail = !block1.more_flag() && payload_len > block1.size();

        if !in_sequence || (block1.more_flag() && !fragment_fills_block) || oversized_tail {
            log::debug!(
                "block1 fragment rejected: offset {} (expected {}), {} bytes",
                block1.offset(),
                state.next_offset,
                payload_len,
            );
            *state = Block1State::default();
            return OutgoingResponse::error(MsgCode::ClientErrorRequestEntityIncomplete);
        }

        state.next_offset += payload_len;

        // The response echoes the accepted block1 descriptor back.
        if block1.more_flag() {
            OutgoingResponse {
                code: MsgCode::SuccessContinue,
                options: vec![OptionParam::uint(OptionNumber::BLOCK1, block1.raw())],
                payload: Vec::new(),
                autogenerate_blockwise: false,
                block_source: None,
            }
        } else {
            state.active = false;
            response
                .options
                .push(OptionParam::uint(OptionNumber::BLOCK1, block1.raw()));
            response
        }
    }

    /// Serves one `block2` window of a GET response from the handler's block
    /// source (or its flat payload when no source was supplied).
    pub fn on_block2_request(
        &self,
        request: &dyn MessageRead,
        response: OutgoingResponse,
        default_szx: u8,
    ) -> OutgoingResponse {
        let window = request
            .block2()
            .unwrap_or_else(|| BlockInfo::new(0, false, default_szx).expect("default szx valid"));

        let szx = window.szx().min(default_szx);
        let size = block_size(szx).expect("clamped szx valid");
        let offset = window.num() as usize * size;

        let flat;
        let source: &dyn BlockSource = match response.block_source.as_deref() {
            Some(source) => source,
            None => {
                flat = VecBlockSource::new(response.payload.clone());
                &flat
            }
        };

        let BlockSize {
            size: available,
            more,
            in_range,
        } = source.get_data_size(offset, size);

        if !in_range {
            return OutgoingResponse::error(MsgCode::ClientErrorRequestEntityIncomplete);
        }

        // A short read is only legal on the final block.
        if more && available != size {
            log::warn!(
                "block source returned {} bytes where {} were required",
                available,
                size
            );
            return OutgoingResponse::error(MsgCode::ServerErrorInternalServerError);
        }

        let mut bytes = vec![0u8; available];
        if source.get_data(offset, available, &mut bytes).is_err() {
            return OutgoingResponse::error(MsgCode::ServerErrorInternalServerError);
        }

        let out_block =
            BlockInfo::new(window.num(), more, szx).expect("windowed block2 fits the packing");

        let mut options = response.options;
        options.push(OptionParam::uint(OptionNumber::BLOCK2, out_block.raw()));

        OutgoingResponse {
            code: response.code,
            options,
            payload: bytes,
            autogenerate_blockwise: false,
            block_source: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{MessageWrite, MsgToken, MsgType, ParsedMessage, MessageEncoder};
    use crate::option::{OptionInsertExt, BLOCK1, BLOCK2};

    fn request(
        method: MsgCode,
        block1: Option<BlockInfo>,
        block2: Option<BlockInfo>,
        payload: &[u8],
    ) -> Vec<u8> {
        let mut encoder = MessageEncoder::new();
        encoder.set_msg_type(MsgType::Con);
        encoder.set_msg_code(method);
        encoder.set_msg_id(1);
        encoder.set_msg_token(MsgToken::try_new(&[1]).unwrap());
        if let Some(block2) = block2 {
            encoder.insert_option(BLOCK2, block2).unwrap();
        }
        if let Some(block1) = block1 {
            encoder.insert_option(BLOCK1, block1).unwrap();
        }
        if !payload.is_empty() {
            encoder.append_payload_bytes(payload).unwrap();
        }
        encoder.into_bytes()
    }

    #[test]
    fn block1_sequence_continues_then_finishes() {
        let helper = BlockwiseServerHelper::new();
        let block = |num, more| BlockInfo::new(num, more, 0).unwrap();

        let bytes = request(MsgCode::MethodPut, Some(block(0, true)), None, &[0u8; 16]);
        let parsed = ParsedMessage::new(&bytes).unwrap();
        let reply = helper.on_block1_request(&parsed, OutgoingResponse::changed());
        assert_eq!(reply.code, MsgCode::SuccessContinue);

        let bytes = request(MsgCode::MethodPut, Some(block(1, true)), None, &[0u8; 16]);
        let parsed = ParsedMessage::new(&bytes).unwrap();
        let reply = helper.on_block1_request(&parsed, OutgoingResponse::changed());
        assert_eq!(reply.code, MsgCode::SuccessContinue);

        let bytes = request(MsgCode::MethodPut, Some(block(2, false)), None, &[0u8; 5]);
        let parsed = ParsedMessage::new(&bytes).unwrap();
        let reply = helper.on_block1_request(&parsed, OutgoingResponse::changed());
        assert_eq!(reply.code, MsgCode::SuccessChanged);
        // The final response echoes block1 with the more flag clear.
        assert!(reply
            .options
            .iter()
            .any(|p| p.number == OptionNumber::BLOCK1));
    }

    #[test]
    fn block1_gap_yields_request_entity_incomplete() {
        let helper = BlockwiseServerHelper::new();

        let bytes = request(
            MsgCode::MethodPut,
            Some(BlockInfo::new(0, true, 0).unwrap()),
            None,
            &[0u8; 16],
        );
        let parsed = ParsedMessage::new(&bytes).unwrap();
        helper.on_block1_request(&parsed, OutgoingResponse::changed());

        // Skips block 1, jumps to block 2.
        let bytes = request(
            MsgCode::MethodPut,
            Some(BlockInfo::new(2, true, 0).unwrap()),
            None,
            &[0u8; 16],
        );
        let parsed = ParsedMessage::new(&bytes).unwrap();
        let reply = helper.on_block1_request(&parsed, OutgoingResponse::changed());
        assert_eq!(reply.code, MsgCode::ClientErrorRequestEntityIncomplete);
    }

    #[test]
    fn block1_restart_at_zero_aborts_prior_session() {
        let helper = BlockwiseServerHelper::new();
        let first_block = request(
            MsgCode::MethodPut,
            Some(BlockInfo::new(0, true, 0).unwrap()),
            None,
            &[0u8; 16],
        );

        let parsed = ParsedMessage::new(&first_block).unwrap();
        helper.on_block1_request(&parsed, OutgoingResponse::changed());
        let first_etag = helper.etag();

        let parsed = ParsedMessage::new(&first_block).unwrap();
        let reply = helper.on_block1_request(&parsed, OutgoingResponse::changed());
        assert_eq!(reply.code, MsgCode::SuccessContinue);
        assert_ne!(helper.etag(), first_etag);
    }

    #[test]
    fn block2_windows_a_large_payload() {
        let helper = BlockwiseServerHelper::new();
        let body: Vec<u8> = (0..40u8).collect();

        let first = request(
            MsgCode::MethodGet,
            None,
            Some(BlockInfo::new(0, false, 0).unwrap()),
            &[],
        );
        let parsed = ParsedMessage::new(&first).unwrap();
        let reply = helper.on_block2_request(
            &parsed,
            OutgoingResponse::content(body.clone()),
            crate::block::DEFAULT_BLOCK_SZX,
        );
        assert_eq!(reply.code, MsgCode::SuccessContent);
        assert_eq!(reply.payload, &body[..16]);
        let echoed = reply
            .options
            .iter()
            .find(|p| p.number == OptionNumber::BLOCK2)
            .unwrap();
        assert_eq!(
            echoed.value,
            crate::option::OwnedOptionValue::Uint(BlockInfo::new(0, true, 0).unwrap().raw())
        );

        let last = request(
            MsgCode::MethodGet,
            None,
            Some(BlockInfo::new(2, false, 0).unwrap()),
            &[],
        );
        let parsed = ParsedMessage::new(&last).unwrap();
        let reply = helper.on_block2_request(
            &parsed,
            OutgoingResponse::content(body.clone()),
            crate::block::DEFAULT_BLOCK_SZX,
        );
        assert_eq!(reply.payload, &body[32..]);
        let echoed = reply
            .options
            .iter()
            .find(|p| p.number == OptionNumber::BLOCK2)
            .unwrap();
        assert_eq!(
            echoed.value,
            crate::option::OwnedOptionValue::Uint(BlockInfo::new(2, false, 0).unwrap().raw())
        );
    }

    #[test]
    fn block2_past_the_end_is_rejected() {
        let helper = BlockwiseServerHelper::new();
        let bytes = request(
            MsgCode::MethodGet,
            None,
            Some(BlockInfo::new(9, false, 0).unwrap()),
            &[],
        );
        let parsed = ParsedMessage::new(&bytes).unwrap();
        let reply = helper.on_block2_request(
            &parsed,
            OutgoingResponse::content(vec![0u8; 40]),
            crate::block::DEFAULT_BLOCK_SZX,
        );
        assert_eq!(reply.code, MsgCode::ClientErrorRequestEntityIncomplete);
    }
}
