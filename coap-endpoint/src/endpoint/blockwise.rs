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

//! Client-side blockwise state machine.
//!
//! Drives `block1` uploads pulled from an application [`BlockSource`] and
//! `block2` downloads delivered block-by-block to the response listener. The
//! [endpoint](super) owns the transmission plumbing; this module owns the
//! decisions.

use crate::block::{
    block_size, BlockDisposition, BlockInfo, BlockReassembler, BlockSource,
};
use crate::message::{MessageRead, MsgCode};
use crate::Error;
use std::sync::Arc;

/// Upload (`block1`) side of a blockwise exchange.
pub(crate) struct UploadState {
    pub source: Arc<dyn BlockSource>,
    pub next_offset: usize,
    pub szx: u8,
    pub finished: bool,
}

impl std::fmt::Debug for UploadState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UploadState")
            .field("next_offset", &self.next_offset)
            .field("szx", &self.szx)
            .field("finished", &self.finished)
            .finish()
    }
}

/// Download (`block2`) side of a blockwise exchange.
#[derive(Debug)]
pub(crate) struct DownloadState {
    pub reassembler: BlockReassembler,
    pub szx: u8,
}

/// Blockwise state carried by a pending request created through
/// [`Endpoint::send_blockwise_request`](super::Endpoint::send_blockwise_request).
#[derive(Debug, Default)]
pub(crate) struct BlockwiseState {
    pub upload: Option<UploadState>,
    pub download: Option<DownloadState>,
}

/// What the endpoint should do with a response on a blockwise request.
#[derive(Debug)]
pub(crate) enum BlockwiseDirective {
    /// Deliver the response through `on_next` and finish with `on_complete`.
    DeliverFinal,

    /// Duplicate or stale block; drop it and keep waiting.
    Ignore,

    /// Send the next `block1` fragment; nothing is delivered for the
    /// acknowledged one.
    ContinueUpload {
        /// The `block1` option for the next fragment.
        block: BlockInfo,
        /// The fragment payload.
        payload: Vec<u8>,
    },

    /// Deliver this block through `on_next`; then either request the next
    /// `block2` window or finish with `on_complete`.
    DeliverBlock {
        /// The `block2` option of the follow-up request, when more blocks
        /// remain.
        next: Option<BlockInfo>,
    },

    /// Fail the request through `on_error`.
    Fail {
        error: Error,
        message: &'static str,
    },
}

/// Pulls the fragment starting at `upload.next_offset` out of the source,
/// advancing the cursor.
///
/// Returns `Ok(None)` when the source reports the offset out of range (end
/// of data). Marks the upload finished on the last fragment.
pub(crate) fn next_upload_chunk(
    upload: &mut UploadState,
) -> Result<Option<(BlockInfo, Vec<u8>)>, Error> {
    let size = block_size(upload.szx).ok_or(Error::InvalidParameters)?;
    let negotiated = upload.source.get_data_size(upload.next_offset, size);

    if !negotiated.in_range {
        upload.finished = true;
        return Ok(None);
    }

    if negotiated.more && negotiated.size != size {
        // A non-final fragment must fill its block.
        return Err(Error::Internal);
    }
    if negotiated.size > size {
        return Err(Error::Internal);
    }

    let block = BlockInfo::for_offset(upload.next_offset, negotiated.more, upload.szx)
        .ok_or(Error::Internal)?;

    let mut payload = vec![0u8; negotiated.size];
    upload
        .source
        .get_data(upload.next_offset, negotiated.size, &mut payload)?;

    upload.next_offset += negotiated.size;
    upload.finished = !negotiated.more;

    Ok(Some((block, payload)))
}

/// Decides how to proceed after `msg` arrived for a blockwise request.
pub(crate) fn handle_response(
    state: &mut BlockwiseState,
    msg: &dyn MessageRead,
) -> BlockwiseDirective {
    // Mid-upload: expect 2.31 Continue echoing block1.
    if let Some(upload) = state.upload.as_mut() {
        if !upload.finished {
            if msg.msg_code() == MsgCode::SuccessContinue {
                if let Some(echo) = msg.block1() {
                    if echo.szx() < upload.szx {
                        // The server negotiated the block size down; later
                        // fragments are renumbered at the new size.
                        log::debug!(
                            "block1 size reduced from szx {} to {}",
                            upload.szx,
                            echo.szx()
                        );
                        upload.szx = echo.szx();
                    }
                }

                return match next_upload_chunk(upload) {
                    Ok(Some((block, payload))) => {
                        BlockwiseDirective::ContinueUpload { block, payload }
                    }
                    Ok(None) => BlockwiseDirective::Fail {
                        error: Error::OutOfRange,
                        message: "Block source ended before the final fragment",
                    },
                    Err(error) => BlockwiseDirective::Fail {
                        error,
                        message: "Block source failed mid-upload",
                    },
                };
            }

            // Any non-Continue response ends the exchange early.
            return BlockwiseDirective::DeliverFinal;
        }
    }

    // Download side.
    let block2 = match msg.block2() {
        Some(x) => x,
        None => return BlockwiseDirective::DeliverFinal,
    };

    if state.download.is_none() {
        if block2.offset() != 0 {
            return BlockwiseDirective::Fail {
                error: Error::Internal,
                message: "Message start block out of order",
            };
        }
        state.download = Some(DownloadState {
            reassembler: BlockReassembler::new(),
            szx: block2.szx(),
        });
    }

    let download = state.download.as_mut().expect("just initialized");
    download.szx = block2.szx();

    match download.reassembler.feed(block2, msg.payload().len()) {
        Ok(BlockDisposition::Consume) => {
            if block2.more_flag() {
                let size = block_size(download.szx).expect("parsed szx valid");
                let num = (download.reassembler.next_offset() / size) as u32;
                match BlockInfo::new(num, false, download.szx) {
                    Some(next) => BlockwiseDirective::DeliverBlock { next: Some(next) },
                    None => BlockwiseDirective::Fail {
                        error: Error::OutOfRange,
                        message: "Block number space exhausted",
                    },
                }
            } else {
                BlockwiseDirective::DeliverBlock { next: None }
            }
        }
        Ok(BlockDisposition::Duplicate) | Ok(BlockDisposition::Finished) => {
            BlockwiseDirective::Ignore
        }
        Err(_) => BlockwiseDirective::Fail {
            error: Error::OutOfRange,
            message: "Response block out of order",
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::VecBlockSource;
    use crate::message::{MessageWrite, MsgToken, MsgType, ParsedMessage, MessageEncoder};
    use crate::option::{OptionInsertExt, BLOCK1, BLOCK2};

    fn upload(data: &[u8], szx: u8) -> UploadState {
        UploadState {
            source: Arc::new(VecBlockSource::new(data.to_vec())),
            next_offset: 0,
            szx,
            finished: false,
        }
    }

    fn response(
        code: MsgCode,
        block1: Option<BlockInfo>,
        block2: Option<BlockInfo>,
        payload: &[u8],
    ) -> Vec<u8> {
        let mut encoder = MessageEncoder::new();
        encoder.set_msg_type(MsgType::Ack);
        encoder.set_msg_code(code);
        encoder.set_msg_id(1);
        encoder.set_msg_token(MsgToken::try_new(&[1]).unwrap());
        if let Some(b) = block2 {
            encoder.insert_option(BLOCK2, b).unwrap();
        }
        if let Some(b) = block1 {
            encoder.insert_option(BLOCK1, b).unwrap();
        }
        if !payload.is_empty() {
            encoder.append_payload_bytes(payload).unwrap();
        }
        encoder.into_bytes()
    }

    #[test]
    fn chunking_splits_and_finishes() {
        let mut up = upload(&[9u8; 40], 0);

        let (block, payload) = next_upload_chunk(&mut up).unwrap().unwrap();
        assert_eq!((block.num(), block.more_flag()), (0, true));
        assert_eq!(payload.len(), 16);
        assert!(!up.finished);

        let (block, payload) = next_upload_chunk(&mut up).unwrap().unwrap();
        assert_eq!((block.num(), block.more_flag()), (1, true));
        assert_eq!(payload.len(), 16);

        let (block, payload) = next_upload_chunk(&mut up).unwrap().unwrap();
        assert_eq!((block.num(), block.more_flag()), (2, false));
        assert_eq!(payload.len(), 8);
        assert!(up.finished);
    }

    #[test]
    fn continue_drives_next_fragment() {
        let mut state = BlockwiseState {
            upload: Some(upload(&[1u8; 40], 0)),
            download: None,
        };
        // Fragment 0 already sent.
        next_upload_chunk(state.upload.as_mut().unwrap()).unwrap();

        let bytes = response(
            MsgCode::SuccessContinue,
            Some(BlockInfo::new(0, true, 0).unwrap()),
            None,
            &[],
        );
        let parsed = ParsedMessage::new(&bytes).unwrap();

        match handle_response(&mut state, &parsed) {
            BlockwiseDirective::ContinueUpload { block, payload } => {
                assert_eq!(block.num(), 1);
                assert!(block.more_flag());
                assert_eq!(payload.len(), 16);
            }
            other => panic!("unexpected directive: {:?}", other),
        }
    }

    #[test]
    fn size_reduction_renumbers_fragments() {
        let mut state = BlockwiseState {
            upload: Some(upload(&[1u8; 96], 1)), // 32-byte fragments
            download: None,
        };
        // Fragment 0 (32 bytes) sent at szx=1.
        next_upload_chunk(state.upload.as_mut().unwrap()).unwrap();

        // Server echoes with szx=0: 16-byte blocks from here on.
        let bytes = response(
            MsgCode::SuccessContinue,
            Some(BlockInfo::new(0, true, 0).unwrap()),
            None,
            &[],
        );
        let parsed = ParsedMessage::new(&bytes).unwrap();

        match handle_response(&mut state, &parsed) {
            BlockwiseDirective::ContinueUpload { block, payload } => {
                // Offset 32 at 16-byte blocks is block number 2.
                assert_eq!(block.num(), 2);
                assert_eq!(block.szx(), 0);
                assert_eq!(payload.len(), 16);
            }
            other => panic!("unexpected directive: {:?}", other),
        }
    }

    #[test]
    fn download_start_must_be_offset_zero() {
        let mut state = BlockwiseState::default();
        let bytes = response(
            MsgCode::SuccessContent,
            None,
            Some(BlockInfo::new(1, true, 0).unwrap()),
            &[0u8; 16],
        );
        let parsed = ParsedMessage::new(&bytes).unwrap();

        match handle_response(&mut state, &parsed) {
            BlockwiseDirective::Fail { error, message } => {
                assert_eq!(error, Error::Internal);
                assert_eq!(message, "Message start block out of order");
            }
            other => panic!("unexpected directive: {:?}", other),
        }
    }

    #[test]
    fn download_walks_blocks_then_completes() {
        let mut state = BlockwiseState::default();

        let bytes = response(
            MsgCode::SuccessContent,
            None,
            Some(BlockInfo::new(0, true, 0).unwrap()),
            &[0u8; 16],
        );
        let parsed = ParsedMessage::new(&bytes).unwrap();
        match handle_response(&mut state, &parsed) {
            BlockwiseDirective::DeliverBlock { next: Some(next) } => {
                assert_eq!(next.num(), 1);
                assert!(!next.more_flag());
            }
            other => panic!("unexpected directive: {:?}", other),
        }

        let bytes = response(
            MsgCode::SuccessContent,
            None,
            Some(BlockInfo::new(1, false, 0).unwrap()),
            &[0u8; 7],
        );
        let parsed = ParsedMessage::new(&bytes).unwrap();
        match handle_response(&mut state, &parsed) {
            BlockwiseDirective::DeliverBlock { next: None } => (),
            other => panic!("unexpected directive: {:?}", other),
        }
    }

    #[test]
    fn plain_response_is_final() {
        let mut state = BlockwiseState::default();
        let bytes = response(MsgCode::SuccessChanged, None, None, b"done");
        let parsed = ParsedMessage::new(&bytes).unwrap();
        assert!(matches!(
            handle_response(&mut state, &parsed),
            BlockwiseDirective::DeliverFinal
        ));
    }
}
