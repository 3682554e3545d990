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

//! The CoAP endpoint: client and server in one object.
//!
//! An [`Endpoint`] issues outgoing requests (plain or blockwise), matches
//! inbound responses to them by message-id and token, retransmits
//! confirmable messages with exponential back-off, and dispatches inbound
//! requests to registered [resource handlers](RequestHandler). It talks to
//! the transport exclusively through the [`DataSink`]/[`DataSource`] seam
//! and takes its time from a [`TimerScheduler`].
//!
//! All protocol state lives behind internal locks so the endpoint handle is
//! freely clonable, but the intended shape is the cooperative one: datagrams,
//! timer callbacks, and API calls all arrive on one
//! [loop](crate::runloop) thread, with other threads entering through
//! [`LoopHandle::invoke_sync`](crate::runloop::LoopHandle::invoke_sync).

use crate::block::{szx_for_size, BlockInfo, BlockSource, DEFAULT_BLOCK_SZX};
use crate::buffer_source::BufferSource;
use crate::inspect::{Inspectable, Inspector};
use crate::io::{BufferMetadata, DataSink, DataSinkListener, DataSource};
use crate::message::{
    AckMessage, MessageDisplay, MessageRead, MessageWrite, MsgCode, MsgId, MsgToken, MsgType,
    ParsedMessage, ResetMessage, MessageEncoder,
};
use crate::option::{OptionIteratorExt, OptionNumber, OptionParam};
use crate::timer::{Timer, TimerScheduler};
use crate::Error;
use rand::Rng;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU16, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Weak};

mod blockwise;
use blockwise::{BlockwiseDirective, BlockwiseState, UploadState};

pub mod params;
pub use params::{ClientParameters, DEFAULT_ACK_TIMEOUT_MS, DEFAULT_MAX_RESEND_COUNT};
use params::ResolvedParams;

mod registry;
pub use registry::HandlerFlags;
use registry::{Registry, RouteResult};

mod server_helper;
pub use server_helper::BlockwiseServerHelper;

/// Number of request/reply pairs remembered for duplicate suppression.
const REPLY_CACHE_LEN: usize = 8;

/// Identifier for an outgoing request issued by an [`Endpoint`].
///
/// Handles are generational: once the request reaches a terminal state its
/// handle goes stale and further operations on it fail with
/// [`Error::NoSuchItem`]. The zero value is never a live request.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct RequestHandle(u32);

impl RequestHandle {
    /// The reserved "no request" handle.
    pub const INVALID: RequestHandle = RequestHandle(0);

    /// Returns true unless this is [`RequestHandle::INVALID`].
    pub fn is_valid(self) -> bool {
        self.0 != 0
    }

    fn pack(slot: usize, generation: u16) -> RequestHandle {
        RequestHandle(((generation as u32) << 16) | (slot as u32 + 1))
    }

    fn slot(self) -> Option<usize> {
        match self.0 & 0xFFFF {
            0 => None,
            n => Some(n as usize - 1),
        }
    }

    fn generation(self) -> u16 {
        (self.0 >> 16) as u16
    }
}

/// Receives the outcome of an outgoing request.
///
/// All callbacks are invoked on the thread that feeds the endpoint (the loop
/// thread). For a given request, `on_ack` (if any) precedes `on_next`, every
/// `on_next` precedes `on_complete`, and a terminal `on_error` supersedes
/// further callbacks.
pub trait ResponseListener: Send + Sync {
    /// An empty ACK arrived: the server received the request and will answer
    /// separately.
    fn on_ack(&self) {}

    /// A response (or one block of a blockwise response) arrived. The
    /// message view is only valid for the duration of the call.
    fn on_next(&self, message: &dyn MessageRead);

    /// Terminal success: no further callbacks follow.
    fn on_complete(&self);

    /// Terminal failure: no further callbacks follow.
    fn on_error(&self, error: Error, message: &str);
}

/// The response a [`RequestHandler`] produces.
#[derive(Clone)]
pub struct OutgoingResponse {
    /// Response code.
    pub code: MsgCode,

    /// Response options (path, content-format, ...). Block options are
    /// appended by the endpoint when blockwise assistance is on.
    pub options: Vec<OptionParam>,

    /// Flat response payload.
    pub payload: Vec<u8>,

    /// When true, the endpoint applies server-side blockwise assistance:
    /// `block1` reassembly tracking for PUT/POST and `block2` windowing for
    /// GET.
    pub autogenerate_blockwise: bool,

    /// Data source for `block2` windowing; when absent, `payload` is
    /// windowed instead.
    pub block_source: Option<Arc<dyn BlockSource>>,
}

impl std::fmt::Debug for OutgoingResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutgoingResponse")
            .field("code", &self.code)
            .field("payload_len", &self.payload.len())
            .field("autogenerate_blockwise", &self.autogenerate_blockwise)
            .finish()
    }
}

impl OutgoingResponse {
    /// A `2.05 Content` response carrying `payload`.
    pub fn content(payload: Vec<u8>) -> OutgoingResponse {
        OutgoingResponse {
            code: MsgCode::SuccessContent,
            options: Vec::new(),
            payload,
            autogenerate_blockwise: false,
            block_source: None,
        }
    }

    /// An empty `2.04 Changed` response.
    pub fn changed() -> OutgoingResponse {
        OutgoingResponse::error(MsgCode::SuccessChanged)
    }

    /// An empty response with the given code.
    pub fn error(code: MsgCode) -> OutgoingResponse {
        OutgoingResponse {
            code,
            options: Vec::new(),
            payload: Vec::new(),
            autogenerate_blockwise: false,
            block_source: None,
        }
    }

    /// Turns on server-side blockwise assistance for this response.
    pub fn blockwise(mut self) -> OutgoingResponse {
        self.autogenerate_blockwise = true;
        self
    }

    /// Sets the `block2` data source (implies blockwise assistance).
    pub fn with_block_source(mut self, source: Arc<dyn BlockSource>) -> OutgoingResponse {
        self.block_source = Some(source);
        self.autogenerate_blockwise = true;
        self
    }
}

/// Everything a [`RequestHandler`] can see about one inbound request.
pub struct RequestContext<'a> {
    /// The endpoint that received the request.
    pub endpoint: &'a Endpoint,

    /// The decoded request. Valid only for the duration of the callback.
    pub message: &'a dyn MessageRead,

    /// Transport metadata that accompanied the datagram, if any.
    pub metadata: Option<&'a BufferMetadata>,
}

impl<'a> std::fmt::Debug for RequestContext<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestContext")
            .field("message", &MessageDisplay(self.message).to_string())
            .finish()
    }
}

/// An application callback serving one registered path.
pub trait RequestHandler: Send + Sync {
    /// Produces the response for one inbound request. Returning an error
    /// makes the endpoint answer `5.00 Internal Server Error`.
    fn on_request(&self, context: &RequestContext<'_>) -> Result<OutgoingResponse, Error>;
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum PendingState {
    /// CON sent, no ACK yet; the retransmit timer is armed.
    AwaitingAck,

    /// ACKed (or NON): waiting for the response message.
    AwaitingResponse,
}

struct PendingEntry {
    token: MsgToken,
    msg_id: MsgId,
    method: MsgCode,
    options: Vec<OptionParam>,
    listener: Arc<dyn ResponseListener>,
    params: ResolvedParams,
    resends_done: u32,
    wire: Vec<u8>,
    state: PendingState,
    blockwise: Option<BlockwiseState>,
    timer: Timer,
}

#[derive(Default)]
struct PendingSlot {
    generation: u16,
    entry: Option<PendingEntry>,
}

#[derive(Default)]
struct PendingTable {
    slots: Vec<PendingSlot>,
}

impl PendingTable {
    fn insert(&mut self, entry: PendingEntry) -> Result<RequestHandle, Error> {
        let slot = match self.slots.iter().position(|s| s.entry.is_none()) {
            Some(i) => i,
            None => {
                if self.slots.len() >= 0xFFFF {
                    return Err(Error::OutOfResources);
                }
                self.slots.push(PendingSlot::default());
                self.slots.len() - 1
            }
        };
        self.slots[slot].entry = Some(entry);
        Ok(RequestHandle::pack(slot, self.slots[slot].generation))
    }

    fn get_mut(&mut self, handle: RequestHandle) -> Option<&mut PendingEntry> {
        let slot = self.slots.get_mut(handle.slot()?)?;
        if slot.generation != handle.generation() {
            return None;
        }
        slot.entry.as_mut()
    }

    fn remove(&mut self, handle: RequestHandle) -> Option<PendingEntry> {
        let slot = self.slots.get_mut(handle.slot()?)?;
        if slot.generation != handle.generation() {
            return None;
        }
        let entry = slot.entry.take()?;
        // Retire the handle so stale copies cannot alias a reused slot.
        slot.generation = slot.generation.wrapping_add(1);
        Some(entry)
    }

    fn find_by_msg_id(&self, msg_id: MsgId) -> Option<RequestHandle> {
        self.iter_handles()
            .find(|&(_, entry)| entry.msg_id == msg_id)
            .map(|(handle, _)| handle)
    }

    fn find_by_token(&self, token: MsgToken) -> Option<RequestHandle> {
        self.iter_handles()
            .find(|&(_, entry)| entry.token == token)
            .map(|(handle, _)| handle)
    }

    fn iter_handles(&self) -> impl Iterator<Item = (RequestHandle, &PendingEntry)> {
        self.slots.iter().enumerate().filter_map(|(i, slot)| {
            slot.entry
                .as_ref()
                .map(|entry| (RequestHandle::pack(i, slot.generation), entry))
        })
    }

    fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.entry.is_some()).count()
    }
}

/// Remembers recent (msg-id, token) → reply bytes so a retransmitted CON
/// request is answered with the identical datagram instead of re-invoking
/// the handler.
#[derive(Default)]
struct ReplyCache {
    entries: VecDeque<(MsgId, MsgToken, Vec<u8>)>,
}

impl ReplyCache {
    fn lookup(&self, msg_id: MsgId, token: MsgToken) -> Option<Vec<u8>> {
        self.entries
            .iter()
            .find(|(id, tok, _)| *id == msg_id && *tok == token)
            .map(|(_, _, bytes)| bytes.clone())
    }

    fn store(&mut self, msg_id: MsgId, token: MsgToken, bytes: Vec<u8>) {
        if self.entries.len() == REPLY_CACHE_LEN {
            self.entries.pop_front();
        }
        self.entries.push_back((msg_id, token, bytes));
    }
}

/// A CoAP endpoint. Cheap to clone; all clones refer to the same state.
#[derive(Clone)]
pub struct Endpoint {
    inner: Arc<EndpointInner>,
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint")
            .field("pending", &self.pending_request_count())
            .finish()
    }
}

struct EndpointInner {
    self_weak: Weak<EndpointInner>,
    scheduler: TimerScheduler,
    sink: Mutex<Option<Arc<dyn DataSink>>>,
    outbox: Mutex<VecDeque<Vec<u8>>>,
    next_msg_id: AtomicU16,
    next_token: AtomicU32,
    pending: Mutex<PendingTable>,
    registry: Mutex<Registry>,
    reply_cache: Mutex<ReplyCache>,
}

enum SubmitPayload<'a> {
    None,
    Flat(&'a [u8]),
    Blockwise {
        source: Option<Arc<dyn BlockSource>>,
        preferred_block_size: usize,
    },
}

impl Endpoint {
    /// Creates an endpoint taking its time from `scheduler`.
    pub fn new(scheduler: TimerScheduler) -> Endpoint {
        let mut rng = rand::thread_rng();
        let next_msg_id = rng.gen();
        let next_token = rng.gen();
        Endpoint {
            inner: Arc::new_cyclic(|self_weak| EndpointInner {
                self_weak: self_weak.clone(),
                scheduler,
                sink: Mutex::new(None),
                outbox: Mutex::new(VecDeque::new()),
                next_msg_id: AtomicU16::new(next_msg_id),
                next_token: AtomicU32::new(next_token),
                pending: Mutex::new(PendingTable::default()),
                registry: Mutex::new(Registry::default()),
                reply_cache: Mutex::new(ReplyCache::default()),
            }),
        }
    }

    /// Connects the endpoint to its transport: outbound datagrams go into
    /// `sink`, and `source` is asked to deliver inbound datagrams to this
    /// endpoint. The endpoint registers itself as the sink's listener so
    /// back-pressured writes resume when the transport drains.
    pub fn attach(&self, source: &dyn DataSource, sink: Arc<dyn DataSink>) {
        sink.set_listener(Some(
            Arc::downgrade(&self.inner) as Weak<dyn DataSinkListener>
        ));
        *self.inner.sink.lock().expect("sink slot poisoned") = Some(sink);
        source.set_data_sink(Some(self.inner.clone() as Arc<dyn DataSink>));
    }

    /// Issues a request with an optional flat payload.
    ///
    /// The message is CON unless `params` says otherwise. The returned
    /// handle can cancel the request until a terminal callback has been
    /// delivered. A synchronous transport failure fails the submission
    /// without invoking the listener.
    pub fn send_request(
        &self,
        method: MsgCode,
        options: &[OptionParam],
        payload: Option<&[u8]>,
        params: Option<ClientParameters>,
        listener: Arc<dyn ResponseListener>,
    ) -> Result<RequestHandle, Error> {
        self.inner.submit(
            method,
            options,
            match payload {
                Some(x) => SubmitPayload::Flat(x),
                None => SubmitPayload::None,
            },
            params,
            listener,
        )
    }

    /// Issues a request whose payload is materialized from `source` at
    /// serialization time.
    pub fn send_request_from_buffer_source(
        &self,
        method: MsgCode,
        options: &[OptionParam],
        source: &dyn BufferSource,
        params: Option<ClientParameters>,
        listener: Arc<dyn ResponseListener>,
    ) -> Result<RequestHandle, Error> {
        let mut payload = vec![0u8; source.data_size()];
        source.fill_data(&mut payload)?;
        self.inner.submit(
            method,
            options,
            SubmitPayload::Flat(&payload),
            params,
            listener,
        )
    }

    /// Issues a blockwise request.
    ///
    /// With a payload `source`, the body is uploaded in `block1` fragments
    /// pulled from it (`block1` is only injected when more than one block is
    /// needed). With or without one, a `block2` response stream is followed
    /// automatically, delivering each block through
    /// [`ResponseListener::on_next`] and finishing with `on_complete`.
    /// `preferred_block_size` of zero selects the 1024-byte default.
    pub fn send_blockwise_request(
        &self,
        method: MsgCode,
        options: &[OptionParam],
        source: Option<Arc<dyn BlockSource>>,
        preferred_block_size: usize,
        params: Option<ClientParameters>,
        listener: Arc<dyn ResponseListener>,
    ) -> Result<RequestHandle, Error> {
        self.inner.submit(
            method,
            options,
            SubmitPayload::Blockwise {
                source,
                preferred_block_size,
            },
            params,
            listener,
        )
    }

    /// Cancels an outstanding request: the entry is removed and no further
    /// listener callback will be made. A handle whose request already
    /// reached a terminal state is stale and fails with
    /// [`Error::NoSuchItem`].
    pub fn cancel_request(&self, handle: RequestHandle) -> Result<(), Error> {
        let removed = self
            .inner
            .pending
            .lock()
            .expect("pending table poisoned")
            .remove(handle);
        match removed {
            Some(_) => Ok(()),
            None => Err(Error::NoSuchItem),
        }
    }

    /// Registers `handler` to serve `path`.
    pub fn register_request_handler(
        &self,
        path: &str,
        flags: HandlerFlags,
        handler: Arc<dyn RequestHandler>,
    ) {
        self.inner
            .registry
            .lock()
            .expect("registry poisoned")
            .register(path, flags, handler);
    }

    /// Removes registrations of `handler`, restricted to `path` when one is
    /// given. Fails with [`Error::NoSuchItem`] when nothing matched.
    pub fn unregister_request_handler(
        &self,
        path: Option<&str>,
        handler: &Arc<dyn RequestHandler>,
    ) -> Result<(), Error> {
        let removed = self
            .inner
            .registry
            .lock()
            .expect("registry poisoned")
            .unregister(path, handler);
        if removed == 0 {
            Err(Error::NoSuchItem)
        } else {
            Ok(())
        }
    }

    /// Enables or disables routing to every handler in `group`.
    pub fn set_handler_group_enabled(&self, group: u8, enabled: bool) {
        self.inner
            .registry
            .lock()
            .expect("registry poisoned")
            .set_group_enabled(group, enabled);
    }

    /// Number of requests currently outstanding.
    pub fn pending_request_count(&self) -> usize {
        self.inner
            .pending
            .lock()
            .expect("pending table poisoned")
            .len()
    }
}

impl DataSink for Endpoint {
    fn put_data(&self, data: &[u8], metadata: Option<&BufferMetadata>) -> Result<(), Error> {
        self.inner.receive_datagram(data, metadata)
    }

    fn set_listener(&self, _listener: Option<Weak<dyn DataSinkListener>>) {}
}

impl Inspectable for Endpoint {
    fn inspect(&self, inspector: &mut dyn Inspector) {
        inspector.on_object_start("endpoint");
        inspector.on_uint("pending_requests", self.pending_request_count() as u64);
        inspector.on_uint(
            "request_handlers",
            self.inner
                .registry
                .lock()
                .expect("registry poisoned")
                .handler_count() as u64,
        );
        inspector.on_bool(
            "transport_attached",
            self.inner.sink.lock().expect("sink slot poisoned").is_some(),
        );
        inspector.on_object_end();
    }
}

impl EndpointInner {
    fn next_msg_id(&self) -> MsgId {
        self.next_msg_id.fetch_add(1, Ordering::Relaxed)
    }

    fn next_token(&self) -> MsgToken {
        MsgToken::from(self.next_token.fetch_add(1, Ordering::Relaxed).max(1))
    }

    /// Hands one datagram to the transport, queueing it when the sink is
    /// congested. Queued datagrams drain in order on `on_can_put`.
    fn send_datagram(&self, bytes: Vec<u8>) -> Result<(), Error> {
        let sink = self
            .sink
            .lock()
            .expect("sink slot poisoned")
            .clone()
            .ok_or(Error::InvalidState)?;

        {
            let mut outbox = self.outbox.lock().expect("outbox poisoned");
            if !outbox.is_empty() {
                outbox.push_back(bytes);
                return Ok(());
            }
        }

        match sink.put_data(&bytes, None) {
            Ok(()) => Ok(()),
            Err(Error::WouldBlock) => {
                log::debug!("transport congested, holding datagram");
                self.outbox
                    .lock()
                    .expect("outbox poisoned")
                    .push_back(bytes);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn drain_outbox(&self) {
        loop {
            let sink = match self.sink.lock().expect("sink slot poisoned").clone() {
                Some(x) => x,
                None => return,
            };

            let bytes = {
                let mut outbox = self.outbox.lock().expect("outbox poisoned");
                match outbox.pop_front() {
                    Some(x) => x,
                    None => return,
                }
            };

            match sink.put_data(&bytes, None) {
                Ok(()) => continue,
                Err(Error::WouldBlock) => {
                    self.outbox
                        .lock()
                        .expect("outbox poisoned")
                        .push_front(bytes);
                    return;
                }
                Err(e) => {
                    log::warn!("dropping queued datagram after transport error: {}", e);
                    return;
                }
            }
        }
    }

    fn submit(
        &self,
        method: MsgCode,
        options: &[OptionParam],
        payload: SubmitPayload<'_>,
        params: Option<ClientParameters>,
        listener: Arc<dyn ResponseListener>,
    ) -> Result<RequestHandle, Error> {
        if !method.is_method() {
            return Err(Error::InvalidParameters);
        }

        let params = params.unwrap_or_default().resolve();
        let token = self.next_token();
        let msg_id = self.next_msg_id();

        // Work out the first fragment and the blockwise state up front.
        let mut extra_options: Vec<OptionParam> = Vec::new();
        let mut first_payload: Vec<u8> = Vec::new();
        let mut blockwise: Option<BlockwiseState> = None;

        match payload {
            SubmitPayload::None => (),
            SubmitPayload::Flat(bytes) => first_payload = bytes.to_vec(),
            SubmitPayload::Blockwise {
                source,
                preferred_block_size,
            } => {
                let szx = if preferred_block_size == 0 {
                    DEFAULT_BLOCK_SZX
                } else {
                    szx_for_size(preferred_block_size).ok_or(Error::InvalidParameters)?
                };

                let mut state = BlockwiseState::default();

                match source {
                    Some(source) => {
                        let mut upload = UploadState {
                            source,
                            next_offset: 0,
                            szx,
                            finished: false,
                        };
                        match blockwise::next_upload_chunk(&mut upload)? {
                            Some((block, bytes)) => {
                                first_payload = bytes;
                                if !upload.finished {
                                    extra_options
                                        .push(OptionParam::uint(OptionNumber::BLOCK1, block.raw()));
                                }
                            }
                            None => return Err(Error::OutOfRange),
                        }
                        state.upload = Some(upload);
                    }
                    None => {
                        // Download-only: advertise the preferred window size.
                        let hint = BlockInfo::new(0, false, szx).expect("szx validated");
                        extra_options.push(OptionParam::uint(OptionNumber::BLOCK2, hint.raw()));
                    }
                }

                blockwise = Some(state);
            }
        }

        let wire = encode_request(
            method,
            if params.confirmable {
                MsgType::Con
            } else {
                MsgType::Non
            },
            msg_id,
            token,
            options,
            &extra_options,
            &first_payload,
        )?;

        let entry = PendingEntry {
            token,
            msg_id,
            method,
            options: options.to_vec(),
            listener,
            params,
            resends_done: 0,
            wire: wire.clone(),
            state: if params.confirmable {
                PendingState::AwaitingAck
            } else {
                PendingState::AwaitingResponse
            },
            blockwise,
            timer: self.scheduler.create_timer(),
        };

        let handle = self
            .pending
            .lock()
            .expect("pending table poisoned")
            .insert(entry)?;

        log::debug!(
            "OUTBOUND {} {}",
            handle.0,
            crate::message::DatagramDisplay(&wire)
        );

        if let Err(e) = self.send_datagram(wire) {
            self.pending
                .lock()
                .expect("pending table poisoned")
                .remove(handle);
            return Err(e);
        }

        if params.confirmable {
            self.arm_retransmit_timer(handle);
        }

        Ok(handle)
    }

    /// Arms (or re-arms) the retransmission timer for `handle`. A no-op when
    /// the entry is already gone.
    fn arm_retransmit_timer(&self, handle: RequestHandle) {
        let weak = self.self_weak.clone();
        let mut pending = self.pending.lock().expect("pending table poisoned");
        if let Some(entry) = pending.get_mut(handle) {
            if !entry.params.confirmable {
                return;
            }
            let delay = entry.params.retransmit_delay(entry.resends_done);
            entry.timer.schedule(delay, move || {
                if let Some(inner) = weak.upgrade() {
                    inner.on_retransmit_timer(handle);
                }
            });
        }
    }

    fn on_retransmit_timer(&self, handle: RequestHandle) {
        let (action, listener) = {
            let mut pending = self.pending.lock().expect("pending table poisoned");
            let entry = match pending.get_mut(handle) {
                Some(x) => x,
                None => return,
            };

            if entry.state != PendingState::AwaitingAck {
                return;
            }

            if entry.resends_done >= entry.params.max_resend_count {
                let entry = pending.remove(handle).expect("entry just seen");
                (None, Some(entry.listener))
            } else {
                entry.resends_done += 1;
                log::debug!(
                    "retransmit #{} for request {}",
                    entry.resends_done,
                    handle.0
                );
                (Some(entry.wire.clone()), None)
            }
        };

        match (action, listener) {
            (Some(wire), _) => {
                if let Err(e) = self.send_datagram(wire) {
                    log::warn!("retransmit failed: {}", e);
                }
                self.arm_retransmit_timer(handle);
            }
            (None, Some(listener)) => {
                listener.on_error(Error::Timeout, "No acknowledgement after all retries");
            }
            _ => (),
        }
    }

    fn receive_datagram(&self, data: &[u8], metadata: Option<&BufferMetadata>) -> Result<(), Error> {
        let msg = match ParsedMessage::new(data) {
            Ok(x) => x,
            Err(e) => {
                // Undecodable datagrams are dropped silently (logged only).
                log::debug!("dropping undecodable datagram: {}", e);
                return Ok(());
            }
        };

        log::debug!("INBOUND {}", MessageDisplay(&msg));

        let msg_type = msg.msg_type();
        let msg_code = msg.msg_code();

        if msg_type.is_rst() {
            self.handle_reset(&msg);
        } else if msg_type.is_ack() && msg_code.is_empty() {
            self.handle_empty_ack(&msg);
        } else if msg_code.is_response() {
            self.handle_response(&msg);
        } else if msg_code.is_method() && (msg_type.is_con() || msg_type.is_non()) {
            self.handle_request(&msg, metadata);
        } else if msg_code.is_empty() && msg_type.is_con() {
            // CoAP ping: answer with a reset.
            self.send_reset(msg.msg_id());
        } else {
            log::debug!("dropping uninterpretable message");
        }

        Ok(())
    }

    fn handle_reset(&self, msg: &ParsedMessage<'_>) {
        let removed = {
            let mut pending = self.pending.lock().expect("pending table poisoned");
            pending
                .find_by_msg_id(msg.msg_id())
                .and_then(|handle| pending.remove(handle))
        };

        match removed {
            Some(entry) => entry.listener.on_error(Error::Reset, "Reset by peer"),
            None => log::debug!("reset matched no pending request"),
        }
    }

    fn handle_empty_ack(&self, msg: &ParsedMessage<'_>) {
        let listener = {
            let mut pending = self.pending.lock().expect("pending table poisoned");
            match pending
                .find_by_msg_id(msg.msg_id())
                .and_then(|handle| pending.get_mut(handle))
            {
                Some(entry) => {
                    entry.timer.unschedule();
                    entry.state = PendingState::AwaitingResponse;
                    Some(entry.listener.clone())
                }
                None => None,
            }
        };

        match listener {
            Some(listener) => listener.on_ack(),
            None => log::debug!("ack matched no pending request"),
        }
    }

    fn handle_response(&self, msg: &ParsedMessage<'_>) {
        enum Outcome {
            Final {
                listener: Arc<dyn ResponseListener>,
            },
            NextWire {
                wire: Vec<u8>,
                deliver: Option<Arc<dyn ResponseListener>>,
                handle: RequestHandle,
            },
            Failed {
                listener: Arc<dyn ResponseListener>,
                error: Error,
                message: &'static str,
            },
            Ignored,
            Unmatched,
        }

        let outcome = {
            let mut pending = self.pending.lock().expect("pending table poisoned");
            match pending.find_by_token(msg.msg_token()) {
                None => Outcome::Unmatched,
                Some(handle) => {
                    let entry = pending.get_mut(handle).expect("handle just found");

                    match entry.blockwise.as_mut() {
                        None => {
                            let entry = pending.remove(handle).expect("entry just seen");
                            Outcome::Final {
                                listener: entry.listener,
                            }
                        }
                        Some(state) => match blockwise::handle_response(state, msg) {
                            BlockwiseDirective::DeliverFinal => {
                                let entry = pending.remove(handle).expect("entry just seen");
                                Outcome::Final {
                                    listener: entry.listener,
                                }
                            }
                            BlockwiseDirective::Ignore => Outcome::Ignored,
                            BlockwiseDirective::ContinueUpload { block, payload } => {
                                match self.prepare_followup(
                                    entry,
                                    OptionParam::uint(OptionNumber::BLOCK1, block.raw()),
                                    &payload,
                                ) {
                                    Ok(wire) => Outcome::NextWire {
                                        wire,
                                        deliver: None,
                                        handle,
                                    },
                                    Err(error) => {
                                        let entry =
                                            pending.remove(handle).expect("entry just seen");
                                        Outcome::Failed {
                                            listener: entry.listener,
                                            error,
                                            message: "Failed to build next block request",
                                        }
                                    }
                                }
                            }
                            BlockwiseDirective::DeliverBlock { next } => match next {
                                None => {
                                    let entry = pending.remove(handle).expect("entry just seen");
                                    Outcome::Final {
                                        listener: entry.listener,
                                    }
                                }
                                Some(next) => {
                                    match self.prepare_followup(
                                        entry,
                                        OptionParam::uint(OptionNumber::BLOCK2, next.raw()),
                                        &[],
                                    ) {
                                        Ok(wire) => Outcome::NextWire {
                                            wire,
                                            deliver: Some(entry.listener.clone()),
                                            handle,
                                        },
                                        Err(error) => {
                                            let entry =
                                                pending.remove(handle).expect("entry just seen");
                                            Outcome::Failed {
                                                listener: entry.listener,
                                                error,
                                                message: "Failed to build next block request",
                                            }
                                        }
                                    }
                                }
                            },
                            BlockwiseDirective::Fail { error, message } => {
                                let entry = pending.remove(handle).expect("entry just seen");
                                Outcome::Failed {
                                    listener: entry.listener,
                                    error,
                                    message,
                                }
                            }
                        },
                    }
                }
            }
        };

        // A separate (non-piggybacked) CON response needs an empty ACK, sent
        // before any listener callback runs.
        let matched = !matches!(outcome, Outcome::Unmatched);
        if msg.msg_type().is_con() && matched {
            self.send_empty_ack(msg.msg_id());
        }

        match outcome {
            Outcome::Unmatched => {
                if msg.msg_type().is_con() {
                    // An unexpected response from a peer that expects an
                    // acknowledgement gets a reset instead.
                    self.send_reset(msg.msg_id());
                } else {
                    log::debug!("response matched no pending request");
                }
            }
            Outcome::Ignored => (),
            Outcome::Final { listener } => {
                listener.on_next(msg);
                listener.on_complete();
            }
            Outcome::Failed {
                listener,
                error,
                message,
            } => listener.on_error(error, message),
            Outcome::NextWire {
                wire,
                deliver,
                handle,
            } => {
                if let Some(listener) = deliver {
                    listener.on_next(msg);
                }

                // A callback may have canceled the request; re-check before
                // the follow-up goes out.
                let still_pending = self
                    .pending
                    .lock()
                    .expect("pending table poisoned")
                    .get_mut(handle)
                    .is_some();
                if still_pending {
                    if let Err(e) = self.send_datagram(wire) {
                        let removed = self
                            .pending
                            .lock()
                            .expect("pending table poisoned")
                            .remove(handle);
                        if let Some(entry) = removed {
                            entry
                                .listener
                                .on_error(e, "Transport failed sending next block");
                        }
                    } else {
                        self.arm_retransmit_timer(handle);
                    }
                }
            }
        }
    }

    /// Re-keys `entry` for the next exchange of a blockwise transfer and
    /// encodes the follow-up request. Called with the pending table locked.
    fn prepare_followup(
        &self,
        entry: &mut PendingEntry,
        block_option: OptionParam,
        payload: &[u8],
    ) -> Result<Vec<u8>, Error> {
        let msg_id = self.next_msg_id();
        let wire = encode_request(
            entry.method,
            if entry.params.confirmable {
                MsgType::Con
            } else {
                MsgType::Non
            },
            msg_id,
            entry.token,
            &entry.options,
            std::slice::from_ref(&block_option),
            payload,
        )?;

        entry.msg_id = msg_id;
        entry.resends_done = 0;
        entry.state = if entry.params.confirmable {
            PendingState::AwaitingAck
        } else {
            PendingState::AwaitingResponse
        };
        entry.wire = wire.clone();

        Ok(wire)
    }

    fn handle_request(&self, msg: &ParsedMessage<'_>, metadata: Option<&BufferMetadata>) {
        let path = match msg.options().collect_uri_path() {
            Ok(x) => x,
            Err(e) => {
                log::debug!("dropping request with corrupt path options: {}", e);
                return;
            }
        };

        if msg.msg_type().is_con() {
            let cached = self
                .reply_cache
                .lock()
                .expect("reply cache poisoned")
                .lookup(msg.msg_id(), msg.msg_token());
            if let Some(bytes) = cached {
                log::debug!("replaying cached reply for duplicate request");
                let _ = self.send_datagram(bytes);
                return;
            }
        }

        let route = self
            .registry
            .lock()
            .expect("registry poisoned")
            .route(&path, msg.msg_code());

        let response = match route {
            RouteResult::NotFound => {
                log::debug!("no handler for path {:?}", path);
                OutgoingResponse::error(MsgCode::ClientErrorNotFound)
            }
            RouteResult::MethodNotAllowed => {
                OutgoingResponse::error(MsgCode::ClientErrorMethodNotAllowed)
            }
            RouteResult::Matched { handler, helper } => {
                let endpoint = Endpoint {
                    inner: self.self_weak.upgrade().expect("endpoint alive during dispatch"),
                };
                let context = RequestContext {
                    endpoint: &endpoint,
                    message: msg,
                    metadata,
                };

                let response = match handler.on_request(&context) {
                    Ok(x) => x,
                    Err(e) => {
                        // Handler failures never tear the endpoint down.
                        log::warn!("request handler failed: {}", e);
                        OutgoingResponse::error(MsgCode::ServerErrorInternalServerError)
                    }
                };

                if response.autogenerate_blockwise {
                    match msg.msg_code() {
                        MsgCode::MethodPut | MsgCode::MethodPost if msg.block1().is_some() => {
                            helper.on_block1_request(msg, response)
                        }
                        MsgCode::MethodGet => {
                            helper.on_block2_request(msg, response, DEFAULT_BLOCK_SZX)
                        }
                        _ => response,
                    }
                } else {
                    response
                }
            }
        };

        let reply = match self.encode_reply(msg, &response) {
            Ok(x) => x,
            Err(e) => {
                log::warn!("failed to encode reply: {}", e);
                return;
            }
        };

        if msg.msg_type().is_con() {
            self.reply_cache
                .lock()
                .expect("reply cache poisoned")
                .store(msg.msg_id(), msg.msg_token(), reply.clone());
        }

        if let Err(e) = self.send_datagram(reply) {
            log::warn!("failed to send reply: {}", e);
        }
    }

    /// Serializes a handler response: a piggy-backed ACK for CON requests,
    /// a NON message for NON requests.
    fn encode_reply(
        &self,
        request: &ParsedMessage<'_>,
        response: &OutgoingResponse,
    ) -> Result<Vec<u8>, Error> {
        let mut encoder = MessageEncoder::with_payload_capacity(response.payload.len());
        if request.msg_type().is_con() {
            encoder.set_msg_type(MsgType::Ack);
            encoder.set_msg_id(request.msg_id());
        } else {
            encoder.set_msg_type(MsgType::Non);
            encoder.set_msg_id(self.next_msg_id());
        }
        encoder.set_msg_code(response.code);
        encoder.set_msg_token(request.msg_token());
        crate::option::write_option_params(&response.options, &mut encoder)?;
        if !response.payload.is_empty() {
            encoder.append_payload_bytes(&response.payload)?;
        }
        Ok(encoder.into_bytes())
    }

    fn send_empty_ack(&self, msg_id: MsgId) {
        let mut encoder = MessageEncoder::new();
        AckMessage(msg_id)
            .write_msg_to(&mut encoder)
            .expect("empty ack always encodes");
        let _ = self.send_datagram(encoder.into_bytes());
    }

    fn send_reset(&self, msg_id: MsgId) {
        let mut encoder = MessageEncoder::new();
        ResetMessage(msg_id)
            .write_msg_to(&mut encoder)
            .expect("reset always encodes");
        let _ = self.send_datagram(encoder.into_bytes());
    }
}

impl DataSink for EndpointInner {
    fn put_data(&self, data: &[u8], metadata: Option<&BufferMetadata>) -> Result<(), Error> {
        self.receive_datagram(data, metadata)
    }

    fn set_listener(&self, _listener: Option<Weak<dyn DataSinkListener>>) {}
}

impl DataSinkListener for EndpointInner {
    fn on_can_put(&self) {
        self.drain_outbox();
    }
}

fn encode_request(
    method: MsgCode,
    msg_type: MsgType,
    msg_id: MsgId,
    token: MsgToken,
    options: &[OptionParam],
    extra_options: &[OptionParam],
    payload: &[u8],
) -> Result<Vec<u8>, Error> {
    let mut encoder = MessageEncoder::with_payload_capacity(payload.len());
    encoder.set_msg_type(msg_type);
    encoder.set_msg_code(method);
    encoder.set_msg_id(msg_id);
    encoder.set_msg_token(token);

    if extra_options.is_empty() {
        crate::option::write_option_params(options, &mut encoder)?;
    } else {
        let mut combined: Vec<OptionParam> = options.to_vec();
        combined.extend_from_slice(extra_options);
        crate::option::write_option_params(&combined, &mut encoder)?;
    }

    if !payload.is_empty() {
        encoder.append_payload_bytes(payload)?;
    }
    Ok(encoder.into_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::VecBlockSource;
    use crate::inspect::test_support::RecordingInspector;
    use crate::io::{pipe, MemorySink};
    use crate::option::OptionInsertExt;

    #[derive(Debug, Clone, PartialEq)]
    enum Ev {
        Ack,
        Next {
            code: MsgCode,
            payload: Vec<u8>,
        },
        Complete,
        Error(Error),
    }

    #[derive(Default)]
    struct RecordingListener {
        events: Mutex<Vec<Ev>>,
    }

    impl RecordingListener {
        fn new() -> Arc<RecordingListener> {
            Arc::new(RecordingListener::default())
        }

        fn events(&self) -> Vec<Ev> {
            self.events.lock().unwrap().clone()
        }
    }

    impl ResponseListener for RecordingListener {
        fn on_ack(&self) {
            self.events.lock().unwrap().push(Ev::Ack);
        }

        fn on_next(&self, message: &dyn MessageRead) {
            self.events.lock().unwrap().push(Ev::Next {
                code: message.msg_code(),
                payload: message.payload().to_vec(),
            });
        }

        fn on_complete(&self) {
            self.events.lock().unwrap().push(Ev::Complete);
        }

        fn on_error(&self, error: Error, _message: &str) {
            self.events.lock().unwrap().push(Ev::Error(error));
        }
    }

    struct FnHandler<F>(F);

    impl<F> RequestHandler for FnHandler<F>
    where
        F: Fn(&RequestContext<'_>) -> Result<OutgoingResponse, Error> + Send + Sync,
    {
        fn on_request(&self, context: &RequestContext<'_>) -> Result<OutgoingResponse, Error> {
            (self.0)(context)
        }
    }

    struct NullSource;

    impl DataSource for NullSource {
        fn set_data_sink(&self, _sink: Option<Arc<dyn DataSink>>) {}
    }

    fn wired_pair() -> (Endpoint, Endpoint, TimerScheduler, TimerScheduler) {
        let (near, far) = pipe();
        let client_scheduler = TimerScheduler::new();
        let server_scheduler = TimerScheduler::new();

        let client = Endpoint::new(client_scheduler.clone());
        client.attach(near.as_ref(), near.clone() as Arc<dyn DataSink>);

        let server = Endpoint::new(server_scheduler.clone());
        server.attach(far.as_ref(), far.clone() as Arc<dyn DataSink>);

        (client, server, client_scheduler, server_scheduler)
    }

    fn solo_client() -> (Endpoint, Arc<MemorySink>, TimerScheduler) {
        let scheduler = TimerScheduler::new();
        let endpoint = Endpoint::new(scheduler.clone());
        let sink = MemorySink::new();
        endpoint.attach(&NullSource, sink.clone() as Arc<dyn DataSink>);
        (endpoint, sink, scheduler)
    }

    fn path(segments: &[&str]) -> Vec<OptionParam> {
        segments
            .iter()
            .map(|s| OptionParam::string(OptionNumber::URI_PATH, *s))
            .collect()
    }

    #[test]
    fn get_roundtrip() {
        let (client, server, _, _) = wired_pair();

        server.register_request_handler(
            "ping",
            HandlerFlags::new().allow_get(),
            Arc::new(FnHandler(|_ctx: &RequestContext<'_>| {
                Ok(OutgoingResponse::content(b"pong".to_vec()))
            })),
        );

        let listener = RecordingListener::new();
        client
            .send_request(
                MsgCode::MethodGet,
                &path(&["ping"]),
                None,
                None,
                listener.clone(),
            )
            .unwrap();

        assert_eq!(
            listener.events(),
            vec![
                Ev::Next {
                    code: MsgCode::SuccessContent,
                    payload: b"pong".to_vec()
                },
                Ev::Complete,
            ]
        );
        assert_eq!(client.pending_request_count(), 0);
    }

    #[test]
    fn unknown_path_yields_not_found() {
        let (client, _server, _, _) = wired_pair();

        let listener = RecordingListener::new();
        client
            .send_request(
                MsgCode::MethodGet,
                &path(&["nowhere"]),
                None,
                None,
                listener.clone(),
            )
            .unwrap();

        assert_eq!(
            listener.events(),
            vec![
                Ev::Next {
                    code: MsgCode::ClientErrorNotFound,
                    payload: vec![]
                },
                Ev::Complete,
            ]
        );
    }

    #[test]
    fn disallowed_method_yields_method_not_allowed() {
        let (client, server, _, _) = wired_pair();

        server.register_request_handler(
            "ro",
            HandlerFlags::new().allow_get(),
            Arc::new(FnHandler(|_ctx: &RequestContext<'_>| {
                Ok(OutgoingResponse::content(vec![]))
            })),
        );

        let listener = RecordingListener::new();
        client
            .send_request(
                MsgCode::MethodPut,
                &path(&["ro"]),
                Some(b"x"),
                None,
                listener.clone(),
            )
            .unwrap();

        assert_eq!(
            listener.events(),
            vec![
                Ev::Next {
                    code: MsgCode::ClientErrorMethodNotAllowed,
                    payload: vec![]
                },
                Ev::Complete,
            ]
        );
    }

    #[test]
    fn handler_failure_maps_to_internal_server_error() {
        let (client, server, _, _) = wired_pair();

        server.register_request_handler(
            "boom",
            HandlerFlags::allow_all(),
            Arc::new(FnHandler(|_ctx: &RequestContext<'_>| Err(Error::Internal))),
        );

        let listener = RecordingListener::new();
        client
            .send_request(
                MsgCode::MethodGet,
                &path(&["boom"]),
                None,
                None,
                listener.clone(),
            )
            .unwrap();

        assert_eq!(
            listener.events(),
            vec![
                Ev::Next {
                    code: MsgCode::ServerErrorInternalServerError,
                    payload: vec![]
                },
                Ev::Complete,
            ]
        );
    }

    #[test]
    fn retransmits_with_doubling_backoff_then_times_out() {
        let (client, sink, scheduler) = solo_client();
        let listener = RecordingListener::new();

        client
            .send_request(
                MsgCode::MethodGet,
                &path(&["slow"]),
                None,
                Some(ClientParameters {
                    max_resend_count: 4,
                    ack_timeout_ms: 200,
                    confirmable: true,
                }),
                listener.clone(),
            )
            .unwrap();

        assert_eq!(sink.len(), 1);

        scheduler.advance_to(199);
        assert_eq!(sink.len(), 1);

        for (time, writes) in [(200u64, 2usize), (400, 3), (800, 4), (1600, 5)].iter() {
            scheduler.advance_to(*time);
            assert_eq!(sink.len(), *writes, "at t={}", time);
        }

        scheduler.advance_to(3199);
        assert_eq!(sink.len(), 5);
        assert_eq!(listener.events(), vec![]);

        scheduler.advance_to(3200);
        assert_eq!(sink.len(), 5);
        assert_eq!(listener.events(), vec![Ev::Error(Error::Timeout)]);
        assert_eq!(client.pending_request_count(), 0);

        // Every retransmission carries identical bytes.
        let datagrams = sink.take_all();
        assert!(datagrams.windows(2).all(|w| w[0] == w[1]));
    }

    #[test]
    fn ack_stops_retransmission_and_separate_response_completes() {
        let (client, sink, scheduler) = solo_client();
        let listener = RecordingListener::new();

        client
            .send_request(
                MsgCode::MethodGet,
                &path(&["later"]),
                None,
                Some(ClientParameters {
                    max_resend_count: 4,
                    ack_timeout_ms: 200,
                    confirmable: true,
                }),
                listener.clone(),
            )
            .unwrap();

        let request = sink.pop().unwrap();
        let parsed = ParsedMessage::new(&request).unwrap();
        let (msg_id, token) = (parsed.msg_id(), parsed.msg_token());

        // Empty ACK parks the request.
        let mut encoder = MessageEncoder::new();
        AckMessage(msg_id).write_msg_to(&mut encoder).unwrap();
        client.put_data(&encoder.into_bytes(), None).unwrap();

        assert_eq!(listener.events(), vec![Ev::Ack]);

        scheduler.advance_to(10_000);
        assert!(sink.is_empty(), "no retransmits after the ack");

        // Separate CON response: completes the exchange and is acknowledged.
        let mut encoder = MessageEncoder::new();
        encoder.set_msg_type(MsgType::Con);
        encoder.set_msg_code(MsgCode::SuccessContent);
        encoder.set_msg_id(0x7777);
        encoder.set_msg_token(token);
        encoder.append_payload_bytes(b"late").unwrap();
        client.put_data(&encoder.into_bytes(), None).unwrap();

        assert_eq!(
            listener.events(),
            vec![
                Ev::Ack,
                Ev::Next {
                    code: MsgCode::SuccessContent,
                    payload: b"late".to_vec()
                },
                Ev::Complete,
            ]
        );

        let ack = sink.pop().unwrap();
        let ack = ParsedMessage::new(&ack).unwrap();
        assert_eq!(ack.msg_type(), MsgType::Ack);
        assert_eq!(ack.msg_code(), MsgCode::Empty);
        assert_eq!(ack.msg_id(), 0x7777);
    }

    #[test]
    fn reset_response_fails_the_request() {
        let (client, sink, _scheduler) = solo_client();
        let listener = RecordingListener::new();

        client
            .send_request(MsgCode::MethodGet, &path(&["x"]), None, None, listener.clone())
            .unwrap();

        let request = sink.pop().unwrap();
        let msg_id = ParsedMessage::new(&request).unwrap().msg_id();

        let mut encoder = MessageEncoder::new();
        ResetMessage(msg_id).write_msg_to(&mut encoder).unwrap();
        client.put_data(&encoder.into_bytes(), None).unwrap();

        assert_eq!(listener.events(), vec![Ev::Error(Error::Reset)]);
    }

    #[test]
    fn cancel_suppresses_further_callbacks() {
        let (client, sink, _scheduler) = solo_client();
        let listener = RecordingListener::new();

        let handle = client
            .send_request(MsgCode::MethodGet, &path(&["x"]), None, None, listener.clone())
            .unwrap();
        assert!(handle.is_valid());

        let request = sink.pop().unwrap();
        let parsed = ParsedMessage::new(&request).unwrap();
        let (msg_id, token) = (parsed.msg_id(), parsed.msg_token());

        assert_eq!(client.cancel_request(handle), Ok(()));
        assert_eq!(client.cancel_request(handle), Err(Error::NoSuchItem));

        // A late response must go unanswered except for the reset.
        let mut encoder = MessageEncoder::new();
        encoder.set_msg_type(MsgType::Ack);
        encoder.set_msg_code(MsgCode::SuccessContent);
        encoder.set_msg_id(msg_id);
        encoder.set_msg_token(token);
        client.put_data(&encoder.into_bytes(), None).unwrap();

        assert_eq!(listener.events(), vec![]);
    }

    #[test]
    fn unexpected_con_response_is_reset() {
        let (client, sink, _scheduler) = solo_client();

        let mut encoder = MessageEncoder::new();
        encoder.set_msg_type(MsgType::Con);
        encoder.set_msg_code(MsgCode::SuccessContent);
        encoder.set_msg_id(0x1234);
        encoder.set_msg_token(MsgToken::try_new(&[0xDE, 0xAD]).unwrap());
        client.put_data(&encoder.into_bytes(), None).unwrap();

        let reply = sink.pop().unwrap();
        let reply = ParsedMessage::new(&reply).unwrap();
        assert_eq!(reply.msg_type(), MsgType::Rst);
        assert_eq!(reply.msg_id(), 0x1234);
    }

    #[test]
    fn coap_ping_is_reset() {
        let (client, sink, _scheduler) = solo_client();

        let mut encoder = MessageEncoder::new();
        encoder.set_msg_type(MsgType::Con);
        encoder.set_msg_code(MsgCode::Empty);
        encoder.set_msg_id(0x4242);
        client.put_data(&encoder.into_bytes(), None).unwrap();

        let reply = sink.pop().unwrap();
        let reply = ParsedMessage::new(&reply).unwrap();
        assert_eq!(reply.msg_type(), MsgType::Rst);
        assert_eq!(reply.msg_id(), 0x4242);
    }

    #[test]
    fn congested_sink_queues_and_drains() {
        let (client, sink, _scheduler) = solo_client();
        let listener = RecordingListener::new();

        sink.reject_next(1);
        client
            .send_request(MsgCode::MethodGet, &path(&["x"]), None, None, listener)
            .unwrap();

        assert!(sink.is_empty());
        sink.notify_can_put();
        assert_eq!(sink.len(), 1);
    }

    #[test]
    fn duplicate_request_replays_identical_reply() {
        let scheduler = TimerScheduler::new();
        let server = Endpoint::new(scheduler.clone());
        let sink = MemorySink::new();
        server.attach(&NullSource, sink.clone() as Arc<dyn DataSink>);

        let hits = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let hits2 = hits.clone();
        server.register_request_handler(
            "counter",
            HandlerFlags::allow_all(),
            Arc::new(FnHandler(move |_ctx: &RequestContext<'_>| {
                hits2.fetch_add(1, Ordering::SeqCst);
                Ok(OutgoingResponse::content(b"counted".to_vec()))
            })),
        );

        let mut encoder = MessageEncoder::new();
        encoder.set_msg_type(MsgType::Con);
        encoder.set_msg_code(MsgCode::MethodGet);
        encoder.set_msg_id(0x0101);
        encoder.set_msg_token(MsgToken::try_new(&[7]).unwrap());
        encoder.insert_option(crate::option::URI_PATH, "counter").unwrap();
        let request = encoder.into_bytes();

        server.put_data(&request, None).unwrap();
        server.put_data(&request, None).unwrap();

        assert_eq!(hits.load(Ordering::SeqCst), 1);
        let first = sink.pop().unwrap();
        let second = sink.pop().unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn blockwise_upload_fragments_and_completes() {
        let (client, server, _, _) = wired_pair();

        let seen: Arc<Mutex<Vec<(u32, bool, usize)>>> = Arc::new(Mutex::new(Vec::new()));
        let seen2 = seen.clone();
        server.register_request_handler(
            "upload",
            HandlerFlags::new().allow_post().allow_put(),
            Arc::new(FnHandler(move |ctx: &RequestContext<'_>| {
                if let Some(block1) = ctx.message.block1() {
                    seen2.lock().unwrap().push((
                        block1.num(),
                        block1.more_flag(),
                        ctx.message.payload().len(),
                    ));
                }
                Ok(OutgoingResponse::changed().blockwise())
            })),
        );

        let listener = RecordingListener::new();
        client
            .send_blockwise_request(
                MsgCode::MethodPost,
                &path(&["upload"]),
                Some(Arc::new(VecBlockSource::new(vec![0x5A; 3000]))),
                1024,
                None,
                listener.clone(),
            )
            .unwrap();

        assert_eq!(
            *seen.lock().unwrap(),
            vec![(0, true, 1024), (1, true, 1024), (2, false, 952)]
        );
        assert_eq!(
            listener.events(),
            vec![
                Ev::Next {
                    code: MsgCode::SuccessChanged,
                    payload: vec![]
                },
                Ev::Complete,
            ]
        );
        assert_eq!(client.pending_request_count(), 0);
    }

    #[test]
    fn blockwise_download_streams_blocks() {
        let (client, server, _, _) = wired_pair();

        let body: Vec<u8> = (0..40u8).collect();
        let body2 = body.clone();
        server.register_request_handler(
            "large",
            HandlerFlags::new().allow_get(),
            Arc::new(FnHandler(move |_ctx: &RequestContext<'_>| {
                Ok(OutgoingResponse::content(body2.clone()).blockwise())
            })),
        );

        let listener = RecordingListener::new();
        client
            .send_blockwise_request(
                MsgCode::MethodGet,
                &path(&["large"]),
                None,
                16,
                None,
                listener.clone(),
            )
            .unwrap();

        let events = listener.events();
        assert_eq!(events.len(), 4, "three blocks plus completion: {:?}", events);
        assert_eq!(events[3], Ev::Complete);

        let mut collected = Vec::new();
        for event in &events[..3] {
            match event {
                Ev::Next { code, payload } => {
                    assert_eq!(*code, MsgCode::SuccessContent);
                    collected.extend_from_slice(payload);
                }
                other => panic!("unexpected event {:?}", other),
            }
        }
        assert_eq!(collected, body);
    }

    #[test]
    fn disabled_group_hides_handler_from_requests() {
        let (client, server, _, _) = wired_pair();

        server.register_request_handler(
            "priv",
            HandlerFlags::new().allow_get().group(2),
            Arc::new(FnHandler(|_ctx: &RequestContext<'_>| {
                Ok(OutgoingResponse::content(b"secret".to_vec()))
            })),
        );
        server.set_handler_group_enabled(2, false);

        let listener = RecordingListener::new();
        client
            .send_request(MsgCode::MethodGet, &path(&["priv"]), None, None, listener.clone())
            .unwrap();
        assert_eq!(
            listener.events()[0],
            Ev::Next {
                code: MsgCode::ClientErrorNotFound,
                payload: vec![]
            }
        );

        server.set_handler_group_enabled(2, true);
        let listener = RecordingListener::new();
        client
            .send_request(MsgCode::MethodGet, &path(&["priv"]), None, None, listener.clone())
            .unwrap();
        assert_eq!(
            listener.events()[0],
            Ev::Next {
                code: MsgCode::SuccessContent,
                payload: b"secret".to_vec()
            }
        );
    }

    #[test]
    fn unregister_removes_handler() {
        let (client, server, _, _) = wired_pair();

        let handler: Arc<dyn RequestHandler> = Arc::new(FnHandler(|_ctx: &RequestContext<'_>| {
            Ok(OutgoingResponse::content(vec![]))
        }));
        server.register_request_handler("gone", HandlerFlags::allow_all(), handler.clone());
        server.unregister_request_handler(None, &handler).unwrap();
        assert_eq!(
            server.unregister_request_handler(None, &handler),
            Err(Error::NoSuchItem)
        );

        let listener = RecordingListener::new();
        client
            .send_request(MsgCode::MethodGet, &path(&["gone"]), None, None, listener.clone())
            .unwrap();
        assert_eq!(
            listener.events()[0],
            Ev::Next {
                code: MsgCode::ClientErrorNotFound,
                payload: vec![]
            }
        );
    }

    #[test]
    fn non_confirmable_request_arms_no_timer() {
        let (client, sink, scheduler) = solo_client();
        let listener = RecordingListener::new();

        client
            .send_request(
                MsgCode::MethodGet,
                &path(&["x"]),
                None,
                Some(ClientParameters::non_confirmable()),
                listener.clone(),
            )
            .unwrap();

        assert_eq!(sink.len(), 1);
        let parsed = ParsedMessage::new(&sink.pop().unwrap()).unwrap().msg_type();
        assert_eq!(parsed, MsgType::Non);

        scheduler.advance_to(100_000);
        assert!(sink.is_empty());
        assert_eq!(listener.events(), vec![]);
    }

    #[test]
    fn inspect_reports_pending_and_handlers() {
        let (client, _sink, _scheduler) = solo_client();
        client.register_request_handler(
            "a",
            HandlerFlags::allow_all(),
            Arc::new(FnHandler(|_ctx: &RequestContext<'_>| {
                Ok(OutgoingResponse::content(vec![]))
            })),
        );
        client
            .send_request(
                MsgCode::MethodGet,
                &path(&["x"]),
                None,
                None,
                RecordingListener::new(),
            )
            .unwrap();

        let mut inspector = RecordingInspector::default();
        client.inspect(&mut inspector);
        assert_eq!(inspector.get("endpoint.pending_requests"), Some("1"));
        assert_eq!(inspector.get("endpoint.request_handlers"), Some("1"));
        assert_eq!(inspector.get("endpoint.transport_attached"), Some("true"));
    }
}
