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

//! A CoAP (RFC 7252) endpoint core with blockwise transfer (RFC 7959).
//!
//! The [`Endpoint`](endpoint::Endpoint) is client and server in one object:
//! it issues outgoing requests (plain or blockwise), dispatches inbound
//! requests to registered resource handlers, and matches responses to
//! outstanding requests with CON retransmission and exponential back-off.
//! Everything below CoAP is abstracted behind the byte-oriented
//! [`DataSource`](io::DataSource)/[`DataSink`](io::DataSink) seam, and all
//! protocol mutation is meant to happen on one cooperative
//! [loop](runloop::RunLoop) thread.
//!
//! ```
//! use std::sync::Arc;
//! use coap_endpoint::endpoint::{
//!     Endpoint, HandlerFlags, OutgoingResponse, RequestContext, RequestHandler,
//! };
//! use coap_endpoint::io::pipe;
//! use coap_endpoint::timer::TimerScheduler;
//! use coap_endpoint::Error;
//!
//! struct PingHandler;
//!
//! impl RequestHandler for PingHandler {
//!     fn on_request(&self, _context: &RequestContext<'_>) -> Result<OutgoingResponse, Error> {
//!         Ok(OutgoingResponse::content(b"pong".to_vec()))
//!     }
//! }
//!
//! let (_near, far) = pipe();
//!
//! let server = Endpoint::new(TimerScheduler::new());
//! server.attach(far.as_ref(), far.clone() as Arc<dyn coap_endpoint::io::DataSink>);
//! server.register_request_handler("ping", HandlerFlags::new().allow_get(), Arc::new(PingHandler));
//! ```
//!
//! The companion `coap-event-emitter` crate builds a reliable event-delivery
//! service on top of this endpoint's public API.

#![warn(rust_2018_idioms)]
#![warn(missing_debug_implementations)]
#![warn(clippy::all)]
#![warn(missing_docs)]

pub mod runloop;
pub mod timer;

pub mod io;

pub mod message;
pub mod option;

mod block;
pub use block::*;

pub mod buffer_source;

pub mod endpoint;

pub mod inspect;

mod error;
pub use error::*;

#[doc(hidden)]
pub mod prelude {
    pub use super::endpoint::Endpoint;
    pub use super::endpoint::HandlerFlags;
    pub use super::endpoint::OutgoingResponse;
    pub use super::endpoint::RequestContext;
    pub use super::endpoint::RequestHandle;
    pub use super::endpoint::RequestHandler;
    pub use super::endpoint::ResponseListener;

    pub use super::message::MsgCode;
    pub use super::message::MsgCodeClass;
    pub use super::message::MsgId;
    pub use super::message::MsgToken;
    pub use super::message::MsgType;

    pub use super::option;
    pub use option::OptionInsert;
    pub use option::OptionInsertExt;
    pub use option::OptionIterator;
    pub use option::OptionIteratorExt;
    pub use option::OptionKey;
    pub use option::OptionNumber;
    pub use option::OptionParam;

    pub use super::BlockInfo;
    pub use super::BlockSource;
    pub use super::Error;
}
