//! CoAP endpoint request/response correlation and blockwise transfer layer
//!
//! This crate sits between an application and a lower-level CoAP exchange
//! engine. The engine owns wire encoding, retransmission timing and ACK
//! handling; this layer turns the engine's per-exchange callbacks into
//! well-formed, cancellable, asynchronous request/response results, and turns
//! outgoing payloads (in memory, streamed, or on disk) into bounded blocks the
//! engine can pull on demand.
//!
//! The entry point of this crate is the [`Endpoint`]. An endpoint owns the
//! resource-handler registry, submits outbound requests to the engine, and
//! wires one response correlator per outstanding exchange. For blockwise
//! exchanges the response header and the reassembled body are delivered
//! separately: the returned [`IncomingResponse`] resolves on the first block,
//! and its [`IncomingBody`] resolves once the last block has arrived.
//!
//! Cancellation is expressed as drop. Dropping an unresolved
//! [`ResponseFuture`] asks the engine to cancel the exchange; once the first
//! block of a blockwise response has been received the outer future is
//! considered complete and only dropping the unconsumed body cancels the
//! remaining transfer.
//!
//! The engine itself is out of scope and is abstracted behind the traits in
//! [`engine`].

#![warn(missing_docs)]
#![warn(unreachable_pub)]
#![warn(clippy::use_self)]

mod block;
mod correlator;
mod endpoint;
pub mod engine;
mod extended_error;
mod filter;
mod message;

pub use crate::block::{
    request_source, response_source, BlockSize, BlockSource, BlockSourceError, BodyNotAllowed,
};
pub use crate::correlator::{BodyError, ResponseError};
pub use crate::endpoint::{AttachError, Endpoint, RegisterError, ResponseFuture};
pub use crate::extended_error::ExtendedError;
pub use crate::filter::{FilterGroup, GroupRequestFilter};
pub use crate::message::{
    CoapOption, HandlerConfiguration, IncomingBody, IncomingRequest, IncomingResponse, Method,
    NoProgress, OptionNumber, OptionValue, OutgoingBody, OutgoingRequest, OutgoingRequestBuilder,
    OutgoingResponse, OutgoingResponseBuilder, ProgressSink, RawResponseMessage, ResponseCode,
};

#[cfg(test)]
mod tests;
