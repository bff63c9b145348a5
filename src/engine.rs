//! Interface boundary to the external exchange engine
//!
//! The engine owns wire encoding, retransmission and ACK timing, security,
//! and the transport carrying bytes. This module specifies the seam: how
//! exchanges are submitted and cancelled, how per-exchange callbacks are
//! delivered back, and how handlers and transports are bound.
//!
//! Callbacks for one exchange are delivered serially from the engine's own
//! execution context; callbacks for different exchanges may interleave
//! arbitrarily. Cancellation is advisory: a callback may race in after a
//! cancel was requested, and listeners must discard it safely.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::block::BlockSource;
use crate::filter::{FilterGroup, GroupRequestFilter};
use crate::message::{CoapOption, IncomingRequest, Method, OutgoingResponse, RawResponseMessage};

/// Engine-side reference to one outstanding exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ExchangeHandle(pub u64);

/// Engine-side reference to one bound resource handler
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerRef(pub u64);

/// Engine-side reference to one half of a byte-level transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransportRef(pub u64);

/// Result of submitting an exchange to the engine
#[derive(Debug, Clone, Copy)]
pub struct SubmitOutcome {
    /// Negative when the exchange was rejected before any callback fires
    pub result_code: i32,
    /// Reference to the created exchange; only meaningful when
    /// `result_code` is non-negative
    pub handle: ExchangeHandle,
}

/// Result of binding a resource handler
#[derive(Debug, Clone, Copy)]
pub struct BindOutcome {
    /// Negative when the engine refused the binding
    pub result_code: i32,
    /// Reference used to unbind the handler later; only meaningful when
    /// `result_code` is non-negative
    pub handler_ref: HandlerRef,
}

/// Parameters for one outbound exchange
pub struct ExchangeParams {
    /// The request path
    pub path: String,
    /// The request method
    pub method: Method,
    /// Request options, in order
    pub options: Vec<CoapOption>,
    /// Source the engine pulls outgoing blocks from; `None` for GET/DELETE
    pub body: Option<Box<dyn BlockSource>>,
    /// Maximum resend count; negative selects the engine default
    pub max_resend_count: i32,
    /// Resend timeout; zero selects the engine default
    pub ack_timeout: Duration,
    /// Whether to run the exchange as a blockwise transfer
    pub blockwise: bool,
}

impl fmt::Debug for ExchangeParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExchangeParams")
            .field("path", &self.path)
            .field("method", &self.method)
            .field("has_body", &self.body.is_some())
            .field("blockwise", &self.blockwise)
            .finish_non_exhaustive()
    }
}

/// Per-exchange callback contract delivered by the engine
///
/// Exactly one callback sequence per exchange executes serially, ending in a
/// terminal `on_error`, or `on_next` (single-message) / `on_complete`
/// (blockwise). Implementations must tolerate callbacks racing in after a
/// cancellation was requested.
pub trait ResponseListener: Send + Sync {
    /// The request was acknowledged by the peer
    fn on_ack(&self);

    /// The exchange failed with an engine error code
    fn on_error(&self, code: i32, message: &str);

    /// One response unit arrived
    fn on_next(&self, message: RawResponseMessage);

    /// All response units have arrived
    fn on_complete(&self);

    /// Whether the exchange has reached the point where cancellation of the
    /// outer response is no longer honored
    fn is_complete(&self) -> bool;
}

/// Application-supplied logic invoked when an incoming request matches a
/// registered path
pub trait ResourceHandler: Send + Sync {
    /// Produce the response for `request`
    fn on_request(&self, request: IncomingRequest) -> OutgoingResponse;
}

/// A byte-level transport an endpoint can attach to, presented to the engine
/// as a data source / data sink pair
pub trait Transport: Send + Sync {
    /// Engine-side reference to the transport's data source
    fn data_source(&self) -> TransportRef;
    /// Engine-side reference to the transport's data sink
    fn data_sink(&self) -> TransportRef;
}

/// The external exchange engine, as consumed by this layer
pub trait ExchangeEngine: Send + Sync {
    /// Start an exchange, delivering callbacks to `listener`
    ///
    /// A negative [`SubmitOutcome::result_code`] means the exchange was
    /// rejected and no callback will fire.
    fn submit(&self, params: ExchangeParams, listener: Arc<dyn ResponseListener>) -> SubmitOutcome;

    /// Cancel a single-message exchange
    fn cancel_exchange(&self, handle: ExchangeHandle);

    /// Cancel a blockwise exchange
    ///
    /// `endpoint_closed` signals that the owning endpoint has been closed and
    /// the engine should skip notifying it.
    fn cancel_blockwise_exchange(&self, handle: ExchangeHandle, endpoint_closed: bool);

    /// Hand the endpoint's request filter to the engine
    ///
    /// Called once at endpoint construction; the engine consults the
    /// filter's active group when dispatching incoming requests.
    fn attach_filter(&self, filter: Arc<GroupRequestFilter>);

    /// Bind a resource handler at `path` under `group`
    fn bind_handler(
        &self,
        path: &str,
        handler: Arc<dyn ResourceHandler>,
        group: FilterGroup,
    ) -> BindOutcome;

    /// Unbind a previously bound handler, returning the engine result code
    fn unbind_handler(&self, handler: HandlerRef) -> i32;

    /// Connect the endpoint to a transport's source/sink pair
    fn attach(&self, source: TransportRef, sink: TransportRef);

    /// Disconnect the endpoint from the transport identified by `source`
    fn detach(&self, source: TransportRef);

    /// The endpoint itself as a data source, for stacking under another
    /// element
    fn data_source_ref(&self) -> TransportRef;

    /// The endpoint itself as a data sink
    fn data_sink_ref(&self) -> TransportRef;

    /// Release the engine-side endpoint object
    fn shutdown(&self);
}
