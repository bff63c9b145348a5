use std::fmt;
use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::oneshot;

use crate::correlator::{BodyCancelGuard, BodyError, BodyResult};
use crate::extended_error::ExtendedError;
use crate::filter::FilterGroup;

/// CoAP request method
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    /// Retrieve a representation of a resource
    Get,
    /// Process the enclosed representation
    Post,
    /// Update or create a resource from the enclosed representation
    Put,
    /// Delete a resource
    Delete,
}

impl Method {
    /// Whether requests with this method may carry a payload
    pub fn allows_body(self) -> bool {
        matches!(self, Self::Post | Self::Put)
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Delete => "DELETE",
        };
        f.write_str(name)
    }
}

/// A CoAP response code, analogous to an HTTP status code
///
/// Codes are written `class.detail`, e.g. `2.05` (Content) or `4.04` (Not
/// Found). Class 2 is success, 4 is client error, 5 is server error.
///
/// See [RFC 7252 §5.9](https://tools.ietf.org/html/rfc7252#section-5.9).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResponseCode {
    /// Major class of the code: 2 = success, 4 = client error, 5 = server error
    pub class: u8,
    /// Class-specific detail
    pub detail: u8,
}

impl ResponseCode {
    /// 2.01
    pub const CREATED: Self = Self::new(2, 1);
    /// 2.02
    pub const DELETED: Self = Self::new(2, 2);
    /// 2.03
    pub const VALID: Self = Self::new(2, 3);
    /// 2.04
    pub const CHANGED: Self = Self::new(2, 4);
    /// 2.05
    pub const CONTENT: Self = Self::new(2, 5);
    /// 2.31
    pub const CONTINUE: Self = Self::new(2, 31);

    /// 4.00
    pub const BAD_REQUEST: Self = Self::new(4, 0);
    /// 4.01
    pub const UNAUTHORIZED: Self = Self::new(4, 1);
    /// 4.02
    pub const BAD_OPTION: Self = Self::new(4, 2);
    /// 4.03
    pub const FORBIDDEN: Self = Self::new(4, 3);
    /// 4.04
    pub const NOT_FOUND: Self = Self::new(4, 4);
    /// 4.05
    pub const METHOD_NOT_ALLOWED: Self = Self::new(4, 5);
    /// 4.06
    pub const NOT_ACCEPTABLE: Self = Self::new(4, 6);
    /// 4.08
    pub const REQUEST_ENTITY_INCOMPLETE: Self = Self::new(4, 8);
    /// 4.12
    pub const PRECONDITION_FAILED: Self = Self::new(4, 12);
    /// 4.13
    pub const REQUEST_ENTITY_TOO_LARGE: Self = Self::new(4, 13);
    /// 4.15
    pub const UNSUPPORTED_CONTENT_FORMAT: Self = Self::new(4, 15);

    /// 5.00
    pub const INTERNAL_SERVER_ERROR: Self = Self::new(5, 0);
    /// 5.01
    pub const NOT_IMPLEMENTED: Self = Self::new(5, 1);
    /// 5.02
    pub const BAD_GATEWAY: Self = Self::new(5, 2);
    /// 5.03
    pub const SERVICE_UNAVAILABLE: Self = Self::new(5, 3);
    /// 5.04
    pub const GATEWAY_TIMEOUT: Self = Self::new(5, 4);
    /// 5.05
    pub const PROXYING_NOT_SUPPORTED: Self = Self::new(5, 5);

    /// Construct a code from its class and detail parts
    pub const fn new(class: u8, detail: u8) -> Self {
        Self { class, detail }
    }

    /// Whether this is a success-class (2.xx) code
    pub fn is_success(self) -> bool {
        self.class == 2
    }

    /// Whether this is a client-error-class (4.xx) code
    pub fn is_client_error(self) -> bool {
        self.class == 4
    }

    /// Whether this is a server-error-class (5.xx) code
    pub fn is_server_error(self) -> bool {
        self.class == 5
    }

    /// Whether this is a client- or server-error-class code
    pub fn is_error(self) -> bool {
        self.is_client_error() || self.is_server_error()
    }
}

impl fmt::Display for ResponseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:02}", self.class, self.detail)
    }
}

/// CoAP option numbers understood by this layer
///
/// Option semantics are not interpreted here; options are carried through to
/// and from the engine unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
#[allow(missing_docs)]
pub enum OptionNumber {
    IfMatch = 1,
    Etag = 4,
    IfNoneMatch = 5,
    LocationPath = 8,
    UriPath = 11,
    ContentFormat = 12,
    MaxAge = 14,
    UriQuery = 15,
    Accept = 17,
    LocationQuery = 20,
    Block2 = 23,
    Block1 = 27,
    Size2 = 28,
    Size1 = 60,
}

/// Value carried by a single option
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OptionValue {
    /// Option with no value (e.g. If-None-Match)
    Empty,
    /// Unsigned integer value (e.g. Content-Format, Max-Age)
    Uint(u32),
    /// Text value (e.g. Uri-Path, Uri-Query)
    String(String),
    /// Opaque byte value (e.g. ETag)
    Opaque(Bytes),
}

/// One CoAP option
///
/// Options are ordered and the same option number may appear more than once,
/// e.g. repeated Uri-Path segments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoapOption {
    /// The option number
    pub number: OptionNumber,
    /// The option value
    pub value: OptionValue,
}

impl CoapOption {
    /// Construct an option from its number and value
    pub fn new(number: OptionNumber, value: OptionValue) -> Self {
        Self { number, value }
    }

    pub(crate) fn uri_path(segment: &str) -> Self {
        Self::new(OptionNumber::UriPath, OptionValue::String(segment.into()))
    }
}

/// Observer for the progress of an outgoing transfer
///
/// Notified with the byte offset of each outgoing block as the engine pulls
/// it, and with the terminal outcome of the exchange. All methods default to
/// no-ops; implement only what you need.
pub trait ProgressSink: Send + Sync {
    /// An outgoing block starting at `offset` was handed to the engine
    fn on_progress(&self, offset: u64) {
        let _ = offset;
    }

    /// The exchange completed successfully
    fn on_complete(&self) {}

    /// The exchange failed
    fn on_error(&self, error: &dyn std::error::Error) {
        let _ = error;
    }
}

/// A [`ProgressSink`] that discards all notifications
#[derive(Debug, Default, Clone, Copy)]
pub struct NoProgress;

impl ProgressSink for NoProgress {}

/// Payload of an outgoing request or response
///
/// The variant is fixed at construction time. GET and DELETE requests must
/// carry [`OutgoingBody::Empty`]; constructing a block source for them with
/// any other variant is an error.
pub enum OutgoingBody {
    /// No payload
    Empty,
    /// In-memory payload
    Bytes(Bytes),
    /// Forward-only streamed payload
    Reader(Box<dyn Read + Send>),
    /// Payload read from a file, opened per block
    File(PathBuf),
}

impl fmt::Debug for OutgoingBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => f.write_str("Empty"),
            Self::Bytes(data) => f.debug_tuple("Bytes").field(&data.len()).finish(),
            Self::Reader(_) => f.write_str("Reader"),
            Self::File(path) => f.debug_tuple("File").field(path).finish(),
        }
    }
}

/// An immutable outbound request, built with [`OutgoingRequestBuilder`]
pub struct OutgoingRequest {
    pub(crate) path: String,
    pub(crate) method: Method,
    pub(crate) options: Vec<CoapOption>,
    pub(crate) body: OutgoingBody,
    pub(crate) expect_success: bool,
    pub(crate) force_non_blockwise: bool,
    pub(crate) max_resend_count: i32,
    pub(crate) ack_timeout: Duration,
    pub(crate) progress: Arc<dyn ProgressSink>,
}

impl OutgoingRequest {
    /// Begin building a request for `path` with `method`
    pub fn builder(path: impl Into<String>, method: Method) -> OutgoingRequestBuilder {
        OutgoingRequestBuilder::new(path.into(), method)
    }

    /// The request path
    pub fn path(&self) -> &str {
        &self.path
    }

    /// The request method
    pub fn method(&self) -> Method {
        self.method
    }

    /// The request options, in order
    pub fn options(&self) -> &[CoapOption] {
        &self.options
    }
}

impl fmt::Debug for OutgoingRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutgoingRequest")
            .field("path", &self.path)
            .field("method", &self.method)
            .field("body", &self.body)
            .field("expect_success", &self.expect_success)
            .field("force_non_blockwise", &self.force_non_blockwise)
            .finish_non_exhaustive()
    }
}

/// Builder for [`OutgoingRequest`]
///
/// The path is split on `/` into repeated Uri-Path options at build time;
/// blank segments are skipped.
pub struct OutgoingRequestBuilder {
    path: String,
    method: Method,
    options: Vec<CoapOption>,
    body: OutgoingBody,
    expect_success: bool,
    force_non_blockwise: bool,
    max_resend_count: i32,
    ack_timeout: Duration,
    progress: Arc<dyn ProgressSink>,
}

impl OutgoingRequestBuilder {
    fn new(path: String, method: Method) -> Self {
        Self {
            path,
            method,
            options: Vec::new(),
            body: OutgoingBody::Empty,
            expect_success: false,
            force_non_blockwise: false,
            // negative: use the engine's default retransmit count
            max_resend_count: -1,
            // zero: use the engine's default ACK timeout
            ack_timeout: Duration::ZERO,
            progress: Arc::new(NoProgress),
        }
    }

    /// Append an option
    pub fn option(mut self, option: CoapOption) -> Self {
        self.options.push(option);
        self
    }

    /// Use an in-memory payload
    pub fn body_bytes(mut self, data: impl Into<Bytes>) -> Self {
        self.body = OutgoingBody::Bytes(data.into());
        self
    }

    /// Use a forward-only streamed payload
    pub fn body_reader(mut self, reader: Box<dyn Read + Send>) -> Self {
        self.body = OutgoingBody::Reader(reader);
        self
    }

    /// Use a file-backed payload, read block by block
    pub fn body_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.body = OutgoingBody::File(path.into());
        self
    }

    /// If true, an error-class response fails the response future instead of
    /// being delivered as a regular response. Defaults to false.
    pub fn expect_success(mut self, expect: bool) -> Self {
        self.expect_success = expect;
        self
    }

    /// Send the request as a single message rather than a blockwise transfer.
    ///
    /// Some resources accept payloads larger than one block in a single
    /// message; this bypasses the blockwise path for them.
    pub fn force_non_blockwise(mut self, force: bool) -> Self {
        self.force_non_blockwise = force;
        self
    }

    /// Maximum number of resends on response timeout. Zero sends the request
    /// exactly once; a negative value selects the engine default.
    pub fn max_resend_count(mut self, count: i32) -> Self {
        self.max_resend_count = count;
        self
    }

    /// Timeout after which a resend happens. [`Duration::ZERO`] selects the
    /// engine default.
    pub fn ack_timeout(mut self, timeout: Duration) -> Self {
        self.ack_timeout = timeout;
        self
    }

    /// Observe transfer progress and the terminal outcome
    pub fn progress(mut self, sink: Arc<dyn ProgressSink>) -> Self {
        self.progress = sink;
        self
    }

    /// Finish building the request
    pub fn build(self) -> OutgoingRequest {
        let mut options: Vec<CoapOption> = self
            .path
            .split('/')
            .filter(|segment| !segment.trim().is_empty())
            .map(CoapOption::uri_path)
            .collect();
        options.extend(self.options);
        OutgoingRequest {
            path: self.path,
            method: self.method,
            options,
            body: self.body,
            expect_success: self.expect_success,
            force_non_blockwise: self.force_non_blockwise,
            max_resend_count: self.max_resend_count,
            ack_timeout: self.ack_timeout,
            progress: self.progress,
        }
    }
}

/// An outbound response produced by a resource handler
///
/// The response code defaults to [`ResponseCode::CREATED`]. Response bodies
/// may be in-memory or streamed; file-backed bodies are request-only.
pub struct OutgoingResponse {
    pub(crate) code: ResponseCode,
    pub(crate) options: Vec<CoapOption>,
    pub(crate) body: OutgoingBody,
}

impl OutgoingResponse {
    /// Begin building a response
    pub fn builder() -> OutgoingResponseBuilder {
        OutgoingResponseBuilder::default()
    }

    /// The response code
    pub fn code(&self) -> ResponseCode {
        self.code
    }

    /// The response options, in order
    pub fn options(&self) -> &[CoapOption] {
        &self.options
    }
}

impl fmt::Debug for OutgoingResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutgoingResponse")
            .field("code", &self.code)
            .field("body", &self.body)
            .finish_non_exhaustive()
    }
}

/// Builder for [`OutgoingResponse`]
pub struct OutgoingResponseBuilder {
    code: ResponseCode,
    options: Vec<CoapOption>,
    body: OutgoingBody,
}

impl Default for OutgoingResponseBuilder {
    fn default() -> Self {
        Self {
            code: ResponseCode::CREATED,
            options: Vec::new(),
            body: OutgoingBody::Empty,
        }
    }
}

impl OutgoingResponseBuilder {
    /// Set the response code
    pub fn code(mut self, code: ResponseCode) -> Self {
        self.code = code;
        self
    }

    /// Append an option
    pub fn option(mut self, option: CoapOption) -> Self {
        self.options.push(option);
        self
    }

    /// Use an in-memory payload
    pub fn body_bytes(mut self, data: impl Into<Bytes>) -> Self {
        self.body = OutgoingBody::Bytes(data.into());
        self
    }

    /// Use a forward-only streamed payload
    pub fn body_reader(mut self, reader: Box<dyn Read + Send>) -> Self {
        self.body = OutgoingBody::Reader(reader);
        self
    }

    /// Finish building the response
    pub fn build(self) -> OutgoingResponse {
        OutgoingResponse {
            code: self.code,
            options: self.options,
            body: self.body,
        }
    }
}

/// One wire-level response unit delivered by the engine
///
/// For a blockwise exchange the payload holds this block's bytes only, never
/// the accumulated body.
#[derive(Debug, Clone)]
pub struct RawResponseMessage {
    /// The response code carried by this unit
    pub code: ResponseCode,
    /// Options carried by this unit
    pub options: Vec<CoapOption>,
    /// This unit's payload bytes
    pub payload: Bytes,
}

/// An inbound request as seen by a registered resource handler
#[derive(Debug, Clone)]
pub struct IncomingRequest {
    /// The request method
    pub method: Method,
    /// The request options, in order
    pub options: Vec<CoapOption>,
    /// The reassembled request payload
    pub payload: Bytes,
}

/// Registration-time policy for a resource handler
#[derive(Debug, Clone, Copy, Default)]
pub struct HandlerConfiguration {
    /// The filter group the handler is registered under. Defaults to
    /// [`FilterGroup::Group0`] (unfiltered/authenticated).
    pub filter_group: FilterGroup,
}

/// A completed application-visible response
///
/// Header data (code, options, extended error) is available immediately. The
/// body is obtained exactly once via [`into_body`](Self::into_body); for
/// blockwise exchanges it resolves only after the final block has arrived and
/// may fail independently of the header.
#[derive(Debug)]
pub struct IncomingResponse {
    code: ResponseCode,
    options: Vec<CoapOption>,
    extended_error: Option<ExtendedError>,
    body: IncomingBody,
}

impl IncomingResponse {
    pub(crate) fn ready(
        code: ResponseCode,
        options: Vec<CoapOption>,
        extended_error: Option<ExtendedError>,
        payload: Bytes,
    ) -> Self {
        Self {
            code,
            options,
            extended_error,
            body: IncomingBody {
                inner: BodyInner::Ready(payload),
            },
        }
    }

    pub(crate) fn streaming(
        code: ResponseCode,
        options: Vec<CoapOption>,
        extended_error: Option<ExtendedError>,
        rx: oneshot::Receiver<BodyResult>,
        guard: BodyCancelGuard,
    ) -> Self {
        Self {
            code,
            options,
            extended_error,
            body: IncomingBody {
                inner: BodyInner::Streaming { rx, guard },
            },
        }
    }

    /// The response code
    pub fn code(&self) -> ResponseCode {
        self.code
    }

    /// The response options, in order
    pub fn options(&self) -> &[CoapOption] {
        &self.options
    }

    /// Structured error detail decoded from an error-class response, if any
    pub fn extended_error(&self) -> Option<&ExtendedError> {
        self.extended_error.as_ref()
    }

    /// Consume the response, yielding its body
    pub fn into_body(self) -> IncomingBody {
        self.body
    }
}

/// The body of an [`IncomingResponse`]
///
/// For blockwise exchanges, dropping the body before it resolves cancels the
/// remaining transfer with the engine.
#[derive(Debug)]
pub struct IncomingBody {
    inner: BodyInner,
}

#[derive(Debug)]
enum BodyInner {
    Ready(Bytes),
    Streaming {
        rx: oneshot::Receiver<BodyResult>,
        guard: BodyCancelGuard,
    },
}

impl IncomingBody {
    /// Wait for the full reassembled payload
    ///
    /// Blocks arrive in delivery order; the result is their byte-wise
    /// concatenation. Fails with the partial data accumulated so far if the
    /// exchange errors mid-transfer.
    pub async fn bytes(self) -> Result<Bytes, BodyError> {
        match self.inner {
            BodyInner::Ready(payload) => Ok(payload),
            BodyInner::Streaming { rx, guard } => {
                let result = match rx.await {
                    Ok(result) => result,
                    Err(_) => Err(BodyError::Abandoned),
                };
                drop(guard);
                result
            }
        }
    }
}
