use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use rustc_hash::FxHashMap;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::block;
use crate::correlator::{
    BlockwiseCorrelator, CancelMode, ListenerCleanup, ResponseError, ResponseResult,
    SingleCorrelator,
};
use crate::engine::{
    ExchangeEngine, ExchangeParams, HandlerRef, ResourceHandler, ResponseListener, Transport,
    TransportRef,
};
use crate::filter::{FilterGroup, GroupRequestFilter};
use crate::message::{HandlerConfiguration, IncomingResponse, OutgoingRequest};

/// Errors produced by [`Endpoint::register_handler`]
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegisterError {
    /// A handler is already registered at the path
    #[error("a handler is already registered for {0}")]
    AlreadyRegistered(String),
    /// The engine refused the binding
    #[error("engine refused the handler binding (code {0})")]
    Engine(i32),
}

/// Errors produced by [`Endpoint::attach`]
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum AttachError {
    /// The endpoint is already attached to a transport
    #[error("already attached to a transport, detach first")]
    AlreadyAttached,
}

struct RegisteredHandler {
    native: HandlerRef,
    group: FilterGroup,
}

/// A CoAP endpoint
///
/// Owns the resource-handler registry, submits outbound requests to the
/// exchange engine, and manages attachment to a byte-level transport. May be
/// cloned to obtain another handle to the same endpoint.
#[derive(Clone)]
pub struct Endpoint {
    inner: Arc<EndpointInner>,
}

struct EndpointInner {
    engine: Arc<dyn ExchangeEngine>,
    registry: Mutex<FxHashMap<String, RegisteredHandler>>,
    filter: Arc<GroupRequestFilter>,
    transport: Mutex<Option<TransportRef>>,
    active: Arc<AtomicBool>,
    closed: AtomicBool,
}

impl Endpoint {
    /// Create an endpoint over `engine`
    ///
    /// The endpoint's request filter is handed to the engine at construction;
    /// the engine enforces group filtering against its active group.
    pub fn new(engine: Arc<dyn ExchangeEngine>) -> Self {
        let filter = Arc::new(GroupRequestFilter::new());
        engine.attach_filter(filter.clone());
        Self {
            inner: Arc::new(EndpointInner {
                engine,
                registry: Mutex::new(FxHashMap::default()),
                filter,
                transport: Mutex::new(None),
                active: Arc::new(AtomicBool::new(true)),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Send a request, resolving to its response
    ///
    /// The exchange runs blockwise unless the request forces a single
    /// message. Dropping the returned future before the response resolves
    /// cancels the exchange with the engine; once the first block of a
    /// blockwise response has arrived the future counts as resolved and the
    /// drop is ignored.
    pub fn send(&self, request: OutgoingRequest) -> ResponseFuture {
        let (tx, rx) = oneshot::channel();
        let OutgoingRequest {
            path,
            method,
            options,
            body,
            expect_success,
            force_non_blockwise,
            max_resend_count,
            ack_timeout,
            progress,
        } = request;

        let source = match block::request_source(method, body, progress.clone()) {
            Ok(source) => source,
            Err(error) => {
                warn!(%method, %path, "refusing request with disallowed body");
                let _ = tx.send(Err(ResponseError::BodyNotAllowed(error)));
                return ResponseFuture { rx, exchange: None };
            }
        };

        let blockwise = !force_non_blockwise;
        let params = ExchangeParams {
            path,
            method,
            options,
            body: source,
            max_resend_count,
            ack_timeout,
            blockwise,
        };
        let mode = if blockwise {
            CancelMode::Blockwise
        } else {
            CancelMode::Single
        };
        let cleanup = Arc::new(ListenerCleanup::new(
            self.inner.engine.clone(),
            mode,
            self.inner.active.clone(),
        ));

        let listener: Arc<dyn ResponseListener> = if blockwise {
            let correlator = Arc::new(BlockwiseCorrelator::new(
                expect_success,
                progress,
                tx,
                cleanup.clone(),
            ));
            let outcome = self.inner.engine.submit(params, correlator.clone());
            if outcome.result_code < 0 {
                debug!(code = outcome.result_code, "engine rejected blockwise exchange");
                correlator.reject(outcome.result_code);
            } else {
                cleanup.set_handle(outcome.handle);
            }
            correlator
        } else {
            let correlator = Arc::new(SingleCorrelator::new(
                expect_success,
                progress,
                tx,
                cleanup.clone(),
            ));
            let outcome = self.inner.engine.submit(params, correlator.clone());
            if outcome.result_code < 0 {
                debug!(code = outcome.result_code, "engine rejected exchange");
                correlator.reject(outcome.result_code);
            } else {
                cleanup.set_handle(outcome.handle);
            }
            correlator
        };

        ResponseFuture {
            rx,
            exchange: Some(ExchangeState { listener, cleanup }),
        }
    }

    /// Register `handler` to serve requests for `path`
    ///
    /// Fails if a handler is already registered at `path`; the existence
    /// check and the insertion are one atomic unit, so concurrent
    /// registrations for the same path cannot both succeed.
    pub async fn register_handler(
        &self,
        path: &str,
        handler: Arc<dyn ResourceHandler>,
        configuration: HandlerConfiguration,
    ) -> Result<(), RegisterError> {
        let mut registry = self.inner.registry.lock().unwrap();
        if registry.contains_key(path) {
            return Err(RegisterError::AlreadyRegistered(path.to_owned()));
        }
        let outcome = self
            .inner
            .engine
            .bind_handler(path, handler, configuration.filter_group);
        if outcome.result_code < 0 {
            warn!(path, code = outcome.result_code, "engine refused handler binding");
            return Err(RegisterError::Engine(outcome.result_code));
        }
        registry.insert(
            path.to_owned(),
            RegisteredHandler {
                native: outcome.handler_ref,
                group: configuration.filter_group,
            },
        );
        Ok(())
    }

    /// Remove the handler registered at `path`, if any
    ///
    /// A no-op when no handler is registered there.
    pub async fn unregister_handler(&self, path: &str) {
        let mut registry = self.inner.registry.lock().unwrap();
        if let Some(entry) = registry.remove(path) {
            let result = self.inner.engine.unbind_handler(entry.native);
            info!(path, group = entry.group.value(), result, "unregistered resource handler");
        }
    }

    /// Attach the endpoint to a byte-level transport
    ///
    /// Fails if already attached; detach first.
    pub fn attach(&self, transport: &dyn Transport) -> Result<(), AttachError> {
        let mut slot = self.inner.transport.lock().unwrap();
        if slot.is_some() {
            return Err(AttachError::AlreadyAttached);
        }
        let source = transport.data_source();
        self.inner.engine.attach(source, transport.data_sink());
        *slot = Some(source);
        Ok(())
    }

    /// Detach the endpoint from its transport
    ///
    /// A no-op when not attached.
    pub fn detach(&self) {
        if let Some(source) = self.inner.transport.lock().unwrap().take() {
            self.inner.engine.detach(source);
        }
    }

    /// Update the active request-filter group
    ///
    /// Called by whatever component tracks the transport's authentication
    /// state.
    pub fn set_filter_group(&self, group: FilterGroup) {
        self.inner.filter.set_group(group);
    }

    /// The endpoint's request filter
    pub fn filter(&self) -> &GroupRequestFilter {
        &self.inner.filter
    }

    /// Close the endpoint
    ///
    /// Marks the endpoint inactive (pending cancellations become advisory
    /// no-ops on the engine side), clears the handler registry, releases the
    /// request filter, detaches from the transport, and releases the
    /// engine-side endpoint object. Idempotent.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("closing endpoint");
        self.inner.active.store(false, Ordering::Release);
        self.inner.registry.lock().unwrap().clear();
        self.inner.filter.reset();
        self.detach();
        self.inner.engine.shutdown();
    }
}

impl Transport for Endpoint {
    fn data_source(&self) -> TransportRef {
        self.inner.engine.data_source_ref()
    }

    fn data_sink(&self) -> TransportRef {
        self.inner.engine.data_sink_ref()
    }
}

struct ExchangeState {
    listener: Arc<dyn ResponseListener>,
    cleanup: Arc<ListenerCleanup>,
}

/// Future produced by [`Endpoint::send`], resolving to the response
///
/// Dropping the future before the response has resolved cancels the exchange
/// with the engine.
#[must_use = "response futures resolve nothing unless awaited"]
pub struct ResponseFuture {
    rx: oneshot::Receiver<ResponseResult>,
    exchange: Option<ExchangeState>,
}

impl Future for ResponseFuture {
    type Output = Result<IncomingResponse, ResponseError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(_)) => Poll::Ready(Err(ResponseError::Abandoned)),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for ResponseFuture {
    fn drop(&mut self) {
        let Some(exchange) = &self.exchange else {
            return;
        };
        // cancel only exchanges the engine accepted and has not resolved yet
        if !exchange.listener.is_complete() {
            debug!("cancelling unresolved exchange");
            exchange.cleanup.run();
        }
    }
}
