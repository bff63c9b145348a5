use std::io;
use std::str;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use rand::{Rng, SeedableRng};
use tracing_subscriber::EnvFilter;

use crate::engine::{
    BindOutcome, ExchangeEngine, ExchangeHandle, ExchangeParams, HandlerRef, ResourceHandler,
    ResponseListener, SubmitOutcome, Transport, TransportRef,
};
use crate::filter::{FilterGroup, GroupRequestFilter};
use crate::message::{
    HandlerConfiguration, IncomingRequest, Method, OutgoingRequest, OutgoingResponse,
    RawResponseMessage, ResponseCode,
};
use crate::{
    response_source, AttachError, BodyError, Endpoint, NoProgress, RegisterError, ResponseError,
};

#[tokio::test]
async fn single_message_success() {
    let _guard = subscribe();
    let (endpoint, engine) = endpoint();

    let request = OutgoingRequest::builder("echo", Method::Post)
        .body_bytes(&b"hello"[..])
        .force_non_blockwise(true)
        .build();
    let response = endpoint.send(request);

    let submission = engine.submission(0);
    assert!(!submission.blockwise);
    assert_eq!(submission.path, "echo");
    submission.listener.on_ack();
    submission.listener.on_next(message(
        ResponseCode::CREATED,
        &b"hello echoed"[..],
    ));

    let response = response.await.unwrap();
    assert_eq!(response.code(), ResponseCode::CREATED);
    assert_eq!(response.extended_error(), None);
    let body = response.into_body().bytes().await.unwrap();
    assert_eq!(body, Bytes::from_static(b"hello echoed"));
}

#[tokio::test]
async fn single_message_error_status_when_success_demanded() {
    let _guard = subscribe();
    let (endpoint, engine) = endpoint();

    let response = endpoint.send(
        OutgoingRequest::builder("missing", Method::Get)
            .force_non_blockwise(true)
            .expect_success(true)
            .build(),
    );
    engine
        .submission(0)
        .listener
        .on_next(message(ResponseCode::NOT_FOUND, &[][..]));

    match response.await {
        Err(ResponseError::Status { code, error }) => {
            assert_eq!(code, ResponseCode::NOT_FOUND);
            assert_eq!(error, Some(Default::default()));
        }
        other => panic!("unexpected outcome: {other:?}"),
    }
}

#[tokio::test]
async fn single_message_error_status_delivered_as_response_by_default() {
    let _guard = subscribe();
    let (endpoint, engine) = endpoint();

    let response = endpoint.send(
        OutgoingRequest::builder("missing", Method::Get)
            .force_non_blockwise(true)
            .build(),
    );
    engine
        .submission(0)
        .listener
        .on_next(message(ResponseCode::NOT_FOUND, &b"gone"[..]));

    let response = response.await.unwrap();
    assert_eq!(response.code(), ResponseCode::NOT_FOUND);
    assert!(response.extended_error().is_some());
    assert_eq!(
        response.into_body().bytes().await.unwrap(),
        Bytes::from_static(b"gone")
    );
}

#[tokio::test]
async fn single_message_exchange_error() {
    let _guard = subscribe();
    let (endpoint, engine) = endpoint();

    let response = endpoint.send(
        OutgoingRequest::builder("echo", Method::Get)
            .force_non_blockwise(true)
            .build(),
    );
    engine.submission(0).listener.on_error(-3, "timeout");

    match response.await {
        Err(ResponseError::Exchange {
            code,
            message,
            partial,
        }) => {
            assert_eq!(code, -3);
            assert_eq!(message, "timeout");
            assert!(partial.is_empty());
        }
        other => panic!("unexpected outcome: {other:?}"),
    }
    // the terminal message resolved the exchange, so resolving it cleaned up
    // the engine-side listener
    assert_eq!(
        engine.cancels(),
        vec![CancelCall::Single(ExchangeHandle(1))]
    );
}

#[tokio::test]
async fn blockwise_body_is_concatenation_of_blocks() {
    let _guard = subscribe();
    let (endpoint, engine) = endpoint();

    let response = endpoint.send(OutgoingRequest::builder("download", Method::Get).build());
    let submission = engine.submission(0);
    assert!(submission.blockwise);

    let mut rng = rand::rngs::StdRng::seed_from_u64(17);
    let mut expected = Vec::new();
    for _ in 0..7 {
        let len = rng.gen_range(1..=1024);
        let block: Vec<u8> = (0..len).map(|_| rng.gen()).collect();
        expected.extend_from_slice(&block);
        submission
            .listener
            .on_next(message(ResponseCode::CONTENT, &block[..]));
    }

    let response = response.await.unwrap();
    assert_eq!(response.code(), ResponseCode::CONTENT);

    submission.listener.on_complete();
    let body = response.into_body().bytes().await.unwrap();
    assert_eq!(body, Bytes::from(expected));
}

#[tokio::test]
async fn blockwise_partial_failure_splits_header_and_body() {
    let _guard = subscribe();
    let (endpoint, engine) = endpoint();

    let response = endpoint.send(OutgoingRequest::builder("download", Method::Get).build());
    let submission = engine.submission(0);
    submission
        .listener
        .on_next(message(ResponseCode::CONTENT, &b"Hello,"[..]));

    // header resolves successfully
    let response = response.await.unwrap();
    assert_eq!(response.code(), ResponseCode::CONTENT);

    submission.listener.on_error(1, "boom");
    match response.into_body().bytes().await {
        Err(BodyError::Exchange {
            code,
            message,
            partial,
        }) => {
            assert_eq!(code, 1);
            assert_eq!(message, "boom");
            assert_eq!(partial, Bytes::from_static(b"Hello,"));
        }
        other => panic!("unexpected outcome: {other:?}"),
    }
}

#[tokio::test]
async fn blockwise_error_block_fails_body_only() {
    let _guard = subscribe();
    let (endpoint, engine) = endpoint();

    let response = endpoint.send(
        OutgoingRequest::builder("download", Method::Get)
            .expect_success(true)
            .build(),
    );
    let submission = engine.submission(0);
    submission
        .listener
        .on_next(message(ResponseCode::CONTENT, &b"first"[..]));
    let response = response.await.unwrap();

    submission
        .listener
        .on_next(message(ResponseCode::SERVICE_UNAVAILABLE, &b"tail"[..]));
    match response.into_body().bytes().await {
        Err(BodyError::Status { code, partial, .. }) => {
            assert_eq!(code, ResponseCode::SERVICE_UNAVAILABLE);
            // the failing block's bytes are appended before the code check
            assert_eq!(partial, Bytes::from_static(b"firsttail"));
        }
        other => panic!("unexpected outcome: {other:?}"),
    }
    // late callbacks after the failure are discarded
    submission
        .listener
        .on_next(message(ResponseCode::CONTENT, &b"late"[..]));
    submission.listener.on_complete();
}

#[tokio::test]
async fn blockwise_error_before_first_block_fails_response() {
    let _guard = subscribe();
    let (endpoint, engine) = endpoint();

    let response = endpoint.send(OutgoingRequest::builder("download", Method::Get).build());
    engine.submission(0).listener.on_error(-7, "reset");

    match response.await {
        Err(ResponseError::Exchange { code, partial, .. }) => {
            assert_eq!(code, -7);
            assert!(partial.is_empty());
        }
        other => panic!("unexpected outcome: {other:?}"),
    }
}

#[tokio::test]
async fn blockwise_first_block_error_status_fails_response() {
    let _guard = subscribe();
    let (endpoint, engine) = endpoint();

    let response = endpoint.send(
        OutgoingRequest::builder("download", Method::Get)
            .expect_success(true)
            .build(),
    );
    engine
        .submission(0)
        .listener
        .on_next(message(ResponseCode::FORBIDDEN, &[][..]));

    match response.await {
        Err(ResponseError::Status { code, .. }) => assert_eq!(code, ResponseCode::FORBIDDEN),
        other => panic!("unexpected outcome: {other:?}"),
    }
}

#[tokio::test]
async fn cancel_before_first_block_invokes_engine_cancel() {
    let _guard = subscribe();
    let (endpoint, engine) = endpoint();

    let response = endpoint.send(OutgoingRequest::builder("download", Method::Get).build());
    drop(response);

    assert_eq!(
        engine.cancels(),
        vec![CancelCall::Blockwise(ExchangeHandle(1), false)]
    );
}

#[tokio::test]
async fn cancel_after_first_block_is_ignored_until_body_dropped() {
    let _guard = subscribe();
    let (endpoint, engine) = endpoint();

    let response = endpoint.send(OutgoingRequest::builder("download", Method::Get).build());
    let submission = engine.submission(0);
    submission
        .listener
        .on_next(message(ResponseCode::CONTENT, &b"first"[..]));

    let response = response.await.unwrap();
    // outer handle resolved; nothing cancelled yet
    assert_eq!(engine.cancels(), vec![]);

    // dropping the unconsumed body cancels the remaining blockwise transfer
    drop(response.into_body());
    assert_eq!(
        engine.cancels(),
        vec![CancelCall::Blockwise(ExchangeHandle(1), false)]
    );
}

#[tokio::test]
async fn completed_transfer_cleans_up_exactly_once() {
    let _guard = subscribe();
    let (endpoint, engine) = endpoint();

    let response = endpoint.send(OutgoingRequest::builder("download", Method::Get).build());
    let submission = engine.submission(0);
    submission
        .listener
        .on_next(message(ResponseCode::CONTENT, &b"all"[..]));
    submission.listener.on_complete();

    let response = response.await.unwrap();
    let body = response.into_body().bytes().await.unwrap();
    assert_eq!(body, Bytes::from_static(b"all"));
    assert_eq!(
        engine.cancels(),
        vec![CancelCall::Blockwise(ExchangeHandle(1), false)]
    );
}

#[tokio::test]
async fn submit_rejection_fails_without_cancelling() {
    let _guard = subscribe();
    let (endpoint, engine) = endpoint();
    engine.reject_submissions(-12);

    let response = endpoint.send(OutgoingRequest::builder("download", Method::Get).build());
    match response.await {
        Err(ResponseError::Submit(code)) => assert_eq!(code, -12),
        other => panic!("unexpected outcome: {other:?}"),
    }
    assert_eq!(engine.cancels(), vec![]);
}

#[tokio::test]
async fn get_request_with_body_fails_locally() {
    let _guard = subscribe();
    let (endpoint, engine) = endpoint();

    let response = endpoint.send(
        OutgoingRequest::builder("download", Method::Get)
            .body_bytes(&b"nope"[..])
            .build(),
    );
    assert!(matches!(
        response.await,
        Err(ResponseError::BodyNotAllowed(_))
    ));
    assert_eq!(engine.submission_count(), 0);
}

#[tokio::test]
async fn outgoing_body_is_pulled_from_the_submitted_source() {
    let _guard = subscribe();
    let (endpoint, engine) = endpoint();

    let response = endpoint.send(
        OutgoingRequest::builder("upload", Method::Put)
            .body_bytes(&b"0123456789"[..])
            .build(),
    );

    {
        let mut state = engine.state.lock().unwrap();
        let source = state.submissions[0].body.as_mut().unwrap();
        let probe = source.probe(0, 4);
        assert_eq!((probe.size, probe.more), (4, true));
        assert_eq!(source.read(0, 4).unwrap(), Bytes::from_static(b"0123"));
        let probe = source.probe(4, 6);
        assert_eq!((probe.size, probe.more), (6, false));
        assert_eq!(source.read(4, 6).unwrap(), Bytes::from_static(b"456789"));
    }

    engine
        .submission(0)
        .listener
        .on_next(message(ResponseCode::CHANGED, &[][..]));
    engine.submission(0).listener.on_complete();
    let response = response.await.unwrap();
    assert_eq!(response.code(), ResponseCode::CHANGED);
}

#[tokio::test]
async fn duplicate_registration_fails() {
    let _guard = subscribe();
    let (endpoint, engine) = endpoint();
    let handler: Arc<dyn ResourceHandler> = Arc::new(EchoHandler);

    endpoint
        .register_handler("temp", handler.clone(), HandlerConfiguration::default())
        .await
        .unwrap();
    match endpoint
        .register_handler("temp", handler.clone(), HandlerConfiguration::default())
        .await
    {
        Err(RegisterError::AlreadyRegistered(path)) => assert_eq!(path, "temp"),
        other => panic!("unexpected outcome: {other:?}"),
    }
    // only one binding reached the engine
    assert_eq!(engine.bound_paths(), vec!["temp".to_owned()]);

    endpoint.unregister_handler("temp").await;
    endpoint
        .register_handler("temp", handler, HandlerConfiguration::default())
        .await
        .unwrap();
}

#[tokio::test]
async fn registration_surfaces_engine_error() {
    let _guard = subscribe();
    let (endpoint, engine) = endpoint();
    engine.reject_bindings(-9);

    let result = endpoint
        .register_handler(
            "temp",
            Arc::new(EchoHandler),
            HandlerConfiguration {
                filter_group: FilterGroup::Group1,
            },
        )
        .await;
    assert_eq!(result, Err(RegisterError::Engine(-9)));

    // a failed binding leaves the path free
    engine.reject_bindings(0);
    endpoint
        .register_handler("temp", Arc::new(EchoHandler), HandlerConfiguration::default())
        .await
        .unwrap();
}

#[tokio::test]
async fn handler_response_body_feeds_a_block_source() {
    let _guard = subscribe();
    let (endpoint, engine) = endpoint();
    endpoint
        .register_handler("echo", Arc::new(EchoHandler), HandlerConfiguration::default())
        .await
        .unwrap();

    let handler = engine.handler("echo").unwrap();
    let outgoing = handler.on_request(IncomingRequest {
        method: Method::Post,
        options: Vec::new(),
        payload: Bytes::from_static(b"ping"),
    });
    assert_eq!(outgoing.code(), ResponseCode::CONTENT);

    // the engine pulls the response payload in blocks
    let mut source = response_source(outgoing, Arc::new(NoProgress));
    let probe = source.probe(0, 10);
    assert_eq!((probe.size, probe.more, probe.request_in_range), (4, false, true));
    assert_eq!(source.read(0, 4).unwrap(), Bytes::from_static(b"ping"));
}

#[tokio::test]
async fn unregister_unknown_path_is_a_no_op() {
    let _guard = subscribe();
    let (endpoint, engine) = endpoint();
    endpoint.unregister_handler("missing").await;
    assert_eq!(engine.unbind_count(), 0);
}

#[tokio::test]
async fn attach_twice_fails_until_detached() {
    let _guard = subscribe();
    let (endpoint, _engine) = endpoint();
    let transport = FakeTransport { source: 7, sink: 8 };

    endpoint.attach(&transport).unwrap();
    assert_eq!(endpoint.attach(&transport), Err(AttachError::AlreadyAttached));
    endpoint.detach();
    endpoint.attach(&transport).unwrap();
    // detaching twice is harmless
    endpoint.detach();
    endpoint.detach();
}

#[tokio::test]
async fn close_is_idempotent_and_tears_down() {
    let _guard = subscribe();
    let (endpoint, engine) = endpoint();
    endpoint
        .register_handler("temp", Arc::new(EchoHandler), HandlerConfiguration::default())
        .await
        .unwrap();
    endpoint.attach(&FakeTransport { source: 7, sink: 8 }).unwrap();
    endpoint.set_filter_group(FilterGroup::Group0);

    endpoint.close();
    endpoint.close();

    assert_eq!(engine.shutdown_count(), 1);
    assert_eq!(engine.detach_count(), 1);
    assert_eq!(endpoint.filter().group(), FilterGroup::Group1);
    // the registry was cleared, so the path is free again
    endpoint
        .register_handler("temp", Arc::new(EchoHandler), HandlerConfiguration::default())
        .await
        .unwrap();
}

#[tokio::test]
async fn cancellation_after_close_reports_endpoint_closed() {
    let _guard = subscribe();
    let (endpoint, engine) = endpoint();

    let response = endpoint.send(OutgoingRequest::builder("download", Method::Get).build());
    endpoint.close();
    drop(response);

    assert_eq!(
        engine.cancels(),
        vec![CancelCall::Blockwise(ExchangeHandle(1), true)]
    );
}

#[tokio::test]
async fn active_filter_group_is_visible_to_the_engine() {
    let _guard = subscribe();
    let (endpoint, engine) = endpoint();

    let filter = engine.filter().unwrap();
    assert_eq!(filter.group(), FilterGroup::Group1);
    endpoint.set_filter_group(FilterGroup::Group0);
    assert_eq!(filter.group(), FilterGroup::Group0);
}

fn endpoint() -> (Endpoint, Arc<MockEngine>) {
    let engine = Arc::new(MockEngine::default());
    (Endpoint::new(engine.clone()), engine)
}

fn message(code: ResponseCode, payload: &[u8]) -> RawResponseMessage {
    RawResponseMessage {
        code,
        options: Vec::new(),
        payload: Bytes::copy_from_slice(payload),
    }
}

struct EchoHandler;

impl ResourceHandler for EchoHandler {
    fn on_request(&self, request: IncomingRequest) -> OutgoingResponse {
        OutgoingResponse::builder()
            .code(ResponseCode::CONTENT)
            .body_bytes(request.payload)
            .build()
    }
}

struct FakeTransport {
    source: u64,
    sink: u64,
}

impl Transport for FakeTransport {
    fn data_source(&self) -> TransportRef {
        TransportRef(self.source)
    }

    fn data_sink(&self) -> TransportRef {
        TransportRef(self.sink)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CancelCall {
    Single(ExchangeHandle),
    Blockwise(ExchangeHandle, bool),
}

struct Submission {
    path: String,
    blockwise: bool,
    body: Option<Box<dyn crate::BlockSource>>,
    listener: Arc<dyn ResponseListener>,
}

#[derive(Default)]
struct MockState {
    submissions: Vec<Submission>,
    cancels: Vec<CancelCall>,
    bound: Vec<(String, HandlerRef, Arc<dyn ResourceHandler>)>,
    unbinds: Vec<HandlerRef>,
    detaches: Vec<TransportRef>,
    filter: Option<Arc<GroupRequestFilter>>,
    submit_result: i32,
    bind_result: i32,
    next_ref: u64,
    shutdowns: usize,
}

/// Scripted engine double driving correlator callbacks from tests
#[derive(Default)]
struct MockEngine {
    state: Mutex<MockState>,
}

struct SubmissionView {
    path: String,
    blockwise: bool,
    listener: Arc<dyn ResponseListener>,
}

impl MockEngine {
    fn submission(&self, index: usize) -> SubmissionView {
        let state = self.state.lock().unwrap();
        let submission = &state.submissions[index];
        SubmissionView {
            path: submission.path.clone(),
            blockwise: submission.blockwise,
            listener: submission.listener.clone(),
        }
    }

    fn submission_count(&self) -> usize {
        self.state.lock().unwrap().submissions.len()
    }

    fn cancels(&self) -> Vec<CancelCall> {
        self.state.lock().unwrap().cancels.clone()
    }

    fn reject_submissions(&self, code: i32) {
        self.state.lock().unwrap().submit_result = code;
    }

    fn reject_bindings(&self, code: i32) {
        self.state.lock().unwrap().bind_result = code;
    }

    fn bound_paths(&self) -> Vec<String> {
        let state = self.state.lock().unwrap();
        state.bound.iter().map(|(path, ..)| path.clone()).collect()
    }

    fn handler(&self, path: &str) -> Option<Arc<dyn ResourceHandler>> {
        let state = self.state.lock().unwrap();
        state
            .bound
            .iter()
            .find(|(bound, ..)| bound == path)
            .map(|(.., handler)| handler.clone())
    }

    fn unbind_count(&self) -> usize {
        self.state.lock().unwrap().unbinds.len()
    }

    fn detach_count(&self) -> usize {
        self.state.lock().unwrap().detaches.len()
    }

    fn shutdown_count(&self) -> usize {
        self.state.lock().unwrap().shutdowns
    }

    fn filter(&self) -> Option<Arc<GroupRequestFilter>> {
        self.state.lock().unwrap().filter.clone()
    }
}

impl ExchangeEngine for MockEngine {
    fn submit(&self, params: ExchangeParams, listener: Arc<dyn ResponseListener>) -> SubmitOutcome {
        let mut state = self.state.lock().unwrap();
        if state.submit_result < 0 {
            return SubmitOutcome {
                result_code: state.submit_result,
                handle: ExchangeHandle(0),
            };
        }
        state.next_ref += 1;
        let handle = ExchangeHandle(state.next_ref);
        state.submissions.push(Submission {
            path: params.path,
            blockwise: params.blockwise,
            body: params.body,
            listener,
        });
        SubmitOutcome {
            result_code: 0,
            handle,
        }
    }

    fn cancel_exchange(&self, handle: ExchangeHandle) {
        self.state
            .lock()
            .unwrap()
            .cancels
            .push(CancelCall::Single(handle));
    }

    fn cancel_blockwise_exchange(&self, handle: ExchangeHandle, endpoint_closed: bool) {
        self.state
            .lock()
            .unwrap()
            .cancels
            .push(CancelCall::Blockwise(handle, endpoint_closed));
    }

    fn attach_filter(&self, filter: Arc<GroupRequestFilter>) {
        self.state.lock().unwrap().filter = Some(filter);
    }

    fn bind_handler(
        &self,
        path: &str,
        handler: Arc<dyn ResourceHandler>,
        _group: FilterGroup,
    ) -> BindOutcome {
        let mut state = self.state.lock().unwrap();
        if state.bind_result < 0 {
            return BindOutcome {
                result_code: state.bind_result,
                handler_ref: HandlerRef(0),
            };
        }
        state.next_ref += 1;
        let handler_ref = HandlerRef(state.next_ref);
        state.bound.push((path.to_owned(), handler_ref, handler));
        BindOutcome {
            result_code: 0,
            handler_ref,
        }
    }

    fn unbind_handler(&self, handler: HandlerRef) -> i32 {
        self.state.lock().unwrap().unbinds.push(handler);
        0
    }

    fn attach(&self, _source: TransportRef, _sink: TransportRef) {}

    fn detach(&self, source: TransportRef) {
        self.state.lock().unwrap().detaches.push(source);
    }

    fn data_source_ref(&self) -> TransportRef {
        TransportRef(100)
    }

    fn data_sink_ref(&self) -> TransportRef {
        TransportRef(101)
    }

    fn shutdown(&self) {
        self.state.lock().unwrap().shutdowns += 1;
    }
}

fn subscribe() -> tracing::subscriber::DefaultGuard {
    let sub = tracing_subscriber::FmtSubscriber::builder()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(|| TestWriter)
        .finish();
    tracing::subscriber::set_default(sub)
}

struct TestWriter;

impl io::Write for TestWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        print!(
            "{}",
            str::from_utf8(buf).expect("tried to log invalid UTF-8")
        );
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        io::stdout().flush()
    }
}
