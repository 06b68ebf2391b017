//! Doubles shared by the machine and participant tests.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::runtime::Handle;

use crate::application::{MsrpApplication, SendFailure};
use crate::config::MsrpConfig;
use crate::cpim::MessageMetadata;
use crate::ids::{MessageId, SessionId, TransactionId};
use crate::message::{
    ByteRange, ChunkPiece, ChunkType, Continuation, Frame, MsrpUri, Report, StatusCode,
};
use crate::participant::{SessionContext, SessionPaths};
use crate::store::ContentStore;
use crate::transport::{Completion, Role, Transport, TransportError};

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum AppEvent {
    Request(TransactionId),
    Progress(MessageId, u64),
    Received {
        message_id: MessageId,
        aborted: bool,
        contents: Vec<u8>,
    },
    Sent(MessageId),
    Failed(MessageId, SendFailure),
    Report(Report),
    Established,
    Closed,
}

pub(crate) struct TestApp {
    pub(crate) events: Mutex<Vec<AppEvent>>,
    pub(crate) status: Mutex<StatusCode>,
}

impl Default for TestApp {
    fn default() -> Self {
        Self {
            events: Mutex::new(Vec::new()),
            status: Mutex::new(StatusCode::OK),
        }
    }
}

impl TestApp {
    pub(crate) fn events(&self) -> Vec<AppEvent> {
        self.events.lock().clone()
    }

    pub(crate) fn has(&self, predicate: impl Fn(&AppEvent) -> bool) -> bool {
        self.events.lock().iter().any(predicate)
    }

    fn push(&self, event: AppEvent) {
        self.events.lock().push(event);
    }
}

impl MsrpApplication for TestApp {
    fn request_received(&self, _session: &SessionPaths, chunk: &ChunkPiece) -> StatusCode {
        self.push(AppEvent::Request(chunk.transaction_id.clone()));
        *self.status.lock()
    }

    fn more_bytes_received(
        &self,
        message_id: &MessageId,
        bytes_so_far: u64,
        _expected_total: Option<u64>,
        _store: &dyn ContentStore,
    ) {
        self.push(AppEvent::Progress(message_id.clone(), bytes_so_far));
    }

    fn message_received(
        &self,
        message_id: &MessageId,
        _metadata: &MessageMetadata,
        store: Box<dyn ContentStore>,
    ) {
        self.push(AppEvent::Received {
            message_id: message_id.clone(),
            aborted: store.was_aborted(),
            contents: store.contents().unwrap_or_default().to_vec(),
        });
    }

    fn message_sent(&self, message_id: &MessageId) {
        self.push(AppEvent::Sent(message_id.clone()));
    }

    fn message_failed(&self, message_id: &MessageId, failure: SendFailure) {
        self.push(AppEvent::Failed(message_id.clone(), failure));
    }

    fn report_received(&self, report: &Report) {
        self.push(AppEvent::Report(report.clone()));
    }

    fn connection_established(&self, _local: &MsrpUri) {
        self.push(AppEvent::Established);
    }

    fn connection_closed(&self, _local: &MsrpUri) {
        self.push(AppEvent::Closed);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Request {
    Open(Role),
    Write,
    Close,
}

/// Transport that records frames and holds completions until the test releases them.
#[derive(Default)]
pub(crate) struct MockTransport {
    pub(crate) frames: Mutex<Vec<Frame>>,
    pending: Mutex<VecDeque<(Request, Completion)>>,
    pub(crate) refuse_writes: Mutex<Option<TransportError>>,
}

impl MockTransport {
    pub(crate) fn frames(&self) -> Vec<Frame> {
        self.frames.lock().clone()
    }

    pub(crate) fn pending(&self) -> Vec<Request> {
        self.pending.lock().iter().map(|(request, _)| *request).collect()
    }

    /// Run the oldest held completion with `result`.
    pub(crate) fn complete_next(&self, result: Result<(), TransportError>) -> Option<Request> {
        let (request, done) = self.pending.lock().pop_front()?;
        done(result);
        Some(request)
    }
}

impl Transport for MockTransport {
    fn open(&self, role: Role, _remote: &MsrpUri, done: Completion) {
        self.pending.lock().push_back((Request::Open(role), done));
    }

    fn write(&self, frame: Frame, done: Completion) -> Result<(), TransportError> {
        if let Some(err) = self.refuse_writes.lock().clone() {
            return Err(err);
        }
        self.frames.lock().push(frame);
        self.pending.lock().push_back((Request::Write, done));
        Ok(())
    }

    fn close(&self, done: Completion) {
        self.pending.lock().push_back((Request::Close, done));
    }
}

pub(crate) fn uri(session: &str) -> MsrpUri {
    MsrpUri::new("127.0.0.1", 2855, &SessionId::from(session)).unwrap()
}

pub(crate) fn paths() -> SessionPaths {
    SessionPaths {
        local: uri("local"),
        remote: uri("remote"),
    }
}

pub(crate) fn session(
    transport: &Arc<MockTransport>,
    app: &Arc<TestApp>,
    config: MsrpConfig,
) -> Arc<SessionContext> {
    Arc::new(SessionContext {
        paths: paths(),
        transport: Arc::clone(transport) as Arc<dyn Transport>,
        app: Arc::clone(app) as Arc<dyn MsrpApplication>,
        config,
        runtime: Handle::current(),
    })
}

/// An incoming piece addressed from the remote to the local path.
pub(crate) fn incoming(
    tx: &str,
    message: &str,
    range: ByteRange,
    continuation: Continuation,
    chunk_type: ChunkType,
    body: &[u8],
) -> ChunkPiece {
    ChunkPiece {
        transaction_id: TransactionId::from(tx),
        message_id: MessageId::from(message),
        to_path: uri("local"),
        from_path: uri("remote"),
        byte_range: range,
        continuation,
        chunk_type,
        content_type: Some("text/plain".to_string()),
        header_len: 0,
        success_report: false,
        failure_report: true,
        body: bytes::Bytes::copy_from_slice(body),
    }
}

/// Poll `condition` until it holds or `timeout` passes.
pub(crate) fn eventually(timeout: Duration, condition: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    condition()
}
