//! Send side of a participant: one message at a time, one chunk at a time.
//!
//! Messages queue in the machine. The active message is sliced by a [`ChunkSequencer`]; every
//! piece is written and its completion awaited in [`OutboundState::Writing`], and every chunk
//! waits for its transaction response in [`OutboundState::AwaitingResponse`] before the next
//! one starts.

use std::collections::VecDeque;
use std::fmt;
use std::io::{self, Read};
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::{Buf, Bytes};
use tracing::{debug, info, trace, warn};

use super::{ActivityError, Machine, Outbox, StateMachine, Transition, no_activity};
use crate::application::SendFailure;
use crate::ids::{MessageId, TransactionId};
use crate::message::{Frame, Report, Response};
use crate::participant::SessionContext;
use crate::sequencer::{ChunkSequencer, SequencerPhase};
use crate::timer::IdleTimer;

/// Where the content of an outbound message comes from.
pub enum MessageBody {
    Bytes(Bytes),
    /// Read on demand. `size` is announced in the byte-range when known.
    Stream {
        reader: Box<dyn Read + Send>,
        size: Option<u64>,
    },
}

impl MessageBody {
    pub fn size(&self) -> Option<u64> {
        match self {
            MessageBody::Bytes(bytes) => Some(bytes.len() as u64),
            MessageBody::Stream { size, .. } => *size,
        }
    }
}

impl fmt::Debug for MessageBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageBody::Bytes(bytes) => f.debug_tuple("Bytes").field(&bytes.len()).finish(),
            MessageBody::Stream { size, .. } => {
                f.debug_struct("Stream").field("size", size).finish_non_exhaustive()
            }
        }
    }
}

#[derive(Debug)]
pub struct OutgoingMessage {
    pub message_id: MessageId,
    pub content_type: String,
    pub body: MessageBody,
    pub success_report: bool,
}

impl OutgoingMessage {
    pub fn new(content_type: impl Into<String>, body: impl Into<Bytes>) -> Self {
        Self {
            message_id: MessageId::generate(),
            content_type: content_type.into(),
            body: MessageBody::Bytes(body.into()),
            success_report: false,
        }
    }

    pub fn stream(
        content_type: impl Into<String>,
        reader: impl Read + Send + 'static,
        size: Option<u64>,
    ) -> Self {
        Self {
            message_id: MessageId::generate(),
            content_type: content_type.into(),
            body: MessageBody::Stream {
                reader: Box::new(reader),
                size,
            },
            success_report: false,
        }
    }

    pub fn with_message_id(mut self, message_id: MessageId) -> Self {
        self.message_id = message_id;
        self
    }

    pub fn with_success_report(mut self, success_report: bool) -> Self {
        self.success_report = success_report;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutboundState {
    AwaitingConnection,
    Ready,
    /// Transient: about to write the next piece.
    Sending,
    /// A piece was handed to the transport.
    Writing,
    /// The chunk was written; waiting for its response.
    AwaitingResponse,
    Closed,
}

#[derive(Debug)]
pub enum OutboundSignal {
    ConnectionReady,
    SendMessage(OutgoingMessage),
    StartNext,
    SendNextPiece,
    PieceWritten,
    WriteFailed(String),
    ResponseReceived(Response),
    ResponseTimeout(TransactionId),
    ReportReceived(Report),
    AbortMessage(MessageId),
    Close,
}

/// Content not yet handed to the sequencer.
struct ContentCursor {
    reader: Option<Box<dyn Read + Send>>,
    remaining: Option<u64>,
    pending: Bytes,
}

impl ContentCursor {
    fn new(body: MessageBody) -> Self {
        match body {
            MessageBody::Bytes(bytes) => Self {
                reader: None,
                remaining: Some(bytes.len() as u64),
                pending: bytes,
            },
            MessageBody::Stream { reader, size } => Self {
                reader: Some(reader),
                remaining: size,
                pending: Bytes::new(),
            },
        }
    }

    /// The next slice to offer, and whether nothing follows it. `None` once exhausted.
    fn peek(&mut self, read_size: usize) -> io::Result<(Option<Bytes>, bool)> {
        let read_size = read_size.max(1);
        if self.pending.is_empty() {
            self.fill(read_size)?;
        }
        if self.pending.is_empty() {
            return Ok((None, true));
        }

        let len = self.pending.len().min(read_size);
        let is_last = self.reader.is_none() && len == self.pending.len();
        Ok((Some(self.pending.slice(..len)), is_last))
    }

    fn advance(&mut self, consumed: usize) {
        self.pending.advance(consumed.min(self.pending.len()));
    }

    fn fill(&mut self, read_size: usize) -> io::Result<()> {
        let Some(reader) = self.reader.as_mut() else {
            return Ok(());
        };

        let mut buf = vec![0; read_size];
        let read = loop {
            match reader.read(&mut buf) {
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                result => break result?,
            }
        };

        if read == 0 {
            self.reader = None;
            return Ok(());
        }
        buf.truncate(read);
        self.pending = Bytes::from(buf);
        if let Some(remaining) = self.remaining.as_mut() {
            *remaining = remaining.saturating_sub(read as u64);
            if *remaining == 0 {
                self.reader = None;
            }
        }
        Ok(())
    }
}

impl fmt::Debug for ContentCursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContentCursor")
            .field("streaming", &self.reader.is_some())
            .field("remaining", &self.remaining)
            .field("pending", &self.pending.len())
            .finish()
    }
}

#[derive(Debug)]
struct ActiveTransfer {
    sequencer: ChunkSequencer,
    cursor: ContentCursor,
    abort: bool,
    chunk_ended: bool,
    /// Why the transfer is being given up, once known.
    failure: Option<SendFailure>,
}

impl ActiveTransfer {
    fn message_id(&self) -> &MessageId {
        self.sequencer.message_id()
    }
}

#[derive(Debug)]
pub struct OutboundTransfer {
    session: Arc<SessionContext>,
    machine: Weak<Machine<OutboundTransfer>>,
    pending: VecDeque<OutgoingMessage>,
    active: Option<ActiveTransfer>,
    response_timer: IdleTimer,
    messages_sent: u64,
}

impl OutboundTransfer {
    pub fn new(session: Arc<SessionContext>, machine: Weak<Machine<OutboundTransfer>>) -> Self {
        let response_timer = IdleTimer::new(session.runtime.clone());
        Self {
            session,
            machine,
            pending: VecDeque::new(),
            active: None,
            response_timer,
            messages_sent: 0,
        }
    }

    pub fn queued(&self) -> usize {
        self.pending.len()
    }

    pub fn active_message(&self) -> Option<&MessageId> {
        self.active.as_ref().map(ActiveTransfer::message_id)
    }

    pub fn messages_sent(&self) -> u64 {
        self.messages_sent
    }

    fn enqueue(
        &mut self,
        signal: OutboundSignal,
        _outbox: &mut Outbox<OutboundSignal>,
    ) -> Result<(), ActivityError> {
        let message = match signal {
            OutboundSignal::SendMessage(message) => message,
            signal => return Err(unexpected(&signal)),
        };
        debug!(
            message_id = %message.message_id,
            queued = self.pending.len() + 1,
            "Message queued"
        );
        self.pending.push_back(message);
        Ok(())
    }

    fn enqueue_and_start(
        &mut self,
        signal: OutboundSignal,
        outbox: &mut Outbox<OutboundSignal>,
    ) -> Result<(), ActivityError> {
        self.enqueue(signal, outbox)?;
        self.start_next(OutboundSignal::StartNext, outbox)
    }

    fn start_next(
        &mut self,
        _signal: OutboundSignal,
        _outbox: &mut Outbox<OutboundSignal>,
    ) -> Result<(), ActivityError> {
        let message = self
            .pending
            .pop_front()
            .ok_or_else(|| ActivityError::Protocol("no message to send".to_string()))?;
        let size = message.body.size();
        info!(message_id = %message.message_id, ?size, "Starting transfer");

        let config = &self.session.config;
        let sequencer = ChunkSequencer::new(
            message.message_id,
            self.session.paths.local.clone(),
            self.session.paths.remote.clone(),
            &message.content_type,
            size,
            config.max_chunk_size,
        )
        .with_success_report(message.success_report);

        self.active = Some(ActiveTransfer {
            sequencer,
            cursor: ContentCursor::new(message.body),
            abort: false,
            chunk_ended: false,
            failure: None,
        });
        Ok(())
    }

    fn send_next_piece(
        &mut self,
        _signal: OutboundSignal,
        _outbox: &mut Outbox<OutboundSignal>,
    ) -> Result<(), ActivityError> {
        let result = self.write_next_piece();
        if let Err(err) = &result
            && let Some(active) = self.active.as_mut()
        {
            active.failure = Some(SendFailure::Transport(err.to_string()));
        }
        result
    }

    fn write_next_piece(&mut self) -> Result<(), ActivityError> {
        let read_size = self.session.config.read_size;
        let active = self
            .active
            .as_mut()
            .ok_or_else(|| ActivityError::Protocol("no active transfer".to_string()))?;

        let (content, is_last) = active.cursor.peek(read_size)?;
        let next = active
            .sequencer
            .next_piece(content.as_deref(), active.abort, is_last)?;
        active.cursor.advance(next.consumed);
        active.chunk_ended = next.piece.ends_chunk();

        trace!(
            message_id = %next.piece.message_id,
            transaction_id = %next.piece.transaction_id,
            byte_range = %next.piece.byte_range,
            chunk_type = ?next.piece.chunk_type,
            "Writing piece"
        );

        let machine = self.machine.clone();
        self.session.transport.write(
            Frame::Send(next.piece),
            Box::new(move |result| {
                let Some(machine) = machine.upgrade() else {
                    return;
                };
                let signal = match result {
                    Ok(()) => OutboundSignal::PieceWritten,
                    Err(err) => OutboundSignal::WriteFailed(err.to_string()),
                };
                if let Err(err) = machine.input(signal) {
                    warn!(error = %err, "Write completion not delivered");
                }
            }),
        )?;
        Ok(())
    }

    fn await_response(
        &mut self,
        _signal: OutboundSignal,
        _outbox: &mut Outbox<OutboundSignal>,
    ) -> Result<(), ActivityError> {
        let transaction_id = self
            .active
            .as_ref()
            .map(|active| active.sequencer.transaction_id().clone())
            .ok_or_else(|| ActivityError::Protocol("no active transfer".to_string()))?;

        let machine = self.machine.clone();
        self.response_timer
            .arm(self.session.config.response_timeout, move |_| {
                let Some(machine) = machine.upgrade() else {
                    return;
                };
                // The timer task must never block; a busy machine gets the signal queued.
                let signal = OutboundSignal::ResponseTimeout(transaction_id);
                match machine.input_timeout(signal, Duration::ZERO) {
                    Ok(_) => {}
                    Err(err) if err.is_wait_timeout() => {}
                    Err(err) => warn!(error = %err, "Response timeout not delivered"),
                }
            });
        Ok(())
    }

    fn write_failed(
        &mut self,
        signal: OutboundSignal,
        _outbox: &mut Outbox<OutboundSignal>,
    ) -> Result<(), ActivityError> {
        if let OutboundSignal::WriteFailed(reason) = signal
            && let Some(active) = self.active.as_mut()
        {
            active.failure = Some(SendFailure::Transport(reason));
        }
        Ok(())
    }

    fn chunk_accepted(
        &mut self,
        _signal: OutboundSignal,
        _outbox: &mut Outbox<OutboundSignal>,
    ) -> Result<(), ActivityError> {
        self.response_timer.cancel();
        Ok(())
    }

    fn message_delivered(
        &mut self,
        _signal: OutboundSignal,
        _outbox: &mut Outbox<OutboundSignal>,
    ) -> Result<(), ActivityError> {
        self.response_timer.cancel();
        let Some(active) = self.active.take() else {
            return Ok(());
        };

        let message_id = active.message_id();
        if active.sequencer.phase() == SequencerPhase::Abort {
            info!(%message_id, "Transfer aborted");
            self.session
                .app
                .message_failed(message_id, SendFailure::Aborted);
        } else {
            info!(%message_id, bytes = active.sequencer.bytes_sent(), "Message sent");
            self.messages_sent += 1;
            self.session.app.message_sent(message_id);
        }
        Ok(())
    }

    fn chunk_rejected(
        &mut self,
        signal: OutboundSignal,
        _outbox: &mut Outbox<OutboundSignal>,
    ) -> Result<(), ActivityError> {
        self.response_timer.cancel();
        if let OutboundSignal::ResponseReceived(response) = signal
            && let Some(active) = self.active.as_mut()
        {
            active.failure = Some(SendFailure::Rejected(response.status));
        }
        Ok(())
    }

    fn response_timed_out(
        &mut self,
        _signal: OutboundSignal,
        _outbox: &mut Outbox<OutboundSignal>,
    ) -> Result<(), ActivityError> {
        if let Some(active) = self.active.as_mut() {
            active.failure = Some(SendFailure::TimedOut);
        }
        Ok(())
    }

    fn ignore_stale(
        &mut self,
        signal: OutboundSignal,
        _outbox: &mut Outbox<OutboundSignal>,
    ) -> Result<(), ActivityError> {
        debug!(?signal, "Ignoring stale signal");
        Ok(())
    }

    fn abort(
        &mut self,
        signal: OutboundSignal,
        _outbox: &mut Outbox<OutboundSignal>,
    ) -> Result<(), ActivityError> {
        let message_id = match signal {
            OutboundSignal::AbortMessage(message_id) => message_id,
            signal => return Err(unexpected(&signal)),
        };

        if let Some(active) = self
            .active
            .as_mut()
            .filter(|active| *active.message_id() == message_id)
        {
            info!(%message_id, "Aborting active transfer");
            active.abort = true;
            return Ok(());
        }

        match self
            .pending
            .iter()
            .position(|message| message.message_id == message_id)
        {
            Some(index) => {
                self.pending.remove(index);
                info!(%message_id, "Aborted queued message");
                self.session
                    .app
                    .message_failed(&message_id, SendFailure::Aborted);
            }
            None => debug!(%message_id, "Abort for unknown message"),
        }
        Ok(())
    }

    fn forward_report(
        &mut self,
        signal: OutboundSignal,
        _outbox: &mut Outbox<OutboundSignal>,
    ) -> Result<(), ActivityError> {
        if let OutboundSignal::ReportReceived(report) = signal {
            debug!(message_id = %report.message_id, status = %report.status, "Report received");
            self.session.app.report_received(&report);
        }
        Ok(())
    }

    fn drop_signal(
        &mut self,
        signal: OutboundSignal,
        _outbox: &mut Outbox<OutboundSignal>,
    ) -> Result<(), ActivityError> {
        debug!(?signal, "Dropping signal on closed sender");
        Ok(())
    }

    fn fail_active(&mut self, default: SendFailure) {
        if let Some(mut active) = self.active.take() {
            let failure = active.failure.take().unwrap_or(default);
            warn!(message_id = %active.message_id(), ?failure, "Transfer failed");
            self.session.app.message_failed(active.message_id(), failure);
        }
    }
}

fn unexpected(signal: &OutboundSignal) -> ActivityError {
    ActivityError::Protocol(format!("unexpected signal {signal:?}"))
}

fn is_connection_ready(signal: &OutboundSignal, _: &OutboundTransfer) -> bool {
    matches!(signal, OutboundSignal::ConnectionReady)
}

fn is_send_message(signal: &OutboundSignal, _: &OutboundTransfer) -> bool {
    matches!(signal, OutboundSignal::SendMessage(_))
}

fn is_start_next(signal: &OutboundSignal, machine: &OutboundTransfer) -> bool {
    matches!(signal, OutboundSignal::StartNext) && !machine.pending.is_empty()
}

fn is_idle_start(signal: &OutboundSignal, _: &OutboundTransfer) -> bool {
    matches!(signal, OutboundSignal::StartNext)
}

fn is_send_next_piece(signal: &OutboundSignal, _: &OutboundTransfer) -> bool {
    matches!(signal, OutboundSignal::SendNextPiece)
}

fn is_piece_written(signal: &OutboundSignal, machine: &OutboundTransfer) -> bool {
    matches!(signal, OutboundSignal::PieceWritten)
        && machine.active.as_ref().is_some_and(|active| !active.chunk_ended)
}

fn is_chunk_written(signal: &OutboundSignal, machine: &OutboundTransfer) -> bool {
    matches!(signal, OutboundSignal::PieceWritten)
        && machine.active.as_ref().is_some_and(|active| active.chunk_ended)
}

fn is_write_failed(signal: &OutboundSignal, _: &OutboundTransfer) -> bool {
    matches!(signal, OutboundSignal::WriteFailed(_))
}

fn answers_current_chunk(transaction_id: &TransactionId, machine: &OutboundTransfer) -> bool {
    machine
        .active
        .as_ref()
        .is_some_and(|active| active.sequencer.transaction_id() == transaction_id)
}

fn is_chunk_accepted(signal: &OutboundSignal, machine: &OutboundTransfer) -> bool {
    matches!(signal, OutboundSignal::ResponseReceived(response)
        if response.status.is_success() && answers_current_chunk(&response.transaction_id, machine))
        && machine
            .active
            .as_ref()
            .is_some_and(|active| !active.sequencer.is_finished())
}

fn is_message_delivered(signal: &OutboundSignal, machine: &OutboundTransfer) -> bool {
    matches!(signal, OutboundSignal::ResponseReceived(response)
        if response.status.is_success() && answers_current_chunk(&response.transaction_id, machine))
        && machine
            .active
            .as_ref()
            .is_some_and(|active| active.sequencer.is_finished())
}

fn is_chunk_rejected(signal: &OutboundSignal, machine: &OutboundTransfer) -> bool {
    matches!(signal, OutboundSignal::ResponseReceived(response)
        if !response.status.is_success()
            && answers_current_chunk(&response.transaction_id, machine))
}

fn is_response_timeout(signal: &OutboundSignal, machine: &OutboundTransfer) -> bool {
    matches!(signal, OutboundSignal::ResponseTimeout(transaction_id)
        if answers_current_chunk(transaction_id, machine))
}

fn is_stale(signal: &OutboundSignal, _: &OutboundTransfer) -> bool {
    matches!(
        signal,
        OutboundSignal::ResponseReceived(_)
            | OutboundSignal::ResponseTimeout(_)
            | OutboundSignal::PieceWritten
            | OutboundSignal::WriteFailed(_)
    )
}

fn is_report(signal: &OutboundSignal, _: &OutboundTransfer) -> bool {
    matches!(signal, OutboundSignal::ReportReceived(_))
}

fn is_abort(signal: &OutboundSignal, _: &OutboundTransfer) -> bool {
    matches!(signal, OutboundSignal::AbortMessage(_))
}

fn is_close(signal: &OutboundSignal, _: &OutboundTransfer) -> bool {
    matches!(signal, OutboundSignal::Close)
}

fn any_signal(_: &OutboundSignal, _: &OutboundTransfer) -> bool {
    true
}

macro_rules! transition {
    ($name:literal, $condition:expr, $target:ident) => {
        transition!($name, $condition, $target, None, no_activity)
    };
    ($name:literal, $condition:expr, $target:ident, $activity:expr) => {
        transition!($name, $condition, $target, None, $activity)
    };
    ($name:literal, $condition:expr, $target:ident, $exception:expr, $activity:expr) => {
        Transition {
            name: $name,
            condition: $condition,
            target: OutboundState::$target,
            exception_state: $exception,
            activity: $activity,
        }
    };
}

static AWAITING_CONNECTION: [Transition<OutboundTransfer>; 4] = [
    transition!("connected", is_connection_ready, Ready),
    transition!("queue", is_send_message, AwaitingConnection, OutboundTransfer::enqueue),
    transition!("abort", is_abort, AwaitingConnection, OutboundTransfer::abort),
    transition!("close", is_close, Closed),
];

static READY: [Transition<OutboundTransfer>; 7] = [
    transition!("send", is_send_message, Sending, OutboundTransfer::enqueue_and_start),
    transition!("start-next", is_start_next, Sending, OutboundTransfer::start_next),
    transition!("nothing-pending", is_idle_start, Ready),
    transition!("abort", is_abort, Ready, OutboundTransfer::abort),
    transition!("report", is_report, Ready, OutboundTransfer::forward_report),
    transition!("stale", is_stale, Ready, OutboundTransfer::ignore_stale),
    transition!("close", is_close, Closed),
];

static SENDING: [Transition<OutboundTransfer>; 4] = [
    transition!(
        "send-piece",
        is_send_next_piece,
        Writing,
        Some(OutboundState::Ready),
        OutboundTransfer::send_next_piece
    ),
    transition!("queue", is_send_message, Sending, OutboundTransfer::enqueue),
    transition!("abort", is_abort, Sending, OutboundTransfer::abort),
    transition!("close", is_close, Closed),
];

static WRITING: [Transition<OutboundTransfer>; 7] = [
    transition!("piece-written", is_piece_written, Sending),
    transition!(
        "chunk-written",
        is_chunk_written,
        AwaitingResponse,
        OutboundTransfer::await_response
    ),
    transition!("write-failed", is_write_failed, Ready, OutboundTransfer::write_failed),
    transition!("queue", is_send_message, Writing, OutboundTransfer::enqueue),
    transition!("abort", is_abort, Writing, OutboundTransfer::abort),
    transition!("report", is_report, Writing, OutboundTransfer::forward_report),
    transition!("close", is_close, Closed),
];

static AWAITING_RESPONSE: [Transition<OutboundTransfer>; 9] = [
    transition!("chunk-accepted", is_chunk_accepted, Sending, OutboundTransfer::chunk_accepted),
    transition!(
        "message-delivered",
        is_message_delivered,
        Ready,
        OutboundTransfer::message_delivered
    ),
    transition!("chunk-rejected", is_chunk_rejected, Ready, OutboundTransfer::chunk_rejected),
    transition!(
        "response-timeout",
        is_response_timeout,
        Ready,
        OutboundTransfer::response_timed_out
    ),
    transition!("stale", is_stale, AwaitingResponse, OutboundTransfer::ignore_stale),
    transition!("queue", is_send_message, AwaitingResponse, OutboundTransfer::enqueue),
    transition!("abort", is_abort, AwaitingResponse, OutboundTransfer::abort),
    transition!("report", is_report, AwaitingResponse, OutboundTransfer::forward_report),
    transition!("close", is_close, Closed),
];

static CLOSED: [Transition<OutboundTransfer>; 1] =
    [transition!("drop", any_signal, Closed, OutboundTransfer::drop_signal)];

impl StateMachine for OutboundTransfer {
    type State = OutboundState;
    type Signal = OutboundSignal;

    fn transitions(state: OutboundState) -> &'static [Transition<Self>] {
        match state {
            OutboundState::AwaitingConnection => &AWAITING_CONNECTION,
            OutboundState::Ready => &READY,
            OutboundState::Sending => &SENDING,
            OutboundState::Writing => &WRITING,
            OutboundState::AwaitingResponse => &AWAITING_RESPONSE,
            OutboundState::Closed => &CLOSED,
        }
    }

    fn is_blocking(state: OutboundState) -> bool {
        state == OutboundState::Writing
    }

    fn on_enter(
        &mut self,
        state: OutboundState,
        reentry: bool,
        outbox: &mut Outbox<OutboundSignal>,
    ) {
        if reentry {
            return;
        }
        match state {
            OutboundState::Ready => {
                self.response_timer.cancel();
                self.fail_active(SendFailure::Transport("transfer interrupted".to_string()));
                if !self.pending.is_empty() {
                    outbox.signal(OutboundSignal::StartNext);
                }
            }
            OutboundState::Sending => outbox.signal(OutboundSignal::SendNextPiece),
            OutboundState::Closed => {
                self.response_timer.cancel();
                self.fail_active(SendFailure::SessionClosed);
                for message in self.pending.drain(..) {
                    self.session
                        .app
                        .message_failed(&message.message_id, SendFailure::SessionClosed);
                }
            }
            _ => {}
        }
    }

    fn queue_full_signal(&self, state: OutboundState) -> Option<OutboundSignal> {
        (state == OutboundState::Writing)
            .then(|| OutboundSignal::WriteFailed("signal queue limit reached".to_string()))
    }
}
