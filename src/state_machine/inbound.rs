//! Receive side of a participant: admits pieces, feeds the reassembly table, answers chunks.
//!
//! Pacing comes from the blocking states. Once a chunk ends, the response has to be written
//! before the next piece is admitted, so a network thread delivering faster than responses
//! drain waits in [`InboundState::ResponsePending`] or [`InboundState::AwaitingWrite`].

use std::sync::{Arc, Weak};

use tracing::{debug, info, warn};

use super::{ActivityError, Machine, Outbox, StateMachine, Transition, no_activity};
use crate::ids::TransactionId;
use crate::message::{ByteRange, ChunkPiece, Continuation, Frame, Report, Response, StatusCode};
use crate::participant::SessionContext;
use crate::reassembly::ReassemblyTable;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboundState {
    /// Waiting for the connection to be established.
    Inactive,
    Idle,
    /// Between the first and last piece of a chunk.
    Receiving,
    /// The chunk ended; its response is about to be written.
    ResponsePending,
    /// The response was handed to the transport.
    AwaitingWrite,
    Closed,
}

#[derive(Debug)]
pub enum InboundSignal {
    Activate,
    ChunkReceived(ChunkPiece),
    SendResponse,
    ResponseWritten,
    ResponseWriteFailed(String),
    /// Abandon the current chunk and its response.
    ForceIdle,
    Close,
}

/// The chunk currently being received.
#[derive(Debug)]
struct OpenChunk {
    transaction_id: TransactionId,
    response: Response,
    /// Sent after the response when the sender asked for one.
    report: Option<Report>,
}

#[derive(Debug)]
pub struct InboundTransfer {
    session: Arc<SessionContext>,
    reassembly: Arc<ReassemblyTable>,
    machine: Weak<Machine<InboundTransfer>>,
    chunk: Option<OpenChunk>,
    chunks_answered: u64,
}

impl InboundTransfer {
    pub fn new(
        session: Arc<SessionContext>,
        reassembly: Arc<ReassemblyTable>,
        machine: Weak<Machine<InboundTransfer>>,
    ) -> Self {
        Self {
            session,
            reassembly,
            machine,
            chunk: None,
            chunks_answered: 0,
        }
    }

    pub fn chunks_answered(&self) -> u64 {
        self.chunks_answered
    }

    fn begin_chunk(
        &mut self,
        signal: InboundSignal,
        _outbox: &mut Outbox<InboundSignal>,
    ) -> Result<(), ActivityError> {
        let piece = match signal {
            InboundSignal::ChunkReceived(piece) => piece,
            signal => return Err(unexpected(&signal)),
        };

        let status = if piece.is_empty_send() {
            StatusCode::OK
        } else {
            self.session.app.request_received(&self.session.paths, &piece)
        };
        debug!(
            transaction_id = %piece.transaction_id,
            message_id = %piece.message_id,
            %status,
            "Chunk started"
        );

        self.chunk = Some(OpenChunk {
            transaction_id: piece.transaction_id.clone(),
            response: piece.response(status),
            report: None,
        });
        self.receive(piece)
    }

    fn continue_chunk(
        &mut self,
        signal: InboundSignal,
        _outbox: &mut Outbox<InboundSignal>,
    ) -> Result<(), ActivityError> {
        match signal {
            InboundSignal::ChunkReceived(piece) => self.receive(piece),
            signal => Err(unexpected(&signal)),
        }
    }

    fn receive(&mut self, piece: ChunkPiece) -> Result<(), ActivityError> {
        let chunk = self
            .chunk
            .as_mut()
            .ok_or_else(|| ActivityError::Protocol("piece outside of a chunk".to_string()))?;
        let accepted = chunk.response.status.is_success();

        if accepted && piece.success_report && piece.continuation == Continuation::Done {
            chunk.report = Some(success_report(&piece));
        }
        if accepted && !piece.is_empty_send() {
            self.reassembly.accept(piece);
        }
        Ok(())
    }

    fn write_response(
        &mut self,
        _signal: InboundSignal,
        _outbox: &mut Outbox<InboundSignal>,
    ) -> Result<(), ActivityError> {
        let chunk = self
            .chunk
            .as_ref()
            .ok_or_else(|| ActivityError::Protocol("no chunk awaiting a response".to_string()))?;

        let machine = self.machine.clone();
        self.session.transport.write(
            Frame::Response(chunk.response.clone()),
            Box::new(move |result| {
                let Some(machine) = machine.upgrade() else {
                    return;
                };
                let signal = match result {
                    Ok(()) => InboundSignal::ResponseWritten,
                    Err(err) => InboundSignal::ResponseWriteFailed(err.to_string()),
                };
                if let Err(err) = machine.input(signal) {
                    warn!(error = %err, "Response completion not delivered");
                }
            }),
        )?;
        Ok(())
    }

    fn response_written(
        &mut self,
        _signal: InboundSignal,
        _outbox: &mut Outbox<InboundSignal>,
    ) -> Result<(), ActivityError> {
        self.chunks_answered += 1;
        let Some(report) = self.chunk.as_mut().and_then(|chunk| chunk.report.take()) else {
            return Ok(());
        };

        info!(message_id = %report.message_id, "Sending success report");
        self.session.transport.write(
            Frame::Report(report),
            Box::new(|result| {
                if let Err(err) = result {
                    warn!(error = %err, "Report write failed");
                }
            }),
        )?;
        Ok(())
    }

    fn response_failed(
        &mut self,
        signal: InboundSignal,
        _outbox: &mut Outbox<InboundSignal>,
    ) -> Result<(), ActivityError> {
        if let InboundSignal::ResponseWriteFailed(reason) = signal {
            warn!(
                transaction_id = ?self.chunk.as_ref().map(|chunk| &chunk.transaction_id),
                %reason,
                "Response write failed"
            );
        }
        Ok(())
    }

    fn abandon_chunk(
        &mut self,
        _signal: InboundSignal,
        _outbox: &mut Outbox<InboundSignal>,
    ) -> Result<(), ActivityError> {
        if let Some(chunk) = self.chunk.take() {
            warn!(transaction_id = %chunk.transaction_id, "Abandoning chunk");
        }
        Ok(())
    }

    fn drop_signal(
        &mut self,
        signal: InboundSignal,
        _outbox: &mut Outbox<InboundSignal>,
    ) -> Result<(), ActivityError> {
        debug!(?signal, "Dropping signal on closed receiver");
        Ok(())
    }
}

fn unexpected(signal: &InboundSignal) -> ActivityError {
    ActivityError::Protocol(format!("unexpected signal {signal:?}"))
}

/// A 200 REPORT covering everything received up to and including `piece`.
fn success_report(piece: &ChunkPiece) -> Report {
    let end = piece.byte_range.start.saturating_sub(1) + piece.body.len() as u64;
    let total = piece.byte_range.total.unwrap_or(end);
    Report {
        transaction_id: TransactionId::generate(),
        message_id: piece.message_id.clone(),
        to_path: piece.from_path.clone(),
        from_path: piece.to_path.clone(),
        byte_range: ByteRange::new(1, Some(total), Some(total)),
        status: StatusCode::OK,
    }
}

fn is_activate(signal: &InboundSignal, _: &InboundTransfer) -> bool {
    matches!(signal, InboundSignal::Activate)
}

fn is_close(signal: &InboundSignal, _: &InboundTransfer) -> bool {
    matches!(signal, InboundSignal::Close)
}

fn is_force_idle(signal: &InboundSignal, _: &InboundTransfer) -> bool {
    matches!(signal, InboundSignal::ForceIdle)
}

fn is_single_piece_chunk(signal: &InboundSignal, _: &InboundTransfer) -> bool {
    matches!(signal, InboundSignal::ChunkReceived(piece) if piece.ends_chunk())
}

fn is_chunk_head(signal: &InboundSignal, _: &InboundTransfer) -> bool {
    matches!(signal, InboundSignal::ChunkReceived(piece) if !piece.ends_chunk())
}

fn same_chunk(piece: &ChunkPiece, machine: &InboundTransfer) -> bool {
    machine
        .chunk
        .as_ref()
        .is_some_and(|chunk| chunk.transaction_id == piece.transaction_id)
}

fn is_chunk_body(signal: &InboundSignal, machine: &InboundTransfer) -> bool {
    matches!(signal, InboundSignal::ChunkReceived(piece)
        if !piece.ends_chunk() && same_chunk(piece, machine))
}

fn is_chunk_tail(signal: &InboundSignal, machine: &InboundTransfer) -> bool {
    matches!(signal, InboundSignal::ChunkReceived(piece)
        if piece.ends_chunk() && same_chunk(piece, machine))
}

fn is_send_response(signal: &InboundSignal, _: &InboundTransfer) -> bool {
    matches!(signal, InboundSignal::SendResponse)
}

fn is_response_written(signal: &InboundSignal, _: &InboundTransfer) -> bool {
    matches!(signal, InboundSignal::ResponseWritten)
}

fn is_response_failed(signal: &InboundSignal, _: &InboundTransfer) -> bool {
    matches!(signal, InboundSignal::ResponseWriteFailed(_))
}

fn is_write_completion(signal: &InboundSignal, _: &InboundTransfer) -> bool {
    matches!(
        signal,
        InboundSignal::ResponseWritten | InboundSignal::ResponseWriteFailed(_)
    )
}

fn any_signal(_: &InboundSignal, _: &InboundTransfer) -> bool {
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
            target: InboundState::$target,
            exception_state: $exception,
            activity: $activity,
        }
    };
}

static INACTIVE: [Transition<InboundTransfer>; 2] = [
    transition!("activate", is_activate, Idle),
    transition!("close", is_close, Closed),
];

static IDLE: [Transition<InboundTransfer>; 5] = [
    transition!(
        "chunk-single",
        is_single_piece_chunk,
        ResponsePending,
        InboundTransfer::begin_chunk
    ),
    transition!("chunk-head", is_chunk_head, Receiving, InboundTransfer::begin_chunk),
    transition!("stale-completion", is_write_completion, Idle),
    transition!("force-idle", is_force_idle, Idle),
    transition!("close", is_close, Closed),
];

static RECEIVING: [Transition<InboundTransfer>; 5] = [
    transition!("chunk-body", is_chunk_body, Receiving, InboundTransfer::continue_chunk),
    transition!("chunk-tail", is_chunk_tail, ResponsePending, InboundTransfer::continue_chunk),
    transition!("stale-completion", is_write_completion, Receiving),
    transition!("force-idle", is_force_idle, Idle, InboundTransfer::abandon_chunk),
    transition!("close", is_close, Closed),
];

static RESPONSE_PENDING: [Transition<InboundTransfer>; 3] = [
    transition!(
        "send-response",
        is_send_response,
        AwaitingWrite,
        Some(InboundState::Idle),
        InboundTransfer::write_response
    ),
    transition!("force-idle", is_force_idle, Idle, InboundTransfer::abandon_chunk),
    transition!("close", is_close, Closed),
];

static AWAITING_WRITE: [Transition<InboundTransfer>; 4] = [
    transition!("response-written", is_response_written, Idle, InboundTransfer::response_written),
    transition!(
        "response-write-failed",
        is_response_failed,
        Idle,
        InboundTransfer::response_failed
    ),
    transition!("force-idle", is_force_idle, Idle, InboundTransfer::abandon_chunk),
    transition!("close", is_close, Closed),
];

static CLOSED: [Transition<InboundTransfer>; 1] =
    [transition!("drop", any_signal, Closed, InboundTransfer::drop_signal)];

impl StateMachine for InboundTransfer {
    type State = InboundState;
    type Signal = InboundSignal;

    fn transitions(state: InboundState) -> &'static [Transition<Self>] {
        match state {
            InboundState::Inactive => &INACTIVE,
            InboundState::Idle => &IDLE,
            InboundState::Receiving => &RECEIVING,
            InboundState::ResponsePending => &RESPONSE_PENDING,
            InboundState::AwaitingWrite => &AWAITING_WRITE,
            InboundState::Closed => &CLOSED,
        }
    }

    fn is_blocking(state: InboundState) -> bool {
        matches!(
            state,
            InboundState::Inactive | InboundState::ResponsePending | InboundState::AwaitingWrite
        )
    }

    fn on_enter(&mut self, state: InboundState, reentry: bool, outbox: &mut Outbox<InboundSignal>) {
        if reentry {
            return;
        }
        match state {
            InboundState::Idle => self.chunk = None,
            InboundState::ResponsePending => outbox.signal(InboundSignal::SendResponse),
            InboundState::Closed => {
                self.chunk = None;
                self.reassembly.abort_all();
            }
            _ => {}
        }
    }

    fn queue_full_signal(&self, state: InboundState) -> Option<InboundSignal> {
        match state {
            InboundState::Inactive | InboundState::Closed => None,
            _ => Some(InboundSignal::ForceIdle),
        }
    }
}
