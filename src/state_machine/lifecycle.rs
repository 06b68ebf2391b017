//! Connection lifecycle of a participant: open, bind, establish, close.
//!
//! The active side opens the transport and binds it with an empty SEND; the passive side is
//! bound by the first SEND it receives. Entering [`LifecycleState::Established`] activates both
//! transfer machines, and closing takes them down together with the transport.

use std::fmt;
use std::sync::{Arc, Weak};

use bytes::Bytes;
use tracing::{debug, info, warn};

use super::inbound::{InboundSignal, InboundTransfer};
use super::outbound::{OutboundSignal, OutboundTransfer};
use super::{ActivityError, Machine, Outbox, StateMachine, Transition, no_activity};
use crate::ids::{MessageId, TransactionId};
use crate::message::{ByteRange, ChunkPiece, ChunkType, Continuation, Frame, Response};
use crate::participant::SessionContext;
use crate::transport::{Completion, Role};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Idle,
    Connecting,
    /// Connected; waiting for the bind exchange.
    Binding,
    Established,
    /// Waiting for the transport to close.
    Closing,
    Closed,
}

#[derive(Debug)]
pub enum LifecycleSignal {
    Open(Role),
    TransportConnected,
    TransportFailed(String),
    /// The peer's first SEND arrived.
    BindRequest,
    BindResponse(Response),
    Close,
    TransportClosed,
}

pub struct ConnectionLifecycle {
    session: Arc<SessionContext>,
    machine: Weak<Machine<ConnectionLifecycle>>,
    inbound: Weak<Machine<InboundTransfer>>,
    outbound: Weak<Machine<OutboundTransfer>>,
    role: Option<Role>,
    bind_transaction: Option<TransactionId>,
    on_closed: Option<Box<dyn FnOnce() + Send>>,
}

impl ConnectionLifecycle {
    pub fn new(
        session: Arc<SessionContext>,
        machine: Weak<Machine<ConnectionLifecycle>>,
        inbound: Weak<Machine<InboundTransfer>>,
        outbound: Weak<Machine<OutboundTransfer>>,
        on_closed: Option<Box<dyn FnOnce() + Send>>,
    ) -> Self {
        Self {
            session,
            machine,
            inbound,
            outbound,
            role: None,
            bind_transaction: None,
            on_closed,
        }
    }

    pub fn role(&self) -> Option<Role> {
        self.role
    }

    /// Completion that feeds the outcome of a transport request back into this machine.
    fn completion(
        &self,
        on_success: Option<LifecycleSignal>,
        on_failure: fn(String) -> LifecycleSignal,
    ) -> Completion {
        let machine = self.machine.clone();
        Box::new(move |result| {
            let signal = match result {
                Ok(()) => on_success,
                Err(err) => Some(on_failure(err.to_string())),
            };
            if let Some(signal) = signal
                && let Some(machine) = machine.upgrade()
                && let Err(err) = machine.input(signal)
            {
                warn!(error = %err, "Transport completion not delivered");
            }
        })
    }

    fn open(
        &mut self,
        signal: LifecycleSignal,
        _outbox: &mut Outbox<LifecycleSignal>,
    ) -> Result<(), ActivityError> {
        let role = match signal {
            LifecycleSignal::Open(role) => role,
            signal => return Err(ActivityError::Protocol(format!("unexpected signal {signal:?}"))),
        };
        info!(
            local = %self.session.paths.local,
            remote = %self.session.paths.remote,
            %role,
            "Opening connection"
        );

        self.role = Some(role);
        let done = self.completion(
            Some(LifecycleSignal::TransportConnected),
            LifecycleSignal::TransportFailed,
        );
        self.session
            .transport
            .open(role, &self.session.paths.remote, done);
        Ok(())
    }

    fn send_bind(
        &mut self,
        _signal: LifecycleSignal,
        _outbox: &mut Outbox<LifecycleSignal>,
    ) -> Result<(), ActivityError> {
        let transaction_id = TransactionId::generate();
        let bind = ChunkPiece {
            transaction_id: transaction_id.clone(),
            message_id: MessageId::generate(),
            to_path: self.session.paths.remote.clone(),
            from_path: self.session.paths.local.clone(),
            byte_range: ByteRange::new(1, Some(0), Some(0)),
            continuation: Continuation::Done,
            chunk_type: ChunkType::Complete,
            content_type: None,
            header_len: 0,
            success_report: false,
            failure_report: false,
            body: Bytes::new(),
        };
        debug!(%transaction_id, "Sending bind request");

        self.bind_transaction = Some(transaction_id);
        let done = self.completion(None, LifecycleSignal::TransportFailed);
        self.session.transport.write(Frame::Send(bind), done)?;
        Ok(())
    }

    fn log_failure(
        &mut self,
        signal: LifecycleSignal,
        _outbox: &mut Outbox<LifecycleSignal>,
    ) -> Result<(), ActivityError> {
        match signal {
            LifecycleSignal::TransportFailed(reason) => {
                warn!(remote = %self.session.paths.remote, %reason, "Transport failed");
            }
            LifecycleSignal::BindResponse(response) => {
                warn!(
                    remote = %self.session.paths.remote,
                    status = %response.status,
                    "Bind rejected"
                );
            }
            signal => debug!(?signal, "Connection failed"),
        }
        Ok(())
    }

    fn ignore(
        &mut self,
        signal: LifecycleSignal,
        _outbox: &mut Outbox<LifecycleSignal>,
    ) -> Result<(), ActivityError> {
        debug!(?signal, "Ignoring lifecycle signal");
        Ok(())
    }

    fn close_transfers(&self) {
        let wait = self.session.config.control_wait;
        if let Some(inbound) = self.inbound.upgrade()
            && let Err(err) = inbound.input_timeout(InboundSignal::Close, wait)
        {
            warn!(error = %err, "Closing inbound transfer failed");
        }
        if let Some(outbound) = self.outbound.upgrade()
            && let Err(err) = outbound.input_timeout(OutboundSignal::Close, wait)
        {
            warn!(error = %err, "Closing outbound transfer failed");
        }
    }

    fn established(&self) {
        info!(local = %self.session.paths.local, role = ?self.role, "Connection established");
        let wait = self.session.config.control_wait;
        if let Some(inbound) = self.inbound.upgrade()
            && let Err(err) = inbound.input_timeout(InboundSignal::Activate, wait)
        {
            warn!(error = %err, "Activating inbound transfer failed");
        }
        if let Some(outbound) = self.outbound.upgrade()
            && let Err(err) = outbound.input_timeout(OutboundSignal::ConnectionReady, wait)
        {
            warn!(error = %err, "Readying outbound transfer failed");
        }
        self.session
            .app
            .connection_established(&self.session.paths.local);
    }
}

impl fmt::Debug for ConnectionLifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionLifecycle")
            .field("local", &self.session.paths.local)
            .field("role", &self.role)
            .field("bind_transaction", &self.bind_transaction)
            .finish_non_exhaustive()
    }
}

fn is_open(signal: &LifecycleSignal, _: &ConnectionLifecycle) -> bool {
    matches!(signal, LifecycleSignal::Open(_))
}

fn is_connected_active(signal: &LifecycleSignal, machine: &ConnectionLifecycle) -> bool {
    matches!(signal, LifecycleSignal::TransportConnected) && machine.role == Some(Role::Active)
}

fn is_connected(signal: &LifecycleSignal, _: &ConnectionLifecycle) -> bool {
    matches!(signal, LifecycleSignal::TransportConnected)
}

fn is_transport_failed(signal: &LifecycleSignal, _: &ConnectionLifecycle) -> bool {
    matches!(signal, LifecycleSignal::TransportFailed(_))
}

fn answers_bind(response: &Response, machine: &ConnectionLifecycle) -> bool {
    machine.bind_transaction.as_ref() == Some(&response.transaction_id)
}

fn is_bind_accepted(signal: &LifecycleSignal, machine: &ConnectionLifecycle) -> bool {
    matches!(signal, LifecycleSignal::BindResponse(response)
        if response.status.is_success() && answers_bind(response, machine))
}

fn is_bind_rejected(signal: &LifecycleSignal, machine: &ConnectionLifecycle) -> bool {
    matches!(signal, LifecycleSignal::BindResponse(response)
        if !response.status.is_success() && answers_bind(response, machine))
}

fn is_bind_request(signal: &LifecycleSignal, _: &ConnectionLifecycle) -> bool {
    matches!(signal, LifecycleSignal::BindRequest)
}

fn is_bind_traffic(signal: &LifecycleSignal, _: &ConnectionLifecycle) -> bool {
    matches!(
        signal,
        LifecycleSignal::BindRequest | LifecycleSignal::BindResponse(_)
    )
}

fn is_close(signal: &LifecycleSignal, _: &ConnectionLifecycle) -> bool {
    matches!(signal, LifecycleSignal::Close)
}

fn is_transport_closed(signal: &LifecycleSignal, _: &ConnectionLifecycle) -> bool {
    matches!(signal, LifecycleSignal::TransportClosed)
}

fn any_signal(_: &LifecycleSignal, _: &ConnectionLifecycle) -> bool {
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
            target: LifecycleState::$target,
            exception_state: $exception,
            activity: $activity,
        }
    };
}

static IDLE: [Transition<ConnectionLifecycle>; 2] = [
    transition!(
        "open",
        is_open,
        Connecting,
        Some(LifecycleState::Closed),
        ConnectionLifecycle::open
    ),
    transition!("close", is_close, Closed),
];

static CONNECTING: [Transition<ConnectionLifecycle>; 5] = [
    transition!(
        "connected-active",
        is_connected_active,
        Binding,
        Some(LifecycleState::Closing),
        ConnectionLifecycle::send_bind
    ),
    transition!("connected-passive", is_connected, Binding),
    transition!("connect-failed", is_transport_failed, Closed, ConnectionLifecycle::log_failure),
    transition!("close", is_close, Closing),
    transition!("transport-closed", is_transport_closed, Closed),
];

static BINDING: [Transition<ConnectionLifecycle>; 6] = [
    transition!("bind-accepted", is_bind_accepted, Established),
    transition!("bind-rejected", is_bind_rejected, Closing, ConnectionLifecycle::log_failure),
    transition!("bind-request", is_bind_request, Established),
    transition!("transport-failed", is_transport_failed, Closing, ConnectionLifecycle::log_failure),
    transition!("close", is_close, Closing),
    transition!("transport-closed", is_transport_closed, Closed),
];

static ESTABLISHED: [Transition<ConnectionLifecycle>; 4] = [
    transition!("close", is_close, Closing),
    transition!("transport-closed", is_transport_closed, Closed),
    transition!("transport-failed", is_transport_failed, Closing, ConnectionLifecycle::log_failure),
    transition!("keep-alive", is_bind_traffic, Established),
];

static CLOSING: [Transition<ConnectionLifecycle>; 2] = [
    transition!("transport-closed", is_transport_closed, Closed),
    transition!("ignore", any_signal, Closing, ConnectionLifecycle::ignore),
];

static CLOSED: [Transition<ConnectionLifecycle>; 1] =
    [transition!("drop", any_signal, Closed, ConnectionLifecycle::ignore)];

impl StateMachine for ConnectionLifecycle {
    type State = LifecycleState;
    type Signal = LifecycleSignal;

    fn transitions(state: LifecycleState) -> &'static [Transition<Self>] {
        match state {
            LifecycleState::Idle => &IDLE,
            LifecycleState::Connecting => &CONNECTING,
            LifecycleState::Binding => &BINDING,
            LifecycleState::Established => &ESTABLISHED,
            LifecycleState::Closing => &CLOSING,
            LifecycleState::Closed => &CLOSED,
        }
    }

    /// A bind SEND racing the connect completion waits for `Binding`.
    fn is_blocking(state: LifecycleState) -> bool {
        state == LifecycleState::Connecting
    }

    fn on_enter(
        &mut self,
        state: LifecycleState,
        reentry: bool,
        _outbox: &mut Outbox<LifecycleSignal>,
    ) {
        if reentry {
            return;
        }
        match state {
            LifecycleState::Established => self.established(),
            LifecycleState::Closing => {
                self.close_transfers();
                let done = self.completion(
                    Some(LifecycleSignal::TransportClosed),
                    |_| LifecycleSignal::TransportClosed,
                );
                self.session.transport.close(done);
            }
            LifecycleState::Closed => {
                self.close_transfers();
                info!(local = %self.session.paths.local, "Connection closed");
                if let Some(on_closed) = self.on_closed.take() {
                    on_closed();
                }
                self.session.app.connection_closed(&self.session.paths.local);
            }
            _ => {}
        }
    }
}
