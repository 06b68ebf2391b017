//! An MSRP session endpoint: one lifecycle machine and two transfer machines sharing a
//! connection, an application, and a local/remote path pair.

pub mod error;

use std::fmt;
use std::sync::Arc;

use tokio::runtime::Handle;
use tracing::{debug, warn};

pub use error::ParticipantError;

use crate::application::MsrpApplication;
use crate::config::MsrpConfig;
use crate::ids::MessageId;
use crate::message::{Frame, MsrpUri};
use crate::reassembly::ReassemblyTable;
use crate::state_machine::Machine;
use crate::state_machine::inbound::{InboundSignal, InboundState, InboundTransfer};
use crate::state_machine::lifecycle::{ConnectionLifecycle, LifecycleSignal, LifecycleState};
use crate::state_machine::outbound::{
    OutboundSignal, OutboundState, OutboundTransfer, OutgoingMessage,
};
use crate::transport::{FrameHandler, Role, Transport};

/// The two ends of a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionPaths {
    pub local: MsrpUri,
    pub remote: MsrpUri,
}

/// What every machine of one participant shares.
pub struct SessionContext {
    pub paths: SessionPaths,
    pub transport: Arc<dyn Transport>,
    pub app: Arc<dyn MsrpApplication>,
    pub config: MsrpConfig,
    /// Runs the reassembly and response timers.
    pub runtime: Handle,
}

impl fmt::Debug for SessionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionContext")
            .field("paths", &self.paths)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

pub struct Participant {
    session: Arc<SessionContext>,
    lifecycle: Arc<Machine<ConnectionLifecycle>>,
    inbound: Arc<Machine<InboundTransfer>>,
    outbound: Arc<Machine<OutboundTransfer>>,
    reassembly: Arc<ReassemblyTable>,
}

impl Participant {
    pub fn new(
        paths: SessionPaths,
        transport: Arc<dyn Transport>,
        app: Arc<dyn MsrpApplication>,
        config: MsrpConfig,
        runtime: Handle,
    ) -> Arc<Self> {
        Self::with_close_hook(paths, transport, app, config, runtime, None)
    }

    /// Like [`new`](Self::new), running `on_closed` once the lifecycle terminates.
    pub(crate) fn with_close_hook(
        paths: SessionPaths,
        transport: Arc<dyn Transport>,
        app: Arc<dyn MsrpApplication>,
        config: MsrpConfig,
        runtime: Handle,
        on_closed: Option<Box<dyn FnOnce() + Send>>,
    ) -> Arc<Self> {
        let machine_config = config.machine_config();
        let local = paths.local.session_id().to_string();
        let session = Arc::new(SessionContext {
            paths,
            transport,
            app,
            config,
            runtime,
        });

        let reassembly = ReassemblyTable::new(
            Arc::clone(&session.app),
            session.runtime.clone(),
            &session.config,
        );
        let inbound = Machine::new_cyclic(
            format!("{local}/inbound"),
            InboundState::Inactive,
            machine_config.clone(),
            |machine| InboundTransfer::new(Arc::clone(&session), Arc::clone(&reassembly), machine),
        );
        let outbound = Machine::new_cyclic(
            format!("{local}/outbound"),
            OutboundState::AwaitingConnection,
            machine_config.clone(),
            |machine| OutboundTransfer::new(Arc::clone(&session), machine),
        );
        let lifecycle = Machine::new_cyclic(
            format!("{local}/lifecycle"),
            LifecycleState::Idle,
            machine_config,
            |machine| {
                ConnectionLifecycle::new(
                    Arc::clone(&session),
                    machine,
                    Arc::downgrade(&inbound),
                    Arc::downgrade(&outbound),
                    on_closed,
                )
            },
        );

        Arc::new(Self {
            session,
            lifecycle,
            inbound,
            outbound,
            reassembly,
        })
    }

    pub fn paths(&self) -> &SessionPaths {
        &self.session.paths
    }

    pub fn local_uri(&self) -> &MsrpUri {
        &self.session.paths.local
    }

    pub fn remote_uri(&self) -> &MsrpUri {
        &self.session.paths.remote
    }

    pub fn state(&self) -> LifecycleState {
        self.lifecycle.state()
    }

    pub fn inbound_state(&self) -> InboundState {
        self.inbound.state()
    }

    pub fn outbound_state(&self) -> OutboundState {
        self.outbound.state()
    }

    /// Incoming messages currently being reassembled.
    pub fn incoming_messages(&self) -> usize {
        self.reassembly.len()
    }

    /// Connect (or accept) the transport and bind the session.
    pub fn open(&self, role: Role) -> Result<(), ParticipantError> {
        self.lifecycle
            .input_timeout(LifecycleSignal::Open(role), self.session.config.control_wait)?;
        Ok(())
    }

    /// Queue `message` for sending. Messages are sent one after another in queue order.
    pub fn send_message(&self, message: OutgoingMessage) -> Result<MessageId, ParticipantError> {
        if self.outbound.state() == OutboundState::Closed {
            return Err(ParticipantError::Closed {
                local: self.session.paths.local.clone(),
            });
        }

        let message_id = message.message_id.clone();
        self.outbound.input_timeout(
            OutboundSignal::SendMessage(message),
            self.session.config.control_wait,
        )?;
        Ok(message_id)
    }

    /// Abort a queued or in-progress message. The outcome is reported through
    /// [`MsrpApplication::message_failed`].
    pub fn abort_message(&self, message_id: &MessageId) -> Result<(), ParticipantError> {
        self.outbound.input_timeout(
            OutboundSignal::AbortMessage(message_id.clone()),
            self.session.config.control_wait,
        )?;
        Ok(())
    }

    pub fn close(&self) -> Result<(), ParticipantError> {
        self.lifecycle
            .input_timeout(LifecycleSignal::Close, self.session.config.control_wait)?;
        Ok(())
    }

    /// Route one parsed frame to the machine responsible for it.
    pub fn data_received(&self, frame: Frame) -> Result<(), ParticipantError> {
        let config = &self.session.config;
        match frame {
            Frame::Send(piece) => {
                if matches!(
                    self.lifecycle.state(),
                    LifecycleState::Connecting | LifecycleState::Binding
                ) {
                    self.lifecycle
                        .input_timeout(LifecycleSignal::BindRequest, config.control_wait)?;
                }
                self.inbound
                    .input_with(InboundSignal::ChunkReceived(piece), config.chunk_wait)?;
            }
            Frame::Response(response) => {
                if self.lifecycle.state() == LifecycleState::Binding {
                    self.lifecycle.input_timeout(
                        LifecycleSignal::BindResponse(response),
                        config.control_wait,
                    )?;
                } else {
                    self.outbound.input_timeout(
                        OutboundSignal::ResponseReceived(response),
                        config.control_wait,
                    )?;
                }
            }
            Frame::Report(report) => {
                self.outbound
                    .input_timeout(OutboundSignal::ReportReceived(report), config.control_wait)?;
            }
        }
        Ok(())
    }

    /// The transport went away underneath the session.
    pub fn transport_closed(&self) -> Result<(), ParticipantError> {
        self.lifecycle.input_timeout(
            LifecycleSignal::TransportClosed,
            self.session.config.control_wait,
        )?;
        Ok(())
    }
}

impl FrameHandler for Participant {
    fn frame_received(&self, frame: Frame) {
        match self.data_received(frame) {
            Ok(()) => {}
            Err(err) if err.is_deferred() => {
                debug!(local = %self.local_uri(), error = %err, "Frame deferred");
            }
            Err(err) => warn!(local = %self.local_uri(), error = %err, "Frame not handled"),
        }
    }

    fn transport_closed(&self) {
        if let Err(err) = Participant::transport_closed(self) {
            warn!(local = %self.local_uri(), error = %err, "Transport close not handled");
        }
    }
}

impl fmt::Debug for Participant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Participant")
            .field("paths", &self.session.paths)
            .field("lifecycle", &self.lifecycle)
            .field("inbound", &self.inbound)
            .field("outbound", &self.outbound)
            .finish()
    }
}
