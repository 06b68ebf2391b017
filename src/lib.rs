//! MSRP chunked message transfer driven by small cooperating state machines.
//!
//! A [`Participant`] is one end of an MSRP session. It owns a connection lifecycle machine and
//! two transfer machines (receive and send) built on the kernel in [`state_machine`], and talks
//! to the network through a [`Transport`] and to its owner through an [`MsrpApplication`].

pub mod application;
pub mod config;
pub mod cpim;
pub mod ids;
pub mod message;
pub mod participant;
pub mod reassembly;
pub mod registry;
pub mod sequencer;
pub mod state_machine;
pub mod store;
pub mod timer;
pub mod transport;

#[cfg(test)]
mod testing;

pub use application::{MsrpApplication, SendFailure};
pub use config::MsrpConfig;
pub use ids::{MessageId, SessionId, TransactionId};
pub use message::{
    ByteRange, ChunkPiece, Continuation, Frame, MsrpUri, Report, Response, StatusCode,
};
pub use participant::{Participant, ParticipantError, SessionPaths};
pub use registry::{ParticipantRegistry, participant_ref::ParticipantRef};
pub use state_machine::outbound::OutgoingMessage;
pub use transport::{LoopbackTransport, Role, Transport};
