//! The duplex channel a participant writes frames to and receives frames from.
//!
//! The crate never touches sockets: a [`Transport`] implementation owns the connection and
//! reports completion of each request through a [`Completion`] callback, and hands parsed frames
//! to a [`FrameHandler`].

pub mod loopback;

use std::fmt;

use thiserror::Error;

use crate::message::{Frame, MsrpUri};

pub use loopback::LoopbackTransport;

/// Which side of the connection a participant is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Connects and sends the first (bind) SEND.
    Active,
    /// Accepts the connection and waits for the peer's bind SEND.
    Passive,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Active => f.write_str("active"),
            Role::Passive => f.write_str("passive"),
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("transport is not connected")]
    NotConnected,

    #[error("transport is closed")]
    Closed,

    #[error("transport io: {0}")]
    Io(String),
}

/// Called exactly once when a transport request finishes. Must not be invoked from within the
/// call that accepted it.
pub type Completion = Box<dyn FnOnce(Result<(), TransportError>) + Send>;

pub trait Transport: Send + Sync + 'static {
    /// Connect (or accept) towards `remote`.
    fn open(&self, role: Role, remote: &MsrpUri, done: Completion);

    /// Queue `frame` for writing. An `Err` means the frame was refused and `done` is dropped.
    fn write(&self, frame: Frame, done: Completion) -> Result<(), TransportError>;

    fn close(&self, done: Completion);
}

/// Receiver of everything the transport reads.
pub trait FrameHandler: Send + Sync + 'static {
    fn frame_received(&self, frame: Frame);

    /// The peer closed the connection, or it broke.
    fn transport_closed(&self);
}
