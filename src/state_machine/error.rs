use std::time::Duration;

use crate::transport::TransportError;

/// Errors raised to the caller of [`Machine::input`](super::Machine::input).
#[derive(Debug, thiserror::Error)]
pub enum MachineError {
    /// No transition of a non-blocking state accepts the signal. The state is unchanged.
    #[error("no transition from state {state} accepts {signal}")]
    Unhandled { state: String, signal: String },

    /// A blocking state did not admit the signal in time. The signal was deferred.
    #[error("timed out after {waited:?} waiting in state {state} to accept {signal}")]
    WaitTimeout {
        state: String,
        signal: String,
        waited: Duration,
    },

    /// The activity of a transition failed. The machine is in the exception state, if any.
    #[error("transition '{transition}' failed")]
    Activity {
        transition: &'static str,
        #[source]
        source: ActivityError,
    },

    /// A delivery timed out with a full deferred queue and was dropped after the fallback ran.
    #[error("signal queue limit of {limit} reached in state {state}; {signal} dropped")]
    QueueLimitReached {
        limit: usize,
        state: String,
        signal: String,
        fallback: Option<&'static str>,
    },

    /// The wait was cut short by [`Machine::interrupt`](super::Machine::interrupt).
    #[error("wait interrupted in state {state}")]
    Interrupted { state: String },

    /// A previous transition panicked and the machine data was lost.
    #[error("machine poisoned by a panicking transition")]
    Poisoned,
}

impl MachineError {
    pub fn is_wait_timeout(&self) -> bool {
        matches!(self, MachineError::WaitTimeout { .. })
    }

    /// Failures of transition code, including the forced queue-limit fallback.
    pub fn is_activity_failure(&self) -> bool {
        matches!(
            self,
            MachineError::Activity { .. } | MachineError::QueueLimitReached { .. }
        )
    }
}

/// Failures raised by transition activities.
#[derive(Debug, thiserror::Error)]
pub enum ActivityError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("reading message content failed")]
    Content(#[from] std::io::Error),

    #[error("sequencer: {0}")]
    Sequencer(#[from] crate::sequencer::SequencerError),

    #[error("{0}")]
    Protocol(String),
}
