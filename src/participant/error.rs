use crate::message::MsrpUri;
use crate::state_machine::MachineError;

#[derive(Debug, thiserror::Error)]
pub enum ParticipantError {
    #[error(transparent)]
    Machine(#[from] MachineError),

    /// The participant's connection was closed; nothing more can be sent.
    #[error("participant {local} is closed")]
    Closed { local: MsrpUri },
}

impl ParticipantError {
    /// Whether the signal was queued rather than refused.
    pub fn is_deferred(&self) -> bool {
        matches!(self, ParticipantError::Machine(err) if err.is_wait_timeout())
    }
}
