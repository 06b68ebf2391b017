use crate::message::MsrpUri;

/// Indicates that an operation to view a weakly held participant failed because the registry
/// has already let go of it.
#[derive(Debug, thiserror::Error)]
#[error("the participant ({local}) is no longer valid")]
pub struct ParticipantViewInvalid {
    pub local: MsrpUri,
}
