use crate::message::MsrpUri;

/// Indicates that an operation to create a participant failed because one already exists.
#[derive(Debug, thiserror::Error)]
#[error("a participant for {local} is already present")]
pub struct ParticipantAlreadyPresent {
    pub local: MsrpUri,
}

/// Indicates that an operation to retrieve a participant failed because it doesn't exist.
#[derive(Debug, thiserror::Error)]
#[error("no participant for {local} could be found")]
pub struct ParticipantNotFound {
    pub local: MsrpUri,
}
