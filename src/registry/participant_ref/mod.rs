use std::{
    convert::Infallible,
    fmt,
    sync::Weak,
};

use self::error::ParticipantViewInvalid;
use crate::message::MsrpUri;
use crate::participant::Participant;
use crate::transport::FrameHandler;

pub mod error;

/// A weak reference to a registered [`Participant`] that provides a scoped [`view`](Self::view).
pub struct ParticipantRef {
    local: MsrpUri,
    weak_participant: Weak<Participant>,
}

impl ParticipantRef {
    pub(super) fn new(local: MsrpUri, weak_participant: Weak<Participant>) -> ParticipantRef {
        Self {
            local,
            weak_participant,
        }
    }

    pub fn local_uri(&self) -> &MsrpUri {
        &self.local
    }

    /// Scoped access via a `view_fn` to the participant.
    ///
    /// If the participant is still registered returns the value `R` computed from the
    /// `view_fn`, else returns a [`ParticipantViewInvalid`] error.
    pub fn view<F: FnOnce(&Participant) -> R, R>(
        &self,
        view_fn: F,
    ) -> Result<R, ParticipantViewInvalid> {
        Weak::upgrade(&self.weak_participant)
            .map(|participant| view_fn(&participant))
            .ok_or(ParticipantViewInvalid {
                local: self.local.clone(),
            })
    }

    /// Handler to attach to the participant's transport.
    pub fn frame_handler(&self) -> Weak<dyn FrameHandler> {
        self.weak_participant.clone()
    }
}

#[expect(clippy::missing_fields_in_debug, reason = "custom weak handling")]
impl fmt::Debug for ParticipantRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.view(|participant| {
            f.debug_struct("ParticipantRef")
                .field("local", &self.local)
                .field("participant", &Ok::<_, Infallible>(participant))
                .finish()
        })
        .unwrap_or_else(|err| {
            f.debug_struct("ParticipantRef")
                .field("local", &self.local)
                .field("participant", &Err::<Infallible, _>(err))
                .finish()
        })
    }
}

impl Clone for ParticipantRef {
    fn clone(&self) -> Self {
        Self {
            local: self.local.clone(),
            weak_participant: self.weak_participant.clone(),
        }
    }
}

/// A [`ParticipantRef`] is defined only by its local URI.
impl PartialEq<MsrpUri> for ParticipantRef {
    fn eq(&self, other: &MsrpUri) -> bool {
        self.local == *other
    }
}

/// A [`ParticipantRef`] is defined only by its local URI.
impl PartialEq<ParticipantRef> for MsrpUri {
    fn eq(&self, other: &ParticipantRef) -> bool {
        *self == other.local
    }
}
