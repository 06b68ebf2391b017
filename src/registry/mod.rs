use std::sync::{Arc, OnceLock, Weak};

use dashmap::{DashMap, Entry};
use tokio::runtime::Handle;
use tracing::{debug, info};

use self::{
    error::{ParticipantAlreadyPresent, ParticipantNotFound},
    participant_ref::ParticipantRef,
};
use crate::application::MsrpApplication;
use crate::config::MsrpConfig;
use crate::ids::SessionId;
use crate::message::{MsrpUri, UriError};
use crate::participant::{Participant, SessionPaths};
use crate::transport::Transport;

pub mod error;
pub mod participant_ref;

/// The participants of one process, keyed by their local MSRP URI.
///
/// Participants added to the registry become shared resources for which only references can be
/// obtained through the [`ParticipantRef`] interface. A participant unregisters itself once its
/// lifecycle reaches `Closed`.
///
/// Direct access to the strong reference is not allowed in order to prevent long lived upgrades
/// undermining lifecycle control from the [`ParticipantRegistry`].
#[derive(Debug)]
pub struct ParticipantRegistry {
    host: String,
    port: u16,
    config: MsrpConfig,
    runtime: Handle,
    participants: DashMap<MsrpUri, Arc<Participant>, ahash::RandomState>,
    this: Weak<ParticipantRegistry>,
}

impl ParticipantRegistry {
    /// Construct an empty registry allocating local URIs on `host:port`.
    pub fn new(
        host: impl Into<String>,
        port: u16,
        config: MsrpConfig,
        runtime: Handle,
    ) -> Arc<ParticipantRegistry> {
        let host = host.into();
        Arc::new_cyclic(|this| Self {
            host,
            port,
            config,
            runtime,
            participants: DashMap::default(),
            this: this.clone(),
        })
    }

    pub fn len(&self) -> usize {
        self.participants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.participants.is_empty()
    }

    /// Create a participant talking to `remote` under a fresh local URI.
    ///
    /// Session ids are drawn at random until one is free; the check and the insert are atomic.
    pub fn create_participant(
        &self,
        remote: MsrpUri,
        transport: Arc<dyn Transport>,
        app: Arc<dyn MsrpApplication>,
    ) -> Result<ParticipantRef, UriError> {
        loop {
            let local = MsrpUri::new(&self.host, self.port, &SessionId::generate())?;
            match self.participants.entry(local) {
                Entry::Occupied(entry) => {
                    debug!(local = %entry.key(), "Session id collision, drawing another");
                }
                Entry::Vacant(slot) => {
                    let paths = SessionPaths {
                        local: slot.key().clone(),
                        remote,
                    };
                    let participant = self.build(paths, transport, app);
                    let participant_ref = Self::reference(&participant);
                    slot.insert(participant);
                    return Ok(participant_ref);
                }
            }
        }
    }

    /// Create a participant under a local URI chosen by the caller, e.g. one already
    /// advertised through signaling.
    pub fn create_participant_at(
        &self,
        paths: SessionPaths,
        transport: Arc<dyn Transport>,
        app: Arc<dyn MsrpApplication>,
    ) -> Result<ParticipantRef, ParticipantAlreadyPresent> {
        match self.participants.entry(paths.local.clone()) {
            Entry::Occupied(entry) => Err(ParticipantAlreadyPresent {
                local: entry.key().clone(),
            }),

            Entry::Vacant(slot) => {
                let participant = self.build(paths, transport, app);
                let participant_ref = Self::reference(&participant);
                slot.insert(participant);
                Ok(participant_ref)
            }
        }
    }

    /// Remove the participant registered under `local`.
    pub fn remove_participant(&self, local: &MsrpUri) -> Result<(), ParticipantNotFound> {
        self.participants
            .remove(local)
            .ok_or_else(|| ParticipantNotFound {
                local: local.clone(),
            })?;

        Ok(())
    }

    /// Lend the participant registered under `local`.
    pub fn get_participant(&self, local: &MsrpUri) -> Result<ParticipantRef, ParticipantNotFound> {
        self.participants
            .view(local, |_, participant| Self::reference(participant))
            .ok_or_else(|| ParticipantNotFound {
                local: local.clone(),
            })
    }

    /// Look a participant up by the path a frame was addressed to.
    pub fn find_by_uri(&self, to_path: &str) -> Option<ParticipantRef> {
        let local = to_path.parse::<MsrpUri>().ok()?;
        self.get_participant(&local).ok()
    }

    fn reference(participant: &Arc<Participant>) -> ParticipantRef {
        ParticipantRef::new(participant.local_uri().clone(), Arc::downgrade(participant))
    }

    fn build(
        &self,
        paths: SessionPaths,
        transport: Arc<dyn Transport>,
        app: Arc<dyn MsrpApplication>,
    ) -> Arc<Participant> {
        let registry = self.this.clone();
        let local = paths.local.clone();
        let instance: Arc<OnceLock<Weak<Participant>>> = Arc::new(OnceLock::new());
        let closing = Arc::clone(&instance);

        let on_closed = Box::new(move || {
            let Some(registry) = registry.upgrade() else {
                return;
            };
            // Only the instance that closed may unregister; the URI may have been reused.
            let removed = registry.participants.remove_if(&local, |_, participant| {
                closing
                    .get()
                    .is_some_and(|weak| std::ptr::eq(weak.as_ptr(), Arc::as_ptr(participant)))
            });
            if removed.is_some() {
                info!(%local, "Participant unregistered");
            }
        });

        let participant = Participant::with_close_hook(
            paths,
            transport,
            app,
            self.config.clone(),
            self.runtime.clone(),
            Some(on_closed),
        );
        // Filled exactly once, here; the hook only reads it.
        instance.get_or_init(|| Arc::downgrade(&participant));
        participant
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state_machine::lifecycle::LifecycleState;
    use crate::testing::{self, MockTransport, TestApp};
    use crate::transport::Role;

    fn registry() -> Arc<ParticipantRegistry> {
        ParticipantRegistry::new("127.0.0.1", 2855, MsrpConfig::default(), Handle::current())
    }

    fn deps() -> (Arc<MockTransport>, Arc<dyn Transport>, Arc<dyn MsrpApplication>) {
        let transport = Arc::new(MockTransport::default());
        let app: Arc<dyn MsrpApplication> = Arc::new(TestApp::default());
        (Arc::clone(&transport), transport as Arc<dyn Transport>, app)
    }

    #[tokio::test]
    async fn test_create_allocates_distinct_uris() {
        let registry = registry();
        let (_, transport, app) = deps();

        let first = registry
            .create_participant(testing::uri("remote"), Arc::clone(&transport), Arc::clone(&app))
            .unwrap();
        let second = registry
            .create_participant(testing::uri("remote"), transport, app)
            .unwrap();

        assert_eq!(registry.len(), 2);
        assert_ne!(first.local_uri(), second.local_uri());
        assert_eq!(first.local_uri().host(), "127.0.0.1");
        assert_eq!(first.local_uri().session_id().len(), 16);

        let found = registry.find_by_uri(first.local_uri().as_str()).unwrap();
        assert!(found == *first.local_uri());
    }

    #[tokio::test]
    async fn test_create_at_rejects_duplicates() {
        let registry = registry();
        let (_, transport, app) = deps();

        registry
            .create_participant_at(testing::paths(), Arc::clone(&transport), Arc::clone(&app))
            .unwrap();
        let err = registry
            .create_participant_at(testing::paths(), transport, app)
            .unwrap_err();
        assert_eq!(err.local, testing::uri("local"));
    }

    #[tokio::test]
    async fn test_removed_participant_view_is_invalid() {
        let registry = registry();
        let (_, transport, app) = deps();
        let participant_ref = registry
            .create_participant_at(testing::paths(), transport, app)
            .unwrap();

        let state = participant_ref.view(Participant::state).unwrap();
        assert_eq!(state, LifecycleState::Idle);

        registry.remove_participant(&testing::uri("local")).unwrap();
        assert!(participant_ref.view(Participant::state).is_err());
        assert!(participant_ref.frame_handler().upgrade().is_none());
        assert!(registry.get_participant(&testing::uri("local")).is_err());
        assert!(registry.remove_participant(&testing::uri("local")).is_err());
    }

    #[tokio::test]
    async fn test_closed_participant_unregisters() {
        let registry = registry();
        let (mock, transport, app) = deps();
        let participant_ref = registry
            .create_participant_at(testing::paths(), transport, app)
            .unwrap();

        participant_ref
            .view(|participant| participant.open(Role::Active))
            .unwrap()
            .unwrap();
        mock.complete_next(Err(crate::transport::TransportError::Io("refused".to_string())));

        assert!(registry.is_empty());
        assert!(registry.find_by_uri(testing::uri("local").as_str()).is_none());
    }
}
