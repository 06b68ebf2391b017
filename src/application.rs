use crate::cpim::MessageMetadata;
use crate::ids::MessageId;
use crate::message::{ChunkPiece, MsrpUri, Report, StatusCode};
use crate::participant::SessionPaths;
use crate::store::{ContentStore, default_store};

/// Why an outbound message did not make it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendFailure {
    /// The application aborted the transfer.
    Aborted,
    /// The remote answered a chunk with a non-2xx status.
    Rejected(StatusCode),
    /// A chunk was never answered.
    TimedOut,
    /// The transport failed to write a piece.
    Transport(String),
    /// The session closed before the message completed.
    SessionClosed,
}

/// The consumer of a participant: decides on incoming requests and receives notifications.
///
/// Callbacks run on whichever thread drives the participant's machines and must not block on
/// the same participant.
pub trait MsrpApplication: Send + Sync + 'static {
    /// Decide the response to the first piece of an incoming chunk.
    fn request_received(&self, _session: &SessionPaths, _chunk: &ChunkPiece) -> StatusCode {
        StatusCode::OK
    }

    /// Choose where the bytes of a new incoming message go.
    ///
    /// `memory_limit` is the session's configured `memory_store_limit`.
    fn create_store(
        &self,
        _message_id: &MessageId,
        expected_total: Option<u64>,
        memory_limit: usize,
    ) -> Box<dyn ContentStore> {
        default_store(expected_total, memory_limit)
    }

    fn more_bytes_received(
        &self,
        _message_id: &MessageId,
        _bytes_so_far: u64,
        _expected_total: Option<u64>,
        _store: &dyn ContentStore,
    ) {
    }

    /// A message completed, was aborted by the sender, or stalled past the reassembly timeout.
    ///
    /// Ownership of the store passes to the application.
    fn message_received(
        &self,
        message_id: &MessageId,
        metadata: &MessageMetadata,
        store: Box<dyn ContentStore>,
    );

    fn message_sent(&self, _message_id: &MessageId) {}

    fn message_failed(&self, _message_id: &MessageId, _failure: SendFailure) {}

    fn report_received(&self, _report: &Report) {}

    fn connection_established(&self, _local: &MsrpUri) {}

    fn connection_closed(&self, _local: &MsrpUri) {}
}
