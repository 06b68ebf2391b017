//! Slicing of one outbound message into wire pieces.

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;
use tracing::trace;

use crate::cpim::{self, CPIM_CONTENT_TYPE};
use crate::ids::{MessageId, TransactionId};
use crate::message::{ByteRange, ChunkPiece, ChunkType, Continuation, MsrpUri};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SequencerError {
    #[error("message {0} has already been fully sequenced")]
    Finished(MessageId),
}

/// Where the sequencer stands after the last piece it emitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequencerPhase {
    /// Nothing emitted yet.
    Init,
    /// The current chunk continues with the next piece.
    Sending,
    /// The current chunk ended; the next piece opens a new chunk.
    Sent,
    /// The message ended.
    Done,
    /// The message was aborted.
    Abort,
}

/// A piece ready for the wire, and how much of the offered content it carries.
#[derive(Debug, Clone)]
pub struct SequencedPiece {
    pub piece: ChunkPiece,
    pub consumed: usize,
}

/// Cursor over one outbound message. Calls must be serialized by the owner.
#[derive(Debug)]
pub struct ChunkSequencer {
    message_id: MessageId,
    from_path: MsrpUri,
    to_path: MsrpUri,
    header: Bytes,
    /// Payload size excluding the header block, when known.
    total: Option<u64>,
    max_chunk_size: Option<u64>,
    success_report: bool,
    failure_report: bool,
    phase: SequencerPhase,
    bytes_sent: u64,
    chunk_bytes: u64,
    chunk_start: u64,
    transaction_id: TransactionId,
}

impl ChunkSequencer {
    pub fn new(
        message_id: MessageId,
        from_path: MsrpUri,
        to_path: MsrpUri,
        content_type: &str,
        total: Option<u64>,
        max_chunk_size: Option<usize>,
    ) -> Self {
        let header = cpim::header_block(&from_path, &to_path, content_type);
        Self {
            message_id,
            from_path,
            to_path,
            header,
            total,
            max_chunk_size: max_chunk_size.filter(|max| *max > 0).map(|max| max as u64),
            success_report: false,
            failure_report: true,
            phase: SequencerPhase::Init,
            bytes_sent: 0,
            chunk_bytes: 0,
            chunk_start: 1,
            transaction_id: TransactionId::generate(),
        }
    }

    /// Ask the receiver for a REPORT once the message arrived.
    pub fn with_success_report(mut self, success_report: bool) -> Self {
        self.success_report = success_report;
        self
    }

    pub fn message_id(&self) -> &MessageId {
        &self.message_id
    }

    pub fn phase(&self) -> SequencerPhase {
        self.phase
    }

    /// Payload bytes emitted so far, excluding the header block.
    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent
    }

    /// The transaction of the chunk currently being sent.
    pub fn transaction_id(&self) -> &TransactionId {
        &self.transaction_id
    }

    pub fn is_finished(&self) -> bool {
        matches!(self.phase, SequencerPhase::Done | SequencerPhase::Abort)
    }

    /// Produce the next piece from `content`.
    ///
    /// `None` content means the source is exhausted. The piece takes as much of `content` as the
    /// current chunk has room for; the rest must be offered again on the next call. `is_last`
    /// ends the message once all of `content` fits.
    pub fn next_piece(
        &mut self,
        content: Option<&[u8]>,
        abort: bool,
        is_last: bool,
    ) -> Result<SequencedPiece, SequencerError> {
        if self.is_finished() {
            return Err(SequencerError::Finished(self.message_id.clone()));
        }

        let starts_chunk = matches!(self.phase, SequencerPhase::Init | SequencerPhase::Sent);
        if starts_chunk {
            if self.phase == SequencerPhase::Sent {
                self.transaction_id = TransactionId::generate();
            }
            self.chunk_bytes = 0;
            self.chunk_start = self.wire_offset() + 1;
        }

        if abort {
            self.phase = SequencerPhase::Abort;
            let chunk_type = if starts_chunk {
                ChunkType::Complete
            } else {
                ChunkType::Tail
            };
            return Ok(SequencedPiece {
                piece: self.piece(Continuation::Aborted, chunk_type, 0, Bytes::new()),
                consumed: 0,
            });
        }

        let offered = content.unwrap_or_default();
        let room = self
            .max_chunk_size
            .map_or(u64::MAX, |max| max - self.chunk_bytes);
        let taken = offered.len().min(usize::try_from(room).unwrap_or(usize::MAX));

        let first_piece = self.phase == SequencerPhase::Init;
        let header_len = if first_piece { self.header.len() } else { 0 };
        let body = if first_piece {
            let mut body = BytesMut::with_capacity(header_len + taken);
            body.put_slice(&self.header);
            body.put_slice(&offered[..taken]);
            body.freeze()
        } else {
            Bytes::copy_from_slice(&offered[..taken])
        };

        self.bytes_sent += taken as u64;
        self.chunk_bytes += taken as u64;
        let all_consumed = content.is_some() && taken == offered.len();

        self.phase = if content.is_none()
            || (is_last && all_consumed)
            || self.total.is_some_and(|total| self.bytes_sent >= total)
        {
            SequencerPhase::Done
        } else if self
            .max_chunk_size
            .is_some_and(|max| self.chunk_bytes >= max)
        {
            SequencerPhase::Sent
        } else {
            SequencerPhase::Sending
        };

        let ends_message = self.phase == SequencerPhase::Done;
        let ends_chunk = ends_message || self.phase == SequencerPhase::Sent;
        let chunk_type = match (starts_chunk, ends_chunk) {
            (true, false) => ChunkType::Head,
            (false, false) => ChunkType::BodyOnly,
            (true, true) if ends_message => ChunkType::Complete,
            (_, true) => ChunkType::Tail,
        };
        let continuation = if ends_message {
            Continuation::Done
        } else {
            Continuation::More
        };

        trace!(
            message_id = %self.message_id,
            transaction_id = %self.transaction_id,
            bytes = taken,
            ?chunk_type,
            phase = ?self.phase,
            "Sequenced piece"
        );
        Ok(SequencedPiece {
            piece: self.piece(continuation, chunk_type, header_len, body),
            consumed: taken,
        })
    }

    /// Wire bytes emitted so far: the header block counts once it was sent.
    fn wire_offset(&self) -> u64 {
        if self.phase == SequencerPhase::Init {
            0
        } else {
            self.header.len() as u64 + self.bytes_sent
        }
    }

    fn piece(
        &self,
        continuation: Continuation,
        chunk_type: ChunkType,
        header_len: usize,
        body: Bytes,
    ) -> ChunkPiece {
        ChunkPiece {
            transaction_id: self.transaction_id.clone(),
            message_id: self.message_id.clone(),
            to_path: self.to_path.clone(),
            from_path: self.from_path.clone(),
            byte_range: ByteRange::new(
                self.chunk_start,
                None,
                self.total.map(|total| total + self.header.len() as u64),
            ),
            continuation,
            chunk_type,
            content_type: Some(CPIM_CONTENT_TYPE.to_string()),
            header_len,
            success_report: self.success_report,
            failure_report: self.failure_report,
            body,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use proptest::prelude::*;

    use super::*;
    use crate::application::MsrpApplication;
    use crate::config::MsrpConfig;
    use crate::reassembly::ReassemblyTable;
    use crate::reassembly::tests::{Event, RecordingApp};

    fn sequencer(total: Option<u64>, max_chunk_size: Option<usize>) -> ChunkSequencer {
        ChunkSequencer::new(
            MessageId::from("m1"),
            "msrp://a.example:1/alice;tcp".parse().unwrap(),
            "msrp://b.example:2/bob;tcp".parse().unwrap(),
            "text/plain",
            total,
            max_chunk_size,
        )
    }

    #[test]
    fn test_chunk_size_splits_message() {
        let payload = [7u8; 25];
        let mut sequencer = sequencer(Some(25), Some(10));

        let mut offset = 0;
        let mut pieces = Vec::new();
        while !sequencer.is_finished() {
            let next = sequencer
                .next_piece(Some(&payload[offset..]), false, false)
                .unwrap();
            offset += next.consumed;
            pieces.push(next.piece);
        }

        let types: Vec<_> = pieces.iter().map(|piece| piece.chunk_type).collect();
        assert_eq!(
            types,
            vec![ChunkType::Tail, ChunkType::Tail, ChunkType::Complete]
        );
        let payload_bytes: usize = pieces
            .iter()
            .map(|piece| piece.body.len() - piece.header_len)
            .sum();
        assert_eq!(payload_bytes, 25);

        // Every chunk has its own transaction.
        assert_ne!(pieces[0].transaction_id, pieces[1].transaction_id);
        assert_ne!(pieces[1].transaction_id, pieces[2].transaction_id);

        let header_len = pieces[0].header_len as u64;
        assert!(header_len > 0);
        assert_eq!(pieces[1].header_len, 0);
        assert_eq!(pieces[1].byte_range.start, header_len + 11);
        assert_eq!(pieces[2].byte_range.start, header_len + 21);
        assert_eq!(pieces[2].byte_range.total, Some(header_len + 25));
        assert_eq!(pieces[2].continuation, Continuation::Done);
        assert_eq!(pieces[0].continuation, Continuation::More);
    }

    #[test]
    fn test_pieces_of_one_chunk_share_transaction() {
        let mut sequencer = sequencer(None, None);

        let head = sequencer.next_piece(Some(b"abc"), false, false).unwrap();
        let body = sequencer.next_piece(Some(b"def"), false, false).unwrap();
        let tail = sequencer.next_piece(None, false, false).unwrap();

        assert_eq!(head.piece.chunk_type, ChunkType::Head);
        assert_eq!(body.piece.chunk_type, ChunkType::BodyOnly);
        assert_eq!(tail.piece.chunk_type, ChunkType::Tail);
        assert_eq!(head.piece.transaction_id, tail.piece.transaction_id);
        assert_eq!(body.piece.body.as_ref(), b"def");
        assert!(tail.piece.body.is_empty());
        assert_eq!(tail.piece.byte_range.total, None);
        assert_eq!(sequencer.phase(), SequencerPhase::Done);
    }

    #[test]
    fn test_empty_and_unknown_size_messages_are_one_piece() {
        let mut empty = sequencer(Some(0), Some(10));
        let piece = empty.next_piece(Some(&[]), false, false).unwrap().piece;
        assert_eq!(piece.chunk_type, ChunkType::Complete);
        assert_eq!(piece.continuation, Continuation::Done);
        assert!(empty.is_finished());

        let mut unknown = sequencer(None, Some(10));
        let piece = unknown.next_piece(None, false, false).unwrap().piece;
        assert_eq!(piece.chunk_type, ChunkType::Complete);
        assert_eq!(piece.byte_range.total, None);
    }

    #[test]
    fn test_last_flag_counts_only_when_everything_fits() {
        let mut sequencer = sequencer(None, Some(4));

        let first = sequencer.next_piece(Some(b"abcdef"), false, true).unwrap();
        assert_eq!(first.consumed, 4);
        assert_eq!(sequencer.phase(), SequencerPhase::Sent);

        let second = sequencer.next_piece(Some(b"ef"), false, true).unwrap();
        assert_eq!(second.consumed, 2);
        assert_eq!(second.piece.chunk_type, ChunkType::Complete);
    }

    #[test]
    fn test_abort_emits_empty_final_piece() {
        let mut sequencer = sequencer(Some(100), None);
        sequencer.next_piece(Some(&[1; 40]), false, false).unwrap();

        let aborted = sequencer.next_piece(Some(&[1; 40]), true, false).unwrap();
        assert_eq!(aborted.consumed, 0);
        assert!(aborted.piece.body.is_empty());
        assert_eq!(aborted.piece.continuation, Continuation::Aborted);
        assert_eq!(aborted.piece.chunk_type, ChunkType::Tail);
        assert_eq!(sequencer.phase(), SequencerPhase::Abort);

        assert_eq!(
            sequencer.next_piece(None, false, false).unwrap_err(),
            SequencerError::Finished(MessageId::from("m1"))
        );
    }

    proptest! {
        #[test]
        fn prop_sequenced_pieces_reassemble(
            chunk_size in 1usize..48,
            read_size in 1usize..64,
            payload in proptest::collection::vec(any::<u8>(), 0..400),
        ) {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_time()
                .build()
                .unwrap();
            let app = Arc::new(RecordingApp::default());
            let table = ReassemblyTable::new(
                Arc::clone(&app) as Arc<dyn MsrpApplication>,
                runtime.handle().clone(),
                &MsrpConfig::default(),
            );

            let mut sequencer = sequencer(Some(payload.len() as u64), Some(chunk_size));
            let mut offset = 0;
            while !sequencer.is_finished() {
                let end = (offset + read_size).min(payload.len());
                let next = sequencer
                    .next_piece(Some(&payload[offset..end]), false, end == payload.len())
                    .unwrap();
                offset += next.consumed;
                table.accept(next.piece);
            }

            let events = app.events.lock();
            let Some(Event::Received { contents, aborted, metadata, .. }) = events.last() else {
                panic!("message not delivered");
            };
            prop_assert!(!aborted);
            prop_assert_eq!(contents, &payload);
            prop_assert_eq!(metadata.content_type.as_deref(), Some("text/plain"));
        }
    }
}
