//! Accumulation of incoming messages, one [`Reassembler`] per message id.
//!
//! Pieces of a message are applied in arrival order under the reassembler's lock. While a
//! message is incomplete an idle timer runs; if no piece arrives before it fires the message is
//! completed as aborted, so stalled senders cannot pin stores forever.

use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tracing::{debug, info, warn};

use crate::application::MsrpApplication;
use crate::config::MsrpConfig;
use crate::cpim::{self, MessageMetadata};
use crate::ids::{MessageId, TransactionId};
use crate::message::{ChunkPiece, Continuation};
use crate::store::ContentStore;
use crate::timer::IdleTimer;

/// What applying a piece did to its message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    /// More pieces are expected.
    Partial { bytes_so_far: u64 },
    /// The message completed (or was aborted by the sender) and was handed to the application.
    Complete,
    /// The message had already completed.
    Ignored,
}

/// A finished message on its way to [`MsrpApplication::message_received`].
#[derive(Debug)]
pub struct Completion {
    pub message_id: MessageId,
    pub metadata: MessageMetadata,
    pub store: Box<dyn ContentStore>,
}

/// Accumulator for one incoming message.
pub struct Reassembler {
    message_id: MessageId,
    assembly: Mutex<Assembly>,
}

struct Assembly {
    /// `None` once the message finished.
    store: Option<Box<dyn ContentStore>>,
    expected_total: Option<u64>,
    /// Header bytes seen so far; the byte-range counts them, the store does not.
    skip: u64,
    current_transaction: Option<TransactionId>,
    metadata: MessageMetadata,
    timer: IdleTimer,
}

impl Reassembler {
    fn new(message_id: MessageId, store: Box<dyn ContentStore>, timer: IdleTimer) -> Self {
        Self {
            message_id,
            assembly: Mutex::new(Assembly {
                store: Some(store),
                expected_total: None,
                skip: 0,
                current_transaction: None,
                metadata: MessageMetadata::default(),
                timer,
            }),
        }
    }

    pub fn message_id(&self) -> &MessageId {
        &self.message_id
    }

    pub fn bytes_received(&self) -> u64 {
        let assembly = self.assembly.lock();
        assembly
            .store
            .as_ref()
            .map_or(0, |store| store.bytes_received())
    }

    fn apply(&self, piece: ChunkPiece, table: &ReassemblyTable) -> Result<Progress, Completion> {
        let mut guard = self.assembly.lock();
        let assembly = &mut *guard;
        let Some(store) = assembly.store.as_mut() else {
            debug!(message_id = %self.message_id, "Piece for finished message");
            return Ok(Progress::Ignored);
        };

        // The first piece of a chunk seeks to the chunk start; later pieces append.
        let offset = if assembly.current_transaction.as_ref() != Some(&piece.transaction_id) {
            assembly.current_transaction = Some(piece.transaction_id.clone());
            Some(
                piece
                    .byte_range
                    .start
                    .saturating_sub(assembly.skip)
                    .saturating_sub(1),
            )
        } else {
            None
        };

        let header_len = piece.header_len.min(piece.body.len());
        if header_len > 0 {
            assembly.metadata = cpim::parse_header(&piece.body[..header_len]);
        }
        store.store(offset, &piece.body[header_len..]);
        assembly.skip += header_len as u64;
        if let Some(total) = piece.byte_range.total {
            assembly.expected_total = Some(total.saturating_sub(assembly.skip));
        }

        let bytes_so_far = store.bytes_received();
        match piece.continuation {
            Continuation::More => {
                table.app.more_bytes_received(
                    &self.message_id,
                    bytes_so_far,
                    assembly.expected_total,
                    &**store,
                );

                let timeout = table.timeout;
                let table = table.this.clone();
                let message_id = self.message_id.clone();
                assembly.timer.arm(timeout, move |generation| {
                    if let Some(table) = table.upgrade() {
                        table.expire(&message_id, generation);
                    }
                });
                Ok(Progress::Partial { bytes_so_far })
            }
            Continuation::Done | Continuation::Aborted => {
                assembly.timer.cancel();
                let aborted = piece.continuation == Continuation::Aborted;
                match self.finish(assembly, aborted) {
                    Some(completion) => Err(completion),
                    None => Ok(Progress::Ignored),
                }
            }
        }
    }

    fn finish(&self, assembly: &mut Assembly, aborted: bool) -> Option<Completion> {
        let mut store = assembly.store.take()?;
        store.receiving_finished(aborted);
        Some(Completion {
            message_id: self.message_id.clone(),
            metadata: assembly.metadata.clone(),
            store,
        })
    }
}

impl fmt::Debug for Reassembler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reassembler")
            .field("message_id", &self.message_id)
            .finish_non_exhaustive()
    }
}

/// The in-progress incoming messages of one session.
pub struct ReassemblyTable {
    app: Arc<dyn MsrpApplication>,
    runtime: Handle,
    timeout: Duration,
    memory_limit: usize,
    entries: DashMap<MessageId, Arc<Reassembler>, ahash::RandomState>,
    this: Weak<ReassemblyTable>,
}

impl ReassemblyTable {
    /// Table using `config`'s reassembly timeout and memory store limit.
    pub fn new(app: Arc<dyn MsrpApplication>, runtime: Handle, config: &MsrpConfig) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            app,
            runtime,
            timeout: config.reassembly_timeout,
            memory_limit: config.memory_store_limit,
            entries: DashMap::default(),
            this: this.clone(),
        })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, message_id: &MessageId) -> bool {
        self.entries.contains_key(message_id)
    }

    /// Apply one piece to its message, creating the reassembler on the first piece.
    pub fn accept(&self, piece: ChunkPiece) -> Progress {
        let message_id = piece.message_id.clone();
        let reassembler = {
            let entry = self.entries.entry(message_id.clone()).or_insert_with(|| {
                let expected = piece
                    .byte_range
                    .total
                    .map(|total| total.saturating_sub(piece.header_len as u64));
                debug!(
                    message_id = %message_id,
                    expected_total = ?expected,
                    "New incoming message"
                );
                let store = self
                    .app
                    .create_store(&message_id, expected, self.memory_limit);
                Arc::new(Reassembler::new(
                    message_id.clone(),
                    store,
                    IdleTimer::new(self.runtime.clone()),
                ))
            });
            Arc::clone(entry.value())
        };

        match reassembler.apply(piece, self) {
            Ok(progress) => progress,
            Err(completion) => {
                self.entries
                    .remove_if(&message_id, |_, entry| Arc::ptr_eq(entry, &reassembler));
                self.deliver(completion);
                Progress::Complete
            }
        }
    }

    /// Complete every in-progress message as aborted.
    pub fn abort_all(&self) {
        let message_ids: Vec<MessageId> =
            self.entries.iter().map(|entry| entry.key().clone()).collect();

        for message_id in message_ids {
            let Some((_, reassembler)) = self.entries.remove(&message_id) else {
                continue;
            };
            let completion = {
                let mut assembly = reassembler.assembly.lock();
                assembly.timer.cancel();
                reassembler.finish(&mut assembly, true)
            };
            if let Some(completion) = completion {
                self.deliver(completion);
            }
        }
    }

    fn expire(&self, message_id: &MessageId, generation: u64) {
        let Some(reassembler) = self
            .entries
            .get(message_id)
            .map(|entry| Arc::clone(entry.value()))
        else {
            return;
        };

        let completion = {
            let mut assembly = reassembler.assembly.lock();
            if !assembly.timer.is_current(generation) {
                debug!(message_id = %message_id, "Ignoring superseded idle timeout");
                return;
            }
            assembly.timer.cancel();
            reassembler.finish(&mut assembly, true)
        };

        if let Some(completion) = completion {
            warn!(
                message_id = %message_id,
                bytes = completion.store.bytes_received(),
                timeout = ?self.timeout,
                "Incoming message stalled, completing as aborted"
            );
            self.entries
                .remove_if(message_id, |_, entry| Arc::ptr_eq(entry, &reassembler));
            self.deliver(completion);
        }
    }

    fn deliver(&self, completion: Completion) {
        info!(
            message_id = %completion.message_id,
            bytes = completion.store.bytes_received(),
            aborted = completion.store.was_aborted(),
            error = completion.store.has_error(),
            "Message received"
        );
        self.app.message_received(
            &completion.message_id,
            &completion.metadata,
            completion.store,
        );
    }
}

impl fmt::Debug for ReassemblyTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReassemblyTable")
            .field("timeout", &self.timeout)
            .field("entries", &self.entries.len())
            .finish()
    }
}
