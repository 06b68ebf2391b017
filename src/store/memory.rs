use tracing::warn;

use super::ContentStore;

/// Fixed-capacity in-memory store with absolute positioning.
#[derive(Debug)]
pub struct MemoryStore {
    buffer: Vec<u8>,
    position: usize,
    /// Highest byte written so far; the readable length once finished.
    limit: usize,
    received: u64,
    error: bool,
    aborted: bool,
    finished: bool,
}

impl MemoryStore {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buffer: vec![0; capacity],
            position: 0,
            limit: 0,
            received: 0,
            error: false,
            aborted: false,
            finished: false,
        }
    }

    pub fn capacity(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }
}

impl ContentStore for MemoryStore {
    fn store(&mut self, offset: Option<u64>, bytes: &[u8]) -> usize {
        if self.error || self.finished {
            self.error = true;
            return bytes.len();
        }

        let start = match offset {
            Some(offset) => match usize::try_from(offset) {
                Ok(offset) => offset,
                Err(_) => usize::MAX,
            },
            None => self.position,
        };
        let Some(end) = start
            .checked_add(bytes.len())
            .filter(|end| *end <= self.buffer.len())
        else {
            warn!(
                offset = start,
                len = bytes.len(),
                capacity = self.buffer.len(),
                "Write beyond memory store capacity"
            );
            self.error = true;
            return bytes.len();
        };

        self.buffer[start..end].copy_from_slice(bytes);
        self.position = end;
        self.limit = self.limit.max(end);
        self.received += bytes.len() as u64;
        bytes.len()
    }

    fn receiving_finished(&mut self, aborted: bool) {
        if self.finished {
            return;
        }
        self.finished = true;
        self.aborted = aborted;
        self.position = 0;
    }

    fn bytes_received(&self) -> u64 {
        self.received
    }

    fn has_error(&self) -> bool {
        self.error
    }

    fn was_aborted(&self) -> bool {
        self.aborted
    }

    fn contents(&self) -> Option<&[u8]> {
        Some(&self.buffer[..self.limit])
    }

    fn release(&mut self) {
        self.buffer = Vec::new();
        self.limit = 0;
    }
}
