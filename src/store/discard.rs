use super::ContentStore;

/// Counts incoming bytes and keeps none of them.
#[derive(Debug, Default)]
pub struct DiscardStore {
    received: u64,
    aborted: bool,
}

impl DiscardStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ContentStore for DiscardStore {
    fn store(&mut self, _offset: Option<u64>, bytes: &[u8]) -> usize {
        self.received += bytes.len() as u64;
        bytes.len()
    }

    fn receiving_finished(&mut self, aborted: bool) {
        self.aborted = aborted;
    }

    fn bytes_received(&self) -> u64 {
        self.received
    }

    fn has_error(&self) -> bool {
        false
    }

    fn was_aborted(&self) -> bool {
        self.aborted
    }
}
