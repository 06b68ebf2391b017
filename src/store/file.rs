use std::fs::{self, File, OpenOptions};
use std::io::{self, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, warn};
use uuid::Uuid;

use super::ContentStore;

/// Store writing to a file that is opened lazily on the first write.
///
/// A [`temporary`](Self::temporary) store deletes its file when dropped unless it was
/// [persisted](ContentStore::persist).
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    file: Option<File>,
    temporary: bool,
    received: u64,
    error: bool,
    aborted: bool,
    finished: bool,
    released: bool,
}

impl FileStore {
    /// Store backed by `path`, truncated on first write.
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            file: None,
            temporary: false,
            received: 0,
            error: false,
            aborted: false,
            finished: false,
            released: false,
        }
    }

    /// Store backed by a fresh file in the system temp directory.
    pub fn temporary() -> Self {
        let name = format!("msrp-{}.part", Uuid::new_v4().simple());
        let mut store = Self::at(std::env::temp_dir().join(name));
        store.temporary = true;
        store
    }

    fn write_at(&mut self, offset: Option<u64>, bytes: &[u8]) -> io::Result<()> {
        let file = match &mut self.file {
            Some(file) => file,
            None => {
                let file = OpenOptions::new()
                    .create(true)
                    .write(true)
                    .truncate(true)
                    .open(&self.path)?;
                self.file.insert(file)
            }
        };
        if let Some(offset) = offset {
            file.seek(SeekFrom::Start(offset))?;
        }
        file.write_all(bytes)
    }
}

impl ContentStore for FileStore {
    fn store(&mut self, offset: Option<u64>, bytes: &[u8]) -> usize {
        if self.error || self.finished {
            self.error = true;
            return bytes.len();
        }

        match self.write_at(offset, bytes) {
            Ok(()) => self.received += bytes.len() as u64,
            Err(err) => {
                warn!(path = %self.path.display(), error = %err, "File store write failed");
                self.error = true;
            }
        }
        bytes.len()
    }

    fn receiving_finished(&mut self, aborted: bool) {
        if self.finished {
            return;
        }
        self.finished = true;
        self.aborted = aborted;

        if let Some(mut file) = self.file.take() {
            if let Err(err) = file.flush() {
                warn!(path = %self.path.display(), error = %err, "File store flush failed");
                self.error = true;
            }
        }
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

    fn path(&self) -> Option<&Path> {
        Some(&self.path)
    }

    fn persist(&mut self) -> Option<PathBuf> {
        if self.released {
            return None;
        }
        self.temporary = false;
        Some(self.path.clone())
    }

    fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        self.file = None;

        match fs::remove_file(&self.path) {
            Ok(()) => debug!(path = %self.path.display(), "Released file store"),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => {
                warn!(path = %self.path.display(), error = %err, "File store delete failed")
            }
        }
    }
}

impl Drop for FileStore {
    fn drop(&mut self) {
        if self.temporary {
            self.release();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_writes_land_in_file() {
        let mut store = FileStore::temporary();
        let path = store.path().unwrap().to_path_buf();
        assert!(!path.exists(), "file is opened lazily");

        store.store(None, b"hello ");
        store.store(None, b"world");
        store.store(Some(0), b"H");
        store.receiving_finished(false);

        assert_eq!(fs::read(&path).unwrap(), b"Hello world");
        assert_eq!(store.bytes_received(), 12);
        assert!(!store.has_error());

        store.release();
        assert!(!path.exists());
    }

    #[test]
    fn test_finish_and_release_are_idempotent() {
        let mut store = FileStore::temporary();
        store.store(None, b"x");

        store.receiving_finished(true);
        store.receiving_finished(false);
        assert!(store.was_aborted());

        store.release();
        store.release();
    }

    #[test]
    fn test_unwritable_path_sets_error() {
        let mut store = FileStore::at("/nonexistent-dir/for/msrp/test.part");

        assert_eq!(store.store(None, b"abc"), 3);
        assert!(store.has_error());
        assert_eq!(store.bytes_received(), 0);

        store.receiving_finished(false);
        store.release();
    }

    #[test]
    fn test_dropped_temporary_store_deletes_file() {
        let mut store = FileStore::temporary();
        let path = store.path().unwrap().to_path_buf();
        store.store(None, b"half a message");
        store.receiving_finished(true);
        assert!(path.exists());

        drop(store);
        assert!(!path.exists());
    }

    #[test]
    fn test_persisted_store_keeps_file() {
        let mut store = FileStore::temporary();
        store.store(None, b"keep me");
        store.receiving_finished(false);
        let path = store.persist().unwrap();

        drop(store);
        assert_eq!(fs::read(&path).unwrap(), b"keep me");
        fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_caller_path_survives_drop() {
        let name = format!("msrp-test-{}.bin", Uuid::new_v4().simple());
        let path = std::env::temp_dir().join(name);
        let mut store = FileStore::at(path.clone());
        store.store(None, b"owned by caller");
        store.receiving_finished(false);

        drop(store);
        assert!(path.exists());
        fs::remove_file(&path).unwrap();
    }
}
