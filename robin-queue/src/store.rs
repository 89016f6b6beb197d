//! The append-oriented queue store.
//!
//! Layout on disk:
//! - the log file: a sequence of `u32`-length-prefixed bincode records,
//!   append-only, fsynced per enqueue (single-item commits);
//! - a sidecar `<log>.head` holding the count of consumed records, rewritten
//!   and fsynced per dequeue;
//! - the companion directory `<log>.d` owning envelope files referenced by
//!   queued entries.
//!
//! On open, a partial tail record (crash mid-append) is truncated away and a
//! non-zero head compacts the log. Dequeue order equals the order insertion
//! was observed by the store.

use std::{
    collections::VecDeque,
    fs::{File, OpenOptions},
    io::{Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
};

use parking_lot::Mutex;

use crate::{entry::RelaySession, QueueError, Result};

const LEN_PREFIX: usize = 4;

struct Inner {
    log: File,
    log_path: PathBuf,
    head_path: PathBuf,
    /// Pending entries, in order; the front is the next to dequeue.
    entries: VecDeque<Vec<u8>>,
    /// Records consumed from the current log file.
    consumed: u64,
}

/// Durable FIFO with concurrent producers and a single consumer.
pub struct FileQueue {
    inner: Mutex<Inner>,
    spool_dir: PathBuf,
}

impl std::fmt::Debug for FileQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileQueue")
            .field("spool_dir", &self.spool_dir)
            .field("size", &self.size())
            .finish()
    }
}

impl FileQueue {
    /// Opens (or creates) the queue at `path`, recovering from a partial
    /// tail record left by a crash.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let log_path = path.as_ref().to_path_buf();
        if let Some(parent) = log_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let head_path = log_path.with_extension("head");
        let spool_dir = log_path.with_extension("d");
        std::fs::create_dir_all(&spool_dir)?;

        let mut log = OpenOptions::new()
            .read(true)
            .create(true)
            .append(true)
            .open(&log_path)?;

        let (mut entries, valid_len) = Self::load_entries(&mut log)?;

        let total_len = log.metadata()?.len();
        if valid_len < total_len {
            tracing::warn!(
                path = %log_path.display(),
                truncated = total_len - valid_len,
                "truncating partial queue record"
            );
            log.set_len(valid_len)?;
            log.sync_data()?;
        }

        let consumed = Self::read_head(&head_path);
        for _ in 0..consumed.min(entries.len() as u64) {
            entries.pop_front();
        }

        let mut queue = Self {
            inner: Mutex::new(Inner {
                log,
                log_path,
                head_path,
                entries,
                consumed,
            }),
            spool_dir,
        };

        // A non-zero head means prior consumption; rewrite the log so the
        // file and the head agree again.
        if consumed > 0 {
            queue.compact()?;
        }

        Ok(queue)
    }

    fn load_entries(log: &mut File) -> Result<(VecDeque<Vec<u8>>, u64)> {
        let mut raw = Vec::new();
        log.seek(SeekFrom::Start(0))?;
        log.read_to_end(&mut raw)?;

        let mut entries = VecDeque::new();
        let mut offset = 0usize;
        let mut valid = 0u64;

        while raw.len() - offset >= LEN_PREFIX {
            let mut len_bytes = [0u8; LEN_PREFIX];
            len_bytes.copy_from_slice(&raw[offset..offset + LEN_PREFIX]);
            let len = u32::from_le_bytes(len_bytes) as usize;

            if raw.len() - offset - LEN_PREFIX < len {
                break;
            }

            entries.push_back(raw[offset + LEN_PREFIX..offset + LEN_PREFIX + len].to_vec());
            offset += LEN_PREFIX + len;
            valid = offset as u64;
        }

        Ok((entries, valid))
    }

    fn read_head(path: &Path) -> u64 {
        std::fs::read(path)
            .ok()
            .and_then(|bytes| bytes.try_into().ok())
            .map_or(0, u64::from_le_bytes)
    }

    fn write_head(path: &Path, consumed: u64) -> Result<()> {
        let mut file = File::create(path)?;
        file.write_all(&consumed.to_le_bytes())?;
        file.sync_data()?;
        Ok(())
    }

    /// Rewrites the log to contain exactly the pending entries and resets
    /// the head. Called when the head and log disagree (recovery) and when
    /// the queue drains.
    fn compact(&mut self) -> Result<()> {
        let inner = self.inner.get_mut();

        let tmp_path = inner.log_path.with_extension("tmp");
        {
            let mut tmp = File::create(&tmp_path)?;
            for entry in &inner.entries {
                tmp.write_all(&u32::try_from(entry.len()).unwrap_or(u32::MAX).to_le_bytes())?;
                tmp.write_all(entry)?;
            }
            tmp.sync_data()?;
        }
        std::fs::rename(&tmp_path, &inner.log_path)?;

        inner.log = OpenOptions::new()
            .read(true)
            .append(true)
            .open(&inner.log_path)?;
        inner.consumed = 0;
        Self::write_head(&inner.head_path, 0)?;

        Ok(())
    }

    /// Appends one entry with a single-item commit.
    pub fn enqueue(&self, entry: &RelaySession) -> Result<()> {
        let bytes = entry.encode()?;
        let mut inner = self.inner.lock();

        inner
            .log
            .write_all(&u32::try_from(bytes.len()).unwrap_or(u32::MAX).to_le_bytes())?;
        inner.log.write_all(&bytes)?;
        inner.log.sync_data()?;

        inner.entries.push_back(bytes);
        Ok(())
    }

    /// Removes and returns the oldest entry. A record that no longer
    /// decodes is parked (logged and skipped), the queue keeps going.
    pub fn dequeue(&self) -> Result<Option<RelaySession>> {
        loop {
            let bytes = {
                let mut inner = self.inner.lock();
                let Some(bytes) = inner.entries.pop_front() else {
                    return Ok(None);
                };
                inner.consumed += 1;
                Self::write_head(&inner.head_path, inner.consumed)?;
                bytes
            };

            match RelaySession::decode(&bytes) {
                Ok(entry) => {
                    self.compact_if_empty()?;
                    return Ok(Some(entry));
                }
                Err(error) => {
                    tracing::error!(%error, "parking undecodable queue entry");
                }
            }
        }
    }

    fn compact_if_empty(&self) -> Result<()> {
        let needs_compaction = {
            let inner = self.inner.lock();
            inner.entries.is_empty() && inner.consumed > 0
        };

        if needs_compaction {
            let mut inner = self.inner.lock();
            if inner.entries.is_empty() && inner.consumed > 0 {
                inner.log.set_len(0)?;
                inner.log.sync_data()?;
                inner.consumed = 0;
                Self::write_head(&inner.head_path, 0)?;
            }
        }
        Ok(())
    }

    #[must_use]
    pub fn size(&self) -> usize {
        self.inner.lock().entries.len()
    }

    /// Decoded view of every pending entry, for the management surface.
    pub fn snapshot(&self) -> Vec<RelaySession> {
        self.inner
            .lock()
            .entries
            .iter()
            .filter_map(|bytes| RelaySession::decode(bytes).ok())
            .collect()
    }

    /// Flushes and fsyncs the store.
    pub fn close(&self) -> Result<()> {
        let inner = self.inner.lock();
        inner.log.sync_all()?;
        Ok(())
    }

    /// The companion directory owning envelope files.
    #[must_use]
    pub fn spool_dir(&self) -> &Path {
        &self.spool_dir
    }

    /// Takes ownership of an envelope file by moving it into the companion
    /// directory. Returns the new path.
    pub fn import_file(&self, source: &Path) -> Result<PathBuf> {
        let name = source
            .file_name()
            .ok_or_else(|| QueueError::NotOwned(source.to_path_buf()))?;
        let target = self.spool_dir.join(name);

        if source == target {
            return Ok(target);
        }

        // Rename when possible, copy across filesystems.
        if std::fs::rename(source, &target).is_err() {
            std::fs::copy(source, &target)?;
            std::fs::remove_file(source)?;
        }

        Ok(target)
    }

    /// Deletes a file the queue owns. Refuses paths outside the companion
    /// directory.
    pub fn discard_file(&self, path: &Path) -> Result<()> {
        if !path.starts_with(&self.spool_dir) {
            return Err(QueueError::NotOwned(path.to_path_buf()));
        }

        match std::fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(error) => Err(error.into()),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod test {
    use std::io::Write;

    use super::FileQueue;
    use crate::entry::{QueueProtocol, RelaySession};
    use robin_common::{
        address::parse_one,
        envelope::Envelope,
        session::{Route, Session},
    };

    fn entry(rcpt: &str) -> RelaySession {
        let mut session = Session::outbound(Route::to_host("mx.example.com", 25));
        let mut envelope = Envelope::new(Some(parse_one("sender@ex.com").unwrap()));
        envelope.add_recipient(parse_one(rcpt).unwrap());
        session.open_envelope(envelope);
        RelaySession::new(session, QueueProtocol::Esmtp, 3)
    }

    fn first_rcpt(entry: &RelaySession) -> String {
        entry.session.envelopes()[0].recipients()[0]
            .email()
            .unwrap()
            .to_string()
    }

    #[test]
    fn enqueue_then_dequeue_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let queue = FileQueue::open(dir.path().join("relay.q")).unwrap();

        queue.enqueue(&entry("one@ex.com")).unwrap();
        assert_eq!(queue.size(), 1);

        let out = queue.dequeue().unwrap().unwrap();
        assert_eq!(first_rcpt(&out), "one@ex.com");
        assert!(queue.dequeue().unwrap().is_none());
    }

    #[test]
    fn order_is_fifo_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("relay.q");

        {
            let queue = FileQueue::open(&path).unwrap();
            for rcpt in ["a@ex.com", "b@ex.com", "c@ex.com"] {
                queue.enqueue(&entry(rcpt)).unwrap();
            }
            queue.close().unwrap();
        }

        let queue = FileQueue::open(&path).unwrap();
        assert_eq!(queue.size(), 3);
        assert_eq!(first_rcpt(&queue.dequeue().unwrap().unwrap()), "a@ex.com");
        assert_eq!(first_rcpt(&queue.dequeue().unwrap().unwrap()), "b@ex.com");
        assert_eq!(first_rcpt(&queue.dequeue().unwrap().unwrap()), "c@ex.com");
    }

    #[test]
    fn consumed_head_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("relay.q");

        {
            let queue = FileQueue::open(&path).unwrap();
            queue.enqueue(&entry("a@ex.com")).unwrap();
            queue.enqueue(&entry("b@ex.com")).unwrap();
            let _ = queue.dequeue().unwrap();
        }

        let queue = FileQueue::open(&path).unwrap();
        assert_eq!(queue.size(), 1);
        assert_eq!(first_rcpt(&queue.dequeue().unwrap().unwrap()), "b@ex.com");
    }

    #[test]
    fn partial_tail_record_is_truncated() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("relay.q");

        {
            let queue = FileQueue::open(&path).unwrap();
            queue.enqueue(&entry("good@ex.com")).unwrap();
        }

        // Simulate a crash mid-append: a length prefix promising more bytes
        // than were written.
        {
            let mut file = std::fs::OpenOptions::new()
                .append(true)
                .open(&path)
                .unwrap();
            file.write_all(&1000u32.to_le_bytes()).unwrap();
            file.write_all(b"partial").unwrap();
        }

        let queue = FileQueue::open(&path).unwrap();
        assert_eq!(queue.size(), 1);
        assert_eq!(first_rcpt(&queue.dequeue().unwrap().unwrap()), "good@ex.com");
    }

    #[test]
    fn snapshot_leaves_entries_in_place() {
        let dir = tempfile::tempdir().unwrap();
        let queue = FileQueue::open(dir.path().join("relay.q")).unwrap();

        queue.enqueue(&entry("a@ex.com")).unwrap();
        queue.enqueue(&entry("b@ex.com")).unwrap();

        let snapshot = queue.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(queue.size(), 2);
    }

    #[test]
    fn companion_directory_owns_files() {
        let dir = tempfile::tempdir().unwrap();
        let queue = FileQueue::open(dir.path().join("relay.q")).unwrap();

        let outside = dir.path().join("message.eml");
        std::fs::write(&outside, b"mail").unwrap();

        let owned = queue.import_file(&outside).unwrap();
        assert!(owned.starts_with(queue.spool_dir()));
        assert!(!outside.exists());
        assert!(owned.exists());

        queue.discard_file(&owned).unwrap();
        assert!(!owned.exists());

        // Files outside the companion directory are refused.
        std::fs::write(&outside, b"mail").unwrap();
        assert!(queue.discard_file(&outside).is_err());
    }
}
