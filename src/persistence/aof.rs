//! Append-Only File
//!
//! Successful writes (SET, HSET, DEL, HDEL) are appended to the log in their
//! request-frame encoding before the reply goes out. At startup the log is
//! decoded frame by frame and each request is applied again, without sending
//! any reply, to rebuild the stores.
//!
//! ## File format
//!
//! The file is a plain concatenation of request frames:
//!
//! ```text
//! *3\r\n$3\r\nSET\r\n$3\r\nfoo\r\n$3\r\nbar\r\n*2\r\n$3\r\nDEL\r\n$3\r\nfoo\r\n
//! ```
//!
//! A crash can leave half a frame at the end. Replay drops that tail and
//! truncates the file back to the last whole frame, so later appends do not
//! land behind garbage. A frame that fails to decode anywhere else is
//! reported as corruption and replay stops.

use crate::protocol::{ParseError, RespParser, RespValue};
use parking_lot::{Mutex, MutexGuard};
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// When appended frames are flushed to stable storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum FsyncPolicy {
    /// fsync after every append
    Always,
    /// fsync once per second from a background task
    #[default]
    #[value(name = "everysec")]
    EverySec,
    /// never fsync, leave it to the OS
    No,
}

/// Errors raised while opening, writing or replaying the log.
#[derive(Debug, Error)]
pub enum AofError {
    #[error("AOF I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("AOF corrupt at byte {offset}: {source}")]
    Corrupt {
        offset: usize,
        #[source]
        source: ParseError,
    },
}

/// Outcome of a replay.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplayStats {
    /// Frames decoded and applied
    pub commands: usize,
    /// Bytes of incomplete trailing frame that were dropped
    pub truncated_bytes: usize,
}

/// The append-only log.
#[derive(Debug)]
pub struct AppendOnlyFile {
    path: PathBuf,
    file: Mutex<File>,
    policy: FsyncPolicy,
}

impl AppendOnlyFile {
    /// Opens the log at `path`, creating it if it does not exist.
    pub fn open(path: impl AsRef<Path>, policy: FsyncPolicy) -> Result<Self, AofError> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|source| AofError::Io {
                path: path.clone(),
                source,
            })?;

        Ok(Self {
            path,
            file: Mutex::new(file),
            policy,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn policy(&self) -> FsyncPolicy {
        self.policy
    }

    /// Appends one encoded request frame.
    pub fn append(&self, frame: &[u8]) -> io::Result<()> {
        self.writer().append(frame)
    }

    /// Locks the log for appending.
    ///
    /// Nothing else can append while the writer is alive, so a caller that
    /// mutates the store and then appends through one writer gets log order
    /// equal to mutation order.
    pub fn writer(&self) -> AofWriter<'_> {
        AofWriter {
            file: self.file.lock(),
            sync: self.policy == FsyncPolicy::Always,
        }
    }

    /// Appends a request value, encoding it first.
    pub fn append_value(&self, request: &RespValue) -> io::Result<()> {
        self.append(&request.serialize())
    }

    /// Flushes appended frames to stable storage.
    pub fn sync(&self) -> io::Result<()> {
        self.file.lock().sync_data()
    }

    /// Decodes every frame in the log and hands it to `apply`, in order.
    pub fn replay<F>(&self, mut apply: F) -> Result<ReplayStats, AofError>
    where
        F: FnMut(RespValue),
    {
        let data = std::fs::read(&self.path).map_err(|source| AofError::Io {
            path: self.path.clone(),
            source,
        })?;

        let mut parser = RespParser::new();
        let mut stats = ReplayStats::default();
        let mut offset = 0;

        while offset < data.len() {
            match parser.parse(&data[offset..]) {
                Ok(Some((frame, consumed))) => {
                    apply(frame);
                    offset += consumed;
                    stats.commands += 1;
                }
                Ok(None) => {
                    stats.truncated_bytes = data.len() - offset;
                    warn!(
                        path = %self.path.display(),
                        offset,
                        dropped = stats.truncated_bytes,
                        "AOF ends with an incomplete frame, truncating"
                    );
                    self.truncate(offset as u64)?;
                    break;
                }
                Err(source) => return Err(AofError::Corrupt { offset, source }),
            }
        }

        info!(
            path = %self.path.display(),
            commands = stats.commands,
            "AOF replay complete"
        );
        Ok(stats)
    }

    fn truncate(&self, len: u64) -> Result<(), AofError> {
        let file = self.file.lock();
        file.set_len(len)
            .and_then(|_| file.sync_data())
            .map_err(|source| AofError::Io {
                path: self.path.clone(),
                source,
            })
    }
}

/// Exclusive append access to an [`AppendOnlyFile`].
pub struct AofWriter<'a> {
    file: MutexGuard<'a, File>,
    sync: bool,
}

impl AofWriter<'_> {
    /// Appends one encoded request frame.
    ///
    /// On failure the file is cut back to its previous length, so a later
    /// append never lands behind half a frame.
    pub fn append(&mut self, frame: &[u8]) -> io::Result<()> {
        append_frame(&mut *self.file, frame, self.sync)
    }
}

/// The few file operations an append needs.
trait LogSink: Write {
    fn end(&mut self) -> io::Result<u64>;
    fn cut(&mut self, len: u64) -> io::Result<()>;
    fn sync(&mut self) -> io::Result<()>;
}

impl LogSink for File {
    fn end(&mut self) -> io::Result<u64> {
        Ok(self.metadata()?.len())
    }

    fn cut(&mut self, len: u64) -> io::Result<()> {
        self.set_len(len)
    }

    fn sync(&mut self) -> io::Result<()> {
        self.sync_data()
    }
}

fn append_frame<S: LogSink>(sink: &mut S, frame: &[u8], sync: bool) -> io::Result<()> {
    let start = sink.end()?;

    let written = sink
        .write_all(frame)
        .and_then(|_| if sync { sink.sync() } else { Ok(()) });

    if let Err(e) = written {
        if let Err(cut) = sink.cut(start) {
            error!(error = %cut, len = start, "Failed to roll back partial AOF frame");
        }
        return Err(e);
    }
    Ok(())
}

/// Starts the once-per-second fsync task when the policy asks for it.
pub fn start_fsync_task(aof: Arc<AppendOnlyFile>) -> Option<JoinHandle<()>> {
    if aof.policy() != FsyncPolicy::EverySec {
        return None;
    }

    Some(tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(1));
        ticker.tick().await; // skip the immediate first tick
        loop {
            ticker.tick().await;
            match aof.sync() {
                Ok(()) => debug!(path = %aof.path().display(), "AOF synced"),
                Err(e) => error!(error = %e, path = %aof.path().display(), "AOF fsync failed"),
            }
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use tempfile::TempDir;

    fn command(args: &[&str]) -> RespValue {
        RespValue::array(
            args.iter()
                .map(|s| RespValue::bulk_string(Bytes::from(s.to_string())))
                .collect(),
        )
    }

    fn setup() -> (TempDir, PathBuf) {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("database.aof");
        (dir, path)
    }

    #[test]
    fn test_open_creates_file() {
        let (_dir, path) = setup();
        assert!(!path.exists());
        let aof = AppendOnlyFile::open(&path, FsyncPolicy::No).unwrap();
        assert!(path.exists());
        assert_eq!(aof.replay(|_| {}).unwrap(), ReplayStats::default());
    }

    #[test]
    fn test_append_and_replay_in_order() {
        let (_dir, path) = setup();
        let frames = vec![
            command(&["SET", "foo", "bar"]),
            command(&["HSET", "users", "u1", "colby"]),
            command(&["DEL", "foo"]),
        ];

        {
            let aof = AppendOnlyFile::open(&path, FsyncPolicy::Always).unwrap();
            for frame in &frames {
                aof.append_value(frame).unwrap();
            }
        }

        let aof = AppendOnlyFile::open(&path, FsyncPolicy::Always).unwrap();
        let mut replayed = Vec::new();
        let stats = aof.replay(|frame| replayed.push(frame)).unwrap();

        assert_eq!(stats.commands, 3);
        assert_eq!(stats.truncated_bytes, 0);
        assert_eq!(replayed, frames);
    }

    #[test]
    fn test_file_holds_request_encoding() {
        let (_dir, path) = setup();
        let aof = AppendOnlyFile::open(&path, FsyncPolicy::No).unwrap();
        aof.append_value(&command(&["SET", "foo", "bar"])).unwrap();

        assert_eq!(
            std::fs::read(&path).unwrap(),
            b"*3\r\n$3\r\nSET\r\n$3\r\nfoo\r\n$3\r\nbar\r\n"
        );
    }

    #[test]
    fn test_truncated_tail_is_dropped() {
        let (_dir, path) = setup();
        let whole = command(&["SET", "a", "1"]).serialize();
        let mut data = whole.clone();
        data.extend_from_slice(b"*3\r\n$3\r\nSET\r\n$1\r\nb");
        std::fs::write(&path, &data).unwrap();

        let aof = AppendOnlyFile::open(&path, FsyncPolicy::No).unwrap();
        let mut count = 0;
        let stats = aof.replay(|_| count += 1).unwrap();

        assert_eq!(count, 1);
        assert_eq!(stats.truncated_bytes, data.len() - whole.len());
        assert_eq!(std::fs::read(&path).unwrap(), whole);

        // appends after the cut replay cleanly
        aof.append_value(&command(&["SET", "c", "3"])).unwrap();
        assert_eq!(aof.replay(|_| {}).unwrap().commands, 2);
    }

    #[test]
    fn test_corrupt_frame_is_an_error() {
        let (_dir, path) = setup();
        let mut data = command(&["SET", "a", "1"]).serialize();
        let offset = data.len();
        data.extend_from_slice(b"?garbage\r\n");
        std::fs::write(&path, &data).unwrap();

        let aof = AppendOnlyFile::open(&path, FsyncPolicy::No).unwrap();
        match aof.replay(|_| {}) {
            Err(AofError::Corrupt { offset: at, source }) => {
                assert_eq!(at, offset);
                assert_eq!(source, ParseError::UnknownType(b'?'));
            }
            other => panic!("expected corruption error, got {:?}", other),
        }
    }

    #[test]
    fn test_open_in_missing_directory_fails() {
        let (dir, _) = setup();
        let path = dir.path().join("missing").join("database.aof");
        assert!(matches!(
            AppendOnlyFile::open(&path, FsyncPolicy::No),
            Err(AofError::Io { .. })
        ));
    }

    /// In-memory log that runs out of space after `room` bytes.
    struct ShortDisk {
        data: Vec<u8>,
        room: usize,
    }

    impl Write for ShortDisk {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.room == 0 {
                return Err(io::Error::other("no space left on device"));
            }
            let n = buf.len().min(self.room);
            self.data.extend_from_slice(&buf[..n]);
            self.room -= n;
            Ok(n)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl LogSink for ShortDisk {
        fn end(&mut self) -> io::Result<u64> {
            Ok(self.data.len() as u64)
        }

        fn cut(&mut self, len: u64) -> io::Result<()> {
            self.data.truncate(len as usize);
            Ok(())
        }

        fn sync(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_failed_append_leaves_no_partial_frame() {
        let first = command(&["SET", "a", "1"]).serialize();
        let second = command(&["SET", "b", "2"]).serialize();
        let third = command(&["SET", "c", "3"]).serialize();

        let mut disk = ShortDisk {
            data: Vec::new(),
            room: first.len() + 10,
        };
        append_frame(&mut disk, &first, false).unwrap();
        assert!(append_frame(&mut disk, &second, false).is_err());
        assert_eq!(disk.data, first);

        // space comes back, the next frame follows the last whole one
        disk.room = usize::MAX;
        append_frame(&mut disk, &third, true).unwrap();

        let (_dir, path) = setup();
        std::fs::write(&path, &disk.data).unwrap();
        let aof = AppendOnlyFile::open(&path, FsyncPolicy::No).unwrap();
        let mut replayed = Vec::new();
        let stats = aof.replay(|frame| replayed.push(frame)).unwrap();
        assert_eq!(stats.truncated_bytes, 0);
        assert_eq!(
            replayed,
            vec![command(&["SET", "a", "1"]), command(&["SET", "c", "3"])]
        );
    }

    #[test]
    fn test_writer_appends_to_file() {
        let (_dir, path) = setup();
        let aof = AppendOnlyFile::open(&path, FsyncPolicy::Always).unwrap();
        {
            let mut writer = aof.writer();
            writer.append(&command(&["DEL", "x"]).serialize()).unwrap();
            writer.append(&command(&["DEL", "y"]).serialize()).unwrap();
        }
        aof.append_value(&command(&["DEL", "z"])).unwrap();
        assert_eq!(aof.replay(|_| {}).unwrap().commands, 3);
    }

    #[tokio::test]
    async fn test_fsync_task_only_for_everysec() {
        let (_dir, path) = setup();

        let aof = Arc::new(AppendOnlyFile::open(&path, FsyncPolicy::Always).unwrap());
        assert!(start_fsync_task(aof).is_none());

        let aof = Arc::new(AppendOnlyFile::open(&path, FsyncPolicy::EverySec).unwrap());
        let task = start_fsync_task(aof).expect("everysec should spawn a task");
        task.abort();
    }
}
