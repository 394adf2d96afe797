//! File-backed append-only subscription log.
//!
//! Layout: a 5-byte header (magic + version) followed by frames of
//! `u32 length | MessagePack entry | u32 CRC32`. Deletes are appended as
//! tombstones; [`SubscriptionLog::compact`] rewrites the file with only
//! live inserts.
//!
//! A frame is either fully committed (written and synced) or cut off again:
//! a failed append truncates the file back to the last committed offset, so
//! an insert reported as failed can never resurface on replay.

use crate::error::{RegistryError, Result};
use crate::storage::{StoredSubscription, SubscriptionStore};
use crate::types::{SubscriptionId, Timestamp};
use fs2::FileExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, error, warn};

/// Magic bytes for the subscription log.
const LOG_MAGIC: &[u8; 4] = b"SUB\0";

/// Current log format version.
const LOG_VERSION: u8 = 1;

const HEADER_LEN: u64 = 5;

/// Frames larger than this are treated as corruption.
const MAX_ENTRY_LEN: usize = 16 * 1024 * 1024;

#[derive(Clone, Debug, Serialize, Deserialize)]
struct LogEntry {
    seq: u64,
    timestamp: i64,
    operation: LogOperation,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
enum LogOperation {
    Insert {
        id: SubscriptionId,
        raw_request: Vec<u8>,
    },
    Delete {
        id: SubscriptionId,
    },
}

/// Destination of committed frames.
trait FrameSink: Write {
    fn sync(&mut self) -> io::Result<()>;

    /// Drop everything past `len` and continue writing from there.
    fn truncate_to(&mut self, len: u64) -> io::Result<()>;
}

impl FrameSink for File {
    fn sync(&mut self) -> io::Result<()> {
        self.sync_data()
    }

    fn truncate_to(&mut self, len: u64) -> io::Result<()> {
        self.set_len(len)?;
        self.seek(SeekFrom::Start(len))?;
        Ok(())
    }
}

/// Appends whole frames, rolling back to the last committed offset when an
/// append fails part way.
struct FrameWriter<S: FrameSink> {
    sink: S,
    /// End of the last frame known to be durable.
    committed: u64,
    /// Bytes past `committed` may be on disk.
    dirty: bool,
}

impl<S: FrameSink> FrameWriter<S> {
    fn new(sink: S, committed: u64) -> Self {
        Self {
            sink,
            committed,
            dirty: false,
        }
    }

    fn commit(&mut self, frame: &[u8]) -> Result<()> {
        if self.dirty {
            self.sink.truncate_to(self.committed)?;
            self.dirty = false;
        }

        match self.write_durably(frame) {
            Ok(()) => {
                self.committed += frame.len() as u64;
                Ok(())
            }
            Err(e) => {
                self.dirty = true;
                match self.sink.truncate_to(self.committed) {
                    Ok(()) => self.dirty = false,
                    Err(rollback) => error!(
                        offset = self.committed,
                        error = %rollback,
                        "failed to roll back partial log frame; retrying on next append"
                    ),
                }
                Err(e.into())
            }
        }
    }

    fn write_durably(&mut self, frame: &[u8]) -> io::Result<()> {
        self.sink.write_all(frame)?;
        self.sink.flush()?;
        self.sink.sync()
    }
}

struct LogState {
    writer: FrameWriter<File>,
    next_seq: u64,
    /// Live inserts keyed by id, with the sequence that wrote them.
    live: HashMap<SubscriptionId, (u64, Vec<u8>)>,
    /// Frames currently in the file.
    frames: u64,
}

/// Durable subscription store backed by a single log file.
///
/// The file is locked exclusively for as long as the log is open.
pub struct SubscriptionLog {
    path: PathBuf,
    state: Mutex<LogState>,
}

impl SubscriptionLog {
    /// Create or open a log file, replaying its contents.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;
        file.try_lock_exclusive().map_err(|_| RegistryError::Locked)?;

        let file_len = file.metadata()?.len();
        let state = if file_len >= HEADER_LEN {
            Self::replay(&path, file)?
        } else {
            if file_len > 0 {
                Self::discard_torn_header(&path, &mut file, file_len)?;
            }
            Self::write_header(&mut file)?;
            LogState {
                writer: FrameWriter::new(file, HEADER_LEN),
                next_seq: 1,
                live: HashMap::new(),
                frames: 0,
            }
        };

        Ok(Self {
            path,
            state: Mutex::new(state),
        })
    }

    /// Path of the log file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of live subscriptions.
    pub fn len(&self) -> usize {
        self.state.lock().live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of frames in the file, tombstones included.
    pub fn frame_count(&self) -> u64 {
        self.state.lock().frames
    }

    /// Rewrite the file so it holds only live inserts.
    pub fn compact(&self) -> Result<()> {
        let mut state = self.state.lock();

        let tmp_path = self.path.with_extension("compact");
        let mut tmp = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp_path)?;
        Self::write_header(&mut tmp)?;

        let mut live: Vec<_> = state.live.iter().collect();
        live.sort_by_key(|(_, (seq, _))| *seq);

        let mut writer = BufWriter::new(tmp);
        for (id, (seq, raw_request)) in &live {
            let entry = LogEntry {
                seq: *seq,
                timestamp: Timestamp::now().0,
                operation: LogOperation::Insert {
                    id: (*id).clone(),
                    raw_request: raw_request.clone(),
                },
            };
            writer.write_all(&Self::encode_frame(&entry)?)?;
        }
        let live_frames = live.len() as u64;
        writer.flush()?;
        let mut tmp = writer
            .into_inner()
            .map_err(|e| RegistryError::Io(e.into_error()))?;
        tmp.sync_all()?;

        tmp.try_lock_exclusive().map_err(|_| RegistryError::Locked)?;
        fs::rename(&tmp_path, &self.path)?;
        let end = tmp.seek(SeekFrom::End(0))?;

        let before = state.frames;
        state.frames = live_frames;
        state.writer = FrameWriter::new(tmp, end);

        debug!(
            path = %self.path.display(),
            frames_before = before,
            frames_after = state.frames,
            "compacted subscription log"
        );
        Ok(())
    }

    /// A file shorter than the header was cut off while being created.
    fn discard_torn_header(path: &Path, file: &mut File, file_len: u64) -> Result<()> {
        let mut partial = Vec::with_capacity(file_len as usize);
        file.read_to_end(&mut partial)?;

        let mut header = LOG_MAGIC.to_vec();
        header.push(LOG_VERSION);
        if !header.starts_with(&partial) {
            return Err(RegistryError::InvalidFormat(
                "Invalid subscription log magic".into(),
            ));
        }

        warn!(
            path = %path.display(),
            bytes = file_len,
            "rewriting incomplete subscription log header"
        );
        file.truncate_to(0)?;
        Ok(())
    }

    fn replay(path: &Path, file: File) -> Result<LogState> {
        let file_len = file.metadata()?.len();
        let mut reader = BufReader::new(&file);

        let mut magic = [0u8; 4];
        reader.read_exact(&mut magic)?;
        if &magic != LOG_MAGIC {
            return Err(RegistryError::InvalidFormat("Invalid subscription log magic".into()));
        }

        let mut version = [0u8; 1];
        reader.read_exact(&mut version)?;
        if version[0] != LOG_VERSION {
            return Err(RegistryError::InvalidFormat(format!(
                "Unsupported subscription log version: {}",
                version[0]
            )));
        }

        let mut live = HashMap::new();
        let mut max_seq = 0u64;
        let mut frames = 0u64;
        let mut valid_end = HEADER_LEN;

        loop {
            match Self::read_entry(&mut reader) {
                Ok(Some((entry, frame_len))) => {
                    max_seq = max_seq.max(entry.seq);
                    frames += 1;
                    valid_end += frame_len;
                    match entry.operation {
                        LogOperation::Insert { id, raw_request } => {
                            live.insert(id, (entry.seq, raw_request));
                        }
                        LogOperation::Delete { id } => {
                            live.remove(&id);
                        }
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        offset = valid_end,
                        error = %e,
                        "stopping subscription log replay at unreadable frame"
                    );
                    break;
                }
            }
        }
        drop(reader);

        let mut file = file;
        if valid_end < file_len {
            warn!(
                path = %path.display(),
                valid_bytes = valid_end,
                discarded_bytes = file_len - valid_end,
                "truncating torn tail of subscription log"
            );
            file.set_len(valid_end)?;
            file.sync_all()?;
        }
        file.seek(SeekFrom::Start(valid_end))?;

        Ok(LogState {
            writer: FrameWriter::new(file, valid_end),
            next_seq: max_seq + 1,
            live,
            frames,
        })
    }

    fn append(state: &mut LogState, operation: LogOperation) -> Result<u64> {
        let seq = state.next_seq;
        let entry = LogEntry {
            seq,
            timestamp: Timestamp::now().0,
            operation,
        };

        let frame = Self::encode_frame(&entry)?;
        state.writer.commit(&frame)?;

        state.next_seq += 1;
        state.frames += 1;
        Ok(seq)
    }

    fn write_header(file: &mut File) -> Result<()> {
        file.write_all(LOG_MAGIC)?;
        file.write_all(&[LOG_VERSION])?;
        file.sync_all()?;
        Ok(())
    }

    fn encode_frame(entry: &LogEntry) -> Result<Vec<u8>> {
        let encoded = rmp_serde::to_vec(entry)?;
        let checksum = crc32fast::hash(&encoded);

        let mut frame = Vec::with_capacity(encoded.len() + 8);
        frame.extend_from_slice(&(encoded.len() as u32).to_le_bytes());
        frame.extend_from_slice(&encoded);
        frame.extend_from_slice(&checksum.to_le_bytes());
        Ok(frame)
    }

    /// Read one frame; `None` at a clean end of file.
    fn read_entry(reader: &mut impl Read) -> Result<Option<(LogEntry, u64)>> {
        let mut len_bytes = [0u8; 4];
        let mut filled = 0;
        while filled < len_bytes.len() {
            match reader.read(&mut len_bytes[filled..]) {
                Ok(0) if filled == 0 => return Ok(None),
                Ok(0) => return Err(RegistryError::Corruption("truncated frame length".into())),
                Ok(n) => filled += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }

        let len = u32::from_le_bytes(len_bytes) as usize;
        if len > MAX_ENTRY_LEN {
            return Err(RegistryError::Corruption("log entry too large".into()));
        }

        let mut encoded = vec![0u8; len];
        reader.read_exact(&mut encoded)?;

        let mut checksum_bytes = [0u8; 4];
        reader.read_exact(&mut checksum_bytes)?;
        let expected = u32::from_le_bytes(checksum_bytes);

        let got = crc32fast::hash(&encoded);
        if expected != got {
            return Err(RegistryError::ChecksumMismatch { expected, got });
        }

        let entry = rmp_serde::from_slice(&encoded)?;
        Ok(Some((entry, (4 + len + 4) as u64)))
    }
}

impl SubscriptionStore for SubscriptionLog {
    fn insert(&self, id: &SubscriptionId, raw_request: &[u8]) -> Result<()> {
        let mut state = self.state.lock();
        let seq = Self::append(
            &mut state,
            LogOperation::Insert {
                id: id.clone(),
                raw_request: raw_request.to_vec(),
            },
        )?;
        state.live.insert(id.clone(), (seq, raw_request.to_vec()));
        Ok(())
    }

    fn delete(&self, id: &SubscriptionId) -> Result<()> {
        let mut state = self.state.lock();
        if !state.live.contains_key(id) {
            return Ok(());
        }
        Self::append(&mut state, LogOperation::Delete { id: id.clone() })?;
        state.live.remove(id);
        Ok(())
    }

    fn list_all(&self) -> Result<Vec<StoredSubscription>> {
        let state = self.state.lock();
        let mut live: Vec<_> = state.live.iter().collect();
        live.sort_by_key(|(_, (seq, _))| *seq);
        Ok(live
            .into_iter()
            .map(|(id, (_, raw_request))| StoredSubscription {
                id: id.clone(),
                raw_request: raw_request.clone(),
            })
            .collect())
    }
}
