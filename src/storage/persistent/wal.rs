//! Append-only mutation log of the sorted store.
//!
//! ```text
//! [MAGIC][version] [record] [record] ...
//! ```
//!
//! Each record is one codec frame. On open the log is scanned up to the
//! first frame that fails to decode; anything after it is a torn or
//! corrupt tail and is cut off so new records start on a clean boundary.

use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, Error as IoError, ErrorKind, Result as IoResult, Seek, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::storage::codec;
use crate::storage::snapshot::Entries;

/// Bytes taken by the file header.
const HEADER_LEN: u64 = 5;

/// One logged mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Op {
    /// Namespace opened for the first time.
    Create {
        /// Namespace name.
        namespace: String,
    },
    /// Key written.
    Put {
        /// Namespace name.
        namespace: String,
        /// Key.
        key: String,
        /// New value.
        value: Vec<u8>,
    },
    /// Key removed.
    Delete {
        /// Namespace name.
        namespace: String,
        /// Key.
        key: String,
    },
    /// Whole namespace imported in one record, so replay never sees half of it.
    Import {
        /// Namespace name.
        namespace: String,
        /// Imported pairs, merged over existing keys.
        entries: Entries,
    },
}

/// A sequenced, timestamped [`Op`] as stored on disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Record {
    /// Position in the log since the last truncation, starting at 1.
    pub seq: u64,
    /// Wall-clock time of the append.
    pub at: DateTime<Utc>,
    /// The mutation.
    pub op: Op,
}

struct Inner {
    writer: Option<BufWriter<File>>,
    seq: u64,
}

/// The log file plus its append cursor.
pub struct Wal {
    path: PathBuf,
    sync: bool,
    inner: Mutex<Inner>,
}

impl Wal {
    /// Opens `path`, creating it when missing, and returns the intact
    /// records in append order.
    pub fn open(path: &Path, sync: bool) -> IoResult<(Self, Vec<Record>)> {
        let has_header = fs::metadata(path).map_or(false, |m| m.len() >= HEADER_LEN);
        let records = if has_header {
            let (records, valid) = scan(path)?;
            cut_tail(path, valid)?;
            records
        } else {
            reset(path, sync)?;
            Vec::new()
        };

        let wal = Self {
            path: path.to_path_buf(),
            sync,
            inner: Mutex::new(Inner {
                writer: Some(appender(path)?),
                seq: records.last().map_or(0, |r| r.seq),
            }),
        };
        Ok((wal, records))
    }

    fn inner(&self) -> IoResult<MutexGuard<'_, Inner>> {
        self.inner
            .lock()
            .map_err(|_| IoError::new(ErrorKind::Other, "poisoned lock: wal"))
    }

    /// Appends `op` and returns its sequence number. The sequence only
    /// advances once the frame is written.
    pub fn append(&self, op: Op) -> IoResult<u64> {
        let mut inner = self.inner()?;
        let seq = inner.seq + 1;
        let frame = codec::encode(&Record {
            seq,
            at: Utc::now(),
            op,
        })?;

        let writer = inner
            .writer
            .as_mut()
            .ok_or_else(|| IoError::new(ErrorKind::Other, "wal is closed"))?;
        writer.write_all(&frame)?;
        writer.flush()?;
        if self.sync {
            writer.get_ref().sync_data()?;
        }
        inner.seq = seq;
        Ok(seq)
    }

    /// Last assigned sequence number.
    pub fn seq(&self) -> u64 {
        self.inner.lock().map_or(0, |i| i.seq)
    }

    /// Current file size.
    pub fn len(&self) -> IoResult<u64> {
        Ok(fs::metadata(&self.path)?.len())
    }

    /// True when only the header is present.
    pub fn is_empty(&self) -> IoResult<bool> {
        Ok(self.len()? <= HEADER_LEN)
    }

    /// Drops every record. Call only once a segment covering them is durable.
    pub fn truncate(&self) -> IoResult<()> {
        let mut inner = self.inner()?;
        if let Some(mut old) = inner.writer.take() {
            old.flush()?;
        }
        reset(&self.path, self.sync)?;
        inner.writer = Some(appender(&self.path)?);
        inner.seq = 0;
        Ok(())
    }

    /// Flushes, syncs and releases the file. Later appends fail.
    pub fn close(&self) -> IoResult<()> {
        let mut inner = self.inner()?;
        match inner.writer.take() {
            Some(mut writer) => {
                writer.flush()?;
                writer.get_ref().sync_all()
            }
            None => Ok(()),
        }
    }
}

fn appender(path: &Path) -> IoResult<BufWriter<File>> {
    Ok(BufWriter::new(OpenOptions::new().append(true).open(path)?))
}

/// Rewrites `path` as a log holding only the header.
fn reset(path: &Path, sync: bool) -> IoResult<()> {
    let mut file = File::create(path)?;
    codec::write_header(&mut file)?;
    if sync {
        file.sync_all()?;
    }
    Ok(())
}

/// Decodes records until EOF or the first bad frame. Returns them with the
/// byte offset where the good prefix ends.
fn scan(path: &Path) -> IoResult<(Vec<Record>, u64)> {
    let file = File::open(path)?;
    let size = file.metadata()?.len();
    let mut reader = BufReader::new(file);
    codec::read_header(&mut reader)?;

    let mut records: Vec<Record> = Vec::new();
    let mut valid = reader.stream_position()?;
    while valid < size {
        match codec::decode::<Record>(&mut reader) {
            Ok(record) => {
                records.push(record);
                valid = reader.stream_position()?;
            }
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    last_seq = records.last().map_or(0, |r| r.seq),
                    error = %e,
                    "wal replay stopped at unreadable record"
                );
                break;
            }
        }
    }
    Ok((records, valid))
}

fn cut_tail(path: &Path, valid: u64) -> IoResult<()> {
    let file = OpenOptions::new().write(true).open(path)?;
    let size = file.metadata()?.len();
    if size > valid {
        tracing::warn!(path = %path.display(), dropped = size - valid, "truncating wal tail");
        file.set_len(valid)?;
        file.sync_all()?;
    }
    Ok(())
}
