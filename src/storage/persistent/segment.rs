//! Compacted snapshots of the sorted store.
//!
//! A segment file holds the header frame and then one frame with every
//! namespace. Only the highest-numbered segment is read; the others are
//! removed after a newer one has been renamed into place.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, Error as IoError, ErrorKind, Result as IoResult, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::storage::codec;
use crate::storage::snapshot::Entries;

const EXTENSION: &str = "seg";
const TEMP_MARKER: &str = ".tmp-";

/// Full store contents keyed by namespace.
pub type SegmentData = BTreeMap<String, Entries>;

/// Summary written ahead of the data frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SegmentMeta {
    /// Increases with every compaction.
    pub id: u32,
    /// Namespaces stored.
    pub namespaces: u64,
    /// Keys stored across all namespaces.
    pub keys: u64,
    /// When the segment was written.
    pub created_at: DateTime<Utc>,
}

impl SegmentMeta {
    fn describe(id: u32, data: &SegmentData) -> Self {
        Self {
            id,
            namespaces: data.len() as u64,
            keys: data.values().map(|e| e.len() as u64).sum(),
            created_at: Utc::now(),
        }
    }
}

/// A segment on disk.
#[derive(Debug)]
pub struct Segment {
    path: PathBuf,
    meta: SegmentMeta,
}

impl Segment {
    fn file_name(id: u32) -> String {
        format!("{id:08}.{EXTENSION}")
    }

    fn parse_id(name: &str) -> Option<u32> {
        name.strip_suffix(EXTENSION)?
            .strip_suffix('.')?
            .parse()
            .ok()
    }

    /// Reads the header of an existing segment.
    pub fn open(path: &Path) -> IoResult<Self> {
        let mut reader = BufReader::new(File::open(path)?);
        codec::read_header(&mut reader)?;
        let meta = codec::decode(&mut reader)?;
        Ok(Self {
            path: path.to_path_buf(),
            meta,
        })
    }

    /// File location.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Header contents.
    pub fn meta(&self) -> &SegmentMeta {
        &self.meta
    }

    /// Decodes the data frame.
    pub fn load(&self) -> IoResult<SegmentData> {
        let mut reader = BufReader::new(File::open(&self.path)?);
        codec::read_header(&mut reader)?;
        codec::decode::<SegmentMeta>(&mut reader)?;
        codec::decode(&mut reader)
    }

    /// Writes to a temp sibling, syncs it and renames it to `path`. The
    /// temp file is removed when any step fails.
    fn create(path: PathBuf, meta: SegmentMeta, data: &SegmentData) -> IoResult<Self> {
        let temp = path.with_extension(format!("{EXTENSION}{TEMP_MARKER}{}", Uuid::new_v4()));
        let written = (|| {
            let file = OpenOptions::new().write(true).create_new(true).open(&temp)?;
            let mut writer = BufWriter::new(file);
            codec::write_header(&mut writer)?;
            writer.write_all(&codec::encode(&meta)?)?;
            writer.write_all(&codec::encode(data)?)?;
            writer.flush()?;
            writer.get_ref().sync_all()?;
            drop(writer);
            fs::rename(&temp, &path)
        })();

        if let Err(e) = written {
            let _ = fs::remove_file(&temp);
            return Err(e);
        }
        Ok(Self { path, meta })
    }
}

/// The segment directory of one store.
#[derive(Debug)]
pub struct Segments {
    dir: PathBuf,
    live: Vec<Segment>,
    next_id: u32,
}

impl Segments {
    /// Opens `dir`, creating it when missing. Leftover temp files are
    /// removed. An unreadable segment is skipped with a warning only when
    /// a newer readable one exists.
    ///
    /// # Errors
    /// `InvalidData` when the newest segment cannot be read, since older
    /// ones were pruned and the WAL truncated when it was written.
    pub fn open(dir: &Path) -> IoResult<Self> {
        fs::create_dir_all(dir)?;

        let mut live = Vec::new();
        let mut broken: Option<(u32, PathBuf, IoError)> = None;
        let mut next_id = 1;
        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if name.contains(TEMP_MARKER) {
                let _ = fs::remove_file(&path);
                continue;
            }
            let Some(id) = Segment::parse_id(name) else {
                continue;
            };
            next_id = next_id.max(id + 1);
            match Segment::open(&path) {
                Ok(segment) => live.push((id, segment)),
                Err(e) => {
                    let newest = broken.as_ref().map_or(true, |(max, _, _)| id > *max);
                    let skipped = if newest {
                        broken.replace((id, path, e))
                    } else {
                        Some((id, path, e))
                    };
                    if let Some((_, path, e)) = skipped {
                        tracing::warn!(path = %path.display(), error = %e, "skipping unreadable segment");
                    }
                }
            }
        }
        live.sort_by_key(|(id, _)| *id);

        if let Some((id, path, e)) = broken {
            if live.last().map_or(true, |(newest, _)| id > *newest) {
                return Err(IoError::new(
                    ErrorKind::InvalidData,
                    format!("newest segment {} is unreadable: {e}", path.display()),
                ));
            }
            tracing::warn!(path = %path.display(), error = %e, "skipping unreadable segment");
        }
        let live = live.into_iter().map(|(_, segment)| segment).collect();

        Ok(Self {
            dir: dir.to_path_buf(),
            live,
            next_id,
        })
    }

    /// Directory holding the segments.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Segments currently on disk, oldest first.
    pub fn live(&self) -> &[Segment] {
        &self.live
    }

    /// Contents of the newest segment, empty when there is none.
    pub fn load_latest(&self) -> IoResult<SegmentData> {
        self.live
            .last()
            .map_or_else(|| Ok(SegmentData::new()), Segment::load)
    }

    /// Durably writes `data` as the newest segment, then prunes the rest.
    pub fn write(&mut self, data: &SegmentData) -> IoResult<&Segment> {
        let id = self.next_id;
        self.next_id += 1;

        let path = self.dir.join(Segment::file_name(id));
        let segment = Segment::create(path, SegmentMeta::describe(id, data), data)?;

        for old in std::mem::replace(&mut self.live, vec![segment]) {
            if let Err(e) = fs::remove_file(&old.path) {
                tracing::warn!(path = %old.path.display(), error = %e, "failed to prune segment");
            }
        }
        Ok(&self.live[0])
    }
}
