//! Durable relay checkpoint: which sub-directory is active, and how far into
//! the master's binlog the relay has persisted.
//!
//! On disk this is two files:
//!
//! - `<relay_root>/server-uuid.index`: the sub-directories the relay has ever
//!   followed, one per line, in promotion order. The last line is the active
//!   one.
//! - `<relay_root>/<uuid>/relay.meta`: JSON with the binlog name, offset, and
//!   GTID set text persisted for that sub-directory.
//!
//! Both files are replaced atomically (write to a sibling temp file, then
//! rename), so a reader never observes a half-written record. `save` is a
//! cheap in-memory update; durability comes from the periodic `flush`.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::config::Flavor;
use crate::error::{RelayError, Result};
use crate::gtid::GtidSet;
use crate::position::Position;

const UUID_INDEX_FILENAME: &str = "server-uuid.index";
const META_FILENAME: &str = "relay.meta";

/// Serialized form of one sub-directory's cursor.
#[derive(Debug, Serialize, Deserialize)]
struct MetaFile {
    binlog_name: String,
    binlog_pos: u32,
    binlog_gtid: String,
    updated_at: DateTime<Utc>,
}

#[derive(Debug)]
struct MetaInner {
    uuids: Vec<String>,
    pos: Position,
    gtid: GtidSet,
    dirty: bool,
}

/// Checkpoint store backed by the relay root directory.
///
/// Shared between the event loop (which mutates cursors) and the interval
/// flush task (which persists them); all state lives behind one mutex.
#[derive(Debug)]
pub struct LocalMeta {
    flavor: Flavor,
    root: PathBuf,
    inner: Mutex<MetaInner>,
}

impl LocalMeta {
    pub fn new(flavor: Flavor, root: impl Into<PathBuf>) -> Self {
        Self {
            flavor,
            root: root.into(),
            inner: Mutex::new(MetaInner {
                uuids: Vec::new(),
                pos: Position::default(),
                gtid: GtidSet::empty(flavor),
                dirty: false,
            }),
        }
    }

    /// Read the durable state, initializing to empty cursors when nothing has
    /// been persisted yet. Fails on corrupt or partially-written records.
    pub fn load(&self) -> Result<()> {
        let uuids = self.read_uuid_index()?;
        let current = uuids.last().cloned().unwrap_or_default();

        let mut pos = Position::default();
        let mut gtid = GtidSet::empty(self.flavor);
        if !current.is_empty() {
            let meta_path = self.root.join(&current).join(META_FILENAME);
            if meta_path.exists() {
                let content = fs::read_to_string(&meta_path)?;
                let record: MetaFile =
                    serde_json::from_str(&content).map_err(|e| RelayError::MetaCorrupt {
                        path: meta_path.display().to_string(),
                        reason: e.to_string(),
                    })?;
                pos = Position::new(record.binlog_name, record.binlog_pos);
                gtid = GtidSet::parse(self.flavor, &record.binlog_gtid)?;
            }
        }

        let mut inner = self.inner.lock();
        inner.uuids = uuids;
        inner.pos = pos;
        inner.gtid = gtid;
        inner.dirty = false;
        Ok(())
    }

    /// Register a new sub-directory and make it current.
    ///
    /// Creates the directory on disk, appends `uuid` to the promotion order,
    /// resets the position to the provided value (or the zero position), sets
    /// the GTID set when one is provided (leaving it unchanged otherwise),
    /// and persists everything before returning.
    pub fn add_dir(
        &self,
        uuid: &str,
        pos: Option<Position>,
        gtid: Option<GtidSet>,
    ) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.uuids.iter().any(|u| u == uuid) {
            return Err(RelayError::MetaCorrupt {
                path: self.root.display().to_string(),
                reason: format!("sub-directory {uuid} is already registered"),
            });
        }

        let dir = self.root.join(uuid);
        fs::create_dir(&dir)
            .map_err(|e| RelayError::from(e).context(format!("add sub relay directory {uuid}")))?;

        inner.uuids.push(uuid.to_string());
        inner.pos = pos.unwrap_or_default();
        if let Some(gtid) = gtid {
            inner.gtid = gtid;
        }

        self.persist(&inner)?;
        inner.dirty = false;
        Ok(())
    }

    /// Update the in-memory cursors. Cheap; no disk I/O. A `None` GTID set
    /// leaves the GTID field unchanged.
    pub fn save(&self, pos: &Position, gtid: Option<&GtidSet>) {
        let mut inner = self.inner.lock();
        inner.pos = pos.clone();
        if let Some(gtid) = gtid {
            inner.gtid = gtid.clone();
        }
        inner.dirty = true;
    }

    /// Atomically persist the current cursors and clear the dirty flag.
    pub fn flush(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.uuids.is_empty() {
            // Nothing registered yet; nothing to persist.
            inner.dirty = false;
            return Ok(());
        }
        self.persist(&inner)?;
        inner.dirty = false;
        Ok(())
    }

    /// True between a mutating `save` and the next successful `flush`.
    pub fn dirty(&self) -> bool {
        self.inner.lock().dirty
    }

    /// Current sub-directory and position.
    pub fn pos(&self) -> (String, Position) {
        let inner = self.inner.lock();
        (current_of(&inner.uuids), inner.pos.clone())
    }

    /// Current sub-directory and GTID set. The set is empty when no GTID has
    /// been recorded.
    pub fn gtid(&self) -> (String, GtidSet) {
        let inner = self.inner.lock();
        (current_of(&inner.uuids), inner.gtid.clone())
    }

    /// The active sub-directory name, empty before the first `add_dir`.
    pub fn uuid(&self) -> String {
        current_of(&self.inner.lock().uuids)
    }

    /// All registered sub-directories in promotion order.
    pub fn uuids(&self) -> Vec<String> {
        self.inner.lock().uuids.clone()
    }

    /// Filesystem path of the active sub-directory.
    pub fn dir(&self) -> PathBuf {
        self.root.join(self.uuid())
    }

    /// One-line human summary for logs.
    pub fn summary(&self) -> String {
        let inner = self.inner.lock();
        format!(
            "uuid = {}, pos = {}, gtid = {}",
            current_of(&inner.uuids),
            inner.pos,
            inner.gtid
        )
    }

    fn read_uuid_index(&self) -> Result<Vec<String>> {
        let path = self.root.join(UUID_INDEX_FILENAME);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let content = fs::read_to_string(&path)?;
        Ok(content
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect())
    }

    /// Write both files for the current state. Caller holds the lock.
    fn persist(&self, inner: &MetaInner) -> Result<()> {
        let current = current_of(&inner.uuids);

        let record = MetaFile {
            binlog_name: inner.pos.name.clone(),
            binlog_pos: inner.pos.pos,
            binlog_gtid: inner.gtid.to_string(),
            updated_at: Utc::now(),
        };
        let meta_path = self.root.join(&current).join(META_FILENAME);
        write_atomic(
            &meta_path,
            serde_json::to_string_pretty(&record)
                .map_err(|e| RelayError::MetaCorrupt {
                    path: meta_path.display().to_string(),
                    reason: e.to_string(),
                })?
                .as_bytes(),
        )?;

        let mut index = inner.uuids.join("\n");
        index.push('\n');
        write_atomic(&self.root.join(UUID_INDEX_FILENAME), index.as_bytes())
    }
}

fn current_of(uuids: &[String]) -> String {
    uuids.last().cloned().unwrap_or_default()
}

/// Replace `path` all-or-nothing: write a sibling temp file, then rename it
/// over the target.
fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(META_FILENAME);
    let tmp = path.with_file_name(format!("{file_name}.tmp"));
    fs::write(&tmp, bytes)?;
    fs::rename(&tmp, path)?;
    Ok(())
}
