//! The relay engine.
//!
//! [`Relay`] subscribes to the master as a replica and mirrors the received
//! event stream byte-for-byte into the active sub-directory, keeping the meta
//! cursors one step behind the bytes: for every event visible in a file, the
//! in-memory position already covers it before the iteration returns. Meta
//! reaches disk on a 30-second interval and at close, so a crash replays at
//! most the tail since the last flush; the duplicate-FormatDescription probe
//! and position-aware restart reconcile the overlap.
//!
//! Exactly two tasks run per live relay: the event loop (owns the stream, the
//! writer, and the cursors) and the interval meta flusher (sees meta only
//! through `dirty`/`flush`).

use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::client::{BinlogUpstream, EventStream, MySqlUpstream};
use crate::config::{Flavor, RelayConfig};
use crate::error::{ProcessError, ProcessResult, RelayError, Result};
use crate::event::EventData;
use crate::gtid::GtidSet;
use crate::meta::LocalMeta;
use crate::observer::{NoopObserver, RelayObserver};
use crate::position::{binlog_file_index, Position};
use crate::writer::BinlogWriter;

/// Per-event read deadline. Exists to allow periodic idle logging, not to
/// fail the loop.
const EVENT_READ_TIMEOUT: Duration = Duration::from_secs(60 * 60);

/// How often the flush task persists dirty meta.
const FLUSH_META_INTERVAL: Duration = Duration::from_secs(30);

/// How often the disk usage of the relay root is reported.
const SPACE_REPORT_INTERVAL: Duration = Duration::from_secs(60);

/// Best-effort snapshot of where the relay stands against its master.
#[derive(Debug, Clone, Serialize)]
pub struct RelayStatus {
    pub master_binlog: String,
    pub master_binlog_gtid: String,
    pub relay_sub_dir: String,
    pub relay_binlog: String,
    pub relay_binlog_gtid: String,
    pub relay_catch_up_master: bool,
}

/// A binlog relay instance: one master, one relay root.
pub struct Relay {
    cfg: RelayConfig,
    meta: Arc<LocalMeta>,
    upstream: Box<dyn BinlogUpstream>,
    writer: BinlogWriter,
    observer: Arc<dyn RelayObserver>,
    /// Instance-level token: cancels the disk-usage reporter at close.
    shutdown: CancellationToken,
    closed: bool,
}

impl Relay {
    /// Create a relay over a real MySQL/MariaDB upstream.
    pub fn new(cfg: &RelayConfig) -> Self {
        Self::with_upstream(cfg, Box::new(MySqlUpstream::new(cfg)), Arc::new(NoopObserver))
    }

    /// Create a relay over any upstream implementation, with an injected
    /// observer.
    pub fn with_upstream(
        cfg: &RelayConfig,
        upstream: Box<dyn BinlogUpstream>,
        observer: Arc<dyn RelayObserver>,
    ) -> Self {
        Self {
            cfg: cfg.clone(),
            meta: Arc::new(LocalMeta::new(cfg.flavor, &cfg.relay_dir)),
            upstream,
            writer: BinlogWriter::new(observer.clone()),
            observer,
            shutdown: CancellationToken::new(),
            closed: false,
        }
    }

    /// Create the relay root, load the checkpoint, and start the background
    /// disk-usage reporter.
    pub async fn init(&mut self) -> Result<()> {
        fs::create_dir_all(&self.cfg.relay_dir)?;
        self.meta.load()?;
        self.spawn_space_reporter();
        Ok(())
    }

    /// Run the event loop until a fatal error or cancellation, then send
    /// exactly one [`ProcessResult`] on `results`.
    pub async fn process(
        &mut self,
        shutdown: CancellationToken,
        results: mpsc::Sender<ProcessResult>,
    ) {
        let flush_token = shutdown.child_token();
        let flush_handle = tokio::spawn(flush_meta_at_intervals(
            self.meta.clone(),
            flush_token.clone(),
        ));

        let outcome = self.run(&shutdown).await;
        self.writer.close();

        flush_token.cancel();
        let _ = flush_handle.await;

        let mut errors = Vec::new();
        if let Err(err) = outcome {
            if !matches!(err.root_cause(), RelayError::SyncClosed) {
                self.observer.relay_exit_with_error();
                error!("relay process exit with error {err}");
                errors.push(ProcessError::unknown(err.to_string()));
            }
        }
        let is_canceled = errors.is_empty() && shutdown.is_cancelled();
        let _ = results.send(ProcessResult { is_canceled, errors }).await;
    }

    /// Switch to a new master server. The operator must have drained the
    /// relay against the previous master first; that cannot be checked here
    /// because the master has already changed.
    pub async fn switch_master(&mut self) -> Result<()> {
        if !self.cfg.enable_gtid {
            return Err(RelayError::SwitchMasterNeedGtid);
        }
        self.re_setup_meta().await
    }

    /// Best-effort status snapshot. A failed master probe yields empty master
    /// fields rather than an error.
    pub async fn status(&mut self) -> RelayStatus {
        let (master_pos, master_gtid) = match self.upstream.master_status().await {
            Ok(status) => status,
            Err(e) => {
                warn!("get master status: {e}");
                (Position::default(), None)
            }
        };

        let (uuid, relay_pos) = self.meta.pos();
        let (_, relay_gtid) = self.meta.gtid();
        let master_binlog_gtid = master_gtid.map(|g| g.to_string()).unwrap_or_default();
        let relay_binlog_gtid = relay_gtid.to_string();
        let relay_catch_up_master = if self.cfg.enable_gtid {
            master_binlog_gtid == relay_binlog_gtid
        } else {
            master_pos == relay_pos
        };

        RelayStatus {
            master_binlog: master_pos.to_string(),
            master_binlog_gtid,
            relay_sub_dir: uuid,
            relay_binlog: relay_pos.to_string(),
            relay_binlog_gtid,
            relay_catch_up_master,
        }
    }

    /// Shut everything down: the dump connection (killed master-side), the
    /// current file, the control pool, and a final meta flush. Idempotent.
    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        info!("relay unit is closing");
        if let Err(e) = self.upstream.close().await {
            error!("close binlog upstream: {e}");
        }
        self.writer.close();
        if let Err(e) = self.meta.flush() {
            error!("flush checkpoint: {e}");
        }
        self.shutdown.cancel();
        self.closed = true;
        info!("relay unit closed");
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// The relay only ever resumes from its own meta.
    pub fn is_fresh_task(&self) -> Result<bool> {
        Ok(true)
    }

    /// Surface present; pausing is not implemented in this version.
    pub fn pause(&mut self) {}

    /// Surface present; resuming is not implemented in this version.
    pub fn resume(&mut self) {}

    /// Surface present; configuration updates require a stop/restart.
    pub fn update(&mut self, _cfg: &RelayConfig) -> Result<()> {
        Ok(())
    }

    async fn run(&mut self, shutdown: &CancellationToken) -> Result<()> {
        if self.meta.uuid().is_empty() {
            // No current sub-directory yet; register the master's.
            self.re_setup_meta().await?;
        }

        let mut stream = self.start_binlog_stream().await?;

        let (_, mut last_pos) = self.meta.pos();
        let (_, mut last_gtid) = self.meta.gtid();
        let master_node = self.cfg.from.node();
        let master_uuid = self.meta.uuid();
        // One-shot guard for auto-resync; reset after any successful event so
        // a purge after a long healthy run stays recoverable.
        let mut try_resync = true;

        loop {
            let read_started = Instant::now();
            let outcome = tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                read = tokio::time::timeout(EVENT_READ_TIMEOUT, stream.next_event()) => read,
            };
            self.observer.binlog_read_duration(read_started.elapsed());

            let event = match outcome {
                Err(_) => {
                    info!(
                        "deadline {}s exceeded, no binlog event received",
                        EVENT_READ_TIMEOUT.as_secs()
                    );
                    continue;
                }
                Ok(Err(err)) => {
                    match err.root_cause() {
                        RelayError::ChecksumMismatch => {
                            self.observer.relay_log_data_corruption();
                        }
                        RelayError::SyncClosed | RelayError::NeedSyncAgain => {}
                        RelayError::PurgedBinlog(_) => {
                            if try_resync && self.cfg.enable_gtid && self.cfg.auto_fix_gtid {
                                stream = self
                                    .resync_binlog()
                                    .await
                                    .map_err(|e| e.context("try auto switch with GTID"))?;
                                try_resync = false;
                                continue;
                            }
                            self.observer.binlog_read_error();
                        }
                        _ => {
                            self.observer.binlog_read_error();
                        }
                    }
                    return Err(err);
                }
                Ok(Ok(event)) => event,
            };
            try_resync = true;

            debug!("receive binlog event with header {:?}", event.header);
            match &event.data {
                EventData::FormatDescription => {
                    // First event of a binlog file: rotate the local file.
                    let exists = self
                        .writer
                        .on_format_description(&self.meta.dir(), &last_pos.name)?;
                    if exists {
                        // The resumed file already holds one; skip the duplicate.
                        continue;
                    }
                }
                EventData::Rotate {
                    next_log_name,
                    position,
                } => {
                    let current_pos = Position::new(next_log_name.clone(), *position as u32);
                    if current_pos > last_pos {
                        last_pos = current_pos;
                    }
                    info!("rotate to {last_pos}");
                    if event.is_fake_rotate() {
                        // Synthesized by the dump protocol; no bytes behind it.
                        continue;
                    }
                }
                EventData::Query { gtid_set } | EventData::Xid { gtid_set } => {
                    last_pos.pos = event.header.log_pos;
                    if let Some(gtid_set) = gtid_set {
                        last_gtid = gtid_set.clone();
                    }
                }
                EventData::Other => {}
            }
            if !self.cfg.enable_gtid {
                // Raw mode: every event advances the offset.
                last_pos.pos = event.header.log_pos;
            }

            let write_started = Instant::now();
            debug!("writing binlog event with header {:?}", event.header);
            self.writer.append(&event.raw)?;
            self.observer.relay_write_duration(write_started.elapsed());
            self.observer
                .relay_write_size(u64::from(event.header.event_size));
            self.observer
                .relay_log_position(&master_node, &master_uuid, last_pos.pos);
            match binlog_file_index(&last_pos.name) {
                Ok(index) => self
                    .observer
                    .relay_log_file_index(&master_node, &master_uuid, index),
                Err(e) => error!("parse binlog file name {}: {e}", last_pos.name),
            }

            self.meta.save(&last_pos, Some(&last_gtid));
        }
    }

    /// Fetch the master's UUID and register a fresh sub-directory for it.
    async fn re_setup_meta(&mut self) -> Result<()> {
        let uuid = self.upstream.server_uuid().await?;
        self.meta.add_dir(&uuid, None, None)?;
        self.meta.load()?;
        Ok(())
    }

    async fn start_binlog_stream(&mut self) -> Result<Box<dyn EventStream>> {
        if self.cfg.enable_gtid {
            self.start_sync_by_gtid().await
        } else {
            self.start_sync_by_pos().await
        }
    }

    async fn start_sync_by_gtid(&mut self) -> Result<Box<dyn EventStream>> {
        let (uuid, gtid) = self.meta.gtid();
        info!(
            "start sync for master ({}, {uuid}) from GTID set {gtid}",
            self.cfg.from.node()
        );
        match self.upstream.start_sync_by_gtid(&gtid).await {
            Ok(stream) => Ok(stream),
            Err(err) => {
                error!("start sync in GTID mode from {gtid} error {err}");
                self.start_sync_by_pos().await
            }
        }
    }

    /// Start a position dump, reconciling the recorded offset against the
    /// local file first: a missing file restarts from offset 4, a longer file
    /// advances the cursor to its end, a shorter file is fatal.
    async fn start_sync_by_pos(&mut self) -> Result<Box<dyn EventStream>> {
        let (uuid, mut pos) = self.meta.pos();
        info!(
            "start sync for master ({}, {uuid}) from {pos}",
            self.cfg.from.node()
        );
        if pos.name.is_empty() {
            // Let the master decide where to start.
            return self.upstream.start_sync_by_pos(pos).await;
        }

        let path = self.meta.dir().join(&pos.name);
        match fs::metadata(&path) {
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(
                    "should sync from {}:4 instead of {pos} because the binlog file does not exist locally",
                    pos.name
                );
                pos.pos = 4;
            }
            Err(e) => return Err(e.into()),
            Ok(stat) => {
                let size = stat.len();
                if size > u64::from(pos.pos) {
                    info!(
                        "the binlog file {} already contains position {}, so sync from {size}",
                        pos.name, pos.pos
                    );
                    pos.pos = size as u32;
                    self.meta.save(&pos, None);
                } else if size < u64::from(pos.pos) {
                    return Err(RelayError::BinlogPosGreaterThanFileSize {
                        name: pos.name.clone(),
                        file_size: size,
                        pos: pos.pos,
                    });
                }
            }
        }
        self.upstream.start_sync_by_pos(pos).await
    }

    /// Auto-fix after the master reported purged binlogs: rewrite the GTID
    /// set for the (new) master, add a sub-directory, and reopen the stream.
    async fn resync_binlog(&mut self) -> Result<Box<dyn EventStream>> {
        self.retry_sync_gtids().await?;
        self.upstream.reopen().await?;
        self.start_binlog_stream().await
    }

    /// Reconstruct the GTID set for a switched master. Assumes the new master
    /// was reset before promotion and only it takes writes now, so intervals
    /// for every other origin are kept and the new master's own intervals are
    /// taken from its current executed set.
    async fn retry_sync_gtids(&mut self) -> Result<()> {
        if self.cfg.flavor != Flavor::MySql {
            // No MariaDB GTID master query defined yet.
            return Ok(());
        }
        let (_, old_gtid) = self.meta.gtid();
        info!("start retry sync with old GTID {old_gtid}");

        let (_, master_gtid) = self
            .upstream
            .master_status()
            .await
            .map_err(|e| e.context("get master status"))?;
        let master_gtid = master_gtid.unwrap_or_else(|| GtidSet::empty(self.cfg.flavor));
        info!("new master GTID set {master_gtid}");

        let master_uuid = self
            .upstream
            .server_uuid()
            .await
            .map_err(|e| e.context("get master UUID"))?;
        info!("master UUID {master_uuid}");

        let mut merged = old_gtid;
        merged.replace(&master_gtid, &[master_uuid.clone()]);

        self.meta
            .add_dir(&master_uuid, None, Some(merged))
            .map_err(|e| {
                e.context(format!(
                    "add sub relay directory for master server {master_uuid}"
                ))
            })
    }

    fn spawn_space_reporter(&self) {
        let root = self.cfg.relay_dir.clone();
        let observer = self.observer.clone();
        let token = self.shutdown.child_token();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = tokio::time::sleep(SPACE_REPORT_INTERVAL) => {}
                }
                match dir_size(&root) {
                    Ok(bytes) => observer.relay_log_space(bytes),
                    Err(e) => warn!("report relay log space: {e}"),
                }
            }
        });
    }
}

async fn flush_meta_at_intervals(meta: Arc<LocalMeta>, token: CancellationToken) {
    let mut ticker = tokio::time::interval(FLUSH_META_INTERVAL);
    loop {
        tokio::select! {
            _ = token.cancelled() => return,
            _ = ticker.tick() => {
                if meta.dirty() {
                    match meta.flush() {
                        Ok(()) => info!("flush meta finished, {}", meta.summary()),
                        Err(e) => error!("flush meta error {e}"),
                    }
                }
            }
        }
    }
}

fn dir_size(path: &Path) -> std::io::Result<u64> {
    let mut total = 0;
    for entry in fs::read_dir(path)? {
        let entry = entry?;
        let meta = entry.metadata()?;
        if meta.is_dir() {
            total += dir_size(&entry.path())?;
        } else {
            total += meta.len();
        }
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dir_size_walks_sub_directories() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();
        fs::write(dir.path().join("a"), [0_u8; 10]).unwrap();
        fs::write(dir.path().join("sub").join("b"), [0_u8; 32]).unwrap();
        assert_eq!(dir_size(dir.path()).unwrap(), 42);
    }
}
