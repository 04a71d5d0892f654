//! Relay log file writer.
//!
//! Owns the currently-open binlog file. A file is opened when a
//! FormatDescriptionEvent names it, closed when the next one arrives (or at
//! shutdown), and only ever appended to in between. Every file starts with
//! the 4-byte binlog magic; a FormatDescriptionEvent already present in a
//! resumed file is detected here so the event loop can skip the duplicate.

use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::Arc;

use tracing::{debug, info};

use crate::error::{RelayError, Result};
use crate::event::{event_type, EventHeader, BINLOG_MAGIC, EVENT_HEADER_LEN};
use crate::observer::RelayObserver;

pub struct BinlogWriter {
    observer: Arc<dyn RelayObserver>,
    file: Option<File>,
}

impl BinlogWriter {
    pub fn new(observer: Arc<dyn RelayObserver>) -> Self {
        Self {
            observer,
            file: None,
        }
    }

    /// Switch to the file named by a FormatDescriptionEvent.
    ///
    /// Closes any previously-open file, opens (creating if absent)
    /// `<dir>/<filename>`, makes sure it starts with the binlog magic, and
    /// seeks to its end. Returns whether the file already contains a
    /// FormatDescriptionEvent, in which case the caller must not append the
    /// incoming duplicate.
    pub fn on_format_description(&mut self, dir: &Path, filename: &str) -> Result<bool> {
        self.file = None;

        if filename.is_empty() {
            self.observer.relay_log_data_corruption();
            return Err(RelayError::EmptyBinlogFilename);
        }

        let full_path = dir.join(filename);
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&full_path)
            .map_err(|e| {
                RelayError::from(e).context(format!("open relay log file {}", full_path.display()))
            })?;

        self.write_magic_if_missing(&mut file)?;
        let exists = self.format_description_exists(&mut file, filename)?;

        let end = file.seek(SeekFrom::End(0))?;
        info!("relay log file {filename} seek to end ({end})");

        self.file = Some(file);
        Ok(exists)
    }

    /// Append one raw event. The caller passes the bytes exactly as received
    /// from the master.
    pub fn append(&mut self, raw: &[u8]) -> Result<()> {
        let file = self.file.as_mut().ok_or(RelayError::NoRelayFile)?;
        if let Err(e) = file.write_all(raw) {
            self.observer.relay_write_error();
            return Err(e.into());
        }
        Ok(())
    }

    /// Close the current file, if any.
    pub fn close(&mut self) {
        self.file = None;
    }

    fn write_magic_if_missing(&self, file: &mut File) -> Result<()> {
        let mut head = [0_u8; BINLOG_MAGIC.len()];
        file.seek(SeekFrom::Start(0))?;
        match file.read_exact(&mut head) {
            Ok(()) if head == BINLOG_MAGIC => return Ok(()),
            // Empty or shorter than the magic, or holding other bytes where
            // the magic belongs; both get the header (re)written.
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => {}
            Err(e) => {
                self.observer.relay_log_data_corruption();
                return Err(e.into());
            }
        }
        file.seek(SeekFrom::Start(0))?;
        debug!("write binlog file header");
        file.write_all(&BINLOG_MAGIC)?;
        Ok(())
    }

    /// Probe whether a complete FormatDescriptionEvent already follows the
    /// magic.
    fn format_description_exists(&self, file: &mut File, filename: &str) -> Result<bool> {
        file.seek(SeekFrom::Start(BINLOG_MAGIC.len() as u64))?;
        let mut header_bytes = [0_u8; EVENT_HEADER_LEN];
        match file.read_exact(&mut header_bytes) {
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(false),
            Err(e) => return Err(e.into()),
            Ok(()) => {}
        }

        let header = EventHeader::parse(&header_bytes).map_err(|e| {
            self.observer.relay_log_data_corruption();
            e.context(format!("first event of relay log file {filename}"))
        })?;
        if header.event_type != event_type::FORMAT_DESCRIPTION {
            self.observer.relay_log_data_corruption();
            return Err(RelayError::InvalidEvent(format!(
                "relay log file {filename} starts with event type {} instead of a FormatDescriptionEvent",
                header.event_type
            )));
        }

        let file_len = file.metadata()?.len();
        if file_len < BINLOG_MAGIC.len() as u64 + u64::from(header.event_size) {
            self.observer.relay_log_data_corruption();
            return Err(RelayError::InvalidEvent(format!(
                "relay log file {filename} holds a truncated FormatDescriptionEvent ({} of {} bytes)",
                file_len - BINLOG_MAGIC.len() as u64,
                header.event_size
            )));
        }

        info!("relay log file {filename} already has a Format_desc event, so ignore it");
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observer::NoopObserver;
    use std::fs;

    fn writer() -> BinlogWriter {
        BinlogWriter::new(Arc::new(NoopObserver))
    }

    fn fde_raw(payload_len: usize) -> Vec<u8> {
        let header = EventHeader {
            timestamp: 1_700_000_000,
            event_type: event_type::FORMAT_DESCRIPTION,
            server_id: 1,
            event_size: (EVENT_HEADER_LEN + payload_len) as u32,
            log_pos: (BINLOG_MAGIC.len() + EVENT_HEADER_LEN + payload_len) as u32,
            flags: 0,
        };
        let mut raw = header.encode().to_vec();
        raw.extend(std::iter::repeat(0_u8).take(payload_len));
        raw
    }

    #[test]
    fn test_empty_filename_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let mut w = writer();
        assert!(matches!(
            w.on_format_description(dir.path(), ""),
            Err(RelayError::EmptyBinlogFilename)
        ));
    }

    #[test]
    fn test_fresh_file_gets_magic() {
        let dir = tempfile::tempdir().unwrap();
        let mut w = writer();
        let exists = w
            .on_format_description(dir.path(), "mysql-bin.000001")
            .unwrap();
        assert!(!exists);

        let content = fs::read(dir.path().join("mysql-bin.000001")).unwrap();
        assert_eq!(content, BINLOG_MAGIC);
    }

    #[test]
    fn test_garbage_header_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("mysql-bin.000001"), b"abcd").unwrap();

        let mut w = writer();
        let exists = w
            .on_format_description(dir.path(), "mysql-bin.000001")
            .unwrap();
        assert!(!exists);
        let content = fs::read(dir.path().join("mysql-bin.000001")).unwrap();
        assert_eq!(content, BINLOG_MAGIC);
    }

    #[test]
    fn test_detects_existing_format_description() {
        let dir = tempfile::tempdir().unwrap();
        let mut seeded = BINLOG_MAGIC.to_vec();
        seeded.extend(fde_raw(81));
        fs::write(dir.path().join("mysql-bin.000001"), &seeded).unwrap();

        let mut w = writer();
        let exists = w
            .on_format_description(dir.path(), "mysql-bin.000001")
            .unwrap();
        assert!(exists);
    }

    #[test]
    fn test_truncated_format_description_is_corruption() {
        let dir = tempfile::tempdir().unwrap();
        let mut seeded = BINLOG_MAGIC.to_vec();
        let full = fde_raw(81);
        seeded.extend(&full[..full.len() - 10]);
        fs::write(dir.path().join("mysql-bin.000001"), &seeded).unwrap();

        let mut w = writer();
        assert!(w
            .on_format_description(dir.path(), "mysql-bin.000001")
            .is_err());
    }

    #[test]
    fn test_append_goes_to_end() {
        let dir = tempfile::tempdir().unwrap();
        let mut seeded = BINLOG_MAGIC.to_vec();
        seeded.extend(fde_raw(81));
        let seeded_len = seeded.len();
        fs::write(dir.path().join("mysql-bin.000001"), &seeded).unwrap();

        let mut w = writer();
        w.on_format_description(dir.path(), "mysql-bin.000001")
            .unwrap();
        w.append(b"more-bytes").unwrap();

        let content = fs::read(dir.path().join("mysql-bin.000001")).unwrap();
        assert_eq!(content.len(), seeded_len + "more-bytes".len());
        assert!(content.ends_with(b"more-bytes"));
    }

    #[test]
    fn test_append_without_open_file() {
        let mut w = writer();
        assert!(matches!(w.append(b"x"), Err(RelayError::NoRelayFile)));
    }
}
