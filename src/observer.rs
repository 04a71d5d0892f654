//! Injected observability hooks.
//!
//! The core emits counters, histograms, and gauges through a [`RelayObserver`]
//! supplied by the embedding process; it never talks to a metrics sink
//! directly. Every hook has a no-op default so implementors only override
//! what they export.

use std::time::Duration;

pub trait RelayObserver: Send + Sync {
    /// Duration of one `GetEvent` round, including deadline waits.
    fn binlog_read_duration(&self, _elapsed: Duration) {}

    /// Duration of one relay log append.
    fn relay_write_duration(&self, _elapsed: Duration) {}

    /// Size in bytes of one appended event.
    fn relay_write_size(&self, _bytes: u64) {}

    /// Latest persisted offset, labeled by master node and sub-directory.
    fn relay_log_position(&self, _master: &str, _uuid: &str, _pos: u32) {}

    /// Numeric index of the current relay log file.
    fn relay_log_file_index(&self, _master: &str, _uuid: &str, _index: u64) {}

    /// Total bytes under the relay root.
    fn relay_log_space(&self, _bytes: u64) {}

    fn relay_exit_with_error(&self) {}

    fn binlog_read_error(&self) {}

    fn relay_write_error(&self) {}

    /// Checksum mismatches, unwritable headers, and other signs of a corrupt
    /// stream or file.
    fn relay_log_data_corruption(&self) {}
}

/// Observer that drops everything.
pub struct NoopObserver;

impl RelayObserver for NoopObserver {}
