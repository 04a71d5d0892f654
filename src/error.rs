//! Error types for the relay.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, RelayError>;

/// Errors produced by the relay engine and its collaborators.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("upstream database error: {0}")]
    Database(#[from] mysql_async::Error),

    /// The recorded meta position points beyond the end of the local binlog
    /// file; the file tree and the checkpoint disagree and streaming must not
    /// continue.
    #[error("the specific position is greater than the local binlog file size: {name} size={file_size}, specific pos={pos}")]
    BinlogPosGreaterThanFileSize {
        name: String,
        file_size: u64,
        pos: u32,
    },

    #[error("write FormatDescriptionEvent with empty binlog filename")]
    EmptyBinlogFilename,

    #[error("no relay log file is open for writing")]
    NoRelayFile,

    #[error("invalid binlog file name {0:?}")]
    InvalidBinlogFilename(String),

    #[error("invalid binlog event: {0}")]
    InvalidEvent(String),

    #[error("binlog event checksum mismatch")]
    ChecksumMismatch,

    /// The upstream stream was closed under us; terminal for this run.
    #[error("binlog sync closed")]
    SyncClosed,

    /// The upstream asks the replica to reconnect; terminal for this run.
    #[error("binlog sync needs to be restarted")]
    NeedSyncAgain,

    /// The requested binlog has been purged on the master.
    #[error("binlog purged on master: {0}")]
    PurgedBinlog(String),

    #[error("unexpected upstream response: {0}")]
    Upstream(String),

    #[error("corrupt relay meta at {path}: {reason}")]
    MetaCorrupt { path: String, reason: String },

    #[error("invalid GTID set {text:?}: {reason}")]
    GtidParse { text: String, reason: String },

    #[error("can only switch relay's master server when GTID enabled")]
    SwitchMasterNeedGtid,

    #[error("{context}: {source}")]
    Context {
        context: String,
        #[source]
        source: Box<RelayError>,
    },
}

impl RelayError {
    /// Wrap with a human context line, keeping the cause chain.
    pub fn context(self, context: impl Into<String>) -> Self {
        RelayError::Context {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// The innermost error, with any context layers stripped.
    pub fn root_cause(&self) -> &RelayError {
        match self {
            RelayError::Context { source, .. } => source.root_cause(),
            other => other,
        }
    }
}

/// Abstract kind attached to errors reported on the process result.
///
/// Everything is reported as `Unknown` for now; granular kinds can be added
/// without changing the result shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Unknown,
}

/// One fatal error surfaced by a finished `process` run.
#[derive(Debug, Clone)]
pub struct ProcessError {
    pub kind: ErrorKind,
    pub message: String,
}

impl ProcessError {
    pub fn unknown(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Unknown,
            message: message.into(),
        }
    }
}

/// Terminal report of one `process` run, sent exactly once on the result
/// channel.
#[derive(Debug, Clone, Default)]
pub struct ProcessResult {
    /// True only when the run ended without error because the caller
    /// cancelled it.
    pub is_canceled: bool,
    pub errors: Vec<ProcessError>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_keeps_root_cause() {
        let err = RelayError::SyncClosed.context("start sync in GTID mode");
        assert!(matches!(err.root_cause(), RelayError::SyncClosed));
        assert!(err.to_string().contains("start sync in GTID mode"));
    }

    #[test]
    fn test_pos_greater_than_file_size_message() {
        let err = RelayError::BinlogPosGreaterThanFileSize {
            name: "mysql-bin.000002".to_string(),
            file_size: 300,
            pos: 500,
        };
        let msg = err.to_string();
        assert!(msg.contains("mysql-bin.000002"));
        assert!(msg.contains("size=300"));
        assert!(msg.contains("pos=500"));
    }
}
