//! A MySQL binlog relay.
//!
//! The relay subscribes to a MySQL-protocol master as if it were a replica
//! and persists the received binlog event stream, byte for byte, into a local
//! directory tree. Downstream processors read those files as a durable,
//! seekable mirror of the upstream write-ahead log, decoupled from the
//! master's retention and surviving master failovers.
//!
//! # Architecture
//!
//! - [`Relay`]: the engine: event loop, lifecycle, switchover/resync
//! - [`LocalMeta`]: crash-consistent checkpoint (position + GTID set) with
//!   one sub-directory per master the relay has followed
//! - [`BinlogUpstream`] / [`EventStream`]: the seam to the master; the real
//!   implementation is [`MySqlUpstream`] over `mysql_async`
//! - [`BinlogWriter`]: owns the currently-open relay log file
//! - [`RelayObserver`]: injected counters/histograms/gauges
//!
//! # Relay directory layout
//!
//! ```text
//! <relay_root>/
//!   <uuid_1>/
//!     mysql-bin.000001      # "\xfebin" magic + raw events
//!     mysql-bin.000002
//!     relay.meta            # JSON cursor for this sub-directory
//!   <uuid_2>/
//!     ...
//!   server-uuid.index       # sub-directories in promotion order
//! ```

pub mod client;
pub mod config;
pub mod error;
pub mod event;
pub mod gtid;
pub mod meta;
pub mod observer;
pub mod position;
pub mod relay;
pub mod writer;

pub use client::{BinlogUpstream, EventStream, MySqlUpstream};
pub use config::{Flavor, MasterConfig, RelayConfig};
pub use error::{ErrorKind, ProcessError, ProcessResult, RelayError, Result};
pub use event::{EventData, EventHeader, RelayEvent, BINLOG_MAGIC};
pub use gtid::GtidSet;
pub use meta::LocalMeta;
pub use observer::{NoopObserver, RelayObserver};
pub use position::Position;
pub use relay::{Relay, RelayStatus};
pub use writer::BinlogWriter;
