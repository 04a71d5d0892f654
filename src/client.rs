//! Upstream replication client.
//!
//! [`BinlogUpstream`] and [`EventStream`] are the seam between the event loop
//! and the master: the loop only ever sees [`RelayEvent`]s, so tests can
//! drive it from a scripted in-memory upstream. [`MySqlUpstream`] is the real
//! implementation over `mysql_async`: a lazy pool for control queries (server
//! UUID, master status, KILL) and one dedicated replica connection per
//! `start_sync_*` call for the dump stream.
//!
//! When GTID mode is disabled the stream runs in raw mode: only
//! FormatDescriptionEvent and RotateEvent are classified, everything else is
//! delivered as header-plus-raw-bytes. This keeps CPU out of the hot path and
//! payloads byte-identical.

use async_trait::async_trait;
use futures::StreamExt;
use mysql_async::binlog::events::Event;
use mysql_async::binlog::{BinlogChecksumAlg, BinlogVersion};
use mysql_async::prelude::*;
use mysql_async::{BinlogStream, BinlogStreamRequest, Conn, Opts, OptsBuilder, Pool};
use tracing::{debug, info};

use crate::config::{Flavor, RelayConfig};
use crate::error::{RelayError, Result};
use crate::event::{event_type, EventData, EventHeader, RelayEvent, EVENT_HEADER_LEN};
use crate::gtid::GtidSet;
use crate::position::Position;

/// `ER_MASTER_FATAL_ERROR_READING_BINLOG`: the requested binlog has been
/// purged on the master.
const ER_MASTER_FATAL_ERROR_READING_BINLOG: u16 = 1236;

/// `ER_NO_SUCH_THREAD`: the connection we try to kill is already gone.
const ER_NO_SUCH_THREAD: u16 = 1094;

/// A live binlog dump stream.
#[async_trait]
pub trait EventStream: Send {
    /// Next event from the master. Blocks until one arrives; the caller is
    /// responsible for deadlines.
    async fn next_event(&mut self) -> Result<RelayEvent>;
}

/// The master server, as seen by the relay.
#[async_trait]
pub trait BinlogUpstream: Send {
    /// Identity of the master: the `server_uuid` variable for MySQL,
    /// `<gtid_domain_id>-<server_id>` for MariaDB.
    async fn server_uuid(&mut self) -> Result<String>;

    /// Current master position and executed GTID set, when one is reported.
    async fn master_status(&mut self) -> Result<(Position, Option<GtidSet>)>;

    async fn start_sync_by_pos(&mut self, pos: Position) -> Result<Box<dyn EventStream>>;

    async fn start_sync_by_gtid(&mut self, gtid: &GtidSet) -> Result<Box<dyn EventStream>>;

    /// Connection id the master assigned to the most recent dump stream.
    fn last_connection_id(&self) -> u32;

    /// Tear down the current dump connection (killing it master-side) so a
    /// new `start_sync_*` starts from a clean slate.
    async fn reopen(&mut self) -> Result<()>;

    async fn close(&mut self) -> Result<()>;
}

/// Real upstream over `mysql_async`.
pub struct MySqlUpstream {
    cfg: RelayConfig,
    opts: Opts,
    pool: Pool,
    last_connection_id: u32,
}

impl MySqlUpstream {
    pub fn new(cfg: &RelayConfig) -> Self {
        let opts: Opts = OptsBuilder::default()
            .ip_or_hostname(cfg.from.host.clone())
            .tcp_port(cfg.from.port)
            .user(Some(cfg.from.user.clone()))
            .pass(Some(cfg.from.password.clone()))
            .init(vec![format!("SET NAMES {}", cfg.charset)])
            .into();
        Self {
            cfg: cfg.clone(),
            pool: Pool::new(opts.clone()),
            opts,
            last_connection_id: 0,
        }
    }

    /// Open the dedicated replica connection used for one dump stream.
    async fn replica_conn(&mut self) -> Result<Conn> {
        let conn = Conn::new(self.opts.clone()).await?;
        self.last_connection_id = conn.id();
        info!("last slave connection id {}", self.last_connection_id);
        Ok(conn)
    }

    async fn kill_last_connection(&mut self) -> Result<()> {
        if self.last_connection_id == 0 {
            return Ok(());
        }
        let id = self.last_connection_id;
        let mut conn = self.pool.get_conn().await?;
        match conn.query_drop(format!("KILL CONNECTION {id}")).await {
            Ok(()) => {}
            // The dump connection may already be gone; that is fine.
            Err(mysql_async::Error::Server(ref e)) if e.code == ER_NO_SUCH_THREAD => {
                debug!("slave connection {id} already gone");
            }
            Err(e) => {
                return Err(RelayError::Database(e).context(format!("kill connection ID {id}")))
            }
        }
        self.last_connection_id = 0;
        Ok(())
    }

    fn wrap_stream(&self, inner: BinlogStream, start_gtid: GtidSet) -> Box<dyn EventStream> {
        Box::new(MySqlEventStream {
            inner,
            flavor: self.cfg.flavor,
            gtid_mode: self.cfg.enable_gtid,
            current_gtid: start_gtid,
        })
    }
}

#[async_trait]
impl BinlogUpstream for MySqlUpstream {
    async fn server_uuid(&mut self) -> Result<String> {
        let mut conn = self.pool.get_conn().await?;
        match self.cfg.flavor {
            Flavor::MySql => {
                let uuid: Option<String> = conn.query_first("SELECT @@server_uuid").await?;
                uuid.ok_or_else(|| RelayError::Upstream("server reported no server_uuid".into()))
            }
            Flavor::MariaDb => {
                let domain: Option<u32> = conn.query_first("SELECT @@gtid_domain_id").await?;
                let server: Option<u32> = conn.query_first("SELECT @@server_id").await?;
                match (domain, server) {
                    (Some(domain), Some(server)) => Ok(format!("{domain}-{server}")),
                    _ => Err(RelayError::Upstream(
                        "server reported no gtid_domain_id/server_id".into(),
                    )),
                }
            }
        }
    }

    async fn master_status(&mut self) -> Result<(Position, Option<GtidSet>)> {
        let mut conn = self.pool.get_conn().await?;
        let row: Option<mysql_async::Row> = conn.query_first("SHOW MASTER STATUS").await?;
        let mut row =
            row.ok_or_else(|| RelayError::Upstream("SHOW MASTER STATUS returned no row".into()))?;

        let name: String = row
            .take(0)
            .ok_or_else(|| RelayError::Upstream("SHOW MASTER STATUS without File".into()))?;
        let pos: u32 = row
            .take(1)
            .ok_or_else(|| RelayError::Upstream("SHOW MASTER STATUS without Position".into()))?;

        let gtid_text: String = match self.cfg.flavor {
            // Executed_Gtid_Set column.
            Flavor::MySql => row.take(4).unwrap_or_default(),
            Flavor::MariaDb => {
                let gtid: Option<String> = conn.query_first("SELECT @@gtid_binlog_pos").await?;
                gtid.unwrap_or_default()
            }
        };

        let gtid = if gtid_text.trim().is_empty() {
            None
        } else {
            Some(GtidSet::parse(self.cfg.flavor, &gtid_text)?)
        };
        Ok((Position::new(name, pos), gtid))
    }

    async fn start_sync_by_pos(&mut self, pos: Position) -> Result<Box<dyn EventStream>> {
        let conn = self.replica_conn().await?;
        let mut request = BinlogStreamRequest::new(self.cfg.server_id).with_pos(u64::from(pos.pos));
        if !pos.name.is_empty() {
            request = request.with_filename(pos.name.as_bytes());
        }
        let stream = conn.get_binlog_stream(request).await?;
        Ok(self.wrap_stream(stream, GtidSet::empty(self.cfg.flavor)))
    }

    async fn start_sync_by_gtid(&mut self, gtid: &GtidSet) -> Result<Box<dyn EventStream>> {
        match self.cfg.flavor {
            Flavor::MySql => {
                let sids = gtid.to_sids()?;
                let conn = self.replica_conn().await?;
                let request = BinlogStreamRequest::new(self.cfg.server_id)
                    .with_gtid()
                    .with_gtid_set(sids);
                let stream = conn.get_binlog_stream(request).await?;
                Ok(self.wrap_stream(stream, gtid.clone()))
            }
            Flavor::MariaDb => {
                // MariaDB starts a GTID dump from connection state variables
                // followed by a plain dump command with no file name.
                let mut conn = self.replica_conn().await?;
                conn.query_drop(format!("SET @slave_connect_state = '{gtid}'"))
                    .await?;
                conn.query_drop("SET @slave_gtid_strict_mode = 0").await?;
                conn.query_drop("SET @mariadb_slave_capability = 4").await?;
                let request = BinlogStreamRequest::new(self.cfg.server_id).with_pos(0);
                let stream = conn.get_binlog_stream(request).await?;
                Ok(self.wrap_stream(stream, gtid.clone()))
            }
        }
    }

    fn last_connection_id(&self) -> u32 {
        self.last_connection_id
    }

    async fn reopen(&mut self) -> Result<()> {
        self.kill_last_connection().await
    }

    async fn close(&mut self) -> Result<()> {
        self.kill_last_connection().await?;
        self.pool.clone().disconnect().await?;
        Ok(())
    }
}

struct MySqlEventStream {
    inner: BinlogStream,
    flavor: Flavor,
    gtid_mode: bool,
    /// GTID set executed through the last seen GTID event; snapshots of this
    /// are attached to Query/Xid events in GTID mode.
    current_gtid: GtidSet,
}

#[async_trait]
impl EventStream for MySqlEventStream {
    async fn next_event(&mut self) -> Result<RelayEvent> {
        match self.inner.next().await {
            None => Err(RelayError::SyncClosed),
            Some(Err(e)) => Err(map_stream_error(e)),
            Some(Ok(event)) => self.convert(&event),
        }
    }
}

impl MySqlEventStream {
    fn convert(&mut self, event: &Event) -> Result<RelayEvent> {
        let mut raw = Vec::with_capacity(EVENT_HEADER_LEN + event.data().len());
        event
            .write(BinlogVersion::Version4, &mut raw)
            .map_err(|e| RelayError::InvalidEvent(format!("re-serialize event: {e}")))?;
        let header = EventHeader::parse(&raw)?;

        let checksum_len = match event.footer().get_checksum_alg() {
            Ok(Some(alg @ BinlogChecksumAlg::BINLOG_CHECKSUM_ALG_CRC32)) => {
                let stored = u32::from_le_bytes(event.checksum().ok_or(RelayError::ChecksumMismatch)?);
                if event.calc_checksum(alg) != stored {
                    return Err(RelayError::ChecksumMismatch);
                }
                4
            }
            _ => 0,
        };
        if raw.len() < EVENT_HEADER_LEN + checksum_len {
            return Err(RelayError::InvalidEvent(format!(
                "event of {} bytes is shorter than header plus checksum",
                raw.len()
            )));
        }
        let payload = &raw[EVENT_HEADER_LEN..raw.len() - checksum_len];

        let data = match header.event_type {
            event_type::FORMAT_DESCRIPTION => EventData::FormatDescription,
            event_type::ROTATE => {
                let (next_log_name, position) = parse_rotate_payload(payload)?;
                EventData::Rotate {
                    next_log_name,
                    position,
                }
            }
            event_type::QUERY if self.gtid_mode => EventData::Query {
                gtid_set: Some(self.current_gtid.clone()),
            },
            event_type::XID if self.gtid_mode => EventData::Xid {
                gtid_set: Some(self.current_gtid.clone()),
            },
            event_type::GTID if self.gtid_mode && self.flavor == Flavor::MySql => {
                let (sid, gno) = parse_mysql_gtid_payload(payload)?;
                self.current_gtid.add_gno(&sid, gno);
                EventData::Other
            }
            event_type::MARIADB_GTID if self.gtid_mode && self.flavor == Flavor::MariaDb => {
                let (seq, domain) = parse_mariadb_gtid_payload(payload)?;
                self.current_gtid
                    .set_mariadb_seq(domain, header.server_id, seq);
                EventData::Other
            }
            _ => EventData::Other,
        };

        Ok(RelayEvent { header, data, raw })
    }
}

fn map_stream_error(e: mysql_async::Error) -> RelayError {
    match &e {
        mysql_async::Error::Server(server) if server.code == ER_MASTER_FATAL_ERROR_READING_BINLOG => {
            RelayError::PurgedBinlog(server.message.clone())
        }
        _ => RelayError::Database(e),
    }
}

/// Rotate post-header: next-event position (8 bytes LE) followed by the next
/// file name.
fn parse_rotate_payload(payload: &[u8]) -> Result<(String, u64)> {
    if payload.len() < 8 {
        return Err(RelayError::InvalidEvent(format!(
            "rotate event payload of {} bytes",
            payload.len()
        )));
    }
    let position = u64::from_le_bytes(payload[..8].try_into().expect("checked length"));
    let name = String::from_utf8_lossy(&payload[8..]).into_owned();
    Ok((name, position))
}

/// MySQL GTID event body: flags (1), source id (16), gno (8 bytes LE).
fn parse_mysql_gtid_payload(payload: &[u8]) -> Result<(String, u64)> {
    if payload.len() < 25 {
        return Err(RelayError::InvalidEvent(format!(
            "gtid event payload of {} bytes",
            payload.len()
        )));
    }
    let sid = uuid::Uuid::from_slice(&payload[1..17])
        .map_err(|e| RelayError::InvalidEvent(format!("gtid source id: {e}")))?
        .hyphenated()
        .to_string();
    let gno = u64::from_le_bytes(payload[17..25].try_into().expect("checked length"));
    Ok((sid, gno))
}

/// MariaDB GTID event body: sequence (8 bytes LE), domain id (4 bytes LE).
fn parse_mariadb_gtid_payload(payload: &[u8]) -> Result<(u64, u32)> {
    if payload.len() < 12 {
        return Err(RelayError::InvalidEvent(format!(
            "mariadb gtid event payload of {} bytes",
            payload.len()
        )));
    }
    let seq = u64::from_le_bytes(payload[..8].try_into().expect("checked length"));
    let domain = u32::from_le_bytes(payload[8..12].try_into().expect("checked length"));
    Ok((seq, domain))
}
