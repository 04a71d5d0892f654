//! Shared fixtures: a scripted in-memory upstream and raw event builders.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use binlog_relay::event::{event_type, EVENT_HEADER_LEN};
use binlog_relay::{
    BinlogUpstream, EventData, EventHeader, EventStream, GtidSet, Position, RelayError,
    RelayObserver, RelayEvent,
};

// ---------------------------------------------------------------------------
// Event builders
// ---------------------------------------------------------------------------

/// Build a raw event: encoded header followed by `body_len` filler bytes.
pub fn build_event(
    event_type: u8,
    timestamp: u32,
    log_pos: u32,
    body_len: usize,
    data: EventData,
) -> RelayEvent {
    let header = EventHeader {
        timestamp,
        event_type,
        server_id: 1,
        event_size: (EVENT_HEADER_LEN + body_len) as u32,
        log_pos,
        flags: 0,
    };
    let mut raw = header.encode().to_vec();
    raw.extend((0..body_len).map(|i| (i % 251) as u8));
    RelayEvent { header, data, raw }
}

/// Protocol-synthesized rotate naming the current dump file; never appended.
pub fn fake_rotate(next_log_name: &str, position: u64) -> RelayEvent {
    build_event(
        event_type::ROTATE,
        0,
        0,
        8 + next_log_name.len(),
        EventData::Rotate {
            next_log_name: next_log_name.to_string(),
            position,
        },
    )
}

pub fn format_description(log_pos: u32, body_len: usize) -> RelayEvent {
    build_event(
        event_type::FORMAT_DESCRIPTION,
        1_700_000_000,
        log_pos,
        body_len,
        EventData::FormatDescription,
    )
}

pub fn query(log_pos: u32, body_len: usize, gtid_set: Option<GtidSet>) -> RelayEvent {
    build_event(
        event_type::QUERY,
        1_700_000_000,
        log_pos,
        body_len,
        EventData::Query { gtid_set },
    )
}

pub fn xid(log_pos: u32, body_len: usize, gtid_set: Option<GtidSet>) -> RelayEvent {
    build_event(
        event_type::XID,
        1_700_000_000,
        log_pos,
        body_len,
        EventData::Xid { gtid_set },
    )
}

/// An unclassified event, as raw mode delivers for everything but
/// FormatDescription and Rotate.
pub fn other(log_pos: u32, body_len: usize) -> RelayEvent {
    build_event(
        event_type::QUERY,
        1_700_000_000,
        log_pos,
        body_len,
        EventData::Other,
    )
}

// ---------------------------------------------------------------------------
// Scripted upstream
// ---------------------------------------------------------------------------

/// One step a scripted stream takes when polled.
pub enum StreamItem {
    Event(RelayEvent),
    Error(RelayError),
    /// Block forever; lets tests exercise cancellation.
    Pending,
}

#[derive(Default)]
pub struct MockState {
    /// Successive `server_uuid()` responses.
    pub server_uuids: VecDeque<String>,
    /// Successive `master_status()` responses.
    pub master_status: VecDeque<(Position, Option<GtidSet>)>,
    /// One script per `start_sync_*` call, in order.
    pub streams: VecDeque<Vec<StreamItem>>,
    /// Recorded `start_sync_by_pos` arguments.
    pub pos_requests: Vec<Position>,
    /// Recorded `start_sync_by_gtid` arguments, rendered to text.
    pub gtid_requests: Vec<String>,
    pub reopen_calls: usize,
    pub close_calls: usize,
}

/// In-memory [`BinlogUpstream`]. The shared state stays with the test for
/// assertions after the relay consumed the upstream.
pub struct MockUpstream {
    pub state: Arc<Mutex<MockState>>,
}

impl MockUpstream {
    pub fn new(state: Arc<Mutex<MockState>>) -> Box<Self> {
        Box::new(Self { state })
    }

    fn next_stream(&self) -> Box<dyn EventStream> {
        let items = self
            .state
            .lock()
            .streams
            .pop_front()
            .expect("test script ran out of streams");
        Box::new(ScriptedStream {
            items: items.into(),
        })
    }
}

#[async_trait]
impl BinlogUpstream for MockUpstream {
    async fn server_uuid(&mut self) -> Result<String, RelayError> {
        Ok(self
            .state
            .lock()
            .server_uuids
            .pop_front()
            .expect("test script ran out of server uuids"))
    }

    async fn master_status(&mut self) -> Result<(Position, Option<GtidSet>), RelayError> {
        Ok(self
            .state
            .lock()
            .master_status
            .pop_front()
            .expect("test script ran out of master status responses"))
    }

    async fn start_sync_by_pos(
        &mut self,
        pos: Position,
    ) -> Result<Box<dyn EventStream>, RelayError> {
        self.state.lock().pos_requests.push(pos);
        Ok(self.next_stream())
    }

    async fn start_sync_by_gtid(
        &mut self,
        gtid: &GtidSet,
    ) -> Result<Box<dyn EventStream>, RelayError> {
        self.state.lock().gtid_requests.push(gtid.to_string());
        Ok(self.next_stream())
    }

    fn last_connection_id(&self) -> u32 {
        1
    }

    async fn reopen(&mut self) -> Result<(), RelayError> {
        self.state.lock().reopen_calls += 1;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), RelayError> {
        self.state.lock().close_calls += 1;
        Ok(())
    }
}

struct ScriptedStream {
    items: VecDeque<StreamItem>,
}

#[async_trait]
impl EventStream for ScriptedStream {
    async fn next_event(&mut self) -> Result<RelayEvent, RelayError> {
        match self.items.pop_front() {
            None => Err(RelayError::SyncClosed),
            Some(StreamItem::Event(event)) => Ok(event),
            Some(StreamItem::Error(err)) => Err(err),
            Some(StreamItem::Pending) => {
                futures::future::pending::<()>().await;
                unreachable!()
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Counting observer
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct CountingObserver {
    pub read_errors: AtomicU64,
    pub write_errors: AtomicU64,
    pub corruptions: AtomicU64,
    pub exits_with_error: AtomicU64,
    pub bytes_written: AtomicU64,
}

impl RelayObserver for CountingObserver {
    fn relay_write_size(&self, bytes: u64) {
        self.bytes_written.fetch_add(bytes, Ordering::Relaxed);
    }

    fn relay_exit_with_error(&self) {
        self.exits_with_error.fetch_add(1, Ordering::Relaxed);
    }

    fn binlog_read_error(&self) {
        self.read_errors.fetch_add(1, Ordering::Relaxed);
    }

    fn relay_write_error(&self) {
        self.write_errors.fetch_add(1, Ordering::Relaxed);
    }

    fn relay_log_data_corruption(&self) {
        self.corruptions.fetch_add(1, Ordering::Relaxed);
    }
}
