//! Relay-side view of binlog events.
//!
//! The relay never decodes SQL payloads. Each event is carried as the raw
//! bytes received from the master plus the fixed 19-byte header and a shallow
//! classification, just enough to drive file rotation and cursor updates.

use std::io::Cursor;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::error::{RelayError, Result};
use crate::gtid::GtidSet;

/// Magic bytes at the start of every binlog file: `\xfe b i n`.
pub const BINLOG_MAGIC: [u8; 4] = [0xfe, 0x62, 0x69, 0x6e];

/// Length of the fixed event header.
pub const EVENT_HEADER_LEN: usize = 19;

/// Binlog event type codes the relay inspects.
pub mod event_type {
    pub const QUERY: u8 = 2;
    pub const ROTATE: u8 = 4;
    pub const FORMAT_DESCRIPTION: u8 = 15;
    pub const XID: u8 = 16;
    pub const GTID: u8 = 33;
    pub const MARIADB_GTID: u8 = 162;
}

/// The fixed header every event starts with. `log_pos` is the master-file
/// offset immediately after this event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventHeader {
    pub timestamp: u32,
    pub event_type: u8,
    pub server_id: u32,
    pub event_size: u32,
    pub log_pos: u32,
    pub flags: u16,
}

impl EventHeader {
    /// Parse the fixed header from the start of a raw event.
    pub fn parse(raw: &[u8]) -> Result<Self> {
        if raw.len() < EVENT_HEADER_LEN {
            return Err(RelayError::InvalidEvent(format!(
                "event of {} bytes is shorter than the {EVENT_HEADER_LEN}-byte header",
                raw.len()
            )));
        }
        let mut cur = Cursor::new(raw);
        let timestamp = cur.read_u32::<LittleEndian>()?;
        let event_type = cur.read_u8()?;
        let server_id = cur.read_u32::<LittleEndian>()?;
        let event_size = cur.read_u32::<LittleEndian>()?;
        let log_pos = cur.read_u32::<LittleEndian>()?;
        let flags = cur.read_u16::<LittleEndian>()?;
        if (event_size as usize) < EVENT_HEADER_LEN {
            return Err(RelayError::InvalidEvent(format!(
                "declared event size {event_size} is shorter than the header"
            )));
        }
        Ok(Self {
            timestamp,
            event_type,
            server_id,
            event_size,
            log_pos,
            flags,
        })
    }

    /// Serialize the fixed header.
    pub fn encode(&self) -> [u8; EVENT_HEADER_LEN] {
        let mut buf = Vec::with_capacity(EVENT_HEADER_LEN);
        buf.write_u32::<LittleEndian>(self.timestamp).unwrap();
        buf.write_u8(self.event_type).unwrap();
        buf.write_u32::<LittleEndian>(self.server_id).unwrap();
        buf.write_u32::<LittleEndian>(self.event_size).unwrap();
        buf.write_u32::<LittleEndian>(self.log_pos).unwrap();
        buf.write_u16::<LittleEndian>(self.flags).unwrap();
        buf.try_into().expect("header is exactly 19 bytes")
    }
}

/// Shallow classification of an event.
#[derive(Debug, Clone)]
pub enum EventData {
    FormatDescription,
    Rotate {
        next_log_name: String,
        position: u64,
    },
    /// Query event; carries the GTID set executed through this event when the
    /// stream runs in GTID mode.
    Query { gtid_set: Option<GtidSet> },
    /// Transaction commit; same cursor semantics as `Query`.
    Xid { gtid_set: Option<GtidSet> },
    /// Anything else. In raw (non-GTID) mode every parsed-elsewhere event
    /// arrives as `Other` with header only.
    Other,
}

/// One event as received from the upstream: raw bytes, parsed header, and
/// shallow classification.
#[derive(Debug, Clone)]
pub struct RelayEvent {
    pub header: EventHeader,
    pub data: EventData,
    pub raw: Vec<u8>,
}

impl RelayEvent {
    /// A rotate synthesized by the dump protocol when the stream starts
    /// mid-file. Carries the current file name but corresponds to no bytes in
    /// the binlog.
    pub fn is_fake_rotate(&self) -> bool {
        matches!(self.data, EventData::Rotate { .. })
            && self.header.timestamp == 0
            && self.header.log_pos == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(event_type: u8, log_pos: u32) -> EventHeader {
        EventHeader {
            timestamp: 1_700_000_000,
            event_type,
            server_id: 1,
            event_size: 100,
            log_pos,
            flags: 0,
        }
    }

    #[test]
    fn test_header_round_trip() {
        let h = header(event_type::QUERY, 220);
        let parsed = EventHeader::parse(&h.encode()).unwrap();
        assert_eq!(parsed, h);
    }

    #[test]
    fn test_header_rejects_short_input() {
        assert!(EventHeader::parse(&[0u8; 10]).is_err());
    }

    #[test]
    fn test_header_rejects_undersized_event() {
        let mut h = header(event_type::QUERY, 220);
        h.event_size = 5;
        assert!(EventHeader::parse(&h.encode()).is_err());
    }

    #[test]
    fn test_fake_rotate_detection() {
        let mut h = header(event_type::ROTATE, 0);
        h.timestamp = 0;
        let fake = RelayEvent {
            header: h,
            data: EventData::Rotate {
                next_log_name: "mysql-bin.000002".to_string(),
                position: 4,
            },
            raw: vec![],
        };
        assert!(fake.is_fake_rotate());

        let mut real = fake.clone();
        real.header.timestamp = 1_700_000_000;
        real.header.log_pos = 154;
        assert!(!real.is_fake_rotate());
    }
}
