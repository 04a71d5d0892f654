//! Flavor-aware GTID sets.
//!
//! A [`GtidSet`] tracks executed transaction intervals per origin. For the
//! MySQL flavor the origin is the server's 128-bit UUID and the text form is
//! `uuid:1-5:11,uuid2:1-100`. For MariaDB the origin is
//! `<domain_id>-<server_id>` and the text form is the `gtid_binlog_pos` style
//! `0-1-100,1-2-50`, one current sequence per domain-server pair.
//!
//! The one non-obvious operation is [`GtidSet::replace`], used during master
//! switchover: keep every other origin's intervals from `self` and take the
//! listed origins' intervals from the new set. It assumes the new master was
//! `RESET MASTER`-ed before promotion, so its own sequence restarts while the
//! history it replicated from other origins stays valid.

use std::collections::BTreeMap;
use std::fmt;

use mysql_common::packets::{GnoInterval, Sid};
use serde::{Deserialize, Serialize};

use crate::config::Flavor;
use crate::error::{RelayError, Result};

/// An inclusive interval of transaction sequence numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Interval {
    pub start: u64,
    pub end: u64,
}

impl Interval {
    fn new(start: u64, end: u64) -> Self {
        Self { start, end }
    }
}

/// A set of executed GTIDs, keyed by origin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GtidSet {
    flavor: Flavor,
    sets: BTreeMap<String, Vec<Interval>>,
}

impl GtidSet {
    pub fn empty(flavor: Flavor) -> Self {
        Self {
            flavor,
            sets: BTreeMap::new(),
        }
    }

    pub fn flavor(&self) -> Flavor {
        self.flavor
    }

    pub fn is_empty(&self) -> bool {
        self.sets.values().all(|ivs| ivs.is_empty())
    }

    /// Parse the flavor's text form. Empty text parses to the empty set.
    pub fn parse(flavor: Flavor, text: &str) -> Result<Self> {
        let mut set = GtidSet::empty(flavor);
        let text = text.trim();
        if text.is_empty() {
            return Ok(set);
        }
        match flavor {
            Flavor::MySql => {
                for part in text.split(',') {
                    let part = part.trim();
                    if part.is_empty() {
                        continue;
                    }
                    let (uuid, intervals) = parse_mysql_part(part)?;
                    set.sets
                        .entry(uuid)
                        .or_default()
                        .extend(intervals);
                }
            }
            Flavor::MariaDb => {
                for part in text.split(',') {
                    let part = part.trim();
                    if part.is_empty() {
                        continue;
                    }
                    let (key, seq) = parse_mariadb_part(part)?;
                    set.sets.insert(key, vec![Interval::new(seq, seq)]);
                }
            }
        }
        for intervals in set.sets.values_mut() {
            normalize(intervals);
        }
        Ok(set)
    }

    /// Record one executed transaction for a MySQL-flavor origin.
    pub fn add_gno(&mut self, uuid: &str, gno: u64) {
        let intervals = self.sets.entry(uuid.to_ascii_lowercase()).or_default();
        intervals.push(Interval::new(gno, gno));
        normalize(intervals);
    }

    /// Record the current sequence for a MariaDB domain-server pair.
    pub fn set_mariadb_seq(&mut self, domain_id: u32, server_id: u32, seq: u64) {
        self.sets
            .insert(format!("{domain_id}-{server_id}"), vec![Interval::new(seq, seq)]);
    }

    /// Keep intervals for every origin not in `uuids` from `self`; for the
    /// listed origins take whatever `new` has (removing them when `new` has
    /// nothing).
    pub fn replace(&mut self, new: &GtidSet, uuids: &[String]) {
        for uuid in uuids {
            match new.sets.get(uuid) {
                Some(intervals) => {
                    self.sets.insert(uuid.clone(), intervals.clone());
                }
                None => {
                    self.sets.remove(uuid);
                }
            }
        }
    }

    /// Intervals recorded for one origin, if any.
    pub fn intervals(&self, uuid: &str) -> Option<&[Interval]> {
        self.sets.get(uuid).map(|v| v.as_slice())
    }

    /// Origins present in this set.
    pub fn uuids(&self) -> impl Iterator<Item = &str> {
        self.sets.keys().map(|s| s.as_str())
    }

    /// Convert to the wire representation used by COM_BINLOG_DUMP_GTID.
    /// MySQL flavor only.
    pub fn to_sids(&self) -> Result<Vec<Sid<'static>>> {
        let mut sids = Vec::with_capacity(self.sets.len());
        for (key, intervals) in &self.sets {
            let uuid = uuid::Uuid::parse_str(key).map_err(|e| RelayError::GtidParse {
                text: key.clone(),
                reason: e.to_string(),
            })?;
            let mut sid = Sid::new(*uuid.as_bytes());
            for iv in intervals {
                // Wire intervals are end-exclusive.
                sid = sid.with_interval(GnoInterval::new(iv.start, iv.end + 1));
            }
            sids.push(sid);
        }
        Ok(sids)
    }
}

impl fmt::Display for GtidSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (key, intervals) in &self.sets {
            if intervals.is_empty() {
                continue;
            }
            if !first {
                f.write_str(",")?;
            }
            first = false;
            match self.flavor {
                Flavor::MySql => {
                    f.write_str(key)?;
                    for iv in intervals {
                        if iv.start == iv.end {
                            write!(f, ":{}", iv.start)?;
                        } else {
                            write!(f, ":{}-{}", iv.start, iv.end)?;
                        }
                    }
                }
                Flavor::MariaDb => {
                    // Single current sequence per domain-server pair.
                    write!(f, "{}-{}", key, intervals[intervals.len() - 1].end)?;
                }
            }
        }
        Ok(())
    }
}

fn parse_mysql_part(part: &str) -> Result<(String, Vec<Interval>)> {
    let err = |reason: &str| RelayError::GtidParse {
        text: part.to_string(),
        reason: reason.to_string(),
    };

    let mut pieces = part.split(':');
    let uuid_text = pieces.next().ok_or_else(|| err("missing uuid"))?.trim();
    let uuid = uuid::Uuid::parse_str(uuid_text)
        .map_err(|_| err("invalid server uuid"))?
        .hyphenated()
        .to_string();

    let mut intervals = Vec::new();
    for spec in pieces {
        let spec = spec.trim();
        let (start, end) = match spec.split_once('-') {
            Some((a, b)) => (
                a.parse::<u64>().map_err(|_| err("invalid interval start"))?,
                b.parse::<u64>().map_err(|_| err("invalid interval end"))?,
            ),
            None => {
                let n = spec.parse::<u64>().map_err(|_| err("invalid sequence"))?;
                (n, n)
            }
        };
        if start == 0 || start > end {
            return Err(err("interval out of order"));
        }
        intervals.push(Interval::new(start, end));
    }
    if intervals.is_empty() {
        return Err(err("uuid without intervals"));
    }
    Ok((uuid, intervals))
}

fn parse_mariadb_part(part: &str) -> Result<(String, u64)> {
    let err = |reason: &str| RelayError::GtidParse {
        text: part.to_string(),
        reason: reason.to_string(),
    };

    let fields: Vec<&str> = part.split('-').collect();
    if fields.len() != 3 {
        return Err(err("expected domain-server-sequence"));
    }
    let domain = fields[0].parse::<u32>().map_err(|_| err("invalid domain id"))?;
    let server = fields[1].parse::<u32>().map_err(|_| err("invalid server id"))?;
    let seq = fields[2].parse::<u64>().map_err(|_| err("invalid sequence"))?;
    Ok((format!("{domain}-{server}"), seq))
}

/// Sort and coalesce overlapping or adjacent intervals in place.
fn normalize(intervals: &mut Vec<Interval>) {
    if intervals.len() < 2 {
        return;
    }
    intervals.sort();
    let mut merged: Vec<Interval> = Vec::with_capacity(intervals.len());
    for iv in intervals.drain(..) {
        match merged.last_mut() {
            Some(last) if iv.start <= last.end.saturating_add(1) => {
                last.end = last.end.max(iv.end);
            }
            _ => merged.push(iv),
        }
    }
    *intervals = merged;
}
