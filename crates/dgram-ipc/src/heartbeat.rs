//! Per-peer liveness tracking.
//!
//! Peers advertise a deadline interval in their heartbeat datagrams; the
//! tracker records when each peer was last seen and reports — exactly once
//! per lapse — the peers whose deadline has passed. A fresh heartbeat or any
//! other non-probe datagram from the peer re-arms its deadline.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::time::Instant;

/// Heartbeat wire payload: the advertised deadline in milliseconds,
/// little-endian.
pub(crate) fn encode_deadline(deadline: Duration) -> [u8; 8] {
    u64::try_from(deadline.as_millis())
        .unwrap_or(u64::MAX)
        .to_le_bytes()
}

/// Decodes a heartbeat payload. Malformed payloads yield `None` and are
/// treated as a bare liveness refresh.
pub(crate) fn decode_deadline(payload: &[u8]) -> Option<Duration> {
    let bytes: [u8; 8] = payload.try_into().ok()?;
    Some(Duration::from_millis(u64::from_le_bytes(bytes)))
}

#[derive(Debug)]
struct PeerRecord {
    last_heartbeat_at: Instant,
    /// Deadline interval the peer advertised; `None` until the first
    /// well-formed heartbeat, which disables deadline tracking for the peer.
    advertised: Option<Duration>,
    next_deadline: Option<Instant>,
    /// Set when a miss has been reported; cleared by the next refresh so a
    /// single lapse is reported exactly once.
    deadline_missed: bool,
}

/// Table of peer endpoints and their heartbeat deadlines.
#[derive(Debug, Default)]
pub(crate) struct PeerTracker {
    peers: HashMap<PathBuf, PeerRecord>,
}

impl PeerTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records that any non-probe datagram arrived from `peer`.
    pub fn refresh(&mut self, peer: &Path, now: Instant) {
        match self.peers.get_mut(peer) {
            Some(record) => {
                record.last_heartbeat_at = now;
                record.next_deadline = record.advertised.map(|interval| now + interval);
                record.deadline_missed = false;
            }
            None => {
                self.peers.insert(
                    peer.to_path_buf(),
                    PeerRecord {
                        last_heartbeat_at: now,
                        advertised: None,
                        next_deadline: None,
                        deadline_missed: false,
                    },
                );
            }
        }
    }

    /// Records a heartbeat advertising `interval` as the peer's deadline.
    pub fn advertise(&mut self, peer: &Path, interval: Duration, now: Instant) {
        let record = self
            .peers
            .entry(peer.to_path_buf())
            .or_insert_with(|| PeerRecord {
                last_heartbeat_at: now,
                advertised: None,
                next_deadline: None,
                deadline_missed: false,
            });
        record.last_heartbeat_at = now;
        record.advertised = Some(interval);
        record.next_deadline = Some(now + interval);
        record.deadline_missed = false;
    }

    /// The earliest unreported deadline, for arming the sweep.
    pub fn next_wakeup(&self) -> Option<Instant> {
        self.peers
            .values()
            .filter(|record| !record.deadline_missed)
            .filter_map(|record| record.next_deadline)
            .min()
    }

    /// Marks and returns the peers whose deadline has lapsed since the last
    /// sweep. Each lapse is returned once; the peer re-arms on its next
    /// datagram.
    pub fn take_missed(&mut self, now: Instant) -> Vec<PathBuf> {
        let mut missed = Vec::new();
        for (path, record) in &mut self.peers {
            if record.deadline_missed {
                continue;
            }
            if let Some(deadline) = record.next_deadline {
                if now >= deadline {
                    record.deadline_missed = true;
                    missed.push(path.clone());
                }
            }
        }
        missed
    }

    /// Instant the peer was last seen, if it is known.
    #[cfg(test)]
    pub fn last_seen(&self, peer: &Path) -> Option<Instant> {
        self.peers.get(peer).map(|record| record.last_heartbeat_at)
    }

    /// Drops all peer records (endpoint close).
    pub fn clear(&mut self) {
        self.peers.clear();
    }
}
