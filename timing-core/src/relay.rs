//! # relay
//!
//! Optional cloud relay: a best-effort redundant path for race events
//! alongside the link. Published records carry the publisher's clock offset
//! so the recipient can translate the crossing time into its own frame; the
//! recipient keeps whichever copy of an event arrives first.

use std::collections::HashSet;

use tracing::debug;

use timing_types::{RaceEventRecord, RelayEventType};

use crate::sync::SyncEngine;

/// Publisher seam. Loss is not an error; implementations fire and forget.
pub trait CloudRelay: Send + Sync {
    fn publish(&self, record: RaceEventRecord);
}

/// Build the relay record for a local crossing. `clock_offset_nanos` is the
/// publisher's current offset, under the convention
/// `t_recipient = t_publisher + offset`.
pub fn relay_record(
    engine: &SyncEngine,
    session_id: &str,
    event_type: RelayEventType,
    device_id: &str,
    crossing_time_nanos: i64,
    uncertainty_ms: f64,
) -> RaceEventRecord {
    RaceEventRecord {
        session_id: session_id.to_string(),
        event_type,
        crossing_time_nanos,
        device_id: device_id.to_string(),
        clock_offset_nanos: engine.offset_nanos(),
        uncertainty_ms,
    }
}

/// The crossing time of a received record, translated into our frame.
pub fn crossing_time_in_local(record: &RaceEventRecord) -> i64 {
    record.crossing_time_nanos + record.clock_offset_nanos
}

/// Recipient-side dedup on (session, event type, device). The relay may
/// deliver duplicates or echo what the link already carried.
#[derive(Debug, Default)]
pub struct RelayDedup {
    seen: HashSet<(String, RelayEventType, String)>,
}

impl RelayDedup {
    pub fn new() -> Self {
        Self::default()
    }

    /// True exactly once per (session_id, event_type, device_id).
    pub fn accept(&mut self, record: &RaceEventRecord) -> bool {
        let fresh = self.seen.insert(record.dedup_key());
        if !fresh {
            debug!(
                session_id = %record.session_id,
                event_type = ?record.event_type,
                "duplicate relay record ignored"
            );
        }
        fresh
    }
}
