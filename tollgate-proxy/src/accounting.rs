use std::collections::HashSet;
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::events::{ConnectionClosed, ConnectionId};

/// Cumulative totals at one point in time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrafficTotals {
    pub tx_bytes: u64,
    pub rx_bytes: u64,
}

/// Sums transfer statistics of closed connections, skipping bypassed ones.
///
/// The totals and the set of open bypassed connections sit behind a single
/// lock so concurrent close events cannot lose updates.
#[derive(Debug, Default)]
pub struct TrafficAccountant {
    ledger: Mutex<Ledger>,
}

#[derive(Debug, Default)]
struct Ledger {
    totals: TrafficTotals,
    bypassed: HashSet<ConnectionId>,
}

impl TrafficAccountant {
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks a connection as bypassed; its statistics will not be counted.
    pub fn track_bypass(&self, id: ConnectionId) {
        self.ledger().bypassed.insert(id);
    }

    pub fn tracked_count(&self) -> usize {
        self.ledger().bypassed.len()
    }

    /// Applies one connection-closed event. Unknown ids and missing
    /// statistics are not errors; the id is always dropped from tracking.
    pub fn connection_closed(&self, event: &ConnectionClosed) {
        let mut ledger = self.ledger();
        let bypassed = ledger.bypassed.remove(&event.id);
        if bypassed {
            return;
        }
        if let Some(stats) = event.stats {
            ledger.totals.tx_bytes = ledger
                .totals
                .tx_bytes
                .saturating_add(stats.bytes_sent_to_target);
            ledger.totals.rx_bytes = ledger
                .totals
                .rx_bytes
                .saturating_add(stats.bytes_received_from_target);
        }
    }

    pub fn totals(&self) -> TrafficTotals {
        self.ledger().totals
    }

    pub fn tx_bytes(&self) -> u64 {
        self.totals().tx_bytes
    }

    pub fn rx_bytes(&self) -> u64 {
        self.totals().rx_bytes
    }

    // Nothing under this lock can be left half-updated, so a poisoned lock
    // still holds consistent data.
    fn ledger(&self) -> MutexGuard<'_, Ledger> {
        self.ledger.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
