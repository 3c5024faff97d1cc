//! Pending-message ledger.
//!
//! Every outbound message batch awaiting acknowledgment is represented by
//! one entry, kept in strict send order. ACK and NACK carry the serial of
//! the first acknowledged batch plus a count; acknowledgment is cumulative,
//! so settling a serial also settles every unresolved entry sent before it,
//! never entries sent after it.

use pulselink_protocol::ErrorInfo;
use std::collections::VecDeque;
use tokio::sync::oneshot;

/// Deferred completion for one in-flight batch.
pub type DeliveryWaiter = oneshot::Sender<Result<(), ErrorInfo>>;

#[derive(Debug)]
struct PendingEntry {
    serial: i64,
    notify: DeliveryWaiter,
}

#[derive(Debug, Default)]
pub struct PendingLedger {
    next_serial: i64,
    entries: VecDeque<PendingEntry>,
}

impl PendingLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serial the next pushed entry will be assigned.
    pub fn next_serial(&self) -> i64 {
        self.next_serial
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Record a batch of `count` messages as in flight and assign its serial.
    pub fn push(&mut self, count: u32, notify: DeliveryWaiter) -> i64 {
        let serial = self.next_serial;
        self.next_serial += i64::from(count.max(1));
        self.entries.push_back(PendingEntry { serial, notify });
        serial
    }

    /// Acknowledge `count` messages starting at `serial`; resolves the
    /// addressed entries and every unresolved entry before them. Returns the
    /// number of entries settled.
    pub fn ack(&mut self, serial: i64, count: u32) -> usize {
        self.settle(serial, count, &Ok(()))
    }

    /// Negative-acknowledge `count` messages starting at `serial` with the
    /// server-supplied error, cumulatively like [`ack`](Self::ack).
    pub fn nack(&mut self, serial: i64, count: u32, error: ErrorInfo) -> usize {
        self.settle(serial, count, &Err(error))
    }

    /// Reject every unresolved entry. Used when the connection reaches a
    /// terminal or suspended state; no entry may ever be left unsettled.
    pub fn fail_all(&mut self, error: &ErrorInfo) -> usize {
        let n = self.entries.len();
        for entry in self.entries.drain(..) {
            let _ = entry.notify.send(Err(error.clone()));
        }
        n
    }

    fn settle(&mut self, serial: i64, count: u32, outcome: &Result<(), ErrorInfo>) -> usize {
        let last = serial + i64::from(count.max(1)) - 1;
        if last >= self.next_serial {
            // Acknowledgment for serials never sent is a protocol violation;
            // settle what we know about and leave the rest alone.
            tracing::warn!(
                serial,
                count,
                next_serial = self.next_serial,
                "acknowledgment addresses unsent serials"
            );
        }
        let mut settled = 0;
        while let Some(front) = self.entries.front() {
            if front.serial > last {
                break;
            }
            let entry = self.entries.pop_front().expect("front checked");
            let _ = entry.notify.send(outcome.clone());
            settled += 1;
        }
        if settled == 0 {
            tracing::warn!(serial, count, "acknowledgment matched no pending entry");
        }
        settled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pulselink_protocol::codes;

    fn entry(ledger: &mut PendingLedger, count: u32) -> (i64, oneshot::Receiver<Result<(), ErrorInfo>>) {
        let (tx, rx) = oneshot::channel();
        let serial = ledger.push(count, tx);
        (serial, rx)
    }

    #[test]
    fn serials_follow_batch_sizes() {
        let mut ledger = PendingLedger::new();
        let (s0, _r0) = entry(&mut ledger, 2);
        let (s1, _r1) = entry(&mut ledger, 1);
        assert_eq!(s0, 0);
        assert_eq!(s1, 2);
        assert_eq!(ledger.next_serial(), 3);
    }

    #[test]
    fn ack_is_cumulative_and_never_touches_later_entries() {
        let mut ledger = PendingLedger::new();
        let (_s0, mut r0) = entry(&mut ledger, 1);
        let (_s1, mut r1) = entry(&mut ledger, 1);
        let (s2, mut r2) = entry(&mut ledger, 1);
        let (_s3, mut r3) = entry(&mut ledger, 1);

        assert_eq!(ledger.ack(s2, 1), 3);
        assert_eq!(r0.try_recv().unwrap(), Ok(()));
        assert_eq!(r1.try_recv().unwrap(), Ok(()));
        assert_eq!(r2.try_recv().unwrap(), Ok(()));
        assert!(r3.try_recv().is_err());
        assert_eq!(ledger.len(), 1);
    }

    #[test]
    fn nack_rejects_with_server_error() {
        let mut ledger = PendingLedger::new();
        let (s0, mut r0) = entry(&mut ledger, 1);
        let err = ErrorInfo::new(50000, 500, "overloaded");
        assert_eq!(ledger.nack(s0, 1, err.clone()), 1);
        assert_eq!(r0.try_recv().unwrap(), Err(err));
    }

    #[test]
    fn ack_for_unsent_serial_is_ignored() {
        let mut ledger = PendingLedger::new();
        let (_s0, mut r0) = entry(&mut ledger, 1);
        // serial 10 was never assigned; the known entry before it still settles
        assert_eq!(ledger.ack(10, 1), 1);
        assert_eq!(r0.try_recv().unwrap(), Ok(()));
        // a second stray ack settles nothing and must not panic
        assert_eq!(ledger.ack(20, 1), 0);
    }

    #[test]
    fn fail_all_rejects_every_unresolved_entry() {
        let mut ledger = PendingLedger::new();
        let (_s0, mut r0) = entry(&mut ledger, 1);
        let (_s1, mut r1) = entry(&mut ledger, 3);
        let err = ErrorInfo::suspended("connection suspended");
        assert_eq!(ledger.fail_all(&err), 2);
        assert!(ledger.is_empty());
        assert_eq!(r0.try_recv().unwrap().unwrap_err().code, codes::CONNECTION_SUSPENDED);
        assert_eq!(r1.try_recv().unwrap().unwrap_err().code, codes::CONNECTION_SUSPENDED);
    }
}
