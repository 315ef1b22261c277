// Copyright (C) 2025, The quill Authors.
// All rights reserved.
//
// Redistribution and use in source and binary forms, with or without
// modification, are permitted provided that the following conditions are
// met:
//
//     * Redistributions of source code must retain the above copyright notice,
//       this list of conditions and the following disclaimer.
//
//     * Redistributions in binary form must reproduce the above copyright
//       notice, this list of conditions and the following disclaimer in the
//       documentation and/or other materials provided with the distribution.
//
// THIS SOFTWARE IS PROVIDED BY THE COPYRIGHT HOLDERS AND CONTRIBUTORS "AS
// IS" AND ANY EXPRESS OR IMPLIED WARRANTIES, INCLUDING, BUT NOT LIMITED TO,
// THE IMPLIED WARRANTIES OF MERCHANTABILITY AND FITNESS FOR A PARTICULAR
// PURPOSE ARE DISCLAIMED. IN NO EVENT SHALL THE COPYRIGHT HOLDER OR
// CONTRIBUTORS BE LIABLE FOR ANY DIRECT, INDIRECT, INCIDENTAL, SPECIAL,
// EXEMPLARY, OR CONSEQUENTIAL DAMAGES (INCLUDING, BUT NOT LIMITED TO,
// PROCUREMENT OF SUBSTITUTE GOODS OR SERVICES; LOSS OF USE, DATA, OR
// PROFITS; OR BUSINESS INTERRUPTION) HOWEVER CAUSED AND ON ANY THEORY OF
// LIABILITY, WHETHER IN CONTRACT, STRICT LIABILITY, OR TORT (INCLUDING
// NEGLIGENCE OR OTHERWISE) ARISING IN ANY WAY OUT OF THE USE OF THIS
// SOFTWARE, EVEN IF ADVISED OF THE POSSIBILITY OF SUCH DAMAGE.

use std::collections::VecDeque;

use std::time::Duration;
use std::time::Instant;

use crate::ranges::RangeSet;

/// Which stream-state sender a record refers to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StateSenderKind {
    RstStream,
    StopSending,
}

/// The retransmittable object described by an ack record.
///
/// Dispatching on this variant is the unit of retransmission: stream
/// records feed the send buffer's acked/lost bookkeeping, window records
/// feed their `MaxSender`, and state-sender records move the RST or
/// STOP_SENDING sender between SEND and ACKED.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AckAction {
    /// A range of stream bytes; `end` may extend one past `eos` when the
    /// frame carried the FIN.
    Stream {
        stream_id: u32,
        start: u64,
        end: u64,
    },

    /// A connection-level window advertisement, in kilobytes.
    MaxData { value: u64 },

    /// A per-stream window advertisement.
    MaxStreamData { stream_id: u32, value: u64 },

    /// An RST_STREAM or STOP_SENDING sender.
    StreamState {
        stream_id: u32,
        kind: StateSenderKind,
    },
}

/// A per-packet retransmit record.
#[derive(Clone, Debug)]
pub struct SentRecord {
    pub packet_number: u64,

    pub sent_at: Instant,

    pub action: AckAction,
}

/// The egress ack ledger.
///
/// Records are appended as frames are emitted, so the queue is ordered both
/// by packet number (packet numbers strictly increase per connection) and
/// by send time.
#[derive(Default)]
pub struct AckLedger {
    records: VecDeque<SentRecord>,
}

impl AckLedger {
    pub fn new() -> AckLedger {
        AckLedger::default()
    }

    /// Appends a record for a frame carried by `packet_number`.
    pub fn register(
        &mut self, packet_number: u64, sent_at: Instant, action: AckAction,
    ) {
        debug_assert!(self
            .records
            .back()
            .map_or(true, |r| r.packet_number <= packet_number));

        self.records.push_back(SentRecord {
            packet_number,
            sent_at,
            action,
        });
    }

    /// Removes and returns the records whose packet number falls in one of
    /// the acknowledged ranges, preserving order. The second element counts
    /// acknowledged ranges that matched no live record (duplicate acks).
    pub fn take_acked(
        &mut self, acked: &RangeSet,
    ) -> (Vec<SentRecord>, usize) {
        let mut taken = Vec::new();
        let mut kept = VecDeque::with_capacity(self.records.len());

        for record in self.records.drain(..) {
            if acked.contains(record.packet_number) {
                taken.push(record);
            } else {
                kept.push_back(record);
            }
        }

        self.records = kept;

        // Count fully unmatched ranges, to surface duplicate acks.
        let mut unmatched = 0;
        for r in acked.iter() {
            if !taken
                .iter()
                .any(|rec| r.contains(&rec.packet_number))
            {
                unmatched += 1;
            }
        }

        (taken, unmatched)
    }

    /// Removes and returns the records sent at or before `now - rto`.
    pub fn take_expired(
        &mut self, now: Instant, rto: Duration,
    ) -> Vec<SentRecord> {
        let horizon = match now.checked_sub(rto) {
            Some(t) => t,
            None => return Vec::new(),
        };

        let mut expired = Vec::new();

        while let Some(front) = self.records.front() {
            if front.sent_at > horizon {
                break;
            }

            expired.push(self.records.pop_front().unwrap());
        }

        expired
    }

    /// The send time of the oldest outstanding record.
    pub fn oldest_sent_at(&self) -> Option<Instant> {
        self.records.front().map(|r| r.sent_at)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stream_action(stream_id: u32, start: u64, end: u64) -> AckAction {
        AckAction::Stream {
            stream_id,
            start,
            end,
        }
    }

    #[test]
    fn take_acked_in_order() {
        let now = Instant::now();
        let mut ledger = AckLedger::new();

        ledger.register(0, now, stream_action(1, 0, 100));
        ledger.register(1, now, stream_action(1, 100, 200));
        ledger.register(2, now, stream_action(1, 200, 300));
        ledger.register(2, now, AckAction::MaxData { value: 16 });
        assert_eq!(ledger.len(), 4);

        let mut acked = RangeSet::new();
        acked.insert(0..1);
        acked.insert(2..3);

        let (taken, unmatched) = ledger.take_acked(&acked);
        assert_eq!(unmatched, 0);
        assert_eq!(ledger.len(), 1);

        let numbers: Vec<u64> =
            taken.iter().map(|r| r.packet_number).collect();
        assert_eq!(numbers, vec![0, 2, 2]);
    }

    #[test]
    fn duplicate_ack_matches_nothing() {
        let now = Instant::now();
        let mut ledger = AckLedger::new();

        ledger.register(0, now, stream_action(1, 0, 100));

        let mut acked = RangeSet::new();
        acked.insert(0..1);

        let (taken, unmatched) = ledger.take_acked(&acked);
        assert_eq!(taken.len(), 1);
        assert_eq!(unmatched, 0);

        // Same packet number acked again: no live record remains.
        let (taken, unmatched) = ledger.take_acked(&acked);
        assert!(taken.is_empty());
        assert_eq!(unmatched, 1);
    }

    #[test]
    fn take_expired() {
        let now = Instant::now();
        let rto = Duration::from_millis(100);
        let mut ledger = AckLedger::new();

        ledger.register(0, now, stream_action(1, 0, 100));
        ledger.register(1, now + rto, stream_action(1, 100, 200));

        assert!(ledger.take_expired(now, rto).is_empty());
        assert_eq!(ledger.len(), 2);

        let expired = ledger.take_expired(now + rto, rto);
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].packet_number, 0);
        assert_eq!(ledger.len(), 1);

        let expired = ledger.take_expired(now + rto * 2, rto);
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].packet_number, 1);
        assert!(ledger.is_empty());
    }

    #[test]
    fn oldest_sent_at() {
        let now = Instant::now();
        let mut ledger = AckLedger::new();

        assert_eq!(ledger.oldest_sent_at(), None);

        ledger.register(0, now, stream_action(1, 0, 1));
        ledger.register(1, now + Duration::from_millis(5), stream_action(1, 1, 2));

        assert_eq!(ledger.oldest_sent_at(), Some(now));
    }
}
