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

/// Advertiser of a monotonically increasing flow-control limit.
///
/// A new advertisement is emitted only when it would raise the newest
/// in-flight advertisement by at least the caller's slack, keeping window
/// updates off the wire while the peer still has usable credit. Lost
/// advertisements rewind the in-flight high-water so that a retransmission
/// is scheduled.
#[derive(Clone, Debug)]
pub struct MaxSender {
    /// The highest value the peer has acknowledged seeing.
    max_acked: u64,

    /// The highest value for which an advertisement is in flight (or
    /// acknowledged).
    max_inflight: u64,
}

impl MaxSender {
    pub fn new(initial_value: u64) -> MaxSender {
        MaxSender {
            max_acked: initial_value,
            max_inflight: initial_value,
        }
    }

    /// Returns true if advertising `consumed + window` now would move the
    /// in-flight limit forward by at least `slack`.
    pub fn should_update(&self, consumed: u64, window: u64, slack: u64) -> bool {
        consumed + window >= self.max_inflight + slack
    }

    /// Registers a new in-flight advertisement.
    pub fn record(&mut self, new_value: u64) {
        debug_assert!(new_value >= self.max_inflight);

        self.max_inflight = new_value;
    }

    /// Latches an acknowledged advertisement.
    pub fn acked(&mut self, value: u64) {
        if value > self.max_acked {
            self.max_acked = value;
        }
    }

    /// Handles the loss of an advertisement. If the lost value was the
    /// newest one in flight the high-water rewinds to the acknowledged
    /// level, re-arming `should_update`.
    pub fn lost(&mut self, value: u64) {
        if self.max_inflight == value {
            self.max_inflight = self.max_acked;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn update_on_slack() {
        let s = MaxSender::new(16);

        // Nothing consumed: a fresh advertisement would repeat the initial
        // value.
        assert!(!s.should_update(0, 16, 1));

        // Half the window consumed, slack not yet reached.
        assert!(!s.should_update(4, 16, 8));
        assert!(s.should_update(8, 16, 8));
    }

    #[test]
    fn record_suppresses() {
        let mut s = MaxSender::new(16);

        assert!(s.should_update(8, 16, 8));
        s.record(24);

        // The in-flight advertisement already covers the consumption.
        assert!(!s.should_update(8, 16, 8));
        assert!(s.should_update(16, 16, 8));
    }

    #[test]
    fn lost_rewinds() {
        let mut s = MaxSender::new(16);

        s.record(24);
        assert!(!s.should_update(8, 16, 8));

        s.lost(24);
        assert!(s.should_update(8, 16, 8));
    }

    #[test]
    fn lost_of_stale_value_is_ignored() {
        let mut s = MaxSender::new(16);

        s.record(24);
        s.record(32);

        // The older advertisement is superseded; its loss changes nothing.
        s.lost(24);
        assert!(!s.should_update(16, 16, 8));
    }

    #[test]
    fn acked_latches() {
        let mut s = MaxSender::new(16);

        s.record(24);
        s.acked(24);
        s.record(32);
        s.lost(32);

        // Rewind lands on the acked level, not the initial one.
        assert!(!s.should_update(9, 16, 8));
        assert!(s.should_update(16, 16, 8));
    }
}
