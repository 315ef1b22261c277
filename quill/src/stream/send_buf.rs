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
use std::ops::Range;

use crate::ranges::RangeSet;

use crate::Error;
use crate::Result;

/// Send-side stream buffer.
///
/// Bytes are addressed by absolute stream offset. The buffer retains data
/// from the fully-acknowledged prefix (`pos`) to the append offset (`off`);
/// `pending` holds the offsets that still have to go on the wire, and the
/// FIN signal occupies the pseudo-offset `eos` once the send side is shut
/// down.
#[derive(Debug)]
pub struct SendBuf {
    /// Bytes in the range `[pos, off)`.
    data: VecDeque<u8>,

    /// The lowest offset still buffered; everything below is acked.
    pos: u64,

    /// The append offset.
    off: u64,

    /// The final stream offset, `u64::MAX` until shutdown.
    eos: u64,

    /// Offsets that still have to be transmitted.
    pending: RangeSet,

    /// Offsets the peer has acknowledged.
    acked: RangeSet,
}

impl Default for SendBuf {
    fn default() -> SendBuf {
        SendBuf {
            data: VecDeque::new(),
            pos: 0,
            off: 0,
            eos: u64::MAX,
            pending: RangeSet::new(),
            acked: RangeSet::new(),
        }
    }
}

impl SendBuf {
    pub fn new() -> SendBuf {
        SendBuf::default()
    }

    /// Appends data, scheduling it for transmission.
    pub fn write(&mut self, data: &[u8]) -> Result<()> {
        if self.eos != u64::MAX {
            return Err(Error::InvalidStreamData);
        }

        if data.is_empty() {
            return Ok(());
        }

        let len = data.len() as u64;

        self.pending.insert(self.off..self.off + len);
        self.data.extend(data);
        self.off += len;

        Ok(())
    }

    /// Fixes the final offset at the current tail. The FIN signal is
    /// scheduled alongside the final byte range.
    pub fn shutdown(&mut self) {
        if self.eos != u64::MAX {
            return;
        }

        self.eos = self.off;
        self.pending.insert(self.eos..self.eos + 1);
    }

    /// Copies `out.len()` bytes starting at stream offset `off` into `out`.
    ///
    /// The range must be buffered, i.e. within `[pos, off)`.
    pub fn emit(&self, off: u64, out: &mut [u8]) {
        debug_assert!(off >= self.pos);
        debug_assert!(off + out.len() as u64 <= self.off);

        let start = (off - self.pos) as usize;

        let (a, b) = self.data.as_slices();

        if start >= a.len() {
            let start = start - a.len();
            out.copy_from_slice(&b[start..start + out.len()]);
            return;
        }

        let from_a = std::cmp::min(out.len(), a.len() - start);
        out[..from_a].copy_from_slice(&a[start..start + from_a]);

        if from_a < out.len() {
            let from_b = out.len() - from_a;
            out[from_a..].copy_from_slice(&b[..from_b]);
        }
    }

    /// Marks a range as acknowledged, releasing buffered data once the
    /// acknowledged prefix grows. The range may extend one past `eos` when
    /// the acknowledged frame carried the FIN.
    pub fn ack(&mut self, range: Range<u64>) {
        self.acked.insert(range);

        if let Some(first) = self.acked.get(0) {
            if first.start == 0 && first.end > self.pos {
                let new_pos = std::cmp::min(first.end, self.off);
                self.data.drain(..(new_pos - self.pos) as usize);
                self.pos = new_pos;
            }
        }
    }

    /// Reschedules the not-yet-acknowledged part of a lost range.
    pub fn lost(&mut self, range: Range<u64>) {
        let mut start = range.start;

        for a in self.acked.iter() {
            if a.end <= start {
                continue;
            }

            if a.start >= range.end {
                break;
            }

            if a.start > start {
                self.pending.insert(start..a.start);
            }

            start = a.end;
        }

        if start < range.end {
            self.pending.insert(start..range.end);
        }
    }

    /// Returns true if the FIN has been acknowledged.
    pub fn is_complete(&self) -> bool {
        if self.eos == u64::MAX {
            return false;
        }

        self.acked == (0..self.eos + 1)
    }

    pub fn eos(&self) -> u64 {
        self.eos
    }

    /// The append offset (one past the last written byte).
    pub fn off(&self) -> u64 {
        self.off
    }

    pub fn pending(&self) -> &RangeSet {
        &self.pending
    }

    pub fn pending_mut(&mut self) -> &mut RangeSet {
        &mut self.pending
    }

    #[cfg(test)]
    fn buffered(&self) -> usize {
        self.data.len()
    }
}
