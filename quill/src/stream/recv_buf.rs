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

use std::collections::BTreeMap;

use crate::ranges::RangeSet;

use crate::Error;
use crate::Result;

/// Receive-side stream buffer.
///
/// The contiguous prefix starting at `data_off` is stored in a single
/// buffer so it can be exposed to the application as one slice;
/// out-of-order chunks are kept aside, keyed by offset, until the prefix
/// reaches them. The `received` range set mirrors every absorbed span that
/// has not yet been delivered, so its first entry always starts at
/// `data_off`.
#[derive(Debug, Default)]
pub struct RecvBuf {
    /// The contiguous prefix: bytes `[data_off, data_off + data.len())`.
    data: Vec<u8>,

    /// Chunks received ahead of the contiguous prefix.
    ooo: BTreeMap<u64, Vec<u8>>,

    /// Absorbed but not yet delivered spans.
    received: RangeSet,

    /// The lowest offset that has yet to be delivered.
    data_off: u64,

    /// The final stream offset, `u64::MAX` until the FIN (or a reset) is
    /// seen.
    eos: u64,
}

impl RecvBuf {
    pub fn new() -> RecvBuf {
        RecvBuf {
            eos: u64::MAX,
            ..RecvBuf::default()
        }
    }

    /// Merges an incoming chunk. Returns true if the contiguous prefix
    /// grew.
    ///
    /// The caller is expected to have trimmed data below `data_off`
    /// already (retransmit adjustment).
    pub fn write(&mut self, off: u64, buf: &[u8]) -> Result<bool> {
        let end = off + buf.len() as u64;

        if end > self.eos {
            return Err(Error::InvalidStreamData);
        }

        debug_assert!(off >= self.data_off);

        if buf.is_empty() {
            return Ok(false);
        }

        let old_contig = self.contig_end();

        self.received.insert(off..end);

        if off <= old_contig {
            // Extends (or overlaps) the contiguous prefix.
            if end > old_contig {
                let skip = (old_contig - off) as usize;
                self.data.extend_from_slice(&buf[skip..]);
            }
        } else {
            // Ahead of the prefix; park it. On duplicate offsets keep the
            // longer chunk.
            let entry = self.ooo.entry(off).or_default();
            if buf.len() > entry.len() {
                *entry = buf.to_vec();
            }
        }

        // Absorb any parked chunks the prefix now reaches.
        loop {
            let contig = self.contig_end();

            let (&chunk_off, _) = match self.ooo.first_key_value() {
                Some(v) => v,
                None => break,
            };

            if chunk_off > contig {
                break;
            }

            let chunk = self.ooo.remove(&chunk_off).unwrap();
            let chunk_end = chunk_off + chunk.len() as u64;

            if chunk_end > contig {
                let skip = (contig - chunk_off) as usize;
                self.data.extend_from_slice(&chunk[skip..]);
            }
        }

        Ok(self.contig_end() > old_contig)
    }

    /// Sets the final offset. Any data past `eos`, or a conflicting final
    /// offset, is an error.
    pub fn mark_eos(&mut self, off: u64) -> Result<()> {
        // `u64::MAX` is the not-yet-known sentinel.
        if off == u64::MAX {
            return Err(Error::InvalidStreamData);
        }

        if self.eos != u64::MAX {
            if self.eos != off {
                return Err(Error::InvalidStreamData);
            }

            return Ok(());
        }

        if off < self.max_off() {
            return Err(Error::InvalidStreamData);
        }

        self.eos = off;

        Ok(())
    }

    /// Records `len` bytes as received at the contiguous edge without
    /// buffering them; the bytes live in the caller's datagram buffer
    /// (zero-copy fast path).
    pub fn absorb_external(&mut self, len: u64) {
        debug_assert!(!self.has_buffered());

        self.received.insert(self.data_off..self.data_off + len);
    }

    /// Buffers the tail of a fast-path chunk the application did not
    /// consume.
    pub fn push_tail(&mut self, buf: &[u8]) {
        debug_assert!(self.data.is_empty());

        self.data.extend_from_slice(buf);
    }

    /// The contiguous data available for the application.
    pub fn readable(&self) -> &[u8] {
        &self.data
    }

    /// Consumes `n` bytes of the contiguous prefix.
    pub fn shift(&mut self, n: usize) {
        debug_assert!(n <= self.data.len());

        self.data.drain(..n);
        self.data_off += n as u64;
        self.received.shrink_left(self.data_off);
    }

    /// Advances `data_off` past bytes the application consumed straight
    /// from a borrowed fast-path view.
    pub fn shift_external(&mut self, n: usize) {
        debug_assert!(self.data.is_empty());

        self.data_off += n as u64;
        self.received.shrink_left(self.data_off);
    }

    /// Returns true when the transfer is complete: the FIN offset is known
    /// and everything up to it has been delivered.
    pub fn is_complete(&self) -> bool {
        self.eos != u64::MAX && self.data_off == self.eos
    }

    /// Returns true when nothing is buffered (neither contiguous data nor
    /// parked chunks): the condition for the zero-copy fast path.
    pub fn has_buffered(&self) -> bool {
        !self.data.is_empty() || !self.ooo.is_empty()
    }

    pub fn data_off(&self) -> u64 {
        self.data_off
    }

    pub fn eos(&self) -> u64 {
        self.eos
    }

    /// One past the highest offset absorbed so far.
    pub fn max_off(&self) -> u64 {
        std::cmp::max(
            self.received.get(self.received.len().wrapping_sub(1))
                .map(|r| r.end)
                .unwrap_or(0),
            self.data_off,
        )
    }

    fn contig_end(&self) -> u64 {
        self.data_off + self.data.len() as u64
    }
}
