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

use wirebuf::uint_len;
use wirebuf::Bytes;
use wirebuf::BytesMut;

use crate::ranges;
use crate::Error;
use crate::Result;

pub const TYPE_PADDING: u8 = 0x00;
pub const TYPE_RST_STREAM: u8 = 0x01;
pub const TYPE_MAX_DATA: u8 = 0x04;
pub const TYPE_MAX_STREAM_DATA: u8 = 0x05;
pub const TYPE_STOP_SENDING: u8 = 0x0c;

/// Lowest type byte of the ACK family (`101NLLMM`).
pub const TYPE_ACK: u8 = 0xa0;

/// Lowest type byte of the STREAM family (`11FDOOSS`).
pub const TYPE_STREAM: u8 = 0xc0;

const STREAM_FIN_BIT: u8 = 0x20;
const STREAM_DATA_LEN_BIT: u8 = 0x10;
const ACK_NUM_BLOCKS_BIT: u8 = 0x10;

/// Wire sizes used by the send scheduler to reserve packet space. Field
/// widths are the largest each frame can take.
pub const MAX_RST_STREAM_FRAME_SIZE: usize = 1 + 4 + 4 + 8;
pub const MAX_STOP_SENDING_FRAME_SIZE: usize = 1 + 4 + 4;
pub const MAX_DATA_FRAME_SIZE: usize = 1 + 8;
pub const MAX_STREAM_DATA_FRAME_SIZE: usize = 1 + 4 + 8;

/// A QUIC wire frame.
///
/// STREAM data borrows the decoded packet payload, so the decoder never
/// copies stream bytes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Frame<'a> {
    Padding {
        len: usize,
    },

    RstStream {
        stream_id: u32,
        error_code: u32,
        final_offset: u64,
    },

    StopSending {
        stream_id: u32,
        error_code: u32,
    },

    MaxData {
        /// Connection-level window, in kilobytes.
        max_data_kb: u64,
    },

    MaxStreamData {
        stream_id: u32,
        max: u64,
    },

    Ack {
        largest_acked: u64,
        ack_delay: u16,
        ranges: ranges::RangeSet,
    },

    Stream {
        stream_id: u32,
        offset: u64,
        fin: bool,
        data: &'a [u8],
    },
}

impl<'a> Frame<'a> {
    pub fn from_bytes(b: &mut Bytes<'a>) -> Result<Frame<'a>> {
        let frame_type = b.get_u8().map_err(|_| Error::InvalidFrameData)?;

        let frame = match frame_type {
            TYPE_PADDING => {
                let mut len = 1;

                while b.peek_u8() == Ok(TYPE_PADDING) {
                    b.get_u8().unwrap();

                    len += 1;
                }

                Frame::Padding { len }
            },

            TYPE_RST_STREAM => Frame::RstStream {
                stream_id: get_u32(b)?,
                error_code: get_u32(b)?,
                final_offset: get_u64(b)?,
            },

            TYPE_MAX_DATA => Frame::MaxData {
                max_data_kb: get_u64(b)?,
            },

            TYPE_MAX_STREAM_DATA => Frame::MaxStreamData {
                stream_id: get_u32(b)?,
                max: get_u64(b)?,
            },

            TYPE_STOP_SENDING => Frame::StopSending {
                stream_id: get_u32(b)?,
                error_code: get_u32(b)?,
            },

            TYPE_ACK..=0xbf => parse_ack_frame(frame_type, b)?,

            TYPE_STREAM..=0xff => parse_stream_frame(frame_type, b)?,

            _ => return Err(Error::InvalidFrameData),
        };

        Ok(frame)
    }

    pub fn to_bytes(&self, b: &mut BytesMut) -> Result<usize> {
        let before = b.off();

        match self {
            Frame::Padding { len } => {
                for _ in 0..*len {
                    b.put_u8(TYPE_PADDING)?;
                }
            },

            Frame::RstStream {
                stream_id,
                error_code,
                final_offset,
            } => {
                b.put_u8(TYPE_RST_STREAM)?;
                b.put_u32(*stream_id)?;
                b.put_u32(*error_code)?;
                b.put_u64(*final_offset)?;
            },

            Frame::StopSending {
                stream_id,
                error_code,
            } => {
                b.put_u8(TYPE_STOP_SENDING)?;
                b.put_u32(*stream_id)?;
                b.put_u32(*error_code)?;
            },

            Frame::MaxData { max_data_kb } => {
                b.put_u8(TYPE_MAX_DATA)?;
                b.put_u64(*max_data_kb)?;
            },

            Frame::MaxStreamData { stream_id, max } => {
                b.put_u8(TYPE_MAX_STREAM_DATA)?;
                b.put_u32(*stream_id)?;
                b.put_u64(*max)?;
            },

            Frame::Ack {
                largest_acked,
                ack_delay,
                ranges,
            } => {
                encode_ack_frame(*largest_acked, *ack_delay, ranges, b)?;
            },

            Frame::Stream {
                stream_id,
                offset,
                fin,
                data,
            } => {
                encode_stream_header(
                    b,
                    *stream_id,
                    *offset,
                    Some(data.len()),
                    *fin,
                )?;
                b.put_bytes(data)?;
            },
        };

        Ok(b.off() - before)
    }

    pub fn wire_len(&self) -> usize {
        match self {
            Frame::Padding { len } => *len,

            Frame::RstStream { .. } => MAX_RST_STREAM_FRAME_SIZE,

            Frame::StopSending { .. } => MAX_STOP_SENDING_FRAME_SIZE,

            Frame::MaxData { .. } => MAX_DATA_FRAME_SIZE,

            Frame::MaxStreamData { .. } => MAX_STREAM_DATA_FRAME_SIZE,

            Frame::Ack {
                largest_acked,
                ranges,
                ..
            } => ack_wire_len(*largest_acked, ranges),

            Frame::Stream {
                stream_id,
                offset,
                data,
                ..
            } => {
                1 + stream_id_len(*stream_id) +
                    offset_len(*offset) +
                    2 +
                    data.len()
            },
        }
    }

    /// Returns true if the frame elicits an acknowledgement. Only ACK
    /// frames do not.
    pub fn ack_eliciting(&self) -> bool {
        !matches!(self, Frame::Ack { .. })
    }
}

fn get_u32(b: &mut Bytes) -> Result<u32> {
    b.get_u32().map_err(|_| Error::InvalidFrameData)
}

fn get_u64(b: &mut Bytes) -> Result<u64> {
    b.get_u64().map_err(|_| Error::InvalidFrameData)
}

/// Width in bytes of an ACK integer field for the given mode bits.
fn ack_field_len(mode: u8) -> usize {
    1 << mode
}

/// Smallest mode bits whose field width covers `v`.
fn ack_field_mode(v: u64) -> u8 {
    match uint_len(v) {
        1 => 0,
        2 => 1,
        3 | 4 => 2,
        _ => 3,
    }
}

pub fn stream_id_len(stream_id: u32) -> usize {
    uint_len(u64::from(stream_id))
}

pub fn offset_len(offset: u64) -> usize {
    if offset == 0 {
        return 0;
    }

    match uint_len(offset) {
        1 | 2 => 2,
        3 | 4 => 4,
        _ => 8,
    }
}

/// Writes a STREAM frame header. `data_len` of `None` omits the length
/// field, extending the frame to the end of the packet payload.
pub fn encode_stream_header(
    b: &mut BytesMut, stream_id: u32, offset: u64, data_len: Option<usize>,
    fin: bool,
) -> Result<usize> {
    let before = b.off();

    let id_len = stream_id_len(stream_id);
    let off_len = offset_len(offset);

    let mut ty = TYPE_STREAM | (id_len as u8 - 1);

    ty |= match off_len {
        0 => 0,
        2 => 1 << 2,
        4 => 2 << 2,
        _ => 3 << 2,
    };

    if fin {
        ty |= STREAM_FIN_BIT;
    }

    if data_len.is_some() {
        ty |= STREAM_DATA_LEN_BIT;
    }

    b.put_u8(ty)?;
    b.put_uint(u64::from(stream_id), id_len)?;

    if off_len > 0 {
        b.put_uint(offset, off_len)?;
    }

    if let Some(len) = data_len {
        b.put_u16(len as u16)?;
    }

    Ok(b.off() - before)
}

fn parse_stream_frame<'a>(ty: u8, b: &mut Bytes<'a>) -> Result<Frame<'a>> {
    let fin = ty & STREAM_FIN_BIT != 0;
    let has_data_len = ty & STREAM_DATA_LEN_BIT != 0;

    let id_len = ((ty & 0x03) + 1) as usize;

    let off_len = match (ty >> 2) & 0x03 {
        0 => 0,
        1 => 2,
        2 => 4,
        _ => 8,
    };

    let stream_id =
        b.get_uint(id_len).map_err(|_| Error::InvalidFrameData)? as u32;

    let offset = if off_len > 0 {
        b.get_uint(off_len).map_err(|_| Error::InvalidFrameData)?
    } else {
        0
    };

    let data = if has_data_len {
        let len = b.get_u16().map_err(|_| Error::InvalidFrameData)? as usize;

        if b.cap() < len {
            return Err(Error::InvalidFrameData);
        }

        let data = b.slice(len).unwrap();
        b.skip(len).unwrap();
        data
    } else {
        let data = b.slice(b.cap()).unwrap();
        b.skip(b.cap()).unwrap();
        data
    };

    Ok(Frame::Stream {
        stream_id,
        offset,
        fin,
        data,
    })
}

fn parse_ack_frame<'a>(ty: u8, b: &mut Bytes<'a>) -> Result<Frame<'a>> {
    let has_blocks = ty & ACK_NUM_BLOCKS_BIT != 0;
    let largest_len = ack_field_len((ty >> 2) & 0x03);
    let block_len = ack_field_len(ty & 0x03);

    let num_blocks = if has_blocks {
        b.get_u8().map_err(|_| Error::InvalidFrameData)?
    } else {
        0
    };

    let num_ts = b.get_u8().map_err(|_| Error::InvalidFrameData)?;

    let largest_acked = b
        .get_uint(largest_len)
        .map_err(|_| Error::InvalidFrameData)?;

    let ack_delay = b.get_u16().map_err(|_| Error::InvalidFrameData)?;

    let first_block = b
        .get_uint(block_len)
        .map_err(|_| Error::InvalidFrameData)?;

    if largest_acked == u64::MAX {
        return Err(Error::InvalidFrameData);
    }

    let mut ranges = ranges::RangeSet::new();

    // The first block covers the `first_block` packets ending at (and
    // including) the largest acknowledged number.
    let mut cursor = (largest_acked + 1)
        .checked_sub(first_block)
        .ok_or(Error::InvalidFrameData)?;
    ranges.insert(cursor..largest_acked + 1);

    for _ in 0..num_blocks {
        let gap =
            u64::from(b.get_u8().map_err(|_| Error::InvalidFrameData)?);
        let len = b
            .get_uint(block_len)
            .map_err(|_| Error::InvalidFrameData)?;

        cursor = cursor.checked_sub(gap).ok_or(Error::InvalidFrameData)?;

        if len > cursor {
            return Err(Error::InvalidFrameData);
        }

        if len > 0 {
            ranges.insert(cursor - len..cursor);
        }

        cursor -= len;
    }

    // Skip the timestamp section; it is never produced by this
    // implementation but peers may include it.
    if num_ts > 0 {
        let ts_len = 5 + (usize::from(num_ts) - 1) * 3;
        b.skip(ts_len).map_err(|_| Error::InvalidFrameData)?;
    }

    Ok(Frame::Ack {
        largest_acked,
        ack_delay,
        ranges,
    })
}

fn ack_blocks(
    ranges: &ranges::RangeSet,
) -> (u64, u64, Vec<(u8, u64)>, u64) {
    let mut iter = ranges.iter().rev();

    let first = iter.next().unwrap();
    let largest_acked = first.end - 1;
    let first_block = first.end - first.start;

    let mut blocks = Vec::new();
    let mut prev_start = first.start;
    let mut max_block = first_block;

    for r in iter {
        if blocks.len() >= 255 {
            break;
        }

        let mut gap = prev_start - r.end;

        // A gap byte covers at most 255 missing packets; larger gaps are
        // bridged with empty blocks.
        while gap > 255 && blocks.len() < 255 {
            blocks.push((255, 0));
            gap -= 255;
        }

        if gap > 255 || blocks.len() >= 255 {
            break;
        }

        let len = r.end - r.start;
        blocks.push((gap as u8, len));

        max_block = std::cmp::max(max_block, len);
        prev_start = r.start;
    }

    (largest_acked, first_block, blocks, max_block)
}

fn ack_wire_len(largest_acked: u64, ranges: &ranges::RangeSet) -> usize {
    if ranges.is_empty() {
        return 0;
    }

    let (_, _, blocks, max_block) = ack_blocks(ranges);

    let largest_len = ack_field_len(ack_field_mode(largest_acked));
    let block_len = ack_field_len(ack_field_mode(max_block));

    let num_blocks_len = if blocks.is_empty() { 0 } else { 1 };

    1 + num_blocks_len + 1 + largest_len + 2 + block_len +
        blocks.len() * (1 + block_len)
}

fn encode_ack_frame(
    largest_acked: u64, ack_delay: u16, ranges: &ranges::RangeSet,
    b: &mut BytesMut,
) -> Result<()> {
    if ranges.is_empty() {
        return Err(Error::InvalidFrameData);
    }

    let (largest, first_block, blocks, max_block) = ack_blocks(ranges);

    debug_assert_eq!(largest, largest_acked);

    let largest_mode = ack_field_mode(largest);
    let block_mode = ack_field_mode(max_block);

    let mut ty = TYPE_ACK | (largest_mode << 2) | block_mode;

    if !blocks.is_empty() {
        ty |= ACK_NUM_BLOCKS_BIT;
    }

    b.put_u8(ty)?;

    if !blocks.is_empty() {
        b.put_u8(blocks.len() as u8)?;
    }

    // No timestamps.
    b.put_u8(0)?;

    b.put_uint(largest, ack_field_len(largest_mode))?;
    b.put_u16(ack_delay)?;
    b.put_uint(first_block, ack_field_len(block_mode))?;

    for (gap, len) in blocks {
        b.put_u8(gap)?;
        b.put_uint(len, ack_field_len(block_mode))?;
    }

    Ok(())
}
