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

use wirebuf::Bytes;
use wirebuf::BytesMut;

use crate::crypto;
use crate::Error;
use crate::Result;

/// The long header form bit.
const FORM_BIT: u8 = 0x80;

/// Short header: key phase 1 selector.
const KEY_PHASE_BIT: u8 = 0x20;

/// Short header: connection id present.
const CONN_ID_BIT: u8 = 0x40;

/// Size of the long header: form byte, connection id, packet number,
/// version.
pub const LONG_HEADER_LEN: usize = 1 + 8 + 4 + 4;

/// Size of the FNV-1a-64 trailer on cleartext packets.
pub const FNV1A_HASH_LEN: usize = 8;

const FNV1A_OFFSET_BASIS: u64 = 0xcbf29ce484222325;
const FNV1A_PRIME: u64 = 0x100000001b3;

/// A draft-05 packet type.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Type {
    VersionNegotiation,
    Initial,
    Retry,
    ServerCleartext,
    ClientCleartext,
    ZeroRTT,
    OneRttPhase0,
    OneRttPhase1,
}

impl Type {
    /// Parses a long-header type field.
    ///
    /// Type value 8 is read as 1-RTT key-phase-1; the public-reset packet
    /// that shares the value is not handled.
    pub fn from_wire(ty: u8) -> Result<Type> {
        let ty = match ty {
            1 => Type::VersionNegotiation,
            2 => Type::Initial,
            3 => Type::Retry,
            4 => Type::ServerCleartext,
            5 => Type::ClientCleartext,
            6 => Type::ZeroRTT,
            7 => Type::OneRttPhase0,
            8 => Type::OneRttPhase1,

            _ => return Err(Error::InvalidPacketHeader),
        };

        Ok(ty)
    }

    pub fn to_wire(self) -> u8 {
        match self {
            Type::VersionNegotiation => 1,
            Type::Initial => 2,
            Type::Retry => 3,
            Type::ServerCleartext => 4,
            Type::ClientCleartext => 5,
            Type::ZeroRTT => 6,
            Type::OneRttPhase0 => 7,
            Type::OneRttPhase1 => 8,
        }
    }
}

/// A decoded packet, borrowing the datagram buffer.
///
/// The buffer is mutated in place when the payload is verified or
/// decrypted, so callers must assume the datagram is consumed by
/// processing.
#[derive(Debug)]
pub struct Packet<'a> {
    pub ty: Type,

    pub is_long_header: bool,

    /// The connection id, when the header carries one.
    pub connection_id: Option<u64>,

    /// The packet number, truncated to the width used on the wire.
    pub packet_number: u32,

    /// The wire version (long header only).
    pub version: u32,

    buf: &'a mut [u8],

    header_len: usize,

    payload_len: usize,
}

impl<'a> Packet<'a> {
    /// Parses a packet header from the given datagram.
    pub fn decode(buf: &'a mut [u8]) -> Result<Packet<'a>> {
        let (ty, is_long_header, connection_id, packet_number, version, header_len) = {
            let mut b = Bytes::with_slice(buf);

            let first = b.get_u8().map_err(|_| Error::InvalidPacketHeader)?;

            if first & FORM_BIT != 0 {
                let ty = Type::from_wire(first & 0x7f)?;

                if b.cap() < 16 {
                    return Err(Error::InvalidPacketHeader);
                }

                let cid = b.get_u64().unwrap();
                let pn = b.get_u32().unwrap();
                let version = b.get_u32().unwrap();

                (ty, true, Some(cid), pn, version, b.off())
            } else {
                let ty = if first & KEY_PHASE_BIT != 0 {
                    Type::OneRttPhase1
                } else {
                    Type::OneRttPhase0
                };

                let cid = if first & CONN_ID_BIT != 0 {
                    Some(b.get_u64().map_err(|_| Error::InvalidPacketHeader)?)
                } else {
                    None
                };

                let pn_len = match first & 0x1f {
                    bits @ 1..=3 => 1 << (bits - 1),

                    _ => return Err(Error::InvalidPacketHeader),
                };

                let pn = b
                    .get_uint(pn_len)
                    .map_err(|_| Error::InvalidPacketHeader)?;

                (ty, false, cid, pn as u32, 0, b.off())
            }
        };

        let payload_len = buf.len() - header_len;

        Ok(Packet {
            ty,
            is_long_header,
            connection_id,
            packet_number,
            version,
            buf,
            header_len,
            payload_len,
        })
    }

    /// The header bytes, as associated data for AEAD and checksum input.
    pub fn header(&self) -> &[u8] {
        &self.buf[..self.header_len]
    }

    /// The payload bytes (after verification or decryption, the trailer or
    /// tag is no longer included).
    pub fn payload(&self) -> &[u8] {
        &self.buf[self.header_len..self.header_len + self.payload_len]
    }

    /// Checks the FNV-1a-64 trailer of a cleartext packet and strips it
    /// from the payload.
    pub fn verify_cleartext(&mut self) -> Result<()> {
        if self.payload_len < FNV1A_HASH_LEN {
            return Err(Error::DecryptionFailure);
        }

        let covered = self.header_len + self.payload_len - FNV1A_HASH_LEN;

        let calced = fnv1a(FNV1A_OFFSET_BASIS, &self.buf[..covered]);

        let mut trailer = [0; FNV1A_HASH_LEN];
        trailer.copy_from_slice(
            &self.buf[covered..covered + FNV1A_HASH_LEN],
        );
        let received = u64::from_be_bytes(trailer);

        if calced != received {
            return Err(Error::DecryptionFailure);
        }

        self.payload_len -= FNV1A_HASH_LEN;

        Ok(())
    }

    /// Decrypts the payload in place with the packet number as nonce and
    /// the header as associated data.
    pub fn decrypt(&mut self, aead: &crypto::Open) -> Result<()> {
        let (header, rest) = self.buf.split_at_mut(self.header_len);

        let plain_len = aead.open_with_u64_counter(
            u64::from(self.packet_number),
            header,
            &mut rest[..self.payload_len],
        )?;

        self.payload_len = plain_len;

        Ok(())
    }
}

/// Writes a long header for the given type and returns the new offset.
pub fn encode_long_header(
    out: &mut BytesMut, ty: Type, connection_id: u64, packet_number: u32,
) -> Result<()> {
    out.put_u8(FORM_BIT | ty.to_wire())?;
    out.put_u64(connection_id)?;
    out.put_u32(packet_number)?;
    out.put_u32(crate::PROTOCOL_VERSION)?;

    Ok(())
}

/// FNV-1a-64 over `data`, continuing from `hash`.
pub fn fnv1a(hash: u64, data: &[u8]) -> u64 {
    let mut hash = hash;

    for &b in data {
        hash ^= u64::from(b);
        hash = hash.wrapping_mul(FNV1A_PRIME);
    }

    hash
}

/// Computes the FNV-1a-64 trailer for a complete cleartext packet.
pub fn fnv1a_trailer(packet: &[u8]) -> u64 {
    fnv1a(FNV1A_OFFSET_BASIS, packet)
}
