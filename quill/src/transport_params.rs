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

//! Codec for the TLS extension carrying the QUIC transport parameters.
//!
//! The extension body is role-dependent: a client prefixes the parameter
//! list with the negotiated and initial protocol versions, a server
//! prefixes it with the list of versions it supports. The parameter list
//! itself is a 16-bit-length block of `(id, 16-bit-length value)` entries.

use std::collections::HashSet;

use wirebuf::Bytes;

use crate::Error;
use crate::Result;
use crate::PROTOCOL_VERSION;

/// The TLS extension type carrying the QUIC transport parameters.
pub const TLS_EXTENSION_TYPE: u16 = 26;

const PARAM_INITIAL_MAX_STREAM_DATA: u16 = 0;
const PARAM_INITIAL_MAX_DATA: u16 = 1;
const PARAM_INITIAL_MAX_STREAM_ID: u16 = 2;
const PARAM_IDLE_TIMEOUT: u16 = 3;
const PARAM_TRUNCATE_CONNECTION_ID: u16 = 4;

/// QUIC transport parameters.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TransportParams {
    /// Per-stream flow control window, in octets.
    pub initial_max_stream_data: u32,

    /// Connection-level flow control window, in kilobytes.
    pub initial_max_data_kb: u32,

    /// The highest stream id the peer may open.
    pub initial_max_stream_id: u32,

    /// Idle timeout, in seconds.
    pub idle_timeout: u16,

    /// Whether the peer may omit the connection id on short headers.
    pub truncate_connection_id: bool,
}

impl Default for TransportParams {
    /// The values both endpoints assume before the handshake delivers the
    /// real ones.
    fn default() -> TransportParams {
        TransportParams {
            initial_max_stream_data: 8192,
            initial_max_data_kb: 16,
            initial_max_stream_id: 100,
            idle_timeout: 60,
            truncate_connection_id: false,
        }
    }
}

impl TransportParams {
    /// Encodes the parameter list (the part shared by both roles).
    fn encode_list(&self, out: &mut Vec<u8>) {
        let body_len: u16 = (2 + 2 + 4) * 3 +
            (2 + 2 + 2) +
            if self.truncate_connection_id { 2 + 2 } else { 0 };

        out.extend_from_slice(&body_len.to_be_bytes());

        push_param(
            out,
            PARAM_INITIAL_MAX_STREAM_DATA,
            &self.initial_max_stream_data.to_be_bytes(),
        );
        push_param(
            out,
            PARAM_INITIAL_MAX_DATA,
            &self.initial_max_data_kb.to_be_bytes(),
        );
        push_param(
            out,
            PARAM_INITIAL_MAX_STREAM_ID,
            &self.initial_max_stream_id.to_be_bytes(),
        );
        push_param(out, PARAM_IDLE_TIMEOUT, &self.idle_timeout.to_be_bytes());

        if self.truncate_connection_id {
            push_param(out, PARAM_TRUNCATE_CONNECTION_ID, &[]);
        }
    }

    /// Decodes the parameter list. Duplicates of known ids are rejected,
    /// unknown ids are skipped, and all required ids must be present.
    fn decode_list(b: &mut Bytes) -> Result<TransportParams> {
        let mut params =
            b.get_bytes_with_u16_length()
                .map_err(|_| Error::InvalidStreamData)?;

        let mut tp = TransportParams {
            truncate_connection_id: false,
            ..TransportParams::default()
        };

        let mut seen = HashSet::new();
        let mut found_required = 0u8;

        while params.cap() > 0 {
            let id = params.get_u16().map_err(|_| Error::InvalidStreamData)?;

            let mut value = params
                .get_bytes_with_u16_length()
                .map_err(|_| Error::InvalidStreamData)?;

            if id <= PARAM_TRUNCATE_CONNECTION_ID && !seen.insert(id) {
                return Err(Error::InvalidStreamData);
            }

            match id {
                PARAM_INITIAL_MAX_STREAM_DATA => {
                    tp.initial_max_stream_data = get_exact_u32(&mut value)?;
                    found_required |= 1 << id;
                },

                PARAM_INITIAL_MAX_DATA => {
                    tp.initial_max_data_kb = get_exact_u32(&mut value)?;
                    found_required |= 1 << id;
                },

                PARAM_INITIAL_MAX_STREAM_ID => {
                    tp.initial_max_stream_id = get_exact_u32(&mut value)?;
                    found_required |= 1 << id;
                },

                PARAM_IDLE_TIMEOUT => {
                    if value.cap() != 2 {
                        return Err(Error::InvalidStreamData);
                    }
                    tp.idle_timeout = value.get_u16().unwrap();
                    found_required |= 1 << id;
                },

                PARAM_TRUNCATE_CONNECTION_ID => {
                    if value.cap() != 0 {
                        return Err(Error::InvalidStreamData);
                    }
                    tp.truncate_connection_id = true;
                },

                // Unknown parameters are skipped.
                _ => (),
            }
        }

        if found_required != 0b1111 {
            return Err(Error::InvalidStreamData);
        }

        Ok(tp)
    }

    /// Encodes the extension body sent by a client: the negotiated and
    /// initial versions followed by the parameter list.
    pub fn encode_client_extension(&self) -> Vec<u8> {
        let mut out = Vec::new();

        out.extend_from_slice(&PROTOCOL_VERSION.to_be_bytes());
        out.extend_from_slice(&PROTOCOL_VERSION.to_be_bytes());

        self.encode_list(&mut out);

        out
    }

    /// Decodes a client's extension body, on the server.
    pub fn decode_client_extension(raw: &[u8]) -> Result<TransportParams> {
        let mut b = Bytes::with_slice(raw);

        let negotiated =
            b.get_u32().map_err(|_| Error::InvalidStreamData)?;
        let initial = b.get_u32().map_err(|_| Error::InvalidStreamData)?;

        if negotiated != PROTOCOL_VERSION || initial != PROTOCOL_VERSION {
            return Err(Error::VersionNegotiationMismatch);
        }

        Self::decode_list(&mut b)
    }

    /// Encodes the extension body sent by a server: the supported-versions
    /// list followed by the parameter list.
    pub fn encode_server_extension(&self) -> Vec<u8> {
        let mut out = Vec::new();

        out.push(4);
        out.extend_from_slice(&PROTOCOL_VERSION.to_be_bytes());

        self.encode_list(&mut out);

        out
    }

    /// Decodes a server's extension body, on the client. The negotiated
    /// version must appear in the server's supported-versions list.
    pub fn decode_server_extension(raw: &[u8]) -> Result<TransportParams> {
        let mut b = Bytes::with_slice(raw);

        let mut versions = b
            .get_bytes_with_u8_length()
            .map_err(|_| Error::InvalidStreamData)?;

        if versions.cap() == 0 || versions.cap() % 4 != 0 {
            return Err(Error::InvalidStreamData);
        }

        let mut found = false;

        while versions.cap() > 0 {
            if versions.get_u32().unwrap() == PROTOCOL_VERSION {
                found = true;
            }
        }

        if !found {
            return Err(Error::VersionNegotiationMismatch);
        }

        Self::decode_list(&mut b)
    }
}

fn push_param(out: &mut Vec<u8>, id: u16, value: &[u8]) {
    out.extend_from_slice(&id.to_be_bytes());
    out.extend_from_slice(&(value.len() as u16).to_be_bytes());
    out.extend_from_slice(value);
}

fn get_exact_u32(b: &mut Bytes) -> Result<u32> {
    if b.cap() != 4 {
        return Err(Error::InvalidStreamData);
    }

    Ok(b.get_u32().unwrap())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_roundtrip() {
        let tp = TransportParams {
            initial_max_stream_data: 16384,
            initial_max_data_kb: 1024,
            initial_max_stream_id: 400,
            idle_timeout: 120,
            truncate_connection_id: false,
        };

        let raw = tp.encode_client_extension();
        let decoded = TransportParams::decode_client_extension(&raw).unwrap();

        assert_eq!(decoded, tp);
    }

    #[test]
    fn server_roundtrip() {
        let tp = TransportParams {
            truncate_connection_id: true,
            ..TransportParams::default()
        };

        let raw = tp.encode_server_extension();
        let decoded = TransportParams::decode_server_extension(&raw).unwrap();

        assert_eq!(decoded, tp);
    }

    #[test]
    fn client_version_mismatch() {
        let tp = TransportParams::default();

        let mut raw = tp.encode_client_extension();
        raw[0] ^= 0xff;

        assert_eq!(
            TransportParams::decode_client_extension(&raw),
            Err(Error::VersionNegotiationMismatch)
        );
    }

    #[test]
    fn server_version_absent() {
        let tp = TransportParams::default();

        let mut raw = tp.encode_server_extension();

        // Corrupt the advertised version.
        raw[1] ^= 0xff;

        assert_eq!(
            TransportParams::decode_server_extension(&raw),
            Err(Error::VersionNegotiationMismatch)
        );
    }

    #[test]
    fn missing_required() {
        // Client prefix plus a list carrying only the idle timeout.
        let mut raw = Vec::new();
        raw.extend_from_slice(&PROTOCOL_VERSION.to_be_bytes());
        raw.extend_from_slice(&PROTOCOL_VERSION.to_be_bytes());
        raw.extend_from_slice(&6u16.to_be_bytes());
        push_param(&mut raw, PARAM_IDLE_TIMEOUT, &60u16.to_be_bytes());

        assert_eq!(
            TransportParams::decode_client_extension(&raw),
            Err(Error::InvalidStreamData)
        );
    }

    #[test]
    fn duplicate_known_id() {
        let tp = TransportParams::default();
        let mut raw = tp.encode_client_extension();

        // Append a duplicate of id 3 and patch the list length.
        push_param(&mut raw, PARAM_IDLE_TIMEOUT, &60u16.to_be_bytes());

        let list_len_off = 8;
        let old = u16::from_be_bytes([raw[list_len_off], raw[list_len_off + 1]]);
        let new = (old + 6).to_be_bytes();
        raw[list_len_off..list_len_off + 2].copy_from_slice(&new);

        assert_eq!(
            TransportParams::decode_client_extension(&raw),
            Err(Error::InvalidStreamData)
        );
    }

    #[test]
    fn unknown_id_skipped() {
        let tp = TransportParams::default();
        let mut raw = tp.encode_client_extension();

        push_param(&mut raw, 0x2a, &[1, 2, 3]);

        let list_len_off = 8;
        let old = u16::from_be_bytes([raw[list_len_off], raw[list_len_off + 1]]);
        let new = (old + 7).to_be_bytes();
        raw[list_len_off..list_len_off + 2].copy_from_slice(&new);

        let decoded = TransportParams::decode_client_extension(&raw).unwrap();
        assert_eq!(decoded, tp);
    }
}
