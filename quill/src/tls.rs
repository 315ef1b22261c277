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

//! The seam to the external TLS 1.3 engine.
//!
//! The connection core drives the handshake by shuttling opaque record
//! bytes over stream 0; everything cryptographic happens behind the
//! [`Session`] trait. The engine is expected to carry the QUIC transport
//! parameters as a raw extension (type 26) in the ClientHello or
//! EncryptedExtensions, and to expose the peer's copy once it has been
//! read.

use crate::crypto;
use crate::Result;

/// Progress of the handshake after feeding it input.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HandshakeStatus {
    /// More flights are needed.
    InProgress,

    /// The handshake is complete; secrets can be exported.
    Complete,
}

/// A TLS 1.3 session bound to one connection.
///
/// Implementations wrap a real TLS stack; the test suite provides a
/// deterministic in-tree one.
pub trait Session {
    /// Feeds contiguous handshake bytes received from the peer and
    /// collects any records to transmit into `out`.
    ///
    /// `input` may be empty to (re)drive output, e.g. for the client's
    /// first flight. The session buffers partial records internally, so
    /// the caller hands over whatever is currently available and the
    /// session consumes all of it.
    fn drive(&mut self, input: &[u8], out: &mut Vec<u8>) -> Result<HandshakeStatus>;

    /// Returns true once the handshake has completed.
    fn is_complete(&self) -> bool;

    /// The AEAD algorithm of the negotiated cipher suite.
    ///
    /// Only meaningful once the handshake is complete.
    fn algorithm(&self) -> crypto::Algorithm;

    /// Exports a secret for the given label, filling `out` (whose length
    /// selects the secret size).
    fn export_secret(&self, label: &str, out: &mut [u8]) -> Result<()>;

    /// Sets the raw transport-parameters extension body this endpoint
    /// offers. Must be called before the first `drive`.
    fn set_transport_params(&mut self, raw: Vec<u8>);

    /// The peer's raw transport-parameters extension body, once received.
    fn peer_transport_params(&self) -> Option<&[u8]>;
}
