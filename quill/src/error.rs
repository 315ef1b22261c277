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

/// A specialized [`Result`] type for quill operations.
///
/// This type is used throughout quill's public API for any operation that
/// can produce an error.
///
/// [`Result`]: https://doc.rust-lang.org/std/result/enum.Result.html
pub type Result<T> = std::result::Result<T, Error>;

/// A QUIC error.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Error {
    /// The provided buffer is too short.
    BufferTooShort,

    /// The packet header is malformed, short, or inconsistent with the
    /// connection's role.
    InvalidPacketHeader,

    /// AEAD decryption failed, or the cleartext checksum did not match.
    DecryptionFailure,

    /// The packet contains a frame that cannot be parsed.
    InvalidFrameData,

    /// A stream-level frame violates the stream's state.
    InvalidStreamData,

    /// The negotiated protocol version is absent from the peer's supported
    /// versions list.
    VersionNegotiationMismatch,

    /// The packet was dropped due to a known benign condition.
    PacketIgnored,

    /// The initial handshake flight does not fit in a single padded
    /// datagram.
    HandshakeTooLarge,

    /// The host's stream-id space is exhausted.
    TooManyOpenStreams,

    /// The peer shrank a previously advertised flow-control limit.
    FlowControl,

    /// The operation cannot be completed because the stream is in an
    /// invalid state, or does not exist.
    ///
    /// The stream ID is provided as associated data.
    InvalidStreamState(u32),

    /// The TLS handshake failed.
    TlsFail,
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        None
    }
}

impl From<wirebuf::BufferTooShortError> for Error {
    fn from(_err: wirebuf::BufferTooShortError) -> Self {
        Error::BufferTooShort
    }
}
