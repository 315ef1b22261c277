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

use crate::flowcontrol::MaxSender;

use crate::Result;

pub mod recv_buf;
pub mod send_buf;

pub use recv_buf::RecvBuf;
pub use send_buf::SendBuf;

/// State machine of a one-shot frame sender (RST_STREAM, STOP_SENDING).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SenderState {
    None,
    Send,
    Unacked,
    Acked,
}

/// A one-shot frame sender and its error code.
#[derive(Clone, Copy, Debug)]
pub struct StateSender {
    pub state: SenderState,
    pub error_code: u32,
}

impl StateSender {
    fn new() -> StateSender {
        StateSender {
            state: SenderState::None,
            error_code: 0,
        }
    }
}

/// Send-side auxiliary state.
#[derive(Debug)]
pub struct SendAux {
    /// The peer-granted send window.
    pub max_stream_data: u64,

    /// One past the highest offset ever transmitted (not counting the FIN
    /// pseudo-byte).
    pub max_sent: u64,

    pub stop_sending: StateSender,

    pub rst: StateSender,

    /// Advertises our receive window to the peer.
    pub max_stream_data_sender: MaxSender,
}

/// Receive-side auxiliary state.
#[derive(Debug)]
pub struct RecvAux {
    /// The local receive window.
    pub window: u64,

    /// The error code of the peer's RST_STREAM, if one arrived.
    pub rst_reason: Option<u32>,
}

/// A bidirectional stream inside a connection.
pub struct Stream {
    id: u32,

    pub sendbuf: SendBuf,

    pub recvbuf: RecvBuf,

    pub send_aux: SendAux,

    pub recv_aux: RecvAux,

    pub close_called: bool,
}

impl Stream {
    /// Creates a stream with the peer's current per-stream send window and
    /// the local receive window.
    pub fn new(id: u32, peer_max_stream_data: u64, local_window: u64) -> Stream {
        Stream {
            id,
            sendbuf: SendBuf::new(),
            recvbuf: RecvBuf::new(),
            send_aux: SendAux {
                max_stream_data: peer_max_stream_data,
                max_sent: 0,
                stop_sending: StateSender::new(),
                rst: StateSender::new(),
                max_stream_data_sender: MaxSender::new(local_window),
            },
            recv_aux: RecvAux {
                window: local_window,
                rst_reason: None,
            },
            close_called: false,
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    /// Appends data to the send buffer. Flow control is applied when the
    /// data is scheduled, not here.
    pub fn write(&mut self, data: &[u8]) -> Result<()> {
        self.sendbuf.write(data)
    }

    /// Marks the FIN at the current send offset.
    pub fn shutdown(&mut self) {
        self.sendbuf.shutdown();
    }

    /// Abandons the send side, scheduling an RST_STREAM.
    ///
    /// If everything written has already been on the wire the FIN can be
    /// sent in place of the reset, and no RST_STREAM is scheduled.
    pub fn reset(&mut self, error_code: u32) {
        if self.send_aux.max_sent == self.sendbuf.eos() {
            return;
        }

        debug_assert!(!self.sendbuf.is_complete());

        // Close the sender and leave the FIN pseudo-byte as the only
        // unconfirmed offset; its confirmation arrives as the RST ack.
        self.sendbuf.shutdown();
        let eos = self.sendbuf.eos();
        self.sendbuf.ack(0..eos);

        self.send_aux.rst.state = SenderState::Send;
        self.send_aux.rst.error_code = error_code;
    }

    /// Asks the peer to stop sending on this stream.
    pub fn stop_sending(&mut self, error_code: u32) {
        if self.send_aux.stop_sending.state != SenderState::None {
            return;
        }

        self.send_aux.stop_sending.state = SenderState::Send;
        self.send_aux.stop_sending.error_code = error_code;
    }

    /// Requests teardown. The stream object survives until both transfer
    /// directions reach a terminal state.
    pub fn close(&mut self) {
        if self.close_called {
            return;
        }

        self.close_called = true;

        if self.sendbuf.eos() == u64::MAX {
            self.sendbuf.shutdown();
        }

        if self.recvbuf.eos() == u64::MAX {
            self.stop_sending(0);
        }
    }

    /// True when the stream can be destroyed: close was requested, the
    /// send side is fully acknowledged (or the RST is), and the receive
    /// side is transfer-complete.
    pub fn is_destroyable(&self) -> bool {
        if !self.close_called {
            return false;
        }

        if !(self.sendbuf.is_complete() ||
            self.send_aux.rst.state == SenderState::Acked)
        {
            return false;
        }

        self.recvbuf.is_complete()
    }
}
