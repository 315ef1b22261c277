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

//! quill is a user-space implementation of the QUIC transport protocol,
//! draft revision `0xff000005`.
//!
//! The crate is the per-connection engine only: packet coding and
//! authentication, the TLS-coupled key transition, the stream
//! multiplexer, send/receive buffering with retransmission, flow control
//! and ack/loss accounting. Socket I/O, the event loop and the TLS record
//! layer live with the caller; the TLS engine is consumed through the
//! [`tls::Session`] trait.
//!
//! A connection is driven by three entry points: [`Connection::recv`]
//! processes one decoded datagram to completion, [`Connection::send`]
//! fills a vector of outgoing datagrams, and the stream operations queue
//! application data in between. None of them suspend, and a connection is
//! not thread-safe; the caller serializes access and schedules the next
//! `send` after [`Connection::timeout`].

#[macro_use]
extern crate log;

use std::collections::HashMap;

use std::net::SocketAddr;

use std::time::Duration;
use std::time::Instant;

use ring::rand::SecureRandom;

use smallvec::SmallVec;

use wirebuf::Bytes;
use wirebuf::BytesMut;

/// The QUIC wire version implemented by this crate.
pub const PROTOCOL_VERSION: u32 = 0xff00_0005;

/// Total size of a CLIENT_INITIAL packet (header plus payload) ahead of
/// its 8-byte checksum trailer; the padded datagram is 1280 bytes.
pub const CLIENT_INITIAL_SIZE: usize = 1272;

const DEFAULT_MAX_PACKET_SIZE: usize = 1280;

const DEFAULT_INITIAL_RTO: Duration = Duration::from_millis(500);

/// Minimum advance of a window advertisement worth putting on the wire
/// (bytes for streams, kilobytes for the connection window).
const MAX_SENDER_SLACK: u64 = 512;

const CLIENT_1RTT_LABEL: &str = "EXPORTER-QUIC client 1-RTT Secret";
const SERVER_1RTT_LABEL: &str = "EXPORTER-QUIC server 1-RTT Secret";

pub mod crypto;
pub mod packet;
pub mod tls;

mod error;
mod flowcontrol;
mod frame;
mod ranges;
mod recovery;
mod stream;
mod transport_params;

#[cfg(test)]
mod test_utils;
#[cfg(test)]
mod tests;

pub use crate::error::Error;
pub use crate::error::Result;

pub use crate::packet::Packet;

pub use crate::transport_params::TransportParams;

use crate::recovery::AckAction;
use crate::recovery::StateSenderKind;

use crate::stream::SenderState;
use crate::stream::Stream;

/// Connection progress through the handshake.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum State {
    /// Client Initial sent, ServerHello not yet seen.
    BeforeServerHello,

    /// Handshake flights in progress.
    BeforeServerFinished,

    /// 1-RTT keys installed.
    Established,
}

/// Configuration shared between connections.
#[derive(Clone, Debug)]
pub struct Config {
    max_packet_size: usize,

    initial_rto: Duration,

    local_transport_params: TransportParams,
}

impl Default for Config {
    fn default() -> Config {
        Config::new()
    }
}

impl Config {
    pub fn new() -> Config {
        Config {
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
            initial_rto: DEFAULT_INITIAL_RTO,
            local_transport_params: TransportParams::default(),
        }
    }

    /// Sets the maximum size of outgoing datagrams.
    pub fn set_max_packet_size(&mut self, size: usize) {
        self.max_packet_size = size;
    }

    /// Sets the fixed retransmission timeout.
    pub fn set_initial_rto(&mut self, rto: Duration) {
        self.initial_rto = rto;
    }

    /// Sets the transport parameters offered during the handshake.
    pub fn set_transport_params(&mut self, params: TransportParams) {
        self.local_transport_params = params;
    }
}

/// Receiver of stream events during [`Connection::recv`].
///
/// Stream 0 is the TLS carrier and is handled internally; the handler
/// only ever sees application streams.
pub trait StreamHandler {
    /// Called once for every stream the peer opens.
    fn on_open(&mut self, stream: &mut StreamRef) -> Result<()> {
        let _ = stream;
        Ok(())
    }

    /// Called when a stream's readable data grows, its FIN becomes
    /// deliverable, or it is reset by the peer.
    fn on_update(&mut self, stream: &mut StreamRef) -> Result<()> {
        let _ = stream;
        Ok(())
    }
}

/// A borrowed view of one stream, valid for the duration of a handler
/// callback or a direct `Connection` stream operation.
///
/// On the receive fast path [`data`](StreamRef::data) borrows straight
/// from the incoming datagram; whatever the handler does not
/// [`shift`](StreamRef::shift) before returning is copied into the
/// stream's receive buffer.
pub struct StreamRef<'a> {
    stream: &'a mut Stream,

    external: Option<&'a [u8]>,

    external_consumed: usize,

    bytes_consumed: &'a mut u128,
}

impl StreamRef<'_> {
    pub fn id(&self) -> u32 {
        self.stream.id()
    }

    /// The contiguous bytes available for reading.
    pub fn data(&self) -> &[u8] {
        match self.external {
            Some(buf) => &buf[self.external_consumed..],
            None => self.stream.recvbuf.readable(),
        }
    }

    /// Consumes `n` readable bytes.
    pub fn shift(&mut self, n: usize) {
        debug_assert!(n <= self.data().len());

        if n == 0 {
            return;
        }

        match self.external {
            Some(_) => {
                self.external_consumed += n;
                self.stream.recvbuf.shift_external(n);
            },

            None => self.stream.recvbuf.shift(n),
        }

        if self.stream.id() != 0 {
            *self.bytes_consumed += n as u128;
        }
    }

    /// Returns true if `data()` runs all the way to the stream's final
    /// offset.
    pub fn fin(&self) -> bool {
        let rb = &self.stream.recvbuf;

        if rb.eos() == u64::MAX {
            return false;
        }

        rb.data_off() + self.data().len() as u64 == rb.eos()
    }

    /// The peer's RST_STREAM error code, if the stream was reset.
    pub fn reset_code(&self) -> Option<u32> {
        self.stream.recv_aux.rst_reason
    }

    /// Appends data to the send side.
    pub fn write(&mut self, data: &[u8]) -> Result<()> {
        self.stream.write(data)
    }

    /// Marks the FIN at the current send offset.
    pub fn shutdown(&mut self) {
        self.stream.shutdown();
    }

    /// Abandons the send side with an RST_STREAM.
    pub fn reset(&mut self, error_code: u32) {
        self.stream.reset(error_code);
    }

    /// Asks the peer to stop sending.
    pub fn stop_sending(&mut self, error_code: u32) {
        self.stream.stop_sending(error_code);
    }

    /// Requests teardown of the stream once both directions finish.
    pub fn close(&mut self) {
        self.stream.close();
    }
}

struct IngressKeys {
    early_data: Option<crypto::Open>,
    key_phase0: Option<crypto::Open>,
    key_phase1: Option<crypto::Open>,
    secret: Vec<u8>,
}

struct Ingress {
    keys: IngressKeys,

    /// Ack-eliciting packet numbers not yet acknowledged to the peer.
    ack_queue: ranges::RangeSet,

    /// Bytes the application consumed across all non-zero streams.
    max_data_consumed: u128,

    /// Advertises the connection-level window (in kilobytes).
    max_data_sender: flowcontrol::MaxSender,
}

struct Egress {
    key_phase0: Option<crypto::Seal>,
    secret: Vec<u8>,

    ledger: recovery::AckLedger,

    packet_number: u64,

    /// Connection-level flow control: what the peer granted and what has
    /// been sent against it.
    max_data_permitted: u128,
    max_data_sent: u128,

    /// Once an ack-eliciting packet arrives encrypted, later ACKs may only
    /// be sent encrypted.
    acks_require_encryption: bool,
}

/// A QUIC connection.
pub struct Connection {
    is_client: bool,

    connection_id: u64,

    state: State,

    peer_addr: SocketAddr,

    host_num_streams: u32,
    host_next_stream_id: u32,

    peer_num_streams: u32,
    peer_next_stream_id: u32,

    peer_transport_params: TransportParams,
    peer_params_committed: bool,

    streams: HashMap<u32, Stream>,

    ingress: Ingress,

    egress: Egress,

    tls: Box<dyn tls::Session>,

    max_packet_size: usize,

    initial_rto: Duration,

    local_transport_params: TransportParams,

    trace_id: String,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("trace_id", &self.trace_id)
            .field("state", &self.state)
            .finish()
    }
}

/// Creates a client connection and queues its first handshake flight.
///
/// The TLS session is consumed as-is; its server name and certificates are
/// the caller's business.
pub fn connect(
    peer: SocketAddr, config: &Config, tls: Box<dyn tls::Session>,
) -> Result<Connection> {
    let mut cid = [0; 8];
    ring::rand::SystemRandom::new()
        .fill(&mut cid)
        .map_err(|_| Error::TlsFail)?;

    let mut conn =
        Connection::new(true, u64::from_be_bytes(cid), peer, config, tls);

    // Offer our transport parameters in the ClientHello and emit the
    // first flight into stream 0.
    let ext = conn.local_transport_params.encode_client_extension();
    conn.tls.set_transport_params(ext);

    let mut flight = Vec::new();
    conn.tls.drive(&[], &mut flight)?;

    if flight.is_empty() {
        return Err(Error::TlsFail);
    }

    let crypto_stream = conn.streams.get_mut(&0).unwrap();
    crypto_stream.sendbuf.write(&flight)?;

    trace!("{} connecting to {}", conn.trace_id, peer);

    Ok(conn)
}

/// Creates a server connection from a client's first packet.
///
/// The packet must be a well-formed CLIENT_INITIAL: authenticated, and
/// carrying nothing but stream 0 at offset zero plus padding.
pub fn accept(
    peer: SocketAddr, config: &Config, tls: Box<dyn tls::Session>,
    pkt: &mut Packet,
) -> Result<Connection> {
    if pkt.ty != packet::Type::Initial {
        return Err(Error::PacketIgnored);
    }

    pkt.verify_cleartext()?;

    let (offset, fin, data) = {
        let mut b = Bytes::with_slice(pkt.payload());

        while b.peek_u8() == Ok(frame::TYPE_PADDING) {
            b.get_u8().unwrap();
        }

        if b.peek_u8().map_err(|_| Error::InvalidFrameData)? <
            frame::TYPE_STREAM
        {
            return Err(Error::InvalidFrameData);
        }

        let (stream_id, offset, fin, data) =
            match frame::Frame::from_bytes(&mut b)? {
                frame::Frame::Stream {
                    stream_id,
                    offset,
                    fin,
                    data,
                } => (stream_id, offset, fin, data),

                _ => return Err(Error::InvalidFrameData),
            };

        if stream_id != 0 || offset != 0 {
            return Err(Error::InvalidStreamData);
        }

        // Nothing but padding may follow the first flight.
        while b.cap() > 0 {
            if b.get_u8().unwrap() != frame::TYPE_PADDING {
                return Err(Error::InvalidFrameData);
            }
        }

        (offset, fin, data)
    };

    let cid = pkt.connection_id.unwrap_or(0);

    let mut conn = Connection::new(false, cid, peer, config, tls);

    let ext = conn.local_transport_params.encode_server_extension();
    conn.tls.set_transport_params(ext);

    conn.ingress
        .ack_queue
        .insert(u64::from(pkt.packet_number)..u64::from(pkt.packet_number) + 1);

    if fin {
        return Err(Error::InvalidStreamData);
    }

    let crypto_stream = conn.streams.get_mut(&0).unwrap();
    crypto_stream.recvbuf.write(offset, data)?;

    conn.drive_tls(true)?;

    // The TLS engine must consume the entire first flight; trailing
    // garbage after the ClientHello rejects the connection.
    if conn.streams.get(&0).unwrap().recvbuf.data_off() != data.len() as u64 {
        return Err(Error::InvalidFrameData);
    }

    trace!("{} accepted from {}", conn.trace_id, peer);

    Ok(conn)
}

impl Connection {
    fn new(
        is_client: bool, connection_id: u64, peer_addr: SocketAddr,
        config: &Config, tls: Box<dyn tls::Session>,
    ) -> Connection {
        let (host_next, peer_next) = if is_client { (1, 2) } else { (2, 1) };

        let peer_params = TransportParams::default();

        let trace_id = format!(
            "{} {:016x}",
            if is_client { "client" } else { "server" },
            connection_id
        );

        let mut conn = Connection {
            is_client,
            connection_id,
            state: State::BeforeServerHello,
            peer_addr,
            host_num_streams: 0,
            host_next_stream_id: host_next,
            peer_num_streams: 0,
            peer_next_stream_id: peer_next,
            peer_transport_params: peer_params,
            peer_params_committed: false,
            streams: HashMap::new(),
            ingress: Ingress {
                keys: IngressKeys {
                    early_data: None,
                    key_phase0: None,
                    key_phase1: None,
                    secret: Vec::new(),
                },
                ack_queue: ranges::RangeSet::new(),
                max_data_consumed: 0,
                max_data_sender: flowcontrol::MaxSender::new(u64::from(
                    config.local_transport_params.initial_max_data_kb,
                )),
            },
            egress: Egress {
                key_phase0: None,
                secret: Vec::new(),
                ledger: recovery::AckLedger::new(),
                packet_number: 0,
                max_data_permitted: 0,
                max_data_sent: 0,
                acks_require_encryption: false,
            },
            tls,
            max_packet_size: config.max_packet_size,
            initial_rto: config.initial_rto,
            local_transport_params: config.local_transport_params,
            trace_id,
        };

        // The TLS carrier exists for the whole connection lifetime.
        conn.insert_stream(0);

        conn
    }

    fn insert_stream(&mut self, stream_id: u32) {
        let stream = Stream::new(
            stream_id,
            u64::from(self.peer_transport_params.initial_max_stream_data),
            u64::from(self.local_transport_params.initial_max_stream_data),
        );

        self.streams.insert(stream_id, stream);
    }

    fn destroy_stream(&mut self, stream_id: u32) {
        if self.streams.remove(&stream_id).is_none() {
            return;
        }

        trace!("{} destroyed stream {}", self.trace_id, stream_id);

        if stream_id != 0 {
            if (stream_id % 2 == 1) == self.is_client {
                self.host_num_streams -= 1;
            } else {
                self.peer_num_streams -= 1;
            }
        }
    }

    fn destroy_stream_if_unneeded(&mut self, stream_id: u32) -> bool {
        if self
            .streams
            .get(&stream_id)
            .is_some_and(Stream::is_destroyable)
        {
            self.destroy_stream(stream_id);
            return true;
        }

        false
    }

    /// Opens a host-initiated stream and returns its id.
    pub fn open_stream(&mut self) -> Result<u32> {
        if self.host_next_stream_id == 0 {
            return Err(Error::TooManyOpenStreams);
        }

        let stream_id = self.host_next_stream_id;
        self.insert_stream(stream_id);

        self.host_num_streams += 1;
        self.host_next_stream_id = match stream_id.checked_add(2) {
            Some(next) => next,
            None => 0,
        };

        Ok(stream_id)
    }

    /// Requests teardown of a stream; it is destroyed once both transfer
    /// directions reach a terminal state.
    ///
    /// Stream 0 carries the handshake and lives as long as the
    /// connection.
    pub fn close_stream(&mut self, stream_id: u32) -> Result<()> {
        if stream_id == 0 {
            return Err(Error::InvalidStreamState(0));
        }

        let stream = self
            .streams
            .get_mut(&stream_id)
            .ok_or(Error::InvalidStreamState(stream_id))?;

        stream.close();
        self.destroy_stream_if_unneeded(stream_id);

        Ok(())
    }

    /// Appends data to a stream's send buffer. The data is subject to
    /// flow control when scheduled, not here.
    pub fn stream_write(&mut self, stream_id: u32, data: &[u8]) -> Result<()> {
        self.streams
            .get_mut(&stream_id)
            .ok_or(Error::InvalidStreamState(stream_id))?
            .write(data)
    }

    /// Marks the FIN of a stream at its current send offset.
    pub fn stream_shutdown(&mut self, stream_id: u32) -> Result<()> {
        self.streams
            .get_mut(&stream_id)
            .ok_or(Error::InvalidStreamState(stream_id))?
            .shutdown();

        Ok(())
    }

    /// Abandons a stream's send side with an RST_STREAM.
    pub fn stream_reset(&mut self, stream_id: u32, error_code: u32) -> Result<()> {
        self.streams
            .get_mut(&stream_id)
            .ok_or(Error::InvalidStreamState(stream_id))?
            .reset(error_code);

        Ok(())
    }

    /// Asks the peer to stop sending on a stream.
    pub fn stream_stop_sending(
        &mut self, stream_id: u32, error_code: u32,
    ) -> Result<()> {
        self.streams
            .get_mut(&stream_id)
            .ok_or(Error::InvalidStreamState(stream_id))?
            .stop_sending(error_code);

        Ok(())
    }

    /// The contiguous bytes available for reading on a stream.
    pub fn stream_readable(&self, stream_id: u32) -> Result<&[u8]> {
        Ok(self
            .streams
            .get(&stream_id)
            .ok_or(Error::InvalidStreamState(stream_id))?
            .recvbuf
            .readable())
    }

    /// Consumes `n` readable bytes of a stream.
    pub fn stream_shift(&mut self, stream_id: u32, n: usize) -> Result<()> {
        let stream = self
            .streams
            .get_mut(&stream_id)
            .ok_or(Error::InvalidStreamState(stream_id))?;

        stream.recvbuf.shift(n);

        if stream_id != 0 {
            self.ingress.max_data_consumed += n as u128;
        }

        Ok(())
    }

    /// Copies readable bytes into `out` and consumes them. Returns the
    /// number of bytes read and whether the FIN was reached.
    pub fn stream_recv(
        &mut self, stream_id: u32, out: &mut [u8],
    ) -> Result<(usize, bool)> {
        let readable = self.stream_readable(stream_id)?;

        let n = std::cmp::min(readable.len(), out.len());
        out[..n].copy_from_slice(&readable[..n]);

        self.stream_shift(stream_id, n)?;

        let stream = self.streams.get(&stream_id).unwrap();
        let fin = stream.recvbuf.is_complete();

        Ok((n, fin))
    }

    // ------------------------------------------------------------------
    // Receive path
    // ------------------------------------------------------------------

    /// Processes one decoded packet to completion.
    ///
    /// The datagram buffer backing `pkt` is decrypted in place. A
    /// [`DecryptionFailure`](Error::DecryptionFailure) leaves the
    /// connection usable; stream- and flow-level violations are fatal.
    pub fn recv(
        &mut self, pkt: &mut Packet, handler: &mut dyn StreamHandler,
    ) -> Result<()> {
        if let Some(cid) = pkt.connection_id {
            if cid != self.connection_id {
                return Err(Error::PacketIgnored);
            }
        }

        if !pkt.is_long_header && self.state != State::Established {
            return Err(Error::InvalidPacketHeader);
        }

        // Role and key gating per packet type.
        let mut encrypted = false;

        match pkt.ty {
            packet::Type::ClientCleartext => {
                if self.is_client {
                    return Err(Error::InvalidPacketHeader);
                }
            },

            packet::Type::ServerCleartext => {
                if !self.is_client {
                    return Err(Error::InvalidPacketHeader);
                }
            },

            packet::Type::ZeroRTT => {
                if self.is_client || self.ingress.keys.early_data.is_none() {
                    return Err(Error::InvalidPacketHeader);
                }

                encrypted = true;
            },

            packet::Type::OneRttPhase0 => {
                if self.ingress.keys.key_phase0.is_none() {
                    // A 1-RTT packet raced ahead of handshake completion
                    // (the packet that would complete it was lost); drop
                    // it silently.
                    if self.state != State::Established {
                        trace!(
                            "{} dropping early 1-rtt packet {}",
                            self.trace_id,
                            pkt.packet_number
                        );
                        return Ok(());
                    }

                    return Err(Error::InvalidPacketHeader);
                }

                encrypted = true;
            },

            packet::Type::OneRttPhase1 => {
                if self.ingress.keys.key_phase1.is_none() {
                    return Err(Error::InvalidPacketHeader);
                }

                encrypted = true;
            },

            // A server's own first packet; nothing to do on an
            // established connection.
            packet::Type::Initial => return Ok(()),

            _ => return Err(Error::InvalidPacketHeader),
        }

        if encrypted {
            let aead = match pkt.ty {
                packet::Type::ZeroRTT => {
                    self.ingress.keys.early_data.as_ref().unwrap()
                },
                packet::Type::OneRttPhase1 => {
                    self.ingress.keys.key_phase1.as_ref().unwrap()
                },
                _ => self.ingress.keys.key_phase0.as_ref().unwrap(),
            };

            pkt.decrypt(aead)?;
        } else {
            pkt.verify_cleartext()?;
        }

        if pkt.payload().is_empty() {
            return Err(Error::InvalidFrameData);
        }

        trace!(
            "{} rx pkt {:?} pn={} len={}",
            self.trace_id,
            pkt.ty,
            pkt.packet_number,
            pkt.payload().len()
        );

        let payload = pkt.payload();
        let mut b = Bytes::with_slice(payload);

        let mut should_ack = false;

        while b.cap() > 0 {
            let frm = frame::Frame::from_bytes(&mut b)?;

            should_ack |= frm.ack_eliciting();

            match frm {
                frame::Frame::Padding { .. } => (),

                frame::Frame::Stream {
                    stream_id,
                    offset,
                    fin,
                    data,
                } => {
                    self.handle_stream_frame(
                        stream_id, offset, fin, data, handler,
                    )?;
                },

                frame::Frame::Ack { ranges, .. } => {
                    self.handle_ack_frame(&ranges)?;
                },

                frame::Frame::RstStream {
                    stream_id,
                    error_code,
                    final_offset,
                } => {
                    self.handle_rst_stream_frame(
                        stream_id,
                        error_code,
                        final_offset,
                        handler,
                    )?;
                },

                frame::Frame::MaxData { max_data_kb } => {
                    self.handle_max_data_frame(max_data_kb)?;
                },

                frame::Frame::MaxStreamData { stream_id, max } => {
                    self.handle_max_stream_data_frame(stream_id, max)?;
                },

                frame::Frame::StopSending {
                    stream_id,
                    error_code,
                } => {
                    self.handle_stop_sending_frame(
                        stream_id, error_code, handler,
                    )?;
                },
            }
        }

        if should_ack {
            let pn = u64::from(pkt.packet_number);
            self.ingress.ack_queue.insert(pn..pn + 1);

            if encrypted {
                self.egress.acks_require_encryption = true;
            }
        }

        Ok(())
    }

    /// Looks a stream up, implicitly opening peer-initiated streams (and
    /// every unopened id below them, in parity steps) on first use.
    fn get_stream_or_open_if_new(
        &mut self, stream_id: u32, handler: &mut dyn StreamHandler,
    ) -> Result<bool> {
        if self.streams.contains_key(&stream_id) {
            return Ok(true);
        }

        let peer_parity = (stream_id % 2 == 1) != self.is_client;

        if !peer_parity ||
            self.peer_next_stream_id == 0 ||
            self.peer_next_stream_id > stream_id
        {
            return Ok(false);
        }

        let mut next = self.peer_next_stream_id;

        loop {
            self.insert_stream(next);
            self.peer_num_streams += 1;

            trace!("{} peer opened stream {}", self.trace_id, next);

            let conn = &mut *self;
            let mut sref = StreamRef {
                stream: conn.streams.get_mut(&next).unwrap(),
                external: None,
                external_consumed: 0,
                bytes_consumed: &mut conn.ingress.max_data_consumed,
            };
            handler.on_open(&mut sref)?;

            if next == stream_id {
                break;
            }

            next += 2;
        }

        // Disallow opening new peer streams once the id space wraps.
        self.peer_next_stream_id = match stream_id.checked_add(2) {
            Some(next) => next,
            None => 0,
        };

        Ok(true)
    }

    fn handle_stream_frame(
        &mut self, stream_id: u32, offset: u64, fin: bool, data: &[u8],
        handler: &mut dyn StreamHandler,
    ) -> Result<()> {
        if !self.get_stream_or_open_if_new(stream_id, handler)? {
            return Ok(());
        }

        trace!(
            "{} rx stream {} off={} len={} fin={}",
            self.trace_id,
            stream_id,
            offset,
            data.len(),
            fin
        );

        // Reject offsets that would wrap the offset space.
        let end = offset
            .checked_add(data.len() as u64)
            .ok_or(Error::InvalidStreamData)?;

        if fin {
            self.streams
                .get_mut(&stream_id)
                .unwrap()
                .recvbuf
                .mark_eos(end)?;
        }

        self.do_apply_stream_frame(stream_id, offset, data, handler)
    }

    fn do_apply_stream_frame(
        &mut self, stream_id: u32, mut offset: u64, mut data: &[u8],
        handler: &mut dyn StreamHandler,
    ) -> Result<()> {
        let data_off =
            self.streams.get(&stream_id).unwrap().recvbuf.data_off();

        // Adjust for retransmitted data that was already delivered.
        if offset < data_off {
            if offset + data.len() as u64 <= data_off {
                return Ok(());
            }

            let delta = (data_off - offset) as usize;
            offset = data_off;
            data = &data[delta..];
        }

        // Stream 0 feeds the TLS engine and never reaches the handler.
        if stream_id == 0 {
            let crypto_stream = self.streams.get_mut(&0).unwrap();
            let grew = crypto_stream.recvbuf.write(offset, data)?;

            if grew {
                self.drive_tls(true)?;
            }

            return Ok(());
        }

        let conn = &mut *self;
        let stream = conn.streams.get_mut(&stream_id).unwrap();

        // Zero-copy fast path: the chunk lands exactly at the contiguous
        // edge and nothing is buffered, so the application can read
        // straight out of the datagram.
        if offset == stream.recvbuf.data_off() &&
            !stream.recvbuf.has_buffered()
        {
            stream.recvbuf.absorb_external(data.len() as u64);

            let mut sref = StreamRef {
                stream,
                external: Some(data),
                external_consumed: 0,
                bytes_consumed: &mut conn.ingress.max_data_consumed,
            };

            handler.on_update(&mut sref)?;

            let consumed = sref.external_consumed;
            if consumed < data.len() {
                let stream = conn.streams.get_mut(&stream_id).unwrap();
                stream.recvbuf.push_tail(&data[consumed..]);
            }

            self.destroy_stream_if_unneeded(stream_id);

            return Ok(());
        }

        let grew = stream.recvbuf.write(offset, data)?;

        let at_eos = stream.recvbuf.eos() != u64::MAX &&
            stream.recvbuf.data_off() +
                stream.recvbuf.readable().len() as u64 ==
                stream.recvbuf.eos();

        if grew || at_eos {
            let mut sref = StreamRef {
                stream,
                external: None,
                external_consumed: 0,
                bytes_consumed: &mut conn.ingress.max_data_consumed,
            };

            handler.on_update(&mut sref)?;
        }

        self.destroy_stream_if_unneeded(stream_id);

        Ok(())
    }

    fn handle_ack_frame(&mut self, acked: &ranges::RangeSet) -> Result<()> {
        let (records, unmatched) = self.egress.ledger.take_acked(acked);

        if unmatched > 0 {
            trace!("{} dupack", self.trace_id);
        }

        for record in records {
            self.on_ack_record(true, record)?;
        }

        Ok(())
    }

    fn handle_rst_stream_frame(
        &mut self, stream_id: u32, error_code: u32, final_offset: u64,
        handler: &mut dyn StreamHandler,
    ) -> Result<()> {
        if !self.get_stream_or_open_if_new(stream_id, handler)? {
            return Ok(());
        }

        let eos_known =
            self.streams.get(&stream_id).unwrap().recvbuf.eos() != u64::MAX;

        if !eos_known {
            {
                let stream = self.streams.get_mut(&stream_id).unwrap();

                if final_offset < stream.recvbuf.max_off() {
                    return Err(Error::InvalidStreamData);
                }

                stream.recvbuf.mark_eos(final_offset)?;
                stream.recv_aux.rst_reason = Some(error_code);
            }

            trace!(
                "{} rx rst stream {} code={} final={}",
                self.trace_id,
                stream_id,
                error_code,
                final_offset
            );

            if stream_id == 0 {
                self.drive_tls(true)?;
            } else {
                let conn = &mut *self;
                let mut sref = StreamRef {
                    stream: conn.streams.get_mut(&stream_id).unwrap(),
                    external: None,
                    external_consumed: 0,
                    bytes_consumed: &mut conn.ingress.max_data_consumed,
                };
                handler.on_update(&mut sref)?;
            }
        } else if final_offset !=
            self.streams.get(&stream_id).unwrap().recvbuf.max_off()
        {
            return Err(Error::InvalidStreamData);
        }

        self.destroy_stream_if_unneeded(stream_id);

        Ok(())
    }

    fn handle_max_data_frame(&mut self, max_data_kb: u64) -> Result<()> {
        let new_value = u128::from(max_data_kb) * 1024;

        if new_value < self.egress.max_data_permitted {
            debug!(
                "{} peer shrank the connection window to {} kB",
                self.trace_id, max_data_kb
            );
            return Err(Error::FlowControl);
        }

        self.egress.max_data_permitted = new_value;

        Ok(())
    }

    fn handle_max_stream_data_frame(
        &mut self, stream_id: u32, max: u64,
    ) -> Result<()> {
        let stream = match self.streams.get_mut(&stream_id) {
            Some(s) => s,
            None => return Ok(()),
        };

        if max < stream.send_aux.max_stream_data {
            debug!(
                "{} peer shrank stream {} window to {}",
                self.trace_id, stream_id, max
            );
            return Err(Error::FlowControl);
        }

        stream.send_aux.max_stream_data = max;

        Ok(())
    }

    fn handle_stop_sending_frame(
        &mut self, stream_id: u32, error_code: u32,
        handler: &mut dyn StreamHandler,
    ) -> Result<()> {
        if !self.get_stream_or_open_if_new(stream_id, handler)? {
            return Ok(());
        }

        // The peer is discarding this stream; abandon the send side.
        self.streams
            .get_mut(&stream_id)
            .unwrap()
            .reset(error_code);

        Ok(())
    }

    fn on_ack_record(
        &mut self, acked: bool, record: recovery::SentRecord,
    ) -> Result<()> {
        match record.action {
            AckAction::Stream {
                stream_id,
                start,
                end,
            } => {
                trace!(
                    "{} stream {} [{}, {}) {}",
                    self.trace_id,
                    stream_id,
                    start,
                    end,
                    if acked { "acked" } else { "lost" }
                );

                if let Some(stream) = self.streams.get_mut(&stream_id) {
                    if acked {
                        stream.sendbuf.ack(start..end);
                        self.destroy_stream_if_unneeded(stream_id);
                    } else {
                        stream.sendbuf.lost(start..end);
                    }
                }
            },

            AckAction::MaxData { value } => {
                if acked {
                    self.ingress.max_data_sender.acked(value);
                } else {
                    self.ingress.max_data_sender.lost(value);
                }
            },

            AckAction::MaxStreamData { stream_id, value } => {
                if let Some(stream) = self.streams.get_mut(&stream_id) {
                    if acked {
                        stream.send_aux.max_stream_data_sender.acked(value);
                    } else {
                        stream.send_aux.max_stream_data_sender.lost(value);
                    }
                }
            },

            AckAction::StreamState { stream_id, kind } => {
                if let Some(stream) = self.streams.get_mut(&stream_id) {
                    let sender = match kind {
                        StateSenderKind::RstStream => &mut stream.send_aux.rst,
                        StateSenderKind::StopSending =>
                            &mut stream.send_aux.stop_sending,
                    };

                    if acked {
                        sender.state = SenderState::Acked;
                        self.destroy_stream_if_unneeded(stream_id);
                    } else {
                        sender.state = SenderState::Send;
                    }
                }
            },
        }

        Ok(())
    }

    // ------------------------------------------------------------------
    // Handshake coupling
    // ------------------------------------------------------------------

    /// Feeds contiguous stream-0 bytes into the TLS engine, queues its
    /// output, and performs the 1-RTT transition on completion.
    fn drive_tls(&mut self, from_recv: bool) -> Result<()> {
        let mut flight = Vec::new();

        let status = {
            let conn = &mut *self;
            let crypto_stream = conn.streams.get_mut(&0).unwrap();

            let status =
                conn.tls.drive(crypto_stream.recvbuf.readable(), &mut flight)?;

            let consumed = crypto_stream.recvbuf.readable().len();
            crypto_stream.recvbuf.shift(consumed);

            if !flight.is_empty() {
                crypto_stream.sendbuf.write(&flight)?;
            }

            status
        };

        // Commit the peer's transport parameters as soon as the TLS
        // engine exposes them.
        if !self.peer_params_committed {
            if let Some(raw) = self.tls.peer_transport_params() {
                let params = if self.is_client {
                    TransportParams::decode_server_extension(raw)?
                } else {
                    TransportParams::decode_client_extension(raw)?
                };

                self.peer_transport_params = params;
                self.peer_params_committed = true;

                trace!(
                    "{} peer transport params {:?}",
                    self.trace_id,
                    params
                );
            }
        }

        match status {
            tls::HandshakeStatus::Complete
                if self.state != State::Established =>
            {
                self.egress.max_data_permitted = u128::from(
                    self.peer_transport_params.initial_max_data_kb,
                ) * 1024;

                self.setup_1rtt()?;

                trace!("{} handshake complete", self.trace_id);
            },

            tls::HandshakeStatus::InProgress => {
                if from_recv && self.state == State::BeforeServerHello {
                    self.state = State::BeforeServerFinished;
                }
            },

            _ => (),
        }

        Ok(())
    }

    /// Exports the 1-RTT secrets and installs the key-phase-0 contexts.
    fn setup_1rtt(&mut self) -> Result<()> {
        let alg = self.tls.algorithm();

        let secret_len = match alg {
            crypto::Algorithm::AES256_GCM => 48,
            _ => 32,
        };

        let (ingress_label, egress_label) = if self.is_client {
            (SERVER_1RTT_LABEL, CLIENT_1RTT_LABEL)
        } else {
            (CLIENT_1RTT_LABEL, SERVER_1RTT_LABEL)
        };

        let mut secret = vec![0; secret_len];

        self.tls.export_secret(ingress_label, &mut secret)?;
        self.ingress.keys.key_phase0 =
            Some(crypto::Open::from_secret(alg, &secret)?);
        self.ingress.keys.secret = secret.clone();

        self.tls.export_secret(egress_label, &mut secret)?;
        self.egress.key_phase0 =
            Some(crypto::Seal::from_secret(alg, &secret)?);
        self.egress.secret = secret;

        self.state = State::Established;

        Ok(())
    }

    // ------------------------------------------------------------------
    // Send path
    // ------------------------------------------------------------------

    /// Fills `out` with up to `max_packets` datagrams ready for the wire.
    ///
    /// Runs the RTO scan first, then a cleartext pass (handshake stream
    /// and acks), then, once established, an encrypted pass covering the
    /// application streams.
    pub fn send(
        &mut self, out: &mut Vec<Vec<u8>>, max_packets: usize, now: Instant,
    ) -> Result<()> {
        // Declare over-age records lost; their callbacks re-queue the
        // data.
        let expired = self.egress.ledger.take_expired(now, self.initial_rto);
        for record in expired {
            self.on_ack_record(false, record)?;
        }

        // Cleartext pass.
        let packet_type = if self.is_client {
            if self.state == State::BeforeServerHello {
                packet::Type::Initial
            } else {
                packet::Type::ClientCleartext
            }
        } else {
            packet::Type::ServerCleartext
        };

        let mut s = SendContext {
            packet_type,
            encrypted: false,
            now,
            max_packets,
            num_committed: 0,
            target: None,
        };

        if !self.egress.acks_require_encryption &&
            packet_type != packet::Type::Initial
        {
            self.send_ack(&mut s, out)?;
        }

        self.send_stream(0, &mut s, out)?;

        if let Some(mut target) = s.target.take() {
            if s.packet_type == packet::Type::Initial {
                if s.num_committed != 0 {
                    return Err(Error::HandshakeTooLarge);
                }

                // Pad the first flight to its fixed size; the buffer is
                // already zero (PADDING) beyond the written bytes.
                debug_assert!(target.dst <= CLIENT_INITIAL_SIZE);
                debug_assert!(target.dst_end >= CLIENT_INITIAL_SIZE);
                target.dst = CLIENT_INITIAL_SIZE;
            }

            self.commit_packet(&mut s, target, out)?;
        }

        // Encrypted pass.
        if self.state == State::Established {
            let mut s = SendContext {
                packet_type: packet::Type::OneRttPhase0,
                encrypted: true,
                now,
                max_packets,
                num_committed: s.num_committed,
                target: None,
            };

            self.send_ack(&mut s, out)?;

            let consumed_kb =
                (self.ingress.max_data_consumed / 1024) as u64;
            if self.ingress.max_data_sender.should_update(
                consumed_kb,
                u64::from(self.local_transport_params.initial_max_data_kb),
                MAX_SENDER_SLACK,
            ) {
                self.send_max_data_frame(&mut s, out)?;
            }

            let mut stream_ids: SmallVec<[u32; 8]> =
                self.streams.keys().copied().filter(|&id| id != 0).collect();
            stream_ids.sort_unstable();

            for stream_id in stream_ids {
                if self.streams.contains_key(&stream_id) {
                    self.send_stream(stream_id, &mut s, out)?;
                }
            }

            if let Some(target) = s.target.take() {
                self.commit_packet(&mut s, target, out)?;
            }
        }

        Ok(())
    }

    /// Time until the oldest outstanding record hits the RTO, if any.
    ///
    /// The caller should invoke [`send`](Connection::send) again when it
    /// elapses.
    pub fn timeout(&self, now: Instant) -> Option<Duration> {
        let oldest = self.egress.ledger.oldest_sent_at()?;

        Some(
            (oldest + self.initial_rto)
                .saturating_duration_since(now),
        )
    }

    fn prepare_packet(
        &mut self, s: &mut SendContext, out: &mut Vec<Vec<u8>>,
        min_space: usize,
    ) -> Result<()> {
        let need_new = match &s.target {
            Some(t) => t.dst_end - t.dst < min_space,
            None => true,
        };

        if !need_new {
            return Ok(());
        }

        if let Some(mut target) = s.target.take() {
            // Stuff the remainder with PADDING (the buffer is
            // zero-initialized) so mid-pass packets leave at full size.
            target.dst = target.dst_end;
            self.commit_packet(s, target, out)?;
        }

        if s.num_committed >= s.max_packets {
            return Ok(());
        }

        let mut buf = vec![0; self.max_packet_size];

        {
            let mut b = BytesMut::with_slice(&mut buf);
            packet::encode_long_header(
                &mut b,
                s.packet_type,
                self.connection_id,
                self.egress.packet_number as u32,
            )?;
        }

        let overhead = if s.encrypted {
            self.egress.key_phase0.as_ref().unwrap().alg().tag_len()
        } else {
            packet::FNV1A_HASH_LEN
        };

        let target = PacketBuilder {
            buf,
            dst: packet::LONG_HEADER_LEN,
            dst_end: self.max_packet_size - overhead,
        };

        debug_assert!(target.dst < target.dst_end);

        s.target = Some(target);

        Ok(())
    }

    fn commit_packet(
        &mut self, s: &mut SendContext, mut target: PacketBuilder,
        out: &mut Vec<Vec<u8>>,
    ) -> Result<()> {
        if s.encrypted {
            let seal = self.egress.key_phase0.as_ref().unwrap();

            let payload_len = target.dst - packet::LONG_HEADER_LEN;

            let (header, payload) =
                target.buf.split_at_mut(packet::LONG_HEADER_LEN);

            let written = seal.seal_with_u64_counter(
                self.egress.packet_number,
                header,
                payload,
                payload_len,
            )?;

            target.buf.truncate(packet::LONG_HEADER_LEN + written);
        } else {
            let hash = packet::fnv1a_trailer(&target.buf[..target.dst]);

            target.buf[target.dst..target.dst + packet::FNV1A_HASH_LEN]
                .copy_from_slice(&hash.to_be_bytes());

            target.buf.truncate(target.dst + packet::FNV1A_HASH_LEN);
        }

        trace!(
            "{} tx pkt {:?} pn={} len={}",
            self.trace_id,
            s.packet_type,
            self.egress.packet_number,
            target.buf.len()
        );

        out.push(target.buf);

        s.num_committed += 1;
        self.egress.packet_number += 1;

        Ok(())
    }

    fn send_ack(
        &mut self, s: &mut SendContext, out: &mut Vec<Vec<u8>>,
    ) -> Result<()> {
        if self.ingress.ack_queue.is_empty() {
            return Ok(());
        }

        let largest_acked = self.ingress.ack_queue.last().unwrap();

        let frm = frame::Frame::Ack {
            largest_acked,
            ack_delay: 0,
            ranges: self.ingress.ack_queue.clone(),
        };

        self.prepare_packet(s, out, frm.wire_len())?;

        if let Some(target) = &mut s.target {
            let mut b = BytesMut::with_slice(
                &mut target.buf[target.dst..target.dst_end],
            );
            frm.to_bytes(&mut b)?;
            target.dst += b.off();
        }

        // Acknowledged state is flushed whether or not the frame went
        // out; the ranges rebuild from later packets.
        self.ingress.ack_queue.clear();

        Ok(())
    }

    fn send_max_data_frame(
        &mut self, s: &mut SendContext, out: &mut Vec<Vec<u8>>,
    ) -> Result<()> {
        self.prepare_packet(s, out, frame::MAX_DATA_FRAME_SIZE)?;

        if s.target.is_none() {
            return Ok(());
        }

        let new_value = (self.ingress.max_data_consumed / 1024) as u64 +
            u64::from(self.local_transport_params.initial_max_data_kb);

        let frm = frame::Frame::MaxData {
            max_data_kb: new_value,
        };

        let target = s.target.as_mut().unwrap();
        let mut b =
            BytesMut::with_slice(&mut target.buf[target.dst..target.dst_end]);
        frm.to_bytes(&mut b)?;
        target.dst += b.off();

        self.egress.ledger.register(
            self.egress.packet_number,
            s.now,
            AckAction::MaxData { value: new_value },
        );

        self.ingress.max_data_sender.record(new_value);

        Ok(())
    }

    fn send_max_stream_data_frame(
        &mut self, stream_id: u32, s: &mut SendContext,
        out: &mut Vec<Vec<u8>>,
    ) -> Result<()> {
        self.prepare_packet(s, out, frame::MAX_STREAM_DATA_FRAME_SIZE)?;

        if s.target.is_none() {
            return Ok(());
        }

        let stream = self.streams.get_mut(&stream_id).unwrap();

        let new_value =
            stream.recvbuf.data_off() + stream.recv_aux.window;

        stream.send_aux.max_stream_data_sender.record(new_value);

        let frm = frame::Frame::MaxStreamData {
            stream_id,
            max: new_value,
        };

        let target = s.target.as_mut().unwrap();
        let mut b =
            BytesMut::with_slice(&mut target.buf[target.dst..target.dst_end]);
        frm.to_bytes(&mut b)?;
        target.dst += b.off();

        self.egress.ledger.register(
            self.egress.packet_number,
            s.now,
            AckAction::MaxStreamData {
                stream_id,
                value: new_value,
            },
        );

        Ok(())
    }

    fn send_stream(
        &mut self, stream_id: u32, s: &mut SendContext,
        out: &mut Vec<Vec<u8>>,
    ) -> Result<()> {
        if self.destroy_stream_if_unneeded(stream_id) {
            return Ok(());
        }

        // STOP_SENDING if armed.
        if self.streams.get(&stream_id).unwrap().send_aux.stop_sending.state ==
            SenderState::Send
        {
            self.prepare_packet(s, out, frame::MAX_STOP_SENDING_FRAME_SIZE)?;

            if s.target.is_none() {
                return Ok(());
            }

            let stream = self.streams.get_mut(&stream_id).unwrap();
            stream.send_aux.stop_sending.state = SenderState::Unacked;
            let error_code = stream.send_aux.stop_sending.error_code;

            let frm = frame::Frame::StopSending {
                stream_id,
                error_code,
            };

            let target = s.target.as_mut().unwrap();
            let mut b = BytesMut::with_slice(
                &mut target.buf[target.dst..target.dst_end],
            );
            frm.to_bytes(&mut b)?;
            target.dst += b.off();

            self.egress.ledger.register(
                self.egress.packet_number,
                s.now,
                AckAction::StreamState {
                    stream_id,
                    kind: StateSenderKind::StopSending,
                },
            );
        }

        // RST_STREAM if armed; nothing else goes out on a reset stream.
        if self.streams.get(&stream_id).unwrap().send_aux.rst.state ==
            SenderState::Send
        {
            self.prepare_packet(s, out, frame::MAX_RST_STREAM_FRAME_SIZE)?;

            if s.target.is_none() {
                return Ok(());
            }

            let stream = self.streams.get_mut(&stream_id).unwrap();
            stream.send_aux.rst.state = SenderState::Unacked;

            let frm = frame::Frame::RstStream {
                stream_id,
                error_code: stream.send_aux.rst.error_code,
                final_offset: stream.send_aux.max_sent,
            };

            let target = s.target.as_mut().unwrap();
            let mut b = BytesMut::with_slice(
                &mut target.buf[target.dst..target.dst_end],
            );
            frm.to_bytes(&mut b)?;
            target.dst += b.off();

            self.egress.ledger.register(
                self.egress.packet_number,
                s.now,
                AckAction::StreamState {
                    stream_id,
                    kind: StateSenderKind::RstStream,
                },
            );

            return Ok(());
        }

        // MAX_STREAM_DATA if the window check fires.
        {
            let stream = self.streams.get(&stream_id).unwrap();

            if stream.send_aux.max_stream_data_sender.should_update(
                stream.recvbuf.data_off(),
                stream.recv_aux.window,
                MAX_SENDER_SLACK,
            ) {
                self.send_max_stream_data_frame(stream_id, s, out)?;
            }
        }

        self.send_stream_frames(stream_id, s, out)
    }

    fn send_stream_frames(
        &mut self, stream_id: u32, s: &mut SendContext,
        out: &mut Vec<Vec<u8>>,
    ) -> Result<()> {
        // The scheduling cap: the peer's stream window, tightened by the
        // connection-level credit for non-zero streams. The FIN
        // pseudo-offset rides along once everything below it is allowed.
        let max_stream_data = {
            let stream = self.streams.get(&stream_id).unwrap();
            let eos = stream.sendbuf.eos();
            let max_sent = stream.send_aux.max_sent;

            if eos != u64::MAX && max_sent + 1 >= eos {
                eos + 1
            } else {
                let mut delta = stream
                    .send_aux
                    .max_stream_data
                    .saturating_sub(max_sent);

                if stream_id != 0 {
                    let credit = self
                        .egress
                        .max_data_permitted
                        .saturating_sub(self.egress.max_data_sent);
                    let credit = credit.min(u128::from(u64::MAX)) as u64;

                    delta = delta.min(credit);
                }

                let mut cap = max_sent + delta;
                if cap == eos {
                    cap += 1;
                }
                cap
            }
        };

        let mut i = 0;

        loop {
            let range = {
                let stream = self.streams.get(&stream_id).unwrap();
                match stream.sendbuf.pending().get(i) {
                    Some(r) => r,
                    None => break,
                }
            };

            if max_stream_data <= range.start {
                let stream = self.streams.get_mut(&stream_id).unwrap();
                stream.sendbuf.pending_mut().remove_entries(0, i);
                return Ok(());
            }

            let end = std::cmp::min(range.end, max_stream_data);
            let mut cursor = range.start;

            while cursor < end {
                match self.send_stream_frame(
                    stream_id,
                    cursor,
                    end - cursor,
                    s,
                    out,
                )? {
                    Some(next) => cursor = next,

                    // Out of packet budget.
                    None => {
                        let stream =
                            self.streams.get_mut(&stream_id).unwrap();
                        let pending = stream.sendbuf.pending_mut();

                        if cursor > range.start {
                            pending.set_entry_start(i, cursor);
                        }
                        pending.remove_entries(0, i);

                        return Ok(());
                    },
                }
            }

            // Clamped by the window: keep the remainder pending.
            if cursor < range.end {
                let stream = self.streams.get_mut(&stream_id).unwrap();
                let pending = stream.sendbuf.pending_mut();

                pending.set_entry_start(i, cursor);
                pending.remove_entries(0, i);

                return Ok(());
            }

            i += 1;
        }

        let stream = self.streams.get_mut(&stream_id).unwrap();
        stream.sendbuf.pending_mut().clear();

        Ok(())
    }

    /// Emits one STREAM frame starting at `off`, bounded by `max_bytes`
    /// and the space left in the packet. Returns the next offset to send,
    /// or `None` when the packet budget ran out.
    fn send_stream_frame(
        &mut self, stream_id: u32, off: u64, max_bytes: u64,
        s: &mut SendContext, out: &mut Vec<Vec<u8>>,
    ) -> Result<Option<u64>> {
        let eos = self.streams.get(&stream_id).unwrap().sendbuf.eos();

        let id_len = frame::stream_id_len(stream_id);
        let off_len = frame::offset_len(off);

        // Room for the header plus either a length-only FIN frame or a
        // length field and at least one data byte.
        let min_space =
            1 + id_len + off_len + if off == eos { 2 } else { 3 };

        self.prepare_packet(s, out, min_space)?;

        if s.target.is_none() {
            return Ok(None);
        }

        let (copysize, data_len_field, fin) = {
            let target = s.target.as_ref().unwrap();

            let capacity =
                target.dst_end - target.dst - (1 + id_len + off_len);

            // Keep the FIN pseudo-offset out of the copy.
            let avail =
                max_bytes - u64::from(off + max_bytes > eos);

            let mut copysize =
                std::cmp::min(capacity as u64, avail) as usize;
            copysize = std::cmp::min(copysize, 0xffff);

            // Omit the data length only when the data runs to the exact
            // end of the packet; otherwise reserve room for the field.
            let data_len_field = if copysize == capacity {
                None
            } else if copysize + 2 <= capacity {
                Some(copysize)
            } else {
                copysize = capacity - 2;
                Some(copysize)
            };

            let fin = off + copysize as u64 == eos;

            (copysize, data_len_field, fin)
        };

        // Account for flow control before the bytes hit the packet.
        {
            let conn = &mut *self;
            let stream = conn.streams.get_mut(&stream_id).unwrap();

            let frame_end = off + copysize as u64;

            if stream.send_aux.max_sent < frame_end {
                if stream_id != 0 {
                    let delta =
                        u128::from(frame_end - stream.send_aux.max_sent);

                    debug_assert!(
                        conn.egress.max_data_sent + delta <=
                            conn.egress.max_data_permitted
                    );

                    conn.egress.max_data_sent += delta;
                }

                stream.send_aux.max_sent = frame_end;
            }
        }

        let target = s.target.as_mut().unwrap();

        {
            let mut b = BytesMut::with_slice(
                &mut target.buf[target.dst..target.dst_end],
            );
            frame::encode_stream_header(
                &mut b,
                stream_id,
                off,
                data_len_field,
                fin,
            )?;
            target.dst += b.off();
        }

        let stream = self.streams.get(&stream_id).unwrap();
        stream
            .sendbuf
            .emit(off, &mut target.buf[target.dst..target.dst + copysize]);
        target.dst += copysize;

        trace!(
            "{} tx stream {} off={} len={} fin={}",
            self.trace_id,
            stream_id,
            off,
            copysize,
            fin
        );

        let record_end = off + copysize as u64 + u64::from(fin);

        self.egress.ledger.register(
            self.egress.packet_number,
            s.now,
            AckAction::Stream {
                stream_id,
                start: off,
                end: record_end,
            },
        );

        Ok(Some(record_end))
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    pub fn is_client(&self) -> bool {
        self.is_client
    }

    pub fn is_established(&self) -> bool {
        self.state == State::Established
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn connection_id(&self) -> u64 {
        self.connection_id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Streams currently alive, counting the TLS carrier.
    pub fn num_streams(&self) -> u32 {
        1 + self.host_num_streams + self.peer_num_streams
    }

    /// The id the next host-initiated stream will get; zero when the id
    /// space is exhausted.
    pub fn next_stream_id(&self) -> u32 {
        self.host_next_stream_id
    }

    /// Returns true while the stream exists (it is destroyed only after
    /// close and completion of both directions).
    pub fn stream_exists(&self, stream_id: u32) -> bool {
        self.streams.contains_key(&stream_id)
    }

    /// The peer's transport parameters (defaults until the handshake
    /// delivers the real ones).
    pub fn peer_transport_params(&self) -> &TransportParams {
        &self.peer_transport_params
    }

    #[cfg(test)]
    fn stream(&self, stream_id: u32) -> Option<&Stream> {
        self.streams.get(&stream_id)
    }
}

struct SendContext {
    packet_type: packet::Type,

    encrypted: bool,

    now: Instant,

    max_packets: usize,

    num_committed: usize,

    target: Option<PacketBuilder>,
}

struct PacketBuilder {
    buf: Vec<u8>,

    /// Write offset into `buf`.
    dst: usize,

    /// End of usable payload space (tag or checksum follows).
    dst_end: usize,
}
