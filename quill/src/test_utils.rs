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

//! Testing utilities: a deterministic TLS engine and a datagram pipe
//! shuttling packets between a client and a server connection.

use std::collections::HashMap;

use std::net::SocketAddr;

use std::time::Instant;

use crate::crypto;
use crate::tls;

use crate::Config;
use crate::Connection;
use crate::Error;
use crate::Packet;
use crate::Result;
use crate::StreamHandler;
use crate::StreamRef;

const MSG_CLIENT_HELLO: u8 = 1;
const MSG_SERVER_HELLO: u8 = 2;
const MSG_FINISHED: u8 = 3;

/// A deterministic three-flight TLS 1.3 stand-in.
///
/// ClientHello and ServerHello carry the raw transport-parameters
/// extension; Finished closes the exchange. Exporter secrets are keyed
/// off the shared transcript, so both endpoints derive identical 1-RTT
/// material without any actual key exchange.
pub struct TestSession {
    is_client: bool,

    local_ext: Vec<u8>,

    peer_ext: Option<Vec<u8>>,

    /// ClientHello body followed by ServerHello body; identical on both
    /// sides by the time secrets are exported.
    transcript: Vec<u8>,

    buffer: Vec<u8>,

    started: bool,

    complete: bool,
}

impl TestSession {
    pub fn client() -> Box<dyn tls::Session> {
        Box::new(TestSession::new(true))
    }

    pub fn server() -> Box<dyn tls::Session> {
        Box::new(TestSession::new(false))
    }

    fn new(is_client: bool) -> TestSession {
        TestSession {
            is_client,
            local_ext: Vec::new(),
            peer_ext: None,
            transcript: Vec::new(),
            buffer: Vec::new(),
            started: false,
            complete: false,
        }
    }

    /// Pops one complete handshake message off the input buffer.
    fn next_msg(&mut self) -> Result<Option<(u8, Vec<u8>)>> {
        if self.buffer.len() < 4 {
            return Ok(None);
        }

        let kind = self.buffer[0];
        let len = (usize::from(self.buffer[1]) << 16) |
            (usize::from(self.buffer[2]) << 8) |
            usize::from(self.buffer[3]);

        if self.buffer.len() < 4 + len {
            return Ok(None);
        }

        let body = self.buffer[4..4 + len].to_vec();
        self.buffer.drain(..4 + len);

        Ok(Some((kind, body)))
    }
}

fn encode_msg(kind: u8, body: &[u8]) -> Vec<u8> {
    let mut out = vec![
        kind,
        (body.len() >> 16) as u8,
        (body.len() >> 8) as u8,
        body.len() as u8,
    ];
    out.extend_from_slice(body);
    out
}

impl tls::Session for TestSession {
    fn drive(
        &mut self, input: &[u8], out: &mut Vec<u8>,
    ) -> Result<tls::HandshakeStatus> {
        self.buffer.extend_from_slice(input);

        if self.is_client && !self.started {
            self.started = true;

            self.transcript.extend_from_slice(&self.local_ext);
            out.extend_from_slice(&encode_msg(
                MSG_CLIENT_HELLO,
                &self.local_ext,
            ));
        }

        while let Some((kind, body)) = self.next_msg()? {
            match (self.is_client, kind) {
                (false, MSG_CLIENT_HELLO) => {
                    self.transcript.extend_from_slice(&body);
                    self.transcript.extend_from_slice(&self.local_ext);
                    self.peer_ext = Some(body);

                    out.extend_from_slice(&encode_msg(
                        MSG_SERVER_HELLO,
                        &self.local_ext,
                    ));
                },

                (true, MSG_SERVER_HELLO) => {
                    self.transcript.extend_from_slice(&body);
                    self.peer_ext = Some(body);

                    out.extend_from_slice(&encode_msg(MSG_FINISHED, &[]));
                    self.complete = true;
                },

                (false, MSG_FINISHED) => {
                    self.complete = true;
                },

                _ => return Err(Error::TlsFail),
            }
        }

        Ok(if self.complete {
            tls::HandshakeStatus::Complete
        } else {
            tls::HandshakeStatus::InProgress
        })
    }

    fn is_complete(&self) -> bool {
        self.complete
    }

    fn algorithm(&self) -> crypto::Algorithm {
        crypto::Algorithm::AES128_GCM
    }

    fn export_secret(&self, label: &str, out: &mut [u8]) -> Result<()> {
        if !self.complete {
            return Err(Error::TlsFail);
        }

        let digest =
            ring::digest::digest(&ring::digest::SHA256, &self.transcript);

        let key = ring::hmac::Key::new(ring::hmac::HMAC_SHA256, digest.as_ref());
        let tag = ring::hmac::sign(&key, label.as_bytes());

        let n = std::cmp::min(out.len(), tag.as_ref().len());
        out[..n].copy_from_slice(&tag.as_ref()[..n]);

        Ok(())
    }

    fn set_transport_params(&mut self, raw: Vec<u8>) {
        self.local_ext = raw;
    }

    fn peer_transport_params(&self) -> Option<&[u8]> {
        self.peer_ext.as_deref()
    }
}

pub fn client_addr() -> SocketAddr {
    "127.0.0.1:4321".parse().unwrap()
}

pub fn server_addr() -> SocketAddr {
    "127.0.0.1:4433".parse().unwrap()
}

/// Swallows stream events.
pub struct NoopHandler;

impl StreamHandler for NoopHandler {}

/// Records everything delivered, consuming it as a well-behaved
/// application would.
#[derive(Default)]
pub struct Sink {
    pub data: HashMap<u32, Vec<u8>>,

    pub opened: Vec<u32>,

    pub updates: HashMap<u32, usize>,

    pub fins: Vec<u32>,

    pub resets: HashMap<u32, u32>,
}

impl StreamHandler for Sink {
    fn on_open(&mut self, stream: &mut StreamRef) -> Result<()> {
        self.opened.push(stream.id());
        Ok(())
    }

    fn on_update(&mut self, stream: &mut StreamRef) -> Result<()> {
        let id = stream.id();

        *self.updates.entry(id).or_default() += 1;

        let chunk = stream.data().to_vec();
        if !chunk.is_empty() {
            stream.shift(chunk.len());
            self.data.entry(id).or_default().extend_from_slice(&chunk);
        }

        if stream.fin() && !self.fins.contains(&id) {
            self.fins.push(id);
        }

        if let Some(code) = stream.reset_code() {
            self.resets.insert(id, code);
        }

        Ok(())
    }
}

/// Echoes every byte back and finishes when the peer does.
#[derive(Default)]
pub struct Echo {
    pub opened: Vec<u32>,
}

impl StreamHandler for Echo {
    fn on_open(&mut self, stream: &mut StreamRef) -> Result<()> {
        self.opened.push(stream.id());
        Ok(())
    }

    fn on_update(&mut self, stream: &mut StreamRef) -> Result<()> {
        let chunk = stream.data().to_vec();

        if !chunk.is_empty() {
            stream.shift(chunk.len());
            stream.write(&chunk)?;
        }

        if stream.fin() {
            stream.shutdown();
            stream.close();
        }

        Ok(())
    }
}

/// A client and a server connection joined by an in-memory datagram
/// path.
pub struct Pipe {
    pub client: Connection,

    pub server: Connection,
}

impl Pipe {
    /// Connects a client to a freshly accepted server, consuming the
    /// CLIENT_INITIAL datagram. The handshake itself is not advanced.
    pub fn new(
        client_config: &Config, server_config: &Config, now: Instant,
    ) -> Result<Pipe> {
        let mut client =
            crate::connect(server_addr(), client_config, TestSession::client())?;

        let mut flight = Vec::new();
        client.send(&mut flight, 16, now)?;

        assert_eq!(flight.len(), 1);
        let mut dgram = flight.pop().unwrap();

        // The first flight is a full-size padded datagram.
        assert_eq!(dgram.len(), 1280);

        let mut pkt = Packet::decode(&mut dgram)?;

        let server = crate::accept(
            client_addr(),
            server_config,
            TestSession::server(),
            &mut pkt,
        )?;

        Ok(Pipe { client, server })
    }

    /// Completes the handshake with no application handlers involved.
    pub fn handshake(&mut self, now: Instant) -> Result<()> {
        let mut noop_c = NoopHandler;
        let mut noop_s = NoopHandler;

        self.advance(&mut noop_c, &mut noop_s, now)
    }

    /// Shuttles datagrams both ways until the connections go idle.
    pub fn advance(
        &mut self, client_handler: &mut dyn StreamHandler,
        server_handler: &mut dyn StreamHandler, now: Instant,
    ) -> Result<()> {
        loop {
            let mut progress = false;

            let mut flight = Vec::new();
            self.client.send(&mut flight, 64, now)?;

            for mut dgram in flight {
                progress = true;
                deliver(&mut self.server, &mut dgram, server_handler)?;
            }

            let mut flight = Vec::new();
            self.server.send(&mut flight, 64, now)?;

            for mut dgram in flight {
                progress = true;
                deliver(&mut self.client, &mut dgram, client_handler)?;
            }

            if !progress {
                return Ok(());
            }
        }
    }
}

/// Decodes one datagram and feeds it to the connection.
pub fn deliver(
    conn: &mut Connection, dgram: &mut [u8], handler: &mut dyn StreamHandler,
) -> Result<()> {
    let mut pkt = Packet::decode(dgram)?;
    conn.recv(&mut pkt, handler)
}
