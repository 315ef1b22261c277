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

use std::time::Duration;
use std::time::Instant;

use crate::packet;
use crate::stream::SenderState;
use crate::test_utils::*;
use crate::*;

fn test_config() -> Config {
    let mut config = Config::new();
    config.set_initial_rto(Duration::from_millis(100));
    config
}

#[test]
fn client_initial_sizing() {
    let now = Instant::now();
    let config = test_config();

    let mut client =
        connect(server_addr(), &config, TestSession::client()).unwrap();

    let mut flight = Vec::new();
    client.send(&mut flight, 16, now).unwrap();

    assert_eq!(flight.len(), 1);
    let dgram = &flight[0];

    // 1272 bytes of packet ahead of the 8-byte checksum trailer.
    assert_eq!(dgram.len(), 1280);

    let trailer =
        u64::from_be_bytes(dgram[1272..].try_into().unwrap());
    assert_eq!(packet::fnv1a_trailer(&dgram[..1272]), trailer);
}

#[test]
fn handshake_completes() {
    let now = Instant::now();
    let config = test_config();

    let mut server_config = test_config();
    server_config.set_transport_params(TransportParams {
        initial_max_stream_data: 16384,
        initial_max_data_kb: 64,
        initial_max_stream_id: 400,
        idle_timeout: 30,
        truncate_connection_id: false,
    });

    let mut pipe = Pipe::new(&config, &server_config, now).unwrap();

    assert!(pipe.client.is_client());
    assert!(!pipe.server.is_client());
    assert_eq!(pipe.client.connection_id(), pipe.server.connection_id());

    assert!(!pipe.client.is_established());
    assert_eq!(pipe.server.state(), State::BeforeServerFinished);

    pipe.handshake(now).unwrap();

    assert!(pipe.client.is_established());
    assert!(pipe.server.is_established());

    // Each side committed the other's offer.
    assert_eq!(
        pipe.client.peer_transport_params().initial_max_data_kb,
        64
    );
    assert_eq!(
        pipe.client.peer_transport_params().initial_max_stream_data,
        16384
    );
    assert_eq!(
        pipe.server.peer_transport_params().initial_max_data_kb,
        TransportParams::default().initial_max_data_kb
    );

    // Opposite exporter labels produce matching directional keys, so the
    // secrets must differ per direction but cross-match.
    assert_eq!(pipe.client.egress.secret, pipe.server.ingress.keys.secret);
    assert_eq!(pipe.client.ingress.keys.secret, pipe.server.egress.secret);
    assert_ne!(pipe.client.egress.secret, pipe.client.ingress.keys.secret);

    assert_eq!(pipe.client.num_streams(), 1);
    assert_eq!(pipe.server.num_streams(), 1);
}

#[test]
fn echo_smoke() {
    let now = Instant::now();
    let config = test_config();

    let mut pipe = Pipe::new(&config, &config, now).unwrap();
    pipe.handshake(now).unwrap();

    let mut sink = Sink::default();
    let mut echo = Echo::default();

    let stream_id = pipe.client.open_stream().unwrap();
    assert_eq!(stream_id, 1);

    pipe.client.stream_write(stream_id, b"hello").unwrap();
    pipe.client.stream_shutdown(stream_id).unwrap();

    pipe.advance(&mut sink, &mut echo, now).unwrap();

    // The server opened the stream and echoed everything back.
    assert_eq!(echo.opened, vec![1]);
    assert_eq!(sink.data.get(&1).unwrap(), b"hello");
    assert!(sink.fins.contains(&1));

    // The echo side closed itself once both directions finished.
    assert!(!pipe.server.stream_exists(stream_id));
    assert_eq!(pipe.server.num_streams(), 1);

    // The client's send side is fully acknowledged; closing tears the
    // stream down immediately.
    assert!(pipe.client.stream(stream_id).unwrap().sendbuf.is_complete());
    pipe.client.close_stream(stream_id).unwrap();
    assert!(!pipe.client.stream_exists(stream_id));
    assert_eq!(pipe.client.num_streams(), 1);

    // Both connections are idle again.
    assert!(pipe.client.egress.ledger.is_empty());
    assert!(pipe.server.egress.ledger.is_empty());
    assert_eq!(pipe.client.timeout(now), None);

    // An encrypted ack-eliciting packet arrived on both sides, so acks
    // are latched to encrypted packets from here on.
    assert!(pipe.client.egress.acks_require_encryption);
    assert!(pipe.server.egress.acks_require_encryption);
}

#[test]
fn reordered_packets() {
    let now = Instant::now();
    let config = test_config();

    let mut pipe = Pipe::new(&config, &config, now).unwrap();
    pipe.handshake(now).unwrap();

    let mut sink = Sink::default();

    let stream_id = pipe.client.open_stream().unwrap();

    pipe.client.stream_write(stream_id, b"01234").unwrap();
    let mut first = Vec::new();
    pipe.client.send(&mut first, 16, now).unwrap();
    assert_eq!(first.len(), 1);

    pipe.client.stream_write(stream_id, b"56789").unwrap();
    let mut second = Vec::new();
    pipe.client.send(&mut second, 16, now).unwrap();
    assert_eq!(second.len(), 1);

    // Deliver in reverse order.
    deliver(&mut pipe.server, &mut second[0], &mut sink).unwrap();
    assert!(sink.data.get(&stream_id).is_none());

    deliver(&mut pipe.server, &mut first[0], &mut sink).unwrap();

    // The whole sequence arrived in a single callback.
    assert_eq!(sink.data.get(&stream_id).unwrap(), b"0123456789");
    assert_eq!(sink.updates.get(&stream_id), Some(&1));
}

#[test]
fn retransmit_on_rto() {
    let now = Instant::now();
    let config = test_config();

    let mut pipe = Pipe::new(&config, &config, now).unwrap();
    pipe.handshake(now).unwrap();

    let mut sink = Sink::default();

    let stream_id = pipe.client.open_stream().unwrap();

    let mut expected = Vec::new();
    let mut packets = Vec::new();

    for byte in [b'a', b'b', b'c'] {
        let chunk = vec![byte; 100];
        expected.extend_from_slice(&chunk);

        pipe.client.stream_write(stream_id, &chunk).unwrap();

        let mut flight = Vec::new();
        pipe.client.send(&mut flight, 16, now).unwrap();
        assert_eq!(flight.len(), 1);
        packets.push(flight.pop().unwrap());
    }

    // Packet 2 is lost.
    deliver(&mut pipe.server, &mut packets[0], &mut sink).unwrap();
    deliver(&mut pipe.server, &mut packets[2], &mut sink).unwrap();

    // The peer acknowledges what it got (two disjoint blocks).
    let mut acks = Vec::new();
    pipe.server.send(&mut acks, 16, now).unwrap();
    for dgram in &mut acks {
        deliver(&mut pipe.client, dgram, &mut NoopHandler).unwrap();
    }

    assert_eq!(pipe.client.egress.ledger.len(), 1);
    assert!(pipe.client.timeout(now).is_some());

    // Nothing new to send before the timeout fires.
    let mut flight = Vec::new();
    pipe.client.send(&mut flight, 16, now).unwrap();
    assert!(flight.is_empty());

    // On RTO the lost bytes are rescheduled and re-emitted.
    let later = now + Duration::from_millis(150);
    pipe.client.send(&mut flight, 16, later).unwrap();
    assert_eq!(flight.len(), 1);

    deliver(&mut pipe.server, &mut flight[0], &mut sink).unwrap();

    assert_eq!(sink.data.get(&stream_id).unwrap(), &expected);
}

#[test]
fn rst_wins_over_fin() {
    let now = Instant::now();
    let config = test_config();

    let mut pipe = Pipe::new(&config, &config, now).unwrap();
    pipe.handshake(now).unwrap();

    let mut sink = Sink::default();

    let stream_id = pipe.client.open_stream().unwrap();

    // 1000 bytes go on the wire (and are lost); the FIN was never sent.
    pipe.client.stream_write(stream_id, &[0x5a; 1000]).unwrap();
    let mut flight = Vec::new();
    pipe.client.send(&mut flight, 16, now).unwrap();
    assert_eq!(flight.len(), 1);
    drop(flight);

    pipe.client.stream_reset(stream_id, 42).unwrap();

    {
        let stream = pipe.client.stream(stream_id).unwrap();
        assert_eq!(stream.send_aux.rst.state, SenderState::Send);
        assert!(!stream.sendbuf.is_complete());
    }

    let mut flight = Vec::new();
    pipe.client.send(&mut flight, 16, now).unwrap();
    assert_eq!(flight.len(), 1);

    deliver(&mut pipe.server, &mut flight[0], &mut sink).unwrap();

    // The peer observed the reset with the full final offset.
    assert_eq!(sink.resets.get(&stream_id), Some(&42));
    assert_eq!(pipe.server.stream(stream_id).unwrap().recvbuf.eos(), 1000);

    // Not acknowledged until the RST itself is.
    assert!(!pipe.client.stream(stream_id).unwrap().sendbuf.is_complete());
    assert_eq!(
        pipe.client.stream(stream_id).unwrap().send_aux.rst.state,
        SenderState::Unacked
    );

    let mut acks = Vec::new();
    pipe.server.send(&mut acks, 16, now).unwrap();
    for dgram in &mut acks {
        deliver(&mut pipe.client, dgram, &mut NoopHandler).unwrap();
    }

    assert_eq!(
        pipe.client.stream(stream_id).unwrap().send_aux.rst.state,
        SenderState::Acked
    );
}

#[test]
fn flow_control_stall() {
    let now = Instant::now();
    let config = test_config();

    // The server grants a 1 KB connection window.
    let mut server_config = test_config();
    server_config.set_transport_params(TransportParams {
        initial_max_data_kb: 1,
        ..TransportParams::default()
    });

    let mut pipe = Pipe::new(&config, &server_config, now).unwrap();
    pipe.handshake(now).unwrap();

    assert_eq!(pipe.client.egress.max_data_permitted, 1024);

    let mut sink = Sink::default();

    let stream_id = pipe.client.open_stream().unwrap();
    pipe.client.stream_write(stream_id, &[0x42; 2048]).unwrap();

    let mut flight = Vec::new();
    pipe.client.send(&mut flight, 16, now).unwrap();
    assert_eq!(flight.len(), 1);

    for dgram in &mut flight {
        deliver(&mut pipe.server, dgram, &mut sink).unwrap();
    }

    // Exactly the permitted 1024 bytes went out.
    assert_eq!(sink.data.get(&stream_id).unwrap().len(), 1024);
    assert_eq!(pipe.client.egress.max_data_sent, 1024);

    // Stalled: nothing more fits the window.
    let mut flight = Vec::new();
    pipe.client.send(&mut flight, 16, now).unwrap();
    assert!(flight.is_empty());

    // MAX_DATA advertising 2 KB unblocks the remainder.
    pipe.client.handle_max_data_frame(2).unwrap();

    let mut flight = Vec::new();
    pipe.client.send(&mut flight, 16, now).unwrap();
    assert_eq!(flight.len(), 1);

    for dgram in &mut flight {
        deliver(&mut pipe.server, dgram, &mut sink).unwrap();
    }

    assert_eq!(sink.data.get(&stream_id).unwrap().len(), 2048);
    assert_eq!(pipe.client.egress.max_data_sent, 2048);

    // A shrinking advertisement is a flow-control violation.
    assert_eq!(
        pipe.client.handle_max_data_frame(1),
        Err(Error::FlowControl)
    );
}

#[test]
fn duplicate_ack_is_ignored() {
    let now = Instant::now();
    let config = test_config();

    let mut pipe = Pipe::new(&config, &config, now).unwrap();
    pipe.handshake(now).unwrap();

    let mut sink = Sink::default();

    let stream_id = pipe.client.open_stream().unwrap();
    pipe.client.stream_write(stream_id, b"ping").unwrap();

    let mut flight = Vec::new();
    pipe.client.send(&mut flight, 16, now).unwrap();
    deliver(&mut pipe.server, &mut flight[0], &mut sink).unwrap();

    let mut acks = Vec::new();
    pipe.server.send(&mut acks, 16, now).unwrap();
    assert_eq!(acks.len(), 1);

    let mut duplicate = acks[0].clone();

    deliver(&mut pipe.client, &mut acks[0], &mut NoopHandler).unwrap();
    assert!(pipe.client.egress.ledger.is_empty());

    // The same packet number acked again matches no record and changes
    // nothing.
    deliver(&mut pipe.client, &mut duplicate, &mut NoopHandler).unwrap();
    assert!(pipe.client.egress.ledger.is_empty());
    assert!(pipe.client.stream_exists(stream_id));
}

#[test]
fn peer_stream_gap_open() {
    let now = Instant::now();
    let config = test_config();

    let mut pipe = Pipe::new(&config, &config, now).unwrap();
    pipe.handshake(now).unwrap();

    let mut sink = Sink::default();

    // Three client streams, data only on the last one.
    assert_eq!(pipe.client.open_stream().unwrap(), 1);
    assert_eq!(pipe.client.open_stream().unwrap(), 3);
    assert_eq!(pipe.client.open_stream().unwrap(), 5);
    assert_eq!(pipe.client.next_stream_id(), 7);

    pipe.client.stream_write(5, b"x").unwrap();

    let mut flight = Vec::new();
    pipe.client.send(&mut flight, 16, now).unwrap();

    for dgram in &mut flight {
        deliver(&mut pipe.server, dgram, &mut sink).unwrap();
    }

    // Every id up to the named one was opened, in order.
    assert_eq!(sink.opened, vec![1, 3, 5]);
    assert_eq!(pipe.server.num_streams(), 4);
    assert_eq!(sink.data.get(&5).unwrap(), b"x");
}

#[test]
fn handshake_flight_must_fit_one_datagram() {
    let now = Instant::now();
    let config = test_config();

    let mut client =
        connect(server_addr(), &config, TestSession::client()).unwrap();

    // Stuff the TLS carrier far past a single padded datagram.
    client.stream_write(0, &[0; 4096]).unwrap();

    let mut flight = Vec::new();
    assert_eq!(
        client.send(&mut flight, 16, now),
        Err(Error::HandshakeTooLarge)
    );
}

#[test]
fn mismatched_connection_id_is_ignored() {
    let now = Instant::now();
    let config = test_config();

    let mut pipe = Pipe::new(&config, &config, now).unwrap();

    let mut flight = Vec::new();
    pipe.server.send(&mut flight, 16, now).unwrap();
    assert!(!flight.is_empty());

    // Corrupt the connection id in the long header.
    flight[0][3] ^= 0xff;

    assert_eq!(
        deliver(&mut pipe.client, &mut flight[0], &mut NoopHandler),
        Err(Error::PacketIgnored)
    );
}

#[test]
fn short_header_rejected_before_handshake() {
    let now = Instant::now();
    let config = test_config();

    let mut pipe = Pipe::new(&config, &config, now).unwrap();

    // Key phase 0, connection id present, 1-byte packet number.
    let mut dgram = vec![0x41];
    dgram.extend_from_slice(&pipe.server.connection_id().to_be_bytes());
    dgram.push(7);
    dgram.extend_from_slice(&[0; 32]);

    assert_eq!(
        deliver(&mut pipe.server, &mut dgram, &mut NoopHandler),
        Err(Error::InvalidPacketHeader)
    );
}

#[test]
fn decryption_failure_is_not_fatal() {
    let now = Instant::now();
    let config = test_config();

    let mut pipe = Pipe::new(&config, &config, now).unwrap();
    pipe.handshake(now).unwrap();

    let mut sink = Sink::default();

    let stream_id = pipe.client.open_stream().unwrap();
    pipe.client.stream_write(stream_id, b"intact").unwrap();

    let mut flight = Vec::new();
    pipe.client.send(&mut flight, 16, now).unwrap();

    let mut corrupted = flight[0].clone();
    let last = corrupted.len() - 1;
    corrupted[last] ^= 0xff;

    assert_eq!(
        deliver(&mut pipe.server, &mut corrupted, &mut sink),
        Err(Error::DecryptionFailure)
    );

    // The connection survives and accepts the intact copy.
    deliver(&mut pipe.server, &mut flight[0], &mut sink).unwrap();
    assert_eq!(sink.data.get(&stream_id).unwrap(), b"intact");
}

#[test]
fn accept_rejects_garbage_initial() {
    let now = Instant::now();
    let config = test_config();

    let mut client =
        connect(server_addr(), &config, TestSession::client()).unwrap();

    let mut flight = Vec::new();
    client.send(&mut flight, 16, now).unwrap();

    // Smuggle a non-padding byte into the padded area.
    let mut dgram = flight.pop().unwrap();
    dgram[1200] = 0x99;
    let hash = packet::fnv1a_trailer(&dgram[..1272]);
    dgram[1272..].copy_from_slice(&hash.to_be_bytes());

    let mut pkt = Packet::decode(&mut dgram).unwrap();
    assert_eq!(
        accept(client_addr(), &config, TestSession::server(), &mut pkt)
            .unwrap_err(),
        Error::InvalidFrameData
    );
}
