//! Transport-level tests against the in-process device.

use std::time::Duration;

use bytes::{Buf, BytesMut};
use ipbus_wire::{
    encode_request, PacketHeader, PacketType, ProtocolVersion, RequestBody,
};
use tl_udp::{DummyConfig, DummyHardware, UdpError, UdpTransport};

const TEST_TIMEOUT: Duration = Duration::from_millis(200);

fn control_packet(bodies: &[RequestBody]) -> BytesMut {
    let mut packet = BytesMut::new();
    // Placeholder id, stamped by the transport.
    PacketHeader::new(PacketType::Control, 0).put(&mut packet);
    for (index, body) in bodies.iter().enumerate() {
        encode_request(&mut packet, ProtocolVersion::V2_0, index as u16, body)
            .expect("encode request");
    }
    packet
}

#[tokio::test]
async fn negotiation_adopts_the_device_parameters() {
    let handle = DummyHardware::spawn(DummyConfig {
        mtu: 576,
        buffers: 2,
        ..DummyConfig::default()
    })
    .await
    .expect("spawn");
    let mut transport = UdpTransport::new(handle.addr(), ProtocolVersion::V2_0);
    transport.set_timeout(TEST_TIMEOUT);
    assert_eq!(transport.packet_capacity_words(), 1500 / 4 - 1);
    transport.ensure_ready().await.expect("negotiate");
    assert_eq!(transport.packet_capacity_words(), 576 / 4 - 1);
    assert_eq!(handle.status_requests(), 1);
}

#[tokio::test]
async fn exchange_returns_replies_in_packet_order() {
    let handle = DummyHardware::spawn(DummyConfig::default())
        .await
        .expect("spawn");
    let mut transport = UdpTransport::new(handle.addr(), ProtocolVersion::V2_0);
    transport.set_timeout(TEST_TIMEOUT);

    let packets = vec![
        control_packet(&[RequestBody::Write {
            addr: 0x10,
            data: vec![0xAA],
        }]),
        control_packet(&[RequestBody::Read { addr: 0x10, words: 1 }]),
    ];
    let replies = transport.exchange(packets).await.expect("exchange");
    assert_eq!(replies.len(), 2);

    // The second reply carries the word written by the first packet.
    let mut cursor = &replies[1][..];
    let header = PacketHeader::get(&mut cursor).expect("header");
    assert_eq!(header.ty, PacketType::Control);
    cursor.advance(4);
    assert_eq!(cursor.get_u32_le(), 0xAA);
}

#[tokio::test]
async fn dropped_reply_is_resent_after_a_probe() {
    let handle = DummyHardware::spawn(DummyConfig::default())
        .await
        .expect("spawn");
    let mut transport = UdpTransport::new(handle.addr(), ProtocolVersion::V2_0);
    transport.set_timeout(TEST_TIMEOUT);
    transport.ensure_ready().await.expect("negotiate");

    handle.drop_next_replies(1);
    let replies = transport
        .exchange(vec![control_packet(&[RequestBody::Read {
            addr: 0x0,
            words: 1,
        }])])
        .await
        .expect("exchange recovers");
    assert_eq!(replies.len(), 1);
    assert!(handle.resend_requests() >= 1);
    let stats = transport.stats().snapshot();
    assert!(stats.status_probes >= 2);
    assert!(stats.resend_requests >= 1);
}

#[tokio::test]
async fn silent_device_kills_the_link() {
    let handle = DummyHardware::spawn(DummyConfig::default())
        .await
        .expect("spawn");
    let mut transport = UdpTransport::new(handle.addr(), ProtocolVersion::V2_0);
    transport.set_timeout(Duration::from_millis(50));
    transport.ensure_ready().await.expect("negotiate");

    handle.set_drop_all(true);
    let err = transport
        .exchange(vec![control_packet(&[RequestBody::Read {
            addr: 0x0,
            words: 1,
        }])])
        .await
        .expect_err("link must die");
    assert!(matches!(err, UdpError::Dead { .. }));

    // Dead links refuse further traffic without touching the socket.
    let err = transport
        .exchange(vec![control_packet(&[RequestBody::Read {
            addr: 0x0,
            words: 1,
        }])])
        .await
        .expect_err("still dead");
    assert!(matches!(err, UdpError::Dead { .. }));
}

#[tokio::test]
async fn version_1_3_is_stop_and_wait_with_retransmission() {
    let handle = DummyHardware::spawn(DummyConfig {
        version: ProtocolVersion::V1_3,
        ..DummyConfig::default()
    })
    .await
    .expect("spawn");
    let mut transport = UdpTransport::new(handle.addr(), ProtocolVersion::V1_3);
    transport.set_timeout(TEST_TIMEOUT);

    let mut write = BytesMut::new();
    encode_request(
        &mut write,
        ProtocolVersion::V1_3,
        0,
        &RequestBody::Write {
            addr: 0x8,
            data: vec![0x5555],
        },
    )
    .expect("encode");
    transport.exchange(vec![write]).await.expect("exchange");
    assert_eq!(handle.status_requests(), 0);

    // A dropped reply is recovered by retransmitting the request itself.
    handle.drop_next_replies(1);
    let mut read = BytesMut::new();
    encode_request(
        &mut read,
        ProtocolVersion::V1_3,
        1,
        &RequestBody::Read { addr: 0x8, words: 1 },
    )
    .expect("encode");
    let replies = transport.exchange(vec![read]).await.expect("exchange recovers");
    assert_eq!(replies.len(), 1);
    // Reply header word, then the data word.
    assert_eq!(&replies[0][4..8], &0x5555u32.to_le_bytes());
    assert_eq!(handle.status_requests(), 0);
    assert!(transport.stats().snapshot().retransmits >= 1);
}

#[tokio::test]
async fn fresh_link_that_never_answers_dies_during_negotiation() {
    let handle = DummyHardware::spawn(DummyConfig::default())
        .await
        .expect("spawn");
    handle.set_drop_all(true);
    let mut transport = UdpTransport::new(handle.addr(), ProtocolVersion::V2_0);
    transport.set_timeout(Duration::from_millis(50));
    let err = transport.ensure_ready().await.expect_err("negotiation dies");
    assert!(matches!(err, UdpError::Dead { .. }));
}
