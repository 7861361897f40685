//! End-to-end pipeline test over a synthesized capture file: pcap file in,
//! typed game event messages out.

use std::time::Duration;

use aetherscope::frame::ConnectionType;
use aetherscope::{
    CaptureMode, FrameHeader, GameEventSubscriber, Sniffer, Status, StopReason,
};

/// 92-byte compressed frame: one game event, opcode 0x145, server 5.
const COMPRESSED_FRAME: [u8; 92] = [
    0x52, 0x52, 0xA0, 0x41, 0xFF, 0x5D, 0x46, 0xE2, // magic
    0x7F, 0x2A, 0x64, 0x4D, 0x7B, 0x99, 0xC4, 0x75, // unknown
    0x81, 0x48, 0x6E, 0xD6, 0x68, 0x01, 0x00, 0x00, // time
    0x5C, 0x00, 0x00, 0x00, 0x00, 0x00, 0x01, 0x00, // length, connection, count
    0x01, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, // reserved, compressed, padding
    0x78, 0x9C, 0x33, 0x60, 0x60, 0x60, 0x28, 0x8B, 0x50, 0x13, 0x58, 0x33, 0x45, 0x51, 0x80,
    0x19, 0xC8, 0x16, 0x61, 0x70, 0x65, 0x64, 0x60, 0x60, 0x65, 0xD8, 0x74, 0x2B, 0x3E, 0x06,
    0xC8, 0x65, 0x88, 0xD9, 0xC8, 0xC0, 0xC0, 0x61, 0xF2, 0x82, 0xD9, 0x5F, 0xD4, 0x81, 0x11,
    0xC4, 0x07, 0x00, 0xCD, 0xC1, 0x08, 0x28,
];

const KEEPALIVE_MESSAGE: [u8; 24] = [
    0x18, 0x00, 0x00, 0x00, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x08, 0x00, 0x00,
    0x00, 0x15, 0xCD, 0x5B, 0x07, 0x42, 0xE0, 0x89, 0x58,
];

/// An uncompressed frame wrapping a single keepalive message.
fn keepalive_frame() -> Vec<u8> {
    let header = FrameHeader {
        magic: aetherscope::frame::FRAME_MAGIC,
        timestamp: std::time::UNIX_EPOCH + Duration::from_millis(1_549_785_778_305),
        length: (40 + KEEPALIVE_MESSAGE.len()) as u32,
        connection: ConnectionType::Zone,
        count: 1,
        compressed: false,
    };
    let mut blob = header.encode().to_vec();
    blob.extend_from_slice(&KEEPALIVE_MESSAGE);
    blob
}

/// Wrap a TCP payload in an Ethernet/IPv4/TCP packet from the game server
/// to a LAN client.
fn server_packet(seq: u32, payload: &[u8]) -> Vec<u8> {
    let builder = etherparse::PacketBuilder::ethernet2([0x02; 6], [0x04; 6])
        .ipv4([124, 150, 157, 158], [192, 168, 1, 100], 64)
        .tcp(54992, 55023, seq, 64_240);
    let mut packet = Vec::with_capacity(builder.size(payload.len()));
    builder.write(&mut packet, payload).expect("packet builds");
    packet
}

/// Write a classic little-endian pcap file around the given packets.
fn write_pcap(path: &std::path::Path, packets: &[Vec<u8>]) {
    let mut out = Vec::new();
    out.extend_from_slice(&0xA1B2_C3D4u32.to_le_bytes()); // magic
    out.extend_from_slice(&2u16.to_le_bytes()); // version major
    out.extend_from_slice(&4u16.to_le_bytes()); // version minor
    out.extend_from_slice(&0i32.to_le_bytes()); // thiszone
    out.extend_from_slice(&0u32.to_le_bytes()); // sigfigs
    out.extend_from_slice(&65_535u32.to_le_bytes()); // snaplen
    out.extend_from_slice(&1u32.to_le_bytes()); // linktype ethernet

    for (i, packet) in packets.iter().enumerate() {
        out.extend_from_slice(&(1_549_785_778u32 + i as u32).to_le_bytes()); // ts_sec
        out.extend_from_slice(&0u32.to_le_bytes()); // ts_usec
        out.extend_from_slice(&(packet.len() as u32).to_le_bytes()); // incl_len
        out.extend_from_slice(&(packet.len() as u32).to_le_bytes()); // orig_len
        out.extend_from_slice(packet);
    }

    std::fs::write(path, out).expect("write pcap file");
}

fn temp_pcap_path(name: &str) -> std::path::PathBuf {
    let mut path = std::env::temp_dir();
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_nanos();
    path.push(format!("{nanos}_{name}.pcap"));
    path
}

#[tokio::test]
async fn pcap_file_yields_typed_game_events() {
    // One TCP stream carrying: junk (capture started mid-frame), a
    // compressed game event frame, a keepalive frame the subscriber must
    // skip over, and a second game event frame, split across segments at
    // awkward offsets.
    let mut stream_bytes = vec![0xDE, 0xAD, 0xBE];
    stream_bytes.extend_from_slice(&COMPRESSED_FRAME);
    stream_bytes.extend_from_slice(&keepalive_frame());
    stream_bytes.extend_from_slice(&COMPRESSED_FRAME);

    let mut packets = Vec::new();
    let mut seq = 1_000u32;
    for chunk in stream_bytes.chunks(57) {
        packets.push(server_packet(seq, chunk));
        seq += chunk.len() as u32;
    }

    let path = temp_pcap_path("game_events");
    write_pcap(&path, &packets);

    let sniffer = Sniffer::new(CaptureMode::File, path.to_str().unwrap()).expect("sniffer opens");
    let (subscriber, mut stream) = GameEventSubscriber::new();

    let collect = async {
        let mut events = Vec::new();
        while let Some(event) = stream.ingress.recv().await {
            events.push(event);
        }
        events
    };

    let run = async {
        tokio::join!(sniffer.start(), async {
            let subscribed = subscriber.subscribe(&sniffer).await;
            // Dropping the subscriber closes its channels so the collector
            // below can finish.
            drop(subscriber);
            subscribed
        })
    };

    let ((started, subscribed), events) = tokio::time::timeout(Duration::from_secs(10), async {
        tokio::join!(run, collect)
    })
    .await
    .expect("pipeline completes");

    assert_eq!(started.expect("start returns"), StopReason::EndOfStream);
    subscribed.expect("subscriber returns cleanly");
    assert_eq!(sniffer.status(), Status::Finished);
    assert!(!sniffer.active());

    assert_eq!(events.len(), 2, "both game event frames decode");
    for event in &events {
        assert_eq!(event.opcode, 0x145);
        assert_eq!(event.server_id, 5);
        assert_eq!(event.header.segment, aetherscope::SegmentType::GameEvent);
    }

    std::fs::remove_file(path).ok();
}

#[tokio::test]
async fn stop_is_idempotent_and_cooperative() {
    let path = temp_pcap_path("empty");
    write_pcap(&path, &[]);

    let sniffer = Sniffer::new(CaptureMode::File, path.to_str().unwrap()).expect("sniffer opens");
    assert_eq!(sniffer.status(), Status::Stopped);

    sniffer.stop();
    sniffer.stop();

    // An empty capture ends immediately regardless of the stop signal
    // already being set.
    let reason = tokio::time::timeout(Duration::from_secs(10), sniffer.start())
        .await
        .expect("start returns")
        .expect("no capture error");
    assert!(matches!(
        reason,
        StopReason::Stopped | StopReason::EndOfStream
    ));
    assert!(!sniffer.active());

    std::fs::remove_file(path).ok();
}

#[tokio::test]
async fn second_start_is_rejected() {
    let path = temp_pcap_path("restart");
    write_pcap(&path, &[]);

    let sniffer = Sniffer::new(CaptureMode::File, path.to_str().unwrap()).expect("sniffer opens");
    sniffer.start().await.expect("first start runs");

    let err = sniffer.start().await.expect_err("second start fails");
    assert!(matches!(err, aetherscope::SnifferError::AlreadyStarted));

    std::fs::remove_file(path).ok();
}
