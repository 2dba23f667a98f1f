//! Integration tests driving real loopback UDP sockets end to end.

use std::time::Duration;

use bytes::Bytes;
use pulsepath_core::{Channel, Delivery, Header, Receiver, Sender, TransportConfig};
use tokio::net::UdpSocket;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

async fn free_local_addr() -> std::net::SocketAddr {
    let probe = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    probe.local_addr().unwrap()
    // `probe` drops here, freeing the port for the real bind that follows.
    // Small window for port reuse races; acceptable for a loopback test.
}

fn fast_cfg() -> TransportConfig {
    TransportConfig {
        window_size: 8,
        retransmission_timeout: Duration::from_millis(20),
        max_retransmission_count: 3,
        skip_timeout: Duration::from_millis(40),
        drain_timeout: Duration::from_secs(2),
    }
}

#[tokio::test]
async fn happy_path_reliable_and_unreliable_round_trip() {
    init_tracing();
    let sender_addr = free_local_addr().await;
    let receiver_addr = free_local_addr().await;
    let cfg = fast_cfg();

    let (receiver, mut deliveries) = Receiver::listen(sender_addr, receiver_addr, cfg)
        .await
        .unwrap();
    let sender = Sender::connect(receiver_addr, sender_addr, cfg).await.unwrap();

    sender.send(Bytes::from_static(b"r0"), true).await.unwrap();
    sender.send(Bytes::from_static(b"u0"), false).await.unwrap();
    sender.send(Bytes::from_static(b"r1"), true).await.unwrap();
    sender.send(Bytes::from_static(b"r2"), true).await.unwrap();

    let mut reliable_payloads = Vec::new();
    let mut unreliable_payloads = Vec::new();
    while reliable_payloads.len() < 3 || unreliable_payloads.len() < 1 {
        match tokio::time::timeout(Duration::from_secs(1), deliveries.recv())
            .await
            .expect("delivery before timeout")
            .expect("channel open")
        {
            Delivery::Reliable(p) => reliable_payloads.push(p.payload),
            Delivery::Unreliable(p) => unreliable_payloads.push(p.payload),
        }
    }

    assert_eq!(
        reliable_payloads,
        vec![
            Bytes::from_static(b"r0"),
            Bytes::from_static(b"r1"),
            Bytes::from_static(b"r2"),
        ]
    );
    assert_eq!(unreliable_payloads, vec![Bytes::from_static(b"u0")]);

    let sender_metrics = sender.close(Duration::from_secs(1)).await.unwrap();
    assert_eq!(sender_metrics.reliable.sent_packets, 3);
    assert_eq!(sender_metrics.unreliable.sent_packets, 1);
    assert_eq!(sender_metrics.retransmissions, 0);

    let receiver_metrics = receiver.stop(Duration::from_secs(1)).await.unwrap();
    assert_eq!(receiver_metrics.reliable.received_packets, 3);
    assert_eq!(receiver_metrics.unreliable.received_packets, 1);
    assert_eq!(receiver_metrics.skipped_packets, 0);
}

#[tokio::test]
async fn reliable_send_retransmits_until_a_late_ack_arrives() {
    init_tracing();
    let sender_addr = free_local_addr().await;
    let fake_receiver_addr = free_local_addr().await;
    let cfg = fast_cfg();

    let fake_receiver = UdpSocket::bind(fake_receiver_addr).await.unwrap();
    let sender = Sender::connect(fake_receiver_addr, sender_addr, cfg)
        .await
        .unwrap();

    sender.send(Bytes::from_static(b"payload"), true).await.unwrap();

    // Drop the original send; only ack the first retransmission.
    let mut buf = [0u8; 64];
    loop {
        let (n, src) = fake_receiver.recv_from(&mut buf).await.unwrap();
        let (hdr, _) = Header::unpack(&buf[..n]).unwrap();
        assert_eq!(hdr.channel, Channel::Reliable);
        if hdr.retrans_count >= 1 {
            let ack = Header::pack(Channel::Ack, hdr.seq, 0, &[]);
            fake_receiver.send_to(&ack, src).await.unwrap();
            break;
        }
    }

    let metrics = sender.close(Duration::from_secs(2)).await.unwrap();
    assert!(metrics.retransmissions >= 1);
    assert_eq!(metrics.reliable.sent_packets, 1);
}

#[tokio::test]
async fn skip_timer_releases_buffered_tail_after_a_permanent_gap() {
    init_tracing();
    let fake_sender_addr = free_local_addr().await;
    let receiver_addr = free_local_addr().await;
    let cfg = fast_cfg();

    let (receiver, mut deliveries) = Receiver::listen(fake_sender_addr, receiver_addr, cfg)
        .await
        .unwrap();
    let fake_sender = UdpSocket::bind(fake_sender_addr).await.unwrap();

    // seq 0 is never sent; seq 1 and 2 arrive and must wait behind the hole.
    let pkt1 = Header::pack(Channel::Reliable, 1, 0, b"b");
    let pkt2 = Header::pack(Channel::Reliable, 2, 0, b"c");
    fake_sender.send_to(&pkt1, receiver_addr).await.unwrap();
    fake_sender.send_to(&pkt2, receiver_addr).await.unwrap();

    let mut delivered = Vec::new();
    for _ in 0..2 {
        match tokio::time::timeout(Duration::from_secs(1), deliveries.recv())
            .await
            .expect("delivery before timeout")
            .expect("channel open")
        {
            Delivery::Reliable(p) => delivered.push(p.payload),
            Delivery::Unreliable(_) => panic!("no unreliable traffic in this test"),
        }
    }
    assert_eq!(delivered, vec![Bytes::from_static(b"b"), Bytes::from_static(b"c")]);

    // The receiver must ack seq 1 and 2 as they arrive, and also ack the
    // abandoned seq 0 once the skip timer fires, or the (nonexistent) sender
    // would keep retransmitting it for the full retry budget.
    let mut acked_seqs = Vec::new();
    let mut buf = [0u8; 64];
    for _ in 0..3 {
        let (n, _) = tokio::time::timeout(Duration::from_secs(1), fake_sender.recv_from(&mut buf))
            .await
            .expect("ack before timeout")
            .unwrap();
        let (hdr, _) = Header::unpack(&buf[..n]).unwrap();
        assert_eq!(hdr.channel, Channel::Ack);
        acked_seqs.push(hdr.seq);
    }
    acked_seqs.sort();
    assert_eq!(acked_seqs, vec![0, 1, 2]);

    let metrics = receiver.stop(Duration::from_secs(1)).await.unwrap();
    assert_eq!(metrics.skipped_packets, 1);
    assert_eq!(metrics.reliable.received_packets, 2);
}
