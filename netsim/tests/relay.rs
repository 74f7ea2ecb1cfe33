//! Integration tests for the UDP relay: real sockets on loopback with the
//! simulator in between.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use netsim::{NetworkConditions, Relay, RelayConfig, SimulatorConfig};
use voip_bench_common::{RtpPacket, RtpSession};

async fn collecting_receiver() -> (RtpSession, Arc<Mutex<Vec<RtpPacket>>>) {
    // ---
    let mut rx = RtpSession::open("127.0.0.1", 0).await.expect("open failed");
    let received = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&received);
    rx.start_receiving(Box::new(move |packet: RtpPacket, _src: SocketAddr| {
        sink.lock().unwrap().push(packet);
        Ok(())
    }))
    .expect("start failed");
    (rx, received)
}

async fn wait_for(received: &Arc<Mutex<Vec<RtpPacket>>>, count: usize) {
    // ---
    for _ in 0..200 {
        if received.lock().unwrap().len() >= count {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Tests a clean link: everything arrives, in order, unmodified.
#[tokio::test]
async fn test_relay_perfect_network() {
    // ---
    let (mut rx, received) = collecting_receiver().await;

    let conditions = NetworkConditions::default().with_latency_ms(5.0);
    let mut relay = Relay::start(
        RelayConfig::loopback(rx.local_addr().port(), SimulatorConfig::new(conditions).with_seed(1)),
        None,
    )
    .await
    .expect("relay start failed");

    let mut tx = RtpSession::open("127.0.0.1", 0)
        .await
        .expect("open failed")
        .with_ssrc(0xABCD);
    tx.set_sequence(500);
    tx.set_remote("127.0.0.1", relay.local_addr().port())
        .await
        .expect("remote failed");

    for i in 0..20u8 {
        tx.send(&[i; 160], 0, i == 0).await.expect("send failed");
        tx.advance_timestamp(160);
    }

    wait_for(&received, 20).await;
    assert!(relay.wait_idle(Duration::from_secs(1)).await);
    relay.stop().await;
    rx.close().await;

    let packets = received.lock().unwrap();
    let sequences: Vec<u16> = packets.iter().map(|p| p.sequence).collect();
    assert_eq!(sequences, (500..520).collect::<Vec<u16>>());
    assert!(packets[0].marker);
    assert!(packets.iter().all(|p| p.ssrc == 0xABCD && p.payload.len() == 160));

    let stats = relay.stats();
    assert_eq!(stats.simulator.packets_processed, 20);
    assert_eq!(stats.forwarded, 20);
    println!("✓ Relay forwards a clean stream unchanged");
}

/// Tests that total loss is an empty result, not an error.
#[tokio::test]
async fn test_relay_total_loss_delivers_nothing() {
    // ---
    let (mut rx, received) = collecting_receiver().await;

    let conditions = NetworkConditions::default().with_packet_loss(1.0);
    let mut relay = Relay::start(
        RelayConfig::loopback(rx.local_addr().port(), SimulatorConfig::new(conditions)),
        None,
    )
    .await
    .expect("relay start failed");

    let mut tx = RtpSession::open("127.0.0.1", 0).await.expect("open failed");
    tx.set_remote("127.0.0.1", relay.local_addr().port())
        .await
        .expect("remote failed");
    for _ in 0..10 {
        tx.send(&[0; 20], 0, false).await.expect("send failed");
    }

    for _ in 0..100 {
        if relay.stats().simulator.packets_processed == 10 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    relay.stop().await;
    rx.close().await;

    let stats = relay.stats();
    assert_eq!(stats.simulator.packets_dropped, 10);
    assert_eq!(stats.forwarded, 0);
    assert!(received.lock().unwrap().is_empty());
    println!("✓ Relay with 100% loss yields zero packets");
}

/// Tests that an unresolvable destination fails at setup.
#[tokio::test]
async fn test_relay_bad_destination_is_setup_error() {
    // ---
    let config = RelayConfig {
        destination_host: "no-such-host.invalid".into(),
        ..RelayConfig::loopback(9, SimulatorConfig::default())
    };

    assert!(Relay::start(config, None).await.is_err());
}
