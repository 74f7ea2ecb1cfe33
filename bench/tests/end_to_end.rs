//! End-to-end tests: sender session → relay + simulator → receiver
//! session → jitter buffer → decode → score.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use netsim::{NetworkConditions, Relay, RelayConfig, SimulatorConfig};
use receiver::{JitterBuffer, JitterBufferConfig, QualityRating};
use sender::{BitrateConfig, Strategy};
use voip_bench::{run_trial, TrialConfig};
use voip_bench_common::{CodecKind, RtpPacket, RtpSession};

/// 50 packets of 160 bytes from ssrc 0x1234 starting at sequence 1000
/// come out of the jitter buffer as exactly 1000..1049, in order.
#[tokio::test]
async fn test_stream_through_clean_network_plays_in_order() {
    // ---
    let buffer = Arc::new(Mutex::new(JitterBuffer::new(JitterBufferConfig::default())));
    let mut rx = RtpSession::open("127.0.0.1", 0).await.expect("open failed");
    let sink = Arc::clone(&buffer);
    rx.start_receiving(Box::new(move |packet: RtpPacket, _src: SocketAddr| {
        assert_eq!(packet.ssrc, 0x1234);
        sink.lock().unwrap().add_packet(packet);
        Ok(())
    }))
    .expect("start failed");

    let conditions = NetworkConditions::default()
        .with_packet_loss(0.0)
        .with_jitter_ms(0.0);
    let mut relay = Relay::start(
        RelayConfig::loopback(rx.local_addr().port(), SimulatorConfig::new(conditions).with_seed(3)),
        None,
    )
    .await
    .expect("relay start failed");

    let mut tx = RtpSession::open("127.0.0.1", 0)
        .await
        .expect("open failed")
        .with_ssrc(0x1234);
    tx.set_sequence(1000);
    tx.set_remote("127.0.0.1", relay.local_addr().port())
        .await
        .expect("remote failed");

    for i in 0..50u8 {
        tx.send(&[i; 160], 0, i == 0).await.expect("send failed");
        tx.advance_timestamp(160);
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    assert!(relay.wait_idle(Duration::from_secs(2)).await);
    for _ in 0..100 {
        if buffer.lock().unwrap().stats().packets_added >= 50 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    rx.close().await;
    relay.stop().await;
    tx.close().await;

    let mut buffer = buffer.lock().unwrap();
    let played: Vec<u16> = std::iter::from_fn(|| buffer.get_next_packet())
        .map(|p| {
            assert_eq!(p.payload.len(), 160);
            p.sequence
        })
        .collect();

    assert_eq!(played, (1000..1050).collect::<Vec<u16>>());
    assert_eq!(buffer.stats().packets_dropped, 0);
    println!("✓ 50 packets played in order through the relay");
}

#[tokio::test]
async fn test_trial_on_perfect_network_scores_high() {
    // ---
    let report = run_trial(TrialConfig {
        codec: CodecKind::L16,
        duration: Duration::from_secs(1),
        seed: Some(1),
        ..TrialConfig::default()
    })
    .await
    .expect("trial failed");

    assert_eq!(report.packets_sent, 50);
    assert_eq!(report.packets_received, 50);
    assert_eq!(report.packet_loss, 0.0);
    assert_eq!(report.frames_decoded, 50);
    assert_eq!(report.frames_concealed, 0);
    assert_eq!(report.simulator.packets_dropped, 0);
    assert!(report.quality.mos > 4.0, "MOS too low: {}", report.quality.mos);
    assert!(report.quality.rating >= QualityRating::Good);
    // L16 is lossless, so a clean network returns the input bit for bit
    assert_eq!(report.psnr, Some(f64::INFINITY));
    println!("✓ {}", report.summary_line());
}

#[tokio::test]
async fn test_total_loss_is_a_valid_outcome() {
    // ---
    let report = run_trial(TrialConfig {
        conditions: NetworkConditions::default().with_packet_loss(1.0),
        codec: CodecKind::L16,
        duration: Duration::from_millis(400),
        seed: Some(2),
        ..TrialConfig::default()
    })
    .await
    .expect("zero delivery must not be an error");

    assert!(report.is_empty());
    assert_eq!(report.packets_sent, 20);
    assert_eq!(report.packet_loss, 1.0);
    assert_eq!(report.simulator.packets_dropped, 20);
    assert!(report.quality.mos < 2.0);
    assert_eq!(report.psnr, None);
    println!("✓ Total loss reported, MOS {:.2}", report.quality.mos);
}

#[tokio::test]
async fn test_unbindable_address_fails_the_trial() {
    // ---
    let result = run_trial(TrialConfig {
        codec: CodecKind::L16,
        duration: Duration::from_millis(100),
        // TEST-NET-3, never assigned to a local interface
        bind_addr: "203.0.113.1".into(),
        ..TrialConfig::default()
    })
    .await;

    assert!(result.is_err());
    println!("✓ Setup failure surfaced as an error");
}

#[tokio::test]
async fn test_lossy_trial_adapts_bitrate_and_records_audio() {
    // ---
    let path = std::env::temp_dir().join(format!("voip-bench-e2e-{}.wav", std::process::id()));
    let report = run_trial(TrialConfig {
        conditions: NetworkConditions::default()
            .with_packet_loss(0.2)
            .with_latency_ms(10.0)
            .with_jitter_ms(2.0),
        seed: Some(42),
        codec: CodecKind::Opus,
        strategy: Some(Strategy::Conservative),
        bitrate: BitrateConfig {
            stability_period: Duration::ZERO,
            ..BitrateConfig::default()
        },
        feedback_interval: Duration::from_millis(100),
        duration: Duration::from_secs(2),
        output: Some(path.clone()),
        ..TrialConfig::default()
    })
    .await
    .expect("trial failed");

    assert_eq!(report.packets_sent, 100);
    assert!(
        (0.05..0.40).contains(&report.packet_loss),
        "unexpected loss: {}",
        report.packet_loss
    );
    assert!(report.latency.mean >= 8.0, "latency {}", report.latency.mean);

    let bitrate = report.bitrate.as_ref().expect("controller stats missing");
    assert!(bitrate.adjustments_down >= 1);
    assert!(bitrate.current_bitrate < 24_000);

    let reader = hound::WavReader::open(&path).expect("decoded audio missing");
    assert!(reader.duration() > 0);
    std::fs::remove_file(&path).ok();
    println!("✓ {}", report.summary_line());
}
