//! Integration tests for the receive path: UDP session → jitter buffer →
//! decode → statistics → quality score.

use std::time::Duration;

use receiver::{receive_until, score, Playout, PlayoutConfig, QualityRating, WavSink};
use voip_bench_common::{AudioCodec, OpusCodec, RtpSession};

/// 20ms of a 440Hz tone at 16kHz.
fn tone_frame(frame: usize) -> Vec<i16> {
    // ---
    (0..320)
        .map(|i| {
            let t = (frame * 320 + i) as f32 / 16000.0;
            ((t * 2.0 * std::f32::consts::PI * 440.0).sin() * 10000.0) as i16
        })
        .collect()
}

/// Sends `frames` Opus frames over loopback, skipping the indices in `skip`.
async fn send_frames(port: u16, frames: usize, skip: &[usize]) -> u32 {
    // ---
    let mut encoder = OpusCodec::new().expect("encoder creation failed");
    let mut sender = RtpSession::open("127.0.0.1", 0).await.expect("open failed");
    sender.set_remote("127.0.0.1", port).await.expect("remote failed");

    for i in 0..frames {
        let payload = encoder.encode(&tone_frame(i)).expect("encode failed");
        if skip.contains(&i) {
            // Burn the sequence number without sending
            sender.set_sequence(sender.sequence().wrapping_add(1));
        } else {
            sender
                .send(&payload, encoder.payload_type(), i == 0)
                .await
                .expect("send failed");
        }
        sender.advance_timestamp(320);
        tokio::time::sleep(Duration::from_millis(2)).await;
    }

    sender.close().await;
    encoder.bitrate()
}

#[tokio::test]
async fn test_opus_loopback_scores_excellent() {
    // ---
    let decoder = OpusCodec::new().expect("decoder creation failed");
    let playout = Playout::new(PlayoutConfig::default(), Box::new(decoder));
    let mut session = RtpSession::open("127.0.0.1", 0).await.expect("open failed");
    let port = session.local_addr().port();

    let sending = tokio::spawn(send_frames(port, 25, &[]));
    let report = receive_until(&mut session, &playout, async {
        tokio::time::sleep(Duration::from_millis(500)).await;
    })
    .await
    .expect("receive failed");
    let bitrate = sending.await.expect("sender panicked");
    session.close().await;

    assert_eq!(report.network.packets_received, 25);
    assert_eq!(report.frames_decoded, 25);
    assert_eq!(report.frames_concealed, 0);
    assert_eq!(report.samples_played, 25 * 320);

    let quality = score(&report, 20.0, bitrate);
    assert!(quality.mos > 4.0, "MOS too low: {}", quality.mos);
    assert!(quality.rating >= QualityRating::Good);
    println!("✓ Loopback MOS {:.2} ({})", quality.mos, quality.rating);
}

#[tokio::test]
async fn test_missing_packets_are_concealed_and_recorded() {
    // ---
    let path = std::env::temp_dir().join(format!("receive-pipeline-{}.wav", std::process::id()));
    let decoder = OpusCodec::new().expect("decoder creation failed");
    let playout = Playout::new(PlayoutConfig::default(), Box::new(decoder))
        .with_sink(WavSink::create(&path, 16000).expect("sink failed"));
    let mut session = RtpSession::open("127.0.0.1", 0).await.expect("open failed");
    let port = session.local_addr().port();

    let sending = tokio::spawn(send_frames(port, 20, &[5, 6, 12]));
    let report = receive_until(&mut session, &playout, async {
        tokio::time::sleep(Duration::from_millis(500)).await;
    })
    .await
    .expect("receive failed");
    sending.await.expect("sender panicked");
    session.close().await;

    assert_eq!(report.network.packets_received, 17);
    assert_eq!(report.network.packets_lost, 3);
    assert_eq!(report.frames_decoded, 17);
    assert_eq!(report.frames_concealed, 3);

    let reader = hound::WavReader::open(&path).expect("open failed");
    assert_eq!(reader.duration(), 20 * 320);
    std::fs::remove_file(&path).ok();
    println!("✓ 3 lost packets concealed, 20 frames written");
}
