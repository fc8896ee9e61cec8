use futures::{StreamExt, stream};
use image::{Rgb, RgbImage};
use myko_vision::core_modules::codec::codec;
use myko_vision::{BackendChoice, EngineConfig, Session, latest_frame_slot, run_stream};
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

fn session() -> Arc<Session> {
    let config = EngineConfig {
        worker_threads: 2,
        ..EngineConfig::default()
    };
    Arc::new(Session::new(config).unwrap())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn slow_consumer_sees_a_subset_ending_on_the_newest_frame() {
    let (tx, mut rx) = latest_frame_slot();
    let producer = tokio::spawn(async move {
        for i in 0..100 {
            tx.publish(format!("frame-{i}"));
            tokio::task::yield_now().await;
        }
    });

    let mut seen = Vec::new();
    while let Some(frame) = rx.next_frame().await {
        seen.push(frame.to_string());
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    producer.await.unwrap();

    assert!(!seen.is_empty());
    assert!(seen.len() < 100, "consumer saw every frame");
    assert_eq!(seen.last().map(String::as_str), Some("frame-99"));
    let mut numbers: Vec<u32> = seen
        .iter()
        .map(|f| f.trim_start_matches("frame-").parse().unwrap())
        .collect();
    let before = numbers.clone();
    numbers.dedup();
    assert_eq!(numbers, before, "a frame was delivered twice");
    assert!(numbers.windows(2).all(|w| w[0] < w[1]));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stream_without_masks_passes_frames_through() {
    let session = session();
    let frames: Vec<String> = (0..100).map(|i| format!("frame-{i}")).collect();
    let mut emitted = Vec::new();

    let stats = run_stream(Arc::clone(&session), stream::iter(frames), |out: String| {
        emitted.push(out);
        async {
            tokio::time::sleep(Duration::from_millis(2)).await;
            Ok::<(), Infallible>(())
        }
    })
    .await;

    assert_eq!(stats.failed, 0);
    assert_eq!(stats.processed as usize, emitted.len());
    assert!(stats.processed < 100);
    assert_eq!(emitted.last().map(String::as_str), Some("frame-99"));
    // None of these payloads is an image.
    assert_eq!(session.latest_frame(), None);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn closed_sink_stops_processing() {
    let session = session();
    let (tx, rx) = latest_frame_slot();
    tx.publish("only");

    let processor = myko_vision::FrameProcessor::new(session);
    let stats = processor
        .run(rx, |_out: String| async { Err::<(), _>("socket closed") })
        .await;
    assert_eq!(stats.processed, 1);
    drop(tx);
}

fn square_frame(size: u32, x0: u32, side: u32) -> RgbImage {
    RgbImage::from_fn(size, size, |x, y| {
        if (x0..x0 + side).contains(&x) && (x0..x0 + side).contains(&y) {
            Rgb([255, 255, 255])
        } else {
            Rgb([0, 0, 0])
        }
    })
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn streamed_frames_recalibrate_the_active_set() {
    let config = EngineConfig {
        fast_timeout_ms: 120_000,
        worker_threads: 2,
        recalibration_interval: 3,
        ..EngineConfig::default()
    };
    let session = Arc::new(Session::new(config).unwrap());
    let first = codec::encode_png(&square_frame(1000, 50, 100)).unwrap();
    session.propose("cells", Some(&first), BackendChoice::Fast).await.unwrap();
    let summary = session.select(&[0], Some("cells")).unwrap();

    // The stage drifted 30 px. Each frame is released only after the previous
    // one was emitted, so every frame gets processed.
    let drifted = codec::encode_png(&square_frame(1000, 80, 100)).unwrap();
    let (ack_tx, ack_rx) = mpsc::unbounded_channel::<()>();
    let frames = stream::unfold((0u32, ack_rx), move |(sent, mut acks)| {
        let frame = drifted.clone();
        async move {
            if sent == 12 {
                return None;
            }
            if sent > 0 && acks.recv().await.is_none() {
                return None;
            }
            Some((frame, (sent + 1, acks)))
        }
    })
    .boxed();

    let stats = run_stream(Arc::clone(&session), frames, move |_out: String| {
        let _ = ack_tx.send(());
        async { Ok::<(), Infallible>(()) }
    })
    .await;
    assert_eq!(stats.processed, 12);
    assert_eq!(stats.failed, 0);

    let followed = tokio::time::timeout(Duration::from_secs(120), async {
        loop {
            let x = session.active_sets()[0].source_contours[0].bounding_box().map(|b| b.x);
            if x == Some(80) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await;
    assert!(followed.is_ok(), "active set never followed the drift");
    let set = &session.active_sets()[0];
    assert_eq!(set.id, summary.set_id);
    assert_eq!(set.len(), 1);
}
