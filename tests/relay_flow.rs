//! End-to-end relay flow over the in-process registry: an agent connects,
//! streams frames, a viewer samples the decoded feed and sends input, and
//! the control plane stops the session.

use std::io::Cursor;
use std::sync::Arc;

use image::{DynamicImage, Rgb, RgbImage};
use tokio::sync::mpsc;

use viewlink::frames::{self, FRAME_QUEUE_CAPACITY};
use viewlink::protocol::{AgentCommand, InputEvent};
use viewlink::registry::{SessionRegistry, StopOutcome};
use viewlink::storage::{DirectoryRecord, DirectoryStore, SessionStatus};

fn solid_jpeg(r: u8, g: u8, b: u8) -> Vec<u8> {
    let img = RgbImage::from_pixel(64, 48, Rgb([r, g, b]));
    let mut buf = Vec::new();
    DynamicImage::ImageRgb8(img)
        .write_to(&mut Cursor::new(&mut buf), image::ImageOutputFormat::Jpeg(90))
        .unwrap();
    buf
}

fn close_enough(pixel: &Rgb<u8>, expected: [u8; 3]) -> bool {
    pixel
        .0
        .iter()
        .zip(expected.iter())
        .all(|(a, b)| a.abs_diff(*b) <= 8)
}

#[tokio::test]
async fn agent_to_viewer_round_trip() {
    let store = DirectoryStore::memory();
    store
        .register(DirectoryRecord::new(
            "S1".to_string(),
            Some("10.0.0.5".to_string()),
        ))
        .await
        .unwrap();
    let registry = Arc::new(SessionRegistry::new(store.clone()));

    // Agent connects with id S1 and submits three frames.
    let (tx, mut agent_rx) = mpsc::unbounded_channel();
    let conn_id = registry.connect("S1", tx);
    registry.submit_frame("S1", solid_jpeg(250, 10, 10));
    registry.submit_frame("S1", solid_jpeg(10, 250, 10));
    registry.submit_frame("S1", solid_jpeg(10, 10, 250));

    // The decode pipeline drains one entry per pass.
    for _ in 0..3 {
        assert_eq!(frames::drain_pass(&registry), 1);
    }

    // A viewer binding to S1 samples the latest decoded image and gets a
    // non-empty encoding of the third frame's content.
    let latest = registry.latest_frame("S1").expect("decoded frame cached");
    let encoded = frames::encode_jpeg(&latest).unwrap();
    assert!(!encoded.is_empty());
    let round_tripped = image::load_from_memory(&encoded).unwrap();
    assert_eq!(round_tripped.width(), 64);
    assert_eq!(round_tripped.height(), 48);
    assert!(close_enough(
        round_tripped.to_rgb8().get_pixel(32, 24),
        [10, 10, 250]
    ));

    // Viewer input is forwarded to exactly this session's agent.
    let raw = r#"{"type":"mouse_click","x":0.5,"y":0.5,"button":"left","pressed":true}"#;
    let event: InputEvent = serde_json::from_str(raw).unwrap();
    assert!(registry.forward_input("S1", event.clone()));
    match agent_rx.recv().await {
        Some(AgentCommand::Input { event: received }) => assert_eq!(received, event),
        other => panic!("expected forwarded input, got {:?}", other),
    }

    // Control plane stops the session; the agent's eventual close is then
    // classified as expected.
    assert_eq!(registry.request_stop("S1").await, StopOutcome::SignalSent);
    assert!(matches!(
        agent_rx.recv().await,
        Some(AgentCommand::Stop { reason }) if reason == "stop_requested"
    ));
    registry.disconnect(conn_id).await;

    let record = store.find("S1").await.unwrap().unwrap();
    assert_eq!(record.status, SessionStatus::Stopped);
    assert!(!record.connection);
    assert_eq!(registry.health().tracked, 0);
}

#[tokio::test]
async fn ingest_backpressure_keeps_only_the_freshest_frames() {
    let registry = SessionRegistry::new(DirectoryStore::memory());

    // Fifteen sequentially-tagged frames; the shade encodes the sequence.
    for i in 0u8..15 {
        registry.submit_frame("S1", solid_jpeg(i * 16, 0, 0));
    }
    assert_eq!(registry.queued_frames("S1"), FRAME_QUEUE_CAPACITY);

    // Drain fully; the first decode must already be frame 5, the oldest
    // five having been evicted at ingest.
    assert_eq!(frames::drain_pass(&registry), 1);
    let first_kept = registry.latest_frame("S1").unwrap();
    assert!(close_enough(
        first_kept.to_rgb8().get_pixel(0, 0),
        [5 * 16, 0, 0]
    ));

    let mut passes = 1;
    while frames::drain_pass(&registry) > 0 {
        passes += 1;
    }
    assert_eq!(passes, FRAME_QUEUE_CAPACITY);
    let last = registry.latest_frame("S1").unwrap();
    assert!(close_enough(last.to_rgb8().get_pixel(0, 0), [14 * 16, 0, 0]));
}

#[tokio::test]
async fn sessions_are_independent() {
    let store = DirectoryStore::memory();
    store
        .register(DirectoryRecord::new("A".to_string(), None))
        .await
        .unwrap();
    store
        .register(DirectoryRecord::new("B".to_string(), None))
        .await
        .unwrap();
    let registry = SessionRegistry::new(store.clone());

    let (tx_a, _rx_a) = mpsc::unbounded_channel();
    let (tx_b, mut rx_b) = mpsc::unbounded_channel();
    let conn_a = registry.connect("A", tx_a);
    registry.connect("B", tx_b);

    registry.submit_frame("A", solid_jpeg(1, 2, 3));
    registry.submit_frame("B", solid_jpeg(4, 5, 6));
    assert_eq!(frames::drain_pass(&registry), 2);

    // Dropping A reconciles only A.
    registry.disconnect(conn_a).await;
    assert!(!registry.is_connected("A"));
    assert!(registry.is_connected("B"));
    assert!(registry.latest_frame("A").is_none());
    assert!(registry.latest_frame("B").is_some());
    assert_eq!(
        store.find("A").await.unwrap().unwrap().status,
        SessionStatus::Disconnected
    );

    // B is still fully functional.
    assert!(registry.forward_input(
        "B",
        InputEvent::MouseMove { x: 0.25, y: 0.75 }
    ));
    assert!(matches!(
        rx_b.recv().await,
        Some(AgentCommand::Input {
            event: InputEvent::MouseMove { .. }
        })
    ));
}
