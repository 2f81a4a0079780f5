use image::codecs::jpeg::JpegEncoder;
use image::DynamicImage;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, warn};

use crate::registry::SessionRegistry;

/// Per-session ingest queue capacity. Freshness beats completeness for a
/// live feed, so overflow evicts the oldest entry, never the newest.
pub const FRAME_QUEUE_CAPACITY: usize = 10;

/// Re-encode quality for frames pushed to viewers.
pub const STREAM_JPEG_QUALITY: u8 = 85;

/// Pause between decode passes so the pipeline shares the runtime instead
/// of busy-spinning.
const DECODE_PASS_PAUSE: Duration = Duration::from_millis(10);

/// Bounded FIFO of raw compressed frame payloads for one session.
pub struct FrameQueue {
    entries: Mutex<VecDeque<Vec<u8>>>,
}

impl FrameQueue {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(VecDeque::with_capacity(FRAME_QUEUE_CAPACITY)),
        }
    }

    /// Enqueue a payload, evicting the oldest entry when full. Returns true
    /// if an entry was dropped to make room.
    pub fn push(&self, payload: Vec<u8>) -> bool {
        let mut entries = self.entries.lock().expect("frame queue poisoned");
        let dropped = entries.len() >= FRAME_QUEUE_CAPACITY;
        if dropped {
            entries.pop_front();
        }
        entries.push_back(payload);
        dropped
    }

    pub fn pop(&self) -> Option<Vec<u8>> {
        self.entries.lock().expect("frame queue poisoned").pop_front()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("frame queue poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for FrameQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// One pass over every session queue: dequeue at most one payload each,
/// decode it, and publish successful decodes to the session's cache slot.
/// Decode failures are dropped; the next frame supersedes them.
///
/// Returns the number of frames decoded, which the tests use to drive the
/// pipeline deterministically.
pub fn drain_pass(registry: &SessionRegistry) -> usize {
    let mut decoded = 0;
    for session_id in registry.queued_sessions() {
        let Some(payload) = registry.pop_frame(&session_id) else {
            continue;
        };
        match image::load_from_memory(&payload) {
            Ok(image) => {
                registry.store_decoded(&session_id, image);
                decoded += 1;
            }
            Err(err) => {
                warn!(session = %session_id, %err, "discarding undecodable frame");
            }
        }
    }
    decoded
}

/// Background decode loop. Runs until process shutdown; decode failures are
/// never fatal to the pipeline or to any session.
pub async fn run_decode_pipeline(registry: Arc<SessionRegistry>) {
    debug!("frame decode pipeline started");
    loop {
        drain_pass(&registry);
        tokio::time::sleep(DECODE_PASS_PAUSE).await;
    }
}

/// Encode a decoded frame as JPEG at the fixed stream quality.
pub fn encode_jpeg(image: &DynamicImage) -> Result<Vec<u8>, image::ImageError> {
    let rgb = image.to_rgb8();
    let mut buf = Vec::new();
    JpegEncoder::new_with_quality(&mut buf, STREAM_JPEG_QUALITY).encode_image(&rgb)?;
    Ok(buf)
}

/// Test helper: a solid-color PNG payload of fixed dimensions.
#[cfg(test)]
pub(crate) fn solid_png(r: u8, g: u8, b: u8) -> Vec<u8> {
    use image::{Rgb, RgbImage};
    use std::io::Cursor;

    let img = RgbImage::from_pixel(32, 24, Rgb([r, g, b]));
    let mut buf = Vec::new();
    DynamicImage::ImageRgb8(img)
        .write_to(&mut Cursor::new(&mut buf), image::ImageOutputFormat::Png)
        .unwrap();
    buf
}
