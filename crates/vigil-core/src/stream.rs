//! JPEG encoding and the live multipart stream.
//!
//! The encoder keeps exactly one slot: publishing a frame replaces whatever a
//! slow viewer has not yet picked up. Each viewer gets its own lazy stream over
//! that slot, so no viewer can hold back capture or another viewer.

use bytes::{BufMut, Bytes, BytesMut};
use futures::Stream;
use image::codecs::jpeg::JpegEncoder;
use image::RgbImage;
use thiserror::Error;
use tokio::sync::watch;

pub const BOUNDARY: &str = "frame";
pub const CONTENT_TYPE: &str = "multipart/x-mixed-replace; boundary=frame";
pub const DEFAULT_JPEG_QUALITY: u8 = 80;

const PART_HEADER: &[u8] = b"--frame\r\nContent-Type: image/jpeg\r\n\r\n";

#[derive(Error, Debug)]
pub enum EncodeError {
    #[error("JPEG encode failed: {0}")]
    Jpeg(#[from] image::ImageError),
}

pub fn encode_jpeg(image: &RgbImage, quality: u8) -> Result<Vec<u8>, EncodeError> {
    let mut buffer = Vec::new();
    JpegEncoder::new_with_quality(&mut buffer, quality.clamp(1, 100)).encode_image(image)?;
    Ok(buffer)
}

/// Wrap one JPEG as a `multipart/x-mixed-replace` part.
pub fn multipart_part(jpeg: &[u8]) -> Bytes {
    let mut part = BytesMut::with_capacity(PART_HEADER.len() + jpeg.len() + 2);
    part.put_slice(PART_HEADER);
    part.put_slice(jpeg);
    part.put_slice(b"\r\n");
    part.freeze()
}

pub struct FrameEncoder {
    quality: u8,
    tx: watch::Sender<Option<Bytes>>,
}

impl FrameEncoder {
    pub fn new(quality: u8) -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { quality, tx }
    }

    /// Encode `image` and make it the current frame for every viewer.
    /// Returns the encoded JPEG size.
    pub fn publish(&self, image: &RgbImage) -> Result<usize, EncodeError> {
        let jpeg = encode_jpeg(image, self.quality)?;
        let len = jpeg.len();
        self.tx.send_replace(Some(multipart_part(&jpeg)));
        Ok(len)
    }

    pub fn feed(&self) -> FrameFeed {
        FrameFeed {
            rx: self.tx.subscribe(),
        }
    }

    pub fn viewers(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for FrameEncoder {
    fn default() -> Self {
        Self::new(DEFAULT_JPEG_QUALITY)
    }
}

/// Handle viewers subscribe through. Cheap to clone.
#[derive(Clone)]
pub struct FrameFeed {
    rx: watch::Receiver<Option<Bytes>>,
}

impl FrameFeed {
    /// Multipart parts for one viewer, starting with the current frame if
    /// there is one. Ends once the encoder is dropped.
    pub fn stream(&self) -> impl Stream<Item = Bytes> + Send + 'static {
        let mut rx = self.rx.clone();
        rx.mark_changed();
        futures::stream::unfold(rx, |mut rx| async move {
            loop {
                rx.changed().await.ok()?;
                let latest = rx.borrow_and_update().clone();
                if let Some(part) = latest {
                    return Some((part, rx));
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use image::Rgb;
    use std::time::Duration;

    fn solid(value: u8) -> RgbImage {
        RgbImage::from_pixel(32, 24, Rgb([value, value, value]))
    }

    fn expected(image: &RgbImage) -> Bytes {
        multipart_part(&encode_jpeg(image, DEFAULT_JPEG_QUALITY).unwrap())
    }

    #[test]
    fn test_part_format() {
        let jpeg = encode_jpeg(&solid(128), 80).unwrap();
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);

        let part = multipart_part(&jpeg);
        assert!(part.starts_with(b"--frame\r\nContent-Type: image/jpeg\r\n\r\n\xFF\xD8"));
        assert!(part.ends_with(b"\r\n"));
        assert_eq!(part.len(), PART_HEADER.len() + jpeg.len() + 2);
    }

    #[tokio::test]
    async fn test_slow_viewer_gets_only_latest_frame() {
        let encoder = FrameEncoder::default();
        let mut stream = Box::pin(encoder.feed().stream());

        for value in [10, 120, 250] {
            encoder.publish(&solid(value)).unwrap();
        }

        assert_eq!(stream.next().await.unwrap(), expected(&solid(250)));
        let pending = tokio::time::timeout(Duration::from_millis(50), stream.next()).await;
        assert!(pending.is_err(), "stale frames must not be queued");
    }

    #[tokio::test]
    async fn test_late_viewer_starts_with_current_frame() {
        let encoder = FrameEncoder::default();
        encoder.publish(&solid(60)).unwrap();

        let mut stream = Box::pin(encoder.feed().stream());
        assert_eq!(stream.next().await.unwrap(), expected(&solid(60)));
    }

    #[tokio::test]
    async fn test_stream_ends_when_encoder_dropped() {
        let encoder = FrameEncoder::default();
        let feed = encoder.feed();
        let mut stream = Box::pin(feed.stream());
        assert_eq!(encoder.viewers(), 2);

        encoder.publish(&solid(90)).unwrap();
        drop(encoder);

        assert!(stream.next().await.is_some());
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_viewers_are_independent() {
        let encoder = FrameEncoder::default();
        let mut fast = Box::pin(encoder.feed().stream());
        let mut slow = Box::pin(encoder.feed().stream());

        encoder.publish(&solid(1)).unwrap();
        assert_eq!(fast.next().await.unwrap(), expected(&solid(1)));
        encoder.publish(&solid(2)).unwrap();
        assert_eq!(fast.next().await.unwrap(), expected(&solid(2)));

        assert_eq!(slow.next().await.unwrap(), expected(&solid(2)));
    }
}
