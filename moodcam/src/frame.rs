use base64::Engine;
use image::codecs::jpeg::JpegEncoder;
use image::{ImageError, RgbImage};
use log::warn;

use crate::surface::ReadyState;

/// JPEG quality used for frames sent to the analyzer.
pub const JPEG_QUALITY: u8 = 80;
const DATA_URL_PREFIX: &str = "data:image/jpeg;base64,";

/// Anything a still frame can be read back from.
pub trait FrameSource {
    fn ready_state(&self) -> ReadyState;

    /// Natural size of the current video, `(0, 0)` when unknown.
    fn dimensions(&self) -> (u32, u32);

    /// Paint the current visual content into `target`, scaled to its size.
    fn draw(&self, target: &mut RgbImage);
}

/// A single compressed still, as a self-contained JPEG data URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedFrame {
    data_url: String,
    width: u32,
    height: u32,
}

impl EncodedFrame {
    pub fn as_str(&self) -> &str {
        &self.data_url
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// Base64 payload without the `data:` header.
    #[cfg(test)]
    fn payload(&self) -> &str {
        &self.data_url[DATA_URL_PREFIX.len()..]
    }
}

/// Snapshots a [`FrameSource`] into a reusable buffer and encodes it.
pub struct FrameExtractor {
    buffer: RgbImage,
    quality: u8,
}

impl FrameExtractor {
    pub fn new() -> Self {
        Self::with_quality(JPEG_QUALITY)
    }

    pub fn with_quality(quality: u8) -> Self {
        Self {
            buffer: RgbImage::new(0, 0),
            quality: quality.clamp(1, 100),
        }
    }

    /// Returns `None` while the source is not readable yet; that is expected during startup.
    pub fn extract<S>(&mut self, source: &S) -> Option<EncodedFrame>
    where
        S: FrameSource + ?Sized,
    {
        if source.ready_state() < ReadyState::HaveCurrentData {
            return None;
        }
        let (width, height) = source.dimensions();
        if width == 0 || height == 0 {
            return None;
        }

        if self.buffer.dimensions() != (width, height) {
            self.buffer = RgbImage::new(width, height);
        }
        source.draw(&mut self.buffer);

        match encode_jpeg(&self.buffer, self.quality) {
            Ok(bytes) => {
                let mut data_url = String::with_capacity(DATA_URL_PREFIX.len() + bytes.len() * 4 / 3 + 4);
                data_url.push_str(DATA_URL_PREFIX);
                base64::engine::general_purpose::STANDARD.encode_string(&bytes, &mut data_url);
                Some(EncodedFrame {
                    data_url,
                    width,
                    height,
                })
            }
            Err(err) => {
                warn!("Failed to encode {width}x{height} frame: {err}");
                None
            }
        }
    }

    #[cfg(test)]
    fn buffer_dimensions(&self) -> (u32, u32) {
        self.buffer.dimensions()
    }
}

impl Default for FrameExtractor {
    fn default() -> Self {
        Self::new()
    }
}

fn encode_jpeg(image: &RgbImage, quality: u8) -> Result<Vec<u8>, ImageError> {
    let mut buffer = Vec::new();
    {
        let mut encoder = JpegEncoder::new_with_quality(&mut buffer, quality);
        encoder.encode_image(image)?;
    }
    Ok(buffer)
}
