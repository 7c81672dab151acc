use std::sync::Arc;
use std::time::Duration;

use image::{Rgb, RgbImage};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::{
    AcquireError, CameraDevice, CaptureConstraints, FacingMode, FramePublisher, MediaStream,
    MediaTrack,
};

const DEFAULT_FPS: u32 = 15;

/// Test-pattern camera for machines without capture hardware.
///
/// Frames are rendered on a local task at the requested resolution, so it must be
/// acquired from inside a `LocalSet`.
pub struct SyntheticCamera {
    fps: u32,
    deny: bool,
}

impl SyntheticCamera {
    pub fn new() -> Self {
        Self {
            fps: DEFAULT_FPS,
            deny: false,
        }
    }

    /// A camera whose permission prompt is always refused.
    #[cfg(test)]
    fn denied() -> Self {
        Self {
            fps: DEFAULT_FPS,
            deny: true,
        }
    }
}

impl Default for SyntheticCamera {
    fn default() -> Self {
        Self::new()
    }
}

impl CameraDevice for SyntheticCamera {
    fn name(&self) -> String {
        "synthetic test pattern".to_string()
    }

    async fn acquire(&self, constraints: CaptureConstraints) -> Result<MediaStream, AcquireError> {
        if self.deny {
            return Err(AcquireError::PermissionDenied);
        }
        if constraints.ideal_width == 0 || constraints.ideal_height == 0 {
            return Err(AcquireError::Backend(format!(
                "unsupported resolution {}x{}",
                constraints.ideal_width, constraints.ideal_height
            )));
        }

        let (publisher, feed) = watch::channel(None);
        let frame_interval = Duration::from_millis(1000 / u64::from(self.fps.max(1)));
        let task = tokio::task::spawn_local(render_loop(
            publisher,
            constraints.ideal_width,
            constraints.ideal_height,
            frame_interval,
        ));

        let label = match constraints.facing {
            FacingMode::User => "Synthetic front camera",
            FacingMode::Environment => "Synthetic rear camera",
        };
        let track = SyntheticTrack {
            label: label.to_string(),
            task: Some(task),
        };
        Ok(MediaStream::new(vec![Box::new(track)], feed))
    }
}

struct SyntheticTrack {
    label: String,
    task: Option<JoinHandle<()>>,
}

impl MediaTrack for SyntheticTrack {
    fn label(&self) -> &str {
        &self.label
    }

    fn is_live(&self) -> bool {
        self.task.is_some()
    }

    fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

async fn render_loop(publisher: FramePublisher, width: u32, height: u32, frame_interval: Duration) {
    let mut timer = tokio::time::interval(frame_interval);
    let mut frame_index: u32 = 0;
    loop {
        timer.tick().await;
        let frame = render_pattern(width, height, frame_index);
        if publisher.send(Some(Arc::new(frame))).is_err() {
            break;
        }
        frame_index = frame_index.wrapping_add(1);
    }
}

/// Diagonal gradient with a bright bar sweeping left to right.
fn render_pattern(width: u32, height: u32, frame_index: u32) -> RgbImage {
    let bar_width = (width / 16).max(1);
    let bar_x = (frame_index.wrapping_mul(bar_width / 2 + 1)) % width;
    RgbImage::from_fn(width, height, |x, y| {
        if x >= bar_x && x < bar_x + bar_width {
            return Rgb([240, 240, 240]);
        }
        let r = (x * 255 / width.max(1)) as u8;
        let g = (y * 255 / height.max(1)) as u8;
        let b = (frame_index.wrapping_mul(4) % 256) as u8;
        Rgb([r, g, b])
    })
}
