//! Native webcam capture using `nokhwa`.
//!
//! `nokhwa::Camera` is `!Send`, so each acquisition opens the device on its own
//! capture thread and publishes decoded RGB frames through the stream's feed.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use image::RgbImage;
use log::{error, info, warn};
use nokhwa::Camera;
use nokhwa::pixel_format::RgbFormat;
use nokhwa::utils::{
    CameraFormat, CameraIndex, FrameFormat, RequestedFormat, RequestedFormatType, Resolution,
};
use tokio::sync::{oneshot, watch};

use super::{
    AcquireError, CameraDevice, CaptureConstraints, FacingMode, FramePublisher, MediaStream,
    MediaTrack,
};

const TARGET_FPS: u32 = 30;
const RETRY_DELAY_MS: u64 = 50;
const STOP_TIMEOUT: Duration = Duration::from_millis(1000);
const STOP_POLL_INTERVAL: Duration = Duration::from_millis(10);

pub struct WebcamCamera {
    index: u32,
}

impl WebcamCamera {
    pub fn new(index: u32) -> Self {
        Self { index }
    }
}

impl CameraDevice for WebcamCamera {
    fn name(&self) -> String {
        format!("webcam #{}", self.index)
    }

    async fn acquire(&self, constraints: CaptureConstraints) -> Result<MediaStream, AcquireError> {
        if constraints.facing == FacingMode::Environment {
            warn!("Facing mode is not selectable on this backend, using device index {}", self.index);
        }

        let index = self.index;
        let (ready_tx, ready_rx) = oneshot::channel();
        let (publisher, feed) = watch::channel(None);
        let stop = Arc::new(AtomicBool::new(false));
        let thread_flag = Arc::clone(&stop);

        let handle = thread::Builder::new()
            .name(format!("webcam-{index}"))
            .spawn(move || capture_loop(index, constraints, thread_flag, publisher, ready_tx))
            .map_err(|err| AcquireError::Backend(err.to_string()))?;

        match ready_rx.await {
            Ok(Ok(label)) => {
                let track = WebcamTrack {
                    label,
                    stop,
                    handle: Some(handle),
                };
                Ok(MediaStream::new(vec![Box::new(track)], feed))
            }
            Ok(Err(err)) => {
                join_capture_thread(handle);
                Err(err)
            }
            Err(_) => {
                join_capture_thread(handle);
                Err(AcquireError::Backend(
                    "capture thread exited before opening the camera".into(),
                ))
            }
        }
    }
}

struct WebcamTrack {
    label: String,
    stop: Arc<AtomicBool>,
    handle: Option<thread::JoinHandle<()>>,
}

impl MediaTrack for WebcamTrack {
    fn label(&self) -> &str {
        &self.label
    }

    fn is_live(&self) -> bool {
        self.handle.is_some()
    }

    fn stop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            join_capture_thread(handle);
        }
    }
}

fn capture_loop(
    index: u32,
    constraints: CaptureConstraints,
    stop: Arc<AtomicBool>,
    publisher: FramePublisher,
    ready: oneshot::Sender<Result<String, AcquireError>>,
) {
    let requested = RequestedFormat::new::<RgbFormat>(RequestedFormatType::Closest(
        CameraFormat::new(
            Resolution::new(constraints.ideal_width, constraints.ideal_height),
            FrameFormat::MJPEG,
            TARGET_FPS,
        ),
    ));

    let mut camera = match Camera::new(CameraIndex::Index(index), requested) {
        Ok(camera) => camera,
        Err(err) => {
            error!("Failed to open webcam {index}: {err}");
            let _ = ready.send(Err(classify(err.to_string())));
            return;
        }
    };

    if let Err(err) = camera.open_stream() {
        error!("Failed to open webcam {index} stream: {err}");
        let _ = ready.send(Err(classify(err.to_string())));
        return;
    }

    let resolution = camera.resolution();
    info!(
        "Webcam {index} streaming at {}x{} (requested {}x{})",
        resolution.width(),
        resolution.height(),
        constraints.ideal_width,
        constraints.ideal_height
    );

    if ready.send(Ok(camera.info().human_name())).is_err() {
        // Acquisition was abandoned before the camera opened.
        if let Err(err) = camera.stop_stream() {
            warn!("Error stopping webcam stream: {err}");
        }
        return;
    }

    while !stop.load(Ordering::Relaxed) {
        match camera.frame() {
            Ok(buffer) => match buffer.decode_image::<RgbFormat>() {
                Ok(decoded) => {
                    let (width, height) = (decoded.width(), decoded.height());
                    let Some(frame) = RgbImage::from_raw(width, height, decoded.into_raw()) else {
                        warn!("Discarding webcam frame with mismatched buffer size");
                        continue;
                    };
                    if publisher.send(Some(Arc::new(frame))).is_err() {
                        break;
                    }
                }
                Err(err) => warn!("Failed to decode webcam frame: {err}"),
            },
            Err(err) => {
                warn!("Failed to capture webcam frame: {err}");
                thread::sleep(Duration::from_millis(RETRY_DELAY_MS));
            }
        }
    }

    if let Err(err) = camera.stop_stream() {
        warn!("Error stopping webcam stream: {err}");
    }
    info!("Webcam {index} capture stopped");
}

fn classify(message: String) -> AcquireError {
    let lower = message.to_lowercase();
    if lower.contains("permission") || lower.contains("denied") || lower.contains("not authorized")
    {
        AcquireError::PermissionDenied
    } else if lower.contains("not found") || lower.contains("no device") {
        AcquireError::NoDevice
    } else {
        AcquireError::Backend(message)
    }
}

/// Waits up to `STOP_TIMEOUT` for the capture thread, then detaches it.
///
/// Runs on the session's event loop, so a stalled `frame()` must not hold it up.
fn join_capture_thread(handle: thread::JoinHandle<()>) {
    if !wait_for_exit(handle, STOP_TIMEOUT) {
        warn!(
            "Webcam capture thread did not stop within {}ms; detaching it",
            STOP_TIMEOUT.as_millis()
        );
    }
}

/// Returns false if the thread was still running at the deadline.
fn wait_for_exit(handle: thread::JoinHandle<()>, timeout: Duration) -> bool {
    if handle.thread().id() == thread::current().id() {
        warn!("Skipping join for webcam capture thread from itself");
        return true;
    }
    let deadline = Instant::now() + timeout;
    while !handle.is_finished() {
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(STOP_POLL_INTERVAL);
    }
    if handle.join().is_err() {
        error!("Webcam capture thread panicked during shutdown");
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_backend_messages() {
        assert_eq!(
            classify("Permission denied by user".into()),
            AcquireError::PermissionDenied
        );
        assert_eq!(
            classify("Could not open device: Device not found".into()),
            AcquireError::NoDevice
        );
        assert_eq!(
            classify("format unsupported".into()),
            AcquireError::Backend("format unsupported".into())
        );
    }

    #[test]
    fn waits_for_a_capture_thread_that_stops() {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stop);
        let handle = thread::spawn(move || {
            while !flag.load(Ordering::Relaxed) {
                thread::sleep(Duration::from_millis(5));
            }
        });
        stop.store(true, Ordering::Relaxed);
        assert!(wait_for_exit(handle, Duration::from_secs(5)));
    }

    #[test]
    fn detaches_a_stalled_capture_thread() {
        let (release, stalled) = std::sync::mpsc::channel::<()>();
        let handle = thread::spawn(move || {
            let _ = stalled.recv();
        });
        let started = Instant::now();
        assert!(!wait_for_exit(handle, Duration::from_millis(50)));
        assert!(started.elapsed() < Duration::from_secs(2));
        drop(release);
    }
}
