use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use image::RgbImage;
use tokio::sync::watch;

/// Latest decoded frame published by a capture device. `None` until the first frame lands.
pub type FrameFeed = watch::Receiver<Option<Arc<RgbImage>>>;
pub type FramePublisher = watch::Sender<Option<Arc<RgbImage>>>;

static NEXT_STREAM_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FacingMode {
    User,
    Environment,
}

/// What the session asks the hardware for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureConstraints {
    pub facing: FacingMode,
    pub ideal_width: u32,
    pub ideal_height: u32,
    pub audio: bool,
}

impl Default for CaptureConstraints {
    fn default() -> Self {
        Self {
            facing: FacingMode::User,
            ideal_width: 1280,
            ideal_height: 720,
            audio: false,
        }
    }
}

/// Reasons a capture request can fail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcquireError {
    PermissionDenied,
    NoDevice,
    Backend(String),
}

impl fmt::Display for AcquireError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AcquireError::PermissionDenied => write!(f, "Camera permission denied"),
            AcquireError::NoDevice => write!(f, "No camera device found"),
            AcquireError::Backend(err) => write!(f, "Failed to access camera: {err}"),
        }
    }
}

impl std::error::Error for AcquireError {}

/// One hardware track inside a stream. Stopping must be idempotent.
pub trait MediaTrack {
    fn label(&self) -> &str;

    fn is_live(&self) -> bool;

    fn stop(&mut self);
}

/// A live capture acquired from a [`CameraDevice`].
///
/// The stream owns its tracks; dropping it stops every track that is still live.
pub struct MediaStream {
    id: u64,
    tracks: Vec<Box<dyn MediaTrack>>,
    feed: FrameFeed,
}

impl MediaStream {
    pub fn new(tracks: Vec<Box<dyn MediaTrack>>, feed: FrameFeed) -> Self {
        Self {
            id: NEXT_STREAM_ID.fetch_add(1, Ordering::Relaxed),
            tracks,
            feed,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn track_count(&self) -> usize {
        self.tracks.len()
    }

    pub fn live_tracks(&self) -> usize {
        self.tracks.iter().filter(|track| track.is_live()).count()
    }

    pub fn is_active(&self) -> bool {
        self.live_tracks() > 0
    }

    pub fn track_labels(&self) -> Vec<String> {
        self.tracks.iter().map(|track| track.label().to_string()).collect()
    }

    /// A view of the video for binding to a surface. The stream keeps ownership of the hardware.
    pub fn feed(&self) -> FrameFeed {
        self.feed.clone()
    }

    /// Stops every live track and returns how many were stopped.
    pub fn stop(&mut self) -> usize {
        let mut stopped = 0;
        for track in self.tracks.iter_mut() {
            if track.is_live() {
                track.stop();
                stopped += 1;
            }
        }
        stopped
    }
}

impl fmt::Debug for MediaStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediaStream")
            .field("id", &self.id)
            .field("tracks", &self.track_labels())
            .field("live_tracks", &self.live_tracks())
            .finish()
    }
}

impl Drop for MediaStream {
    fn drop(&mut self) {
        let stopped = self.stop();
        if stopped > 0 {
            log::debug!("Stream {} dropped, stopped {stopped} track(s)", self.id);
        }
    }
}

/// Pluggable capture hardware.
///
/// `acquire` may stay pending for as long as the platform waits on a permission prompt.
#[allow(async_fn_in_trait)]
pub trait CameraDevice {
    fn name(&self) -> String;

    async fn acquire(&self, constraints: CaptureConstraints) -> Result<MediaStream, AcquireError>;
}

mod synthetic;
#[cfg(feature = "webcam")]
mod webcam;

pub use synthetic::SyntheticCamera;
#[cfg(feature = "webcam")]
pub use webcam::WebcamCamera;

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;

    struct CountingTrack {
        live: bool,
        stops: Rc<Cell<usize>>,
    }

    impl MediaTrack for CountingTrack {
        fn label(&self) -> &str {
            "counting"
        }

        fn is_live(&self) -> bool {
            self.live
        }

        fn stop(&mut self) {
            self.live = false;
            self.stops.set(self.stops.get() + 1);
        }
    }

    fn stream_with(tracks: usize, stops: &Rc<Cell<usize>>) -> MediaStream {
        let (_tx, rx) = watch::channel(None);
        let tracks = (0..tracks)
            .map(|_| {
                Box::new(CountingTrack {
                    live: true,
                    stops: Rc::clone(stops),
                }) as Box<dyn MediaTrack>
            })
            .collect();
        MediaStream::new(tracks, rx)
    }

    #[test]
    fn stop_releases_each_track_once() {
        let stops = Rc::new(Cell::new(0));
        let mut stream = stream_with(2, &stops);
        assert!(stream.is_active());
        assert_eq!(stream.stop(), 2);
        assert_eq!(stream.stop(), 0);
        assert!(!stream.is_active());
        drop(stream);
        assert_eq!(stops.get(), 2);
    }

    #[test]
    fn dropping_a_stream_stops_live_tracks() {
        let stops = Rc::new(Cell::new(0));
        drop(stream_with(3, &stops));
        assert_eq!(stops.get(), 3);
    }

    #[test]
    fn stream_ids_are_unique() {
        let stops = Rc::new(Cell::new(0));
        let a = stream_with(1, &stops);
        let b = stream_with(1, &stops);
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn default_constraints_request_user_facing_hd_video_only() {
        let constraints = CaptureConstraints::default();
        assert_eq!(constraints.facing, FacingMode::User);
        assert_eq!((constraints.ideal_width, constraints.ideal_height), (1280, 720));
        assert!(!constraints.audio);
    }
}
