use std::fmt;
use std::sync::Arc;

use image::RgbImage;
use image::imageops::{self, FilterType};

use crate::camera::FrameFeed;
use crate::frame::FrameSource;

/// How much of the bound video is available, from least to most.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ReadyState {
    HaveNothing,
    HaveMetadata,
    HaveCurrentData,
    HaveFutureData,
    HaveEnoughData,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlaybackError {
    NoSource,
    Ended,
}

impl fmt::Display for PlaybackError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlaybackError::NoSource => write!(f, "no stream attached to the video surface"),
            PlaybackError::Ended => write!(f, "stream ended before any frame was rendered"),
        }
    }
}

impl std::error::Error for PlaybackError {}

/// The renderable surface a camera stream is bound to.
///
/// Display is muted and mirrored for the user; frames read back through
/// [`FrameSource`] are the unmirrored camera image.
pub struct VideoSurface {
    source: Option<FrameFeed>,
    playing: bool,
    muted: bool,
    mirrored: bool,
}

impl VideoSurface {
    pub fn new() -> Self {
        Self {
            source: None,
            playing: false,
            muted: true,
            mirrored: true,
        }
    }

    pub fn attach(&mut self, feed: FrameFeed) {
        self.source = Some(feed);
        self.playing = false;
    }

    pub fn detach(&mut self) {
        self.source = None;
        self.playing = false;
    }

    pub fn is_attached(&self) -> bool {
        self.source.is_some()
    }

    pub fn is_playing(&self) -> bool {
        self.playing
    }

    pub fn is_muted(&self) -> bool {
        self.muted
    }

    pub fn is_mirrored(&self) -> bool {
        self.mirrored
    }

    /// A view of the bound stream, used to wait for [`can_play`].
    pub fn source(&self) -> Option<FrameFeed> {
        self.source.clone()
    }

    /// Starts playback of the attached stream.
    pub fn play(&mut self) -> Result<(), PlaybackError> {
        let Some(feed) = &self.source else {
            return Err(PlaybackError::NoSource);
        };
        if feed.borrow().is_none() && feed.has_changed().is_err() {
            return Err(PlaybackError::Ended);
        }
        self.playing = true;
        Ok(())
    }

    fn latest_frame(&self) -> Option<Arc<RgbImage>> {
        self.source.as_ref().and_then(|feed| feed.borrow().clone())
    }
}

/// Resolves once the bound stream has produced its first frame.
pub async fn can_play(mut feed: FrameFeed) -> Result<(), PlaybackError> {
    feed.wait_for(|frame| frame.is_some())
        .await
        .map(|_| ())
        .map_err(|_| PlaybackError::Ended)
}

impl Default for VideoSurface {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameSource for VideoSurface {
    fn ready_state(&self) -> ReadyState {
        if self.source.is_none() {
            return ReadyState::HaveNothing;
        }
        // Paused playback exposes dimensions but no readable pixels.
        match (self.latest_frame().is_some(), self.playing) {
            (true, true) => ReadyState::HaveEnoughData,
            _ => ReadyState::HaveMetadata,
        }
    }

    fn dimensions(&self) -> (u32, u32) {
        self.latest_frame()
            .map(|frame| frame.dimensions())
            .unwrap_or((0, 0))
    }

    fn draw(&self, target: &mut RgbImage) {
        let Some(frame) = self.latest_frame() else {
            return;
        };
        if frame.dimensions() == target.dimensions() {
            target.copy_from_slice(frame.as_raw());
        } else {
            // The camera changed resolution between the size probe and the draw.
            *target = imageops::resize(
                &*frame,
                target.width(),
                target.height(),
                FilterType::Triangle,
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;
    use tokio::sync::watch;

    fn solid(width: u32, height: u32, value: u8) -> Arc<RgbImage> {
        Arc::new(RgbImage::from_pixel(width, height, Rgb([value, value, value])))
    }

    #[test]
    fn starts_detached_muted_and_mirrored() {
        let surface = VideoSurface::new();
        assert!(!surface.is_attached());
        assert!(surface.is_muted());
        assert!(surface.is_mirrored());
        assert_eq!(surface.ready_state(), ReadyState::HaveNothing);
        assert_eq!(surface.dimensions(), (0, 0));
        assert!(surface.source().is_none());
    }

    #[test]
    fn becomes_readable_only_after_play() {
        let (tx, rx) = watch::channel(None);
        let mut surface = VideoSurface::new();
        surface.attach(rx);
        assert_eq!(surface.ready_state(), ReadyState::HaveMetadata);

        tx.send(Some(solid(8, 4, 10))).expect("send frame");
        assert_eq!(surface.dimensions(), (8, 4));
        assert_eq!(surface.ready_state(), ReadyState::HaveMetadata);

        surface.play().expect("play");
        assert!(surface.is_playing());
        assert_eq!(surface.ready_state(), ReadyState::HaveEnoughData);

        surface.detach();
        assert!(!surface.is_playing());
        assert_eq!(surface.ready_state(), ReadyState::HaveNothing);
    }

    #[test]
    fn play_fails_without_source_or_after_stream_ended() {
        let mut surface = VideoSurface::new();
        assert_eq!(surface.play(), Err(PlaybackError::NoSource));

        let (tx, rx) = watch::channel(None);
        surface.attach(rx);
        drop(tx);
        assert_eq!(surface.play(), Err(PlaybackError::Ended));
    }

    #[tokio::test]
    async fn can_play_waits_for_first_frame() {
        let (tx, rx) = watch::channel(None);
        let mut surface = VideoSurface::new();
        surface.attach(rx);
        let waiter = tokio::spawn(can_play(surface.source().expect("attached")));
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        tx.send(Some(solid(2, 2, 0))).expect("send frame");
        assert_eq!(waiter.await.expect("join"), Ok(()));
    }

    #[tokio::test]
    async fn can_play_errors_when_stream_ends_first() {
        let (tx, rx) = watch::channel(None);
        let mut surface = VideoSurface::new();
        surface.attach(rx);
        drop(tx);
        assert_eq!(
            can_play(surface.source().expect("attached")).await,
            Err(PlaybackError::Ended)
        );
    }

    #[test]
    fn draw_copies_or_rescales_latest_frame() {
        let (tx, rx) = watch::channel(Some(solid(4, 4, 200)));
        let mut surface = VideoSurface::new();
        surface.attach(rx);
        surface.play().expect("play");

        let mut same = RgbImage::new(4, 4);
        surface.draw(&mut same);
        assert!(same.pixels().all(|p| p.0 == [200, 200, 200]));

        tx.send(Some(solid(8, 8, 50))).expect("send frame");
        let mut smaller = RgbImage::new(4, 4);
        surface.draw(&mut smaller);
        assert_eq!(smaller.dimensions(), (4, 4));
        assert!(smaller.pixels().all(|p| p.0 == [50, 50, 50]));
    }
}
