//! Camera session lifecycle.
//!
//! [`SessionManager`] is an event-driven state machine. User intents and async
//! completions both arrive as [`SessionEvent`]s and are handled to completion on
//! the local thread. Every async completion carries the session generation it
//! was dispatched under, and anything from an older generation is discarded.

use std::fmt;
use std::rc::Rc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use tokio::sync::{mpsc, watch};

use crate::api::{Analyzer, EmotionReading};
use crate::camera::{AcquireError, CameraDevice, CaptureConstraints, MediaStream};
use crate::config::AppConfig;
use crate::frame::{FrameExtractor, FrameSource};
use crate::scheduler::{BackgroundTask, PollScheduler};
use crate::surface::{self, PlaybackError, VideoSurface};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Acquiring,
    Bound,
    Analyzing,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Idle => write!(f, "idle"),
            Phase::Acquiring => write!(f, "acquiring"),
            Phase::Bound => write!(f, "bound"),
            Phase::Analyzing => write!(f, "analyzing"),
        }
    }
}

/// Everything the session reacts to.
#[derive(Debug)]
pub enum SessionEvent {
    Start,
    Stop,
    Shutdown,
    Acquired {
        generation: u64,
        result: Result<MediaStream, AcquireError>,
    },
    CanPlay {
        generation: u64,
        result: Result<(), PlaybackError>,
    },
    Settled {
        generation: u64,
    },
    Tick {
        generation: u64,
    },
    Analyzed {
        generation: u64,
        reading: Option<EmotionReading>,
    },
}

/// Read-only view published to the presentation layer.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSnapshot {
    pub phase: Phase,
    pub reading: EmotionReading,
    pub error: Option<String>,
    pub status: String,
    pub updated_at: Option<DateTime<Utc>>,
    pub mirrored: bool,
}

impl Default for SessionSnapshot {
    fn default() -> Self {
        Self {
            phase: Phase::Idle,
            reading: EmotionReading::default(),
            error: None,
            status: String::new(),
            updated_at: None,
            mirrored: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionSettings {
    pub frame_interval: Duration,
    pub settle_delay: Duration,
    pub constraints: CaptureConstraints,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self::from(&AppConfig::default())
    }
}

impl From<&AppConfig> for SessionSettings {
    fn from(config: &AppConfig) -> Self {
        Self {
            frame_interval: config.frame_interval,
            settle_delay: config.settle_delay,
            constraints: CaptureConstraints::default(),
        }
    }
}

/// Sends user intent into a running session.
#[derive(Debug, Clone)]
pub struct SessionController {
    events: mpsc::UnboundedSender<SessionEvent>,
}

impl SessionController {
    pub fn start(&self) {
        self.send(SessionEvent::Start);
    }

    pub fn stop(&self) {
        self.send(SessionEvent::Stop);
    }

    pub fn shutdown(&self) {
        self.send(SessionEvent::Shutdown);
    }

    fn send(&self, event: SessionEvent) {
        if self.events.send(event).is_err() {
            debug!("Session loop already exited");
        }
    }
}

/// Sole owner of the camera stream, its surface binding and the poll timer.
pub struct SessionManager<C, A> {
    camera: Rc<C>,
    analyzer: Rc<A>,
    settings: SessionSettings,
    phase: Phase,
    generation: u64,
    stream: Option<MediaStream>,
    surface: VideoSurface,
    extractor: FrameExtractor,
    scheduler: PollScheduler,
    can_play_task: Option<BackgroundTask>,
    settle_task: Option<BackgroundTask>,
    reading: EmotionReading,
    updated_at: Option<DateTime<Utc>>,
    error: Option<String>,
    status: String,
    events: mpsc::UnboundedSender<SessionEvent>,
    snapshot: watch::Sender<SessionSnapshot>,
}

impl<C, A> SessionManager<C, A>
where
    C: CameraDevice + 'static,
    A: Analyzer + 'static,
{
    pub fn new(
        camera: C,
        analyzer: A,
        settings: SessionSettings,
    ) -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let (events, receiver) = mpsc::unbounded_channel();
        let (snapshot, _) = watch::channel(SessionSnapshot::default());
        let manager = Self {
            camera: Rc::new(camera),
            analyzer: Rc::new(analyzer),
            settings,
            phase: Phase::Idle,
            generation: 0,
            stream: None,
            surface: VideoSurface::new(),
            extractor: FrameExtractor::new(),
            scheduler: PollScheduler::new(),
            can_play_task: None,
            settle_task: None,
            reading: EmotionReading::default(),
            updated_at: None,
            error: None,
            status: String::new(),
            events,
            snapshot,
        };
        (manager, receiver)
    }

    pub fn controller(&self) -> SessionController {
        SessionController {
            events: self.events.clone(),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshot.subscribe()
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn reading(&self) -> &EmotionReading {
        &self.reading
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn status(&self) -> &str {
        &self.status
    }

    pub fn is_polling(&self) -> bool {
        self.scheduler.is_armed()
    }

    pub fn holds_stream(&self) -> bool {
        self.stream.is_some()
    }

    pub fn surface(&self) -> &VideoSurface {
        &self.surface
    }

    /// Processes events until a shutdown request, then tears the session down.
    pub async fn run(mut self, mut events: mpsc::UnboundedReceiver<SessionEvent>) {
        while let Some(event) = events.recv().await {
            if matches!(event, SessionEvent::Shutdown) {
                break;
            }
            self.handle(event);
        }
        info!("Session loop exiting");
    }

    pub fn handle(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::Start => self.start(),
            SessionEvent::Stop | SessionEvent::Shutdown => self.stop(),
            SessionEvent::Acquired { generation, result } => self.on_acquired(generation, result),
            SessionEvent::CanPlay { generation, result } => self.on_can_play(generation, result),
            SessionEvent::Settled { generation } => self.on_settled(generation),
            SessionEvent::Tick { generation } => self.on_tick(generation),
            SessionEvent::Analyzed {
                generation,
                reading,
            } => self.on_analyzed(generation, reading),
        }
        self.publish();
    }

    fn start(&mut self) {
        if self.phase != Phase::Idle {
            warn!("Start ignored: camera session is already {}", self.phase);
            return;
        }

        self.generation += 1;
        let generation = self.generation;
        self.phase = Phase::Acquiring;
        self.error = None;
        self.set_status("Requesting camera access...");
        info!("Requesting camera access from {}", self.camera.name());

        let camera = Rc::clone(&self.camera);
        let events = self.events.clone();
        let constraints = self.settings.constraints;
        // Not cancelled on stop: a late stream comes back as a stale event and is released there.
        tokio::task::spawn_local(async move {
            let result = camera.acquire(constraints).await;
            let _ = events.send(SessionEvent::Acquired { generation, result });
        });
    }

    fn on_acquired(&mut self, generation: u64, result: Result<MediaStream, AcquireError>) {
        if !self.is_current(generation, Phase::Acquiring) {
            if let Ok(mut stream) = result {
                let stopped = stream.stop();
                info!(
                    "Released stream {} acquired after its session ended ({stopped} track(s))",
                    stream.id()
                );
            }
            return;
        }

        let stream = match result {
            Ok(stream) => stream,
            Err(err) => {
                error!("Error starting camera: {err}");
                self.phase = Phase::Idle;
                self.error = Some(err.to_string());
                self.set_status(format!("Error: {err}"));
                return;
            }
        };

        info!(
            "Stream {} obtained: active={}, tracks: {}",
            stream.id(),
            stream.is_active(),
            stream.track_count()
        );
        self.set_status("Attaching stream to video surface...");
        self.surface.attach(stream.feed());
        debug!(
            "Surface attached (muted={}, mirrored={})",
            self.surface.is_muted(),
            self.surface.is_mirrored()
        );
        self.stream = Some(stream);
        self.phase = Phase::Bound;

        let Some(feed) = self.surface.source() else {
            return;
        };
        let events = self.events.clone();
        self.can_play_task = Some(BackgroundTask::spawn(async move {
            let result = surface::can_play(feed).await;
            let _ = events.send(SessionEvent::CanPlay { generation, result });
        }));
    }

    fn on_can_play(&mut self, generation: u64, result: Result<(), PlaybackError>) {
        if !self.is_current(generation, Phase::Bound) {
            return;
        }
        self.can_play_task = None;

        if let Err(err) = result {
            warn!("Play error: {err}");
            self.set_status(format!("Play error: {err}"));
            return;
        }

        self.set_status("Video can play, starting...");
        match self.surface.play() {
            Ok(()) => {
                let (width, height) = self.surface.dimensions();
                info!("Video playing, dimensions: {width}x{height}");
                self.set_status(format!(
                    "Video playing: {}, dimensions: {width}x{height}",
                    self.surface.is_playing()
                ));
            }
            Err(err) => {
                warn!("Play error: {err}");
                self.set_status(format!("Play error: {err}"));
            }
        }

        let events = self.events.clone();
        self.settle_task = Some(BackgroundTask::delayed(self.settings.settle_delay, move || {
            let _ = events.send(SessionEvent::Settled { generation });
        }));
    }

    fn on_settled(&mut self, generation: u64) {
        if !self.is_current(generation, Phase::Bound) {
            return;
        }
        self.settle_task = None;
        self.phase = Phase::Analyzing;
        info!(
            "Starting frame analysis every {}ms",
            self.settings.frame_interval.as_millis()
        );

        let events = self.events.clone();
        self.scheduler.start(self.settings.frame_interval, move || {
            let _ = events.send(SessionEvent::Tick { generation });
        });
    }

    fn on_tick(&mut self, generation: u64) {
        if !self.is_current(generation, Phase::Analyzing) {
            return;
        }

        let Some(frame) = self.extractor.extract(&self.surface) else {
            debug!("Video surface not ready; skipping frame");
            return;
        };

        let analyzer = Rc::clone(&self.analyzer);
        let events = self.events.clone();
        tokio::task::spawn_local(async move {
            let reading = analyzer.analyze(frame).await;
            let _ = events.send(SessionEvent::Analyzed {
                generation,
                reading,
            });
        });
    }

    fn on_analyzed(&mut self, generation: u64, reading: Option<EmotionReading>) {
        if !self.is_current(generation, Phase::Analyzing) {
            debug!("Discarding analysis result from generation {generation}");
            return;
        }
        // Applied in completion order; responses may overtake each other.
        if let Some(reading) = reading {
            self.reading = reading;
            self.updated_at = Some(Utc::now());
        }
    }

    fn stop(&mut self) {
        if self.phase == Phase::Idle {
            return;
        }
        self.release();
        self.reading = EmotionReading::default();
        self.updated_at = None;
        self.error = None;
        self.set_status("Camera stopped");
        info!("Camera session stopped");
    }

    fn is_current(&self, generation: u64, phase: Phase) -> bool {
        generation == self.generation && self.phase == phase
    }

    fn set_status(&mut self, status: impl Into<String>) {
        self.status = status.into();
        debug!("{}", self.status);
    }

    fn publish(&self) {
        let next = SessionSnapshot {
            phase: self.phase,
            reading: self.reading.clone(),
            error: self.error.clone(),
            status: self.status.clone(),
            updated_at: self.updated_at,
            mirrored: self.surface.is_mirrored(),
        };
        self.snapshot.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
    }
}

impl<C, A> SessionManager<C, A> {
    /// Cancels the timer before releasing the hardware, then detaches the surface.
    fn release(&mut self) {
        self.generation += 1;
        self.scheduler.stop();
        self.can_play_task = None;
        self.settle_task = None;
        if let Some(mut stream) = self.stream.take() {
            let stopped = stream.stop();
            info!("Released stream {} ({stopped} track(s) stopped)", stream.id());
        }
        self.surface.detach();
        self.phase = Phase::Idle;
    }
}

impl<C, A> Drop for SessionManager<C, A> {
    fn drop(&mut self) {
        if self.phase != Phase::Idle || self.stream.is_some() {
            self.release();
            info!("Camera session torn down");
        }
    }
}
