use anyhow::{Context, Result};
use log::info;
use tokio::task::LocalSet;

use moodcam::api::{Analyzer, AnalyzerClient};
use moodcam::camera::{CameraDevice, SyntheticCamera};
use moodcam::config::{AppConfig, CameraKind};
use moodcam::session::{SessionManager, SessionSettings};
use moodcam::{console, logging};

fn main() -> Result<()> {
    logging::init();

    let config = AppConfig::load().context("Failed to load configuration")?;
    info!(
        "Launching Moodcam (analyzer: {}, camera: {}, interval: {}ms)",
        config.analyzer_url,
        config.camera,
        config.frame_interval.as_millis()
    );

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to start async runtime")?;
    let local = LocalSet::new();

    local.block_on(&runtime, run(&config))
}

async fn run(config: &AppConfig) -> Result<()> {
    let analyzer = AnalyzerClient::new(&config.analyzer_url, config.request_timeout)
        .context("Failed to build analyzer client")?;

    match config.camera {
        CameraKind::Synthetic => drive(SyntheticCamera::new(), analyzer, config).await,
        CameraKind::Webcam => run_webcam(analyzer, config).await,
    }
}

#[cfg(feature = "webcam")]
async fn run_webcam(analyzer: AnalyzerClient, config: &AppConfig) -> Result<()> {
    let camera = moodcam::camera::WebcamCamera::new(config.camera_index);
    drive(camera, analyzer, config).await
}

#[cfg(not(feature = "webcam"))]
async fn run_webcam(_analyzer: AnalyzerClient, _config: &AppConfig) -> Result<()> {
    anyhow::bail!(
        "Moodcam was built without webcam support; rebuild with `--features webcam` or set {}=synthetic",
        moodcam::config::CAMERA_ENV
    )
}

async fn drive<C, A>(camera: C, analyzer: A, config: &AppConfig) -> Result<()>
where
    C: CameraDevice + 'static,
    A: Analyzer + 'static,
{
    info!("Using camera: {}", camera.name());
    let (manager, events) = SessionManager::new(camera, analyzer, SessionSettings::from(config));
    let controller = manager.controller();
    let snapshots = manager.subscribe();
    let session = tokio::task::spawn_local(manager.run(events));

    let console_result = console::run(controller.clone(), snapshots, &config.analyzer_url).await;
    controller.shutdown();
    session.await.context("Session task panicked")?;

    console_result.context("Console I/O failed")?;
    info!("Moodcam stopped");
    Ok(())
}
