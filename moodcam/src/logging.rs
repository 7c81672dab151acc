use log::LevelFilter;
use std::sync::OnceLock;

static LOGGER_INIT: OnceLock<()> = OnceLock::new();

#[cfg(target_os = "macos")]
const SUBSYSTEM: &str = "com.moodcam.moodcam";

pub fn init() {
    LOGGER_INIT.get_or_init(|| {
        #[cfg(target_os = "macos")]
        if let Err(err) = oslog::OsLogger::new(SUBSYSTEM)
            .level_filter(LevelFilter::Info)
            .init()
        {
            eprintln!("failed to initialize unified logging: {err}");
        }

        // RUST_LOG overrides the default level.
        #[cfg(not(target_os = "macos"))]
        if let Err(err) = env_logger::Builder::new()
            .filter_level(LevelFilter::Info)
            .parse_default_env()
            .format_timestamp_millis()
            .try_init()
        {
            eprintln!("failed to initialize logging: {err}");
        }
    });
}
