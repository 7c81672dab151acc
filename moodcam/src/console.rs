use std::fmt;
use std::str::FromStr;

use log::{debug, info};
use tokio::io::{self, AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::watch;

use crate::session::{Phase, SessionController, SessionSnapshot};

const HELP: &str = "Commands: start (s), stop (x), status, quit (q)";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Start,
    Stop,
    Status,
    Quit,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownCommand(pub String);

impl fmt::Display for UnknownCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown command `{}`", self.0)
    }
}

impl std::error::Error for UnknownCommand {}

impl FromStr for Command {
    type Err = UnknownCommand;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "start" | "s" => Ok(Command::Start),
            "stop" | "x" => Ok(Command::Stop),
            "status" => Ok(Command::Status),
            "quit" | "q" | "exit" => Ok(Command::Quit),
            other => Err(UnknownCommand(other.to_string())),
        }
    }
}

/// Formats a confidence as a percentage, or nothing when there is none.
pub fn format_confidence(confidence: f64) -> Option<String> {
    (confidence > 0.0).then(|| format!("{:.1}%", confidence * 100.0))
}

/// One-line view of the session for the terminal.
pub fn render(snapshot: &SessionSnapshot) -> String {
    let mut line = format!("[{}] Emotion: {}", snapshot.phase, snapshot.reading.label);
    if let Some(confidence) = format_confidence(snapshot.reading.confidence) {
        line.push_str(&format!(" ({confidence})"));
    }
    if let Some(updated_at) = snapshot.updated_at {
        line.push_str(&format!(" at {}", updated_at.format("%H:%M:%S")));
    }
    if let Some(error) = &snapshot.error {
        line.push_str(&format!(" | Error: {error}"));
    }
    if !snapshot.status.is_empty() {
        line.push_str(&format!(" | {}", snapshot.status));
    }
    line
}

fn idle_hint(analyzer_url: &str) -> String {
    format!("Type start to begin. Make sure the analyzer is running on {analyzer_url}")
}

async fn write_line(out: &mut io::Stdout, line: &str) -> io::Result<()> {
    out.write_all(line.as_bytes()).await?;
    out.write_all(b"\n").await?;
    out.flush().await
}

/// Reads commands from stdin and prints every published snapshot until quit or EOF.
pub async fn run(
    controller: SessionController,
    mut snapshots: watch::Receiver<SessionSnapshot>,
    analyzer_url: &str,
) -> io::Result<()> {
    let mut out = io::stdout();
    let mut lines = BufReader::new(io::stdin()).lines();

    write_line(&mut out, HELP).await?;
    write_line(&mut out, &idle_hint(analyzer_url)).await?;

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else {
                    debug!("stdin closed");
                    break;
                };
                if line.trim().is_empty() {
                    continue;
                }
                match line.parse::<Command>() {
                    Ok(Command::Start) => controller.start(),
                    Ok(Command::Stop) => controller.stop(),
                    Ok(Command::Status) => {
                        let snapshot = snapshots.borrow().clone();
                        write_line(&mut out, &render(&snapshot)).await?;
                    }
                    Ok(Command::Quit) => break,
                    Err(err) => write_line(&mut out, &format!("{err}. {HELP}")).await?,
                }
            }
            changed = snapshots.changed() => {
                if changed.is_err() {
                    info!("Session ended");
                    break;
                }
                let snapshot = snapshots.borrow_and_update().clone();
                write_line(&mut out, &render(&snapshot)).await?;
                if snapshot.phase == Phase::Idle && snapshot.error.is_none() {
                    write_line(&mut out, &idle_hint(analyzer_url)).await?;
                }
            }
        }
    }

    controller.shutdown();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::EmotionReading;
    use chrono::{TimeZone, Utc};

    #[test]
    fn parses_commands_and_aliases() {
        assert_eq!("start".parse::<Command>(), Ok(Command::Start));
        assert_eq!(" S ".parse::<Command>(), Ok(Command::Start));
        assert_eq!("x".parse::<Command>(), Ok(Command::Stop));
        assert_eq!("STOP".parse::<Command>(), Ok(Command::Stop));
        assert_eq!("status".parse::<Command>(), Ok(Command::Status));
        assert_eq!("q".parse::<Command>(), Ok(Command::Quit));
        assert_eq!(
            "dance".parse::<Command>(),
            Err(UnknownCommand("dance".to_string()))
        );
    }

    #[test]
    fn confidence_shows_only_when_positive() {
        assert_eq!(format_confidence(0.92).as_deref(), Some("92.0%"));
        assert_eq!(format_confidence(1.0).as_deref(), Some("100.0%"));
        assert_eq!(format_confidence(0.0), None);
    }

    #[test]
    fn renders_default_snapshot_without_confidence() {
        let line = render(&SessionSnapshot::default());
        assert_eq!(line, "[idle] Emotion: None");
    }

    #[test]
    fn renders_reading_time_and_error() {
        let snapshot = SessionSnapshot {
            phase: Phase::Analyzing,
            reading: EmotionReading::new("happy", 0.92),
            error: None,
            status: "Video playing: true, dimensions: 1280x720".to_string(),
            updated_at: Utc.with_ymd_and_hms(2024, 5, 1, 12, 30, 5).single(),
            ..SessionSnapshot::default()
        };
        assert_eq!(
            render(&snapshot),
            "[analyzing] Emotion: happy (92.0%) at 12:30:05 | Video playing: true, dimensions: 1280x720"
        );

        let failed = SessionSnapshot {
            error: Some("Camera permission denied".to_string()),
            ..SessionSnapshot::default()
        };
        assert!(render(&failed).ends_with("| Error: Camera permission denied"));
    }

    #[test]
    fn idle_hint_names_the_analyzer() {
        assert!(idle_hint("http://127.0.0.1:5000").contains("http://127.0.0.1:5000"));
    }
}
