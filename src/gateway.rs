//! Line-oriented session control
//!
//! Operators drive the ranging session with one-word commands: `start`,
//! `stop`, `reset`, `status` and `end`. Parsing ignores case and surrounding
//! whitespace.

use log::info;
use std::fmt;
use std::str::FromStr;

use crate::core::{RangingSession, SessionError};

/// A session control command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Begin ranging
    Start,
    /// Halt ranging after the in-flight pair
    Stop,
    /// Stop, then start from pair 0 with an empty buffer
    Reset,
    /// Report whether ranging runs and what it has measured
    Status,
    /// Stop ranging and leave the command loop
    End,
}

/// Unrecognised command text
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown command '{0}' (expected start, stop, reset, status or end)")]
pub struct CommandError(pub String);

impl FromStr for Command {
    type Err = CommandError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        match line.trim().to_ascii_lowercase().as_str() {
            "start" => Ok(Command::Start),
            "stop" => Ok(Command::Stop),
            "reset" => Ok(Command::Reset),
            "status" => Ok(Command::Status),
            "end" => Ok(Command::End),
            other => Err(CommandError(other.to_string())),
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            Command::Start => "start",
            Command::Stop => "stop",
            Command::Reset => "reset",
            Command::Status => "status",
            Command::End => "end",
        };
        f.write_str(name)
    }
}

/// What the command loop should report and whether it should keep reading
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    /// Text for the operator
    pub message: String,
    /// Whether the command loop should end
    pub exit: bool,
}

impl Reply {
    fn say(message: impl Into<String>) -> Self {
        Reply {
            message: message.into(),
            exit: false,
        }
    }
}

/// Applies `command` to `session`
pub async fn apply(command: Command, session: &mut RangingSession) -> Result<Reply, SessionError> {
    info!("Command: {}", command);
    match command {
        Command::Start => {
            session.start()?;
            Ok(Reply::say("Ranging started"))
        }
        Command::Stop => {
            session.stop().await?;
            Ok(Reply::say("Ranging stopped"))
        }
        Command::Reset => {
            session.reset().await?;
            Ok(Reply::say("Ranging reset"))
        }
        Command::Status => Ok(Reply::say(status_line(session))),
        Command::End => {
            session.stop().await?;
            Ok(Reply {
                message: "Ranging ended".to_string(),
                exit: true,
            })
        }
    }
}

fn status_line(session: &RangingSession) -> String {
    match (session.stats(), session.snapshot()) {
        (Ok(stats), Ok(snapshot)) => format!(
            "running: pair {} next, {} pairs, {} readings, {} timeouts, {} read errors, {} published, {}/{} slots populated",
            stats.sequencer.cursor,
            stats.sequencer.pairs_completed,
            stats.sequencer.readings,
            stats.sequencer.timeouts,
            stats.sequencer.read_errors,
            stats.published,
            snapshot.populated(),
            snapshot.slots().len()
        ),
        _ => "stopped".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{HardwareId, SensorRing, SessionSettings};
    use crate::hardware::SimulatedTransport;
    use rstest::rstest;
    use std::sync::Arc;

    fn session() -> RangingSession {
        let ids: Vec<HardwareId> = (0..8).map(HardwareId).collect();
        let ring = SensorRing::new(&ids, 0.0).unwrap();
        let distances = ids.iter().map(|id| (*id, 50.0)).collect();
        let transport = SimulatedTransport::new(distances, 3).with_latency_ms(2, 5);
        RangingSession::new(ring, Arc::new(transport), SessionSettings::default())
    }

    #[rstest]
    #[case("start", Command::Start)]
    #[case("  STOP \n", Command::Stop)]
    #[case("Reset", Command::Reset)]
    #[case("status", Command::Status)]
    #[case("end", Command::End)]
    fn test_parse_commands(#[case] line: &str, #[case] expected: Command) {
        assert_eq!(line.parse::<Command>(), Ok(expected));
    }

    #[rstest]
    #[case("forward")]
    #[case("")]
    #[case("start now")]
    fn test_rejects_unknown_commands(#[case] line: &str) {
        assert!(line.parse::<Command>().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_command_lifecycle() {
        let mut session = session();

        assert_eq!(apply(Command::Status, &mut session).await.unwrap().message, "stopped");
        assert!(!apply(Command::Start, &mut session).await.unwrap().exit);
        assert_eq!(
            apply(Command::Start, &mut session).await,
            Err(SessionError::AlreadyRunning)
        );

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(apply(Command::Status, &mut session).await.unwrap().message.starts_with("running"));

        apply(Command::Reset, &mut session).await.unwrap();
        assert_eq!(session.stats().unwrap().sequencer.pairs_completed, 0);

        apply(Command::Stop, &mut session).await.unwrap();
        apply(Command::Stop, &mut session).await.unwrap();
        let reply = apply(Command::End, &mut session).await.unwrap();
        assert!(reply.exit);
        assert!(!session.is_running());
    }
}
