//! Line-oriented console gateway: the commands a human types into
//! `overwatch serve`, and the notifier that prints replies back.

use std::str::FromStr;

use async_trait::async_trait;
use ow_agents::narrator::{NotifyError, Notifier};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use uuid::Uuid;

pub const HELP_TEXT: &str = "\
*Overwatch commands*
  run <task>      plan, review, and wait for approval before executing
  auto <task>     plan, review, and execute if policy allows
  approve [id]    approve a pending plan (oldest if no id)
  deny [id]       deny a pending plan (oldest if no id)
  kill            lockdown: cancel every active run
  resume          lift lockdown
  status          active and recent runs
  help            this message";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleCommand {
    Run(String),
    Auto(String),
    Approve(Option<Uuid>),
    Deny(Option<Uuid>),
    Kill,
    Resume,
    Status,
    Help,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseCommandError {
    #[error("empty command")]
    Empty,
    #[error("unknown command: {0} (try *help*)")]
    Unknown(String),
    #[error("{0} needs a task description")]
    MissingTask(&'static str),
    #[error("not an approval id: {0}")]
    InvalidId(String),
    #[error("{0} takes no arguments")]
    UnexpectedArgs(&'static str),
}

impl FromStr for ConsoleCommand {
    type Err = ParseCommandError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let line = line.trim();
        if line.is_empty() {
            return Err(ParseCommandError::Empty);
        }
        let (word, rest) = match line.split_once(char::is_whitespace) {
            Some((word, rest)) => (word, rest.trim()),
            None => (line, ""),
        };

        match word.to_ascii_lowercase().as_str() {
            "run" => task_arg("run", rest).map(ConsoleCommand::Run),
            "auto" => task_arg("auto", rest).map(ConsoleCommand::Auto),
            "approve" | "yes" => id_arg(rest).map(ConsoleCommand::Approve),
            "deny" | "no" => id_arg(rest).map(ConsoleCommand::Deny),
            "kill" | "stop" => no_args("kill", rest, ConsoleCommand::Kill),
            "resume" => no_args("resume", rest, ConsoleCommand::Resume),
            "status" => no_args("status", rest, ConsoleCommand::Status),
            "help" | "?" => Ok(ConsoleCommand::Help),
            other => Err(ParseCommandError::Unknown(other.to_string())),
        }
    }
}

fn task_arg(command: &'static str, rest: &str) -> Result<String, ParseCommandError> {
    if rest.is_empty() {
        Err(ParseCommandError::MissingTask(command))
    } else {
        Ok(rest.to_string())
    }
}

fn id_arg(rest: &str) -> Result<Option<Uuid>, ParseCommandError> {
    if rest.is_empty() {
        return Ok(None);
    }
    Uuid::parse_str(rest)
        .map(Some)
        .map_err(|_| ParseCommandError::InvalidId(rest.to_string()))
}

fn no_args(
    command: &'static str,
    rest: &str,
    parsed: ConsoleCommand,
) -> Result<ConsoleCommand, ParseCommandError> {
    if rest.is_empty() {
        Ok(parsed)
    } else {
        Err(ParseCommandError::UnexpectedArgs(command))
    }
}

/// Prints every notification to stdout, one block per message.
#[derive(Default)]
pub struct ConsoleNotifier {
    out: Mutex<Option<tokio::io::Stdout>>,
}

impl ConsoleNotifier {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Notifier for ConsoleNotifier {
    async fn notify(&self, channel_id: &str, message: &str) -> Result<(), NotifyError> {
        let mut guard = self.out.lock().await;
        let out = guard.get_or_insert_with(tokio::io::stdout);
        let block = format!("[{channel_id}]\n{message}\n\n");
        out.write_all(block.as_bytes())
            .await
            .map_err(|e| NotifyError::Delivery(e.to_string()))?;
        out.flush()
            .await
            .map_err(|e| NotifyError::Delivery(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_task_commands() {
        assert_eq!(
            "run  summarise open PRs ".parse::<ConsoleCommand>(),
            Ok(ConsoleCommand::Run("summarise open PRs".into()))
        );
        assert_eq!(
            "AUTO tidy labels".parse::<ConsoleCommand>(),
            Ok(ConsoleCommand::Auto("tidy labels".into()))
        );
        assert_eq!(
            "run".parse::<ConsoleCommand>(),
            Err(ParseCommandError::MissingTask("run"))
        );
    }

    #[test]
    fn parses_bare_keywords() {
        assert_eq!("kill".parse::<ConsoleCommand>(), Ok(ConsoleCommand::Kill));
        assert_eq!("stop".parse::<ConsoleCommand>(), Ok(ConsoleCommand::Kill));
        assert_eq!("resume".parse::<ConsoleCommand>(), Ok(ConsoleCommand::Resume));
        assert_eq!("Status".parse::<ConsoleCommand>(), Ok(ConsoleCommand::Status));
        assert_eq!("?".parse::<ConsoleCommand>(), Ok(ConsoleCommand::Help));
        assert_eq!(
            "status now".parse::<ConsoleCommand>(),
            Err(ParseCommandError::UnexpectedArgs("status"))
        );
    }

    #[test]
    fn empty_and_unknown() {
        assert_eq!("   ".parse::<ConsoleCommand>(), Err(ParseCommandError::Empty));
        assert_eq!(
            "launch rockets".parse::<ConsoleCommand>(),
            Err(ParseCommandError::Unknown("launch".into()))
        );
    }
}
