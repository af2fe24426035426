//! Operator console
//!
//! Line-oriented stand-in for the sequence panel buttons: every typed command
//! maps to exactly one engine operation. Rejections are printed and the
//! console keeps reading; only `quit` or end of input ends it.

use strum::{Display, EnumIter, EnumString, IntoEnumIterator};
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tracing::{debug, warn};

use crate::engine::{SequenceEngine, StepSummary};
use crate::error::Result;
use crate::events::{EngineEvent, EngineSnapshot, ProgressPhase};

/// Commands understood by the console.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, EnumIter)]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum ConsoleCommand {
    Start,
    /// Toggles, like the panel's pause button
    Pause,
    Resume,
    Stop,
    #[strum(to_string = "estop", serialize = "emergency_stop")]
    EmergencyStop,
    Skip,
    Repeat,
    #[strum(to_string = "back", serialize = "previous")]
    Back,
    Restart,
    Status,
    Steps,
    Help,
    #[strum(to_string = "quit", serialize = "exit")]
    Quit,
}

impl ConsoleCommand {
    pub fn help(&self) -> &'static str {
        match self {
            Self::Start => "start the sequence from its first snippet",
            Self::Pause => "pause, or unpause when paused",
            Self::Resume => "unpause",
            Self::Stop => "stop gracefully",
            Self::EmergencyStop => "emergency stop (running only)",
            Self::Skip => "halt the current snippet and go to the next",
            Self::Repeat => "duplicate the current snippet right after itself",
            Self::Back => "halt the current snippet and go to the previous",
            Self::Restart => "restart a stopped sequence",
            Self::Status => "show state, current snippet and active constraints",
            Self::Steps => "list the snippets",
            Self::Help => "show this list",
            Self::Quit => "stop any run and exit",
        }
    }
}

/// Parse one input line. Blank lines yield `None`.
pub fn parse_command(line: &str) -> std::result::Result<Option<ConsoleCommand>, String> {
    let word = line.trim();
    if word.is_empty() {
        return Ok(None);
    }
    word.parse::<ConsoleCommand>()
        .map(Some)
        .map_err(|_| format!("unknown command '{}', type 'help'", word))
}

pub fn help_text() -> String {
    ConsoleCommand::iter()
        .map(|c| format!("  {:<8} {}", c.to_string(), c.help()))
        .collect::<Vec<_>>()
        .join("\n")
}

/// One-paragraph status as shown by `status`.
pub fn render_status(snapshot: &EngineSnapshot, steps: &[StepSummary]) -> String {
    let mut out = format!(
        "state: {} | policy: {} | steps: {}",
        snapshot.state, snapshot.policy, snapshot.step_count
    );

    if let Some(index) = snapshot.current_index {
        let name = steps
            .get(index)
            .map(|s| s.name.as_str())
            .unwrap_or("?");
        let phase = match snapshot.phase {
            ProgressPhase::Idle => "idle",
            ProgressPhase::Executing => "executing",
            ProgressPhase::AwaitingResume => "finished, waiting for resume",
            ProgressPhase::Delaying => "finished, waiting for delay",
        };
        out.push_str(&format!("\ncurrent: #{} {} ({})", index + 1, name, phase));
    }

    out.push_str(&format!(
        "\nconstraints: {} global, {} scoped active",
        snapshot.active_global.len(),
        snapshot.active_scoped.len()
    ));

    if let Some(reason) = &snapshot.last_failure {
        out.push_str(&format!("\nlast failure: {}", reason));
    }
    out
}

pub fn render_steps(steps: &[StepSummary], current: Option<usize>) -> String {
    if steps.is_empty() {
        return "(no snippets)".to_string();
    }
    steps
        .iter()
        .map(|s| {
            let marker = if Some(s.position) == current { ">" } else { " " };
            format!("{} {:>2}. {} [{}]", marker, s.position + 1, s.name, s.id)
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Human-readable line for an engine event.
pub fn render_event(event: &EngineEvent) -> String {
    match event {
        EngineEvent::StateChanged { from, to } => format!("state: {} -> {}", from, to),
        EngineEvent::StepStarted { index, name, .. } => {
            format!("snippet #{} '{}' started", index + 1, name)
        }
        EngineEvent::StepFinished { index, .. } => format!("snippet #{} finished", index + 1),
        EngineEvent::StepHalted { index, mode, .. } => {
            format!("snippet #{} halted ({})", index + 1, mode)
        }
        EngineEvent::ConstraintApplied { name, .. } => format!("constraint '{}' applied", name),
        EngineEvent::ConstraintStopped { name, .. } => format!("constraint '{}' stopped", name),
        EngineEvent::SequenceEdited { step_count } => {
            format!("sequence edited, {} snippet(s)", step_count)
        }
        EngineEvent::Failed { reason } => format!("FAILURE: {}", reason),
        EngineEvent::EmergencyStopRejected { reason } => {
            format!("emergency stop rejected: {}", reason)
        }
    }
}

/// Execute one command and return the text to print.
pub async fn execute(engine: &SequenceEngine, command: ConsoleCommand) -> Result<String> {
    debug!(%command, "Console command");
    let text = match command {
        ConsoleCommand::Start => {
            engine.start().await?;
            "started".to_string()
        }
        ConsoleCommand::Pause => {
            let state = engine.pause().await?;
            format!("now {}", state)
        }
        ConsoleCommand::Resume => {
            engine.resume().await?;
            "resumed".to_string()
        }
        ConsoleCommand::Stop => {
            engine.stop().await?;
            "stopped".to_string()
        }
        ConsoleCommand::EmergencyStop => {
            engine.emergency_stop().await?;
            "emergency stopped".to_string()
        }
        ConsoleCommand::Skip => {
            engine.skip().await?;
            "skipped".to_string()
        }
        ConsoleCommand::Repeat => {
            let id = engine.repeat().await?;
            format!("repeating as {}", id)
        }
        ConsoleCommand::Back => {
            engine.return_to_previous().await?;
            "returned to previous snippet".to_string()
        }
        ConsoleCommand::Restart => {
            engine.restart().await?;
            "restarted".to_string()
        }
        ConsoleCommand::Status => {
            let steps = engine.steps().await?;
            render_status(&engine.snapshot(), &steps)
        }
        ConsoleCommand::Steps => {
            let steps = engine.steps().await?;
            render_steps(&steps, engine.snapshot().current_index)
        }
        ConsoleCommand::Help => help_text(),
        ConsoleCommand::Quit => {
            if engine.state().is_active() {
                engine.stop().await?;
            }
            "bye".to_string()
        }
    };
    Ok(text)
}

/// Read commands from `input` until `quit` or end of input.
pub async fn run_console<R>(engine: &SequenceEngine, input: R) -> anyhow::Result<()>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = input.lines();
    println!("{}", help_text());

    while let Some(line) = lines.next_line().await? {
        let command = match parse_command(&line) {
            Ok(Some(command)) => command,
            Ok(None) => continue,
            Err(msg) => {
                println!("{}", msg);
                continue;
            }
        };

        match execute(engine, command).await {
            Ok(text) => println!("{}", text),
            Err(e) => {
                warn!(%command, error = %e, "Command rejected");
                println!("rejected: {}", e);
            }
        }

        if command == ConsoleCommand::Quit {
            return Ok(());
        }
    }

    // End of input behaves like quit
    if engine.state().is_active() {
        engine.stop().await?;
    }
    Ok(())
}
