//! REPL – Read-Eval-Print Loop for the cryomove interactive shell.
//!
//! Supported slash-commands:
//!   /help             – show this list
//!   /status           – positions of stage and focus, loading progress
//!   /load             – move the sample to the loading position
//!   /image            – move the sample to the imaging position
//!   /tilt <rx> [rz]   – tilt the stage (radians)
//!   /stop             – stop every actuator
//!   /config           – show the configuration in use
//!   /save             – write the configuration in use to disk
//!   /quit | /exit     – gracefully exit the CLI
//!
//! Transitions block the prompt until they finish; Ctrl-C cancels the one
//! in progress.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use colored::Colorize;
use cryomove_hal::{Actuator, HardwareRegistry, MoveTask};
use cryomove_runtime::{LoadTarget, SampleMover};
use cryomove_types::{AxisDescriptor, MoveError, Position};
use rustyline::DefaultEditor;
use rustyline::error::ReadlineError;
use tokio::runtime::Handle;
use tracing::warn;

use crate::config::{self, Config};

/// The transition currently blocking the prompt, shared with the Ctrl-C
/// handler.
pub type ActiveTask = Arc<Mutex<Option<MoveTask>>>;

/// A parsed shell command.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Help,
    Status,
    Load,
    Image,
    Tilt { rx: f64, rz: Option<f64> },
    Stop,
    Config,
    Save,
    Quit,
}

/// Parse one input line.
///
/// # Errors
///
/// A user-facing message for unknown commands and malformed arguments.
pub fn parse_command(line: &str) -> Result<Command, String> {
    let mut words = line.split_whitespace();
    let Some(head) = words.next() else {
        return Err("empty command".to_string());
    };
    let args: Vec<&str> = words.collect();

    let no_args = |cmd: Command| {
        if args.is_empty() {
            Ok(cmd)
        } else {
            Err(format!("{head} takes no arguments"))
        }
    };

    match head {
        "/help" => no_args(Command::Help),
        "/status" => no_args(Command::Status),
        "/load" => no_args(Command::Load),
        "/image" => no_args(Command::Image),
        "/stop" => no_args(Command::Stop),
        "/config" => no_args(Command::Config),
        "/save" => no_args(Command::Save),
        "/quit" | "/exit" => no_args(Command::Quit),
        "/tilt" => {
            let angle = |s: &str| {
                s.parse::<f64>()
                    .ok()
                    .filter(|v| v.is_finite())
                    .ok_or_else(|| format!("'{s}' is not an angle in radians"))
            };
            match args.as_slice() {
                [rx] => Ok(Command::Tilt {
                    rx: angle(*rx)?,
                    rz: None,
                }),
                [rx, rz] => Ok(Command::Tilt {
                    rx: angle(*rx)?,
                    rz: Some(angle(*rz)?),
                }),
                _ => Err("usage: /tilt <rx> [rz]".to_string()),
            }
        }
        other => Err(format!("Unknown command: '{other}'")),
    }
}

/// `axis=value unit` pairs in axis order.
pub fn format_position(pos: &Position, axes: &BTreeMap<String, AxisDescriptor>) -> String {
    pos.iter()
        .map(|(axis, value)| {
            let unit = axes
                .get(axis)
                .and_then(|d| d.unit.as_deref())
                .unwrap_or("");
            format!("{axis}={value:.6} {unit}").trim_end().to_string()
        })
        .collect::<Vec<_>>()
        .join(", ")
}

// ─────────────────────────────────────────────────────────────────────────────
// Shell
// ─────────────────────────────────────────────────────────────────────────────

/// Everything the command handlers act on.
pub struct Shell {
    runtime: Handle,
    registry: HardwareRegistry,
    mover: SampleMover,
    config: Config,
    active: ActiveTask,
}

impl Shell {
    pub fn new(runtime: Handle, registry: HardwareRegistry, mover: SampleMover, config: Config) -> Self {
        Self {
            runtime,
            registry,
            mover,
            config,
            active: Arc::new(Mutex::new(None)),
        }
    }

    /// Handle for the Ctrl-C handler.
    pub fn active_task(&self) -> ActiveTask {
        Arc::clone(&self.active)
    }

    /// Stop every actuator; called on exit.
    pub fn shutdown(&self) {
        self.runtime
            .block_on(self.registry.stop_all(self.config.tolerances.stop_timeout()));
    }

    /// Execute `cmd`.  Returns `false` when the shell should exit.
    fn execute(&self, cmd: Command) -> bool {
        match cmd {
            Command::Help => cmd_help(),
            Command::Status => self.cmd_status(),
            Command::Load => self.run_transition(self.mover.load_sample(LoadTarget::Loading)),
            Command::Image => self.run_transition(self.mover.load_sample(LoadTarget::Imaging)),
            Command::Tilt { rx, rz } => self.run_transition(self.mover.tilt_sample(rx, rz)),
            Command::Stop => {
                self.shutdown();
                println!("{}", "✓ All actuators stopped.".green());
            }
            Command::Config => self.cmd_config(),
            Command::Save => match config::save(&self.config) {
                Ok(()) => println!(
                    "{} {}",
                    "✓ Configuration saved to".green(),
                    config::config_path().display().to_string().bold()
                ),
                Err(e) => println!("{}: {}", "Error saving config".red(), e),
            },
            Command::Quit => {
                println!("{}", "Goodbye.".green());
                return false;
            }
        }
        true
    }

    fn run_transition(&self, task: MoveTask) {
        println!(
            "  {} {} {}",
            "▶".cyan(),
            task.label().bold(),
            "(Ctrl-C cancels)".dimmed()
        );
        *self.lock_active() = Some(task.clone());
        let result = self.runtime.block_on(task.wait());
        self.lock_active().take();

        match result {
            Ok(()) => println!("  {} {}", "✓".green().bold(), "done".green()),
            Err(MoveError::Cancelled) => println!(
                "  {} {}",
                "⚠".yellow().bold(),
                "cancelled; remaining legs skipped".yellow()
            ),
            Err(e) => println!("  {} {}", "✗".red().bold(), e.to_string().red()),
        }
        self.cmd_status();
    }

    fn cmd_status(&self) {
        for actuator in [self.mover.stage(), self.mover.focus()] {
            println!(
                "  {:<14} {}",
                actuator.name().bold(),
                format_position(&actuator.position().get(), actuator.axes())
            );
        }
        match self.mover.current_progress() {
            Ok(Some(p)) => println!(
                "  {:<14} {:.0} % towards loading",
                "progress".bold(),
                p * 100.0
            ),
            Ok(None) => println!("  {:<14} {}", "progress".bold(), "off the loading path".yellow()),
            Err(e) => println!("  {:<14} {}", "progress".bold(), e.to_string().red()),
        }
    }

    fn cmd_config(&self) {
        println!("{}", "Configuration".bold().underline());
        println!("  File : {}", config::config_path().display().to_string().bold());
        println!(
            "  Rig  : stage '{}', focus '{}'",
            self.config.rig.stage.name.yellow(),
            self.config.rig.focus.name.yellow()
        );
        match toml::to_string_pretty(&self.config.tolerances) {
            Ok(raw) => {
                println!("  [tolerances]");
                for line in raw.lines() {
                    println!("    {line}");
                }
            }
            Err(e) => println!("{}: {}", "Error formatting tolerances".red(), e),
        }
    }

    fn lock_active(&self) -> MutexGuard<'_, Option<MoveTask>> {
        self.active.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Entry point for the interactive REPL.
///
/// `shutdown` is polled each iteration; when set the REPL exits cleanly.
pub fn run(shell: &Shell, shutdown: Arc<AtomicBool>) {
    let mut editor = match DefaultEditor::new() {
        Ok(editor) => editor,
        Err(e) => {
            eprintln!("{}: {}", "Terminal error".red(), e);
            return;
        }
    };

    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }

        let prompt = format!("{} ", "cryomove>".bold().cyan());
        let line = match editor.readline(&prompt) {
            Ok(line) => line,
            Err(ReadlineError::Interrupted) => {
                println!("  Type {} to exit.", "/quit".bold());
                continue;
            }
            Err(ReadlineError::Eof) => break,
            Err(e) => {
                eprintln!("{}: {}", "Read error".red(), e);
                break;
            }
        };

        let cmd = line.trim();
        if cmd.is_empty() {
            continue;
        }
        if let Err(e) = editor.add_history_entry(cmd) {
            warn!(error = %e, "could not record history entry");
        }

        match parse_command(cmd) {
            Ok(command) => {
                if !shell.execute(command) {
                    shutdown.store(true, Ordering::SeqCst);
                    break;
                }
            }
            Err(msg) => println!(
                "{} Type {} for available commands.",
                msg.red(),
                "/help".bold()
            ),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Command handlers
// ─────────────────────────────────────────────────────────────────────────────

fn cmd_help() {
    println!();
    println!("{}", "cryomove Commands".bold().underline());
    println!("  {}           – positions and loading progress", "/status".bold().cyan());
    println!("  {}             – move to the loading position", "/load".bold().cyan());
    println!("  {}            – move to the imaging position", "/image".bold().cyan());
    println!("  {}   – tilt the stage (radians)", "/tilt <rx> [rz]".bold().cyan());
    println!("  {}             – stop every actuator", "/stop".bold().cyan());
    println!("  {}           – show the configuration in use", "/config".bold().cyan());
    println!("  {}             – write the configuration to disk", "/save".bold().cyan());
    println!("  {}     – exit the CLI", "/quit  /exit".bold().cyan());
    println!();
}

#[cfg(test)]
mod tests {
    use super::*;
    use cryomove_types::position;

    #[test]
    fn parses_plain_commands() {
        assert_eq!(parse_command("/load"), Ok(Command::Load));
        assert_eq!(parse_command("  /image  "), Ok(Command::Image));
        assert_eq!(parse_command("/exit"), Ok(Command::Quit));
        assert!(parse_command("/load now").is_err());
        assert!(parse_command("/dance").unwrap_err().contains("/dance"));
        assert!(parse_command("   ").is_err());
    }

    #[test]
    fn parses_tilt_arguments() {
        assert_eq!(
            parse_command("/tilt 0.3"),
            Ok(Command::Tilt { rx: 0.3, rz: None })
        );
        assert_eq!(
            parse_command("/tilt 0 0"),
            Ok(Command::Tilt {
                rx: 0.0,
                rz: Some(0.0)
            })
        );
        assert!(parse_command("/tilt").is_err());
        assert!(parse_command("/tilt abc").is_err());
        assert!(parse_command("/tilt nan").is_err());
        assert!(parse_command("/tilt 1 2 3").is_err());
    }

    #[test]
    fn position_formatting_includes_units() {
        let axes = BTreeMap::from([
            ("x".to_string(), AxisDescriptor::range(-1.0, 1.0).with_unit("m")),
            ("rx".to_string(), AxisDescriptor::range(-1.0, 1.0)),
        ]);
        let text = format_position(&position([("x", 0.01), ("rx", 0.25)]), &axes);
        assert_eq!(text, "rx=0.250000, x=0.010000 m");
    }
}
