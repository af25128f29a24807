//! `cryomove-cli` – cryomove Command Line Interface
//!
//! This binary drives sample transitions on a simulated cryo rig.  It:
//!
//! 1. Loads `~/.cryomove/config.toml` (or `$CRYOMOVE_CONFIG`); offers to
//!    write the default rig description when the file is absent.
//! 2. Builds the simulated stage and focus and registers them by role.
//! 3. Drops the user into an **interactive REPL** with slash-commands
//!    (`/status`, `/load`, `/image`, `/tilt`, `/stop`, `/help`).
//! 4. Intercepts **Ctrl-C** to cancel the transition in progress, and stops
//!    every actuator on exit.

mod config;
mod repl;
mod rig;

use colored::Colorize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::warn;

use cryomove_runtime::SampleMover;

fn main() {
    // ── Structured logging ────────────────────────────────────────────────
    // RUST_LOG filters (default "info"), CRYOMOVE_LOG_FORMAT=json switches to
    // JSON lines.  User-facing output still uses println!.
    let telemetry = cryomove_runtime::init_tracing("cryomove");

    print_banner();
    if telemetry.is_exporting() {
        println!("  {} spans exported over OTLP", "Tracing:".bold());
    }

    // ── Configuration ─────────────────────────────────────────────────────
    let mut cfg = match config::load() {
        Ok(None) => run_first_run_wizard(),
        Ok(Some(cfg)) => {
            println!(
                "  Config loaded from {}",
                config::config_path().display().to_string().bold()
            );
            cfg
        }
        Err(e) => {
            println!("{}: {}", "Config error".red(), e);
            println!("  Using default configuration.");
            config::Config::default()
        }
    };
    config::apply_env_overrides(&mut cfg);

    // ── Rig ───────────────────────────────────────────────────────────────
    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("cryomove-worker")
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("{}: {}", "Failed to start async runtime".red(), e);
            std::process::exit(1);
        }
    };
    let _enter = runtime.enter();

    let registry = match rig::build_registry(&cfg.rig) {
        Ok(registry) => registry,
        Err(e) => {
            eprintln!("{}: {}", "Invalid rig description".red(), e);
            std::process::exit(1);
        }
    };
    let mover = match SampleMover::from_registry(&registry, cfg.tolerances.clone()) {
        Ok(mover) => mover,
        Err(e) => {
            eprintln!("{}: {}", "Invalid rig description".red(), e);
            std::process::exit(1);
        }
    };
    println!(
        "  Rig ready: stage {} · focus {}",
        cfg.rig.stage.name.bold(),
        cfg.rig.focus.name.bold()
    );

    let shell = repl::Shell::new(runtime.handle().clone(), registry, mover, cfg);

    // ── Ctrl-C handler ────────────────────────────────────────────────────
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_clone = shutdown.clone();
    let active = shell.active_task();

    if let Err(e) = ctrlc::set_handler(move || {
        let task = active.lock().unwrap_or_else(|e| e.into_inner()).clone();
        println!();
        match task {
            Some(task) if task.cancel() => {
                println!(
                    "{}",
                    "⚠  Ctrl-C received – cancelling; the current leg finishes first …"
                        .yellow()
                        .bold()
                );
            }
            _ => {
                println!("{}", "⚠  Ctrl-C received – exiting after the prompt.".yellow().bold());
                shutdown_clone.store(true, Ordering::SeqCst);
            }
        }
    }) {
        warn!(error = %e, "Failed to install Ctrl-C handler; transitions cannot be cancelled with Ctrl-C");
    }

    println!();
    println!("  Type {} for a list of commands.\n", "/help".bold().cyan());

    // ── Interactive REPL ──────────────────────────────────────────────────
    repl::run(&shell, shutdown);

    shell.shutdown();
    println!("{}", "  ✓ Actuators stopped. Exiting cryomove.".green());
}

// ─────────────────────────────────────────────────────────────────────────────
// First-Run Wizard
// ─────────────────────────────────────────────────────────────────────────────

fn run_first_run_wizard() -> config::Config {
    println!();
    println!("{}", "  ╔══════════════════════════════════════╗".bold().cyan());
    println!("{}", "  ║      cryomove First-Run Wizard       ║".bold().cyan());
    println!("{}", "  ╚══════════════════════════════════════╝".bold().cyan());
    println!();
    println!("  No configuration found.  The default simulated rig will be used.\n");

    let mut cfg = config::Config::default();

    let timeout = prompt_line(
        &format!(
            "  Sub-move timeout in seconds [{}]: ",
            cfg.tolerances.max_submove_duration_s
        ),
        &cfg.tolerances.max_submove_duration_s.to_string(),
    );
    match timeout.trim().parse::<f64>() {
        Ok(s) if s.is_finite() && s > 0.0 => cfg.tolerances.max_submove_duration_s = s,
        _ => println!("  {} keeping the default timeout", "Warning:".yellow()),
    }

    let answer = prompt_line(
        &format!(
            "  Write this configuration to {}? [Y/n]: ",
            config::config_path().display()
        ),
        "y",
    );
    if answer.trim().eq_ignore_ascii_case("n") {
        println!("  Configuration not saved.\n");
        return cfg;
    }

    match config::save(&cfg) {
        Ok(()) => println!(
            "\n  {} Config saved to {}\n",
            "✓".green().bold(),
            config::config_path().display().to_string().bold()
        ),
        Err(e) => println!("{}: {}", "Error saving config".red(), e),
    }
    cfg
}

// ─────────────────────────────────────────────────────────────────────────────
// Banner
// ─────────────────────────────────────────────────────────────────────────────

fn print_banner() {
    println!();
    println!("  {} {}",
        "cryomove".bold().cyan(),
        format!("v{}", env!("CARGO_PKG_VERSION")).dimmed()
    );
    println!("  Cryo sample stage motion control (simulated rig)");
    println!();
}

// ─────────────────────────────────────────────────────────────────────────────
// Helpers
// ─────────────────────────────────────────────────────────────────────────────

fn prompt_line(msg: &str, default: &str) -> String {
    use std::io::{BufRead, Write};
    print!("{}", msg);
    std::io::stdout().flush().ok();
    let mut line = String::new();
    match std::io::stdin().lock().read_line(&mut line) {
        Ok(_) => {
            let t = line.trim().to_string();
            if t.is_empty() { default.to_string() } else { t }
        }
        Err(_) => default.to_string(),
    }
}
