//! Headless pump runner: list serial ports or run a saved step program.

use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use crossbeam_channel::{unbounded, RecvTimeoutError};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use pumpdriver::config_loader;
use pumpdriver::executor::{self, ExecutorEvent, StepExecutor};
use pumpdriver::pump_connection::{self, ChemyxConnection, PumpConnection};
use pumpdriver::steps;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[arg(long, global = true)]
    debug: bool,
    /// Config file (defaults to PUMPDRIVER_CONFIG or chemyx_config.json)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List available serial ports
    Ports,
    /// Connect using the config and run a program file to completion
    Run {
        program: PathBuf,
        /// Override the configured serial port
        #[arg(long)]
        port: Option<String>,
    },
}

fn list_ports() -> Result<()> {
    let ports = pump_connection::get_open_ports()?;
    if ports.is_empty() {
        println!("No serial ports found");
    }
    for port in ports {
        println!("{}", port);
    }
    Ok(())
}

fn run_program(config_path: PathBuf, program: PathBuf, port: Option<String>) -> Result<()> {
    let mut config = config_loader::load_config(&config_path)?;
    if let Some(port) = port {
        config.port = port;
    }

    let program_steps = steps::load_program(&program)?;
    if program_steps.is_empty() {
        return Err(anyhow!("Program {:?} has no steps", program));
    }
    for (i, step) in program_steps.iter().enumerate() {
        if let Err(e) = step.validate() {
            log::warn!("Step {}: {}", i + 1, e);
        }
    }

    let mut raw = ChemyxConnection::new(config.port.clone(), config.baudrate);
    raw.open_connection()?;
    println!("✓ Connected to {} @{}", config.port, config.baudrate);
    let connection = executor::shared(raw);

    let interrupted = Arc::new(AtomicBool::new(false));
    {
        let flag = Arc::clone(&interrupted);
        ctrlc::set_handler(move || flag.store(true, Ordering::SeqCst))
            .map_err(|e| anyhow!("Failed to install Ctrl-C handler: {}", e))?;
    }

    let total = program_steps.len();
    let (tx, rx) = unbounded();
    let mut handle = StepExecutor::new(program_steps.clone(), Arc::clone(&connection), config, tx).spawn()?;

    let mut failed = false;
    let mut stop_sent = false;
    loop {
        if interrupted.load(Ordering::SeqCst) && !stop_sent {
            println!("Stopping after current step...");
            handle.stop();
            stop_sent = true;
        }
        match rx.recv_timeout(Duration::from_millis(100)) {
            Ok(ExecutorEvent::StepChanged(index)) => {
                let step = &program_steps[index];
                println!("Step {}/{}: {} {}", index + 1, total, step.function, step.describe());
            }
            Ok(ExecutorEvent::Error(message)) => {
                eprintln!("✗ {}", message);
                failed = true;
            }
            Ok(ExecutorEvent::Finished) => break,
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    handle.join()?;

    if let Ok(mut pump) = connection.lock() {
        if let Err(e) = pump.close_connection() {
            log::warn!("Error closing connection: {:#}", e);
        }
    }

    if failed {
        return Err(anyhow!("Program stopped on error"));
    }
    if stop_sent {
        println!("Program stopped");
    } else {
        println!("✓ Program complete ({} steps)", total);
    }
    Ok(())
}

fn main() -> Result<()> {
    let args = Args::parse();
    let level = if args.debug { log::LevelFilter::Debug } else { log::LevelFilter::Info };
    env_logger::Builder::from_default_env().filter_level(level).init();

    let config_path = args.config.unwrap_or_else(config_loader::config_path);
    match args.command {
        Command::Ports => list_ports(),
        Command::Run { program, port } => run_program(config_path, program, port),
    }
}
