//! breakerctl - direct Modbus TCP control of a single rack breaker
//!
//! Talks to the device without going through devsrv or its configuration.

use std::process::ExitCode;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use colored::*;
use common::logging::{self, LogConfig};
use devsrv::devices::{
    ActionOutcome, BreakerModel, BreakerStatus, BreakerTiming, ControlWord, LockControlBreaker,
    SwitchControlBreaker,
};
use devsrv::protocols::modbus::constants::{BREAKER_CONTROL_REGISTER, BREAKER_STATUS_INPUT};
use devsrv::protocols::modbus::{ModbusSession, RegisterClient};
use devsrv::{DevSrvError, Result};
use errors::FacilityError;
use tracing::debug;

#[derive(Parser)]
#[command(name = "breakerctl")]
#[command(about = "Control and inspect a Modbus TCP rack breaker")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Disable colored output
    #[arg(long, global = true)]
    no_color: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the breaker state
    Status(Target),
    /// Close the breaker (switch model only)
    Close(Target),
    /// Open the breaker (switch model only)
    Open(Target),
    /// Engage the remote lock
    Lock(Target),
    /// Release the remote lock
    Unlock(Target),
    /// Read-only register dump decoded for both models
    Test(Target),
}

#[derive(Args, Debug, Clone)]
struct Target {
    /// Breaker IP address
    ip: String,

    /// Modbus TCP port
    port: u16,

    /// Modbus unit id
    #[arg(short, long, default_value_t = 1)]
    unit: u8,

    /// Breaker model: switch or lock
    #[arg(short, long, default_value = "switch")]
    model: BreakerModel,

    /// Connect and per-request timeout in milliseconds
    #[arg(short, long = "timeout-ms", default_value_t = 5000)]
    timeout_ms: u64,
}

impl Target {
    async fn connect(&self) -> Result<ModbusSession> {
        debug!(
            "Connecting to {}:{} unit {} ({})",
            self.ip, self.port, self.unit, self.model
        );
        ModbusSession::connect_to(
            &self.ip,
            self.port,
            self.unit,
            Duration::from_millis(self.timeout_ms),
        )
        .await
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if cli.no_color {
        colored::control::set_override(false);
    }
    let level = if cli.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::WARN
    };
    let mut log_config = LogConfig::console("breakerctl", level);
    log_config.no_color = cli.no_color;
    if let Err(e) = logging::init_with_config(log_config) {
        eprintln!("{} failed to initialize logging: {}", "WARN".yellow(), e);
    }

    match run(cli.command).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            let err = FacilityError::from(e);
            eprintln!("{} {}", "✗".bright_red(), err);
            ExitCode::from(err.exit_code() as u8)
        },
    }
}

async fn run(command: Commands) -> Result<()> {
    let timing = BreakerTiming::default();

    match command {
        Commands::Status(target) => {
            let mut session = target.connect().await?;
            match target.model {
                BreakerModel::SwitchControl => {
                    let status = SwitchControlBreaker::new(&mut session, timing)
                        .read_status()
                        .await?;
                    print_switch_status(&status);
                },
                BreakerModel::LockControl => {
                    let word = LockControlBreaker::new(&mut session, timing)
                        .read_status()
                        .await?;
                    print_control_word(word);
                },
            }
        },
        Commands::Close(target) => {
            require_switch(&target, "close")?;
            let mut session = target.connect().await?;
            let outcome = SwitchControlBreaker::new(&mut session, timing)
                .close()
                .await?;
            report("close", outcome);
        },
        Commands::Open(target) => {
            require_switch(&target, "open")?;
            let mut session = target.connect().await?;
            let outcome = SwitchControlBreaker::new(&mut session, timing)
                .open()
                .await?;
            report("open", outcome);
        },
        Commands::Lock(target) => {
            let mut session = target.connect().await?;
            let outcome = match target.model {
                BreakerModel::LockControl => {
                    LockControlBreaker::new(&mut session, timing).lock().await?
                },
                BreakerModel::SwitchControl => {
                    SwitchControlBreaker::new(&mut session, timing)
                        .lock()
                        .await?;
                    ActionOutcome::Applied
                },
            };
            report("lock", outcome);
        },
        Commands::Unlock(target) => {
            let mut session = target.connect().await?;
            let outcome = match target.model {
                BreakerModel::LockControl => {
                    LockControlBreaker::new(&mut session, timing)
                        .unlock()
                        .await?
                },
                BreakerModel::SwitchControl => {
                    SwitchControlBreaker::new(&mut session, timing)
                        .unlock()
                        .await?;
                    ActionOutcome::Applied
                },
            };
            report("unlock", outcome);
        },
        Commands::Test(target) => {
            let mut session = target.connect().await?;
            dump_registers(&mut session, &target).await?;
        },
    }
    Ok(())
}

fn require_switch(target: &Target, action: &str) -> Result<()> {
    if target.model != BreakerModel::SwitchControl {
        return Err(DevSrvError::validation(format!(
            "{action} needs a switch-control breaker (--model switch)"
        )));
    }
    Ok(())
}

fn report(action: &str, outcome: ActionOutcome) {
    match outcome {
        ActionOutcome::Applied => println!("{} {} applied", "✓".bright_green(), action),
        ActionOutcome::AlreadyInState => {
            println!("{} already in requested state, nothing written", "•".bright_cyan())
        },
    }
}

fn on_off(value: bool, on: &str, off: &str) -> ColoredString {
    if value {
        on.bright_yellow()
    } else {
        off.bright_green()
    }
}

fn print_switch_status(status: &BreakerStatus) {
    println!("{}", "Switch-control breaker".bright_blue().bold());
    println!(
        "  Switch:       {}",
        if status.closed {
            "CLOSED".bright_green()
        } else {
            "OPEN".bright_red()
        }
    );
    println!(
        "  Local lock:   {}",
        on_off(status.local_locked, "engaged", "released")
    );
    println!(
        "  Remote lock:  {}",
        on_off(status.remote_locked, "engaged", "released")
    );
    println!("  Raw status:   0x{:04X}", status.raw_status);
    println!("  Control bits: 0x{:04X}", status.control_bits);
}

fn print_control_word(word: ControlWord) {
    println!("{}", "Lock-control breaker".bright_blue().bold());
    println!(
        "  Mode:         {}",
        if word.auto_mode() { "auto" } else { "manual" }
    );
    println!(
        "  Remote lock:  {}",
        on_off(word.remote_locked(), "engaged", "released")
    );
    println!("  Control bits: 0x{:04X}", word.bits());
}

/// Read both model layouts without writing anything
async fn dump_registers(client: &mut dyn RegisterClient, target: &Target) -> Result<()> {
    println!(
        "{} {}:{} unit {}",
        "Register dump".bright_blue().bold(),
        target.ip,
        target.port,
        target.unit
    );

    let control = match client.read_holding(BREAKER_CONTROL_REGISTER).await {
        Ok(bits) => {
            println!("  Holding 0x{:04X}: 0x{:04X}", BREAKER_CONTROL_REGISTER, bits);
            Some(bits)
        },
        Err(e) => {
            println!(
                "  Holding 0x{:04X}: {} ({})",
                BREAKER_CONTROL_REGISTER,
                "unreadable".bright_red(),
                e
            );
            None
        },
    };

    let raw_status = match client.read_input(BREAKER_STATUS_INPUT).await {
        Ok(raw) => {
            println!("  Input   0x{:04X}: 0x{:04X}", BREAKER_STATUS_INPUT, raw);
            Some(raw)
        },
        Err(e) => {
            println!(
                "  Input   0x{:04X}: {} ({})",
                BREAKER_STATUS_INPUT,
                "unreadable".bright_red(),
                e
            );
            None
        },
    };

    println!();
    if let Some(bits) = control {
        print_control_word(ControlWord(bits));
        if let Some(raw) = raw_status {
            println!();
            print_switch_status(&BreakerStatus::decode(raw, bits));
        }
    }

    if control.is_none() && raw_status.is_none() {
        return Err(DevSrvError::protocol("no breaker registers readable"));
    }
    Ok(())
}
