use clap::{Parser, Subcommand};
use inputlock::{Device, EngineConfig, Session};
use std::process::ExitCode;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(name = "inputlock")]
#[command(about = "Temporarily lock the keyboard or pointer", long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Lock the keyboard. Command-Option-Escape still passes.
    Keyboard {
        /// Unlock after this many seconds
        #[arg(short, long)]
        seconds: Option<u64>,
    },
    /// Lock the pointer. Escape unlocks.
    Pointer {
        /// Unlock after this many seconds
        #[arg(short, long)]
        seconds: Option<u64>,
    },
    /// Show the accessibility permission state
    Permission {
        /// Ask the OS to prompt for the permission
        #[arg(long)]
        request: bool,
    },
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let session = match args.command {
        Command::Keyboard { seconds } => Session::Lock {
            device: Device::Keyboard,
            duration: seconds.map(Duration::from_secs),
        },
        Command::Pointer { seconds } => Session::Lock {
            device: Device::Pointer,
            duration: seconds.map(Duration::from_secs),
        },
        Command::Permission { request } => Session::Permission { request },
    };
    let config = EngineConfig::load();

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            log::error!("Failed to start runtime: {e}");
            return ExitCode::FAILURE;
        }
    };
    let local = tokio::task::LocalSet::new();
    match local.block_on(&runtime, inputlock::run(session, config)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{e}");
            ExitCode::FAILURE
        }
    }
}
