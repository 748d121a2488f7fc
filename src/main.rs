//! relay-selftest CLI application entry point.
//!
//! This binary attaches to a running Tor relay's control port and keeps
//! testing whether the relay's ORPort and DirPort are reachable from the
//! outside, then measures the bandwidth the relay can sustain.
//!
//! # Startup Flow
//!
//! ```text
//!   ┌─────────────────┐
//!   │  Parse CLI Args │ ◄── clap parses command-line arguments
//!   └────────┬────────┘
//!            │
//!            ▼
//!   ┌──────────────────┐       ┌─────────────────┐
//!   │ --generate_config│────▶  │ Write default   │────▶ Exit
//!   │    specified?    │       │ config & exit   │
//!   └────────┬─────────┘       └─────────────────┘
//!            │ No
//!            ▼
//!   ┌─────────────────┐
//!   │  Load Config    │ ◄── Defaults → File → CLI → Env
//!   └────────┬────────┘
//!            │
//!            ▼
//!   ┌─────────────────┐
//!   │ Initialize      │ ◄── Set up tracing subscriber
//!   │   Logging       │
//!   └────────┬────────┘
//!            │
//!            ▼
//!   ┌─────────────────┐
//!   │ Run Main Loop   │ ◄── control::run_main()
//!   │ (control.rs)    │
//!   └─────────────────┘
//! ```
//!
//! # Usage Examples
//!
//! ```bash
//! # Run with default settings (connects to 127.0.0.1:9051)
//! relay-selftest
//!
//! # Connect via Unix socket
//! relay-selftest --control-socket /run/tor/control
//!
//! # Treat both ports as reachable without probing
//! relay-selftest --assume-reachable
//!
//! # Use four circuits for the bandwidth test
//! relay-selftest --bandwidth-circuits 4
//!
//! # Log to syslog
//! relay-selftest --logfile :syslog:
//! ```
//!
//! # Exit Codes
//!
//! | Code | Meaning |
//! |------|---------|
//! | 0 | Success |
//! | 1 | Error (see stderr for details) |
//!
//! # Environment Variables
//!
//! | Variable | Description |
//! |----------|-------------|
//! | `RELAY_SELFTEST_CONFIG` | Path to config file (equivalent to `--config`) |

use clap::Parser;
use std::process::ExitCode;

use relay_selftest::{config, control, logger, CliArgs, Config, LogLevel};

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run() -> relay_selftest::Result<()> {
    let args = CliArgs::parse();

    if let Some(ref output_path) = args.generate_config {
        let config = Config::default();
        let toml = config.to_toml()?;
        std::fs::write(output_path, toml)?;
        println!("Wrote default config to {}", output_path.display());
        return Ok(());
    }

    let config = config::load_config(&args)?;

    logger::init(config.loglevel, config.logfile.as_deref())?;

    logger::plog(
        LogLevel::Notice,
        &format!("relay-selftest {} starting", control::VERSION),
    );
    logger::plog(
        LogLevel::Debug,
        &format!("Control IP: {}", config.control_ip),
    );

    let selftest = &config.selftest;
    if !selftest.enable_selftest {
        logger::plog(LogLevel::Notice, "Self-testing disabled by configuration");
    } else {
        if selftest.assume_reachable {
            logger::plog(LogLevel::Info, "Assuming ORPort and DirPort are reachable");
        } else if selftest.assume_dir_reachable {
            logger::plog(LogLevel::Info, "Assuming DirPort is reachable");
        }
        logger::plog(
            LogLevel::Info,
            &format!(
                "Bandwidth test: {} circuits every {}s",
                selftest.num_bandwidth_circuits, selftest.bandwidth_test_interval_secs
            ),
        );
    }

    logger::plog(LogLevel::Notice, "Configuration loaded successfully");

    control::run_main(config).await
}
