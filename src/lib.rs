//! # relay-selftest
//!
//! Reachability and bandwidth self-testing for Tor relays.
//!
//! # Overview
//!
//! Before a relay advertises itself it has to know that its ORPort and
//! DirPort can be reached from the public internet. relay-selftest probes
//! both from the outside, through the relay's own protocol stack, tracks the
//! outcome per port across asynchronous and possibly failing probes, honors
//! operator overrides, and turns all of that into one "publishable" answer.
//! Once both ports are confirmed it periodically estimates the bandwidth the
//! relay can sustain.
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`reachability`] | Per-port state machine and generation counter |
//! | [`prober`] | Single-shot OR/Dir probes and their collaborator traits |
//! | [`bandwidth`] | Bandwidth test planning and measurement |
//! | [`scheduler`] | Decides when to probe; rate limits and overrides |
//! | [`reporter`] | Publishable verdict, confirmations, operator warnings |
//! | [`selftest`] | [`Selftest`] trait with real and disabled implementations |
//! | [`control`] | Tor control port binding and main event loop |
//! | [`api`] | High-level [`RelaySelfTester`] for programmatic use |
//! | [`config`] | Configuration management (TOML, CLI, environment) |
//! | [`error`] | Error types and [`Result`] alias |
//! | [`logger`] | Logging infrastructure using tracing |
//!
//! # What This Library Does NOT Do
//!
//! - **Routing**: test circuits are built by Tor; no general path selection
//! - **Directory parsing**: a Dir port answering HTTP 200 is all we check
//! - **Publishing**: the descriptor publisher only reads our verdict
//!
//! # Quick Start
//!
//! ## As a Library
//!
//! ```rust,no_run
//! use relay_selftest::{Config, RelaySelfTester};
//!
//! #[tokio::main]
//! async fn main() -> relay_selftest::Result<()> {
//!     let mut tester = RelaySelfTester::from_config(Config::default())?;
//!     tester.run().await
//! }
//! ```
//!
//! ## Driving the Engine Directly
//!
//! The engine does not care where probes run. Anything implementing
//! [`ProbeDispatcher`] can stand in for the Tor-backed one:
//!
//! ```rust
//! use relay_selftest::bandwidth::BandwidthPlan;
//! use relay_selftest::prober::{ProbeDispatcher, ProbeEvent, ProbeOutcome, ProbeTicket};
//! use relay_selftest::{RelayPorts, RelaySelftest, Selftest, SelftestConfig};
//!
//! #[derive(Default)]
//! struct Collect(Vec<ProbeTicket>);
//!
//! impl ProbeDispatcher for Collect {
//!     fn dispatch(&mut self, ticket: ProbeTicket) {
//!         self.0.push(ticket);
//!     }
//!     fn dispatch_bandwidth_test(&mut self, _plan: BandwidthPlan) {}
//! }
//!
//! let ports = RelayPorts::new("198.51.100.7".parse().unwrap(), 9001, None);
//! let mut engine = RelaySelftest::new(SelftestConfig::default(), ports, Collect::default());
//!
//! engine.tick(0.0);
//! let ticket = engine.dispatcher().0[0];
//! engine.handle_event(ProbeEvent::Finished(ticket, ProbeOutcome::Reachable), 1.0);
//! assert!(engine.publishable());
//! ```
//!
//! ## As a CLI Application
//!
//! ```bash
//! # Run with default settings
//! relay-selftest
//!
//! # Connect to a specific control port
//! relay-selftest --control-ip 127.0.0.1 --control-port 9051
//!
//! # Skip probing the DirPort
//! relay-selftest --control-socket /run/tor/control --assume-dir-reachable
//!
//! # Generate default configuration file
//! relay-selftest --generate_config relay-selftest.conf
//! ```
//!
//! # Configuration
//!
//! ```text
//! ┌─────────────────┐
//! │   CLI Arguments │ ◄── Highest priority (overrides all)
//! └────────┬────────┘
//!          │
//! ┌────────▼────────┐
//! │   Environment   │ ◄── RELAY_SELFTEST_CONFIG
//! │    Variables    │
//! └────────┬────────┘
//!          │
//! ┌────────▼────────┐
//! │   Config File   │ ◄── TOML file (default: relay-selftest.conf)
//! │     (TOML)      │
//! └────────┬────────┘
//!          │
//! ┌────────▼────────┐
//! │    Defaults     │
//! └─────────────────┘
//! ```
//!
//! See [`Config`] and [`SelftestConfig`] for all available options.
//!
//! # See Also
//!
//! - [stem-rs documentation](https://stem.tn3w.dev/docs/) - Tor control library
//! - [Tor Control Protocol Specification](https://spec.torproject.org/control-spec) - Protocol reference

#![warn(missing_docs)]
#![warn(rustdoc::broken_intra_doc_links)]

pub mod api;
pub mod bandwidth;
pub mod config;
pub mod control;
pub mod error;
pub mod logger;
pub mod prober;
pub mod reachability;
pub mod reporter;
pub mod scheduler;
pub mod selftest;

pub use api::{RelaySelfTester, SecurePassword};
pub use bandwidth::{
    BandwidthPlan, BandwidthTestResult, BandwidthTester, BandwidthVerdict, InconclusiveReason,
    CELL_MAX_NETWORK_SIZE, CIRCWINDOW_START,
};
pub use config::{CliArgs, Config, LogLevel, Overrides, RelayPorts, SelftestConfig};
pub use error::{Error, Result};
pub use prober::{
    DirFetcher, HttpDirFetcher, ProbeDispatcher, ProbeEvent, ProbeOutcome, ProbeTicket,
    SelfCircuitBuilder, TaskDispatcher, TestCircuit,
};
pub use reachability::{Confirmation, Generation, Port, PortReachability, ReachabilityState};
pub use reporter::Reporter;
pub use scheduler::ProbeScheduler;
pub use selftest::{build_selftest, DisabledSelftest, RelaySelftest, Selftest};

pub use control::{
    authenticate_any, connect_and_authenticate, control_loop, read_relay_ports, run_main,
    run_with_password, ControlCircuits, LoopExit, VERSION,
};
