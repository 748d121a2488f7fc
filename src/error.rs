//! Error types for relay-selftest.
//!
//! This module defines the [`enum@Error`] enum for the failures that can reach a
//! caller of relay-selftest. Reachability probes themselves never surface as
//! errors: a probe that times out or is refused simply leaves the port
//! unconfirmed (see [`crate::scheduler`]). The variants below cover the
//! surrounding machinery: configuration, the Tor control connection and
//! collaborator failures reported by circuit or directory backends.
//!
//! # Error Categories
//!
//! ```text
//!   Error
//!   ├── Io                     ◄── File/socket I/O failures
//!   ├── Config                 ◄── Invalid configuration
//!   ├── Control                ◄── Tor control protocol errors (from stem-rs)
//!   ├── Probe                  ◄── Collaborator failure while probing
//!   ├── ConsensusUnavailable   ◄── No relays to route a test circuit through
//!   └── Validation             ◄── Invalid input data
//! ```
//!
//! # Recovery Guide
//!
//! | Error | Recoverable | Retry | Recommended Action |
//! |-------|-------------|-------|-------------------|
//! | [`Io`](Error::Io) | Sometimes | Yes (backoff) | Check permissions, relay address |
//! | [`Config`](Error::Config) | No | No | Fix configuration file |
//! | [`Control`](Error::Control) | Sometimes | Yes | Reconnect to Tor |
//! | [`Probe`](Error::Probe) | Yes | Next tick | None, the scheduler retries |
//! | [`ConsensusUnavailable`](Error::ConsensusUnavailable) | Yes | Yes | Wait for bootstrap |
//! | [`Validation`](Error::Validation) | No | No | Fix input data |
//!
//! # Example
//!
//! ```rust
//! use relay_selftest::{Config, Error, Result};
//!
//! fn load_config() -> Result<Config> {
//!     let config = Config::from_file(std::path::Path::new("relay-selftest.conf"))?;
//!     config.validate()?;
//!     Ok(config)
//! }
//!
//! match load_config() {
//!     Ok(_) => println!("Config loaded successfully"),
//!     Err(Error::Io(e)) => eprintln!("File error: {}", e),
//!     Err(Error::Config(msg)) => eprintln!("Config error: {}", msg),
//!     Err(e) => eprintln!("Other error: {}", e),
//! }
//! ```

use thiserror::Error;

/// Errors that can occur during relay-selftest operations.
///
/// # Check if Retryable
///
/// ```rust
/// use relay_selftest::Error;
///
/// fn is_retryable(err: &Error) -> bool {
///     matches!(err,
///         Error::Io(_) |
///         Error::Control(_) |
///         Error::Probe(_) |
///         Error::ConsensusUnavailable(_)
///     )
/// }
/// ```
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error during file or network operations.
    ///
    /// Wraps errors from reading config files, writing logs, or talking to
    /// the relay's own Dir port.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration error.
    ///
    /// Invalid configuration values or parsing failures. Not recoverable
    /// without user intervention.
    #[error("configuration error: {0}")]
    Config(String),

    /// Tor control protocol error.
    ///
    /// Wraps errors from stem-rs when communicating with the relay's
    /// control port.
    ///
    /// # Recovery
    ///
    /// - Check if the relay is running
    /// - Verify control port configuration
    /// - Retry connection with backoff
    #[error("Tor control error: {0}")]
    Control(#[from] stem_rs::Error),

    /// A collaborator failed while carrying out a probe.
    ///
    /// Circuit launch refused, circuit closed before completion, unexpected
    /// Dir port response. Probers fold this into an unsuccessful outcome;
    /// it is only visible to code calling collaborators directly.
    #[error("probe failed: {0}")]
    Probe(String),

    /// No consensus relays are available to route a test circuit through.
    ///
    /// Typically seen while the relay is still bootstrapping.
    #[error("consensus unavailable: {0}")]
    ConsensusUnavailable(String),

    /// Input validation error.
    #[error("validation error: {0}")]
    Validation(String),
}

/// Result type alias for relay-selftest operations.
pub type Result<T> = std::result::Result<T, Error>;
