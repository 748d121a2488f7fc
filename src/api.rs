//! High-level API for relay-selftest.
//!
//! [`RelaySelfTester`] is the entry point for library use: it validates a
//! [`Config`], keeps the control password in a [`SecurePassword`], and runs
//! the same reconnecting event loop as the `relay-selftest` binary.
//!
//! # Example
//!
//! ```rust,no_run
//! use relay_selftest::{Config, RelaySelfTester};
//!
//! #[tokio::main]
//! async fn main() -> relay_selftest::Result<()> {
//!     let mut config = Config::default();
//!     config.control_port = Some(9051);
//!
//!     let mut tester = RelaySelfTester::from_config(config)?;
//!     let ports = tester.relay_ports().await?;
//!     println!("Self-testing ORPort {}", ports.or_addr());
//!     tester.run().await
//! }
//! ```
//!
//! # Security
//!
//! - Passwords are cleared from memory on drop using [`zeroize`]
//! - [`SecurePassword`] never shows the password in debug output

use zeroize::Zeroize;

use crate::config::{Config, RelayPorts};
use crate::control;
use crate::error::Result;
use crate::logger::plog;
use crate::LogLevel;

/// A wrapper for sensitive password data that clears itself on drop.
///
/// - **Zeroization**: Password bytes are overwritten with zeros on drop
/// - **Debug Safety**: Debug output shows `[REDACTED]` instead of the password
///
/// ```rust
/// use relay_selftest::SecurePassword;
///
/// let password = SecurePassword::new("my_secret_password".to_string());
/// assert_eq!(password.as_str(), "my_secret_password");
///
/// let debug = format!("{:?}", password);
/// assert!(debug.contains("REDACTED"));
/// assert!(!debug.contains("my_secret"));
/// ```
#[derive(Clone)]
pub struct SecurePassword(String);

impl SecurePassword {
    /// Creates a new secure password wrapper.
    pub fn new(password: String) -> Self {
        Self(password)
    }

    /// Returns a reference to the password string.
    ///
    /// Avoid turning the reference into an owned `String`; the copy would
    /// not be zeroized.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Drop for SecurePassword {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

impl std::fmt::Debug for SecurePassword {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SecurePassword([REDACTED])")
    }
}

/// Reachability and bandwidth self-tester for one Tor relay.
///
/// # Lifecycle
///
/// ```text
/// ┌─────────────────┐
/// │  from_config()  │ ◄── Validate config, secure password
/// └────────┬────────┘
///          │
///          ▼
/// ┌─────────────────┐
/// │     run()       │ ◄── Connect, read ports, start event loop
/// └────────┬────────┘
///          │
///          ▼
/// ┌─────────────────┐
/// │  Event Loop     │ ◄── Probe, confirm, measure until shutdown
/// │  (control.rs)   │
/// └─────────────────┘
/// ```
pub struct RelaySelfTester {
    config: Config,
    password: Option<SecurePassword>,
}

impl RelaySelfTester {
    /// Creates a tester from a configuration.
    ///
    /// The control password, if any, is moved out of the configuration
    /// into a [`SecurePassword`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`](crate::Error::Config) if the configuration
    /// is invalid.
    pub fn from_config(mut config: Config) -> Result<Self> {
        config.validate()?;
        let password = config.control_pass.take().map(SecurePassword::new);
        if !config.selftest.enable_selftest {
            plog(
                LogLevel::Notice,
                "Self-testing is disabled; the relay will never be reported reachable.",
            );
        }
        Ok(Self { config, password })
    }

    /// Connects once and reads the relay's listener configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if connecting, authenticating or reading fails.
    pub async fn relay_ports(&self) -> Result<RelayPorts> {
        let mut controller =
            control::connect_and_authenticate(&self.config, self.password()).await?;
        control::read_relay_ports(&mut controller).await
    }

    /// Runs the self-test loop until Ctrl+C or the retry limit.
    ///
    /// # Errors
    ///
    /// Returns an error if no control session could ever be established.
    pub async fn run(&mut self) -> Result<()> {
        control::run_with_password(&self.config, self.password.as_ref()).await
    }

    /// The configuration in use. The control password is not included.
    pub fn config(&self) -> &Config {
        &self.config
    }

    fn password(&self) -> Option<&str> {
        self.password.as_ref().map(|p| p.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_secure_password_debug_redacted() {
        let password = SecurePassword::new("secret123".to_string());
        let debug_str = format!("{:?}", password);
        assert!(!debug_str.contains("secret123"));
        assert!(debug_str.contains("REDACTED"));
    }

    #[test]
    fn test_secure_password_as_str() {
        let password = SecurePassword::new("secret123".to_string());
        assert_eq!(password.as_str(), "secret123");
    }

    #[test]
    fn test_from_config_moves_password_out() {
        let mut config = Config::default();
        config.control_pass = Some("hunter2".to_string());

        let tester = RelaySelfTester::from_config(config).unwrap();
        assert!(tester.config().control_pass.is_none());
        assert_eq!(tester.password(), Some("hunter2"));
    }

    #[test]
    fn test_password_never_reaches_config_debug() {
        let mut config = Config::default();
        config.control_pass = Some("hunter2".to_string());
        let tester = RelaySelfTester::from_config(config).unwrap();

        assert!(!format!("{:?}", tester.config()).contains("hunter2"));
        assert!(!format!("{:?}", tester.password).contains("hunter2"));
    }

    #[test]
    fn test_from_config_rejects_invalid() {
        let mut config = Config::default();
        config.selftest.num_bandwidth_circuits = 0;
        assert!(RelaySelfTester::from_config(config).is_err());
    }
}
