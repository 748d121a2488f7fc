//! Configuration management for relay-selftest.
//!
//! Configuration is parsed from a TOML file, command-line arguments and
//! environment variables, applied in order: defaults → config file →
//! environment → command-line arguments, with later sources overriding
//! earlier ones.
//!
//! # Configuration Flow
//!
//! ```text
//!     ┌─────────────────┐
//!     │ Config::default │ ◄── Start with sensible defaults
//!     └────────┬────────┘
//!              │
//!              ▼
//!     ┌─────────────────┐     ┌──────────────────────┐
//!     │ Config file     │ ◄───│ relay-selftest.conf  │  (TOML format)
//!     │ exists?         │     │ or --config          │
//!     └────────┬────────┘     └──────────────────────┘
//!              │
//!              ▼
//!     ┌─────────────────┐     ┌─────────────────────┐
//!     │ Apply CLI args  │ ◄───│ --control-port,     │
//!     │ (override)      │     │ --assume-reachable  │
//!     └────────┬────────┘     └─────────────────────┘
//!              │
//!              ▼
//!     ┌─────────────────┐
//!     │ Validate &      │
//!     │ resolve hosts   │
//!     └─────────────────┘
//! ```
//!
//! # Example Configuration File
//!
//! ```toml
//! control_ip = "127.0.0.1"
//! control_port = 9051
//! # control_socket = "/run/tor/control"
//!
//! loglevel = "notice"
//! # logfile = ":syslog:"
//!
//! [selftest]
//! enable_selftest = true
//! assume_reachable = false
//! assume_dir_reachable = false
//! check_interval_secs = 10
//! min_probe_interval_secs = 20
//! or_probe_timeout_secs = 60
//! dir_probe_timeout_secs = 30
//! unreachable_complaint_secs = 1200
//! bandwidth_rate = 1073741824
//! num_bandwidth_circuits = 4
//! min_bandwidth_circuits = 1
//! bandwidth_test_secs = 30
//! bandwidth_test_interval_secs = 43200
//! ```
//!
//! The relay's own ports are not configured here: they are read from the
//! running relay at connect time and carried around as a [`RelayPorts`]
//! snapshot.

use clap::Parser;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr, ToSocketAddrs};
use std::path::PathBuf;
use std::time::Duration;

use crate::bandwidth::cell_budget;
use crate::error::{Error, Result};

/// Log level for relay-selftest output.
///
/// Mirrors Tor's own severities. From most to least verbose:
/// [`Debug`](LogLevel::Debug) > [`Info`](LogLevel::Info) > [`Notice`](LogLevel::Notice) >
/// [`Warn`](LogLevel::Warn) > [`Error`](LogLevel::Error)
///
/// ```rust
/// use relay_selftest::LogLevel;
///
/// let level = LogLevel::Notice;
/// assert!(level < LogLevel::Warn);
/// ```
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Low-level debugging information.
    Debug,
    /// Informational messages about normal operation.
    Info,
    /// Notable events that may be of interest.
    #[default]
    Notice,
    /// Warning conditions that don't prevent operation.
    Warn,
    /// Error conditions that may impair functionality.
    Error,
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogLevel::Debug => write!(f, "DEBUG"),
            LogLevel::Info => write!(f, "INFO"),
            LogLevel::Notice => write!(f, "NOTICE"),
            LogLevel::Warn => write!(f, "WARN"),
            LogLevel::Error => write!(f, "ERROR"),
        }
    }
}

impl std::str::FromStr for LogLevel {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_uppercase().as_str() {
            "DEBUG" => Ok(LogLevel::Debug),
            "INFO" => Ok(LogLevel::Info),
            "NOTICE" => Ok(LogLevel::Notice),
            "WARN" | "WARNING" => Ok(LogLevel::Warn),
            "ERROR" | "ERR" => Ok(LogLevel::Error),
            _ => Err(Error::Config(format!("invalid log level: {}", s))),
        }
    }
}

/// Self-test tuning knobs.
///
/// # Fields
///
/// | Field | Default | Description |
/// |-------|---------|-------------|
/// | `enable_selftest` | true | Run the real self-test engine (false = disabled stand-in) |
/// | `assume_reachable` | false | Skip probing, treat both ports as reachable |
/// | `assume_dir_reachable` | false | Skip probing the Dir port only |
/// | `check_interval_secs` | 10 | Scheduler tick period |
/// | `min_probe_interval_secs` | 20 | Minimum gap between two probes of one port |
/// | `or_probe_timeout_secs` | 60 | Bound on waiting for a self-routed circuit |
/// | `dir_probe_timeout_secs` | 30 | Bound on the Dir port fetch |
/// | `unreachable_complaint_secs` | 1200 | Warn once if still unconfirmed after this long |
/// | `bandwidth_rate` | 1 GiB/s | Advertised rate; caps the cells sent by a bandwidth test |
/// | `num_bandwidth_circuits` | 4 | Circuits built per bandwidth test |
/// | `min_bandwidth_circuits` | 1 | Below this many built circuits the test is inconclusive |
/// | `bandwidth_test_secs` | 30 | Bound on one bandwidth test |
/// | `bandwidth_test_interval_secs` | 43200 | Repeat the bandwidth test this often once reachable |
///
/// # Example
///
/// ```rust
/// use relay_selftest::SelftestConfig;
///
/// let mut config = SelftestConfig::default();
/// config.num_bandwidth_circuits = 8;
/// config.min_bandwidth_circuits = 2;
/// assert_eq!(config.min_probe_interval().as_secs(), 20);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SelftestConfig {
    /// Run the real self-test engine.
    #[serde(default = "default_enable_selftest")]
    pub enable_selftest: bool,
    /// Treat both ports as reachable without probing.
    #[serde(default)]
    pub assume_reachable: bool,
    /// Treat the Dir port as reachable without probing.
    #[serde(default)]
    pub assume_dir_reachable: bool,
    /// Scheduler tick period in seconds.
    #[serde(default = "default_check_interval_secs")]
    pub check_interval_secs: u64,
    /// Minimum seconds between two probes of the same port.
    #[serde(default = "default_min_probe_interval_secs")]
    pub min_probe_interval_secs: u64,
    /// Seconds to wait for a self-routed circuit to complete.
    #[serde(default = "default_or_probe_timeout_secs")]
    pub or_probe_timeout_secs: u64,
    /// Seconds to wait for the Dir port fetch.
    #[serde(default = "default_dir_probe_timeout_secs")]
    pub dir_probe_timeout_secs: u64,
    /// Seconds of unconfirmed testing before warning the operator.
    #[serde(default = "default_unreachable_complaint_secs")]
    pub unreachable_complaint_secs: u64,
    /// Advertised bandwidth rate in bytes per second.
    #[serde(default = "default_bandwidth_rate")]
    pub bandwidth_rate: u64,
    /// Circuits built per bandwidth test.
    #[serde(default = "default_num_bandwidth_circuits")]
    pub num_bandwidth_circuits: u32,
    /// Minimum built circuits for a conclusive bandwidth test.
    #[serde(default = "default_min_bandwidth_circuits")]
    pub min_bandwidth_circuits: u32,
    /// Bound on one bandwidth test in seconds.
    #[serde(default = "default_bandwidth_test_secs")]
    pub bandwidth_test_secs: u64,
    /// Seconds between bandwidth tests once both ports are confirmed.
    #[serde(default = "default_bandwidth_test_interval_secs")]
    pub bandwidth_test_interval_secs: u64,
}

fn default_enable_selftest() -> bool {
    true
}
fn default_check_interval_secs() -> u64 {
    10
}
fn default_min_probe_interval_secs() -> u64 {
    20
}
fn default_or_probe_timeout_secs() -> u64 {
    60
}
fn default_dir_probe_timeout_secs() -> u64 {
    30
}
fn default_unreachable_complaint_secs() -> u64 {
    20 * 60
}
fn default_bandwidth_rate() -> u64 {
    1 << 30
}
fn default_num_bandwidth_circuits() -> u32 {
    4
}
fn default_min_bandwidth_circuits() -> u32 {
    1
}
fn default_bandwidth_test_secs() -> u64 {
    30
}
fn default_bandwidth_test_interval_secs() -> u64 {
    12 * 60 * 60
}

impl Default for SelftestConfig {
    fn default() -> Self {
        Self {
            enable_selftest: default_enable_selftest(),
            assume_reachable: false,
            assume_dir_reachable: false,
            check_interval_secs: default_check_interval_secs(),
            min_probe_interval_secs: default_min_probe_interval_secs(),
            or_probe_timeout_secs: default_or_probe_timeout_secs(),
            dir_probe_timeout_secs: default_dir_probe_timeout_secs(),
            unreachable_complaint_secs: default_unreachable_complaint_secs(),
            bandwidth_rate: default_bandwidth_rate(),
            num_bandwidth_circuits: default_num_bandwidth_circuits(),
            min_bandwidth_circuits: default_min_bandwidth_circuits(),
            bandwidth_test_secs: default_bandwidth_test_secs(),
            bandwidth_test_interval_secs: default_bandwidth_test_interval_secs(),
        }
    }
}

impl SelftestConfig {
    /// Scheduler tick period.
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs)
    }

    /// Minimum gap between two probes of one port.
    pub fn min_probe_interval(&self) -> Duration {
        Duration::from_secs(self.min_probe_interval_secs)
    }

    /// Bound on an OR port probe.
    pub fn or_probe_timeout(&self) -> Duration {
        Duration::from_secs(self.or_probe_timeout_secs)
    }

    /// Bound on a Dir port probe.
    pub fn dir_probe_timeout(&self) -> Duration {
        Duration::from_secs(self.dir_probe_timeout_secs)
    }

    /// Bound on one bandwidth test.
    pub fn bandwidth_test_duration(&self) -> Duration {
        Duration::from_secs(self.bandwidth_test_secs)
    }
}

/// Snapshot of the relay's listening configuration.
///
/// Produced by the configuration provider (the relay's control port in the
/// daemon, a literal in tests). A change of `or_port` or `dir_port` between
/// two snapshots means accumulated reachability results no longer apply.
///
/// ```rust
/// use relay_selftest::{RelayPorts, SelftestConfig};
///
/// let ports = RelayPorts::new("198.51.100.7".parse().unwrap(), 9001, Some(9030));
/// let overrides = ports.overrides(&SelftestConfig::default());
/// assert!(!overrides.or && !overrides.dir);
///
/// let no_dir = RelayPorts::new("198.51.100.7".parse().unwrap(), 9001, None);
/// assert!(no_dir.overrides(&SelftestConfig::default()).dir);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayPorts {
    /// Advertised IP address of the relay.
    pub address: IpAddr,
    /// Configured OR port.
    pub or_port: u16,
    /// Configured Dir port, if the relay serves directory documents on one.
    pub dir_port: Option<u16>,
    /// Relay identity fingerprint (40 hex characters), empty if unknown.
    pub fingerprint: String,
    /// Whether the relay's own torrc sets `AssumeReachable 1`.
    pub assume_reachable: bool,
}

/// Effective assume-reachable overrides for the two ports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Overrides {
    /// Skip probing the OR port.
    pub or: bool,
    /// Skip probing the Dir port.
    pub dir: bool,
}

impl RelayPorts {
    /// Creates a snapshot with no fingerprint and no torrc override.
    pub fn new(address: IpAddr, or_port: u16, dir_port: Option<u16>) -> Self {
        Self {
            address,
            or_port,
            dir_port,
            fingerprint: String::new(),
            assume_reachable: false,
        }
    }

    /// Socket address of the OR port.
    pub fn or_addr(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.or_port)
    }

    /// Socket address of the Dir port, if one is configured.
    pub fn dir_addr(&self) -> Option<SocketAddr> {
        self.dir_port.map(|port| SocketAddr::new(self.address, port))
    }

    /// Combines operator overrides from our config and the relay's torrc.
    ///
    /// A relay without a Dir port has nothing to probe there, so the Dir
    /// side counts as overridden.
    pub fn overrides(&self, config: &SelftestConfig) -> Overrides {
        let assume_all = config.assume_reachable || self.assume_reachable;
        Overrides {
            or: assume_all,
            dir: assume_all || config.assume_dir_reachable || self.dir_port.is_none(),
        }
    }

    /// Whether going from `self` to `other` invalidates reachability results.
    pub fn listeners_changed(&self, other: &RelayPorts) -> bool {
        self.address != other.address
            || self.or_port != other.or_port
            || self.dir_port != other.dir_port
    }
}

/// Main configuration struct for relay-selftest.
///
/// # Fields Overview
///
/// | Field | Type | Default | Description |
/// |-------|------|---------|-------------|
/// | `control_ip` | `String` | `"127.0.0.1"` | Relay control port IP address |
/// | `control_port` | `Option<u16>` | `None` | Relay control port number |
/// | `control_socket` | `Option<PathBuf>` | `None` | Unix socket path (alternative to TCP) |
/// | `control_pass` | `Option<String>` | `None` | Control port password |
/// | `loglevel` | `LogLevel` | `Notice` | Log verbosity level |
/// | `logfile` | `Option<String>` | `None` | Log destination (file, `:syslog:`, or stdout) |
/// | `retry_limit` | `Option<u32>` | `None` | Max reconnection attempts (None = infinite) |
/// | `selftest` | `SelftestConfig` | defaults | Self-test tuning |
///
/// ```rust
/// use relay_selftest::{Config, LogLevel};
///
/// let mut config = Config::default();
/// config.control_port = Some(9051);
/// config.loglevel = LogLevel::Debug;
/// config.selftest.assume_dir_reachable = true;
/// config.validate().expect("Invalid configuration");
/// ```
///
/// The `Debug` output never shows `control_pass`.
#[derive(Clone, Serialize, Deserialize, PartialEq)]
pub struct Config {
    /// IP address of the relay's control port.
    #[serde(default = "default_control_ip")]
    pub control_ip: String,
    /// Port number of the relay's control port.
    #[serde(default)]
    pub control_port: Option<u16>,
    /// Path to the relay's control socket.
    #[serde(default)]
    pub control_socket: Option<PathBuf>,
    /// Password for control port authentication.
    #[serde(default)]
    pub control_pass: Option<String>,
    /// Log level for output.
    #[serde(default)]
    pub loglevel: LogLevel,
    /// Log file path. None for stdout, ":syslog:" for syslog.
    #[serde(default)]
    pub logfile: Option<String>,
    /// Maximum reconnection attempts. None for infinite.
    #[serde(default)]
    pub retry_limit: Option<u32>,
    /// Self-test configuration.
    #[serde(default)]
    pub selftest: SelftestConfig,
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("control_ip", &self.control_ip)
            .field("control_port", &self.control_port)
            .field("control_socket", &self.control_socket)
            .field("control_pass", &self.control_pass.as_ref().map(|_| "[REDACTED]"))
            .field("loglevel", &self.loglevel)
            .field("logfile", &self.logfile)
            .field("retry_limit", &self.retry_limit)
            .field("selftest", &self.selftest)
            .finish()
    }
}

fn default_control_ip() -> String {
    "127.0.0.1".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            control_ip: default_control_ip(),
            control_port: None,
            control_socket: None,
            control_pass: None,
            loglevel: LogLevel::default(),
            logfile: None,
            retry_limit: None,
            selftest: SelftestConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the file cannot be read.
    /// Returns [`Error::Config`] if the TOML is invalid.
    pub fn from_file(path: &std::path::Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| Error::Config(e.to_string()))
    }

    /// Serialize configuration to TOML string.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if serialization fails.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| Error::Config(e.to_string()))
    }

    /// Validate configuration values.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if validation fails.
    pub fn validate(&self) -> Result<()> {
        let st = &self.selftest;
        if st.check_interval_secs == 0 {
            return Err(Error::Config(
                "check_interval_secs must be positive".to_string(),
            ));
        }
        if st.or_probe_timeout_secs == 0 || st.dir_probe_timeout_secs == 0 {
            return Err(Error::Config("probe timeouts must be positive".to_string()));
        }
        if st.num_bandwidth_circuits == 0 {
            return Err(Error::Config(
                "num_bandwidth_circuits must be positive".to_string(),
            ));
        }
        if st.min_bandwidth_circuits > st.num_bandwidth_circuits {
            return Err(Error::Config(
                "min_bandwidth_circuits must be <= num_bandwidth_circuits".to_string(),
            ));
        }
        if st.bandwidth_test_secs == 0 {
            return Err(Error::Config(
                "bandwidth_test_secs must be positive".to_string(),
            ));
        }
        if cell_budget(st.bandwidth_rate) == 0 {
            return Err(Error::Config(format!(
                "bandwidth_rate {} is too low to send a single test cell",
                st.bandwidth_rate
            )));
        }
        Ok(())
    }

    /// Resolve hostname to IP address if control_ip is a domain name.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if hostname resolution fails.
    pub fn resolve_control_ip(&mut self) -> Result<()> {
        if self.control_ip.parse::<IpAddr>().is_err() {
            let addr = format!("{}:0", self.control_ip)
                .to_socket_addrs()
                .map_err(|e| {
                    Error::Config(format!(
                        "failed to resolve hostname {}: {}",
                        self.control_ip, e
                    ))
                })?
                .next()
                .ok_or_else(|| {
                    Error::Config(format!(
                        "no addresses found for hostname {}",
                        self.control_ip
                    ))
                })?;
            self.control_ip = addr.ip().to_string();
        }
        Ok(())
    }
}

/// Command-line arguments for relay-selftest.
///
/// Arguments override configuration file values.
///
/// # Options
///
/// | Option | Description |
/// |--------|-------------|
/// | `--config <FILE>` | Path to configuration file [env: RELAY_SELFTEST_CONFIG] |
/// | `--generate_config <FILE>` | Write default config to file and exit |
/// | `--control-ip <IP>` | IP address of the relay control port |
/// | `--control-port <PORT>` | Relay control port number |
/// | `--control-socket <PATH>` | Path to relay control socket |
/// | `--control-pass <PASS>` | Control port password |
/// | `--loglevel <LEVEL>` | DEBUG, INFO, NOTICE, WARN, ERROR |
/// | `--logfile <FILE>` | Log to file (":syslog:" for syslog) |
/// | `--retry-limit <N>` | Reconnection attempt limit |
/// | `--disable-selftest` | Run the disabled stand-in instead of probing |
/// | `--assume-reachable` | Skip probing, treat both ports as reachable |
/// | `--assume-dir-reachable` | Skip probing the Dir port |
/// | `--bandwidth-circuits <N>` | Circuits per bandwidth test |
#[derive(Parser, Debug)]
#[command(name = "relay-selftest")]
#[command(about = "Reachability and bandwidth self-testing for Tor relays")]
#[command(version)]
#[command(
    long_about = "relay-selftest connects to a Tor relay's control port and verifies, from \
    the outside, that the relay's ORPort and DirPort are reachable before the relay \
    advertises itself, then periodically estimates the bandwidth it can sustain."
)]
pub struct CliArgs {
    /// Write default config to file and exit.
    #[arg(long = "generate_config")]
    pub generate_config: Option<PathBuf>,

    /// Log verbosity (DEBUG, INFO, NOTICE, WARN, ERROR).
    #[arg(long)]
    pub loglevel: Option<String>,

    /// Log to file instead of stdout (use ":syslog:" for syslog).
    #[arg(long)]
    pub logfile: Option<String>,

    /// Path to configuration file.
    #[arg(
        long = "config",
        env = "RELAY_SELFTEST_CONFIG",
        default_value = "relay-selftest.conf"
    )]
    pub config_file: PathBuf,

    /// IP address of the relay control port.
    ///
    /// Can be an IPv4 address, IPv6 address, or hostname (will be resolved).
    #[arg(long)]
    pub control_ip: Option<String>,

    /// Relay control port number.
    #[arg(long)]
    pub control_port: Option<u16>,

    /// Path to relay control socket.
    #[arg(long)]
    pub control_socket: Option<PathBuf>,

    /// Relay control port password.
    #[arg(long)]
    pub control_pass: Option<String>,

    /// Reconnection attempt limit (default: infinite).
    #[arg(long)]
    pub retry_limit: Option<u32>,

    /// Disable active self-testing.
    #[arg(long)]
    pub disable_selftest: bool,

    /// Treat both ports as reachable without probing.
    #[arg(long)]
    pub assume_reachable: bool,

    /// Treat the Dir port as reachable without probing.
    #[arg(long)]
    pub assume_dir_reachable: bool,

    /// Number of circuits built per bandwidth test.
    #[arg(long = "bandwidth-circuits")]
    pub bandwidth_circuits: Option<u32>,
}

impl CliArgs {
    /// Apply CLI arguments to a configuration, overriding values.
    pub fn apply_to(&self, config: &mut Config) {
        if let Some(ref loglevel) = self.loglevel {
            if let Ok(level) = loglevel.parse() {
                config.loglevel = level;
            }
        }
        if let Some(ref logfile) = self.logfile {
            config.logfile = Some(logfile.clone());
        }
        if let Some(ref control_ip) = self.control_ip {
            config.control_ip = control_ip.clone();
        }
        if let Some(control_port) = self.control_port {
            config.control_port = Some(control_port);
        }
        if let Some(ref control_socket) = self.control_socket {
            config.control_socket = Some(control_socket.clone());
        }
        if let Some(ref control_pass) = self.control_pass {
            config.control_pass = Some(control_pass.clone());
        }
        if let Some(retry_limit) = self.retry_limit {
            config.retry_limit = Some(retry_limit);
        }
        if self.disable_selftest {
            config.selftest.enable_selftest = false;
        }
        if self.assume_reachable {
            config.selftest.assume_reachable = true;
        }
        if self.assume_dir_reachable {
            config.selftest.assume_dir_reachable = true;
        }
        if let Some(n) = self.bandwidth_circuits {
            config.selftest.num_bandwidth_circuits = n;
        }
    }
}

/// Load configuration from file and CLI arguments.
///
/// # Errors
///
/// Returns [`Error::Config`] if configuration is invalid.
pub fn load_config(args: &CliArgs) -> Result<Config> {
    let mut config = Config::default();

    if args.config_file.exists() {
        config = Config::from_file(&args.config_file)?;
    }

    args.apply_to(&mut config);
    config.resolve_control_ip()?;
    config.validate()?;

    Ok(config)
}
