//! Logging infrastructure for relay-selftest.
//!
//! Output goes through the tracing ecosystem to stdout, a file, or syslog.
//! Tor's NOTICE severity has no tracing equivalent and is logged at `info`.
//! `RUST_LOG` overrides the configured level.
//!
//! ```rust,no_run
//! use relay_selftest::{LogLevel, logger};
//!
//! logger::init(LogLevel::Notice, None).unwrap();
//! logger::plog(LogLevel::Notice, "Now checking whether ORPort 198.51.100.7:9001 is reachable...");
//! ```

use std::io::Write;
use std::os::unix::net::UnixDatagram;
use std::path::Path;
use std::sync::OnceLock;
use tracing::{debug, error, info, warn};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::EnvFilter;

use crate::config::LogLevel;
use crate::error::{Error, Result};

static LOGGER_INITIALIZED: OnceLock<()> = OnceLock::new();

const SYSLOG_TAG: &str = "relay-selftest";

/// Initialize the logging system.
///
/// Subsequent calls are no-ops.
///
/// # Arguments
///
/// * `level` - The minimum log level to output
/// * `logfile` - Output destination:
///   - `None` - Log to stdout with ANSI colors
///   - `Some(":syslog:")` - Log to system syslog
///   - `Some(path)` - Append to the file at `path`
///
/// # Errors
///
/// Returns [`Error::Io`] if the log file cannot be opened, and
/// [`Error::Config`] if no syslog socket exists or a global subscriber is
/// already installed.
pub fn init(level: LogLevel, logfile: Option<&str>) -> Result<()> {
    if LOGGER_INITIALIZED.get().is_some() {
        return Ok(());
    }

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter_for(level)));

    match logfile {
        None => {
            let subscriber = tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_target(false)
                .with_thread_ids(false)
                .with_span_events(FmtSpan::NONE)
                .with_ansi(true)
                .finish();
            install(subscriber)?;
        }
        Some(":syslog:") => init_syslog(env_filter)?,
        Some(path) => init_file_logger(path, env_filter)?,
    }

    LOGGER_INITIALIZED.get_or_init(|| ());
    Ok(())
}

fn filter_for(level: LogLevel) -> &'static str {
    match level {
        LogLevel::Debug => "debug",
        LogLevel::Info | LogLevel::Notice => "info",
        LogLevel::Warn => "warn",
        LogLevel::Error => "error",
    }
}

fn install<S>(subscriber: S) -> Result<()>
where
    S: tracing::Subscriber + Send + Sync + 'static,
{
    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| Error::Config(format!("failed to set logger: {}", e)))
}

fn init_syslog(env_filter: EnvFilter) -> Result<()> {
    let syslog_path = ["/dev/log", "/var/run/syslog"]
        .into_iter()
        .find(|p| Path::new(p).exists())
        .ok_or_else(|| Error::Config("no syslog socket found".to_string()))?;

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_ansi(false)
        .with_writer(move || SyslogWriter::connect(syslog_path))
        .finish();

    install(subscriber)
}

/// Sends each formatted line as one datagram. A socket that failed to
/// connect silently drops output rather than failing the caller.
struct SyslogWriter {
    socket: Option<UnixDatagram>,
}

impl SyslogWriter {
    fn connect(path: &str) -> Self {
        let socket = UnixDatagram::unbound()
            .and_then(|sock| sock.connect(path).map(|()| sock))
            .ok();
        Self { socket }
    }
}

impl Write for SyslogWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        if let Some(ref socket) = self.socket {
            let msg = format!("{}: {}", SYSLOG_TAG, String::from_utf8_lossy(buf));
            socket.send(msg.as_bytes())?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

fn init_file_logger(path: &str, env_filter: EnvFilter) -> Result<()> {
    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_ansi(false)
        .with_writer(std::sync::Mutex::new(file))
        .finish();

    install(subscriber)
}

/// Log a message at the specified level.
///
/// | LogLevel | tracing macro |
/// |----------|---------------|
/// | Debug | `debug!` |
/// | Info | `info!` |
/// | Notice | `info!` |
/// | Warn | `warn!` |
/// | Error | `error!` |
///
/// ```rust
/// use relay_selftest::{LogLevel, logger};
///
/// logger::plog(LogLevel::Notice, "Self-testing indicates your ORPort is reachable from the outside. Excellent.");
/// logger::plog(LogLevel::Warn, "Control connection lost, retrying...");
/// ```
pub fn plog(level: LogLevel, message: &str) {
    match level {
        LogLevel::Debug => debug!("{}", message),
        LogLevel::Info => info!("{}", message),
        LogLevel::Notice => info!("{}", message),
        LogLevel::Warn => warn!("{}", message),
        LogLevel::Error => error!("{}", message),
    }
}

/// Log a formatted message at the specified level.
///
/// ```rust
/// use relay_selftest::{LogLevel, plog_fmt};
///
/// plog_fmt!(LogLevel::Info, "Dispatched {} probe(s)", 2);
/// ```
#[macro_export]
macro_rules! plog_fmt {
    ($level:expr, $($arg:tt)*) => {
        $crate::logger::plog($level, &format!($($arg)*))
    };
}
