//! Tor control port binding and the main event loop.
//!
//! This module connects the self-test engine to a running relay through its
//! control port. It provides the collaborators the engine consumes:
//!
//! - the configuration provider ([`read_relay_ports`]),
//! - the circuit builder ([`ControlCircuits`], via `EXTENDCIRCUIT` and `CIRC`
//!   events),
//!
//! and drives everything from a single `tokio::select!` loop.
//!
//! # Connections
//!
//! Two authenticated control connections are opened per session. The
//! command connection is shared by probe tasks behind a mutex; the event
//! connection is owned by the loop and does nothing but `recv_event`, so a
//! slow command never delays circuit status updates.
//!
//! # Event Loop
//!
//! ```text
//!                 ┌──────────────────────────────────────────┐
//!                 │              control_loop()              │
//!                 │                                          │
//!   tick ────────▶│  selftest.tick(now)                      │
//!                 │                                          │
//!   probe reports▶│  selftest.handle_event(report, now)      │
//!                 │                                          │
//!   CIRC ────────▶│  tracker: BUILT / FAILED / CLOSED        │──▶ wakes probe tasks
//!   CIRC_BW ─────▶│  tracker: byte counts                    │
//!   CONF_CHANGED ▶│  re-read ports, maybe reset              │
//!   NEWCONSENSUS ▶│  refresh first-hop candidates            │
//!                 │                                          │
//!   Ctrl+C ──────▶│  exit                                    │
//!                 └──────────────────────────────────────────┘
//! ```
//!
//! # Reconnection
//!
//! [`run_main`] reruns [`control_loop`] after every disconnect, waiting one
//! second between attempts, until Ctrl+C or `retry_limit` is reached. A new
//! session starts with a fresh engine, so results never outlive the
//! connection they were observed on.

use std::collections::{HashMap, VecDeque};
use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::alphabet;
use base64::engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig};
use base64::Engine as _;
use chrono::NaiveDateTime;
use rand::distributions::{Distribution, WeightedIndex};
use stem_rs::controller::{CircuitId, Controller};
use stem_rs::descriptor::router_status::{RouterStatusEntry, RouterStatusEntryType};
use stem_rs::events::ParsedEvent;
use stem_rs::EventType;
use tokio::sync::{mpsc, oneshot, Mutex};

use crate::api::SecurePassword;
use crate::config::{Config, LogLevel, RelayPorts};
use crate::error::{Error, Result};
use crate::logger::plog;
use crate::prober::{HttpDirFetcher, SelfCircuitBuilder, TaskDispatcher, TestCircuit};
use crate::selftest::{build_selftest, Selftest};

/// Version string for relay-selftest.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Flags a relay needs to serve as the first hop of a test circuit.
const FIRST_HOP_FLAGS: [&str; 3] = ["Fast", "Running", "Valid"];

/// Torrc options whose change invalidates reachability results.
const LISTENER_OPTIONS: [&str; 4] = ["ORPort", "DirPort", "Address", "AssumeReachable"];

/// Current time as epoch seconds.
pub fn now_secs() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Authenticates with Tor using any available method.
///
/// Tries no authentication or cookie authentication first, then the given
/// password. If Tor wants a password and none was given, prompts for one.
///
/// # Errors
///
/// Returns [`Error::Control`] if authentication fails.
pub async fn authenticate_any(controller: &mut Controller, password: Option<&str>) -> Result<()> {
    match controller.authenticate(password).await {
        Ok(()) => {}
        Err(stem_rs::Error::Authentication(stem_rs::AuthError::MissingPassword)) => {
            let passwd = SecurePassword::new(prompt_password()?);
            controller.authenticate(Some(passwd.as_str())).await?;
        }
        Err(e) => return Err(Error::Control(e)),
    }

    let version = controller.get_version().await?;
    plog(
        LogLevel::Notice,
        &format!(
            "relay-selftest {} connected to Tor {} using stem-rs",
            VERSION, version
        ),
    );
    Ok(())
}

fn prompt_password() -> Result<String> {
    eprint!("Controller password: ");
    let mut password = String::new();
    std::io::stdin()
        .read_line(&mut password)
        .map_err(Error::Io)?;
    Ok(password.trim().to_string())
}

/// Connects to Tor's control port.
///
/// Attempts connection in this order:
/// 1. Unix socket if configured
/// 2. TCP port if configured
/// 3. Default Unix socket /run/tor/control
/// 4. Default TCP port 9051 on `control_ip`
async fn connect_to_tor(config: &Config) -> Result<Controller> {
    if let Some(ref socket_path) = config.control_socket {
        let controller = Controller::from_socket_file(socket_path.as_path()).await?;
        plog(
            LogLevel::Notice,
            &format!("Connected to Tor via socket {}", socket_path.display()),
        );
        return Ok(controller);
    }

    if let Some(port) = config.control_port {
        let addr = format!("{}:{}", config.control_ip, port);
        let controller = Controller::from_port(
            addr.parse()
                .map_err(|e| Error::Config(format!("Invalid control address: {}", e)))?,
        )
        .await?;
        plog(
            LogLevel::Notice,
            &format!("Connected to Tor via control port {}", addr),
        );
        return Ok(controller);
    }

    if let Ok(controller) = Controller::from_socket_file(Path::new("/run/tor/control")).await {
        plog(
            LogLevel::Notice,
            "Connected to Tor via /run/tor/control socket",
        );
        return Ok(controller);
    }

    let addr = format!("{}:9051", config.control_ip);
    let controller = Controller::from_port(
        addr.parse()
            .map_err(|e| Error::Config(format!("Invalid control address: {}", e)))?,
    )
    .await?;
    plog(
        LogLevel::Notice,
        &format!("Connected to Tor via {} control port", addr),
    );
    Ok(controller)
}

/// Opens and authenticates one control connection.
///
/// # Errors
///
/// Returns [`Error::Control`] or [`Error::Config`] if connecting or
/// authenticating fails.
pub async fn connect_and_authenticate(
    config: &Config,
    password: Option<&str>,
) -> Result<Controller> {
    let mut controller = connect_to_tor(config).await?;
    authenticate_any(&mut controller, password).await?;
    Ok(controller)
}

/// Reads the relay's listener configuration through the control port.
///
/// # Errors
///
/// Returns [`Error::Config`] if Tor is not running as a relay or has no
/// usable ORPort, and [`Error::Control`] if a command fails.
pub async fn read_relay_ports(controller: &mut Controller) -> Result<RelayPorts> {
    let or_conf = controller.get_conf("ORPort").await?;
    let dir_conf = controller.get_conf("DirPort").await?;
    let assume_conf = controller.get_conf("AssumeReachable").await?;
    let address = controller
        .get_info("address")
        .await
        .map_err(|e| Error::Config(format!("relay address is not known yet: {}", e)))?;
    let fingerprint = controller
        .get_info("fingerprint")
        .await
        .map_err(|e| Error::Config(format!("Tor is not running as a relay: {}", e)))?;

    parse_relay_ports(&or_conf, &dir_conf, &assume_conf, &address, &fingerprint)
}

/// Builds a [`RelayPorts`] snapshot from raw `GETCONF`/`GETINFO` values.
pub fn parse_relay_ports(
    or_conf: &[String],
    dir_conf: &[String],
    assume_conf: &[String],
    address: &str,
    fingerprint: &str,
) -> Result<RelayPorts> {
    let or_port = or_conf
        .iter()
        .find_map(|v| parse_port_conf(v))
        .ok_or_else(|| Error::Config("relay has no advertised ORPort".to_string()))?;
    let dir_port = dir_conf.iter().find_map(|v| parse_port_conf(v));
    let address: IpAddr = address
        .trim()
        .parse()
        .map_err(|_| Error::Config(format!("relay address {:?} is not an IP", address)))?;

    let fingerprint = fingerprint.trim().to_uppercase();
    if fingerprint.len() != 40 || !fingerprint.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(Error::Validation(format!(
            "relay fingerprint {:?} is not 40 hex characters",
            fingerprint
        )));
    }

    let mut ports = RelayPorts::new(address, or_port, dir_port);
    ports.fingerprint = fingerprint;
    ports.assume_reachable = assume_conf.first().map(|v| v.trim() == "1").unwrap_or(false);
    Ok(ports)
}

/// Extracts an advertised port from one `ORPort`/`DirPort` value.
///
/// Values look like `9001`, `0.0.0.0:9001`, `[::]:9001 IPv6Only` or
/// `auto`. Disabled (`0`), `auto` and `NoAdvertise` listeners yield `None`.
pub fn parse_port_conf(value: &str) -> Option<u16> {
    let mut parts = value.split_whitespace();
    let addr_port = parts.next()?;
    if parts.any(|flag| flag.eq_ignore_ascii_case("NoAdvertise")) {
        return None;
    }
    let port: u16 = addr_port.rsplit(':').next()?.parse().ok()?;
    (port != 0).then_some(port)
}

/// Whether a `CONF_CHANGED` event touched any listener option.
pub fn conf_touches_listeners(changed: &HashMap<String, Vec<String>>) -> bool {
    changed
        .keys()
        .any(|k| LISTENER_OPTIONS.iter().any(|o| o.eq_ignore_ascii_case(k)))
}

/// Identity digests in `r` lines are unpadded standard base64.
const IDENTITY_BASE64: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

/// Parses router status entries from a `GETINFO ns/all` response.
///
/// Entries whose `r` line is malformed are skipped together with their
/// `s` and `w` lines.
fn parse_network_statuses(response: &str) -> Vec<RouterStatusEntry> {
    let mut routers: Vec<RouterStatusEntry> = Vec::new();
    let mut in_valid_entry = false;

    for line in response.lines() {
        let (keyword, rest) = line.split_once(' ').unwrap_or((line, ""));
        match keyword {
            "r" => match parse_router_line(rest) {
                Some(router) => {
                    routers.push(router);
                    in_valid_entry = true;
                }
                None => in_valid_entry = false,
            },
            "s" | "w" if in_valid_entry => {
                if let Some(router) = routers.last_mut() {
                    apply_status_line(router, keyword, rest);
                }
            }
            _ => {}
        }
    }
    routers
}

/// `nickname identity digest date time address orport dirport`
fn parse_router_line(rest: &str) -> Option<RouterStatusEntry> {
    let fields: Vec<&str> = rest.split_whitespace().collect();
    let [nickname, identity, _digest, date, time, address, or_port, ..] = fields[..] else {
        return None;
    };
    let published = NaiveDateTime::parse_from_str(&format!("{} {}", date, time), "%Y-%m-%d %H:%M:%S")
        .ok()?
        .and_utc();

    Some(RouterStatusEntry::new(
        RouterStatusEntryType::V3,
        nickname.to_string(),
        decode_base64_fingerprint(identity)?,
        published,
        address.parse().ok()?,
        or_port.parse().ok()?,
    ))
}

fn apply_status_line(router: &mut RouterStatusEntry, keyword: &str, rest: &str) {
    if keyword == "s" {
        router.flags = rest.split_whitespace().map(str::to_string).collect();
        return;
    }
    for (key, value) in rest.split_whitespace().filter_map(|kv| kv.split_once('=')) {
        let Ok(value) = value.parse::<u64>() else {
            continue;
        };
        match key {
            "Bandwidth" => router.bandwidth = Some(value),
            "Measured" => router.measured = Some(value),
            _ => {}
        }
    }
}

/// Decodes a base64 identity digest to uppercase hex.
fn decode_base64_fingerprint(b64: &str) -> Option<String> {
    let digest = IDENTITY_BASE64.decode(b64).ok()?;
    Some(digest.iter().map(|b| format!("{:02X}", b)).collect())
}

/// Relays usable as the first hop of a self-routed circuit, with their
/// selection weights. Our own relay is never a candidate.
fn first_hop_candidates(routers: &[RouterStatusEntry], own_fingerprint: &str) -> Vec<(String, u64)> {
    routers
        .iter()
        .filter(|r| !r.fingerprint.eq_ignore_ascii_case(own_fingerprint))
        .filter(|r| FIRST_HOP_FLAGS.iter().all(|f| r.flags.iter().any(|g| g == f)))
        .filter_map(|r| {
            let weight = r.measured.or(r.bandwidth).unwrap_or(0);
            (weight > 0).then(|| (r.fingerprint.clone(), weight))
        })
        .collect()
}

/// Picks one candidate with probability proportional to its weight.
fn pick_weighted(candidates: &[(String, u64)]) -> Option<&str> {
    let index = WeightedIndex::new(candidates.iter().map(|(_, w)| *w)).ok()?;
    let choice = index.sample(&mut rand::thread_rng());
    candidates.get(choice).map(|(fp, _)| fp.as_str())
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum CircuitPhase {
    Pending,
    Built,
    Failed(String),
}

#[derive(Debug)]
struct TrackedCircuit {
    phase: CircuitPhase,
    waiters: Vec<oneshot::Sender<std::result::Result<(), String>>>,
    bytes: u64,
}

impl Default for TrackedCircuit {
    fn default() -> Self {
        Self {
            phase: CircuitPhase::Pending,
            waiters: Vec::new(),
            bytes: 0,
        }
    }
}

/// Statuses kept for circuits nobody has registered yet.
const UNCLAIMED_STATUS_LIMIT: usize = 64;

#[derive(Debug, Default)]
struct TrackerState {
    circuits: HashMap<String, TrackedCircuit>,
    // The event connection can report BUILT before EXTENDCIRCUIT returns
    // the id on the command connection.
    unclaimed: VecDeque<(String, CircuitPhase)>,
}

/// Follows the status of circuits we launched, fed by `CIRC` and `CIRC_BW`
/// events.
///
/// A terminal status for an id we do not know yet is held in a small
/// bounded buffer and applied if that id is registered shortly after.
#[derive(Debug, Default)]
pub struct CircuitTracker {
    state: std::sync::Mutex<TrackerState>,
}

impl CircuitTracker {
    fn lock(&self) -> std::sync::MutexGuard<'_, TrackerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Starts following `id`.
    pub fn register(&self, id: &str) {
        let mut state = self.lock();
        let early = state
            .unclaimed
            .iter()
            .position(|(unclaimed, _)| unclaimed == id)
            .and_then(|i| state.unclaimed.remove(i));
        let circuit = state.circuits.entry(id.to_string()).or_default();
        if let Some((_, phase)) = early {
            circuit.phase = phase;
        }
    }

    /// Stops following `id`.
    pub fn forget(&self, id: &str) {
        self.lock().circuits.remove(id);
    }

    /// Number of circuits being followed.
    pub fn len(&self) -> usize {
        self.lock().circuits.len()
    }

    /// Whether no circuits are being followed.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Applies a `CIRC` status. `status` is matched case-insensitively.
    pub fn on_status(&self, id: &str, status: &str, reason: Option<&str>) {
        let phase = match status.to_uppercase().as_str() {
            "BUILT" => CircuitPhase::Built,
            "FAILED" | "CLOSED" => CircuitPhase::Failed(format!(
                "circuit {} {}{}",
                id,
                status.to_lowercase(),
                reason.map(|r| format!(" ({})", r)).unwrap_or_default()
            )),
            _ => return,
        };

        let mut guard = self.lock();
        let state = &mut *guard;
        let Some(circuit) = state.circuits.get_mut(id) else {
            if state.unclaimed.len() == UNCLAIMED_STATUS_LIMIT {
                state.unclaimed.pop_front();
            }
            state.unclaimed.push_back((id.to_string(), phase));
            return;
        };
        let result = match &phase {
            CircuitPhase::Failed(why) => Err(why.clone()),
            _ => Ok(()),
        };
        circuit.phase = phase;
        for waiter in circuit.waiters.drain(..) {
            let _ = waiter.send(result.clone());
        }
    }

    /// Adds `CIRC_BW` bytes to `id`.
    pub fn add_bytes(&self, id: &str, bytes: u64) {
        if let Some(circuit) = self.lock().circuits.get_mut(id) {
            circuit.bytes = circuit.bytes.saturating_add(bytes);
        }
    }

    /// Bytes seen on `id` so far.
    pub fn bytes(&self, id: &str) -> u64 {
        self.lock().circuits.get(id).map(|c| c.bytes).unwrap_or(0)
    }

    /// Resolves once `id` is built.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Probe`] if the circuit fails, closes, or is unknown.
    pub async fn wait_built(&self, id: &str) -> Result<()> {
        let rx = {
            let mut state = self.lock();
            let circuit = state
                .circuits
                .get_mut(id)
                .ok_or_else(|| Error::Probe(format!("unknown circuit {}", id)))?;
            match &circuit.phase {
                CircuitPhase::Built => return Ok(()),
                CircuitPhase::Failed(why) => return Err(Error::Probe(why.clone())),
                CircuitPhase::Pending => {
                    let (tx, rx) = oneshot::channel();
                    circuit.waiters.push(tx);
                    rx
                }
            }
        };
        match rx.await {
            Ok(result) => result.map_err(Error::Probe),
            Err(_) => Err(Error::Probe(format!("stopped tracking circuit {}", id))),
        }
    }
}

/// [`SelfCircuitBuilder`] backed by a Tor control connection.
///
/// Each test circuit is two hops: a bandwidth-weighted random relay with
/// the Fast, Running and Valid flags, then this relay. Tor only reports the
/// circuit as built once the final extend into our own ORPort succeeded.
pub struct ControlCircuits {
    controller: Mutex<Controller>,
    own_fingerprint: String,
    first_hops: std::sync::Mutex<Vec<(String, u64)>>,
    tracker: CircuitTracker,
}

impl ControlCircuits {
    /// Wraps an authenticated command connection.
    pub fn new(controller: Controller, own_fingerprint: String) -> Self {
        Self {
            controller: Mutex::new(controller),
            own_fingerprint,
            first_hops: std::sync::Mutex::new(Vec::new()),
            tracker: CircuitTracker::default(),
        }
    }

    /// Circuit status bookkeeping, fed by the event loop.
    pub fn tracker(&self) -> &CircuitTracker {
        &self.tracker
    }

    /// Re-reads the relay's listeners over the command connection.
    ///
    /// # Errors
    ///
    /// See [`read_relay_ports`].
    pub async fn read_relay_ports(&self) -> Result<RelayPorts> {
        let mut controller = self.controller.lock().await;
        read_relay_ports(&mut controller).await
    }

    /// Reloads first-hop candidates from the current consensus. Returns the
    /// number of candidates.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConsensusUnavailable`] if Tor has no usable consensus.
    pub async fn refresh_first_hops(&self) -> Result<usize> {
        let response = {
            let mut controller = self.controller.lock().await;
            controller
                .get_info("ns/all")
                .await
                .map_err(|e| Error::ConsensusUnavailable(format!("cannot get network statuses: {}", e)))?
        };
        let candidates = first_hop_candidates(&parse_network_statuses(&response), &self.own_fingerprint);
        if candidates.is_empty() {
            return Err(Error::ConsensusUnavailable(
                "no Fast, Running, Valid relays in consensus".to_string(),
            ));
        }
        let count = candidates.len();
        *self.first_hops.lock().unwrap_or_else(|e| e.into_inner()) = candidates;
        Ok(count)
    }

    fn pick_first_hop(&self) -> Result<String> {
        let hops = self.first_hops.lock().unwrap_or_else(|e| e.into_inner());
        pick_weighted(&hops)
            .map(|fp| fp.to_string())
            .ok_or_else(|| Error::ConsensusUnavailable("no first-hop candidates".to_string()))
    }
}

#[async_trait]
impl SelfCircuitBuilder for ControlCircuits {
    async fn launch_self_circuit(&self) -> Result<TestCircuit> {
        let first_hop = format!("${}", self.pick_first_hop()?);
        let own = format!("${}", self.own_fingerprint);
        let path = [first_hop.as_str(), own.as_str()];

        let circuit_id = {
            let mut controller = self.controller.lock().await;
            controller.new_circuit(Some(&path[..])).await?
        };
        self.tracker.register(&circuit_id.0);
        plog(
            LogLevel::Debug,
            &format!("Launched testing circuit {} via {}", circuit_id.0, first_hop),
        );
        Ok(TestCircuit::new(circuit_id.0))
    }

    async fn wait_until_built(&self, circuit: &TestCircuit) -> Result<()> {
        self.tracker.wait_built(&circuit.id).await
    }

    async fn drive_traffic(
        &self,
        circuit: &TestCircuit,
        cells: u32,
        window: Duration,
    ) -> Result<u64> {
        // Tor itself paces the test cells; we only observe CIRC_BW.
        let before = self.tracker.bytes(&circuit.id);
        tokio::time::sleep(window).await;
        let moved = self.tracker.bytes(&circuit.id).saturating_sub(before);
        plog(
            LogLevel::Debug,
            &format!(
                "Circuit {} moved {} bytes (budget {} cells)",
                circuit.id, moved, cells
            ),
        );
        Ok(moved)
    }

    async fn close_circuit(&self, circuit: &TestCircuit) {
        let circuit_id = CircuitId::new(&circuit.id);
        let result = {
            let mut controller = self.controller.lock().await;
            controller.close_circuit(&circuit_id).await
        };
        if let Err(e) = result {
            plog(
                LogLevel::Debug,
                &format!("Failed to close testing circuit {}: {}", circuit.id, e),
            );
        }
        self.tracker.forget(&circuit.id);
    }
}

/// Why [`control_loop`] returned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopExit {
    /// The control connection closed after a successful start.
    Closed,
    /// The session could not be set up.
    Failed(String),
    /// The operator asked us to stop.
    Shutdown,
}

impl std::fmt::Display for LoopExit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LoopExit::Closed => write!(f, "closed"),
            LoopExit::Failed(why) => write!(f, "failed: {}", why),
            LoopExit::Shutdown => write!(f, "shut down"),
        }
    }
}

fn event_types() -> Vec<EventType> {
    vec![
        EventType::Circ,
        EventType::CircBw,
        EventType::ConfChanged,
        EventType::NewConsensus,
    ]
}

async fn handle_control_event(
    event: ParsedEvent,
    circuits: &ControlCircuits,
    selftest: &mut dyn Selftest,
) {
    match event {
        ParsedEvent::Circuit(ref e) => {
            let status = format!("{:?}", e.status);
            let reason = e.reason.as_ref().map(|r| format!("{:?}", r));
            circuits
                .tracker()
                .on_status(&e.id.0, &status, reason.as_deref());
        }
        ParsedEvent::CircuitBandwidth(ref e) => {
            circuits
                .tracker()
                .add_bytes(&e.id.0, e.read.saturating_add(e.written));
        }
        ParsedEvent::ConfChanged(ref e) => {
            if conf_touches_listeners(&e.changed) {
                match circuits.read_relay_ports().await {
                    Ok(ports) => {
                        selftest.update_ports(ports);
                    }
                    Err(err) => plog(
                        LogLevel::Warn,
                        &format!("Could not re-read relay listeners: {}", err),
                    ),
                }
            }
        }
        ParsedEvent::Unknown { ref event_type, .. } if event_type == "NEWCONSENSUS" => {
            if let Err(err) = circuits.refresh_first_hops().await {
                plog(LogLevel::Info, &format!("Consensus event error: {}", err));
            }
        }
        _ => {}
    }
}

fn report_descriptor(selftest: &mut dyn Selftest) {
    if selftest.take_descriptor_dirty() {
        if selftest.publishable() {
            plog(
                LogLevel::Info,
                "Both ports confirmed; relay descriptor is ready to publish.",
            );
        } else {
            plog(
                LogLevel::Info,
                "Reachability changed; relay descriptor needs rebuilding.",
            );
        }
    }
}

/// Runs one control session until the connection drops or the operator
/// stops us.
pub async fn control_loop(config: &Config, password: Option<&str>) -> LoopExit {
    let mut commands = match connect_and_authenticate(config, password).await {
        Ok(c) => c,
        Err(e) => return LoopExit::Failed(e.to_string()),
    };
    let mut events = match connect_and_authenticate(config, password).await {
        Ok(c) => c,
        Err(e) => return LoopExit::Failed(e.to_string()),
    };

    let ports = match read_relay_ports(&mut commands).await {
        Ok(p) => p,
        Err(e) => return LoopExit::Failed(e.to_string()),
    };
    plog(
        LogLevel::Info,
        &format!(
            "Relay {} listens on ORPort {}{}",
            ports.fingerprint,
            ports.or_addr(),
            ports
                .dir_addr()
                .map(|a| format!(", DirPort {}", a))
                .unwrap_or_default()
        ),
    );

    if let Err(e) = events.set_events(&event_types()).await {
        return LoopExit::Failed(e.to_string());
    }

    let circuits = Arc::new(ControlCircuits::new(commands, ports.fingerprint.clone()));
    match circuits.refresh_first_hops().await {
        Ok(n) => plog(
            LogLevel::Debug,
            &format!("{} relays eligible as testing circuit first hop", n),
        ),
        Err(e) => plog(
            LogLevel::Notice,
            &format!("Tor needs a consensus before self-testing: {}", e),
        ),
    }

    let (tx, mut reports) = mpsc::unbounded_channel();
    let dispatcher = TaskDispatcher::new(
        circuits.clone(),
        Arc::new(HttpDirFetcher),
        &ports,
        config.selftest.or_probe_timeout(),
        config.selftest.dir_probe_timeout(),
        tx,
    );
    let mut selftest = build_selftest(&config.selftest, ports, dispatcher);
    let mut ticker = tokio::time::interval(config.selftest.check_interval());

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                selftest.tick(now_secs());
            }
            Some(report) = reports.recv() => {
                selftest.handle_event(report, now_secs());
            }
            event = events.recv_event() => match event {
                Ok(event) => handle_control_event(event, &circuits, selftest.as_mut()).await,
                Err(e) => {
                    plog(LogLevel::Debug, &format!("Event receive error: {}", e));
                    return LoopExit::Closed;
                }
            },
            _ = tokio::signal::ctrl_c() => {
                plog(LogLevel::Notice, "Got CTRL+C. Exiting.");
                return LoopExit::Shutdown;
            }
        }
        report_descriptor(selftest.as_mut());
    }
}

/// Runs the daemon with reconnection support.
///
/// ```text
/// ┌─────────────────────────────────────────────┐
/// │                 run_main()                  │
/// │                                             │
/// │  loop:                                      │
/// │    • check retry limit                      │
/// │    • run control_loop()                     │
/// │    • Shutdown → return                      │
/// │    • log disconnection                      │
/// │    • wait 1 second (Ctrl+C aborts)          │
/// └─────────────────────────────────────────────┘
/// ```
///
/// # Errors
///
/// Returns [`Error::Config`] if no session ever got established before the
/// retry limit ran out.
///
/// ```rust,no_run
/// use relay_selftest::config::Config;
/// use relay_selftest::control::run_main;
///
/// #[tokio::main]
/// async fn main() -> Result<(), relay_selftest::error::Error> {
///     run_main(Config::default()).await
/// }
/// ```
pub async fn run_main(mut config: Config) -> Result<()> {
    let password = config.control_pass.take().map(SecurePassword::new);
    run_with_password(&config, password.as_ref()).await
}

/// Like [`run_main`], with the control password kept apart from the
/// configuration. `config.control_pass` is ignored.
///
/// # Errors
///
/// See [`run_main`].
pub async fn run_with_password(config: &Config, password: Option<&SecurePassword>) -> Result<()> {
    let mut reconnects = 0u32;
    let mut connected = false;

    loop {
        if let Some(limit) = config.retry_limit {
            if reconnects >= limit {
                break;
            }
        }

        let exit = control_loop(config, password.map(|p| p.as_str())).await;
        match exit {
            LoopExit::Shutdown => return Ok(()),
            LoopExit::Closed => connected = true,
            LoopExit::Failed(_) => {}
        }

        if exit == LoopExit::Closed || reconnects.is_multiple_of(10) {
            plog(
                LogLevel::Notice,
                &format!("Tor daemon connection {}. Trying again...", exit),
            );
        }

        reconnects += 1;

        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs(1)) => {}
            _ = tokio::signal::ctrl_c() => {
                plog(LogLevel::Notice, "Got CTRL+C. Exiting.");
                return Ok(());
            }
        }
    }

    if !connected {
        return Err(Error::Config("Failed to connect to Tor".to_string()));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const NS_ALL: &str = "\
r relay1 AAAAAAAAAAAAAAAAAAAAAAAAAAA BBBBBBBBBBBBBBBBBBBBBBBBBBB 2024-01-01 00:00:00 192.0.2.1 9001 0
s Fast Guard Running Stable Valid
w Bandwidth=1000 Measured=900
r relay2 CCCCCCCCCCCCCCCCCCCCCCCCCCC DDDDDDDDDDDDDDDDDDDDDDDDDDD 2024-01-01 00:00:00 192.0.2.2 9002 0
s Fast Running Valid Exit
w Bandwidth=2000
r slowpoke EEEEEEEEEEEEEEEEEEEEEEEEEEE FFFFFFFFFFFFFFFFFFFFFFFFFFF 2024-01-01 00:00:00 192.0.2.3 443 0
s Running Valid
w Bandwidth=5000";

    fn strings(values: &[&str]) -> Vec<String> {
        values.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_parse_port_conf() {
        assert_eq!(parse_port_conf("9001"), Some(9001));
        assert_eq!(parse_port_conf("0.0.0.0:443"), Some(443));
        assert_eq!(parse_port_conf("[::]:9001 IPv6Only"), Some(9001));
        assert_eq!(parse_port_conf("9050 NoAdvertise"), None);
        assert_eq!(parse_port_conf("0"), None);
        assert_eq!(parse_port_conf("auto"), None);
        assert_eq!(parse_port_conf(""), None);
    }

    #[test]
    fn test_parse_relay_ports() {
        let ports = parse_relay_ports(
            &strings(&["127.0.0.1:9001 NoAdvertise", "9001"]),
            &strings(&["0"]),
            &strings(&["1"]),
            "198.51.100.7\n",
            "abcdef0123456789abcdef0123456789abcdef01",
        )
        .unwrap();
        assert_eq!(ports.or_port, 9001);
        assert_eq!(ports.dir_port, None);
        assert!(ports.assume_reachable);
        assert_eq!(ports.fingerprint, "ABCDEF0123456789ABCDEF0123456789ABCDEF01");
    }

    #[test]
    fn test_parse_relay_ports_requires_orport() {
        let result = parse_relay_ports(&strings(&["0"]), &[], &[], "198.51.100.7", "AA");
        assert!(matches!(result, Err(Error::Config(_))));

        let result = parse_relay_ports(&strings(&["9001"]), &[], &[], "unknown", "AA");
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_parse_relay_ports_rejects_bad_fingerprint() {
        let result = parse_relay_ports(&strings(&["9001"]), &[], &[], "198.51.100.7", "XYZ");
        assert!(matches!(result, Err(Error::Validation(_))));
    }

    #[test]
    fn test_conf_touches_listeners() {
        let mut changed = HashMap::new();
        changed.insert("Nickname".to_string(), vec!["bob".to_string()]);
        assert!(!conf_touches_listeners(&changed));

        changed.insert("orport".to_string(), vec!["443".to_string()]);
        assert!(conf_touches_listeners(&changed));
    }

    #[test]
    fn test_decode_base64_fingerprint() {
        let hex = decode_base64_fingerprint("AAAAAAAAAAAAAAAAAAAAAAAAAAA").unwrap();
        assert_eq!(hex.len(), 40);
        assert!(hex.chars().all(|c| c == '0'));

        assert_eq!(
            decode_base64_fingerprint("SGVsbG8="),
            Some("48656C6C6F".to_string())
        );
        assert_eq!(decode_base64_fingerprint("not*base64"), None);
    }

    #[test]
    fn test_parse_network_statuses() {
        let routers = parse_network_statuses(NS_ALL);
        assert_eq!(routers.len(), 3);
        assert_eq!(routers[0].nickname, "relay1");
        assert_eq!(routers[0].measured, Some(900));
        assert_eq!(routers[1].bandwidth, Some(2000));
        assert_eq!(routers[1].measured, None);
    }

    #[test]
    fn test_parse_network_statuses_skips_malformed_entries() {
        let response = "\
r broken AAAAAAAAAAAAAAAAAAAAAAAAAAA BBBBBBBBBBBBBBBBBBBBBBBBBBB 2024-01-01 00:00:00 not-an-ip 9001 0
s Fast Running Valid
w Bandwidth=7000
r good CCCCCCCCCCCCCCCCCCCCCCCCCCC DDDDDDDDDDDDDDDDDDDDDDDDDDD 2024-01-01 00:00:00 192.0.2.9 9001 0
s Fast Running Valid
w Bandwidth=300";

        let routers = parse_network_statuses(response);
        assert_eq!(routers.len(), 1);
        assert_eq!(routers[0].nickname, "good");
        assert_eq!(routers[0].bandwidth, Some(300));
    }

    #[test]
    fn test_first_hop_candidates_filter_flags_and_self() {
        let routers = parse_network_statuses(NS_ALL);
        let own = routers[1].fingerprint.clone();

        let candidates = first_hop_candidates(&routers, &own);
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].0, routers[0].fingerprint);
        assert_eq!(candidates[0].1, 900);
    }

    #[test]
    fn test_pick_weighted() {
        assert_eq!(pick_weighted(&[]), None);
        assert_eq!(pick_weighted(&[("A".to_string(), 0)]), None);

        let candidates = vec![("A".to_string(), 0), ("B".to_string(), 10)];
        for _ in 0..20 {
            assert_eq!(pick_weighted(&candidates), Some("B"));
        }
    }

    #[test]
    fn test_loop_exit_display() {
        assert_eq!(LoopExit::Closed.to_string(), "closed");
        assert_eq!(LoopExit::Failed("boom".into()).to_string(), "failed: boom");
    }

    #[tokio::test]
    async fn test_tracker_resolves_on_built() {
        let tracker = Arc::new(CircuitTracker::default());
        tracker.register("7");

        let waiting = {
            let tracker = tracker.clone();
            tokio::spawn(async move { tracker.wait_built("7").await })
        };
        tokio::task::yield_now().await;
        tracker.on_status("7", "Extended", None);
        tracker.on_status("7", "Built", None);

        assert!(waiting.await.unwrap().is_ok());
        assert!(tracker.wait_built("7").await.is_ok());
    }

    #[tokio::test]
    async fn test_tracker_reports_failure_reason() {
        let tracker = CircuitTracker::default();
        tracker.register("9");
        tracker.on_status("9", "Failed", Some("Timeout"));

        match tracker.wait_built("9").await {
            Err(Error::Probe(why)) => assert!(why.contains("Timeout")),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_tracker_ignores_foreign_circuits() {
        let tracker = CircuitTracker::default();
        tracker.on_status("42", "BUILT", None);
        tracker.add_bytes("42", 100);
        assert!(tracker.is_empty());
        assert!(tracker.wait_built("42").await.is_err());
    }

    #[tokio::test]
    async fn test_tracker_applies_status_seen_before_register() {
        let tracker = CircuitTracker::default();
        tracker.on_status("11", "BUILT", None);
        tracker.on_status("12", "FAILED", Some("DESTROYED"));

        tracker.register("11");
        tracker.register("12");
        assert!(tracker.wait_built("11").await.is_ok());
        assert!(tracker.wait_built("12").await.is_err());
    }

    #[tokio::test]
    async fn test_tracker_unclaimed_buffer_is_bounded() {
        let tracker = CircuitTracker::default();
        tracker.on_status("1", "BUILT", None);
        for id in 100..100 + UNCLAIMED_STATUS_LIMIT {
            tracker.on_status(&id.to_string(), "BUILT", None);
        }
        assert_eq!(tracker.lock().unclaimed.len(), UNCLAIMED_STATUS_LIMIT);

        // The oldest status was evicted, so "1" is pending after register.
        tracker.register("1");
        tracker.on_status("1", "CLOSED", None);
        assert!(tracker.wait_built("1").await.is_err());
    }

    #[test]
    fn test_tracker_counts_bytes_until_forgotten() {
        let tracker = CircuitTracker::default();
        tracker.register("3");
        tracker.add_bytes("3", 514);
        tracker.add_bytes("3", 1028);
        assert_eq!(tracker.bytes("3"), 1542);

        tracker.forget("3");
        assert_eq!(tracker.bytes("3"), 0);
    }
}
