//! Single-shot reachability probes and the collaborators they drive.
//!
//! A probe never touches [`ReachabilityState`](crate::reachability::ReachabilityState).
//! It runs on its own task, talks to the relay through a collaborator, and
//! reports what happened as [`ProbeEvent`]s over a channel. The owner of the
//! state applies those events in arrival order, which is what keeps a
//! stale or duplicated result from ever racing a reset.
//!
//! # Probe Lifecycle
//!
//! ```text
//!   scheduler ──dispatch(ticket)──▶ TaskDispatcher ──spawn──▶ OrProber / DirProber
//!                                                              │
//!                          ProbeEvent::Launched(ticket) ◀──────┤
//!                                                              │  bounded by timeout
//!            ProbeEvent::Finished(ticket, outcome)      ◀──────┘
//! ```
//!
//! Probers never retry. A timeout, a refused connection or a circuit that
//! collapses all come back as a non-reachable [`ProbeOutcome`]; retry cadence
//! belongs to the scheduler.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{timeout_at, Instant};

use crate::bandwidth::{run_bandwidth_test, BandwidthPlan, BandwidthVerdict};
use crate::config::RelayPorts;
use crate::error::{Error, Result};
use crate::reachability::{Generation, Port};

/// Path our own server descriptor is served under on a Dir port.
pub const SERVER_DESCRIPTOR_PATH: &str = "/tor/server/authority";

/// Longest HTTP status line we are willing to read from a Dir port.
const MAX_STATUS_LINE: u64 = 1024;

/// Identifies one dispatched probe.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProbeTicket {
    /// Port under test.
    pub port: Port,
    /// Generation captured at dispatch.
    pub generation: Generation,
    /// Dispatch time, epoch seconds.
    pub dispatched_at: f64,
}

/// How a probe ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// The port was reached from outside.
    Reachable,
    /// The collaborator reported a failure.
    Unreachable(String),
    /// No answer within the probe's bound.
    TimedOut,
}

impl ProbeOutcome {
    /// Whether this outcome proves reachability.
    pub fn is_reachable(&self) -> bool {
        matches!(self, ProbeOutcome::Reachable)
    }
}

/// Reports flowing back from probe and bandwidth tasks.
#[derive(Debug, Clone, PartialEq)]
pub enum ProbeEvent {
    /// The probe reached the network.
    Launched(ProbeTicket),
    /// The probe is done.
    Finished(ProbeTicket, ProbeOutcome),
    /// A bandwidth test planned under the given generation is done.
    BandwidthMeasured(Generation, BandwidthVerdict),
}

/// Handle to a test circuit created by a [`SelfCircuitBuilder`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TestCircuit {
    /// Backend-specific circuit identifier.
    pub id: String,
}

impl TestCircuit {
    /// Wraps a circuit identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }
}

/// Circuit-construction collaborator.
///
/// Everything here is asynchronous and fallible; errors are folded into
/// probe outcomes by the callers.
#[async_trait]
pub trait SelfCircuitBuilder: Send + Sync {
    /// Requests a circuit whose final hop is this relay.
    async fn launch_self_circuit(&self) -> Result<TestCircuit>;

    /// Resolves once `circuit` is fully built, or fails if it collapses.
    async fn wait_until_built(&self, circuit: &TestCircuit) -> Result<()>;

    /// Drives up to `cells` cells through `circuit` within `window` and
    /// returns the bytes moved.
    async fn drive_traffic(&self, circuit: &TestCircuit, cells: u32, window: Duration)
        -> Result<u64>;

    /// Tears `circuit` down. Best effort.
    async fn close_circuit(&self, circuit: &TestCircuit);
}

/// Direct-connection collaborator for the Dir port.
#[async_trait]
pub trait DirFetcher: Send + Sync {
    /// Fetches our own server descriptor from `addr`. Succeeds only on a
    /// positive answer.
    async fn fetch_server_descriptor(&self, addr: SocketAddr) -> Result<()>;
}

/// [`DirFetcher`] speaking plain HTTP/1.0 over TCP.
#[derive(Debug, Clone, Copy, Default)]
pub struct HttpDirFetcher;

#[async_trait]
impl DirFetcher for HttpDirFetcher {
    async fn fetch_server_descriptor(&self, addr: SocketAddr) -> Result<()> {
        let mut stream = TcpStream::connect(addr).await?;
        let request = format!(
            "GET {} HTTP/1.0\r\nHost: {}\r\n\r\n",
            SERVER_DESCRIPTOR_PATH, addr
        );
        stream.write_all(request.as_bytes()).await?;

        let mut reader = BufReader::new(stream).take(MAX_STATUS_LINE);
        let mut status_line = String::new();
        reader.read_line(&mut status_line).await?;

        match parse_status_code(&status_line) {
            Some(200) => Ok(()),
            Some(code) => Err(Error::Probe(format!(
                "DirPort {} answered HTTP {}",
                addr, code
            ))),
            None => Err(Error::Probe(format!(
                "DirPort {} sent a malformed status line",
                addr
            ))),
        }
    }
}

/// Extracts the status code from an HTTP/1.x status line.
pub fn parse_status_code(line: &str) -> Option<u16> {
    let mut parts = line.split_whitespace();
    let version = parts.next()?;
    if !version.starts_with("HTTP/1.") {
        return None;
    }
    parts.next()?.parse().ok()
}

/// Probes the OR port by building a circuit through ourselves.
pub struct OrProber {
    circuits: Arc<dyn SelfCircuitBuilder>,
    timeout: Duration,
}

impl OrProber {
    /// Creates a prober bounded by `timeout`.
    pub fn new(circuits: Arc<dyn SelfCircuitBuilder>, timeout: Duration) -> Self {
        Self { circuits, timeout }
    }

    /// Runs one probe, reporting on `events`.
    ///
    /// Launch and build share one deadline. A circuit that was launched is
    /// closed whatever the outcome.
    pub async fn probe(&self, ticket: ProbeTicket, events: &mpsc::UnboundedSender<ProbeEvent>) {
        let deadline = Instant::now() + self.timeout;

        let circuit = match timeout_at(deadline, self.circuits.launch_self_circuit()).await {
            Ok(Ok(circuit)) => circuit,
            Ok(Err(e)) => {
                let _ = events.send(ProbeEvent::Finished(
                    ticket,
                    ProbeOutcome::Unreachable(e.to_string()),
                ));
                return;
            }
            Err(_) => {
                let _ = events.send(ProbeEvent::Finished(ticket, ProbeOutcome::TimedOut));
                return;
            }
        };
        let _ = events.send(ProbeEvent::Launched(ticket));

        let outcome = match timeout_at(deadline, self.circuits.wait_until_built(&circuit)).await {
            Ok(Ok(())) => ProbeOutcome::Reachable,
            Ok(Err(e)) => ProbeOutcome::Unreachable(e.to_string()),
            Err(_) => ProbeOutcome::TimedOut,
        };
        self.circuits.close_circuit(&circuit).await;
        let _ = events.send(ProbeEvent::Finished(ticket, outcome));
    }
}

/// Probes the Dir port by fetching our own descriptor from it.
pub struct DirProber {
    fetcher: Arc<dyn DirFetcher>,
    timeout: Duration,
}

impl DirProber {
    /// Creates a prober bounded by `timeout`.
    pub fn new(fetcher: Arc<dyn DirFetcher>, timeout: Duration) -> Self {
        Self { fetcher, timeout }
    }

    /// Runs one probe against `addr`, reporting on `events`.
    pub async fn probe(
        &self,
        ticket: ProbeTicket,
        addr: SocketAddr,
        events: &mpsc::UnboundedSender<ProbeEvent>,
    ) {
        let _ = events.send(ProbeEvent::Launched(ticket));
        let outcome = match tokio::time::timeout(
            self.timeout,
            self.fetcher.fetch_server_descriptor(addr),
        )
        .await
        {
            Ok(Ok(())) => ProbeOutcome::Reachable,
            Ok(Err(e)) => ProbeOutcome::Unreachable(e.to_string()),
            Err(_) => ProbeOutcome::TimedOut,
        };
        let _ = events.send(ProbeEvent::Finished(ticket, outcome));
    }
}

/// Seam between the scheduler and whatever actually runs probes.
///
/// Dispatch must not block and must not fail synchronously; anything that
/// goes wrong later is reported as a probe outcome.
pub trait ProbeDispatcher: Send {
    /// Starts a reachability probe.
    fn dispatch(&mut self, ticket: ProbeTicket);

    /// Starts a bandwidth test.
    fn dispatch_bandwidth_test(&mut self, plan: BandwidthPlan);

    /// Points future probes at new listeners.
    fn update_ports(&mut self, _ports: &RelayPorts) {}
}

/// [`ProbeDispatcher`] that runs each probe on its own tokio task.
pub struct TaskDispatcher {
    or_prober: Arc<OrProber>,
    dir_prober: Arc<DirProber>,
    circuits: Arc<dyn SelfCircuitBuilder>,
    build_timeout: Duration,
    dir_addr: Option<SocketAddr>,
    events: mpsc::UnboundedSender<ProbeEvent>,
}

impl TaskDispatcher {
    /// Wires probers to collaborators. Results are delivered on `events`.
    pub fn new(
        circuits: Arc<dyn SelfCircuitBuilder>,
        fetcher: Arc<dyn DirFetcher>,
        ports: &RelayPorts,
        or_timeout: Duration,
        dir_timeout: Duration,
        events: mpsc::UnboundedSender<ProbeEvent>,
    ) -> Self {
        Self {
            or_prober: Arc::new(OrProber::new(circuits.clone(), or_timeout)),
            dir_prober: Arc::new(DirProber::new(fetcher, dir_timeout)),
            circuits,
            build_timeout: or_timeout,
            dir_addr: ports.dir_addr(),
            events,
        }
    }
}

impl ProbeDispatcher for TaskDispatcher {
    fn dispatch(&mut self, ticket: ProbeTicket) {
        let events = self.events.clone();
        match ticket.port {
            Port::Or => {
                let prober = self.or_prober.clone();
                tokio::spawn(async move { prober.probe(ticket, &events).await });
            }
            Port::Dir => match self.dir_addr {
                Some(addr) => {
                    let prober = self.dir_prober.clone();
                    tokio::spawn(async move { prober.probe(ticket, addr, &events).await });
                }
                None => {
                    let _ = events.send(ProbeEvent::Finished(
                        ticket,
                        ProbeOutcome::Unreachable("no DirPort configured".to_string()),
                    ));
                }
            },
        }
    }

    fn dispatch_bandwidth_test(&mut self, plan: BandwidthPlan) {
        let events = self.events.clone();
        let circuits = self.circuits.clone();
        let build_timeout = self.build_timeout;
        tokio::spawn(async move {
            let verdict = run_bandwidth_test(circuits, &plan, build_timeout).await;
            let _ = events.send(ProbeEvent::BandwidthMeasured(plan.generation, verdict));
        });
    }

    fn update_ports(&mut self, ports: &RelayPorts) {
        self.dir_addr = ports.dir_addr();
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scripted collaborators shared by the probe, bandwidth and engine tests.

    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    /// How a scripted circuit behaves.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum CircuitScript {
        /// Launch is refused.
        RefuseLaunch,
        /// Launches, then collapses.
        Collapse,
        /// Launches and never completes.
        Hang,
        /// Launches and completes.
        Build,
    }

    pub struct FakeCircuits {
        scripts: Mutex<VecDeque<CircuitScript>>,
        default: CircuitScript,
        bytes_per_cell: u64,
        launched: AtomicU32,
        pub closed: Mutex<Vec<String>>,
    }

    impl FakeCircuits {
        pub fn always(default: CircuitScript) -> Self {
            Self::scripted(Vec::new(), default)
        }

        pub fn scripted(scripts: Vec<CircuitScript>, default: CircuitScript) -> Self {
            Self {
                scripts: Mutex::new(scripts.into()),
                default,
                bytes_per_cell: 514,
                launched: AtomicU32::new(0),
                closed: Mutex::new(Vec::new()),
            }
        }

        /// Circuits that build but never carry a byte.
        pub fn idle(mut self) -> Self {
            self.bytes_per_cell = 0;
            self
        }

        pub fn launched(&self) -> u32 {
            self.launched.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl SelfCircuitBuilder for FakeCircuits {
        async fn launch_self_circuit(&self) -> Result<TestCircuit> {
            let script = self
                .scripts
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(self.default);
            if script == CircuitScript::RefuseLaunch {
                return Err(Error::Probe("launch refused".to_string()));
            }
            let n = self.launched.fetch_add(1, Ordering::SeqCst);
            let tag = match script {
                CircuitScript::Collapse => "collapse",
                CircuitScript::Hang => "hang",
                _ => "build",
            };
            Ok(TestCircuit::new(format!("{}-{}", tag, n)))
        }

        async fn wait_until_built(&self, circuit: &TestCircuit) -> Result<()> {
            if circuit.id.starts_with("collapse") {
                Err(Error::Probe("circuit destroyed".to_string()))
            } else if circuit.id.starts_with("hang") {
                std::future::pending::<()>().await;
                Ok(())
            } else {
                Ok(())
            }
        }

        async fn drive_traffic(
            &self,
            _circuit: &TestCircuit,
            cells: u32,
            _window: Duration,
        ) -> Result<u64> {
            Ok(cells as u64 * self.bytes_per_cell)
        }

        async fn close_circuit(&self, circuit: &TestCircuit) {
            self.closed.lock().unwrap().push(circuit.id.clone());
        }
    }

    pub struct FakeFetcher {
        pub answer: Option<u16>,
    }

    #[async_trait]
    impl DirFetcher for FakeFetcher {
        async fn fetch_server_descriptor(&self, _addr: SocketAddr) -> Result<()> {
            match self.answer {
                Some(200) => Ok(()),
                Some(code) => Err(Error::Probe(format!("HTTP {}", code))),
                None => {
                    std::future::pending::<()>().await;
                    Ok(())
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use tokio::net::TcpListener;

    fn ticket(port: Port) -> ProbeTicket {
        ProbeTicket {
            port,
            generation: Generation(3),
            dispatched_at: 100.0,
        }
    }

    async fn collect(mut rx: mpsc::UnboundedReceiver<ProbeEvent>) -> Vec<ProbeEvent> {
        let mut out = Vec::new();
        while let Some(event) = rx.recv().await {
            out.push(event);
        }
        out
    }

    #[test]
    fn test_parse_status_code() {
        assert_eq!(parse_status_code("HTTP/1.0 200 OK\r\n"), Some(200));
        assert_eq!(parse_status_code("HTTP/1.1 404 Not found"), Some(404));
        assert_eq!(parse_status_code("SSH-2.0-OpenSSH"), None);
        assert_eq!(parse_status_code(""), None);
    }

    #[tokio::test]
    async fn test_or_probe_success_closes_circuit() {
        let circuits = Arc::new(FakeCircuits::always(CircuitScript::Build));
        let prober = OrProber::new(circuits.clone(), Duration::from_secs(5));
        let (tx, rx) = mpsc::unbounded_channel();

        prober.probe(ticket(Port::Or), &tx).await;
        drop(tx);

        let events = collect(rx).await;
        assert_eq!(
            events,
            vec![
                ProbeEvent::Launched(ticket(Port::Or)),
                ProbeEvent::Finished(ticket(Port::Or), ProbeOutcome::Reachable),
            ]
        );
        assert_eq!(circuits.closed.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_or_probe_refused_launch_never_reports_launched() {
        let circuits = Arc::new(FakeCircuits::always(CircuitScript::RefuseLaunch));
        let prober = OrProber::new(circuits, Duration::from_secs(5));
        let (tx, rx) = mpsc::unbounded_channel();

        prober.probe(ticket(Port::Or), &tx).await;
        drop(tx);

        let events = collect(rx).await;
        assert_eq!(events.len(), 1);
        assert!(matches!(
            events[0],
            ProbeEvent::Finished(_, ProbeOutcome::Unreachable(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_or_probe_times_out() {
        let circuits = Arc::new(FakeCircuits::always(CircuitScript::Hang));
        let prober = OrProber::new(circuits.clone(), Duration::from_secs(60));
        let (tx, rx) = mpsc::unbounded_channel();

        prober.probe(ticket(Port::Or), &tx).await;
        drop(tx);

        let events = collect(rx).await;
        assert_eq!(
            events.last(),
            Some(&ProbeEvent::Finished(ticket(Port::Or), ProbeOutcome::TimedOut))
        );
        assert_eq!(circuits.launched(), 1);
        assert_eq!(*circuits.closed.lock().unwrap(), vec!["hang-0".to_string()]);
    }

    #[tokio::test]
    async fn test_collapsed_or_circuit_is_closed() {
        let circuits = Arc::new(FakeCircuits::always(CircuitScript::Collapse));
        let prober = OrProber::new(circuits.clone(), Duration::from_secs(5));
        let (tx, rx) = mpsc::unbounded_channel();

        prober.probe(ticket(Port::Or), &tx).await;
        drop(tx);

        let events = collect(rx).await;
        assert!(matches!(
            events.last(),
            Some(ProbeEvent::Finished(_, ProbeOutcome::Unreachable(_)))
        ));
        assert_eq!(circuits.closed.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dir_probe_times_out() {
        let prober = DirProber::new(Arc::new(FakeFetcher { answer: None }), Duration::from_secs(30));
        let (tx, rx) = mpsc::unbounded_channel();

        prober
            .probe(ticket(Port::Dir), "127.0.0.1:9030".parse().unwrap(), &tx)
            .await;
        drop(tx);

        let events = collect(rx).await;
        assert_eq!(
            events.last(),
            Some(&ProbeEvent::Finished(ticket(Port::Dir), ProbeOutcome::TimedOut))
        );
    }

    #[tokio::test]
    async fn test_http_fetcher_accepts_200() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 512];
            let n = sock.read(&mut buf).await.unwrap();
            let request = String::from_utf8_lossy(&buf[..n]).to_string();
            sock.write_all(b"HTTP/1.0 200 OK\r\n\r\nrouter test")
                .await
                .unwrap();
            request
        });

        HttpDirFetcher.fetch_server_descriptor(addr).await.unwrap();
        let request = server.await.unwrap();
        assert!(request.starts_with("GET /tor/server/authority HTTP/1.0\r\n"));
    }

    #[tokio::test]
    async fn test_http_fetcher_rejects_404() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 512];
            let _ = sock.read(&mut buf).await;
            let _ = sock.write_all(b"HTTP/1.0 404 Not found\r\n\r\n").await;
        });

        let err = HttpDirFetcher.fetch_server_descriptor(addr).await.unwrap_err();
        assert!(matches!(err, Error::Probe(_)));
    }

    #[tokio::test]
    async fn test_http_fetcher_refused_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let err = HttpDirFetcher.fetch_server_descriptor(addr).await.unwrap_err();
        assert!(matches!(err, Error::Io(_)));
    }

    #[tokio::test]
    async fn test_task_dispatcher_without_dirport_reports_failure() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let ports = RelayPorts::new("127.0.0.1".parse().unwrap(), 9001, None);
        let mut dispatcher = TaskDispatcher::new(
            Arc::new(FakeCircuits::always(CircuitScript::Build)),
            Arc::new(FakeFetcher { answer: Some(200) }),
            &ports,
            Duration::from_secs(1),
            Duration::from_secs(1),
            tx,
        );

        dispatcher.dispatch(ticket(Port::Dir));
        let event = rx.recv().await.unwrap();
        assert!(matches!(
            event,
            ProbeEvent::Finished(_, ProbeOutcome::Unreachable(_))
        ));
    }

    #[tokio::test]
    async fn test_task_dispatcher_runs_or_probe() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let ports = RelayPorts::new("127.0.0.1".parse().unwrap(), 9001, Some(9030));
        let mut dispatcher = TaskDispatcher::new(
            Arc::new(FakeCircuits::always(CircuitScript::Build)),
            Arc::new(FakeFetcher { answer: Some(200) }),
            &ports,
            Duration::from_secs(1),
            Duration::from_secs(1),
            tx,
        );

        dispatcher.dispatch(ticket(Port::Or));
        assert_eq!(rx.recv().await, Some(ProbeEvent::Launched(ticket(Port::Or))));
        assert_eq!(
            rx.recv().await,
            Some(ProbeEvent::Finished(ticket(Port::Or), ProbeOutcome::Reachable))
        );
    }
}
