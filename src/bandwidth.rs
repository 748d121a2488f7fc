//! Bandwidth self-measurement over self-routed test circuits.
//!
//! Once both ports are confirmed, the relay builds a handful of circuits
//! through itself and pushes a bounded number of cells down each to learn
//! how much traffic it can actually carry.
//!
//! # Cell Budget
//!
//! The total number of cells sent is
//! `min(bandwidth_rate * 10 / CELL_MAX_NETWORK_SIZE, CIRCWINDOW_START)`,
//! split evenly across the circuits that actually got built. The cap keeps
//! a test within a single circuit window.
//!
//! # Partial Failure
//!
//! Circuits that fail to build or stall are simply left out. If fewer than
//! `min_bandwidth_circuits` survive, or the surviving circuits moved no
//! bytes at all, the test is
//! [`Inconclusive`](BandwidthVerdict::Inconclusive) rather than an estimate
//! of zero.
//!
//! # Staleness
//!
//! A plan carries the reachability generation it was made under. Once the
//! ports are reset, a verdict from an older generation is dropped, and the
//! last stored verdict is forgotten with the reset.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::task::JoinSet;

use crate::config::SelftestConfig;
use crate::logger::plog;
use crate::prober::{SelfCircuitBuilder, TestCircuit};
use crate::reachability::{Generation, Port, ReachabilityState};
use crate::LogLevel;

/// Largest cell on the wire, in bytes.
pub const CELL_MAX_NETWORK_SIZE: u64 = 514;

/// Initial circuit-level flow control window, in cells.
pub const CIRCWINDOW_START: u64 = 1000;

/// Cells a test may send in total for the given advertised rate.
///
/// ```rust
/// use relay_selftest::bandwidth::cell_budget;
///
/// assert_eq!(cell_budget(0), 0);
/// assert_eq!(cell_budget(25_000), 486);
/// assert_eq!(cell_budget(1 << 30), 1000);
/// ```
pub fn cell_budget(bandwidth_rate: u64) -> u64 {
    (bandwidth_rate.saturating_mul(10) / CELL_MAX_NETWORK_SIZE).min(CIRCWINDOW_START)
}

/// Parameters of one bandwidth test.
#[derive(Debug, Clone, PartialEq)]
pub struct BandwidthPlan {
    /// Circuits to build.
    pub circuits: u32,
    /// Fewest built circuits that still give a usable estimate.
    pub min_circuits: u32,
    /// Cells to send across all circuits.
    pub total_cells: u64,
    /// How long traffic is driven.
    pub window: Duration,
    /// When the test was scheduled, epoch seconds.
    pub started_at: f64,
    /// Reachability generation the test was scheduled under.
    pub generation: Generation,
}

impl BandwidthPlan {
    /// Cells each of `built` circuits carries.
    pub fn cells_per_circuit(&self, built: u32) -> u32 {
        if built == 0 {
            return 0;
        }
        u32::try_from(self.total_cells / built as u64).unwrap_or(u32::MAX)
    }
}

/// Measurements from a conclusive test.
#[derive(Debug, Clone, PartialEq)]
pub struct BandwidthTestResult {
    /// Circuits that carried traffic.
    pub circuits_used: u32,
    /// Bytes moved across all of them.
    pub bytes_transferred: u64,
    /// Wall time spent driving traffic.
    pub elapsed: Duration,
    /// Bytes per second.
    pub estimated_capacity: f64,
}

/// Why a bandwidth test produced no estimate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InconclusiveReason {
    /// Fewer circuits worked than the plan required.
    TooFewCircuits,
    /// Circuits worked but no bytes moved, or there was nothing to send.
    NoTraffic,
}

/// Outcome of a bandwidth test.
#[derive(Debug, Clone, PartialEq)]
pub enum BandwidthVerdict {
    /// Enough circuits carried traffic to produce an estimate.
    Estimate(BandwidthTestResult),
    /// No estimate could be made.
    Inconclusive {
        /// Circuits that worked.
        built: u32,
        /// Circuits that were needed.
        required: u32,
        /// What went wrong.
        reason: InconclusiveReason,
    },
}

impl BandwidthVerdict {
    /// The estimate in bytes per second, if the test was conclusive.
    pub fn capacity(&self) -> Option<f64> {
        match self {
            BandwidthVerdict::Estimate(result) => Some(result.estimated_capacity),
            BandwidthVerdict::Inconclusive { .. } => None,
        }
    }
}

/// Bookkeeping for bandwidth tests: at most one in flight, repeated on an
/// interval, last verdict kept for the publisher.
#[derive(Debug, Clone)]
pub struct BandwidthTester {
    bandwidth_rate: u64,
    default_circuits: u32,
    min_circuits: u32,
    window: Duration,
    interval_secs: f64,
    in_flight: Option<Generation>,
    last_test_at: Option<f64>,
    last_verdict: Option<BandwidthVerdict>,
}

impl BandwidthTester {
    /// Creates a tester from the self-test configuration.
    pub fn new(config: &SelftestConfig) -> Self {
        Self {
            bandwidth_rate: config.bandwidth_rate,
            default_circuits: config.num_bandwidth_circuits,
            min_circuits: config.min_bandwidth_circuits,
            window: config.bandwidth_test_duration(),
            interval_secs: config.bandwidth_test_interval_secs as f64,
            in_flight: None,
            last_test_at: None,
            last_verdict: None,
        }
    }

    /// Whether a test is running.
    pub fn in_flight(&self) -> bool {
        self.in_flight.is_some()
    }

    /// Verdict of the most recent completed test.
    pub fn last_verdict(&self) -> Option<&BandwidthVerdict> {
        self.last_verdict.as_ref()
    }

    /// When the most recent test was started.
    pub fn last_test_at(&self) -> Option<f64> {
        self.last_test_at
    }

    /// Whether a periodic test should start at `now`.
    pub fn is_due(&self, now: f64) -> bool {
        if self.in_flight() {
            return false;
        }
        match self.last_test_at {
            None => true,
            Some(last) => now - last >= self.interval_secs,
        }
    }

    /// Plans a test with `num_circs` circuits (0 selects the configured
    /// count). Returns `None` when the test must be skipped.
    pub fn plan(
        &mut self,
        state: &ReachabilityState,
        num_circs: u32,
        now: f64,
    ) -> Option<BandwidthPlan> {
        if let Some(port) = Port::ALL.into_iter().find(|&p| !state.is_confirmed(p)) {
            plog(
                LogLevel::Notice,
                &format!(
                    "Not testing bandwidth yet: {} is not confirmed reachable.",
                    port
                ),
            );
            return None;
        }
        if self.in_flight() {
            plog(
                LogLevel::Debug,
                "Bandwidth test already in progress; not starting another.",
            );
            return None;
        }

        let circuits = if num_circs == 0 {
            self.default_circuits
        } else {
            num_circs
        };
        let generation = state.generation();
        self.in_flight = Some(generation);
        self.last_test_at = Some(now);

        Some(BandwidthPlan {
            circuits,
            min_circuits: self.min_circuits.clamp(1, circuits.max(1)),
            total_cells: cell_budget(self.bandwidth_rate),
            window: self.window,
            started_at: now,
            generation,
        })
    }

    /// Stores the verdict of the test planned under `generation` and frees
    /// the in-flight slot. Returns false, storing nothing, if that test is
    /// not the one in flight.
    pub fn record(&mut self, generation: Generation, verdict: BandwidthVerdict) -> bool {
        if self.in_flight != Some(generation) {
            plog(
                LogLevel::Debug,
                &format!(
                    "Dropping stale bandwidth result from generation {}.",
                    generation
                ),
            );
            return false;
        }
        self.in_flight = None;
        match &verdict {
            BandwidthVerdict::Estimate(result) => plog(
                LogLevel::Notice,
                &format!(
                    "Bandwidth self-test finished: {} bytes over {} circuit(s) in {:.1}s, \
                     estimated capacity {:.0} bytes/s.",
                    result.bytes_transferred,
                    result.circuits_used,
                    result.elapsed.as_secs_f64(),
                    result.estimated_capacity
                ),
            ),
            BandwidthVerdict::Inconclusive {
                built,
                required,
                reason: InconclusiveReason::TooFewCircuits,
            } => plog(
                LogLevel::Warn,
                &format!(
                    "Bandwidth self-test inconclusive: only {} of {} required circuit(s) worked.",
                    built, required
                ),
            ),
            BandwidthVerdict::Inconclusive {
                built,
                reason: InconclusiveReason::NoTraffic,
                ..
            } => plog(
                LogLevel::Notice,
                &format!(
                    "Bandwidth self-test inconclusive: {} circuit(s) carried no traffic.",
                    built
                ),
            ),
        }
        self.last_verdict = Some(verdict);
        true
    }

    /// Forgets the in-flight test and the last verdict. Called when the
    /// reachability record is reset.
    pub fn reset(&mut self) {
        self.in_flight = None;
        self.last_verdict = None;
        self.last_test_at = None;
    }
}

/// Builds the planned circuits, drives traffic through the ones that
/// complete, and closes every circuit it opened.
pub async fn run_bandwidth_test(
    circuits: Arc<dyn SelfCircuitBuilder>,
    plan: &BandwidthPlan,
    build_timeout: Duration,
) -> BandwidthVerdict {
    if plan.total_cells == 0 {
        return BandwidthVerdict::Inconclusive {
            built: 0,
            required: plan.min_circuits,
            reason: InconclusiveReason::NoTraffic,
        };
    }

    let mut builds = JoinSet::new();
    for _ in 0..plan.circuits {
        let builder = circuits.clone();
        builds.spawn(async move {
            let circuit = builder.launch_self_circuit().await.ok()?;
            match tokio::time::timeout(build_timeout, builder.wait_until_built(&circuit)).await {
                Ok(Ok(())) => Some(circuit),
                _ => {
                    builder.close_circuit(&circuit).await;
                    None
                }
            }
        });
    }

    let mut built: Vec<TestCircuit> = Vec::new();
    while let Some(joined) = builds.join_next().await {
        if let Ok(Some(circuit)) = joined {
            built.push(circuit);
        }
    }

    let built_count = built.len() as u32;
    if built_count < plan.min_circuits {
        close_all(circuits.as_ref(), &built).await;
        return BandwidthVerdict::Inconclusive {
            built: built_count,
            required: plan.min_circuits,
            reason: InconclusiveReason::TooFewCircuits,
        };
    }

    let cells = plan.cells_per_circuit(built_count);
    let bound = plan.window + build_timeout;
    let started = Instant::now();
    let mut drives = JoinSet::new();
    for circuit in built.iter().cloned() {
        let builder = circuits.clone();
        let window = plan.window;
        drives.spawn(async move {
            tokio::time::timeout(bound, builder.drive_traffic(&circuit, cells, window)).await
        });
    }

    let mut circuits_used = 0u32;
    let mut bytes_transferred = 0u64;
    while let Some(joined) = drives.join_next().await {
        if let Ok(Ok(Ok(bytes))) = joined {
            circuits_used += 1;
            bytes_transferred += bytes;
        }
    }
    let elapsed = started.elapsed();

    close_all(circuits.as_ref(), &built).await;

    if circuits_used < plan.min_circuits {
        return BandwidthVerdict::Inconclusive {
            built: circuits_used,
            required: plan.min_circuits,
            reason: InconclusiveReason::TooFewCircuits,
        };
    }
    if bytes_transferred == 0 {
        return BandwidthVerdict::Inconclusive {
            built: circuits_used,
            required: plan.min_circuits,
            reason: InconclusiveReason::NoTraffic,
        };
    }

    let secs = elapsed.max(Duration::from_millis(1)).as_secs_f64();
    BandwidthVerdict::Estimate(BandwidthTestResult {
        circuits_used,
        bytes_transferred,
        elapsed,
        estimated_capacity: bytes_transferred as f64 / secs,
    })
}

async fn close_all(builder: &dyn SelfCircuitBuilder, circuits: &[TestCircuit]) {
    for circuit in circuits {
        builder.close_circuit(circuit).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Overrides;
    use crate::prober::testing::{CircuitScript, FakeCircuits};

    fn confirmed_state() -> ReachabilityState {
        let mut state = ReachabilityState::new(Overrides { or: true, dir: true });
        state.confirm_by_override(Port::Or);
        state.confirm_by_override(Port::Dir);
        state
    }

    fn plan(circuits: u32, min_circuits: u32) -> BandwidthPlan {
        BandwidthPlan {
            circuits,
            min_circuits,
            total_cells: 1000,
            window: Duration::from_secs(30),
            started_at: 0.0,
            generation: Generation(0),
        }
    }

    fn too_few(built: u32, required: u32) -> BandwidthVerdict {
        BandwidthVerdict::Inconclusive {
            built,
            required,
            reason: InconclusiveReason::TooFewCircuits,
        }
    }

    #[test]
    fn test_cell_budget_caps_at_window() {
        assert_eq!(cell_budget(u64::MAX), CIRCWINDOW_START);
        assert_eq!(cell_budget(514), 10);
    }

    #[test]
    fn test_cells_split_evenly() {
        let p = plan(4, 1);
        assert_eq!(p.cells_per_circuit(4), 250);
        assert_eq!(p.cells_per_circuit(3), 333);
        assert_eq!(p.cells_per_circuit(0), 0);
    }

    #[test]
    fn test_plan_requires_confirmed_ports() {
        let mut tester = BandwidthTester::new(&SelftestConfig::default());
        let state = ReachabilityState::default();
        assert!(tester.plan(&state, 4, 0.0).is_none());
        assert!(!tester.in_flight());
    }

    #[test]
    fn test_one_test_in_flight() {
        let mut tester = BandwidthTester::new(&SelftestConfig::default());
        let state = confirmed_state();

        let first = tester.plan(&state, 0, 10.0).unwrap();
        assert_eq!(first.circuits, 4);
        assert_eq!(first.generation, state.generation());
        assert!(tester.plan(&state, 4, 11.0).is_none());

        assert!(tester.record(first.generation, too_few(0, 1)));
        assert!(!tester.in_flight());
        assert!(tester.plan(&state, 2, 12.0).is_some());
    }

    #[test]
    fn test_is_due_follows_interval() {
        let mut config = SelftestConfig::default();
        config.bandwidth_test_interval_secs = 100;
        let mut tester = BandwidthTester::new(&config);
        assert!(tester.is_due(0.0));

        let plan = tester.plan(&confirmed_state(), 0, 0.0).unwrap();
        tester.record(plan.generation, too_few(0, 1));
        assert!(!tester.is_due(50.0));
        assert!(tester.is_due(100.0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_built_circuits_is_inconclusive() {
        let circuits = Arc::new(FakeCircuits::always(CircuitScript::Collapse));
        let verdict = run_bandwidth_test(circuits, &plan(4, 1), Duration::from_secs(60)).await;
        assert_eq!(verdict, too_few(0, 1));
        assert_eq!(verdict.capacity(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_partial_failure_still_estimates() {
        let circuits = Arc::new(FakeCircuits::scripted(
            vec![
                CircuitScript::Build,
                CircuitScript::RefuseLaunch,
                CircuitScript::Hang,
                CircuitScript::Build,
            ],
            CircuitScript::Build,
        ));
        let verdict =
            run_bandwidth_test(circuits.clone(), &plan(4, 2), Duration::from_secs(60)).await;

        match verdict {
            BandwidthVerdict::Estimate(result) => {
                assert_eq!(result.circuits_used, 2);
                assert_eq!(result.bytes_transferred, 2 * 500 * CELL_MAX_NETWORK_SIZE);
                assert!(result.estimated_capacity > 0.0);
            }
            other => panic!("expected estimate, got {:?}", other),
        }
        // Two built circuits plus the one that timed out.
        assert_eq!(circuits.closed.lock().unwrap().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_below_minimum_is_inconclusive() {
        let circuits = Arc::new(FakeCircuits::scripted(
            vec![CircuitScript::Build],
            CircuitScript::Collapse,
        ));
        let verdict = run_bandwidth_test(circuits, &plan(4, 2), Duration::from_secs(60)).await;
        assert_eq!(verdict, too_few(1, 2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_bytes_moved_is_inconclusive() {
        let circuits = Arc::new(FakeCircuits::always(CircuitScript::Build).idle());
        let verdict =
            run_bandwidth_test(circuits.clone(), &plan(4, 1), Duration::from_secs(60)).await;

        assert_eq!(
            verdict,
            BandwidthVerdict::Inconclusive {
                built: 4,
                required: 1,
                reason: InconclusiveReason::NoTraffic,
            }
        );
        assert_eq!(verdict.capacity(), None);
        assert_eq!(circuits.closed.lock().unwrap().len(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_cell_budget_builds_nothing() {
        let circuits = Arc::new(FakeCircuits::always(CircuitScript::Build));
        let mut empty = plan(4, 1);
        empty.total_cells = 0;

        let verdict = run_bandwidth_test(circuits.clone(), &empty, Duration::from_secs(60)).await;
        assert!(matches!(
            verdict,
            BandwidthVerdict::Inconclusive {
                reason: InconclusiveReason::NoTraffic,
                ..
            }
        ));
        assert_eq!(circuits.launched(), 0);
    }

    #[test]
    fn test_verdict_from_before_reset_is_dropped() {
        let mut tester = BandwidthTester::new(&SelftestConfig::default());
        let mut state = confirmed_state();
        let before = tester.plan(&state, 0, 0.0).unwrap();

        state.reset();
        tester.reset();
        let estimate = BandwidthVerdict::Estimate(BandwidthTestResult {
            circuits_used: 4,
            bytes_transferred: 300,
            elapsed: Duration::from_secs(30),
            estimated_capacity: 10.0,
        });
        assert!(!tester.record(before.generation, estimate.clone()));
        assert_eq!(tester.last_verdict(), None);
        assert!(!tester.in_flight());

        state.confirm_by_override(Port::Or);
        state.confirm_by_override(Port::Dir);
        let after = tester.plan(&state, 0, 50.0).unwrap();
        assert_ne!(after.generation, before.generation);
        assert!(!tester.record(before.generation, estimate.clone()));
        assert!(tester.in_flight());
        assert!(tester.record(after.generation, estimate.clone()));
        assert_eq!(tester.last_verdict(), Some(&estimate));
    }

    #[test]
    fn test_reset_forgets_last_verdict() {
        let mut tester = BandwidthTester::new(&SelftestConfig::default());
        let plan = tester.plan(&confirmed_state(), 0, 0.0).unwrap();
        tester.record(plan.generation, too_few(0, 1));
        assert!(tester.last_verdict().is_some());

        tester.reset();
        assert_eq!(tester.last_verdict(), None);
        assert!(tester.is_due(1.0));
    }
}
