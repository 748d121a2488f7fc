//! The self-test engine behind one interface, with a real and a disabled
//! implementation chosen at startup.
//!
//! [`RelaySelftest`] owns the [`ReachabilityState`] and composes the
//! scheduler, reporter and bandwidth tester around it. [`DisabledSelftest`]
//! stands in when self-testing is turned off: its predicates say "not
//! reachable", and entry points that should never be reached in that mode
//! log a non-fatal bug diagnostic instead of doing anything.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::bandwidth::{BandwidthTester, BandwidthVerdict};
use crate::config::{RelayPorts, SelftestConfig};
use crate::prober::{ProbeDispatcher, ProbeEvent, ProbeOutcome};
use crate::reachability::{Confirmation, Generation, Port, ReachabilityState};
use crate::reporter::Reporter;
use crate::scheduler::ProbeScheduler;
use crate::logger::plog;
use crate::{plog_fmt, LogLevel};

/// Self-test operations the rest of the relay calls.
pub trait Selftest: Send {
    /// Whether self-testing is active.
    fn is_enabled(&self) -> bool;

    /// Whether the OR port is overridden as reachable or already confirmed.
    fn check_whether_orport_reachable(&self, config: &SelftestConfig) -> bool;

    /// Whether the Dir port is overridden as reachable, not configured, or
    /// already confirmed.
    fn check_whether_dirport_reachable(&self, config: &SelftestConfig) -> bool;

    /// Schedules probes for the requested ports. Returns how many were
    /// dispatched.
    fn do_reachability_checks(&mut self, test_or: bool, test_dir: bool, now: f64) -> usize;

    /// Schedules a bandwidth test over `num_circs` circuits. Returns false
    /// when it was skipped.
    fn perform_bandwidth_test(&mut self, num_circs: u32, now: f64) -> bool;

    /// Whether testing is still pending.
    fn inform_testing_reachability(&self) -> bool;

    /// Applies an OR port success carrying `generation`.
    fn orport_found_reachable(&mut self, generation: Generation) -> Confirmation;

    /// Applies a Dir port success carrying `generation`.
    fn dirport_found_reachable(&mut self, generation: Generation) -> Confirmation;

    /// Clears accumulated results.
    fn reset_reachability(&mut self);

    /// Applies a report from a probe or bandwidth task.
    fn handle_event(&mut self, event: ProbeEvent, now: f64);

    /// Takes a fresh listener snapshot. Returns true if it reset the
    /// accumulated results.
    fn update_ports(&mut self, ports: RelayPorts) -> bool;

    /// Periodic housekeeping: probe unconfirmed ports, complain if testing
    /// drags on, start a bandwidth test when one is due.
    fn tick(&mut self, now: f64);

    /// Whether the relay may publish its descriptor.
    fn publishable(&self) -> bool;

    /// Returns and clears the "descriptor needs rebuilding" flag.
    fn take_descriptor_dirty(&mut self) -> bool;

    /// The reachability record, when one exists.
    fn state(&self) -> Option<&ReachabilityState>;

    /// Verdict of the last bandwidth test.
    fn last_bandwidth(&self) -> Option<&BandwidthVerdict>;
}

/// Real self-test engine.
pub struct RelaySelftest<D: ProbeDispatcher> {
    config: SelftestConfig,
    ports: RelayPorts,
    state: ReachabilityState,
    scheduler: ProbeScheduler<D>,
    reporter: Reporter,
    bandwidth: BandwidthTester,
}

impl<D: ProbeDispatcher> RelaySelftest<D> {
    /// Creates an engine for the relay described by `ports`.
    pub fn new(config: SelftestConfig, ports: RelayPorts, dispatcher: D) -> Self {
        let state = ReachabilityState::new(ports.overrides(&config));
        Self {
            scheduler: ProbeScheduler::new(dispatcher, ports.clone(), config.min_probe_interval_secs),
            reporter: Reporter::new(ports.clone(), config.unreachable_complaint_secs),
            bandwidth: BandwidthTester::new(&config),
            state,
            ports,
            config,
        }
    }

    /// The dispatcher probes go to.
    pub fn dispatcher(&self) -> &D {
        self.scheduler.dispatcher()
    }

    /// Bandwidth test bookkeeping.
    pub fn bandwidth(&self) -> &BandwidthTester {
        &self.bandwidth
    }

    fn reset_all(&mut self) {
        self.scheduler.reset_reachability(&mut self.state);
        self.bandwidth.reset();
    }
}

impl<D: ProbeDispatcher> Selftest for RelaySelftest<D> {
    fn is_enabled(&self) -> bool {
        true
    }

    fn check_whether_orport_reachable(&self, config: &SelftestConfig) -> bool {
        config.assume_reachable || self.state.is_assumed(Port::Or) || self.state.is_confirmed(Port::Or)
    }

    fn check_whether_dirport_reachable(&self, config: &SelftestConfig) -> bool {
        config.assume_reachable
            || config.assume_dir_reachable
            || self.ports.dir_port.is_none()
            || self.state.is_assumed(Port::Dir)
            || self.state.is_confirmed(Port::Dir)
    }

    fn do_reachability_checks(&mut self, test_or: bool, test_dir: bool, now: f64) -> usize {
        self.scheduler
            .do_reachability_checks(&mut self.state, test_or, test_dir, now)
    }

    fn perform_bandwidth_test(&mut self, num_circs: u32, now: f64) -> bool {
        match self.bandwidth.plan(&self.state, num_circs, now) {
            Some(plan) => {
                plog_fmt!(
                    LogLevel::Info,
                    "Starting bandwidth self-test over {} circuit(s), {} cells.",
                    plan.circuits,
                    plan.total_cells
                );
                self.scheduler.dispatcher_mut().dispatch_bandwidth_test(plan);
                true
            }
            None => false,
        }
    }

    fn inform_testing_reachability(&self) -> bool {
        self.scheduler.inform_testing_reachability(&self.state)
    }

    fn orport_found_reachable(&mut self, generation: Generation) -> Confirmation {
        self.reporter.or_found_reachable(&mut self.state, generation)
    }

    fn dirport_found_reachable(&mut self, generation: Generation) -> Confirmation {
        self.reporter.dir_found_reachable(&mut self.state, generation)
    }

    fn reset_reachability(&mut self) {
        self.reset_all();
    }

    fn handle_event(&mut self, event: ProbeEvent, _now: f64) {
        match event {
            ProbeEvent::Launched(ticket) => self.scheduler.on_launched(&mut self.state, &ticket),
            ProbeEvent::Finished(ticket, ProbeOutcome::Reachable) => {
                self.reporter
                    .found_reachable(&mut self.state, ticket.port, ticket.generation);
            }
            ProbeEvent::Finished(ticket, outcome) => {
                self.scheduler
                    .on_probe_failed(&mut self.state, &ticket, &outcome)
            }
            ProbeEvent::BandwidthMeasured(generation, verdict) => {
                self.bandwidth.record(generation, verdict);
            }
        }
    }

    fn update_ports(&mut self, ports: RelayPorts) -> bool {
        let moved = self.ports.listeners_changed(&ports);
        let before = self.state.overrides();
        let after = ports.overrides(&self.config);
        // A port confirmed only by override must be tested once the
        // override is gone.
        let override_dropped = (before.or && !after.or) || (before.dir && !after.dir);

        self.state.set_overrides(after);
        self.scheduler.update_ports(&ports);
        self.reporter.update_ports(&ports);
        if moved {
            plog_fmt!(
                LogLevel::Notice,
                "Relay listeners changed (ORPort {}); restarting reachability self-test.",
                ports.or_addr()
            );
        } else if override_dropped {
            plog(
                LogLevel::Notice,
                "AssumeReachable was turned off; restarting reachability self-test.",
            );
        }
        let changed = moved || override_dropped;
        if changed {
            self.reset_all();
        }
        self.ports = ports;
        changed
    }

    fn tick(&mut self, now: f64) {
        let test_or = !self.state.is_confirmed(Port::Or);
        let test_dir = !self.state.is_confirmed(Port::Dir);
        if test_or || test_dir {
            self.do_reachability_checks(test_or, test_dir, now);
            self.reporter.check_unreachable(&self.state, now);
        } else if self.bandwidth.is_due(now) {
            self.perform_bandwidth_test(self.config.num_bandwidth_circuits, now);
        }
    }

    fn publishable(&self) -> bool {
        self.reporter.publishable(&self.state)
    }

    fn take_descriptor_dirty(&mut self) -> bool {
        self.reporter.take_descriptor_dirty()
    }

    fn state(&self) -> Option<&ReachabilityState> {
        Some(&self.state)
    }

    fn last_bandwidth(&self) -> Option<&BandwidthVerdict> {
        self.bandwidth.last_verdict()
    }
}

/// Stand-in used when self-testing is disabled.
#[derive(Debug, Default)]
pub struct DisabledSelftest {
    bugs: AtomicU64,
}

impl DisabledSelftest {
    /// Creates the stand-in.
    pub fn new() -> Self {
        Self::default()
    }

    /// How many unreachable entry points have been hit.
    pub fn bug_count(&self) -> u64 {
        self.bugs.load(Ordering::Relaxed)
    }

    fn bug(&self, operation: &str) {
        self.bugs.fetch_add(1, Ordering::Relaxed);
        plog_fmt!(
            LogLevel::Warn,
            "Bug: {} called while relay self-testing is disabled; this should be unreachable.",
            operation
        );
    }
}

impl Selftest for DisabledSelftest {
    fn is_enabled(&self) -> bool {
        false
    }

    fn check_whether_orport_reachable(&self, _config: &SelftestConfig) -> bool {
        false
    }

    fn check_whether_dirport_reachable(&self, _config: &SelftestConfig) -> bool {
        false
    }

    fn do_reachability_checks(&mut self, _test_or: bool, _test_dir: bool, _now: f64) -> usize {
        self.bug("do_reachability_checks");
        0
    }

    fn perform_bandwidth_test(&mut self, _num_circs: u32, _now: f64) -> bool {
        self.bug("perform_bandwidth_test");
        false
    }

    fn inform_testing_reachability(&self) -> bool {
        self.bug("inform_testing_reachability");
        false
    }

    fn orport_found_reachable(&mut self, _generation: Generation) -> Confirmation {
        Confirmation::Stale
    }

    fn dirport_found_reachable(&mut self, _generation: Generation) -> Confirmation {
        Confirmation::Stale
    }

    fn reset_reachability(&mut self) {}

    fn handle_event(&mut self, _event: ProbeEvent, _now: f64) {}

    fn update_ports(&mut self, _ports: RelayPorts) -> bool {
        false
    }

    fn tick(&mut self, _now: f64) {}

    fn publishable(&self) -> bool {
        false
    }

    fn take_descriptor_dirty(&mut self) -> bool {
        false
    }

    fn state(&self) -> Option<&ReachabilityState> {
        None
    }

    fn last_bandwidth(&self) -> Option<&BandwidthVerdict> {
        None
    }
}

/// Picks the implementation from configuration.
pub fn build_selftest<D>(config: &SelftestConfig, ports: RelayPorts, dispatcher: D) -> Box<dyn Selftest>
where
    D: ProbeDispatcher + 'static,
{
    if config.enable_selftest {
        Box::new(RelaySelftest::new(config.clone(), ports, dispatcher))
    } else {
        plog_fmt!(LogLevel::Notice, "Relay self-testing is disabled.");
        Box::new(DisabledSelftest::new())
    }
}
