//! Decides when to probe.
//!
//! The scheduler is the only code that dispatches reachability probes. On
//! each call it walks the requested ports and, for each one, does exactly
//! one of: confirm it by override, leave it alone (confirmed, in flight, or
//! probed too recently), or hand a [`ProbeTicket`] to the dispatcher.
//!
//! ```text
//!   requested port
//!        │
//!        ├─ overridden ────────────▶ Confirmed, no probe
//!        ├─ Confirmed ─────────────▶ skip
//!        ├─ probe outstanding ─────▶ skip
//!        ├─ last probe < interval ─▶ skip
//!        └─ otherwise ─────────────▶ mark Untested, dispatch
//! ```
//!
//! Nothing here can fail synchronously. A failed probe only frees the
//! port's outstanding slot, and the next eligible call probes again.

use crate::config::RelayPorts;
use crate::logger::plog;
use crate::prober::{ProbeDispatcher, ProbeOutcome, ProbeTicket};
use crate::reachability::{Port, ReachabilityState};
use crate::{plog_fmt, LogLevel};

/// How long the operator notice says confirmation may take.
const NOTICE_PATIENCE_MINUTES: u64 = 20;

/// Dispatches probes for a [`ReachabilityState`] it does not own.
pub struct ProbeScheduler<D: ProbeDispatcher> {
    dispatcher: D,
    ports: RelayPorts,
    min_probe_interval: f64,
    announced: bool,
}

impl<D: ProbeDispatcher> ProbeScheduler<D> {
    /// Creates a scheduler that spaces probes of one port at least
    /// `min_probe_interval_secs` apart.
    pub fn new(dispatcher: D, ports: RelayPorts, min_probe_interval_secs: u64) -> Self {
        Self {
            dispatcher,
            ports,
            min_probe_interval: min_probe_interval_secs as f64,
            announced: false,
        }
    }

    /// The dispatcher probes are handed to.
    pub fn dispatcher(&self) -> &D {
        &self.dispatcher
    }

    /// Mutable access to the dispatcher.
    pub fn dispatcher_mut(&mut self) -> &mut D {
        &mut self.dispatcher
    }

    /// Points future probes and notices at new listeners.
    pub fn update_ports(&mut self, ports: &RelayPorts) {
        self.dispatcher.update_ports(ports);
        self.ports = ports.clone();
    }

    /// Schedules probes for the requested ports at time `now`. Returns the
    /// number of probes dispatched.
    pub fn do_reachability_checks(
        &mut self,
        state: &mut ReachabilityState,
        test_or: bool,
        test_dir: bool,
        now: f64,
    ) -> usize {
        let mut dispatched = Vec::new();

        for (port, requested) in [(Port::Or, test_or), (Port::Dir, test_dir)] {
            if !requested {
                continue;
            }
            if state.is_assumed(port) {
                if state.confirm_by_override(port) {
                    plog_fmt!(
                        LogLevel::Notice,
                        "Assuming {} is reachable; not self-testing it.",
                        port
                    );
                }
                continue;
            }

            let current = state.port(port);
            if current.status.is_terminal() {
                continue;
            }
            if current.is_outstanding() {
                plog_fmt!(
                    LogLevel::Debug,
                    "{} probe still outstanding; not launching another.",
                    port
                );
                continue;
            }
            if let Some(last) = current.last_probe_at {
                if now - last < self.min_probe_interval {
                    continue;
                }
            }

            let generation = state.mark_scheduled(port, now);
            self.dispatcher.dispatch(ProbeTicket {
                port,
                generation,
                dispatched_at: now,
            });
            dispatched.push(port);
        }

        if !dispatched.is_empty() && !self.announced {
            self.announced = true;
            plog(LogLevel::Notice, &self.checking_notice(&dispatched));
        }
        dispatched.len()
    }

    fn checking_notice(&self, ports: &[Port]) -> String {
        let targets: Vec<String> = ports
            .iter()
            .map(|port| match port {
                Port::Or => format!("ORPort {}", self.ports.or_addr()),
                Port::Dir => match self.ports.dir_addr() {
                    Some(addr) => format!("DirPort {}", addr),
                    None => "DirPort".to_string(),
                },
            })
            .collect();
        format!(
            "Now checking whether {} {} reachable... (this may take up to {} minutes -- \
             look for log messages indicating success)",
            targets.join(" and "),
            if targets.len() == 1 { "is" } else { "are" },
            NOTICE_PATIENCE_MINUTES
        )
    }

    /// Whether any port is still waiting for confirmation. Pure query.
    pub fn inform_testing_reachability(&self, state: &ReachabilityState) -> bool {
        state.any_pending()
    }

    /// Clears both ports and bumps the generation so in-flight results are
    /// dropped when they arrive.
    pub fn reset_reachability(&mut self, state: &mut ReachabilityState) {
        let generation = state.reset();
        self.announced = false;
        plog_fmt!(
            LogLevel::Info,
            "Reachability self-test reset; generation is now {}.",
            generation
        );
    }

    /// Applies a "probe reached the network" report.
    pub fn on_launched(&self, state: &mut ReachabilityState, ticket: &ProbeTicket) {
        state.mark_launched(ticket.port, ticket.generation);
    }

    /// Applies a probe that finished without success.
    pub fn on_probe_failed(
        &self,
        state: &mut ReachabilityState,
        ticket: &ProbeTicket,
        outcome: &ProbeOutcome,
    ) {
        if !state.probe_failed(ticket.port, ticket.generation) {
            plog_fmt!(
                LogLevel::Debug,
                "Dropping stale {} probe result from generation {}.",
                ticket.port,
                ticket.generation
            );
            return;
        }
        match outcome {
            ProbeOutcome::TimedOut => plog_fmt!(
                LogLevel::Info,
                "{} probe timed out; will retry.",
                ticket.port
            ),
            ProbeOutcome::Unreachable(reason) => plog_fmt!(
                LogLevel::Info,
                "{} probe failed: {}; will retry.",
                ticket.port,
                reason
            ),
            ProbeOutcome::Reachable => {}
        }
    }
}


#[cfg(test)]
mod tests {
    use super::testing::RecordingDispatcher;
    use super::*;
    use crate::config::Overrides;
    use crate::reachability::{Confirmation, Generation, PortReachability};

    fn ports() -> RelayPorts {
        RelayPorts::new("198.51.100.7".parse().unwrap(), 9001, Some(9030))
    }

    fn scheduler() -> ProbeScheduler<RecordingDispatcher> {
        ProbeScheduler::new(RecordingDispatcher::default(), ports(), 20)
    }

    #[test]
    fn test_full_scenario() {
        let mut sched = scheduler();
        let mut state = ReachabilityState::default();

        assert_eq!(sched.do_reachability_checks(&mut state, true, true, 0.0), 2);
        assert_eq!(state.status(Port::Or), PortReachability::Untested);
        assert_eq!(state.status(Port::Dir), PortReachability::Untested);

        let or_ticket = sched.dispatcher().tickets[0];
        assert_eq!(or_ticket.port, Port::Or);
        assert_eq!(
            state.found_reachable(Port::Or, or_ticket.generation),
            Confirmation::NewlyConfirmed
        );
        assert!(state.is_confirmed(Port::Or));

        sched.reset_reachability(&mut state);
        assert_eq!(state.status(Port::Or), PortReachability::Unknown);
        assert_eq!(state.status(Port::Dir), PortReachability::Unknown);
        assert_eq!(state.generation(), Generation(1));

        assert_eq!(
            state.found_reachable(Port::Or, or_ticket.generation),
            Confirmation::Stale
        );
        assert_eq!(state.status(Port::Or), PortReachability::Unknown);
    }

    #[test]
    fn test_rapid_calls_dispatch_once() {
        let mut sched = scheduler();
        let mut state = ReachabilityState::default();

        sched.do_reachability_checks(&mut state, true, true, 0.0);
        sched.do_reachability_checks(&mut state, true, true, 0.1);

        assert_eq!(sched.dispatcher().dispatched(Port::Or), 1);
        assert_eq!(sched.dispatcher().dispatched(Port::Dir), 1);
    }

    #[test]
    fn test_override_confirms_without_dispatch() {
        let mut sched = scheduler();
        let mut state = ReachabilityState::new(Overrides { or: true, dir: false });

        sched.do_reachability_checks(&mut state, true, true, 0.0);
        assert!(state.is_confirmed(Port::Or));
        assert_eq!(sched.dispatcher().dispatched(Port::Or), 0);
        assert_eq!(sched.dispatcher().dispatched(Port::Dir), 1);
    }

    #[test]
    fn test_failure_frees_slot_after_interval() {
        let mut sched = scheduler();
        let mut state = ReachabilityState::default();

        sched.do_reachability_checks(&mut state, true, false, 0.0);
        let ticket = sched.dispatcher().tickets[0];
        sched.on_launched(&mut state, &ticket);
        sched.on_probe_failed(&mut state, &ticket, &ProbeOutcome::TimedOut);
        assert_eq!(state.status(Port::Or), PortReachability::Tested);

        assert_eq!(sched.do_reachability_checks(&mut state, true, false, 10.0), 0);
        assert_eq!(sched.do_reachability_checks(&mut state, true, false, 20.0), 1);
        assert_eq!(sched.dispatcher().dispatched(Port::Or), 2);
    }

    #[test]
    fn test_confirmed_port_not_reprobed() {
        let mut sched = scheduler();
        let mut state = ReachabilityState::default();

        sched.do_reachability_checks(&mut state, true, false, 0.0);
        let ticket = sched.dispatcher().tickets[0];
        state.found_reachable(Port::Or, ticket.generation);

        assert_eq!(sched.do_reachability_checks(&mut state, true, false, 500.0), 0);
    }

    #[test]
    fn test_unrequested_ports_untouched() {
        let mut sched = scheduler();
        let mut state = ReachabilityState::new(Overrides { or: false, dir: true });

        sched.do_reachability_checks(&mut state, true, false, 0.0);
        assert_eq!(state.status(Port::Dir), PortReachability::Unknown);
    }

    #[test]
    fn test_inform_testing_reachability() {
        let mut sched = scheduler();
        let mut state = ReachabilityState::new(Overrides { or: true, dir: false });
        assert!(sched.inform_testing_reachability(&state));

        sched.do_reachability_checks(&mut state, true, true, 0.0);
        let ticket = sched.dispatcher().tickets[0];
        state.found_reachable(Port::Dir, ticket.generation);
        assert!(!sched.inform_testing_reachability(&state));
    }

    #[test]
    fn test_stale_failure_is_dropped() {
        let mut sched = scheduler();
        let mut state = ReachabilityState::default();

        sched.do_reachability_checks(&mut state, true, false, 0.0);
        let old = sched.dispatcher().tickets[0];
        sched.reset_reachability(&mut state);
        sched.do_reachability_checks(&mut state, true, false, 1.0);

        sched.on_probe_failed(&mut state, &old, &ProbeOutcome::TimedOut);
        assert!(state.port(Port::Or).is_outstanding());
    }

    #[test]
    fn test_checking_notice_wording() {
        let sched = scheduler();
        let notice = sched.checking_notice(&[Port::Or, Port::Dir]);
        assert!(notice.starts_with(
            "Now checking whether ORPort 198.51.100.7:9001 and DirPort 198.51.100.7:9030 are reachable..."
        ));
        assert!(notice.contains("this may take up to 20 minutes"));
    }
}
