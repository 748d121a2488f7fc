//! Per-port reachability bookkeeping.
//!
//! [`ReachabilityState`] is the one piece of mutable state the self-test
//! subsystem shares. It is owned by the runtime context and handed by
//! reference to the scheduler, the probe-result path and the reporter; there
//! is no process-wide instance, so tests build as many as they like.
//!
//! # Port State Diagram
//!
//! ```text
//!                 reset (any state)
//!        ┌─────────────────────────────────────┐
//!        ▼                                     │
//!   ┌─────────┐ schedule ┌──────────┐ launch ┌────────┐ found reachable ┌───────────┐
//!   │ Unknown │─────────▶│ Untested │───────▶│ Tested │────────────────▶│ Confirmed │
//!   └─────────┘          └──────────┘        └────────┘                 └───────────┘
//!        │                    │                  ▲ │                          ▲
//!        │                    │                  └─┘ failed / timed out        │
//!        │                    └───── found reachable (generation-current) ────┤
//!        └───────────────────────── override ──────────────────────────────────┘
//! ```
//!
//! A failed probe leaves the status where it is and only frees the port's
//! outstanding slot, so the next eligible tick may probe again.
//!
//! # Generations
//!
//! Every reset bumps a [`Generation`]. A probe captures the generation at
//! dispatch time and its result is applied only if that generation is still
//! current; anything older is dropped.

use std::fmt;

use crate::config::Overrides;

/// Which of the relay's listeners a probe targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Port {
    /// The onion-routing port.
    Or,
    /// The directory port.
    Dir,
}

impl Port {
    /// Both ports, in probe order.
    pub const ALL: [Port; 2] = [Port::Or, Port::Dir];
}

impl fmt::Display for Port {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Port::Or => write!(f, "ORPort"),
            Port::Dir => write!(f, "DirPort"),
        }
    }
}

/// Progress of one port towards confirmation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PortReachability {
    /// Nothing scheduled since the last reset.
    #[default]
    Unknown,
    /// A probe is scheduled but has not reached the network yet.
    Untested,
    /// A probe has been launched; no success observed so far.
    Tested,
    /// Proven reachable, or overridden by the operator.
    Confirmed,
}

impl PortReachability {
    /// Whether this status is final until the next reset.
    pub fn is_terminal(self) -> bool {
        self == PortReachability::Confirmed
    }
}

/// Reset epoch captured by every dispatched probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Generation(pub u64);

impl Generation {
    fn next(self) -> Self {
        Generation(self.0 + 1)
    }
}

impl fmt::Display for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What applying a "found reachable" notification did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Confirmation {
    /// The port moved to Confirmed.
    NewlyConfirmed,
    /// The port was already Confirmed.
    AlreadyConfirmed,
    /// The notification belonged to an older generation and was dropped.
    Stale,
}

/// State kept for a single port.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PortState {
    /// Current status.
    pub status: PortReachability,
    /// Dispatch time (epoch seconds) of the most recent probe.
    pub last_probe_at: Option<f64>,
    /// Time of the first dispatch since the last reset.
    pub first_probe_at: Option<f64>,
    /// Generation carried by the probe in flight, if any.
    pub outstanding: Option<Generation>,
    /// Operator override: skip probing, treat as Confirmed.
    pub assumed: bool,
    /// Probes dispatched since the last reset.
    pub probes_dispatched: u32,
    /// Probes that came back without success since the last reset.
    pub probes_failed: u32,
}

impl PortState {
    /// Whether a probe for this port is in flight.
    pub fn is_outstanding(&self) -> bool {
        self.outstanding.is_some()
    }
}

/// Reachability record for one relay process.
///
/// ```rust
/// use relay_selftest::reachability::{Port, PortReachability, ReachabilityState};
/// use relay_selftest::Overrides;
///
/// let mut state = ReachabilityState::new(Overrides::default());
/// let generation = state.mark_scheduled(Port::Or, 1000.0);
/// assert_eq!(state.status(Port::Or), PortReachability::Untested);
///
/// state.found_reachable(Port::Or, generation);
/// assert!(state.is_confirmed(Port::Or));
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct ReachabilityState {
    or: PortState,
    dir: PortState,
    generation: Generation,
}

impl Default for ReachabilityState {
    fn default() -> Self {
        Self::new(Overrides::default())
    }
}

impl ReachabilityState {
    /// Creates a fresh record with the given overrides.
    pub fn new(overrides: Overrides) -> Self {
        let mut state = Self {
            or: PortState::default(),
            dir: PortState::default(),
            generation: Generation::default(),
        };
        state.set_overrides(overrides);
        state
    }

    /// Replaces the operator overrides. Clearing an override does not
    /// unconfirm a port.
    pub fn set_overrides(&mut self, overrides: Overrides) {
        self.or.assumed = overrides.or;
        self.dir.assumed = overrides.dir;
    }

    /// Current overrides.
    pub fn overrides(&self) -> Overrides {
        Overrides {
            or: self.or.assumed,
            dir: self.dir.assumed,
        }
    }

    /// Read access to one port.
    pub fn port(&self, port: Port) -> &PortState {
        match port {
            Port::Or => &self.or,
            Port::Dir => &self.dir,
        }
    }

    fn port_mut(&mut self, port: Port) -> &mut PortState {
        match port {
            Port::Or => &mut self.or,
            Port::Dir => &mut self.dir,
        }
    }

    /// Status of one port.
    pub fn status(&self, port: Port) -> PortReachability {
        self.port(port).status
    }

    /// Whether one port is Confirmed.
    pub fn is_confirmed(&self, port: Port) -> bool {
        self.status(port).is_terminal()
    }

    /// Whether the port is overridden as reachable.
    pub fn is_assumed(&self, port: Port) -> bool {
        self.port(port).assumed
    }

    /// Current generation.
    pub fn generation(&self) -> Generation {
        self.generation
    }

    /// Confirms the port because of an override. Returns true if this
    /// changed the status.
    pub fn confirm_by_override(&mut self, port: Port) -> bool {
        let p = self.port_mut(port);
        if p.status == PortReachability::Confirmed {
            return false;
        }
        p.status = PortReachability::Confirmed;
        true
    }

    /// Records that a probe for `port` has been dispatched at `now` and
    /// returns the generation the probe must carry.
    pub fn mark_scheduled(&mut self, port: Port, now: f64) -> Generation {
        let generation = self.generation;
        let p = self.port_mut(port);
        if p.status == PortReachability::Unknown {
            p.status = PortReachability::Untested;
        }
        p.last_probe_at = Some(now);
        p.first_probe_at.get_or_insert(now);
        p.outstanding = Some(generation);
        p.probes_dispatched += 1;
        generation
    }

    /// Records that the probe carrying `generation` has reached the network.
    pub fn mark_launched(&mut self, port: Port, generation: Generation) {
        if generation != self.generation {
            return;
        }
        let p = self.port_mut(port);
        if p.status == PortReachability::Untested {
            p.status = PortReachability::Tested;
        }
    }

    /// Applies a "found reachable" notification.
    pub fn found_reachable(&mut self, port: Port, generation: Generation) -> Confirmation {
        if generation != self.generation {
            return Confirmation::Stale;
        }
        let p = self.port_mut(port);
        if p.outstanding == Some(generation) {
            p.outstanding = None;
        }
        if p.status == PortReachability::Confirmed {
            return Confirmation::AlreadyConfirmed;
        }
        p.status = PortReachability::Confirmed;
        Confirmation::NewlyConfirmed
    }

    /// Records that the probe carrying `generation` finished without
    /// success. Returns false if the result was stale.
    pub fn probe_failed(&mut self, port: Port, generation: Generation) -> bool {
        if generation != self.generation {
            return false;
        }
        let p = self.port_mut(port);
        if p.outstanding == Some(generation) {
            p.outstanding = None;
        }
        p.probes_failed += 1;
        true
    }

    /// Clears both ports back to Unknown and bumps the generation.
    /// Overrides are kept.
    pub fn reset(&mut self) -> Generation {
        let overrides = self.overrides();
        self.or = PortState::default();
        self.dir = PortState::default();
        self.set_overrides(overrides);
        self.generation = self.generation.next();
        self.generation
    }

    /// Whether any port is still short of Confirmed.
    pub fn any_pending(&self) -> bool {
        Port::ALL.iter().any(|&p| !self.is_confirmed(p))
    }

    /// Whether both ports are Confirmed.
    pub fn all_confirmed(&self) -> bool {
        !self.any_pending()
    }

    /// Earliest dispatch time among ports that are still unconfirmed.
    pub fn testing_since(&self) -> Option<f64> {
        Port::ALL
            .iter()
            .filter(|&&p| !self.is_confirmed(p))
            .filter_map(|&p| self.port(p).first_probe_at)
            .reduce(f64::min)
    }
}


#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    #[derive(Debug, Clone)]
    enum Op {
        Schedule(bool),
        Launch(bool),
        Succeed(bool, u64),
        Fail(bool, u64),
        Reset,
    }

    fn port(is_or: bool) -> Port {
        if is_or {
            Port::Or
        } else {
            Port::Dir
        }
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            any::<bool>().prop_map(Op::Schedule),
            any::<bool>().prop_map(Op::Launch),
            (any::<bool>(), 0u64..4).prop_map(|(p, g)| Op::Succeed(p, g)),
            (any::<bool>(), 0u64..4).prop_map(|(p, g)| Op::Fail(p, g)),
            Just(Op::Reset),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(200))]

        #[test]
        fn confirmed_only_left_through_reset(ops in prop::collection::vec(op(), 1..60)) {
            let mut state = ReachabilityState::default();
            let mut now = 0.0;

            for op in ops {
                let before = [state.status(Port::Or), state.status(Port::Dir)];
                let mut was_reset = false;
                now += 1.0;
                match op {
                    Op::Schedule(p) => { state.mark_scheduled(port(p), now); }
                    Op::Launch(p) => state.mark_launched(port(p), state.generation()),
                    Op::Succeed(p, g) => { state.found_reachable(port(p), Generation(g)); }
                    Op::Fail(p, g) => { state.probe_failed(port(p), Generation(g)); }
                    Op::Reset => { state.reset(); was_reset = true; }
                }
                for (i, p) in Port::ALL.iter().enumerate() {
                    if before[i] == PortReachability::Confirmed && !was_reset {
                        prop_assert_eq!(state.status(*p), PortReachability::Confirmed);
                    }
                }
            }
        }

        #[test]
        fn stale_generations_never_confirm(resets in 1u64..5, is_or in any::<bool>()) {
            let mut state = ReachabilityState::default();
            let captured = state.mark_scheduled(port(is_or), 0.0);
            for _ in 0..resets {
                state.reset();
            }
            prop_assert_eq!(state.found_reachable(port(is_or), captured), Confirmation::Stale);
            prop_assert!(!state.is_confirmed(port(is_or)));
            prop_assert_eq!(state.generation(), Generation(resets));
        }
    }
}
