//! Reachability verdicts for the descriptor publisher.
//!
//! The reporter reads [`ReachabilityState`] to answer the publisher's
//! questions, and owns the "found reachable" write path so that every
//! confirmation is generation-checked and announced exactly once.

use crate::config::RelayPorts;
use crate::reachability::{Confirmation, Generation, Port, ReachabilityState};
use crate::{plog_fmt, LogLevel};

/// Publisher-facing view of reachability.
#[derive(Debug, Clone)]
pub struct Reporter {
    ports: RelayPorts,
    complaint_after: f64,
    complained: Option<Generation>,
    descriptor_dirty: bool,
}

impl Reporter {
    /// Creates a reporter that complains once testing has gone on for
    /// `complaint_after_secs` without confirmation.
    pub fn new(ports: RelayPorts, complaint_after_secs: u64) -> Self {
        Self {
            ports,
            complaint_after: complaint_after_secs as f64,
            complained: None,
            descriptor_dirty: false,
        }
    }

    /// Uses new listener addresses in future messages.
    pub fn update_ports(&mut self, ports: &RelayPorts) {
        self.ports = ports.clone();
    }

    /// Whether the OR port is confirmed.
    pub fn or_confirmed(&self, state: &ReachabilityState) -> bool {
        state.is_confirmed(Port::Or)
    }

    /// Whether the Dir port is confirmed.
    pub fn dir_confirmed(&self, state: &ReachabilityState) -> bool {
        state.is_confirmed(Port::Dir)
    }

    /// Whether either port still awaits confirmation.
    pub fn still_pending(&self, state: &ReachabilityState) -> bool {
        state.any_pending()
    }

    /// Whether the relay may advertise itself.
    pub fn publishable(&self, state: &ReachabilityState) -> bool {
        state.all_confirmed()
    }

    /// Returns and clears the "descriptor needs rebuilding" flag.
    pub fn take_descriptor_dirty(&mut self) -> bool {
        std::mem::take(&mut self.descriptor_dirty)
    }

    /// Applies a successful OR port probe.
    pub fn or_found_reachable(
        &mut self,
        state: &mut ReachabilityState,
        generation: Generation,
    ) -> Confirmation {
        self.found_reachable(state, Port::Or, generation)
    }

    /// Applies a successful Dir port probe.
    pub fn dir_found_reachable(
        &mut self,
        state: &mut ReachabilityState,
        generation: Generation,
    ) -> Confirmation {
        self.found_reachable(state, Port::Dir, generation)
    }

    /// Applies a successful probe of `port`.
    pub fn found_reachable(
        &mut self,
        state: &mut ReachabilityState,
        port: Port,
        generation: Generation,
    ) -> Confirmation {
        let confirmation = state.found_reachable(port, generation);
        match confirmation {
            Confirmation::NewlyConfirmed => {
                let addr = match port {
                    Port::Or => Some(self.ports.or_addr()),
                    Port::Dir => self.ports.dir_addr(),
                };
                let publishing = if state.all_confirmed() {
                    " Publishing server descriptor."
                } else {
                    ""
                };
                match addr {
                    Some(addr) => plog_fmt!(
                        LogLevel::Notice,
                        "Self-testing indicates your {} {} is reachable from the outside. Excellent.{}",
                        port,
                        addr,
                        publishing
                    ),
                    None => plog_fmt!(
                        LogLevel::Notice,
                        "Self-testing indicates your {} is reachable from the outside. Excellent.{}",
                        port,
                        publishing
                    ),
                }
                self.descriptor_dirty = true;
            }
            Confirmation::AlreadyConfirmed => {}
            Confirmation::Stale => plog_fmt!(
                LogLevel::Debug,
                "Ignoring stale {} success from generation {} (current {}).",
                port,
                generation,
                state.generation()
            ),
        }
        confirmation
    }

    /// Warns once per generation when testing has gone on too long.
    /// Returns true if a warning was emitted.
    pub fn check_unreachable(&mut self, state: &ReachabilityState, now: f64) -> bool {
        let Some(since) = state.testing_since() else {
            return false;
        };
        if now - since < self.complaint_after || self.complained == Some(state.generation()) {
            return false;
        }
        self.complained = Some(state.generation());

        let unconfirmed: Vec<String> = Port::ALL
            .iter()
            .filter(|&&p| !state.is_confirmed(p))
            .map(|p| p.to_string())
            .collect();
        plog_fmt!(
            LogLevel::Warn,
            "Your server has not managed to confirm that its {} {} reachable after {} minutes. \
             Relays do not publish descriptors until their ORPort and DirPort are reachable. \
             Please check your firewalls, ports, address, /etc/hosts file, etc.",
            unconfirmed.join(" and "),
            if unconfirmed.len() == 1 { "is" } else { "are" },
            (self.complaint_after / 60.0).round()
        );
        true
    }
}
