//! Connectivity state machine.
//!
//! Owns the provisioned/connected/degraded state and the consecutive
//! internet-failure counter. The firmware layer feeds it link status and
//! probe results; it answers with the action to take, so the transition
//! logic stays off the hardware and under test.

/// Cadence of the link + reachability re-check.
pub const INTERNET_CHECK_INTERVAL_MS: u64 = 30_000;
/// Consecutive probe failures with the link up before falling back to the
/// configuration portal.
pub const MAX_CONSECUTIVE_FAILURES: u32 = 3;
/// Bounded station-association retry window.
pub const ASSOCIATION_ATTEMPTS: u32 = 20;
pub const ASSOCIATION_RETRY_DELAY_MS: u64 = 1_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityState {
    /// No stored credentials; the portal opens straight away.
    Unprovisioned,
    Connecting,
    Connected,
    /// Associated to the AP but the internet probe is failing.
    ConnectedNoInternet,
    /// Serving the configuration portal; exits only via restart.
    PortalActive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckAction {
    /// Connectivity is healthy, or degradation is still below threshold.
    None,
    /// Link dropped; reattempt station association.
    Reconnect,
    /// Tear down the current association first, then raise the portal.
    OpenPortal,
}

#[derive(Debug)]
pub struct ConnectivityMonitor {
    state: ConnectivityState,
    consecutive_failures: u32,
    last_check_ms: Option<u64>,
}

impl ConnectivityMonitor {
    pub fn new(provisioned: bool) -> Self {
        Self {
            state: if provisioned {
                ConnectivityState::Connecting
            } else {
                ConnectivityState::Unprovisioned
            },
            consecutive_failures: 0,
            last_check_ms: None,
        }
    }

    pub fn state(&self) -> ConnectivityState {
        self.state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// True when uploads may proceed.
    pub fn is_online(&self) -> bool {
        self.state == ConnectivityState::Connected
    }

    /// Boot-time decision. An unprovisioned device goes straight to the
    /// portal without attempting association.
    pub fn boot_action(&mut self) -> CheckAction {
        if self.state == ConnectivityState::Unprovisioned {
            self.state = ConnectivityState::PortalActive;
            CheckAction::OpenPortal
        } else {
            CheckAction::None
        }
    }

    /// Association completed inside the retry window; `internet_ok` is the
    /// result of the follow-up reachability probe.
    pub fn association_succeeded(&mut self, internet_ok: bool) {
        if internet_ok {
            self.state = ConnectivityState::Connected;
            self.consecutive_failures = 0;
        } else {
            self.state = ConnectivityState::ConnectedNoInternet;
            self.consecutive_failures += 1;
        }
    }

    /// Association retries exhausted; fall back to the portal.
    pub fn association_failed(&mut self) -> CheckAction {
        self.state = ConnectivityState::PortalActive;
        CheckAction::OpenPortal
    }

    /// Rate-limits the periodic check to the 30 s cadence.
    pub fn check_due(&mut self, now_ms: u64) -> bool {
        match self.last_check_ms {
            Some(last) if now_ms.saturating_sub(last) < INTERNET_CHECK_INTERVAL_MS => false,
            _ => {
                self.last_check_ms = Some(now_ms);
                true
            }
        }
    }

    /// The periodic link re-check found the association gone.
    pub fn link_lost(&mut self) -> CheckAction {
        if self.state == ConnectivityState::PortalActive {
            return CheckAction::None;
        }
        self.state = ConnectivityState::Connecting;
        CheckAction::Reconnect
    }

    /// Outcome of a reachability probe taken while the link was up.
    pub fn probe_result(&mut self, ok: bool) -> CheckAction {
        if self.state == ConnectivityState::PortalActive {
            return CheckAction::None;
        }

        if ok {
            self.consecutive_failures = 0;
            self.state = ConnectivityState::Connected;
            return CheckAction::None;
        }

        self.consecutive_failures += 1;
        if self.consecutive_failures >= MAX_CONSECUTIVE_FAILURES {
            self.state = ConnectivityState::PortalActive;
            CheckAction::OpenPortal
        } else {
            self.state = ConnectivityState::ConnectedNoInternet;
            CheckAction::None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn unprovisioned_boot_opens_portal_without_associating() {
        let mut monitor = ConnectivityMonitor::new(false);
        assert_eq!(monitor.state(), ConnectivityState::Unprovisioned);

        assert_eq!(monitor.boot_action(), CheckAction::OpenPortal);
        assert_eq!(monitor.state(), ConnectivityState::PortalActive);
    }

    #[test]
    fn provisioned_boot_starts_connecting() {
        let mut monitor = ConnectivityMonitor::new(true);
        assert_eq!(monitor.state(), ConnectivityState::Connecting);
        assert_eq!(monitor.boot_action(), CheckAction::None);
        assert_eq!(monitor.state(), ConnectivityState::Connecting);
    }

    #[test]
    fn association_with_internet_goes_connected() {
        let mut monitor = ConnectivityMonitor::new(true);
        monitor.association_succeeded(true);
        assert_eq!(monitor.state(), ConnectivityState::Connected);
        assert!(monitor.is_online());
        assert_eq!(monitor.consecutive_failures(), 0);
    }

    #[test]
    fn association_without_internet_counts_a_failure() {
        let mut monitor = ConnectivityMonitor::new(true);
        monitor.association_succeeded(false);
        assert_eq!(monitor.state(), ConnectivityState::ConnectedNoInternet);
        assert!(!monitor.is_online());
        assert_eq!(monitor.consecutive_failures(), 1);
    }

    #[test]
    fn exhausted_association_falls_back_to_portal() {
        let mut monitor = ConnectivityMonitor::new(true);
        assert_eq!(monitor.association_failed(), CheckAction::OpenPortal);
        assert_eq!(monitor.state(), ConnectivityState::PortalActive);
    }

    #[test]
    fn three_probe_failures_with_link_up_open_portal() {
        let mut monitor = ConnectivityMonitor::new(true);
        monitor.association_succeeded(true);

        assert_eq!(monitor.probe_result(false), CheckAction::None);
        assert_eq!(monitor.state(), ConnectivityState::ConnectedNoInternet);
        assert_eq!(monitor.probe_result(false), CheckAction::None);
        assert_eq!(monitor.consecutive_failures(), 2);

        // Third consecutive failure: caller must tear down Wi-Fi, then
        // raise the portal.
        assert_eq!(monitor.probe_result(false), CheckAction::OpenPortal);
        assert_eq!(monitor.state(), ConnectivityState::PortalActive);
    }

    #[test]
    fn any_probe_success_resets_the_counter() {
        let mut monitor = ConnectivityMonitor::new(true);
        monitor.association_succeeded(true);

        monitor.probe_result(false);
        monitor.probe_result(false);
        assert_eq!(monitor.consecutive_failures(), 2);

        assert_eq!(monitor.probe_result(true), CheckAction::None);
        assert_eq!(monitor.consecutive_failures(), 0);
        assert_eq!(monitor.state(), ConnectivityState::Connected);

        // The counter starts over; two more failures do not open the portal.
        monitor.probe_result(false);
        assert_eq!(monitor.probe_result(false), CheckAction::None);
    }

    #[test]
    fn link_drop_triggers_reconnect() {
        let mut monitor = ConnectivityMonitor::new(true);
        monitor.association_succeeded(true);

        assert_eq!(monitor.link_lost(), CheckAction::Reconnect);
        assert_eq!(monitor.state(), ConnectivityState::Connecting);
        assert!(!monitor.is_online());
    }

    #[test]
    fn periodic_check_honors_cadence() {
        let mut monitor = ConnectivityMonitor::new(true);

        assert!(monitor.check_due(0));
        assert!(!monitor.check_due(29_999));
        assert!(monitor.check_due(30_000));
        assert!(!monitor.check_due(45_000));
        assert!(monitor.check_due(60_001));
    }
}
