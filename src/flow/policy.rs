//! Expiration policy
//!
//! Triggers are checked in a fixed precedence order; the first one that
//! fires decides the record's `expiration_id`.

use crate::config::MeterConfig;

use super::entry::FlowEntry;

/// Why a flow left the cache
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExpirationReason {
    Idle,
    Active,
    TcpTeardown,
    EndOfStream,
    /// Forced by a plugin (negative code)
    Custom(i32),
}

impl ExpirationReason {
    pub fn code(self) -> i32 {
        match self {
            ExpirationReason::Idle => 0,
            ExpirationReason::Active => 1,
            ExpirationReason::TcpTeardown => 2,
            ExpirationReason::EndOfStream => 3,
            ExpirationReason::Custom(code) => code,
        }
    }

    pub fn from_code(code: i32) -> Self {
        match code {
            0 => ExpirationReason::Idle,
            1 => ExpirationReason::Active,
            2 => ExpirationReason::TcpTeardown,
            3 => ExpirationReason::EndOfStream,
            other => ExpirationReason::Custom(other),
        }
    }
}

impl std::fmt::Display for ExpirationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExpirationReason::Idle => write!(f, "idle"),
            ExpirationReason::Active => write!(f, "active"),
            ExpirationReason::TcpTeardown => write!(f, "tcp-teardown"),
            ExpirationReason::EndOfStream => write!(f, "end-of-stream"),
            ExpirationReason::Custom(code) => write!(f, "custom({})", code),
        }
    }
}

/// Timeouts in packet-clock milliseconds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExpirationPolicy {
    pub idle_ms: u64,
    pub active_ms: u64,
    pub tcp_teardown: bool,
}

impl ExpirationPolicy {
    pub fn from_config(config: &MeterConfig) -> Self {
        Self {
            idle_ms: config.idle_timeout_ms(),
            active_ms: config.active_timeout_ms(),
            tcp_teardown: config.tcp_teardown,
        }
    }

    /// Decide whether `entry` expires at packet time `now`
    ///
    /// A zero idle timeout fires at every evaluation. A zero active timeout
    /// disables the active trigger, so such flows expire as idle.
    pub fn evaluate(&self, entry: &FlowEntry, now: u64) -> Option<ExpirationReason> {
        if entry.expiration_id() < 0 {
            return Some(ExpirationReason::Custom(entry.expiration_id()));
        }
        if self.active_fires(entry, now) {
            return Some(ExpirationReason::Active);
        }
        if self.idle_fires(entry, now) {
            return Some(ExpirationReason::Idle);
        }
        if self.tcp_teardown && entry.tcp_closed() {
            return Some(ExpirationReason::TcpTeardown);
        }
        None
    }

    pub fn active_fires(&self, entry: &FlowEntry, now: u64) -> bool {
        self.active_ms > 0 && now.saturating_sub(entry.first_seen_ms()) >= self.active_ms
    }

    pub fn idle_fires(&self, entry: &FlowEntry, now: u64) -> bool {
        now.saturating_sub(entry.last_seen_ms()) >= self.idle_ms
    }

    /// Earliest first-seen time that is still safe from the active timeout at `now`
    pub(crate) fn active_horizon(&self, now: u64) -> Option<u64> {
        if self.active_ms == 0 {
            return None;
        }
        now.checked_sub(self.active_ms)
    }

    /// Earliest last-seen time that is still safe from the idle timeout at `now`
    pub(crate) fn idle_horizon(&self, now: u64) -> Option<u64> {
        now.checked_sub(self.idle_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::NoClassifier;
    use crate::core::{FlowKey, IpProtocol, Observation, TcpFlags};
    use std::net::{IpAddr, Ipv4Addr};

    fn make_entry(ts: &[u64], flags: u8) -> FlowEntry {
        let obs = |t: u64| {
            Observation::new(
                t,
                IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
                IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)),
                IpProtocol::Tcp,
            )
            .with_ports(1234, 80)
            .with_tcp_flags(TcpFlags::from_u8(flags))
        };
        let first = obs(ts[0]);
        let (key, side) = FlowKey::from_observation(&first);
        let mut entry = FlowEntry::new(0, key, side, &first, false, &NoClassifier);
        for &t in ts {
            entry.update(&obs(t));
        }
        entry
    }

    fn policy(idle_ms: u64, active_ms: u64) -> ExpirationPolicy {
        ExpirationPolicy { idle_ms, active_ms, tcp_teardown: false }
    }

    #[test]
    fn test_idle_boundary_is_inclusive() {
        let entry = make_entry(&[1000], 0);
        let p = policy(500, 10_000);
        assert_eq!(p.evaluate(&entry, 1499), None);
        assert_eq!(p.evaluate(&entry, 1500), Some(ExpirationReason::Idle));
    }

    #[test]
    fn test_active_beats_idle() {
        let entry = make_entry(&[0, 100, 900], 0);
        let p = policy(50, 1000);
        assert_eq!(p.evaluate(&entry, 950), Some(ExpirationReason::Idle));
        assert_eq!(p.evaluate(&entry, 1000), Some(ExpirationReason::Active));
    }

    #[test]
    fn test_zero_timeouts_expire_as_idle() {
        let entry = make_entry(&[42], 0);
        assert_eq!(policy(0, 0).evaluate(&entry, 42), Some(ExpirationReason::Idle));
        assert_eq!(policy(0, 1000).evaluate(&entry, 42), Some(ExpirationReason::Idle));
    }

    #[test]
    fn test_zero_active_timeout_is_disabled() {
        let entry = make_entry(&[0, 10, 20], 0);
        let p = policy(1000, 0);
        assert!(!p.active_fires(&entry, 1_000_000));
        assert_eq!(p.active_horizon(1_000_000), None);
        assert_eq!(p.evaluate(&entry, 500), None);
        assert_eq!(p.evaluate(&entry, 1020), Some(ExpirationReason::Idle));
    }

    #[test]
    fn test_plugin_forced_wins() {
        let mut entry = make_entry(&[0], 0);
        entry.set_expiration_id(-7);
        assert_eq!(policy(0, 0).evaluate(&entry, 0), Some(ExpirationReason::Custom(-7)));
    }

    #[test]
    fn test_teardown_only_when_enabled() {
        let entry = make_entry(&[0], 0x04);
        let mut p = policy(1000, 1000);
        assert_eq!(p.evaluate(&entry, 10), None);
        p.tcp_teardown = true;
        assert_eq!(p.evaluate(&entry, 10), Some(ExpirationReason::TcpTeardown));
    }

    #[test]
    fn test_reason_codes() {
        for reason in [
            ExpirationReason::Idle,
            ExpirationReason::Active,
            ExpirationReason::TcpTeardown,
            ExpirationReason::EndOfStream,
            ExpirationReason::Custom(-1),
        ] {
            assert_eq!(ExpirationReason::from_code(reason.code()), reason);
        }
    }
}
