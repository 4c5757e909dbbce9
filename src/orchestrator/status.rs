//! Runtime status shared between the orchestrator and the web server

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crate::config::ConnectionStrategy;

/// Where the current cycle is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleState {
    #[default]
    Idle,
    AwaitingUsb,
    ProxyListening,
    Forwarding,
    TearDown,
}

impl fmt::Display for CycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::AwaitingUsb => "awaiting_usb",
            Self::ProxyListening => "proxy_listening",
            Self::Forwarding => "forwarding",
            Self::TearDown => "tear_down",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Default)]
struct StatusInner {
    cycle: CycleState,
    listen_addr: Option<SocketAddr>,
    last_outcome: Option<String>,
    last_session_at: Option<DateTime<Utc>>,
}

/// Orchestrator progress, written by the orchestrator thread only
#[derive(Debug)]
pub struct RuntimeStatus {
    strategy: ConnectionStrategy,
    started_at: DateTime<Utc>,
    cycles: AtomicU64,
    inner: RwLock<StatusInner>,
}

/// Serializable copy of [`RuntimeStatus`]
#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub strategy: ConnectionStrategy,
    pub cycle_state: CycleState,
    pub cycles: u64,
    pub listen_addr: Option<SocketAddr>,
    pub last_outcome: Option<String>,
    pub last_session_at: Option<DateTime<Utc>>,
    pub started_at: DateTime<Utc>,
}

impl RuntimeStatus {
    pub fn new(strategy: ConnectionStrategy) -> Self {
        Self {
            strategy,
            started_at: Utc::now(),
            cycles: AtomicU64::new(0),
            inner: RwLock::new(StatusInner::default()),
        }
    }

    pub fn strategy(&self) -> ConnectionStrategy {
        self.strategy
    }

    pub fn cycle_state(&self) -> CycleState {
        self.inner.read().cycle
    }

    /// Address of the proxy listener while it accepts
    pub fn listen_addr(&self) -> Option<SocketAddr> {
        self.inner.read().listen_addr
    }

    pub(crate) fn begin_cycle(&self) {
        self.cycles.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn set_cycle_state(&self, state: CycleState) {
        self.inner.write().cycle = state;
    }

    pub(crate) fn set_listen_addr(&self, addr: Option<SocketAddr>) {
        self.inner.write().listen_addr = addr;
    }

    pub(crate) fn session_started(&self) {
        self.inner.write().last_session_at = Some(Utc::now());
    }

    pub(crate) fn set_outcome(&self, outcome: impl fmt::Display) {
        self.inner.write().last_outcome = Some(outcome.to_string());
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        let inner = self.inner.read();
        StatusSnapshot {
            strategy: self.strategy,
            cycle_state: inner.cycle,
            cycles: self.cycles.load(Ordering::Relaxed),
            listen_addr: inner.listen_addr,
            last_outcome: inner.last_outcome.clone(),
            last_session_at: inner.last_session_at,
            started_at: self.started_at,
        }
    }
}

/// Admits one session at a time
#[derive(Debug, Default)]
pub struct SessionGuard {
    active: AtomicBool,
}

/// Held for the duration of a session; releases the guard on drop
#[derive(Debug)]
pub struct SessionPermit<'a> {
    guard: &'a SessionGuard,
}

impl SessionGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `None` if another session is active
    pub fn try_acquire(&self) -> Option<SessionPermit<'_>> {
        self.active
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| SessionPermit { guard: self })
    }
}

impl Drop for SessionPermit<'_> {
    fn drop(&mut self) {
        self.guard.active.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_guard_is_single_flight() {
        let guard = SessionGuard::new();

        let permit = guard.try_acquire().unwrap();
        assert!(guard.try_acquire().is_none());
        assert!(guard.try_acquire().is_none());

        drop(permit);
        let permit = guard.try_acquire();
        assert!(permit.is_some());
        assert!(guard.try_acquire().is_none());
    }

    #[test]
    fn test_status_snapshot() {
        let status = RuntimeStatus::new(ConnectionStrategy::UsbFirst);
        status.begin_cycle();
        status.set_cycle_state(CycleState::AwaitingUsb);
        status.set_outcome("accessory timeout");

        let snapshot = status.snapshot();
        assert_eq!(snapshot.cycles, 1);
        assert_eq!(snapshot.cycle_state, CycleState::AwaitingUsb);
        assert_eq!(snapshot.last_outcome.as_deref(), Some("accessory timeout"));

        let json = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(json["strategy"], "USB_FIRST");
        assert_eq!(json["cycle_state"], "awaiting_usb");
    }
}
