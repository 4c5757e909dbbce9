//! Connection orchestrator
//!
//! Runs one cycle per phone session, forever:
//!
//! ```text
//! Idle -> AwaitingUsb (USB_FIRST) -> ProxyListening -> Forwarding -> TearDown -> Idle
//! ```
//!
//! The strategy decides when Bluetooth is powered and whether the head
//! unit's accessory negotiation gates the listener (`USB_FIRST`) or happens
//! lazily after the phone connected (the other strategies).

pub mod status;

pub use status::{CycleState, RuntimeStatus, SessionGuard, SessionPermit, StatusSnapshot};

use parking_lot::Mutex;
use std::fmt;
use std::fs::{File, OpenOptions};
use std::net::{Ipv4Addr, SocketAddrV4, TcpStream};
use std::sync::{Arc, Once};
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::bluetooth::{BluetoothService, ConnectRetry};
use crate::config::{AppConfig, ConnectionStrategy, ProxyConfig, UsbConfig};
use crate::error::{AppError, Result};
use crate::otg::GadgetController;
use crate::proxy::{ProtocolVersion, ProxySession, ProxyStats, SessionReport};
use crate::utils::{bind_tcp_listener, PROXY_BACKLOG};

/// How a cycle ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// A session ran and both directions stopped
    Forwarded(SessionReport),
    /// The head unit did not request accessory mode in time
    AccessoryTimeout,
    /// Gadgets could not be bound
    UsbUnavailable,
    AcceptFailed,
    UsbOpenFailed,
    /// The session could not be set up or the version exchange failed
    SessionFailed,
    /// Another cycle is already running
    Rejected,
}

impl fmt::Display for CycleOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Forwarded(report) => write!(
                f,
                "forwarded (tcp->usb {:?}, usb->tcp {:?})",
                report.tcp_to_usb, report.usb_to_tcp
            ),
            Self::AccessoryTimeout => f.write_str("accessory timeout"),
            Self::UsbUnavailable => f.write_str("usb unavailable"),
            Self::AcceptFailed => f.write_str("accept failed"),
            Self::UsbOpenFailed => f.write_str("usb open failed"),
            Self::SessionFailed => f.write_str("session failed"),
            Self::Rejected => f.write_str("rejected"),
        }
    }
}

/// Sequences Bluetooth, USB gadget negotiation and the proxy session
pub struct Orchestrator {
    /// Fixed for the process lifetime
    strategy: ConnectionStrategy,
    proxy: ProxyConfig,
    usb: UsbConfig,
    connect_retry_interval: Duration,
    gadgets: Arc<GadgetController>,
    bluetooth: Arc<dyn BluetoothService>,
    stats: Arc<ProxyStats>,
    status: Arc<RuntimeStatus>,
    guard: SessionGuard,
    retry: Mutex<Option<ConnectRetry>>,
    dongle_started: Once,
}

impl Orchestrator {
    pub fn new(
        config: &AppConfig,
        gadgets: Arc<GadgetController>,
        bluetooth: Arc<dyn BluetoothService>,
        stats: Arc<ProxyStats>,
        status: Arc<RuntimeStatus>,
    ) -> Self {
        Self {
            strategy: config.connection_strategy,
            proxy: config.proxy.clone(),
            usb: config.usb.clone(),
            connect_retry_interval: Duration::from_secs(config.bluetooth.connect_retry_secs),
            gadgets,
            bluetooth,
            stats,
            status,
            guard: SessionGuard::new(),
            retry: Mutex::new(None),
            dongle_started: Once::new(),
        }
    }

    /// Run cycles until the proxy listener cannot be created
    pub fn run(&self) -> Result<()> {
        info!(
            "Starting connection orchestrator with strategy {}",
            self.strategy
        );
        self.start_dongle_mode();

        loop {
            let outcome = self.run_cycle()?;
            debug!("Cycle finished: {}", outcome);
        }
    }

    /// Dongle mode keeps Bluetooth powered and advertising for the process lifetime
    fn start_dongle_mode(&self) {
        if self.strategy != ConnectionStrategy::DongleMode {
            return;
        }
        self.dongle_started.call_once(|| {
            if let Err(e) = self.bluetooth.power_on() {
                warn!("Failed to power on bluetooth: {}", e);
            }
            if let Err(e) = self.bluetooth.start_advertising() {
                warn!("Failed to start bluetooth advertising: {}", e);
            }
        });
    }

    /// Run a single cycle, always ending with teardown
    ///
    /// Only a listener failure is returned as an error; everything else ends
    /// the cycle with a [`CycleOutcome`].
    pub fn run_cycle(&self) -> Result<CycleOutcome> {
        let Some(_permit) = self.guard.try_acquire() else {
            warn!("Rejecting cycle, a session is already active");
            return Ok(CycleOutcome::Rejected);
        };

        self.status.begin_cycle();
        let result = self.connect_and_forward();
        self.tear_down();

        match &result {
            Ok(outcome) => {
                info!("Cycle ended: {}", outcome);
                self.status.set_outcome(outcome);
            }
            Err(e) => self.status.set_outcome(e),
        }
        result
    }

    fn connect_and_forward(&self) -> Result<CycleOutcome> {
        if self.strategy == ConnectionStrategy::UsbFirst {
            let timeout = Duration::from_secs(self.usb.usb_first_wait_secs);
            if let Some(outcome) = self.await_accessory(timeout) {
                return Ok(outcome);
            }
        }

        if self.strategy != ConnectionStrategy::DongleMode {
            self.start_bluetooth();
        }

        let tcp = match self.accept_phone()? {
            Some(tcp) => tcp,
            None => return Ok(CycleOutcome::AcceptFailed),
        };
        self.stop_connect_retry();

        if self.strategy != ConnectionStrategy::UsbFirst {
            let timeout = Duration::from_secs(self.usb.accessory_wait_secs);
            if let Some(outcome) = self.await_accessory(timeout) {
                return Ok(outcome);
            }
        }

        let usb = match self.open_accessory() {
            Ok(file) => file,
            Err(e) => {
                warn!("{}", e);
                return Ok(CycleOutcome::UsbOpenFailed);
            }
        };

        Ok(self.forward(usb, tcp))
    }

    /// Returns an outcome if the cycle has to end here
    fn await_accessory(&self, timeout: Duration) -> Option<CycleOutcome> {
        self.status.set_cycle_state(CycleState::AwaitingUsb);
        match self.gadgets.enable_default_and_wait_for_accessory(timeout) {
            Ok(true) => None,
            Ok(false) => Some(CycleOutcome::AccessoryTimeout),
            Err(e) => {
                warn!("Failed to start accessory negotiation: {}", e);
                Some(CycleOutcome::UsbUnavailable)
            }
        }
    }

    /// Bind the listener and accept one phone; `Ok(None)` if accepting failed
    fn accept_phone(&self) -> Result<Option<TcpStream>> {
        let ip: Ipv4Addr = self.proxy.bind_address.parse().map_err(|_| {
            AppError::Config(format!(
                "Invalid proxy bind address: {}",
                self.proxy.bind_address
            ))
        })?;
        let addr = SocketAddrV4::new(ip, self.proxy.port);

        info!("Starting tcp server");
        let listener = bind_tcp_listener(addr, PROXY_BACKLOG)
            .map_err(|e| AppError::Proxy(format!("Failed to listen on {}: {}", addr, e)))?;
        let local = listener.local_addr()?;
        self.status.set_listen_addr(Some(local));
        self.status.set_cycle_state(CycleState::ProxyListening);
        info!("Tcp server listening on {}", local.port());

        let accepted = listener.accept();
        self.status.set_listen_addr(None);
        match accepted {
            Ok((tcp, peer)) => {
                info!("Tcp server accepted connection from {}", peer);
                Ok(Some(tcp))
            }
            Err(e) => {
                warn!("Accept failed: {}", e);
                Ok(None)
            }
        }
    }

    fn open_accessory(&self) -> Result<File> {
        info!("Opening usb accessory");
        OpenOptions::new()
            .read(true)
            .write(true)
            .open(&self.usb.accessory_device)
            .map_err(|e| {
                AppError::Usb(format!(
                    "Error opening {}: {}",
                    self.usb.accessory_device, e
                ))
            })
    }

    fn forward(&self, usb: File, tcp: TcpStream) -> CycleOutcome {
        let session = match ProxySession::new(usb, tcp, self.stats.clone()) {
            Ok(session) => session,
            Err(e) => {
                warn!("Failed to create proxy session: {}", e);
                return CycleOutcome::SessionFailed;
            }
        };

        if self.proxy.version_exchange {
            let ours = ProtocolVersion::new(self.proxy.version_major, self.proxy.version_minor);
            if let Err(e) = session.exchange_versions(ours) {
                warn!("{}", e);
                return CycleOutcome::SessionFailed;
            }
        }

        self.status.set_cycle_state(CycleState::Forwarding);
        self.status.session_started();
        CycleOutcome::Forwarded(session.run())
    }

    fn start_bluetooth(&self) {
        if let Err(e) = self.bluetooth.power_on() {
            warn!("Failed to power on bluetooth: {}", e);
        }
        match ConnectRetry::start(self.bluetooth.clone(), self.connect_retry_interval) {
            Ok(retry) => {
                if let Some(previous) = self.retry.lock().replace(retry) {
                    previous.stop();
                }
            }
            Err(e) => warn!("Failed to start bluetooth connect retry: {}", e),
        }
    }

    /// Stop a running connect-retry loop; a no-op when none is active
    fn stop_connect_retry(&self) {
        if let Some(retry) = self.retry.lock().take() {
            if retry.is_running() {
                retry.stop();
            } else {
                debug!("Bluetooth connect retry already finished");
            }
        }
    }

    fn tear_down(&self) {
        self.status.set_cycle_state(CycleState::TearDown);
        self.stop_connect_retry();
        self.gadgets.disable_all();

        if self.strategy != ConnectionStrategy::DongleMode {
            if let Err(e) = self.bluetooth.power_off() {
                warn!("Failed to power off bluetooth: {}", e);
            }
            if let Err(e) = self.bluetooth.stop_advertising() {
                warn!("Failed to stop bluetooth advertising: {}", e);
            }
        }

        thread::sleep(Duration::from_millis(self.proxy.reconnect_delay_ms));
        self.status.set_cycle_state(CycleState::Idle);
    }
}
