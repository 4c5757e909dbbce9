//! Background connect-retry loop

use parking_lot::{Condvar, Mutex};
use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::BluetoothService;

/// One-shot stop flag that sleeping threads can wait on
#[derive(Default)]
pub struct StopSignal {
    stopped: Mutex<bool>,
    cond: Condvar,
}

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve the signal; returns `false` if it was already resolved
    pub fn resolve(&self) -> bool {
        let mut stopped = self.stopped.lock();
        if *stopped {
            return false;
        }
        *stopped = true;
        self.cond.notify_all();
        true
    }

    pub fn is_resolved(&self) -> bool {
        *self.stopped.lock()
    }

    /// Sleep for `timeout` unless resolved first; returns whether it was resolved
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut stopped = self.stopped.lock();
        while !*stopped {
            if self.cond.wait_until(&mut stopped, deadline).timed_out() {
                break;
            }
        }
        *stopped
    }
}

/// Repeatedly tries to connect to the phone until it succeeds or is stopped
pub struct ConnectRetry {
    stop: Arc<StopSignal>,
    handle: JoinHandle<()>,
}

impl ConnectRetry {
    /// Start the loop; the first attempt happens immediately
    pub fn start(bluetooth: Arc<dyn BluetoothService>, interval: Duration) -> io::Result<Self> {
        let stop = Arc::new(StopSignal::new());
        let signal = stop.clone();

        let handle = thread::Builder::new()
            .name("bt-connect".to_string())
            .spawn(move || Self::run(bluetooth.as_ref(), &signal, interval))?;

        Ok(Self { stop, handle })
    }

    fn run(bluetooth: &dyn BluetoothService, stop: &StopSignal, interval: Duration) {
        let mut attempt = 0u32;
        while !stop.is_resolved() {
            attempt += 1;
            match bluetooth.connect() {
                Ok(true) => {
                    info!("Bluetooth connected after {} attempt(s)", attempt);
                    return;
                }
                Ok(false) => debug!("Bluetooth connect attempt {} found no phone", attempt),
                Err(e) => warn!("Bluetooth connect attempt {} failed: {}", attempt, e),
            }

            if stop.wait_timeout(interval) {
                break;
            }
        }
        debug!("Bluetooth connect retry stopped");
    }

    /// Ask the loop to stop
    ///
    /// Does not wait for an attempt in progress. Calling it more than once,
    /// or after the loop ended on its own, does nothing.
    pub fn stop(&self) {
        if self.stop.resolve() {
            info!("Stopping bluetooth connect retry");
        }
    }

    /// Whether the loop thread is still alive
    pub fn is_running(&self) -> bool {
        !self.handle.is_finished()
    }
}
