//! USB gadget personality switching
//!
//! Two gadgets are prepared in ConfigFS ahead of time: `default`, which the
//! head unit enumerates first, and `accessory`, the Android accessory
//! function. Only one of them may be bound to the UDC at a time; when the
//! head unit starts accessory negotiation the kernel emits a uevent for the
//! accessory node, and the controller swaps `default` for `accessory`.

use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use super::configfs::{find_udc, udc_file, write_file};
use super::uevent::{UeventDispatcher, UeventEnv};
use crate::config::UsbConfig;
use crate::error::{AppError, Result};

/// Uevent value announcing that the host started accessory negotiation
const ACCESSORY_START: &str = "START";

/// Which gadget currently owns the UDC
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GadgetState {
    AllDisabled,
    DefaultActive,
    AccessoryActive,
}

/// Writes gadget UDC bindings
pub trait UdcBinding: Send + Sync {
    /// Bind `gadget` to `udc`, or unbind it when `udc` is empty
    fn write_udc(&self, gadget: &str, udc: &str) -> Result<()>;
}

/// Binding through `<configfs>/<gadget>/UDC`
pub struct ConfigFsBinding {
    configfs_path: PathBuf,
}

impl ConfigFsBinding {
    pub fn new(configfs_path: impl Into<PathBuf>) -> Self {
        Self {
            configfs_path: configfs_path.into(),
        }
    }
}

impl UdcBinding for ConfigFsBinding {
    fn write_udc(&self, gadget: &str, udc: &str) -> Result<()> {
        write_file(&udc_file(&self.configfs_path, gadget), udc)
    }
}

/// One-shot completion signal
struct Completion {
    done: Mutex<bool>,
    cond: Condvar,
}

impl Completion {
    fn new() -> Self {
        Self {
            done: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    fn complete(&self) {
        *self.done.lock() = true;
        self.cond.notify_all();
    }

    /// Wait for completion; a zero timeout waits indefinitely
    fn wait(&self, timeout: Duration) -> bool {
        let mut done = self.done.lock();
        if timeout.is_zero() {
            while !*done {
                self.cond.wait(&mut done);
            }
            return true;
        }

        let deadline = Instant::now() + timeout;
        while !*done {
            if self.cond.wait_until(&mut done, deadline).timed_out() {
                break;
            }
        }
        *done
    }
}

/// Owns the UDC and switches between the default and accessory gadgets
pub struct GadgetController {
    binding: Box<dyn UdcBinding>,
    /// Resolved once at construction
    udc: Option<String>,
    default_gadget: String,
    accessory_gadget: String,
    /// DEVNAME of the accessory node in uevents
    accessory_devname: String,
    settle_delay: Duration,
    uevents: Arc<UeventDispatcher>,
    state: Mutex<GadgetState>,
}

impl GadgetController {
    /// Create the controller for the real ConfigFS and reset both gadgets
    pub fn new(config: &UsbConfig, uevents: Arc<UeventDispatcher>) -> Self {
        info!("Initializing USB gadget controller");

        let udc = find_udc(Path::new(&config.udc_class_path));
        match &udc {
            Some(name) => info!("Found UDC {}", name),
            None => error!(
                "Did not find a UDC in {}, USB accessory mode is unavailable",
                config.udc_class_path
            ),
        }

        let controller = Self::with_binding(
            Box::new(ConfigFsBinding::new(&config.configfs_path)),
            udc,
            config,
            uevents,
        );
        controller.disable_all();
        controller
    }

    /// Create a controller with an explicit binding and UDC
    pub fn with_binding(
        binding: Box<dyn UdcBinding>,
        udc: Option<String>,
        config: &UsbConfig,
        uevents: Arc<UeventDispatcher>,
    ) -> Self {
        let accessory_devname = Path::new(&config.accessory_device)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "usb_accessory".to_string());

        Self {
            binding,
            udc,
            default_gadget: config.default_gadget.clone(),
            accessory_gadget: config.accessory_gadget.clone(),
            accessory_devname,
            settle_delay: Duration::from_millis(config.settle_delay_ms),
            uevents,
            state: Mutex::new(GadgetState::AllDisabled),
        }
    }

    /// UDC the gadgets bind to
    pub fn udc(&self) -> Option<&str> {
        self.udc.as_deref()
    }

    pub fn state(&self) -> GadgetState {
        *self.state.lock()
    }

    fn state_for(&self, gadget: &str) -> Result<GadgetState> {
        if gadget == self.default_gadget {
            Ok(GadgetState::DefaultActive)
        } else if gadget == self.accessory_gadget {
            Ok(GadgetState::AccessoryActive)
        } else {
            Err(AppError::Usb(format!("Unknown gadget: {}", gadget)))
        }
    }

    fn gadget_for(&self, state: GadgetState) -> Option<&str> {
        match state {
            GadgetState::AllDisabled => None,
            GadgetState::DefaultActive => Some(&self.default_gadget),
            GadgetState::AccessoryActive => Some(&self.accessory_gadget),
        }
    }

    /// Bind a gadget to the UDC
    ///
    /// If the other gadget is bound it is unbound first.
    pub fn enable_gadget(&self, gadget: &str) -> Result<()> {
        let udc = self
            .udc
            .as_deref()
            .ok_or_else(|| AppError::Usb("No USB Device Controller (UDC) found".to_string()))?;
        let target = self.state_for(gadget)?;

        let mut state = self.state.lock();
        if *state == target {
            debug!("Gadget {} already bound", gadget);
            return Ok(());
        }
        if let Some(active) = self.gadget_for(*state) {
            self.binding.write_udc(active, "")?;
            *state = GadgetState::AllDisabled;
        }

        self.binding.write_udc(gadget, udc)?;
        *state = target;
        debug!("Bound gadget {} to UDC {}", gadget, udc);
        Ok(())
    }

    /// Unbind a gadget from the UDC
    pub fn disable_gadget(&self, gadget: &str) -> Result<()> {
        let target = self.state_for(gadget)?;

        let mut state = self.state.lock();
        self.binding.write_udc(gadget, "")?;
        if *state == target {
            *state = GadgetState::AllDisabled;
        }
        Ok(())
    }

    /// Unbind both gadgets unconditionally
    ///
    /// Unbinding a gadget that is not bound fails in the kernel; those
    /// errors are expected and only logged at debug level.
    pub fn disable_all(&self) {
        for gadget in [&self.default_gadget, &self.accessory_gadget] {
            if let Err(e) = self.disable_gadget(gadget) {
                debug!("Unbinding {}: {}", gadget, e);
            }
        }
        *self.state.lock() = GadgetState::AllDisabled;
        info!("Disabled all USB gadgets");
    }

    /// Replace `default` with `accessory`, letting the host see a detach in between
    pub fn switch_to_accessory_gadget(&self) -> Result<()> {
        self.disable_gadget(&self.default_gadget)?;
        std::thread::sleep(self.settle_delay);
        self.enable_gadget(&self.accessory_gadget)?;

        info!("Switched to accessory gadget from default");
        Ok(())
    }

    fn is_accessory_start(&self, env: &UeventEnv) -> bool {
        env.get("DEVNAME").map(String::as_str) == Some(self.accessory_devname.as_str())
            && env.get("ACCESSORY").map(String::as_str) == Some(ACCESSORY_START)
    }

    /// Bind `default` and block until the host requests accessory mode
    ///
    /// Returns `Ok(true)` once the switch to the accessory gadget happened,
    /// `Ok(false)` if `timeout` expired first. A zero timeout waits forever.
    /// The uevent handler is withdrawn when the wait gives up.
    pub fn enable_default_and_wait_for_accessory(
        self: &Arc<Self>,
        timeout: Duration,
    ) -> Result<bool> {
        let completion = Arc::new(Completion::new());
        let waiter: Weak<Completion> = Arc::downgrade(&completion);
        let controller: Weak<Self> = Arc::downgrade(self);

        let handler = self.uevents.add_handler(move |env| {
            let Some(completion) = waiter.upgrade() else {
                debug!("Accessory wait abandoned, dropping uevent handler");
                return true;
            };
            let Some(controller) = controller.upgrade() else {
                return true;
            };
            if !controller.is_accessory_start(env) {
                return false;
            }

            info!("Received accessory start request");
            if let Err(e) = controller.switch_to_accessory_gadget() {
                warn!("Failed to switch to accessory gadget: {}", e);
            }
            completion.complete();
            true
        });

        if let Err(e) = self.enable_gadget(&self.default_gadget) {
            self.uevents.remove_handler(handler);
            return Err(e);
        }
        info!("Enabled default gadget, waiting for accessory start");

        let switched = completion.wait(timeout);
        if !switched {
            self.uevents.remove_handler(handler);
            warn!(
                "Timed out after {:?} waiting for accessory negotiation",
                timeout
            );
        }
        Ok(switched)
    }
}
