//! Kernel uevent monitoring
//!
//! A netlink `NETLINK_KOBJECT_UEVENT` socket delivers one datagram per device
//! event, made of `NAME=value` strings separated by NUL bytes. The monitor
//! thread parses each datagram into a [`UeventEnv`] and offers it to every
//! registered handler. A handler returning `true` is removed, so each handler
//! acts at most once. Registration hands back a [`HandlerId`] so a waiter that
//! gives up can withdraw its handler without waiting for another event.

use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::io;
use std::os::fd::{AsRawFd, OwnedFd};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::socket::{
    self, sockopt, AddressFamily, MsgFlags, NetlinkAddr, SockFlag, SockProtocol, SockType,
};
use tracing::{debug, info, trace, warn};

use crate::utils::LogThrottle;
use crate::warn_throttled;

/// Largest supported uevent datagram
pub const NETLINK_MSG_SIZE: usize = 8 * 1024;

/// Environment of a single uevent
pub type UeventEnv = HashMap<String, String>;

/// One-shot uevent predicate; returning `true` unregisters it
pub type UeventHandler = Box<dyn FnMut(&UeventEnv) -> bool + Send>;

/// Parse a uevent datagram into its environment
///
/// Entries without a `=` (such as the leading `ACTION@DEVPATH` summary line)
/// or with an empty name are skipped.
pub fn parse_uevent(datagram: &[u8]) -> UeventEnv {
    datagram
        .split(|&b| b == 0)
        .filter_map(|entry| {
            let split = entry.iter().position(|&b| b == b'=')?;
            if split == 0 {
                return None;
            }
            let name = String::from_utf8_lossy(&entry[..split]).into_owned();
            let value = String::from_utf8_lossy(&entry[split + 1..]).into_owned();
            Some((name, value))
        })
        .collect()
}

/// Registration returned by [`UeventDispatcher::add_handler`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

#[derive(Default)]
struct Registry {
    handlers: Vec<(HandlerId, UeventHandler)>,
    next_id: u64,
    dispatching: bool,
    /// Removed while a dispatch had the list checked out
    detached: HashSet<HandlerId>,
}

/// Fans uevents out to registered one-shot handlers
///
/// Handlers may be registered from any thread. Dispatching happens on the
/// monitor thread only; the handler list is taken out of the lock for the
/// duration of a dispatch so handlers never run under it.
pub struct UeventDispatcher {
    registry: Mutex<Registry>,
}

impl UeventDispatcher {
    pub fn new() -> Self {
        Self {
            registry: Mutex::new(Registry::default()),
        }
    }

    /// Register a handler for upcoming uevents
    ///
    /// The handler runs on the monitor thread. It should return `true` once
    /// it has acted on an event (or no longer cares), which removes it.
    pub fn add_handler<F>(&self, handler: F) -> HandlerId
    where
        F: FnMut(&UeventEnv) -> bool + Send + 'static,
    {
        let mut registry = self.registry.lock();
        let id = HandlerId(registry.next_id);
        registry.next_id += 1;
        registry.handlers.push((id, Box::new(handler)));
        id
    }

    /// Withdraw a handler that has not fired yet
    ///
    /// If a dispatch is running the handler may still see that one event,
    /// but it is dropped afterwards whatever it returns.
    pub fn remove_handler(&self, id: HandlerId) {
        let mut registry = self.registry.lock();
        let before = registry.handlers.len();
        registry.handlers.retain(|(handler, _)| *handler != id);
        if registry.handlers.len() == before && registry.dispatching {
            registry.detached.insert(id);
        }
    }

    /// Number of handlers still registered
    pub fn handler_count(&self) -> usize {
        self.registry.lock().handlers.len()
    }

    /// Offer one event to every registered handler, in registration order
    ///
    /// A panicking handler is treated as "not matched" and stays registered.
    /// Handlers registered while this runs first see the next event.
    pub fn dispatch(&self, env: &UeventEnv) {
        let mut current = {
            let mut registry = self.registry.lock();
            registry.dispatching = true;
            std::mem::take(&mut registry.handlers)
        };

        current.retain_mut(|(_, handler)| {
            match panic::catch_unwind(AssertUnwindSafe(|| handler(env))) {
                Ok(done) => !done,
                Err(_) => {
                    warn!("Uevent handler panicked, keeping it registered");
                    true
                }
            }
        });

        let mut registry = self.registry.lock();
        let detached = std::mem::take(&mut registry.detached);
        registry.dispatching = false;
        current.retain(|(id, _)| !detached.contains(id));
        current.append(&mut registry.handlers);
        registry.handlers = current;
    }

    /// Open the netlink socket and start the monitor thread
    pub fn start(self: &Arc<Self>) -> io::Result<JoinHandle<()>> {
        info!("Starting uevent monitoring");

        let socket = open_uevent_socket()?;
        let dispatcher = Arc::clone(self);

        let handle = thread::Builder::new()
            .name("uevent".to_string())
            .spawn(move || dispatcher.monitor_loop(socket))?;

        info!("Uevent monitoring started");
        Ok(handle)
    }

    fn monitor_loop(&self, socket: OwnedFd) {
        let mut throttle = LogThrottle::new(Duration::from_secs(10));
        let mut buf = vec![0u8; NETLINK_MSG_SIZE];

        loop {
            let len = match socket::recv(socket.as_raw_fd(), &mut buf, MsgFlags::empty()) {
                Ok(0) => continue,
                Ok(len) => len,
                Err(Errno::EINTR) => continue,
                Err(e) => {
                    warn_throttled!(throttle, "Read from netlink socket failed: {}", e);
                    thread::sleep(Duration::from_millis(50));
                    continue;
                }
            };

            let env = parse_uevent(&buf[..len]);
            if env.is_empty() {
                continue;
            }
            trace!("uevent: {:?}", env);

            self.dispatch(&env);
        }
    }
}

impl Default for UeventDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

/// Create a netlink uevent socket subscribed to all multicast groups
fn open_uevent_socket() -> io::Result<OwnedFd> {
    let fd = socket::socket(
        AddressFamily::Netlink,
        SockType::Datagram,
        SockFlag::SOCK_CLOEXEC,
        SockProtocol::NetlinkKObjectUEvent,
    )
    .map_err(|e| {
        io::Error::new(
            io::ErrorKind::Other,
            format!("creating netlink socket failed: {}", e),
        )
    })?;

    // Port id 0 lets the kernel assign a unique one
    let address = NetlinkAddr::new(0, u32::MAX);
    socket::bind(fd.as_raw_fd(), &address).map_err(|e| {
        io::Error::new(
            io::ErrorKind::Other,
            format!("bind failed for netlink socket: {}", e),
        )
    })?;

    socket::setsockopt(&fd, sockopt::PassCred, &true).map_err(|e| {
        io::Error::new(
            io::ErrorKind::Other,
            format!("setsockopt SO_PASSCRED failed for netlink socket: {}", e),
        )
    })?;

    debug!("Netlink uevent socket bound to all groups");
    Ok(fd)
}
