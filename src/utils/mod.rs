//! Utility modules shared across the daemon

pub mod net;
pub mod throttle;

pub use net::{bind_tcp_listener, interface_mac_address, PROXY_BACKLOG};
pub use throttle::LogThrottle;
