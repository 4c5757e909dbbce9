//! Transport relay between the phone and the head unit
//!
//! The phone connects over TCP, the head unit talks to the accessory device
//! node. A [`ProxySession`] relays between them with one thread per direction:
//!
//! ```text
//! phone --TCP--> [framed reads]  --> /dev/usb_accessory --> head unit
//! phone <--TCP-- [raw reads]     <-- /dev/usb_accessory <-- head unit
//! ```
//!
//! Both directions share a [`CancelToken`]; the first one to end stops the
//! other.

pub mod cancel;
pub mod frame;
pub mod session;
pub mod version;

pub use cancel::{CancelToken, CancellableIo};
pub use frame::{read_message, FrameError, FrameHeader, MAX_PAYLOAD_LEN, RELAY_BUFFER_SIZE};
pub use session::{DirectionEnd, ProxySession, ProxyStats, ProxyStatsSnapshot, SessionReport};
pub use version::{ProtocolVersion, VersionError};
