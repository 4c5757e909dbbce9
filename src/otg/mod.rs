//! USB gadget management
//!
//! The head unit talks to a USB device controller (UDC) exposed through
//! ConfigFS. Two gadgets are prepared outside of this daemon:
//!
//! ```text
//! GadgetController (binding state machine)
//!     ├── UdcBinding        (writes <configfs>/<gadget>/UDC)
//!     └── UeventDispatcher  (netlink monitor, one-shot handlers)
//! ```
//!
//! The `default` gadget is what the head unit enumerates first; once it asks
//! for accessory mode the kernel emits an `ACCESSORY=START` uevent and the
//! controller swaps in the `accessory` gadget.

pub mod configfs;
pub mod gadget;
pub mod uevent;

pub use gadget::{ConfigFsBinding, GadgetController, GadgetState, UdcBinding};
pub use uevent::{parse_uevent, HandlerId, UeventDispatcher, UeventEnv};
