//! rtnetlink (`NETLINK_ROUTE`) protocol implementation
//!
//! # Architecture
//!
//! ## Wire layer
//! - `structures`: Binary structures matching kernel layout (repr(C))
//! - `attributes`: TLV attribute stream codec and bounded copies
//! - `message`: Message construction and parsing
//!
//! ## I/O layer
//! - `socket`: Low-level Netlink socket management (syscalls, RAII)
//! - `transaction`: One request/response exchange on an ephemeral socket
//! - `monitor`: Long-lived multicast listener thread
//!
//! ## Requests
//! - `mutation`: Dump requests and route/address add/delete requests
//!
//! # Educational Notes
//!
//! ## Platform Support
//!
//! Netlink is a Linux-specific kernel interface; `socket` uses
//! `libc::sockaddr_nl`, which only exists on Linux targets. The wire layer
//! is plain byte manipulation with no such dependency.

// ============================================================================
// SUBMODULE DECLARATIONS
// ============================================================================

pub mod attributes; // TLV codec
pub mod message; // Message construction and parsing
pub mod monitor; // Notification listener thread
pub mod mutation; // Request builders
pub mod socket; // Netlink socket management
pub mod structures; // Binary protocol structures
pub mod transaction; // Request/response exchange

#[cfg(test)]
pub(crate) mod testing; // Scripted transports and message fixtures

// ============================================================================
// PUBLIC RE-EXPORTS
// ============================================================================

pub use message::{AddressMessage, LinkMessage, MessageError, RouteMessage, RtnlMessage};
pub use monitor::{EventMonitor, MonitorState, NotificationSink};
pub use socket::{Connector, KernelConnector, NetlinkSocket, SocketError, Transport};
pub use transaction::TransactionError;
