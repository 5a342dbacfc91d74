// ============================================================================
// RTNL MIRROR LIBRARY
// ============================================================================
// Mirrors the kernel's interface and routing tables over rtnetlink and
// applies route/address changes on request.
//
// === KEY FEATURES ===
// 1. Seed interface and route caches from kernel dumps at startup
// 2. Keep them current from multicast notifications on a background thread
// 3. Add and remove routes and interface addresses with typed results
// 4. Query interface addresses on demand
//
// === LAYOUT ===
// - netlink: wire format, sockets, transactions, monitor, request builders
// - cache:   guarded interface/route mirrors and their record types
// - agent:   the public surface tying the above together
// - config:  JSON configuration with defaults
// - logging: tracing subscriber for the binary
// ============================================================================

pub mod agent;
pub mod cache;
pub mod config;
pub mod logging;
pub mod netlink;

pub use agent::{AgentError, NetlinkAgent};
pub use cache::{AddressFamily, AddressRecord, InterfaceRecord, RouteRecord};
pub use config::{AgentConfig, ConfigError, RouteCachePolicy};
pub use netlink::attributes::HardwareAddress;
pub use netlink::monitor::MonitorState;
