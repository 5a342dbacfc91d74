//! The agent: seeded caches, a running monitor and mutation operations
//!
//! Startup order matters:
//!
//! 1. validate the configuration
//! 2. bind the notification socket (the only fatal runtime failure)
//! 3. dump interfaces, IPv4 routes and IPv6 routes into the caches
//! 4. start the monitor thread
//!
//! Changes that happen during step 3 are queued on the socket from step 2
//! and replayed by the monitor once it runs.
//!
//! Every mutation runs on the calling thread over its own short-lived
//! socket. Failures come back as [`AgentError`] and are logged here, once.

use std::io;
use std::net::IpAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use ipnetwork::IpNetwork;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::cache::{AddressFamily, AddressRecord, InterfaceRecord, RouteRecord, StateCaches};
use crate::config::{AgentConfig, ConfigError};
use crate::netlink::message::RtnlMessage;
use crate::netlink::monitor::{EventMonitor, MonitorState};
use crate::netlink::mutation::{self, Operation, RequestError, RouteSpec};
use crate::netlink::socket::{Connector, KernelConnector, SocketError};
use crate::netlink::transaction::{self, TransactionError};

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("cannot bind the notification socket: {0}")]
    MonitorBind(#[source] SocketError),

    #[error("cannot start the monitor thread: {0}")]
    MonitorStart(#[source] io::Error),

    #[error(transparent)]
    Transaction(#[from] TransactionError),

    #[error("interface {name:?} not found")]
    InterfaceNotFound { name: String },

    #[error("invalid request: {0}")]
    InvalidRequest(#[from] RequestError),
}

impl AgentError {
    /// Kernel errno for rejected requests (`EEXIST`, `ESRCH`, `EPERM`, ...)
    pub fn errno(&self) -> Option<i32> {
        match self {
            AgentError::Transaction(e) => e.errno(),
            _ => None,
        }
    }
}

pub struct NetlinkAgent {
    config: AgentConfig,
    connector: Arc<dyn Connector>,
    caches: Arc<StateCaches>,
    monitor: EventMonitor,
    sequence: AtomicU32,
}

impl NetlinkAgent {
    /// Start against the running kernel
    pub fn start(config: AgentConfig) -> Result<Self, AgentError> {
        Self::with_connector(config, Arc::new(KernelConnector))
    }

    pub fn with_connector(config: AgentConfig, connector: Arc<dyn Connector>) -> Result<Self, AgentError> {
        config.validate().inspect_err(|e| error!(error = %e, "rejecting agent configuration"))?;

        let monitor = EventMonitor::bind(connector.as_ref(), &config).map_err(|e| {
            error!(error = %e, "failed to bind notification socket");
            AgentError::MonitorBind(e)
        })?;

        let mut agent = Self {
            caches: Arc::new(StateCaches::new(config.route_cache_policy)),
            config,
            connector,
            monitor,
            sequence: AtomicU32::new(1),
        };

        agent.seed();

        agent
            .monitor
            .start(agent.caches.clone())
            .map_err(AgentError::MonitorStart)?;

        info!(
            interfaces = agent.caches.interfaces.len(),
            ipv4_routes = agent.caches.routes(AddressFamily::V4).len(),
            ipv6_routes = agent.caches.routes(AddressFamily::V6).len(),
            "agent started"
        );
        Ok(agent)
    }

    /// Initial dumps; a failed dump leaves that cache empty
    fn seed(&self) {
        match self.transact(&mutation::link_dump_request(self.next_seq()), 0) {
            Ok(messages) => self.caches.load_dump(&messages),
            Err(e) => error!(error = %e, "interface dump failed"),
        }

        for family in [AddressFamily::V4, AddressFamily::V6] {
            match self.transact(&mutation::route_dump_request(family, self.next_seq()), 0) {
                Ok(messages) => self.caches.load_dump(&messages),
                Err(e) => error!(error = %e, ?family, "route dump failed"),
            }
        }
    }

    fn next_seq(&self) -> u32 {
        self.sequence.fetch_add(1, Ordering::Relaxed)
    }

    fn transact(&self, request: &[u8], groups: u32) -> Result<Vec<RtnlMessage>, TransactionError> {
        transaction::execute(self.connector.as_ref(), request, groups, &self.config)
    }

    // ========================================================================
    // ROUTES
    // ========================================================================

    pub fn add_route(
        &self,
        destination: IpNetwork,
        gateway: Option<IpAddr>,
        source: Option<IpNetwork>,
        interface: Option<&str>,
    ) -> Result<(), AgentError> {
        self.change_route(Operation::Add, destination, gateway, source, interface)
    }

    pub fn del_route(
        &self,
        destination: IpNetwork,
        gateway: Option<IpAddr>,
        source: Option<IpNetwork>,
        interface: Option<&str>,
    ) -> Result<(), AgentError> {
        self.change_route(Operation::Delete, destination, gateway, source, interface)
    }

    fn change_route(
        &self,
        op: Operation,
        destination: IpNetwork,
        gateway: Option<IpAddr>,
        source: Option<IpNetwork>,
        interface: Option<&str>,
    ) -> Result<(), AgentError> {
        // An unknown interface is not fatal: the route goes out without RTA_OIF
        let output_interface = interface.and_then(|name| {
            let index = self.caches.interfaces.find_index(name);
            if index.is_none() {
                warn!(name, %destination, "route interface not found, sending without it");
            }
            index
        });

        let spec = RouteSpec {
            destination,
            gateway,
            source,
            output_interface,
        };

        let result = self.send_route(op, &spec);
        match &result {
            Ok(()) => debug!(?op, %destination, ?gateway, "route changed"),
            Err(e) => error!(?op, %destination, ?gateway, errno = e.errno(), error = %e, "route change failed"),
        }
        result
    }

    fn send_route(&self, op: Operation, spec: &RouteSpec) -> Result<(), AgentError> {
        let request = mutation::route_request(op, spec, self.next_seq())?;
        self.transact(&request, 0)?;
        Ok(())
    }

    // ========================================================================
    // ADDRESSES
    // ========================================================================

    /// Add `address` to `interface`, waiting for a just-created interface
    /// to show up in the cache
    pub fn add_address(&self, address: IpNetwork, interface: &str) -> Result<(), AgentError> {
        let index = self.caches.interfaces.find_index_with_retry(
            interface,
            self.config.interface_lookup_attempts,
            self.config.interface_lookup_interval(),
        );
        self.change_address(Operation::Add, address, interface, index)
    }

    pub fn remove_address(&self, address: IpNetwork, interface: &str) -> Result<(), AgentError> {
        let index = self.caches.interfaces.find_index(interface);
        self.change_address(Operation::Delete, address, interface, index)
    }

    fn change_address(
        &self,
        op: Operation,
        address: IpNetwork,
        interface: &str,
        index: Option<u32>,
    ) -> Result<(), AgentError> {
        let Some(index) = index else {
            error!(?op, %address, interface, "interface not found");
            return Err(AgentError::InterfaceNotFound {
                name: interface.to_string(),
            });
        };

        let request = mutation::address_request(op, address, index, interface, self.next_seq())
            .inspect_err(|e| error!(?op, %address, interface, error = %e, "cannot build address request"))?;
        let group = AddressFamily::of(address.ip()).ifaddr_group();

        match self.transact(&request, group) {
            Ok(_) => {
                debug!(?op, %address, interface, index, "address changed");
                Ok(())
            }
            Err(e) => {
                error!(?op, %address, interface, errno = e.errno(), error = %e, "address change failed");
                Err(e.into())
            }
        }
    }

    // ========================================================================
    // QUERIES
    // ========================================================================

    pub fn ipv4_routes(&self) -> Vec<RouteRecord> {
        self.caches.routes(AddressFamily::V4).snapshot()
    }

    pub fn ipv6_routes(&self) -> Vec<RouteRecord> {
        self.caches.routes(AddressFamily::V6).snapshot()
    }

    pub fn interfaces(&self) -> Vec<InterfaceRecord> {
        self.caches.interfaces.snapshot()
    }

    pub fn interface_index(&self, name: &str) -> Option<u32> {
        self.caches.interfaces.find_index(name)
    }

    /// Current interface addresses, straight from the kernel
    pub fn addresses(&self, family: Option<AddressFamily>) -> Result<Vec<AddressRecord>, AgentError> {
        let request = mutation::address_dump_request(family, self.next_seq());
        let messages = self.transact(&request, 0).inspect_err(|e| {
            error!(error = %e, ?family, "address dump failed");
        })?;

        Ok(messages
            .iter()
            .filter_map(|message| match message {
                RtnlMessage::NewAddress(addr) => AddressRecord::from_message(addr),
                _ => None,
            })
            .collect())
    }

    /// Re-dump both route tables and replace the cached snapshots
    pub fn refresh_routes(&self) -> Result<(), AgentError> {
        for family in [AddressFamily::V4, AddressFamily::V6] {
            let request = mutation::route_dump_request(family, self.next_seq());
            let messages = self.transact(&request, 0).inspect_err(|e| {
                error!(error = %e, ?family, "route dump failed");
            })?;
            let count = self.caches.replace_routes(family, &messages);
            debug!(?family, count, "routes refreshed");
        }
        Ok(())
    }

    pub fn monitor_state(&self) -> MonitorState {
        self.monitor.state()
    }

    /// Stop the monitor and close its socket; also done on drop
    pub fn shutdown(&mut self) {
        self.monitor.stop();
    }
}
