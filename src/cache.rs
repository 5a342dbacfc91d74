//! In-memory mirrors of the kernel's interface and route tables
//!
//! Each cache owns its guard; callers only ever get snapshots (owned copies)
//! or guarded lookups, so no lock escapes this module and none is held
//! across a socket operation.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::time::Duration;

use ipnetwork::IpNetwork;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use crate::config::RouteCachePolicy;
use crate::netlink::attributes::HardwareAddress;
use crate::netlink::message::{AddressMessage, LinkMessage, RouteMessage, RtnlMessage};
use crate::netlink::monitor::NotificationSink;
use crate::netlink::structures::*;

// ============================================================================
// RECORDS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AddressFamily {
    V4,
    V6,
}

impl AddressFamily {
    pub fn of(addr: IpAddr) -> Self {
        match addr {
            IpAddr::V4(_) => AddressFamily::V4,
            IpAddr::V6(_) => AddressFamily::V6,
        }
    }

    pub fn from_raw(family: u8) -> Option<Self> {
        match family {
            AF_INET => Some(AddressFamily::V4),
            AF_INET6 => Some(AddressFamily::V6),
            _ => None,
        }
    }

    /// `AF_INET` / `AF_INET6`
    pub fn raw(self) -> u8 {
        match self {
            AddressFamily::V4 => AF_INET,
            AddressFamily::V6 => AF_INET6,
        }
    }

    /// Multicast group carrying this family's address notifications
    pub fn ifaddr_group(self) -> u32 {
        match self {
            AddressFamily::V4 => RTMGRP_IPV4_IFADDR,
            AddressFamily::V6 => RTMGRP_IPV6_IFADDR,
        }
    }

    fn unspecified(self) -> IpAddr {
        match self {
            AddressFamily::V4 => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            AddressFamily::V6 => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InterfaceRecord {
    pub index: u32,
    pub name: String,
    pub hardware_address: HardwareAddress,
    pub mtu: u32,
}

impl From<&LinkMessage> for InterfaceRecord {
    fn from(link: &LinkMessage) -> Self {
        Self {
            index: link.index(),
            name: link.name.clone(),
            hardware_address: link.hardware_address,
            mtu: link.mtu,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RouteRecord {
    pub destination: IpNetwork,
    pub gateway: Option<IpAddr>,
    pub source: Option<IpNetwork>,
    pub interface_index: Option<u32>,
    /// `RTA_PRIORITY`; the kernel treats a missing priority as 0
    pub metric: u32,
    pub family: AddressFamily,
}

impl RouteRecord {
    /// Record for a route in the main table
    ///
    /// Routes from other tables (local, policy tables) return `None`. A
    /// missing `RTA_DST` is the default route.
    pub fn from_main_table(route: &RouteMessage) -> Option<Self> {
        if route.table != u32::from(RT_TABLE_MAIN) {
            return None;
        }
        let family = AddressFamily::from_raw(route.header.rtm_family)?;

        let destination = IpNetwork::new(
            route.destination.unwrap_or(family.unspecified()),
            route.header.rtm_dst_len,
        )
        .inspect_err(|error| warn!(%error, "route with invalid destination prefix"))
        .ok()?;

        let source = route
            .source
            .and_then(|ip| IpNetwork::new(ip, route.header.rtm_src_len).ok());

        Some(Self {
            destination,
            gateway: route.gateway,
            source,
            interface_index: route.output_interface,
            metric: route.priority.unwrap_or(0),
            family,
        })
    }

    /// True when both records name the same kernel route slot, the one an
    /// `NLM_F_REPLACE` overwrites: destination, source prefix and metric
    pub fn same_slot(&self, other: &RouteRecord) -> bool {
        self.destination == other.destination && self.source == other.source && self.metric == other.metric
    }
}

/// One interface address, returned by on-demand queries and never cached
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AddressRecord {
    pub interface_index: u32,
    pub address: IpNetwork,
    pub local: Option<IpAddr>,
    pub broadcast: Option<IpAddr>,
    pub label: Option<String>,
}

impl AddressRecord {
    pub fn from_message(message: &AddressMessage) -> Option<Self> {
        // Point-to-point links put the peer in IFA_ADDRESS and ours in
        // IFA_LOCAL; everything else sends both or only IFA_ADDRESS.
        let ip = message.address.or(message.local)?;
        let address = IpNetwork::new(ip, message.header.ifa_prefixlen).ok()?;
        Some(Self {
            interface_index: message.header.ifa_index,
            address,
            local: message.local,
            broadcast: message.broadcast,
            label: message.label.clone(),
        })
    }
}

// ============================================================================
// INTERFACE CACHE
// ============================================================================

/// Interfaces keyed by kernel index
#[derive(Debug, Default)]
pub struct InterfaceCache {
    by_index: RwLock<HashMap<u32, InterfaceRecord>>,
}

impl InterfaceCache {
    /// Insert or overwrite in place; returns the previous record
    pub fn upsert(&self, record: InterfaceRecord) -> Option<InterfaceRecord> {
        self.by_index.write().insert(record.index, record)
    }

    pub fn remove(&self, index: u32) -> Option<InterfaceRecord> {
        self.by_index.write().remove(&index)
    }

    pub fn get(&self, index: u32) -> Option<InterfaceRecord> {
        self.by_index.read().get(&index).cloned()
    }

    /// First interface with this name; names are not unique in the kernel
    /// during renames, so the lowest index wins for determinism.
    pub fn find_index(&self, name: &str) -> Option<u32> {
        self.by_index
            .read()
            .values()
            .filter(|record| record.name == name)
            .map(|record| record.index)
            .min()
    }

    /// Look `name` up up to `attempts` times (at least once), sleeping
    /// `interval` between misses
    pub fn find_index_with_retry(&self, name: &str, attempts: u32, interval: Duration) -> Option<u32> {
        let attempts = attempts.max(1);
        for attempt in 1..=attempts {
            if let Some(index) = self.find_index(name) {
                return Some(index);
            }
            trace!(name, attempt, "interface not visible yet");
            if attempt < attempts {
                std::thread::sleep(interval);
            }
        }
        None
    }

    /// Snapshot sorted by index
    pub fn snapshot(&self) -> Vec<InterfaceRecord> {
        let mut records: Vec<_> = self.by_index.read().values().cloned().collect();
        records.sort_by_key(|record| record.index);
        records
    }

    pub fn len(&self) -> usize {
        self.by_index.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ============================================================================
// ROUTE CACHE
// ============================================================================

/// Routes of a single address family, in arrival order
#[derive(Debug)]
pub struct RouteCache {
    family: AddressFamily,
    routes: RwLock<Vec<RouteRecord>>,
}

impl RouteCache {
    pub fn new(family: AddressFamily) -> Self {
        Self {
            family,
            routes: RwLock::new(Vec::new()),
        }
    }

    pub fn family(&self) -> AddressFamily {
        self.family
    }

    /// Add a record unless it is already present or of the wrong family
    pub fn insert(&self, record: RouteRecord) -> bool {
        if record.family != self.family {
            return false;
        }
        let mut routes = self.routes.write();
        if routes.contains(&record) {
            return false;
        }
        routes.push(record);
        true
    }

    /// Overwrite the first record in the same slot as `record`, or add it
    /// when the slot is empty; returns the record it displaced
    pub fn replace_slot(&self, record: RouteRecord) -> Option<RouteRecord> {
        if record.family != self.family {
            return None;
        }
        let mut routes = self.routes.write();
        match routes.iter_mut().find(|existing| existing.same_slot(&record)) {
            Some(existing) => Some(std::mem::replace(existing, record)),
            None => {
                routes.push(record);
                None
            }
        }
    }

    /// Remove every record equal to `record`; returns how many went away
    pub fn remove(&self, record: &RouteRecord) -> usize {
        let mut routes = self.routes.write();
        let before = routes.len();
        routes.retain(|existing| existing != record);
        before - routes.len()
    }

    /// Swap in a fresh dump; records of the other family are dropped
    pub fn replace(&self, records: Vec<RouteRecord>) -> usize {
        let mut fresh: Vec<RouteRecord> = Vec::with_capacity(records.len());
        for record in records {
            if record.family == self.family && !fresh.contains(&record) {
                fresh.push(record);
            }
        }
        let count = fresh.len();
        *self.routes.write() = fresh;
        count
    }

    pub fn snapshot(&self) -> Vec<RouteRecord> {
        self.routes.read().clone()
    }

    pub fn len(&self) -> usize {
        self.routes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ============================================================================
// STATE CACHES
// ============================================================================

/// Everything the agent mirrors, shared with the monitor thread
#[derive(Debug)]
pub struct StateCaches {
    pub interfaces: InterfaceCache,
    ipv4_routes: RouteCache,
    ipv6_routes: RouteCache,
    policy: RouteCachePolicy,
}

impl StateCaches {
    pub fn new(policy: RouteCachePolicy) -> Self {
        Self {
            interfaces: InterfaceCache::default(),
            ipv4_routes: RouteCache::new(AddressFamily::V4),
            ipv6_routes: RouteCache::new(AddressFamily::V6),
            policy,
        }
    }

    pub fn routes(&self, family: AddressFamily) -> &RouteCache {
        match family {
            AddressFamily::V4 => &self.ipv4_routes,
            AddressFamily::V6 => &self.ipv6_routes,
        }
    }

    pub fn policy(&self) -> RouteCachePolicy {
        self.policy
    }

    /// Fold the messages of a dump into the caches
    ///
    /// Links are upserted, main-table routes inserted; everything else is
    /// ignored.
    pub fn load_dump(&self, messages: &[RtnlMessage]) {
        for message in messages {
            match message {
                RtnlMessage::NewLink(link) => self.upsert_link(link),
                RtnlMessage::NewRoute(route) => {
                    if let Some(record) = RouteRecord::from_main_table(route) {
                        self.routes(record.family).insert(record);
                    }
                }
                _ => {}
            }
        }
    }

    /// Replace one family's routes with the main-table routes of a dump
    pub fn replace_routes(&self, family: AddressFamily, messages: &[RtnlMessage]) -> usize {
        let records = messages
            .iter()
            .filter_map(|message| match message {
                RtnlMessage::NewRoute(route) => RouteRecord::from_main_table(route),
                _ => None,
            })
            .collect();
        self.routes(family).replace(records)
    }

    /// Apply one asynchronous kernel notification
    pub fn apply_notification(&self, message: &RtnlMessage) {
        match message {
            RtnlMessage::NewLink(link) => self.upsert_link(link),

            RtnlMessage::DelLink(link) => match self.interfaces.remove(link.index()) {
                Some(record) => debug!(index = record.index, name = %record.name, "interface removed"),
                None => trace!(index = link.index(), "removal of unknown interface"),
            },

            RtnlMessage::NewAddress(addr) | RtnlMessage::DelAddress(addr) => {
                debug!(
                    index = addr.header.ifa_index,
                    address = ?addr.address,
                    added = matches!(message, RtnlMessage::NewAddress(_)),
                    "address notification"
                );
            }

            RtnlMessage::NewRoute(route) | RtnlMessage::DelRoute(route) => {
                let added = matches!(message, RtnlMessage::NewRoute(_));
                self.apply_route_notification(route, added);
            }

            RtnlMessage::Overrun => warn!("kernel reported dropped notifications"),

            other => trace!(?other, "ignoring notification"),
        }
    }

    fn upsert_link(&self, link: &LinkMessage) {
        if link.header.ifi_index <= 0 {
            warn!(index = link.header.ifi_index, "link message without a valid index");
            return;
        }
        let record = InterfaceRecord::from(link);
        let (index, name) = (record.index, record.name.clone());
        match self.interfaces.upsert(record) {
            Some(_) => trace!(index, %name, "interface updated"),
            None => debug!(index, %name, "interface added"),
        }
    }

    fn apply_route_notification(&self, route: &RouteMessage, added: bool) {
        let Some(record) = RouteRecord::from_main_table(route) else {
            return;
        };

        match self.policy {
            RouteCachePolicy::SnapshotOnly => {
                debug!(destination = %record.destination, added, "route notification");
            }
            RouteCachePolicy::LiveSynced => {
                let cache = self.routes(record.family);
                if !added {
                    cache.remove(&record);
                } else if route.is_replace() {
                    if let Some(old) = cache.replace_slot(record) {
                        trace!(destination = %old.destination, gateway = ?old.gateway, "route replaced");
                    }
                } else {
                    cache.insert(record);
                }
            }
        }
    }
}

impl NotificationSink for StateCaches {
    fn deliver(&self, message: &RtnlMessage) {
        self.apply_notification(message);
    }
}
