//! Request builders for dumps and route/address changes
//!
//! # Educational Notes
//!
//! ## Request flags
//!
//! ```text
//! dump            NLM_F_REQUEST | NLM_F_DUMP
//! add route/addr  NLM_F_REQUEST | NLM_F_CREATE | NLM_F_EXCL | NLM_F_ACK
//! del route/addr  NLM_F_REQUEST | NLM_F_ACK
//! ```
//!
//! `NLM_F_EXCL` makes an add fail with `EEXIST` instead of silently
//! replacing an existing entry. `NLM_F_ACK` asks the kernel to answer with an
//! error frame carrying errno 0 on success, so every mutation has a definite
//! outcome.
//!
//! ## Prefixes
//!
//! The prefix length never travels as an attribute: it lives in the fixed
//! header (`rtm_dst_len`, `rtm_src_len`, `ifa_prefixlen`). Route attributes
//! carry the network address, address attributes carry the host address.

use std::net::IpAddr;

use ipnetwork::IpNetwork;
use thiserror::Error;

use crate::cache::AddressFamily;
use crate::netlink::attributes::AttributeEntry;
use crate::netlink::message::{MessageError, build_message, build_request};
use crate::netlink::structures::*;

const ADD_FLAGS: u16 = NLM_F_REQUEST | NLM_F_CREATE | NLM_F_EXCL | NLM_F_ACK;
const DEL_FLAGS: u16 = NLM_F_REQUEST | NLM_F_ACK;
const DUMP_FLAGS: u16 = NLM_F_REQUEST | NLM_F_DUMP;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Add,
    Delete,
}

impl Operation {
    fn flags(self) -> u16 {
        match self {
            Operation::Add => ADD_FLAGS,
            Operation::Delete => DEL_FLAGS,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RequestError {
    #[error("{field} {address} is not in the same family as destination {destination}")]
    FamilyMismatch {
        field: &'static str,
        address: IpAddr,
        destination: IpNetwork,
    },

    #[error("cannot encode request: {0}")]
    Encoding(#[from] MessageError),
}

/// A route change with its egress interface already resolved
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteSpec {
    pub destination: IpNetwork,
    pub gateway: Option<IpAddr>,
    pub source: Option<IpNetwork>,
    pub output_interface: Option<u32>,
}

// ============================================================================
// DUMPS
// ============================================================================

pub fn link_dump_request(seq: u32) -> Vec<u8> {
    let header = IfInfoMsg {
        ifi_family: AF_UNSPEC,
        ..Default::default()
    };
    build_request(RTM_GETLINK, DUMP_FLAGS, seq, &header)
}

/// Dump the main routing table of one family
pub fn route_dump_request(family: AddressFamily, seq: u32) -> Vec<u8> {
    let header = RtMsg {
        rtm_family: family.raw(),
        rtm_table: RT_TABLE_MAIN,
        ..Default::default()
    };
    build_request(RTM_GETROUTE, DUMP_FLAGS, seq, &header)
}

/// Dump interface addresses; `None` asks for every family
pub fn address_dump_request(family: Option<AddressFamily>, seq: u32) -> Vec<u8> {
    let header = IfAddrMsg {
        ifa_family: family.map_or(AF_UNSPEC, AddressFamily::raw),
        ..Default::default()
    };
    build_request(RTM_GETADDR, DUMP_FLAGS, seq, &header)
}

// ============================================================================
// ROUTES
// ============================================================================

/// Build `RTM_NEWROUTE` / `RTM_DELROUTE`
///
/// Attributes, in order:
/// - `RTA_DST`: network address of the destination, always
/// - `RTA_GATEWAY` when a gateway is given, otherwise `RTA_SRC` (with
///   `rtm_src_len`) when a source prefix is given
/// - `RTA_OIF` when the egress interface resolved
pub fn route_request(op: Operation, route: &RouteSpec, seq: u32) -> Result<Vec<u8>, RequestError> {
    let destination = route.destination;
    let family = AddressFamily::of(destination.ip());

    if let Some(gateway) = route.gateway
        && AddressFamily::of(gateway) != family
    {
        return Err(RequestError::FamilyMismatch {
            field: "gateway",
            address: gateway,
            destination,
        });
    }
    if let Some(source) = route.source
        && AddressFamily::of(source.ip()) != family
    {
        return Err(RequestError::FamilyMismatch {
            field: "source",
            address: source.ip(),
            destination,
        });
    }

    let mut header = RtMsg {
        rtm_family: family.raw(),
        rtm_dst_len: destination.prefix(),
        rtm_table: RT_TABLE_MAIN,
        rtm_protocol: RTPROT_STATIC,
        rtm_scope: RT_SCOPE_UNIVERSE,
        rtm_type: RTN_UNICAST,
        ..Default::default()
    };

    let mut attributes = vec![AttributeEntry::ip(RTA_DST, destination.network())];

    match (route.gateway, route.source) {
        (Some(gateway), _) => attributes.push(AttributeEntry::ip(RTA_GATEWAY, gateway)),
        (None, Some(source)) => {
            header.rtm_src_len = source.prefix();
            attributes.push(AttributeEntry::ip(RTA_SRC, source.ip()));
        }
        (None, None) => {}
    }

    if let Some(index) = route.output_interface {
        attributes.push(AttributeEntry::u32(RTA_OIF, index));
    }

    let msg_type = match op {
        Operation::Add => RTM_NEWROUTE,
        Operation::Delete => RTM_DELROUTE,
    };
    Ok(build_message(msg_type, op.flags(), seq, &header, &attributes)?)
}

// ============================================================================
// ADDRESSES
// ============================================================================

/// Build `RTM_NEWADDR` / `RTM_DELADDR` for `address` on interface `index`
///
/// `label` is the interface name; the kernel rejects labels that do not
/// start with it.
pub fn address_request(
    op: Operation,
    address: IpNetwork,
    index: u32,
    label: &str,
    seq: u32,
) -> Result<Vec<u8>, RequestError> {
    let header = IfAddrMsg {
        ifa_family: AddressFamily::of(address.ip()).raw(),
        ifa_prefixlen: address.prefix(),
        ifa_flags: IFA_F_PERMANENT,
        ifa_scope: 0,
        ifa_index: index,
    };

    let mut attributes = vec![
        AttributeEntry::ip(IFA_ADDRESS, address.ip()),
        AttributeEntry::ip(IFA_LOCAL, address.ip()),
    ];

    if let IpNetwork::V4(v4) = address
        && v4.prefix() < 32
    {
        attributes.push(AttributeEntry::ip(IFA_BROADCAST, IpAddr::V4(v4.broadcast())));
    }

    attributes.push(AttributeEntry::c_string(IFA_LABEL, label, IFNAMSIZ));

    let msg_type = match op {
        Operation::Add => RTM_NEWADDR,
        Operation::Delete => RTM_DELADDR,
    };
    Ok(build_message(msg_type, op.flags(), seq, &header, &attributes)?)
}
