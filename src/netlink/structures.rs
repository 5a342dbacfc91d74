//! Binary structures for the rtnetlink (`NETLINK_ROUTE`) protocol
//!
//! These structures use `#[repr(C)]` to match kernel layout exactly.
//! All multi-byte integers in headers follow host byte order, while
//! IP addresses carried in attributes are in network byte order (big-endian).
//!
//! Structures are (de)serialized field by field through [`WireStruct`]
//! instead of casting raw pointers, so a short or misaligned receive buffer
//! can never be read out of bounds.

// NETLINK MESSAGE HEADER

/// Netlink message header (16 bytes)
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NlMsgHdr {
    pub nlmsg_len: u32,
    pub nlmsg_type: u16,
    pub nlmsg_flags: u16,
    pub nlmsg_seq: u32,
    pub nlmsg_pid: u32,
}

// FAMILY-SPECIFIC FIXED HEADERS

/// Route message header, `struct rtmsg` (12 bytes)
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RtMsg {
    pub rtm_family: u8,
    pub rtm_dst_len: u8,
    pub rtm_src_len: u8,
    pub rtm_tos: u8,
    pub rtm_table: u8,
    pub rtm_protocol: u8,
    pub rtm_scope: u8,
    pub rtm_type: u8,
    pub rtm_flags: u32,
}

/// Link message header, `struct ifinfomsg` (16 bytes)
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IfInfoMsg {
    pub ifi_family: u8,
    pub ifi_pad: u8,
    pub ifi_type: u16,
    pub ifi_index: i32,
    pub ifi_flags: u32,
    pub ifi_change: u32,
}

/// Address message header, `struct ifaddrmsg` (8 bytes)
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IfAddrMsg {
    pub ifa_family: u8,
    pub ifa_prefixlen: u8,
    pub ifa_flags: u8,
    pub ifa_scope: u8,
    pub ifa_index: u32,
}

// ROUTING ATTRIBUTE HEADER

/// Routing attribute header (4 bytes)
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RtAttr {
    pub rta_len: u16,
    pub rta_type: u16,
}

// CONSTANTS

/// `NETLINK_ROUTE` protocol number for `socket(2)`
pub const NETLINK_ROUTE: i32 = 0;

// Netlink control message types
pub const NLMSG_NOOP: u16 = 1;
pub const NLMSG_ERROR: u16 = 2;
pub const NLMSG_DONE: u16 = 3;
pub const NLMSG_OVERRUN: u16 = 4;

// rtnetlink message types
pub const RTM_NEWLINK: u16 = 16;
pub const RTM_DELLINK: u16 = 17;
pub const RTM_GETLINK: u16 = 18;
pub const RTM_NEWADDR: u16 = 20;
pub const RTM_DELADDR: u16 = 21;
pub const RTM_GETADDR: u16 = 22;
pub const RTM_NEWROUTE: u16 = 24;
pub const RTM_DELROUTE: u16 = 25;
pub const RTM_GETROUTE: u16 = 26;

// Netlink flags
pub const NLM_F_REQUEST: u16 = 0x001;
pub const NLM_F_MULTI: u16 = 0x002;
pub const NLM_F_ACK: u16 = 0x004;
pub const NLM_F_ECHO: u16 = 0x008;

// GET request flags
pub const NLM_F_ROOT: u16 = 0x100;
pub const NLM_F_MATCH: u16 = 0x200;
pub const NLM_F_DUMP: u16 = NLM_F_ROOT | NLM_F_MATCH;

// NEW request flags
pub const NLM_F_REPLACE: u16 = 0x100;
pub const NLM_F_EXCL: u16 = 0x200;
pub const NLM_F_CREATE: u16 = 0x400;

// Multicast notification groups (legacy bitmask form for `nl_groups`)
pub const RTMGRP_LINK: u32 = 0x001;
pub const RTMGRP_NOTIFY: u32 = 0x002;
pub const RTMGRP_IPV4_IFADDR: u32 = 0x010;
pub const RTMGRP_IPV4_ROUTE: u32 = 0x040;
pub const RTMGRP_IPV6_IFADDR: u32 = 0x100;
pub const RTMGRP_IPV6_ROUTE: u32 = 0x400;

// Address families
pub const AF_UNSPEC: u8 = 0;
pub const AF_INET: u8 = 2;
pub const AF_INET6: u8 = 10;

// IFLA_* link attributes
pub const IFLA_ADDRESS: u16 = 1;
pub const IFLA_BROADCAST: u16 = 2;
pub const IFLA_IFNAME: u16 = 3;
pub const IFLA_MTU: u16 = 4;

// IFA_* address attributes
pub const IFA_ADDRESS: u16 = 1;
pub const IFA_LOCAL: u16 = 2;
pub const IFA_LABEL: u16 = 3;
pub const IFA_BROADCAST: u16 = 4;

// RTA_* route attributes
pub const RTA_DST: u16 = 1;
pub const RTA_SRC: u16 = 2;
pub const RTA_IIF: u16 = 3;
pub const RTA_OIF: u16 = 4;
pub const RTA_GATEWAY: u16 = 5;
pub const RTA_PRIORITY: u16 = 6;
pub const RTA_PREFSRC: u16 = 7;
pub const RTA_TABLE: u16 = 15;

// Route header values
pub const RT_TABLE_MAIN: u8 = 254;
pub const RTPROT_STATIC: u8 = 4;
pub const RT_SCOPE_UNIVERSE: u8 = 0;
pub const RTN_UNICAST: u8 = 1;

// Address header flags
pub const IFA_F_PERMANENT: u8 = 0x80;

/// Interface name capacity including the terminating NUL (`IFNAMSIZ`)
pub const IFNAMSIZ: usize = 16;

/// Ethernet hardware address length (`ETH_ALEN`)
pub const ETH_ALEN: usize = 6;

// HELPER FUNCTIONS

/// Align length to 4-byte boundary
#[must_use]
pub const fn nlmsg_align(len: usize) -> usize {
    (len + 3) & !3
}

/// Calculate Netlink message length
#[must_use]
pub const fn nlmsg_length(payload_len: usize) -> u32 {
    (std::mem::size_of::<NlMsgHdr>() + payload_len) as u32
}

/// Calculate space needed for Netlink message
#[must_use]
pub const fn nlmsg_space(payload_len: usize) -> usize {
    nlmsg_align(std::mem::size_of::<NlMsgHdr>() + payload_len)
}

/// Align attribute length to 4-byte boundary
#[must_use]
pub const fn rta_align(len: usize) -> usize {
    (len + 3) & !3
}

/// Calculate attribute length
#[must_use]
pub const fn rta_length(payload_len: usize) -> usize {
    std::mem::size_of::<RtAttr>() + payload_len
}

/// Calculate space needed for attribute
#[must_use]
pub const fn rta_space(payload_len: usize) -> usize {
    rta_align(std::mem::size_of::<RtAttr>() + payload_len)
}

// WIRE (DE)SERIALIZATION

/// A fixed-size kernel structure that can be written to and read from a
/// byte buffer in host byte order.
///
/// `read_from` returns `None` when the slice is shorter than [`Self::SIZE`],
/// which is how every caller guards against truncated input.
pub trait WireStruct: Sized {
    /// Size in bytes, equal to `size_of::<Self>()` for the `repr(C)` layout
    const SIZE: usize;

    fn write_to(&self, buffer: &mut Vec<u8>);

    fn read_from(bytes: &[u8]) -> Option<Self>;
}

fn u16_at(bytes: &[u8], at: usize) -> u16 {
    u16::from_ne_bytes([bytes[at], bytes[at + 1]])
}

fn u32_at(bytes: &[u8], at: usize) -> u32 {
    u32::from_ne_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
}

impl WireStruct for NlMsgHdr {
    const SIZE: usize = 16;

    fn write_to(&self, buffer: &mut Vec<u8>) {
        buffer.extend_from_slice(&self.nlmsg_len.to_ne_bytes());
        buffer.extend_from_slice(&self.nlmsg_type.to_ne_bytes());
        buffer.extend_from_slice(&self.nlmsg_flags.to_ne_bytes());
        buffer.extend_from_slice(&self.nlmsg_seq.to_ne_bytes());
        buffer.extend_from_slice(&self.nlmsg_pid.to_ne_bytes());
    }

    fn read_from(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < Self::SIZE {
            return None;
        }
        Some(Self {
            nlmsg_len: u32_at(bytes, 0),
            nlmsg_type: u16_at(bytes, 4),
            nlmsg_flags: u16_at(bytes, 6),
            nlmsg_seq: u32_at(bytes, 8),
            nlmsg_pid: u32_at(bytes, 12),
        })
    }
}

impl WireStruct for RtMsg {
    const SIZE: usize = 12;

    fn write_to(&self, buffer: &mut Vec<u8>) {
        buffer.extend_from_slice(&[
            self.rtm_family,
            self.rtm_dst_len,
            self.rtm_src_len,
            self.rtm_tos,
            self.rtm_table,
            self.rtm_protocol,
            self.rtm_scope,
            self.rtm_type,
        ]);
        buffer.extend_from_slice(&self.rtm_flags.to_ne_bytes());
    }

    fn read_from(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < Self::SIZE {
            return None;
        }
        Some(Self {
            rtm_family: bytes[0],
            rtm_dst_len: bytes[1],
            rtm_src_len: bytes[2],
            rtm_tos: bytes[3],
            rtm_table: bytes[4],
            rtm_protocol: bytes[5],
            rtm_scope: bytes[6],
            rtm_type: bytes[7],
            rtm_flags: u32_at(bytes, 8),
        })
    }
}

impl WireStruct for IfInfoMsg {
    const SIZE: usize = 16;

    fn write_to(&self, buffer: &mut Vec<u8>) {
        buffer.push(self.ifi_family);
        buffer.push(self.ifi_pad);
        buffer.extend_from_slice(&self.ifi_type.to_ne_bytes());
        buffer.extend_from_slice(&self.ifi_index.to_ne_bytes());
        buffer.extend_from_slice(&self.ifi_flags.to_ne_bytes());
        buffer.extend_from_slice(&self.ifi_change.to_ne_bytes());
    }

    fn read_from(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < Self::SIZE {
            return None;
        }
        Some(Self {
            ifi_family: bytes[0],
            ifi_pad: bytes[1],
            ifi_type: u16_at(bytes, 2),
            ifi_index: u32_at(bytes, 4) as i32,
            ifi_flags: u32_at(bytes, 8),
            ifi_change: u32_at(bytes, 12),
        })
    }
}

impl WireStruct for IfAddrMsg {
    const SIZE: usize = 8;

    fn write_to(&self, buffer: &mut Vec<u8>) {
        buffer.extend_from_slice(&[
            self.ifa_family,
            self.ifa_prefixlen,
            self.ifa_flags,
            self.ifa_scope,
        ]);
        buffer.extend_from_slice(&self.ifa_index.to_ne_bytes());
    }

    fn read_from(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < Self::SIZE {
            return None;
        }
        Some(Self {
            ifa_family: bytes[0],
            ifa_prefixlen: bytes[1],
            ifa_flags: bytes[2],
            ifa_scope: bytes[3],
            ifa_index: u32_at(bytes, 4),
        })
    }
}

impl WireStruct for RtAttr {
    const SIZE: usize = 4;

    fn write_to(&self, buffer: &mut Vec<u8>) {
        buffer.extend_from_slice(&self.rta_len.to_ne_bytes());
        buffer.extend_from_slice(&self.rta_type.to_ne_bytes());
    }

    fn read_from(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < Self::SIZE {
            return None;
        }
        Some(Self {
            rta_len: u16_at(bytes, 0),
            rta_type: u16_at(bytes, 2),
        })
    }
}

// TESTS
