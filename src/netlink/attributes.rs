//! Routing attribute (TLV) codec
//!
//! Every rtnetlink message carries a stream of attributes after its fixed
//! header. Each attribute is a 4-byte `RtAttr` header followed by the payload
//! and zero padding up to the next 4-byte boundary:
//!
//! ```text
//! ┌────────────────┐
//! │ RtAttr header  │ ← 4 bytes (rta_len: u16, rta_type: u16)
//! ├────────────────┤
//! │ Payload        │ ← rta_len - 4 bytes
//! ├────────────────┤
//! │ Padding        │ ← 0-3 bytes (align to 4-byte boundary)
//! └────────────────┘
//! ```
//!
//! `rta_len` covers header + payload but NOT the padding. The walker steps by
//! `rta_align(rta_len)` so padding is never mistaken for the next header.
//!
//! The kernel owns the length fields we read here, so nothing in this module
//! trusts them: a declared length that runs past the buffer ends the walk,
//! and fixed-capacity fields (interface names, MAC addresses) are copied with
//! the destination capacity as the bound.

use crate::netlink::structures::{ETH_ALEN, IFNAMSIZ, RtAttr, WireStruct, rta_align};
use serde::{Serialize, Serializer};
use std::collections::HashMap;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use thiserror::Error;

/// Largest payload an attribute can carry: `rta_len` is a `u16` that also
/// counts the 4-byte header
pub const MAX_PAYLOAD_LEN: usize = u16::MAX as usize - RtAttr::SIZE;

#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
#[error("attribute {type_code} payload is {len} bytes (maximum is {MAX_PAYLOAD_LEN})")]
pub struct AttributeTooLong {
    pub type_code: u16,
    pub len: usize,
}

// ============================================================================
// ATTRIBUTE ENTRY
// ============================================================================

/// One decoded (or to-be-encoded) attribute
///
/// Lives only for the duration of one message decode or build; records
/// stored in the caches are built from these and never keep them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttributeEntry {
    pub type_code: u16,
    pub payload: Vec<u8>,
}

impl AttributeEntry {
    pub fn new(type_code: u16, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            type_code,
            payload: payload.into(),
        }
    }

    /// Address attribute in network byte order (4 or 16 bytes)
    pub fn ip(type_code: u16, addr: IpAddr) -> Self {
        let payload = match addr {
            IpAddr::V4(v4) => v4.octets().to_vec(),
            IpAddr::V6(v6) => v6.octets().to_vec(),
        };
        Self::new(type_code, payload)
    }

    /// 32-bit integer attribute in host byte order
    pub fn u32(type_code: u16, value: u32) -> Self {
        Self::new(type_code, value.to_ne_bytes().to_vec())
    }

    /// NUL-terminated string attribute, clamped so that the terminator still
    /// fits into `capacity` bytes
    ///
    /// A zero capacity has no room for the terminator and yields an empty
    /// payload.
    pub fn c_string(type_code: u16, value: &str, capacity: usize) -> Self {
        let Some(room) = capacity.checked_sub(1) else {
            return Self::new(type_code, Vec::new());
        };
        let bytes = value.as_bytes();
        let len = bytes.len().min(room);
        let mut payload = Vec::with_capacity(len + 1);
        payload.extend_from_slice(&bytes[..len]);
        payload.push(0);
        Self::new(type_code, payload)
    }

    /// Bytes this entry occupies on the wire, padding included
    #[must_use]
    pub fn wire_len(&self) -> usize {
        rta_align(RtAttr::SIZE + self.payload.len())
    }
}

// ============================================================================
// DECODING
// ============================================================================

/// Iterator over the attributes of a buffer, yielding borrowed payloads
///
/// Stops at the first header that is shorter than `RtAttr`, or whose declared
/// length reaches past the end of the buffer. [`AttributeIter::truncated`]
/// tells the caller whether the walk ended early for that reason.
pub struct AttributeIter<'a> {
    data: &'a [u8],
    offset: usize,
    truncated: bool,
}

impl<'a> AttributeIter<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            offset: 0,
            truncated: false,
        }
    }

    /// True once the walk has stopped on a malformed attribute
    pub fn truncated(&self) -> bool {
        self.truncated
    }
}

impl<'a> Iterator for AttributeIter<'a> {
    type Item = (u16, &'a [u8]);

    fn next(&mut self) -> Option<Self::Item> {
        if self.truncated {
            return None;
        }

        let remaining = self.data.get(self.offset..)?;
        let rta = RtAttr::read_from(remaining)?;
        let attr_len = rta.rta_len as usize;

        // A length below the header size would make us loop forever, and a
        // length past the end would read out of bounds. Both end the walk.
        if attr_len < RtAttr::SIZE || attr_len > remaining.len() {
            tracing::debug!(
                attr_len,
                remaining = remaining.len(),
                rta_type = rta.rta_type,
                "attribute walk stopped on truncated attribute"
            );
            self.truncated = true;
            return None;
        }

        let payload = &remaining[RtAttr::SIZE..attr_len];

        // Padding after the last attribute may legitimately be missing, so an
        // offset past the end simply terminates the next call.
        self.offset += rta_align(attr_len);

        Some((rta.rta_type, payload))
    }
}

/// Decode an attribute stream into owned entries, in wire order
///
/// A malformed tail is dropped; the result is always the well-formed prefix.
pub fn decode_attributes(data: &[u8]) -> Vec<AttributeEntry> {
    AttributeIter::new(data)
        .map(|(type_code, payload)| AttributeEntry::new(type_code, payload))
        .collect()
}

/// Fold an attribute stream by type, keeping the last payload of each type
pub fn fold_attributes(data: &[u8]) -> HashMap<u16, &[u8]> {
    let mut attrs = HashMap::new();
    for (type_code, payload) in AttributeIter::new(data) {
        attrs.insert(type_code, payload);
    }
    attrs
}

// ============================================================================
// ENCODING
// ============================================================================

/// Encode entries into a padded attribute stream
///
/// The returned buffer length is the sum of every entry's aligned length,
/// which is exactly what the message builder adds to the fixed header size
/// to fill `nlmsg_len`. Fails without writing anything when a payload does
/// not fit into `rta_len`.
pub fn encode_attributes(entries: &[AttributeEntry]) -> Result<Vec<u8>, AttributeTooLong> {
    let mut buffer = Vec::with_capacity(encoded_len(entries));
    for entry in entries {
        let rta_len = u16::try_from(RtAttr::SIZE + entry.payload.len()).map_err(|_| AttributeTooLong {
            type_code: entry.type_code,
            len: entry.payload.len(),
        })?;
        RtAttr {
            rta_len,
            rta_type: entry.type_code,
        }
        .write_to(&mut buffer);
        buffer.extend_from_slice(&entry.payload);
        while buffer.len() % 4 != 0 {
            buffer.push(0);
        }
    }
    Ok(buffer)
}

/// Length of the stream `encode_attributes` would produce
#[must_use]
pub fn encoded_len(entries: &[AttributeEntry]) -> usize {
    entries.iter().map(AttributeEntry::wire_len).sum()
}

// ============================================================================
// BOUNDED COPIES
// ============================================================================

/// Copy `src` into a fixed array, truncating or zero-filling as needed
pub fn copy_bounded<const N: usize>(src: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    let len = src.len().min(N);
    out[..len].copy_from_slice(&src[..len]);
    out
}

/// Interface name from an `IFLA_IFNAME`/`IFA_LABEL` payload
///
/// Reads up to the first NUL and never more than `IFNAMSIZ - 1` bytes, even
/// if the kernel (or a forged message) sends a longer unterminated string.
pub fn bounded_name(payload: &[u8]) -> String {
    let limit = payload.len().min(IFNAMSIZ - 1);
    let bytes = &payload[..limit];
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

/// IP address from an attribute payload for the given address family
///
/// Returns `None` when the payload is too short for the family.
pub fn ip_from_payload(family: u8, payload: &[u8]) -> Option<IpAddr> {
    use crate::netlink::structures::{AF_INET, AF_INET6};

    match family {
        AF_INET if payload.len() >= 4 => {
            let octets: [u8; 4] = copy_bounded(payload);
            Some(IpAddr::V4(Ipv4Addr::from(octets)))
        }
        AF_INET6 if payload.len() >= 16 => {
            let octets: [u8; 16] = copy_bounded(payload);
            Some(IpAddr::V6(Ipv6Addr::from(octets)))
        }
        _ => None,
    }
}

/// 32-bit host-order integer from an attribute payload, if long enough
pub fn u32_from_payload(payload: &[u8]) -> Option<u32> {
    let bytes: [u8; 4] = payload.get(..4)?.try_into().ok()?;
    Some(u32::from_ne_bytes(bytes))
}

// ============================================================================
// HARDWARE ADDRESS
// ============================================================================

/// 6-byte link-layer address; all-zero when the link reports none
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct HardwareAddress(pub [u8; ETH_ALEN]);

impl HardwareAddress {
    /// Bounded copy from an `IFLA_ADDRESS` payload
    ///
    /// Loopback and tunnel devices report 0 or 16+ byte addresses, so the
    /// payload is clamped to 6 bytes rather than trusted.
    pub fn from_payload(payload: &[u8]) -> Self {
        Self(copy_bounded(payload))
    }

    pub fn octets(&self) -> [u8; ETH_ALEN] {
        self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; ETH_ALEN]
    }
}

impl fmt::Display for HardwareAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02x}:{b:02x}:{c:02x}:{d:02x}:{e:02x}:{g:02x}")
    }
}

impl Serialize for HardwareAddress {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

// ============================================================================
// TESTS
// ============================================================================
