//! Netlink message construction and parsing
//!
//! This module handles building rtnetlink request messages and parsing
//! (possibly multi-part) responses and notifications from the kernel.
//!
//! ## Message Format
//!
//! Every rtnetlink message has this structure:
//! ```text
//! ┌─────────────────────────────┐
//! │ NlMsgHdr (16 bytes)         │  ← Netlink header (length, type, flags, seq, pid)
//! ├─────────────────────────────┤
//! │ Fixed header                │  ← RtMsg (12) / IfInfoMsg (16) / IfAddrMsg (8)
//! ├─────────────────────────────┤
//! │ Attributes (variable)       │  ← 4-byte aligned TLV stream
//! └─────────────────────────────┘
//! ```
//!
//! `nlmsg_len` covers all three parts. Consecutive messages inside one
//! datagram start on 4-byte boundaries.
//!
//! ## Multi-part Messages
//!
//! Dumps arrive as several datagrams of `NLM_F_MULTI` messages:
//! ```text
//! [ Message 1 ] [ Message 2 ] [ Message 3 ] [ NLMSG_DONE ]
//! ```

use crate::netlink::attributes::{
    AttributeEntry, AttributeTooLong, HardwareAddress, bounded_name, encode_attributes,
    fold_attributes, ip_from_payload, u32_from_payload,
};
use crate::netlink::structures::*;
use std::net::IpAddr;
use thiserror::Error;

// ============================================================================
// ERROR TYPES
// ============================================================================

/// Errors that can occur while building a request or parsing a received buffer
#[derive(Debug, Error, PartialEq, Eq)]
pub enum MessageError {
    #[error(transparent)]
    AttributeTooLong(#[from] AttributeTooLong),

    #[error("message of {len} bytes does not fit into nlmsg_len")]
    TooLong { len: usize },

    #[error("invalid message length: {len} (minimum is {minimum})")]
    InvalidLength { len: usize, minimum: usize },

    #[error("message length {len} exceeds buffer size (offset={offset}, buffer={buffer})")]
    ExceedsBuffer {
        len: usize,
        offset: usize,
        buffer: usize,
    },

    #[error("message type {msg_type} too short for its fixed header")]
    ShortPayload { msg_type: u16 },

    #[error("error message too small")]
    ShortError,
}

// ============================================================================
// MESSAGE CONSTRUCTION
// ============================================================================

/// Build a complete rtnetlink request
///
/// # Message Structure
///
/// ```text
/// ┌─────────────────────────────┐
/// │ NlMsgHdr (16 bytes)         │  ← nlmsg_len = 16 + H::SIZE + attributes
/// ├─────────────────────────────┤
/// │ H (fixed header)            │
/// ├─────────────────────────────┤
/// │ Attributes (padded)         │
/// └─────────────────────────────┘
/// ```
///
/// All fixed headers are multiples of 4 bytes and every attribute is padded,
/// so the result is always 4-byte aligned.
pub fn build_message<H: WireStruct>(
    msg_type: u16,
    flags: u16,
    seq: u32,
    header: &H,
    attributes: &[AttributeEntry],
) -> Result<Vec<u8>, MessageError> {
    let attr_bytes = encode_attributes(attributes)?;
    let len = NlMsgHdr::SIZE + H::SIZE + attr_bytes.len();
    if u32::try_from(len).is_err() {
        return Err(MessageError::TooLong { len });
    }
    Ok(frame(msg_type, flags, seq, header, &attr_bytes))
}

/// Build a request that carries only its fixed header (dumps)
pub fn build_request<H: WireStruct>(msg_type: u16, flags: u16, seq: u32, header: &H) -> Vec<u8> {
    frame(msg_type, flags, seq, header, &[])
}

fn frame<H: WireStruct>(msg_type: u16, flags: u16, seq: u32, header: &H, attr_bytes: &[u8]) -> Vec<u8> {
    let payload_size = H::SIZE + attr_bytes.len();

    let mut buffer = Vec::with_capacity(nlmsg_space(payload_size));

    let nlh = NlMsgHdr {
        nlmsg_len: nlmsg_length(payload_size),
        nlmsg_type: msg_type,
        nlmsg_flags: flags,
        nlmsg_seq: seq,
        nlmsg_pid: 0, // Kernel is the destination
    };
    nlh.write_to(&mut buffer);
    header.write_to(&mut buffer);
    buffer.extend_from_slice(attr_bytes);

    while buffer.len() % 4 != 0 {
        buffer.push(0);
    }

    buffer
}

// ============================================================================
// DECODED MESSAGES
// ============================================================================

/// Decoded `RTM_NEWLINK` / `RTM_DELLINK`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkMessage {
    pub header: IfInfoMsg,
    pub name: String,
    pub hardware_address: HardwareAddress,
    pub mtu: u32,
}

impl LinkMessage {
    /// Kernel interface index (always positive for real links)
    pub fn index(&self) -> u32 {
        self.header.ifi_index as u32
    }

    fn decode(header: IfInfoMsg, attr_data: &[u8]) -> Self {
        let attrs = fold_attributes(attr_data);
        Self {
            header,
            name: attrs
                .get(&IFLA_IFNAME)
                .map(|p| bounded_name(p))
                .unwrap_or_default(),
            hardware_address: attrs
                .get(&IFLA_ADDRESS)
                .map(|p| HardwareAddress::from_payload(p))
                .unwrap_or_default(),
            mtu: attrs
                .get(&IFLA_MTU)
                .and_then(|p| u32_from_payload(p))
                .unwrap_or(0),
        }
    }
}

/// Decoded `RTM_NEWADDR` / `RTM_DELADDR`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressMessage {
    pub header: IfAddrMsg,
    pub address: Option<IpAddr>,
    pub local: Option<IpAddr>,
    pub broadcast: Option<IpAddr>,
    pub label: Option<String>,
}

impl AddressMessage {
    fn decode(header: IfAddrMsg, attr_data: &[u8]) -> Self {
        let attrs = fold_attributes(attr_data);
        let family = header.ifa_family;
        Self {
            header,
            address: attrs
                .get(&IFA_ADDRESS)
                .and_then(|p| ip_from_payload(family, p)),
            local: attrs.get(&IFA_LOCAL).and_then(|p| ip_from_payload(family, p)),
            broadcast: attrs
                .get(&IFA_BROADCAST)
                .and_then(|p| ip_from_payload(family, p)),
            label: attrs.get(&IFA_LABEL).map(|p| bounded_name(p)),
        }
    }
}

/// Decoded `RTM_NEWROUTE` / `RTM_DELROUTE`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteMessage {
    pub header: RtMsg,
    pub destination: Option<IpAddr>,
    pub source: Option<IpAddr>,
    pub gateway: Option<IpAddr>,
    pub output_interface: Option<u32>,
    /// `RTA_PRIORITY` (the route metric)
    pub priority: Option<u32>,
    /// Routing table id; `RTA_TABLE` when present, otherwise `rtm_table`
    pub table: u32,
    /// `nlmsg_flags` of the carrying message
    pub flags: u16,
}

impl RouteMessage {
    /// A `RTM_NEWROUTE` that overwrote an existing route instead of adding one
    pub fn is_replace(&self) -> bool {
        self.flags & NLM_F_REPLACE != 0
    }

    fn decode(header: RtMsg, flags: u16, attr_data: &[u8]) -> Self {
        let attrs = fold_attributes(attr_data);
        let family = header.rtm_family;
        Self {
            header,
            destination: attrs.get(&RTA_DST).and_then(|p| ip_from_payload(family, p)),
            source: attrs.get(&RTA_SRC).and_then(|p| ip_from_payload(family, p)),
            gateway: attrs
                .get(&RTA_GATEWAY)
                .and_then(|p| ip_from_payload(family, p)),
            output_interface: attrs.get(&RTA_OIF).and_then(|p| u32_from_payload(p)),
            priority: attrs.get(&RTA_PRIORITY).and_then(|p| u32_from_payload(p)),
            table: attrs
                .get(&RTA_TABLE)
                .and_then(|p| u32_from_payload(p))
                .unwrap_or(u32::from(header.rtm_table)),
            flags,
        }
    }
}

/// One parsed message from a datagram
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RtnlMessage {
    NewLink(LinkMessage),
    DelLink(LinkMessage),
    NewAddress(AddressMessage),
    DelAddress(AddressMessage),
    NewRoute(RouteMessage),
    DelRoute(RouteMessage),

    /// End of multi-part message
    Done,

    /// Error message carrying a positive errno; 0 is an acknowledgement
    Error(i32),

    Noop,

    /// Kernel dropped notifications because our socket buffer was full
    Overrun,

    /// Anything we do not decode (neighbours, rules, ...)
    Other(u16),
}

// ============================================================================
// MESSAGE PARSING
// ============================================================================

/// Iterate the message headers of a datagram with their offsets
///
/// Stops on the first header whose length is invalid or runs past the end.
/// Used by the receive loop to look for `NLMSG_DONE` without a full decode.
pub fn message_headers(data: &[u8]) -> impl Iterator<Item = NlMsgHdr> + '_ {
    let mut offset = 0;
    std::iter::from_fn(move || {
        let nlh = NlMsgHdr::read_from(data.get(offset..)?)?;
        let msg_len = nlh.nlmsg_len as usize;
        if msg_len < NlMsgHdr::SIZE || offset + msg_len > data.len() {
            return None;
        }
        offset += nlmsg_align(msg_len);
        Some(nlh)
    })
}

/// Parse every message in a received buffer
///
/// # Errors
///
/// Returns error if:
/// - Message length is invalid (too small, exceeds buffer)
/// - A route/link/address message is too short for its fixed header
///
/// Parsing stops after `NLMSG_DONE` and after a non-zero error.
pub fn parse_netlink_messages(data: &[u8]) -> Result<Vec<RtnlMessage>, MessageError> {
    let mut messages = Vec::new();
    let mut offset = 0;

    while let Some(nlh) = data.get(offset..).and_then(NlMsgHdr::read_from) {
        let msg_len = nlh.nlmsg_len as usize;

        // === Validate message length ===
        //
        // A zero length would loop forever; a length past the end would read
        // garbage from the next receive.
        if msg_len < NlMsgHdr::SIZE {
            return Err(MessageError::InvalidLength {
                len: msg_len,
                minimum: NlMsgHdr::SIZE,
            });
        }

        if offset + msg_len > data.len() {
            return Err(MessageError::ExceedsBuffer {
                len: msg_len,
                offset,
                buffer: data.len(),
            });
        }

        let message = &data[offset..offset + msg_len];
        let payload = &message[NlMsgHdr::SIZE..];

        match nlh.nlmsg_type {
            NLMSG_DONE => {
                messages.push(RtnlMessage::Done);
                break;
            }

            NLMSG_ERROR => {
                let errno = parse_error_message(message)?;
                messages.push(RtnlMessage::Error(errno));

                if errno != 0 {
                    break;
                }
            }

            NLMSG_NOOP => messages.push(RtnlMessage::Noop),

            NLMSG_OVERRUN => messages.push(RtnlMessage::Overrun),

            RTM_NEWLINK | RTM_DELLINK => {
                let header = IfInfoMsg::read_from(payload).ok_or(MessageError::ShortPayload {
                    msg_type: nlh.nlmsg_type,
                })?;
                let link = LinkMessage::decode(header, &payload[IfInfoMsg::SIZE..]);
                messages.push(if nlh.nlmsg_type == RTM_NEWLINK {
                    RtnlMessage::NewLink(link)
                } else {
                    RtnlMessage::DelLink(link)
                });
            }

            RTM_NEWADDR | RTM_DELADDR => {
                let header = IfAddrMsg::read_from(payload).ok_or(MessageError::ShortPayload {
                    msg_type: nlh.nlmsg_type,
                })?;
                let addr = AddressMessage::decode(header, &payload[IfAddrMsg::SIZE..]);
                messages.push(if nlh.nlmsg_type == RTM_NEWADDR {
                    RtnlMessage::NewAddress(addr)
                } else {
                    RtnlMessage::DelAddress(addr)
                });
            }

            RTM_NEWROUTE | RTM_DELROUTE => {
                let header = RtMsg::read_from(payload).ok_or(MessageError::ShortPayload {
                    msg_type: nlh.nlmsg_type,
                })?;
                let route = RouteMessage::decode(header, nlh.nlmsg_flags, &payload[RtMsg::SIZE..]);
                messages.push(if nlh.nlmsg_type == RTM_NEWROUTE {
                    RtnlMessage::NewRoute(route)
                } else {
                    RtnlMessage::DelRoute(route)
                });
            }

            other => messages.push(RtnlMessage::Other(other)),
        }

        offset += nlmsg_align(msg_len);
    }

    Ok(messages)
}

/// Parse error message payload
///
/// ```text
/// ┌────────────────┐
/// │ NlMsgHdr       │ ← Netlink header (type = NLMSG_ERROR)
/// ├────────────────┤
/// │ error (i32)    │ ← Negative errno (kernel convention), 0 = ACK
/// ├────────────────┤
/// │ Original msg   │ ← The request that caused error
/// └────────────────┘
/// ```
///
/// Returns the errno as a positive number.
pub fn parse_error_message(data: &[u8]) -> Result<i32, MessageError> {
    let header_size = NlMsgHdr::SIZE;

    let errno_bytes: [u8; 4] = data
        .get(header_size..header_size + 4)
        .and_then(|b| b.try_into().ok())
        .ok_or(MessageError::ShortError)?;

    Ok(i32::from_ne_bytes(errno_bytes).wrapping_neg())
}

// ============================================================================
// TESTS
// ============================================================================
