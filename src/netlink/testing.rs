//! Scripted kernel stand-ins for unit and scenario tests
//!
//! A [`ScriptedConnector`] hands out transports in the order they are opened.
//! Each transport replays a queue of canned [`Reply`] values; once the queue
//! is drained every receive behaves like an expired `SO_RCVTIMEO`. Queues are
//! shared handles, so a test can keep feeding notifications to a transport
//! that a background thread already owns.

use std::collections::VecDeque;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use ipnetwork::IpNetwork;
use parking_lot::Mutex;

use crate::netlink::attributes::AttributeEntry;
use crate::netlink::message::build_message;
use crate::netlink::socket::{Connector, SocketError, Transport};
use crate::netlink::structures::*;

/// Longest a drained transport pretends to block for
const IDLE_RECV: Duration = Duration::from_millis(5);

#[derive(Debug, Clone)]
pub enum Reply {
    Data(Vec<u8>),
    Timeout,
    Overrun,
}

pub type ReplyQueue = Arc<Mutex<VecDeque<Reply>>>;

/// Everything the code under test sent or opened
#[derive(Debug, Default)]
pub struct WireLog {
    pub opened_groups: Vec<u32>,
    pub sent: Vec<Vec<u8>>,
}

pub struct ScriptedTransport {
    replies: ReplyQueue,
    log: Arc<Mutex<WireLog>>,
    idle: Duration,
}

impl Transport for ScriptedTransport {
    fn send(&mut self, data: &[u8]) -> Result<(), SocketError> {
        self.log.lock().sent.push(data.to_vec());
        Ok(())
    }

    fn recv(&mut self, buffer: &mut [u8]) -> Result<usize, SocketError> {
        let next = self.replies.lock().pop_front();
        match next {
            Some(Reply::Data(bytes)) if bytes.len() > buffer.len() => Err(SocketError::Truncated {
                len: bytes.len(),
                capacity: buffer.len(),
            }),
            Some(Reply::Data(bytes)) => {
                buffer[..bytes.len()].copy_from_slice(&bytes);
                Ok(bytes.len())
            }
            Some(Reply::Overrun) => Err(SocketError::Overrun),
            Some(Reply::Timeout) | None => {
                std::thread::sleep(self.idle);
                Err(SocketError::Timeout)
            }
        }
    }
}

enum Script {
    Replies(ReplyQueue),
    OpenFails,
}

#[derive(Default)]
pub struct ScriptedConnector {
    scripts: Mutex<VecDeque<Script>>,
    log: Arc<Mutex<WireLog>>,
}

impl ScriptedConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue the replies for the next transport to be opened
    pub fn script(&self, replies: Vec<Reply>) -> ReplyQueue {
        let queue = Arc::new(Mutex::new(VecDeque::from(replies)));
        self.scripts
            .lock()
            .push_back(Script::Replies(Arc::clone(&queue)));
        queue
    }

    /// Make the next `open()` fail like a refused `bind()`
    pub fn fail_next_open(&self) {
        self.scripts.lock().push_back(Script::OpenFails);
    }

    pub fn opened_groups(&self) -> Vec<u32> {
        self.log.lock().opened_groups.clone()
    }

    pub fn sent(&self) -> Vec<Vec<u8>> {
        self.log.lock().sent.clone()
    }
}

impl Connector for ScriptedConnector {
    fn open(&self, groups: u32, timeout: Duration) -> Result<Box<dyn Transport>, SocketError> {
        let script = self.scripts.lock().pop_front();
        let replies = match script {
            Some(Script::OpenFails) => {
                return Err(SocketError::Bind(std::io::Error::from_raw_os_error(
                    libc::EPERM,
                )));
            }
            Some(Script::Replies(queue)) => queue,
            None => ReplyQueue::default(),
        };

        self.log.lock().opened_groups.push(groups);
        Ok(Box::new(ScriptedTransport {
            replies,
            log: Arc::clone(&self.log),
            idle: timeout.min(IDLE_RECV),
        }))
    }
}

/// Poll `condition` until it holds or `limit` passes
pub fn wait_for(limit: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + limit;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    condition()
}

// ============================================================================
// KERNEL MESSAGE FIXTURES
// ============================================================================

pub fn done(seq: u32) -> Vec<u8> {
    let mut data = Vec::new();
    NlMsgHdr {
        nlmsg_len: nlmsg_length(4),
        nlmsg_type: NLMSG_DONE,
        nlmsg_flags: NLM_F_MULTI,
        nlmsg_seq: seq,
        nlmsg_pid: 0,
    }
    .write_to(&mut data);
    data.extend_from_slice(&0i32.to_ne_bytes());
    data
}

/// `NLMSG_ERROR` frame; `errno` 0 is an acknowledgement
pub fn ack(errno: i32) -> Vec<u8> {
    let mut data = Vec::new();
    NlMsgHdr {
        nlmsg_len: nlmsg_length(4 + NlMsgHdr::SIZE),
        nlmsg_type: NLMSG_ERROR,
        ..Default::default()
    }
    .write_to(&mut data);
    data.extend_from_slice(&(-errno).to_ne_bytes());
    // Header of the offending request, unused by the parser
    NlMsgHdr::default().write_to(&mut data);
    data
}

pub fn control(msg_type: u16) -> Vec<u8> {
    let mut data = Vec::new();
    NlMsgHdr {
        nlmsg_len: nlmsg_length(0),
        nlmsg_type: msg_type,
        ..Default::default()
    }
    .write_to(&mut data);
    data
}

pub fn link(msg_type: u16, flags: u16, index: i32, name: &str, mac: [u8; 6], mtu: u32) -> Vec<u8> {
    let mut name_bytes = name.as_bytes().to_vec();
    name_bytes.push(0);
    build_message(
        msg_type,
        flags,
        0,
        &IfInfoMsg {
            ifi_index: index,
            ..Default::default()
        },
        &[
            AttributeEntry::new(IFLA_IFNAME, name_bytes),
            AttributeEntry::new(IFLA_ADDRESS, mac.to_vec()),
            AttributeEntry::u32(IFLA_MTU, mtu),
        ],
    )
    .expect("fixture encodes")
}

pub fn route(
    msg_type: u16,
    flags: u16,
    destination: IpNetwork,
    gateway: Option<IpAddr>,
    oif: Option<u32>,
    table: u8,
) -> Vec<u8> {
    route_with_metric(msg_type, flags, destination, gateway, oif, table, None)
}

pub fn route_with_metric(
    msg_type: u16,
    flags: u16,
    destination: IpNetwork,
    gateway: Option<IpAddr>,
    oif: Option<u32>,
    table: u8,
    metric: Option<u32>,
) -> Vec<u8> {
    let family = if destination.is_ipv4() { AF_INET } else { AF_INET6 };
    let mut attributes = Vec::new();
    if destination.prefix() > 0 {
        attributes.push(AttributeEntry::ip(RTA_DST, destination.network()));
    }
    if let Some(gateway) = gateway {
        attributes.push(AttributeEntry::ip(RTA_GATEWAY, gateway));
    }
    if let Some(oif) = oif {
        attributes.push(AttributeEntry::u32(RTA_OIF, oif));
    }
    if let Some(metric) = metric {
        attributes.push(AttributeEntry::u32(RTA_PRIORITY, metric));
    }
    attributes.push(AttributeEntry::u32(RTA_TABLE, u32::from(table)));

    build_message(
        msg_type,
        flags,
        0,
        &RtMsg {
            rtm_family: family,
            rtm_dst_len: destination.prefix(),
            rtm_table: table,
            rtm_protocol: RTPROT_STATIC,
            rtm_type: RTN_UNICAST,
            ..Default::default()
        },
        &attributes,
    )
    .expect("fixture encodes")
}

pub fn address(msg_type: u16, flags: u16, index: u32, address: IpNetwork, label: &str) -> Vec<u8> {
    let family = if address.is_ipv4() { AF_INET } else { AF_INET6 };
    build_message(
        msg_type,
        flags,
        0,
        &IfAddrMsg {
            ifa_family: family,
            ifa_prefixlen: address.prefix(),
            ifa_index: index,
            ..Default::default()
        },
        &[
            AttributeEntry::ip(IFA_ADDRESS, address.ip()),
            AttributeEntry::ip(IFA_LOCAL, address.ip()),
            AttributeEntry::c_string(IFA_LABEL, label, IFNAMSIZ),
        ],
    )
    .expect("fixture encodes")
}

/// Concatenate messages into one datagram
pub fn datagram(parts: &[Vec<u8>]) -> Vec<u8> {
    parts.concat()
}
