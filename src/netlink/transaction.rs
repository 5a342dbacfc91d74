//! One request, one bounded receive loop, one decoded response
//!
//! Every transaction opens its own socket, so replies never have to be
//! correlated across concurrent callers: whatever arrives on the socket
//! belongs to this request (or, for sockets bound to a multicast group, is a
//! notification about it).
//!
//! # Receive classification
//!
//! Each datagram is classified by its first message header:
//!
//! ```text
//! NLMSG_ERROR (no NLM_F_ACK)  → errno != 0: kernel error, errno == 0: ACK
//! NLMSG_NOOP                  → empty success
//! NLMSG_OVERRUN               → failure
//! NLMSG_DONE (anywhere)       → decode everything received, stop
//! NLM_F_MULTI                 → accumulate, keep receiving
//! anything else               → single reply, decode, stop
//! ```
//!
//! A request that carries `NLM_F_ACK` is answered by an error frame, so any
//! other frame seen while waiting for it is the multicast echo of our own
//! change and is skipped.

use std::io;

use thiserror::Error;
use tracing::{debug, warn};

use crate::config::AgentConfig;
use crate::netlink::message::{
    MessageError, RtnlMessage, message_headers, parse_error_message, parse_netlink_messages,
};
use crate::netlink::socket::{Connector, SocketError};
use crate::netlink::structures::*;

#[derive(Debug, Error)]
pub enum TransactionError {
    #[error(transparent)]
    Socket(#[from] SocketError),

    #[error("kernel rejected the request: {} (errno {errno})", strerror(.errno))]
    Kernel { errno: i32 },

    #[error("no reply within the receive timeout")]
    Timeout,

    #[error("kernel reported a receive overrun")]
    Overrun,

    #[error("response exceeds {limit} bytes")]
    ResponseTooLarge { limit: usize },

    #[error("malformed reply: {0}")]
    Malformed(#[from] MessageError),
}

fn strerror(errno: &i32) -> io::Error {
    io::Error::from_raw_os_error(*errno)
}

impl TransactionError {
    /// Kernel errno, when the kernel answered with an error frame
    pub fn errno(&self) -> Option<i32> {
        match self {
            TransactionError::Kernel { errno } => Some(*errno),
            _ => None,
        }
    }
}

/// Send `request` on a fresh socket bound to `groups` and collect the reply
///
/// The socket is dropped, and therefore closed, on every return path.
pub fn execute(
    connector: &dyn Connector,
    request: &[u8],
    groups: u32,
    config: &AgentConfig,
) -> Result<Vec<RtnlMessage>, TransactionError> {
    let expect_ack = NlMsgHdr::read_from(request)
        .is_some_and(|nlh| nlh.nlmsg_flags & NLM_F_ACK != 0);

    // === STEP 1: Open and bind ===
    let mut transport = connector.open(groups, config.receive_timeout())?;

    // === STEP 2: Send ===
    transport.send(request)?;

    // === STEP 3: Receive until the reply is complete ===
    let mut buffer = vec![0u8; config.receive_buffer_bytes];
    let mut accumulated: Vec<u8> = Vec::new();

    loop {
        let len = match transport.recv(&mut buffer) {
            Ok(len) => len,
            Err(SocketError::Timeout) if accumulated.is_empty() => {
                return Err(TransactionError::Timeout);
            }
            Err(SocketError::Timeout) => {
                warn!(
                    bytes = accumulated.len(),
                    "dump ended without NLMSG_DONE, using partial reply"
                );
                return finish(&accumulated);
            }
            Err(SocketError::Truncated { len, capacity }) => {
                warn!(len, capacity, "discarding truncated datagram");
                continue;
            }
            Err(SocketError::Overrun) => {
                warn!("receive queue overrun during transaction");
                return Err(TransactionError::Overrun);
            }
            Err(e) => return Err(e.into()),
        };

        let datagram = &buffer[..len];
        let Some(first) = NlMsgHdr::read_from(datagram) else {
            debug!(len, "ignoring runt datagram");
            continue;
        };

        match first.nlmsg_type {
            NLMSG_ERROR if first.nlmsg_flags & NLM_F_ACK == 0 => {
                let errno = parse_error_message(datagram)?;
                if errno != 0 {
                    return Err(TransactionError::Kernel { errno });
                }
                return finish(&accumulated);
            }

            NLMSG_NOOP => return Ok(Vec::new()),

            NLMSG_OVERRUN => {
                warn!("kernel sent NLMSG_OVERRUN");
                return Err(TransactionError::Overrun);
            }

            _ if message_headers(datagram).any(|nlh| nlh.nlmsg_type == NLMSG_DONE) => {
                append(&mut accumulated, datagram, config.max_response_bytes)?;
                return finish(&accumulated);
            }

            _ if first.nlmsg_flags & NLM_F_MULTI != 0 => {
                append(&mut accumulated, datagram, config.max_response_bytes)?;
            }

            msg_type if expect_ack => {
                debug!(msg_type, "skipping echo while waiting for acknowledgement");
            }

            _ => {
                append(&mut accumulated, datagram, config.max_response_bytes)?;
                return finish(&accumulated);
            }
        }
    }
}

fn append(accumulated: &mut Vec<u8>, datagram: &[u8], limit: usize) -> Result<(), TransactionError> {
    if accumulated.len() + datagram.len() > limit {
        return Err(TransactionError::ResponseTooLarge { limit });
    }
    accumulated.extend_from_slice(datagram);
    Ok(())
}

fn finish(accumulated: &[u8]) -> Result<Vec<RtnlMessage>, TransactionError> {
    let messages = parse_netlink_messages(accumulated)?;

    // An error frame can also sit inside a multi-part reply
    if let Some(errno) = messages.iter().find_map(|m| match m {
        RtnlMessage::Error(errno) if *errno != 0 => Some(*errno),
        _ => None,
    }) {
        return Err(TransactionError::Kernel { errno });
    }

    Ok(messages)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::netlink::testing::{self, Reply, ScriptedConnector};

    fn config() -> AgentConfig {
        AgentConfig {
            receive_timeout_ms: 10,
            ..Default::default()
        }
    }

    fn request(flags: u16) -> Vec<u8> {
        crate::netlink::message::build_request(RTM_GETLINK, flags, 1, &IfInfoMsg::default())
    }

    fn links(messages: &[RtnlMessage]) -> Vec<u32> {
        messages
            .iter()
            .filter_map(|m| match m {
                RtnlMessage::NewLink(link) => Some(link.index()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_multi_part_dump_until_done() {
        let connector = ScriptedConnector::new();
        let mac = [0; 6];
        connector.script(vec![
            Reply::Data(testing::datagram(&[
                testing::link(RTM_NEWLINK, NLM_F_MULTI, 1, "lo", mac, 65536),
                testing::link(RTM_NEWLINK, NLM_F_MULTI, 2, "eth0", mac, 1500),
            ])),
            Reply::Data(testing::link(RTM_NEWLINK, NLM_F_MULTI, 3, "wlan0", mac, 1500)),
            Reply::Data(testing::done(1)),
        ]);

        let messages = execute(&connector, &request(NLM_F_REQUEST | NLM_F_DUMP), 0, &config())
            .expect("dump");
        assert_eq!(links(&messages), vec![1, 2, 3]);
        assert_eq!(messages.last(), Some(&RtnlMessage::Done));

        assert_eq!(connector.opened_groups(), vec![0]);
        assert_eq!(connector.sent().len(), 1);
    }

    #[test]
    fn test_done_inside_last_datagram() {
        let connector = ScriptedConnector::new();
        connector.script(vec![Reply::Data(testing::datagram(&[
            testing::link(RTM_NEWLINK, NLM_F_MULTI, 7, "br0", [0; 6], 1500),
            testing::done(1),
        ]))]);

        let messages = execute(&connector, &request(NLM_F_REQUEST | NLM_F_DUMP), 0, &config())
            .expect("dump");
        assert_eq!(links(&messages), vec![7]);
    }

    #[test]
    fn test_kernel_error() {
        let connector = ScriptedConnector::new();
        connector.script(vec![Reply::Data(testing::ack(libc::EEXIST))]);

        let err = execute(&connector, &request(NLM_F_REQUEST | NLM_F_ACK), 0, &config())
            .unwrap_err();
        assert_eq!(err.errno(), Some(libc::EEXIST));
    }

    #[test]
    fn test_ack_is_success() {
        let connector = ScriptedConnector::new();
        connector.script(vec![Reply::Data(testing::ack(0))]);

        let messages = execute(&connector, &request(NLM_F_REQUEST | NLM_F_ACK), 0, &config())
            .expect("ack");
        assert!(messages.is_empty());
    }

    #[test]
    fn test_echo_skipped_until_ack() {
        let connector = ScriptedConnector::new();
        let echo = testing::address(
            RTM_NEWADDR,
            0,
            4,
            "10.1.0.2/24".parse().expect("net"),
            "eth0",
        );
        connector.script(vec![Reply::Data(echo), Reply::Data(testing::ack(0))]);

        execute(&connector, &request(NLM_F_REQUEST | NLM_F_ACK), RTMGRP_IPV4_IFADDR, &config())
            .expect("ack after echo");
        assert_eq!(connector.opened_groups(), vec![RTMGRP_IPV4_IFADDR]);
    }

    #[test]
    fn test_single_reply_without_ack() {
        let connector = ScriptedConnector::new();
        connector.script(vec![Reply::Data(testing::link(
            RTM_NEWLINK,
            0,
            2,
            "eth0",
            [0; 6],
            1500,
        ))]);

        let messages = execute(&connector, &request(NLM_F_REQUEST), 0, &config()).expect("reply");
        assert_eq!(links(&messages), vec![2]);
    }

    #[test]
    fn test_timeout_without_data() {
        let connector = ScriptedConnector::new();
        let err = execute(&connector, &request(NLM_F_REQUEST | NLM_F_ACK), 0, &config())
            .unwrap_err();
        assert!(matches!(err, TransactionError::Timeout));
    }

    #[test]
    fn test_timeout_after_partial_dump_returns_partial() {
        let connector = ScriptedConnector::new();
        connector.script(vec![Reply::Data(testing::link(
            RTM_NEWLINK,
            NLM_F_MULTI,
            1,
            "lo",
            [0; 6],
            65536,
        ))]);

        let messages = execute(&connector, &request(NLM_F_REQUEST | NLM_F_DUMP), 0, &config())
            .expect("partial");
        assert_eq!(links(&messages), vec![1]);
    }

    #[test]
    fn test_noop_and_overrun() {
        let connector = ScriptedConnector::new();
        connector.script(vec![Reply::Data(testing::control(NLMSG_NOOP))]);
        connector.script(vec![Reply::Data(testing::control(NLMSG_OVERRUN))]);
        connector.script(vec![Reply::Overrun]);

        let req = request(NLM_F_REQUEST | NLM_F_DUMP);
        assert!(execute(&connector, &req, 0, &config()).expect("noop").is_empty());
        assert!(matches!(
            execute(&connector, &req, 0, &config()),
            Err(TransactionError::Overrun)
        ));
        assert!(matches!(
            execute(&connector, &req, 0, &config()),
            Err(TransactionError::Overrun)
        ));
    }

    #[test]
    fn test_response_limit() {
        let connector = ScriptedConnector::new();
        let part = testing::link(RTM_NEWLINK, NLM_F_MULTI, 1, "lo", [0; 6], 65536);
        connector.script(vec![Reply::Data(part.clone()); 8]);

        let config = AgentConfig {
            receive_timeout_ms: 10,
            receive_buffer_bytes: 128,
            max_response_bytes: 3 * part.len(),
            ..Default::default()
        };
        let err = execute(&connector, &request(NLM_F_REQUEST | NLM_F_DUMP), 0, &config)
            .unwrap_err();
        assert!(matches!(err, TransactionError::ResponseTooLarge { .. }));
    }

    #[test]
    fn test_truncated_datagram_discarded() {
        let connector = ScriptedConnector::new();
        connector.script(vec![
            Reply::Data(vec![0u8; 4096]),
            Reply::Data(testing::ack(0)),
        ]);

        let config = AgentConfig {
            receive_timeout_ms: 10,
            receive_buffer_bytes: 1024,
            ..Default::default()
        };
        execute(&connector, &request(NLM_F_REQUEST | NLM_F_ACK), 0, &config)
            .expect("ack after truncated datagram");
    }

    #[test]
    fn test_open_failure_is_socket_error() {
        let connector = ScriptedConnector::new();
        connector.fail_next_open();
        assert!(matches!(
            execute(&connector, &request(NLM_F_REQUEST), 0, &config()),
            Err(TransactionError::Socket(SocketError::Bind(_)))
        ));
        assert!(connector.sent().is_empty());
    }
}
