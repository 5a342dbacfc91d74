//! Background listener for rtnetlink multicast notifications
//!
//! # Lifecycle
//!
//! ```text
//!   bind()          start()          stop()             join
//! ────────► Starting ───────► Running ───────► Stopping ──────► Stopped
//! ```
//!
//! The socket is bound in [`EventMonitor::bind`], before the caller seeds its
//! caches with dumps, so no notification emitted between the dump and the
//! start of the thread is lost: it simply waits in the socket queue.
//!
//! # Educational Notes
//!
//! ## Cancellation
//!
//! The thread checks an `AtomicBool` at the top of every iteration. `stop()`
//! clears it with `Release` ordering and the loop reads it with `Acquire`.
//! A receive never blocks longer than `SO_RCVTIMEO`, so the thread notices
//! the request within one timeout plus one idle backoff.
//!
//! ## Socket ownership
//!
//! The transport moves into the thread and comes back through the
//! `JoinHandle`; dropping it after the join closes the socket.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, error, info, trace, warn};

use crate::config::AgentConfig;
use crate::netlink::message::{RtnlMessage, parse_netlink_messages};
use crate::netlink::socket::{Connector, SocketError, Transport};
use crate::netlink::structures::*;

/// Every group the monitor listens to
pub const MONITOR_GROUPS: u32 = RTMGRP_LINK
    | RTMGRP_NOTIFY
    | RTMGRP_IPV4_IFADDR
    | RTMGRP_IPV6_IFADDR
    | RTMGRP_IPV4_ROUTE
    | RTMGRP_IPV6_ROUTE;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MonitorState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

/// Receiver of decoded notifications, called on the monitor thread
pub trait NotificationSink: Send + Sync {
    fn deliver(&self, message: &RtnlMessage);
}

pub struct EventMonitor {
    state: Mutex<MonitorState>,
    running: Arc<AtomicBool>,
    // Held here between bind() and start(); the mutex only makes the monitor Sync
    transport: Mutex<Option<Box<dyn Transport>>>,
    handle: Option<JoinHandle<Box<dyn Transport>>>,
    buffer_size: usize,
    idle_backoff: Duration,
}

impl EventMonitor {
    /// Open the notification socket bound to [`MONITOR_GROUPS`]
    pub fn bind(connector: &dyn Connector, config: &AgentConfig) -> Result<Self, SocketError> {
        let transport = connector.open(MONITOR_GROUPS, config.receive_timeout())?;
        debug!(groups = MONITOR_GROUPS, "notification socket bound");

        Ok(Self {
            state: Mutex::new(MonitorState::Starting),
            running: Arc::new(AtomicBool::new(false)),
            transport: Mutex::new(Some(transport)),
            handle: None,
            buffer_size: config.receive_buffer_bytes,
            idle_backoff: config.monitor_idle_backoff(),
        })
    }

    pub fn state(&self) -> MonitorState {
        *self.state.lock()
    }

    /// Spawn the listener thread
    ///
    /// Does nothing unless the monitor is `Starting`.
    pub fn start(&mut self, sink: Arc<dyn NotificationSink>) -> std::io::Result<()> {
        let Some(transport) = self.transport.get_mut().take() else {
            debug!(state = ?self.state(), "monitor already started");
            return Ok(());
        };

        self.running.store(true, Ordering::Release);
        let running = Arc::clone(&self.running);
        let buffer_size = self.buffer_size;
        let idle_backoff = self.idle_backoff;

        let spawned = std::thread::Builder::new()
            .name("rtnl-monitor".to_string())
            .spawn(move || listen(transport, running, sink, buffer_size, idle_backoff));

        match spawned {
            Ok(handle) => {
                self.handle = Some(handle);
                *self.state.lock() = MonitorState::Running;
                info!("event monitor running");
                Ok(())
            }
            Err(e) => {
                // The transport went into the closure and is already dropped
                self.running.store(false, Ordering::Release);
                *self.state.lock() = MonitorState::Stopped;
                Err(e)
            }
        }
    }

    /// Stop the thread and close the socket; safe to call repeatedly
    pub fn stop(&mut self) {
        if self.state() == MonitorState::Stopped {
            return;
        }
        *self.state.lock() = MonitorState::Stopping;

        self.running.store(false, Ordering::Release);

        if let Some(handle) = self.handle.take() {
            match handle.join() {
                Ok(transport) => drop(transport),
                Err(_) => error!("event monitor thread panicked"),
            }
        }
        // Bound but never started
        *self.transport.get_mut() = None;

        *self.state.lock() = MonitorState::Stopped;
        info!("event monitor stopped");
    }
}

impl Drop for EventMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Monitor thread body; returns the transport for closing
fn listen(
    mut transport: Box<dyn Transport>,
    running: Arc<AtomicBool>,
    sink: Arc<dyn NotificationSink>,
    buffer_size: usize,
    idle_backoff: Duration,
) -> Box<dyn Transport> {
    let mut buffer = vec![0u8; buffer_size];

    while running.load(Ordering::Acquire) {
        let len = match transport.recv(&mut buffer) {
            Ok(0) => {
                std::thread::sleep(idle_backoff);
                continue;
            }
            Ok(len) => len,
            Err(SocketError::Timeout) => {
                std::thread::sleep(idle_backoff);
                continue;
            }
            Err(e @ (SocketError::Truncated { .. } | SocketError::Overrun)) => {
                warn!(error = %e, "notifications lost");
                continue;
            }
            Err(e) => {
                warn!(error = %e, "notification receive failed");
                std::thread::sleep(idle_backoff);
                continue;
            }
        };

        match parse_netlink_messages(&buffer[..len]) {
            Ok(messages) => {
                for message in &messages {
                    trace!(?message, "notification");
                    sink.deliver(message);
                }
            }
            Err(e) => warn!(error = %e, len, "discarding malformed notification"),
        }
    }

    transport
}
