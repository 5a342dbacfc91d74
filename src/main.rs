// ============================================================================
// rtnl-mirror - Main Entry Point
// ============================================================================
//
// Starts the agent against the running kernel, prints what it mirrored at
// startup, then keeps the mirror live until Ctrl-C.
//
// Usage: rtnl-mirror [config.json]
//
// Architecture:
// - Main thread: startup, snapshot output, shutdown flag polling
// - Monitor thread: owned by the agent, folds kernel notifications into caches
//
// ============================================================================

use core::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::env;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{error, info};

use rtnl_mirror::{AgentConfig, InterfaceRecord, NetlinkAgent, RouteRecord, logging};

/// Seeded state printed on startup
#[derive(Serialize)]
struct Snapshot {
    interfaces: Vec<InterfaceRecord>,
    ipv4_routes: Vec<RouteRecord>,
    ipv6_routes: Vec<RouteRecord>,
}

fn load_config() -> Result<AgentConfig, rtnl_mirror::ConfigError> {
    match env::args().nth(1) {
        Some(path) => {
            let config = AgentConfig::from_json_file(&path)?;
            info!(%path, "configuration loaded");
            Ok(config)
        }
        None => Ok(AgentConfig::default()),
    }
}

fn main() -> ExitCode {
    logging::init();

    let config = match load_config() {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "invalid configuration");
            return ExitCode::FAILURE;
        }
    };

    // Without the notification socket the mirror would go stale silently
    let mut agent = match NetlinkAgent::start(config) {
        Ok(agent) => agent,
        Err(e) => {
            error!(error = %e, "cannot start agent");
            return ExitCode::FAILURE;
        }
    };

    let snapshot = Snapshot {
        interfaces: agent.interfaces(),
        ipv4_routes: agent.ipv4_routes(),
        ipv6_routes: agent.ipv6_routes(),
    };
    match serde_json::to_string_pretty(&snapshot) {
        Ok(json) => println!("{json}"),
        Err(e) => error!(error = %e, "cannot serialize snapshot"),
    }

    // Setup graceful shutdown on Ctrl-C
    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        r.store(false, AtomicOrdering::SeqCst);
    }) {
        error!(error = %e, "cannot install Ctrl-C handler");
        agent.shutdown();
        return ExitCode::FAILURE;
    }

    info!("mirroring kernel state, press Ctrl+C to stop");

    // ========================================================================
    // MAIN LOOP
    // ========================================================================
    let mut last_counts = (snapshot.interfaces.len(), snapshot.ipv4_routes.len(), snapshot.ipv6_routes.len());

    while running.load(AtomicOrdering::SeqCst) {
        let counts = (
            agent.interfaces().len(),
            agent.ipv4_routes().len(),
            agent.ipv6_routes().len(),
        );
        if counts != last_counts {
            info!(
                interfaces = counts.0,
                ipv4_routes = counts.1,
                ipv6_routes = counts.2,
                "mirror changed"
            );
            last_counts = counts;
        }

        std::thread::sleep(Duration::from_millis(100));
    }

    info!("shutting down");
    agent.shutdown();
    ExitCode::SUCCESS
}
