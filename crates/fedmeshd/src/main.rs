//! fedmeshd - federated learning peer node
//!
//! Joins the mesh, keeps heartbeats and gossip running, and logs the
//! learning events an orchestration layer would consume.

use clap::Parser;
use fedmesh_net::LearningEvent;
use fedmeshd::config::Config;
use fedmeshd::node::Node;
use std::process::ExitCode;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> ExitCode {
    let config = Config::parse();

    // Initialize logging
    let level = if config.verbose { "debug" } else { "info" };
    let filter = EnvFilter::from_default_env()
        .add_directive(format!("fedmeshd={}", level).parse().unwrap())
        .add_directive(format!("fedmesh_net={}", level).parse().unwrap())
        .add_directive(format!("fedmesh_core={}", level).parse().unwrap());
    let registry = tracing_subscriber::registry().with(filter);
    if config.log_format == "json" {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer()).init();
    }

    info!("fedmeshd v{} - federated learning peer node", env!("CARGO_PKG_VERSION"));

    if let Err(e) = config.validate() {
        error!("Invalid configuration: {}", e);
        return ExitCode::FAILURE;
    }
    let settings = match config.load_settings() {
        Ok(settings) => settings,
        Err(e) => {
            error!("Invalid settings: {:#}", e);
            return ExitCode::FAILURE;
        }
    };

    let (node, mut learning) =
        match Node::bind(config.listen, config.host, config.role, config.encrypt, settings).await {
            Ok(bound) => bound,
            Err(e) => {
                error!("Failed to bind {}: {}", config.listen, e);
                return ExitCode::FAILURE;
            }
        };
    if let Err(e) = node.start() {
        error!("Failed to start node: {}", e);
        return ExitCode::FAILURE;
    }

    for neighbor in &config.neighbors {
        if let Err(e) = node.connect_to(*neighbor, config.connect_full, false).await {
            warn!("Could not connect to {}: {}", neighbor, e);
        }
    }

    if config.start {
        node.set_start_learning(config.rounds, config.epochs);
    }

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    loop {
        tokio::select! {
            Some(event) = learning.recv() => log_learning_event(&event),
            _ = &mut ctrl_c => {
                info!("Received shutdown signal");
                break;
            }
        }
    }

    node.stop().await;
    ExitCode::SUCCESS
}

fn log_learning_event(event: &LearningEvent) {
    match event {
        LearningEvent::StartLearning { rounds, epochs } => {
            info!("Learning started: {} rounds, {} epochs", rounds, epochs)
        }
        LearningEvent::StopLearning => info!("Learning stopped"),
        LearningEvent::Params { from, data } => {
            info!("Received {} bytes of parameters from {}", data.len(), from)
        }
        LearningEvent::StatusReport {
            name,
            role,
            neighbors,
            network_nodes,
        } => info!(
            "Status of {} ({}): {} neighbors, {} nodes in network",
            name,
            role,
            neighbors.len(),
            network_nodes.len()
        ),
        other => debug!("Learning event: {:?}", other),
    }
}
