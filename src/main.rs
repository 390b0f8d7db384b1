// src/main.rs
// Entry point for Eos Sonar: loads the config, brings up the ranging session
// over the simulated ring and reads session commands from stdin.

use eos_sonar::core::RING_SIZE;
use eos_sonar::gateway::{self, Command};
use eos_sonar::{RangingSession, SimulatedTransport, Snapshot, SonarConfig};
use log::{error, info, warn};
use std::error::Error;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};

/// Main function: `eos-sonar [config.yaml]`
#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    // Initialize logging, verbosity via RUST_LOG
    env_logger::init();
    info!("Starting Eos sonar...");

    let config = match std::env::args().nth(1) {
        Some(path) => SonarConfig::load(path)?,
        None => {
            info!("No config file given, using defaults");
            SonarConfig::default()
        }
    };

    let ring = config.sensor_ring()?;
    let bearings: [f64; RING_SIZE] = std::array::from_fn(|i| ring.channels()[i].bearing_deg());
    let transport = SimulatedTransport::from_config(&ring, &config.simulation);
    let mut session = RangingSession::new(ring, Arc::new(transport), config.session_settings());

    // Telemetry sink: log every complete snapshot
    session.subscribe(move |snapshot: &Snapshot| {
        let Some(distances) = snapshot.distances() else {
            return;
        };
        match snapshot.nearest() {
            Some(nearest) => info!(
                "Snapshot {:?} cm, nearest {} cm at {:.0} deg",
                distances, nearest.distance_cm, bearings[nearest.position]
            ),
            None => info!("Snapshot {:?} cm", distances),
        }
    });

    println!("type \"start\" to start ranging,");
    println!("\"stop\" to stop ranging,");
    println!("\"reset\" to restart ranging from scratch,");
    println!("\"status\" to show progress,");
    println!("\"end\" to stop ranging and exit");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let command = match line.parse::<Command>() {
            Ok(command) => command,
            Err(e) => {
                warn!("{}", e);
                continue;
            }
        };

        match gateway::apply(command, &mut session).await {
            Ok(reply) => {
                println!("{}", reply.message);
                if reply.exit {
                    break;
                }
            }
            Err(e) => error!("Command '{}' failed: {}", command, e),
        }
    }

    // stdin closed or `end` received
    session.stop().await?;
    info!("Eos sonar stopped");
    Ok(())
}
