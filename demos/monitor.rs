use std::time::Duration;

use stationlink::util::init_tracing;
use stationlink::{Config, EventPayload, Station};

#[tokio::main]
async fn main() {
    init_tracing("stationlink=info");

    // Load configuration from the path given on the command line
    let config = match std::env::args().nth(1) {
        Some(path) => {
            let text = match std::fs::read_to_string(&path) {
                Ok(text) => text,
                Err(e) => {
                    eprintln!("Failed to read {}: {}", path, e);
                    std::process::exit(1);
                }
            };
            match Config::from_json(&text) {
                Ok(config) => config,
                Err(e) => {
                    eprintln!("{}", e);
                    std::process::exit(1);
                }
            }
        }
        None => {
            println!("No configuration given; listening for SmartSDR announcements only");
            Config::from_json(
                r#"{ "listeners": [ { "protocol": "smart-sdr", "bind": "0.0.0.0:4992", "expiry": 15 } ] }"#,
            )
            .unwrap()
        }
    };

    println!("Starting station core:");
    println!("- Endpoints: {}", config.endpoints.len());
    println!("- Discovery listeners: {}", config.listeners.len());
    println!("- Broadcasters: {}", config.broadcasters.len());

    let station = match Station::start(config).await {
        Ok(station) => station,
        Err(e) => {
            eprintln!("Failed to start: {}", e);
            std::process::exit(1);
        }
    };
    let mut subscription = station.hub().subscribe().await.unwrap();

    println!("\nMonitoring until Ctrl-C...");
    let mut stats_tick = tokio::time::interval(Duration::from_secs(30));
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = subscription.recv() => {
                let Some(event) = event else { break };
                match &event.payload {
                    EventPayload::DeviceSnapshot(snapshot) => {
                        println!("[{}] {:?} at {} ({:?})", event.device, snapshot.protocol, snapshot.endpoint, snapshot.state);
                    }
                    EventPayload::ConnectionStateChanged { from, to, error } => {
                        println!("[{}] {:?} -> {:?}{}", event.device, from, to,
                                 error.as_ref().map(|e| format!(": {}", e)).unwrap_or_default());
                    }
                    EventPayload::SpotReceived(spot) => {
                        println!("[{}] {} spotted {} on {:.1} kHz", event.device, spot.spotter, spot.dx_call,
                                 spot.frequency_hz as f64 / 1000.0);
                    }
                    other => {
                        println!("[{}] {}", event.device, serde_json::to_string(other).unwrap_or_default());
                    }
                }
            }
            _ = stats_tick.tick() => {
                for (protocol, stats) in station.discovery_stats() {
                    println!("Discovery {:?}: {} datagrams, {} announcements, {} malformed",
                             protocol, stats.datagrams(), stats.announcements(), stats.malformed());
                }
                if let Ok(devices) = station.registry().list().await {
                    for device in devices {
                        let stats = device.stats();
                        println!("Device {} ({:?}): {} connects, {} messages, {} decode errors",
                                 device.descriptor().key(), device.state(), stats.connects(),
                                 stats.messages(), stats.decode_errors());
                    }
                }
            }
        }
    }

    println!("\nShutting down...");
    if let Err(e) = station.shutdown().await {
        eprintln!("Shutdown failed: {}", e);
    }
}
