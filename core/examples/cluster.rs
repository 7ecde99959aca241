//! Three agents on one in-process fabric converging on a placement.
//!
//! Run with: cargo run -p drone-core --example cluster

use std::thread;

use drone_core::Config;
use drone_core::DroneAgent;
use drone_core::InProcFabric;
use drone_core::ResourceOffloadProblem;

const INSTANCE: &str = r#"{
    "apps": ["iot-pipeline", "cache"],
    "functions": ["ingest:1.0", "transform:1.0", "redis:7"],
    "components": ["ingest", "transform", "store"],
    "resources": ["cpu", "memory"],
    "nodes": ["edge-1", "edge-2", "edge-3"],
    "consumption": {
        "ingest:1.0": {"cpu": 1, "memory": 1},
        "transform:1.0": {"cpu": 2, "memory": 1},
        "redis:7": {"cpu": 1, "memory": 2}
    },
    "available_resources": {
        "edge-1": {"cpu": 4, "memory": 4},
        "edge-2": {"cpu": 4, "memory": 4},
        "edge-3": {"cpu": 2, "memory": 4}
    },
    "app_descriptions": {
        "iot-pipeline": {
            "base-node": "edge-1",
            "components": ["ingest", "transform"]
        },
        "cache": {
            "base-node": "edge-2",
            "components": ["store"]
        }
    },
    "implementations": {
        "ingest": ["ingest:1.0"],
        "transform": ["transform:1.0"],
        "store": ["redis:7"]
    }
}"#;

fn main() -> drone_core::Result<()> {
    let mut config = Config::default();
    config.timeout.agreement_timeout = 0.5;
    config.timeout.weak_agreement_timeout = 10.0;
    config.timeout.async_timeout = 0.2;
    config.messaging.debug_mode = true;

    let fabric = InProcFabric::new();
    let mut handles = Vec::new();
    for node in ["edge-1", "edge-2", "edge-3"] {
        let problem = ResourceOffloadProblem::parse_instance(INSTANCE)?;
        let agent = DroneAgent::new(node, problem, config.clone(), fabric.clone(), false)?;
        handles.push(thread::spawn(move || agent.run()));
    }
    for handle in handles {
        match handle.join() {
            Ok(Ok(outcome)) => {
                println!(
                    "strong={} bundle={:?} utility={}",
                    outcome.strong_agreement, outcome.offload_bundle, outcome.utility
                );
            }
            Ok(Err(error)) => eprintln!("agent failed: {error}"),
            Err(_) => eprintln!("agent thread panicked"),
        }
    }
    Ok(())
}
