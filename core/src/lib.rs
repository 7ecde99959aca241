//! drone-core: a fully-decentralized placement engine for edge clusters.
//!
//! Every node runs one agent; agents exchange compact voting messages with
//! their one-hop neighbors and converge, without a central scheduler, on a
//! placement of application components that respects node capacities and
//! placement constraints while locally maximizing each node's private
//! utility.

use std::time::SystemTime;
use std::time::UNIX_EPOCH;

pub mod agent;
pub mod agreement;
pub mod config;
pub mod error;
pub mod messages;
pub mod messaging;
pub mod neighborhood;
pub mod orchestrator;
pub mod problem;
pub mod utility;

pub use agent::DroneAgent;
pub use agent::RoundSummary;
pub use agent::RunOutcome;
pub use agreement::DroneAgreement;
pub use agreement::ReceivedData;
pub use config::Config;
pub use error::DroneErr;
pub use error::Result;
pub use messaging::InProcFabric;
pub use messaging::MessageFabric;
pub use messaging::Messaging;
pub use messaging::ShutdownHandle;
pub use messaging::TimerKind;
pub use neighborhood::NeighborhoodDetector;
pub use orchestrator::BundleEntry;
pub use orchestrator::DroneOrchestrator;
pub use orchestrator::Vote;
pub use problem::ResourceOffloadProblem;
pub use utility::PrivateUtility;
pub use utility::PrivateUtilityKind;

/// Wall-clock seconds since the epoch; vote and message timestamps.
pub fn now_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs_f64())
        .unwrap_or(0.0)
}
