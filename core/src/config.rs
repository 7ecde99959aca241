use std::path::Path;

use serde::Deserialize;
use serde::Serialize;

use crate::error::DroneErr;
use crate::error::Result;
use crate::utility::PrivateUtilityKind;

/// Agent configuration, one struct per file section. All timeouts are
/// fractional seconds.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub timeout: TimeoutConfig,
    pub neighborhood: NeighborhoodConfig,
    pub problem_size: ProblemSizeConfig,
    pub utility: UtilityConfig,
    pub logging: LoggingConfig,
    pub problem: ProblemConfig,
    pub messaging: MessagingConfig,
}

impl Config {
    /// Loads the configuration file. Any parse failure is fatal.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| DroneErr::Config(format!("cannot read {}: {e}", path.display())))?;
        toml::from_str(&raw).map_err(|e| DroneErr::Config(e.to_string()))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Short timer: armed when the round looks quiescent; expiry ends it.
    pub agreement_timeout: f64,
    /// Long refreshable timer bounding the round even under message storms.
    pub weak_agreement_timeout: f64,
    /// Upper bound on a single wait for a neighbor queue to fill.
    pub async_timeout: f64,
    /// Overall wall-clock ceiling, enforced by the external supervisor.
    pub scheduling_time_limit: f64,
    /// Width of a message-rate sampling window.
    pub sample_frequency: f64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            agreement_timeout: 3.0,
            weak_agreement_timeout: 60.0,
            async_timeout: 2.0,
            scheduling_time_limit: 300.0,
            sample_frequency: 1.0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NeighborhoodConfig {
    /// When false, instantaneous connectivity varies per 10-second bucket.
    pub stable_connections: bool,
    /// When true, the adjacency comes from `topology_file` instead of the
    /// pseudo-random membership test.
    pub load_topology: bool,
    /// Percent chance, 0-99, that two nodes are one-hop neighbors.
    pub neighbor_probability: u32,
    pub topology_file: String,
}

impl Default for NeighborhoodConfig {
    fn default() -> Self {
        Self {
            stable_connections: true,
            load_topology: false,
            neighbor_probability: 100,
            topology_file: String::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ProblemSizeConfig {
    pub apps_number: usize,
    pub nodes_number: usize,
    pub avg_app_size: usize,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct UtilityConfig {
    pub private_utility: PrivateUtilityKind,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub log_level: String,
    pub results_folder: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_level: "INFO".to_string(),
            results_folder: "results".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ProblemConfig {
    /// Path of the problem-instance JSON file.
    pub instance: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MessagingConfig {
    pub broker_address: String,
    pub username: String,
    pub password: String,
    pub exchange_name: String,
    pub set_name: String,
    pub policy_name: String,
    pub solution_route: String,
    pub app_advertisement_route: String,
    pub resource_route: String,
    /// When true, resource consumption of a deployment is simulated
    /// locally instead of waiting for the environment to confirm it, and
    /// no solution message is emitted.
    pub debug_mode: bool,
}

impl Default for MessagingConfig {
    fn default() -> Self {
        Self {
            broker_address: "127.0.0.1".to_string(),
            username: "drone".to_string(),
            password: "drone".to_string(),
            exchange_name: "drone-exchange".to_string(),
            set_name: "drone-set".to_string(),
            policy_name: "drone-policy".to_string(),
            solution_route: "solution".to_string(),
            app_advertisement_route: "app-advertisement".to_string(),
            resource_route: "resource".to_string(),
            debug_mode: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn loads_sectioned_file() {
        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        write!(
            file,
            r#"
[timeout]
agreement_timeout = 2.0
weak_agreement_timeout = 30.0
async_timeout = 0.5
scheduling_time_limit = 120.0
sample_frequency = 1.0

[neighborhood]
stable_connections = true
load_topology = false
neighbor_probability = 60
topology_file = ""

[problem_size]
apps_number = 2
nodes_number = 3
avg_app_size = 2

[utility]
private_utility = "RESIDUAL-CAPACITY"

[logging]
log_level = "INFO"
results_folder = "results"

[problem]
instance = "config/instance.json"

[messaging]
broker_address = "10.0.0.1"
debug_mode = true
"#
        )
        .expect("write config");

        let config = Config::load(file.path()).expect("load");
        assert_eq!(config.timeout.agreement_timeout, 2.0);
        assert_eq!(config.neighborhood.neighbor_probability, 60);
        assert_eq!(
            config.utility.private_utility,
            PrivateUtilityKind::ResidualCapacity
        );
        assert_eq!(config.messaging.broker_address, "10.0.0.1");
        assert!(config.messaging.debug_mode);
        // Keys omitted from the file fall back to defaults.
        assert_eq!(config.messaging.resource_route, "resource");
    }

    #[test]
    fn missing_file_is_fatal() {
        let err = Config::load(Path::new("/nonexistent/drone.toml"));
        assert!(matches!(err, Err(DroneErr::Config(_))));
    }

    #[test]
    fn unknown_utility_is_rejected() {
        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        write!(
            file,
            r#"
[utility]
private_utility = "MAX-THROUGHPUT"
"#
        )
        .expect("write config");
        assert!(matches!(
            Config::load(file.path()),
            Err(DroneErr::Config(_))
        ));
    }
}
