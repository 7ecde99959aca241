use std::collections::BTreeMap;
use std::collections::BTreeSet;

use sha1::Digest;
use sha1::Sha1;

use crate::config::NeighborhoodConfig;
use crate::error::DroneErr;
use crate::error::Result;
use crate::now_secs;

/// Width of a connectivity bucket when connections are unstable.
const CONNECTIVITY_BUCKET_SECS: f64 = 10.0;

/// Determines which nodes are one-hop neighbors of the base node, either
/// from a topology file or from a pseudo-random membership test, and
/// whether a neighbor is reachable right now.
pub struct NeighborhoodDetector {
    base_node: String,
    stable_connections: bool,
    neighborhood: Vec<String>,
}

impl NeighborhoodDetector {
    pub fn new(
        nodes: &BTreeSet<String>,
        base_node: &str,
        config: &NeighborhoodConfig,
    ) -> Result<Self> {
        let neighborhood = if config.load_topology {
            let raw = std::fs::read_to_string(&config.topology_file).map_err(|e| {
                DroneErr::Config(format!(
                    "cannot read topology file {}: {e}",
                    config.topology_file
                ))
            })?;
            let topology: BTreeMap<String, BTreeSet<String>> = serde_json::from_str(&raw)
                .map_err(|e| DroneErr::Config(format!("malformed topology file: {e}")))?;
            let adjacent = topology.get(base_node).cloned().unwrap_or_default();
            nodes
                .iter()
                .filter(|node| *node != base_node && adjacent.contains(*node))
                .cloned()
                .collect()
        } else {
            nodes
                .iter()
                .filter(|node| {
                    *node != base_node
                        && are_neighbors(base_node, node, config.neighbor_probability)
                })
                .cloned()
                .collect()
        };
        Ok(Self {
            base_node: base_node.to_string(),
            stable_connections: config.stable_connections,
            neighborhood,
        })
    }

    /// The static neighbor set.
    pub fn neighborhood(&self) -> &[String] {
        &self.neighborhood
    }

    /// The neighbors reachable at this instant. With stable connections
    /// this is the static set; otherwise connectivity flips pseudo-randomly
    /// per 10-second bucket.
    pub fn current_neighborhood(&self) -> Vec<String> {
        if self.stable_connections {
            return self.neighborhood.clone();
        }
        let bucket = (now_secs() / CONNECTIVITY_BUCKET_SECS) as u64;
        self.neighborhood
            .iter()
            .filter(|node| is_connected(&self.base_node, node, bucket))
            .cloned()
            .collect()
    }
}

/// Digest of the input folded down to `modulus`.
fn digest_mod(input: &str, modulus: u64) -> u64 {
    let digest = Sha1::digest(input.as_bytes());
    digest
        .iter()
        .fold(0u64, |acc, byte| (acc * 256 + u64::from(*byte)) % modulus)
}

fn sorted_pair<'a>(node1: &'a str, node2: &'a str) -> (&'a str, &'a str) {
    if node1 <= node2 {
        (node1, node2)
    } else {
        (node2, node1)
    }
}

/// Symmetric, deterministic membership: the digest of the sorted pair
/// against the configured percent probability.
fn are_neighbors(node1: &str, node2: &str, probability: u32) -> bool {
    let (first, second) = sorted_pair(node1, node2);
    digest_mod(&format!("1:{first}:{second}"), 100) < u64::from(probability)
}

/// Instantaneous connectivity for one time bucket, up three times out of
/// four.
fn is_connected(node1: &str, node2: &str, bucket: u64) -> bool {
    let (first, second) = sorted_pair(node1, node2);
    digest_mod(&format!("{first}:{second}:{bucket}"), 4) != 0
}
