use std::collections::BTreeMap;

use serde::Deserialize;
use serde::Serialize;

use crate::now_secs;
use crate::orchestrator::VotingData;
use crate::orchestrator::Winners;
use crate::problem::ResourceOffloadProblem;
use crate::problem::ResourceVector;

/// Vote exchange on a neighbor topic: the sender's full view of the
/// voting table and the winners it derived from it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoteMessage {
    pub sender: String,
    pub timestamp: f64,
    pub winners: Winners,
    #[serde(rename = "voting-data")]
    pub voting_data: VotingData,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AdvertisementType {
    #[serde(rename = "ADD")]
    Add,
    #[serde(rename = "DEL")]
    Del,
    #[serde(rename = "MOD")]
    Mod,
}

/// Application lifecycle announcement on the advertisement route.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppAdvMessage {
    pub sender: String,
    pub timestamp: f64,
    pub app_name: String,
    #[serde(rename = "type")]
    pub adv_type: AdvertisementType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub components: Option<Vec<ComponentAdv>>,
}

impl AppAdvMessage {
    pub fn add(sender: &str, app_name: &str, components: Vec<ComponentAdv>) -> Self {
        Self {
            sender: sender.to_string(),
            timestamp: now_secs(),
            app_name: app_name.to_string(),
            adv_type: AdvertisementType::Add,
            components: Some(components),
        }
    }

    pub fn del(sender: &str, app_name: &str) -> Self {
        Self {
            sender: sender.to_string(),
            timestamp: now_secs(),
            app_name: app_name.to_string(),
            adv_type: AdvertisementType::Del,
            components: None,
        }
    }

    /// Checks the advertisement against the local problem. Incoherent
    /// advertisements are dropped by the caller.
    pub fn validate(&self, problem: &ResourceOffloadProblem) -> bool {
        match self.adv_type {
            AdvertisementType::Del => problem.apps.contains(&self.app_name),
            AdvertisementType::Add => {
                if problem.apps.contains(&self.app_name) {
                    return false;
                }
                let Some(components) = &self.components else {
                    return false;
                };
                if components.is_empty() {
                    return false;
                }
                components.iter().all(|component| {
                    match &component.function {
                        // A component without an inline function must
                        // already be known.
                        None => problem.components.contains(&component.name),
                        Some(function) => function
                            .consumption
                            .keys()
                            .all(|resource| problem.resources.contains(resource)),
                    }
                })
            }
            AdvertisementType::Mod => true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentAdv {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function: Option<FunctionAdv>,
    #[serde(rename = "nodes-blacklist")]
    pub nodes_blacklist: Option<Vec<String>>,
    #[serde(rename = "nodes-whitelist")]
    pub nodes_whitelist: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionAdv {
    pub image: String,
    #[serde(rename = "resources")]
    pub consumption: ResourceVector,
}

impl FunctionAdv {
    /// Registered function name for an inline advertisement.
    pub fn function_name(&self, component: &str) -> String {
        format!("{}:{component}", self.image)
    }
}

/// Availability announcement on the resource route.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceMessage {
    pub sender: String,
    pub timestamp: f64,
    pub node_resources: ResourceVector,
}

impl ResourceMessage {
    pub fn new(sender: &str, node_resources: ResourceVector) -> Self {
        Self {
            sender: sender.to_string(),
            timestamp: now_secs(),
            node_resources,
        }
    }
}

/// Final per-round placement, emitted once on the solution route.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SolutionMessage {
    pub sender: String,
    pub timestamp: f64,
    #[serde(rename = "local-offloading")]
    pub local_offloading: Vec<OffloadedComponent>,
    #[serde(rename = "overall-offloading")]
    pub overall_offloading: Winners,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OffloadedComponent {
    pub name: String,
    pub app_name: String,
    pub function: SolutionFunction,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SolutionFunction {
    pub name: String,
    #[serde(rename = "resources")]
    pub consumption: BTreeMap<String, f64>,
}
