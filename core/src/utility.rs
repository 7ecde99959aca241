use serde::Deserialize;
use serde::Serialize;

use crate::error::Result;
use crate::orchestrator::BundleEntry;
use crate::problem::ResourceOffloadProblem;

/// Utility implementations selectable from the `[utility]` section.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum PrivateUtilityKind {
    #[default]
    #[serde(rename = "RESIDUAL-CAPACITY")]
    ResidualCapacity,
}

impl PrivateUtilityKind {
    /// Builds the utility implementation for a node.
    pub fn for_node(self, node: &str) -> Result<Box<dyn PrivateUtility>> {
        match self {
            PrivateUtilityKind::ResidualCapacity => {
                Ok(Box::new(ResidualCapacityUtility::new(node)))
            }
        }
    }
}

/// A node's private valuation of bundle entries.
///
/// Implementations must guarantee that the utility of a component does not
/// increase due to the presence of components of other applications; the
/// orchestrator's vote generation relies on it.
pub trait PrivateUtility: Send {
    /// Marginal utility of adding `(app, component, function)` to the
    /// current bundle. Zero when the function does not implement the
    /// component.
    fn marginal_utility(
        &self,
        problem: &ResourceOffloadProblem,
        bundle: &[BundleEntry],
        app: &str,
        component: &str,
        function: &str,
    ) -> u64;

    /// Given entries lost during an election, the complete list of bundle
    /// entries to remove: the lost ones plus every entry whose utility was
    /// computed after them and is therefore no longer valid.
    fn to_be_released(
        &self,
        bundle: &[BundleEntry],
        lost: &[(String, String)],
    ) -> Vec<BundleEntry>;
}

/// Residual-capacity utility: the stress profile left on the hosting node
/// after placement, scaled to an integer in [0, 100].
pub struct ResidualCapacityUtility {
    node_name: String,
}

impl ResidualCapacityUtility {
    pub fn new(node: &str) -> Self {
        Self {
            node_name: node.to_string(),
        }
    }
}

impl PrivateUtility for ResidualCapacityUtility {
    fn marginal_utility(
        &self,
        problem: &ResourceOffloadProblem,
        bundle: &[BundleEntry],
        _app: &str,
        component: &str,
        function: &str,
    ) -> u64 {
        if !problem.check_function_implements_component(component, function) {
            return 0;
        }
        let mut residual = problem
            .available_resources
            .get(&self.node_name)
            .cloned()
            .unwrap_or_default();
        for entry in bundle {
            residual = problem.sub_resources(&residual, &problem.consumption_of(&entry.function));
        }
        residual = problem.sub_resources(&residual, &problem.consumption_of(function));
        (problem.norm(&self.node_name, &residual) * 100.0).round() as u64
    }

    fn to_be_released(
        &self,
        bundle: &[BundleEntry],
        lost: &[(String, String)],
    ) -> Vec<BundleEntry> {
        // Utilities of entries may depend on entries taken before them, so
        // everything from the earliest lost position onward is invalid.
        let first_lost = bundle
            .iter()
            .position(|entry| {
                lost.iter()
                    .any(|(app, component)| *app == entry.app && *component == entry.component)
            });
        match first_lost {
            Some(index) => bundle[index..].to_vec(),
            None => Vec::new(),
        }
    }
}
