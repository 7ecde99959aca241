use std::collections::BTreeMap;
use std::collections::BTreeSet;

use serde::Deserialize;
use serde::Serialize;

use crate::error::DroneErr;
use crate::error::Result;

/// Amount of each named resource. Amounts are kept as floats because the
/// agent repeatedly adds and subtracts consumption vectors.
pub type ResourceVector = BTreeMap<String, f64>;

/// Decimal digits kept by [`round_dig`]. Small enough that `value * 1e9`
/// stays exactly representable for realistic resource magnitudes.
const FLOAT_DIG: f64 = 1e9;

/// Rounds away the drift accumulated by repeated vector arithmetic.
pub fn round_dig(value: f64) -> f64 {
    (value * FLOAT_DIG).round() / FLOAT_DIG
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppDescription {
    #[serde(rename = "base-node", default)]
    pub base_node: Option<String>,
    pub components: Vec<String>,
    #[serde(default)]
    pub constraints: AppConstraints,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConstraints {
    #[serde(default)]
    pub placement: BTreeMap<String, PlacementConstraint>,
}

/// Per-component placement constraint: a component is placeable on a node
/// iff the node is not blacklisted and, when a whitelist exists, is listed.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlacementConstraint {
    #[serde(default)]
    pub blacklist: Option<Vec<String>>,
    #[serde(default)]
    pub whitelist: Option<Vec<String>>,
}

/// Wire layout of the problem-instance file.
#[derive(Debug, Deserialize)]
struct InstanceFile {
    apps: BTreeSet<String>,
    functions: BTreeSet<String>,
    components: BTreeSet<String>,
    resources: BTreeSet<String>,
    nodes: BTreeSet<String>,
    consumption: BTreeMap<String, ResourceVector>,
    available_resources: BTreeMap<String, ResourceVector>,
    app_descriptions: BTreeMap<String, AppDescription>,
    implementations: BTreeMap<String, Vec<String>>,
}

/// The placement problem: who exists, what everything consumes, and what
/// every node currently offers. Pure data plus queries; no protocol state.
#[derive(Debug, Clone, Default)]
pub struct ResourceOffloadProblem {
    pub apps: BTreeSet<String>,
    pub functions: BTreeSet<String>,
    pub components: BTreeSet<String>,
    pub resources: BTreeSet<String>,
    pub nodes: BTreeSet<String>,
    /// Per-function resource cost.
    pub consumption: BTreeMap<String, ResourceVector>,
    pub total_resources: BTreeMap<String, ResourceVector>,
    pub available_resources: BTreeMap<String, ResourceVector>,
    pub app_descriptions: BTreeMap<String, AppDescription>,
    /// For each component, the functions that can implement it.
    pub implementations: BTreeMap<String, Vec<String>>,
}

impl ResourceOffloadProblem {
    /// Parses a problem-instance JSON document. The advertised availability
    /// doubles as the initial total pool.
    pub fn parse_instance(raw: &str) -> Result<Self> {
        let file: InstanceFile = serde_json::from_str(raw)?;
        for (component, functions) in &file.implementations {
            for function in functions {
                if !file.functions.contains(function) {
                    return Err(DroneErr::Config(format!(
                        "implementation '{function}' of component '{component}' is not a known function"
                    )));
                }
            }
        }
        Ok(Self {
            apps: file.apps,
            functions: file.functions,
            components: file.components,
            resources: file.resources,
            nodes: file.nodes,
            consumption: file.consumption,
            total_resources: file.available_resources.clone(),
            available_resources: file.available_resources,
            app_descriptions: file.app_descriptions,
            implementations: file.implementations,
        })
    }

    pub fn consumption_of(&self, function: &str) -> ResourceVector {
        self.consumption.get(function).cloned().unwrap_or_default()
    }

    pub fn bundle_consumption<'a>(
        &self,
        functions: impl IntoIterator<Item = &'a str>,
    ) -> ResourceVector {
        let mut total = self.zero_resources();
        for function in functions {
            total = self.sum_resources(&total, &self.consumption_of(function));
        }
        total
    }

    pub fn zero_resources(&self) -> ResourceVector {
        self.resources.iter().map(|r| (r.clone(), 0.0)).collect()
    }

    /// Completes a sparse amount with zeros over the known resource set.
    pub fn fill_null_resources(&self, amount: &ResourceVector) -> ResourceVector {
        self.resources
            .iter()
            .map(|r| (r.clone(), amount.get(r).copied().unwrap_or(0.0)))
            .collect()
    }

    pub fn sum_resources(&self, a: &ResourceVector, b: &ResourceVector) -> ResourceVector {
        self.resources
            .iter()
            .map(|r| {
                let total = a.get(r).copied().unwrap_or(0.0) + b.get(r).copied().unwrap_or(0.0);
                (r.clone(), total)
            })
            .collect()
    }

    pub fn sub_resources(&self, a: &ResourceVector, b: &ResourceVector) -> ResourceVector {
        self.resources
            .iter()
            .map(|r| {
                let left = a.get(r).copied().unwrap_or(0.0) - b.get(r).copied().unwrap_or(0.0);
                (r.clone(), round_dig(left))
            })
            .collect()
    }

    /// Componentwise `a <= b` over the known resource set.
    pub fn is_bounded(&self, a: &ResourceVector, b: &ResourceVector) -> bool {
        self.resources
            .iter()
            .all(|r| b.get(r).copied().unwrap_or(0.0) >= a.get(r).copied().unwrap_or(0.0))
    }

    pub fn check_equals(&self, a: &ResourceVector, b: &ResourceVector) -> bool {
        self.resources
            .iter()
            .all(|r| a.get(r).copied().unwrap_or(0.0) == b.get(r).copied().unwrap_or(0.0))
    }

    /// Does the function fit the pool?
    pub fn is_function_bounded(&self, pool: &ResourceVector, function: &str) -> bool {
        self.is_bounded(&self.consumption_of(function), pool)
    }

    pub fn check_function_implements_component(&self, component: &str, function: &str) -> bool {
        self.implementations
            .get(component)
            .is_some_and(|functions| functions.iter().any(|f| f == function))
    }

    pub fn implementations_of(&self, component: &str) -> &[String] {
        self.implementations
            .get(component)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn app_components(&self, app: &str) -> &[String] {
        self.app_descriptions
            .get(app)
            .map(|d| d.components.as_slice())
            .unwrap_or_default()
    }

    /// True when the node satisfies the placement constraints declared for
    /// this component: node not blacklisted, and whitelisted if a whitelist
    /// exists.
    pub fn check_constraints(&self, node: &str, app: &str, component: &str) -> bool {
        let Some(description) = self.app_descriptions.get(app) else {
            return false;
        };
        let Some(placement) = description.constraints.placement.get(component) else {
            return true;
        };
        if let Some(blacklist) = &placement.blacklist
            && blacklist.iter().any(|n| n == node)
        {
            return false;
        }
        if let Some(whitelist) = &placement.whitelist
            && !whitelist.iter().any(|n| n == node)
        {
            return false;
        }
        true
    }

    /// Weighted quadratic norm of an amount against the node's pool,
    /// normalized to [0, 1] for amounts within the node's availability.
    /// Each dimension is scaled by the node's available amount and weighted
    /// 1/|dimensions|; resources the node does not offer at all are skipped.
    pub fn norm(&self, node: &str, resources: &ResourceVector) -> f64 {
        let totals = self.total_resources.get(node);
        let available = self.available_resources.get(node);
        let dimensions: Vec<&String> = self
            .resources
            .iter()
            .filter(|r| {
                totals.and_then(|t| t.get(*r)).copied().unwrap_or(0.0) != 0.0
                    && available.and_then(|a| a.get(*r)).copied().unwrap_or(0.0) != 0.0
            })
            .collect();
        if dimensions.is_empty() {
            return 0.0;
        }
        let weight = dimensions.len() as f64;
        let sum: f64 = dimensions
            .iter()
            .map(|r| {
                let amount = resources.get(*r).copied().unwrap_or(0.0);
                let pool = available
                    .and_then(|a| a.get(*r))
                    .copied()
                    .unwrap_or(0.0);
                let scaled = amount / pool;
                scaled * scaled / weight
            })
            .sum();
        sum.sqrt()
    }

    /// True when the node's consumed amount (total - available) already
    /// covers the given functions, i.e. the environment has applied the
    /// last deployment.
    pub fn is_bundle_consuming<'a>(
        &self,
        node: &str,
        functions: impl IntoIterator<Item = &'a str>,
    ) -> bool {
        let totals = self.total_resources.get(node).cloned().unwrap_or_default();
        let available = self
            .available_resources
            .get(node)
            .cloned()
            .unwrap_or_default();
        let consumed = self.sub_resources(&totals, &available);
        self.is_bounded(&self.bundle_consumption(functions), &consumed)
    }

    pub fn overall_available_resources(&self) -> ResourceVector {
        let mut overall = self.zero_resources();
        for node in &self.nodes {
            if let Some(available) = self.available_resources.get(node) {
                overall = self.sum_resources(&overall, available);
            }
        }
        overall
    }

    /// Replaces the node's availability. New resource names extend the
    /// known set; the total is raised wherever the new availability
    /// exceeds it.
    pub fn update_node_resources(&mut self, node: &str, available: &ResourceVector) {
        self.resources.extend(available.keys().cloned());
        let node_available = self
            .available_resources
            .entry(node.to_string())
            .or_default();
        let node_total = self.total_resources.entry(node.to_string()).or_default();
        for resource in &self.resources {
            let amount = available.get(resource).copied().unwrap_or(0.0);
            node_available.insert(resource.clone(), amount);
            let total = node_total.entry(resource.clone()).or_insert(0.0);
            if *total == 0.0 || *total < amount {
                *total = amount;
            }
        }
    }

    /// Adds every app whose components are already known. Idempotent.
    pub fn extend_apps(&mut self, more: &BTreeMap<String, AppDescription>) {
        for (app, description) in more {
            let known = description
                .components
                .iter()
                .all(|c| self.components.contains(c));
            if known && !self.apps.contains(app) {
                self.apps.insert(app.clone());
                self.app_descriptions.insert(app.clone(), description.clone());
            }
        }
    }

    pub fn add_app(&mut self, app: &str, description: AppDescription) {
        if !self.apps.contains(app) {
            self.apps.insert(app.to_string());
            self.app_descriptions.insert(app.to_string(), description);
        }
    }

    pub fn remove_app(&mut self, app: &str) {
        self.apps.remove(app);
        self.app_descriptions.remove(app);
    }

    pub fn add_component(&mut self, component: &str) {
        if self.components.insert(component.to_string()) {
            self.implementations
                .entry(component.to_string())
                .or_default();
        }
    }

    /// Registers a function implementing `component`. Idempotent.
    pub fn add_function(&mut self, function: &str, component: &str, consumption: &ResourceVector) {
        self.functions.insert(function.to_string());
        let filled = self.fill_null_resources(consumption);
        self.consumption.insert(function.to_string(), filled);
        let implementations = self
            .implementations
            .entry(component.to_string())
            .or_default();
        if !implementations.iter().any(|f| f == function) {
            implementations.push(function.to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn instance() -> ResourceOffloadProblem {
        ResourceOffloadProblem::parse_instance(
            r#"{
                "apps": ["x"],
                "functions": ["f1", "f2"],
                "components": ["c1", "c2"],
                "resources": ["cpu", "memory"],
                "nodes": ["a", "b"],
                "consumption": {
                    "f1": {"cpu": 1, "memory": 2},
                    "f2": {"cpu": 2, "memory": 1}
                },
                "available_resources": {
                    "a": {"cpu": 4, "memory": 4},
                    "b": {"cpu": 2, "memory": 2}
                },
                "app_descriptions": {
                    "x": {
                        "base-node": "a",
                        "components": ["c1", "c2"],
                        "constraints": {
                            "placement": {
                                "c2": {"blacklist": ["b"], "whitelist": null}
                            }
                        }
                    }
                },
                "implementations": {"c1": ["f1"], "c2": ["f2"]}
            }"#,
        )
        .expect("parse instance")
    }

    #[test]
    fn parses_instance_and_seeds_totals() {
        let problem = instance();
        assert_eq!(problem.apps.len(), 1);
        assert_eq!(
            problem.total_resources.get("a"),
            problem.available_resources.get("a")
        );
    }

    #[test]
    fn rejects_unknown_implementation() {
        let err = ResourceOffloadProblem::parse_instance(
            r#"{
                "apps": [], "functions": [], "components": ["c"],
                "resources": [], "nodes": [], "consumption": {},
                "available_resources": {}, "app_descriptions": {},
                "implementations": {"c": ["ghost"]}
            }"#,
        );
        assert!(matches!(err, Err(DroneErr::Config(_))));
    }

    #[test]
    fn vector_arithmetic_rounds_drift() {
        let problem = instance();
        let mut pool = problem.available_resources["a"].clone();
        let step: ResourceVector =
            [("cpu".to_string(), 0.1), ("memory".to_string(), 0.1)].into();
        for _ in 0..10 {
            pool = problem.sub_resources(&pool, &step);
        }
        assert_eq!(pool["cpu"], 3.0);
    }

    #[test]
    fn fit_checks() {
        let problem = instance();
        let pool: ResourceVector =
            [("cpu".to_string(), 1.0), ("memory".to_string(), 2.0)].into();
        assert!(problem.is_function_bounded(&pool, "f1"));
        assert!(!problem.is_function_bounded(&pool, "f2"));
    }

    #[test]
    fn constraints_respect_blacklist_and_whitelist() {
        let mut problem = instance();
        assert!(problem.check_constraints("a", "x", "c2"));
        assert!(!problem.check_constraints("b", "x", "c2"));
        // Unconstrained components are placeable anywhere.
        assert!(problem.check_constraints("b", "x", "c1"));

        let description = problem.app_descriptions.get_mut("x").expect("app");
        description.constraints.placement.insert(
            "c1".to_string(),
            PlacementConstraint {
                blacklist: None,
                whitelist: Some(vec!["a".to_string()]),
            },
        );
        assert!(!problem.check_constraints("b", "x", "c1"));
    }

    #[test]
    fn norm_is_weighted_and_bounded() {
        let problem = instance();
        let full = problem.available_resources["a"].clone();
        assert_eq!(problem.norm("a", &full), 1.0);
        let empty = problem.zero_resources();
        assert_eq!(problem.norm("a", &empty), 0.0);
        let half: ResourceVector =
            [("cpu".to_string(), 4.0), ("memory".to_string(), 0.0)].into();
        let norm = problem.norm("a", &half);
        assert!(norm > 0.70 && norm < 0.71, "got {norm}");
    }

    #[test]
    fn bundle_consuming_tracks_applied_deployments() {
        let mut problem = instance();
        assert!(problem.is_bundle_consuming("a", std::iter::empty()));
        assert!(!problem.is_bundle_consuming("a", ["f1"].into_iter()));
        // The environment confirms the deployment of f1.
        let updated: ResourceVector =
            [("cpu".to_string(), 3.0), ("memory".to_string(), 2.0)].into();
        problem.update_node_resources("a", &updated);
        assert!(problem.is_bundle_consuming("a", ["f1"].into_iter()));
    }

    #[test]
    fn update_node_resources_raises_total() {
        let mut problem = instance();
        let bigger: ResourceVector =
            [("cpu".to_string(), 8.0), ("memory".to_string(), 1.0)].into();
        problem.update_node_resources("b", &bigger);
        assert_eq!(problem.available_resources["b"]["cpu"], 8.0);
        assert_eq!(problem.total_resources["b"]["cpu"], 8.0);
        // Totals never shrink below a previously seen amount.
        assert_eq!(problem.total_resources["b"]["memory"], 2.0);
    }

    #[test]
    fn app_operations_are_idempotent() {
        let mut problem = instance();
        let before = problem.clone();

        let description = problem.app_descriptions["x"].clone();
        problem.add_app("x", description);
        problem.add_component("c1");
        let consumption = problem.consumption_of("f1");
        problem.add_function("f1", "c1", &consumption);
        assert_eq!(problem.apps, before.apps);
        assert_eq!(problem.implementations, before.implementations);

        problem.remove_app("ghost");
        assert_eq!(problem.apps, before.apps);

        problem.remove_app("x");
        assert!(problem.apps.is_empty());
        assert!(!problem.app_descriptions.contains_key("x"));
    }
}
