use std::collections::BTreeMap;
use std::collections::BTreeSet;

use serde::Deserialize;
use serde::Serialize;
use tracing::debug;
use tracing::info;

use crate::error::Result;
use crate::now_secs;
use crate::problem::ResourceOffloadProblem;
use crate::utility::PrivateUtility;
use crate::utility::PrivateUtilityKind;

/// Cap value meaning "no vote emitted yet on this component".
pub const UNCAPPED_VOTE: u64 = u64::MAX;

/// A node's claim on a component. `value == 0` with no implementation is
/// the null vote.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Vote {
    pub value: u64,
    pub implementation: Option<String>,
    pub timestamp: f64,
}

impl Vote {
    pub fn zero() -> Self {
        Self::reset(0.0)
    }

    pub fn reset(timestamp: f64) -> Self {
        Self {
            value: 0,
            implementation: None,
            timestamp,
        }
    }
}

/// node -> vote for one (app, component).
pub type ComponentVotes = BTreeMap<String, Vote>;
/// component -> node -> vote for one app.
pub type AppVotingData = BTreeMap<String, ComponentVotes>;
/// app -> component -> node -> vote.
pub type VotingData = BTreeMap<String, AppVotingData>;
/// component -> winner node, per app.
pub type AppWinners = BTreeMap<String, Option<String>>;
/// app -> component -> winner node.
pub type Winners = BTreeMap<String, AppWinners>;

/// One committed placement: this node hosts `component` of `app` with
/// `function`. Bundle order matters, utilities of later entries were
/// computed against earlier ones.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BundleEntry {
    pub app: String,
    pub component: String,
    pub function: String,
}

impl BundleEntry {
    pub fn new(app: &str, component: &str, function: &str) -> Self {
        Self {
            app: app.to_string(),
            component: component.to_string(),
            function: function.to_string(),
        }
    }
}

/// Result of an election over the full voting table.
pub struct ElectionOutcome {
    pub winners: Winners,
    /// Per node, the (app, component) pairs it voted on.
    pub voted_components: BTreeMap<String, BTreeSet<(String, String)>>,
    /// Per node, the voted pairs it did not win.
    pub lost_components: BTreeMap<String, BTreeSet<(String, String)>>,
}

/// Builds the local offload bundle, voting for each component taken.
pub struct DroneOrchestrator {
    node_name: String,
    pub is_deployed: BTreeMap<String, bool>,
    /// Current votes known of every node on each component, per app.
    pub voting_data: VotingData,
    /// Winner nodes computed at the last election.
    pub winners: Winners,
    /// Last vote given on each component; never exceeded when re-voting.
    pub per_component_max_vote: BTreeMap<String, BTreeMap<String, u64>>,
    /// The won (app, component, function) entries this node will host.
    pub offload_bundle: Vec<BundleEntry>,
    /// Apps this node gave up voting on after a partial allocation.
    pub app_blacklist: Vec<String>,
    /// Marginal utility recorded for each entry added to the bundle.
    private_utilities: BTreeMap<BundleEntry, u64>,
    utility: Box<dyn PrivateUtility>,
}

impl DroneOrchestrator {
    pub fn new(
        node_name: &str,
        problem: &ResourceOffloadProblem,
        utility_kind: PrivateUtilityKind,
    ) -> Result<Self> {
        let mut orchestrator = Self {
            node_name: node_name.to_string(),
            is_deployed: BTreeMap::new(),
            voting_data: BTreeMap::new(),
            winners: BTreeMap::new(),
            per_component_max_vote: BTreeMap::new(),
            offload_bundle: Vec::new(),
            app_blacklist: Vec::new(),
            private_utilities: BTreeMap::new(),
            utility: utility_kind.for_node(node_name)?,
        };
        for app in problem.apps.clone() {
            orchestrator.extend_structures_with_app(problem, &app);
        }
        Ok(orchestrator)
    }

    pub fn node_name(&self) -> &str {
        &self.node_name
    }

    /// Initializes the voting structures for a newly advertised app.
    pub fn extend_structures_with_app(&mut self, problem: &ResourceOffloadProblem, app: &str) {
        self.is_deployed.insert(app.to_string(), false);
        let components = problem.app_components(app).to_vec();
        let votes: AppVotingData = components
            .iter()
            .map(|component| {
                let per_node: ComponentVotes = problem
                    .nodes
                    .iter()
                    .map(|node| (node.clone(), Vote::zero()))
                    .collect();
                (component.clone(), per_node)
            })
            .collect();
        self.voting_data.insert(app.to_string(), votes);
        self.winners.insert(
            app.to_string(),
            components.iter().map(|c| (c.clone(), None)).collect(),
        );
        self.per_component_max_vote.insert(
            app.to_string(),
            components.iter().map(|c| (c.clone(), UNCAPPED_VOTE)).collect(),
        );
    }

    pub fn remove_app_from_structures(&mut self, app: &str) {
        self.is_deployed.remove(app);
        self.voting_data.remove(app);
        self.winners.remove(app);
        self.per_component_max_vote.remove(app);
    }

    /// Builds the offload bundle for this node and updates the voting data
    /// accordingly: repeatedly takes the eligible component with the
    /// highest marginal utility, as long as the derived vote would win the
    /// on-the-fly election.
    pub fn orchestrate(&mut self, problem: &ResourceOffloadProblem) {
        info!("starting orchestration");

        let mut bundle = self.offload_bundle.clone();

        // Residual resources: availability minus everything reserved by
        // non-deployed entries (deployed ones are already subtracted from
        // the availability by the environment).
        let mut residual = problem
            .available_resources
            .get(&self.node_name)
            .cloned()
            .unwrap_or_default();
        for entry in &bundle {
            if !self.deployed(&entry.app) {
                residual =
                    problem.sub_resources(&residual, &problem.consumption_of(&entry.function));
            }
        }

        let mut eligible: Vec<(String, String)> = problem
            .apps
            .iter()
            .filter(|app| !self.deployed(app) && !self.app_blacklist.contains(app))
            .flat_map(|app| {
                problem
                    .app_components(app)
                    .iter()
                    .map(move |component| (app.clone(), component.clone()))
            })
            .filter(|(app, component)| {
                !bundle
                    .iter()
                    .any(|e| e.app == *app && e.component == *component)
                    && problem.check_constraints(&self.node_name, app, component)
                    && self
                        .winner_vote(app, component)
                        .is_none_or(|winning| self.max_vote(app, component) > winning)
            })
            .collect();

        loop {
            // Drop pairs whose implementing function no longer fits.
            eligible.retain(|(_, component)| {
                problem
                    .implementations_of(component)
                    .first()
                    .is_some_and(|function| problem.is_function_bounded(&residual, function))
            });
            if eligible.is_empty() {
                break;
            }

            // Highest marginal utility wins; ties resolve to the first
            // pair in (app, component) scan order.
            let mut best: Option<(usize, String, u64)> = None;
            for (index, (app, component)) in eligible.iter().enumerate() {
                let function = match problem.implementations_of(component).first() {
                    Some(f) => f.clone(),
                    None => continue,
                };
                let utility = self.marginal_utility(problem, &bundle, app, component, &function);
                if best.as_ref().is_none_or(|(_, _, u)| utility > *u) {
                    best = Some((index, function, utility));
                }
            }
            let Some((index, function, utility)) = best else {
                break;
            };
            let (app, component) = eligible.remove(index);
            debug!(
                app = %app,
                component = %component,
                function = %function,
                utility,
                "next best component selected"
            );

            let vote_value = self.vote_from_utility(problem, &app, &component, utility);
            let best_existing = best_voter(
                self.voting_data
                    .get(&app)
                    .and_then(|a| a.get(&component)),
                &BTreeSet::new(),
            )
            .map(|(_, vote)| vote.value)
            .unwrap_or(0);

            // Election performed on the fly: only a strictly winning vote
            // takes the component.
            if vote_value > best_existing {
                residual =
                    problem.sub_resources(&residual, &problem.consumption_of(&function));
                let entry = BundleEntry::new(&app, &component, &function);
                self.private_utilities.insert(entry.clone(), utility);
                bundle.push(entry);
                self.set_self_vote(
                    &app,
                    &component,
                    Vote {
                        value: vote_value,
                        implementation: Some(function),
                        timestamp: now_secs(),
                    },
                );
                if let Some(caps) = self.per_component_max_vote.get_mut(&app) {
                    caps.insert(component.clone(), vote_value);
                }
                if let Some(app_winners) = self.winners.get_mut(&app) {
                    app_winners.insert(component.clone(), Some(self.node_name.clone()));
                }
            }
        }

        self.offload_bundle = bundle;
        info!(bundle = ?self.offload_bundle, "orchestration completed");
    }

    /// Generates a vote from a marginal utility so that the vote sequence
    /// stays submodular: never above the smallest positive vote already
    /// emitted in this app, never above the component's previous vote.
    ///
    /// Votes of other apps are ignored, which is sound as long as the
    /// utility of a component never increases due to components of other
    /// applications.
    fn vote_from_utility(
        &self,
        problem: &ResourceOffloadProblem,
        app: &str,
        component: &str,
        marginal_utility: u64,
    ) -> u64 {
        let smallest_existing = problem
            .app_components(app)
            .iter()
            .filter_map(|c| {
                self.voting_data
                    .get(app)
                    .and_then(|a| a.get(c))
                    .and_then(|votes| votes.get(&self.node_name))
                    .filter(|vote| vote.value > 0)
                    .map(|vote| vote.value)
            })
            .min()
            .unwrap_or(UNCAPPED_VOTE);
        smallest_existing
            .min(self.max_vote(app, component))
            .min(marginal_utility)
    }

    fn max_vote(&self, app: &str, component: &str) -> u64 {
        self.per_component_max_vote
            .get(app)
            .and_then(|caps| caps.get(component))
            .copied()
            .unwrap_or(UNCAPPED_VOTE)
    }

    /// Value of the currently elected vote for (app, component), if any.
    fn winner_vote(&self, app: &str, component: &str) -> Option<u64> {
        let winner = self
            .winners
            .get(app)
            .and_then(|w| w.get(component))
            .cloned()
            .flatten()?;
        self.voting_data
            .get(app)
            .and_then(|a| a.get(component))
            .and_then(|votes| votes.get(&winner))
            .map(|vote| vote.value)
    }

    fn marginal_utility(
        &self,
        problem: &ResourceOffloadProblem,
        bundle: &[BundleEntry],
        app: &str,
        component: &str,
        function: &str,
    ) -> u64 {
        if !problem.check_function_implements_component(component, function) {
            return 0;
        }
        self.utility
            .marginal_utility(problem, bundle, app, component, function)
    }

    /// Election for every app and component: the winner is the voter with
    /// the highest value, ties broken by oldest timestamp.
    pub fn multi_app_election(
        &self,
        problem: &ResourceOffloadProblem,
        blacklisted_nodes: &BTreeSet<String>,
    ) -> ElectionOutcome {
        let mut winners: Winners = BTreeMap::new();
        for app in &problem.apps {
            let mut app_winners: AppWinners = BTreeMap::new();
            for component in problem.app_components(app) {
                let votes = self
                    .voting_data
                    .get(app)
                    .and_then(|a| a.get(component));
                let elected =
                    best_voter(votes, blacklisted_nodes).map(|(node, _)| node.clone());
                app_winners.insert(component.clone(), elected);
            }
            winners.insert(app.clone(), app_winners);
        }

        let mut voted_components = BTreeMap::new();
        let mut lost_components = BTreeMap::new();
        for node in &problem.nodes {
            let voted = self.voted_components(problem, node);
            let lost: BTreeSet<(String, String)> = voted
                .iter()
                .filter(|(app, component)| {
                    winners
                        .get(app)
                        .and_then(|w| w.get(component))
                        .map(|winner| winner.as_deref() != Some(node.as_str()))
                        .unwrap_or(true)
                })
                .cloned()
                .collect();
            voted_components.insert(node.clone(), voted);
            lost_components.insert(node.clone(), lost);
        }

        ElectionOutcome {
            winners,
            voted_components,
            lost_components,
        }
    }

    /// The (app, component) pairs where the node holds a non-null vote.
    pub fn voted_components(
        &self,
        problem: &ResourceOffloadProblem,
        node: &str,
    ) -> BTreeSet<(String, String)> {
        let mut voted = BTreeSet::new();
        for app in &problem.apps {
            for component in problem.app_components(app) {
                let value = self
                    .voting_data
                    .get(app)
                    .and_then(|a| a.get(component))
                    .and_then(|votes| votes.get(node))
                    .map(|vote| vote.value)
                    .unwrap_or(0);
                if value != 0 {
                    voted.insert((app.clone(), component.clone()));
                }
            }
        }
        voted
    }

    /// Blacklists the worst partially allocated app, releasing the local
    /// resources reserved for it. Returns the number of apps blacklisted
    /// (0 or 1); callers repeat until stable.
    pub fn blacklist_partial_allocations(&mut self, problem: &ResourceOffloadProblem) -> usize {
        let bundle_apps: BTreeSet<&String> =
            self.offload_bundle.iter().map(|e| &e.app).collect();
        let mut partial: Vec<(String, usize, u64)> = Vec::new();
        for app in &problem.apps {
            let allocated = self
                .winners
                .get(app)
                .map(|w| w.values().filter(|winner| winner.is_some()).count())
                .unwrap_or(0);
            let unallocated = problem.app_components(app).len().saturating_sub(allocated);
            if unallocated > 0 && bundle_apps.contains(app) {
                partial.push((app.clone(), unallocated, self.app_private_utility(app)));
            }
        }
        let Some((worst, _, _)) = partial
            .into_iter()
            // Most unallocated components first, then least utility
            // contributed by the app.
            .max_by(|a, b| a.1.cmp(&b.1).then(b.2.cmp(&a.2)))
        else {
            return 0;
        };

        info!(app = %worst, "blacklisting partially allocated application");
        let to_release: Vec<(String, String)> = self
            .offload_bundle
            .iter()
            .filter(|entry| entry.app == worst)
            .map(|entry| (entry.app.clone(), entry.component.clone()))
            .collect();
        self.release_components(&to_release, true);
        self.app_blacklist.push(worst);
        info!(bundle = ?self.offload_bundle, "bundle after blacklisting");
        1
    }

    /// Releases lost components together with every bundle entry whose
    /// utility depended on them, resetting the associated self-votes.
    pub fn release_components(&mut self, components: &[(String, String)], ignore_deployed: bool) {
        let mut to_release = self
            .utility
            .to_be_released(&self.offload_bundle, components);
        if ignore_deployed {
            to_release.retain(|entry| !self.deployed(&entry.app));
        }
        self.offload_bundle
            .retain(|entry| !to_release.contains(entry));
        for entry in to_release {
            let self_vote = self
                .voting_data
                .get_mut(&entry.app)
                .and_then(|a| a.get_mut(&entry.component))
                .and_then(|votes| votes.get_mut(&self.node_name));
            if let Some(vote) = self_vote
                && vote.value != 0
            {
                *vote = Vote::reset(now_secs());
            }
            if let Some(winner) = self
                .winners
                .get_mut(&entry.app)
                .and_then(|w| w.get_mut(&entry.component))
                && winner.as_deref() == Some(self.node_name.as_str())
            {
                *winner = None;
            }
        }
    }

    /// Zeroes every known vote for (app, component) with a fresh timestamp.
    pub fn reset_component_votes(&mut self, app: &str, component: &str, timestamp: f64) {
        if let Some(votes) = self
            .voting_data
            .get_mut(app)
            .and_then(|a| a.get_mut(component))
        {
            for vote in votes.values_mut() {
                *vote = Vote::reset(timestamp);
            }
        }
    }

    /// Refreshes the timestamp of this node's vote on (app, component).
    pub fn touch_self_vote(&mut self, app: &str, component: &str) {
        let node = self.node_name.clone();
        if let Some(vote) = self
            .voting_data
            .get_mut(app)
            .and_then(|a| a.get_mut(component))
            .and_then(|votes| votes.get_mut(&node))
        {
            vote.timestamp = now_secs();
        }
    }

    fn set_self_vote(&mut self, app: &str, component: &str, vote: Vote) {
        let node = self.node_name.clone();
        if let Some(votes) = self
            .voting_data
            .get_mut(app)
            .and_then(|a| a.get_mut(component))
        {
            votes.insert(node, vote);
        }
    }

    pub fn deployed(&self, app: &str) -> bool {
        self.is_deployed.get(app).copied().unwrap_or(false)
    }

    pub fn deployed_bundle(&self) -> Vec<BundleEntry> {
        self.offload_bundle
            .iter()
            .filter(|entry| self.deployed(&entry.app))
            .cloned()
            .collect()
    }

    /// Apps whose components all have a winner.
    pub fn instantiated_apps(&self) -> Vec<String> {
        self.winners
            .iter()
            .filter(|(_, components)| {
                !components.is_empty() && components.values().all(|winner| winner.is_some())
            })
            .map(|(app, _)| app.clone())
            .collect()
    }

    /// True when the node won at least one component.
    pub fn holds_any_component(&self) -> bool {
        self.winners.values().any(|components| {
            components
                .values()
                .any(|winner| winner.as_deref() == Some(self.node_name.as_str()))
        })
    }

    /// The node's private utility for the current bundle.
    pub fn node_utility(&self) -> u64 {
        self.offload_bundle
            .iter()
            .map(|entry| self.private_utilities.get(entry).copied().unwrap_or(0))
            .sum()
    }

    fn app_private_utility(&self, app: &str) -> u64 {
        self.private_utilities
            .iter()
            .filter(|(entry, _)| entry.app == app)
            .map(|(_, utility)| *utility)
            .sum()
    }

    /// Sum of the winning votes over the whole table.
    pub fn sum_votes(&self) -> u64 {
        let mut sum = 0;
        for (app, components) in &self.winners {
            for (component, winner) in components {
                if let Some(winner) = winner
                    && let Some(vote) = self
                        .voting_data
                        .get(app)
                        .and_then(|a| a.get(component))
                        .and_then(|votes| votes.get(winner))
                {
                    sum += vote.value;
                }
            }
        }
        sum
    }
}

/// The best voter of a component: highest value, ties broken by oldest
/// timestamp, then by scan order (node name).
fn best_voter<'a>(
    votes: Option<&'a ComponentVotes>,
    blacklisted_nodes: &BTreeSet<String>,
) -> Option<(&'a String, &'a Vote)> {
    let mut best: Option<(&String, &Vote)> = None;
    for (node, vote) in votes.into_iter().flatten() {
        if vote.value == 0 || blacklisted_nodes.contains(node) {
            continue;
        }
        let better = match best {
            None => true,
            Some((_, current)) => {
                vote.value > current.value
                    || (vote.value == current.value && vote.timestamp < current.timestamp)
            }
        };
        if better {
            best = Some((node, vote));
        }
    }
    best
}
