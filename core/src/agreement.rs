use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::collections::BTreeSet;

use tracing::debug;
use tracing::info;
use tracing::trace;

use crate::now_secs;
use crate::orchestrator::ComponentVotes;
use crate::orchestrator::DroneOrchestrator;
use crate::orchestrator::Vote;
use crate::orchestrator::VotingData;
use crate::orchestrator::Winners;
use crate::problem::ResourceOffloadProblem;

/// Voting data and winners received from one neighbor in the current batch.
#[derive(Debug, Clone)]
pub struct ReceivedData {
    pub winners: Winners,
    pub voting_data: VotingData,
}

/// The consensus phase: merges neighbor votes, resolves conflicts through
/// the decision table and tracks which neighbors agree with the local view.
pub struct DroneAgreement {
    node_name: String,
    /// The last batch requires a full broadcast.
    pub rebroadcast: bool,
    /// Every evaluated component reached the agreement outcome.
    pub agreement: bool,
    /// The local tables changed while handling the last batch.
    pub updated: bool,
    /// Neighbors whose last message was consistent with the local view.
    pub agree_neighbors: BTreeSet<String>,
    pending_revoting: bool,
}

impl DroneAgreement {
    pub fn new(node_name: &str) -> Self {
        Self {
            node_name: node_name.to_string(),
            rebroadcast: false,
            agreement: false,
            updated: false,
            agree_neighbors: BTreeSet::new(),
            pending_revoting: false,
        }
    }

    /// Merges the data received from multiple senders, re-runs the
    /// election, releases outvoted entries and applies the per-sender
    /// decision table. Returns the neighbors that should receive a
    /// targeted message.
    pub fn multi_agreement(
        &mut self,
        problem: &ResourceOffloadProblem,
        orchestrator: &mut DroneOrchestrator,
        received: &BTreeMap<String, ReceivedData>,
        revoting_enabled: bool,
    ) -> Vec<String> {
        info!(senders = received.len(), "starting agreement");

        let local_voting = orchestrator.voting_data.clone();
        let local_winners = orchestrator.winners.clone();

        let mut outvoted = false;
        let mut partial_allocation = false;
        self.agreement = true;
        self.updated = false;
        self.rebroadcast = false;
        let old_agree_neighbors = self.agree_neighbors.clone();
        // Senders must re-validate their agreement with this batch.
        self.agree_neighbors
            .retain(|neighbor| !received.contains_key(neighbor));

        self.merge(problem, orchestrator, &local_voting, received);

        let outcome = orchestrator.multi_app_election(problem, &BTreeSet::new());
        orchestrator.winners = outcome.winners;

        let self_lost: Vec<(String, String)> = outcome
            .lost_components
            .get(&self.node_name)
            .map(|lost| lost.iter().cloned().collect())
            .unwrap_or_default();
        if !self_lost.is_empty() {
            info!(lost = ?self_lost, "node has been outvoted");
            orchestrator.release_components(&self_lost, true);
            outvoted = true;
        }

        // If nobody lost anything, spot partial allocations.
        let anything_lost = outcome.lost_components.values().any(|lost| !lost.is_empty());
        if !anything_lost && orchestrator.blacklist_partial_allocations(problem) > 0 {
            partial_allocation = true;
        }

        if revoting_enabled && (self.pending_revoting || outvoted || partial_allocation) {
            // Repeat the bidding on the residual resources; the new bundle
            // will be broadcast, so no per-sender evaluation is needed.
            orchestrator.orchestrate(problem);
            self.pending_revoting = false;
            self.rebroadcast = true;
            self.agreement = false;
            self.updated = true;
            return Vec::new();
        } else if outvoted || partial_allocation {
            self.pending_revoting = true;
        }

        let mut send_list: Vec<String> = Vec::new();
        for (sender, data) in received {
            debug!(sender = %sender, "checking agreement");
            self.agree_neighbors.insert(sender.clone());

            for app in &problem.apps {
                let Some(received_app_votes) = data.voting_data.get(app) else {
                    trace!(sender = %sender, app = %app, "no data for this app yet");
                    continue;
                };
                for component in problem.app_components(app) {
                    let decision = self.decide_component(
                        orchestrator,
                        &local_voting,
                        &local_winners,
                        data,
                        received_app_votes.get(component),
                        sender,
                        app,
                        component,
                    );
                    if decision.send_to_sender {
                        send_list.push(sender.clone());
                    }
                    if !decision.agreement_on_component {
                        self.agreement = false;
                        self.agree_neighbors.remove(sender);
                    }
                }
            }

            if self.agree_neighbors.contains(sender) && !old_agree_neighbors.contains(sender) {
                // Fresh agreement: confirm it with a targeted message.
                send_list.push(sender.clone());
            }
        }

        send_list.dedup();
        info!(agreement = self.agreement, rebroadcast = self.rebroadcast, "agreement completed");
        send_list
    }

    /// Keeps, for every (app, component, node), the entry with the newest
    /// timestamp among the local table and every sender that has data for
    /// the app. Timestamp ties resolve to the first candidate in sender
    /// order, local last.
    fn merge(
        &self,
        problem: &ResourceOffloadProblem,
        orchestrator: &mut DroneOrchestrator,
        local_voting: &VotingData,
        received: &BTreeMap<String, ReceivedData>,
    ) {
        for app in &problem.apps {
            for component in problem.app_components(app) {
                for node in &problem.nodes {
                    let mut merged: Option<&Vote> = None;
                    for data in received.values() {
                        let Some(app_votes) = data.voting_data.get(app) else {
                            continue;
                        };
                        let Some(vote) = app_votes.get(component).and_then(|votes| votes.get(node))
                        else {
                            continue;
                        };
                        if merged.is_none_or(|best| vote.timestamp > best.timestamp) {
                            merged = Some(vote);
                        }
                    }
                    let local = local_voting
                        .get(app)
                        .and_then(|a| a.get(component))
                        .and_then(|votes| votes.get(node));
                    if let Some(local_vote) = local
                        && merged.is_none_or(|best| local_vote.timestamp > best.timestamp)
                    {
                        merged = Some(local_vote);
                    }
                    if let Some(vote) = merged.cloned()
                        && let Some(votes) = orchestrator
                            .voting_data
                            .get_mut(app)
                            .and_then(|a| a.get_mut(component))
                    {
                        votes.insert(node.clone(), vote);
                    }
                }
            }
        }
    }

    /// Applies one row of the decision table to (app, component) for one
    /// sender. "UPDATE" means keeping the merge result, which is already
    /// installed.
    #[allow(clippy::too_many_arguments)]
    fn decide_component(
        &mut self,
        orchestrator: &mut DroneOrchestrator,
        local_voting: &VotingData,
        local_winners: &Winners,
        data: &ReceivedData,
        received_votes: Option<&ComponentVotes>,
        sender: &str,
        app: &str,
        component: &str,
    ) -> ComponentDecision {
        let mut decision = ComponentDecision::default();

        let local_winner = winner_of(local_winners, app, component);
        let received_winner = winner_of(&data.winners, app, component);
        let new_winner = winner_of(&orchestrator.winners, app, component);
        let local_votes = local_voting.get(app).and_then(|a| a.get(component));

        if local_winner.as_deref() == Some(sender)
            && received_winner.as_deref() == Some(self.node_name.as_str())
        {
            // Mutual winner: each side believes the other won. Start over
            // on this component.
            trace!(app = %app, component = %component, "RESET & REBROADCAST");
            orchestrator.reset_component_votes(app, component, now_secs());
            self.rebroadcast = true;
            self.updated = true;
        } else if local_winner == received_winner && received_winner == new_winner {
            match compare_bid_times(received_votes, local_votes) {
                Ordering::Greater => {
                    let winner_vote_unchanged = match (&received_winner, &local_winner) {
                        (None, _) => true,
                        (Some(rw), Some(lw)) => {
                            received_votes.and_then(|v| v.get(rw))
                                == local_votes.and_then(|v| v.get(lw))
                        }
                        _ => false,
                    };
                    decision.agreement_on_component = true;
                    self.updated = true;
                    if !winner_vote_unchanged {
                        // Same winner with a changed vote value: neighbors
                        // must hear about it.
                        trace!(app = %app, component = %component, "UPDATE & REBROADCAST");
                        self.rebroadcast = true;
                    } else {
                        trace!(app = %app, component = %component, "UPDATE & NO-REBROADCAST");
                    }
                }
                Ordering::Equal | Ordering::Less => {
                    trace!(app = %app, component = %component, "LEAVE & NO-REBROADCAST");
                    decision.agreement_on_component = true;
                }
            }
        } else if received_winner == new_winner {
            // The received winner overrode the local one.
            trace!(app = %app, component = %component, "UPDATE & REBROADCAST");
            decision.agreement_on_component = true;
            self.rebroadcast = true;
            self.updated = true;
        } else if local_winner == new_winner {
            // The local winner held against the received data; the sender
            // is behind.
            if new_winner.as_deref() == Some(self.node_name.as_str()) {
                trace!(app = %app, component = %component, "UPDATE-TIME & SEND-TO-SENDER");
                orchestrator.touch_self_vote(app, component);
                decision.send_to_sender = true;
            } else {
                let new_votes = orchestrator
                    .voting_data
                    .get(app)
                    .and_then(|a| a.get(component));
                if compare_bid_times(new_votes, local_votes) == Ordering::Greater {
                    trace!(app = %app, component = %component, "UPDATE & NO-REBROADCAST");
                    self.updated = true;
                } else {
                    trace!(app = %app, component = %component, "LEAVE & SEND-TO-SENDER");
                    decision.send_to_sender = true;
                }
            }
        } else {
            // The merge elected a third winner none of the two sides had.
            trace!(app = %app, component = %component, "UPDATE & REBROADCAST");
            self.rebroadcast = true;
            self.updated = true;
        }

        decision
    }

    /// Forgets every non-deployed placement and vote, clearing the
    /// protocol flags. Invoked when an advertisement changes the problem.
    pub fn reset_temporary_data(
        &mut self,
        problem: &ResourceOffloadProblem,
        orchestrator: &mut DroneOrchestrator,
    ) {
        let not_deployed: Vec<(String, String)> = problem
            .apps
            .iter()
            .filter(|app| !orchestrator.deployed(app))
            .flat_map(|app| {
                problem
                    .app_components(app)
                    .iter()
                    .map(move |component| (app.clone(), component.clone()))
            })
            .collect();
        let to_release: Vec<(String, String)> = orchestrator
            .offload_bundle
            .iter()
            .filter(|entry| {
                not_deployed
                    .iter()
                    .any(|(app, component)| *app == entry.app && *component == entry.component)
            })
            .map(|entry| (entry.app.clone(), entry.component.clone()))
            .collect();
        orchestrator.release_components(&to_release, true);
        for (app, component) in &not_deployed {
            orchestrator.reset_component_votes(app, component, now_secs());
            if let Some(winner) = orchestrator
                .winners
                .get_mut(app)
                .and_then(|w| w.get_mut(component))
            {
                *winner = None;
            }
        }
        self.rebroadcast = false;
        self.agreement = false;
        self.updated = false;
        self.agree_neighbors.clear();
        self.pending_revoting = false;
    }
}

#[derive(Debug, Default)]
struct ComponentDecision {
    agreement_on_component: bool,
    send_to_sender: bool,
}

fn winner_of(winners: &Winners, app: &str, component: &str) -> Option<String> {
    winners
        .get(app)
        .and_then(|components| components.get(component))
        .cloned()
        .flatten()
}

/// Compares, node by node, the timestamps of two vote tables: `Greater`
/// as soon as the first has a newer entry, `Equal` when all match,
/// `Less` otherwise.
fn compare_bid_times(a: Option<&ComponentVotes>, b: Option<&ComponentVotes>) -> Ordering {
    let mut all_equal = true;
    for (node, vote) in a.into_iter().flatten() {
        let other = b
            .and_then(|votes| votes.get(node))
            .map(|v| v.timestamp)
            .unwrap_or(0.0);
        if vote.timestamp > other {
            return Ordering::Greater;
        }
        if vote.timestamp < other {
            all_equal = false;
        }
    }
    if all_equal {
        Ordering::Equal
    } else {
        Ordering::Less
    }
}
