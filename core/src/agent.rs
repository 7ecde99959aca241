use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::Condvar;
use std::sync::Mutex;
use std::sync::mpsc::Sender;
use std::time::Duration;
use std::time::Instant;

use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::agreement::DroneAgreement;
use crate::agreement::ReceivedData;
use crate::config::Config;
use crate::error::Result;
use crate::messages::AdvertisementType;
use crate::messages::AppAdvMessage;
use crate::messages::OffloadedComponent;
use crate::messages::ResourceMessage;
use crate::messages::SolutionFunction;
use crate::messages::SolutionMessage;
use crate::messages::VoteMessage;
use crate::messaging::ConsumeOutcome;
use crate::messaging::Delivery;
use crate::messaging::MessageFabric;
use crate::messaging::Messaging;
use crate::messaging::ShutdownHandle;
use crate::messaging::TimerKind;
use crate::neighborhood::NeighborhoodDetector;
use crate::now_secs;
use crate::orchestrator::BundleEntry;
use crate::orchestrator::DroneOrchestrator;
use crate::problem::AppDescription;
use crate::problem::PlacementConstraint;
use crate::problem::ResourceOffloadProblem;

/// Everything the problem-model lock guards: any mutation of the problem,
/// the orchestrator or the agreement happens under it.
struct AgentState {
    problem: ResourceOffloadProblem,
    orchestrator: DroneOrchestrator,
    agreement: DroneAgreement,
    decision_taken: bool,
    last_seen: BTreeMap<String, f64>,
}

/// Per-neighbor FIFO queues plus the round sentinels, guarded by the
/// condition-variable mutex. Wait loops always test `end_time` so they
/// exit promptly when the round ends.
struct RoundClock {
    queues: BTreeMap<String, Vec<VoteMessage>>,
    begin_time: f64,
    end_time: f64,
}

#[derive(Default)]
struct RoundStats {
    message_counter: u64,
    received_messages: u64,
    last_update_time: f64,
    agreement_time: f64,
    last_message_time: f64,
    sent_count: u64,
    last_window_start: f64,
    /// Messages sent per sampling window, keyed "t0:t1".
    rates: Vec<(String, u64)>,
}

/// What one round decided, printed as the per-round summary line and
/// published to the optional round-event channel.
#[derive(Debug, Clone)]
pub struct RoundSummary {
    pub node: String,
    pub strong_agreement: bool,
    pub instantiated_apps: Vec<String>,
    pub offload_bundle: Vec<BundleEntry>,
    pub app_blacklist: Vec<String>,
    pub vote_sum: u64,
    pub utility: u64,
    pub sent_messages: u64,
    pub received_messages: u64,
    /// Offsets from the round begin; zero when the event never happened.
    pub last_update_on: f64,
    pub agreement_on: f64,
    pub last_message_on: f64,
    pub total_time: f64,
}

/// Final outcome of a run, persisted by the CLI.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub strong_agreement: bool,
    pub offload_bundle: Vec<BundleEntry>,
    pub rates: Vec<(String, u64)>,
    pub utility: u64,
}

/// One DRONE agent: owns the messaging connection, the per-neighbor
/// queues and the dequeue worker, and drives rounds of
/// orchestrate-broadcast-agree until the neighborhood converges.
pub struct DroneAgent {
    node_name: String,
    config: Config,
    daemon_enabled: bool,
    messaging: Messaging,
    detector: NeighborhoodDetector,
    neighborhood: Vec<String>,
    state: Mutex<AgentState>,
    clock: Mutex<RoundClock>,
    queue_cv: Condvar,
    stats: Mutex<RoundStats>,
    round_events: Option<Sender<RoundSummary>>,
}

impl DroneAgent {
    pub fn new(
        node_name: &str,
        problem: ResourceOffloadProblem,
        config: Config,
        fabric: Arc<dyn MessageFabric>,
        daemon_enabled: bool,
    ) -> Result<Self> {
        let orchestrator =
            DroneOrchestrator::new(node_name, &problem, config.utility.private_utility)?;
        let detector = NeighborhoodDetector::new(&problem.nodes, node_name, &config.neighborhood)?;
        let neighborhood = detector.neighborhood().to_vec();
        let queues = neighborhood
            .iter()
            .map(|neighbor| (neighbor.clone(), Vec::new()))
            .collect();
        let last_seen = neighborhood
            .iter()
            .map(|neighbor| (neighbor.clone(), 0.0))
            .collect();
        Ok(Self {
            node_name: node_name.to_string(),
            daemon_enabled,
            messaging: Messaging::new(fabric, node_name),
            detector,
            neighborhood,
            state: Mutex::new(AgentState {
                problem,
                orchestrator,
                agreement: DroneAgreement::new(node_name),
                decision_taken: false,
                last_seen,
            }),
            clock: Mutex::new(RoundClock {
                queues,
                begin_time: 0.0,
                end_time: 0.0,
            }),
            queue_cv: Condvar::new(),
            stats: Mutex::new(RoundStats::default()),
            round_events: None,
            config,
        })
    }

    /// Registers a channel receiving one [`RoundSummary`] per round.
    pub fn with_round_events(mut self, sender: Sender<RoundSummary>) -> Self {
        self.round_events = Some(sender);
        self
    }

    /// Handle to stop a daemon agent embedded in a harness: closing the
    /// broker connection ends the current round and the run loop.
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.messaging.shutdown_handle()
    }

    pub fn node_name(&self) -> &str {
        &self.node_name
    }

    /// The main distributed scheduling process: one thread consumes broker
    /// deliveries, a worker dequeues vote batches, and rounds end when a
    /// timer fires. With the daemon flag the agent keeps re-entering
    /// agreement whenever the problem changes.
    pub fn run(&self) -> Result<RunOutcome> {
        if let Ok(mut clock) = self.clock.lock() {
            clock.begin_time = now_secs();
        }

        // Own vote topic refreshes the weak timer on every delivery.
        self.messaging.subscribe(&self.node_name, true, true);
        self.messaging
            .subscribe(&self.config.messaging.app_advertisement_route, true, false);
        self.messaging
            .subscribe(&self.config.messaging.resource_route, false, false);

        // Fetch the initial availability if the instance did not carry it.
        let needs_resources = self
            .locked_state(|state| {
                state
                    .problem
                    .available_resources
                    .get(&self.node_name)
                    .is_none_or(|amount| amount.is_empty())
            })
            .unwrap_or(false);
        if needs_resources {
            info!("waiting for the initial resource message");
            self.wait_for_resource_message(0.0);
        }

        // First voting round, if anything is waiting for deployment.
        let initial_begin = self
            .clock
            .lock()
            .map(|clock| clock.begin_time)
            .unwrap_or_else(|_| now_secs());
        let _ = self.locked_state(|state| {
            let pending = state.problem.apps.iter().any(|app| {
                !state.orchestrator.deployed(app)
                    && !state.orchestrator.app_blacklist.contains(app)
            });
            if pending {
                let AgentState {
                    problem,
                    orchestrator,
                    ..
                } = state;
                orchestrator.orchestrate(problem);
                self.broadcast(orchestrator, None, initial_begin);
            } else {
                state.decision_taken = true;
            }
        });

        let mut strong_agreement = false;
        loop {
            let (begin_time, last_end_time) = match self.clock.lock() {
                Ok(mut clock) => {
                    if clock.end_time > 0.0 {
                        clock.begin_time = now_secs();
                    }
                    (clock.begin_time, clock.end_time)
                }
                Err(_) => break,
            };
            if last_end_time > 0.0 {
                if let Ok(mut stats) = self.stats.lock() {
                    stats.message_counter = 0;
                    stats.received_messages = 0;
                    stats.agreement_time = 0.0;
                    stats.sent_count = 0;
                }
                let _ = self.locked_state(|state| {
                    state.agreement.agree_neighbors.clear();
                });
            }

            let decision_taken = self
                .locked_state(|state| state.decision_taken)
                .unwrap_or(true);
            if !decision_taken {
                // The weak timer always bounds the round; the short one is
                // armed only when the round already looks quiescent.
                self.messaging.arm_timer(
                    TimerKind::WeakAgreement,
                    Duration::from_secs_f64(self.config.timeout.weak_agreement_timeout),
                    true,
                );
                // A silent neighborhood is not quiescence: without any
                // active neighbor the round runs out the weak timer.
                let quiescent = self
                    .locked_state(|state| {
                        let active = self.active_neighborhood(&state.last_seen, last_end_time);
                        !active.is_empty() && active.is_subset(&state.agreement.agree_neighbors)
                    })
                    .unwrap_or(false);
                if quiescent {
                    self.messaging.arm_timer(
                        TimerKind::Agreement,
                        Duration::from_secs_f64(self.config.timeout.agreement_timeout),
                        false,
                    );
                }
            } else {
                self.observe_deployment();
            }

            info!("listening for incoming messages");
            let outcome = std::thread::scope(|scope| {
                let worker = scope.spawn(|| self.messages_worker(last_end_time, begin_time));
                let outcome = self.messaging.consume(|delivery| {
                    self.dispatch(delivery, last_end_time, begin_time);
                });

                // Strong agreement needs at least one active neighbor in
                // agreement; an unanswered round is weak by definition.
                strong_agreement = self
                    .locked_state(|state| {
                        let active = self.active_neighborhood(&state.last_seen, last_end_time);
                        !active.is_empty() && active.is_subset(&state.agreement.agree_neighbors)
                    })
                    .unwrap_or(false);

                if let Ok(mut clock) = self.clock.lock() {
                    clock.end_time = now_secs();
                }
                self.queue_cv.notify_all();
                let _ = worker.join();
                outcome
            });

            let no_response = self
                .locked_state(|state| {
                    self.active_neighborhood(&state.last_seen, last_end_time)
                        .is_empty()
                })
                .unwrap_or(true);
            let _ = self.locked_state(|state| {
                if no_response {
                    info!("no response from the neighborhood");
                    let AgentState {
                        problem,
                        orchestrator,
                        ..
                    } = state;
                    while orchestrator.blacklist_partial_allocations(problem) > 0 {
                        orchestrator.orchestrate(problem);
                    }
                }
                state.decision_taken = true;
            });

            if !self.config.messaging.debug_mode {
                self.emit_solution();
            }

            let summary = self.close_round(strong_agreement, begin_time);
            println!(
                "{:<6} | strong: {:<5} | instantiated apps: {:?} | V: {} | u: {:>3} | last update on: {:.3} | agreement on: {:.3} | last message on: {:.3} | total time: {:.3} | sent messages: {:>5} | received messages: {:>5}",
                summary.node,
                summary.strong_agreement,
                summary.instantiated_apps,
                summary.vote_sum,
                summary.utility,
                summary.last_update_on,
                summary.agreement_on,
                summary.last_message_on,
                summary.total_time,
                summary.sent_messages,
                summary.received_messages,
            );
            if let Some(events) = &self.round_events {
                let _ = events.send(summary);
            }

            if !self.daemon_enabled
                || self.messaging.is_shut_down()
                || outcome == ConsumeOutcome::Closed
            {
                break;
            }
        }

        let outcome = self
            .locked_state(|state| RunOutcome {
                strong_agreement,
                offload_bundle: state.orchestrator.offload_bundle.clone(),
                rates: Vec::new(),
                utility: state.orchestrator.node_utility(),
            })
            .unwrap_or(RunOutcome {
                strong_agreement,
                offload_bundle: Vec::new(),
                rates: Vec::new(),
                utility: 0,
            });
        let rates = self
            .stats
            .lock()
            .map(|stats| stats.rates.clone())
            .unwrap_or_default();
        Ok(RunOutcome { rates, ..outcome })
    }

    /// Gathers the round metrics and marks fully placed apps as deployed.
    fn close_round(&self, strong_agreement: bool, begin_time: f64) -> RoundSummary {
        let end_time = now_secs();
        let (instantiated, bundle, blacklist, vote_sum, utility) = self
            .locked_state(|state| {
                let instantiated = state.orchestrator.instantiated_apps();
                for app in &instantiated {
                    state.orchestrator.is_deployed.insert(app.clone(), true);
                }
                if state.orchestrator.holds_any_component() {
                    info!(bundle = ?state.orchestrator.offload_bundle, "this node hosts components");
                }
                (
                    instantiated,
                    state.orchestrator.offload_bundle.clone(),
                    state.orchestrator.app_blacklist.clone(),
                    state.orchestrator.sum_votes(),
                    state.orchestrator.node_utility(),
                )
            })
            .unwrap_or((Vec::new(), Vec::new(), Vec::new(), 0, 0));
        let (sent, received, last_update, agreement_at, last_message) = self
            .stats
            .lock()
            .map(|stats| {
                (
                    stats.message_counter,
                    stats.received_messages,
                    stats.last_update_time,
                    stats.agreement_time,
                    stats.last_message_time,
                )
            })
            .unwrap_or((0, 0, 0.0, 0.0, 0.0));
        let offset = |at: f64| if at > 0.0 { at - begin_time } else { 0.0 };
        RoundSummary {
            node: self.node_name.clone(),
            strong_agreement,
            instantiated_apps: instantiated,
            offload_bundle: bundle,
            app_blacklist: blacklist,
            vote_sum,
            utility,
            sent_messages: sent,
            received_messages: received,
            last_update_on: offset(last_update),
            agreement_on: offset(agreement_at),
            last_message_on: offset(last_message),
            total_time: end_time - begin_time,
        }
    }

    /// Blocks until the environment confirms the last deployment through
    /// resource updates; in debug mode the consumption is simulated.
    fn observe_deployment(&self) {
        let functions: Vec<String> = self
            .locked_state(|state| {
                state
                    .orchestrator
                    .deployed_bundle()
                    .into_iter()
                    .map(|entry| entry.function)
                    .collect()
            })
            .unwrap_or_default();
        if self.config.messaging.debug_mode {
            let _ = self.locked_state(|state| {
                let totals = state
                    .problem
                    .total_resources
                    .get(&self.node_name)
                    .cloned()
                    .unwrap_or_default();
                let consumption = state
                    .problem
                    .bundle_consumption(functions.iter().map(String::as_str));
                let updated = state.problem.sub_resources(&totals, &consumption);
                state.problem.update_node_resources(&self.node_name, &updated);
            });
            return;
        }
        loop {
            let consuming = self
                .locked_state(|state| {
                    state
                        .problem
                        .is_bundle_consuming(&self.node_name, functions.iter().map(String::as_str))
                })
                .unwrap_or(true);
            if consuming || self.messaging.is_shut_down() {
                return;
            }
            info!("waiting for resources to reflect the last deployment");
            if !self.wait_for_resource_message(0.0) {
                return;
            }
        }
    }

    /// Blocks for one resource message newer than `since` and applies it.
    fn wait_for_resource_message(&self, since: f64) -> bool {
        loop {
            let Some(delivery) = self
                .messaging
                .recv_matching(&self.config.messaging.resource_route)
            else {
                return false;
            };
            match serde_json::from_str::<ResourceMessage>(&delivery.body) {
                Ok(message) if message.timestamp > since => {
                    self.handle_resource_message(message);
                    return true;
                }
                Ok(_) => {}
                Err(error) => {
                    warn!(%error, "ignoring invalid resource message");
                }
            }
        }
    }

    /// Broker-consumer side: routes one delivery to its handler. Vote
    /// messages are enqueued for the worker, never processed inline.
    fn dispatch(&self, delivery: Delivery, last_end_time: f64, begin_time: f64) {
        if delivery.topic == self.node_name {
            match serde_json::from_str::<VoteMessage>(&delivery.body) {
                Ok(message) => self.enqueue_vote_message(message),
                Err(error) => warn!(%error, "ignoring invalid vote message"),
            }
        } else if delivery.topic == self.config.messaging.app_advertisement_route {
            match serde_json::from_str::<AppAdvMessage>(&delivery.body) {
                Ok(message) => {
                    self.handle_app_advertisement(message, last_end_time, begin_time);
                }
                Err(error) => warn!(%error, "ignoring invalid app advertisement"),
            }
        } else if delivery.topic == self.config.messaging.resource_route {
            match serde_json::from_str::<ResourceMessage>(&delivery.body) {
                Ok(message) => self.handle_resource_message(message),
                Err(error) => warn!(%error, "ignoring invalid resource message"),
            }
        } else {
            debug!(topic = %delivery.topic, "ignoring delivery for unknown topic");
        }
    }

    fn enqueue_vote_message(&self, message: VoteMessage) {
        if let Ok(mut stats) = self.stats.lock() {
            stats.last_message_time = now_secs();
        }
        if !self.neighborhood.contains(&message.sender) {
            warn!(sender = %message.sender, "vote from a node outside the neighborhood");
            return;
        }
        if let Ok(mut clock) = self.clock.lock() {
            clock
                .queues
                .entry(message.sender.clone())
                .or_default()
                .push(message);
        }
        self.queue_cv.notify_all();
    }

    /// Worker side: repeatedly collapses the per-neighbor queues into a
    /// batch of newest messages and runs the agreement on it.
    fn messages_worker(&self, last_end_time: f64, begin_time: f64) {
        loop {
            let ended = self
                .clock
                .lock()
                .map(|clock| clock.end_time != last_end_time)
                .unwrap_or(true);
            if ended {
                return;
            }
            let messages = self.dequeue_next_messages(last_end_time);
            if messages.is_empty() {
                continue;
            }
            self.handle_vote_batch(messages, last_end_time, begin_time);
        }
    }

    /// Waits up to the async timeout for every queue of a not-yet-agreed
    /// neighbor to fill, then takes only the newest in-round message per
    /// neighbor and clears the queues.
    fn dequeue_next_messages(&self, last_end_time: f64) -> Vec<VoteMessage> {
        let agree_neighbors = self
            .locked_state(|state| state.agreement.agree_neighbors.clone())
            .unwrap_or_default();
        let Ok(mut clock) = self.clock.lock() else {
            return Vec::new();
        };
        let deadline =
            Instant::now() + Duration::from_secs_f64(self.config.timeout.async_timeout);
        // Wait for every not-yet-agreed neighbor to have sent, or, when
        // nothing is pending at all, for any message to arrive.
        while clock.end_time == last_end_time
            && (clock
                .queues
                .iter()
                .any(|(neighbor, queue)| !agree_neighbors.contains(neighbor) && queue.is_empty())
                || clock.queues.values().all(|queue| queue.is_empty()))
        {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            match self.queue_cv.wait_timeout(clock, deadline - now) {
                Ok((guard, _)) => clock = guard,
                Err(_) => return Vec::new(),
            }
        }
        if clock.end_time != last_end_time {
            return Vec::new();
        }
        let begin_time = clock.begin_time;
        let mut messages = Vec::new();
        for queue in clock.queues.values_mut() {
            // Only the latest message counts; older ones carry strictly
            // older timestamps and would lose the merge anyway.
            if let Some(latest) = queue.last()
                && latest.timestamp > begin_time
            {
                messages.push(latest.clone());
            }
            queue.clear();
        }
        messages
    }

    /// The agreement critical section for one batch of vote messages.
    fn handle_vote_batch(
        &self,
        messages: Vec<VoteMessage>,
        last_end_time: f64,
        begin_time: f64,
    ) {
        if let Ok(mut stats) = self.stats.lock() {
            stats.received_messages += messages.len() as u64;
        }
        let senders: BTreeSet<String> =
            messages.iter().map(|message| message.sender.clone()).collect();
        info!(senders = ?senders, "handling vote batch");

        let _ = self.locked_state(|state| {
            let active = self.active_neighborhood(&state.last_seen, last_end_time);
            for message in &messages {
                state
                    .last_seen
                    .insert(message.sender.clone(), message.timestamp);
                // A previously silent neighbor gives blacklisted apps a
                // second chance.
                if !active.contains(&message.sender)
                    && !state.orchestrator.app_blacklist.is_empty()
                {
                    let AgentState {
                        problem,
                        orchestrator,
                        ..
                    } = state;
                    orchestrator.app_blacklist.clear();
                    orchestrator.orchestrate(problem);
                }
            }

            state.decision_taken = false;
            let previous_agreement = active.is_subset(&state.agreement.agree_neighbors);

            let batch: BTreeMap<String, ReceivedData> = messages
                .iter()
                .map(|message| {
                    (
                        message.sender.clone(),
                        ReceivedData {
                            winners: message.winners.clone(),
                            voting_data: message.voting_data.clone(),
                        },
                    )
                })
                .collect();
            let AgentState {
                problem,
                orchestrator,
                agreement,
                ..
            } = state;
            let send_list = agreement.multi_agreement(problem, orchestrator, &batch, true);

            if agreement.rebroadcast {
                self.broadcast(orchestrator, None, begin_time);
            } else if !send_list.is_empty() {
                self.broadcast(orchestrator, Some(send_list), begin_time);
            } else {
                debug!("no need to rebroadcast voting information");
            }

            if let Ok(mut stats) = self.stats.lock() {
                if agreement.updated {
                    stats.last_update_time = now_secs();
                }
                // A previously full agreement broke: disarm the short timer.
                if previous_agreement
                    && (!agreement.agreement || !senders.is_subset(&active))
                {
                    info!("previous agreement has been broken");
                    stats.agreement_time = 0.0;
                    self.messaging.cancel_timer(TimerKind::Agreement);
                }
            }

            let active = self.active_neighborhood(&state.last_seen, last_end_time);
            if active.is_subset(&state.agreement.agree_neighbors) {
                let fresh = self
                    .stats
                    .lock()
                    .map(|stats| stats.agreement_time == 0.0)
                    .unwrap_or(false);
                if fresh {
                    info!("agreement reached with the whole neighborhood");
                    if let Ok(mut stats) = self.stats.lock() {
                        stats.agreement_time = now_secs();
                    }
                    self.messaging.arm_timer(
                        TimerKind::Agreement,
                        Duration::from_secs_f64(self.config.timeout.agreement_timeout),
                        false,
                    );
                } else {
                    debug!("confirmed existing agreement with the neighborhood");
                }
            }
        });
    }

    /// Applies an app advertisement: reset temporary agreement state,
    /// mutate the problem, re-orchestrate and broadcast.
    fn handle_app_advertisement(
        &self,
        message: AppAdvMessage,
        last_end_time: f64,
        begin_time: f64,
    ) {
        let _ = self.locked_state(|state| {
            if !message.validate(&state.problem) {
                warn!(app = %message.app_name, "ignoring invalid application advertisement");
                return;
            }
            info!(app = %message.app_name, kind = ?message.adv_type, "application advertisement");

            // Any outstanding agreement is no longer valid.
            let active = self.active_neighborhood(&state.last_seen, last_end_time);
            if active.is_subset(&state.agreement.agree_neighbors) {
                if let Ok(mut stats) = self.stats.lock() {
                    stats.agreement_time = 0.0;
                }
                self.messaging.cancel_timer(TimerKind::Agreement);
            }

            {
                let AgentState {
                    problem,
                    orchestrator,
                    agreement,
                    ..
                } = state;
                agreement.reset_temporary_data(problem, orchestrator);
            }
            state.decision_taken = false;

            match message.adv_type {
                AdvertisementType::Del => {
                    // Blacklisted apps get a chance in the freed room.
                    state.orchestrator.app_blacklist.clear();
                    if state.orchestrator.deployed(&message.app_name) {
                        let to_release: Vec<(String, String)> = state
                            .orchestrator
                            .offload_bundle
                            .iter()
                            .filter(|entry| entry.app == message.app_name)
                            .map(|entry| (entry.app.clone(), entry.component.clone()))
                            .collect();
                        state
                            .orchestrator
                            .is_deployed
                            .insert(message.app_name.clone(), false);
                        state.orchestrator.release_components(&to_release, true);
                    }
                    state.problem.remove_app(&message.app_name);
                    state.orchestrator.remove_app_from_structures(&message.app_name);
                }
                AdvertisementType::Add => {
                    let mut description = AppDescription {
                        base_node: Some(message.sender.clone()),
                        components: Vec::new(),
                        constraints: Default::default(),
                    };
                    for component in message.components.iter().flatten() {
                        description.components.push(component.name.clone());
                        state.problem.add_component(&component.name);
                        if let Some(function) = &component.function {
                            let function_name = function.function_name(&component.name);
                            state.problem.add_function(
                                &function_name,
                                &component.name,
                                &function.consumption,
                            );
                        }
                        description.constraints.placement.insert(
                            component.name.clone(),
                            PlacementConstraint {
                                blacklist: component.nodes_blacklist.clone(),
                                whitelist: component.nodes_whitelist.clone(),
                            },
                        );
                    }
                    state
                        .problem
                        .add_app(&message.app_name, description);
                    let AgentState {
                        problem,
                        orchestrator,
                        ..
                    } = state;
                    orchestrator.extend_structures_with_app(problem, &message.app_name);
                }
                AdvertisementType::Mod => {
                    warn!(
                        app = %message.app_name,
                        "update of existing apps is not implemented, ignoring"
                    );
                    return;
                }
            }

            // Repeat the voting on the new structures.
            {
                let AgentState {
                    problem,
                    orchestrator,
                    ..
                } = state;
                orchestrator.orchestrate(problem);
                self.broadcast(orchestrator, None, begin_time);
            }

            self.messaging.arm_timer(
                TimerKind::WeakAgreement,
                Duration::from_secs_f64(self.config.timeout.weak_agreement_timeout),
                true,
            );
            if !active.is_empty() && active.is_subset(&state.agreement.agree_neighbors) {
                self.messaging.arm_timer(
                    TimerKind::Agreement,
                    Duration::from_secs_f64(self.config.timeout.agreement_timeout),
                    false,
                );
            }
        });
    }

    /// Resource updates replace this node's availability; they never
    /// trigger re-orchestration by themselves.
    fn handle_resource_message(&self, message: ResourceMessage) {
        info!(sender = %message.sender, "node resource update");
        let _ = self.locked_state(|state| {
            state
                .problem
                .update_node_resources(&self.node_name, &message.node_resources);
        });
    }

    /// Sends the local voting table to the given neighbors, or to the
    /// currently connected neighborhood, and samples the message rate.
    fn broadcast(
        &self,
        orchestrator: &DroneOrchestrator,
        targets: Option<Vec<String>>,
        begin_time: f64,
    ) {
        let message = VoteMessage {
            sender: self.node_name.clone(),
            timestamp: now_secs(),
            winners: orchestrator.winners.clone(),
            voting_data: orchestrator.voting_data.clone(),
        };
        let body = match serde_json::to_string(&message) {
            Ok(body) => body,
            Err(error) => {
                warn!(%error, "cannot serialize vote message");
                return;
            }
        };
        let targets = targets.unwrap_or_else(|| self.detector.current_neighborhood());
        debug!(targets = ?targets, "broadcasting voting information");
        for neighbor in &targets {
            self.messaging.publish(neighbor, body.clone(), true);
        }
        if let Ok(mut stats) = self.stats.lock() {
            stats.message_counter += targets.len() as u64;
        }
        self.record_rate(begin_time);
    }

    /// Publishes the per-round solution on the solution route.
    fn emit_solution(&self) {
        let message = self.locked_state(|state| {
            let local_offloading: Vec<OffloadedComponent> = state
                .orchestrator
                .offload_bundle
                .iter()
                .map(|entry| OffloadedComponent {
                    name: entry.component.clone(),
                    app_name: entry.app.clone(),
                    function: SolutionFunction {
                        name: entry.function.clone(),
                        consumption: state.problem.consumption_of(&entry.function),
                    },
                })
                .collect();
            SolutionMessage {
                sender: self.node_name.clone(),
                timestamp: now_secs(),
                local_offloading,
                overall_offloading: state.orchestrator.winners.clone(),
            }
        });
        let Some(message) = message else {
            return;
        };
        match serde_json::to_string(&message) {
            Ok(body) => {
                self.messaging
                    .publish(&self.config.messaging.solution_route, body, false);
                info!("offloading solution has been sent");
            }
            Err(error) => warn!(%error, "cannot serialize solution message"),
        }
    }

    /// Updates the windowed sent-message counters.
    fn record_rate(&self, begin_time: f64) {
        let Ok(mut stats) = self.stats.lock() else {
            return;
        };
        let sent_time = round3(now_secs());
        if stats.rates.is_empty() {
            stats.last_window_start = round3(begin_time);
        } else if let Some((last_key, _)) = stats.rates.last() {
            let last_begin = last_key
                .split(':')
                .next()
                .and_then(|t| t.parse::<f64>().ok())
                .unwrap_or(0.0);
            if last_begin == stats.last_window_start {
                stats.rates.pop();
            }
        }
        let delta = stats.message_counter.saturating_sub(stats.sent_count);
        let window = format!("{}:{}", stats.last_window_start, sent_time);
        stats.rates.push((window, delta));
        if sent_time - stats.last_window_start > self.config.timeout.sample_frequency {
            stats.sent_count = stats.message_counter;
            stats.last_window_start = sent_time;
        }
    }

    /// Neighbors heard from after the end of the previous round.
    fn active_neighborhood(
        &self,
        last_seen: &BTreeMap<String, f64>,
        end_time: f64,
    ) -> BTreeSet<String> {
        self.neighborhood
            .iter()
            .filter(|neighbor| {
                last_seen.get(*neighbor).copied().unwrap_or(0.0) > end_time
            })
            .cloned()
            .collect()
    }

    fn locked_state<T>(&self, with: impl FnOnce(&mut AgentState) -> T) -> Option<T> {
        match self.state.lock() {
            Ok(mut state) => Some(with(&mut state)),
            Err(_) => None,
        }
    }
}

fn round3(value: f64) -> f64 {
    (value * 1e3).round() / 1e3
}
