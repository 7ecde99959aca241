//! End-to-end scenarios: real agents wired over the in-process fabric
//! where timing is robust, deterministic protocol-level drives where the
//! outcome depends on message interleaving.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::sync::mpsc::Receiver;
use std::sync::mpsc::channel;
use std::thread;
use std::time::Duration;

use drone_core::BundleEntry;
use drone_core::Config;
use drone_core::DroneAgent;
use drone_core::DroneAgreement;
use drone_core::DroneOrchestrator;
use drone_core::InProcFabric;
use drone_core::Messaging;
use drone_core::PrivateUtilityKind;
use drone_core::ReceivedData;
use drone_core::ResourceOffloadProblem;
use drone_core::RoundSummary;
use drone_core::agent::RunOutcome;
use drone_core::messages::AppAdvMessage;
use drone_core::messages::ComponentAdv;
use drone_core::messages::FunctionAdv;
use drone_core::messaging::Delivery;
use drone_core::messaging::MessageFabric;

fn test_config(weak_timeout: f64) -> Config {
    let mut config = Config::default();
    config.timeout.agreement_timeout = 0.4;
    config.timeout.weak_agreement_timeout = weak_timeout;
    config.timeout.async_timeout = 0.2;
    config.timeout.sample_frequency = 0.5;
    config.messaging.debug_mode = true;
    config
}

fn parse(instance: &str) -> ResourceOffloadProblem {
    ResourceOffloadProblem::parse_instance(instance).expect("parse instance")
}

fn orchestrator(problem: &ResourceOffloadProblem, node: &str) -> DroneOrchestrator {
    DroneOrchestrator::new(node, problem, PrivateUtilityKind::ResidualCapacity)
        .expect("orchestrator")
}

fn snapshot(orchestrator: &DroneOrchestrator) -> ReceivedData {
    ReceivedData {
        winners: orchestrator.winners.clone(),
        voting_data: orchestrator.voting_data.clone(),
    }
}

fn batch_from(sender: &str, orchestrator: &DroneOrchestrator) -> BTreeMap<String, ReceivedData> {
    [(sender.to_string(), snapshot(orchestrator))].into()
}

fn recv_summary(events: &Receiver<RoundSummary>) -> RoundSummary {
    events
        .recv_timeout(Duration::from_secs(15))
        .expect("round summary in time")
}

fn hosted_pairs(bundles: &[&RunOutcome]) -> BTreeSet<(String, String)> {
    bundles
        .iter()
        .flat_map(|outcome| {
            outcome
                .offload_bundle
                .iter()
                .map(|entry| (entry.app.clone(), entry.component.clone()))
        })
        .collect()
}

/// S1: a single node places the only app and reports the residual-capacity
/// utility; with nobody to talk to the round closes under the weak timer.
#[test]
fn s1_single_node_places_single_app() {
    let problem = parse(
        r#"{
            "apps": ["x"],
            "functions": ["f"],
            "components": ["c"],
            "resources": ["cpu"],
            "nodes": ["A"],
            "consumption": {"f": {"cpu": 1}},
            "available_resources": {"A": {"cpu": 4}},
            "app_descriptions": {"x": {"base-node": "A", "components": ["c"]}},
            "implementations": {"c": ["f"]}
        }"#,
    );
    let fabric = InProcFabric::new();
    let agent =
        DroneAgent::new("A", problem, test_config(1.2), fabric, false).expect("agent");
    let outcome = agent.run().expect("run");

    assert!(!outcome.strong_agreement);
    assert_eq!(outcome.offload_bundle.len(), 1);
    let entry = &outcome.offload_bundle[0];
    assert_eq!(
        (entry.app.as_str(), entry.component.as_str(), entry.function.as_str()),
        ("x", "c", "f")
    );
    // norm(A, {cpu: 3}) * 100 = 75.
    assert_eq!(outcome.utility, 75);
}

/// S2: crafted tables make each node believe the other one won the same
/// component; both sides reset it and rebroadcast.
#[test]
fn s2_mutual_winner_reset_resolves_within_two_exchanges() {
    let instance = r#"{
        "apps": ["x"],
        "functions": ["f"],
        "components": ["c"],
        "resources": ["cpu"],
        "nodes": ["A", "B"],
        "consumption": {"f": {"cpu": 1}},
        "available_resources": {"A": {"cpu": 4}, "B": {"cpu": 2}},
        "app_descriptions": {"x": {"base-node": "A", "components": ["c"]}},
        "implementations": {"c": ["f"]}
    }"#;
    let problem = parse(instance);
    let mut node_a = orchestrator(&problem, "A");
    let mut node_b = orchestrator(&problem, "B");
    let mut agreement_a = DroneAgreement::new("A");
    let mut agreement_b = DroneAgreement::new("B");

    // Crafted crossed state: each side holds a stale claim that the OTHER
    // node won (x, c), while its own self-vote is a fresh reset.
    let base = drone_core::now_secs();
    for (local, owner, other, value) in
        [(&mut node_a, "A", "B", 60), (&mut node_b, "B", "A", 50)]
    {
        let votes = local
            .voting_data
            .get_mut("x")
            .and_then(|a| a.get_mut("c"))
            .expect("votes");
        votes.insert(
            other.to_string(),
            drone_core::Vote {
                value,
                implementation: Some("f".to_string()),
                timestamp: base - 10.0,
            },
        );
        votes.insert(
            owner.to_string(),
            drone_core::Vote {
                value: 0,
                implementation: None,
                timestamp: base,
            },
        );
        local
            .winners
            .get_mut("x")
            .expect("winners")
            .insert("c".to_string(), Some(other.to_string()));
    }

    // Exchange 1: both apply the mutual-winner RESET and must rebroadcast.
    let from_b = batch_from("B", &node_b);
    let from_a = batch_from("A", &node_a);
    agreement_a.multi_agreement(&problem, &mut node_a, &from_b, true);
    agreement_b.multi_agreement(&problem, &mut node_b, &from_a, true);
    assert!(agreement_a.rebroadcast);
    assert!(agreement_b.rebroadcast);
    assert!(!agreement_a.agreement);
    for vote in node_a.voting_data["x"]["c"].values() {
        assert_eq!(vote.value, 0);
    }

    // Next round: both re-bundle from scratch and exchange the new tables.
    node_a.orchestrate(&problem);
    node_b.orchestrate(&problem);
    assert_eq!(node_a.winners["x"]["c"].as_deref(), Some("A"));
    assert_eq!(node_b.winners["x"]["c"].as_deref(), Some("B"));
    let from_b = batch_from("B", &node_b);
    let from_a = batch_from("A", &node_a);
    agreement_a.multi_agreement(&problem, &mut node_a, &from_b, true);
    agreement_b.multi_agreement(&problem, &mut node_b, &from_a, true);

    // A has more headroom, so its vote is higher and it wins unambiguously.
    assert_eq!(node_a.winners["x"]["c"].as_deref(), Some("A"));
    assert_eq!(node_b.winners["x"]["c"].as_deref(), Some("A"));
    assert!(node_b.offload_bundle.is_empty());
}

/// S3: losing the first bundle entry invalidates the whole suffix; the
/// node releases everything of the app and re-orchestrates.
#[test]
fn s3_outvoting_cascades_through_the_bundle() {
    let problem = parse(
        r#"{
            "apps": ["x"],
            "functions": ["f1", "f2", "f3"],
            "components": ["c1", "c2", "c3"],
            "resources": ["cpu"],
            "nodes": ["A", "B"],
            "consumption": {"f1": {"cpu": 1}, "f2": {"cpu": 1}, "f3": {"cpu": 1}},
            "available_resources": {"A": {"cpu": 8}, "B": {"cpu": 16}},
            "app_descriptions": {
                "x": {"base-node": "A", "components": ["c1", "c2", "c3"]}
            },
            "implementations": {"c1": ["f1"], "c2": ["f2"], "c3": ["f3"]}
        }"#,
    );
    let mut node_a = orchestrator(&problem, "A");
    let mut agreement_a = DroneAgreement::new("A");
    node_a.orchestrate(&problem);
    assert_eq!(node_a.offload_bundle.len(), 3);

    // B has twice the headroom: its vote on c1 wins the merge.
    let mut node_b = orchestrator(&problem, "B");
    node_b.orchestrate(&problem);
    let from_b = batch_from("B", &node_b);
    agreement_a.multi_agreement(&problem, &mut node_a, &from_b, false);

    // A lost c1, so c2 and c3 fell with it.
    assert!(
        node_a
            .offload_bundle
            .iter()
            .all(|entry| entry.app != "x"),
        "bundle still holds {:?}",
        node_a.offload_bundle
    );

    // The next agreement performs the postponed re-orchestration.
    agreement_a.multi_agreement(&problem, &mut node_a, &BTreeMap::new(), true);
    assert!(agreement_a.rebroadcast);
}

/// S4: two apps compete; pieces of both get reserved, the partial one is
/// blacklisted and the other app ends fully placed on both nodes.
#[test]
fn s4_partial_allocation_is_blacklisted() {
    let problem = parse(
        r#"{
            "apps": ["x", "y"],
            "functions": ["fc1", "fc2", "fd1", "fd2"],
            "components": ["c1", "c2", "d1", "d2"],
            "resources": ["cpu"],
            "nodes": ["A", "B"],
            "consumption": {
                "fc1": {"cpu": 3}, "fc2": {"cpu": 1},
                "fd1": {"cpu": 3}, "fd2": {"cpu": 1}
            },
            "available_resources": {"A": {"cpu": 4}, "B": {"cpu": 4}},
            "app_descriptions": {
                "x": {"base-node": "A", "components": ["c1", "c2"]},
                "y": {"base-node": "A", "components": ["d1", "d2"]}
            },
            "implementations": {
                "c1": ["fc1"], "c2": ["fc2"], "d1": ["fd1"], "d2": ["fd2"]
            }
        }"#,
    );
    let mut node_a = orchestrator(&problem, "A");
    let mut node_b = orchestrator(&problem, "B");
    let mut agreement_a = DroneAgreement::new("A");
    let mut agreement_b = DroneAgreement::new("B");

    // Both greedily reserve the small component of each app.
    node_a.orchestrate(&problem);
    node_b.orchestrate(&problem);
    let pieces: BTreeSet<&str> = node_a
        .offload_bundle
        .iter()
        .map(|entry| entry.app.as_str())
        .collect();
    assert_eq!(pieces, ["x", "y"].into());

    // Fixed drive: B hears A first and loses the ties, then re-votes the
    // big component; A then spots the partial allocation of y.
    let from_a = batch_from("A", &node_a);
    agreement_b.multi_agreement(&problem, &mut node_b, &from_a, true);
    let from_b = batch_from("B", &node_b);
    agreement_a.multi_agreement(&problem, &mut node_a, &from_b, true);

    assert_eq!(node_a.app_blacklist, vec!["y".to_string()]);
    let from_a = batch_from("A", &node_a);
    agreement_b.multi_agreement(&problem, &mut node_b, &from_a, true);
    let from_b = batch_from("B", &node_b);
    agreement_a.multi_agreement(&problem, &mut node_a, &from_b, true);

    // x is fully placed across the two nodes, y is gone.
    for node in [&node_a, &node_b] {
        assert_eq!(node.winners["x"]["c1"].as_deref(), Some("B"));
        assert_eq!(node.winners["x"]["c2"].as_deref(), Some("A"));
        assert_eq!(node.winners["y"]["d1"], None);
        assert_eq!(node.winners["y"]["d2"], None);
    }
    assert!(node_b.app_blacklist.is_empty());
    assert!(agreement_a.agree_neighbors.contains("B"));
    assert!(agreement_b.agree_neighbors.contains("A"));
}

/// S5: converge on x, ADD y, converge, DEL y: the placement of x never
/// moves, y disappears and no blacklist survives.
#[test]
fn s5_app_add_then_del_round_trips() {
    let instance = r#"{
        "apps": ["x"],
        "functions": ["f1", "f2"],
        "components": ["c1", "c2"],
        "resources": ["cpu"],
        "nodes": ["A", "B"],
        "consumption": {"f1": {"cpu": 1}, "f2": {"cpu": 1}},
        "available_resources": {"A": {"cpu": 4}, "B": {"cpu": 4}},
        "app_descriptions": {"x": {"base-node": "A", "components": ["c1", "c2"]}},
        "implementations": {"c1": ["f1"], "c2": ["f2"]}
    }"#;
    let fabric = InProcFabric::new();
    let mut agents = Vec::new();
    let mut events = Vec::new();
    let mut shutdowns = Vec::new();
    for node in ["A", "B"] {
        let (tx, rx) = channel();
        let agent = DroneAgent::new(node, parse(instance), test_config(5.0), fabric.clone(), true)
            .expect("agent")
            .with_round_events(tx);
        shutdowns.push(agent.shutdown_handle());
        events.push(rx);
        agents.push(agent);
    }
    let handles: Vec<_> = agents
        .into_iter()
        .map(|agent| thread::spawn(move || agent.run().expect("run")))
        .collect();

    // Round 1: both converge on x.
    let first: Vec<RoundSummary> = events.iter().map(recv_summary).collect();
    assert!(first.iter().all(|summary| summary.strong_agreement));
    assert!(
        first
            .iter()
            .all(|summary| summary.instantiated_apps == vec!["x".to_string()])
    );

    // ADD app y with an inline function.
    let advertisement = AppAdvMessage::add(
        "controller",
        "y",
        vec![ComponentAdv {
            name: "d".to_string(),
            function: Some(FunctionAdv {
                image: "worker".to_string(),
                consumption: [("cpu".to_string(), 1.0)].into(),
            }),
            nodes_blacklist: None,
            nodes_whitelist: None,
        }],
    );
    fabric.publish(
        &Messaging::federated_queue_name("app-advertisement"),
        Delivery {
            topic: "app-advertisement".to_string(),
            body: serde_json::to_string(&advertisement).expect("encode"),
        },
    );

    // Round 2: both x and y are placed.
    let second: Vec<RoundSummary> = events.iter().map(recv_summary).collect();
    assert!(second.iter().all(|summary| summary.strong_agreement));
    for summary in &second {
        assert_eq!(
            summary.instantiated_apps,
            vec!["x".to_string(), "y".to_string()]
        );
    }

    // DEL app y.
    let removal = AppAdvMessage::del("controller", "y");
    fabric.publish(
        &Messaging::federated_queue_name("app-advertisement"),
        Delivery {
            topic: "app-advertisement".to_string(),
            body: serde_json::to_string(&removal).expect("encode"),
        },
    );

    // Round 3: back to the x-only state, blacklists cleared, x unmoved.
    let third: Vec<RoundSummary> = events.iter().map(recv_summary).collect();
    for summary in &third {
        assert_eq!(summary.instantiated_apps, vec!["x".to_string()]);
        assert!(summary.app_blacklist.is_empty());
        assert!(summary.offload_bundle.iter().all(|entry| entry.app != "y"));
    }
    fn x_bundles(summaries: &[RoundSummary]) -> Vec<Vec<BundleEntry>> {
        summaries
            .iter()
            .map(|summary| {
                summary
                    .offload_bundle
                    .iter()
                    .filter(|entry| entry.app == "x")
                    .cloned()
                    .collect()
            })
            .collect()
    }
    assert_eq!(x_bundles(&first), x_bundles(&third));

    for shutdown in &shutdowns {
        shutdown.shutdown();
    }
    for handle in handles {
        let _ = handle.join().expect("agent thread");
    }
}

/// S6: every neighbor stays silent; the round runs out the weak timer,
/// the partial allocation is fixed and no strong agreement is claimed.
#[test]
fn s6_silent_neighborhood_ends_weak_and_fixes_partials() {
    let problem = parse(
        r#"{
            "apps": ["x"],
            "functions": ["f1", "f2"],
            "components": ["c1", "c2"],
            "resources": ["cpu"],
            "nodes": ["A", "B"],
            "consumption": {"f1": {"cpu": 3}, "f2": {"cpu": 5}},
            "available_resources": {"A": {"cpu": 4}, "B": {"cpu": 4}},
            "app_descriptions": {"x": {"base-node": "A", "components": ["c1", "c2"]}},
            "implementations": {"c1": ["f1"], "c2": ["f2"]}
        }"#,
    );
    let fabric = InProcFabric::new();
    let (tx, rx) = channel();
    let agent = DroneAgent::new("A", problem, test_config(1.2), fabric, false)
        .expect("agent")
        .with_round_events(tx);
    let outcome = agent.run().expect("run");
    let summary = recv_summary(&rx);

    assert!(!outcome.strong_agreement);
    assert!(!summary.strong_agreement);
    // c2 never fits, so x was partially allocated and then blacklisted.
    assert_eq!(summary.app_blacklist, vec!["x".to_string()]);
    assert!(outcome.offload_bundle.is_empty());
    assert_eq!(outcome.utility, 0);
    assert!(summary.total_time >= 1.2);
}

/// Termination: a static capacity-limited two-node, two-app scenario
/// reaches strong agreement on both sides within a single round, bounded
/// by the weak timer.
#[test]
fn termination_two_nodes_two_apps() {
    let instance = r#"{
        "apps": ["x", "y"],
        "functions": ["f1", "f2", "g1", "g2"],
        "components": ["c1", "c2", "d1", "d2"],
        "resources": ["cpu"],
        "nodes": ["A", "B"],
        "consumption": {
            "f1": {"cpu": 1}, "f2": {"cpu": 1},
            "g1": {"cpu": 1}, "g2": {"cpu": 1}
        },
        "available_resources": {"A": {"cpu": 4}, "B": {"cpu": 4}},
        "app_descriptions": {
            "x": {"base-node": "A", "components": ["c1", "c2"]},
            "y": {"base-node": "A", "components": ["d1", "d2"]}
        },
        "implementations": {
            "c1": ["f1"], "c2": ["f2"], "d1": ["g1"], "d2": ["g2"]
        }
    }"#;
    let fabric = InProcFabric::new();
    let handles: Vec<_> = ["A", "B"]
        .into_iter()
        .map(|node| {
            let agent = DroneAgent::new(node, parse(instance), test_config(5.0), fabric.clone(), false)
                .expect("agent");
            thread::spawn(move || agent.run().expect("run"))
        })
        .collect();
    let outcomes: Vec<RunOutcome> = handles
        .into_iter()
        .map(|handle| handle.join().expect("agent thread"))
        .collect();

    assert!(outcomes.iter().all(|outcome| outcome.strong_agreement));
    // Every component of both apps is hosted exactly once.
    let hosted = hosted_pairs(&outcomes.iter().collect::<Vec<_>>());
    let expected: BTreeSet<(String, String)> = [
        ("x".to_string(), "c1".to_string()),
        ("x".to_string(), "c2".to_string()),
        ("y".to_string(), "d1".to_string()),
        ("y".to_string(), "d2".to_string()),
    ]
    .into();
    assert_eq!(hosted, expected);
    let total_entries: usize = outcomes
        .iter()
        .map(|outcome| outcome.offload_bundle.len())
        .sum();
    assert_eq!(total_entries, 4);
}
