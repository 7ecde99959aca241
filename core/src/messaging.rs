use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::mpsc::Receiver;
use std::sync::mpsc::RecvTimeoutError;
use std::sync::mpsc::Sender;
use std::sync::mpsc::channel;
use std::time::Duration;
use std::time::Instant;

use tracing::debug;
use tracing::trace;

/// How often blocking waits re-check whether the connection was shut down.
const SHUTDOWN_POLL: Duration = Duration::from_millis(100);

/// A raw message as it travels through the fabric: the routing topic and
/// the JSON body.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub topic: String,
    pub body: String,
}

/// The broker seam: named durable queues with publish/bind. Production
/// deployments back this with their broker client; tests and the CLI use
/// [`InProcFabric`].
pub trait MessageFabric: Send + Sync {
    fn bind(&self, queue: &str, sender: Sender<Delivery>);
    fn publish(&self, queue: &str, delivery: Delivery);
}

#[derive(Default)]
struct QueueState {
    bindings: Vec<Sender<Delivery>>,
    backlog: VecDeque<Delivery>,
}

/// In-process fabric: fan-out to every binding of a queue; deliveries to a
/// queue nobody bound yet are buffered for the first binder, matching the
/// durable-queue assumption of the protocol.
#[derive(Default)]
pub struct InProcFabric {
    queues: Mutex<HashMap<String, QueueState>>,
}

impl InProcFabric {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

impl MessageFabric for InProcFabric {
    fn bind(&self, queue: &str, sender: Sender<Delivery>) {
        let Ok(mut queues) = self.queues.lock() else {
            return;
        };
        let state = queues.entry(queue.to_string()).or_default();
        for delivery in state.backlog.drain(..) {
            let _ = sender.send(delivery);
        }
        state.bindings.push(sender);
    }

    fn publish(&self, queue: &str, delivery: Delivery) {
        let Ok(mut queues) = self.queues.lock() else {
            return;
        };
        let state = queues.entry(queue.to_string()).or_default();
        state
            .bindings
            .retain(|binding| binding.send(delivery.clone()).is_ok());
        if state.bindings.is_empty() {
            state.backlog.push_back(delivery);
        }
    }
}

/// Clonable handle that shuts a [`Messaging`] connection down from
/// outside: every blocking consume and receive on the connection returns
/// promptly, the way closing the broker connection ends the agent's
/// round. Shutting down twice is a no-op.
#[derive(Clone)]
pub struct ShutdownHandle(Arc<AtomicBool>);

impl ShutdownHandle {
    pub fn shutdown(&self) {
        self.0.store(true, Ordering::Relaxed);
    }
}

/// The two round timers. The short one declares a quiescent round
/// complete; the long refreshable one bounds the round under storms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TimerKind {
    Agreement,
    WeakAgreement,
}

#[derive(Debug, Clone, Copy)]
struct TimerEntry {
    deadline: Instant,
    duration: Duration,
    refreshable: bool,
}

/// Why a consume loop returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumeOutcome {
    Timer(TimerKind),
    Closed,
}

/// One connection to the fabric: routes subscribed topics into a single
/// FIFO inbox and owns the round timers, which are evaluated against the
/// inbox wait so that expiry ends the consume loop.
///
/// Local topics are namespaced by the owning node, mirroring the per-node
/// local exchange of the deployment; federated topics are shared.
pub struct Messaging {
    fabric: Arc<dyn MessageFabric>,
    namespace: String,
    inbox_tx: Sender<Delivery>,
    inbox_rx: Mutex<Receiver<Delivery>>,
    /// Deliveries set aside while waiting for a specific topic.
    pending: Mutex<VecDeque<Delivery>>,
    timers: Mutex<BTreeMap<TimerKind, TimerEntry>>,
    refresher_topics: Mutex<BTreeSet<String>>,
    closed: Arc<AtomicBool>,
}

impl Messaging {
    pub fn new(fabric: Arc<dyn MessageFabric>, namespace: &str) -> Self {
        let (inbox_tx, inbox_rx) = channel();
        Self {
            fabric,
            namespace: namespace.to_string(),
            inbox_tx,
            inbox_rx: Mutex::new(inbox_rx),
            pending: Mutex::new(VecDeque::new()),
            timers: Mutex::new(BTreeMap::new()),
            refresher_topics: Mutex::new(BTreeSet::new()),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Handle that closes this connection from another thread.
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle(self.closed.clone())
    }

    /// True once [`ShutdownHandle::shutdown`] was called.
    pub fn is_shut_down(&self) -> bool {
        self.closed.load(Ordering::Relaxed)
    }

    /// Queue backing a federated topic, shared across the cluster.
    pub fn federated_queue_name(topic: &str) -> String {
        format!("{topic}-drone")
    }

    /// Queue backing a node's local topic.
    pub fn local_queue_name(namespace: &str, topic: &str) -> String {
        format!("{namespace}:{topic}")
    }

    fn queue_name(&self, topic: &str, federated: bool) -> String {
        if federated {
            Self::federated_queue_name(topic)
        } else {
            Self::local_queue_name(&self.namespace, topic)
        }
    }

    /// Routes a topic into this connection's inbox. With `refresh_timeout`
    /// every delivery on the topic pushes the weak-agreement deadline
    /// forward.
    pub fn subscribe(&self, topic: &str, federated: bool, refresh_timeout: bool) {
        debug!(topic, federated, "subscribing");
        if refresh_timeout
            && let Ok(mut refreshers) = self.refresher_topics.lock()
        {
            refreshers.insert(topic.to_string());
        }
        self.fabric
            .bind(&self.queue_name(topic, federated), self.inbox_tx.clone());
    }

    pub fn publish(&self, topic: &str, body: String, federated: bool) {
        trace!(topic, "publishing");
        self.fabric.publish(
            &self.queue_name(topic, federated),
            Delivery {
                topic: topic.to_string(),
                body,
            },
        );
    }

    /// Arms a timer. A refreshable timer that is already armed is pushed
    /// forward; a non-refreshable one that is already armed is left as is.
    pub fn arm_timer(&self, kind: TimerKind, duration: Duration, refreshable: bool) {
        let Ok(mut timers) = self.timers.lock() else {
            return;
        };
        let entry = TimerEntry {
            deadline: Instant::now() + duration,
            duration,
            refreshable,
        };
        match timers.get(&kind) {
            Some(existing) if !existing.refreshable => {}
            _ => {
                timers.insert(kind, entry);
            }
        }
    }

    /// Idempotent: cancelling an unarmed timer does nothing.
    pub fn cancel_timer(&self, kind: TimerKind) {
        if let Ok(mut timers) = self.timers.lock() {
            timers.remove(&kind);
        }
    }

    fn expired_timer(&self) -> Option<TimerKind> {
        let now = Instant::now();
        let timers = self.timers.lock().ok()?;
        timers
            .iter()
            .find(|(_, entry)| entry.deadline <= now)
            .map(|(kind, _)| *kind)
    }

    fn next_wait(&self) -> Duration {
        let now = Instant::now();
        let nearest = self
            .timers
            .lock()
            .ok()
            .and_then(|timers| {
                timers
                    .values()
                    .map(|entry| entry.deadline.saturating_duration_since(now))
                    .min()
            })
            .unwrap_or(SHUTDOWN_POLL);
        nearest.min(SHUTDOWN_POLL)
    }

    fn note_delivery(&self, topic: &str) {
        let refreshes = self
            .refresher_topics
            .lock()
            .map(|refreshers| refreshers.contains(topic))
            .unwrap_or(false);
        if refreshes
            && let Ok(mut timers) = self.timers.lock()
            && let Some(entry) = timers.get_mut(&TimerKind::WeakAgreement)
            && entry.refreshable
        {
            entry.deadline = Instant::now() + entry.duration;
        }
    }

    /// Dispatches inbox deliveries to the handler until a timer fires or
    /// the connection is shut down. Firing clears every armed timer.
    pub fn consume(&self, mut on_delivery: impl FnMut(Delivery)) -> ConsumeOutcome {
        loop {
            let backlog = self
                .pending
                .lock()
                .ok()
                .and_then(|mut pending| pending.pop_front());
            if let Some(delivery) = backlog {
                self.note_delivery(&delivery.topic);
                on_delivery(delivery);
                continue;
            }
            if self.is_shut_down() {
                return ConsumeOutcome::Closed;
            }
            if let Some(kind) = self.expired_timer() {
                debug!(?kind, "timer fired");
                if let Ok(mut timers) = self.timers.lock() {
                    timers.clear();
                }
                return ConsumeOutcome::Timer(kind);
            }
            let wait = self.next_wait();
            let received = match self.inbox_rx.lock() {
                Ok(inbox) => inbox.recv_timeout(wait),
                Err(_) => return ConsumeOutcome::Closed,
            };
            match received {
                Ok(delivery) => {
                    self.note_delivery(&delivery.topic);
                    on_delivery(delivery);
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => return ConsumeOutcome::Closed,
            }
        }
    }

    /// Blocks until a delivery on `topic` arrives, setting aside anything
    /// else for the next consume loop. Returns `None` once the connection
    /// is shut down.
    pub fn recv_matching(&self, topic: &str) -> Option<Delivery> {
        if let Ok(mut pending) = self.pending.lock()
            && let Some(index) = pending.iter().position(|d| d.topic == topic)
        {
            return pending.remove(index);
        }
        loop {
            if self.is_shut_down() {
                return None;
            }
            let received = match self.inbox_rx.lock() {
                Ok(inbox) => inbox.recv_timeout(SHUTDOWN_POLL),
                Err(_) => return None,
            };
            match received {
                Ok(delivery) if delivery.topic == topic => {
                    self.note_delivery(&delivery.topic);
                    return Some(delivery);
                }
                Ok(other) => {
                    if let Ok(mut pending) = self.pending.lock() {
                        pending.push_back(other);
                    }
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => return None,
            }
        }
    }
}
