//! The queue network: one edge per (producer, consumer) pair, fan-out on the
//! producing side and a merged, Done-counting input on the consuming side.

use super::stage::{Item, Node, StageConfig, StageId};
use super::worker::WorkerHandle;
use crate::context::{PipelineState, RunContext};
use crate::core::{Substrate, Token};
use crate::errors::{FailureDescriptor, PipelineError};
use crate::observability::{RunStats, StageCounters};
use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::future::poll_fn;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tracing::{debug, trace};

/// Producing half of an edge.
pub(crate) enum EdgeSender<T> {
    Bounded(mpsc::Sender<Token<T>>),
    Unbounded(mpsc::UnboundedSender<Token<T>>),
}

impl<T> Clone for EdgeSender<T> {
    fn clone(&self) -> Self {
        match self {
            Self::Bounded(tx) => Self::Bounded(tx.clone()),
            Self::Unbounded(tx) => Self::Unbounded(tx.clone()),
        }
    }
}

/// Consuming half of an edge.
pub(crate) enum EdgeReceiver<T> {
    Bounded(mpsc::Receiver<Token<T>>),
    Unbounded(mpsc::UnboundedReceiver<Token<T>>),
}

/// Creates an edge; a capacity of 0 makes it unbounded.
pub(crate) fn edge<T>(capacity: usize) -> (EdgeSender<T>, EdgeReceiver<T>) {
    if capacity == 0 {
        let (tx, rx) = mpsc::unbounded_channel();
        (EdgeSender::Unbounded(tx), EdgeReceiver::Unbounded(rx))
    } else {
        let (tx, rx) = mpsc::channel(capacity);
        (EdgeSender::Bounded(tx), EdgeReceiver::Bounded(rx))
    }
}

/// Outcome of putting a token on an edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Delivery {
    Delivered,
    /// The run stopped while the put was pending.
    Stopped,
    /// Every receiver of the edge is gone.
    Disconnected,
}

impl<T: Item> EdgeSender<T> {
    /// Sends a token, waiting for room on a bounded edge unless the run stops.
    async fn send(&self, token: Token<T>, state: &PipelineState) -> Delivery {
        match self {
            Self::Unbounded(tx) => match tx.send(token) {
                Ok(()) => Delivery::Delivered,
                Err(_) => Delivery::Disconnected,
            },
            Self::Bounded(tx) => tokio::select! {
                biased;
                () = state.stopped() => Delivery::Stopped,
                sent = tx.send(token) => match sent {
                    Ok(()) => Delivery::Delivered,
                    Err(_) => Delivery::Disconnected,
                },
            },
        }
    }

    /// Sends without waiting; returns false if the edge is full or closed.
    fn try_send(&self, token: Token<T>) -> bool {
        match self {
            Self::Bounded(tx) => tx.try_send(token).is_ok(),
            Self::Unbounded(tx) => tx.send(token).is_ok(),
        }
    }
}

impl<T> EdgeReceiver<T> {
    fn poll_recv(&mut self, cx: &mut Context<'_>) -> Poll<Option<Token<T>>> {
        match self {
            Self::Bounded(rx) => rx.poll_recv(cx),
            Self::Unbounded(rx) => rx.poll_recv(cx),
        }
    }
}

/// The output side of one worker: every item goes to every edge.
pub(crate) struct Fanout<T> {
    edges: Vec<EdgeSender<T>>,
    counters: Arc<StageCounters>,
}

impl<T> Clone for Fanout<T> {
    fn clone(&self) -> Self {
        Self {
            edges: self.edges.clone(),
            counters: Arc::clone(&self.counters),
        }
    }
}

impl<T: Item> Fanout<T> {
    pub(crate) fn new(edges: Vec<EdgeSender<T>>, counters: Arc<StageCounters>) -> Self {
        Self { edges, counters }
    }

    pub(crate) fn counters(&self) -> &Arc<StageCounters> {
        &self.counters
    }

    /// Delivers one item to every downstream edge, in edge order.
    pub(crate) async fn put(&self, item: T, state: &PipelineState) -> Delivery {
        if state.should_stop() {
            return Delivery::Stopped;
        }
        let Some((last, rest)) = self.edges.split_last() else {
            return Delivery::Delivered;
        };
        for edge in rest {
            let delivery = edge.send(Token::Item(item.clone()), state).await;
            if delivery != Delivery::Delivered {
                return delivery;
            }
        }
        let delivery = last.send(Token::Item(item), state).await;
        if delivery == Delivery::Delivered {
            self.counters.record_emitted();
        }
        delivery
    }

    /// Sends this worker's Done token on every edge.
    ///
    /// Once the run has stopped nobody is counting, so Done is only offered
    /// without waiting.
    pub(crate) async fn close(&self, state: &PipelineState) {
        for edge in &self.edges {
            if state.should_stop() {
                edge.try_send(Token::Done);
            } else if edge.send(Token::Done, state).await == Delivery::Stopped {
                edge.try_send(Token::Done);
            }
        }
    }

    /// Offers a failure token on every edge without waiting.
    pub(crate) fn signal_failure(&self, descriptor: &FailureDescriptor) {
        for edge in &self.edges {
            edge.try_send(Token::Failed(descriptor.clone()));
        }
    }
}

/// One upstream edge of a merged input.
pub(crate) struct InputEdge<T> {
    producer: String,
    rx: EdgeReceiver<T>,
    expected_done: usize,
    received_done: usize,
    closed: bool,
}

impl<T> InputEdge<T> {
    /// Creates the consuming end of an edge from `producer`, expecting one
    /// Done token per producer worker.
    pub(crate) fn new(producer: &StageConfig, rx: EdgeReceiver<T>) -> Self {
        Self {
            producer: producer.name.clone(),
            rx,
            expected_done: producer.workers,
            received_done: 0,
            closed: false,
        }
    }

    pub(crate) const fn expected_done(&self) -> usize {
        self.expected_done
    }
}

/// Result of pulling from a merged input.
#[derive(Debug)]
pub(crate) enum Received<T> {
    Item(T),
    /// Every upstream worker has sent its Done token.
    Exhausted,
    /// The run failed or was cancelled.
    Stopped,
    /// An edge closed before delivering all of its Done tokens.
    Disconnected { producer: String },
}

enum Event<T> {
    Token(usize, Token<T>),
    Closed(usize),
}

/// The input side of a stage: all upstream edges read as one stream.
///
/// Edges are polled round-robin so one busy producer cannot starve the
/// others. No ordering holds across edges.
pub(crate) struct MergedInput<T> {
    edges: Vec<InputEdge<T>>,
    cursor: usize,
    counters: Arc<StageCounters>,
}

impl<T: Item> MergedInput<T> {
    pub(crate) fn new(edges: Vec<InputEdge<T>>, counters: Arc<StageCounters>) -> Self {
        Self {
            edges,
            cursor: 0,
            counters,
        }
    }

    fn is_exhausted(&self) -> bool {
        self.edges.iter().all(|edge| edge.closed)
    }

    /// Waits for the next data item.
    ///
    /// Done tokens are counted here and never returned. The input is
    /// exhausted once every edge has delivered one Done per producer worker.
    pub(crate) async fn recv(&mut self, state: &PipelineState) -> Received<T> {
        loop {
            if state.should_stop() {
                return Received::Stopped;
            }
            if self.is_exhausted() {
                return Received::Exhausted;
            }

            let event = tokio::select! {
                biased;
                () = state.stopped() => return Received::Stopped,
                event = poll_fn(|cx| self.poll_event(cx)) => event,
            };

            match event {
                Event::Token(_, Token::Item(item)) => {
                    self.counters.record_received();
                    return Received::Item(item);
                }
                Event::Token(index, Token::Done) => {
                    let total = self.counters.record_done();
                    let edge = &mut self.edges[index];
                    edge.received_done += 1;
                    trace!(
                        producer = %edge.producer,
                        received = edge.received_done,
                        expected = edge.expected_done,
                        total,
                        "done token"
                    );
                    if edge.received_done >= edge.expected_done {
                        edge.closed = true;
                    }
                }
                Event::Token(_, Token::Failed(_)) => return Received::Stopped,
                Event::Closed(index) => {
                    let edge = &mut self.edges[index];
                    edge.closed = true;
                    if edge.received_done < edge.expected_done {
                        return Received::Disconnected {
                            producer: edge.producer.clone(),
                        };
                    }
                }
            }
        }
    }

    fn poll_event(&mut self, cx: &mut Context<'_>) -> Poll<Event<T>> {
        let count = self.edges.len();
        for offset in 0..count {
            let index = (self.cursor + offset) % count;
            let edge = &mut self.edges[index];
            if edge.closed {
                continue;
            }
            match edge.rx.poll_recv(cx) {
                Poll::Ready(Some(token)) => {
                    self.cursor = (index + 1) % count;
                    return Poll::Ready(Event::Token(index, token));
                }
                Poll::Ready(None) => return Poll::Ready(Event::Closed(index)),
                Poll::Pending => {}
            }
        }
        Poll::Pending
    }
}

/// Spawns the workers of one stage once all output edges are known.
pub(crate) type Launcher =
    Box<dyn FnOnce(&mut Outputs, &RunContext) -> Result<Vec<WorkerHandle>, PipelineError> + Send>;

/// Output edges collected per producing stage while the graph is wired.
#[derive(Default)]
pub(crate) struct Outputs {
    senders: HashMap<StageId, Box<dyn Any + Send>>,
}

impl Outputs {
    fn contains(&self, id: StageId) -> bool {
        self.senders.contains_key(&id)
    }

    fn open<T: Item>(&mut self, id: StageId) {
        self.senders.insert(id, Box::new(Vec::<EdgeSender<T>>::new()));
    }

    fn push<T: Item>(&mut self, id: StageId, tx: EdgeSender<T>) -> Result<(), PipelineError> {
        self.senders
            .get_mut(&id)
            .and_then(|senders| senders.downcast_mut::<Vec<EdgeSender<T>>>())
            .map(|senders| senders.push(tx))
            .ok_or_else(|| PipelineError::Internal(format!("no output table for stage {id}")))
    }

    /// Removes a stage's edges and wraps them as its fan-out.
    pub(crate) fn take<T: Item>(
        &mut self,
        config: &StageConfig,
        ctx: &RunContext,
    ) -> Result<Fanout<T>, PipelineError> {
        let edges = self
            .senders
            .remove(&config.id)
            .and_then(|senders| senders.downcast::<Vec<EdgeSender<T>>>().ok())
            .ok_or_else(|| {
                PipelineError::Internal(format!("no output table for stage '{}'", config.name))
            })?;
        let counters = ctx
            .stats
            .counters(config.id)
            .ok_or_else(|| PipelineError::Internal(format!("stage '{}' has no counters", config.name)))?;
        Ok(Fanout::new(*edges, counters))
    }
}

/// Undoes a side effect of wiring when the plan is dropped.
pub(crate) type Rollback = Box<dyn FnOnce() + Send>;

/// The materialized graph of one run, built bottom-up from the drain.
///
/// Dropping a plan runs its rollbacks, so stages that never launched leave
/// no trace of the attempt.
pub(crate) struct Plan {
    outputs: Outputs,
    launchers: Vec<(StageConfig, Launcher)>,
    rollbacks: Vec<Rollback>,
    edges: HashSet<(StageId, StageId)>,
    stats: Arc<RunStats>,
    uses_tasks: bool,
}

impl Plan {
    pub(crate) fn new(stats: Arc<RunStats>) -> Self {
        Self {
            outputs: Outputs::default(),
            launchers: Vec::new(),
            rollbacks: Vec::new(),
            edges: HashSet::new(),
            stats,
            uses_tasks: false,
        }
    }

    pub(crate) fn stats(&self) -> &Arc<RunStats> {
        &self.stats
    }

    pub(crate) const fn uses_tasks(&self) -> bool {
        self.uses_tasks
    }

    /// Allocates the edge `producer -> consumer`, preparing the producer the
    /// first time it is reached.
    pub(crate) fn connect<T: Item>(
        &mut self,
        producer: &Arc<dyn Node<T>>,
        consumer: StageId,
    ) -> Result<EdgeReceiver<T>, PipelineError> {
        let config = producer.config();
        if !self.outputs.contains(config.id) {
            self.outputs.open::<T>(config.id);
            Arc::clone(producer).prepare(self)?;
        }
        if !self.edges.insert((config.id, consumer)) {
            return Err(PipelineError::Internal(format!(
                "edge '{}' -> {consumer} allocated twice",
                config.name
            )));
        }

        let (tx, rx) = edge(config.capacity);
        self.outputs.push(config.id, tx)?;
        debug!(
            producer = %config.name,
            consumer = %consumer,
            capacity = config.capacity,
            "allocated edge"
        );
        Ok(rx)
    }

    pub(crate) fn add_launcher(&mut self, config: &StageConfig, launcher: Launcher) {
        self.uses_tasks |= config.substrate == Substrate::Task;
        self.launchers.push((config.clone(), launcher));
    }

    pub(crate) fn add_rollback(&mut self, rollback: Rollback) {
        self.rollbacks.push(rollback);
    }

    /// Spawns every stage's workers.
    ///
    /// Stops early if a spawn failure was recorded; the drain raises it.
    pub(crate) fn launch(mut self, ctx: &RunContext) -> Result<Vec<WorkerHandle>, PipelineError> {
        let mut handles = Vec::new();
        for (config, launcher) in std::mem::take(&mut self.launchers) {
            if ctx.state.should_stop() {
                break;
            }
            debug!(
                run_id = %ctx.run_id,
                stage = %config.name,
                workers = config.workers,
                substrate = %config.substrate,
                "launching stage"
            );
            handles.extend(launcher(&mut self.outputs, ctx)?);
        }
        Ok(handles)
    }
}

impl Drop for Plan {
    fn drop(&mut self) {
        for rollback in self.rollbacks.drain(..) {
            rollback();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::StageKind;
    use crate::errors::{FailureKind, StageFailure};
    use std::time::Duration;

    fn producer(workers: usize) -> StageConfig {
        StageConfig::new(StageKind::Transform, workers, 0, Substrate::Thread)
    }

    fn counters(stats: &RunStats, config: &StageConfig, expected: usize) -> Arc<StageCounters> {
        stats.register(config, expected)
    }

    #[tokio::test]
    async fn test_merged_input_counts_done_per_worker() {
        let stats = RunStats::new();
        let state = PipelineState::new();
        let a = producer(2);
        let b = producer(1);
        let (tx_a, rx_a) = edge::<i32>(0);
        let (tx_b, rx_b) = edge::<i32>(4);

        let consumer = producer(1);
        let mut input = MergedInput::new(
            vec![InputEdge::new(&a, rx_a), InputEdge::new(&b, rx_b)],
            counters(&stats, &consumer, 3),
        );

        assert_eq!(tx_a.send(Token::Item(1), &state).await, Delivery::Delivered);
        assert_eq!(tx_a.send(Token::Done, &state).await, Delivery::Delivered);
        assert_eq!(tx_b.send(Token::Item(2), &state).await, Delivery::Delivered);
        assert_eq!(tx_b.send(Token::Done, &state).await, Delivery::Delivered);

        let mut items = Vec::new();
        for _ in 0..2 {
            match input.recv(&state).await {
                Received::Item(item) => items.push(item),
                other => panic!("unexpected {other:?}"),
            }
        }
        items.sort_unstable();
        assert_eq!(items, vec![1, 2]);

        // One of producer a's two workers is still running.
        let pending = tokio::time::timeout(Duration::from_millis(50), input.recv(&state)).await;
        assert!(pending.is_err());

        tx_a.send(Token::Done, &state).await;
        assert!(matches!(input.recv(&state).await, Received::Exhausted));
        assert_eq!(stats.stage(&consumer.name).unwrap().done_received, 3);
    }

    #[tokio::test]
    async fn test_closed_edge_before_done_is_disconnected() {
        let stats = RunStats::new();
        let state = PipelineState::new();
        let a = producer(1);
        let (tx, rx) = edge::<i32>(0);
        let mut input = MergedInput::new(vec![InputEdge::new(&a, rx)], counters(&stats, &producer(1), 1));

        drop(tx);
        match input.recv(&state).await {
            Received::Disconnected { producer } => assert_eq!(producer, a.name),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_stop_wakes_blocked_receiver() {
        let stats = Arc::new(RunStats::new());
        let state = Arc::new(PipelineState::new());
        let a = producer(1);
        let (_tx, rx) = edge::<i32>(1);
        let mut input = MergedInput::new(vec![InputEdge::new(&a, rx)], counters(&stats, &producer(1), 1));

        let waiter = {
            let state = state.clone();
            tokio::spawn(async move { matches!(input.recv(&state).await, Received::Stopped) })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        state.cancel();
        assert!(waiter.await.unwrap());
    }

    #[tokio::test]
    async fn test_fanout_broadcasts_to_every_edge() {
        let stats = RunStats::new();
        let state = PipelineState::new();
        let config = producer(1);
        let (tx1, mut rx1) = edge::<String>(0);
        let (tx2, mut rx2) = edge::<String>(2);
        let fanout = Fanout::new(vec![tx1, tx2], counters(&stats, &config, 0));

        assert_eq!(fanout.put("a".to_string(), &state).await, Delivery::Delivered);
        fanout.close(&state).await;

        for rx in [&mut rx1, &mut rx2] {
            assert_eq!(
                poll_fn(|cx| rx.poll_recv(cx)).await,
                Some(Token::Item("a".to_string()))
            );
            assert_eq!(poll_fn(|cx| rx.poll_recv(cx)).await, Some(Token::Done));
        }
        assert_eq!(stats.stage(&config.name).unwrap().items_emitted, 1);
    }

    #[tokio::test]
    async fn test_bounded_put_blocks_until_stopped() {
        let stats = RunStats::new();
        let state = Arc::new(PipelineState::new());
        let config = producer(1);
        let (tx, _rx) = edge::<u8>(1);
        let fanout = Fanout::new(vec![tx], counters(&stats, &config, 0));

        assert_eq!(fanout.put(1, &state).await, Delivery::Delivered);
        let blocked = tokio::time::timeout(Duration::from_millis(50), fanout.put(2, &state)).await;
        assert!(blocked.is_err());

        state.cancel();
        assert_eq!(fanout.put(3, &state).await, Delivery::Stopped);
    }

    #[tokio::test]
    async fn test_put_to_dropped_consumer_is_disconnected() {
        let stats = RunStats::new();
        let state = PipelineState::new();
        let config = producer(1);
        let (tx, rx) = edge::<u8>(0);
        drop(rx);
        let fanout = Fanout::new(vec![tx], counters(&stats, &config, 0));
        assert_eq!(fanout.put(1, &state).await, Delivery::Disconnected);
    }

    #[tokio::test]
    async fn test_failure_token_stops_consumer() {
        let stats = RunStats::new();
        let state = PipelineState::new();
        let a = producer(1);
        let (tx, rx) = edge::<i32>(0);
        let fanout = Fanout::new(vec![tx], counters(&stats, &a, 0));
        let mut input = MergedInput::new(vec![InputEdge::new(&a, rx)], counters(&stats, &producer(1), 1));

        let failure = StageFailure::new(&a.name, Some(0), FailureKind::WorkerFn, anyhow::anyhow!("boom"));
        fanout.signal_failure(&failure.descriptor);
        match input.recv(&state).await {
            Received::Stopped => {}
            other => panic!("unexpected {other:?}"),
        }
    }
}
