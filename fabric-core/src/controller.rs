use std::collections::HashMap;
use std::sync::Arc;

use rand::Rng;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;

use crate::addr::PeerAddr;
use crate::config::{OverlayConfig, ProtocolTuning};
use crate::pool::WorkerPool;
use crate::stats::{StatsSnapshot, Statistics};
use crate::task::Task;
use crate::wire::Message;

/// Which of a node's two ring neighbors a message came from or is destined
/// for. Dissemination (`TasksCount`) always travels toward `Next`; migration
/// messages can target either side, depending on which neighbor is
/// overloaded relative to the sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NeighborSide {
    Prev,
    Next,
}

/// A message pulled off one of the controller's three inbound channels,
/// tagged with where it came from.
#[derive(Debug)]
enum Inbound {
    Neighbor(NeighborSide, Message),
    Registry(Message),
}

/// The sending half of a connection to one ring neighbor, plus the address
/// used to key `overlayTasksCount` and to detect a `TasksCount` message that
/// has circled back to its origin.
pub struct NeighborLink {
    pub addr: PeerAddr,
    pub tx: mpsc::Sender<Message>,
}

/// The per-node, per-round state machine. Owns the generated and migrated
/// tasks (unified into `local_tasks`, see the design note in DESIGN.md),
/// the per-peer task counts seen this round, the migration-in-flight flag,
/// and the round latches. Because it is the sole consumer of every channel
/// that could mutate this state, none of these fields need a lock: the
/// controller *is* the monitor.
pub struct NodeController {
    self_addr: PeerAddr,
    overlay: OverlayConfig,
    tuning: ProtocolTuning,
    stats: Arc<Statistics>,
    pool: Arc<WorkerPool>,

    prev: NeighborLink,
    next: NeighborLink,
    prev_rx: mpsc::Receiver<Message>,
    next_rx: mpsc::Receiver<Message>,

    registry_tx: mpsc::Sender<Message>,
    registry_rx: mpsc::Receiver<Message>,

    local_tasks: Vec<Task>,
    overlay_counts: HashMap<PeerAddr, u64>,
    balanced_count: u64,
    is_migrating: bool,
    /// cleared to `false` on entering Executing; enforces the "monotonic
    /// progress" invariant (no migrations accepted once executing starts).
    accepting_migrations: bool,
}

#[allow(clippy::too_many_arguments)]
impl NodeController {
    pub fn new(
        self_addr: PeerAddr,
        overlay: OverlayConfig,
        tuning: ProtocolTuning,
        stats: Arc<Statistics>,
        pool: Arc<WorkerPool>,
        prev: NeighborLink,
        prev_rx: mpsc::Receiver<Message>,
        next: NeighborLink,
        next_rx: mpsc::Receiver<Message>,
        registry_tx: mpsc::Sender<Message>,
        registry_rx: mpsc::Receiver<Message>,
    ) -> Self {
        Self {
            self_addr,
            overlay,
            tuning,
            stats,
            pool,
            prev,
            next,
            prev_rx,
            next_rx,
            registry_tx,
            registry_rx,
            local_tasks: Vec::new(),
            overlay_counts: HashMap::new(),
            balanced_count: 0,
            is_migrating: false,
            accepting_migrations: true,
        }
    }

    /// Drives the node for as long as the registry keeps issuing rounds.
    /// Returns once the registry connection (or, in tests, the registry
    /// channel) closes.
    pub async fn run(&mut self) {
        loop {
            match self.next_inbound().await {
                Some(Inbound::Registry(Message::TaskInitiate { round })) => {
                    let snapshot = self.run_round(round).await;
                    tracing::info!(round, ?snapshot, "round complete");
                }
                Some(Inbound::Registry(other)) => {
                    tracing::warn!(?other, "unexpected registry message while idle");
                }
                Some(Inbound::Neighbor(side, msg)) => {
                    tracing::warn!(?side, ?msg, "unexpected neighbor message while idle");
                }
                None => {
                    tracing::info!("controller inbox closed, shutting down");
                    return;
                }
            }
        }
    }

    /// Runs one full round (`Generating -> ... -> Reporting`), drawing the
    /// task count uniformly from `[1, 1000]` as specified.
    pub async fn run_round(&mut self, round: u32) -> StatsSnapshot {
        let n = 1 + rand::thread_rng().gen_range(0..1000u64);
        let tasks = (0..n)
            .map(|_| {
                Task::new(
                    self.self_addr.host.clone(),
                    self.self_addr.port,
                    round,
                    rand::random(),
                )
            })
            .collect();
        self.run_round_with_tasks(tasks).await
    }

    /// Same as `run_round`, but with the generated set supplied directly
    /// instead of drawn at random. Lets tests reproduce specific skew
    /// scenarios (e.g. "node A generates exactly 1000 tasks") deterministically.
    pub async fn run_round_with_tasks(&mut self, tasks: Vec<Task>) -> StatsSnapshot {
        // Generating
        self.accepting_migrations = true;
        self.is_migrating = false;
        self.overlay_counts.clear();
        self.stats.add_generated(tasks.len() as u64);
        self.local_tasks = tasks;

        // Announcing
        self.announce_count().await;

        // Estimating + Balancing
        self.estimate_and_balance().await;

        // Executing
        self.execute_and_wait().await;

        // Reporting
        self.report().await
    }

    async fn estimate_and_balance(&mut self) {
        let needed = self.overlay.overlay_size - 1;
        while self.overlay_counts.len() < needed {
            match self.next_inbound().await {
                Some(inbound) => self.handle_inbound(inbound).await,
                None => {
                    tracing::warn!("inbox closed while estimating");
                    return;
                }
            }
        }
        self.balanced_count = self.compute_balanced_count();

        let mut tick = tokio::time::interval(self.tuning.balancing_tick);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // first tick fires immediately; consume it so the loop below controls pacing
        tick.tick().await;

        while !self.globally_balanced() {
            self.balancing_step().await;
            tokio::select! {
                _ = tick.tick() => {}
                inbound = self.next_inbound() => {
                    match inbound {
                        Some(inbound) => self.handle_inbound(inbound).await,
                        None => {
                            tracing::warn!("inbox closed while balancing");
                            return;
                        }
                    }
                }
            }
        }
    }

    async fn execute_and_wait(&mut self) {
        self.accepting_migrations = false;
        if self.local_tasks.is_empty() {
            // nothing to run this round (e.g. every local task migrated away
            // while balancing); the pool has no work queued so its latch
            // would never clear on its own.
            return;
        }
        self.pool.begin_round();
        self.pool.add_tasks(self.local_tasks.drain(..));
        self.pool.start();

        let pool = Arc::clone(&self.pool);
        let round_complete = pool.wait_round_complete();
        tokio::pin!(round_complete);
        loop {
            tokio::select! {
                _ = &mut round_complete => return,
                inbound = self.next_inbound() => {
                    match inbound {
                        Some(inbound) => self.handle_inbound(inbound).await,
                        None => {
                            tracing::warn!("inbox closed while executing");
                            return;
                        }
                    }
                }
            }
        }
    }

    async fn report(&mut self) -> StatsSnapshot {
        let _ = self
            .registry_tx
            .send(Message::TaskComplete {
                host: self.self_addr.host.clone(),
                port: self.self_addr.port,
            })
            .await;
        self.overlay_counts.clear();

        loop {
            match self.next_inbound().await {
                Some(Inbound::Registry(Message::PullTrafficSummary)) => break,
                Some(Inbound::Registry(other)) => {
                    tracing::warn!(?other, "unexpected registry message while reporting");
                }
                Some(Inbound::Neighbor(side, msg)) => self.handle_neighbor_message(side, msg).await,
                None => {
                    tracing::warn!("inbox closed while reporting");
                    break;
                }
            }
        }

        let snapshot = self.stats.take_snapshot();
        let _ = self
            .registry_tx
            .send(Message::TrafficSummary {
                host: self.self_addr.host.clone(),
                port: self.self_addr.port,
                generated: snapshot.generated,
                pushed: snapshot.pushed,
                pulled: snapshot.pulled,
                completed: snapshot.completed,
            })
            .await;
        snapshot
    }

    // -- balancing math --

    fn compute_balanced_count(&self) -> u64 {
        let total: u64 =
            self.local_tasks.len() as u64 + self.overlay_counts.values().sum::<u64>();
        (total as f64 / self.overlay.overlay_size as f64).ceil() as u64
    }

    fn tolerance(&self) -> u64 {
        std::cmp::max(1, (0.1 * self.balanced_count as f64).ceil() as u64)
    }

    fn globally_balanced(&self) -> bool {
        if self.overlay_counts.is_empty() {
            return true;
        }
        let tolerance = self.tolerance() as i64;
        let within = self
            .overlay_counts
            .values()
            .filter(|&&count| (count as i64 - self.balanced_count as i64).abs() <= tolerance)
            .count();
        let required =
            (self.tuning.balance_threshold * self.overlay_counts.len() as f64).ceil() as usize;
        within >= required
    }

    async fn balancing_step(&mut self) {
        let total = self.local_tasks.len() as u64;
        if total > self.balanced_count {
            for side in [NeighborSide::Prev, NeighborSide::Next] {
                if let Some(&count) = self.overlay_counts.get(self.neighbor_addr(side)) {
                    if count <= self.balanced_count {
                        self.send_to(side, Message::PushRequest { total }).await;
                    }
                }
            }
        } else {
            let deficit = (self.local_tasks.len() as i64 - self.balanced_count as i64).unsigned_abs();
            for side in [NeighborSide::Prev, NeighborSide::Next] {
                if let Some(&count) = self.overlay_counts.get(self.neighbor_addr(side)) {
                    if count >= self.balanced_count {
                        self.send_to(side, Message::CheckStatus { deficit }).await;
                    }
                }
            }
        }
    }

    // -- message handling --

    async fn next_inbound(&mut self) -> Option<Inbound> {
        tokio::select! {
            msg = self.prev_rx.recv() => msg.map(|m| Inbound::Neighbor(NeighborSide::Prev, m)),
            msg = self.next_rx.recv() => msg.map(|m| Inbound::Neighbor(NeighborSide::Next, m)),
            msg = self.registry_rx.recv() => msg.map(Inbound::Registry),
        }
    }

    async fn handle_inbound(&mut self, inbound: Inbound) {
        match inbound {
            Inbound::Neighbor(side, msg) => self.handle_neighbor_message(side, msg).await,
            Inbound::Registry(msg) => {
                tracing::warn!(?msg, "unexpected registry message mid-round");
            }
        }
    }

    async fn handle_neighbor_message(&mut self, side: NeighborSide, msg: Message) {
        match msg {
            Message::TasksCount { origin, count } => self.handle_tasks_count(origin, count).await,
            Message::CheckStatus { deficit } => self.handle_check_status(side, deficit).await,
            Message::PushRequest { total } => self.handle_push_request(side, total).await,
            Message::MigrateTasks { batch } => self.handle_migrate_tasks(side, batch).await,
            Message::MigrateResponse => {
                // idempotent: can only transition true -> false
                self.is_migrating = false;
            }
            Message::MigrateRejected { batch } => self.handle_migrate_rejected(batch).await,
            Message::StatusResponse => {
                tracing::trace!(?side, "status response, no-op");
            }
            Message::Hello { .. } => {
                tracing::trace!(?side, "late hello during round, ignoring");
            }
            other => {
                tracing::warn!(?side, ?other, "unexpected registry-only message from neighbor");
            }
        }
    }

    async fn handle_tasks_count(&mut self, origin: PeerAddr, count: u64) {
        if origin == self.self_addr {
            // the message has circled the ring exactly once; drop it
            return;
        }
        self.overlay_counts.insert(origin.clone(), count);
        self.send_to(NeighborSide::Next, Message::TasksCount { origin, count })
            .await;
    }

    async fn handle_check_status(&mut self, side: NeighborSide, _deficit: u64) {
        if !self.accepting_migrations {
            tracing::debug!(?side, "dropping CheckStatus: already executing");
            return;
        }
        if self.is_migrating {
            tracing::trace!(?side, "dropping CheckStatus: migration already in flight");
            return;
        }
        self.is_migrating = true;
        let batch_len = self.tuning.batch_size.min(self.local_tasks.len());
        let batch: Vec<Task> = self.local_tasks.drain(0..batch_len).collect();
        let pushed = batch.len() as u64;
        self.send_to(side, Message::MigrateTasks { batch }).await;
        self.stats.add_pushed(pushed);
        self.announce_count().await;
    }

    async fn handle_push_request(&mut self, side: NeighborSide, _total: u64) {
        if !self.accepting_migrations {
            tracing::debug!(?side, "dropping PushRequest: already executing");
            return;
        }
        let deficit = (self.local_tasks.len() as i64 - self.balanced_count as i64).unsigned_abs();
        self.send_to(side, Message::CheckStatus { deficit }).await;
    }

    async fn handle_migrate_tasks(&mut self, side: NeighborSide, batch: Vec<Task>) {
        if !self.accepting_migrations {
            tracing::debug!(
                ?side,
                batch_len = batch.len(),
                "rejecting MigrateTasks: already executing (monotonic progress), returning batch"
            );
            self.send_to(side, Message::MigrateRejected { batch }).await;
            return;
        }
        debug_assert!(batch.len() <= self.tuning.batch_size);
        let pulled = batch.len() as u64;
        self.local_tasks.extend(batch);
        self.stats.add_pulled(pulled);
        self.send_to(side, Message::MigrateResponse).await;
        self.announce_count().await;
    }

    /// A batch this node pushed out was bounced back because the receiver
    /// had already entered Executing. Keep the tasks locally rather than
    /// lose them, and back out the optimistic `pushed` count.
    async fn handle_migrate_rejected(&mut self, batch: Vec<Task>) {
        let returned = batch.len() as u64;
        self.local_tasks.extend(batch);
        self.stats.sub_pushed(returned);
        self.is_migrating = false;
        self.announce_count().await;
    }

    async fn announce_count(&mut self) {
        let msg = Message::TasksCount {
            origin: self.self_addr.clone(),
            count: self.local_tasks.len() as u64,
        };
        let _ = self.next.tx.send(msg).await;
    }

    fn neighbor_addr(&self, side: NeighborSide) -> &PeerAddr {
        match side {
            NeighborSide::Prev => &self.prev.addr,
            NeighborSide::Next => &self.next.addr,
        }
    }

    async fn send_to(&mut self, side: NeighborSide, msg: Message) {
        let link = match side {
            NeighborSide::Prev => &self.prev,
            NeighborSide::Next => &self.next,
        };
        let _ = link.tx.send(msg).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProtocolTuning;
    use std::time::Duration;

    /// Wires `n` controllers into a ring using plain in-memory channels,
    /// bypassing TCP entirely.
    fn build_ring(n: usize, pool_size: usize, tuning: ProtocolTuning) -> Vec<(NodeController, mpsc::Sender<Message>, mpsc::Receiver<Message>)> {
        let buf = 1024;
        let addrs: Vec<PeerAddr> = (0..n).map(|i| PeerAddr::new(format!("node-{i}"), 9000)).collect();

        // edge e: fwd[e] is e -> (e+1)%n ("next" traffic); bwd[e] is (e+1)%n -> e
        // ("prev"-directed traffic sent backward along the same logical link).
        let mut fwd_tx = Vec::with_capacity(n);
        let mut fwd_rx = Vec::with_capacity(n);
        let mut bwd_tx = Vec::with_capacity(n);
        let mut bwd_rx = Vec::with_capacity(n);
        for _ in 0..n {
            let (tx, rx) = mpsc::channel(buf);
            fwd_tx.push(tx);
            fwd_rx.push(Some(rx));
            let (tx, rx) = mpsc::channel(buf);
            bwd_tx.push(tx);
            bwd_rx.push(Some(rx));
        }

        let overlay = OverlayConfig::new(pool_size, n);
        let mut nodes = Vec::with_capacity(n);
        for i in 0..n {
            let prev_i = (i + n - 1) % n;
            let next_i = (i + 1) % n;

            let next = NeighborLink {
                addr: addrs[next_i].clone(),
                tx: fwd_tx[i].clone(),
            };
            let next_rx = fwd_rx[i].take().expect("fwd receiver taken twice");

            let prev = NeighborLink {
                addr: addrs[prev_i].clone(),
                tx: bwd_tx[prev_i].clone(),
            };
            let prev_rx = bwd_rx[i].take().expect("bwd receiver taken twice");

            let (registry_tx, registry_from_node_rx) = mpsc::channel(buf);
            let (registry_to_node_tx, registry_rx) = mpsc::channel(buf);

            let stats = Arc::new(Statistics::new());
            let pool = Arc::new(WorkerPool::new(pool_size, Arc::clone(&stats)));
            pool.start();

            let controller = NodeController::new(
                addrs[i].clone(),
                overlay,
                tuning,
                stats,
                pool,
                prev,
                prev_rx,
                next,
                next_rx,
                registry_tx,
                registry_rx,
            );
            nodes.push((controller, registry_to_node_tx, registry_from_node_rx));
        }
        nodes
    }

    fn fast_tuning() -> ProtocolTuning {
        ProtocolTuning {
            balancing_tick: Duration::from_millis(1),
            ..ProtocolTuning::default()
        }
    }

    async fn run_round_for_all(
        nodes: Vec<(NodeController, mpsc::Sender<Message>, mpsc::Receiver<Message>)>,
        generated_counts: Vec<u64>,
        round: u32,
    ) -> Vec<(StatsSnapshot, mpsc::Receiver<Message>)> {
        let mut handles = Vec::new();
        for ((mut controller, _registry_tx, registry_rx), count) in nodes.into_iter().zip(generated_counts) {
            handles.push(tokio::spawn(async move {
                let tasks = (0..count)
                    .map(|i| Task::new("origin", 0, round, i))
                    .collect();
                let snapshot = controller.run_round_with_tasks(tasks).await;
                (snapshot, registry_rx)
            }));
        }

        let mut results = Vec::with_capacity(handles.len());
        for handle in handles {
            results.push(handle.await.expect("node task should not panic"));
        }
        results
    }

    #[tokio::test(start_paused = true)]
    async fn two_node_trivial_ring_needs_no_migration() {
        let nodes = build_ring(2, 2, fast_tuning());
        let results = run_round_for_all(nodes, vec![100, 100], 1).await;

        let total_completed: u64 = results.iter().map(|(s, _)| s.completed).sum();
        assert_eq!(total_completed, 200);
        for (snapshot, _) in &results {
            assert_eq!(snapshot.pushed, 0);
            assert_eq!(snapshot.pulled, 0);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn two_node_skew_balances_within_tolerance() {
        let nodes = build_ring(2, 2, fast_tuning());
        let results = run_round_for_all(nodes, vec![1000, 10], 1).await;

        let total_completed: u64 = results.iter().map(|(s, _)| s.completed).sum();
        assert_eq!(total_completed, 1010);

        // mean = ceil(1010 / 2) = 505, tolerance = ceil(0.1 * 505) = 51
        // each node's completed count (== its final local share) should land
        // close to the mean
        for (snapshot, _) in &results {
            assert!(snapshot.completed >= 454 && snapshot.completed <= 556);
        }

        // pushed by the overloaded node must equal pulled by the underloaded one
        let total_pushed: u64 = results.iter().map(|(s, _)| s.pushed).sum();
        let total_pulled: u64 = results.iter().map(|(s, _)| s.pulled).sum();
        assert_eq!(total_pushed, total_pulled);
        assert!(total_pushed > 0, "skewed ring should trigger at least one migration");
    }

    #[tokio::test(start_paused = true)]
    async fn four_node_uniform_ring_needs_no_migration() {
        let nodes = build_ring(4, 2, fast_tuning());
        let results = run_round_for_all(nodes, vec![250, 250, 250, 250], 1).await;

        let total_completed: u64 = results.iter().map(|(s, _)| s.completed).sum();
        assert_eq!(total_completed, 1000);
        for (snapshot, _) in &results {
            assert_eq!(snapshot.pushed, 0);
            assert_eq!(snapshot.pulled, 0);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn four_node_skewed_ring_migrates_and_conserves_tasks() {
        let nodes = build_ring(4, 2, fast_tuning());
        let results = run_round_for_all(nodes, vec![1000, 10, 10, 10], 1).await;

        let total_completed: u64 = results.iter().map(|(s, _)| s.completed).sum();
        assert_eq!(total_completed, 1030);

        let total_pushed: u64 = results.iter().map(|(s, _)| s.pushed).sum();
        let total_pulled: u64 = results.iter().map(|(s, _)| s.pulled).sum();
        assert_eq!(total_pushed, total_pulled);
        assert!(total_pushed >= 20, "expected at least two migration hops' worth of tasks moved");
    }

    #[tokio::test(start_paused = true)]
    async fn three_node_dissemination_converges_without_self_count() {
        let nodes = build_ring(3, 2, fast_tuning());
        let results = run_round_for_all(nodes, vec![5, 7, 9], 1).await;
        assert_eq!(results.len(), 3);
        // balance bound + conservation are exercised by the other scenarios;
        // this one is specifically about dissemination, which is implicit in
        // every node reaching Executing at all (estimate_and_balance blocks
        // until `overlay_counts.len() == overlay_size - 1`), so reaching this
        // point already proves every node saw both peers' counts, and
        // `handle_tasks_count` never stores `self_addr` as a key.
        let total_completed: u64 = results.iter().map(|(s, _)| s.completed).sum();
        assert_eq!(total_completed, 21);
    }

    #[tokio::test]
    async fn duplicate_migrate_response_does_not_corrupt_state() {
        // directly exercise the handler: two MigrateResponse in a row must
        // leave `is_migrating` false, not panic or toggle back to true.
        let nodes = build_ring(2, 2, fast_tuning());
        let (mut controller, _rtx, _rrx) = nodes.into_iter().next().unwrap();
        controller.is_migrating = true;
        controller.handle_neighbor_message(NeighborSide::Next, Message::MigrateResponse).await;
        assert!(!controller.is_migrating);
        controller.handle_neighbor_message(NeighborSide::Next, Message::MigrateResponse).await;
        assert!(!controller.is_migrating);
    }

    #[tokio::test]
    async fn migrate_tasks_never_exceeds_batch_size() {
        let nodes = build_ring(2, 2, fast_tuning());
        let (mut controller, _rtx, _rrx) = nodes.into_iter().next().unwrap();
        controller.local_tasks = (0..25).map(|i| Task::new("n", 0, 1, i)).collect();
        controller.balanced_count = 0;
        controller
            .handle_neighbor_message(NeighborSide::Prev, Message::CheckStatus { deficit: 25 })
            .await;
        // the batch was sent over the channel, not retained locally; assert
        // indirectly via the remaining local queue length
        assert_eq!(controller.local_tasks.len(), 15);
    }

    #[tokio::test]
    async fn rejected_migration_returns_batch_instead_of_losing_it() {
        let nodes = build_ring(2, 2, fast_tuning());
        let (mut controller, _rtx, _rrx) = nodes.into_iter().next().unwrap();
        controller.stats.add_pushed(3);
        let batch: Vec<Task> = (0..3).map(|i| Task::new("n", 0, 1, i)).collect();
        controller.is_migrating = true;
        controller
            .handle_neighbor_message(NeighborSide::Next, Message::MigrateRejected { batch })
            .await;
        assert_eq!(controller.local_tasks.len(), 3);
        assert!(!controller.is_migrating);
        assert_eq!(controller.stats.take_snapshot().pushed, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn empty_local_set_still_reaches_reporting() {
        // a node that migrates its entire local set away during balancing
        // must still report, not block forever waiting on an empty pool.
        let nodes = build_ring(2, 2, fast_tuning());
        let (mut controller, _rtx, _rrx) = nodes.into_iter().next().unwrap();
        controller.accepting_migrations = true;
        controller.local_tasks.clear();
        tokio::time::timeout(std::time::Duration::from_secs(5), controller.execute_and_wait())
            .await
            .expect("execute_and_wait must not block on an empty task set");
    }
}
