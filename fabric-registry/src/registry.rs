use std::collections::{HashMap, HashSet};

use color_eyre::eyre::Result;
use fabric_core::{Message, OverlayConfig, PeerAddr, RegisterStatus};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

/// A registered node's address and the channel used to push messages onto
/// its connection's writer task.
struct NodeSlot {
    addr: PeerAddr,
    tx: mpsc::Sender<Message>,
}

enum Event {
    Connected { addr: PeerAddr, tx: mpsc::Sender<Message> },
    Message(PeerAddr, Message),
    Disconnected(PeerAddr),
}

#[derive(Debug, Default, Clone, Copy)]
struct Tally {
    generated: u64,
    pushed: u64,
    pulled: u64,
    completed: u64,
}

/// The overlay's single coordinator: assigns ring neighbors once every node
/// has registered, then drives rounds by broadcasting `TaskInitiate` and
/// collecting `TaskComplete`/`TrafficSummary` from every node before moving
/// on. Like `NodeController`, it is the sole consumer of every event that
/// can mutate its state, so it needs no locks.
pub struct Registry {
    overlay: OverlayConfig,
    rounds: u32,
    nodes: Vec<NodeSlot>,
    round: u32,
    pending_complete: HashSet<PeerAddr>,
    summaries: HashMap<PeerAddr, Tally>,
    event_tx: mpsc::Sender<Event>,
    event_rx: mpsc::Receiver<Event>,
}

impl Registry {
    pub fn new(overlay: OverlayConfig, rounds: u32) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);
        Self {
            overlay,
            rounds,
            nodes: Vec::new(),
            round: 0,
            pending_complete: HashSet::new(),
            summaries: HashMap::new(),
            event_tx,
            event_rx,
        }
    }

    /// Accepts connections and drives rounds until `rounds` rounds have
    /// completed traffic-summary collection.
    pub async fn run(mut self, listener: TcpListener) -> Result<()> {
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            tracing::debug!(%peer, "accepted connection");
                            let event_tx = self.event_tx.clone();
                            tokio::spawn(handle_connection(stream, event_tx));
                        }
                        Err(e) => tracing::warn!(error = ?e, "accept failed"),
                    }
                }
                Some(event) = self.event_rx.recv() => {
                    if self.handle_event(event).await {
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Returns `true` once the requested number of rounds have finished.
    async fn handle_event(&mut self, event: Event) -> bool {
        match event {
            Event::Connected { addr, tx } => self.on_connected(addr, tx).await,
            Event::Message(addr, msg) => return self.on_message(addr, msg).await,
            Event::Disconnected(addr) => {
                tracing::warn!(%addr, "node disconnected");
            }
        }
        false
    }

    async fn on_connected(&mut self, addr: PeerAddr, tx: mpsc::Sender<Message>) {
        if self.nodes.len() >= self.overlay.overlay_size {
            let _ = tx
                .send(Message::RegisterResponse {
                    status: RegisterStatus::Rejected,
                    info: "overlay already full".into(),
                })
                .await;
            return;
        }
        let _ = tx
            .send(Message::RegisterResponse {
                status: RegisterStatus::Ok,
                info: format!("registered as node {}", self.nodes.len()),
            })
            .await;
        self.nodes.push(NodeSlot { addr, tx });
        tracing::info!(registered = self.nodes.len(), needed = self.overlay.overlay_size, "node registered");

        if self.nodes.len() == self.overlay.overlay_size {
            self.form_overlay().await;
        }
    }

    async fn form_overlay(&mut self) {
        tracing::info!("overlay full, assigning ring neighbors");
        let n = self.nodes.len();
        for i in 0..n {
            let prev = self.nodes[(i + n - 1) % n].addr.clone();
            let next = self.nodes[(i + 1) % n].addr.clone();
            let msg = Message::MessagingNodesList {
                neighbors: vec![prev, next],
                pool_size: self.overlay.pool_size,
                overlay_size: self.overlay.overlay_size,
            };
            let _ = self.nodes[i].tx.send(msg).await;
        }
        self.round = 1;
        tracing::info!(round = self.round, "starting round");
        self.broadcast(Message::TaskInitiate { round: self.round }).await;
    }

    /// Handles a message from a node. Returns `true` if the registry should
    /// now shut down (the requested rounds have all completed).
    async fn on_message(&mut self, addr: PeerAddr, msg: Message) -> bool {
        match msg {
            Message::TaskComplete { .. } => {
                self.pending_complete.insert(addr);
                if self.pending_complete.len() == self.overlay.overlay_size {
                    self.pending_complete.clear();
                    tracing::info!(round = self.round, "all nodes finished executing, pulling summaries");
                    self.broadcast(Message::PullTrafficSummary).await;
                }
            }
            Message::TrafficSummary {
                generated,
                pushed,
                pulled,
                completed,
                ..
            } => {
                self.summaries.insert(
                    addr,
                    Tally {
                        generated,
                        pushed,
                        pulled,
                        completed,
                    },
                );
                if self.summaries.len() == self.overlay.overlay_size {
                    self.log_round_summary();
                    self.summaries.clear();
                    if self.round >= self.rounds {
                        tracing::info!(rounds = self.rounds, "all requested rounds complete");
                        return true;
                    }
                    self.round += 1;
                    tracing::info!(round = self.round, "starting round");
                    self.broadcast(Message::TaskInitiate { round: self.round }).await;
                }
            }
            other => tracing::warn!(%addr, ?other, "unexpected message from node"),
        }
        false
    }

    fn log_round_summary(&self) {
        let mut total = Tally::default();
        for tally in self.summaries.values() {
            total.generated += tally.generated;
            total.pushed += tally.pushed;
            total.pulled += tally.pulled;
            total.completed += tally.completed;
        }
        let mean = total.generated as f64 / self.overlay.overlay_size as f64;
        tracing::info!(
            round = self.round,
            generated = total.generated,
            pushed = total.pushed,
            pulled = total.pulled,
            completed = total.completed,
            mean_per_node = mean,
            "round traffic summary"
        );
    }

    async fn broadcast(&self, msg: Message) {
        for node in &self.nodes {
            let _ = node.tx.send(msg.clone()).await;
        }
    }
}

async fn handle_connection(stream: TcpStream, event_tx: mpsc::Sender<Event>) {
    let (mut reader, mut writer) = fabric_core::Connection::new(stream).split();

    let (host, port) = match reader.recv().await {
        Some(Message::RegisterRequest { host, port }) => (host, port),
        Some(other) => {
            tracing::warn!(?other, "first message on connection was not a registration, dropping");
            return;
        }
        None => return,
    };
    let addr = PeerAddr::new(host, port);

    let (tx, mut rx) = mpsc::channel(256);
    if event_tx.send(Event::Connected { addr: addr.clone(), tx }).await.is_err() {
        return;
    }

    let write_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if writer.send(&msg).await.is_err() {
                break;
            }
        }
    });

    loop {
        match reader.recv().await {
            Some(msg) => {
                if event_tx.send(Event::Message(addr.clone(), msg)).await.is_err() {
                    break;
                }
            }
            None => break,
        }
    }
    let _ = event_tx.send(Event::Disconnected(addr)).await;
    write_task.abort();
}
