//! Messaging node: overlay member, packet source, relay and sink.
//!
//! A node keeps one connection to the registry, one outbound connection per
//! finger, and accepts inbound connections from members that hold it as a
//! finger. Every connection delivers into the same [`EventHandler`] impl, so
//! handlers run concurrently and all node-wide state sits behind locks that
//! are never held across an `.await`.

use crate::addr::{ip_octets, socket_addr};
use crate::error::{fatal, OverlayError, OverlayResult, RoutingError};
use crate::routing::RoutingTable;
use crate::traffic::{RelayQueue, TrafficCounters};

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use ringmesh_types::{NodeConfig, NodeId};
use ringmesh_wire::{
    Connection, DataPacket, Deregister, EventHandler, Listener, Manifest, Message, Register,
    Status, TaskFinished, WireError,
};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, OnceLock, RwLock, Weak};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Lifecycle notifications published by a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeEvent {
    Registered(NodeId),
    RegistrationFailed(String),
    /// A manifest was applied; carries the number of fingers.
    OverlayReady(usize),
    SetupFailed(String),
    TaskSent { sent: i32 },
    Deregistered,
    DeregistrationFailed(String),
}

/// The routing state installed by the last manifest.
struct Overlay {
    table: RoutingTable,
    links: HashMap<NodeId, Connection>,
}

pub struct MessagingNode {
    me: Weak<MessagingNode>,
    listen_addr: SocketAddr,
    registry: OnceLock<Connection>,
    id: RwLock<Option<NodeId>>,
    overlay: RwLock<Option<Arc<Overlay>>>,
    counters: Mutex<TrafficCounters>,
    relay: RelayQueue,
    events: broadcast::Sender<NodeEvent>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl MessagingNode {
    /// Bind the peer listener, connect to the registry and request an id.
    ///
    /// Peers are accepted only once the registry connection is up, so a
    /// failed start leaves nothing running.
    pub async fn start(config: &NodeConfig) -> OverlayResult<Arc<Self>> {
        let listener = Listener::bind(config.listen_addr).await?;
        let listen_addr = listener.local_addr();
        let (events, _) = broadcast::channel(64);

        let node = Arc::new_cyclic(|me| Self {
            me: me.clone(),
            listen_addr,
            registry: OnceLock::new(),
            id: RwLock::new(None),
            overlay: RwLock::new(None),
            counters: Mutex::new(TrafficCounters::default()),
            relay: RelayQueue::new(),
            events,
            tasks: Mutex::new(Vec::new()),
        });

        let handler: Arc<dyn EventHandler> = node.clone();
        let registry =
            Connection::connect(config.registry_addr.as_str(), Arc::clone(&handler)).await?;
        info!(
            registry = %registry.peer_addr(),
            listen = %listen_addr,
            "Connected to registry"
        );
        let _ = node.registry.set(registry);

        let accept = listener.serve(handler);
        let relay = tokio::spawn(Arc::clone(&node).relay_loop());
        node.tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .extend([accept, relay]);

        if let Err(e) = node.register().await {
            node.shutdown();
            if let Some(registry) = node.registry.get() {
                let _ = registry.shutdown().await;
            }
            return Err(e);
        }
        Ok(node)
    }

    /// Subscribe to lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<NodeEvent> {
        self.events.subscribe()
    }

    /// The id assigned by the registry, if registered.
    pub fn id(&self) -> Option<NodeId> {
        *self.id.read().unwrap_or_else(|e| e.into_inner())
    }

    /// Address of the peer listener.
    pub fn listen_addr(&self) -> SocketAddr {
        self.listen_addr
    }

    /// Live counters of the current round, without resetting them.
    pub fn counters(&self) -> TrafficCounters {
        *self.counters.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Packets waiting in the relay queue.
    pub fn pending_relays(&self) -> usize {
        self.relay.len()
    }

    /// The routing table from the last manifest.
    pub fn routing_table(&self) -> Option<RoutingTable> {
        self.current_overlay().map(|o| o.table.clone())
    }

    /// Ask the registry to remove this node. The outcome arrives as a
    /// [`NodeEvent`].
    pub async fn deregister(&self) -> OverlayResult<()> {
        let id = self.id().ok_or(OverlayError::NotRegistered)?;
        let registry = self.registry_conn()?;
        let local = registry.local_addr();
        registry
            .send(&Message::Deregister(Deregister {
                ip: ip_octets(local.ip()),
                port: i32::from(local.port()),
                id: id.as_wire(),
            }))
            .await?;
        info!(node_id = %id, "Sent deregistration request");
        Ok(())
    }

    /// Stop the accept and relay tasks.
    pub fn shutdown(&self) {
        for task in self
            .tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
        {
            task.abort();
        }
    }

    async fn register(&self) -> OverlayResult<()> {
        let registry = self.registry_conn()?;
        registry
            .send(&Message::Register(Register {
                ip: ip_octets(registry.local_addr().ip()),
                port: i32::from(self.listen_addr.port()),
            }))
            .await?;
        debug!(listen = %self.listen_addr, "Sent registration request");
        Ok(())
    }

    fn registry_conn(&self) -> OverlayResult<&Connection> {
        self.registry.get().ok_or(OverlayError::RegistryUnavailable)
    }

    fn current_overlay(&self) -> Option<Arc<Overlay>> {
        self.overlay
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn publish(&self, event: NodeEvent) {
        let _ = self.events.send(event);
    }

    async fn dispatch(&self, conn: &Connection, msg: Message) -> OverlayResult<()> {
        match msg {
            Message::RegisterStatus(status) => {
                self.on_register_status(status);
                Ok(())
            }
            Message::DeregisterStatus(status) => {
                self.on_deregister_status(status).await;
                Ok(())
            }
            Message::Manifest(manifest) => self.on_manifest(conn, manifest).await,
            Message::TaskInitiate(task) => self.run_task(task.message_count).await,
            Message::DataPacket(packet) => {
                self.on_packet(packet);
                Ok(())
            }
            Message::TrafficSummaryRequest(_) => self.report_traffic(conn).await,
            other => {
                warn!(kind = other.kind(), peer = %conn.peer_addr(), "Unexpected message");
                Ok(())
            }
        }
    }

    fn on_register_status(&self, status: Status) {
        match NodeId::try_from(status.id) {
            Ok(id) => {
                *self.id.write().unwrap_or_else(|e| e.into_inner()) = Some(id);
                info!(node_id = %id, "{}", status.message);
                self.publish(NodeEvent::Registered(id));
            }
            Err(_) => {
                warn!(reason = %status.message, "Registration failed");
                self.publish(NodeEvent::RegistrationFailed(status.message));
            }
        }
    }

    async fn on_deregister_status(&self, status: Status) {
        if status.is_success() {
            *self.id.write().unwrap_or_else(|e| e.into_inner()) = None;
            let previous = self.overlay.write().unwrap_or_else(|e| e.into_inner()).take();
            if let Some(old) = previous {
                close_links(&old.links).await;
            }
            info!("{}", status.message);
            self.publish(NodeEvent::Deregistered);
        } else {
            warn!(reason = %status.message, "Deregistration failed");
            self.publish(NodeEvent::DeregistrationFailed(status.message));
        }
    }

    async fn on_manifest(&self, registry: &Connection, manifest: Manifest) -> OverlayResult<()> {
        let reply = match self.install_overlay(manifest).await {
            Ok((id, fingers)) => {
                info!(node_id = %id, fingers, "Overlay setup complete");
                self.publish(NodeEvent::OverlayReady(fingers));
                Status::success(
                    id.as_wire(),
                    format!("Overlay setup succeeded with {fingers} fingers"),
                )
            }
            Err(e) => {
                warn!(error = %e, "Overlay setup failed");
                self.publish(NodeEvent::SetupFailed(e.to_string()));
                Status::failure(format!("Overlay setup failed: {e}"))
            }
        };
        registry.send(&Message::SetupStatus(reply)).await?;
        Ok(())
    }

    /// Build the routing table and open one connection per distinct finger.
    async fn install_overlay(&self, manifest: Manifest) -> OverlayResult<(NodeId, usize)> {
        let id = self.id().ok_or(OverlayError::NotRegistered)?;
        let handler: Arc<dyn EventHandler> = self
            .me
            .upgrade()
            .ok_or(OverlayError::RegistryUnavailable)?;

        let mut links = HashMap::new();
        let table = match Self::open_links(id, &manifest, handler, &mut links).await {
            Ok(table) => table,
            Err(e) => {
                close_links(&links).await;
                return Err(e);
            }
        };
        let count = table.fingers().len();

        let previous = self
            .overlay
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .replace(Arc::new(Overlay { table, links }));
        if let Some(old) = previous {
            close_links(&old.links).await;
        }
        Ok((id, count))
    }

    /// Connect to every distinct finger other than `id` and build the table.
    /// Links opened before a failure are left in `links` for the caller.
    async fn open_links(
        id: NodeId,
        manifest: &Manifest,
        handler: Arc<dyn EventHandler>,
        links: &mut HashMap<NodeId, Connection>,
    ) -> OverlayResult<RoutingTable> {
        let mut fingers = Vec::with_capacity(manifest.fingers.len());
        for entry in &manifest.fingers {
            let finger =
                NodeId::try_from(entry.id).map_err(|_| OverlayError::BadNodeId(entry.id))?;
            fingers.push(finger);
            if finger == id || links.contains_key(&finger) {
                continue;
            }
            let addr = socket_addr(&entry.ip, entry.port).ok_or(WireError::Malformed {
                field: "finger",
                reason: format!("unusable address for node {finger}"),
            })?;
            let link = Connection::connect(addr, Arc::clone(&handler)).await?;
            debug!(node_id = %id, finger = %finger, addr = %addr, "Connected to finger");
            links.insert(finger, link);
        }

        let ring = manifest
            .members
            .iter()
            .map(|raw| NodeId::try_from(*raw).map_err(|_| OverlayError::BadNodeId(*raw)))
            .collect::<OverlayResult<Vec<_>>>()?;
        Ok(RoutingTable::new(id, fingers, ring)?)
    }

    /// Send `count` packets to random other members, then report completion.
    async fn run_task(&self, count: i32) -> OverlayResult<()> {
        let id = self.id().ok_or(OverlayError::NotRegistered)?;
        let Some(overlay) = self.current_overlay() else {
            fatal(&RoutingError::EmptyRing(id));
        };
        let others: Vec<NodeId> = overlay.table.others().collect();
        let mut rng = StdRng::from_entropy();

        info!(node_id = %id, count, "Starting task round");
        let mut sent = 0;
        for _ in 0..count.max(0) {
            let Some(&dest) = others.choose(&mut rng) else {
                break;
            };
            let packet = DataPacket {
                dest: dest.as_wire(),
                src: id.as_wire(),
                payload: rng.gen(),
                trace: vec![id.as_wire()],
            };
            let payload = packet.payload;
            if self.forward(&overlay, dest, packet).await {
                self.counters
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .record_sent(payload);
                sent += 1;
            }
        }

        let registry = self.registry_conn()?;
        let local = registry.local_addr();
        registry
            .send(&Message::TaskFinished(TaskFinished {
                ip: ip_octets(local.ip()),
                port: i32::from(local.port()),
                id: id.as_wire(),
            }))
            .await?;
        info!(node_id = %id, sent, "Task round finished");
        self.publish(NodeEvent::TaskSent { sent });
        Ok(())
    }

    fn on_packet(&self, mut packet: DataPacket) {
        let Some(id) = self.id() else {
            warn!(dest = packet.dest, "Packet received while unregistered, dropping");
            return;
        };
        if packet.dest == id.as_wire() {
            self.counters
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .record_received(packet.payload);
            debug!(node_id = %id, src = packet.src, hops = packet.trace.len(), "Packet delivered");
        } else {
            packet.trace.push(id.as_wire());
            self.relay.push(packet);
        }
    }

    async fn report_traffic(&self, registry: &Connection) -> OverlayResult<()> {
        let id = self.id().ok_or(OverlayError::NotRegistered)?;
        let (snapshot, dropped) = {
            let mut counters = self.counters.lock().unwrap_or_else(|e| e.into_inner());
            (counters.take(), self.relay.clear())
        };
        if dropped > 0 {
            warn!(node_id = %id, dropped, "Relay queue not empty at summary time");
        }
        info!(node_id = %id, counters = %snapshot, "Reporting traffic summary");
        registry
            .send(&Message::TrafficSummary(snapshot.to_summary(id)))
            .await?;
        Ok(())
    }

    /// Resolve the next hop toward `dest` and send. Returns whether it was sent.
    async fn forward(&self, overlay: &Overlay, dest: NodeId, packet: DataPacket) -> bool {
        let hop = match overlay.table.next_hop(dest) {
            Ok(hop) => hop,
            Err(e) => fatal(&e),
        };
        let Some(link) = overlay.links.get(&hop) else {
            warn!(dest = %dest, hop = %hop, "No connection to next hop, dropping packet");
            return false;
        };
        match link.send(&Message::DataPacket(packet)).await {
            Ok(()) => true,
            Err(e) => {
                warn!(dest = %dest, hop = %hop, error = %e, "Failed to forward packet");
                false
            }
        }
    }

    async fn relay_loop(self: Arc<Self>) {
        loop {
            let packet = self.relay.pop().await;
            let Some(overlay) = self.current_overlay() else {
                warn!(dest = packet.dest, "No overlay installed, dropping relay");
                continue;
            };
            let Ok(dest) = NodeId::try_from(packet.dest) else {
                warn!(dest = packet.dest, "Invalid destination, dropping relay");
                continue;
            };
            if self.forward(&overlay, dest, packet).await {
                self.counters
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .record_relayed();
            }
        }
    }
}

async fn close_links(links: &HashMap<NodeId, Connection>) {
    for (finger, link) in links {
        if let Err(e) = link.shutdown().await {
            debug!(finger = %finger, error = %e, "Finger link already closed");
        }
    }
}

#[async_trait]
impl EventHandler for MessagingNode {
    async fn on_event(&self, conn: &Connection, msg: Message) {
        let kind = msg.kind();
        if let Err(e) = self.dispatch(conn, msg).await {
            warn!(kind, peer = %conn.peer_addr(), error = %e, "Failed to handle message");
        }
    }

    async fn on_disconnect(&self, conn: &Connection, reason: &WireError) {
        let is_registry = self
            .registry
            .get()
            .is_some_and(|r| r.id() == conn.id());
        if is_registry {
            warn!(reason = %reason, "Lost connection to registry");
        } else {
            debug!(peer = %conn.peer_addr(), reason = %reason, "Peer connection ended");
        }
    }
}
