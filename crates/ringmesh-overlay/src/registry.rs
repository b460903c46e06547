//! Registry: membership authority and round coordinator.
//!
//! Accepted connections wait in an unregistered pool keyed by peer address
//! until they register. Registered members are keyed by id. Setup, task and
//! summary rounds complete by counting asynchronous reports against the
//! current member count; nothing blocks waiting for a reply.

use crate::addr::{ip_octets, parse_ip, parse_port, same_host, socket_addr};
use crate::error::{OverlayError, OverlayResult};
use crate::id_pool::IdAllocator;
use crate::stats::{StatisticsCollector, TrafficReport};
use crate::topology::Topology;

use async_trait::async_trait;
use ringmesh_types::{NodeId, RegistryConfig};
use ringmesh_wire::{
    Connection, Deregister, EventHandler, FingerEntry, Listener, Manifest, Message, Register,
    Status, TaskFinished, TaskInitiate, TrafficSummary, TrafficSummaryRequest, WireError,
};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Lifecycle notifications published by the registry.
#[derive(Debug, Clone)]
pub enum RegistryEvent {
    Registered { id: NodeId, addr: SocketAddr },
    Deregistered { id: NodeId },
    /// Every member answered its manifest; `failed` of them reported an error.
    OverlayReady { members: usize, failed: usize },
    SetupFailed { reason: String },
    /// Every member reported task completion; summaries follow the settle delay.
    TaskRoundFinished { members: usize },
    TrafficReport(TrafficReport),
}

/// A registered member as shown to operators.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberInfo {
    pub id: NodeId,
    pub addr: SocketAddr,
    pub listen_port: u16,
}

impl fmt::Display for MemberInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Node ID: {}, IP: {}, Port: {}",
            self.id,
            self.addr.ip(),
            self.listen_port
        )
    }
}

struct Member {
    conn: Connection,
    listen_port: u16,
}

struct RegistryState {
    unregistered: HashMap<SocketAddr, Connection>,
    members: BTreeMap<NodeId, Member>,
    ids: IdAllocator,
    topology: Option<Topology>,
    setup_acks: usize,
    setup_failures: usize,
    finished: usize,
    stats: StatisticsCollector,
}

impl RegistryState {
    fn member_conns(&self) -> Vec<Connection> {
        self.members.values().map(|m| m.conn.clone()).collect()
    }
}

pub struct Registry {
    me: Weak<Registry>,
    config: RegistryConfig,
    local_addr: SocketAddr,
    state: Mutex<RegistryState>,
    events: broadcast::Sender<RegistryEvent>,
    accept: Mutex<Option<JoinHandle<()>>>,
}

impl Registry {
    /// Validate the configuration, bind the listener and start accepting.
    pub async fn start(config: RegistryConfig) -> OverlayResult<Arc<Self>> {
        config.validate()?;
        let listener = Listener::bind(config.listen_addr).await?;
        let local_addr = listener.local_addr();
        let (events, _) = broadcast::channel(256);
        let ids = IdAllocator::new(config.id_space, config.id_retry_limit);

        let registry = Arc::new_cyclic(|me| Self {
            me: me.clone(),
            config,
            local_addr,
            state: Mutex::new(RegistryState {
                unregistered: HashMap::new(),
                members: BTreeMap::new(),
                ids,
                topology: None,
                setup_acks: 0,
                setup_failures: 0,
                finished: 0,
                stats: StatisticsCollector::new(),
            }),
            events,
            accept: Mutex::new(None),
        });

        let handler: Arc<dyn EventHandler> = registry.clone();
        let accept = listener.serve(handler);
        *registry.accept.lock().unwrap_or_else(|e| e.into_inner()) = Some(accept);
        info!(addr = %local_addr, "Registry started");
        Ok(registry)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.events.subscribe()
    }

    /// Stop accepting new connections.
    pub fn shutdown(&self) {
        if let Some(task) = self.accept.lock().unwrap_or_else(|e| e.into_inner()).take() {
            task.abort();
        }
    }

    /// Registered members in id order.
    pub fn members(&self) -> Vec<MemberInfo> {
        let state = self.lock();
        state
            .members
            .iter()
            .map(|(id, m)| MemberInfo {
                id: *id,
                addr: m.conn.peer_addr(),
                listen_port: m.listen_port,
            })
            .collect()
    }

    /// The overlay from the last successful `generate_overlay`, unless
    /// membership changed since.
    pub fn topology(&self) -> Option<Topology> {
        self.lock().topology.clone()
    }

    /// Compute fingers for every member and push each its manifest.
    pub async fn generate_overlay(&self, finger_count: u8) -> OverlayResult<Topology> {
        let max = self.config.max_finger_count;
        if finger_count == 0 || finger_count > max {
            return Err(OverlayError::InvalidFingerCount {
                requested: finger_count,
                max,
            });
        }

        let (topology, pushes) = {
            let mut state = self.lock();
            let topology = Topology::build(state.members.keys().copied(), finger_count)?;
            let members: Vec<i32> = topology.ring().iter().map(|id| id.as_wire()).collect();
            let mut pushes = Vec::with_capacity(topology.len());
            for (id, fingers) in topology.iter() {
                let fingers = fingers
                    .iter()
                    .filter_map(|f| state.members.get(f).map(|m| (f, m)))
                    .map(|(f, m)| FingerEntry {
                        id: f.as_wire(),
                        ip: ip_octets(m.conn.peer_addr().ip()),
                        port: i32::from(m.listen_port),
                    })
                    .collect();
                if let Some(member) = state.members.get(&id) {
                    let manifest = Manifest {
                        fingers,
                        members: members.clone(),
                    };
                    pushes.push((id, member.conn.clone(), manifest));
                }
            }
            state.topology = Some(topology.clone());
            state.setup_acks = 0;
            state.setup_failures = 0;
            (topology, pushes)
        };

        info!(
            members = topology.len(),
            fingers = finger_count,
            "Pushing overlay manifests"
        );
        for (id, conn, manifest) in pushes {
            if let Err(e) = conn.send(&Message::Manifest(manifest)).await {
                warn!(node_id = %id, error = %e, "Failed to send manifest");
            }
        }
        Ok(topology)
    }

    /// Tell every member to send `message_count` packets.
    pub async fn initiate_task(&self, message_count: i32) -> OverlayResult<()> {
        let conns = {
            let mut state = self.lock();
            if state.topology.is_none() {
                return Err(OverlayError::OverlayNotBuilt);
            }
            state.finished = 0;
            state.stats.clear();
            state.member_conns()
        };
        info!(members = conns.len(), message_count, "Initiating task round");
        let msg = Message::TaskInitiate(TaskInitiate { message_count });
        for conn in conns {
            if let Err(e) = conn.send(&msg).await {
                warn!(peer = %conn.peer_addr(), error = %e, "Failed to send task initiate");
            }
        }
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn publish(&self, event: RegistryEvent) {
        let _ = self.events.send(event);
    }

    async fn dispatch(&self, conn: &Connection, msg: Message) -> OverlayResult<()> {
        match msg {
            Message::Register(req) => {
                let (status, event) = self.register(conn, &req);
                conn.send(&Message::RegisterStatus(status)).await?;
                if let Some(event) = event {
                    self.publish(event);
                }
            }
            Message::Deregister(req) => {
                let (status, event) = self.deregister(conn, &req);
                conn.send(&Message::DeregisterStatus(status)).await?;
                if let Some(event) = event {
                    self.publish(event);
                }
            }
            Message::SetupStatus(status) => self.on_setup_status(status),
            Message::TaskFinished(report) => self.on_task_finished(&report),
            Message::TrafficSummary(summary) => self.on_traffic_summary(&summary)?,
            other => {
                warn!(kind = other.kind(), peer = %conn.peer_addr(), "Unexpected message");
            }
        }
        Ok(())
    }

    /// Admit a pooled connection. The event is published once the reply is
    /// on the wire, so a manifest can never overtake the status.
    fn register(&self, conn: &Connection, req: &Register) -> (Status, Option<RegistryEvent>) {
        let peer = conn.peer_addr();
        let mut guard = self.lock();
        let state = &mut *guard;

        if state.members.values().any(|m| m.conn.id() == conn.id()) {
            warn!(peer = %peer, "Duplicate registration");
            return (Status::failure("Error: valid connection already exists"), None);
        }
        let declared_matches = parse_ip(&req.ip).is_some_and(|ip| same_host(ip, peer.ip()));
        if !declared_matches || !state.unregistered.contains_key(&peer) {
            warn!(peer = %peer, "Registration from unknown address");
            let reason = "Error: IP address given does not match any connections";
            return (Status::failure(reason), None);
        }
        let Some(listen_port) = parse_port(req.port) else {
            return (Status::failure(format!("Error: invalid port {}", req.port)), None);
        };
        let Some(id) = state.ids.allocate(|id| state.members.contains_key(&id)) else {
            warn!(peer = %peer, "Id space exhausted");
            return (Status::failure("All keys taken"), None);
        };

        state.unregistered.remove(&peer);
        state.members.insert(
            id,
            Member {
                conn: conn.clone(),
                listen_port,
            },
        );
        state.topology = None;
        let count = state.members.len();
        drop(guard);

        let message = format!(
            "Registration request successful. The number of messaging nodes currently constituting the overlay is ({count})"
        );
        info!(node_id = %id, peer = %peer, listen_port, "{}", message);
        (
            Status::success(id.as_wire(), message),
            Some(RegistryEvent::Registered { id, addr: peer }),
        )
    }

    fn deregister(&self, conn: &Connection, req: &Deregister) -> (Status, Option<RegistryEvent>) {
        let claimed = socket_addr(&req.ip, req.port);
        let mut state = self.lock();

        let Some(id) = NodeId::try_from(req.id)
            .ok()
            .filter(|id| state.members.contains_key(id))
        else {
            warn!(id = req.id, peer = %conn.peer_addr(), "Deregistration of unknown node");
            return (Status::failure("Node not registered with overlay"), None);
        };

        let stored = state
            .members
            .get(&id)
            .map(|m| m.conn.peer_addr());
        let matches = matches!(
            (claimed, stored),
            (Some(c), Some(s)) if same_host(c.ip(), s.ip()) && c.port() == s.port()
        );
        if !matches {
            warn!(node_id = %id, peer = %conn.peer_addr(), "Deregistration address mismatch");
            let reason = "Node address does not align with submitted address";
            return (Status::failure(reason), None);
        }

        if let Some(member) = state.members.remove(&id) {
            state
                .unregistered
                .insert(member.conn.peer_addr(), member.conn);
        }
        state.topology = None;
        let count = state.members.len();
        drop(state);

        info!(node_id = %id, remaining = count, "Node deregistered");
        let message = format!("Node has been deregistered. Number of nodes in overlay {count}");
        (
            Status::success(id.as_wire(), message),
            Some(RegistryEvent::Deregistered { id }),
        )
    }

    /// Count a setup reply. Failed replies still count toward the round.
    fn on_setup_status(&self, status: Status) {
        let failed = !status.is_success();
        let ready = {
            let mut state = self.lock();
            state.setup_acks += 1;
            if failed {
                state.setup_failures += 1;
            }
            (state.setup_acks == state.members.len())
                .then_some((state.members.len(), state.setup_failures))
        };
        if failed {
            warn!(reason = %status.message, "Overlay setup failed");
            self.publish(RegistryEvent::SetupFailed {
                reason: status.message,
            });
        } else {
            debug!(node_id = status.id, "Overlay setup acknowledged");
        }
        if let Some((members, failed)) = ready {
            if failed > 0 {
                warn!(members, failed, "All members answered, some failed setup");
            }
            info!(members, "Registry is ready to initiate tasks");
            self.publish(RegistryEvent::OverlayReady { members, failed });
        }
    }

    fn on_task_finished(&self, report: &TaskFinished) {
        let done = {
            let mut state = self.lock();
            state.finished += 1;
            info!(
                node_id = report.id,
                finished = state.finished,
                "Node reports task finished"
            );
            if state.finished >= state.members.len() {
                state.finished = 0;
                Some(state.members.len())
            } else {
                None
            }
        };
        let Some(members) = done else {
            return;
        };

        self.publish(RegistryEvent::TaskRoundFinished { members });
        let Some(registry) = self.me.upgrade() else {
            return;
        };
        let delay = self.config.settle_delay();
        debug!(?delay, "Waiting for relays to drain");
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            registry.request_summaries().await;
        });
    }

    async fn request_summaries(&self) {
        let conns = self.lock().member_conns();
        info!(members = conns.len(), "Requesting traffic summaries");
        let msg = Message::TrafficSummaryRequest(TrafficSummaryRequest {});
        for conn in conns {
            if let Err(e) = conn.send(&msg).await {
                warn!(peer = %conn.peer_addr(), error = %e, "Failed to request traffic summary");
            }
        }
    }

    fn on_traffic_summary(&self, summary: &TrafficSummary) -> OverlayResult<()> {
        let id = NodeId::try_from(summary.id).map_err(|_| OverlayError::BadNodeId(summary.id))?;
        let report = {
            let mut state = self.lock();
            state.stats.record(id, summary);
            if state.stats.len() >= state.members.len() {
                Some(state.stats.finish())
            } else {
                None
            }
        };
        let Some(report) = report else {
            return Ok(());
        };

        if !report.is_lossless() {
            warn!(
                sent = report.totals.sent,
                received = report.totals.received,
                "Packet loss detected in traffic round"
            );
        }
        info!(
            nodes = report.rows.len(),
            sent = report.totals.sent,
            received = report.totals.received,
            relayed = report.totals.relayed,
            "Traffic round complete"
        );
        self.publish(RegistryEvent::TrafficReport(report));
        Ok(())
    }
}

#[async_trait]
impl EventHandler for Registry {
    async fn on_connect(&self, conn: &Connection) {
        debug!(peer = %conn.peer_addr(), "Connection pending registration");
        self.lock()
            .unregistered
            .insert(conn.peer_addr(), conn.clone());
    }

    async fn on_event(&self, conn: &Connection, msg: Message) {
        let kind = msg.kind();
        if let Err(e) = self.dispatch(conn, msg).await {
            warn!(kind, peer = %conn.peer_addr(), error = %e, "Failed to handle message");
        }
    }

    async fn on_disconnect(&self, conn: &Connection, reason: &WireError) {
        let mut state = self.lock();
        let pooled = state
            .unregistered
            .get(&conn.peer_addr())
            .is_some_and(|c| c.id() == conn.id());
        if pooled {
            state.unregistered.remove(&conn.peer_addr());
        }
        let member = state
            .members
            .iter()
            .find(|(_, m)| m.conn.id() == conn.id())
            .map(|(id, _)| *id);
        drop(state);
        match member {
            Some(id) => warn!(node_id = %id, reason = %reason, "Lost connection to member"),
            None => debug!(peer = %conn.peer_addr(), reason = %reason, "Connection ended"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::{MessagingNode, NodeEvent};
    use ringmesh_types::NodeConfig;
    use std::time::Duration;
    use tokio::sync::mpsc;

    /// A raw client that records every message the registry sends it.
    struct RawClient {
        tx: mpsc::UnboundedSender<Message>,
    }

    #[async_trait]
    impl EventHandler for RawClient {
        async fn on_event(&self, _conn: &Connection, msg: Message) {
            let _ = self.tx.send(msg);
        }
    }

    fn config(id_space: u32, settle_delay_ms: u64) -> RegistryConfig {
        RegistryConfig {
            listen_addr: "127.0.0.1:0".parse().unwrap(),
            id_space,
            id_retry_limit: 128,
            max_finger_count: 5,
            settle_delay_ms,
        }
    }

    async fn client(registry: &Registry) -> (Connection, mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let conn = Connection::connect(registry.local_addr(), Arc::new(RawClient { tx }))
            .await
            .unwrap();
        (conn, rx)
    }

    fn register_msg(port: i32) -> Message {
        Message::Register(Register {
            ip: vec![127, 0, 0, 1],
            port,
        })
    }

    async fn status(rx: &mut mpsc::UnboundedReceiver<Message>) -> Status {
        let msg = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out")
            .expect("channel closed");
        match msg {
            Message::RegisterStatus(s) | Message::DeregisterStatus(s) => s,
            other => panic!("Expected a status, got {other:?}"),
        }
    }

    async fn wait_for<T>(
        rx: &mut broadcast::Receiver<RegistryEvent>,
        mut pick: impl FnMut(RegistryEvent) -> Option<T>,
    ) -> T {
        tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                let event = rx.recv().await.expect("event channel closed");
                if let Some(found) = pick(event) {
                    return found;
                }
            }
        })
        .await
        .expect("timed out waiting for registry event")
    }

    #[tokio::test]
    async fn test_double_registration_fails() {
        let registry = Registry::start(config(128, 0)).await.unwrap();
        let (conn, mut rx) = client(&registry).await;

        conn.send(&register_msg(9000)).await.unwrap();
        let first = status(&mut rx).await;
        assert!(first.is_success());
        assert!((0..128).contains(&first.id));

        conn.send(&register_msg(9000)).await.unwrap();
        let second = status(&mut rx).await;
        assert_eq!(second.id, -1);
        assert_eq!(second.message, "Error: valid connection already exists");

        let members = registry.members();
        assert_eq!(members.len(), 1);
        assert_eq!(members[0].id.as_wire(), first.id);
        assert_eq!(members[0].listen_port, 9000);
    }

    #[tokio::test]
    async fn test_declared_address_must_match() {
        let registry = Registry::start(config(128, 0)).await.unwrap();
        let (conn, mut rx) = client(&registry).await;
        conn.send(&Message::Register(Register {
            ip: vec![10, 9, 8, 7],
            port: 9000,
        }))
        .await
        .unwrap();
        assert!(!status(&mut rx).await.is_success());
        assert!(registry.members().is_empty());
    }

    #[tokio::test]
    async fn test_id_space_exhaustion() {
        let registry = Registry::start(config(2, 0)).await.unwrap();
        let mut ids = Vec::new();
        let mut conns = Vec::new();
        for _ in 0..2 {
            let (conn, mut rx) = client(&registry).await;
            conn.send(&register_msg(1)).await.unwrap();
            ids.push(status(&mut rx).await.id);
            conns.push(conn);
        }
        ids.sort_unstable();
        assert_eq!(ids, vec![0, 1]);

        let (conn, mut rx) = client(&registry).await;
        conn.send(&register_msg(1)).await.unwrap();
        let failed = status(&mut rx).await;
        assert_eq!(failed.id, -1);
        assert_eq!(failed.message, "All keys taken");
    }

    #[tokio::test]
    async fn test_deregister_validates_address_and_reparks() {
        let registry = Registry::start(config(128, 0)).await.unwrap();
        let (conn, mut rx) = client(&registry).await;
        conn.send(&register_msg(9000)).await.unwrap();
        let id = status(&mut rx).await.id;
        let local_port = i32::from(conn.local_addr().port());

        conn.send(&Message::Deregister(Deregister {
            ip: vec![127, 0, 0, 1],
            port: local_port + 1,
            id,
        }))
        .await
        .unwrap();
        let mismatch = status(&mut rx).await;
        assert_eq!(mismatch.id, -1);
        assert_eq!(registry.members().len(), 1);

        conn.send(&Message::Deregister(Deregister {
            ip: vec![127, 0, 0, 1],
            port: local_port,
            id: id + 1000,
        }))
        .await
        .unwrap();
        assert_eq!(
            status(&mut rx).await.message,
            "Node not registered with overlay"
        );

        conn.send(&Message::Deregister(Deregister {
            ip: vec![127, 0, 0, 1],
            port: local_port,
            id,
        }))
        .await
        .unwrap();
        let ok = status(&mut rx).await;
        assert_eq!(ok.id, id);
        assert!(registry.members().is_empty());

        // The connection was re-parked, so it can register again.
        conn.send(&register_msg(9000)).await.unwrap();
        assert!(status(&mut rx).await.is_success());
    }

    #[tokio::test]
    async fn test_overlay_preconditions() {
        let registry = Registry::start(config(128, 0)).await.unwrap();
        assert!(matches!(
            registry.initiate_task(5).await,
            Err(OverlayError::OverlayNotBuilt)
        ));
        assert!(matches!(
            registry.generate_overlay(6).await,
            Err(OverlayError::InvalidFingerCount { requested: 6, max: 5 })
        ));

        let (conn, mut rx) = client(&registry).await;
        conn.send(&register_msg(9000)).await.unwrap();
        status(&mut rx).await;
        assert!(matches!(
            registry.generate_overlay(1).await,
            Err(OverlayError::TooFewMembers { have: 1, .. })
        ));
    }

    #[tokio::test]
    async fn test_failed_setup_still_completes_round() {
        let registry = Registry::start(config(128, 0)).await.unwrap();
        let mut events = registry.subscribe();
        let mut clients = Vec::new();
        for port in [9001, 9002] {
            let (conn, mut rx) = client(&registry).await;
            conn.send(&register_msg(port)).await.unwrap();
            let id = status(&mut rx).await.id;
            clients.push((conn, rx, id));
        }

        registry.generate_overlay(1).await.unwrap();
        for (i, (conn, rx, id)) in clients.iter_mut().enumerate() {
            let msg = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .unwrap()
                .unwrap();
            assert!(matches!(msg, Message::Manifest(_)), "got {msg:?}");
            let reply = if i == 0 {
                Status::success(*id, "Setup successful")
            } else {
                Status::failure("Unable to connect to finger")
            };
            conn.send(&Message::SetupStatus(reply)).await.unwrap();
        }

        let ready = wait_for(&mut events, |e| match e {
            RegistryEvent::OverlayReady { members, failed } => Some((members, failed)),
            _ => None,
        })
        .await;
        assert_eq!(ready, (2, 1));
    }

    #[tokio::test]
    async fn test_rejects_invalid_config() {
        assert!(matches!(
            Registry::start(config(0, 0)).await,
            Err(OverlayError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_four_node_round_conserves_packets() {
        let registry = Registry::start(config(128, 300)).await.unwrap();
        let mut events = registry.subscribe();
        let node_config = NodeConfig {
            registry_addr: registry.local_addr().to_string(),
            listen_addr: "127.0.0.1:0".parse().unwrap(),
        };

        let mut nodes = Vec::new();
        for _ in 0..4 {
            nodes.push(MessagingNode::start(&node_config).await.unwrap());
        }
        let mut registered = 0;
        wait_for(&mut events, |e| {
            if matches!(e, RegistryEvent::Registered { .. }) {
                registered += 1;
            }
            (registered == 4).then_some(())
        })
        .await;

        let topology = registry.generate_overlay(2).await.unwrap();
        assert_eq!(topology.len(), 4);
        for (_, fingers) in topology.iter() {
            assert_eq!(fingers.len(), 2);
        }
        let ready = wait_for(&mut events, |e| match e {
            RegistryEvent::OverlayReady { members, failed } => Some((members, failed)),
            _ => None,
        })
        .await;
        assert_eq!(ready, (4, 0));
        for node in &nodes {
            let table = node.routing_table().expect("manifest applied");
            assert_eq!(table.fingers().len(), 2);
            assert_eq!(table.ring(), topology.ring());
        }

        registry.initiate_task(5).await.unwrap();
        let report = wait_for(&mut events, |e| match e {
            RegistryEvent::TrafficReport(report) => Some(report),
            _ => None,
        })
        .await;
        assert_eq!(report.rows.len(), 4);
        assert_eq!(report.totals.sent, 20);
        assert_eq!(report.totals.received, 20);
        assert_eq!(report.totals.sum_sent, report.totals.sum_received);
        for row in report.rows.values() {
            assert_eq!(row.sent, 5);
        }
        for node in &nodes {
            assert_eq!(node.pending_relays(), 0);
            node.shutdown();
        }
        registry.shutdown();
    }

    #[tokio::test]
    async fn test_node_can_leave_overlay() {
        let registry = Registry::start(config(128, 0)).await.unwrap();
        let mut events = registry.subscribe();
        let node = MessagingNode::start(&NodeConfig {
            registry_addr: registry.local_addr().to_string(),
            listen_addr: "127.0.0.1:0".parse().unwrap(),
        })
        .await
        .unwrap();
        let mut node_events = node.subscribe();
        let id = wait_for(&mut events, |e| match e {
            RegistryEvent::Registered { id, .. } => Some(id),
            _ => None,
        })
        .await;
        while node.id().is_none() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(node.id(), Some(id));

        node.deregister().await.unwrap();
        let gone = wait_for(&mut events, |e| match e {
            RegistryEvent::Deregistered { id } => Some(id),
            _ => None,
        })
        .await;
        assert_eq!(gone, id);
        loop {
            let event = tokio::time::timeout(Duration::from_secs(5), node_events.recv())
                .await
                .unwrap()
                .unwrap();
            if event == NodeEvent::Deregistered {
                break;
            }
        }
        assert_eq!(node.id(), None);
        assert!(registry.members().is_empty());
        node.shutdown();
    }
}
