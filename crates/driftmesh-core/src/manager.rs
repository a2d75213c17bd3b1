//! Transport manager: composition, deduplication, relay, store-and-forward
//!
//! The manager is the sole owner of the transport set. Transports notify
//! it of received packets through a channel it owns; the application
//! registers one packet handler and reads an aggregated status stream.
//! Announce packets feed the pathfinder, handshake packets feed the
//! handshake manager, and everything else reaches the application exactly
//! once per dedup window.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;

use tokio::sync::{mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

use crate::config::MeshConfig;
use crate::dedup::DedupCache;
use crate::errors::{MeshError, Result};
use crate::handshake::{HandshakeManager, HandshakeMessage};
use crate::packet::{Packet, PacketType, TransportMetadata};
use crate::pathfinder::{Announcement, Pathfinder, SelectionStrategy, Urgency};
use crate::transport::{ReceiveCallback, Transport, TransmitResult};
use crate::types::{NodeHash, TransportTag};

// ----------------------------------------------------------------------------
// Status
// ----------------------------------------------------------------------------

/// Aggregated view published on the status stream every maintenance tick
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ManagerStatus {
    pub short_range_active: bool,
    pub short_range_peers: usize,
    pub long_range_active: bool,
    pub long_range_peers: usize,
    pub total_bandwidth_bps: u64,
    pub pending_packets: usize,
}

// ----------------------------------------------------------------------------
// Pending Queue
// ----------------------------------------------------------------------------

#[derive(Debug)]
struct PendingPacket {
    packet: Packet,
    queued_at: Instant,
    retry_count: u32,
}

// ----------------------------------------------------------------------------
// Packet Handler
// ----------------------------------------------------------------------------

/// Application callback for delivered packets
pub type PacketHandler = Arc<dyn Fn(Packet, TransportMetadata) + Send + Sync>;

// ----------------------------------------------------------------------------
// Transport Manager
// ----------------------------------------------------------------------------

/// Composes transports into one mesh interface
pub struct TransportManager {
    identity: NodeHash,
    config: MeshConfig,
    transports: RwLock<Vec<Arc<dyn Transport>>>,
    dedup: Mutex<DedupCache>,
    pending: Mutex<Vec<PendingPacket>>,
    handler: RwLock<Option<PacketHandler>>,
    pathfinder: Option<Arc<Pathfinder>>,
    handshakes: Option<Arc<HandshakeManager>>,
    rx_tx: mpsc::UnboundedSender<(Packet, TransportMetadata)>,
    rx_rx: Mutex<Option<mpsc::UnboundedReceiver<(Packet, TransportMetadata)>>>,
    status_tx: watch::Sender<ManagerStatus>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    running: RwLock<bool>,
}

impl TransportManager {
    /// Create a manager for the node with the given mesh address
    pub fn new(identity: NodeHash, config: MeshConfig) -> Self {
        let (rx_tx, rx_rx) = mpsc::unbounded_channel();
        let (status_tx, _) = watch::channel(ManagerStatus::default());
        Self {
            identity,
            dedup: Mutex::new(DedupCache::new(config.dedup_window)),
            config,
            transports: RwLock::new(Vec::new()),
            pending: Mutex::new(Vec::new()),
            handler: RwLock::new(None),
            pathfinder: None,
            handshakes: None,
            rx_tx,
            rx_rx: Mutex::new(Some(rx_rx)),
            status_tx,
            tasks: Mutex::new(Vec::new()),
            running: RwLock::new(false),
        }
    }

    /// Attach the routing engine consulted on unicast sends
    pub fn with_pathfinder(mut self, pathfinder: Arc<Pathfinder>) -> Self {
        self.pathfinder = Some(pathfinder);
        self
    }

    /// Attach the handshake manager that consumes `Handshake` packets
    pub fn with_handshakes(mut self, handshakes: Arc<HandshakeManager>) -> Self {
        self.handshakes = Some(handshakes);
        self
    }

    /// Our mesh address
    pub fn identity(&self) -> NodeHash {
        self.identity
    }

    /// Register the application packet handler
    pub fn set_packet_handler(&self, handler: PacketHandler) {
        if let Ok(mut slot) = self.handler.write() {
            *slot = Some(handler);
        }
    }

    /// Subscribe to the aggregated status stream
    pub fn subscribe_status(&self) -> watch::Receiver<ManagerStatus> {
        self.status_tx.subscribe()
    }

    // ------------------------------------------------------------------
    // Transport Set
    // ------------------------------------------------------------------

    /// Add a transport at runtime, wiring its receive callback immediately
    pub async fn add_transport(&self, transport: Arc<dyn Transport>) -> Result<()> {
        let callback = self.receive_callback();
        transport.set_receive_callback(callback);

        let running = self.running.read().map(|r| *r).unwrap_or(false);
        if running {
            transport.start().await?;
        }

        let tag = transport.tag();
        if let Ok(mut transports) = self.transports.write() {
            transports.retain(|t| t.tag() != tag);
            transports.push(transport);
        }
        info!(transport = %tag, "transport added");
        Ok(())
    }

    /// Remove and stop a transport at runtime
    pub async fn remove_transport(&self, tag: TransportTag) -> Result<()> {
        let removed = {
            let mut transports = self
                .transports
                .write()
                .map_err(|_| MeshError::malformed("transport list poisoned"))?;
            let index = transports.iter().position(|t| t.tag() == tag);
            index.map(|i| transports.remove(i))
        };
        match removed {
            Some(transport) => {
                transport.stop().await?;
                info!(transport = %tag, "transport removed");
                Ok(())
            }
            None => Err(MeshError::unavailable(tag.as_str())),
        }
    }

    /// Look up a composed transport by tag
    pub fn get_transport(&self, tag: TransportTag) -> Option<Arc<dyn Transport>> {
        self.transports
            .read()
            .ok()?
            .iter()
            .find(|t| t.tag() == tag)
            .cloned()
    }

    fn transport_snapshot(&self) -> Vec<Arc<dyn Transport>> {
        self.transports
            .read()
            .map(|t| t.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn available_transports(&self) -> Vec<Arc<dyn Transport>> {
        self.transport_snapshot()
            .into_iter()
            .filter(|t| t.is_available())
            .collect()
    }

    fn receive_callback(&self) -> ReceiveCallback {
        let tx = self.rx_tx.clone();
        Arc::new(move |packet, metadata| {
            let _ = tx.send((packet, metadata));
        })
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Start every transport and the background loops
    pub async fn start_all(self: &Arc<Self>) -> Result<()> {
        {
            let mut running = self
                .running
                .write()
                .map_err(|_| MeshError::malformed("manager state poisoned"))?;
            if *running {
                return Ok(());
            }
            *running = true;
        }

        for transport in self.transport_snapshot() {
            transport.set_receive_callback(self.receive_callback());
            if let Err(err) = transport.start().await {
                warn!(transport = %transport.tag(), error = %err, "transport failed to start");
            }
        }

        let mut tasks = self
            .tasks
            .lock()
            .map_err(|_| MeshError::malformed("manager task list poisoned"))?;

        // Receive dispatch loop
        let rx = self
            .rx_rx
            .lock()
            .map_err(|_| MeshError::malformed("manager state poisoned"))?
            .take();
        if let Some(mut rx) = rx {
            let manager = Arc::clone(self);
            tasks.push(tokio::spawn(async move {
                while let Some((packet, metadata)) = rx.recv().await {
                    manager.dispatch_received(packet, metadata).await;
                }
            }));
        }

        // Maintenance loop
        let manager = Arc::clone(self);
        tasks.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(manager.config.maintenance_interval);
            loop {
                ticker.tick().await;
                manager.run_maintenance().await;
            }
        }));

        // Handshake rekey sweep
        if let Some(handshakes) = &self.handshakes {
            tasks.push(handshakes.spawn_rekey_task());
        }

        // Pathfinder announce plumbing
        if let Some(pathfinder) = &self.pathfinder {
            let (announce_tx, mut announce_rx) = mpsc::channel::<Announcement>(8);
            pathfinder.start(announce_tx)?;
            let manager = Arc::clone(self);
            tasks.push(tokio::spawn(async move {
                while let Some(announcement) = announce_rx.recv().await {
                    let packet =
                        Packet::new_announce(manager.identity, announcement.to_bytes());
                    if let Err(err) = manager.broadcast(packet).await {
                        debug!(error = %err, "announce broadcast failed");
                    }
                }
            }));
        }

        info!(identity = %self.identity, "transport manager started");
        Ok(())
    }

    /// Stop every transport and cancel background work
    pub async fn stop_all(&self) -> Result<()> {
        {
            let mut running = self
                .running
                .write()
                .map_err(|_| MeshError::malformed("manager state poisoned"))?;
            *running = false;
        }
        if let Ok(mut tasks) = self.tasks.lock() {
            for task in tasks.drain(..) {
                task.abort();
            }
        }
        if let Some(pathfinder) = &self.pathfinder {
            pathfinder.stop();
        }
        for transport in self.transport_snapshot() {
            if let Err(err) = transport.stop().await {
                warn!(transport = %transport.tag(), error = %err, "transport failed to stop");
            }
        }
        if let Ok(mut pending) = self.pending.lock() {
            pending.clear();
        }
        info!("transport manager stopped");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Sending
    // ------------------------------------------------------------------

    /// Send a packet toward its destination
    pub async fn send(&self, packet: Packet) -> Result<TransmitResult> {
        self.send_with_urgency(packet, Urgency::Normal).await
    }

    /// Send with an explicit urgency class
    pub async fn send_with_urgency(
        &self,
        packet: Packet,
        urgency: Urgency,
    ) -> Result<TransmitResult> {
        packet.validate(self.config.max_payload)?;

        {
            let mut dedup = self
                .dedup
                .lock()
                .map_err(|_| MeshError::malformed("dedup cache poisoned"))?;
            if dedup.check_and_stamp(packet.id) {
                return Err(MeshError::duplicate(packet.id.to_string()));
            }
        }

        if packet.is_broadcast() {
            return self.transmit_everywhere(&packet).await;
        }

        let candidates = self.ordered_candidates(&packet.destination, urgency);
        if candidates.is_empty() {
            return self.queue_or_fail(packet, "no transport available");
        }

        if let Some(SelectionStrategy::MultiTransport) = candidates.first().map(|c| c.1) {
            return self.transmit_everywhere(&packet).await;
        }

        let mut last_error = None;
        for (transport, _) in candidates {
            match transport.transmit(&packet).await {
                Ok(result) if result.success || result.queued => {
                    self.record_outcome(&packet.destination, transport.tag(), true);
                    return Ok(result);
                }
                Ok(result) => {
                    self.record_outcome(&packet.destination, transport.tag(), false);
                    last_error = result.error;
                }
                Err(err) => {
                    self.record_outcome(&packet.destination, transport.tag(), false);
                    last_error = Some(err.to_string());
                }
            }
        }

        let reason = last_error.unwrap_or_else(|| "transmit failed".to_string());
        self.queue_or_fail(packet, &reason)
    }

    /// Broadcast on every available transport in parallel
    pub async fn broadcast(&self, packet: Packet) -> Result<TransmitResult> {
        packet.validate(self.config.max_payload)?;
        {
            let mut dedup = self
                .dedup
                .lock()
                .map_err(|_| MeshError::malformed("dedup cache poisoned"))?;
            if dedup.check_and_stamp(packet.id) {
                return Err(MeshError::duplicate(packet.id.to_string()));
            }
        }
        self.transmit_everywhere(&packet).await
    }

    async fn transmit_everywhere(&self, packet: &Packet) -> Result<TransmitResult> {
        let transports = self.available_transports();
        if transports.is_empty() {
            return self.queue_or_fail(packet.clone(), "no transport available");
        }

        let mut set = JoinSet::new();
        for transport in transports {
            let packet = packet.clone();
            set.spawn(async move {
                let outcome = transport.transmit(&packet).await;
                (transport.tag(), outcome)
            });
        }

        let mut any_success = false;
        let mut last_error = None;
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((tag, Ok(result))) => {
                    if result.success || result.queued {
                        any_success = true;
                    }
                    self.record_outcome(&packet.destination, tag, result.success);
                }
                Ok((tag, Err(err))) => {
                    self.record_outcome(&packet.destination, tag, false);
                    last_error = Some(err.to_string());
                }
                Err(_) => {}
            }
        }

        if any_success {
            Ok(TransmitResult::sent())
        } else {
            let reason = last_error.unwrap_or_else(|| "all transports failed".to_string());
            self.queue_or_fail(packet.clone(), &reason)
        }
    }

    /// Candidate transports in the order the pathfinder suggests
    fn ordered_candidates(
        &self,
        dest: &NodeHash,
        urgency: Urgency,
    ) -> Vec<(Arc<dyn Transport>, SelectionStrategy)> {
        let available = self.available_transports();
        let by_tag: HashMap<TransportTag, Arc<dyn Transport>> = available
            .iter()
            .map(|t| (t.tag(), Arc::clone(t)))
            .collect();

        if let Some(pathfinder) = &self.pathfinder {
            let tags: Vec<TransportTag> = available.iter().map(|t| t.tag()).collect();
            if let Ok(selection) = pathfinder.select_transport(dest, urgency, &tags) {
                let mut ordered = Vec::new();
                if let Some(primary) = selection.primary {
                    if let Some(t) = by_tag.get(&primary) {
                        ordered.push((Arc::clone(t), selection.strategy));
                    }
                }
                for tag in selection.fallbacks {
                    if let Some(t) = by_tag.get(&tag) {
                        if ordered.iter().all(|(o, _)| o.tag() != tag) {
                            ordered.push((Arc::clone(t), selection.strategy));
                        }
                    }
                }
                if !ordered.is_empty() {
                    return ordered;
                }
            }
        }

        // Default preference: short-range first, then declaration order
        let mut ordered: Vec<(Arc<dyn Transport>, SelectionStrategy)> = Vec::new();
        if let Some(short) = by_tag.get(&TransportTag::ShortRange) {
            ordered.push((Arc::clone(short), SelectionStrategy::Unicast));
        }
        for transport in available {
            if transport.tag() != TransportTag::ShortRange {
                ordered.push((transport, SelectionStrategy::Unicast));
            }
        }
        ordered
    }

    fn record_outcome(&self, dest: &NodeHash, tag: TransportTag, success: bool) {
        if let Some(pathfinder) = &self.pathfinder {
            let _ = pathfinder.update_metrics(dest, tag, success, None);
        }
    }

    fn queue_or_fail(&self, packet: Packet, reason: &str) -> Result<TransmitResult> {
        if packet.reliable {
            let mut pending = self
                .pending
                .lock()
                .map_err(|_| MeshError::malformed("pending queue poisoned"))?;
            let due = Instant::now() + self.config.pending_retry_after;
            pending.push(PendingPacket {
                packet,
                queued_at: Instant::now(),
                retry_count: 0,
            });
            debug!(reason, "reliable packet queued for retry");
            Ok(TransmitResult::queued_until(due))
        } else {
            Ok(TransmitResult::failed(reason))
        }
    }

    // ------------------------------------------------------------------
    // Receiving
    // ------------------------------------------------------------------

    async fn dispatch_received(&self, packet: Packet, metadata: TransportMetadata) {
        let duplicate = self
            .dedup
            .lock()
            .map(|mut dedup| dedup.check_and_stamp(packet.id))
            .unwrap_or(true);
        if duplicate {
            debug!(packet_id = %packet.id, "duplicate dropped");
            return;
        }

        match packet.packet_type {
            PacketType::Announce => self.handle_announce(&packet, &metadata),
            PacketType::Handshake => self.handle_handshake(&packet).await,
            _ => {
                let handler = self.handler.read().ok().and_then(|h| h.clone());
                if let Some(handler) = handler {
                    handler(packet.clone(), metadata.clone());
                }
            }
        }

        self.maybe_relay(packet, metadata).await;
    }

    fn handle_announce(&self, packet: &Packet, metadata: &TransportMetadata) {
        let Some(pathfinder) = &self.pathfinder else {
            return;
        };
        match Announcement::from_bytes(&packet.payload) {
            Ok(announcement) => {
                let _ = pathfinder.handle_announcement(
                    packet.source,
                    metadata.transport,
                    metadata,
                    &announcement,
                );
            }
            Err(err) => debug!(error = %err, "unparseable announcement dropped"),
        }
    }

    async fn handle_handshake(&self, packet: &Packet) {
        let Some(handshakes) = &self.handshakes else {
            return;
        };
        let message = match HandshakeMessage::from_bytes(&packet.payload) {
            Ok(m) => m,
            Err(err) => {
                debug!(error = %err, "unparseable handshake message dropped");
                return;
            }
        };
        match handshakes.handle_incoming_handshake(packet.source, message) {
            Ok(Some(response)) => {
                let reply = Packet::new(
                    self.identity,
                    packet.source,
                    PacketType::Handshake,
                    response.to_bytes(),
                );
                if let Err(err) = self.send(reply).await {
                    warn!(peer = %packet.source, error = %err, "handshake reply send failed");
                }
            }
            Ok(None) => {}
            Err(err) => debug!(peer = %packet.source, error = %err, "handshake message rejected"),
        }
    }

    async fn maybe_relay(&self, packet: Packet, metadata: TransportMetadata) {
        if !packet.is_broadcast() {
            return;
        }
        if packet.source == self.identity {
            return;
        }
        let Some(relayed) = packet.hop() else {
            return;
        };

        let transports: Vec<Arc<dyn Transport>> = self
            .available_transports()
            .into_iter()
            .filter(|t| t.tag() != metadata.transport)
            .collect();
        if transports.is_empty() {
            return;
        }

        debug!(
            packet_id = %relayed.id,
            hops = relayed.hops,
            ttl = relayed.ttl.value(),
            "relaying broadcast"
        );
        let mut set = JoinSet::new();
        for transport in transports {
            let relayed = relayed.clone();
            set.spawn(async move { transport.transmit(&relayed).await });
        }
        while set.join_next().await.is_some() {}
    }

    // ------------------------------------------------------------------
    // Maintenance
    // ------------------------------------------------------------------

    async fn run_maintenance(&self) {
        if let Ok(mut dedup) = self.dedup.lock() {
            dedup.prune();
        }

        let due: Vec<PendingPacket> = {
            match self.pending.lock() {
                Ok(mut pending) => {
                    let now = Instant::now();
                    let retry_after = self.config.pending_retry_after;
                    let mut due = Vec::new();
                    let mut keep = Vec::new();
                    for entry in pending.drain(..) {
                        if now.duration_since(entry.queued_at) >= retry_after {
                            due.push(entry);
                        } else {
                            keep.push(entry);
                        }
                    }
                    *pending = keep;
                    due
                }
                Err(_) => Vec::new(),
            }
        };

        for mut entry in due {
            let attempt = self.retry_pending(&entry.packet).await;
            if !attempt {
                entry.retry_count += 1;
                if entry.retry_count >= self.config.max_pending_retries {
                    warn!(
                        packet_id = %entry.packet.id,
                        retries = entry.retry_count,
                        "pending packet dropped"
                    );
                    continue;
                }
                entry.queued_at = Instant::now();
                if let Ok(mut pending) = self.pending.lock() {
                    pending.push(entry);
                }
            }
        }

        self.publish_status();
    }

    async fn retry_pending(&self, packet: &Packet) -> bool {
        if packet.is_broadcast() {
            matches!(
                self.transmit_everywhere(packet).await,
                Ok(TransmitResult { success: true, .. })
            )
        } else {
            for (transport, _) in self.ordered_candidates(&packet.destination, Urgency::Normal) {
                if let Ok(result) = transport.transmit(packet).await {
                    if result.success {
                        return true;
                    }
                }
            }
            false
        }
    }

    fn publish_status(&self) {
        let transports = self.transport_snapshot();
        let mut status = ManagerStatus {
            pending_packets: self.pending.lock().map(|p| p.len()).unwrap_or(0),
            ..Default::default()
        };
        for transport in transports {
            let available = transport.is_available();
            let metrics = transport.metrics();
            match transport.tag() {
                TransportTag::ShortRange => {
                    status.short_range_active = available;
                    status.short_range_peers = metrics.peer_count;
                }
                TransportTag::LongRange | TransportTag::Fmp => {
                    status.long_range_active |= available;
                    status.long_range_peers += metrics.peer_count;
                }
            }
            if available {
                status.total_bandwidth_bps += metrics.bitrate_bps;
            }
        }
        let _ = self.status_tx.send(status);
    }

    /// Number of packets waiting in the store-and-forward queue
    pub fn pending_count(&self) -> usize {
        self.pending.lock().map(|p| p.len()).unwrap_or(0)
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
