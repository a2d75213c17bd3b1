//! FMP interop transport
//!
//! Bridges the universal packet model onto the foreign mesh protocol via
//! the long-range radio driver. The transport owns a random identity,
//! announces it every five minutes, learns destinations and next hops
//! from foreign announces, delivers matching data packets upward, and
//! relays foreign traffic under the hop limit.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use driftmesh_core::errors::{MeshError, Result, TransportError};
use driftmesh_core::packet::{Packet, PacketType, TransportMetadata};
use driftmesh_core::transport::{
    ReceiveCallback, Transport, TransmitResult, TransportMetrics,
};
use driftmesh_core::types::{NodeHash, TransportTag, Ttl};
use driftmesh_lora::driver::{RadioDriver, RxEvent};

use crate::codec::{FmpAnnounce, FmpDestinationType, FmpPacket, FmpPacketType};

// ----------------------------------------------------------------------------
// Configuration
// ----------------------------------------------------------------------------

/// Tunables for the FMP transport
#[derive(Debug, Clone)]
pub struct FmpConfig {
    /// Fixed identity; random when absent (fresh per start)
    pub identity: Option<[u8; 16]>,
    /// Public key advertised in announces
    pub public_key: [u8; 32],
    /// Free-form bytes appended to announces
    pub app_data: Option<Vec<u8>>,
    /// Cadence of identity announces
    pub announce_interval: Duration,
    /// Lifetime of learned forwarding entries
    pub forwarding_ttl: Duration,
    /// Foreign packets at or above this hop count are not relayed
    pub max_relay_hops: u8,
    /// Serialisations above this size are split into paced radio writes
    pub chunk_size: usize,
    /// Gap between chunked radio writes
    pub chunk_gap: Duration,
    /// Nominal bitrate reported to the path metrics
    pub bitrate_bps: u64,
}

impl Default for FmpConfig {
    fn default() -> Self {
        Self {
            identity: None,
            public_key: [0u8; 32],
            app_data: None,
            announce_interval: Duration::from_secs(300),
            forwarding_ttl: Duration::from_secs(600),
            max_relay_hops: 8,
            chunk_size: 200,
            chunk_gap: Duration::from_millis(100),
            bitrate_bps: 1_760,
        }
    }
}

// ----------------------------------------------------------------------------
// Tables
// ----------------------------------------------------------------------------

/// Learned route to a foreign destination
#[derive(Debug, Clone)]
pub struct FmpPathEntry {
    pub destination: NodeHash,
    pub next_hop: NodeHash,
    pub hops: u8,
    pub expires_at: Instant,
}

/// Everything we know about a foreign destination
#[derive(Debug, Clone)]
pub struct KnownDestination {
    pub hash: NodeHash,
    pub public_key: [u8; 32],
    pub last_seen: Instant,
    pub hops: u8,
    pub rssi_dbm: Option<i16>,
    pub snr_db: Option<f32>,
}

/// Counters specific to foreign mesh interop
#[derive(Debug, Default)]
pub struct FmpStats {
    pub announces_sent: AtomicU64,
    pub announces_received: AtomicU64,
    pub packets_delivered: AtomicU64,
    pub packets_relayed: AtomicU64,
    pub parse_errors: AtomicU64,
}

// ----------------------------------------------------------------------------
// Transport
// ----------------------------------------------------------------------------

struct Inner {
    driver: Arc<RadioDriver>,
    config: FmpConfig,
    identity: NodeHash,
    forwarding: Mutex<HashMap<NodeHash, FmpPathEntry>>,
    known: Mutex<HashMap<NodeHash, KnownDestination>>,
    callback: Mutex<Option<ReceiveCallback>>,
    stats: FmpStats,
    packets_sent: AtomicU64,
    bytes_sent: AtomicU64,
    available: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Foreign Mesh Protocol transport over the long-range radio
pub struct FmpTransport {
    inner: Arc<Inner>,
}

impl FmpTransport {
    pub fn new(driver: Arc<RadioDriver>, config: FmpConfig) -> Self {
        let identity = match config.identity {
            Some(bytes) => NodeHash::new(bytes),
            None => NodeHash::new(rand::random()),
        };
        Self {
            inner: Arc::new(Inner {
                driver,
                identity,
                config,
                forwarding: Mutex::new(HashMap::new()),
                known: Mutex::new(HashMap::new()),
                callback: Mutex::new(None),
                stats: FmpStats::default(),
                packets_sent: AtomicU64::new(0),
                bytes_sent: AtomicU64::new(0),
                available: AtomicBool::new(false),
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Identity this transport announces on the foreign mesh
    pub fn identity(&self) -> NodeHash {
        self.inner.identity
    }

    /// Snapshot of a learned forwarding entry
    pub fn forwarding_entry(&self, destination: &NodeHash) -> Option<FmpPathEntry> {
        self.inner
            .forwarding
            .lock()
            .ok()?
            .get(destination)
            .filter(|entry| entry.expires_at > Instant::now())
            .cloned()
    }

    /// Snapshot of a known foreign destination
    pub fn known_destination(&self, hash: &NodeHash) -> Option<KnownDestination> {
        self.inner.known.lock().ok()?.get(hash).cloned()
    }

    /// Interop counters
    pub fn stats(&self) -> &FmpStats {
        &self.inner.stats
    }
}

impl Inner {
    /// Write serialized FMP bytes to the radio, chunking large frames
    /// into paced writes
    async fn write_radio(self: &Arc<Self>, bytes: Vec<u8>) -> Result<()> {
        let chunk_size = self.config.chunk_size;
        let chunks: Vec<Vec<u8>> = if bytes.len() > chunk_size {
            bytes.chunks(chunk_size).map(|c| c.to_vec()).collect()
        } else {
            vec![bytes]
        };

        let total = chunks.len();
        for (i, chunk) in chunks.into_iter().enumerate() {
            let driver = Arc::clone(&self.driver);
            let len = chunk.len();
            tokio::task::spawn_blocking(move || driver.transmit(&chunk))
                .await
                .map_err(|_| MeshError::Transport(TransportError::Shutdown {
                    reason: "radio write task aborted".into(),
                }))??;
            self.bytes_sent.fetch_add(len as u64, Ordering::Relaxed);
            if i + 1 < total {
                tokio::time::sleep(self.config.chunk_gap).await;
            }
        }
        Ok(())
    }

    /// Broadcast our identity announce
    async fn send_announce(self: &Arc<Self>) -> Result<()> {
        let announce = FmpAnnounce {
            identity_hash: self.identity,
            public_key: self.config.public_key,
            app_data: self.config.app_data.clone(),
        };
        let packet = FmpPacket {
            packet_type: FmpPacketType::Announce,
            destination_type: FmpDestinationType::Plain,
            hops: 0,
            context: 0,
            destination_hash: self.identity,
            transport_id: self.identity,
            payload: announce.to_bytes(),
        };
        self.write_radio(packet.to_bytes()).await?;
        self.stats.announces_sent.fetch_add(1, Ordering::Relaxed);
        debug!(identity = %self.identity, "announce sent");
        Ok(())
    }

    /// Classify and handle one received foreign packet
    fn handle_fmp(self: &Arc<Self>, packet: FmpPacket, event: &RxEvent) {
        match packet.packet_type {
            FmpPacketType::Announce => self.handle_announce(packet, event),
            FmpPacketType::Data => self.handle_data(packet, event),
            FmpPacketType::LinkRequest | FmpPacketType::Proof => {
                // Link establishment with foreign nodes is deferred
                debug!(packet_type = ?packet.packet_type, "foreign link packet ignored");
            }
        }
    }

    fn handle_announce(self: &Arc<Self>, packet: FmpPacket, event: &RxEvent) {
        let announce = match FmpAnnounce::from_bytes(&packet.payload) {
            Ok(a) => a,
            Err(err) => {
                debug!(error = %err, "malformed foreign announce dropped");
                self.stats.parse_errors.fetch_add(1, Ordering::Relaxed);
                return;
            }
        };

        let now = Instant::now();
        if let Ok(mut known) = self.known.lock() {
            known.insert(
                announce.identity_hash,
                KnownDestination {
                    hash: announce.identity_hash,
                    public_key: announce.public_key,
                    last_seen: now,
                    hops: packet.hops,
                    rssi_dbm: event.rssi_dbm,
                    snr_db: event.snr_db,
                },
            );
        }
        if let Ok(mut forwarding) = self.forwarding.lock() {
            forwarding.insert(
                announce.identity_hash,
                FmpPathEntry {
                    destination: announce.identity_hash,
                    next_hop: packet.transport_id,
                    hops: packet.hops,
                    expires_at: now + self.config.forwarding_ttl,
                },
            );
        }
        self.stats
            .announces_received
            .fetch_add(1, Ordering::Relaxed);
        info!(
            identity = %announce.identity_hash,
            hops = packet.hops,
            "foreign destination learned"
        );
    }

    fn handle_data(self: &Arc<Self>, packet: FmpPacket, event: &RxEvent) {
        let for_us = packet.destination_hash == self.identity || packet.is_broadcast();
        if for_us {
            let destination = if packet.is_broadcast() {
                NodeHash::BROADCAST
            } else {
                self.identity
            };
            let mut mesh_packet = Packet::new(
                packet.transport_id,
                destination,
                PacketType::Data,
                packet.payload.clone(),
            );
            mesh_packet.hops = packet.hops;
            mesh_packet.ttl = Ttl::new(packet.hops.max(Ttl::DEFAULT.value()));

            let mut metadata = TransportMetadata::for_transport(TransportTag::Fmp)
                .with_hops(packet.hops);
            metadata.rssi = event.rssi_dbm;
            metadata.snr = event.snr_db;

            self.stats
                .packets_delivered
                .fetch_add(1, Ordering::Relaxed);
            let callback = self.callback.lock().ok().and_then(|cb| cb.clone());
            if let Some(callback) = callback {
                callback(mesh_packet, metadata);
            }
            return;
        }

        // Hop-limited relay of traffic that is not for us
        if packet.hops < self.config.max_relay_hops && packet.transport_id != self.identity {
            let relayed = packet.hop();
            let this = Arc::clone(self);
            let handle = tokio::spawn(async move {
                if let Err(err) = this.write_radio(relayed.to_bytes()).await {
                    warn!(error = %err, "foreign relay failed");
                } else {
                    this.stats.packets_relayed.fetch_add(1, Ordering::Relaxed);
                }
            });
            if let Ok(mut tasks) = self.tasks.lock() {
                tasks.retain(|t| !t.is_finished());
                tasks.push(handle);
            }
        }
    }

    fn purge_expired(&self) {
        let now = Instant::now();
        if let Ok(mut forwarding) = self.forwarding.lock() {
            forwarding.retain(|_, entry| entry.expires_at > now);
        }
        let horizon = self.config.forwarding_ttl;
        if let Ok(mut known) = self.known.lock() {
            known.retain(|_, dest| now.duration_since(dest.last_seen) < horizon);
        }
    }
}

#[async_trait::async_trait]
impl Transport for FmpTransport {
    fn tag(&self) -> TransportTag {
        TransportTag::Fmp
    }

    fn is_available(&self) -> bool {
        self.inner.available.load(Ordering::Relaxed)
    }

    async fn start(&self) -> Result<()> {
        // The driver delivers from its blocking reader thread; bytes are
        // handed to a drain task so handling runs on the runtime
        let (rx_tx, mut rx_rx) = tokio::sync::mpsc::unbounded_channel::<RxEvent>();
        let parse_inner = Arc::clone(&self.inner);
        self.inner.driver.start_receive(Arc::new(move |event| {
            let _ = rx_tx.send(event);
        }));
        let drain = tokio::spawn(async move {
            while let Some(event) = rx_rx.recv().await {
                match FmpPacket::from_bytes(&event.data) {
                    Ok(packet) => parse_inner.handle_fmp(packet, &event),
                    Err(_) => {
                        parse_inner
                            .stats
                            .parse_errors
                            .fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
        });
        if let Ok(mut tasks) = self.inner.tasks.lock() {
            tasks.push(drain);
        }

        self.inner.available.store(true, Ordering::Relaxed);

        // Announce immediately, then on the configured cadence; expired
        // table entries are swept on the same tick
        let announcer = Arc::clone(&self.inner);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(announcer.config.announce_interval);
            loop {
                ticker.tick().await;
                if let Err(err) = announcer.send_announce().await {
                    warn!(error = %err, "announce failed");
                }
                announcer.purge_expired();
            }
        });
        if let Ok(mut tasks) = self.inner.tasks.lock() {
            tasks.push(handle);
        }

        info!(identity = %self.inner.identity, "fmp transport started");
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.inner.available.store(false, Ordering::Relaxed);
        if let Ok(mut tasks) = self.inner.tasks.lock() {
            for task in tasks.drain(..) {
                task.abort();
            }
        }
        info!("fmp transport stopped");
        Ok(())
    }

    async fn transmit(&self, packet: &Packet) -> Result<TransmitResult> {
        if !self.is_available() {
            return Err(MeshError::unavailable(TransportTag::Fmp.as_str()));
        }

        // Broadcasts map to plain addressing; everything else is single
        let destination_type = if packet.is_broadcast() {
            FmpDestinationType::Plain
        } else {
            FmpDestinationType::Single
        };
        let foreign = FmpPacket {
            packet_type: FmpPacketType::Data,
            destination_type,
            hops: packet.hops.min(crate::codec::FMP_MAX_HOPS),
            context: 0,
            destination_hash: packet.destination,
            transport_id: self.inner.identity,
            payload: packet.payload.clone(),
        };

        self.inner.write_radio(foreign.to_bytes()).await?;
        self.inner.packets_sent.fetch_add(1, Ordering::Relaxed);
        Ok(TransmitResult::sent())
    }

    fn set_receive_callback(&self, callback: ReceiveCallback) {
        if let Ok(mut slot) = self.inner.callback.lock() {
            *slot = Some(callback);
        }
    }

    fn metrics(&self) -> TransportMetrics {
        let radio = self.inner.driver.metrics();
        TransportMetrics {
            packets_sent: self.inner.packets_sent.load(Ordering::Relaxed),
            packets_received: self
                .inner
                .stats
                .packets_delivered
                .load(Ordering::Relaxed),
            bytes_sent: self.inner.bytes_sent.load(Ordering::Relaxed),
            bytes_received: radio.bytes_received,
            parse_errors: self.inner.stats.parse_errors.load(Ordering::Relaxed),
            peer_count: self.inner.known.lock().map(|k| k.len()).unwrap_or(0),
            bitrate_bps: self.inner.config.bitrate_bps,
        }
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use driftmesh_lora::config::FramingKind;
    use driftmesh_lora::kiss::{KissDecoder, CMD_DATA};
    use std::collections::VecDeque;
    use std::io::{self, Read, Write};

    fn node(byte: u8) -> NodeHash {
        NodeHash::new([byte; 16])
    }

    struct LoopSerial {
        written: Arc<Mutex<Vec<u8>>>,
        rx: Arc<Mutex<VecDeque<Vec<u8>>>>,
    }

    impl LoopSerial {
        fn new() -> (Self, Arc<Mutex<Vec<u8>>>) {
            let written = Arc::new(Mutex::new(Vec::new()));
            (
                Self {
                    written: Arc::clone(&written),
                    rx: Arc::new(Mutex::new(VecDeque::new())),
                },
                written,
            )
        }
    }

    impl Read for LoopSerial {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if let Some(chunk) = self.rx.lock().unwrap().pop_front() {
                let n = chunk.len().min(buf.len());
                buf[..n].copy_from_slice(&chunk[..n]);
                return Ok(n);
            }
            std::thread::sleep(Duration::from_millis(2));
            Err(io::Error::new(io::ErrorKind::TimedOut, "idle"))
        }
    }

    impl Write for LoopSerial {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.written.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    async fn transport() -> (FmpTransport, Arc<Mutex<Vec<u8>>>) {
        let (serial, written) = LoopSerial::new();
        let driver = Arc::new(RadioDriver::new(Box::new(serial), FramingKind::Kiss));
        driver
            .configure(&driftmesh_lora::config::RadioConfig::default())
            .unwrap();
        let transport = FmpTransport::new(driver, FmpConfig::default());
        transport.start().await.unwrap();
        // Let the startup announce reach the wire before tests snapshot it
        tokio::time::sleep(Duration::from_millis(50)).await;
        (transport, written)
    }

    /// Unwrap KISS data frames written to the mock serial
    fn fmp_packets_on_wire(wire: &[u8]) -> Vec<FmpPacket> {
        let mut decoder = KissDecoder::new();
        decoder
            .push_bytes(wire)
            .into_iter()
            .filter(|f| f.command & 0x0F == CMD_DATA)
            .filter_map(|f| FmpPacket::from_bytes(&f.payload).ok())
            .collect()
    }

    fn rx_event(data: Vec<u8>) -> RxEvent {
        RxEvent {
            data,
            rssi_dbm: Some(-88),
            snr_db: Some(3.25),
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn announce_learns_destination_and_route() {
        let (transport, _written) = transport().await;

        let foreign_identity = node(0x01);
        let relay = node(0x07);
        let announce = FmpAnnounce {
            identity_hash: foreign_identity,
            public_key: [0x02; 32],
            app_data: None,
        };
        let packet = FmpPacket {
            packet_type: FmpPacketType::Announce,
            destination_type: FmpDestinationType::Plain,
            hops: 0,
            context: 0,
            destination_hash: foreign_identity,
            transport_id: relay,
            payload: announce.to_bytes(),
        };
        transport
            .inner
            .handle_fmp(packet, &rx_event(vec![]));

        let known = transport.known_destination(&foreign_identity).unwrap();
        assert_eq!(known.hops, 0);
        assert_eq!(known.public_key, [0x02; 32]);
        assert_eq!(known.rssi_dbm, Some(-88));

        let route = transport.forwarding_entry(&foreign_identity).unwrap();
        assert_eq!(route.next_hop, relay);
        assert_eq!(
            transport.stats().announces_received.load(Ordering::Relaxed),
            1
        );

        transport.stop().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn data_for_us_is_delivered_not_relayed() {
        let (transport, written) = transport().await;

        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&received);
        transport.set_receive_callback(Arc::new(move |packet, metadata| {
            sink.lock().unwrap().push((packet, metadata));
        }));

        let sender = node(0x05);
        let packet = FmpPacket {
            packet_type: FmpPacketType::Data,
            destination_type: FmpDestinationType::Single,
            hops: 2,
            context: 0,
            destination_hash: transport.identity(),
            transport_id: sender,
            payload: b"for us".to_vec(),
        };
        let wire_before = written.lock().unwrap().len();
        transport.inner.handle_fmp(packet, &rx_event(vec![]));
        tokio::time::sleep(Duration::from_millis(50)).await;

        let events = received.lock().unwrap();
        assert_eq!(events.len(), 1);
        let (mesh_packet, metadata) = &events[0];
        assert_eq!(mesh_packet.payload, b"for us");
        assert_eq!(mesh_packet.source, sender);
        assert_eq!(mesh_packet.hops, 2);
        assert_eq!(metadata.rssi, Some(-88));
        // Nothing extra hit the radio
        assert_eq!(written.lock().unwrap().len(), wire_before);

        transport.stop().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn foreign_data_is_hop_relayed() {
        let (transport, written) = transport().await;

        let packet = FmpPacket {
            packet_type: FmpPacketType::Data,
            destination_type: FmpDestinationType::Single,
            hops: 3,
            context: 0,
            destination_hash: node(0x0E),
            transport_id: node(0x05),
            payload: b"passing through".to_vec(),
        };
        transport.inner.handle_fmp(packet.clone(), &rx_event(vec![]));

        // Relay happens on a background task
        tokio::time::sleep(Duration::from_millis(100)).await;

        let wire = written.lock().unwrap().clone();
        let relayed = fmp_packets_on_wire(&wire);
        assert_eq!(relayed.len(), 1);
        assert_eq!(relayed[0].hops, packet.hops + 1);
        assert_eq!(relayed[0].payload, packet.payload);
        assert_eq!(
            transport.stats().packets_relayed.load(Ordering::Relaxed),
            1
        );

        transport.stop().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn hop_limit_stops_relay() {
        let (transport, written) = transport().await;

        let packet = FmpPacket {
            packet_type: FmpPacketType::Data,
            destination_type: FmpDestinationType::Single,
            hops: 8,
            context: 0,
            destination_hash: node(0x0E),
            transport_id: node(0x05),
            payload: b"too far".to_vec(),
        };
        let wire_before = written.lock().unwrap().len();
        transport.inner.handle_fmp(packet, &rx_event(vec![]));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(written.lock().unwrap().len(), wire_before);

        transport.stop().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn our_own_traffic_is_not_relayed() {
        let (transport, written) = transport().await;

        let packet = FmpPacket {
            packet_type: FmpPacketType::Data,
            destination_type: FmpDestinationType::Single,
            hops: 1,
            context: 0,
            destination_hash: node(0x0E),
            transport_id: transport.identity(),
            payload: b"echo".to_vec(),
        };
        let wire_before = written.lock().unwrap().len();
        transport.inner.handle_fmp(packet, &rx_event(vec![]));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(written.lock().unwrap().len(), wire_before);

        transport.stop().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn outbound_conversion_rules() {
        let (transport, written) = transport().await;

        let broadcast = Packet::new_broadcast(node(0x01), b"to all".to_vec());
        transport.transmit(&broadcast).await.unwrap();
        let unicast = Packet::new_data(node(0x01), node(0x02), b"to one".to_vec());
        transport.transmit(&unicast).await.unwrap();

        let wire = written.lock().unwrap().clone();
        let packets = fmp_packets_on_wire(&wire);
        // The startup announce may be on the wire ahead of the data
        let data: Vec<&FmpPacket> = packets
            .iter()
            .filter(|p| p.packet_type == FmpPacketType::Data)
            .collect();
        assert_eq!(data.len(), 2);
        assert_eq!(data[0].destination_type, FmpDestinationType::Plain);
        assert_eq!(data[1].destination_type, FmpDestinationType::Single);
        assert_eq!(data[1].destination_hash, node(0x02));
        assert_eq!(data[1].transport_id, transport.identity());
        assert_eq!(data[1].context, 0);

        transport.stop().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn large_serialisation_is_chunked() {
        let (transport, written) = transport().await;

        let unicast = Packet::new_data(node(0x01), node(0x02), vec![0x77; 500]);
        transport.transmit(&unicast).await.unwrap();

        // 500-byte payload plus the 34-byte header splits into three
        // chunked radio writes, each its own KISS frame
        let wire = written.lock().unwrap().clone();
        let mut decoder = KissDecoder::new();
        let frames: Vec<_> = decoder
            .push_bytes(&wire)
            .into_iter()
            .filter(|f| f.command & 0x0F == CMD_DATA)
            .collect();
        // announce (1 frame) + 3 chunks
        assert!(frames.len() >= 3);
        let chunked: Vec<_> = frames.iter().filter(|f| f.payload.len() <= 200).collect();
        assert!(chunked.len() >= 3);

        transport.stop().await.unwrap();
    }
}
