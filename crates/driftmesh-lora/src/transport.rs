//! Long-range transport: queueing, CSMA, duty-cycle compliance
//!
//! Packets are serialized, fragmented to the link MTU, and clocked out
//! through the radio driver. Before anything touches the air the duty
//! governor is consulted; a deferred packet goes onto the priority queue
//! with a due time and the background processor retries it. Fragments of
//! one packet are transmitted contiguously, paced by their own airtime.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use rand::Rng;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use driftmesh_core::errors::{MeshError, Result, TransportError};
use driftmesh_core::fragmentation::{Fragment, Fragmenter, Reassembler};
use driftmesh_core::packet::{Packet, PacketType, TransportMetadata};
use driftmesh_core::transport::{
    ReceiveCallback, Transport, TransmitResult, TransportMetrics,
};
use driftmesh_core::types::{NodeHash, TransportTag};

use crate::config::{LongRangeConfig, RadioConfig};
use crate::driver::{DriverState, RadioDriver, RxEvent};
use crate::duty_cycle::{DutyCycleGovernor, RegionProfile};

// ----------------------------------------------------------------------------
// Queued Packet
// ----------------------------------------------------------------------------

/// Transmission priority, smallest first
fn priority_of(packet: &Packet) -> u8 {
    match packet.packet_type {
        PacketType::Handshake => 0,
        PacketType::Ack => 1,
        PacketType::Data | PacketType::Fragment => 2,
        PacketType::Announce => 3,
    }
}

#[derive(Debug)]
struct QueuedPacket {
    packet: Packet,
    priority: u8,
    due_time: Instant,
    retry_count: u32,
}

impl PartialEq for QueuedPacket {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.due_time == other.due_time
    }
}

impl Eq for QueuedPacket {}

impl PartialOrd for QueuedPacket {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedPacket {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // BinaryHeap is a max-heap; invert so the smallest
        // (priority, due_time) pair surfaces first
        other
            .priority
            .cmp(&self.priority)
            .then_with(|| other.due_time.cmp(&self.due_time))
    }
}

// ----------------------------------------------------------------------------
// Transport
// ----------------------------------------------------------------------------

struct Inner {
    driver: Arc<RadioDriver>,
    radio_config: RadioConfig,
    config: LongRangeConfig,
    governor: Mutex<DutyCycleGovernor>,
    fragmenter: Fragmenter,
    reassembler: Mutex<Reassembler>,
    queue: Mutex<BinaryHeap<QueuedPacket>>,
    callback: Mutex<Option<ReceiveCallback>>,
    /// Serialises transmissions: submission order holds and fragments of
    /// different packets never interleave
    tx_gate: tokio::sync::Mutex<()>,
    available: AtomicBool,
    packets_sent: AtomicU64,
    packets_received: AtomicU64,
    parse_errors: AtomicU64,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// The long-range narrow-band transport
pub struct LongRangeTransport {
    inner: Arc<Inner>,
}

impl LongRangeTransport {
    pub fn new(driver: Arc<RadioDriver>, radio_config: RadioConfig, config: LongRangeConfig) -> Self {
        let governor = DutyCycleGovernor::new(
            RegionProfile::eu868(),
            radio_config.frequency_hz,
            radio_config.bandwidth_hz,
            radio_config.coding_rate,
        );
        let fragmenter = Fragmenter::new(config.mtu);
        Self {
            inner: Arc::new(Inner {
                driver,
                radio_config,
                config,
                governor: Mutex::new(governor),
                fragmenter,
                reassembler: Mutex::new(Reassembler::new()),
                queue: Mutex::new(BinaryHeap::new()),
                callback: Mutex::new(None),
                tx_gate: tokio::sync::Mutex::new(()),
                available: AtomicBool::new(false),
                packets_sent: AtomicU64::new(0),
                packets_received: AtomicU64::new(0),
                parse_errors: AtomicU64::new(0),
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Convenience constructor with the default region profile
    pub fn with_defaults(driver: Arc<RadioDriver>) -> Self {
        Self::new(driver, RadioConfig::default(), LongRangeConfig::default())
    }

    /// Packets currently waiting on the queue
    pub fn queued_count(&self) -> usize {
        self.inner.queue.lock().map(|q| q.len()).unwrap_or(0)
    }
}

impl Inner {
    /// Reassembly at the radio layer has no outer addressing, so buffers
    /// are keyed by the fragment's short id alone.
    fn reassembly_key(fragment: &Fragment) -> NodeHash {
        NodeHash::from_short(&fragment.packet_id_short.to_be_bytes())
    }

    fn enqueue(&self, packet: Packet, due_time: Instant, retry_count: u32) {
        let priority = priority_of(&packet);
        if let Ok(mut queue) = self.queue.lock() {
            queue.push(QueuedPacket {
                packet,
                priority,
                due_time,
                retry_count,
            });
        }
    }

    fn pop_due(&self) -> Option<QueuedPacket> {
        let mut queue = self.queue.lock().ok()?;
        if queue
            .peek()
            .map(|head| head.due_time <= Instant::now())
            .unwrap_or(false)
        {
            queue.pop()
        } else {
            None
        }
    }

    /// One full transmit attempt for a packet
    async fn transmit_inner(self: &Arc<Self>, packet: &Packet, retry_count: u32) -> Result<TransmitResult> {
        let _gate = self.tx_gate.lock().await;

        let fragments = self.fragmenter.fragment(packet)?;
        let sf = self.radio_config.spreading_factor;
        let total_bytes: usize = fragments.iter().map(|f| f.to_bytes().len()).sum();

        // Duty budget first: a deferred packet keeps the channel quiet
        let backoff_ms = {
            let mut governor = self
                .governor
                .lock()
                .map_err(|_| MeshError::malformed("duty governor poisoned"))?;
            governor.backoff_for(total_bytes, sf)
        };
        if backoff_ms > 0 {
            let due = Instant::now() + Duration::from_millis(backoff_ms);
            debug!(backoff_ms, "duty cycle deferral, packet queued");
            self.enqueue(packet.clone(), due, retry_count);
            return Ok(TransmitResult::queued_until(due));
        }

        let mut total_airtime_ms = 0u64;
        let multi = fragments.len() > 1;
        for fragment in &fragments {
            if !self.await_clear_channel().await {
                let jitter = rand::thread_rng().gen_range(100..=1000);
                let due = Instant::now() + Duration::from_millis(jitter);
                warn!("channel busy after CAD retries, packet queued");
                self.enqueue(packet.clone(), due, retry_count);
                return Ok(TransmitResult::queued_until(due));
            }

            let bytes = fragment.to_bytes();
            let driver = Arc::clone(&self.driver);
            let written = tokio::task::spawn_blocking(move || {
                let outcome = driver.transmit(&bytes);
                (outcome, bytes.len())
            })
            .await
            .map_err(|_| MeshError::Transport(TransportError::Shutdown {
                reason: "radio write task aborted".into(),
            }))?;
            let (outcome, len) = written;
            outcome?;

            let airtime_ms = {
                let mut governor = self
                    .governor
                    .lock()
                    .map_err(|_| MeshError::malformed("duty governor poisoned"))?;
                let airtime = governor.estimate_airtime(len, sf);
                governor.log_transmission(airtime);
                airtime
            };
            total_airtime_ms += airtime_ms;

            if multi {
                tokio::time::sleep(Duration::from_millis(
                    airtime_ms + self.config.fragment_gap_ms,
                ))
                .await;
            }
        }

        self.packets_sent.fetch_add(1, Ordering::Relaxed);
        Ok(TransmitResult::sent_at(
            Instant::now() + Duration::from_millis(total_airtime_ms),
        ))
    }

    /// CAD loop: up to `cad_attempts` probes spaced `cad_interval_ms`
    async fn await_clear_channel(self: &Arc<Self>) -> bool {
        for attempt in 0..self.config.cad_attempts {
            let driver = Arc::clone(&self.driver);
            let threshold = self.config.cad_threshold_dbm;
            let free = tokio::task::spawn_blocking(move || driver.channel_free(threshold))
                .await
                .unwrap_or(false);
            if free {
                return true;
            }
            debug!(attempt, "channel busy");
            tokio::time::sleep(Duration::from_millis(self.config.cad_interval_ms)).await;
        }
        false
    }

    /// Handle bytes surfaced by the radio driver
    fn handle_rx(self: &Arc<Self>, event: RxEvent) {
        let packet = match Fragment::from_bytes(&event.data) {
            Ok(fragment) => {
                let key = Self::reassembly_key(&fragment);
                match self
                    .reassembler
                    .lock()
                    .ok()
                    .and_then(|mut r| r.defragment(fragment, key).transpose())
                {
                    Some(Ok(packet)) => Some(packet),
                    Some(Err(_)) => {
                        self.parse_errors.fetch_add(1, Ordering::Relaxed);
                        None
                    }
                    None => None,
                }
            }
            // Tolerate peers that send unfragmented packets
            Err(_) => match Packet::from_bytes(&event.data) {
                Ok(packet) => Some(packet),
                Err(_) => {
                    self.parse_errors.fetch_add(1, Ordering::Relaxed);
                    None
                }
            },
        };

        let Some(packet) = packet else { return };
        self.packets_received.fetch_add(1, Ordering::Relaxed);

        let mut metadata = TransportMetadata::for_transport(TransportTag::LongRange)
            .with_hops(packet.hops);
        metadata.rssi = event.rssi_dbm;
        metadata.snr = event.snr_db;

        let callback = self.callback.lock().ok().and_then(|cb| cb.clone());
        if let Some(callback) = callback {
            callback(packet, metadata);
        }
    }
}

#[async_trait::async_trait]
impl Transport for LongRangeTransport {
    fn tag(&self) -> TransportTag {
        TransportTag::LongRange
    }

    fn is_available(&self) -> bool {
        self.inner.available.load(Ordering::Relaxed)
            && matches!(
                self.inner.driver.state(),
                DriverState::Connected | DriverState::Transmitting | DriverState::Receiving
            )
    }

    async fn start(&self) -> Result<()> {
        let inner = Arc::clone(&self.inner);

        // Wire the driver's receive path into the reassembler
        let rx_inner = Arc::clone(&self.inner);
        self.inner
            .driver
            .start_receive(Arc::new(move |event| rx_inner.handle_rx(event)));

        // Configuring blocks on serial acknowledgments
        let driver = Arc::clone(&self.inner.driver);
        let radio_config = self.inner.radio_config.clone();
        tokio::task::spawn_blocking(move || driver.configure(&radio_config))
            .await
            .map_err(|_| MeshError::Transport(TransportError::Shutdown {
                reason: "radio configure task aborted".into(),
            }))??;

        if let Ok(mut governor) = self.inner.governor.lock() {
            governor.set_channel(
                self.inner.radio_config.frequency_hz,
                self.inner.radio_config.bandwidth_hz,
                self.inner.radio_config.coding_rate,
            );
        }

        // Queue processor: polls for due packets, retries, drops after
        // the retry budget
        let processor = Arc::clone(&inner);
        let handle = tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_millis(100)).await;
                while let Some(entry) = processor.pop_due() {
                    let attempt = processor
                        .transmit_inner(&entry.packet, entry.retry_count)
                        .await;
                    match attempt {
                        Ok(result) if result.success => {
                            debug!(packet_id = %entry.packet.id, "queued packet sent");
                        }
                        Ok(_) => {
                            // transmit_inner already re-queued it
                        }
                        Err(err) => {
                            let retries = entry.retry_count + 1;
                            if retries >= processor.config.max_retries {
                                warn!(
                                    packet_id = %entry.packet.id,
                                    retries,
                                    error = %err,
                                    "queued packet dropped"
                                );
                            } else {
                                processor.enqueue(
                                    entry.packet,
                                    Instant::now()
                                        + Duration::from_millis(processor.config.retry_delay_ms),
                                    retries,
                                );
                            }
                        }
                    }
                }

                // Reassembly buffers have their own 5 s lifetime
                if let Ok(mut reassembler) = processor.reassembler.lock() {
                    reassembler.prune();
                }
            }
        });
        if let Ok(mut tasks) = self.inner.tasks.lock() {
            tasks.push(handle);
        }

        self.inner.available.store(true, Ordering::Relaxed);
        info!("long-range transport started");
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.inner.available.store(false, Ordering::Relaxed);
        if let Ok(mut tasks) = self.inner.tasks.lock() {
            for task in tasks.drain(..) {
                task.abort();
            }
        }
        if let Ok(mut queue) = self.inner.queue.lock() {
            queue.clear();
        }
        let driver = Arc::clone(&self.inner.driver);
        tokio::task::spawn_blocking(move || driver.stop())
            .await
            .ok();
        info!("long-range transport stopped");
        Ok(())
    }

    async fn transmit(&self, packet: &Packet) -> Result<TransmitResult> {
        if !self.is_available() {
            return Err(MeshError::unavailable(TransportTag::LongRange.as_str()));
        }
        self.inner.transmit_inner(packet, 0).await
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
            packets_received: self.inner.packets_received.load(Ordering::Relaxed),
            bytes_sent: radio.bytes_sent,
            bytes_received: radio.bytes_received,
            parse_errors: radio.parse_errors + self.inner.parse_errors.load(Ordering::Relaxed),
            peer_count: 0,
            bitrate_bps: self.inner.radio_config.bitrate_bps(),
        }
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FramingKind;
    use crate::framing::{Frame, RESP_ACK};
    use std::collections::VecDeque;
    use std::io::{self, Read, Write};

    fn node(byte: u8) -> NodeHash {
        NodeHash::new([byte; 16])
    }

    /// Serial endpoint that acks everything and records writes
    struct AckingSerial {
        written: Arc<Mutex<Vec<u8>>>,
        rx: Arc<Mutex<VecDeque<Vec<u8>>>>,
    }

    impl AckingSerial {
        fn new() -> (Self, Arc<Mutex<Vec<u8>>>, Arc<Mutex<VecDeque<Vec<u8>>>>) {
            let written = Arc::new(Mutex::new(Vec::new()));
            let rx = Arc::new(Mutex::new(VecDeque::new()));
            (
                Self {
                    written: Arc::clone(&written),
                    rx: Arc::clone(&rx),
                },
                written,
                rx,
            )
        }
    }

    impl Read for AckingSerial {
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

    impl Write for AckingSerial {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.written.lock().unwrap().extend_from_slice(buf);
            self.rx
                .lock()
                .unwrap()
                .push_back(Frame::new(RESP_ACK, vec![]).to_bytes().unwrap());
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn transport() -> (LongRangeTransport, Arc<Mutex<Vec<u8>>>) {
        let (serial, written, _rx) = AckingSerial::new();
        let driver = Arc::new(RadioDriver::new(Box::new(serial), FramingKind::Native));
        // Fast channel settings keep fragment pacing short in tests
        let radio_config = RadioConfig {
            spreading_factor: 7,
            bandwidth_hz: 500_000,
            coding_rate: 5,
            ..RadioConfig::default()
        };
        (
            LongRangeTransport::new(driver, radio_config, LongRangeConfig::default()),
            written,
        )
    }

    #[test]
    fn queue_orders_by_priority_then_due_time() {
        let now = Instant::now();
        let mut queue = BinaryHeap::new();
        let data = Packet::new_data(node(1), node(2), vec![1]);
        let handshake = Packet::new(node(1), node(2), PacketType::Handshake, vec![2]);
        let late_data = Packet::new_data(node(1), node(2), vec![3]);

        queue.push(QueuedPacket {
            packet: late_data,
            priority: 2,
            due_time: now + Duration::from_secs(5),
            retry_count: 0,
        });
        queue.push(QueuedPacket {
            packet: data,
            priority: 2,
            due_time: now,
            retry_count: 0,
        });
        queue.push(QueuedPacket {
            packet: handshake,
            priority: 0,
            due_time: now + Duration::from_secs(1),
            retry_count: 0,
        });

        assert_eq!(queue.pop().unwrap().priority, 0);
        let second = queue.pop().unwrap();
        assert_eq!(second.priority, 2);
        assert_eq!(second.due_time, now);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn transmit_fragments_in_order() {
        let (transport, written) = transport();
        transport.start().await.unwrap();

        // 450-byte payload at MTU 200 → three fragments on the air
        let payload: Vec<u8> = (0..450u16).map(|i| i as u8).collect();
        let packet = Packet::new_data(node(1), node(2), payload);
        let result = transport.transmit(&packet).await.unwrap();
        assert!(result.success);

        // Pull TX frame payloads back out of the wire capture
        let wire = written.lock().unwrap().clone();
        let mut parser = crate::framing::FrameParser::new();
        let frames = parser.push_bytes(&wire);
        let fragments: Vec<Fragment> = frames
            .iter()
            .filter(|f| f.command == crate::framing::CMD_TX)
            .map(|f| Fragment::from_bytes(&f.payload).unwrap())
            .collect();
        assert_eq!(fragments.len(), 3);
        assert!(fragments.iter().enumerate().all(|(i, f)| {
            f.fragment_num == i as u8 && f.total_fragments == 3
        }));

        transport.stop().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn duty_cycle_defers_and_queues() {
        let (transport, written) = transport();
        transport.start().await.unwrap();

        // Burn the whole 1% budget
        {
            let mut governor = transport.inner.governor.lock().unwrap();
            governor.log_transmission(36_001);
        }
        let wire_before = written.lock().unwrap().len();

        let packet = Packet::new_data(node(1), node(2), vec![0u8; 50]);
        let result = transport.transmit(&packet).await.unwrap();
        assert!(!result.success);
        assert!(result.queued);
        assert!(result.estimated_delivery.is_some());
        assert_eq!(transport.queued_count(), 1);
        // Nothing went over the serial link while deferred
        assert_eq!(written.lock().unwrap().len(), wire_before);

        transport.stop().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn rx_fragments_reassemble_to_packet() {
        let (transport, _written) = transport();
        transport.start().await.unwrap();

        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&received);
        transport.set_receive_callback(Arc::new(move |packet, metadata| {
            sink.lock().unwrap().push((packet, metadata));
        }));

        let payload = vec![0x5A; 450];
        let packet = Packet::new_data(node(7), node(8), payload.clone());
        let fragments = Fragmenter::new(200).fragment(&packet).unwrap();
        for fragment in fragments {
            transport.inner.handle_rx(RxEvent {
                data: fragment.to_bytes(),
                rssi_dbm: Some(-99),
                snr_db: Some(6.5),
            });
        }

        let events = received.lock().unwrap();
        assert_eq!(events.len(), 1);
        let (rebuilt, metadata) = &events[0];
        assert_eq!(rebuilt.payload, payload);
        assert_eq!(rebuilt.source, node(7));
        assert_eq!(metadata.rssi, Some(-99));
        // No buffer left behind
        assert_eq!(transport.inner.reassembler.lock().unwrap().pending(), 0);

        transport.stop().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn garbage_rx_counts_parse_error() {
        let (transport, _written) = transport();
        transport.start().await.unwrap();

        transport.inner.handle_rx(RxEvent {
            data: vec![0xFF, 0x00],
            rssi_dbm: None,
            snr_db: None,
        });
        assert!(transport.metrics().parse_errors >= 1);

        transport.stop().await.unwrap();
    }
}
