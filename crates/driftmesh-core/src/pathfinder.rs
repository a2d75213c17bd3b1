//! Distance-vector routing engine with link-quality scoring
//!
//! The pathfinder keeps three tables keyed by node address: forwarding
//! entries (per destination, per transport), direct neighbors, and
//! per-link transmission history. Paths carry a composite metric; lower
//! scores win. Announcements extend our table through the announcing
//! neighbor, and the transport manager consults
//! [`select_transport`](Pathfinder::select_transport) before every send.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::PathfinderConfig;
use crate::errors::{MeshError, Result};
use crate::packet::{Packet, TransportMetadata};
use crate::types::{NodeHash, TransportTag};

// ----------------------------------------------------------------------------
// Path Metric
// ----------------------------------------------------------------------------

/// Composite link/path quality
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PathMetric {
    /// End-to-end latency estimate in milliseconds
    pub latency_ms: f64,
    /// Delivery probability in [0, 1]
    pub reliability: f64,
    /// Link bandwidth in bits per second
    pub bandwidth_bps: u64,
    /// Relative energy cost of using the path
    pub energy_cost: f64,
    /// Transmissions needed to reach the destination
    pub hop_count: u8,
}

impl PathMetric {
    /// Weighted scalar score; lower is better
    pub fn score(&self) -> f64 {
        let normalized_latency = (self.latency_ms / 1000.0).min(10.0);
        let normalized_bw = 1_000_000.0 / self.bandwidth_bps.max(1) as f64;
        0.25 * normalized_latency
            + 0.25 * (1.0 - self.reliability) * 100.0
            + 0.20 * normalized_bw
            + 0.15 * self.energy_cost
            + 0.15 * f64::from(self.hop_count) * 10.0
    }
}

// ----------------------------------------------------------------------------
// Table Entries
// ----------------------------------------------------------------------------

/// One known route to a destination
#[derive(Debug, Clone)]
pub struct PathEntry {
    pub destination: NodeHash,
    pub next_hop: NodeHash,
    pub transport: TransportTag,
    pub hops: u8,
    pub metric: PathMetric,
    pub expires_at: Instant,
}

impl PathEntry {
    pub fn is_expired(&self) -> bool {
        self.expires_at <= Instant::now()
    }
}

/// A directly heard peer
#[derive(Debug, Clone)]
pub struct NeighborEntry {
    pub identity: NodeHash,
    pub transport: TransportTag,
    pub last_seen: Instant,
    pub direct_link: bool,
    pub hops: u8,
}

/// Sliding window of transmission outcomes for one (transport, peer) link
#[derive(Debug, Default)]
struct LinkHistory {
    samples: VecDeque<(Instant, bool, Option<u64>)>,
    reliability: f64,
    latency_ms: f64,
}

impl LinkHistory {
    fn push(&mut self, success: bool, rtt_ms: Option<u64>, window: usize) {
        if self.samples.len() >= window {
            self.samples.pop_front();
        }
        self.samples.push_back((Instant::now(), success, rtt_ms));
        self.recompute(self.samples.len());
    }

    fn recompute(&mut self, take: usize) {
        let take = take.min(self.samples.len());
        if take == 0 {
            return;
        }
        let recent = self.samples.iter().rev().take(take);
        let mut successes = 0usize;
        let mut rtt_sum = 0u64;
        let mut rtt_count = 0usize;
        for (_, success, rtt) in recent {
            if *success {
                successes += 1;
                if let Some(rtt) = rtt {
                    rtt_sum += rtt;
                    rtt_count += 1;
                }
            }
        }
        self.reliability = successes as f64 / take as f64;
        if rtt_count > 0 {
            self.latency_ms = rtt_sum as f64 / rtt_count as f64;
        }
    }
}

// ----------------------------------------------------------------------------
// Announcements
// ----------------------------------------------------------------------------

/// One path advertised in an announcement
#[derive(Debug, Clone, PartialEq)]
pub struct AnnouncedPath {
    pub destination: NodeHash,
    pub hops: u8,
    pub latency_ms: u32,
    /// Reliability in thousandths
    pub reliability_permille: u16,
    pub bandwidth_bps: u32,
}

/// Set of paths a node advertises to its neighbors
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Announcement {
    pub paths: Vec<AnnouncedPath>,
}

impl Announcement {
    const ENTRY_SIZE: usize = 16 + 1 + 4 + 2 + 4;

    /// Serialize for transport as an `Announce` packet payload
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(1 + self.paths.len() * Self::ENTRY_SIZE);
        bytes.push(self.paths.len() as u8);
        for path in &self.paths {
            bytes.extend_from_slice(path.destination.as_bytes());
            bytes.push(path.hops);
            bytes.extend_from_slice(&path.latency_ms.to_be_bytes());
            bytes.extend_from_slice(&path.reliability_permille.to_be_bytes());
            bytes.extend_from_slice(&path.bandwidth_bps.to_be_bytes());
        }
        bytes
    }

    /// Parse an announcement payload
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.is_empty() {
            return Err(MeshError::malformed("empty announcement"));
        }
        let count = bytes[0] as usize;
        let expected = 1 + count * Self::ENTRY_SIZE;
        if bytes.len() < expected {
            return Err(MeshError::malformed("truncated announcement"));
        }
        let mut paths = Vec::with_capacity(count);
        for i in 0..count {
            let off = 1 + i * Self::ENTRY_SIZE;
            let dest_bytes: [u8; 16] = bytes[off..off + 16]
                .try_into()
                .map_err(|_| MeshError::malformed("bad announcement entry"))?;
            let latency_bytes: [u8; 4] = bytes[off + 17..off + 21]
                .try_into()
                .map_err(|_| MeshError::malformed("bad announcement entry"))?;
            let rel_bytes: [u8; 2] = bytes[off + 21..off + 23]
                .try_into()
                .map_err(|_| MeshError::malformed("bad announcement entry"))?;
            let bw_bytes: [u8; 4] = bytes[off + 23..off + 27]
                .try_into()
                .map_err(|_| MeshError::malformed("bad announcement entry"))?;
            paths.push(AnnouncedPath {
                destination: NodeHash::new(dest_bytes),
                hops: bytes[off + 16],
                latency_ms: u32::from_be_bytes(latency_bytes),
                reliability_permille: u16::from_be_bytes(rel_bytes),
                bandwidth_bps: u32::from_be_bytes(bw_bytes),
            });
        }
        Ok(Self { paths })
    }
}

// ----------------------------------------------------------------------------
// Transport Selection
// ----------------------------------------------------------------------------

/// How urgently the caller needs the packet through
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Urgency {
    Low,
    Normal,
    Critical,
}

/// Sending strategy chosen by the decision table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionStrategy {
    /// No known path: try everything
    Flood,
    /// One good path
    Unicast,
    /// One usable path, keep the others warm
    UnicastWithFallback,
    /// Urgent or unreliable: send on all transports in parallel
    MultiTransport,
}

/// Outcome of transport selection
#[derive(Debug, Clone)]
pub struct TransportSelection {
    pub strategy: SelectionStrategy,
    pub primary: Option<TransportTag>,
    pub fallbacks: Vec<TransportTag>,
}

/// Constraints for path queries
#[derive(Debug, Clone, Copy, Default)]
pub struct PathConstraints {
    pub min_bandwidth_bps: Option<u64>,
    pub max_latency_ms: Option<f64>,
    pub max_hops: Option<u8>,
}

// ----------------------------------------------------------------------------
// Pathfinder
// ----------------------------------------------------------------------------

struct Tables {
    forwarding: HashMap<NodeHash, HashMap<TransportTag, PathEntry>>,
    neighbors: HashMap<NodeHash, NeighborEntry>,
    links: HashMap<(TransportTag, NodeHash), LinkHistory>,
}

/// Distance-vector routing engine
pub struct Pathfinder {
    config: PathfinderConfig,
    tables: Mutex<Tables>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Pathfinder {
    pub fn new(config: PathfinderConfig) -> Self {
        Self {
            config,
            tables: Mutex::new(Tables {
                forwarding: HashMap::new(),
                neighbors: HashMap::new(),
                links: HashMap::new(),
            }),
            tasks: Mutex::new(Vec::new()),
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Tables>> {
        self.tables
            .lock()
            .map_err(|_| MeshError::malformed("pathfinder tables poisoned"))
    }

    /// Known paths to `dest`, filtered and sorted by ascending score
    pub fn find_path(&self, dest: &NodeHash, constraints: PathConstraints) -> Result<Vec<PathEntry>> {
        let tables = self.lock()?;
        let mut paths: Vec<PathEntry> = tables
            .forwarding
            .get(dest)
            .map(|per_transport| {
                per_transport
                    .values()
                    .filter(|entry| !entry.is_expired())
                    .filter(|entry| {
                        constraints
                            .min_bandwidth_bps
                            .map_or(true, |min| entry.metric.bandwidth_bps >= min)
                            && constraints
                                .max_latency_ms
                                .map_or(true, |max| entry.metric.latency_ms <= max)
                            && constraints.max_hops.map_or(true, |max| entry.hops <= max)
                    })
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        paths.sort_by(|a, b| {
            a.metric
                .score()
                .partial_cmp(&b.metric.score())
                .unwrap_or(core::cmp::Ordering::Equal)
        });
        Ok(paths)
    }

    /// Decide how to send toward `dest` given the transports that are up
    pub fn select_transport(
        &self,
        dest: &NodeHash,
        urgency: Urgency,
        available: &[TransportTag],
    ) -> Result<TransportSelection> {
        let paths = self.find_path(dest, PathConstraints::default())?;
        let usable: Vec<&PathEntry> = paths
            .iter()
            .filter(|p| available.contains(&p.transport))
            .collect();

        let Some(best) = usable.first() else {
            return Ok(TransportSelection {
                strategy: SelectionStrategy::Flood,
                primary: None,
                fallbacks: available.to_vec(),
            });
        };

        let reliability = best.metric.reliability;
        let others: Vec<TransportTag> = available
            .iter()
            .copied()
            .filter(|tag| *tag != best.transport)
            .collect();

        let selection = if urgency == Urgency::Critical || reliability < 0.4 {
            TransportSelection {
                strategy: SelectionStrategy::MultiTransport,
                primary: None,
                fallbacks: available.to_vec(),
            }
        } else if reliability > 0.9 && best.hops <= 2 {
            TransportSelection {
                strategy: SelectionStrategy::Unicast,
                primary: Some(best.transport),
                fallbacks: Vec::new(),
            }
        } else if reliability > 0.6 {
            TransportSelection {
                strategy: SelectionStrategy::UnicastWithFallback,
                primary: Some(best.transport),
                fallbacks: others,
            }
        } else {
            TransportSelection {
                strategy: SelectionStrategy::Unicast,
                primary: Some(best.transport),
                fallbacks: Vec::new(),
            }
        };
        Ok(selection)
    }

    /// Record one transmission outcome and refresh the matching path metric
    ///
    /// The forwarding entry keeps its next hop; only the quality numbers
    /// move.
    pub fn update_metrics(
        &self,
        dest: &NodeHash,
        transport: TransportTag,
        success: bool,
        rtt_ms: Option<u64>,
    ) -> Result<()> {
        let mut tables = self.lock()?;
        let window = self.config.history_window;
        let history = tables.links.entry((transport, *dest)).or_default();
        history.push(success, rtt_ms, window);
        let (reliability, latency_ms) = (history.reliability, history.latency_ms);

        if let Some(entry) = tables
            .forwarding
            .get_mut(dest)
            .and_then(|per_transport| per_transport.get_mut(&transport))
        {
            entry.metric.reliability = reliability;
            if latency_ms > 0.0 {
                entry.metric.latency_ms = latency_ms;
            }
        }
        Ok(())
    }

    /// Ingest a neighbor's announcement
    ///
    /// The announcing node becomes a direct neighbor and a one-hop path;
    /// each advertised path is extended through the neighbor (hops + 1,
    /// added link latency, reliability damped by 0.95) and installed when
    /// no entry exists, the current one has expired, or the candidate
    /// scores strictly better.
    pub fn handle_announcement(
        &self,
        from: NodeHash,
        transport: TransportTag,
        metadata: &TransportMetadata,
        announcement: &Announcement,
    ) -> Result<()> {
        let mut tables = self.lock()?;
        let now = Instant::now();
        let expiry = now + self.config.path_expiry;
        let link_latency = metadata.link_latency_ms.unwrap_or(0) as f64;

        tables.neighbors.insert(
            from,
            NeighborEntry {
                identity: from,
                transport,
                last_seen: now,
                direct_link: true,
                hops: metadata.hops,
            },
        );

        let link_reliability = tables
            .links
            .get(&(transport, from))
            .map(|h| h.reliability)
            .filter(|r| *r > 0.0)
            .unwrap_or(0.9);

        let direct = PathEntry {
            destination: from,
            next_hop: from,
            transport,
            hops: 1,
            metric: PathMetric {
                latency_ms: link_latency.max(1.0),
                reliability: link_reliability,
                bandwidth_bps: default_bandwidth(transport),
                energy_cost: default_energy(transport),
                hop_count: 1,
            },
            expires_at: expiry,
        };
        Self::install(&mut tables.forwarding, direct);

        for path in &announcement.paths {
            // Our own advertisements echoed back are not paths
            if path.destination == from {
                continue;
            }
            let candidate = PathEntry {
                destination: path.destination,
                next_hop: from,
                transport,
                hops: path.hops.saturating_add(1),
                metric: PathMetric {
                    latency_ms: f64::from(path.latency_ms) + link_latency,
                    reliability: (f64::from(path.reliability_permille) / 1000.0) * 0.95,
                    bandwidth_bps: u64::from(path.bandwidth_bps),
                    energy_cost: default_energy(transport),
                    hop_count: path.hops.saturating_add(1),
                },
                expires_at: expiry,
            };
            Self::install(&mut tables.forwarding, candidate);
        }
        Ok(())
    }

    fn install(
        forwarding: &mut HashMap<NodeHash, HashMap<TransportTag, PathEntry>>,
        candidate: PathEntry,
    ) {
        let per_transport = forwarding.entry(candidate.destination).or_default();
        match per_transport.get(&candidate.transport) {
            Some(current)
                if !current.is_expired()
                    && current.metric.score() <= candidate.metric.score() => {}
            _ => {
                debug!(
                    dest = %candidate.destination,
                    transport = %candidate.transport,
                    score = candidate.metric.score(),
                    "path installed"
                );
                per_transport.insert(candidate.transport, candidate);
            }
        }
    }

    /// Whether a received packet should be forwarded on another transport
    pub fn should_relay(&self, packet: &Packet, received_on: TransportTag) -> Result<bool> {
        if packet.hops >= packet.ttl.value() {
            return Ok(false);
        }
        let paths = self.find_path(&packet.destination, PathConstraints::default())?;
        if paths.is_empty() {
            return Ok(false);
        }
        let arrival_score = paths
            .iter()
            .find(|p| p.transport == received_on)
            .map(|p| p.metric.score());
        let better_elsewhere = paths.iter().any(|p| {
            p.transport != received_on
                && arrival_score.map_or(true, |score| p.metric.score() < score)
        });
        Ok(better_elsewhere)
    }

    /// Build the announcement advertising our best short paths
    pub fn create_announcement(&self) -> Result<Announcement> {
        let tables = self.lock()?;
        let mut paths: Vec<AnnouncedPath> = Vec::new();
        for per_transport in tables.forwarding.values() {
            let best = per_transport
                .values()
                .filter(|entry| !entry.is_expired() && entry.hops <= 2)
                .min_by(|a, b| {
                    a.metric
                        .score()
                        .partial_cmp(&b.metric.score())
                        .unwrap_or(core::cmp::Ordering::Equal)
                });
            if let Some(entry) = best {
                paths.push(AnnouncedPath {
                    destination: entry.destination,
                    hops: entry.hops,
                    latency_ms: entry.metric.latency_ms as u32,
                    reliability_permille: (entry.metric.reliability * 1000.0) as u16,
                    bandwidth_bps: entry.metric.bandwidth_bps.min(u64::from(u32::MAX)) as u32,
                });
            }
        }
        paths.truncate(255);
        Ok(Announcement { paths })
    }

    /// Drop expired forwarding entries and silent neighbors
    pub fn purge_expired(&self) -> Result<usize> {
        let mut tables = self.lock()?;
        let now = Instant::now();
        let expiry = self.config.path_expiry;
        let mut removed = 0;

        for per_transport in tables.forwarding.values_mut() {
            let before = per_transport.len();
            per_transport.retain(|_, entry| entry.expires_at > now);
            removed += before - per_transport.len();
        }
        tables.forwarding.retain(|_, v| !v.is_empty());
        tables
            .neighbors
            .retain(|_, n| now.duration_since(n.last_seen) < expiry);
        Ok(removed)
    }

    /// Recompute link reliability over the most recent samples
    pub fn recompute_recent_metrics(&self) -> Result<()> {
        let mut tables = self.lock()?;
        let recent = self.config.recent_samples;
        for history in tables.links.values_mut() {
            history.recompute(recent);
        }
        Ok(())
    }

    /// Current neighbor snapshot, for persistence warm-starts
    pub fn export_neighbors(&self) -> Result<Vec<NeighborEntry>> {
        let tables = self.lock()?;
        Ok(tables.neighbors.values().cloned().collect())
    }

    /// Seed the neighbor table from a persisted snapshot
    pub fn import_neighbors(&self, neighbors: Vec<NeighborEntry>) -> Result<()> {
        let mut tables = self.lock()?;
        for neighbor in neighbors {
            tables.neighbors.insert(neighbor.identity, neighbor);
        }
        Ok(())
    }

    /// Direct neighbor count, for status reporting
    pub fn neighbor_count(&self) -> Result<usize> {
        Ok(self.lock()?.neighbors.len())
    }

    /// Spawn the periodic announce/cleanup/recompute tasks
    ///
    /// Announcements are pushed into `announce_tx`; the owner decides how
    /// they travel. Tasks run until [`stop`](Self::stop).
    pub fn start(self: &Arc<Self>, announce_tx: mpsc::Sender<Announcement>) -> Result<()> {
        let mut tasks = self
            .tasks
            .lock()
            .map_err(|_| MeshError::malformed("pathfinder task list poisoned"))?;

        let announcer = Arc::clone(self);
        tasks.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(announcer.config.announce_interval);
            loop {
                ticker.tick().await;
                match announcer.create_announcement() {
                    Ok(announcement) => {
                        if announce_tx.send(announcement).await.is_err() {
                            break;
                        }
                    }
                    Err(err) => warn!(error = %err, "announcement build failed"),
                }
            }
        }));

        let cleaner = Arc::clone(self);
        tasks.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(cleaner.config.cleanup_interval);
            loop {
                ticker.tick().await;
                if let Ok(removed) = cleaner.purge_expired() {
                    if removed > 0 {
                        debug!(removed, "expired paths purged");
                    }
                }
            }
        }));

        let scorer = Arc::clone(self);
        tasks.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(scorer.config.metrics_interval);
            loop {
                ticker.tick().await;
                let _ = scorer.recompute_recent_metrics();
            }
        }));

        Ok(())
    }

    /// Cancel the periodic tasks
    pub fn stop(&self) {
        if let Ok(mut tasks) = self.tasks.lock() {
            for task in tasks.drain(..) {
                task.abort();
            }
        }
    }
}

impl Drop for Pathfinder {
    fn drop(&mut self) {
        self.stop();
    }
}

fn default_bandwidth(transport: TransportTag) -> u64 {
    match transport {
        TransportTag::ShortRange => 2_000_000,
        TransportTag::LongRange => 1_760,
        TransportTag::Fmp => 1_760,
    }
}

fn default_energy(transport: TransportTag) -> f64 {
    match transport {
        TransportTag::ShortRange => 1.0,
        TransportTag::LongRange => 3.0,
        TransportTag::Fmp => 3.0,
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Ttl;

    fn node(byte: u8) -> NodeHash {
        NodeHash::new([byte; 16])
    }

    fn pathfinder() -> Pathfinder {
        Pathfinder::new(PathfinderConfig::default())
    }

    fn metadata(transport: TransportTag) -> TransportMetadata {
        TransportMetadata::for_transport(transport)
    }

    #[test]
    fn score_prefers_better_paths_on_every_dimension() {
        let good = PathMetric {
            latency_ms: 50.0,
            reliability: 0.99,
            bandwidth_bps: 2_000_000,
            energy_cost: 1.0,
            hop_count: 1,
        };
        let bad = PathMetric {
            latency_ms: 900.0,
            reliability: 0.60,
            bandwidth_bps: 290,
            energy_cost: 3.0,
            hop_count: 4,
        };
        assert!(good.score() < bad.score());
    }

    #[test]
    fn announcement_installs_neighbor_and_extended_paths() {
        let pf = pathfinder();
        let neighbor = node(1);
        let far = node(2);

        let announcement = Announcement {
            paths: vec![AnnouncedPath {
                destination: far,
                hops: 1,
                latency_ms: 100,
                reliability_permille: 900,
                bandwidth_bps: 5_470,
            }],
        };
        pf.handle_announcement(
            neighbor,
            TransportTag::LongRange,
            &metadata(TransportTag::LongRange),
            &announcement,
        )
        .unwrap();

        let to_neighbor = pf.find_path(&neighbor, PathConstraints::default()).unwrap();
        assert_eq!(to_neighbor.len(), 1);
        assert_eq!(to_neighbor[0].hops, 1);
        assert_eq!(to_neighbor[0].next_hop, neighbor);

        let to_far = pf.find_path(&far, PathConstraints::default()).unwrap();
        assert_eq!(to_far.len(), 1);
        assert_eq!(to_far[0].hops, 2);
        assert_eq!(to_far[0].next_hop, neighbor);
        // Reliability damped through the extra hop
        assert!((to_far[0].metric.reliability - 0.855).abs() < 1e-9);
    }

    #[test]
    fn worse_candidate_does_not_replace_entry() {
        let pf = pathfinder();
        let neighbor = node(1);
        let far = node(2);

        let strong = Announcement {
            paths: vec![AnnouncedPath {
                destination: far,
                hops: 1,
                latency_ms: 50,
                reliability_permille: 950,
                bandwidth_bps: 5_470,
            }],
        };
        let weak = Announcement {
            paths: vec![AnnouncedPath {
                destination: far,
                hops: 4,
                latency_ms: 900,
                reliability_permille: 400,
                bandwidth_bps: 290,
            }],
        };
        let md = metadata(TransportTag::LongRange);
        pf.handle_announcement(neighbor, TransportTag::LongRange, &md, &strong)
            .unwrap();
        let installed = pf.find_path(&far, PathConstraints::default()).unwrap()[0].clone();

        pf.handle_announcement(neighbor, TransportTag::LongRange, &md, &weak)
            .unwrap();
        let after = pf.find_path(&far, PathConstraints::default()).unwrap();
        assert_eq!(after[0].hops, installed.hops);
    }

    #[test]
    fn constraints_filter_paths() {
        let pf = pathfinder();
        let neighbor = node(1);
        let far = node(2);
        let announcement = Announcement {
            paths: vec![AnnouncedPath {
                destination: far,
                hops: 3,
                latency_ms: 400,
                reliability_permille: 800,
                bandwidth_bps: 290,
            }],
        };
        pf.handle_announcement(
            neighbor,
            TransportTag::LongRange,
            &metadata(TransportTag::LongRange),
            &announcement,
        )
        .unwrap();

        let all = pf.find_path(&far, PathConstraints::default()).unwrap();
        assert_eq!(all.len(), 1);

        let constrained = pf
            .find_path(
                &far,
                PathConstraints {
                    max_hops: Some(2),
                    ..Default::default()
                },
            )
            .unwrap();
        assert!(constrained.is_empty());

        let bw = pf
            .find_path(
                &far,
                PathConstraints {
                    min_bandwidth_bps: Some(1_000_000),
                    ..Default::default()
                },
            )
            .unwrap();
        assert!(bw.is_empty());
    }

    #[test]
    fn selection_floods_without_paths() {
        let pf = pathfinder();
        let available = [TransportTag::ShortRange, TransportTag::LongRange];
        let selection = pf
            .select_transport(&node(9), Urgency::Normal, &available)
            .unwrap();
        assert_eq!(selection.strategy, SelectionStrategy::Flood);
        assert!(selection.primary.is_none());
        assert_eq!(selection.fallbacks, available.to_vec());
    }

    #[test]
    fn selection_unicasts_on_reliable_short_path() {
        let pf = pathfinder();
        let neighbor = node(1);
        pf.handle_announcement(
            neighbor,
            TransportTag::ShortRange,
            &metadata(TransportTag::ShortRange),
            &Announcement::default(),
        )
        .unwrap();
        // Push the link reliability over the 0.9 unicast threshold
        for _ in 0..20 {
            pf.update_metrics(&neighbor, TransportTag::ShortRange, true, Some(10))
                .unwrap();
        }

        let selection = pf
            .select_transport(
                &neighbor,
                Urgency::Normal,
                &[TransportTag::ShortRange, TransportTag::LongRange],
            )
            .unwrap();
        assert_eq!(selection.strategy, SelectionStrategy::Unicast);
        assert_eq!(selection.primary, Some(TransportTag::ShortRange));
        assert!(selection.fallbacks.is_empty());
    }

    #[test]
    fn critical_urgency_forces_multi_transport() {
        let pf = pathfinder();
        let neighbor = node(1);
        pf.handle_announcement(
            neighbor,
            TransportTag::ShortRange,
            &metadata(TransportTag::ShortRange),
            &Announcement::default(),
        )
        .unwrap();

        let available = [TransportTag::ShortRange, TransportTag::LongRange];
        let selection = pf
            .select_transport(&neighbor, Urgency::Critical, &available)
            .unwrap();
        assert_eq!(selection.strategy, SelectionStrategy::MultiTransport);
        assert_eq!(selection.fallbacks, available.to_vec());
    }

    #[test]
    fn update_metrics_keeps_next_hop() {
        let pf = pathfinder();
        let neighbor = node(1);
        pf.handle_announcement(
            neighbor,
            TransportTag::LongRange,
            &metadata(TransportTag::LongRange),
            &Announcement::default(),
        )
        .unwrap();

        pf.update_metrics(&neighbor, TransportTag::LongRange, false, None)
            .unwrap();
        pf.update_metrics(&neighbor, TransportTag::LongRange, true, Some(250))
            .unwrap();

        let paths = pf.find_path(&neighbor, PathConstraints::default()).unwrap();
        assert_eq!(paths[0].next_hop, neighbor);
        assert!((paths[0].metric.reliability - 0.5).abs() < 1e-9);
        assert!((paths[0].metric.latency_ms - 250.0).abs() < 1e-9);
    }

    #[test]
    fn should_relay_requires_better_path_elsewhere() {
        let pf = pathfinder();
        let neighbor = node(1);
        let md_short = metadata(TransportTag::ShortRange);
        let md_long = metadata(TransportTag::LongRange);
        pf.handle_announcement(neighbor, TransportTag::LongRange, &md_long, &Announcement::default())
            .unwrap();

        let mut packet = Packet::new_data(node(5), neighbor, vec![]).with_ttl(Ttl::new(4));
        packet.hops = 1;

        // Only a long-range path exists; a packet arriving on long-range
        // has nowhere better to go
        assert!(!pf.should_relay(&packet, TransportTag::LongRange).unwrap());

        // A short-range path (faster, cheaper) makes relaying worthwhile
        pf.handle_announcement(neighbor, TransportTag::ShortRange, &md_short, &Announcement::default())
            .unwrap();
        assert!(pf.should_relay(&packet, TransportTag::LongRange).unwrap());

        // Exhausted TTL never relays
        packet.hops = 4;
        assert!(!pf.should_relay(&packet, TransportTag::LongRange).unwrap());
    }

    #[test]
    fn announcement_wire_round_trip() {
        let announcement = Announcement {
            paths: vec![
                AnnouncedPath {
                    destination: node(7),
                    hops: 2,
                    latency_ms: 420,
                    reliability_permille: 930,
                    bandwidth_bps: 5_470,
                },
                AnnouncedPath {
                    destination: node(8),
                    hops: 1,
                    latency_ms: 15,
                    reliability_permille: 990,
                    bandwidth_bps: 2_000_000,
                },
            ],
        };
        let parsed = Announcement::from_bytes(&announcement.to_bytes()).unwrap();
        assert_eq!(parsed, announcement);
    }

    #[test]
    fn create_announcement_advertises_short_paths_only() {
        let pf = pathfinder();
        let neighbor = node(1);
        let far = node(2);
        let announcement = Announcement {
            paths: vec![AnnouncedPath {
                destination: far,
                hops: 2,
                latency_ms: 100,
                reliability_permille: 900,
                bandwidth_bps: 5_470,
            }],
        };
        pf.handle_announcement(
            neighbor,
            TransportTag::LongRange,
            &metadata(TransportTag::LongRange),
            &announcement,
        )
        .unwrap();

        let ours = pf.create_announcement().unwrap();
        // Path to the neighbor (1 hop) is advertised; the extended path to
        // `far` is now 3 hops and stays private
        assert_eq!(ours.paths.len(), 1);
        assert_eq!(ours.paths[0].destination, neighbor);
    }
}
