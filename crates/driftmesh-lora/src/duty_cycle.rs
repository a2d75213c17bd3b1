//! Regulatory duty-cycle accounting
//!
//! ISM-band regulations cap the fraction of time a transmitter may occupy
//! the air over a rolling window. The governor keeps a ring of
//! `(timestamp, airtime)` records and answers two questions before every
//! transmission: how long will these bytes be on the air, and how long
//! must the caller wait so the budget is respected. Deferred callers
//! re-queue the packet with `due_at = now + backoff`.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::debug;

// ----------------------------------------------------------------------------
// Region Profile
// ----------------------------------------------------------------------------

/// One regulated sub-band
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Band {
    pub low_hz: u32,
    pub high_hz: u32,
    /// Allowed on-air fraction, e.g. 0.01 for 1%
    pub duty_limit: f64,
}

/// A regulatory region: a set of sub-bands with duty limits
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegionProfile {
    pub name: String,
    pub bands: Vec<Band>,
}

impl RegionProfile {
    /// The single reference profile: 1% on the main band, 0.1% on the
    /// middle band, 10% on the top band.
    pub fn eu868() -> Self {
        Self {
            name: "EU868".to_string(),
            bands: vec![
                Band {
                    low_hz: 868_000_000,
                    high_hz: 868_600_000,
                    duty_limit: 0.01,
                },
                Band {
                    low_hz: 868_700_000,
                    high_hz: 869_200_000,
                    duty_limit: 0.001,
                },
                Band {
                    low_hz: 869_400_000,
                    high_hz: 869_650_000,
                    duty_limit: 0.10,
                },
            ],
        }
    }

    /// Duty limit of the band containing `frequency_hz`
    ///
    /// Frequencies outside every listed band fall back to the strictest
    /// limit in the profile.
    pub fn limit_for(&self, frequency_hz: u32) -> f64 {
        self.bands
            .iter()
            .find(|band| (band.low_hz..=band.high_hz).contains(&frequency_hz))
            .map(|band| band.duty_limit)
            .unwrap_or_else(|| {
                self.bands
                    .iter()
                    .map(|b| b.duty_limit)
                    .fold(f64::INFINITY, f64::min)
            })
    }
}

impl Default for RegionProfile {
    fn default() -> Self {
        Self::eu868()
    }
}

// ----------------------------------------------------------------------------
// Airtime Estimation
// ----------------------------------------------------------------------------

/// Closed-form LoRa airtime from the symbol equation
///
/// Symbol duration is `2^SF / BW`; a transmission spends the preamble
/// (16 symbols plus sync) followed by `8 + ceil((8N − 4SF + 28 + 16) /
/// (4SF))` symbol groups, each group costing the coding-rate denominator
/// in symbols.
pub fn estimate_airtime_ms(
    payload_bytes: usize,
    spreading_factor: u8,
    bandwidth_hz: u32,
    coding_rate: u8,
) -> u64 {
    let sf = f64::from(spreading_factor.clamp(7, 12));
    let bw = f64::from(bandwidth_hz.max(1));
    let n = payload_bytes as f64;
    let cr_den = f64::from(coding_rate.clamp(5, 8));

    let symbol_ms = (2f64.powf(sf) / bw) * 1000.0;
    let preamble_symbols = 16.0 + 4.25;
    let numerator = 8.0 * n - 4.0 * sf + 28.0 + 16.0;
    let groups = (numerator / (4.0 * sf)).ceil().max(0.0);
    let payload_symbols = 8.0 + groups * cr_den;

    ((preamble_symbols + payload_symbols) * symbol_ms).ceil() as u64
}

// ----------------------------------------------------------------------------
// Governor
// ----------------------------------------------------------------------------

/// Measurement window over which duty limits apply
pub const DUTY_WINDOW: Duration = Duration::from_secs(3600);

/// Enforces per-band airtime budgets over a rolling one-hour window
#[derive(Debug)]
pub struct DutyCycleGovernor {
    profile: RegionProfile,
    frequency_hz: u32,
    bandwidth_hz: u32,
    coding_rate: u8,
    records: VecDeque<(Instant, u64)>,
}

impl DutyCycleGovernor {
    pub fn new(profile: RegionProfile, frequency_hz: u32, bandwidth_hz: u32, coding_rate: u8) -> Self {
        Self {
            profile,
            frequency_hz,
            bandwidth_hz,
            coding_rate,
            records: VecDeque::new(),
        }
    }

    /// Follow a radio reconfiguration
    pub fn set_channel(&mut self, frequency_hz: u32, bandwidth_hz: u32, coding_rate: u8) {
        self.frequency_hz = frequency_hz;
        self.bandwidth_hz = bandwidth_hz;
        self.coding_rate = coding_rate;
    }

    /// On-air estimate for a payload at the current channel settings
    pub fn estimate_airtime(&self, payload_bytes: usize, spreading_factor: u8) -> u64 {
        estimate_airtime_ms(
            payload_bytes,
            spreading_factor,
            self.bandwidth_hz,
            self.coding_rate,
        )
    }

    /// Milliseconds until `payload_bytes` may go on the air; zero when the
    /// budget already allows it
    pub fn backoff_for(&mut self, payload_bytes: usize, spreading_factor: u8) -> u64 {
        self.backoff_for_at(payload_bytes, spreading_factor, Instant::now())
    }

    /// Clock-injected variant used by tests
    pub fn backoff_for_at(
        &mut self,
        payload_bytes: usize,
        spreading_factor: u8,
        now: Instant,
    ) -> u64 {
        self.expire(now);

        let estimate = self.estimate_airtime(payload_bytes, spreading_factor);
        let limit = self.profile.limit_for(self.frequency_hz);
        let budget_ms = (DUTY_WINDOW.as_millis() as f64 * limit) as u64;
        let used: u64 = self.records.iter().map(|(_, ms)| ms).sum();

        if used + estimate <= budget_ms {
            return 0;
        }

        // Walk the ring oldest-first until enough airtime has aged out
        let mut freed = 0u64;
        for (stamp, airtime) in &self.records {
            freed += airtime;
            if used - freed + estimate <= budget_ms {
                let ages_out = *stamp + DUTY_WINDOW;
                let backoff = ages_out.saturating_duration_since(now).as_millis() as u64;
                debug!(backoff_ms = backoff, "duty cycle deferral");
                return backoff.max(1);
            }
        }

        // The estimate alone exceeds the whole budget; wait a full window
        DUTY_WINDOW.as_millis() as u64
    }

    /// Record a completed transmission
    pub fn log_transmission(&mut self, airtime_ms: u64) {
        self.log_transmission_at(airtime_ms, Instant::now());
    }

    /// Clock-injected variant used by tests
    pub fn log_transmission_at(&mut self, airtime_ms: u64, now: Instant) {
        self.records.push_back((now, airtime_ms));
    }

    /// Airtime consumed inside the current window
    pub fn used_airtime_ms(&mut self) -> u64 {
        self.expire(Instant::now());
        self.records.iter().map(|(_, ms)| ms).sum()
    }

    fn expire(&mut self, now: Instant) {
        while let Some((stamp, _)) = self.records.front() {
            if now.duration_since(*stamp) > DUTY_WINDOW {
                self.records.pop_front();
            } else {
                break;
            }
        }
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn governor() -> DutyCycleGovernor {
        DutyCycleGovernor::new(RegionProfile::eu868(), 868_100_000, 125_000, 8)
    }

    #[test]
    fn airtime_grows_with_payload_and_sf() {
        let short = estimate_airtime_ms(20, 7, 125_000, 5);
        let long = estimate_airtime_ms(200, 7, 125_000, 5);
        assert!(long > short);

        let slow = estimate_airtime_ms(20, 12, 125_000, 5);
        assert!(slow > short);

        // SF12/125k symbols are 32.8 ms; even a small frame takes seconds
        assert!(slow > 1_000);
    }

    #[test]
    fn band_limits() {
        let profile = RegionProfile::eu868();
        assert_eq!(profile.limit_for(868_100_000), 0.01);
        assert_eq!(profile.limit_for(869_000_000), 0.001);
        assert_eq!(profile.limit_for(869_500_000), 0.10);
        // Outside every band: strictest limit applies
        assert_eq!(profile.limit_for(870_000_000), 0.001);
    }

    #[test]
    fn no_backoff_under_budget() {
        let mut gov = governor();
        assert_eq!(gov.backoff_for(100, 9), 0);
    }

    #[test]
    fn backoff_after_budget_spent() {
        let mut gov = governor();
        let start = Instant::now();
        // 1% of an hour is 36 000 ms; spend just past it
        gov.log_transmission_at(36_001, start);
        let backoff = gov.backoff_for_at(100, 9, start + Duration::from_secs(1));
        assert!(backoff > 0);
        // The record ages out a window after it was logged
        assert!(backoff <= DUTY_WINDOW.as_millis() as u64);
    }

    #[test]
    fn budget_recovers_as_records_age_out() {
        let mut gov = governor();
        let start = Instant::now();
        gov.log_transmission_at(36_001, start);
        // One window later the record is gone
        let later = start + DUTY_WINDOW + Duration::from_secs(1);
        assert_eq!(gov.backoff_for_at(100, 9, later), 0);
    }

    #[test]
    fn rolling_sum_stays_under_limit() {
        let mut gov = governor();
        let start = Instant::now();
        let budget_ms = 36_000u64;

        // Simulate a send loop that always respects the governor
        let mut spent = 0u64;
        let mut now = start;
        for _ in 0..100 {
            now += Duration::from_secs(30);
            let backoff = gov.backoff_for_at(200, 9, now);
            if backoff == 0 {
                let airtime = gov.estimate_airtime(200, 9);
                gov.log_transmission_at(airtime, now);
                spent += airtime;
            }
        }
        assert!(spent <= budget_ms);
    }

    #[test]
    fn middle_band_is_ten_times_stricter() {
        let mut gov = DutyCycleGovernor::new(RegionProfile::eu868(), 869_000_000, 125_000, 8);
        let start = Instant::now();
        // 0.1% of an hour is 3 600 ms
        gov.log_transmission_at(3_601, start);
        assert!(gov.backoff_for_at(100, 9, start + Duration::from_secs(1)) > 0);
    }
}
