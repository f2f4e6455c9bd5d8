//! Credit and longevity accounting
//!
//! Verified attestations over time convert into an integer credit balance.
//! All math here is pure; the daemon's hourly engine feeds it storage
//! samples and persists the outcome.

use crate::encoding;
use crate::error::Result;
use crate::identity::KeyPair;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Gaps up to this count as continuous uptime.
pub const GRACE_SECS: u64 = 15 * 60;
/// Gaps beyond this restart the longevity clock.
pub const RESET_SECS: u64 = 30 * 60;
/// Expected attestations per verified peer per hour (one liveness cycle
/// every five minutes).
pub const EXPECTED_PER_PEER_PER_HOUR: f64 = 12.0;
/// Below this uptime ratio a cycle earns nothing.
pub const MIN_UPTIME_RATIO: f64 = 0.5;
/// Base credit accrual per effective hour.
pub const BASE_RATE_PER_HOUR: f64 = 1.0;

// =============================================================================
// BALANCE
// =============================================================================

/// Per-system credit state. `balance` and `total_earned` only grow.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CreditBalance {
    pub system_id: Uuid,
    pub balance: u64,
    pub total_earned: u64,
    pub total_sent: u64,
    pub total_received: u64,
    pub last_updated: u64,
    pub longevity_start: u64,
    /// Fractional carry, 0 <= pending < 1.
    pub pending_credits: f64,
}

impl CreditBalance {
    pub fn new(system_id: Uuid, now: u64) -> Self {
        Self {
            system_id,
            balance: 0,
            total_earned: 0,
            total_sent: 0,
            total_received: 0,
            last_updated: now,
            longevity_start: now,
            pending_credits: 0.0,
        }
    }

    /// Add earned credit: whole units move to the balance, the fractional
    /// remainder stays pending.
    pub fn apply_earned(&mut self, earned: f64, now: u64) {
        if earned > 0.0 {
            self.pending_credits += earned;
        }
        let whole = self.pending_credits.floor();
        if whole >= 1.0 {
            self.balance += whole as u64;
            self.total_earned += whole as u64;
            self.pending_credits -= whole;
        }
        self.last_updated = now;
    }

    pub fn rank(&self) -> Rank {
        Rank::for_balance(self.balance)
    }
}

/// Rank ladder over the credit balance.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Rank {
    Unranked,
    Bronze,
    Silver,
    Gold,
    Platinum,
    Diamond,
}

impl Rank {
    /// Thresholds: 168 / 720 / 2160 / 4320 / 8640.
    pub fn for_balance(balance: u64) -> Rank {
        match balance {
            0..=167 => Rank::Unranked,
            168..=719 => Rank::Bronze,
            720..=2159 => Rank::Silver,
            2160..=4319 => Rank::Gold,
            4320..=8639 => Rank::Platinum,
            _ => Rank::Diamond,
        }
    }
}

impl fmt::Display for Rank {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

// =============================================================================
// UPTIME
// =============================================================================

/// Result of walking one window of attestation timestamps.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct UptimeWindow {
    /// Seconds covered by gaps within the grace period.
    pub effective_secs: u64,
    /// Longevity start after applying reset gaps.
    pub longevity_start: u64,
}

/// Walk ascending attestation timestamps.
///
/// Gaps <= grace count as online; gaps in (grace, reset] are offline but keep
/// the longevity clock; gaps > reset restart longevity at the first post-gap
/// attestation.
pub fn effective_uptime(timestamps: &[u64], longevity_start: u64) -> UptimeWindow {
    let mut effective_secs = 0u64;
    let mut longevity = longevity_start;
    for pair in timestamps.windows(2) {
        let gap = pair[1].saturating_sub(pair[0]);
        if gap <= GRACE_SECS {
            effective_secs += gap;
        } else if gap > RESET_SECS {
            longevity = pair[1];
        }
    }
    UptimeWindow {
        effective_secs,
        longevity_start: longevity,
    }
}

// =============================================================================
// BONUSES
// =============================================================================

/// Individual bonus components (additive multiplier on base credit).
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Bonuses {
    pub bridge: f64,
    pub longevity: f64,
    pub pioneer: f64,
    pub reciprocity: f64,
}

impl Bonuses {
    pub fn total(&self) -> f64 {
        self.bridge + self.longevity + self.pioneer + self.reciprocity
    }
}

/// `0.6 * depRatio + 0.4 * critRatio` over per-peer connectivity estimates.
///
/// depRatio: fraction of peers with connectivity below the average.
/// critRatio: fraction with connectivity <= 2.
pub fn bridge_score(connectivity: &[u32]) -> f64 {
    if connectivity.is_empty() {
        return 0.0;
    }
    let len = connectivity.len() as f64;
    let avg = connectivity.iter().map(|c| *c as f64).sum::<f64>() / len;
    let dep = connectivity.iter().filter(|c| (**c as f64) < avg).count() as f64 / len;
    let crit = connectivity.iter().filter(|c| **c <= 2).count() as f64 / len;
    0.6 * dep + 0.4 * crit
}

/// Bridge bonus: half the bridge score, capped at 0.50 by construction.
pub fn bridge_bonus(score: f64) -> f64 {
    0.5 * score.clamp(0.0, 1.0)
}

/// Longevity bonus: 1% per week of unbroken participation, capped at 0.52.
pub fn longevity_bonus(weeks: f64) -> f64 {
    (0.01 * weeks.max(0.0)).min(0.52)
}

/// Pioneer bonus: 0.30 below 20 systems, declining linearly to 0.15 at 50
/// and to 0.0 at 100.
pub fn pioneer_bonus(galaxy_size: usize) -> f64 {
    let g = galaxy_size as f64;
    if galaxy_size < 20 {
        0.30
    } else if galaxy_size <= 50 {
        0.30 - (g - 20.0) / 30.0 * 0.15
    } else if galaxy_size <= 100 {
        0.15 - (g - 50.0) / 50.0 * 0.15
    } else {
        0.0
    }
}

/// Reciprocity bonus: up to 0.05 for balanced send/receive traffic.
pub fn reciprocity_bonus(ratio: f64) -> f64 {
    0.05 * ratio.clamp(0.0, 1.0)
}

/// Balance between attestations sent and received in the window.
pub fn reciprocity_ratio(sent: u64, received: u64) -> f64 {
    let max = sent.max(received);
    if max == 0 {
        return 0.0;
    }
    sent.min(received) as f64 / max as f64
}

// =============================================================================
// HOURLY CYCLE
// =============================================================================

/// Everything one scoring cycle consumes.
#[derive(Clone, Debug)]
pub struct CycleInputs {
    /// Ascending attestation timestamps since the last cycle.
    pub timestamps: Vec<u64>,
    pub window_start: u64,
    pub window_end: u64,
    /// Verified peers in the routing table.
    pub peer_count: usize,
    /// Connectivity estimates per known peer, for the bridge score.
    pub connectivity: Vec<u32>,
    /// Cache size + 1.
    pub galaxy_size: usize,
    pub sent: u64,
    pub received: u64,
    pub longevity_start: u64,
}

/// Outcome of one scoring cycle.
#[derive(Clone, Debug, PartialEq)]
pub struct CycleOutcome {
    pub earned: f64,
    pub base: f64,
    pub uptime_ratio: f64,
    pub bonuses: Bonuses,
    pub longevity_start: u64,
}

/// Run one scoring cycle. Pure.
pub fn run_cycle(inputs: &CycleInputs) -> CycleOutcome {
    let uptime = effective_uptime(&inputs.timestamps, inputs.longevity_start);
    let span_hours =
        inputs.window_end.saturating_sub(inputs.window_start) as f64 / 3600.0;
    let expected = EXPECTED_PER_PEER_PER_HOUR * inputs.peer_count as f64 * span_hours;
    let ratio = if expected > 0.0 {
        (inputs.timestamps.len() as f64 / expected).min(1.0)
    } else {
        0.0
    };

    if ratio < MIN_UPTIME_RATIO {
        return CycleOutcome {
            earned: 0.0,
            base: 0.0,
            uptime_ratio: ratio,
            bonuses: Bonuses::default(),
            longevity_start: uptime.longevity_start,
        };
    }

    let effective_hours = uptime.effective_secs as f64 / 3600.0;
    let base = effective_hours * BASE_RATE_PER_HOUR * ratio;

    let weeks = inputs
        .window_end
        .saturating_sub(uptime.longevity_start) as f64
        / (7.0 * 86_400.0);
    let bonuses = Bonuses {
        bridge: bridge_bonus(bridge_score(&inputs.connectivity)),
        longevity: longevity_bonus(weeks),
        pioneer: pioneer_bonus(inputs.galaxy_size),
        reciprocity: reciprocity_bonus(reciprocity_ratio(inputs.sent, inputs.received)),
    };

    CycleOutcome {
        earned: base * (1.0 + bonuses.total()),
        base,
        uptime_ratio: ratio,
        bonuses,
        longevity_start: uptime.longevity_start,
    }
}

// =============================================================================
// TRANSFERS (signing shape only; execution is inert)
// =============================================================================

/// Pre-declared transfer record. The signing shape is fixed for future
/// wire compatibility; nothing in this build executes one.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CreditTransfer {
    pub id: Uuid,
    pub from: Uuid,
    pub to: Uuid,
    pub amount: u64,
    pub timestamp: u64,
    pub memo: String,
    #[serde(with = "encoding::b64")]
    pub signature: Vec<u8>,
    #[serde(with = "encoding::b64")]
    pub public_key: Vec<u8>,
}

#[derive(Serialize)]
struct SignableTransfer<'a> {
    id: String,
    from: String,
    to: String,
    amount: u64,
    timestamp: u64,
    memo: &'a str,
}

fn transfer_message(
    id: &Uuid,
    from: &Uuid,
    to: &Uuid,
    amount: u64,
    timestamp: u64,
    memo: &str,
) -> Vec<u8> {
    let canonical = SignableTransfer {
        id: id.hyphenated().to_string(),
        from: from.hyphenated().to_string(),
        to: to.hyphenated().to_string(),
        amount,
        timestamp,
        memo,
    };
    serde_json::to_vec(&canonical).expect("canonical transfer shape")
}

impl CreditTransfer {
    pub fn sign(
        id: Uuid,
        from: Uuid,
        to: Uuid,
        amount: u64,
        timestamp: u64,
        memo: String,
        keypair: &KeyPair,
    ) -> Self {
        let message = transfer_message(&id, &from, &to, amount, timestamp, &memo);
        Self {
            id,
            from,
            to,
            amount,
            timestamp,
            memo,
            signature: keypair.sign(&message).to_vec(),
            public_key: keypair.public_key().to_vec(),
        }
    }

    pub fn verify(&self) -> Result<()> {
        let message = transfer_message(
            &self.id,
            &self.from,
            &self.to,
            self.amount,
            self.timestamp,
            &self.memo,
        );
        KeyPair::verify(&self.public_key, &message, &self.signature)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pioneer_boundaries() {
        let cases = [
            (19usize, 0.30),
            (20, 0.30),
            (49, 0.155),
            (50, 0.15),
            (99, 0.003),
            (100, 0.0),
            (5000, 0.0),
        ];
        for (galaxy, expected) in cases {
            let got = pioneer_bonus(galaxy);
            assert!(
                (got - expected).abs() < 0.001,
                "pioneer({galaxy}) = {got}, expected {expected}"
            );
        }
    }

    #[test]
    fn test_rank_boundaries() {
        let cases = [
            (0u64, Rank::Unranked),
            (167, Rank::Unranked),
            (168, Rank::Bronze),
            (719, Rank::Bronze),
            (720, Rank::Silver),
            (2160, Rank::Gold),
            (4320, Rank::Platinum),
            (8639, Rank::Platinum),
            (8640, Rank::Diamond),
        ];
        for (balance, expected) in cases {
            assert_eq!(Rank::for_balance(balance), expected, "balance {balance}");
        }
    }

    #[test]
    fn test_bonus_caps() {
        assert!(bridge_bonus(5.0) <= 0.50);
        assert!(longevity_bonus(1000.0) <= 0.52);
        assert!(pioneer_bonus(0) <= 0.30);
        assert!(reciprocity_bonus(7.0) <= 0.05);
    }

    #[test]
    fn test_effective_uptime_gap_classes() {
        let start = 1_000_000u64;
        // 5-minute gaps: online. 20-minute gap: offline, longevity kept.
        // 31-minute gap: offline, longevity reset to the post-gap timestamp.
        let ts = vec![
            start,
            start + 300,
            start + 600,
            start + 600 + 20 * 60,
            start + 600 + 20 * 60 + 31 * 60,
        ];
        let window = effective_uptime(&ts, start);
        assert_eq!(window.effective_secs, 600);
        assert_eq!(window.longevity_start, *ts.last().unwrap());

        // Without the reset gap the longevity clock is untouched.
        let window = effective_uptime(&ts[..4], start);
        assert_eq!(window.longevity_start, start);
    }

    #[test]
    fn test_cycle_zero_below_min_ratio() {
        // 10 peers over one hour expect 120 attestations; 30 is a 0.25 ratio.
        let start = 1_000_000u64;
        let inputs = CycleInputs {
            timestamps: (0..30).map(|i| start + i * 120).collect(),
            window_start: start,
            window_end: start + 3600,
            peer_count: 10,
            connectivity: vec![5; 10],
            galaxy_size: 10,
            sent: 30,
            received: 30,
            longevity_start: start,
        };
        let outcome = run_cycle(&inputs);
        assert!(outcome.uptime_ratio < MIN_UPTIME_RATIO);
        assert_eq!(outcome.earned, 0.0);
    }

    #[test]
    fn test_cycle_earns_with_bonuses() {
        // 2 peers over one hour expect 24; 24 attestations at 150 s spacing.
        let start = 1_000_000u64;
        let inputs = CycleInputs {
            timestamps: (0..24).map(|i| start + i * 150).collect(),
            window_start: start,
            window_end: start + 3600,
            peer_count: 2,
            connectivity: vec![1, 4],
            galaxy_size: 10,
            sent: 12,
            received: 12,
            longevity_start: start - 14 * 86_400,
        };
        let outcome = run_cycle(&inputs);
        assert_eq!(outcome.uptime_ratio, 1.0);
        assert!(outcome.base > 0.0);
        // Pioneer applies (galaxy 10 < 20) and two weeks of longevity.
        assert!((outcome.bonuses.pioneer - 0.30).abs() < 1e-9);
        assert!(outcome.bonuses.longevity >= 0.02);
        assert!((outcome.bonuses.reciprocity - 0.05).abs() < 1e-9);
        assert!(outcome.earned > outcome.base);
    }

    #[test]
    fn test_pending_carry_across_restart() {
        let id = Uuid::from_u128(1);
        let mut balance = CreditBalance::new(id, 0);
        balance.apply_earned(0.7, 100);
        assert_eq!(balance.balance, 0);
        assert!((balance.pending_credits - 0.7).abs() < 1e-9);

        // Simulate restart: persist and reload the struct.
        let json = serde_json::to_string(&balance).unwrap();
        let mut reloaded: CreditBalance = serde_json::from_str(&json).unwrap();

        reloaded.apply_earned(0.5, 200);
        assert_eq!(reloaded.balance, 1);
        assert_eq!(reloaded.total_earned, 1);
        assert!((reloaded.pending_credits - 0.2).abs() < 1e-9);
    }

    #[test]
    fn test_balance_monotonic() {
        let mut balance = CreditBalance::new(Uuid::from_u128(2), 0);
        let mut last = 0;
        for (i, earned) in [0.3, 0.0, 1.7, 0.9, 0.0, 2.4].into_iter().enumerate() {
            balance.apply_earned(earned, i as u64);
            assert!(balance.balance >= last);
            assert!(balance.pending_credits >= 0.0 && balance.pending_credits < 1.0);
            last = balance.balance;
        }
    }

    #[test]
    fn test_bridge_score() {
        // Average 3.0: two peers below average, two at or under 2 links.
        let score = bridge_score(&[1, 2, 4, 5]);
        assert!((score - (0.6 * 0.5 + 0.4 * 0.5)).abs() < 1e-9);
        assert_eq!(bridge_score(&[]), 0.0);
    }

    #[test]
    fn test_reciprocity_ratio() {
        assert_eq!(reciprocity_ratio(0, 0), 0.0);
        assert_eq!(reciprocity_ratio(10, 0), 0.0);
        assert_eq!(reciprocity_ratio(5, 10), 0.5);
        assert_eq!(reciprocity_ratio(10, 10), 1.0);
    }

    #[test]
    fn test_transfer_sign_verify() {
        let kp = KeyPair::from_seed(&[3u8; 32]);
        let transfer = CreditTransfer::sign(
            Uuid::from_u128(1),
            Uuid::from_u128(2),
            Uuid::from_u128(3),
            42,
            1_700_000_000,
            "for the relay".into(),
            &kp,
        );
        assert!(transfer.verify().is_ok());

        let mut tampered = transfer;
        tampered.amount = 43;
        assert!(tampered.verify().is_err());
    }
}
