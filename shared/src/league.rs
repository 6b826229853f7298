//! League classification of claims.
//!
//! A claim that arrives within a short, slightly randomized threshold after
//! dispatch is a league claim: it is rewarded with a timing-based weight and
//! does not end the arbitration. Anything slower is a regular claim and the
//! first valid one wins the drop outright.

use rand::Rng;

/// Coefficients `c0..c4` of the weight polynomial `c0 + c1*s + c2*s^2 + c3*s^3 + c4*s^4`.
pub const LEAGUE_WEIGHT_COEFFICIENTS: [f64; 5] = [0.0, 0.0, 0.0, 4.0, -3.0];
/// Elapsed seconds at which the weight saturates.
pub const LEAGUE_WEIGHT_SATURATION_SECS: f64 = 1.0;
/// Weight for any claim at or beyond the saturation point.
pub const LEAGUE_WEIGHT_MAX: f64 = 1.0;

/// Maps elapsed seconds from dispatch to claim onto a league weight.
///
/// Rises monotonically from 0 at `s = 0` to [`LEAGUE_WEIGHT_MAX`] at the
/// saturation point and is clamped outside of that range.
pub fn league_weight(seconds: f64) -> f64 {
    if seconds.is_nan() || seconds <= 0.0 {
        return 0.0;
    }
    if seconds >= LEAGUE_WEIGHT_SATURATION_SECS {
        return LEAGUE_WEIGHT_MAX;
    }

    // Horner evaluation, highest degree first
    let weight = LEAGUE_WEIGHT_COEFFICIENTS
        .iter()
        .rev()
        .fold(0.0, |acc, c| acc * seconds + c);
    weight.clamp(0.0, LEAGUE_WEIGHT_MAX)
}

/// League cutoff for one drop cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeagueThreshold {
    pub base_ms: u64,
    pub jitter_ms: u64,
}

impl LeagueThreshold {
    /// Draws the jitter once; the result is used for a whole cycle so the
    /// cutoff cannot be learned from a fixed value.
    pub fn draw<R: Rng + ?Sized>(base_ms: u64, max_jitter_ms: u64, rng: &mut R) -> Self {
        Self {
            base_ms,
            jitter_ms: rng.gen_range(0..=max_jitter_ms),
        }
    }

    pub fn fixed(base_ms: u64) -> Self {
        Self {
            base_ms,
            jitter_ms: 0,
        }
    }

    pub fn threshold_ms(&self) -> u64 {
        self.base_ms + self.jitter_ms
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ClaimKind {
    League { weight: f64 },
    Regular,
}

impl ClaimKind {
    pub fn is_league(&self) -> bool {
        matches!(self, ClaimKind::League { .. })
    }
}

/// Classifies a claim by its distance from the dispatch timestamp.
pub fn classify(claim_timestamp: u64, dispatch_timestamp: u64, threshold: LeagueThreshold) -> ClaimKind {
    let elapsed_ms = claim_timestamp as i64 - dispatch_timestamp as i64;
    if elapsed_ms < threshold.threshold_ms() as i64 {
        ClaimKind::League {
            weight: league_weight(elapsed_ms as f64 / 1000.0),
        }
    } else {
        ClaimKind::Regular
    }
}
