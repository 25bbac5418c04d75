//! crates/plantgo_core/src/rules.rs
//!
//! Gameplay constants and the tunable rule set handed to every component.

use crate::retry::RetryPolicy;
use std::time::Duration;

pub const DISCOVERY_BONUS: i64 = 500;
pub const MISSION_BONUS: i64 = 500;
pub const POINTS_PER_LEVEL: i64 = 11_000;

pub const MIN_CHALLENGE_SECS: i64 = 600;
pub const MAX_CHALLENGE_SECS: i64 = 3_600;
pub const DEFAULT_CHALLENGE_SECS: i64 = 1_800;

/// Join codes avoid `I`, `O`, `0` and `1`.
pub const JOIN_CODE_ALPHABET: &[u8; 32] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";
pub const JOIN_CODE_LEN: usize = 5;
pub const JOIN_CODE_ATTEMPTS: usize = 12;

pub const LEADERBOARD_LIMIT: usize = 50;

pub const MISSION_COOLDOWN: Duration = Duration::from_secs(5 * 60);
pub const MISSION_FRESHNESS: Duration = Duration::from_secs(3 * 60 * 60);

/// All tunables in one place, built from configuration at start-up.
#[derive(Debug, Clone)]
pub struct GameRules {
    pub discovery_bonus: i64,
    pub mission_bonus: i64,
    pub points_per_level: i64,
    pub min_challenge_secs: i64,
    pub max_challenge_secs: i64,
    pub default_challenge_secs: i64,
    pub join_code_attempts: usize,
    pub leaderboard_limit: usize,
    pub mission_cooldown: Duration,
    pub mission_freshness: Duration,
    pub mission_fetch_timeout: Duration,
    pub mission_fetch_retry: RetryPolicy,
    pub credit_retry: RetryPolicy,
}

impl Default for GameRules {
    fn default() -> Self {
        Self {
            discovery_bonus: DISCOVERY_BONUS,
            mission_bonus: MISSION_BONUS,
            points_per_level: POINTS_PER_LEVEL,
            min_challenge_secs: MIN_CHALLENGE_SECS,
            max_challenge_secs: MAX_CHALLENGE_SECS,
            default_challenge_secs: DEFAULT_CHALLENGE_SECS,
            join_code_attempts: JOIN_CODE_ATTEMPTS,
            leaderboard_limit: LEADERBOARD_LIMIT,
            mission_cooldown: MISSION_COOLDOWN,
            mission_freshness: MISSION_FRESHNESS,
            mission_fetch_timeout: Duration::from_secs(12),
            mission_fetch_retry: RetryPolicy {
                attempts: 3,
                initial_backoff: Duration::from_millis(250),
            },
            credit_retry: RetryPolicy {
                attempts: 3,
                initial_backoff: Duration::from_millis(100),
            },
        }
    }
}

impl GameRules {
    /// Clamps a requested challenge length into the allowed range.
    pub fn clamp_duration(&self, requested: Option<i64>) -> i64 {
        requested
            .unwrap_or(self.default_challenge_secs)
            .clamp(self.min_challenge_secs, self.max_challenge_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clamp_duration_bounds_and_default() {
        let rules = GameRules::default();
        assert_eq!(rules.clamp_duration(None), 1_800);
        assert_eq!(rules.clamp_duration(Some(60)), 600);
        assert_eq!(rules.clamp_duration(Some(-5)), 600);
        assert_eq!(rules.clamp_duration(Some(99_999)), 3_600);
        assert_eq!(rules.clamp_duration(Some(1_200)), 1_200);
    }

    #[test]
    fn alphabet_has_no_confusable_characters() {
        assert_eq!(JOIN_CODE_ALPHABET.len(), 32);
        for c in [b'I', b'O', b'0', b'1'] {
            assert!(!JOIN_CODE_ALPHABET.contains(&c));
        }
    }
}
