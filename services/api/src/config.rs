//! services/api/src/config.rs
//!
//! Defines the application's configuration structure and loading logic.
//!
//! All configuration is loaded from environment variables at startup. The `.env`
//! file is used for local development.

use plantgo_core::retry::RetryPolicy;
use plantgo_core::rules::{self, GameRules};
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;
use tracing::Level;

/// A custom error type for configuration loading failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing the environment variable {0}")]
    MissingVar(String),
    #[error("Invalid value for the environment variable {0}: {1}")]
    InvalidValue(String, String),
}

/// Holds all configuration loaded from the environment at startup.
#[derive(Clone, Debug)]
pub struct Config {
    pub bind_address: SocketAddr,
    /// `None` runs the service on the in-memory store.
    pub database_url: Option<String>,
    pub log_level: Level,
    pub cors_origin: String,
    pub missions_api_url: String,
    pub missions_model: String,
    pub mission_fetch_timeout: Duration,
    pub mission_fetch_attempts: u32,
    pub mission_cooldown: Duration,
    pub mission_freshness: Duration,
    pub points_per_level: i64,
    pub discovery_bonus: i64,
    pub mission_bonus: i64,
    pub challenge_min_secs: i64,
    pub challenge_max_secs: i64,
    pub leaderboard_limit: usize,
}

impl Config {
    /// Loads configuration from environment variables.
    ///
    /// It will look for a `.env` file in the current directory for development,
    /// but this is skipped in test environments to ensure tests are hermetic.
    pub fn from_env() -> Result<Self, ConfigError> {
        if !cfg!(test) {
            dotenvy::dotenv().ok();
        }
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the configuration from any key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        // --- Server and Database Settings ---
        let bind_address: SocketAddr =
            parse_or(&lookup, "BIND_ADDRESS", "0.0.0.0:3000".parse().ok())?;
        let database_url = lookup("DATABASE_URL").filter(|url| !url.trim().is_empty());

        let log_level_str = lookup("RUST_LOG").unwrap_or_else(|| "INFO".to_string());
        let log_level = log_level_str.parse::<Level>().map_err(|_| {
            ConfigError::InvalidValue(
                "RUST_LOG".to_string(),
                format!("'{}' is not a valid log level", log_level_str),
            )
        })?;
        let cors_origin =
            lookup("CORS_ORIGIN").unwrap_or_else(|| "http://localhost:3000".to_string());

        // --- Mission Collaborator ---
        let missions_api_url = lookup("MISSIONS_API_URL")
            .ok_or_else(|| ConfigError::MissingVar("MISSIONS_API_URL".to_string()))?;
        let missions_model = lookup("MISSIONS_MODEL").unwrap_or_else(|| "best".to_string());
        let mission_fetch_timeout =
            Duration::from_secs(parse_or(&lookup, "MISSION_FETCH_TIMEOUT_SECS", Some(12u64))?);
        let mission_fetch_attempts: u32 = parse_or(&lookup, "MISSION_FETCH_ATTEMPTS", Some(3))?;
        if mission_fetch_attempts == 0 {
            return Err(ConfigError::InvalidValue(
                "MISSION_FETCH_ATTEMPTS".to_string(),
                "must be at least 1".to_string(),
            ));
        }
        let mission_cooldown = Duration::from_secs(parse_or(
            &lookup,
            "MISSION_COOLDOWN_SECS",
            Some(rules::MISSION_COOLDOWN.as_secs()),
        )?);
        let mission_freshness = Duration::from_secs(parse_or(
            &lookup,
            "MISSION_FRESHNESS_SECS",
            Some(rules::MISSION_FRESHNESS.as_secs()),
        )?);

        // --- Gameplay ---
        let points_per_level =
            parse_or(&lookup, "POINTS_PER_LEVEL", Some(rules::POINTS_PER_LEVEL))?;
        if points_per_level <= 0 {
            return Err(ConfigError::InvalidValue(
                "POINTS_PER_LEVEL".to_string(),
                "must be positive".to_string(),
            ));
        }
        let discovery_bonus = parse_or(&lookup, "DISCOVERY_BONUS", Some(rules::DISCOVERY_BONUS))?;
        let mission_bonus = parse_or(&lookup, "MISSION_BONUS", Some(rules::MISSION_BONUS))?;
        let challenge_min_secs =
            parse_or(&lookup, "CHALLENGE_MIN_SECS", Some(rules::MIN_CHALLENGE_SECS))?;
        let challenge_max_secs =
            parse_or(&lookup, "CHALLENGE_MAX_SECS", Some(rules::MAX_CHALLENGE_SECS))?;
        if challenge_min_secs <= 0 || challenge_min_secs > challenge_max_secs {
            return Err(ConfigError::InvalidValue(
                "CHALLENGE_MIN_SECS".to_string(),
                format!(
                    "{} must be positive and not above CHALLENGE_MAX_SECS ({})",
                    challenge_min_secs, challenge_max_secs
                ),
            ));
        }
        let leaderboard_limit =
            parse_or(&lookup, "LEADERBOARD_LIMIT", Some(rules::LEADERBOARD_LIMIT))?;

        Ok(Self {
            bind_address,
            database_url,
            log_level,
            cors_origin,
            missions_api_url,
            missions_model,
            mission_fetch_timeout,
            mission_fetch_attempts,
            mission_cooldown,
            mission_freshness,
            points_per_level,
            discovery_bonus,
            mission_bonus,
            challenge_min_secs,
            challenge_max_secs,
            leaderboard_limit,
        })
    }

    /// The gameplay rules this deployment runs with.
    pub fn game_rules(&self) -> GameRules {
        let defaults = GameRules::default();
        GameRules {
            discovery_bonus: self.discovery_bonus,
            mission_bonus: self.mission_bonus,
            points_per_level: self.points_per_level,
            min_challenge_secs: self.challenge_min_secs,
            max_challenge_secs: self.challenge_max_secs,
            default_challenge_secs: defaults
                .default_challenge_secs
                .clamp(self.challenge_min_secs, self.challenge_max_secs),
            leaderboard_limit: self.leaderboard_limit,
            mission_cooldown: self.mission_cooldown,
            mission_freshness: self.mission_freshness,
            mission_fetch_timeout: self.mission_fetch_timeout,
            mission_fetch_retry: RetryPolicy {
                attempts: self.mission_fetch_attempts,
                ..defaults.mission_fetch_retry
            },
            ..defaults
        }
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: Option<T>) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|e| ConfigError::InvalidValue(key.to_string(), e.to_string())),
        None => default.ok_or_else(|| ConfigError::MissingVar(key.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_match_the_game_constants() {
        let config = load(&[("MISSIONS_API_URL", "http://localhost:8000/missions")]).unwrap();
        assert!(config.database_url.is_none());
        assert_eq!(config.missions_model, "best");

        let rules = config.game_rules();
        assert_eq!(rules.points_per_level, 11_000);
        assert_eq!(rules.discovery_bonus, 500);
        assert_eq!(rules.mission_cooldown, Duration::from_secs(300));
        assert_eq!(rules.mission_freshness, Duration::from_secs(10_800));
        assert_eq!(rules.mission_fetch_timeout, Duration::from_secs(12));
        assert_eq!(rules.mission_fetch_retry.attempts, 3);
        assert_eq!(rules.default_challenge_secs, 1_800);
    }

    #[test]
    fn missions_url_is_required() {
        let err = load(&[]).unwrap_err();
        assert!(matches!(err, ConfigError::MissingVar(var) if var == "MISSIONS_API_URL"));
    }

    #[test]
    fn bad_numbers_are_reported_by_name() {
        let err = load(&[
            ("MISSIONS_API_URL", "http://localhost:8000/missions"),
            ("LEADERBOARD_LIMIT", "many"),
        ])
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue(var, _) if var == "LEADERBOARD_LIMIT"));
    }

    #[test]
    fn inverted_challenge_range_is_rejected() {
        let err = load(&[
            ("MISSIONS_API_URL", "http://localhost:8000/missions"),
            ("CHALLENGE_MIN_SECS", "4000"),
        ])
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue(..)));
    }
}
