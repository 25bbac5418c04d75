//! crates/plantgo_core/src/ports.rs
//!
//! Defines the service contracts (traits) for the application's core logic.
//! These traits form the boundary of the hexagonal architecture, allowing the core
//! to be independent of specific external implementations like databases or APIs.

use crate::domain::{
    ActiveChallenge, Challenge, Discovery, GeoPoint, LeaderboardSnapshot, Member, MissionBatch,
    MissionCacheEntry, Observation, User, UserCredentials,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

//=========================================================================================
// Generic Port Error and Result Types
//=========================================================================================

/// A generic error type for all port operations.
/// This abstracts away the specific errors from external services (e.g., database, network).
#[derive(Debug, thiserror::Error)]
pub enum PortError {
    #[error("Item not found: {0}")]
    NotFound(String),
    #[error("Conflict: {0}")]
    Conflict(String),
    #[error("An unexpected error occurred: {0}")]
    Unexpected(String),
    #[error("Unauthorized")]
    Unauthorized,
}

/// A convenience type alias for `Result<T, PortError>`.
pub type PortResult<T> = Result<T, PortError>;

//=========================================================================================
// Service Ports (Traits)
//=========================================================================================

/// The backing store. Every numeric mutation is a commutative increment and every
/// "first time" decision is a single conditional write.
#[async_trait]
pub trait DatabaseService: Send + Sync {
    // --- Users & Auth ---
    async fn create_user_with_email(
        &self,
        username: Option<&str>,
        email: &str,
        hashed_password: &str,
    ) -> PortResult<User>;

    async fn get_user_by_email(&self, email: &str) -> PortResult<UserCredentials>;

    async fn get_user(&self, user_id: Uuid) -> PortResult<User>;

    async fn create_auth_session(
        &self,
        session_id: &str,
        user_id: Uuid,
        expires_at: DateTime<Utc>,
    ) -> PortResult<()>;

    async fn validate_auth_session(&self, session_id: &str) -> PortResult<Uuid>;

    async fn delete_auth_session(&self, session_id: &str) -> PortResult<()>;

    // --- Observation Ledger ---
    /// Inserts the observation unless its id is already stored, and returns the
    /// stored row. Fails with `Conflict` when the id belongs to another user.
    async fn insert_observation(&self, observation: &Observation) -> PortResult<Observation>;

    /// Inserts the discovery unless one already exists for (user, species).
    /// Returns the id of the observation holding the discovery, so repeated
    /// claims for the same observation keep agreeing on the winner.
    async fn claim_discovery(&self, discovery: &Discovery) -> PortResult<Uuid>;

    async fn set_observation_discovery_bonus(
        &self,
        user_id: Uuid,
        observation_id: Uuid,
        discovery_bonus: i64,
    ) -> PortResult<()>;

    /// Adds `amount` to the user's total exactly once per `observation_id`.
    /// Returns `false` when the credit had already been applied.
    async fn credit_user_points(
        &self,
        user_id: Uuid,
        observation_id: Uuid,
        amount: i64,
    ) -> PortResult<bool>;

    /// The user's observations that have no point credit yet, oldest first.
    async fn uncredited_observations(&self, user_id: Uuid) -> PortResult<Vec<Observation>>;

    async fn list_discoveries(&self, user_id: Uuid) -> PortResult<Vec<Discovery>>;

    // --- Challenges ---
    /// Persists the challenge unless another challenge with the same code ends after `now`.
    /// Returns `false` when the code is taken.
    async fn insert_challenge_if_code_free(
        &self,
        challenge: &Challenge,
        now: DateTime<Utc>,
    ) -> PortResult<bool>;

    /// The most recently started challenge carrying `code`, if any.
    async fn find_challenge_by_code(&self, code: &str) -> PortResult<Option<Challenge>>;

    async fn get_challenge(&self, challenge_id: Uuid) -> PortResult<Challenge>;

    /// Creates the member or refreshes its display name. Never touches `score`.
    async fn upsert_member(
        &self,
        challenge_id: Uuid,
        user_id: Uuid,
        username: &str,
        joined_at: DateTime<Utc>,
    ) -> PortResult<Member>;

    async fn increment_member_score(
        &self,
        challenge_id: Uuid,
        user_id: Uuid,
        amount: i64,
    ) -> PortResult<()>;

    async fn leaderboard(&self, challenge_id: Uuid, limit: usize)
        -> PortResult<LeaderboardSnapshot>;

    async fn set_active_challenge(
        &self,
        user_id: Uuid,
        pointer: Option<&ActiveChallenge>,
    ) -> PortResult<()>;

    /// Clears the pointer only if it still refers to `challenge_id`.
    async fn clear_active_challenge_if(&self, user_id: Uuid, challenge_id: Uuid)
        -> PortResult<bool>;

    // --- Mission Cache ---
    async fn get_mission_cache(&self, user_id: Uuid) -> PortResult<Option<MissionCacheEntry>>;

    async fn save_mission_cache(&self, entry: &MissionCacheEntry) -> PortResult<()>;
}

#[async_trait]
pub trait MissionService: Send + Sync {
    /// Fetches candidate species and open missions around `location`.
    async fn fetch_missions(&self, location: GeoPoint, model: &str) -> PortResult<MissionBatch>;
}
