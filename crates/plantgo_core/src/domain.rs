//! crates/plantgo_core/src/domain.rs
//!
//! Defines the pure, core data structures for the points ledger and challenges.
//! These structs are independent of any database or serialization format.

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Per-metric point components, keyed by label (e.g. `"base"`, `"rarity"`).
pub type PointDetail = BTreeMap<String, i64>;

/// A WGS84 coordinate pair.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GeoPoint {
    pub lat: f64,
    pub lon: f64,
}

impl GeoPoint {
    pub fn is_valid(&self) -> bool {
        self.lat.is_finite()
            && self.lon.is_finite()
            && (-90.0..=90.0).contains(&self.lat)
            && (-180.0..=180.0).contains(&self.lon)
    }
}

//=========================================================================================
// Users
//=========================================================================================

/// Represents a player. `total_points` only ever grows.
#[derive(Debug, Clone)]
pub struct User {
    pub user_id: Uuid,
    pub username: Option<String>,
    pub email: Option<String>,
    pub total_points: i64,
    pub active_challenge: Option<ActiveChallenge>,
}

impl User {
    /// The name captured into a challenge member record: stored username,
    /// then the local part of the email, then a generic fallback.
    pub fn display_name(&self) -> String {
        if let Some(name) = self.username.as_deref().map(str::trim) {
            if !name.is_empty() {
                return name.to_string();
            }
        }
        if let Some(local) = self
            .email
            .as_deref()
            .and_then(|email| email.split_once('@'))
            .map(|(local, _)| local.trim())
        {
            if !local.is_empty() {
                return local.to_string();
            }
        }
        "Player".to_string()
    }
}

// Only used internally for login/signup - contains sensitive data
#[derive(Debug, Clone)]
pub struct UserCredentials {
    pub user_id: Uuid,
    pub email: String,
    pub hashed_password: String,
}

/// The single challenge a user is currently scoring into.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveChallenge {
    pub id: Uuid,
    pub code: String,
    pub start_at: DateTime<Utc>,
    pub end_at: DateTime<Utc>,
}

impl ActiveChallenge {
    /// Whether `now` falls inside the scoring window `[start_at, end_at)`.
    pub fn accepts_score_at(&self, now: DateTime<Utc>) -> bool {
        self.start_at <= now && now < self.end_at
    }

    pub fn phase(&self, now: DateTime<Utc>) -> ChallengePhase {
        ChallengePhase::at(self.start_at, self.end_at, now)
    }
}

//=========================================================================================
// Observations & Discoveries
//=========================================================================================

/// Bonus credits attached to a single observation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BonusBreakdown {
    pub discovery: i64,
    pub mission: i64,
}

/// An identification that the external scoring collaborator has already priced.
#[derive(Debug, Clone)]
pub struct IdentifiedObservation {
    /// Client-chosen key. Resubmitting the same key resumes the first
    /// submission instead of recording a second observation.
    pub observation_id: Option<Uuid>,
    pub species_name: String,
    pub location: GeoPoint,
    pub confidence: f64,
    pub base_points: i64,
    pub point_detail: PointDetail,
}

impl IdentifiedObservation {
    /// Rejects payloads that cannot be credited safely.
    pub fn validate(&self) -> Result<(), String> {
        if self.species_name.trim().is_empty() {
            return Err("species name must not be empty".to_string());
        }
        if !self.location.is_valid() {
            return Err("location is out of range".to_string());
        }
        if !(0.0..=1.0).contains(&self.confidence) {
            return Err(format!("confidence {} is outside [0, 1]", self.confidence));
        }
        if self.base_points < 0 {
            return Err("base points must be non-negative".to_string());
        }
        if let Some((label, value)) = self.point_detail.iter().find(|(_, v)| **v < 0) {
            return Err(format!("point detail '{}' is negative ({})", label, value));
        }
        Ok(())
    }
}

/// Immutable record of one identification.
#[derive(Debug, Clone)]
pub struct Observation {
    pub id: Uuid,
    pub user_id: Uuid,
    pub species_name: String,
    pub location: GeoPoint,
    pub base_points: i64,
    pub point_detail: PointDetail,
    pub bonus: BonusBreakdown,
    pub confidence: f64,
    pub observed_at: DateTime<Utc>,
}

/// First sighting of a species by a user. At most one per (user, species).
#[derive(Debug, Clone)]
pub struct Discovery {
    pub user_id: Uuid,
    pub species_name: String,
    pub discovered_at: DateTime<Utc>,
    pub observation_id: Uuid,
}

/// What the caller learns after an observation has been credited.
#[derive(Debug, Clone)]
pub struct ObservationReceipt {
    pub observation_id: Uuid,
    pub base_points: i64,
    pub discovery_bonus: i64,
    pub mission_bonus: i64,
    /// `false` when an earlier attempt had already applied the credit.
    pub newly_credited: bool,
}

impl ObservationReceipt {
    pub fn total_awarded(&self) -> i64 {
        self.base_points + self.discovery_bonus + self.mission_bonus
    }
}

//=========================================================================================
// Challenges
//=========================================================================================

/// Lifecycle of a challenge, always derived from the wall clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChallengePhase {
    Scheduled,
    Active,
    Ended,
}

impl ChallengePhase {
    pub fn at(start_at: DateTime<Utc>, end_at: DateTime<Utc>, now: DateTime<Utc>) -> Self {
        if now >= end_at {
            ChallengePhase::Ended
        } else if now < start_at {
            ChallengePhase::Scheduled
        } else {
            ChallengePhase::Active
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ChallengePhase::Scheduled => "scheduled",
            ChallengePhase::Active => "active",
            ChallengePhase::Ended => "ended",
        }
    }
}

/// A time-boxed, code-joined competition.
#[derive(Debug, Clone)]
pub struct Challenge {
    pub id: Uuid,
    pub code: String,
    pub created_by: Uuid,
    pub start_at: DateTime<Utc>,
    pub end_at: DateTime<Utc>,
    pub duration_sec: i64,
    /// Status recorded at creation. The live phase comes from [`Challenge::phase`].
    pub status: String,
}

impl Challenge {
    pub fn phase(&self, now: DateTime<Utc>) -> ChallengePhase {
        ChallengePhase::at(self.start_at, self.end_at, now)
    }

    pub fn pointer(&self) -> ActiveChallenge {
        ActiveChallenge {
            id: self.id,
            code: self.code.clone(),
            start_at: self.start_at,
            end_at: self.end_at,
        }
    }
}

/// Returned from create and join.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChallengeTicket {
    pub challenge_id: Uuid,
    pub code: String,
    pub start_at: DateTime<Utc>,
    pub end_at: DateTime<Utc>,
}

impl From<&Challenge> for ChallengeTicket {
    fn from(challenge: &Challenge) -> Self {
        Self {
            challenge_id: challenge.id,
            code: challenge.code.clone(),
            start_at: challenge.start_at,
            end_at: challenge.end_at,
        }
    }
}

/// A user's participation in a challenge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Member {
    pub challenge_id: Uuid,
    pub user_id: Uuid,
    pub username: String,
    pub score: i64,
    pub joined_at: DateTime<Utc>,
}

/// A self-consistent, ranked read of a challenge's top members.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaderboardSnapshot {
    pub challenge_id: Uuid,
    /// Ordered by score descending; rank is the position plus one.
    pub members: Vec<Member>,
}

//=========================================================================================
// Missions
//=========================================================================================

/// A candidate species suggested for the user's location.
#[derive(Debug, Clone, PartialEq)]
pub struct MissionSpecies {
    pub name: String,
    pub common_name: Option<String>,
    pub points: PointDetail,
    pub is_tree: bool,
    pub is_invasive: bool,
    pub is_flowering: bool,
    pub is_fruiting: bool,
}

/// One response from the mission collaborator.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MissionBatch {
    pub species_list: Vec<MissionSpecies>,
    pub missions_list: Vec<MissionSpecies>,
    pub model: String,
}

/// Per-user cached missions.
#[derive(Debug, Clone, PartialEq)]
pub struct MissionCacheEntry {
    pub user_id: Uuid,
    pub species_list: Vec<MissionSpecies>,
    pub missions_list: Vec<MissionSpecies>,
    pub model: String,
    pub last_fetch_at: DateTime<Utc>,
}

impl MissionCacheEntry {
    /// Whether `species_name` is one of the open missions.
    pub fn has_mission_for(&self, species_name: &str) -> bool {
        let wanted = species_name.trim();
        self.missions_list
            .iter()
            .any(|mission| mission.name.trim().eq_ignore_ascii_case(wanted))
    }
}
