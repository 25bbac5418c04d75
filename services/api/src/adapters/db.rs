//! services/api/src/adapters/db.rs
//!
//! This module contains the database adapter, which is the concrete implementation
//! of the `DatabaseService` port from the `core` crate. It handles all interactions
//! with the PostgreSQL database using `sqlx`.

use crate::adapters::missions::SpeciesPayload;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use plantgo_core::domain::{
    ActiveChallenge, BonusBreakdown, Challenge, Discovery, GeoPoint, LeaderboardSnapshot, Member,
    MissionCacheEntry, MissionSpecies, Observation, PointDetail, User, UserCredentials,
};
use plantgo_core::leaderboard::LeaderboardHub;
use plantgo_core::ports::{DatabaseService, PortError, PortResult};
use sqlx::postgres::PgListener;
use sqlx::types::Json;
use sqlx::{FromRow, PgPool};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Channel the `challenge_members` trigger notifies on.
const MEMBER_CHANNEL: &str = "challenge_members";

//=========================================================================================
// The Main Adapter Struct
//=========================================================================================

/// A database adapter that implements the `DatabaseService` port.
#[derive(Clone)]
pub struct DbAdapter {
    pool: PgPool,
}

impl DbAdapter {
    /// Creates a new `DbAdapter`.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// A helper function to run database migrations at startup.
    pub async fn run_migrations(&self) -> Result<(), sqlx::migrate::MigrateError> {
        sqlx::migrate!("./migrations").run(&self.pool).await
    }

    /// Forwards member changes committed by any instance into the local hub.
    pub async fn spawn_member_listener(
        &self,
        hub: Arc<LeaderboardHub>,
    ) -> Result<JoinHandle<()>, sqlx::Error> {
        let mut listener = PgListener::connect_with(&self.pool).await?;
        listener.listen(MEMBER_CHANNEL).await?;
        info!("Listening for leaderboard changes on '{}'.", MEMBER_CHANNEL);

        Ok(tokio::spawn(async move {
            loop {
                match listener.recv().await {
                    Ok(notification) => match Uuid::parse_str(notification.payload()) {
                        Ok(challenge_id) => hub.notify(challenge_id).await,
                        Err(e) => warn!(
                            payload = notification.payload(),
                            "Ignoring malformed member notification: {}", e
                        ),
                    },
                    Err(e) => {
                        // The listener reconnects on the next `recv`.
                        error!("Member listener lost its connection: {}", e);
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        }))
    }
}

fn unexpected(e: sqlx::Error) -> PortError {
    PortError::Unexpected(e.to_string())
}

fn user_not_found(user_id: Uuid) -> PortError {
    PortError::NotFound(format!("User {} not found", user_id))
}

/// Maps a foreign-key violation to `not_found`, everything else to `Unexpected`.
fn missing_parent(e: sqlx::Error, not_found: impl FnOnce() -> PortError) -> PortError {
    match &e {
        sqlx::Error::Database(db) if db.is_foreign_key_violation() => not_found(),
        _ => unexpected(e),
    }
}

//=========================================================================================
// "Impure" Database Record Structs
//=========================================================================================

#[derive(FromRow)]
struct UserRecord {
    user_id: Uuid,
    username: Option<String>,
    email: Option<String>,
    total_points: i64,
    active_challenge_id: Option<Uuid>,
    active_challenge_code: Option<String>,
    active_challenge_start: Option<DateTime<Utc>>,
    active_challenge_end: Option<DateTime<Utc>>,
}

impl UserRecord {
    fn to_domain(self) -> User {
        let active_challenge = match (
            self.active_challenge_id,
            self.active_challenge_code,
            self.active_challenge_start,
            self.active_challenge_end,
        ) {
            (Some(id), Some(code), Some(start_at), Some(end_at)) => Some(ActiveChallenge {
                id,
                code,
                start_at,
                end_at,
            }),
            _ => None,
        };
        User {
            user_id: self.user_id,
            username: self.username,
            email: self.email,
            total_points: self.total_points,
            active_challenge,
        }
    }
}

const USER_COLUMNS: &str = "user_id, username, email, total_points, active_challenge_id, \
     active_challenge_code, active_challenge_start, active_challenge_end";

#[derive(FromRow)]
struct CredentialsRecord {
    user_id: Uuid,
    email: String,
    hashed_password: Option<String>,
}

#[derive(FromRow)]
struct ObservationRecord {
    id: Uuid,
    user_id: Uuid,
    species_name: String,
    lat: f64,
    lon: f64,
    base_points: i64,
    point_detail: Json<PointDetail>,
    discovery_bonus: i64,
    mission_bonus: i64,
    confidence: f64,
    observed_at: DateTime<Utc>,
}

impl ObservationRecord {
    fn to_domain(self) -> Observation {
        Observation {
            id: self.id,
            user_id: self.user_id,
            species_name: self.species_name,
            location: GeoPoint {
                lat: self.lat,
                lon: self.lon,
            },
            base_points: self.base_points,
            point_detail: self.point_detail.0,
            bonus: BonusBreakdown {
                discovery: self.discovery_bonus,
                mission: self.mission_bonus,
            },
            confidence: self.confidence,
            observed_at: self.observed_at,
        }
    }
}

const OBSERVATION_COLUMNS: &str = "id, user_id, species_name, lat, lon, base_points, \
     point_detail, discovery_bonus, mission_bonus, confidence, observed_at";

#[derive(FromRow)]
struct DiscoveryRecord {
    user_id: Uuid,
    species_name: String,
    discovered_at: DateTime<Utc>,
    observation_id: Uuid,
}

impl DiscoveryRecord {
    fn to_domain(self) -> Discovery {
        Discovery {
            user_id: self.user_id,
            species_name: self.species_name,
            discovered_at: self.discovered_at,
            observation_id: self.observation_id,
        }
    }
}

#[derive(FromRow)]
struct ChallengeRecord {
    id: Uuid,
    code: String,
    created_by: Uuid,
    start_at: DateTime<Utc>,
    end_at: DateTime<Utc>,
    duration_sec: i64,
    status: String,
}

impl ChallengeRecord {
    fn to_domain(self) -> Challenge {
        Challenge {
            id: self.id,
            code: self.code,
            created_by: self.created_by,
            start_at: self.start_at,
            end_at: self.end_at,
            duration_sec: self.duration_sec,
            status: self.status,
        }
    }
}

#[derive(FromRow)]
struct MemberRecord {
    challenge_id: Uuid,
    user_id: Uuid,
    username: String,
    score: i64,
    joined_at: DateTime<Utc>,
}

impl MemberRecord {
    fn to_domain(self) -> Member {
        Member {
            challenge_id: self.challenge_id,
            user_id: self.user_id,
            username: self.username,
            score: self.score,
            joined_at: self.joined_at,
        }
    }
}

#[derive(FromRow)]
struct MissionCacheRecord {
    user_id: Uuid,
    species_list: Json<Vec<SpeciesPayload>>,
    missions_list: Json<Vec<SpeciesPayload>>,
    model: String,
    last_fetch_at: DateTime<Utc>,
}

impl MissionCacheRecord {
    fn to_domain(self) -> MissionCacheEntry {
        MissionCacheEntry {
            user_id: self.user_id,
            species_list: into_species(self.species_list),
            missions_list: into_species(self.missions_list),
            model: self.model,
            last_fetch_at: self.last_fetch_at,
        }
    }
}

fn into_species(list: Json<Vec<SpeciesPayload>>) -> Vec<MissionSpecies> {
    list.0.into_iter().map(SpeciesPayload::into_domain).collect()
}

//=========================================================================================
// `DatabaseService` Trait Implementation
//=========================================================================================

#[async_trait]
impl DatabaseService for DbAdapter {
    async fn create_user_with_email(
        &self,
        username: Option<&str>,
        email: &str,
        hashed_password: &str,
    ) -> PortResult<User> {
        let record = sqlx::query_as::<_, UserRecord>(&format!(
            "INSERT INTO users (user_id, username, email, hashed_password) \
             VALUES ($1, $2, $3, $4) RETURNING {}",
            USER_COLUMNS
        ))
        .bind(Uuid::new_v4())
        .bind(username)
        .bind(email.trim())
        .bind(hashed_password)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| match &e {
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                PortError::Conflict(format!("Email {} already registered", email))
            }
            _ => unexpected(e),
        })?;
        Ok(record.to_domain())
    }

    async fn get_user_by_email(&self, email: &str) -> PortResult<UserCredentials> {
        let record = sqlx::query_as::<_, CredentialsRecord>(
            "SELECT user_id, email, hashed_password FROM users WHERE lower(email) = lower($1)",
        )
        .bind(email.trim())
        .fetch_optional(&self.pool)
        .await
        .map_err(unexpected)?
        .ok_or_else(|| PortError::NotFound(format!("User {} not found", email)))?;

        let hashed_password = record
            .hashed_password
            .ok_or_else(|| PortError::NotFound(format!("User {} has no password", email)))?;
        Ok(UserCredentials {
            user_id: record.user_id,
            email: record.email,
            hashed_password,
        })
    }

    async fn get_user(&self, user_id: Uuid) -> PortResult<User> {
        let record = sqlx::query_as::<_, UserRecord>(&format!(
            "SELECT {} FROM users WHERE user_id = $1",
            USER_COLUMNS
        ))
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(unexpected)?
        .ok_or_else(|| user_not_found(user_id))?;
        Ok(record.to_domain())
    }

    async fn create_auth_session(
        &self,
        session_id: &str,
        user_id: Uuid,
        expires_at: DateTime<Utc>,
    ) -> PortResult<()> {
        sqlx::query("INSERT INTO auth_sessions (id, user_id, expires_at) VALUES ($1, $2, $3)")
            .bind(session_id)
            .bind(user_id)
            .bind(expires_at)
            .execute(&self.pool)
            .await
            .map_err(|e| missing_parent(e, || user_not_found(user_id)))?;
        Ok(())
    }

    async fn validate_auth_session(&self, session_id: &str) -> PortResult<Uuid> {
        let user_id: Option<Uuid> = sqlx::query_scalar(
            "SELECT user_id FROM auth_sessions WHERE id = $1 AND expires_at > now()",
        )
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(unexpected)?;
        user_id.ok_or(PortError::Unauthorized)
    }

    async fn delete_auth_session(&self, session_id: &str) -> PortResult<()> {
        sqlx::query("DELETE FROM auth_sessions WHERE id = $1")
            .bind(session_id)
            .execute(&self.pool)
            .await
            .map_err(unexpected)?;
        Ok(())
    }

    async fn insert_observation(&self, observation: &Observation) -> PortResult<Observation> {
        sqlx::query(
            "INSERT INTO observations (id, user_id, species_name, lat, lon, base_points, \
             point_detail, discovery_bonus, mission_bonus, confidence, observed_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11) \
             ON CONFLICT (id) DO NOTHING",
        )
        .bind(observation.id)
        .bind(observation.user_id)
        .bind(&observation.species_name)
        .bind(observation.location.lat)
        .bind(observation.location.lon)
        .bind(observation.base_points)
        .bind(Json(&observation.point_detail))
        .bind(observation.bonus.discovery)
        .bind(observation.bonus.mission)
        .bind(observation.confidence)
        .bind(observation.observed_at)
        .execute(&self.pool)
        .await
        .map_err(|e| missing_parent(e, || user_not_found(observation.user_id)))?;

        let stored = sqlx::query_as::<_, ObservationRecord>(&format!(
            "SELECT {} FROM observations WHERE id = $1",
            OBSERVATION_COLUMNS
        ))
        .bind(observation.id)
        .fetch_one(&self.pool)
        .await
        .map_err(unexpected)?
        .to_domain();
        if stored.user_id != observation.user_id {
            return Err(PortError::Conflict(format!(
                "Observation {} belongs to another user",
                observation.id
            )));
        }
        Ok(stored)
    }

    async fn claim_discovery(&self, discovery: &Discovery) -> PortResult<Uuid> {
        sqlx::query(
            "INSERT INTO discoveries (user_id, species_name, discovered_at, observation_id) \
             VALUES ($1, $2, $3, $4) ON CONFLICT (user_id, species_name) DO NOTHING",
        )
        .bind(discovery.user_id)
        .bind(&discovery.species_name)
        .bind(discovery.discovered_at)
        .bind(discovery.observation_id)
        .execute(&self.pool)
        .await
        .map_err(unexpected)?;

        // Discoveries are never deleted, so the row read here is the winner.
        sqlx::query_scalar::<_, Uuid>(
            "SELECT observation_id FROM discoveries WHERE user_id = $1 AND species_name = $2",
        )
        .bind(discovery.user_id)
        .bind(&discovery.species_name)
        .fetch_one(&self.pool)
        .await
        .map_err(unexpected)
    }

    async fn set_observation_discovery_bonus(
        &self,
        user_id: Uuid,
        observation_id: Uuid,
        discovery_bonus: i64,
    ) -> PortResult<()> {
        let updated = sqlx::query(
            "UPDATE observations SET discovery_bonus = $3 WHERE id = $2 AND user_id = $1",
        )
        .bind(user_id)
        .bind(observation_id)
        .bind(discovery_bonus)
        .execute(&self.pool)
        .await
        .map_err(unexpected)?
        .rows_affected();
        if updated == 0 {
            return Err(PortError::NotFound(format!(
                "Observation {} not found",
                observation_id
            )));
        }
        Ok(())
    }

    async fn credit_user_points(
        &self,
        user_id: Uuid,
        observation_id: Uuid,
        amount: i64,
    ) -> PortResult<bool> {
        let mut tx = self.pool.begin().await.map_err(unexpected)?;
        let claimed = sqlx::query(
            "INSERT INTO point_credits (observation_id, user_id, amount) VALUES ($1, $2, $3) \
             ON CONFLICT (observation_id) DO NOTHING",
        )
        .bind(observation_id)
        .bind(user_id)
        .bind(amount)
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            missing_parent(e, || {
                PortError::NotFound(format!("Observation {} not found", observation_id))
            })
        })?
        .rows_affected();
        if claimed == 0 {
            return Ok(false);
        }

        let updated =
            sqlx::query("UPDATE users SET total_points = total_points + $2 WHERE user_id = $1")
                .bind(user_id)
                .bind(amount)
                .execute(&mut *tx)
                .await
                .map_err(unexpected)?
                .rows_affected();
        if updated == 0 {
            return Err(user_not_found(user_id));
        }
        tx.commit().await.map_err(unexpected)?;
        Ok(true)
    }

    async fn uncredited_observations(&self, user_id: Uuid) -> PortResult<Vec<Observation>> {
        let records = sqlx::query_as::<_, ObservationRecord>(&format!(
            "SELECT {} FROM observations o WHERE o.user_id = $1 \
             AND NOT EXISTS (SELECT 1 FROM point_credits p WHERE p.observation_id = o.id) \
             ORDER BY o.observed_at",
            OBSERVATION_COLUMNS
        ))
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .map_err(unexpected)?;
        Ok(records.into_iter().map(ObservationRecord::to_domain).collect())
    }

    async fn list_discoveries(&self, user_id: Uuid) -> PortResult<Vec<Discovery>> {
        let records = sqlx::query_as::<_, DiscoveryRecord>(
            "SELECT user_id, species_name, discovered_at, observation_id FROM discoveries \
             WHERE user_id = $1 ORDER BY discovered_at DESC",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .map_err(unexpected)?;
        Ok(records.into_iter().map(DiscoveryRecord::to_domain).collect())
    }

    async fn insert_challenge_if_code_free(
        &self,
        challenge: &Challenge,
        now: DateTime<Utc>,
    ) -> PortResult<bool> {
        let mut tx = self.pool.begin().await.map_err(unexpected)?;
        // Held until commit; serializes creators racing for the same code.
        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
            .bind(&challenge.code)
            .execute(&mut *tx)
            .await
            .map_err(unexpected)?;

        let taken: bool = sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM challenges WHERE code = $1 AND end_at > $2)",
        )
        .bind(&challenge.code)
        .bind(now)
        .fetch_one(&mut *tx)
        .await
        .map_err(unexpected)?;
        if taken {
            return Ok(false);
        }

        sqlx::query(
            "INSERT INTO challenges (id, code, created_by, start_at, end_at, duration_sec, status) \
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(challenge.id)
        .bind(&challenge.code)
        .bind(challenge.created_by)
        .bind(challenge.start_at)
        .bind(challenge.end_at)
        .bind(challenge.duration_sec)
        .bind(&challenge.status)
        .execute(&mut *tx)
        .await
        .map_err(|e| missing_parent(e, || user_not_found(challenge.created_by)))?;
        tx.commit().await.map_err(unexpected)?;
        Ok(true)
    }

    async fn find_challenge_by_code(&self, code: &str) -> PortResult<Option<Challenge>> {
        let record = sqlx::query_as::<_, ChallengeRecord>(
            "SELECT id, code, created_by, start_at, end_at, duration_sec, status FROM challenges \
             WHERE code = $1 ORDER BY start_at DESC LIMIT 1",
        )
        .bind(code)
        .fetch_optional(&self.pool)
        .await
        .map_err(unexpected)?;
        Ok(record.map(ChallengeRecord::to_domain))
    }

    async fn get_challenge(&self, challenge_id: Uuid) -> PortResult<Challenge> {
        let record = sqlx::query_as::<_, ChallengeRecord>(
            "SELECT id, code, created_by, start_at, end_at, duration_sec, status FROM challenges \
             WHERE id = $1",
        )
        .bind(challenge_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(unexpected)?
        .ok_or_else(|| PortError::NotFound(format!("Challenge {} not found", challenge_id)))?;
        Ok(record.to_domain())
    }

    async fn upsert_member(
        &self,
        challenge_id: Uuid,
        user_id: Uuid,
        username: &str,
        joined_at: DateTime<Utc>,
    ) -> PortResult<Member> {
        let record = sqlx::query_as::<_, MemberRecord>(
            "INSERT INTO challenge_members (challenge_id, user_id, username, score, joined_at) \
             VALUES ($1, $2, $3, 0, $4) \
             ON CONFLICT (challenge_id, user_id) \
             DO UPDATE SET username = EXCLUDED.username, joined_at = EXCLUDED.joined_at \
             RETURNING challenge_id, user_id, username, score, joined_at",
        )
        .bind(challenge_id)
        .bind(user_id)
        .bind(username)
        .bind(joined_at)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            missing_parent(e, || {
                PortError::NotFound(format!("Challenge {} not found", challenge_id))
            })
        })?;
        Ok(record.to_domain())
    }

    async fn increment_member_score(
        &self,
        challenge_id: Uuid,
        user_id: Uuid,
        amount: i64,
    ) -> PortResult<()> {
        let updated = sqlx::query(
            "UPDATE challenge_members SET score = score + $3 \
             WHERE challenge_id = $1 AND user_id = $2",
        )
        .bind(challenge_id)
        .bind(user_id)
        .bind(amount)
        .execute(&self.pool)
        .await
        .map_err(unexpected)?
        .rows_affected();
        if updated == 0 {
            return Err(PortError::NotFound(format!(
                "Member {} of challenge {} not found",
                user_id, challenge_id
            )));
        }
        Ok(())
    }

    async fn leaderboard(
        &self,
        challenge_id: Uuid,
        limit: usize,
    ) -> PortResult<LeaderboardSnapshot> {
        let records = sqlx::query_as::<_, MemberRecord>(
            "SELECT challenge_id, user_id, username, score, joined_at FROM challenge_members \
             WHERE challenge_id = $1 ORDER BY score DESC, joined_at ASC, user_id ASC LIMIT $2",
        )
        .bind(challenge_id)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await
        .map_err(unexpected)?;
        debug!(challenge_id = %challenge_id, rows = records.len(), "Leaderboard loaded.");
        Ok(LeaderboardSnapshot {
            challenge_id,
            members: records.into_iter().map(MemberRecord::to_domain).collect(),
        })
    }

    async fn set_active_challenge(
        &self,
        user_id: Uuid,
        pointer: Option<&ActiveChallenge>,
    ) -> PortResult<()> {
        let updated = sqlx::query(
            "UPDATE users SET active_challenge_id = $2, active_challenge_code = $3, \
             active_challenge_start = $4, active_challenge_end = $5 WHERE user_id = $1",
        )
        .bind(user_id)
        .bind(pointer.map(|p| p.id))
        .bind(pointer.map(|p| p.code.as_str()))
        .bind(pointer.map(|p| p.start_at))
        .bind(pointer.map(|p| p.end_at))
        .execute(&self.pool)
        .await
        .map_err(unexpected)?
        .rows_affected();
        if updated == 0 {
            return Err(user_not_found(user_id));
        }
        Ok(())
    }

    async fn clear_active_challenge_if(
        &self,
        user_id: Uuid,
        challenge_id: Uuid,
    ) -> PortResult<bool> {
        let updated = sqlx::query(
            "UPDATE users SET active_challenge_id = NULL, active_challenge_code = NULL, \
             active_challenge_start = NULL, active_challenge_end = NULL \
             WHERE user_id = $1 AND active_challenge_id = $2",
        )
        .bind(user_id)
        .bind(challenge_id)
        .execute(&self.pool)
        .await
        .map_err(unexpected)?
        .rows_affected();
        Ok(updated == 1)
    }

    async fn get_mission_cache(&self, user_id: Uuid) -> PortResult<Option<MissionCacheEntry>> {
        let record = sqlx::query_as::<_, MissionCacheRecord>(
            "SELECT user_id, species_list, missions_list, model, last_fetch_at FROM mission_cache \
             WHERE user_id = $1",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(unexpected)?;
        Ok(record.map(MissionCacheRecord::to_domain))
    }

    async fn save_mission_cache(&self, entry: &MissionCacheEntry) -> PortResult<()> {
        let species: Vec<SpeciesPayload> =
            entry.species_list.iter().map(SpeciesPayload::from).collect();
        let missions: Vec<SpeciesPayload> =
            entry.missions_list.iter().map(SpeciesPayload::from).collect();
        sqlx::query(
            "INSERT INTO mission_cache \
             (user_id, species_list, missions_list, model, last_fetch_at) \
             VALUES ($1, $2, $3, $4, $5) \
             ON CONFLICT (user_id) DO UPDATE SET species_list = EXCLUDED.species_list, \
             missions_list = EXCLUDED.missions_list, model = EXCLUDED.model, \
             last_fetch_at = EXCLUDED.last_fetch_at \
             WHERE mission_cache.last_fetch_at <= EXCLUDED.last_fetch_at",
        )
        .bind(entry.user_id)
        .bind(Json(species))
        .bind(Json(missions))
        .bind(&entry.model)
        .bind(entry.last_fetch_at)
        .execute(&self.pool)
        .await
        .map_err(|e| missing_parent(e, || user_not_found(entry.user_id)))?;
        Ok(())
    }
}
