//! crates/plantgo_core/src/memory.rs
//!
//! An in-process implementation of the `DatabaseService` port. Every write
//! takes the table lock exactly once, so conditional writes are atomic.
//! Used by the tests and by the service when no database is configured.

use crate::domain::{
    ActiveChallenge, Challenge, Discovery, LeaderboardSnapshot, Member, MissionCacheEntry,
    Observation, User, UserCredentials,
};
use crate::ports::{DatabaseService, PortError, PortResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{Mutex, Semaphore};
use uuid::Uuid;

struct UserRow {
    user: User,
    hashed_password: Option<String>,
}

#[derive(Default)]
struct Tables {
    users: HashMap<Uuid, UserRow>,
    emails: HashMap<String, Uuid>,
    auth_sessions: HashMap<String, (Uuid, DateTime<Utc>)>,
    observations: HashMap<Uuid, Observation>,
    discoveries: HashMap<(Uuid, String), Discovery>,
    credited: HashSet<Uuid>,
    challenges: HashMap<Uuid, Challenge>,
    members: HashMap<(Uuid, Uuid), Member>,
    mission_cache: HashMap<Uuid, MissionCacheEntry>,
    failing_credits: u32,
    failing_score_increments: u32,
    leaderboard_gate: Option<Arc<Semaphore>>,
}

#[derive(Default)]
pub struct InMemoryDatabase {
    tables: Mutex<Tables>,
}

impl InMemoryDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a user without credentials.
    pub async fn seed_user(&self, username: &str, total_points: i64) -> User {
        let user = User {
            user_id: Uuid::new_v4(),
            username: Some(username.to_string()),
            email: None,
            total_points,
            active_challenge: None,
        };
        self.tables.lock().await.users.insert(
            user.user_id,
            UserRow {
                user: user.clone(),
                hashed_password: None,
            },
        );
        user
    }

    /// Makes the next `n` point credits fail with a transient error.
    pub async fn fail_next_credits(&self, n: u32) {
        self.tables.lock().await.failing_credits = n;
    }

    /// Makes the next `n` member score increments fail with a transient error.
    pub async fn fail_next_score_increments(&self, n: u32) {
        self.tables.lock().await.failing_score_increments = n;
    }

    /// Holds every leaderboard read until a permit is added to the returned gate.
    pub async fn gate_leaderboard_reads(&self) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(0));
        self.tables.lock().await.leaderboard_gate = Some(gate.clone());
        gate
    }

    pub async fn observation(&self, observation_id: Uuid) -> Option<Observation> {
        self.tables
            .lock()
            .await
            .observations
            .get(&observation_id)
            .cloned()
    }

    pub async fn discovery_count(&self, user_id: Uuid) -> usize {
        self.tables
            .lock()
            .await
            .discoveries
            .keys()
            .filter(|(uid, _)| *uid == user_id)
            .count()
    }

    pub async fn membership_count(&self, user_id: Uuid) -> usize {
        self.tables
            .lock()
            .await
            .members
            .keys()
            .filter(|(_, uid)| *uid == user_id)
            .count()
    }

    pub async fn member(&self, challenge_id: Uuid, user_id: Uuid) -> Option<Member> {
        self.tables
            .lock()
            .await
            .members
            .get(&(challenge_id, user_id))
            .cloned()
    }
}

fn user_not_found(user_id: Uuid) -> PortError {
    PortError::NotFound(format!("User {} not found", user_id))
}

#[async_trait]
impl DatabaseService for InMemoryDatabase {
    async fn create_user_with_email(
        &self,
        username: Option<&str>,
        email: &str,
        hashed_password: &str,
    ) -> PortResult<User> {
        let mut tables = self.tables.lock().await;
        let key = email.trim().to_lowercase();
        if tables.emails.contains_key(&key) {
            return Err(PortError::Conflict(format!("Email {} already registered", email)));
        }
        let user = User {
            user_id: Uuid::new_v4(),
            username: username.map(str::to_string),
            email: Some(email.trim().to_string()),
            total_points: 0,
            active_challenge: None,
        };
        tables.emails.insert(key, user.user_id);
        tables.users.insert(
            user.user_id,
            UserRow {
                user: user.clone(),
                hashed_password: Some(hashed_password.to_string()),
            },
        );
        Ok(user)
    }

    async fn get_user_by_email(&self, email: &str) -> PortResult<UserCredentials> {
        let tables = self.tables.lock().await;
        let user_id = tables
            .emails
            .get(&email.trim().to_lowercase())
            .copied()
            .ok_or_else(|| PortError::NotFound(format!("User {} not found", email)))?;
        let row = tables.users.get(&user_id).ok_or_else(|| user_not_found(user_id))?;
        let hashed_password = row
            .hashed_password
            .clone()
            .ok_or_else(|| PortError::NotFound(format!("User {} has no password", email)))?;
        Ok(UserCredentials {
            user_id,
            email: row.user.email.clone().unwrap_or_default(),
            hashed_password,
        })
    }

    async fn get_user(&self, user_id: Uuid) -> PortResult<User> {
        self.tables
            .lock()
            .await
            .users
            .get(&user_id)
            .map(|row| row.user.clone())
            .ok_or_else(|| user_not_found(user_id))
    }

    async fn create_auth_session(
        &self,
        session_id: &str,
        user_id: Uuid,
        expires_at: DateTime<Utc>,
    ) -> PortResult<()> {
        self.tables
            .lock()
            .await
            .auth_sessions
            .insert(session_id.to_string(), (user_id, expires_at));
        Ok(())
    }

    async fn validate_auth_session(&self, session_id: &str) -> PortResult<Uuid> {
        match self.tables.lock().await.auth_sessions.get(session_id) {
            Some((user_id, expires_at)) if *expires_at > Utc::now() => Ok(*user_id),
            _ => Err(PortError::Unauthorized),
        }
    }

    async fn delete_auth_session(&self, session_id: &str) -> PortResult<()> {
        self.tables.lock().await.auth_sessions.remove(session_id);
        Ok(())
    }

    async fn insert_observation(&self, observation: &Observation) -> PortResult<Observation> {
        let mut tables = self.tables.lock().await;
        if !tables.users.contains_key(&observation.user_id) {
            return Err(user_not_found(observation.user_id));
        }
        let stored = tables
            .observations
            .entry(observation.id)
            .or_insert_with(|| observation.clone());
        if stored.user_id != observation.user_id {
            return Err(PortError::Conflict(format!(
                "Observation {} belongs to another user",
                observation.id
            )));
        }
        Ok(stored.clone())
    }

    async fn claim_discovery(&self, discovery: &Discovery) -> PortResult<Uuid> {
        let mut tables = self.tables.lock().await;
        let key = (discovery.user_id, discovery.species_name.clone());
        let holder = tables
            .discoveries
            .entry(key)
            .or_insert_with(|| discovery.clone());
        Ok(holder.observation_id)
    }

    async fn set_observation_discovery_bonus(
        &self,
        user_id: Uuid,
        observation_id: Uuid,
        discovery_bonus: i64,
    ) -> PortResult<()> {
        let mut tables = self.tables.lock().await;
        match tables.observations.get_mut(&observation_id) {
            Some(obs) if obs.user_id == user_id => {
                obs.bonus.discovery = discovery_bonus;
                Ok(())
            }
            _ => Err(PortError::NotFound(format!(
                "Observation {} not found",
                observation_id
            ))),
        }
    }

    async fn credit_user_points(
        &self,
        user_id: Uuid,
        observation_id: Uuid,
        amount: i64,
    ) -> PortResult<bool> {
        let mut tables = self.tables.lock().await;
        if tables.failing_credits > 0 {
            tables.failing_credits -= 1;
            return Err(PortError::Unexpected("store unavailable".to_string()));
        }
        if tables.credited.contains(&observation_id) {
            return Ok(false);
        }
        let row = tables
            .users
            .get_mut(&user_id)
            .ok_or_else(|| user_not_found(user_id))?;
        row.user.total_points += amount;
        tables.credited.insert(observation_id);
        Ok(true)
    }

    async fn uncredited_observations(&self, user_id: Uuid) -> PortResult<Vec<Observation>> {
        let tables = self.tables.lock().await;
        let mut pending: Vec<Observation> = tables
            .observations
            .values()
            .filter(|o| o.user_id == user_id && !tables.credited.contains(&o.id))
            .cloned()
            .collect();
        pending.sort_by_key(|o| o.observed_at);
        Ok(pending)
    }

    async fn list_discoveries(&self, user_id: Uuid) -> PortResult<Vec<Discovery>> {
        let tables = self.tables.lock().await;
        let mut discoveries: Vec<Discovery> = tables
            .discoveries
            .values()
            .filter(|d| d.user_id == user_id)
            .cloned()
            .collect();
        discoveries.sort_by(|a, b| b.discovered_at.cmp(&a.discovered_at));
        Ok(discoveries)
    }

    async fn insert_challenge_if_code_free(
        &self,
        challenge: &Challenge,
        now: DateTime<Utc>,
    ) -> PortResult<bool> {
        let mut tables = self.tables.lock().await;
        let taken = tables
            .challenges
            .values()
            .any(|c| c.code == challenge.code && c.end_at > now);
        if taken {
            return Ok(false);
        }
        tables.challenges.insert(challenge.id, challenge.clone());
        Ok(true)
    }

    async fn find_challenge_by_code(&self, code: &str) -> PortResult<Option<Challenge>> {
        let tables = self.tables.lock().await;
        Ok(tables
            .challenges
            .values()
            .filter(|c| c.code == code)
            .max_by_key(|c| c.start_at)
            .cloned())
    }

    async fn get_challenge(&self, challenge_id: Uuid) -> PortResult<Challenge> {
        self.tables
            .lock()
            .await
            .challenges
            .get(&challenge_id)
            .cloned()
            .ok_or_else(|| PortError::NotFound(format!("Challenge {} not found", challenge_id)))
    }

    async fn upsert_member(
        &self,
        challenge_id: Uuid,
        user_id: Uuid,
        username: &str,
        joined_at: DateTime<Utc>,
    ) -> PortResult<Member> {
        let mut tables = self.tables.lock().await;
        if !tables.challenges.contains_key(&challenge_id) {
            return Err(PortError::NotFound(format!(
                "Challenge {} not found",
                challenge_id
            )));
        }
        let member = tables
            .members
            .entry((challenge_id, user_id))
            .and_modify(|m| {
                m.username = username.to_string();
                m.joined_at = joined_at;
            })
            .or_insert_with(|| Member {
                challenge_id,
                user_id,
                username: username.to_string(),
                score: 0,
                joined_at,
            });
        Ok(member.clone())
    }

    async fn increment_member_score(
        &self,
        challenge_id: Uuid,
        user_id: Uuid,
        amount: i64,
    ) -> PortResult<()> {
        let mut tables = self.tables.lock().await;
        if tables.failing_score_increments > 0 {
            tables.failing_score_increments -= 1;
            return Err(PortError::Unexpected("store unavailable".to_string()));
        }
        let member = tables
            .members
            .get_mut(&(challenge_id, user_id))
            .ok_or_else(|| {
                PortError::NotFound(format!(
                    "Member {} of challenge {} not found",
                    user_id, challenge_id
                ))
            })?;
        member.score += amount;
        Ok(())
    }

    async fn leaderboard(
        &self,
        challenge_id: Uuid,
        limit: usize,
    ) -> PortResult<LeaderboardSnapshot> {
        let gate = self.tables.lock().await.leaderboard_gate.clone();
        if let Some(gate) = gate {
            // Closed gates let reads through.
            let _permit = gate.acquire().await;
        }
        let tables = self.tables.lock().await;
        let mut members: Vec<Member> = tables
            .members
            .values()
            .filter(|m| m.challenge_id == challenge_id)
            .cloned()
            .collect();
        // Ties resolve by join time so the order is stable between snapshots.
        members.sort_by(|a, b| {
            b.score
                .cmp(&a.score)
                .then(a.joined_at.cmp(&b.joined_at))
                .then(a.user_id.cmp(&b.user_id))
        });
        members.truncate(limit);
        Ok(LeaderboardSnapshot {
            challenge_id,
            members,
        })
    }

    async fn set_active_challenge(
        &self,
        user_id: Uuid,
        pointer: Option<&ActiveChallenge>,
    ) -> PortResult<()> {
        let mut tables = self.tables.lock().await;
        let row = tables
            .users
            .get_mut(&user_id)
            .ok_or_else(|| user_not_found(user_id))?;
        row.user.active_challenge = pointer.cloned();
        Ok(())
    }

    async fn clear_active_challenge_if(
        &self,
        user_id: Uuid,
        challenge_id: Uuid,
    ) -> PortResult<bool> {
        let mut tables = self.tables.lock().await;
        let row = tables
            .users
            .get_mut(&user_id)
            .ok_or_else(|| user_not_found(user_id))?;
        let matches = row.user.active_challenge.as_ref().map(|p| p.id) == Some(challenge_id);
        if matches {
            row.user.active_challenge = None;
        }
        Ok(matches)
    }

    async fn get_mission_cache(&self, user_id: Uuid) -> PortResult<Option<MissionCacheEntry>> {
        Ok(self.tables.lock().await.mission_cache.get(&user_id).cloned())
    }

    async fn save_mission_cache(&self, entry: &MissionCacheEntry) -> PortResult<()> {
        self.tables
            .lock()
            .await
            .mission_cache
            .insert(entry.user_id, entry.clone());
        Ok(())
    }
}
