//! crates/plantgo_core/src/challenges.rs
//!
//! Creation and joining of code-based challenges, the per-user active challenge
//! pointer, and crediting observation points into the active challenge.

use crate::domain::{ActiveChallenge, Challenge, ChallengePhase, ChallengeTicket, User};
use crate::error::{GameError, GameResult};
use crate::leaderboard::LeaderboardHub;
use crate::ports::{DatabaseService, PortError, PortResult};
use crate::rules::{GameRules, JOIN_CODE_ALPHABET, JOIN_CODE_LEN};
use chrono::{DateTime, Duration, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

//=========================================================================================
// Join Codes
//=========================================================================================

pub fn generate_join_code<R: Rng + ?Sized>(rng: &mut R) -> String {
    (0..JOIN_CODE_LEN)
        .map(|_| JOIN_CODE_ALPHABET[rng.gen_range(0..JOIN_CODE_ALPHABET.len())] as char)
        .collect()
}

/// Upper-cases and trims user input. Returns `None` for strings that can never be a code.
pub fn normalize_join_code(input: &str) -> Option<String> {
    let code = input.trim().to_ascii_uppercase();
    let well_formed = code.len() == JOIN_CODE_LEN
        && code.bytes().all(|b| JOIN_CODE_ALPHABET.contains(&b));
    well_formed.then_some(code)
}

async fn load_user(db: &dyn DatabaseService, user_id: Uuid) -> GameResult<User> {
    db.get_user(user_id).await.map_err(|e| match e {
        PortError::NotFound(_) | PortError::Unauthorized => GameError::Unauthenticated,
        other => GameError::from(other),
    })
}

//=========================================================================================
// ChallengeRegistry
//=========================================================================================

#[derive(Clone)]
pub struct ChallengeRegistry {
    db: Arc<dyn DatabaseService>,
    rules: Arc<GameRules>,
    hub: Arc<LeaderboardHub>,
}

impl ChallengeRegistry {
    pub fn new(
        db: Arc<dyn DatabaseService>,
        rules: Arc<GameRules>,
        hub: Arc<LeaderboardHub>,
    ) -> Self {
        Self { db, rules, hub }
    }

    /// Opens a new challenge starting now, enrols the creator and points
    /// their active challenge at it.
    pub async fn create_challenge(
        &self,
        user_id: Uuid,
        duration_sec: Option<i64>,
        now: DateTime<Utc>,
    ) -> GameResult<ChallengeTicket> {
        let mut rng = StdRng::from_entropy();
        self.create_challenge_with_rng(user_id, duration_sec, now, &mut rng)
            .await
    }

    /// [`Self::create_challenge`] drawing join codes from `rng`.
    pub async fn create_challenge_with_rng<R: Rng + Send>(
        &self,
        user_id: Uuid,
        duration_sec: Option<i64>,
        now: DateTime<Utc>,
        rng: &mut R,
    ) -> GameResult<ChallengeTicket> {
        let user = load_user(self.db.as_ref(), user_id).await?;
        let duration_sec = self.rules.clamp_duration(duration_sec);

        let mut created = None;
        for attempt in 1..=self.rules.join_code_attempts {
            let code = generate_join_code(rng);
            let challenge = Challenge {
                id: Uuid::new_v4(),
                code,
                created_by: user_id,
                start_at: now,
                end_at: now + Duration::seconds(duration_sec),
                duration_sec,
                status: ChallengePhase::Active.as_str().to_string(),
            };
            if self.db.insert_challenge_if_code_free(&challenge, now).await? {
                created = Some(challenge);
                break;
            }
            debug!(attempt, code = %challenge.code, "Join code already in use.");
        }
        let challenge = created.ok_or_else(|| {
            warn!(
                user_id = %user_id,
                "No free join code after {} attempts.", self.rules.join_code_attempts
            );
            GameError::Exhausted
        })?;

        self.enrol(&user, &challenge, now).await?;
        info!(
            user_id = %user_id,
            challenge_id = %challenge.id,
            code = %challenge.code,
            duration_sec,
            "Challenge created."
        );
        Ok(ChallengeTicket::from(&challenge))
    }

    /// Joins the challenge behind `code`. A re-join keeps the existing score.
    pub async fn join_challenge_by_code(
        &self,
        user_id: Uuid,
        code: &str,
        now: DateTime<Utc>,
    ) -> GameResult<ChallengeTicket> {
        let user = load_user(self.db.as_ref(), user_id).await?;
        let code = normalize_join_code(code).ok_or(GameError::NotFound)?;
        let challenge = self
            .db
            .find_challenge_by_code(&code)
            .await?
            .ok_or(GameError::NotFound)?;
        if challenge.phase(now) == ChallengePhase::Ended {
            return Err(GameError::Expired);
        }

        self.enrol(&user, &challenge, now).await?;
        info!(
            user_id = %user_id,
            challenge_id = %challenge.id,
            code = %challenge.code,
            "Challenge joined."
        );
        Ok(ChallengeTicket::from(&challenge))
    }

    async fn enrol(
        &self,
        user: &User,
        challenge: &Challenge,
        now: DateTime<Utc>,
    ) -> PortResult<()> {
        self.db
            .upsert_member(challenge.id, user.user_id, &user.display_name(), now)
            .await?;
        self.db
            .set_active_challenge(user.user_id, Some(&challenge.pointer()))
            .await?;
        self.hub.notify(challenge.id).await;
        Ok(())
    }

    pub async fn active_challenge(&self, user_id: Uuid) -> GameResult<Option<ActiveChallenge>> {
        Ok(load_user(self.db.as_ref(), user_id).await?.active_challenge)
    }

    /// Leaves the active challenge. The member record stays on the leaderboard.
    pub async fn clear_active_challenge(&self, user_id: Uuid) -> GameResult<()> {
        self.db.set_active_challenge(user_id, None).await?;
        info!(user_id = %user_id, "Active challenge cleared.");
        Ok(())
    }

    /// Drops the pointer once its challenge has ended. Returns whether it did.
    pub async fn clear_expired_active_challenge(
        &self,
        user_id: Uuid,
        now: DateTime<Utc>,
    ) -> GameResult<bool> {
        let Some(pointer) = self.active_challenge(user_id).await? else {
            return Ok(false);
        };
        if pointer.phase(now) != ChallengePhase::Ended {
            return Ok(false);
        }
        let cleared = self.db.clear_active_challenge_if(user_id, pointer.id).await?;
        if cleared {
            debug!(
                user_id = %user_id,
                challenge_id = %pointer.id,
                "Expired active challenge cleared."
            );
        }
        Ok(cleared)
    }
}

//=========================================================================================
// ChallengeScorer
//=========================================================================================

#[derive(Clone)]
pub struct ChallengeScorer {
    db: Arc<dyn DatabaseService>,
    hub: Arc<LeaderboardHub>,
}

impl ChallengeScorer {
    pub fn new(db: Arc<dyn DatabaseService>, hub: Arc<LeaderboardHub>) -> Self {
        Self { db, hub }
    }

    /// Adds `points_to_add` to the user's member score in their active challenge,
    /// if `now` lies inside its window. Best effort: failures are only logged.
    pub async fn apply_active_challenge_score(
        &self,
        user_id: Uuid,
        points_to_add: i64,
        now: DateTime<Utc>,
    ) {
        if points_to_add <= 0 {
            return;
        }
        match self.try_apply(user_id, points_to_add, now).await {
            Ok(Some(challenge_id)) => debug!(
                user_id = %user_id,
                challenge_id = %challenge_id,
                points = points_to_add,
                "Challenge score credited."
            ),
            Ok(None) => {}
            Err(e) => warn!(
                user_id = %user_id,
                points = points_to_add,
                "Challenge scoring skipped: {}", e
            ),
        }
    }

    async fn try_apply(
        &self,
        user_id: Uuid,
        points_to_add: i64,
        now: DateTime<Utc>,
    ) -> PortResult<Option<Uuid>> {
        let user = self.db.get_user(user_id).await?;
        let Some(pointer) = user.active_challenge else {
            return Ok(None);
        };
        if !pointer.accepts_score_at(now) {
            return Ok(None);
        }
        self.db
            .increment_member_score(pointer.id, user_id, points_to_add)
            .await?;
        self.hub.notify(pointer.id).await;
        Ok(Some(pointer.id))
    }
}
