//! crates/plantgo_core/src/game.rs
//!
//! Wires the components together and runs the capture flow:
//! ledger credit, then challenge credit, then the leaderboard push.

use crate::challenges::{ChallengeRegistry, ChallengeScorer};
use crate::domain::{
    Challenge, ChallengePhase, IdentifiedObservation, LeaderboardSnapshot, MissionCacheEntry,
    ObservationReceipt, User,
};
use crate::error::{GameError, GameResult};
use crate::leaderboard::LeaderboardHub;
use crate::ledger::ObservationLedger;
use crate::level::{LevelCalculator, LevelProgress};
use crate::missions::MissionCache;
use crate::ports::{DatabaseService, MissionService, PortError};
use crate::rules::GameRules;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::warn;
use uuid::Uuid;

/// A user together with their derived level.
#[derive(Debug, Clone)]
pub struct Standing {
    pub user: User,
    pub level: LevelProgress,
}

#[derive(Debug, Clone)]
pub struct ObservationOutcome {
    pub receipt: ObservationReceipt,
    /// `None` if the follow-up read of the user failed; the credit itself succeeded.
    pub standing: Option<Standing>,
}

/// A ranked read of one challenge with its live phase.
#[derive(Debug, Clone)]
pub struct ChallengeStandings {
    pub challenge: Challenge,
    pub phase: ChallengePhase,
    pub snapshot: LeaderboardSnapshot,
}

pub struct PlantGo {
    pub db: Arc<dyn DatabaseService>,
    pub rules: Arc<GameRules>,
    pub levels: LevelCalculator,
    pub ledger: ObservationLedger,
    pub registry: ChallengeRegistry,
    pub scorer: ChallengeScorer,
    pub leaderboards: Arc<LeaderboardHub>,
    pub missions: MissionCache,
}

impl PlantGo {
    pub fn new(
        db: Arc<dyn DatabaseService>,
        mission_service: Arc<dyn MissionService>,
        rules: GameRules,
        missions_model: impl Into<String>,
    ) -> Self {
        let rules = Arc::new(rules);
        let leaderboards = Arc::new(LeaderboardHub::new(db.clone(), rules.leaderboard_limit));
        Self {
            levels: LevelCalculator::new(rules.points_per_level),
            ledger: ObservationLedger::new(db.clone(), rules.clone()),
            registry: ChallengeRegistry::new(db.clone(), rules.clone(), leaderboards.clone()),
            scorer: ChallengeScorer::new(db.clone(), leaderboards.clone()),
            missions: MissionCache::new(db.clone(), mission_service, rules.clone(), missions_model),
            leaderboards,
            rules,
            db,
        }
    }

    /// The mission bonus an observation of `species_name` earns against the
    /// caller's current missions.
    pub fn mission_bonus_for(
        &self,
        open_missions: Option<&MissionCacheEntry>,
        species_name: &str,
    ) -> i64 {
        match open_missions {
            Some(entry) if entry.has_mission_for(species_name) => self.rules.mission_bonus,
            _ => 0,
        }
    }

    /// Credits an identified observation, then any earlier observation of the
    /// user whose credit was stranded. Only base points reach the challenge,
    /// and only from the call that applied the credit.
    pub async fn submit_observation(
        &self,
        user_id: Uuid,
        identified: &IdentifiedObservation,
        open_missions: Option<&MissionCacheEntry>,
        now: DateTime<Utc>,
    ) -> GameResult<ObservationOutcome> {
        let mission_bonus = self.mission_bonus_for(open_missions, &identified.species_name);
        let receipt = self
            .ledger
            .record_observation(user_id, identified, mission_bonus, now)
            .await?;

        if receipt.newly_credited {
            self.scorer
                .apply_active_challenge_score(user_id, receipt.base_points, now)
                .await;
        }
        self.settle_stranded_credits(user_id).await;

        let standing = match self.standing(user_id).await {
            Ok(standing) => Some(standing),
            Err(e) => {
                warn!(user_id = %user_id, "Could not read standing after credit: {}", e);
                None
            }
        };
        Ok(ObservationOutcome { receipt, standing })
    }

    pub async fn standing(&self, user_id: Uuid) -> GameResult<Standing> {
        let user = self.db.get_user(user_id).await.map_err(|e| match e {
            PortError::NotFound(_) => GameError::Unauthenticated,
            other => GameError::from(other),
        })?;
        let level = self.levels.evaluate(user.total_points);
        Ok(Standing { user, level })
    }

    pub async fn challenge(&self, challenge_id: Uuid) -> GameResult<Challenge> {
        self.db.get_challenge(challenge_id).await.map_err(|e| match e {
            PortError::NotFound(_) => GameError::NotFound,
            other => GameError::from(other),
        })
    }

    pub async fn challenge_standings(
        &self,
        challenge_id: Uuid,
        now: DateTime<Utc>,
    ) -> GameResult<ChallengeStandings> {
        let challenge = self.challenge(challenge_id).await?;
        let snapshot = self.leaderboards.snapshot(challenge_id).await?;
        Ok(ChallengeStandings {
            phase: challenge.phase(now),
            challenge,
            snapshot,
        })
    }

    /// Profile read used on app start: clears an ended challenge pointer first.
    pub async fn profile(&self, user_id: Uuid, now: DateTime<Utc>) -> GameResult<Standing> {
        match self.registry.clear_expired_active_challenge(user_id, now).await {
            Ok(_) => {}
            Err(GameError::Unauthenticated) => return Err(GameError::Unauthenticated),
            Err(e) => warn!(user_id = %user_id, "Expired pointer cleanup failed: {}", e),
        }
        self.settle_stranded_credits(user_id).await;
        self.standing(user_id).await
    }

    async fn settle_stranded_credits(&self, user_id: Uuid) {
        if let Err(e) = self.ledger.settle_pending_credits(user_id).await {
            warn!(user_id = %user_id, "Settling stranded credits failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{GeoPoint, MissionBatch, PointDetail};
    use crate::memory::InMemoryDatabase;
    use crate::missions::FreshnessPolicy;
    use crate::ports::PortResult;
    use async_trait::async_trait;
    use chrono::Duration;

    struct FixedMissions;

    #[async_trait]
    impl MissionService for FixedMissions {
        async fn fetch_missions(
            &self,
            _location: GeoPoint,
            model: &str,
        ) -> PortResult<MissionBatch> {
            Ok(MissionBatch {
                species_list: Vec::new(),
                missions_list: vec![crate::domain::MissionSpecies {
                    name: "Taraxacum officinale".to_string(),
                    common_name: Some("Dandelion".to_string()),
                    points: PointDetail::new(),
                    is_tree: false,
                    is_invasive: false,
                    is_flowering: true,
                    is_fruiting: false,
                }],
                model: model.to_string(),
            })
        }
    }

    fn observation(species: &str, base_points: i64) -> IdentifiedObservation {
        IdentifiedObservation {
            observation_id: None,
            species_name: species.to_string(),
            location: GeoPoint { lat: 51.5, lon: -0.12 },
            confidence: 0.8,
            base_points,
            point_detail: PointDetail::new(),
        }
    }

    fn game(db: Arc<InMemoryDatabase>) -> PlantGo {
        PlantGo::new(db, Arc::new(FixedMissions), GameRules::default(), "best")
    }

    #[tokio::test]
    async fn level_crosses_with_a_single_observation() {
        let db = Arc::new(InMemoryDatabase::new());
        let user = db.seed_user("clover", 10_999).await;
        let game = PlantGo::new(
            db.clone(),
            Arc::new(FixedMissions),
            GameRules {
                discovery_bonus: 0,
                ..GameRules::default()
            },
            "best",
        );
        let outcome = game
            .submit_observation(
                user.user_id,
                &observation("Trifolium repens", 50),
                None,
                Utc::now(),
            )
            .await
            .unwrap();
        let standing = outcome.standing.unwrap();
        assert_eq!(standing.user.total_points, 11_049);
        assert_eq!(standing.level.level, 2);
        assert!((standing.level.progress - 0.45).abs() < 0.01);
    }

    #[tokio::test]
    async fn challenge_receives_base_points_only() {
        let db = Arc::new(InMemoryDatabase::new());
        let host = db.seed_user("host", 0).await;
        let player = db.seed_user("player", 0).await;
        let game = game(db.clone());
        let now = Utc::now();

        let ticket = game
            .registry
            .create_challenge(host.user_id, Some(1_800), now)
            .await
            .unwrap();
        game.registry
            .join_challenge_by_code(player.user_id, &ticket.code, now)
            .await
            .unwrap();

        let missions = game
            .missions
            .get_missions(
                player.user_id,
                GeoPoint { lat: 51.5, lon: -0.12 },
                FreshnessPolicy::PreferCache,
                now,
            )
            .await
            .unwrap();
        assert_eq!(missions.missions.len(), 1);
        let open = game.missions.current(player.user_id).await;

        let mut sub = game.leaderboards.subscribe(ticket.challenge_id).await.unwrap();
        sub.next().await.unwrap();

        let outcome = game
            .submit_observation(
                player.user_id,
                &observation("Taraxacum officinale", 120),
                open.as_ref(),
                now + Duration::seconds(30),
            )
            .await
            .unwrap();
        assert_eq!(outcome.receipt.discovery_bonus, 500);
        assert_eq!(outcome.receipt.mission_bonus, 500);
        assert_eq!(outcome.standing.unwrap().user.total_points, 1_120);

        let member = db.member(ticket.challenge_id, player.user_id).await.unwrap();
        assert_eq!(member.score, 120);

        let pushed = sub.next().await.unwrap();
        assert_eq!(pushed.members[0].user_id, player.user_id);
        assert_eq!(pushed.members[0].score, 120);
    }

    #[tokio::test]
    async fn profile_clears_ended_pointer() {
        let db = Arc::new(InMemoryDatabase::new());
        let user = db.seed_user("sage", 0).await;
        let game = game(db.clone());
        let now = Utc::now();
        let ticket = game
            .registry
            .create_challenge(user.user_id, Some(600), now)
            .await
            .unwrap();

        let during = game.profile(user.user_id, now).await.unwrap();
        assert!(during.user.active_challenge.is_some());
        let after = game.profile(user.user_id, ticket.end_at).await.unwrap();
        assert!(after.user.active_challenge.is_none());
    }

    #[tokio::test]
    async fn standings_report_the_live_phase() {
        let db = Arc::new(InMemoryDatabase::new());
        let host = db.seed_user("host", 0).await;
        let game = game(db.clone());
        let now = Utc::now();
        let ticket = game
            .registry
            .create_challenge(host.user_id, Some(600), now)
            .await
            .unwrap();

        let live = game.challenge_standings(ticket.challenge_id, now).await.unwrap();
        assert_eq!(live.phase, ChallengePhase::Active);
        assert_eq!(live.snapshot.members.len(), 1);

        let over = game
            .challenge_standings(ticket.challenge_id, ticket.end_at)
            .await
            .unwrap();
        assert_eq!(over.phase, ChallengePhase::Ended);

        let missing = game.challenge_standings(Uuid::new_v4(), now).await.unwrap_err();
        assert!(matches!(missing, GameError::NotFound));
    }

    #[tokio::test]
    async fn resubmission_credits_the_challenge_once() {
        let db = Arc::new(InMemoryDatabase::new());
        let player = db.seed_user("bramble", 0).await;
        let game = game(db.clone());
        let now = Utc::now();
        let ticket = game
            .registry
            .create_challenge(player.user_id, Some(1_800), now)
            .await
            .unwrap();

        let mut sighting = observation("Rubus fruticosus", 70);
        sighting.observation_id = Some(Uuid::new_v4());
        db.fail_next_credits(3).await;
        game.submit_observation(player.user_id, &sighting, None, now)
            .await
            .unwrap_err();
        assert_eq!(db.member(ticket.challenge_id, player.user_id).await.unwrap().score, 0);

        for _ in 0..2 {
            game.submit_observation(player.user_id, &sighting, None, now)
                .await
                .unwrap();
        }
        assert_eq!(db.member(ticket.challenge_id, player.user_id).await.unwrap().score, 70);
        let standing = game.standing(player.user_id).await.unwrap();
        assert_eq!(standing.user.total_points, 570);
    }

    #[tokio::test]
    async fn profile_read_settles_stranded_credits() {
        let db = Arc::new(InMemoryDatabase::new());
        let user = db.seed_user("nettle", 0).await;
        let game = game(db.clone());

        db.fail_next_credits(3).await;
        game.submit_observation(user.user_id, &observation("Urtica dioica", 30), None, Utc::now())
            .await
            .unwrap_err();
        assert_eq!(db.get_user(user.user_id).await.unwrap().total_points, 0);

        let standing = game.profile(user.user_id, Utc::now()).await.unwrap();
        assert_eq!(standing.user.total_points, 530);
    }

    #[tokio::test]
    async fn unknown_user_profile_is_unauthenticated() {
        let db = Arc::new(InMemoryDatabase::new());
        let game = game(db);
        let err = game.profile(Uuid::new_v4(), Utc::now()).await.unwrap_err();
        assert!(matches!(err, GameError::Unauthenticated));
    }
}
