//! crates/plantgo_core/src/ledger.rs
//!
//! Records identifications and credits the user's point total.
//!
//! Each observation is written once, the first-discovery decision is a single
//! conditional insert in the store, and the total is raised with an increment
//! that the store applies at most once per observation id.

use crate::domain::{
    BonusBreakdown, Discovery, IdentifiedObservation, Observation, ObservationReceipt,
};
use crate::error::{GameError, GameResult};
use crate::ports::{DatabaseService, PortError};
use crate::rules::GameRules;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

#[derive(Clone)]
pub struct ObservationLedger {
    db: Arc<dyn DatabaseService>,
    rules: Arc<GameRules>,
}

impl ObservationLedger {
    pub fn new(db: Arc<dyn DatabaseService>, rules: Arc<GameRules>) -> Self {
        Self { db, rules }
    }

    /// Persists the observation, settles the discovery bonus and credits
    /// `base + discovery + mission` to the user's total.
    ///
    /// When `identified.observation_id` names an observation that is already
    /// stored, the stored row is settled instead and its original bonuses win.
    pub async fn record_observation(
        &self,
        user_id: Uuid,
        identified: &IdentifiedObservation,
        mission_bonus: i64,
        now: DateTime<Utc>,
    ) -> GameResult<ObservationReceipt> {
        identified.validate().map_err(GameError::Invalid)?;
        if mission_bonus < 0 {
            return Err(GameError::Invalid(
                "mission bonus must be non-negative".to_string(),
            ));
        }

        let observation = Observation {
            id: identified.observation_id.unwrap_or_else(Uuid::new_v4),
            user_id,
            species_name: identified.species_name.trim().to_string(),
            location: identified.location,
            base_points: identified.base_points,
            point_detail: identified.point_detail.clone(),
            bonus: BonusBreakdown {
                discovery: 0,
                mission: mission_bonus,
            },
            confidence: identified.confidence,
            observed_at: now,
        };
        let stored = self
            .db
            .insert_observation(&observation)
            .await
            .map_err(|e| match e {
                PortError::Conflict(_) => {
                    GameError::Invalid("observation id is already in use".to_string())
                }
                other => GameError::from(other),
            })?;

        let receipt = self.settle(&stored).await?;
        info!(
            user_id = %user_id,
            observation_id = %receipt.observation_id,
            species = %stored.species_name,
            awarded = receipt.total_awarded(),
            newly_credited = receipt.newly_credited,
            "Observation recorded."
        );
        Ok(receipt)
    }

    /// Credits every stored observation of the user that an earlier, failed
    /// attempt left without a point credit. Returns how many were settled.
    pub async fn settle_pending_credits(&self, user_id: Uuid) -> GameResult<usize> {
        let pending = self.db.uncredited_observations(user_id).await?;
        let mut settled = 0;
        for observation in &pending {
            let receipt = self.settle(observation).await?;
            if receipt.newly_credited {
                warn!(
                    user_id = %user_id,
                    observation_id = %observation.id,
                    awarded = receipt.total_awarded(),
                    "Settled a stranded point credit."
                );
                settled += 1;
            }
        }
        Ok(settled)
    }

    /// Claims the discovery, backfills the bonus and applies the credit. Every
    /// step is idempotent per observation, so a settle may be repeated.
    async fn settle(&self, observation: &Observation) -> GameResult<ObservationReceipt> {
        let discovery = Discovery {
            user_id: observation.user_id,
            species_name: observation.species_name.clone(),
            discovered_at: observation.observed_at,
            observation_id: observation.id,
        };
        let holder = self.db.claim_discovery(&discovery).await?;
        let discovery_bonus = if holder == observation.id {
            self.rules.discovery_bonus
        } else {
            0
        };

        if discovery_bonus != observation.bonus.discovery {
            // The bonus is still credited below even if the backfill fails.
            if let Err(e) = self
                .db
                .set_observation_discovery_bonus(
                    observation.user_id,
                    observation.id,
                    discovery_bonus,
                )
                .await
            {
                error!(
                    observation_id = %observation.id,
                    "Failed to backfill discovery bonus: {}", e
                );
            }
        }

        let mut receipt = ObservationReceipt {
            observation_id: observation.id,
            base_points: observation.base_points,
            discovery_bonus,
            mission_bonus: observation.bonus.mission,
            newly_credited: false,
        };
        receipt.newly_credited = self.credit(observation.user_id, &receipt).await?;
        Ok(receipt)
    }

    /// Applies the receipt's total to the user. Safe to call again after a
    /// failure: the store ignores a second credit for the same observation.
    pub async fn credit(&self, user_id: Uuid, receipt: &ObservationReceipt) -> GameResult<bool> {
        let amount = receipt.total_awarded();
        let observation_id = receipt.observation_id;
        let applied = self
            .rules
            .credit_retry
            .run("point credit", None, || {
                let db = self.db.clone();
                async move { db.credit_user_points(user_id, observation_id, amount).await }
            })
            .await
            .map_err(|e| {
                error!(
                    user_id = %user_id,
                    observation_id = %observation_id,
                    amount,
                    "Point credit failed after retries: {}", e
                );
                GameError::from(e)
            })?;
        Ok(applied)
    }
}
