//! crates/plantgo_core/src/missions.rs
//!
//! Per-user cache of nearby missions, gated by a freshness window and a
//! re-fetch cooldown. Fetched batches are mirrored in memory immediately and
//! persisted in the background so callers never wait on the store write.

use crate::domain::{GeoPoint, MissionCacheEntry, MissionSpecies};
use crate::error::{GameError, GameResult};
use crate::ports::{DatabaseService, MissionService};
use crate::rules::GameRules;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{error, info, warn};
use uuid::Uuid;

/// How eager the caller is for new data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FreshnessPolicy {
    /// Serve a fresh cached snapshot without touching the network.
    PreferCache,
    /// The user asked for a re-fetch; only the cooldown can stop it.
    Refresh,
}

#[derive(Debug, Clone)]
pub struct MissionsOutcome {
    pub missions: Vec<MissionSpecies>,
    pub species: Vec<MissionSpecies>,
    pub model: String,
    pub fetched_at: Option<DateTime<Utc>>,
    pub from_cache: bool,
    /// Set when a re-fetch was refused because of the cooldown.
    pub retry_after: Option<Duration>,
}

impl MissionsOutcome {
    fn cached(entry: Option<MissionCacheEntry>, retry_after: Option<Duration>) -> Self {
        match entry {
            Some(entry) => Self {
                missions: entry.missions_list,
                species: entry.species_list,
                model: entry.model,
                fetched_at: Some(entry.last_fetch_at),
                from_cache: true,
                retry_after,
            },
            None => Self {
                missions: Vec::new(),
                species: Vec::new(),
                model: String::new(),
                fetched_at: None,
                from_cache: true,
                retry_after,
            },
        }
    }
}

pub struct MissionCache {
    db: Arc<dyn DatabaseService>,
    service: Arc<dyn MissionService>,
    rules: Arc<GameRules>,
    model: String,
    recent: Mutex<HashMap<Uuid, MissionCacheEntry>>,
}

fn age_of(entry: &MissionCacheEntry, now: DateTime<Utc>) -> Duration {
    // A fetch time in the future counts as "just fetched".
    (now - entry.last_fetch_at).to_std().unwrap_or(Duration::ZERO)
}

impl MissionCache {
    pub fn new(
        db: Arc<dyn DatabaseService>,
        service: Arc<dyn MissionService>,
        rules: Arc<GameRules>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            db,
            service,
            rules,
            model: model.into(),
            recent: Mutex::new(HashMap::new()),
        }
    }

    /// The newest known entry for the user, from memory or the store.
    pub async fn current(&self, user_id: Uuid) -> Option<MissionCacheEntry> {
        let recent = self.recent.lock().await.get(&user_id).cloned();
        let stored = match self.db.get_mission_cache(user_id).await {
            Ok(stored) => stored,
            Err(e) => {
                warn!(user_id = %user_id, "Mission cache read failed: {}", e);
                None
            }
        };
        match (recent, stored) {
            (Some(r), Some(s)) => Some(if r.last_fetch_at >= s.last_fetch_at { r } else { s }),
            (r, s) => r.or(s),
        }
    }

    pub async fn get_missions(
        &self,
        user_id: Uuid,
        location: GeoPoint,
        policy: FreshnessPolicy,
        now: DateTime<Utc>,
    ) -> GameResult<MissionsOutcome> {
        if !location.is_valid() {
            return Err(GameError::Invalid("location is out of range".to_string()));
        }

        let cached = self.current(user_id).await;
        if let Some(entry) = &cached {
            let age = age_of(entry, now);
            if policy == FreshnessPolicy::PreferCache && age < self.rules.mission_freshness {
                return Ok(MissionsOutcome::cached(cached, None));
            }
            if age < self.rules.mission_cooldown {
                let wait = self.rules.mission_cooldown - age;
                info!(user_id = %user_id, ?wait, "Mission re-fetch refused by cooldown.");
                return Ok(MissionsOutcome::cached(cached, Some(wait)));
            }
        }

        let service = &self.service;
        let model = self.model.as_str();
        let batch = self
            .rules
            .mission_fetch_retry
            .run(
                "mission fetch",
                Some(self.rules.mission_fetch_timeout),
                || {
                    let service = service.clone();
                    let model = model.to_string();
                    async move { service.fetch_missions(location, &model).await }
                },
            )
            .await?;

        let entry = MissionCacheEntry {
            user_id,
            species_list: batch.species_list,
            missions_list: batch.missions_list,
            model: if batch.model.is_empty() { self.model.clone() } else { batch.model },
            last_fetch_at: now,
        };
        {
            let mut recent = self.recent.lock().await;
            let freshness = self.rules.mission_freshness;
            recent.retain(|_, e| age_of(e, now) < freshness);
            recent.insert(user_id, entry.clone());
        }
        self.persist_in_background(entry.clone());

        info!(
            user_id = %user_id,
            missions = entry.missions_list.len(),
            species = entry.species_list.len(),
            "Missions fetched."
        );
        Ok(MissionsOutcome {
            missions: entry.missions_list,
            species: entry.species_list,
            model: entry.model,
            fetched_at: Some(entry.last_fetch_at),
            from_cache: false,
            retry_after: None,
        })
    }

    fn persist_in_background(&self, entry: MissionCacheEntry) {
        let db = self.db.clone();
        tokio::spawn(async move {
            if let Err(e) = db.save_mission_cache(&entry).await {
                error!(user_id = %entry.user_id, "Mission cache save skipped: {}", e);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{MissionBatch, PointDetail};
    use crate::memory::InMemoryDatabase;
    use crate::ports::{PortError, PortResult};
    use crate::retry::RetryPolicy;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct CountingMissions {
        calls: AtomicU32,
        failures: AtomicU32,
    }

    impl CountingMissions {
        fn new(failures: u32) -> Self {
            Self {
                calls: AtomicU32::new(0),
                failures: AtomicU32::new(failures),
            }
        }
    }

    fn species(name: &str) -> MissionSpecies {
        let mut points = PointDetail::new();
        points.insert("base".to_string(), 100);
        MissionSpecies {
            name: name.to_string(),
            common_name: None,
            points,
            is_tree: false,
            is_invasive: false,
            is_flowering: true,
            is_fruiting: false,
        }
    }

    #[async_trait]
    impl MissionService for CountingMissions {
        async fn fetch_missions(
            &self,
            _location: GeoPoint,
            model: &str,
        ) -> PortResult<MissionBatch> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(PortError::Unexpected("503".to_string()));
            }
            Ok(MissionBatch {
                species_list: vec![species("Quercus robur"), species("Bellis perennis")],
                missions_list: vec![species("Bellis perennis")],
                model: model.to_string(),
            })
        }
    }

    const HERE: GeoPoint = GeoPoint { lat: 45.76, lon: 4.84 };

    fn cache(db: Arc<InMemoryDatabase>, service: Arc<CountingMissions>) -> MissionCache {
        let rules = GameRules {
            mission_fetch_retry: RetryPolicy {
                attempts: 3,
                initial_backoff: std::time::Duration::from_millis(1),
            },
            ..GameRules::default()
        };
        MissionCache::new(db, service, Arc::new(rules), "best")
    }

    #[tokio::test]
    async fn miss_fetches_and_then_serves_from_cache() {
        let db = Arc::new(InMemoryDatabase::new());
        let service = Arc::new(CountingMissions::new(0));
        let missions = cache(db.clone(), service.clone());
        let user = Uuid::new_v4();
        let now = Utc::now();

        let first = missions
            .get_missions(user, HERE, FreshnessPolicy::PreferCache, now)
            .await
            .unwrap();
        assert!(!first.from_cache);
        assert_eq!(first.missions.len(), 1);

        let later = now + chrono::Duration::minutes(30);
        let second = missions
            .get_missions(user, HERE, FreshnessPolicy::PreferCache, later)
            .await
            .unwrap();
        assert!(second.from_cache);
        assert_eq!(second.species.len(), 2);
        assert_eq!(service.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn refresh_within_cooldown_asks_to_wait() {
        let db = Arc::new(InMemoryDatabase::new());
        let service = Arc::new(CountingMissions::new(0));
        let missions = cache(db.clone(), service.clone());
        let user = Uuid::new_v4();
        let now = Utc::now();

        missions
            .get_missions(user, HERE, FreshnessPolicy::Refresh, now)
            .await
            .unwrap();
        let again = missions
            .get_missions(user, HERE, FreshnessPolicy::Refresh, now + chrono::Duration::seconds(60))
            .await
            .unwrap();

        assert_eq!(again.retry_after, Some(Duration::from_secs(240)));
        assert!(again.from_cache);
        assert_eq!(again.missions.len(), 1);
        assert_eq!(service.calls.load(Ordering::SeqCst), 1);

        let after_cooldown = missions
            .get_missions(user, HERE, FreshnessPolicy::Refresh, now + chrono::Duration::minutes(6))
            .await
            .unwrap();
        assert!(!after_cooldown.from_cache);
        assert_eq!(service.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn stale_cache_is_refetched() {
        let db = Arc::new(InMemoryDatabase::new());
        let service = Arc::new(CountingMissions::new(0));
        let missions = cache(db.clone(), service.clone());
        let user = Uuid::new_v4();
        let now = Utc::now();

        missions
            .get_missions(user, HERE, FreshnessPolicy::PreferCache, now)
            .await
            .unwrap();
        let stale = missions
            .get_missions(
                user,
                HERE,
                FreshnessPolicy::PreferCache,
                now + chrono::Duration::hours(4),
            )
            .await
            .unwrap();
        assert!(!stale.from_cache);
        assert_eq!(service.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn fetch_is_retried_and_persisted() {
        let db = Arc::new(InMemoryDatabase::new());
        let service = Arc::new(CountingMissions::new(2));
        let missions = cache(db.clone(), service.clone());
        let user = Uuid::new_v4();

        let outcome = missions
            .get_missions(user, HERE, FreshnessPolicy::Refresh, Utc::now())
            .await
            .unwrap();
        assert_eq!(outcome.model, "best");
        assert_eq!(service.calls.load(Ordering::SeqCst), 3);

        // Persistence runs in the background.
        for _ in 0..50 {
            if db.get_mission_cache(user).await.unwrap().is_some() {
                break;
            }
            tokio::task::yield_now().await;
        }
        let stored = db.get_mission_cache(user).await.unwrap().unwrap();
        assert!(stored.has_mission_for("bellis perennis "));
    }

    #[tokio::test]
    async fn exhausted_fetch_is_transient() {
        let db = Arc::new(InMemoryDatabase::new());
        let service = Arc::new(CountingMissions::new(10));
        let missions = cache(db.clone(), service.clone());

        let err = missions
            .get_missions(Uuid::new_v4(), HERE, FreshnessPolicy::Refresh, Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, GameError::Transient(_)));
    }
}
