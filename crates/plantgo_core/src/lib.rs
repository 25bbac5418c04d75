pub mod challenges;
pub mod domain;
pub mod error;
pub mod game;
pub mod leaderboard;
pub mod ledger;
pub mod level;
pub mod memory;
pub mod missions;
pub mod ports;
pub mod retry;
pub mod rules;

pub use challenges::{ChallengeRegistry, ChallengeScorer};
pub use domain::{
    ActiveChallenge, BonusBreakdown, Challenge, ChallengePhase, ChallengeTicket, Discovery,
    GeoPoint, IdentifiedObservation, LeaderboardSnapshot, Member, MissionBatch, MissionCacheEntry,
    MissionSpecies, Observation, ObservationReceipt, PointDetail, User, UserCredentials,
};
pub use error::{GameError, GameResult};
pub use game::{ChallengeStandings, ObservationOutcome, PlantGo, Standing};
pub use leaderboard::{LeaderboardHub, LeaderboardSubscription, UnsubscribeHandle};
pub use ledger::ObservationLedger;
pub use level::{LevelCalculator, LevelProgress};
pub use memory::InMemoryDatabase;
pub use missions::{FreshnessPolicy, MissionCache, MissionsOutcome};
pub use ports::{DatabaseService, MissionService, PortError, PortResult};
pub use rules::GameRules;
