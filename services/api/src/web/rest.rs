//! services/api/src/web/rest.rs
//!
//! Contains the Axum handlers for the REST API endpoints and the master
//! definition for the OpenAPI specification.

use crate::web::auth::{self, AuthResponse, LoginRequest, SignupRequest};
use crate::web::protocol::{ranked_entries, LeaderboardEntry};
use crate::web::state::AppState;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    Extension,
};
use chrono::{DateTime, Utc};
use plantgo_core::domain::{
    ActiveChallenge, ChallengePhase, ChallengeTicket, Discovery, GeoPoint, IdentifiedObservation,
    MissionSpecies,
};
use plantgo_core::error::GameError;
use plantgo_core::game::Standing;
use plantgo_core::missions::FreshnessPolicy;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{error, warn};
use utoipa::{OpenApi, ToSchema};
use uuid::Uuid;

//=========================================================================================
// OpenAPI Master Definition
//=========================================================================================

#[derive(OpenApi)]
#[openapi(
    paths(
        auth::signup_handler,
        auth::login_handler,
        auth::logout_handler,
        me_handler,
        submit_observation_handler,
        list_discoveries_handler,
        missions_handler,
        create_challenge_handler,
        join_challenge_handler,
        active_challenge_handler,
        leave_challenge_handler,
        leaderboard_handler,
    ),
    components(
        schemas(
            SignupRequest,
            LoginRequest,
            AuthResponse,
            ProfileResponse,
            ActiveChallengeResponse,
            ObservationRequest,
            ObservationResponse,
            DiscoveryResponse,
            MissionsRequest,
            MissionsResponse,
            MissionSpeciesResponse,
            CreateChallengeRequest,
            JoinChallengeRequest,
            ChallengeTicketResponse,
            LeaderboardResponse,
            LeaderboardEntry,
        )
    ),
    tags(
        (name = "PlantGo API", description = "Points ledger, missions and timed challenges.")
    )
)]
pub struct ApiDoc;

//=========================================================================================
// Error Mapping
//=========================================================================================

/// Maps a game failure to the status and message the client shows.
pub fn game_error(e: GameError) -> (StatusCode, String) {
    let status = match &e {
        GameError::NotFound => StatusCode::NOT_FOUND,
        GameError::Expired => StatusCode::GONE,
        GameError::Exhausted => StatusCode::SERVICE_UNAVAILABLE,
        GameError::Unauthenticated => StatusCode::UNAUTHORIZED,
        GameError::Invalid(_) => StatusCode::UNPROCESSABLE_ENTITY,
        GameError::Transient(_) => StatusCode::BAD_GATEWAY,
    };
    match e {
        GameError::Transient(detail) => {
            error!("Request failed on a transient error: {}", detail);
            (status, "Service temporarily unavailable. Please try again.".to_string())
        }
        other => (status, other.to_string()),
    }
}

/// Truncates to two decimals so the shown value stays below 100 within a level.
fn display_progress(progress: f64) -> f64 {
    (progress * 100.0).floor() / 100.0
}

//=========================================================================================
// API Response and Payload Structs
//=========================================================================================

#[derive(Serialize, ToSchema)]
pub struct ActiveChallengeResponse {
    pub challenge_id: Uuid,
    pub code: String,
    pub start_at: DateTime<Utc>,
    pub end_at: DateTime<Utc>,
    /// `scheduled`, `active` or `ended`.
    pub phase: String,
    pub remaining_secs: i64,
}

impl ActiveChallengeResponse {
    fn new(pointer: &ActiveChallenge, now: DateTime<Utc>) -> Self {
        Self {
            challenge_id: pointer.id,
            code: pointer.code.clone(),
            start_at: pointer.start_at,
            end_at: pointer.end_at,
            phase: pointer.phase(now).as_str().to_string(),
            remaining_secs: (pointer.end_at - now).num_seconds().max(0),
        }
    }
}

#[derive(Serialize, ToSchema)]
pub struct ProfileResponse {
    pub user_id: Uuid,
    pub username: String,
    pub email: Option<String>,
    pub total_points: i64,
    pub level: i64,
    /// Percent of the way to the next level.
    pub progress: f64,
    pub active_challenge: Option<ActiveChallengeResponse>,
}

impl ProfileResponse {
    fn new(standing: Standing, now: DateTime<Utc>) -> Self {
        let user = standing.user;
        Self {
            user_id: user.user_id,
            username: user.display_name(),
            total_points: user.total_points,
            level: standing.level.level,
            progress: display_progress(standing.level.progress),
            active_challenge: user
                .active_challenge
                .as_ref()
                .map(|pointer| ActiveChallengeResponse::new(pointer, now)),
            email: user.email,
        }
    }
}

/// An identification already priced by the scoring service.
#[derive(Deserialize, ToSchema)]
pub struct ObservationRequest {
    /// Client-chosen key. Resending a request with the same key after a
    /// failure resumes it instead of recording a second observation.
    #[serde(default)]
    pub observation_id: Option<Uuid>,
    pub species_name: String,
    pub lat: f64,
    pub lon: f64,
    pub confidence: f64,
    pub base_points: i64,
    #[serde(default)]
    pub point_detail: BTreeMap<String, i64>,
}

#[derive(Serialize, ToSchema)]
pub struct ObservationResponse {
    pub observation_id: Uuid,
    pub base_points: i64,
    pub discovery_bonus: i64,
    pub mission_bonus: i64,
    pub total_awarded: i64,
    /// Absent when the follow-up read failed; the credit still happened.
    pub total_points: Option<i64>,
    pub level: Option<i64>,
    pub progress: Option<f64>,
}

#[derive(Serialize, ToSchema)]
pub struct DiscoveryResponse {
    pub species_name: String,
    pub discovered_at: DateTime<Utc>,
    pub observation_id: Uuid,
}

impl From<Discovery> for DiscoveryResponse {
    fn from(discovery: Discovery) -> Self {
        Self {
            species_name: discovery.species_name,
            discovered_at: discovery.discovered_at,
            observation_id: discovery.observation_id,
        }
    }
}

#[derive(Deserialize, ToSchema)]
pub struct MissionsRequest {
    pub lat: f64,
    pub lon: f64,
    /// Ask for new data even when the cache is fresh.
    #[serde(default)]
    pub refresh: bool,
}

#[derive(Serialize, ToSchema)]
pub struct MissionSpeciesResponse {
    pub name: String,
    pub common_name: Option<String>,
    pub points: BTreeMap<String, i64>,
    pub is_tree: bool,
    pub is_invasive: bool,
    pub is_flowering: bool,
    pub is_fruiting: bool,
}

impl From<MissionSpecies> for MissionSpeciesResponse {
    fn from(species: MissionSpecies) -> Self {
        Self {
            name: species.name,
            common_name: species.common_name,
            points: species.points,
            is_tree: species.is_tree,
            is_invasive: species.is_invasive,
            is_flowering: species.is_flowering,
            is_fruiting: species.is_fruiting,
        }
    }
}

#[derive(Serialize, ToSchema)]
pub struct MissionsResponse {
    pub missions: Vec<MissionSpeciesResponse>,
    pub species: Vec<MissionSpeciesResponse>,
    pub model: String,
    pub fetched_at: Option<DateTime<Utc>>,
    pub from_cache: bool,
    /// Seconds until a refresh is allowed again.
    pub retry_after_secs: Option<u64>,
}

#[derive(Deserialize, ToSchema)]
pub struct CreateChallengeRequest {
    /// Clamped to the allowed range; 1800 when absent.
    #[serde(default)]
    pub duration_sec: Option<i64>,
}

#[derive(Deserialize, ToSchema)]
pub struct JoinChallengeRequest {
    pub code: String,
}

#[derive(Serialize, ToSchema)]
pub struct ChallengeTicketResponse {
    pub challenge_id: Uuid,
    pub code: String,
    pub start_at: DateTime<Utc>,
    pub end_at: DateTime<Utc>,
}

impl From<ChallengeTicket> for ChallengeTicketResponse {
    fn from(ticket: ChallengeTicket) -> Self {
        Self {
            challenge_id: ticket.challenge_id,
            code: ticket.code,
            start_at: ticket.start_at,
            end_at: ticket.end_at,
        }
    }
}

#[derive(Serialize, ToSchema)]
pub struct LeaderboardResponse {
    pub challenge_id: Uuid,
    pub code: String,
    pub end_at: DateTime<Utc>,
    pub ended: bool,
    pub entries: Vec<LeaderboardEntry>,
}

//=========================================================================================
// Profile & Ledger Handlers
//=========================================================================================

/// The caller's points, level and active challenge.
#[utoipa::path(
    get,
    path = "/me",
    responses(
        (status = 200, description = "Current profile", body = ProfileResponse),
        (status = 401, description = "Not logged in")
    )
)]
pub async fn me_handler(
    State(state): State<Arc<AppState>>,
    Extension(user_id): Extension<Uuid>,
) -> Result<Json<ProfileResponse>, (StatusCode, String)> {
    let now = Utc::now();
    let standing = state.game.profile(user_id, now).await.map_err(game_error)?;
    Ok(Json(ProfileResponse::new(standing, now)))
}

/// Credits an identified observation, then the active challenge.
#[utoipa::path(
    post,
    path = "/observations",
    request_body = ObservationRequest,
    responses(
        (status = 201, description = "Observation credited", body = ObservationResponse),
        (status = 401, description = "Not logged in"),
        (status = 422, description = "Observation payload rejected"),
        (status = 502, description = "Store unavailable; resend with the same observation_id")
    )
)]
pub async fn submit_observation_handler(
    State(state): State<Arc<AppState>>,
    Extension(user_id): Extension<Uuid>,
    Json(req): Json<ObservationRequest>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let identified = IdentifiedObservation {
        observation_id: req.observation_id,
        species_name: req.species_name.trim().to_string(),
        location: GeoPoint {
            lat: req.lat,
            lon: req.lon,
        },
        confidence: req.confidence,
        base_points: req.base_points,
        point_detail: req.point_detail,
    };
    let open_missions = state.game.missions.current(user_id).await;
    let outcome = state
        .game
        .submit_observation(user_id, &identified, open_missions.as_ref(), Utc::now())
        .await
        .map_err(game_error)?;

    let receipt = outcome.receipt;
    let response = ObservationResponse {
        observation_id: receipt.observation_id,
        base_points: receipt.base_points,
        discovery_bonus: receipt.discovery_bonus,
        mission_bonus: receipt.mission_bonus,
        total_awarded: receipt.total_awarded(),
        total_points: outcome.standing.as_ref().map(|s| s.user.total_points),
        level: outcome.standing.as_ref().map(|s| s.level.level),
        progress: outcome
            .standing
            .as_ref()
            .map(|s| display_progress(s.level.progress)),
    };
    Ok((StatusCode::CREATED, Json(response)))
}

/// The caller's discovered species, newest first.
#[utoipa::path(
    get,
    path = "/discoveries",
    responses(
        (status = 200, description = "Discovered species", body = [DiscoveryResponse]),
        (status = 401, description = "Not logged in")
    )
)]
pub async fn list_discoveries_handler(
    State(state): State<Arc<AppState>>,
    Extension(user_id): Extension<Uuid>,
) -> Result<Json<Vec<DiscoveryResponse>>, (StatusCode, String)> {
    let discoveries = state
        .db
        .list_discoveries(user_id)
        .await
        .map_err(|e| game_error(e.into()))?;
    Ok(Json(discoveries.into_iter().map(DiscoveryResponse::from).collect()))
}

/// Nearby missions, served from the cache when fresh.
#[utoipa::path(
    post,
    path = "/missions",
    request_body = MissionsRequest,
    responses(
        (status = 200, description = "Missions for the location", body = MissionsResponse),
        (status = 401, description = "Not logged in"),
        (status = 422, description = "Location out of range"),
        (status = 502, description = "Mission service unavailable")
    )
)]
pub async fn missions_handler(
    State(state): State<Arc<AppState>>,
    Extension(user_id): Extension<Uuid>,
    Json(req): Json<MissionsRequest>,
) -> Result<Json<MissionsResponse>, (StatusCode, String)> {
    let policy = if req.refresh {
        FreshnessPolicy::Refresh
    } else {
        FreshnessPolicy::PreferCache
    };
    let location = GeoPoint {
        lat: req.lat,
        lon: req.lon,
    };
    let outcome = state
        .game
        .missions
        .get_missions(user_id, location, policy, Utc::now())
        .await
        .map_err(game_error)?;

    Ok(Json(MissionsResponse {
        missions: outcome.missions.into_iter().map(Into::into).collect(),
        species: outcome.species.into_iter().map(Into::into).collect(),
        model: outcome.model,
        fetched_at: outcome.fetched_at,
        from_cache: outcome.from_cache,
        // Rounded up so a client never retries a moment too early.
        retry_after_secs: outcome
            .retry_after
            .map(|wait| wait.as_secs() + u64::from(wait.subsec_nanos() > 0)),
    }))
}

//=========================================================================================
// Challenge Handlers
//=========================================================================================

/// Opens a challenge and makes it the caller's active one.
#[utoipa::path(
    post,
    path = "/challenges",
    request_body = CreateChallengeRequest,
    responses(
        (status = 201, description = "Challenge created", body = ChallengeTicketResponse),
        (status = 401, description = "Not logged in"),
        (status = 503, description = "No free join code")
    )
)]
pub async fn create_challenge_handler(
    State(state): State<Arc<AppState>>,
    Extension(user_id): Extension<Uuid>,
    Json(req): Json<CreateChallengeRequest>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let ticket = state
        .game
        .registry
        .create_challenge(user_id, req.duration_sec, Utc::now())
        .await
        .map_err(game_error)?;
    Ok((StatusCode::CREATED, Json(ChallengeTicketResponse::from(ticket))))
}

/// Joins a challenge by its five-character code.
#[utoipa::path(
    post,
    path = "/challenges/join",
    request_body = JoinChallengeRequest,
    responses(
        (status = 200, description = "Joined", body = ChallengeTicketResponse),
        (status = 401, description = "Not logged in"),
        (status = 404, description = "No challenge with that code"),
        (status = 410, description = "Challenge already ended")
    )
)]
pub async fn join_challenge_handler(
    State(state): State<Arc<AppState>>,
    Extension(user_id): Extension<Uuid>,
    Json(req): Json<JoinChallengeRequest>,
) -> Result<Json<ChallengeTicketResponse>, (StatusCode, String)> {
    let ticket = state
        .game
        .registry
        .join_challenge_by_code(user_id, &req.code, Utc::now())
        .await
        .map_err(game_error)?;
    Ok(Json(ChallengeTicketResponse::from(ticket)))
}

/// The caller's active challenge, or 204 when there is none.
#[utoipa::path(
    get,
    path = "/challenges/active",
    responses(
        (status = 200, description = "Active challenge", body = ActiveChallengeResponse),
        (status = 204, description = "No active challenge"),
        (status = 401, description = "Not logged in")
    )
)]
pub async fn active_challenge_handler(
    State(state): State<Arc<AppState>>,
    Extension(user_id): Extension<Uuid>,
) -> Result<Response, (StatusCode, String)> {
    let pointer = state
        .game
        .registry
        .active_challenge(user_id)
        .await
        .map_err(game_error)?;
    Ok(match pointer {
        Some(pointer) => Json(ActiveChallengeResponse::new(&pointer, Utc::now())).into_response(),
        None => StatusCode::NO_CONTENT.into_response(),
    })
}

/// Leaves the active challenge. The score stays on its leaderboard.
#[utoipa::path(
    delete,
    path = "/challenges/active",
    responses(
        (status = 204, description = "Active challenge cleared"),
        (status = 401, description = "Not logged in")
    )
)]
pub async fn leave_challenge_handler(
    State(state): State<Arc<AppState>>,
    Extension(user_id): Extension<Uuid>,
) -> Result<StatusCode, (StatusCode, String)> {
    state
        .game
        .registry
        .clear_active_challenge(user_id)
        .await
        .map_err(game_error)?;
    Ok(StatusCode::NO_CONTENT)
}

/// A one-off ranked read of a challenge.
#[utoipa::path(
    get,
    path = "/challenges/{challenge_id}/leaderboard",
    params(
        ("challenge_id" = Uuid, Path, description = "The challenge to rank.")
    ),
    responses(
        (status = 200, description = "Current ranking", body = LeaderboardResponse),
        (status = 401, description = "Not logged in"),
        (status = 404, description = "Unknown challenge")
    )
)]
pub async fn leaderboard_handler(
    State(state): State<Arc<AppState>>,
    Extension(_user_id): Extension<Uuid>,
    Path(challenge_id): Path<Uuid>,
) -> Result<Json<LeaderboardResponse>, (StatusCode, String)> {
    let standings = state
        .game
        .challenge_standings(challenge_id, Utc::now())
        .await
        .map_err(|e| {
            if matches!(e, GameError::NotFound) {
                warn!(
                    challenge_id = %challenge_id,
                    "Leaderboard requested for an unknown challenge."
                );
            }
            game_error(e)
        })?;
    Ok(Json(LeaderboardResponse {
        challenge_id,
        entries: ranked_entries(&standings.snapshot),
        code: standings.challenge.code,
        end_at: standings.challenge.end_at,
        ended: standings.phase == ChallengePhase::Ended,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn game_errors_map_to_distinct_statuses() {
        let cases = [
            (GameError::NotFound, StatusCode::NOT_FOUND),
            (GameError::Expired, StatusCode::GONE),
            (GameError::Exhausted, StatusCode::SERVICE_UNAVAILABLE),
            (GameError::Unauthenticated, StatusCode::UNAUTHORIZED),
            (GameError::Invalid("x".into()), StatusCode::UNPROCESSABLE_ENTITY),
            (GameError::Transient("db down".into()), StatusCode::BAD_GATEWAY),
        ];
        for (err, status) in cases {
            assert_eq!(game_error(err).0, status);
        }
    }

    #[test]
    fn transient_details_stay_server_side() {
        let (_, message) = game_error(GameError::Transient("connection reset".into()));
        assert!(!message.contains("connection reset"));
    }

    #[test]
    fn progress_is_truncated_for_display() {
        assert_eq!(display_progress(0.454_545), 0.45);
        assert_eq!(display_progress(12.5), 12.5);
        assert!(display_progress(99.999) < 100.0);
        assert_eq!(display_progress(99.999), 99.99);
    }

    #[test]
    fn profile_progress_stays_below_one_hundred_before_a_level_up() {
        let levels = plantgo_core::LevelCalculator::new(100_000);
        let progress = levels.evaluate(99_999);
        assert_eq!(progress.level, 1);
        assert!(display_progress(progress.progress) < 100.0);
    }
}
