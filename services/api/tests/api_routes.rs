//! Drives the real router over the in-memory store.

use api_lib::web::{self, state::AppState};
use async_trait::async_trait;
use axum::{
    body::Body,
    http::{header, Request, StatusCode},
    Router,
};
use http_body_util::BodyExt;
use plantgo_core::domain::{GeoPoint, MissionBatch, MissionSpecies, PointDetail};
use plantgo_core::game::PlantGo;
use plantgo_core::memory::InMemoryDatabase;
use plantgo_core::ports::{MissionService, PortResult};
use plantgo_core::rules::GameRules;
use serde_json::{json, Value};
use std::sync::Arc;
use tower::ServiceExt;

struct MeadowMissions;

#[async_trait]
impl MissionService for MeadowMissions {
    async fn fetch_missions(&self, _location: GeoPoint, model: &str) -> PortResult<MissionBatch> {
        let mut points = PointDetail::new();
        points.insert("base".to_string(), 90);
        Ok(MissionBatch {
            species_list: Vec::new(),
            missions_list: vec![MissionSpecies {
                name: "Bellis perennis".to_string(),
                common_name: Some("Daisy".to_string()),
                points,
                is_tree: false,
                is_invasive: false,
                is_flowering: true,
                is_fruiting: false,
            }],
            model: model.to_string(),
        })
    }
}

fn app() -> Router {
    let db = Arc::new(InMemoryDatabase::new());
    let game = Arc::new(PlantGo::new(
        db,
        Arc::new(MeadowMissions),
        GameRules::default(),
        "best",
    ));
    web::router(Arc::new(AppState::new(game)))
}

async fn call(
    app: &Router,
    method: &str,
    uri: &str,
    cookie: Option<&str>,
    body: Option<Value>,
) -> (StatusCode, Option<String>, Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(cookie) = cookie {
        builder = builder.header(header::COOKIE, cookie);
    }
    let request = match body {
        Some(body) => builder
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };

    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let set_cookie = response
        .headers()
        .get(header::SET_COOKIE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(';').next())
        .map(str::to_string);
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let json = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, set_cookie, json)
}

async fn signup(app: &Router, username: &str) -> String {
    let (status, cookie, body) = call(
        app,
        "POST",
        "/auth/signup",
        None,
        Some(json!({
            "username": username,
            "email": format!("{}@example.org", username),
            "password": "correct horse",
        })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["username"], username);
    cookie.unwrap()
}

fn observation(species: &str, base_points: i64) -> Value {
    json!({
        "species_name": species,
        "lat": 48.85,
        "lon": 2.35,
        "confidence": 0.91,
        "base_points": base_points,
        "point_detail": {"base": base_points},
    })
}

#[tokio::test]
async fn protected_routes_need_a_session() {
    let app = app();
    let (status, _, _) = call(&app, "GET", "/me", None, None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    let (status, _, _) = call(&app, "GET", "/me", Some("session=forged"), None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn signup_login_and_logout() {
    let app = app();
    let cookie = signup(&app, "rowan").await;

    let (status, _, me) = call(&app, "GET", "/me", Some(&cookie), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(me["username"], "rowan");
    assert_eq!(me["total_points"], 0);
    assert_eq!(me["level"], 1);

    let (status, _, _) = call(
        &app,
        "POST",
        "/auth/signup",
        None,
        Some(json!({"email": "ROWAN@example.org", "password": "another one"})),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, _, _) = call(
        &app,
        "POST",
        "/auth/login",
        None,
        Some(json!({"email": "rowan@example.org", "password": "wrong password"})),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, login_cookie, _) = call(
        &app,
        "POST",
        "/auth/login",
        None,
        Some(json!({"email": "rowan@example.org", "password": "correct horse"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let login_cookie = login_cookie.unwrap();

    let (status, _, _) = call(&app, "POST", "/auth/logout", Some(&login_cookie), None).await;
    assert_eq!(status, StatusCode::OK);
    let (status, _, _) = call(&app, "GET", "/me", Some(&login_cookie), None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    // The signup session is independent.
    let (status, _, _) = call(&app, "GET", "/me", Some(&cookie), None).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn observations_award_discovery_once() {
    let app = app();
    let cookie = signup(&app, "hazel").await;

    let (status, _, first) = call(
        &app,
        "POST",
        "/observations",
        Some(&cookie),
        Some(observation("Fagus sylvatica", 150)),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(first["discovery_bonus"], 500);
    assert_eq!(first["total_points"], 650);

    let (_, _, second) = call(
        &app,
        "POST",
        "/observations",
        Some(&cookie),
        Some(observation("Fagus sylvatica", 150)),
    )
    .await;
    assert_eq!(second["discovery_bonus"], 0);
    assert_eq!(second["total_points"], 800);

    let (status, _, herbarium) = call(&app, "GET", "/discoveries", Some(&cookie), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(herbarium.as_array().unwrap().len(), 1);
    assert_eq!(herbarium[0]["species_name"], "Fagus sylvatica");
}

#[tokio::test]
async fn resending_an_observation_key_does_not_double_credit() {
    let app = app();
    let cookie = signup(&app, "linden").await;
    let mut sighting = observation("Tilia cordata", 60);
    sighting["observation_id"] = json!(uuid::Uuid::new_v4());

    let (status, _, first) =
        call(&app, "POST", "/observations", Some(&cookie), Some(sighting.clone())).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(first["total_points"], 560);

    let (status, _, again) =
        call(&app, "POST", "/observations", Some(&cookie), Some(sighting)).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(again["observation_id"], first["observation_id"]);
    assert_eq!(again["discovery_bonus"], 500);
    assert_eq!(again["total_points"], 560);
}

#[tokio::test]
async fn invalid_observation_is_rejected() {
    let app = app();
    let cookie = signup(&app, "alder").await;
    let mut bad = observation("Alnus glutinosa", 40);
    bad["confidence"] = json!(1.5);
    let (status, _, _) = call(&app, "POST", "/observations", Some(&cookie), Some(bad)).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
}

#[tokio::test]
async fn missions_grant_bonus_and_respect_cooldown() {
    let app = app();
    let cookie = signup(&app, "willow").await;
    let here = json!({"lat": 48.85, "lon": 2.35});

    let (status, _, missions) =
        call(&app, "POST", "/missions", Some(&cookie), Some(here.clone())).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(missions["from_cache"], false);
    assert_eq!(missions["missions"][0]["name"], "Bellis perennis");

    let (_, _, refresh) = call(
        &app,
        "POST",
        "/missions",
        Some(&cookie),
        Some(json!({"lat": 48.85, "lon": 2.35, "refresh": true})),
    )
    .await;
    assert_eq!(refresh["from_cache"], true);
    let wait = refresh["retry_after_secs"].as_u64().unwrap();
    assert!(wait > 0 && wait <= 300);

    let (_, _, receipt) = call(
        &app,
        "POST",
        "/observations",
        Some(&cookie),
        Some(observation("bellis perennis", 90)),
    )
    .await;
    assert_eq!(receipt["mission_bonus"], 500);
    assert_eq!(receipt["total_awarded"], 1_090);
}

#[tokio::test]
async fn challenge_flow_from_create_to_leaderboard() {
    let app = app();
    let host = signup(&app, "oak").await;
    let player = signup(&app, "ivy").await;

    let (status, _, ticket) = call(
        &app,
        "POST",
        "/challenges",
        Some(&host),
        Some(json!({"duration_sec": 60})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let code = ticket["code"].as_str().unwrap().to_string();
    let challenge_id = ticket["challenge_id"].as_str().unwrap().to_string();
    assert_eq!(code.len(), 5);

    let (status, _, joined) = call(
        &app,
        "POST",
        "/challenges/join",
        Some(&player),
        Some(json!({"code": code.to_lowercase()})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(joined["challenge_id"], challenge_id.as_str());

    let (status, _, active) = call(&app, "GET", "/challenges/active", Some(&player), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(active["phase"], "active");
    // Short requests are clamped up to the ten-minute minimum.
    assert!(active["remaining_secs"].as_i64().unwrap() > 500);

    call(
        &app,
        "POST",
        "/observations",
        Some(&player),
        Some(observation("Hedera helix", 120)),
    )
    .await;

    let uri = format!("/challenges/{}/leaderboard", challenge_id);
    let (status, _, board) = call(&app, "GET", &uri, Some(&host), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(board["ended"], false);
    assert_eq!(board["entries"][0]["username"], "ivy");
    assert_eq!(board["entries"][0]["score"], 120);
    assert_eq!(board["entries"][0]["rank"], 1);
    assert_eq!(board["entries"][1]["score"], 0);

    let (status, _, _) = call(&app, "DELETE", "/challenges/active", Some(&player), None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    let (status, _, _) = call(&app, "GET", "/challenges/active", Some(&player), None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
}

#[tokio::test]
async fn unknown_codes_and_challenges_are_not_found() {
    let app = app();
    let cookie = signup(&app, "birch").await;
    let (status, _, _) = call(
        &app,
        "POST",
        "/challenges/join",
        Some(&cookie),
        Some(json!({"code": "ZZZZZ"})),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let uri = format!("/challenges/{}/leaderboard", uuid::Uuid::new_v4());
    let (status, _, _) = call(&app, "GET", &uri, Some(&cookie), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}
