//! services/api/src/adapters/missions.rs
//!
//! HTTP adapter for the mission collaborator. Posts the user's location and
//! turns the `{result_pred, result}` payload into typed mission species.

use async_trait::async_trait;
use plantgo_core::domain::{GeoPoint, MissionBatch, MissionSpecies, PointDetail};
use plantgo_core::ports::{MissionService, PortError, PortResult};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

//=========================================================================================
// Wire Types
//=========================================================================================

#[derive(Serialize)]
struct MissionRequest<'a> {
    point: PointPayload,
    model: &'a str,
}

#[derive(Serialize)]
struct PointPayload {
    lat: f64,
    lon: f64,
}

#[derive(Deserialize, Default)]
struct SpeciesGroup {
    #[serde(default)]
    species: Vec<serde_json::Value>,
}

#[derive(Deserialize)]
struct MissionResponse {
    #[serde(default)]
    result_pred: SpeciesGroup,
    #[serde(default)]
    result: SpeciesGroup,
    #[serde(default)]
    model: Option<String>,
}

/// One species as exchanged with the collaborator and stored in the cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpeciesPayload {
    pub name: String,
    #[serde(default)]
    pub common_name: Option<String>,
    #[serde(default)]
    pub points: PointDetail,
    #[serde(default)]
    pub is_tree: bool,
    #[serde(default)]
    pub is_invasive: bool,
    #[serde(default)]
    pub is_flowering: bool,
    #[serde(default)]
    pub is_fruiting: bool,
}

impl SpeciesPayload {
    pub fn into_domain(self) -> MissionSpecies {
        MissionSpecies {
            name: self.name,
            common_name: self.common_name,
            points: self.points,
            is_tree: self.is_tree,
            is_invasive: self.is_invasive,
            is_flowering: self.is_flowering,
            is_fruiting: self.is_fruiting,
        }
    }
}

impl From<&MissionSpecies> for SpeciesPayload {
    fn from(species: &MissionSpecies) -> Self {
        Self {
            name: species.name.clone(),
            common_name: species.common_name.clone(),
            points: species.points.clone(),
            is_tree: species.is_tree,
            is_invasive: species.is_invasive,
            is_flowering: species.is_flowering,
            is_fruiting: species.is_fruiting,
        }
    }
}

/// Keeps the well-formed entries of a species array and logs the rest.
fn parse_species(raw: Vec<serde_json::Value>, list: &str) -> Vec<MissionSpecies> {
    raw.into_iter()
        .filter_map(|value| match serde_json::from_value::<SpeciesPayload>(value) {
            Ok(payload) if payload.name.trim().is_empty() => {
                warn!(list, "Dropped a species without a name.");
                None
            }
            Ok(payload) if payload.points.values().any(|v| *v < 0) => {
                warn!(list, species = %payload.name, "Dropped a species with negative points.");
                None
            }
            Ok(payload) => Some(payload.into_domain()),
            Err(e) => {
                warn!(list, "Dropped a malformed species entry: {}", e);
                None
            }
        })
        .collect()
}

fn parse_batch(body: &str, requested_model: &str) -> PortResult<MissionBatch> {
    let response: MissionResponse = serde_json::from_str(body)
        .map_err(|e| PortError::Conflict(format!("Malformed mission payload: {}", e)))?;
    Ok(MissionBatch {
        species_list: parse_species(response.result_pred.species, "species"),
        missions_list: parse_species(response.result.species, "missions"),
        model: response
            .model
            .filter(|m| !m.trim().is_empty())
            .unwrap_or_else(|| requested_model.to_string()),
    })
}

//=========================================================================================
// The Adapter
//=========================================================================================

pub struct HttpMissionAdapter {
    client: reqwest::Client,
    url: String,
}

impl HttpMissionAdapter {
    pub fn new(url: impl Into<String>, request_timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .user_agent("plantgo-api/0.1")
            .build()
            .unwrap_or_default();
        Self {
            client,
            url: url.into(),
        }
    }
}

#[async_trait]
impl MissionService for HttpMissionAdapter {
    async fn fetch_missions(&self, location: GeoPoint, model: &str) -> PortResult<MissionBatch> {
        let request = MissionRequest {
            point: PointPayload {
                lat: location.lat,
                lon: location.lon,
            },
            model,
        };
        let response = self
            .client
            .post(&self.url)
            .json(&request)
            .send()
            .await
            .map_err(|e| PortError::Unexpected(format!("Mission request failed: {}", e)))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| PortError::Unexpected(format!("Mission response unreadable: {}", e)))?;
        if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(PortError::Unexpected(format!("Missions {}", status)));
        }
        if !status.is_success() {
            warn!(%status, body = %body, "Mission collaborator rejected the request.");
            return Err(PortError::Conflict(format!("Missions {}", status)));
        }

        let batch = parse_batch(&body, model)?;
        debug!(
            species = batch.species_list.len(),
            missions = batch.missions_list.len(),
            "Mission payload parsed."
        );
        Ok(batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_lists_map_to_species_and_missions() {
        let body = r#"{
            "result_pred": {"species": [
                {"name": "Quercus robur", "common_name": "English oak",
                 "points": {"base": 120}, "is_tree": true},
                {"name": "Bellis perennis", "is_flowering": true}
            ]},
            "result": {"species": [
                {"name": "Bellis perennis", "points": {"base": 80, "flowering": 20},
                 "is_flowering": true}
            ]}
        }"#;
        let batch = parse_batch(body, "best").unwrap();
        assert_eq!(batch.species_list.len(), 2);
        assert!(batch.species_list[0].is_tree);
        assert_eq!(batch.missions_list[0].points.get("flowering"), Some(&20));
        assert_eq!(batch.model, "best");
    }

    #[test]
    fn missing_groups_read_as_empty() {
        let batch = parse_batch(r#"{"model": "fast"}"#, "best").unwrap();
        assert!(batch.species_list.is_empty());
        assert!(batch.missions_list.is_empty());
        assert_eq!(batch.model, "fast");
    }

    #[test]
    fn bad_entries_are_dropped_not_fatal() {
        let body = r#"{"result": {"species": [
            {"name": ""},
            {"name": "Urtica dioica", "points": {"base": -5}},
            {"common_name": "no scientific name"},
            {"name": "Rubus fruticosus", "is_fruiting": true}
        ]}}"#;
        let batch = parse_batch(body, "best").unwrap();
        let names: Vec<&str> = batch.missions_list.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["Rubus fruticosus"]);
    }

    #[test]
    fn non_json_body_is_rejected() {
        let err = parse_batch("<html>bad gateway</html>", "best").unwrap_err();
        assert!(matches!(err, PortError::Conflict(_)));
    }
}
