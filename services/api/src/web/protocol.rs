//! services/api/src/web/protocol.rs
//!
//! Defines the WebSocket message protocol for live challenge leaderboards.

use chrono::{DateTime, Utc};
use plantgo_core::domain::LeaderboardSnapshot;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

//=========================================================================================
// Messages Sent FROM the Client TO the Server
//=========================================================================================

#[derive(Deserialize, Debug)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Starts watching a challenge. Replaces any previous subscription.
    Subscribe { challenge_id: Uuid },

    /// Stops the current subscription. Safe to send more than once.
    Unsubscribe,
}

//=========================================================================================
// Messages Sent FROM the Server TO the Client
//=========================================================================================

/// One ranked row of a leaderboard panel.
#[derive(Serialize, Debug, Clone, PartialEq, ToSchema)]
pub struct LeaderboardEntry {
    pub rank: usize,
    pub user_id: Uuid,
    pub username: String,
    pub score: i64,
}

/// Ranks a snapshot for display; rank is the position plus one.
pub fn ranked_entries(snapshot: &LeaderboardSnapshot) -> Vec<LeaderboardEntry> {
    snapshot
        .members
        .iter()
        .enumerate()
        .map(|(i, member)| LeaderboardEntry {
            rank: i + 1,
            user_id: member.user_id,
            username: member.username.clone(),
            score: member.score,
        })
        .collect()
}

#[derive(Serialize, Debug, Clone)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// The latest ranking of the watched challenge.
    Leaderboard {
        challenge_id: Uuid,
        end_at: DateTime<Utc>,
        ended: bool,
        entries: Vec<LeaderboardEntry>,
    },

    /// Confirms that pushes for the challenge have stopped.
    Unsubscribed { challenge_id: Uuid },

    /// A recoverable problem with the last client message.
    Error { message: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use plantgo_core::domain::Member;

    #[test]
    fn client_messages_use_a_type_tag() {
        let id = Uuid::new_v4();
        let raw = format!(r#"{{"type":"subscribe","challenge_id":"{}"}}"#, id);
        match serde_json::from_str::<ClientMessage>(&raw).unwrap() {
            ClientMessage::Subscribe { challenge_id } => assert_eq!(challenge_id, id),
            other => panic!("unexpected message: {:?}", other),
        }
        assert!(matches!(
            serde_json::from_str::<ClientMessage>(r#"{"type":"unsubscribe"}"#).unwrap(),
            ClientMessage::Unsubscribe
        ));
    }

    #[test]
    fn entries_are_ranked_from_one() {
        let challenge_id = Uuid::new_v4();
        let member = |name: &str, score| Member {
            challenge_id,
            user_id: Uuid::new_v4(),
            username: name.to_string(),
            score,
            joined_at: Utc::now(),
        };
        let snapshot = LeaderboardSnapshot {
            challenge_id,
            members: vec![member("fern", 90), member("moss", 40)],
        };
        let entries = ranked_entries(&snapshot);
        assert_eq!(entries[0].rank, 1);
        assert_eq!(entries[1].rank, 2);
        assert_eq!(entries[1].username, "moss");

        let json = serde_json::to_value(ServerMessage::Leaderboard {
            challenge_id,
            end_at: Utc::now(),
            ended: false,
            entries,
        })
        .unwrap();
        assert_eq!(json["type"], "leaderboard");
        assert_eq!(json["entries"][0]["score"], 90);
    }
}
