//! services/api/src/web/state.rs
//!
//! Defines the application state shared by every handler and connection.

use plantgo_core::game::PlantGo;
use plantgo_core::ports::DatabaseService;
use std::sync::Arc;

/// The shared application state, created once at startup and passed to all handlers.
#[derive(Clone)]
pub struct AppState {
    pub game: Arc<PlantGo>,
    /// Same store the game runs on; used directly for accounts and sessions.
    pub db: Arc<dyn DatabaseService>,
}

impl AppState {
    pub fn new(game: Arc<PlantGo>) -> Self {
        Self {
            db: game.db.clone(),
            game,
        }
    }
}
