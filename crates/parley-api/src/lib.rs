pub mod chat;
pub mod error;
pub mod middleware;

use std::sync::Arc;

use parley_db::Database;
use parley_gateway::hub::RealtimeHub;

pub type AppState = Arc<AppStateInner>;

pub struct AppStateInner {
    pub db: Database,
    pub jwt_secret: String,
    pub hub: RealtimeHub,
}
