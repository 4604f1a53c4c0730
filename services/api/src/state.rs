//! Shared Application State
//!
//! The `AppState` struct holds the shared resources handed to every
//! handler: the database wrapper, the session manager, and the loaded
//! configuration.

use crate::config::Config;
use crate::db::Db;
use crate::manager::SessionManager;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub db: Arc<Db>,
    pub manager: Arc<SessionManager>,
    pub config: Arc<Config>,
}
