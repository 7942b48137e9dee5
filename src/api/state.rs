use std::sync::Arc;

use crate::db::Database;
use crate::engine::ShopEngine;

/// Shared state for every handler
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<ShopEngine>,
    /// `None` disables the admin endpoints
    pub admin_token: Option<String>,
    /// Present when running on PostgreSQL; pinged by the health check
    pub db: Option<Arc<Database>>,
}

impl AppState {
    pub fn new(
        engine: Arc<ShopEngine>,
        admin_token: Option<String>,
        db: Option<Arc<Database>>,
    ) -> Self {
        Self {
            engine,
            admin_token: admin_token.filter(|t| !t.is_empty()),
            db,
        }
    }
}
