// API 路由装配。
mod chat;
mod errors;

use crate::state::AppState;
use axum::Router;
use std::sync::Arc;

pub fn build_router() -> Router<Arc<AppState>> {
    chat::router()
}
