mod handler;

use axum::{
    extract::{ws::WebSocketUpgrade, Query, State},
    response::IntoResponse,
    routing::get,
    Router,
};
use palaver_core::AppState;
use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub struct ConnectParams {
    pub token: String,
    #[serde(default = "default_device")]
    pub device: String,
}

fn default_device() -> String {
    "unknown".to_string()
}

pub fn gateway_router() -> Router<AppState> {
    Router::new().route("/gateway", get(ws_upgrade))
}

async fn ws_upgrade(
    ws: WebSocketUpgrade,
    Query(params): Query<ConnectParams>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handler::handle_connection(socket, state, params))
}
