//! # History Query API
//!
//! Read-only HTTP surface over the [`HistoryStore`]:
//!
//! - `GET /history?since=<ISO8601>&limit=<int>` - JSON array, oldest first
//! - `GET /health` - `{"status":"ok"}`
//! - anything else - `404 {"error":"not_found"}`
//!
//! Unparsable `since`/`limit` values are ignored rather than rejected. Every response
//! carries `Cache-Control: no-store`. There is no authentication: bind to localhost or
//! put a proxy in front.

use anyhow::{anyhow, Result};
use axum::{
    extract::{Query, State},
    http::{header, HeaderValue, StatusCode},
    middleware,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use log::{debug, info, warn};
use serde::Deserialize;
use serde_json::json;
use std::future::Future;
use std::net::SocketAddr;

use crate::history::{parse_since, HistoryStore};

#[derive(Clone)]
pub struct ApiState {
    pub history: HistoryStore,
}

/// Raw query parameters; both are optional and parsed leniently.
#[derive(Debug, Default, Deserialize)]
pub struct HistoryParams {
    pub since: Option<String>,
    pub limit: Option<String>,
}

impl HistoryParams {
    fn limit(&self) -> Option<usize> {
        self.limit
            .as_deref()
            .and_then(|s| s.trim().parse::<i64>().ok())
            .filter(|n| *n > 0)
            .map(|n| n as usize)
    }
}

pub fn router(history: HistoryStore) -> Router {
    Router::new()
        .route("/history", get(get_history))
        .route("/health", get(health))
        .fallback(not_found)
        .layer(middleware::map_response(no_store))
        .with_state(ApiState { history })
}

async fn get_history(
    State(state): State<ApiState>,
    Query(params): Query<HistoryParams>,
) -> Response {
    let since = params.since.as_deref().and_then(parse_since);
    let limit = params.limit();
    debug!("GET /history since={:?} limit={:?}", since, limit);
    match state.history.query(since, limit).await {
        Ok(records) => Json(records).into_response(),
        Err(e) => {
            warn!("History query failed: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "internal" })),
            )
                .into_response()
        }
    }
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

async fn not_found() -> (StatusCode, Json<serde_json::Value>) {
    (StatusCode::NOT_FOUND, Json(json!({ "error": "not_found" })))
}

async fn no_store(mut response: Response) -> Response {
    response
        .headers_mut()
        .insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
    response
}

/// Serve until `shutdown` resolves.
pub async fn serve<F>(history: HistoryStore, addr: SocketAddr, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| anyhow!("Failed to bind {}: {}", addr, e))?;
    info!("History API listening on http://{}", listener.local_addr()?);
    axum::serve(listener, router(history))
        .with_graceful_shutdown(shutdown)
        .await?;
    info!("History API stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lenient_limit() {
        let p = |s: &str| HistoryParams {
            since: None,
            limit: Some(s.to_string()),
        };
        assert_eq!(p("2").limit(), Some(2));
        assert_eq!(p("0").limit(), None);
        assert_eq!(p("-3").limit(), None);
        assert_eq!(p("abc").limit(), None);
        assert_eq!(HistoryParams::default().limit(), None);
    }
}
