//! HTTP adjunct.
//!
//! A very small surface: `GET /join/*` serves the SPA shell so invite URLs
//! open the app, with caching disabled so a stale shell never swallows a
//! fresh invite. The route is registered before the catch-all fallback —
//! axum matches specific routes first, and the order here keeps that
//! intent visible.

use axum::extract::State;
use axum::http::header;
use axum::response::{Html, IntoResponse};
use axum::routing::get;
use axum::Json;
use axum::Router;
use serde_json::json;

use crate::state::SidecarState;

/// Minimal SPA shell; the real client bundle replaces this at deploy time.
const INDEX_HTML: &str = r#"<!doctype html>
<html lang="en">
  <head>
    <meta charset="utf-8" />
    <meta name="viewport" content="width=device-width, initial-scale=1" />
    <title>Nahma</title>
  </head>
  <body>
    <div id="app"></div>
    <noscript>Nahma needs JavaScript to open shared workspaces.</noscript>
  </body>
</html>
"#;

/// Router for the HTTP adjunct. `/join/*` must stay registered before the
/// fallback.
pub fn router(state: SidecarState) -> Router {
    Router::new()
        .route("/join/*invite", get(join_page))
        .route("/health", get(health_handler))
        .fallback(get(spa_shell))
        .with_state(state)
}

/// Invite landing route: always the shell, never cached.
async fn join_page() -> impl IntoResponse {
    (
        [(
            header::CACHE_CONTROL,
            "no-cache, no-store, must-revalidate",
        )],
        Html(INDEX_HTML),
    )
}

async fn spa_shell() -> impl IntoResponse {
    Html(INDEX_HTML)
}

/// Health/statistics endpoint, shared by every listener's router.
pub async fn health_handler(State(state): State<SidecarState>) -> impl IntoResponse {
    let (meta, doc, relay) = state.connection_counts();
    let stats = state.store.stats().ok();

    Json(json!({
        "status": "ok",
        "service": "nahma-sidecar",
        "version": env!("CARGO_PKG_VERSION"),
        "connections": { "meta": meta, "doc": doc, "relay": relay },
        "workspaces": stats.as_ref().map(|s| s.workspaces),
        "documents": stats.as_ref().map(|s| s.documents),
        "invites": stats.as_ref().map(|s| s.invites),
    }))
}
