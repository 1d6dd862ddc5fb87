//! Admin surface: info, compaction, deletion.
//!
//! All admin routes require the shared secret from the configuration when
//! one is set; without one the surface is open (development setups).

use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::Json;

use syncd_core::VirtualPath;
use syncd_server::ServerInfo;

use crate::error::HttpError;
use crate::state::AppState;

fn require_admin(state: &AppState, headers: &HeaderMap) -> Result<(), HttpError> {
    let Some(expected) = state.server.config().admin_token.as_deref() else {
        return Ok(());
    };
    let provided = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "));
    if provided == Some(expected) {
        Ok(())
    } else {
        Err(HttpError::Unauthorized("admin token required".to_owned()))
    }
}

fn parse_vpath(raw: &str) -> Result<VirtualPath, HttpError> {
    // Wildcard captures arrive without the leading slash.
    let raw = format!("/{}", raw.trim_start_matches('/'));
    VirtualPath::parse(&raw).map_err(|err| HttpError::BadRequest(err.to_string()))
}

/// `GET /api/info`
pub async fn info(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<ServerInfo>, HttpError> {
    require_admin(&state, &headers)?;
    Ok(Json(state.server.info()))
}

/// `POST /api/compact` - compact every open realm.
pub async fn compact_all(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<(), HttpError> {
    require_admin(&state, &headers)?;
    state.server.compact_realms(None).await?;
    Ok(())
}

/// `POST /api/compact/{*vpath}` - compact one realm.
pub async fn compact_one(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(vpath): Path<String>,
) -> Result<(), HttpError> {
    require_admin(&state, &headers)?;
    let vpath = parse_vpath(&vpath)?;
    state.server.compact_realms(Some(&vpath)).await?;
    Ok(())
}

/// `DELETE /api/realm/{*vpath}` - responds 200 only after the file and
/// its empty parent directories are gone.
pub async fn delete_realm(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(vpath): Path<String>,
) -> Result<(), HttpError> {
    require_admin(&state, &headers)?;
    let vpath = parse_vpath(&vpath)?;
    state.server.delete_realm(&vpath).await?;
    Ok(())
}

/// `GET /health`
pub async fn health_check() -> &'static str {
    "OK"
}
