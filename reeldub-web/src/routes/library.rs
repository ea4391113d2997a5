//! Series/season/episode browsing over the denormalized library view.

use std::collections::BTreeMap;

use axum::extract::{Path, State};
use axum::routing::get;
use axum::{Json, Router};
use reeldub_auth::rbac::require_library_access;
use reeldub_store::models::LibraryRow;
use serde::Serialize;

use crate::error::RdWebResult;
use crate::extract::{AuthenticatedIdentity, ALLOW_SHARED_READ};
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/library/series", get(series))
        .route("/library/{slug}/seasons", get(seasons))
        .route("/library/{slug}/{season}/episodes", get(episodes))
}

#[derive(Serialize)]
struct SeriesEntry {
    series_slug: String,
    series_title: String,
    episode_count: usize,
}

async fn series(State(state): State<AppState>, identity: AuthenticatedIdentity) -> RdWebResult<Json<Vec<SeriesEntry>>> {
    let rows = state.store.library.list_episodes(&identity.0.user.id, None).await?;
    require_library_access(&identity.0, &rows, ALLOW_SHARED_READ)?;

    let mut by_slug: BTreeMap<String, SeriesEntry> = BTreeMap::new();
    for row in rows {
        by_slug
            .entry(row.series_slug.clone())
            .and_modify(|e| e.episode_count += 1)
            .or_insert(SeriesEntry { series_slug: row.series_slug, series_title: row.series_title, episode_count: 1 });
    }
    Ok(Json(by_slug.into_values().collect()))
}

async fn seasons(State(state): State<AppState>, identity: AuthenticatedIdentity, Path(slug): Path<String>) -> RdWebResult<Json<Vec<i64>>> {
    let rows = state.store.library.list_episodes(&identity.0.user.id, Some(&slug)).await?;
    require_library_access(&identity.0, &rows, ALLOW_SHARED_READ)?;

    let mut seasons: Vec<i64> = rows.into_iter().map(|r| r.season_number).collect();
    seasons.sort_unstable();
    seasons.dedup();
    Ok(Json(seasons))
}

async fn episodes(
    State(state): State<AppState>,
    identity: AuthenticatedIdentity,
    Path((slug, season)): Path<(String, i64)>,
) -> RdWebResult<Json<Vec<LibraryRow>>> {
    let rows = state.store.library.list_episodes(&identity.0.user.id, Some(&slug)).await?;
    require_library_access(&identity.0, &rows, ALLOW_SHARED_READ)?;

    let mut matching: Vec<LibraryRow> = rows.into_iter().filter(|r| r.season_number == season).collect();
    matching.sort_by_key(|r| r.episode_number);
    Ok(Json(matching))
}
