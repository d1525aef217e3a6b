use axum::{
    extract::{Query, State},
    Json,
};
use chrono::Utc;

use crate::{
    dto::log_dto::{RecentLogsQuery, RecentLogsResponse, StatsResponse},
    error::Result,
    models::delivery_record::{DeliveryRecord, DeliveryStatus},
    services::log_store::{clamp_limit, MAX_RECENT_LIMIT},
    AppState,
};

const LATEST_DATA_COUNT: usize = 5;
const LATEST_DATA_SCAN_PAGES: usize = 10;

pub async fn recent_logs(
    State(state): State<AppState>,
    Query(query): Query<RecentLogsQuery>,
) -> Result<Json<RecentLogsResponse>> {
    let limit = clamp_limit(query.limit);
    let logs = state.store.recent(limit, query.before).await?;
    Ok(Json(RecentLogsResponse::new(logs, limit)))
}

pub async fn stats(State(state): State<AppState>) -> Result<Json<StatsResponse>> {
    let now = Utc::now();
    Ok(Json(StatsResponse {
        snapshot: state.store.stats(now).await?,
        eventstream_metrics: state.pipeline.transmission_summary(now),
    }))
}

/// Most recent successful deliveries, newest first.
pub async fn latest_data(State(state): State<AppState>) -> Result<Json<Vec<DeliveryRecord>>> {
    let mut found = Vec::with_capacity(LATEST_DATA_COUNT);
    let mut before = None;
    for _ in 0..LATEST_DATA_SCAN_PAGES {
        let page = state.store.recent(MAX_RECENT_LIMIT, before).await?;
        let exhausted = page.len() < MAX_RECENT_LIMIT;
        before = page.last().map(|r| r.id);
        found.extend(
            page.into_iter()
                .filter(|r| r.status == DeliveryStatus::Success)
                .take(LATEST_DATA_COUNT - found.len()),
        );
        if found.len() >= LATEST_DATA_COUNT || exhausted {
            break;
        }
    }
    Ok(Json(found))
}
