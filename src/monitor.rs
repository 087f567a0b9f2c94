use crate::app::AppState;
use crate::error::{AppError, AppResult};
use crate::store::{QueryFilters, QueryPage, RecordStatus, RequestRecord, StatsView, TimeRange};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::Json;
use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::{json, Value};
use std::convert::Infallible;
use tokio_stream::wrappers::ReceiverStream;

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MonitorQuery {
    pub status: Option<String>,
    pub model: Option<String>,
    pub time_range: Option<String>,
    pub page: Option<usize>,
    pub limit: Option<usize>,
}

impl MonitorQuery {
    fn has_filters(&self) -> bool {
        self.status.is_some() || self.model.is_some() || self.time_range.is_some()
    }

    fn into_filters(self) -> QueryFilters {
        QueryFilters {
            status: self.status.as_deref().and_then(parse_status),
            model: self.model,
            time_range: self.time_range.as_deref().map(TimeRange::parse),
            page: self.page,
            limit: self.limit,
        }
    }
}

fn parse_status(raw: &str) -> Option<RecordStatus> {
    match raw {
        "pending" => Some(RecordStatus::Pending),
        "success" => Some(RecordStatus::Success),
        "error" => Some(RecordStatus::Error),
        other => {
            tracing::debug!("ignoring unknown status filter {other:?}");
            None
        }
    }
}

pub async fn list_requests(
    State(state): State<AppState>,
    Query(query): Query<MonitorQuery>,
) -> Json<QueryPage> {
    Json(state.store.query(&query.into_filters()))
}

pub async fn get_request(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> AppResult<Json<RequestRecord>> {
    state.store.get(&id).map(Json).ok_or_else(|| {
        AppError::new(
            StatusCode::NOT_FOUND,
            "request_not_found",
            format!("no record with id {id}"),
        )
    })
}

pub async fn get_stats(
    State(state): State<AppState>,
    Query(query): Query<MonitorQuery>,
) -> Json<StatsView> {
    let stats = if query.has_filters() {
        state.store.stats(Some(&query.into_filters()))
    } else {
        state.store.stats(None)
    };
    Json(stats)
}

/// Live feed of store events as SSE. A subscriber that stops reading loses
/// events rather than slowing the proxy; the channel is reaped once the
/// connection drops.
pub async fn stream_events(State(state): State<AppState>) -> impl IntoResponse {
    let rx = state.store.subscribe();
    let connected = futures_util::stream::once(async {
        Ok::<_, Infallible>(
            Event::default()
                .event("connected")
                .data(json!({ "type": "connected" }).to_string()),
        )
    });
    let events = ReceiverStream::new(rx).map(|event| {
        let data = serde_json::to_string(&event).unwrap_or_else(|_| "{}".to_string());
        Ok(Event::default().event(event.kind()).data(data))
    });
    Sse::new(connected.chain(events)).keep_alive(KeepAlive::default())
}

pub async fn clear(State(state): State<AppState>) -> Json<Value> {
    state.store.clear();
    Json(json!({ "success": true }))
}

pub async fn export(State(state): State<AppState>) -> Json<Value> {
    Json(state.store.export())
}
