use crate::error::AppError;
use crate::models::participant::Participant;
use crate::models::settings::{PolicyUpdate, Settings};
use crate::services::backup::{render_export, SnapshotReport};
use crate::services::backup_scheduler::SchedulerStatus;
use crate::state::AppState;
use axum::extract::{Path, Query, Request, State};
use axum::http::header::{AUTHORIZATION, CONTENT_DISPOSITION, CONTENT_TYPE};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post, put};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub const PAGE_SIZE: usize = 50;

pub fn router(state: Arc<AppState>) -> Router<Arc<AppState>> {
    Router::new()
        .route("/participants", get(list_participants).delete(clear_participants))
        .route("/participants/export", get(export_participants))
        .route("/participants/{index}", delete(remove_participant))
        .route("/backup/status", get(backup_status))
        .route("/backup/policy", put(update_policy))
        .route("/backup/run", post(run_backup))
        .route("/settings/whatsapp", put(update_whatsapp_link))
        .route_layer(middleware::from_fn_with_state(state, require_admin))
}

// ── Auth ──

async fn require_admin(
    State(state): State<Arc<AppState>>,
    req: Request,
    next: Next,
) -> Result<Response, AppError> {
    let Some(expected) = state.config.admin_token.as_deref() else {
        return Err(AppError::Unauthorized("Admin access is not configured".into()));
    };
    let provided = req
        .headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));
    if provided != Some(expected) {
        tracing::warn!(path = %req.uri().path(), "Rejected admin request");
        return Err(AppError::Unauthorized("Invalid admin token".into()));
    }
    Ok(next.run(req).await)
}

// ── Participants ──

#[derive(Deserialize)]
struct ListQuery {
    #[serde(default)]
    reload: bool,
    #[serde(default = "first_page")]
    page: usize,
}

fn first_page() -> usize {
    1
}

#[derive(Serialize)]
struct IndexedParticipant {
    index: usize,
    #[serde(flatten)]
    participant: Participant,
}

#[derive(Serialize, Debug, PartialEq)]
struct Pagination {
    page: usize,
    per_page: usize,
    total_pages: usize,
    total_participants: usize,
}

#[derive(Serialize)]
struct Statistics {
    total: usize,
    male: usize,
    female: usize,
}

#[derive(Serialize)]
struct ParticipantPage {
    participants: Vec<IndexedParticipant>,
    pagination: Pagination,
    statistics: Statistics,
}

/// Clamps `page` into range; an empty list still has one page.
fn paginate(total: usize, page: usize) -> Pagination {
    let total_pages = total.div_ceil(PAGE_SIZE).max(1);
    Pagination {
        page: page.clamp(1, total_pages),
        per_page: PAGE_SIZE,
        total_pages,
        total_participants: total,
    }
}

async fn list_participants(
    State(state): State<Arc<AppState>>,
    Query(q): Query<ListQuery>,
) -> Json<ParticipantPage> {
    let all = state.participants.list(q.reload).await;
    let pagination = paginate(all.len(), q.page);
    let count_gender = |g: &str| all.iter().filter(|p| p.gender == g).count();
    let statistics = Statistics {
        total: all.len(),
        male: count_gender("male"),
        female: count_gender("female"),
    };

    let start = (pagination.page - 1) * PAGE_SIZE;
    let participants = all
        .iter()
        .enumerate()
        .skip(start)
        .take(PAGE_SIZE)
        .map(|(index, p)| IndexedParticipant {
            index,
            participant: p.clone(),
        })
        .collect();

    Json(ParticipantPage {
        participants,
        pagination,
        statistics,
    })
}

async fn remove_participant(
    State(state): State<Arc<AppState>>,
    Path(index): Path<usize>,
) -> Result<Json<Participant>, AppError> {
    let removed = state.participants.remove(index).await?;
    Ok(Json(removed))
}

async fn clear_participants(
    State(state): State<Arc<AppState>>,
) -> Result<Json<serde_json::Value>, AppError> {
    let removed = state.participants.clear().await?;
    Ok(Json(serde_json::json!({ "removed": removed })))
}

async fn export_participants(State(state): State<Arc<AppState>>) -> Result<Response, AppError> {
    let participants = state.participants.list(false).await;
    let body = render_export(&participants).map_err(|e| anyhow::anyhow!(e))?;
    let filename = format!(
        "participants_{}.csv",
        state.clock.now().format("%Y%m%d_%H%M%S")
    );
    Ok((
        [
            (CONTENT_TYPE, "text/csv; charset=utf-8".to_string()),
            (CONTENT_DISPOSITION, format!("attachment; filename=\"{filename}\"")),
        ],
        body,
    )
        .into_response())
}

// ── Backups ──

async fn backup_status(State(state): State<Arc<AppState>>) -> Json<SchedulerStatus> {
    Json(state.scheduler.status().await)
}

async fn update_policy(
    State(state): State<Arc<AppState>>,
    Json(body): Json<PolicyUpdate>,
) -> Result<Json<SchedulerStatus>, AppError> {
    state.settings.update_policy(body).await?;
    Ok(Json(state.scheduler.status().await))
}

async fn run_backup(State(state): State<Arc<AppState>>) -> Result<Json<SnapshotReport>, AppError> {
    let report = state.backup.trigger_manual().await?;
    Ok(Json(report))
}

// ── Settings ──

#[derive(Deserialize)]
struct WhatsappLinkRequest {
    whatsapp_link: String,
}

async fn update_whatsapp_link(
    State(state): State<Arc<AppState>>,
    Json(body): Json<WhatsappLinkRequest>,
) -> Result<Json<serde_json::Value>, AppError> {
    let Settings { whatsapp_link, .. } =
        state.settings.update_whatsapp_link(&body.whatsapp_link).await?;
    Ok(Json(serde_json::json!({ "whatsapp_link": whatsapp_link })))
}
