use crate::error::AppError;
use crate::geo::LocationCheck;
use crate::models::participant::{normalize_phone, NewParticipant, TicketLookup};
use crate::services::registration;
use crate::state::AppState;
use axum::extract::{ConnectInfo, Query, State};
use axum::http::{Extensions, HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/register", post(register))
        .route("/phones/check", get(check_phone))
        .route("/location/check", get(check_location))
        .route("/coordinates/check", get(check_coordinates))
        .route("/tickets/lookup", post(lookup_ticket))
        .route("/settings/whatsapp", get(whatsapp_link))
}

#[derive(Serialize)]
struct RegisterResponse {
    ticket_number: u64,
    whatsapp_link: String,
}

/// First address of `X-Forwarded-For`, else the peer address.
fn client_ip(headers: &HeaderMap, peer: Option<SocketAddr>) -> Option<String> {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .or_else(|| peer.map(|a| a.ip().to_string()))
}

async fn register(
    State(state): State<Arc<AppState>>,
    extensions: Extensions,
    headers: HeaderMap,
    Json(mut body): Json<NewParticipant>,
) -> Result<(StatusCode, Json<RegisterResponse>), AppError> {
    let peer = extensions.get::<ConnectInfo<SocketAddr>>().map(|ConnectInfo(a)| *a);
    body.ip_address = client_ip(&headers, peer);

    let reg = registration::register(
        &state.participants,
        &state.settings,
        &state.backup,
        &state.geo,
        body,
    )
    .await?;
    let whatsapp_link = state.settings.load().await.whatsapp_link;

    Ok((
        StatusCode::CREATED,
        Json(RegisterResponse {
            ticket_number: reg.participant.ticket_number,
            whatsapp_link,
        }),
    ))
}

#[derive(Deserialize)]
struct PhoneQuery {
    #[serde(default)]
    phone: String,
}

async fn check_phone(
    State(state): State<Arc<AppState>>,
    Query(q): Query<PhoneQuery>,
) -> Json<serde_json::Value> {
    let Some(phone) = normalize_phone(&q.phone) else {
        return Json(serde_json::json!({ "exists": false }));
    };
    let exists = state
        .participants
        .list(false)
        .await
        .iter()
        .any(|p| p.canonical_phone() == phone);
    Json(serde_json::json!({ "exists": exists }))
}

// ── Location ──

async fn check_location(
    State(state): State<Arc<AppState>>,
    extensions: Extensions,
    headers: HeaderMap,
) -> Result<Json<LocationCheck>, AppError> {
    let peer = extensions.get::<ConnectInfo<SocketAddr>>().map(|ConnectInfo(a)| *a);
    let ip = client_ip(&headers, peer)
        .ok_or_else(|| AppError::BadRequest("Client address is unknown".into()))?;
    state
        .geo
        .check_ip(&ip)
        .await
        .map(Json)
        .ok_or_else(|| AppError::BadGateway("Could not determine your location".into()))
}

#[derive(Deserialize)]
struct CoordinatesQuery {
    lat: Option<f64>,
    lng: Option<f64>,
}

async fn check_coordinates(
    State(state): State<Arc<AppState>>,
    Query(q): Query<CoordinatesQuery>,
) -> Result<Json<LocationCheck>, AppError> {
    let (Some(lat), Some(lng)) = (q.lat, q.lng) else {
        return Err(AppError::BadRequest("Coordinates are required".into()));
    };
    state
        .geo
        .check_coordinates(lat, lng)
        .await
        .map(Json)
        .ok_or_else(|| {
            AppError::BadGateway("Could not determine your location from coordinates".into())
        })
}

// ── Tickets ──

#[derive(Deserialize)]
struct LookupRequest {
    phone: String,
}

async fn lookup_ticket(
    State(state): State<Arc<AppState>>,
    Json(body): Json<LookupRequest>,
) -> Result<Json<TicketLookup>, AppError> {
    if body.phone.trim().is_empty() {
        return Err(AppError::BadRequest("Phone number is required".into()));
    }
    state
        .participants
        .find_by_phone(&body.phone)
        .await
        .map(Json)
        .ok_or_else(|| AppError::NotFound("No registration found for this phone number".into()))
}

async fn whatsapp_link(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let link = state.settings.load().await.whatsapp_link;
    Json(serde_json::json!({ "whatsapp_link": link }))
}
