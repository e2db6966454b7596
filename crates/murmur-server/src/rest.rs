//! HTTP resource routes: history paging, message posting, and CRUD over
//! users, devices, conversations and blobs.

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use murmur_core::protocol::{Event, MESSAGE_ADDED};
use murmur_core::{MessageDraft, Record};

use crate::error::{ApiError, ApiResult};
use crate::identity::{device_id_from_authorization, owner_of_device, AuthError, USER_ID_PARAM};
use crate::pager::HistoryPager;
use crate::server::AppState;

/// Fixed code handed back on sign-up; there is no verification flow.
pub const VERIFICATION_CODE: &str = "music pear battery t-shirt";

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/conversations", get(list_conversations).post(create_conversation))
        .route("/conversations/{id}/messages", get(conversation_messages))
        .route("/messages", post(post_message))
        .route("/conversation_permissions", get(list_permissions))
        .route("/users", get(list_users).post(create_user))
        .route("/users/get_me", post(get_me))
        .route("/devices", get(list_devices).post(register_device))
        .route("/devices/{id}", get(get_device))
        .route("/ws_urls", post(ws_url))
        .route("/blob/{id}", get(get_blob).put(put_blob))
}

pub fn cors() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION])
}

/// Bodies are parsed leniently: clients do not always send a content type.
fn parse_body<T: DeserializeOwned>(body: &Bytes) -> ApiResult<T> {
    serde_json::from_slice(body).map_err(|e| ApiError::BadRequest(format!("invalid body: {e}")))
}

fn into_record(value: Value, what: &str) -> ApiResult<Record> {
    match value {
        Value::Object(map) => Ok(map),
        _ => Err(ApiError::BadRequest(format!("{what} must be an object"))),
    }
}

fn pick(record: &Record, fields: &[&str]) -> Value {
    let picked: Map<String, Value> = fields
        .iter()
        .map(|f| (f.to_string(), record.get(*f).cloned().unwrap_or(Value::Null)))
        .collect();
    Value::Object(picked)
}

fn listing(objects: Vec<Record>) -> Value {
    json!({"objects": objects, "meta": {"nextCursor": null}})
}

#[derive(Debug, Deserialize)]
struct HistoryQuery {
    cursor: Option<String>,
}

async fn conversation_messages(
    State(state): State<AppState>,
    Path(conversation_id): Path<String>,
    Query(query): Query<HistoryQuery>,
) -> ApiResult<Response> {
    let cursor = match query.cursor.as_deref().map(str::trim) {
        None | Some("") => None,
        Some(raw) => Some(
            raw.parse::<i64>()
                .map_err(|_| ApiError::BadRequest(format!("invalid cursor: {raw}")))?,
        ),
    };
    let page = HistoryPager::new(state.db.messages()).page(&conversation_id, cursor)?;
    Ok(Json(page).into_response())
}

async fn post_message(State(state): State<AppState>, body: Bytes) -> ApiResult<Response> {
    let draft: MessageDraft = parse_body(&body)?;
    let key_id = draft
        .conversation_key_id()
        .ok_or_else(|| ApiError::BadRequest("missing context.conversationKeyId".into()))?
        .to_string();

    let conversation_id = state.db.conversation_for_key(&key_id)?;
    let message = state.db.messages().append(&conversation_id, draft)?;
    info!(conversation_id = %conversation_id, message_id = message.id, "message posted");

    let event = Event::new(MESSAGE_ADDED, json!(message));
    if let Ok(text) = serde_json::to_string(&event) {
        state.registry.broadcast_all(&text);
    }
    Ok((StatusCode::CREATED, Json(message)).into_response())
}

async fn list_conversations(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let conversations = state.db.conversations().list_all()?;
    let permissions = state.db.permissions().list_all()?;
    Ok(Json(json!({
        "objects": conversations,
        "related": {"permissions": permissions},
        "meta": {"nextCursor": null},
    })))
}

#[derive(Debug, Deserialize)]
struct NewConversation {
    conversation: Value,
    #[serde(default)]
    permissions: Vec<Value>,
}

async fn create_conversation(State(state): State<AppState>, body: Bytes) -> ApiResult<StatusCode> {
    let request: NewConversation = parse_body(&body)?;
    let conversation = into_record(request.conversation, "conversation")?;
    let permissions = request
        .permissions
        .into_iter()
        .map(|p| into_record(p, "permission"))
        .collect::<ApiResult<Vec<_>>>()?;

    let stored = state.db.create_conversation(conversation, permissions)?;
    info!(conversation = ?stored.get("id"), "conversation created");
    Ok(StatusCode::NO_CONTENT)
}

async fn list_permissions(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    Ok(Json(listing(state.db.permissions().list_all()?)))
}

async fn list_users(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    Ok(Json(listing(state.db.users().list_all()?)))
}

async fn create_user(State(state): State<AppState>, body: Bytes) -> ApiResult<Json<Value>> {
    let user = into_record(parse_body(&body)?, "user")?;
    let stored = state.db.users().append(user)?;
    Ok(Json(json!({
        "verificationCode": VERIFICATION_CODE,
        "user": pick(&stored, &["id", "name", "email", "picture", "encryptionPubkey"]),
    })))
}

#[derive(Debug, Deserialize)]
struct GetMe {
    email: String,
}

async fn get_me(State(state): State<AppState>, body: Bytes) -> ApiResult<Json<Value>> {
    let request: GetMe = parse_body(&body)?;
    let user = state
        .db
        .users()
        .find_by("email", &Value::from(request.email.as_str()))?
        .ok_or_else(|| ApiError::Forbidden(format!("no user with email {}", request.email)))?;
    Ok(Json(json!({
        "user": pick(&user, &["id", "name", "picture", "encryptionPubkey"]),
        "encryptionPrivkey": user.get("encryptionPrivkey").cloned().unwrap_or(Value::Null),
    })))
}

async fn list_devices(State(state): State<AppState>) -> ApiResult<Json<Vec<Record>>> {
    Ok(Json(state.db.devices().list_all()?))
}

async fn get_device(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Record>> {
    Ok(Json(state.db.devices().get(&Value::from(id))?))
}

#[derive(Debug, Deserialize)]
struct NewDevice {
    device: Value,
}

async fn register_device(State(state): State<AppState>, body: Bytes) -> ApiResult<Json<Record>> {
    let request: NewDevice = parse_body(&body)?;
    let device = into_record(request.device, "device")?;
    Ok(Json(state.db.devices().append(device)?))
}

async fn ws_url(State(state): State<AppState>, headers: HeaderMap) -> ApiResult<Response> {
    let header = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| AuthError::Missing("Authorization header".into()))?;
    let device_id = device_id_from_authorization(header)?;
    let user = owner_of_device(&state.db, &device_id)?;

    let url = format!("{}?{USER_ID_PARAM}={user}", state.config.socket_base_url);
    Ok((StatusCode::CREATED, Json(json!({"socketUrl": url}))).into_response())
}

async fn get_blob(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<Response> {
    let bytes = state.db.blobs().get(&id)?;
    Ok(([(header::CONTENT_TYPE, "application/octet-stream")], bytes).into_response())
}

async fn put_blob(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Bytes,
) -> ApiResult<StatusCode> {
    state.db.blobs().put(&id, &body)?;
    Ok(StatusCode::NO_CONTENT)
}
