// 会话接口：会话 CRUD、消息轮次 SSE、取消、重新生成与可见性管理。
use crate::api::errors::{error_response, turn_error_response};
use crate::auth::resolve_session;
use crate::schemas::{now_ts, StreamEvent, TurnRequest};
use crate::state::AppState;
use crate::storage::ChatRecord;
use crate::title::DEFAULT_CHAT_TITLE;
use axum::extract::{Path as AxumPath, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::{routing::get, routing::post, Json, Router};
use chrono::{DateTime, Local, TimeZone, Utc};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio_stream::StreamExt;
use uuid::Uuid;

const SSE_KEEPALIVE_S: u64 = 15;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/atelier/chats", post(create_chat).get(list_chats))
        .route(
            "/atelier/chats/{chat_id}",
            get(get_chat).delete(delete_chat),
        )
        .route("/atelier/chats/{chat_id}/messages", post(send_message))
        .route(
            "/atelier/chats/{chat_id}/messages/{message_id}",
            axum::routing::delete(delete_message),
        )
        .route("/atelier/chats/{chat_id}/cancel", post(cancel_turn))
        .route("/atelier/chats/{chat_id}/regenerate", post(regenerate))
        .route("/atelier/chats/{chat_id}/rename", post(rename_chat))
        .route("/atelier/chats/{chat_id}/visibility", post(set_visibility))
        .route("/atelier/chats/{chat_id}/documents", get(list_documents))
}

#[derive(Debug, Deserialize)]
struct CreateChatRequest {
    #[serde(default)]
    title: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SendMessageRequest {
    content: String,
}

#[derive(Debug, Deserialize)]
struct RegenerateRequest {
    message_id: String,
}

#[derive(Debug, Deserialize)]
struct VisibilityRequest {
    visibility: String,
}

#[derive(Debug, Deserialize)]
struct RenameRequest {
    title: String,
}

fn format_ts(ts: f64) -> String {
    let millis = (ts * 1000.0) as i64;
    Utc.timestamp_millis_opt(millis)
        .single()
        .map(|value: DateTime<Utc>| value.with_timezone(&Local).to_rfc3339())
        .unwrap_or_default()
}

fn chat_payload(record: &ChatRecord) -> Value {
    json!({
        "id": record.chat_id,
        "title": record.title,
        "visibility": record.visibility,
        "created_at": format_ts(record.created_at),
        "updated_at": format_ts(record.updated_at),
    })
}

fn require_session(
    state: &Arc<AppState>,
    headers: &HeaderMap,
) -> Result<crate::auth::SessionUser, Response> {
    resolve_session(&state.storage, headers)
        .ok_or_else(|| error_response(StatusCode::UNAUTHORIZED, "未认证的请求"))
}

/// 读取会话并校验读权限：属主或公开会话可读。
fn load_readable_chat(
    state: &Arc<AppState>,
    user_id: &str,
    chat_id: &str,
) -> Result<ChatRecord, Response> {
    let record = state
        .storage
        .get_chat(chat_id)
        .map_err(|err| error_response(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()))?
        .ok_or_else(|| error_response(StatusCode::NOT_FOUND, "会话不存在"))?;
    if record.user_id != user_id && record.visibility != "public" {
        return Err(error_response(StatusCode::FORBIDDEN, "无权访问该会话"));
    }
    Ok(record)
}

fn load_owned_chat(
    state: &Arc<AppState>,
    user_id: &str,
    chat_id: &str,
) -> Result<ChatRecord, Response> {
    let record = state
        .storage
        .get_chat(chat_id)
        .map_err(|err| error_response(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()))?
        .ok_or_else(|| error_response(StatusCode::NOT_FOUND, "会话不存在"))?;
    if record.user_id != user_id {
        return Err(error_response(StatusCode::FORBIDDEN, "无权操作该会话"));
    }
    Ok(record)
}

async fn create_chat(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(payload): Json<CreateChatRequest>,
) -> Result<Json<Value>, Response> {
    let session = require_session(&state, &headers)?;
    let now = now_ts();
    let title = payload
        .title
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| DEFAULT_CHAT_TITLE.to_string());
    let record = ChatRecord {
        chat_id: format!("chat_{}", Uuid::new_v4().simple()),
        user_id: session.user_id,
        title,
        visibility: "private".to_string(),
        created_at: now,
        updated_at: now,
    };
    state
        .storage
        .save_chat(&record)
        .map_err(|err| error_response(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()))?;
    Ok(Json(json!({ "data": chat_payload(&record) })))
}

async fn list_chats(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<Value>, Response> {
    let session = require_session(&state, &headers)?;
    let chats = state
        .storage
        .list_chats(&session.user_id, 0)
        .map_err(|err| error_response(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()))?;
    let items = chats.iter().map(chat_payload).collect::<Vec<_>>();
    Ok(Json(json!({ "data": { "items": items } })))
}

async fn get_chat(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    AxumPath(chat_id): AxumPath<String>,
) -> Result<Json<Value>, Response> {
    let session = require_session(&state, &headers)?;
    let record = load_readable_chat(&state, &session.user_id, &chat_id)?;
    let messages = state
        .storage
        .load_chat_messages(&chat_id, state.config.server.max_history_messages)
        .map_err(|err| error_response(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()))?;
    let messages = messages
        .iter()
        .map(|message| {
            json!({
                "id": message.message_id,
                "role": message.role,
                "parts": message.parts,
                "created_at": format_ts(message.created_at),
            })
        })
        .collect::<Vec<_>>();
    let mut payload = chat_payload(&record);
    if let Value::Object(ref mut map) = payload {
        map.insert("messages".to_string(), json!(messages));
        map.insert(
            "running".to_string(),
            json!(state.orchestrator.is_running(&chat_id)),
        );
    }
    Ok(Json(json!({ "data": payload })))
}

async fn delete_chat(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    AxumPath(chat_id): AxumPath<String>,
) -> Result<Json<Value>, Response> {
    let session = require_session(&state, &headers)?;
    let _record = load_owned_chat(&state, &session.user_id, &chat_id)?;
    state
        .storage
        .delete_chat(&chat_id)
        .map_err(|err| error_response(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()))?;
    Ok(Json(json!({ "data": { "id": chat_id } })))
}

fn sse_response(
    stream: tokio_stream::wrappers::ReceiverStream<StreamEvent>,
) -> Response {
    let mapped = stream.map(|event| {
        let data = serde_json::to_string(&event).unwrap_or_else(|_| "{}".to_string());
        Ok::<Event, std::convert::Infallible>(
            Event::default().event(event.event_name()).data(data),
        )
    });
    Sse::new(mapped)
        .keep_alive(KeepAlive::new().interval(std::time::Duration::from_secs(SSE_KEEPALIVE_S)))
        .into_response()
}

async fn send_message(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    AxumPath(chat_id): AxumPath<String>,
    Json(payload): Json<SendMessageRequest>,
) -> Result<Response, Response> {
    let session = require_session(&state, &headers)?;
    if payload.content.trim().is_empty() {
        return Err(error_response(StatusCode::BAD_REQUEST, "消息内容不能为空"));
    }
    let request = TurnRequest {
        chat_id,
        user_id: session.user_id,
        content: payload.content,
        source_message_id: None,
    };
    let stream = state
        .orchestrator
        .stream(request)
        .await
        .map_err(turn_error_response)?;
    Ok(sse_response(stream))
}

async fn regenerate(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    AxumPath(chat_id): AxumPath<String>,
    Json(payload): Json<RegenerateRequest>,
) -> Result<Response, Response> {
    let session = require_session(&state, &headers)?;
    let request = TurnRequest {
        chat_id,
        user_id: session.user_id,
        content: String::new(),
        source_message_id: Some(payload.message_id),
    };
    let stream = state
        .orchestrator
        .stream(request)
        .await
        .map_err(turn_error_response)?;
    Ok(sse_response(stream))
}

async fn cancel_turn(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    AxumPath(chat_id): AxumPath<String>,
) -> Result<Json<Value>, Response> {
    let session = require_session(&state, &headers)?;
    let _record = load_owned_chat(&state, &session.user_id, &chat_id)?;
    let cancelled = state.orchestrator.cancel(&chat_id);
    if !cancelled {
        return Err(error_response(StatusCode::NOT_FOUND, "没有在途轮次"));
    }
    Ok(Json(json!({ "data": { "id": chat_id, "cancelled": true } })))
}

async fn delete_message(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    AxumPath((chat_id, message_id)): AxumPath<(String, String)>,
) -> Result<Json<Value>, Response> {
    let session = require_session(&state, &headers)?;
    let _record = load_owned_chat(&state, &session.user_id, &chat_id)?;
    let deleted = state
        .storage
        .delete_message(&chat_id, &message_id)
        .map_err(|err| error_response(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()))?;
    if deleted == 0 {
        return Err(error_response(StatusCode::NOT_FOUND, "消息不存在"));
    }
    Ok(Json(json!({ "data": { "id": message_id } })))
}

async fn rename_chat(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    AxumPath(chat_id): AxumPath<String>,
    Json(payload): Json<RenameRequest>,
) -> Result<Json<Value>, Response> {
    let session = require_session(&state, &headers)?;
    let _record = load_owned_chat(&state, &session.user_id, &chat_id)?;
    let title = payload.title.trim().to_string();
    if title.is_empty() {
        return Err(error_response(StatusCode::BAD_REQUEST, "标题不能为空"));
    }
    state
        .storage
        .update_chat_title(&chat_id, &title, now_ts())
        .map_err(|err| error_response(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()))?;
    Ok(Json(json!({ "data": { "id": chat_id, "title": title } })))
}

async fn set_visibility(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    AxumPath(chat_id): AxumPath<String>,
    Json(payload): Json<VisibilityRequest>,
) -> Result<Json<Value>, Response> {
    let session = require_session(&state, &headers)?;
    let _record = load_owned_chat(&state, &session.user_id, &chat_id)?;
    let visibility = payload.visibility.trim().to_string();
    if visibility != "private" && visibility != "public" {
        return Err(error_response(
            StatusCode::BAD_REQUEST,
            "visibility 仅支持 private/public",
        ));
    }
    state
        .storage
        .update_chat_visibility(&chat_id, &visibility, now_ts())
        .map_err(|err| error_response(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()))?;
    Ok(Json(json!({ "data": { "id": chat_id, "visibility": visibility } })))
}

async fn list_documents(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    AxumPath(chat_id): AxumPath<String>,
) -> Result<Json<Value>, Response> {
    let session = require_session(&state, &headers)?;
    let _record = load_readable_chat(&state, &session.user_id, &chat_id)?;
    let versions = state
        .storage
        .load_document_versions(&chat_id, 0)
        .map_err(|err| error_response(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()))?;
    let items = versions
        .iter()
        .map(|version| {
            json!({
                "id": version.doc_id,
                "kind": version.kind,
                "title": version.title,
                "content": version.content,
                "created_at": format_ts(version.created_at),
            })
        })
        .collect::<Vec<_>>();
    Ok(Json(json!({ "data": { "items": items } })))
}
