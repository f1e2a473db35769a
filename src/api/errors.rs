// 接口错误辅助：统一错误响应结构，映射编排错误码到 HTTP 状态。
use crate::orchestrator::TurnError;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

pub(crate) fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    let message = message.into();
    (
        status,
        Json(json!({ "error": { "message": message } })),
    )
        .into_response()
}

pub(crate) fn status_for_error_code(code: &str) -> StatusCode {
    match code {
        "FORBIDDEN" => StatusCode::FORBIDDEN,
        "NOT_FOUND" => StatusCode::NOT_FOUND,
        "USER_BUSY" => StatusCode::TOO_MANY_REQUESTS,
        "CANCELLED" => StatusCode::CONFLICT,
        "LLM_UNAVAILABLE" => StatusCode::SERVICE_UNAVAILABLE,
        "INTERNAL_ERROR" => StatusCode::INTERNAL_SERVER_ERROR,
        _ => StatusCode::BAD_REQUEST,
    }
}

pub(crate) fn turn_error_response(err: TurnError) -> Response {
    let status = status_for_error_code(err.code());
    (status, Json(json!({ "error": err.to_payload() }))).into_response()
}
