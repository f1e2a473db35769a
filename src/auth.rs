// 鉴权辅助：解析请求头令牌并换取当前会话用户。
use crate::schemas::now_ts;
use crate::storage::StorageBackend;
use axum::http::{header, HeaderMap};
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct SessionUser {
    pub user_id: String,
}

// 兼容 X-API-Key 与 Authorization: Bearer 两种格式。
pub fn extract_token(headers: &HeaderMap) -> Option<String> {
    if let Some(value) = headers.get("x-api-key").and_then(|value| value.to_str().ok()) {
        let trimmed = value.trim();
        if !trimmed.is_empty() {
            return Some(trimmed.to_string());
        }
    }
    let value = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())?;
    let trimmed = value.trim();
    let token = trimmed
        .strip_prefix("Bearer ")
        .or_else(|| trimmed.strip_prefix("bearer "))?
        .trim();
    if token.is_empty() {
        None
    } else {
        Some(token.to_string())
    }
}

/// 当前会话访问器：令牌有效则返回用户，否则 None 交由接口层拒绝。
pub fn resolve_session(
    storage: &Arc<dyn StorageBackend>,
    headers: &HeaderMap,
) -> Option<SessionUser> {
    let token = extract_token(headers)?;
    let record = storage.get_user_token(&token).ok().flatten()?;
    // expires_at 为 0 表示长期令牌。
    if record.expires_at > 0.0 && record.expires_at < now_ts() {
        return None;
    }
    Some(SessionUser {
        user_id: record.user_id,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn bearer_token_is_extracted() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::AUTHORIZATION,
            HeaderValue::from_static("Bearer tok_123"),
        );
        assert_eq!(extract_token(&headers).as_deref(), Some("tok_123"));
    }

    #[test]
    fn api_key_header_wins() {
        let mut headers = HeaderMap::new();
        headers.insert("x-api-key", HeaderValue::from_static("key_1"));
        headers.insert(
            header::AUTHORIZATION,
            HeaderValue::from_static("Bearer tok_123"),
        );
        assert_eq!(extract_token(&headers).as_deref(), Some("key_1"));
    }

    #[test]
    fn missing_headers_yield_none() {
        assert_eq!(extract_token(&HeaderMap::new()), None);
    }
}
