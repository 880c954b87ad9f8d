use axum::{
    async_trait,
    extract::FromRequestParts,
    http::{request::Parts, HeaderMap, StatusCode},
};
use crate::model::UserContext;

/// Axum extractor for UserContext from request headers
///
/// - X-User-Id: user identifier
/// - X-User-Email: optional email
/// - X-User-Name: optional display name, recorded as revision author
///
/// Requests without an X-User-Id act as the anonymous user, which only
/// passes authorization while security is disabled.
#[async_trait]
impl<S> FromRequestParts<S> for UserContext
where
    S: Send + Sync,
{
    type Rejection = StatusCode;

    async fn from_request_parts(
        parts: &mut Parts,
        _state: &S,
    ) -> Result<Self, Self::Rejection> {
        let headers = &parts.headers;

        match extract_header_value(headers, "x-user-id") {
            Some(user_id) => Ok(UserContext::with_details(
                user_id,
                extract_header_value(headers, "x-user-email"),
                extract_header_value(headers, "x-user-name"),
            )),
            None => Ok(UserContext::anonymous()),
        }
    }
}

/// Extract a non-empty header value as string
fn extract_header_value(headers: &HeaderMap, header_name: &str) -> Option<String> {
    headers
        .get(header_name)
        .and_then(|value| value.to_str().ok())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}
