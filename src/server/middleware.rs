use axum::{
    body::Body,
    extract::State,
    http::{HeaderMap, Request, StatusCode},
    middleware::Next,
    response::Response,
};

use super::AppState;

pub const API_KEY_HEADER: &str = "X-API-Key";

/// Guards the collaborator endpoints (`/api/v1/*`) with the `api.key`
/// setting. With no key configured every request passes.
pub async fn api_key_auth(
    State(state): State<AppState>,
    req: Request<Body>,
    next: Next,
) -> Result<Response, StatusCode> {
    let Some(expected) = state.settings.api.key.as_deref() else {
        return Ok(next.run(req).await);
    };

    match check_api_key(req.headers(), expected) {
        Ok(()) => Ok(next.run(req).await),
        Err(problem) => {
            tracing::warn!(path = %req.uri().path(), problem, "Rejected API request");
            Err(StatusCode::UNAUTHORIZED)
        }
    }
}

fn check_api_key(headers: &HeaderMap, expected: &str) -> Result<(), &'static str> {
    match headers.get(API_KEY_HEADER).map(|v| v.to_str()) {
        None => Err("missing api key"),
        Some(Ok(key)) if key == expected => Ok(()),
        Some(_) => Err("invalid api key"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_check_api_key() {
        let mut headers = HeaderMap::new();
        assert_eq!(check_api_key(&headers, "k"), Err("missing api key"));

        headers.insert(API_KEY_HEADER, HeaderValue::from_static("wrong"));
        assert_eq!(check_api_key(&headers, "k"), Err("invalid api key"));

        headers.insert(API_KEY_HEADER, HeaderValue::from_static("k"));
        assert_eq!(check_api_key(&headers, "k"), Ok(()));
    }
}
