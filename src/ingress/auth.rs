use axum::http::HeaderMap;

/// A plain equality check is enough here -- the token is a shared operational
/// secret, not a per-user credential.
pub fn bearer_matches(headers: &HeaderMap, expected_token: &str) -> bool {
    let Some(value) = headers.get(axum::http::header::AUTHORIZATION) else {
        return false;
    };
    let Ok(value) = value.to_str() else {
        return false;
    };
    match value.strip_prefix("Bearer ") {
        Some(token) => token == expected_token,
        None => false,
    }
}
