use http::HeaderMap;
use shardq_core::ORG_ID_HEADER;

use crate::ApiError;

const MAX_TENANT_ID_LENGTH: usize = 150;

/// Resolve the single tenant a request acts for from `X-Scope-OrgID`.
pub fn tenant_id(headers: &HeaderMap) -> Result<String, ApiError> {
    let raw = headers
        .get(ORG_ID_HEADER)
        .ok_or_else(|| ApiError::bad_data("no org id"))?
        .to_str()
        .map_err(|_| ApiError::bad_data("org id is not valid ascii"))?;
    if raw.contains('|') {
        return Err(ApiError::bad_data("multiple org IDs present"));
    }
    validate(raw)?;
    Ok(raw.to_string())
}

fn validate(id: &str) -> Result<(), ApiError> {
    if id.is_empty() {
        return Err(ApiError::bad_data("no org id"));
    }
    if id.len() > MAX_TENANT_ID_LENGTH {
        return Err(ApiError::bad_data(format!("tenant ID is too long: max {MAX_TENANT_ID_LENGTH} characters")));
    }
    if id == "." || id == ".." {
        return Err(ApiError::bad_data("tenant ID is '.' or '..'"));
    }
    if let Some(c) = id.chars().find(|c| !is_supported(*c)) {
        return Err(ApiError::bad_data(format!("tenant ID {id:?} contains unsupported character {c:?}")));
    }
    Ok(())
}

fn is_supported(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '!' | '-' | '_' | '.' | '*' | '\'' | '(' | ')')
}
