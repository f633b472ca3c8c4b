//! Selector extraction and per-shard sub-request construction.

use http::header::{HeaderValue, ACCEPT_ENCODING, CONTENT_LENGTH, CONTENT_TYPE};
use http::request::Parts;
use http::{Method, Uri};
use shardq_api::ApiError;
use shardq_core::{Body, Request, SHARDING_CONTROL_HEADER};
use shardq_selector::{sharded_selectors, VectorSelector};

use crate::ShardError;

const SELECTOR_PARAM: &str = "selector";
const FORM_CONTENT_TYPE: &str = "application/x-www-form-urlencoded";

/// Read the `selector` form value from the query string or, for
/// form-encoded POSTs, the body. The body is put back so the request can
/// still be forwarded as is.
pub async fn parse_selector(req: &mut Request, max_form_bytes: usize) -> Result<VectorSelector, ApiError> {
    let mut raw = None;
    if req.method() == Method::POST && is_form(req) {
        let body = std::mem::take(req.body_mut())
            .collect(max_form_bytes)
            .await
            .map_err(|e| ApiError::bad_data(format!("reading request body: {e}")))?;
        raw = form_value(&body, SELECTOR_PARAM);
        *req.body_mut() = Body::from(body);
    }
    if raw.is_none() {
        raw = req.uri().query().and_then(|q| form_value(q.as_bytes(), SELECTOR_PARAM));
    }
    let raw = raw.filter(|s| !s.is_empty()).ok_or_else(|| ApiError::bad_data("selector parameter is required"))?;
    raw.parse::<VectorSelector>().map_err(|e| ApiError::bad_data(format!("invalid selector: {e}")))
}

/// One sub-request per shard, cloned from `parts` with the rewritten selector.
///
/// GET carries the selector as the whole query string; POST carries it as a
/// form body with the query string cleared. The shard control and
/// `Accept-Encoding` headers are dropped.
pub fn build_sharded_requests(parts: &Parts, selector: &VectorSelector, count: usize) -> Result<Vec<Request>, ShardError> {
    if parts.method != Method::GET && parts.method != Method::POST {
        return Err(ShardError::UnsupportedMethod(parts.method.clone()));
    }
    sharded_selectors(selector, count)
        .into_iter()
        .map(|sharded| -> Result<Request, ShardError> {
            let encoded = url::form_urlencoded::Serializer::new(String::new())
                .append_pair(SELECTOR_PARAM, &sharded.to_string())
                .finish();
            let mut headers = parts.headers.clone();
            headers.remove(SHARDING_CONTROL_HEADER);
            headers.remove(ACCEPT_ENCODING);

            let (query, body) = if parts.method == Method::GET {
                (Some(encoded), Body::empty())
            } else {
                headers.insert(CONTENT_TYPE, HeaderValue::from_static(FORM_CONTENT_TYPE));
                headers.insert(CONTENT_LENGTH, HeaderValue::from(encoded.len()));
                (None, Body::from(encoded))
            };

            let mut req = Request::new(body);
            *req.method_mut() = parts.method.clone();
            *req.uri_mut() = with_query(&parts.uri, query.as_deref())?;
            *req.version_mut() = parts.version;
            *req.headers_mut() = headers;
            *req.extensions_mut() = parts.extensions.clone();
            Ok(req)
        })
        .collect()
}

fn is_form(req: &Request) -> bool {
    req.headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(';').next())
        .is_some_and(|v| v.trim().eq_ignore_ascii_case(FORM_CONTENT_TYPE))
}

fn form_value(input: &[u8], key: &str) -> Option<String> {
    url::form_urlencoded::parse(input).find(|(k, _)| k == key).map(|(_, v)| v.into_owned())
}

fn with_query(uri: &Uri, query: Option<&str>) -> Result<Uri, ShardError> {
    let path = uri.path();
    let path_and_query = match query {
        Some(q) => format!("{path}?{q}"),
        None => path.to_string(),
    };
    let mut parts = uri.clone().into_parts();
    parts.path_and_query = Some(path_and_query.parse().map_err(|e: http::uri::InvalidUri| ShardError::Build(e.to_string()))?);
    Uri::from_parts(parts).map_err(|e| ShardError::Build(e.to_string()))
}
