//! HTTP front end: every request goes through the sharding round tripper.

use std::io;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::body::Body as AxumBody;
use axum::extract::{Request as AxumRequest, State};
use axum::response::Response as AxumResponse;
use axum::routing::any;
use axum::Router;
use futures::{StreamExt, TryStreamExt};
use http::header::CONTENT_TYPE;
use http::{HeaderValue, StatusCode};
use shardq_api::response_from_error;
use shardq_core::{Body, Response, RoundTripper};
use shardq_proxy::ShardActiveSeries;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[derive(Clone)]
struct AppState {
    proxy: Arc<ShardActiveSeries>,
}

pub async fn serve(listen: &str, proxy: Arc<ShardActiveSeries>) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(listen).await.with_context(|| format!("binding {listen}"))?;
    info!(addr = %listen, "shardq proxy listening");
    let app = Router::new().fallback(any(dispatch)).with_state(AppState { proxy });
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutting down");
        })
        .await
        .context("http server failed")
}

async fn dispatch(State(state): State<AppState>, request: AxumRequest) -> AxumResponse {
    let (parts, body) = request.into_parts();
    let body = Body::from_stream(body.into_data_stream().map_err(|e| io::Error::new(io::ErrorKind::Other, e)));
    let mut req = http::Request::from_parts(parts, body);

    // canceled once the client is gone: the handler is dropped before the
    // response exists, or the response body is dropped mid-stream
    let cancel = CancellationToken::new();
    req.extensions_mut().insert(cancel.clone());
    let guard = cancel.drop_guard();

    match state.proxy.round_trip(req).await {
        Ok(resp) => resp.map(|body| AxumBody::from_stream(body.map(move |chunk| {
            let _alive = &guard;
            chunk
        }))),
        Err(err) => {
            let resp = response_from_error(&err).unwrap_or_else(|| bad_gateway(&err));
            error!(status = %resp.status(), error = %format!("{err:#}"), "request failed");
            resp.map(AxumBody::from_stream)
        }
    }
}

fn bad_gateway(err: &anyhow::Error) -> Response {
    let mut resp = Response::new(Body::from(format!("{err:#}")));
    *resp.status_mut() = StatusCode::BAD_GATEWAY;
    resp.headers_mut().insert(CONTENT_TYPE, HeaderValue::from_static("text/plain; charset=utf-8"));
    resp
}
