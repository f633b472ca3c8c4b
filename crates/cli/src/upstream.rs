//! HTTP upstream for the proxy, backed by reqwest.

use std::io;
use std::time::Duration;

use anyhow::{Context, Result};
use futures::TryStreamExt;
use http::header::HOST;
use shardq_core::{Body, Request, Response, RoundTripper};
use tracing::debug;
use url::Url;

/// Forwards requests to `base`, keeping their path and query. Response
/// bodies are streamed back unread.
pub struct HttpUpstream {
    client: reqwest::Client,
    base: Url,
    max_request_bytes: usize,
}

impl HttpUpstream {
    pub fn new(base: &str, connect_timeout: Duration) -> Result<Self> {
        let base = Url::parse(base).with_context(|| format!("invalid upstream url {base:?}"))?;
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .build()
            .context("building http client")?;
        Ok(Self { client, base, max_request_bytes: 1 << 20 })
    }

    fn target(&self, req: &Request) -> Result<Url> {
        let path = req.uri().path_and_query().map(|p| p.as_str()).unwrap_or("/");
        self.base.join(path).with_context(|| format!("joining {path:?} onto {}", self.base))
    }
}

#[async_trait::async_trait]
impl RoundTripper for HttpUpstream {
    async fn round_trip(&self, req: Request) -> Result<Response> {
        let url = self.target(&req)?;
        let (parts, body) = req.into_parts();
        let body = body.collect(self.max_request_bytes).await.context("reading request body")?;
        let mut headers = parts.headers;
        headers.remove(HOST);

        debug!(method = %parts.method, url = %url, "upstream request");
        let resp = self
            .client
            .request(parts.method, url.clone())
            .headers(headers)
            .body(body)
            .send()
            .await
            .with_context(|| format!("sending request to {url}"))?;

        let status = resp.status();
        let headers = resp.headers().clone();
        let stream = resp.bytes_stream().map_err(|e| io::Error::new(io::ErrorKind::Other, e));
        let mut out = Response::new(Body::from_stream(stream));
        *out.status_mut() = status;
        *out.headers_mut() = headers;
        Ok(out)
    }
}
