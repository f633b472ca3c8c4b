#![forbid(unsafe_code)]

use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use http::header::{ACCEPT_ENCODING, CONTENT_ENCODING, CONTENT_TYPE};
use http::{Method, StatusCode};
use shardq_api::{ApiError, ErrorType, StaticLimits, TenantLimits};
use shardq_core::{stable_hash, Body, QueryStats, Request, Response, ResultItem, RoundTripper, ShardSelector};
use shardq_proxy::{ProxyConfig, ShardActiveSeries};
use shardq_selector::VectorSelector;
use tokio_util::sync::CancellationToken;

type Respond = dyn Fn(Option<ShardSelector>) -> (u16, Body) + Send + Sync;

/// Upstream that evaluates selectors against a fixed series set and honours
/// the shard matcher the way a real querier does.
struct FakeUpstream {
    series: Vec<ResultItem>,
    respond: Option<Box<Respond>>,
    calls: AtomicUsize,
    seen: Mutex<Vec<(Method, String, http::HeaderMap)>>,
}

impl FakeUpstream {
    fn with_series(series: Vec<ResultItem>) -> Arc<Self> {
        Arc::new(Self { series, respond: None, calls: AtomicUsize::new(0), seen: Mutex::new(Vec::new()) })
    }

    fn responding(f: impl Fn(Option<ShardSelector>) -> (u16, Body) + Send + Sync + 'static) -> Arc<Self> {
        Arc::new(Self { series: Vec::new(), respond: Some(Box::new(f)), calls: AtomicUsize::new(0), seen: Mutex::new(Vec::new()) })
    }

    fn calls(&self) -> usize { self.calls.load(Ordering::SeqCst) }

    fn selectors(&self) -> Vec<String> {
        self.seen.lock().expect("lock").iter().map(|(_, s, _)| s.clone()).collect()
    }
}

fn form_selector(input: &[u8]) -> Option<String> {
    url::form_urlencoded::parse(input).find(|(k, _)| k == "selector").map(|(_, v)| v.into_owned())
}

#[async_trait::async_trait]
impl RoundTripper for FakeUpstream {
    async fn round_trip(&self, req: Request) -> anyhow::Result<Response> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let (parts, body) = req.into_parts();
        let raw = if parts.method == Method::POST {
            form_selector(&body.collect(1 << 16).await?)
        } else {
            parts.uri.query().and_then(|q| form_selector(q.as_bytes()))
        }
        .unwrap_or_default();
        self.seen.lock().expect("lock").push((parts.method.clone(), raw.clone(), parts.headers.clone()));

        let selector: VectorSelector = raw.parse()?;
        let shard = selector.shard()?;
        let (status, body) = match &self.respond {
            Some(f) => f(shard),
            None => {
                let plain = selector.without_shard();
                let matched: Vec<&ResultItem> = self
                    .series
                    .iter()
                    .filter(|s| plain.matches(s))
                    .filter(|s| shard.map_or(true, |sh| sh.owns(stable_hash(s.iter()))))
                    .collect();
                if let Some(stats) = QueryStats::from_extensions(&parts.extensions) {
                    stats.add_fetched_series(matched.len() as u64);
                }
                let doc = serde_json::json!({ "status": "success", "data": matched });
                (200, chunked(serde_json::to_vec(&doc)?, 7))
            }
        };
        let mut resp = Response::new(body);
        *resp.status_mut() = StatusCode::from_u16(status)?;
        Ok(resp)
    }
}

fn chunked(bytes: Vec<u8>, size: usize) -> Body {
    let chunks: Vec<io::Result<Bytes>> = bytes.chunks(size).map(|c| Ok(Bytes::copy_from_slice(c))).collect();
    Body::from_stream(futures::stream::iter(chunks))
}

fn series(n: usize) -> Vec<ResultItem> {
    (0..n)
        .map(|i| {
            let job = if i % 3 == 0 { "api" } else { "web" };
            [("__name__", "up".to_string()), ("job", job.to_string()), ("instance", format!("host-{i}"))].into_iter().collect()
        })
        .collect()
}

fn limits(total: usize, max: usize) -> Arc<StaticLimits> {
    Arc::new(StaticLimits::new(TenantLimits { query_sharding_total_shards: total, query_sharding_max_sharded_queries: max }))
}

fn get(selector: &str, shards: Option<&str>) -> Request {
    let query = url::form_urlencoded::Serializer::new(String::new()).append_pair("selector", selector).finish();
    let mut b = http::Request::builder()
        .method(Method::GET)
        .uri(format!("http://querier/api/v1/cardinality/active_series?{query}"))
        .header("X-Scope-OrgID", "team-a");
    if let Some(n) = shards {
        b = b.header("Sharding-Control", n);
    }
    b.body(Body::empty()).expect("request")
}

async fn read_json(resp: Response) -> serde_json::Value {
    let bytes = tokio::time::timeout(Duration::from_secs(5), resp.into_body().collect(1 << 24))
        .await
        .expect("response finished")
        .expect("body");
    serde_json::from_slice(&bytes).expect("valid json")
}

fn sorted_items(doc: &serde_json::Value) -> Vec<String> {
    let mut items: Vec<String> = doc["data"].as_array().expect("data array").iter().map(|v| v.to_string()).collect();
    items.sort();
    items
}

fn api_error(err: &anyhow::Error) -> &ApiError { err.downcast_ref::<ApiError>().expect("api error") }

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn four_shards_merge_into_one_document() {
    let upstream = FakeUpstream::responding(|shard| {
        let name = ["a", "b", "c", "d"][shard.map_or(0, |s| s.index as usize)];
        (200, Body::from(format!(r#"{{"data":[{{"name":"{name}"}}]}}"#)))
    });
    let proxy = ShardActiveSeries::new(upstream.clone(), limits(16, 8));
    let resp = proxy.round_trip(get(r#"up{job="api"}"#, Some("4"))).await.expect("response");
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(resp.headers()[CONTENT_TYPE], "application/json");
    assert!(resp.headers().get(CONTENT_ENCODING).is_none());

    let doc = read_json(resp).await;
    assert_eq!(sorted_items(&doc), vec![r#"{"name":"a"}"#, r#"{"name":"b"}"#, r#"{"name":"c"}"#, r#"{"name":"d"}"#]);
    assert!(doc.get("error").is_none());

    let mut selectors = upstream.selectors();
    selectors.sort();
    assert_eq!(
        selectors,
        (1..=4).map(|i| format!(r#"up{{__query_shard__="{i}_of_4",job="api"}}"#)).collect::<Vec<_>>()
    );
    for (_, _, headers) in upstream.seen.lock().expect("lock").iter() {
        assert!(headers.get("Sharding-Control").is_none());
        assert_eq!(headers["X-Scope-OrgID"], "team-a");
    }
}

#[tokio::test]
async fn small_shard_counts_pass_through_untouched() {
    for header in ["0", "1"] {
        let upstream = FakeUpstream::with_series(series(10));
        let proxy = ShardActiveSeries::new(upstream.clone(), limits(16, 8));
        let resp = proxy.round_trip(get("up", Some(header))).await.expect("response");
        let doc = read_json(resp).await;
        assert_eq!(doc["status"], "success", "upstream body is returned as is");
        assert_eq!(upstream.calls(), 1);
        assert_eq!(upstream.selectors(), vec!["up".to_string()]);
        let seen = upstream.seen.lock().expect("lock");
        assert_eq!(seen[0].2["Sharding-Control"], header);
    }

    let upstream = FakeUpstream::with_series(series(10));
    let proxy = ShardActiveSeries::new(upstream.clone(), limits(1, 8));
    proxy.round_trip(get("up", None)).await.expect("response");
    assert_eq!(upstream.calls(), 1);
}

#[tokio::test]
async fn shard_count_above_maximum_never_reaches_upstream() {
    let upstream = FakeUpstream::with_series(series(10));
    let proxy = ShardActiveSeries::new(upstream.clone(), limits(16, 8));
    let err = proxy.round_trip(get("up", Some("100"))).await.expect_err("over max");
    let api = api_error(&err);
    assert_eq!(api.kind, ErrorType::BadData);
    assert_eq!(api.message, "shard count 100 exceeds allowed maximum (8)");
    assert_eq!(upstream.calls(), 0);
}

#[tokio::test]
async fn malformed_header_falls_back_to_tenant_default() {
    let upstream = FakeUpstream::with_series(series(30));
    let proxy = ShardActiveSeries::new(upstream.clone(), limits(3, 8));
    let resp = proxy.round_trip(get("up", Some("lots"))).await.expect("response");
    read_json(resp).await;
    assert_eq!(upstream.calls(), 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn entity_too_large_asks_for_more_shards() {
    let upstream = FakeUpstream::responding(|shard| match shard.map(|s| s.index) {
        Some(2) => (413, Body::from("too many series")),
        _ => (200, Body::from(r#"{"data":[]}"#)),
    });
    let proxy = ShardActiveSeries::new(upstream, limits(16, 8));
    let err = proxy.round_trip(get("up", Some("4"))).await.expect_err("413");
    let api = api_error(&err);
    assert_eq!(api.kind, ErrorType::BadData);
    assert_eq!(api.message, "shard count too low: try increasing the requested shard count");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn upstream_failure_is_internal() {
    let upstream = FakeUpstream::responding(|shard| match shard.map(|s| s.index) {
        Some(0) => (503, Body::from("querier overloaded")),
        _ => (200, Body::from(r#"{"data":[]}"#)),
    });
    let proxy = ShardActiveSeries::new(upstream, limits(16, 8));
    let err = proxy.round_trip(get("up", Some("2"))).await.expect_err("503");
    let api = api_error(&err);
    assert_eq!(api.kind, ErrorType::Internal);
    assert_eq!(api.message, "received unexpected response from upstream: status 503, body: querier overloaded");
    assert!(!api.is_non_retryable());
}

#[tokio::test]
async fn bad_input_is_rejected_before_dispatch() {
    let upstream = FakeUpstream::with_series(series(10));
    let proxy = ShardActiveSeries::new(upstream.clone(), limits(4, 8));

    let req = http::Request::builder()
        .uri("http://querier/api/v1/cardinality/active_series")
        .header("X-Scope-OrgID", "team-a")
        .body(Body::empty())
        .expect("request");
    let err = proxy.round_trip(req).await.expect_err("no selector");
    assert_eq!(api_error(&err).message, "selector parameter is required");

    let err = proxy.round_trip(get("rate(up[5m])", None)).await.expect_err("not a selector");
    assert!(api_error(&err).message.starts_with("invalid selector: "));

    let mut req = get("up", None);
    req.headers_mut().remove("X-Scope-OrgID");
    let err = proxy.round_trip(req).await.expect_err("no tenant");
    assert_eq!(api_error(&err).message, "no org id");

    let mut req = get("up", None);
    *req.method_mut() = Method::DELETE;
    let err = proxy.round_trip(req).await.expect_err("delete");
    assert_eq!(api_error(&err).kind, ErrorType::BadData);
    assert_eq!(api_error(&err).message, "unsupported method: DELETE");

    assert_eq!(upstream.calls(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn post_requests_are_sharded_as_forms() {
    let upstream = FakeUpstream::with_series(series(60));
    let proxy = ShardActiveSeries::new(upstream.clone(), limits(16, 8));
    let req = http::Request::builder()
        .method(Method::POST)
        .uri("http://querier/api/v1/cardinality/active_series")
        .header("X-Scope-OrgID", "team-a")
        .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
        .header("Sharding-Control", "3")
        .body(Body::from(r#"selector=up%7Bjob%3D%22api%22%7D"#))
        .expect("request");
    let doc = read_json(proxy.round_trip(req).await.expect("response")).await;
    assert_eq!(doc["data"].as_array().map(Vec::len), Some(20));
    let seen = upstream.seen.lock().expect("lock");
    assert_eq!(seen.len(), 3);
    assert!(seen.iter().all(|(m, s, _)| *m == Method::POST && s.starts_with("up{__query_shard__=")));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn sharding_neither_loses_nor_duplicates_series() {
    let data = series(200);
    let direct = {
        let upstream = FakeUpstream::with_series(data.clone());
        let proxy = ShardActiveSeries::new(upstream, limits(1, 16));
        sorted_items(&read_json(proxy.round_trip(get(r#"up{job=~"api|web"}"#, None)).await.expect("direct")).await)
    };
    assert_eq!(direct.len(), 200);

    for count in 2..=7 {
        let upstream = FakeUpstream::with_series(data.clone());
        let proxy = ShardActiveSeries::new(upstream.clone(), limits(1, 16));
        let header = count.to_string();
        let resp = proxy.round_trip(get(r#"up{job=~"api|web"}"#, Some(&header))).await.expect("sharded");
        assert_eq!(sorted_items(&read_json(resp).await), direct, "{count} shards");
        assert_eq!(upstream.calls(), count);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn shard_stats_are_merged_into_the_request() {
    let upstream = FakeUpstream::with_series(series(90));
    let proxy = ShardActiveSeries::new(upstream, limits(16, 8));
    let stats = Arc::new(QueryStats::default());
    let mut req = get(r#"up{job="web"}"#, Some("5"));
    req.extensions_mut().insert(stats.clone());
    read_json(proxy.round_trip(req).await.expect("response")).await;
    assert_eq!(stats.sharded_queries(), 5);
    assert_eq!(stats.fetched_series(), 60);
}

#[tokio::test]
async fn snappy_framed_when_accepted() {
    let upstream = FakeUpstream::with_series(series(12));
    let proxy = ShardActiveSeries::new(upstream.clone(), limits(16, 8)).with_config(ProxyConfig { flush_bytes: 32, ..ProxyConfig::default() });
    let mut req = get("up", Some("2"));
    req.headers_mut().insert(ACCEPT_ENCODING, http::HeaderValue::from_static("gzip, x-snappy-framed"));
    let resp = proxy.round_trip(req).await.expect("response");
    assert_eq!(resp.headers()[CONTENT_ENCODING], "x-snappy-framed");

    let compressed = resp.into_body().collect(1 << 20).await.expect("body");
    let mut plain = Vec::new();
    std::io::Read::read_to_end(&mut snap::read::FrameDecoder::new(&compressed[..]), &mut plain).expect("snappy");
    let doc: serde_json::Value = serde_json::from_slice(&plain).expect("json");
    assert_eq!(doc["data"].as_array().map(Vec::len), Some(12));
    assert!(upstream.seen.lock().expect("lock").iter().all(|(_, _, h)| h.get(ACCEPT_ENCODING).is_none()));
}

struct DropCount(Arc<AtomicUsize>);

impl Drop for DropCount {
    fn drop(&mut self) { self.0.fetch_add(1, Ordering::SeqCst); }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn canceling_the_caller_closes_every_upstream_body() {
    let closed = Arc::new(AtomicUsize::new(0));
    let tracker = closed.clone();
    let upstream = FakeUpstream::responding(move |shard| {
        let guard = DropCount(tracker.clone());
        let index = shard.map_or(0, |s| s.index);
        let body = Body::from_stream(async_stream::stream! {
            let _guard = guard;
            yield Ok::<_, io::Error>(Bytes::from(format!(r#"{{"data":[{{"shard":"{index}"}}"#)));
            futures::future::pending::<()>().await;
        });
        (200, body)
    });
    let proxy = ShardActiveSeries::new(upstream, limits(16, 8));
    let cancel = CancellationToken::new();
    let mut req = get("up", Some("6"));
    req.extensions_mut().insert(cancel.clone());

    let resp = proxy.round_trip(req).await.expect("response");
    tokio::time::sleep(Duration::from_millis(50)).await;
    cancel.cancel();

    let doc = read_json(resp).await;
    assert_eq!(doc["status"], "error");
    assert_eq!(doc["error"], "error merging partial responses: context canceled");
    assert_eq!(closed.load(Ordering::SeqCst), 6);
}
