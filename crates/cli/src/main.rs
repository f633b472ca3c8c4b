use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use http::header::ACCEPT_ENCODING;
use http::HeaderValue;
use shardq_api::{response_from_error, Limits, StaticLimits};
use shardq_core::{Body, RoundTripper, ORG_ID_HEADER, SHARDING_CONTROL_HEADER};
use shardq_proxy::{ProxyConfig, ShardActiveSeries};
use shardq_selector::{sharded_selectors, VectorSelector};
use tokio::io::AsyncWriteExt;
use tokio_util::io::StreamReader;
use tracing::{error, info};

mod serve;
mod upstream;

use upstream::HttpUpstream;

const ACTIVE_SERIES_PATH: &str = "/api/v1/cardinality/active_series";

#[derive(Parser, Debug)]
#[command(name = "shardqctl", version, about = "Sharded active series queries")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Tenant limits file (YAML); built-in defaults when absent
    #[arg(long = "limits", global = true, env = "SHARDQ_LIMITS_FILE")]
    limits: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run one sharded query against an upstream and print the merged response
    Query {
        /// Vector selector, e.g. 'up{job="api"}'
        selector: String,
        /// Upstream base URL
        #[arg(long = "upstream", env = "SHARDQ_UPSTREAM")]
        upstream: String,
        /// Tenant sent as X-Scope-OrgID
        #[arg(long = "tenant", env = "SHARDQ_TENANT", default_value = "anonymous")]
        tenant: String,
        /// Shard count override
        #[arg(long = "shards")]
        shards: Option<u32>,
        /// Ask for a Snappy framed response (written out compressed)
        #[arg(long = "snappy")]
        snappy: bool,
    },
    /// Print the per-shard selectors a query would be split into
    Explain {
        selector: String,
        #[arg(long = "shards", default_value_t = 4)]
        shards: usize,
    },
    /// Serve the sharding proxy over HTTP
    Serve {
        /// Listen address
        #[arg(long = "listen", env = "SHARDQ_LISTEN", default_value = "127.0.0.1:8080")]
        listen: String,
        /// Upstream base URL
        #[arg(long = "upstream", env = "SHARDQ_UPSTREAM")]
        upstream: String,
    },
}

fn init_tracing() {
    let env = std::env::var("SHARDQ_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("SHARDQ_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid SHARDQ_METRICS_ADDR; expected host:port");
        }
    }
}

fn load_limits(path: Option<&str>) -> Result<Arc<dyn Limits>> {
    let limits = match path {
        Some(p) => StaticLimits::from_yaml_file(p)?,
        None => StaticLimits::default(),
    };
    Ok(Arc::new(limits))
}

fn build_proxy(upstream: &str, limits: Arc<dyn Limits>) -> Result<ShardActiveSeries> {
    let upstream = HttpUpstream::new(upstream, Duration::from_secs(5))?;
    Ok(ShardActiveSeries::new(Arc::new(upstream), limits).with_config(ProxyConfig::from_env()))
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    match cli.command {
        Commands::Query { selector, upstream, tenant, shards, snappy } => {
            info!(selector = %selector, upstream = %upstream, shards = ?shards, "query invoked");
            let proxy = build_proxy(&upstream, load_limits(cli.limits.as_deref())?)?;
            let query = url::form_urlencoded::Serializer::new(String::new()).append_pair("selector", &selector).finish();
            let mut req = http::Request::builder()
                .uri(format!("{ACTIVE_SERIES_PATH}?{query}"))
                .header(ORG_ID_HEADER, HeaderValue::from_str(&tenant).context("invalid tenant")?);
            if let Some(n) = shards {
                req = req.header(SHARDING_CONTROL_HEADER, n);
            }
            if snappy {
                req = req.header(ACCEPT_ENCODING, shardq_core::ENCODING_SNAPPY_FRAMED);
            }
            let req = req.body(Body::empty()).context("building request")?;

            let resp = match proxy.round_trip(req).await {
                Ok(resp) => resp,
                Err(err) => {
                    error!(error = %format!("{err:#}"), "query failed");
                    match response_from_error(&err) {
                        Some(rendered) => {
                            let status = rendered.status();
                            let body = rendered.into_body().collect(1 << 16).await?;
                            eprintln!("query error ({status}): {}", String::from_utf8_lossy(&body));
                            std::process::exit(1);
                        }
                        None => return Err(err),
                    }
                }
            };
            let status = resp.status();
            let mut reader = StreamReader::new(resp.into_body());
            let mut stdout = tokio::io::stdout();
            let written = tokio::io::copy(&mut reader, &mut stdout).await.context("writing response")?;
            if !snappy {
                stdout.write_all(b"\n").await?;
            }
            stdout.flush().await?;
            info!(status = %status, bytes = written, "query finished");
        }
        Commands::Explain { selector, shards } => {
            let parsed: VectorSelector = selector.parse().with_context(|| format!("parsing selector {selector:?}"))?;
            let rewritten: Vec<String> = if shards < 2 {
                vec![parsed.to_string()]
            } else {
                sharded_selectors(&parsed, shards).iter().map(|s| s.to_string()).collect()
            };
            match cli.output {
                Output::Human => {
                    for s in &rewritten {
                        println!("{s}");
                    }
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&rewritten)?),
            }
        }
        Commands::Serve { listen, upstream } => {
            let proxy = build_proxy(&upstream, load_limits(cli.limits.as_deref())?)?;
            serve::serve(&listen, Arc::new(proxy)).await?;
        }
    }
    Ok(())
}
