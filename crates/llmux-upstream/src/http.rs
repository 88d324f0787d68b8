//! Shared upstream HTTP client: one keep-alive `wreq` client per proxy,
//! bounded timeouts, streamed bodies bridged through an mpsc channel.

use std::collections::HashMap;
use std::sync::{Mutex, OnceLock};
use std::time::Duration;

use bytes::Bytes;
use futures_util::StreamExt;
use serde_json::Value as JsonValue;
use tokio::sync::mpsc;
use tracing::debug;

use llmux_common::error::{ProviderError, ProviderResult};
use llmux_pool::refresh::RefreshHttp;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Hard per-call ceiling; a stream must complete within this.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(300);
const STREAM_IDLE_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_IDLE_PER_HOST: usize = 5;

/// Per-call HTTP context: the outbound proxy (if enabled for this provider).
#[derive(Debug, Clone, Default)]
pub struct HttpCtx {
    pub proxy: Option<String>,
}

static CLIENT_CACHE: OnceLock<Mutex<HashMap<Option<String>, wreq::Client>>> = OnceLock::new();

pub(crate) fn shared_client(ctx: &HttpCtx) -> ProviderResult<wreq::Client> {
    let key = ctx
        .proxy
        .as_deref()
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(str::to_string);
    let cache = CLIENT_CACHE.get_or_init(|| Mutex::new(HashMap::new()));
    let mut guard = cache
        .lock()
        .map_err(|_| ProviderError::Other("http client cache lock failed".to_string()))?;
    if let Some(client) = guard.get(&key) {
        return Ok(client.clone());
    }
    let client = build_client(key.as_deref())?;
    guard.insert(key, client.clone());
    Ok(client)
}

fn build_client(proxy: Option<&str>) -> ProviderResult<wreq::Client> {
    let mut builder = wreq::Client::builder()
        .connect_timeout(CONNECT_TIMEOUT)
        .timeout(REQUEST_TIMEOUT)
        .read_timeout(STREAM_IDLE_TIMEOUT)
        .pool_max_idle_per_host(MAX_IDLE_PER_HOST);
    if let Some(proxy) = proxy {
        builder = builder
            .proxy(wreq::Proxy::all(proxy).map_err(|err| ProviderError::Other(err.to_string()))?);
    }
    builder
        .build()
        .map_err(|err| ProviderError::Other(err.to_string()))
}

pub(crate) fn map_transport_error(err: wreq::Error) -> ProviderError {
    ProviderError::Network(err.to_string())
}

fn apply_headers(
    mut builder: wreq::RequestBuilder,
    headers: &[(String, String)],
) -> wreq::RequestBuilder {
    for (name, value) in headers {
        builder = builder.header(name, value);
    }
    builder
}

/// POST a JSON body, buffer the whole response. Non-2xx becomes
/// `UpstreamStatus` with the body captured for diagnostics.
pub(crate) async fn post_json(
    ctx: &HttpCtx,
    url: &str,
    headers: &[(String, String)],
    body: &JsonValue,
) -> ProviderResult<Bytes> {
    let client = shared_client(ctx)?;
    let builder = apply_headers(client.post(url), headers).json(body);
    let resp = builder.send().await.map_err(map_transport_error)?;
    let status = resp.status().as_u16();
    let bytes = resp.bytes().await.map_err(map_transport_error)?;
    if !(200..300).contains(&status) {
        debug!(url, status, "upstream rejected request");
        return Err(ProviderError::UpstreamStatus {
            status,
            body: String::from_utf8_lossy(&bytes).into_owned(),
        });
    }
    Ok(bytes)
}

pub(crate) async fn get_json(
    ctx: &HttpCtx,
    url: &str,
    headers: &[(String, String)],
) -> ProviderResult<Bytes> {
    let client = shared_client(ctx)?;
    let builder = apply_headers(client.get(url), headers);
    let resp = builder.send().await.map_err(map_transport_error)?;
    let status = resp.status().as_u16();
    let bytes = resp.bytes().await.map_err(map_transport_error)?;
    if !(200..300).contains(&status) {
        return Err(ProviderError::UpstreamStatus {
            status,
            body: String::from_utf8_lossy(&bytes).into_owned(),
        });
    }
    Ok(bytes)
}

/// POST a JSON body and stream the response. Chunks flow through a bounded
/// channel; dropping the receiver aborts the forwarding task, which closes
/// the upstream body.
pub(crate) async fn post_stream(
    ctx: &HttpCtx,
    url: &str,
    headers: &[(String, String)],
    body: &JsonValue,
) -> ProviderResult<mpsc::Receiver<Bytes>> {
    let client = shared_client(ctx)?;
    let builder = apply_headers(client.post(url), headers).json(body);
    let resp = builder.send().await.map_err(map_transport_error)?;
    let status = resp.status().as_u16();
    if !(200..300).contains(&status) {
        let bytes = resp.bytes().await.unwrap_or_default();
        return Err(ProviderError::UpstreamStatus {
            status,
            body: String::from_utf8_lossy(&bytes).into_owned(),
        });
    }

    let (tx, rx) = mpsc::channel::<Bytes>(16);
    tokio::spawn(async move {
        let mut stream = resp.bytes_stream();
        while let Some(item) = stream.next().await {
            let Ok(chunk) = item else { break };
            if tx.send(chunk).await.is_err() {
                break;
            }
        }
    });
    Ok(rx)
}

/// Refresh transport over the shared client (no proxy; token endpoints are
/// reached directly).
#[derive(Debug, Default)]
pub struct WreqRefreshHttp {
    ctx: HttpCtx,
}

impl WreqRefreshHttp {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl RefreshHttp for WreqRefreshHttp {
    async fn post_json(&self, url: &str, body: JsonValue) -> ProviderResult<(u16, JsonValue)> {
        let client = shared_client(&self.ctx)?;
        let resp = client
            .post(url)
            .json(&body)
            .send()
            .await
            .map_err(map_transport_error)?;
        let status = resp.status().as_u16();
        let bytes = resp.bytes().await.map_err(map_transport_error)?;
        let payload = serde_json::from_slice::<JsonValue>(&bytes)
            .unwrap_or(JsonValue::Null);
        Ok((status, payload))
    }
}
