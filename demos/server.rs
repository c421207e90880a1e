//! Axum demo server wiring a real `Transport` to a `RequestPipeline` —
//! mirrors `batcher/src/main.rs`'s demo binary. Not part of the library's
//! public contract (SPEC_FULL.md A5).

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::State;
use axum::response::sse::Event;
use axum::response::{IntoResponse, Sse};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt as _;
use tower_http::trace::TraceLayer;

use request_runtime::cache::{CacheConfig, CacheEvent};
use request_runtime::config::GlobalConfig;
use request_runtime::descriptor::{Body, Method, RequestDescriptor};
use request_runtime::error::{factory, ErrorContext, Result};
use request_runtime::pipeline::RequestPipeline;
use request_runtime::transport::{Transport, TransportValue};

/// Production `Transport` backed by `reqwest`, grounded in the teacher's
/// `ReqwestHttpClient` (`batcher/src/http.rs`).
struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    fn new() -> Self {
        Self { client: reqwest::Client::new() }
    }

    fn parse_method(method: Method) -> reqwest::Method {
        match method {
            Method::Get => reqwest::Method::GET,
            Method::Post => reqwest::Method::POST,
            Method::Put => reqwest::Method::PUT,
            Method::Patch => reqwest::Method::PATCH,
            Method::Delete => reqwest::Method::DELETE,
            Method::Head => reqwest::Method::HEAD,
            Method::Options => reqwest::Method::OPTIONS,
        }
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    #[tracing::instrument(skip(self, descriptor, abort_signal), fields(url = %descriptor.url))]
    async fn request(
        &self,
        descriptor: &RequestDescriptor,
        abort_signal: tokio_util::sync::CancellationToken,
    ) -> Result<TransportValue> {
        let ctx = || ErrorContext::new().with_url(&descriptor.url).with_method(descriptor.method.as_str());

        let mut builder = self
            .client
            .request(Self::parse_method(descriptor.method), &descriptor.url)
            .timeout(descriptor.timeout.unwrap_or(Duration::from_secs(10)));

        for (key, value) in &descriptor.headers {
            builder = builder.header(key, value);
        }

        // Params with null values are filtered at the wire (§6) — our
        // `Scalar` enum already drops nulls when converted to query pairs.
        let query: Vec<(String, String)> = descriptor
            .params
            .iter()
            .filter_map(|(k, v)| match v {
                request_runtime::descriptor::Scalar::Null => None,
                other => Some((k.clone(), format!("{other:?}"))),
            })
            .collect();
        if !query.is_empty() {
            builder = builder.query(&query);
        }

        if let Body::Text(text) = &descriptor.body {
            builder = builder.body(text.clone());
        }

        let send = builder.send();
        let response = tokio::select! {
            result = send => result.map_err(|e| {
                if e.is_timeout() {
                    factory::timeout_error(format!("Request timeout: {e}"), ctx())
                } else {
                    factory::network_error(e.to_string(), ctx())
                }
            })?,
            _ = abort_signal.cancelled() => {
                return Err(request_runtime::cancellation::aborted_error(descriptor));
            }
        };

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(factory::http_error(status.as_u16(), body, ctx()));
        }

        match descriptor.response_form {
            request_runtime::descriptor::ResponseForm::Json => {
                let value = response.json().await.map_err(|e| factory::network_error(e.to_string(), ctx()))?;
                Ok(TransportValue::Json(value))
            }
            request_runtime::descriptor::ResponseForm::Bytes | request_runtime::descriptor::ResponseForm::Stream => {
                let bytes = response.bytes().await.map_err(|e| factory::network_error(e.to_string(), ctx()))?;
                Ok(TransportValue::Bytes(bytes.to_vec()))
            }
            request_runtime::descriptor::ResponseForm::Text => {
                let text = response.text().await.map_err(|e| factory::network_error(e.to_string(), ctx()))?;
                Ok(TransportValue::Text(text))
            }
        }
    }
}

#[derive(Clone)]
struct AppState {
    pipeline: Arc<RequestPipeline>,
}

#[derive(Debug, Deserialize)]
struct SubmitRequest {
    url: String,
    #[serde(default)]
    serial_key: Option<String>,
}

#[derive(Debug, Serialize)]
struct SubmitResponse {
    ok: bool,
    detail: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter("request_runtime=debug,tower_http=debug,info")
        .init();

    let global = GlobalConfig::from_env(None).unwrap_or_default();
    let transport: Arc<dyn Transport> = Arc::new(ReqwestTransport::new());
    let pipeline = Arc::new(RequestPipeline::with_cache(transport, global, Some(CacheConfig::default())));

    let state = AppState { pipeline };

    let app = Router::new()
        .route("/api/submit", post(submit_request))
        .route("/api/cache/events", get(cache_events))
        .route("/api/stats", get(stats))
        .with_state(state)
        .layer(TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:3000").await?;
    tracing::info!("request-runtime demo listening on http://127.0.0.1:3000");
    axum::serve(listener, app).await?;

    Ok(())
}

async fn submit_request(State(state): State<AppState>, Json(payload): Json<SubmitRequest>) -> impl IntoResponse {
    let mut descriptor = RequestDescriptor::new(payload.url, Method::Get);
    if let Some(key) = payload.serial_key {
        descriptor = descriptor.with_serial_key(key);
    }

    match state.pipeline.execute(descriptor).await {
        Ok(_) => Json(SubmitResponse { ok: true, detail: "settled".to_string() }),
        Err(err) => Json(SubmitResponse { ok: false, detail: err.to_string() }),
    }
}

async fn cache_events(
    State(state): State<AppState>,
) -> Sse<impl tokio_stream::Stream<Item = std::result::Result<Event, Infallible>>> {
    let rx = state.pipeline.cache_events();
    let stream = BroadcastStream::new(rx).map(|result| match result {
        Ok(event) => Ok(Event::default().data(render_event(&event))),
        Err(_) => Ok(Event::default().data("")),
    });
    Sse::new(stream)
}

fn render_event(event: &CacheEvent) -> String {
    match event {
        CacheEvent::Hit { fingerprint } => format!("hit:{fingerprint}"),
        CacheEvent::Miss { fingerprint } => format!("miss:{fingerprint}"),
        CacheEvent::Evicted { fingerprint } => format!("evicted:{fingerprint}"),
    }
}

async fn stats(State(state): State<AppState>) -> Json<serde_json::Value> {
    let stats = state.pipeline.all_stats();
    Json(serde_json::json!({
        "interceptors": stats.interceptors.count,
        "serial_queues": stats.serial.queue_count,
        "cache_size": stats.cache.map(|c| c.size),
    }))
}
