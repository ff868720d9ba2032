//! HTTP and WebSocket front end for the synthesis engine.

pub mod config;
pub mod error;
pub mod metrics;
pub mod validation;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Instant;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Request, State, WebSocketUpgrade,
    },
    http::{header, HeaderValue, Method},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use tokio::sync::mpsc;
use tower::ServiceBuilder;
use tower_governor::{governor::GovernorConfigBuilder, key_extractor::GlobalKeyExtractor, GovernorLayer};
use tower_http::{
    cors::{AllowOrigin, Any, CorsLayer},
    timeout::TimeoutLayer,
    trace::TraceLayer,
};
use tracing::{debug, info, warn};
use tts_core::{wav, CancellationToken, SpeakerId, SynthesisDriver, SynthesisRequest, SynthesisResult};

use crate::config::ServerConfig;
use crate::error::ApiError;
use crate::metrics::{AppMetrics, DetailedMetricsResponse, EndpointMetricsResponse, SystemMetrics};
use crate::validation::{parse_stream_message, validate_synthesis_request, AudioFormat, SynthesisApiParams};

/// Queued PCM flushes per stream before the engine blocks.
const STREAM_CHANNEL_CAPACITY: usize = 32;

static START_TIME: OnceLock<Instant> = OnceLock::new();

#[derive(Clone)]
pub struct AppState {
    pub driver: Arc<SynthesisDriver>,
    pub metrics: AppMetrics,
    pub request_count: Arc<AtomicU64>,
    pub config: ServerConfig,
}

impl AppState {
    pub fn new(driver: Arc<SynthesisDriver>, config: ServerConfig) -> Self {
        Self {
            driver,
            metrics: AppMetrics::new(),
            request_count: Arc::new(AtomicU64::new(0)),
            config,
        }
    }
}

#[derive(Serialize)]
pub struct SynthesisResponse {
    audio_base64: String,
    duration_ms: u64,
    sample_rate: u32,
    real_time_factor: f64,
}

/// Cancels the in-flight synthesis if the handler future is dropped.
struct CancelOnDrop(CancellationToken);

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        self.0.cancel();
    }
}

fn cors_layer(config: &ServerConfig) -> CorsLayer {
    let methods = [Method::GET, Method::POST, Method::OPTIONS];
    let origins: Vec<HeaderValue> = config
        .cors_allowed_origins
        .iter()
        .flatten()
        .filter_map(|origin| origin.parse::<HeaderValue>().ok())
        .collect();

    let allow_origin = if origins.is_empty() {
        warn!("CORS_ALLOWED_ORIGINS not set, allowing all origins");
        AllowOrigin::from(Any)
    } else {
        info!("CORS configured for {} origin(s)", origins.len());
        AllowOrigin::list(origins)
    };

    CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods(methods)
        .allow_headers(Any)
        .allow_credentials(false)
}

/// Build the router with its middleware stack.
pub fn app(state: AppState) -> anyhow::Result<Router> {
    let _ = START_TIME.get_or_init(Instant::now);
    let config = &state.config;

    // One global bucket; per-IP keys are unreliable behind proxies.
    let rate = config.rate_limit_per_minute.max(1);
    let governor_conf = Arc::new(
        GovernorConfigBuilder::default()
            .per_millisecond((60_000 / rate as u64).max(1))
            .burst_size(rate)
            .key_extractor(GlobalKeyExtractor)
            .finish()
            .ok_or_else(|| anyhow::anyhow!("invalid rate limit configuration: {rate}/min"))?,
    );
    info!("Rate limiting: {} requests per minute", rate);

    let middleware_stack = ServiceBuilder::new()
        .layer(TraceLayer::new_for_http())
        .layer(GovernorLayer::new(governor_conf))
        .layer(TimeoutLayer::new(config.request_timeout()))
        .layer(cors_layer(config))
        .into_inner();

    let api_v1 = Router::new()
        .route("/speakers", get(list_speakers))
        .route("/synthesise", post(synthesise))
        .route("/stream", get(stream_ws))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_bearer));

    Ok(Router::new()
        .route("/health", get(health_check))
        .route("/healthz", get(health_check))
        .route("/metrics", get(metrics_endpoint))
        .nest("/api/v1", api_v1)
        .layer(middleware::from_fn(add_request_id))
        .layer(middleware_stack)
        .with_state(state))
}

async fn add_request_id(mut request: Request, next: Next) -> Response {
    let request_id = uuid::Uuid::new_v4().to_string();
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        request.headers_mut().insert("x-request-id", value.clone());
        let mut response = next.run(request).await;
        response.headers_mut().insert("x-request-id", value);
        return response;
    }
    next.run(request).await
}

async fn require_bearer(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    if let Some(token) = state.config.auth_token.as_deref() {
        let expected = format!("Bearer {token}");
        let presented = request
            .headers()
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok());
        if presented != Some(expected.as_str()) {
            debug!(path = %request.uri().path(), "rejected request without valid bearer token");
            return Err(ApiError::Unauthorized);
        }
    }
    Ok(next.run(request).await)
}

pub async fn health_check() -> &'static str {
    "ok"
}

pub async fn list_speakers(State(state): State<AppState>) -> Json<BTreeMap<String, SpeakerId>> {
    Json(state.driver.speakers())
}

pub async fn synthesise(
    State(state): State<AppState>,
    Json(params): Json<SynthesisApiParams>,
) -> Result<Response, ApiError> {
    state.request_count.fetch_add(1, Ordering::Relaxed);
    let started = Instant::now();
    let endpoint = state.metrics.synthesise.clone();

    let result = synthesise_inner(&state, params).await;
    endpoint.record_request(started.elapsed().as_millis() as u64);
    if result.is_err() {
        endpoint.record_error();
    }
    result
}

async fn synthesise_inner(state: &AppState, params: SynthesisApiParams) -> Result<Response, ApiError> {
    let (request, format) = validate_synthesis_request(params, state.driver.voice_config())?;
    let guard = CancelOnDrop(request.cancel.clone());

    let driver = state.driver.clone();
    let outcome = tokio::task::spawn_blocking(move || driver.synthesize(&request))
        .await
        .map_err(|e| ApiError::InternalError(format!("Task join error: {e}")))?;
    drop(guard);

    let (samples, result) = match outcome {
        Ok(done) => done,
        Err(e) => {
            state.metrics.synthesis.record_failure(e.is_cancellation());
            return Err(e.into());
        }
    };
    state.metrics.synthesis.record_result(&result);

    let sample_rate = state.driver.sample_rate();
    let channels = state.driver.channels();
    match format {
        AudioFormat::Wav => {
            let bytes = wav::wav_bytes(&samples, sample_rate, channels)?;
            Ok(([(header::CONTENT_TYPE, "audio/wav")], bytes).into_response())
        }
        AudioFormat::Pcm => Ok((
            [
                (header::CONTENT_TYPE, "audio/raw".to_string()),
                (header::HeaderName::from_static("x-sample-rate"), sample_rate.to_string()),
            ],
            wav::pcm_bytes(&samples),
        )
            .into_response()),
        AudioFormat::Json => {
            let audio_base64 = wav::encode_wav_base64(&samples, sample_rate, channels)?;
            let frames = samples.len() as u64 / channels.max(1) as u64;
            Ok(Json(SynthesisResponse {
                audio_base64,
                duration_ms: frames * 1000 / sample_rate.max(1) as u64,
                sample_rate,
                real_time_factor: result.real_time_factor,
            })
            .into_response())
        }
    }
}

pub async fn stream_ws(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    state.request_count.fetch_add(1, Ordering::Relaxed);
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(mut socket: WebSocket, state: AppState) {
    debug!("stream connection opened");
    while let Some(message) = socket.recv().await {
        let text = match message {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) | Err(_) => break,
            // Binary, ping and pong frames carry no requests.
            Ok(_) => continue,
        };

        let started = Instant::now();
        let endpoint = state.metrics.stream.clone();
        let outcome = stream_one(&mut socket, &state, text.as_str()).await;
        endpoint.record_request(started.elapsed().as_millis() as u64);

        match outcome {
            StreamOutcome::Done => {}
            StreamOutcome::Failed(reason) => {
                endpoint.record_error();
                let reply = Message::Text(format!("ERROR: {reason}").into());
                if socket.send(reply).await.is_err() {
                    break;
                }
            }
            StreamOutcome::Disconnected => {
                endpoint.record_error();
                break;
            }
        }
    }
    debug!("stream connection closed");
}

enum StreamOutcome {
    Done,
    Failed(String),
    Disconnected,
}

/// Synthesize one stream request, forwarding PCM as binary frames.
async fn stream_one(socket: &mut WebSocket, state: &AppState, message: &str) -> StreamOutcome {
    let request = match parse_stream_message(message)
        .and_then(|p| validate_synthesis_request(p, state.driver.voice_config()))
    {
        Ok((request, _)) => request,
        Err(ApiError::InvalidInput(msg)) => return StreamOutcome::Failed(msg),
        Err(e) => return StreamOutcome::Failed(e.to_string()),
    };

    let cancel = request.cancel.clone();
    let (tx, mut rx) = mpsc::channel::<Vec<i16>>(STREAM_CHANNEL_CAPACITY);
    let driver = state.driver.clone();
    let task = tokio::task::spawn_blocking(move || {
        run_streaming(&driver, &request, tx)
    });

    let mut disconnected = false;
    while let Some(chunk) = rx.recv().await {
        if socket
            .send(Message::Binary(wav::pcm_bytes(&chunk).into()))
            .await
            .is_err()
        {
            cancel.cancel();
            disconnected = true;
            break;
        }
    }
    // Unblocks a producer waiting on a full channel.
    drop(rx);

    let outcome = match task.await {
        Ok(outcome) => outcome,
        Err(e) => {
            warn!("stream task join error: {e}");
            return StreamOutcome::Failed("Failed to synthesise".to_string());
        }
    };
    match outcome {
        Ok(result) => {
            state.metrics.synthesis.record_result(&result);
            if disconnected {
                StreamOutcome::Disconnected
            } else {
                StreamOutcome::Done
            }
        }
        Err(e) => {
            state.metrics.synthesis.record_failure(e.is_cancellation());
            if disconnected {
                StreamOutcome::Disconnected
            } else {
                StreamOutcome::Failed("Failed to synthesise".to_string())
            }
        }
    }
}

fn run_streaming(
    driver: &SynthesisDriver,
    request: &SynthesisRequest,
    tx: mpsc::Sender<Vec<i16>>,
) -> tts_core::Result<SynthesisResult> {
    let cancel = request.cancel.clone();
    let mut sink = |samples: &[i16]| {
        if samples.is_empty() || cancel.is_cancelled() {
            return;
        }
        if tx.blocking_send(samples.to_vec()).is_err() {
            cancel.cancel();
        }
    };
    driver.synthesize_streaming(request, &mut sink)
}

pub async fn metrics_endpoint(State(state): State<AppState>) -> Json<DetailedMetricsResponse> {
    let mut system = sysinfo::System::new();
    system.refresh_cpu();
    system.refresh_memory();

    let cpu_usage = system.global_cpu_info().cpu_usage();
    let memory_used = system.used_memory();
    let memory_total = system.total_memory();
    let memory_usage_percent = if memory_total > 0 {
        (memory_used as f64 / memory_total as f64 * 100.0) as f32
    } else {
        0.0
    };

    let uptime = START_TIME.get().map(|start| start.elapsed().as_secs()).unwrap_or(0);

    let system_load = {
        #[cfg(unix)]
        {
            std::fs::read_to_string("/proc/loadavg")
                .ok()
                .and_then(|l| l.split_whitespace().next().and_then(|s| s.parse::<f64>().ok()))
        }
        #[cfg(not(unix))]
        None
    };

    Json(DetailedMetricsResponse {
        timestamp: chrono::Utc::now(),
        system: SystemMetrics {
            cpu_usage_percent: cpu_usage,
            memory_used_mb: memory_used / 1024 / 1024,
            memory_total_mb: memory_total / 1024 / 1024,
            memory_usage_percent,
            request_count: state.request_count.load(Ordering::Relaxed),
            uptime_seconds: uptime,
            system_load,
        },
        endpoints: EndpointMetricsResponse {
            synthesise: state.metrics.synthesise.snapshot(),
            stream: state.metrics.stream.snapshot(),
        },
        synthesis: state.metrics.synthesis.snapshot(),
    })
}
