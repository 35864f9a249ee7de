mod attachments;
mod config;
mod delivery;
mod identity;
mod messaging;
#[cfg(feature = "metrics")]
mod metrics;
mod presence;
mod profiles;
mod rate_limit;
mod registry;
mod store;
#[cfg(test)]
mod testing;

const REQUEST_ID_HEADER: &str = "x-request-id";
const CONTENT_SECURITY_POLICY: &str =
    "default-src 'none'; frame-ancestors 'none'; base-uri 'none'; form-action 'self'";
const REFERRER_POLICY: &str = "no-referrer";
const X_CONTENT_TYPE_OPTIONS: &str = "nosniff";
const X_FRAME_OPTIONS: &str = "DENY";
const TASK_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

#[cfg(feature = "metrics")]
use anyhow::Context;
use anyhow::Result;
use axum::{
    body::HttpBody,
    extract::{DefaultBodyLimit, MatchedPath, State},
    http::{
        header::{HeaderName, AUTHORIZATION, CONTENT_TYPE},
        HeaderValue, Method,
    },
    routing::{get, post, put},
    Json, Router,
};
#[cfg(feature = "metrics")]
use axum::{http::StatusCode, response::IntoResponse};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
#[cfg(feature = "metrics")]
use std::{
    future::Future,
    pin::Pin,
    task::{Context as TaskContext, Poll},
};
use std::{
    net::SocketAddr,
    sync::Arc,
    time::{Duration, Instant},
};
#[cfg(test)]
use tokio::sync::Notify;
use tokio::{net::TcpListener, signal, sync::watch};
use tower::ServiceBuilder;
use tower_http::{
    cors::{AllowOrigin, CorsLayer},
    propagate_header::PropagateHeaderLayer,
    request_id::{MakeRequestUuid, RequestId, SetRequestIdLayer},
    services::ServeDir,
    set_header::SetResponseHeaderLayer,
    trace::TraceLayer,
};
use tracing::field::{Field, Visit};
use tracing::{error, info, warn, Event, Subscriber};
use tracing_subscriber::fmt::{
    format::Format as FmtFormat, format::Writer as FmtWriter, writer::MakeWriter, FmtContext,
    FormatEvent, FormatFields,
};
use tracing_subscriber::layer::{Context as LayerContext, SubscriberExt};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::{EnvFilter, Layer};

#[cfg(test)]
use once_cell::sync::Lazy;
#[cfg(test)]
use std::sync::Mutex;

use parley_crypto::{encode_key, generate_signing_key, verifying_key_from};
use parley_media::{object_store_from_config, MediaBackend};
use parley_storage::{connect, migrate, StoragePool};
use uuid::Uuid;

#[cfg(feature = "metrics")]
use crate::metrics::MetricsContext;
use crate::{
    config::{CliOverrides, LogFormat, ServerConfig},
    identity::{IdentityService, TokenAuthority},
    messaging::{start_engine, EngineComponents, EngineSettings, MessagingEngine},
    profiles::init_profile_directory,
    rate_limit::SendRateLimiter,
    store::init_message_store,
};

#[derive(Clone)]
struct StorageState {
    status: StorageStatus,
    pool: Option<StoragePool>,
}

#[derive(Clone)]
enum StorageStatus {
    Unconfigured,
    Connected,
    Error(String),
}

impl StorageState {
    fn unconfigured() -> Self {
        Self {
            status: StorageStatus::Unconfigured,
            pool: None,
        }
    }

    #[cfg(test)]
    fn connected() -> Self {
        Self {
            status: StorageStatus::Connected,
            pool: None,
        }
    }

    fn connected_with_pool(pool: StoragePool) -> Self {
        Self {
            status: StorageStatus::Connected,
            pool: Some(pool),
        }
    }

    fn error(message: String) -> Self {
        Self {
            status: StorageStatus::Error(message),
            pool: None,
        }
    }

    fn component(&self) -> ComponentStatus {
        match &self.status {
            StorageStatus::Unconfigured => ComponentStatus {
                name: "database",
                status: "pending",
                details: Some("database_url not configured; using in-memory store".to_string()),
            },
            StorageStatus::Connected => ComponentStatus {
                name: "database",
                status: "configured",
                details: Some("connection established".to_string()),
            },
            StorageStatus::Error(message) => ComponentStatus {
                name: "database",
                status: "error",
                details: Some(message.clone()),
            },
        }
    }

    fn readiness_status(&self) -> &'static str {
        match self.status {
            StorageStatus::Connected => "ready",
            StorageStatus::Unconfigured | StorageStatus::Error(_) => "degraded",
        }
    }

    fn pool(&self) -> Option<StoragePool> {
        self.pool.clone()
    }
}

#[derive(Parser, Debug, Default)]
#[command(
    name = "parley-server",
    version,
    about = "Parley messaging and presence server"
)]
struct Cli {
    #[command(flatten)]
    config: ConfigArgs,
    #[command(subcommand)]
    command: Option<CliCommand>,
}

#[derive(Args, Debug, Default, Clone)]
struct ConfigArgs {
    #[arg(long)]
    bind_addr: Option<String>,
    #[arg(long)]
    host: Option<String>,
    #[arg(long)]
    port: Option<u16>,
    #[arg(long)]
    log_format: Option<LogFormat>,
    #[arg(long)]
    metrics_enabled: Option<bool>,
    #[arg(long)]
    metrics_bind_addr: Option<String>,
    #[arg(long)]
    database_url: Option<String>,
    #[arg(long)]
    identity_signing_key: Option<String>,
    #[arg(long)]
    media_base_dir: Option<String>,
}

impl ConfigArgs {
    fn into_overrides(self) -> CliOverrides {
        CliOverrides {
            bind_addr: self.bind_addr,
            host: self.host,
            port: self.port,
            log_format: self.log_format,
            metrics_enabled: self.metrics_enabled,
            metrics_bind_addr: self.metrics_bind_addr,
            database_url: self.database_url,
            identity_signing_key: self.identity_signing_key,
            media_base_dir: self.media_base_dir,
        }
    }
}

#[derive(Subcommand, Debug)]
enum CliCommand {
    /// Print a signed access token for a user.
    IssueToken(IssueTokenCommand),
    /// Generate an ed25519 key pair for `identity.signing_key`.
    GenerateSigningKey,
}

#[derive(Args, Debug)]
struct IssueTokenCommand {
    /// User to issue the token for; a fresh id is generated when omitted.
    #[arg(long)]
    user_id: Option<Uuid>,
}

#[derive(Serialize)]
struct IssuedTokenOutput {
    user_id: Uuid,
    token: String,
    expires_at: chrono::DateTime<chrono::Utc>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let overrides = cli.config.clone().into_overrides();
    let mut config = ServerConfig::load()?;
    config.apply_overrides(&overrides)?;

    if let Some(command) = cli.command {
        return run_command(&config, command);
    }

    let config = Arc::new(config);
    run(config).await
}

fn run_command(config: &ServerConfig, command: CliCommand) -> Result<()> {
    match command {
        CliCommand::IssueToken(cmd) => issue_token(config, cmd),
        CliCommand::GenerateSigningKey => {
            let signing_key = generate_signing_key();
            println!("signing_key = {}", encode_key(&signing_key.to_bytes()));
            println!(
                "verifying_key = {}",
                encode_key(verifying_key_from(&signing_key).as_bytes())
            );
            Ok(())
        }
    }
}

fn issue_token(config: &ServerConfig, cmd: IssueTokenCommand) -> Result<()> {
    if config.identity.signing_key.is_none() {
        anyhow::bail!("identity.signing_key must be configured to issue tokens the server accepts");
    }
    let authority = TokenAuthority::from_config(&config.identity)?;
    let user_id = cmd.user_id.unwrap_or_else(Uuid::new_v4);
    let issued = authority.issue(user_id)?;
    let output = IssuedTokenOutput {
        user_id,
        token: issued.token,
        expires_at: issued.expires_at,
    };
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

async fn connect_storage(config: &ServerConfig) -> StorageState {
    let Some(url) = config.database_url.as_deref() else {
        return StorageState::unconfigured();
    };

    let pool = match connect(url, config.database_max_connections).await {
        Ok(pool) => pool,
        Err(err) => {
            error!(?err, "failed to establish database connection");
            return StorageState::error(err.to_string());
        }
    };
    match migrate(&pool).await {
        Ok(()) => {
            info!("database connection established and migrations applied");
            StorageState::connected_with_pool(pool)
        }
        Err(err) => {
            error!(?err, "failed to apply database migrations");
            StorageState::error(format!("migrations failed: {err}"))
        }
    }
}

async fn run(config: Arc<ServerConfig>) -> Result<()> {
    init_tracing(&config);

    let env_override_keys = ServerConfig::environment_override_keys();
    if env_override_keys.is_empty() {
        info!("no PARLEY_SERVER environment overrides detected");
    } else {
        info!(keys = ?env_override_keys, "detected PARLEY_SERVER environment overrides");
    }

    info!(
        bind_addr = ?config.bind_addr,
        host = %config.host,
        port = config.port,
        log_format = config.log_format.as_str(),
        metrics_enabled = config.metrics.enabled,
        metrics_bind_addr = ?config.metrics.bind_addr,
        database_url_configured = config.database_url.is_some(),
        identity_signing_key_configured = config.identity.signing_key.is_some(),
        fanout_to_sender = config.messaging.fanout_to_sender,
        max_websocket_connections = config.messaging.max_websocket_connections,
        attachment_workers = config.attachments.workers,
        media_backend = ?config.media.backend,
        "resolved server configuration"
    );

    let storage = connect_storage(&config).await;

    let identity = TokenAuthority::from_config(&config.identity)?;
    if config.identity.signing_key.is_some() {
        info!(
            verifying_key = %identity.verifying_key_base64(),
            fallback_keys = config.identity.fallback_verifying_keys.len(),
            "identity signing key loaded from configuration"
        );
    } else {
        warn!(
            verifying_key = %identity.verifying_key_base64(),
            "no identity signing key supplied; generated ephemeral key"
        );
    }

    let object_store = object_store_from_config(&config.media).await?;

    #[cfg(feature = "metrics")]
    let metrics_ctx = if config.metrics.enabled {
        Some(MetricsContext::init()?)
    } else {
        None
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let purge_shutdown = shutdown_rx.clone();
    let (engine, mut tasks) = start_engine(
        EngineComponents {
            store: init_message_store(storage.pool()),
            profiles: init_profile_directory(storage.pool()),
            object_store,
            #[cfg(feature = "metrics")]
            metrics: metrics_ctx.clone(),
        },
        EngineSettings::from_config(&config),
        shutdown_rx,
    );

    let state = AppState::new(config.clone(), storage, engine, Arc::new(identity));
    tasks.push(state.send_limiter().spawn_purge(purge_shutdown));
    #[cfg(feature = "metrics")]
    let state = state.with_metrics(metrics_ctx);

    #[cfg(feature = "metrics")]
    {
        if config.metrics.enabled {
            if let Some(bind_addr) = &config.metrics.bind_addr {
                let metrics_addr: SocketAddr = bind_addr
                    .parse()
                    .context("failed to parse metrics bind addr")?;
                let state = state.clone();
                tokio::spawn(async move {
                    if let Err(err) = serve_metrics(metrics_addr, state).await {
                        error!(?err, "metrics server terminated unexpectedly");
                    }
                });
            }
        }
    }

    let app = build_app(state);

    let addr: SocketAddr = config.listener_addr()?;
    let listener = TcpListener::bind(addr).await?;
    info!("listening on {addr}");

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    let _ = shutdown_tx.send(true);
    if tokio::time::timeout(TASK_DRAIN_TIMEOUT, futures::future::join_all(tasks))
        .await
        .is_err()
    {
        warn!("background tasks did not stop in time");
    }

    Ok(())
}

#[derive(Clone)]
struct AppState {
    started_at: Instant,
    config: Arc<ServerConfig>,
    storage: StorageState,
    engine: Arc<MessagingEngine>,
    identity: Arc<dyn IdentityService>,
    send_limiter: SendRateLimiter,
    #[cfg(feature = "metrics")]
    metrics: Option<Arc<MetricsContext>>,
}

impl AppState {
    fn new(
        config: Arc<ServerConfig>,
        storage: StorageState,
        engine: Arc<MessagingEngine>,
        identity: Arc<dyn IdentityService>,
    ) -> Self {
        let send_limiter = SendRateLimiter::per_minute(config.messaging.send_rate_per_minute);
        Self {
            started_at: Instant::now(),
            config,
            storage,
            engine,
            identity,
            send_limiter,
            #[cfg(feature = "metrics")]
            metrics: None,
        }
    }

    #[cfg(test)]
    fn with_start_time(mut self, started_at: Instant) -> Self {
        self.started_at = started_at;
        self
    }

    #[cfg(feature = "metrics")]
    fn with_metrics(mut self, metrics: Option<Arc<MetricsContext>>) -> Self {
        self.metrics = metrics;
        self
    }

    fn uptime_seconds(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }

    fn engine(&self) -> Arc<MessagingEngine> {
        self.engine.clone()
    }

    fn identity(&self) -> Arc<dyn IdentityService> {
        self.identity.clone()
    }

    fn send_limiter(&self) -> &SendRateLimiter {
        &self.send_limiter
    }

    #[cfg(feature = "metrics")]
    fn metrics_enabled(&self) -> bool {
        self.config.metrics.enabled
    }

    #[cfg(feature = "metrics")]
    fn metrics(&self) -> Option<Arc<MetricsContext>> {
        self.metrics.clone()
    }
}

async fn health() -> &'static str {
    "ok"
}

async fn readiness(State(state): State<AppState>) -> Json<ReadinessResponse> {
    let engine = state.engine();
    let components = vec![
        state.storage.component(),
        ComponentStatus {
            name: "connections",
            status: "configured",
            details: Some(format!(
                "{} live connections",
                engine.registry().connection_count().await
            )),
        },
    ];

    Json(ReadinessResponse {
        status: state.storage.readiness_status(),
        uptime_seconds: state.uptime_seconds(),
        components,
    })
}

fn init_tracing(config: &ServerConfig) {
    // Respect RUST_LOG if set, otherwise default to info for our crates.
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,parley_server=info,parley=info"));

    let json = matches!(config.log_format(), LogFormat::Json);
    let subscriber = build_subscriber(json, env_filter);

    if let Err(err) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("failed to install tracing subscriber: {err}");
    }
}

async fn shutdown_signal() {
    #[cfg(test)]
    {
        let notify_opt = TEST_SHUTDOWN_NOTIFY.lock().unwrap().clone();
        if let Some(notify) = notify_opt {
            tokio::select! {
                res = signal::ctrl_c() => {
                    if let Err(e) = res {
                        error!(?e, "failed to install Ctrl+C handler");
                    }
                }
                _ = notify.notified() => {}
            }
            info!("shutdown signal received");
            *TEST_SHUTDOWN_NOTIFY.lock().unwrap() = None;
            return;
        }
    }

    if let Err(e) = signal::ctrl_c().await {
        error!(?e, "failed to install Ctrl+C handler");
    }
    info!("shutdown signal received");
}

#[derive(Serialize)]
struct VersionResponse {
    version: &'static str,
}

async fn version() -> Json<VersionResponse> {
    Json(VersionResponse {
        version: env!("CARGO_PKG_VERSION"),
    })
}

fn cors_layer(config: &ServerConfig) -> Option<CorsLayer> {
    if config.cors_allowed_origins.is_empty() {
        return None;
    }
    let origins: Vec<HeaderValue> = config
        .cors_allowed_origins
        .iter()
        .filter_map(|origin| HeaderValue::from_str(origin).ok())
        .collect();

    Some(
        CorsLayer::new()
            .allow_origin(AllowOrigin::list(origins))
            .allow_methods([Method::GET, Method::POST, Method::PUT])
            .allow_headers([AUTHORIZATION, CONTENT_TYPE, HeaderName::from_static("token")]),
    )
}

fn build_app(state: AppState) -> Router {
    #[cfg(feature = "metrics")]
    let expose_metrics_here = state.metrics_enabled() && state.config.metrics.bind_addr.is_none();
    #[cfg(feature = "metrics")]
    let metrics_ctx = state.metrics();

    let client_v1_routes = Router::new()
        .route(
            "/messages/send/{receiver_id}",
            post(messaging::send_message),
        )
        .route("/messages/unseen", get(messaging::unseen_counts))
        .route("/messages/mark/{message_id}", put(messaging::mark_seen))
        .route("/messages/{peer_id}", get(messaging::history))
        .route("/presence/online", get(messaging::online_users))
        .route("/profile/avatar", put(messaging::update_avatar))
        .route("/ws", get(messaging::socket));

    let mut router = Router::new()
        .route("/health", get(health))
        .route("/ready", get(readiness))
        .route("/version", get(version));

    #[cfg(feature = "metrics")]
    {
        if expose_metrics_here {
            router = router.route("/metrics", get(metrics_handler));
        }
    }

    if state.config.media.backend == MediaBackend::Local {
        router = router.nest_service("/media", ServeDir::new(&state.config.media.base_dir));
    }

    // Keep legacy paths while exposing the same handlers under a versioned prefix.
    router = router.merge(client_v1_routes.clone());
    router = router.nest("/client/v1", client_v1_routes);

    router = router.layer(DefaultBodyLimit::max(
        state.config.attachments.request_body_limit(),
    ));
    if let Some(cors) = cors_layer(&state.config) {
        router = router.layer(cors);
    }

    let request_id_header = HeaderName::from_static(REQUEST_ID_HEADER);

    let trace_layer = TraceLayer::new_for_http()
        .make_span_with(HttpSpanMaker)
        .on_response(HttpOnResponse::new());

    let builder = ServiceBuilder::new()
        .layer(SetResponseHeaderLayer::if_not_present(
            HeaderName::from_static("content-security-policy"),
            HeaderValue::from_static(CONTENT_SECURITY_POLICY),
        ))
        .layer(SetResponseHeaderLayer::if_not_present(
            HeaderName::from_static("referrer-policy"),
            HeaderValue::from_static(REFERRER_POLICY),
        ))
        .layer(SetResponseHeaderLayer::if_not_present(
            HeaderName::from_static("x-content-type-options"),
            HeaderValue::from_static(X_CONTENT_TYPE_OPTIONS),
        ))
        .layer(SetResponseHeaderLayer::if_not_present(
            HeaderName::from_static("x-frame-options"),
            HeaderValue::from_static(X_FRAME_OPTIONS),
        ))
        // The id is assigned outside propagation so generated ids reach the response too.
        .layer(SetRequestIdLayer::new(request_id_header.clone(), MakeRequestUuid))
        .layer(PropagateHeaderLayer::new(request_id_header))
        .layer(trace_layer);

    #[cfg(feature = "metrics")]
    let builder = builder.layer(MetricsRecorderLayer::new(metrics_ctx));

    let router = router.layer(builder.into_inner());

    router.with_state(state)
}

#[derive(Clone, Default)]
struct HttpSpanMaker;

impl<B> tower_http::trace::MakeSpan<B> for HttpSpanMaker
where
    B: HttpBody + Send + 'static,
    B::Data: Send,
{
    fn make_span(&mut self, request: &axum::http::Request<B>) -> tracing::Span {
        let method = request.method().clone();
        let uri_path = request.uri().path().to_string();
        let route = request
            .extensions()
            .get::<MatchedPath>()
            .map(|matched| matched.as_str().to_string())
            .unwrap_or_else(|| uri_path.clone());
        let request_id = request
            .extensions()
            .get::<RequestId>()
            .and_then(|rid| rid.header_value().to_str().ok())
            .map(|value| value.to_owned())
            .unwrap_or_else(|| "unknown".to_string());

        tracing::info_span!(
            "http.request",
            method = %method,
            route = %route,
            request_id = %request_id,
            status_code = tracing::field::Empty,
            latency_ms = tracing::field::Empty
        )
    }
}

#[derive(Clone, Default)]
struct HttpOnResponse;

impl HttpOnResponse {
    fn new() -> Self {
        Self
    }
}

impl<B> tower_http::trace::OnResponse<B> for HttpOnResponse
where
    B: HttpBody + Send + 'static,
    B::Data: Send,
{
    fn on_response(
        self,
        response: &axum::http::Response<B>,
        latency: Duration,
        span: &tracing::Span,
    ) {
        let latency_ms = latency.as_secs_f64() * 1000.0;
        let status = response.status().as_u16();
        let request_id = response
            .headers()
            .get(REQUEST_ID_HEADER)
            .and_then(|value| value.to_str().ok())
            .unwrap_or("unknown");

        span.record("status_code", tracing::field::display(status));
        span.record("latency_ms", tracing::field::display(latency_ms));

        tracing::debug!(
            parent: span,
            request_id = %request_id,
            status = status,
            latency_ms,
            "request completed"
        );
    }
}

#[cfg(feature = "metrics")]
#[derive(Clone)]
struct MetricsRecorderLayer {
    metrics: Option<Arc<MetricsContext>>,
}

#[cfg(feature = "metrics")]
impl MetricsRecorderLayer {
    fn new(metrics: Option<Arc<MetricsContext>>) -> Self {
        Self { metrics }
    }
}

#[cfg(feature = "metrics")]
impl<S> tower::Layer<S> for MetricsRecorderLayer {
    type Service = MetricsRecorderService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        MetricsRecorderService {
            inner,
            metrics: self.metrics.clone(),
        }
    }
}

#[cfg(feature = "metrics")]
#[derive(Clone)]
struct MetricsRecorderService<S> {
    inner: S,
    metrics: Option<Arc<MetricsContext>>,
}

#[cfg(feature = "metrics")]
impl<S, B> tower::Service<axum::http::Request<B>> for MetricsRecorderService<S>
where
    S: tower::Service<axum::http::Request<B>, Response = axum::response::Response>,
    S::Future: Send + 'static,
    B: Send + 'static,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut TaskContext<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, request: axum::http::Request<B>) -> Self::Future {
        let metrics = self.metrics.clone();
        let route = request
            .extensions()
            .get::<MatchedPath>()
            .map(|matched| matched.as_str().to_string())
            .unwrap_or_else(|| request.uri().path().to_string());
        let start = Instant::now();

        let future = self.inner.call(request);

        Box::pin(async move {
            let response = future.await?;
            if let Some(metrics) = metrics {
                metrics.observe_http_latency(&route, response.status().as_u16(), start.elapsed());
            }
            Ok(response)
        })
    }
}

#[cfg(test)]
fn build_subscriber_with_writer<W>(
    json: bool,
    env_filter: EnvFilter,
    writer: W,
) -> Box<dyn tracing::Subscriber + Send + Sync>
where
    W: for<'a> MakeWriter<'a> + Send + Sync + Clone + 'static,
{
    build_subscriber_inner(json, env_filter, writer)
}

fn build_subscriber(
    json: bool,
    env_filter: EnvFilter,
) -> Box<dyn tracing::Subscriber + Send + Sync> {
    build_subscriber_inner(json, env_filter, std::io::stderr)
}

#[derive(Default)]
struct RequestIdStorageLayer;

#[derive(Clone)]
struct RequestIdExtension(String);

impl RequestIdExtension {
    fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Default)]
struct RequestIdVisitor {
    request_id: Option<String>,
}

impl Visit for RequestIdVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "request_id" {
            self.request_id = Some(value.to_string());
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "request_id" && self.request_id.is_none() {
            self.request_id = Some(format!("{value:?}"));
        }
    }
}

impl<S> Layer<S> for RequestIdStorageLayer
where
    S: Subscriber + for<'span> LookupSpan<'span>,
{
    fn on_new_span(
        &self,
        attrs: &tracing::span::Attributes<'_>,
        id: &tracing::Id,
        ctx: LayerContext<'_, S>,
    ) {
        if let Some(span) = ctx.span(id) {
            let mut visitor = RequestIdVisitor::default();
            attrs.record(&mut visitor);
            if let Some(request_id) = visitor.request_id {
                let request_id = request_id.trim_matches('"').to_string();
                span.extensions_mut().insert(RequestIdExtension(request_id));
            }
        }
    }
}

struct RequestIdEventFormat<E> {
    inner: E,
}

impl<E> RequestIdEventFormat<E> {
    fn new(inner: E) -> Self {
        Self { inner }
    }
}

impl<S, N, E> FormatEvent<S, N> for RequestIdEventFormat<E>
where
    S: Subscriber + for<'span> LookupSpan<'span>,
    N: for<'writer> FormatFields<'writer> + 'static,
    E: FormatEvent<S, N>,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: FmtWriter<'_>,
        event: &Event<'_>,
    ) -> std::fmt::Result {
        if let Some(span) = ctx.lookup_current() {
            if let Some(request_id) = span.extensions().get::<RequestIdExtension>() {
                write!(writer, "[request_id={}] ", request_id.as_str())?;
            }
        }

        self.inner.format_event(ctx, writer, event)
    }
}

fn build_subscriber_inner<W>(
    json: bool,
    env_filter: EnvFilter,
    make_writer: W,
) -> Box<dyn tracing::Subscriber + Send + Sync>
where
    W: for<'a> MakeWriter<'a> + Send + Sync + Clone + 'static,
{
    if json {
        let format = FmtFormat::default()
            .with_target(true)
            .with_level(true)
            .json();

        Box::new(
            tracing_subscriber::registry()
                .with(env_filter)
                .with(RequestIdStorageLayer)
                .with(
                    tracing_subscriber::fmt::layer()
                        .json()
                        .event_format(RequestIdEventFormat::new(format))
                        .with_writer(make_writer),
                ),
        )
    } else {
        let format = FmtFormat::default().with_target(true).with_level(true);

        Box::new(
            tracing_subscriber::registry()
                .with(env_filter)
                .with(RequestIdStorageLayer)
                .with(
                    tracing_subscriber::fmt::layer()
                        .event_format(RequestIdEventFormat::new(format))
                        .with_writer(make_writer),
                ),
        )
    }
}

#[cfg(test)]
static TEST_SHUTDOWN_NOTIFY: Lazy<Mutex<Option<Arc<Notify>>>> = Lazy::new(|| Mutex::new(None));

#[cfg(test)]
fn install_shutdown_trigger() -> Arc<Notify> {
    let notify = Arc::new(Notify::new());
    *TEST_SHUTDOWN_NOTIFY.lock().unwrap() = Some(notify.clone());
    notify
}

#[derive(Serialize)]
struct ReadinessResponse {
    status: &'static str,
    uptime_seconds: u64,
    components: Vec<ComponentStatus>,
}

#[derive(Serialize)]
struct ComponentStatus {
    name: &'static str,
    status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<String>,
}

#[cfg(feature = "metrics")]
async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    if !state.metrics_enabled() {
        return StatusCode::NOT_FOUND.into_response();
    }

    let Some(metrics) = state.metrics() else {
        return StatusCode::NOT_FOUND.into_response();
    };

    let engine = state.engine();
    metrics.set_presence(
        engine.online_users().await.len(),
        engine.registry().connection_count().await,
    );
    metrics.set_jobs_in_flight(engine.pipeline().in_flight_count().await);

    match metrics.encode() {
        Ok(body) => (
            StatusCode::OK,
            [(CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        Err(err) => {
            tracing::error!(?err, "failed to encode metrics");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

#[cfg(feature = "metrics")]
fn build_metrics_router(state: AppState) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

#[cfg(feature = "metrics")]
async fn serve_metrics(bind_addr: SocketAddr, state: AppState) -> Result<()> {
    let router = build_metrics_router(state);
    let listener = TcpListener::bind(bind_addr).await?;
    let addr = listener.local_addr()?;
    info!("metrics listening on {addr}");
    axum::serve(listener, router.into_make_service()).await?;
    Ok(())
}
