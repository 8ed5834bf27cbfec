//! Dashboard API relay
//!
//! Single-binary service that:
//! 1. Holds the dashboard's access credential (memory or file)
//! 2. Listens for dashboard API calls
//! 3. Forwards them to the REST backend with a bearer credential
//! 4. Renews an expired credential once for all concurrent calls
//! 5. Reports session end when renewal is refused

mod config;
mod metrics;
mod relay;

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use authed_client::{RefreshCoordinator, ReqwestSender, RequestPipeline, RetryPolicy};
use axum::Router;
use axum::extract::State;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use metrics_exporter_prometheus::PrometheusHandle;
use session_auth::{
    CredentialStore, FileCredentialStore, HttpRefreshTransport, MemoryCredentialStore,
    SessionEvent, SessionSignal,
};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::Config;
use crate::relay::RelayState;

/// How long in-flight requests may take to finish after a shutdown signal
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Shared application state accessible from all handlers
#[derive(Clone)]
struct AppState {
    relay: RelayState,
    store: Arc<dyn CredentialStore>,
    coordinator: RefreshCoordinator,
    started_at: Instant,
    sessions_ended: Arc<AtomicU64>,
    prometheus: PrometheusHandle,
}

/// Build the axum router with all routes and shared state.
fn build_router(state: AppState, max_connections: usize) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .fallback(relay_handler)
        .layer(tower::limit::ConcurrencyLimitLayer::new(max_connections))
        .with_state(state)
}

/// Wire store, refresh transport, coordinator and pipeline from config.
async fn build_pipeline(
    config: &Config,
    signal: &SessionSignal,
) -> Result<(Arc<RequestPipeline>, Arc<dyn CredentialStore>)> {
    let backend = &config.backend;

    let store: Arc<dyn CredentialStore> = match &backend.credential_file {
        Some(path) => {
            let store = FileCredentialStore::load(path.clone())
                .await
                .with_context(|| format!("failed to load credential file {}", path.display()))?;
            info!(path = %store.path().display(), "credentials persisted to file");
            Arc::new(store)
        }
        None => {
            info!("credentials held in memory only");
            Arc::new(MemoryCredentialStore::new())
        }
    };

    let client = reqwest::Client::new();
    let transport = Arc::new(HttpRefreshTransport::new(
        client.clone(),
        backend.refresh_url(),
        backend.session_cookie.clone(),
    ));
    info!(
        endpoint = transport.endpoint(),
        session_cookie = backend.session_cookie.is_some(),
        "refresh transport ready"
    );
    let coordinator = RefreshCoordinator::new(
        store.clone(),
        transport,
        Arc::new(signal.clone()),
        backend.refresh_timeout(),
    );
    let sender = Arc::new(ReqwestSender::new(
        client,
        backend.base_url.clone(),
        backend.timeout(),
    ));
    info!(base_url = sender.base_url(), timeout_secs = backend.timeout_secs, "backend sender ready");
    let policy = RetryPolicy::new(
        axum::http::StatusCode::from_u16(backend.auth_failure_status)
            .context("auth_failure_status is not a valid HTTP status")?,
    );

    let pipeline = RequestPipeline::new(sender, store.clone(), coordinator).with_policy(policy);
    Ok((Arc::new(pipeline), store))
}

/// Log every session end until the signal is dropped.
fn spawn_session_watcher(
    mut events: broadcast::Receiver<SessionEvent>,
    sessions_ended: Arc<AtomicU64>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(SessionEvent::Ended { reason }) => {
                    sessions_ended.fetch_add(1, Ordering::Relaxed);
                    warn!(reason = %reason, "dashboard session ended, sign-in required");
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "session watcher lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and LOG_LEVEL / RUST_LOG support
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("starting dashboard-relay");

    // Install Prometheus metrics recorder before any metrics are emitted
    let prometheus_handle = metrics::install_recorder();

    // CLI: simple --config flag parsing
    let args: Vec<String> = std::env::args().collect();
    let cli_config_path = args
        .iter()
        .position(|a| a == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str());

    let config_path = Config::resolve_path(cli_config_path);
    info!(path = %config_path.display(), "loading configuration");

    let config = Config::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;

    info!(
        listen_addr = %config.relay.listen_addr,
        base_url = %config.backend.base_url,
        auth_failure_status = config.backend.auth_failure_status,
        "configuration loaded"
    );

    let signal = SessionSignal::new();
    let sessions_ended = Arc::new(AtomicU64::new(0));
    let _watcher = spawn_session_watcher(signal.subscribe(), sessions_ended.clone());

    let (pipeline, store) = build_pipeline(&config, &signal).await?;
    let coordinator = pipeline.coordinator().clone();

    let app_state = AppState {
        relay: RelayState {
            pipeline,
            requests_total: Arc::new(AtomicU64::new(0)),
            errors_total: Arc::new(AtomicU64::new(0)),
        },
        store,
        coordinator,
        started_at: Instant::now(),
        sessions_ended,
        prometheus: prometheus_handle,
    };

    let app = build_router(app_state, config.relay.max_connections);
    let listen_addr = config.relay.listen_addr;
    let listener = TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind to {listen_addr}"))?;
    info!(addr = %listen_addr, "accepting requests");

    // The drain timeout starts when the shutdown signal fires, not when the
    // server starts.
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await
    });

    shutdown_signal().await;
    let _ = shutdown_tx.send(());

    match tokio::time::timeout(DRAIN_TIMEOUT, server_handle).await {
        Ok(Ok(Ok(()))) => info!("all in-flight requests drained"),
        Ok(Ok(Err(e))) => error!(error = %e, "server error during shutdown"),
        Ok(Err(e)) => error!(error = %e, "server task panicked"),
        Err(_) => warn!(
            drain_timeout_secs = DRAIN_TIMEOUT.as_secs(),
            "drain timeout exceeded, forcing shutdown"
        ),
    }

    info!("shutdown complete");
    Ok(())
}

/// Health: relay status, whether a credential is held, refresh activity.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let session_active = state.store.current().await.is_some();
    let body = serde_json::json!({
        "status": if session_active { "healthy" } else { "degraded" },
        "session": if session_active { "active" } else { "signed_out" },
        "refreshing": state.coordinator.is_refreshing(),
        "refreshes": state.coordinator.refresh_count(),
        "sessions_ended": state.sessions_ended.load(Ordering::Relaxed),
        "uptime_seconds": state.started_at.elapsed().as_secs(),
        "requests_served": state.relay.requests_total.load(Ordering::Relaxed),
        "errors_total": state.relay.errors_total.load(Ordering::Relaxed),
    });

    (
        axum::http::StatusCode::OK,
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
}

/// Prometheus metrics endpoint in text exposition format.
async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    (
        axum::http::StatusCode::OK,
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        state.prometheus.render(),
    )
}

/// Catch-all handler that relays everything else to the backend.
async fn relay_handler(
    State(state): State<AppState>,
    request: axum::http::Request<axum::body::Body>,
) -> Response {
    let request_id = format!("req_{}", uuid::Uuid::new_v4().as_simple());
    relay::relay_request(&state.relay, request, request_id).await
}

/// Wait for SIGTERM or SIGINT for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{HeaderMap, Request, StatusCode};
    use axum::routing::post;
    use std::sync::atomic::AtomicUsize;
    use tower::ServiceExt;

    fn test_prometheus_handle() -> PrometheusHandle {
        metrics_exporter_prometheus::PrometheusBuilder::new()
            .build_recorder()
            .handle()
    }

    /// Fake dashboard backend.
    ///
    /// `POST /auth/refresh` issues `T2` for cookie `sid=good` and 401s
    /// otherwise. Every other path echoes method, path and authorization,
    /// but only for `Bearer T2`; anything else gets 401.
    async fn start_backend() -> (String, Arc<AtomicUsize>) {
        let refreshes = Arc::new(AtomicUsize::new(0));
        let counter = refreshes.clone();

        let app = axum::Router::new()
            .route(
                "/auth/refresh",
                post(move |headers: HeaderMap| {
                    let counter = counter.clone();
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        let cookie = headers
                            .get("cookie")
                            .and_then(|v| v.to_str().ok())
                            .unwrap_or("");
                        if cookie == "sid=good" {
                            (StatusCode::OK, r#"{"accessToken":"T2"}"#.to_string())
                        } else {
                            (StatusCode::UNAUTHORIZED, "session expired".to_string())
                        }
                    }
                }),
            )
            .fallback(|request: Request<Body>| async move {
                let authorization = request
                    .headers()
                    .get("authorization")
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or("")
                    .to_string();
                if authorization != "Bearer T2" {
                    return (
                        StatusCode::UNAUTHORIZED,
                        axum::Json(serde_json::json!({"error": "token expired"})),
                    );
                }
                if request.uri().path() == "/courses/missing" {
                    return (
                        StatusCode::NOT_FOUND,
                        axum::Json(serde_json::json!({"error": "no such course"})),
                    );
                }
                let cookie = request
                    .headers()
                    .get("cookie")
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or("")
                    .to_string();
                (
                    StatusCode::OK,
                    axum::Json(serde_json::json!({
                        "method": request.method().to_string(),
                        "path": request.uri().path(),
                        "query": request.uri().query().unwrap_or(""),
                        "authorization": authorization,
                        "cookie": cookie,
                        "view": request
                            .headers()
                            .get("x-dashboard-view")
                            .and_then(|v| v.to_str().ok())
                            .unwrap_or(""),
                    })),
                )
            });

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{addr}"), refreshes)
    }

    fn test_config(base_url: &str, cookie: &str) -> Config {
        let mut config: Config = toml::from_str(&format!(
            r#"
[backend]
base_url = "{base_url}"

[relay]
listen_addr = "127.0.0.1:0"
"#
        ))
        .unwrap();
        config.backend.session_cookie = common::Secret::from_trimmed(cookie);
        config
    }

    async fn test_app(base_url: &str, cookie: &str, signal: &SessionSignal) -> (Router, AppState) {
        let config = test_config(base_url, cookie);
        let (pipeline, store) = build_pipeline(&config, signal).await.unwrap();
        store
            .persist(session_auth::Credential::new("T1", 1))
            .await
            .unwrap();
        let coordinator = pipeline.coordinator().clone();
        let state = AppState {
            relay: RelayState {
                pipeline,
                requests_total: Arc::new(AtomicU64::new(0)),
                errors_total: Arc::new(AtomicU64::new(0)),
            },
            store,
            coordinator,
            started_at: Instant::now(),
            sessions_ended: Arc::new(AtomicU64::new(0)),
            prometheus: test_prometheus_handle(),
        };
        (build_router(state.clone(), 1000), state)
    }

    async fn json_body(response: Response) -> serde_json::Value {
        let body = axum::body::to_bytes(response.into_body(), 1024 * 1024)
            .await
            .unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn health_reports_active_session() {
        let signal = SessionSignal::new();
        let (app, _) = test_app("http://127.0.0.1:9", "sid=good", &signal).await;

        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let json = json_body(response).await;
        assert_eq!(json["status"], "healthy");
        assert_eq!(json["session"], "active");
        assert_eq!(json["refreshes"], 0);
    }

    #[tokio::test]
    async fn metrics_endpoint_serves_text_format() {
        let signal = SessionSignal::new();
        let (app, _) = test_app("http://127.0.0.1:9", "sid=good", &signal).await;

        let response = app
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(
            response.headers()["content-type"]
                .to_str()
                .unwrap()
                .starts_with("text/plain")
        );
    }

    #[tokio::test]
    async fn expired_credential_is_renewed_transparently() {
        let (base_url, refreshes) = start_backend().await;
        let signal = SessionSignal::new();
        let (app, state) = test_app(&base_url, "sid=good", &signal).await;

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/courses?page=2")
                    .header("authorization", "Bearer from-browser")
                    .header("cookie", "sid=browser")
                    .header("x-dashboard-view", "table")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let json = json_body(response).await;
        assert_eq!(json["path"], "/courses");
        assert_eq!(json["query"], "page=2");
        assert_eq!(json["authorization"], "Bearer T2");
        assert_eq!(json["cookie"], "", "client cookie must not be forwarded");
        assert_eq!(json["view"], "table");

        assert_eq!(refreshes.load(Ordering::SeqCst), 1);
        assert_eq!(state.store.current().await.unwrap().access_token, "T2");
    }

    #[tokio::test]
    async fn concurrent_requests_share_one_refresh() {
        let (base_url, refreshes) = start_backend().await;
        let signal = SessionSignal::new();
        let (app, _) = test_app(&base_url, "sid=good", &signal).await;

        let mut handles = Vec::new();
        for i in 0..5 {
            let app = app.clone();
            handles.push(tokio::spawn(async move {
                app.oneshot(
                    Request::builder()
                        .uri(format!("/trips/{i}"))
                        .body(Body::empty())
                        .unwrap(),
                )
                .await
                .unwrap()
            }));
        }
        for handle in handles {
            assert_eq!(handle.await.unwrap().status(), StatusCode::OK);
        }
        assert_eq!(refreshes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn backend_errors_are_relayed_verbatim() {
        let (base_url, _) = start_backend().await;
        let signal = SessionSignal::new();
        let (app, state) = test_app(&base_url, "sid=good", &signal).await;
        state
            .store
            .persist(session_auth::Credential::new("T2", 2))
            .await
            .unwrap();

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/courses/missing")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let json = json_body(response).await;
        assert_eq!(json["error"], "no such course");
        assert_eq!(state.coordinator.refresh_count(), 0);
    }

    #[tokio::test]
    async fn rejected_refresh_ends_session() {
        let (base_url, refreshes) = start_backend().await;
        let signal = SessionSignal::new();
        let mut events = signal.subscribe();
        let (app, state) = test_app(&base_url, "sid=revoked", &signal).await;

        let response = app
            .clone()
            .oneshot(Request::builder().uri("/orders").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let json = json_body(response).await;
        assert_eq!(json["error"]["type"], "session_expired");
        assert!(
            json["error"]["request_id"]
                .as_str()
                .unwrap()
                .starts_with("req_")
        );

        assert_eq!(refreshes.load(Ordering::SeqCst), 1);
        assert!(state.store.current().await.is_none());
        assert!(matches!(
            events.recv().await.unwrap(),
            SessionEvent::Ended { .. }
        ));

        let health = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let json = json_body(health).await;
        assert_eq!(json["session"], "signed_out");
        assert_eq!(json["errors_total"], 1);
    }

    #[tokio::test]
    async fn unreachable_backend_is_bad_gateway() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let signal = SessionSignal::new();
        let (app, _) = test_app(&format!("http://{addr}"), "sid=good", &signal).await;

        let response = app
            .oneshot(Request::builder().uri("/courses").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        let json = json_body(response).await;
        assert_eq!(json["error"]["type"], "upstream_error");
    }

    #[tokio::test]
    async fn session_watcher_counts_ended_sessions() {
        let signal = SessionSignal::new();
        let ended = Arc::new(AtomicU64::new(0));
        let watcher = spawn_session_watcher(signal.subscribe(), ended.clone());

        use session_auth::SessionObserver;
        signal.session_ended(&session_auth::RefreshFailure::Rejected("gone".into()));
        drop(signal);

        watcher.await.unwrap();
        assert_eq!(ended.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn file_backed_store_survives_rebuild() {
        let (base_url, _) = start_backend().await;
        let dir = tempfile::tempdir().unwrap();
        let credential_file = dir.path().join("session.json");

        let mut config = test_config(&base_url, "sid=good");
        config.backend.credential_file = Some(credential_file.clone());
        let signal = SessionSignal::new();

        let (pipeline, _) = build_pipeline(&config, &signal).await.unwrap();
        let response = pipeline
            .send(authed_client::RequestDescriptor::get("/courses"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(credential_file.exists());

        let (_, store) = build_pipeline(&config, &signal).await.unwrap();
        assert_eq!(store.current().await.unwrap().access_token, "T2");
    }
}
