use anyhow::Result;
use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use molt_ecdysis::{
    ConnectionRegistry, DrainCoordinator, ProcessRole, ProcessSupervisor, PumpOptions,
    ReloadProtocol, ShutdownOutcome,
};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer};
use tracing::{info, warn, Level};

use crate::config::ServerConfig;
use crate::telemetry::metrics;

pub mod routes;

/// Upper bound on waiting for the HTTP server task once draining is done.
const HTTP_STOP_GRACE: Duration = Duration::from_secs(5);

/// Shared application state
pub struct AppState {
    pub role: ProcessRole,
    pub registry: ConnectionRegistry,
    pub coordinator: Arc<DrainCoordinator>,
    pub pump_options: PumpOptions,
    pub banner: String,
}

impl AppState {
    pub fn new(supervisor: &ProcessSupervisor, server_config: &ServerConfig) -> Self {
        Self {
            role: supervisor.role(),
            registry: supervisor.registry().clone(),
            coordinator: Arc::clone(supervisor.coordinator()),
            pump_options: server_config.pump_options(),
            banner: server_config.banner(),
        }
    }
}

/// Acquire the listener for `role`, serve until drained, and return how the
/// drain ended.
///
/// On SIGINT / SIGTERM: graceful drain and exit.
/// On SIGHUP: spawn a successor that inherits the listener; it tells this
/// process to drain once it is accepting.
pub async fn start(server_config: ServerConfig, role: ProcessRole) -> Result<ShutdownOutcome> {
    let reload = ReloadProtocol::current_exe()?;
    let supervisor = ProcessSupervisor::start(
        role,
        &server_config.bind_addr,
        server_config.drain_timeout(),
        reload,
    )
    .await?;

    let http_handle = spawn_http_server(&supervisor, &server_config)?;

    let outcome = supervisor.run().await?;
    metrics::record_drain(match outcome {
        ShutdownOutcome::DrainedEmpty => "drained_empty",
        ShutdownOutcome::ForcedClose => "forced_close",
        ShutdownOutcome::Pending => "pending",
    });

    match tokio::time::timeout(HTTP_STOP_GRACE, http_handle).await {
        Ok(Ok(Ok(()))) => info!("HTTP server stopped"),
        Ok(Ok(Err(e))) => warn!(error = %e, "HTTP server stopped with error"),
        Ok(Err(e)) => warn!(error = %e, "HTTP server task failed"),
        Err(_) => warn!("HTTP server did not stop in time, exiting anyway"),
    }

    Ok(outcome)
}

/// Start serving on the supervisor's listener in a background task.
pub fn spawn_http_server(
    supervisor: &ProcessSupervisor,
    server_config: &ServerConfig,
) -> Result<JoinHandle<Result<()>>> {
    let listener = supervisor
        .listener()
        .take_listener()
        .ok_or_else(|| anyhow::anyhow!("listener already taken or closed"))?;
    let stop_token = supervisor.listener().stop_token();
    let state = Arc::new(AppState::new(supervisor, server_config));

    Ok(tokio::spawn(start_http_server(state, listener, stop_token)))
}

/// Start the HTTP server with graceful shutdown support.
async fn start_http_server(
    state: Arc<AppState>,
    listener: tokio::net::TcpListener,
    stop_token: CancellationToken,
) -> Result<()> {
    let app = create_router(state);

    let addr = listener.local_addr()?;
    info!("Starting Axum HTTP server on {}", addr);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        stop_token.cancelled().await;
        info!("HTTP server received shutdown signal, no longer accepting");
    })
    .await?;

    Ok(())
}

/// Create the Axum router with all routes and middleware
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(health_handler))
        .with_state(Arc::clone(&state))
        .merge(routes::websocket::router(state))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
}

/// Liveness endpoint; also reports which generation is answering.
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let draining = state.coordinator.is_triggered();
    let status = if draining {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };

    (
        status,
        Json(json!({
            "status": if draining { "draining" } else { "healthy" },
            "service": "molt-server",
            "version": state.banner,
            "pid": std::process::id(),
            "role": state.role.as_str(),
            "connections": state.registry.size(),
            "draining": draining,
        })),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use molt_ecdysis::ListenerHandle;
    use tower::ServiceExt;

    async fn create_test_supervisor() -> ProcessSupervisor {
        let listener = ListenerHandle::bind("127.0.0.1:0").await.unwrap();
        ProcessSupervisor::with_listener(
            ProcessRole::Primary,
            listener,
            Duration::from_millis(50),
            ReloadProtocol::new("/bin/true", Vec::new()),
        )
    }

    async fn get_health(app: Router) -> (StatusCode, serde_json::Value) {
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/healthz")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        let status = response.status();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let supervisor = create_test_supervisor().await;
        let state = Arc::new(AppState::new(&supervisor, &ServerConfig::test_local()));

        let (status, json) = get_health(create_router(state)).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["status"], "healthy");
        assert_eq!(json["service"], "molt-server");
        assert_eq!(json["version"], "test");
        assert_eq!(json["role"], "primary");
        assert_eq!(json["pid"], std::process::id());
        assert_eq!(json["connections"], 0);
        assert_eq!(json["draining"], false);
    }

    #[tokio::test]
    async fn test_health_reports_draining() {
        let supervisor = create_test_supervisor().await;
        let state = Arc::new(AppState::new(&supervisor, &ServerConfig::test_local()));
        supervisor.coordinator().shutdown().await;

        let (status, json) = get_health(create_router(state)).await;

        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(json["status"], "draining");
        assert_eq!(json["draining"], true);
    }

    #[tokio::test]
    async fn test_listener_can_only_be_served_once() {
        let supervisor = create_test_supervisor().await;
        let config = ServerConfig::test_local();

        let first = spawn_http_server(&supervisor, &config).unwrap();
        assert!(spawn_http_server(&supervisor, &config).is_err());

        supervisor.coordinator().shutdown().await;
        first.await.unwrap().unwrap();
    }
}
