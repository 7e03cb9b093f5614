//! `DmgServer`: Axum HTTP + WebSocket server.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;

use axum::Router;
use axum::extract::State;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use dmg_core::{ConnectionId, EmulatorFactory};
use metrics::counter;
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::task::JoinHandle;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::config::ServerConfig;
use crate::health::{self, HealthResponse};
use crate::metrics::WS_CONNECTIONS_REJECTED_TOTAL;
use crate::registry::SessionRegistry;
use crate::shutdown::ShutdownCoordinator;
use crate::websocket::session::run_session;

/// Shared state accessible from Axum handlers.
#[derive(Clone)]
pub struct AppState {
    /// Live sessions.
    pub registry: Arc<SessionRegistry>,
    /// Builds one emulator per connection.
    pub factory: Arc<dyn EmulatorFactory>,
    /// Server configuration.
    pub config: Arc<ServerConfig>,
    /// Shutdown coordinator.
    pub shutdown: Arc<ShutdownCoordinator>,
    /// When the server started.
    pub start_time: Instant,
    /// Connections holding a slot (upgrading or live).
    pub connections: Arc<AtomicUsize>,
    /// Prometheus handle for `/metrics`, when a recorder is installed.
    pub metrics: Option<PrometheusHandle>,
}

/// The emulator host server.
pub struct DmgServer {
    config: Arc<ServerConfig>,
    factory: Arc<dyn EmulatorFactory>,
    registry: Arc<SessionRegistry>,
    shutdown: Arc<ShutdownCoordinator>,
    start_time: Instant,
    connections: Arc<AtomicUsize>,
    metrics: Option<PrometheusHandle>,
}

impl DmgServer {
    /// Create a new server.
    pub fn new(config: ServerConfig, factory: Arc<dyn EmulatorFactory>) -> Self {
        Self {
            config: Arc::new(config),
            factory,
            registry: Arc::new(SessionRegistry::new()),
            shutdown: Arc::new(ShutdownCoordinator::new()),
            start_time: Instant::now(),
            connections: Arc::new(AtomicUsize::new(0)),
            metrics: None,
        }
    }

    /// Serve `/metrics` from this handle.
    #[must_use]
    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics = Some(handle);
        self
    }

    /// Build the Axum router with all routes.
    pub fn router(&self) -> Router {
        let state = AppState {
            registry: self.registry.clone(),
            factory: self.factory.clone(),
            config: self.config.clone(),
            shutdown: self.shutdown.clone(),
            start_time: self.start_time,
            connections: self.connections.clone(),
            metrics: self.metrics.clone(),
        };

        Router::new()
            .route(&self.config.route, get(ws_handler))
            .route("/health", get(health_handler))
            .route("/metrics", get(metrics_handler))
            .with_state(state)
            .layer(CorsLayer::permissive())
            .layer(TraceLayer::new_for_http())
    }

    /// Bind `host:port` and serve until shutdown.
    ///
    /// Returns the bound address (useful with port `0`) and the serve task.
    pub async fn listen(&self) -> std::io::Result<(SocketAddr, JoinHandle<()>)> {
        let addr = format!("{}:{}", self.config.host, self.config.port);
        let listener = tokio::net::TcpListener::bind(&addr).await?;
        let local_addr = listener.local_addr()?;
        let router = self.router();
        let token = self.shutdown.token();

        let handle = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, router)
                .with_graceful_shutdown(token.cancelled_owned())
                .await
            {
                error!(error = %e, "server stopped with error");
            }
        });

        info!(%local_addr, route = %self.config.route, "dmg server listening");
        Ok((local_addr, handle))
    }

    /// Get the session registry.
    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Get the shutdown coordinator.
    pub fn shutdown(&self) -> &Arc<ShutdownCoordinator> {
        &self.shutdown
    }

    /// Get the server configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Connections currently holding a slot.
    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::Acquire)
    }
}

/// A reserved connection slot, returned on drop.
struct ConnectionSlot(Arc<AtomicUsize>);

impl ConnectionSlot {
    fn acquire(counter: &Arc<AtomicUsize>, max: usize) -> Option<Self> {
        let _ = counter
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < max).then_some(n + 1)
            })
            .ok()?;
        Some(Self(Arc::clone(counter)))
    }
}

impl Drop for ConnectionSlot {
    fn drop(&mut self) {
        let _ = self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// GET on the WebSocket route.
async fn ws_handler(
    State(state): State<AppState>,
    upgrade: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    if state.shutdown.is_shutting_down() {
        return (StatusCode::SERVICE_UNAVAILABLE, "server is shutting down").into_response();
    }
    let Some(slot) = ConnectionSlot::acquire(&state.connections, state.config.max_connections)
    else {
        counter!(WS_CONNECTIONS_REJECTED_TOTAL).increment(1);
        warn!(
            max_connections = state.config.max_connections,
            "connection limit reached, rejecting upgrade"
        );
        return (StatusCode::SERVICE_UNAVAILABLE, "connection limit reached").into_response();
    };
    let ws = match upgrade {
        Ok(ws) => ws,
        Err(rejection) => return rejection.into_response(),
    };

    let AppState {
        registry,
        factory,
        config,
        shutdown,
        ..
    } = state;
    let token = shutdown.token();
    let id = ConnectionId::new();

    ws.max_message_size(config.max_message_size)
        .on_upgrade(move |socket| {
            shutdown.track(async move {
                let _slot = slot;
                run_session(socket, id, registry, factory, config, token).await;
            })
        })
}

/// GET /health
async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(health::health_check(
        state.start_time,
        state.connections.load(Ordering::Acquire),
        state.registry.len(),
        state.shutdown.is_shutting_down(),
    ))
}

/// GET /metrics
async fn metrics_handler(State(state): State<AppState>) -> Response {
    match &state.metrics {
        Some(handle) => handle.render().into_response(),
        None => (StatusCode::NOT_FOUND, "metrics recorder not installed").into_response(),
    }
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::Request;
    use dmg_machine::MachineFactory;
    use metrics_exporter_prometheus::PrometheusBuilder;
    use tower::ServiceExt;

    use super::*;

    fn make_server(config: ServerConfig) -> DmgServer {
        DmgServer::new(config, Arc::new(MachineFactory::default()))
    }

    async fn get_status(app: Router, uri: &str) -> (StatusCode, Vec<u8>) {
        let req = Request::builder().uri(uri).body(Body::empty()).unwrap();
        let resp = app.oneshot(req).await.unwrap();
        let status = resp.status();
        let body = axum::body::to_bytes(resp.into_body(), 100_000)
            .await
            .unwrap();
        (status, body.to_vec())
    }

    #[test]
    fn server_with_default_config() {
        let server = make_server(ServerConfig::default());
        assert_eq!(server.config().host, "127.0.0.1");
        assert_eq!(server.config().port, 0);
        assert_eq!(server.config().route, "/gameboy");
        assert!(server.registry().is_empty());
        assert!(!server.shutdown().is_shutting_down());
        assert_eq!(server.connection_count(), 0);
    }

    #[tokio::test]
    async fn health_endpoint_returns_ok() {
        let server = make_server(ServerConfig::default());
        let (status, body) = get_status(server.router(), "/health").await;
        assert_eq!(status, StatusCode::OK);

        let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(parsed["status"], "ok");
        assert_eq!(parsed["connections"], 0);
        assert_eq!(parsed["active_sessions"], 0);
    }

    #[tokio::test]
    async fn health_reports_shutdown() {
        let server = make_server(ServerConfig::default());
        server.shutdown().shutdown();
        let (_, body) = get_status(server.router(), "/health").await;
        let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(parsed["status"], "shutting_down");
    }

    #[tokio::test]
    async fn unknown_route_returns_404() {
        let server = make_server(ServerConfig::default());
        let (status, _) = get_status(server.router(), "/nonexistent").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn metrics_without_recorder_is_404() {
        let server = make_server(ServerConfig::default());
        let (status, _) = get_status(server.router(), "/metrics").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn metrics_with_handle_renders() {
        let handle = PrometheusBuilder::new().build_recorder().handle();
        let server = make_server(ServerConfig::default()).with_metrics(handle);
        let (status, _) = get_status(server.router(), "/metrics").await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn ws_route_rejects_during_shutdown() {
        let server = make_server(ServerConfig::default());
        server.shutdown().shutdown();
        let (status, _) = get_status(server.router(), "/gameboy").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn ws_route_rejects_at_connection_limit() {
        let server = make_server(ServerConfig {
            max_connections: 0,
            ..ServerConfig::default()
        });
        let (status, _) = get_status(server.router(), "/gameboy").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn plain_get_on_ws_route_is_a_client_error() {
        let server = make_server(ServerConfig::default());
        let (status, _) = get_status(server.router(), "/gameboy").await;
        assert!(status.is_client_error());
        assert_eq!(server.connection_count(), 0);
    }

    #[tokio::test]
    async fn custom_route_is_served() {
        let server = make_server(ServerConfig {
            route: "/dmg".into(),
            max_connections: 0,
            ..ServerConfig::default()
        });
        let (status, _) = get_status(server.router(), "/dmg").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        let (status, _) = get_status(server.router(), "/gameboy").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[test]
    fn connection_slots_are_bounded_and_returned() {
        let counter = Arc::new(AtomicUsize::new(0));
        let a = ConnectionSlot::acquire(&counter, 2).unwrap();
        let b = ConnectionSlot::acquire(&counter, 2).unwrap();
        assert!(ConnectionSlot::acquire(&counter, 2).is_none());
        drop(a);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        let _c = ConnectionSlot::acquire(&counter, 2).unwrap();
        drop(b);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn listen_binds_an_ephemeral_port() {
        let server = make_server(ServerConfig::default());
        let (addr, handle) = server.listen().await.unwrap();
        assert_ne!(addr.port(), 0);
        server.shutdown().shutdown();
        tokio::time::timeout(std::time::Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
