//! HTTP binding: the same dispatch contract over a different wire envelope.
//!
//! `POST /<serviceName>` carries a [`RequestEnvelope`] as its JSON body and
//! answers 200 with the handler's result or 500 with a [`SerializedError`].
//! `GET /` answers a fixed string for liveness checks. Servers are keyed by
//! port in an explicit registry owned by the caller: created on first
//! registration, reused for later registrations on the same port, and torn
//! down by an explicit `shutdown`.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use busrpc_core::{RequestEnvelope, SerializedError};
use dashmap::DashMap;
use tokio::net::TcpListener;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::service::Service;

/// Fixed body of the root health endpoint.
const ROOT_BODY: &str = "ok";

/// Service-name routing table shared with a running server.
type RouteTable = Arc<DashMap<String, Service>>;

/// Errors from gateway lifecycle operations.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("failed to bind port {port}")]
    Bind {
        port: u16,
        #[source]
        source: std::io::Error,
    },
}

/// One bound listener and the state shared with its serve task.
struct BoundServer {
    /// Actual bound port; differs from the key when port 0 was requested.
    local_port: u16,
    routes: RouteTable,
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

// ---------------------------------------------------------------------------
// HttpGateway
// ---------------------------------------------------------------------------

/// Explicit per-port HTTP server registry.
///
/// One listener per requested port, created lazily on the first
/// registration and reused for every later service registered on that
/// port. Nothing here is process-global: the gateway's owner controls its
/// lifetime and must call [`Self::shutdown`] to release the listeners.
#[derive(Default)]
pub struct HttpGateway {
    servers: Mutex<HashMap<u16, BoundServer>>,
}

impl HttpGateway {
    /// Creates a gateway with no bound servers.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `service` under `POST /<name>` on `port`.
    ///
    /// The first registration for a port binds the listener (port 0 asks
    /// the OS for an ephemeral one) and spawns the serve task; later
    /// registrations on the same requested port reuse it. Returns the
    /// actual bound port.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Bind`] if the listener cannot be bound.
    pub async fn register(
        &self,
        port: u16,
        name: &str,
        service: Service,
    ) -> Result<u16, GatewayError> {
        let mut servers = self.servers.lock().await;

        if let Some(server) = servers.get(&port) {
            server.routes.insert(name.to_string(), service);
            return Ok(server.local_port);
        }

        let routes: RouteTable = Arc::new(DashMap::new());
        routes.insert(name.to_string(), service);

        let listener = TcpListener::bind(("0.0.0.0", port))
            .await
            .map_err(|source| GatewayError::Bind { port, source })?;
        let local_port = listener
            .local_addr()
            .map_err(|source| GatewayError::Bind { port, source })?
            .port();

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let router = build_router(Arc::clone(&routes));
        let task = tokio::spawn(async move {
            let serve = axum::serve(listener, router).with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            });
            if let Err(err) = serve.await {
                warn!(error = %err, "http gateway server error");
            }
        });

        info!(port = local_port, service = %name, "http gateway listening");

        servers.insert(
            port,
            BoundServer {
                local_port,
                routes,
                shutdown: shutdown_tx,
                task,
            },
        );
        Ok(local_port)
    }

    /// Actual bound port for a requested port, if a server exists for it.
    pub async fn local_port(&self, port: u16) -> Option<u16> {
        self.servers.lock().await.get(&port).map(|s| s.local_port)
    }

    /// Gracefully stops every bound server and waits for the serve tasks.
    pub async fn shutdown(&self) {
        let drained: Vec<BoundServer> = {
            let mut servers = self.servers.lock().await;
            servers.drain().map(|(_, server)| server).collect()
        };
        for server in drained {
            let _ = server.shutdown.send(());
            if server.task.await.is_err() {
                warn!(port = server.local_port, "http gateway task panicked");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Router and handlers
// ---------------------------------------------------------------------------

fn build_router(routes: RouteTable) -> Router {
    Router::new()
        .route("/", get(root_handler))
        .route("/{service}", post(rpc_handler))
        .with_state(routes)
}

async fn root_handler() -> &'static str {
    ROOT_BODY
}

/// Dispatch endpoint: 200 with the handler result, 500 with a serialized
/// error — the same success/failure split the broker envelope makes.
async fn rpc_handler(
    State(routes): State<RouteTable>,
    Path(service_name): Path<String>,
    Json(request): Json<RequestEnvelope>,
) -> Response {
    let Some(service) = routes.get(&service_name).map(|entry| entry.value().clone()) else {
        let err = SerializedError::new(
            "HandlerNotFoundError",
            format!("service {service_name} is not registered"),
        )
        .with_property("serviceName", service_name.clone());
        return (StatusCode::INTERNAL_SERVER_ERROR, Json(err)).into_response();
    };

    match service
        .dispatch(
            &request.routing_key,
            request.transaction_id.clone(),
            request.args,
        )
        .await
    {
        Ok(value) => (StatusCode::OK, Json(value)).into_response(),
        Err(err) => (StatusCode::INTERNAL_SERVER_ERROR, Json(err.to_serialized())).into_response(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
