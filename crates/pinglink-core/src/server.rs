//! Server side of the link: the per-stream echo handler, the unary
//! handler, and the listener lifecycle with graceful shutdown.

use std::future::Future;
use std::io;
use std::net::SocketAddr;

use log::{info, warn};
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::mpsc;
use tokio_stream::wrappers::{ReceiverStream, TcpListenerStream};
use tonic::metadata::MetadataMap;
use tonic::transport::Server;
use tonic::{Request, Response, Status, Streaming};

use crate::config::{ServerConfig, ServerIdentity};
use crate::error::LinkError;
use crate::proto::ping_service_server::{PingService, PingServiceServer};
use crate::proto::{PingRequest, PingResponse};

/// Fixed acknowledgement payload on the streaming path.
const PONG_PAYLOAD: &str = "pong";

/// Placeholder for identity metadata an agent did not send.
const UNKNOWN: &str = "unknown";

fn metadata_field(metadata: &MetadataMap, key: &str) -> String {
    metadata
        .get(key)
        .and_then(|value| value.to_str().ok())
        .unwrap_or(UNKNOWN)
        .to_string()
}

/// The routing server's ping service.
///
/// Handlers are stateless beyond the read-only server identity; every
/// accepted stream runs on its own task and shares nothing mutable with its
/// peers.
#[derive(Debug, Clone)]
pub struct PingRouter {
    identity: ServerIdentity,
}

impl PingRouter {
    pub fn new(identity: ServerIdentity) -> Self {
        Self { identity }
    }
}

#[tonic::async_trait]
impl PingService for PingRouter {
    async fn ping(
        &self,
        request: Request<PingRequest>,
    ) -> Result<Response<PingResponse>, Status> {
        let agent_version = metadata_field(request.metadata(), "agent-version");
        let agent_id = metadata_field(request.metadata(), "agent-id");
        let req = request.into_inner();

        info!(
            "[server {}] agent-id={agent_id} agent-version={agent_version} message={}",
            self.identity.version, req.message
        );

        Ok(Response::new(PingResponse {
            message: format!("Pong from server-{}", self.identity.version),
            server_version: self.identity.version.clone(),
            server_id: String::new(),
        }))
    }

    type PingPongStream = ReceiverStream<Result<PingResponse, Status>>;

    async fn ping_pong(
        &self,
        request: Request<Streaming<PingRequest>>,
    ) -> Result<Response<Self::PingPongStream>, Status> {
        let agent_version = metadata_field(request.metadata(), "agent-version");
        let agent_id = metadata_field(request.metadata(), "agent-id");
        let mut inbound = request.into_inner();
        let identity = self.identity.clone();
        let (tx, rx) = mpsc::channel(16);

        info!(
            "[server {}] stream opened by agent {agent_id} (version {agent_version})",
            identity.version
        );

        tokio::spawn(async move {
            loop {
                let req = match inbound.message().await {
                    Ok(Some(req)) => req,
                    Ok(None) => {
                        info!(
                            "[server {}] stream from agent {agent_id} closed",
                            identity.version
                        );
                        break;
                    }
                    Err(status) => {
                        warn!(
                            "[server {}] read error on stream from agent {agent_id}: {status}",
                            identity.version
                        );
                        // Propagate so the agent observes an error, not a
                        // clean end-of-stream.
                        let _ = tx.send(Err(status)).await;
                        break;
                    }
                };

                info!(
                    "[server {}] agent-id={agent_id} agent-version={agent_version} message={}",
                    identity.version, req.message
                );

                let pong = PingResponse {
                    message: PONG_PAYLOAD.to_string(),
                    server_version: identity.version.clone(),
                    server_id: identity.server_id.clone(),
                };
                if tx.send(Ok(pong)).await.is_err() {
                    warn!(
                        "[server {}] response stream for agent {agent_id} closed while replying",
                        identity.version
                    );
                    break;
                }
            }
        });

        Ok(Response::new(ReceiverStream::new(rx)))
    }
}

/// A configured but not yet bound server.
pub struct PingServer {
    config: ServerConfig,
}

impl PingServer {
    pub fn new(config: ServerConfig) -> Self {
        Self { config }
    }

    /// Bind the listener. Failure here is fatal: there is no meaningful
    /// recovery without a listening socket.
    pub async fn bind(self) -> Result<BoundServer, LinkError> {
        let addr: SocketAddr = format!("0.0.0.0:{}", self.config.port)
            .parse()
            .map_err(|e| LinkError::Bind(io::Error::new(io::ErrorKind::InvalidInput, e)))?;
        let listener = TcpListener::bind(addr).await.map_err(LinkError::Bind)?;
        info!(
            "[server {}] listening on {}",
            self.config.identity.version,
            listener.local_addr().map_err(LinkError::Bind)?
        );
        Ok(BoundServer {
            identity: self.config.identity,
            listener,
        })
    }
}

/// A server holding its listener, ready to serve.
pub struct BoundServer {
    identity: ServerIdentity,
    listener: TcpListener,
}

impl BoundServer {
    pub fn local_addr(&self) -> Result<SocketAddr, LinkError> {
        self.listener.local_addr().map_err(LinkError::Bind)
    }

    /// Serve until interrupted or terminated, then drain gracefully.
    pub async fn serve(self) -> Result<(), LinkError> {
        let version = self.identity.version.clone();
        self.serve_with_shutdown(async move {
            shutdown_signal().await;
            info!("[server {version}] shutting down gracefully");
        })
        .await
    }

    /// Serve until `shutdown` resolves: stop accepting new streams, let
    /// in-flight handlers finish, then return.
    pub async fn serve_with_shutdown(
        self,
        shutdown: impl Future<Output = ()>,
    ) -> Result<(), LinkError> {
        let version = self.identity.version.clone();
        let service = PingRouter::new(self.identity);
        let incoming = TcpListenerStream::new(self.listener);

        Server::builder()
            .add_service(PingServiceServer::new(service))
            .serve_with_incoming_shutdown(incoming, shutdown)
            .await
            .map_err(LinkError::Serve)?;

        info!("[server {version}] stopped");
        Ok(())
    }
}

/// Resolves on SIGINT or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = signal::ctrl_c().await;
    };

    #[cfg(unix)]
    {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = terminate.recv() => {}
                }
            }
            Err(e) => {
                warn!("failed to install SIGTERM handler: {e}");
                ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    ctrl_c.await;
}
