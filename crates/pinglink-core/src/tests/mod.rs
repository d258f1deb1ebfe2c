
pub mod support {
    use std::net::SocketAddr;
    use std::time::Duration;

    use tokio::net::TcpListener;
    use tokio::sync::{mpsc, oneshot};
    use tokio::task::JoinHandle;
    use tokio_stream::wrappers::{ReceiverStream, TcpListenerStream};
    use tonic::transport::Server;
    use tonic::{Request, Response, Status, Streaming};

    use crate::config::{
        AgentConfig, AgentIdentity, CallMode, RetryPolicy, ServerConfig, ServerIdentity,
    };
    use crate::error::LinkError;
    use crate::proto::ping_service_server::{PingService, PingServiceServer};
    use crate::proto::{PingRequest, PingResponse};
    use crate::server::PingServer;

    /// Millisecond-scale delays so reconnect behavior is observable in tests.
    pub fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            dial_retry: Duration::from_millis(50),
            reconnect_delay: Duration::from_millis(50),
            ping_interval: Duration::from_millis(100),
            unary_timeout: Duration::from_millis(300),
        }
    }

    pub fn agent_config(addr: SocketAddr) -> AgentConfig {
        AgentConfig {
            identity: AgentIdentity {
                id: "A1".to_string(),
                version: "v1".to_string(),
            },
            server_address: addr.to_string(),
            use_tls: false,
            mode: CallMode::Stream,
            retry: fast_retry(),
        }
    }

    /// Run the real router on an ephemeral port through the product
    /// lifecycle (bind, then serve until the returned sender fires).
    pub async fn spawn_router(
        version: &str,
        server_id: &str,
    ) -> (
        SocketAddr,
        oneshot::Sender<()>,
        JoinHandle<Result<(), LinkError>>,
    ) {
        let config = ServerConfig {
            identity: ServerIdentity {
                version: version.to_string(),
                server_id: server_id.to_string(),
            },
            port: "0".to_string(),
        };
        let bound = PingServer::new(config).bind().await.expect("bind router");
        let port = bound.local_addr().expect("local addr").port();
        let addr: SocketAddr = format!("127.0.0.1:{port}").parse().expect("router addr");
        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let handle = tokio::spawn(bound.serve_with_shutdown(async move {
            let _ = stop_rx.await;
        }));
        (addr, stop_tx, handle)
    }

    /// Run an arbitrary service impl on an ephemeral port.
    pub async fn spawn_service<S: PingService>(
        service: S,
    ) -> (
        SocketAddr,
        oneshot::Sender<()>,
        JoinHandle<Result<(), tonic::transport::Error>>,
    ) {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind test listener");
        let addr = listener.local_addr().expect("local addr");
        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let handle = tokio::spawn(
            Server::builder()
                .add_service(PingServiceServer::new(service))
                .serve_with_incoming_shutdown(TcpListenerStream::new(listener), async move {
                    let _ = stop_rx.await;
                }),
        );
        (addr, stop_tx, handle)
    }

    /// Answers the first heartbeat, then ends the stream cleanly.
    pub struct ReplyThenClose;

    #[tonic::async_trait]
    impl PingService for ReplyThenClose {
        async fn ping(
            &self,
            _request: Request<PingRequest>,
        ) -> Result<Response<PingResponse>, Status> {
            Ok(Response::new(PingResponse {
                message: "pong".to_string(),
                server_version: "test".to_string(),
                server_id: String::new(),
            }))
        }

        type PingPongStream = ReceiverStream<Result<PingResponse, Status>>;

        async fn ping_pong(
            &self,
            request: Request<Streaming<PingRequest>>,
        ) -> Result<Response<Self::PingPongStream>, Status> {
            let mut inbound = request.into_inner();
            let (tx, rx) = mpsc::channel(1);
            tokio::spawn(async move {
                if let Ok(Some(_)) = inbound.message().await {
                    let _ = tx
                        .send(Ok(PingResponse {
                            message: "pong".to_string(),
                            server_version: "test".to_string(),
                            server_id: "test".to_string(),
                        }))
                        .await;
                }
                // Dropping the sender half-closes the response stream.
            });
            Ok(Response::new(ReceiverStream::new(rx)))
        }
    }

    /// Fails the stream with a transport-level error on the first heartbeat.
    pub struct FailingPing;

    #[tonic::async_trait]
    impl PingService for FailingPing {
        async fn ping(
            &self,
            _request: Request<PingRequest>,
        ) -> Result<Response<PingResponse>, Status> {
            Err(Status::internal("router overloaded"))
        }

        type PingPongStream = ReceiverStream<Result<PingResponse, Status>>;

        async fn ping_pong(
            &self,
            request: Request<Streaming<PingRequest>>,
        ) -> Result<Response<Self::PingPongStream>, Status> {
            let mut inbound = request.into_inner();
            let (tx, rx) = mpsc::channel(1);
            tokio::spawn(async move {
                if let Ok(Some(_)) = inbound.message().await {
                    let _ = tx.send(Err(Status::internal("router overloaded"))).await;
                }
            });
            Ok(Response::new(ReceiverStream::new(rx)))
        }
    }
}
