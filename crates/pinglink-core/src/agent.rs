//! Agent side of the link: the connection/retry state machine and the
//! send/receive coordination on an open stream.
//!
//! The loop is infinite by design: the agent never exits on its own, it
//! retries with fixed delays until the process is killed.

use std::convert::Infallible;
use std::sync::Arc;

use log::{info, warn};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tokio_stream::wrappers::ReceiverStream;
use tonic::metadata::errors::InvalidMetadataValue;
use tonic::metadata::MetadataMap;
use tonic::transport::{Channel, Endpoint};
use tonic::{Request, Status};

use crate::config::{AgentConfig, AgentIdentity, CallMode};
use crate::error::{LinkError, StreamEnd};
use crate::proto::ping_service_client::PingServiceClient;
use crate::proto::{PingRequest, PingResponse};
use crate::tls;

/// Fixed heartbeat payload.
const PING_PAYLOAD: &str = "ping";

/// A heartbeating agent bound to one server endpoint.
///
/// Transport credentials are fixed at construction and reused across every
/// retry.
pub struct PingAgent {
    config: AgentConfig,
    tls: Option<Arc<rustls::ClientConfig>>,
}

impl PingAgent {
    pub fn new(config: AgentConfig) -> Self {
        let tls = config
            .use_tls
            .then(|| Arc::new(tls::insecure_client_config()));
        Self { config, tls }
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    /// Run forever in the configured call mode.
    pub async fn run(&self) -> Infallible {
        match self.config.mode {
            CallMode::Stream => self.run_stream().await,
            CallMode::Unary => self.run_unary().await,
        }
    }

    /// Streaming mode: one long-lived full-duplex stream per connection.
    ///
    /// `Disconnected -> Connecting -> Connected -> StreamOpen -> Streaming`
    /// and back to `Disconnected` on any failure, with fixed pauses between
    /// attempts.
    pub async fn run_stream(&self) -> Infallible {
        let AgentIdentity { id, version } = &self.config.identity;
        loop {
            let channel = match self.dial() {
                Ok(channel) => channel,
                Err(e) => {
                    warn!(
                        "[agent {version}/{id}] failed to connect: {e}; retrying in {:?}",
                        self.config.retry.dial_retry
                    );
                    sleep(self.config.retry.dial_retry).await;
                    continue;
                }
            };
            info!(
                "[agent {version}/{id}] connected to {}",
                self.config.server_address
            );

            match self.stream_once(channel).await {
                // The receive actor already narrated its own exit.
                Ok(_) => {}
                Err(e) => warn!("[agent {version}/{id}] {e}"),
            }

            info!(
                "[agent {version}/{id}] reconnecting in {:?}",
                self.config.retry.reconnect_delay
            );
            sleep(self.config.retry.reconnect_delay).await;
        }
    }

    /// Unary mode: one bounded call per interval; any failure (including a
    /// timeout) abandons the connection instead of retrying on it.
    pub async fn run_unary(&self) -> Infallible {
        let AgentIdentity { id, version } = &self.config.identity;
        loop {
            let channel = match self.dial() {
                Ok(channel) => channel,
                Err(e) => {
                    warn!(
                        "[agent {version}/{id}] failed to connect: {e}; retrying in {:?}",
                        self.config.retry.dial_retry
                    );
                    sleep(self.config.retry.dial_retry).await;
                    continue;
                }
            };
            info!(
                "[agent {version}/{id}] connected to {}",
                self.config.server_address
            );

            let mut client = PingServiceClient::new(channel);
            loop {
                match self.unary_once(&mut client).await {
                    Ok(pong) => {
                        info!(
                            "[agent {version}/{id}] received pong from server={} message={}",
                            pong.server_version, pong.message
                        );
                        sleep(self.config.retry.ping_interval).await;
                    }
                    Err(status) => {
                        warn!("[agent {version}/{id}] ping failed: {status}");
                        break;
                    }
                }
            }

            // Close the connection before pausing, same as the streaming path.
            drop(client);
            info!(
                "[agent {version}/{id}] reconnecting in {:?}",
                self.config.retry.reconnect_delay
            );
            sleep(self.config.retry.reconnect_delay).await;
        }
    }

    /// Construct a client channel for the configured endpoint.
    ///
    /// The channel is lazy: failure here means the local handle could not
    /// be built (a malformed address), not that the server is unreachable.
    /// Connectivity errors surface later, at stream-open or first call.
    pub fn dial(&self) -> Result<Channel, LinkError> {
        let scheme = if self.config.use_tls { "https" } else { "http" };
        let endpoint = Endpoint::from_shared(format!("{scheme}://{}", self.config.server_address))
            .map_err(LinkError::Dial)?;
        match &self.tls {
            Some(tls) => Ok(tls::connect_lazy_insecure(endpoint, tls.clone())),
            None => Ok(endpoint.connect_lazy()),
        }
    }

    /// Drive one stream lifetime on `channel`.
    ///
    /// Opens the stream with the agent identity attached as metadata, spawns
    /// the receive actor, and runs the send loop until the send side fails
    /// or the completion signal reports that the receive actor exited.
    /// Every exit path half-closes the outbound direction and joins the
    /// receive actor before the channel is dropped, so no stale actor can
    /// touch a disposed transport handle.
    pub async fn stream_once(&self, channel: Channel) -> Result<StreamEnd, LinkError> {
        let identity = self.config.identity.clone();
        let mut client = PingServiceClient::new(channel);

        let (req_tx, req_rx) = mpsc::channel::<PingRequest>(1);
        let mut request = Request::new(ReceiverStream::new(req_rx));
        attach_identity(&identity, request.metadata_mut())?;

        let inbound = client
            .ping_pong(request)
            .await
            .map_err(LinkError::StreamOpen)?
            .into_inner();
        info!(
            "[agent {}/{}] stream opened to {}",
            identity.version, identity.id, self.config.server_address
        );

        let (done_tx, mut done_rx) = oneshot::channel::<StreamEnd>();
        let receiver = spawn_receive_actor(identity.clone(), inbound, done_tx);

        let outcome = loop {
            if req_tx
                .send(PingRequest {
                    message: PING_PAYLOAD.to_string(),
                })
                .await
                .is_err()
            {
                warn!(
                    "[agent {}/{}] send error: request stream closed",
                    identity.version, identity.id
                );
                break Err(LinkError::Send);
            }
            info!("[agent {}/{}] sent ping", identity.version, identity.id);

            tokio::select! {
                end = &mut done_rx => {
                    info!(
                        "[agent {}/{}] receive actor exited",
                        identity.version, identity.id
                    );
                    break Ok(end.unwrap_or(StreamEnd::Eof));
                }
                _ = sleep(self.config.retry.ping_interval) => {}
            }
        };

        // Half-close our direction, then wait for the receive actor so both
        // sides of the stream are done before the channel is dropped.
        drop(req_tx);
        let _ = receiver.await;
        outcome
    }

    /// Issue one unary heartbeat with the configured per-call deadline.
    pub async fn unary_once(
        &self,
        client: &mut PingServiceClient<Channel>,
    ) -> Result<PingResponse, Status> {
        let mut request = Request::new(PingRequest {
            message: PING_PAYLOAD.to_string(),
        });
        attach_identity(&self.config.identity, request.metadata_mut())
            .map_err(|e| Status::invalid_argument(e.to_string()))?;

        match timeout(self.config.retry.unary_timeout, client.ping(request)).await {
            Ok(Ok(response)) => Ok(response.into_inner()),
            Ok(Err(status)) => Err(status),
            Err(_) => Err(Status::deadline_exceeded(format!(
                "no response within {:?}",
                self.config.retry.unary_timeout
            ))),
        }
    }
}

/// The receive actor: drains responses until end-of-stream or error, then
/// fires the one-shot completion signal exactly once and exits. It never
/// writes to the stream.
fn spawn_receive_actor(
    identity: AgentIdentity,
    mut inbound: tonic::Streaming<PingResponse>,
    done_tx: oneshot::Sender<StreamEnd>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match inbound.message().await {
                Ok(Some(pong)) => {
                    info!(
                        "[agent {}/{}] received pong from server={}/{} message={}",
                        identity.version, identity.id, pong.server_version, pong.server_id,
                        pong.message
                    );
                }
                Ok(None) => {
                    info!(
                        "[agent {}/{}] stream closed by server",
                        identity.version, identity.id
                    );
                    let _ = done_tx.send(StreamEnd::Eof);
                    return;
                }
                Err(status) => {
                    warn!(
                        "[agent {}/{}] receive error: {status}",
                        identity.version, identity.id
                    );
                    let _ = done_tx.send(StreamEnd::Transport(status));
                    return;
                }
            }
        }
    })
}

/// Attach the agent identity as call metadata; sent once per call or
/// stream, never per message.
fn attach_identity(
    identity: &AgentIdentity,
    metadata: &mut MetadataMap,
) -> Result<(), InvalidMetadataValue> {
    metadata.insert("agent-version", identity.version.parse()?);
    metadata.insert("agent-id", identity.id.parse()?);
    Ok(())
}
