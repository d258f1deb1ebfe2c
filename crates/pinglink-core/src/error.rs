//! Error taxonomy for the link.
//!
//! Agent-side variants never propagate past the reconnect loop; they exist
//! so every teardown path can be logged and classified. `Bind` is the one
//! fatal condition in the system.

use std::fmt;

use tonic::Status;

/// Why the receive side of a stream stopped.
///
/// The clean end-of-stream and transport-error causes both trigger the same
/// reconnect, but they are distinct events and are logged as such.
#[derive(Debug)]
pub enum StreamEnd {
    /// The peer half-closed its direction cleanly.
    Eof,
    /// The stream failed with a transport or protocol error.
    Transport(Status),
}

impl fmt::Display for StreamEnd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamEnd::Eof => write!(f, "stream closed by peer"),
            StreamEnd::Transport(status) => write!(f, "transport error: {status}"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    #[error("failed to construct client channel: {0}")]
    Dial(tonic::transport::Error),
    #[error("identity not representable as call metadata: {0}")]
    Metadata(#[from] tonic::metadata::errors::InvalidMetadataValue),
    #[error("failed to open stream: {0}")]
    StreamOpen(Status),
    #[error("request stream closed while sending")]
    Send,
    #[error("receive failed: {0}")]
    Receive(StreamEnd),
    #[error("failed to bind listener: {0}")]
    Bind(std::io::Error),
    #[error("server terminated: {0}")]
    Serve(tonic::transport::Error),
}
