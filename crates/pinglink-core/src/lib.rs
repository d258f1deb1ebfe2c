//! Resilient bidirectional-stream heartbeat link.
//!
//! Agents open a long-lived gRPC stream to a routing server, exchange
//! periodic ping/pong messages over it, and reconnect with fixed delays
//! whenever either direction of the link fails.

pub mod agent;
pub mod config;
pub mod error;
pub mod server;
pub mod tls;

// Re-export generated protobuf types
pub mod proto {
    tonic::include_proto!("pinglink");
}

#[cfg(test)]
mod tests;
