use log::info;
use pinglink_core::config::ServerConfig;
use pinglink_core::error::LinkError;
use pinglink_core::server::PingServer;

#[tokio::main]
async fn main() -> Result<(), LinkError> {
    env_logger::init();

    let config = ServerConfig::from_env();
    info!(
        "[server {}] starting id={} port={}",
        config.identity.version, config.identity.server_id, config.port
    );

    // A bind failure is fatal; everything else is handled per stream.
    let server = PingServer::new(config).bind().await?;
    server.serve().await
}
