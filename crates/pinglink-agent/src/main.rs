use log::info;
use pinglink_core::agent::PingAgent;
use pinglink_core::config::AgentConfig;

#[tokio::main]
async fn main() {
    env_logger::init();

    let config = AgentConfig::from_env();
    info!(
        "[agent {}/{}] starting target={} tls={} mode={:?}",
        config.identity.version,
        config.identity.id,
        config.server_address,
        config.use_tls,
        config.mode
    );

    // Retries forever; the process only exits when killed.
    PingAgent::new(config).run().await;
}
