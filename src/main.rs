use anyhow::Context;
use log_relay::config::RelayConfig;
use log_relay::logging;
use log_relay::publish::pubsub::PubSubPublisher;
use log_relay::tools::system;
use log_relay::web::relay::{Relay, relay_route};
use log_relay::web::warp::run_webserver;
use std::sync::Arc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logging::setup_tracing();
    system::install_termination_listener();

    let config = RelayConfig::from_env()
        .context("Invalid configuration")
        .inspect_err(|err| tracing::error!("{:#}", err))?;

    tracing::info!(
        "Relaying log entries to {} ({} API tokens configured)",
        config.topic,
        config.api_tokens.len()
    );

    let publisher = PubSubPublisher::connect(
        config.emulator_host.as_deref(),
        &config.credentials,
        config.publish_timeout,
    )?;
    let relay = Relay::new(config.api_tokens, config.topic, Arc::new(publisher));

    run_webserver(relay_route(Arc::new(relay)), config.bind_address).await
}
