//! perm-log-publish: publish a single event
//!
//! Usage: `perm-log-publish <routing-key> <payload>`
//!
//! The payload is sent as-is, persistent and stamped with the current time.
//! The broker URL comes from the same configuration as perm-log-listen.

use tracing::info;

use perm_log::config::Config;
use perm_log::utils::bootstrap::init_tracing;
use perm_log::{EventPublisher, PermLogEvent, PublishOptions};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let mut args = std::env::args().skip(1);
    let (routing_key, payload) = match (args.next(), args.next()) {
        (Some(key), Some(payload)) => (key.parse::<PermLogEvent>()?, payload),
        _ => return Err("usage: perm-log-publish <routing-key> <payload>".into()),
    };

    let config = Config::load(None)?;

    let mut publisher = EventPublisher::new();
    publisher.init(&config.amqp.url).await?;

    let accepted = publisher
        .publish_message(
            routing_key,
            payload.as_bytes(),
            Some(PublishOptions::persistent_now()),
        )
        .await?;

    info!(routing_key = %routing_key, accepted, "Event published");

    publisher.clear_all().await;
    Ok(())
}
