//! perm-log-listen: tail a perm/log queue
//!
//! Binds the configured queue to the configured event patterns, logs every
//! delivery, and acknowledges it.
//!
//! ## Configuration
//! - PERM_LOG_CONFIG: Path to a YAML config file (optional)
//! - PERM_LOG__AMQP__URL: Broker connection URL
//! - PERM_LOG__LISTENER__QUEUE: Queue to consume (default: log_queue)
//! - PERM_LOG__LISTENER__EVENTS: Comma-separated event patterns (default: Perm.*)
//! - PERM_LOG_LOG: Log filter (default: info)

use tokio::sync::mpsc;
use tracing::{error, info};

use perm_log::config::Config;
use perm_log::utils::bootstrap::init_tracing;
use perm_log::EventListener;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let config = Config::load(None)?;
    let (tx, mut rx) = mpsc::unbounded_channel();

    let mut listener = EventListener::new().with_binding_policy(config.listener.binding_policy);
    listener
        .init(
            &config.amqp.url,
            config.listener.queue,
            &config.listener.events,
            move |delivery| {
                let _ = tx.send(delivery);
            },
        )
        .await?;

    info!(queue = %config.listener.queue, "perm-log-listen started");

    loop {
        tokio::select! {
            Some(delivery) = rx.recv() => {
                info!(
                    routing_key = %delivery.routing_key,
                    delivery_tag = delivery.delivery_tag,
                    redelivered = delivery.redelivered,
                    payload = %String::from_utf8_lossy(&delivery.data),
                    "Event received"
                );
                if let Err(e) = listener.acknowledge_message(&delivery).await {
                    error!(error = %e, "Failed to acknowledge event");
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down");
                break;
            }
        }
    }

    listener.clear_all().await;
    Ok(())
}
