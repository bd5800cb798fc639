use house_relay::{
    admission::AdmissionController,
    config::Config,
    kick, mqtt,
    mqtt::BrokerEvent,
    repositories::{ConnectedRepository, WhitelistRepository},
    upstream::HttpForwarder,
    AppError, Relay, RelayOptions,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();

    let cfg_path =
        std::env::var("APP_CONFIG").unwrap_or_else(|_| "config/config.example.yaml".into());
    let cfg = Config::load(&cfg_path)?;
    info!(
        path = %cfg_path,
        data_dir = %cfg.storage.data_dir.display(),
        "loaded config"
    );

    let whitelist = Arc::new(WhitelistRepository::open(&cfg.storage.data_dir)?);
    let registry = Arc::new(ConnectedRepository::open(&cfg.storage.data_dir)?);
    let kicker = kick::from_config(&cfg.kick)?;
    let sink = Arc::new(HttpForwarder::new(&cfg.upstream)?);

    let opts = mqtt::build_options(&cfg.mqtt)?;
    let (client, mut eventloop) = mqtt::new(opts);
    info!(host = %cfg.mqtt.host, port = cfg.mqtt.port, "connecting to broker");

    let admission = AdmissionController::new(whitelist, kicker, cfg.relay.kick_cooldown());
    let mut relay = Relay::new(
        admission,
        registry.clone(),
        sink,
        Arc::new(client.clone()),
        RelayOptions::from(&cfg),
    );

    if let Some(max_age) = cfg.relay.stale_after() {
        let every = Duration::from_secs(cfg.relay.sweep_interval_secs);
        tokio::spawn(sweep_stale_clients(registry, every, max_age));
        info!(stale_after = ?max_age, every = ?every, "liveness sweep enabled");
    }

    let sig = tokio::signal::ctrl_c();
    tokio::pin!(sig);
    loop {
        tokio::select! {
            biased;
            _ = &mut sig => {
                info!("shutdown requested");
                break;
            }
            res = mqtt::next_event(&mut eventloop) => {
                match res {
                    Ok(BrokerEvent::Connected) => {
                        info!("connected to broker");
                        if let Err(e) = mqtt::subscribe_all(&client) {
                            warn!(error = %e, "could not subscribe");
                        }
                    }
                    Ok(BrokerEvent::Message(msg)) => {
                        let topic = match std::str::from_utf8(&msg.topic) {
                            Ok(s) => s.to_string(),
                            Err(_) => {
                                warn!(topic_bytes = ?msg.topic, "non-utf8 topic; skipping message");
                                continue;
                            }
                        };
                        match relay.handle_message(&topic, &msg.payload) {
                            Ok(outcome) => debug!(topic = %topic, ?outcome, "message handled"),
                            Err(AppError::MalformedPayload(reason)) => {
                                warn!(topic = %topic, reason = %reason, "malformed payload; dropping message");
                            }
                            Err(e) => {
                                error!(topic = %topic, error = %e, "processing failed for incoming message");
                            }
                        }
                    }
                    Err(e) => {
                        warn!("mqtt error: {e}; reconnecting after short delay");
                        tokio::time::sleep(Duration::from_secs(2)).await;
                    }
                }
            }
        }
    }

    if cfg.relay.flush_on_shutdown {
        let pending = relay.flush();
        let grace = Duration::from_secs(cfg.upstream.timeout_secs);
        if tokio::time::timeout(grace, futures::future::join_all(pending))
            .await
            .is_err()
        {
            warn!("upstream deliveries still pending at shutdown");
        }
    }

    if let Err(e) = client.try_disconnect() {
        debug!(error = %e, "disconnect request not sent");
    }
    info!("relay stopped");
    Ok(())
}

/// Periodically drop registry entries that have not been re-announced.
async fn sweep_stale_clients(registry: Arc<ConnectedRepository>, every: Duration, max_age: Duration) {
    let max_age = match chrono::Duration::from_std(max_age) {
        Ok(d) => d,
        Err(e) => {
            error!(error = %e, "stale_after_secs out of range; sweep disabled");
            return;
        }
    };
    let mut interval = tokio::time::interval(every);
    // The first tick fires immediately.
    interval.tick().await;

    loop {
        interval.tick().await;
        match registry.evict_stale(chrono::Utc::now(), max_age) {
            Ok(evicted) if !evicted.is_empty() => {
                info!(?evicted, "evicted stale connected clients");
            }
            Ok(_) => {}
            Err(e) => error!(error = %e, "liveness sweep failed"),
        }
    }
}
