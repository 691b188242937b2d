mod actuator;
mod config;
mod db;
mod dispatcher;
mod error;
mod lifecycle;
mod mqtt;
mod predicate;
mod program;
mod schedule;
mod state;
mod web;
mod zone;

#[cfg(test)]
mod testing;

use anyhow::{Context, Result};
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use std::{env, sync::Arc, time::Duration};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use actuator::ActuatorFactory;
use db::Db;
use dispatcher::Dispatcher;
use predicate::Facts;

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // ── Env config ──────────────────────────────────────────────────
    let broker = env::var("MQTT_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
    let port: u16 = env_or("MQTT_PORT", 1883);
    let web_port: u16 = env_or("WEB_PORT", 8080);
    let db_url = env::var("DB_URL")
        .unwrap_or_else(|_| "sqlite:irrigation.db?mode=rwc".to_string());
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());
    // Many common relay boards are active-low. If yours is active-high, set false.
    let active_low = env::var("RELAY_ACTIVE_LOW")
        .ok()
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(true);

    // ── Config file ─────────────────────────────────────────────────
    // Parsed before anything touches hardware: a bad file is fatal.
    let cfg = config::load(&config_path)?;

    // ── Database ────────────────────────────────────────────────────
    let db = Db::connect(&db_url).await?;
    db.migrate().await?;

    // ── MQTT client (the event loop is polled below) ────────────────
    let mut mqttoptions = MqttOptions::new("irrigation-controller", broker, port);
    mqttoptions.set_keep_alive(Duration::from_secs(30));
    let (client, mut eventloop) = AsyncClient::new(mqttoptions, 64);

    // ── Registry ────────────────────────────────────────────────────
    let events = state::shared();
    let facts = Facts::new();
    let factory = ActuatorFactory::new(client.clone(), active_low)?;
    let wiring = config::Wiring {
        actuators: &factory,
        facts: facts.clone(),
        templates: predicate::environment(),
        events: events.clone(),
        db: Some(db.clone()),
    };
    let registry = Arc::new(
        config::build(&cfg, &wiring)
            .await
            .context("failed to build zones and programs")?,
    );
    if registry.zones.is_empty() {
        warn!("no zones configured");
    }

    // Nothing runs yet; whatever a crash left energised goes OFF now.
    lifecycle::on_startup(&registry, &events).await;

    let dispatcher = Dispatcher::new(Arc::clone(&registry), events.clone());
    let shutdown = CancellationToken::new();

    // Cancelled by SIGINT/SIGTERM; stays cancelled until the loop sees it.
    let stop_requested = CancellationToken::new();
    let _signals = lifecycle::listen_for_signals(stop_requested.clone())?;

    // ── Triggers ────────────────────────────────────────────────────
    let _triggers = schedule::spawn_all(&dispatcher, &shutdown);

    // ── Web server ──────────────────────────────────────────────────
    let web_state = web::AppState {
        dispatcher: dispatcher.clone(),
        events: events.clone(),
        db: Some(db.clone()),
    };
    let web_shutdown = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = web::serve(web_state, web_port, web_shutdown).await {
            error!("web server failed: {e:#}");
        }
    });

    events
        .write()
        .await
        .record_system("controller started".to_string());

    // ── MQTT loop ───────────────────────────────────────────────────
    loop {
        let polled = tokio::select! {
            polled = eventloop.poll() => polled,
            _ = stop_requested.cancelled() => break,
        };

        match polled {
            Ok(Event::Incoming(Packet::Publish(p))) => {
                if let Some(cmd) = mqtt::decode(&p.topic, &p.payload) {
                    let dispatcher = dispatcher.clone();
                    let facts = facts.clone();
                    // Stop barriers can take a tick; keep polling meanwhile.
                    tokio::spawn(async move { mqtt::handle(cmd, &dispatcher, &facts).await });
                }
            }
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                info!("mqtt connected");
                if let Err(e) = client.try_subscribe(mqtt::SUBSCRIPTION, QoS::AtLeastOnce) {
                    error!("mqtt subscribe failed: {e}");
                }
                let mut st = events.write().await;
                st.mqtt_connected = true;
                st.record_system("mqtt connected".to_string());
            }
            Ok(Event::Incoming(Packet::Disconnect)) => {
                warn!("mqtt disconnected");
                let mut st = events.write().await;
                st.mqtt_connected = false;
                st.record_system("mqtt disconnected".to_string());
            }
            Ok(_) => {}
            Err(e) => {
                warn!("mqtt error: {e}. reconnecting...");
                let mut st = events.write().await;
                st.mqtt_connected = false;
                st.record_error(format!("mqtt error: {e}"));
                drop(st);

                if !lifecycle::pause_unless_stopped(&stop_requested, Duration::from_secs(2)).await {
                    break;
                }
            }
        }
    }

    // ── Shutdown ────────────────────────────────────────────────────
    info!("stop requested, shutting down");
    lifecycle::shutdown(&dispatcher, &events).await;
    shutdown.cancel();

    // Give queued OFF publishes for mqtt switches a chance to leave.
    let _ = client.try_disconnect();
    let _ = tokio::time::timeout(Duration::from_secs(2), async {
        while eventloop.poll().await.is_ok() {}
    })
    .await;

    info!("controller stopped");
    Ok(())
}
