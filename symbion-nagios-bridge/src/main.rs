/**
 * SYMBION NAGIOS BRIDGE - Point d'entrée
 *
 * RÔLE : Surveille le spool Nagios et publie chaque résultat de check sur MQTT.
 * Annonce la présence du pont via un topic retenu et un last will.
 */

use anyhow::{Context, Result};
use symbion_nagios_bridge::config::{BridgeConfig, ConfigSource};
use symbion_nagios_bridge::connection::ConnectionManager;
use symbion_nagios_bridge::signal::shutdown_signal;
use symbion_nagios_bridge::spool::{SpoolProcessor, SpoolWatcher};
use symbion_nagios_bridge::supervisor::Supervisor;
use symbion_nagios_bridge::transport::MqttConnector;
use symbion_nagios_bridge::logging;
use tracing::{info, warn};

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    // Charger les variables d'environnement depuis .env (si présent)
    dotenvy::dotenv().ok();

    let (config, source) = BridgeConfig::load().await.context("loading configuration")?;
    logging::init(&config.logging).context("initializing logging")?;

    match &source {
        ConfigSource::File(path) => info!("Configuration loaded from {}", path.display()),
        ConfigSource::Defaults(path) => {
            warn!("No configuration at {}, using defaults", path.display())
        }
    }

    let hostname = config.resolve_hostname()?;
    let options = config.session_options(&hostname);
    info!(
        "Symbion Nagios bridge v{} starting as {} (client id {})",
        env!("CARGO_PKG_VERSION"),
        hostname,
        options.client_id
    );

    let manager = ConnectionManager::new(MqttConnector, options, config.mqtt.reconnect_delay());
    let watcher = SpoolWatcher::watch(&config.spool.directory).with_context(|| {
        format!("watching spool directory {}", config.spool.directory.display())
    })?;
    let processor = SpoolProcessor::new(config.mqtt.base_topic.clone())
        .with_quarantine(config.spool.quarantine_directory.clone());

    let mut supervisor =
        Supervisor::new(manager, watcher, processor).with_startup_sweep(config.spool.sweep_on_start);
    supervisor.run(shutdown_signal()).await?;

    info!("Symbion Nagios bridge stopped");
    Ok(())
}
