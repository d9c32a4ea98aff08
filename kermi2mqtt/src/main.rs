//! kermi2mqtt: Kermi x-center heat pump to MQTT bridge.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use kermi2mqtt::bridge::{Bridge, BridgeContext, EngineSettings};
use kermi2mqtt::config::Kermi2MqttConfig;
use kermi2mqtt::device::DeviceRegistry;
use kermi2mqtt::discovery::DiscoveryPublisher;
use kermi2mqtt::modbus::ModbusDeviceClient;
use kermi2mqtt::safety::{RateLimiter, SafetyRegistry};
use kermi2mqtt::{BRIDGE_NAME, mappings};
use kermi_bridge_framework::{
    BridgeArgs, BridgeConfig, BridgeRunner, BusClient, Publisher, StatusPublisher, TopicBuilder,
};

/// Bridge between Kermi x-center heat pumps (Modbus TCP/RTU) and MQTT.
#[derive(Parser, Debug)]
#[command(name = "kermi2mqtt")]
#[command(about = "Publishes Kermi x-center values to MQTT and applies MQTT commands")]
#[command(version)]
struct Args {
    #[command(flatten)]
    bridge: BridgeArgs,

    /// Remove all Home Assistant discovery entries and exit.
    #[arg(long)]
    remove_discovery: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = Kermi2MqttConfig::load(&args.bridge.config)
        .with_context(|| format!("Failed to load config from {:?}", args.bridge.config))?;
    let shutdown_timeout = config.advanced.shutdown_timeout();

    let runner = BridgeRunner::new_with_args(BRIDGE_NAME, config, Some(&args.bridge))?
        .with_shutdown_timeout(shutdown_timeout);
    info!("Loaded configuration from {:?}", args.bridge.config);

    if args.remove_discovery {
        return remove_discovery(&runner).await;
    }

    run(runner).await
}

fn topics(config: &Kermi2MqttConfig) -> Result<TopicBuilder> {
    TopicBuilder::new(&config.integration.base_topic, config.base_id())
        .context("Invalid topic layout")
}

async fn run(mut runner: BridgeRunner<Kermi2MqttConfig>) -> Result<()> {
    let config = runner.config().clone();
    let topics = topics(&config)?;
    let advanced = &config.advanced;

    let status_topic = topics.status_topic();
    let will = StatusPublisher::last_will(
        &status_topic,
        runner.name(),
        runner.version(),
        advanced.mqtt_qos_state,
    )?;
    let (bus, inbound) =
        runner.mqtt_bus(&config.client_id(), advanced.mqtt_backoff(), Some(will))?;
    let bus: Arc<dyn BusClient> = Arc::new(bus);
    let publisher = Publisher::new(bus, advanced.mqtt_qos_state, advanced.mqtt_retain_state);

    let device = Arc::new(ModbusDeviceClient::new(
        &config.modbus,
        advanced.modbus_backoff(),
    ));

    let mut safety = SafetyRegistry::new(config.safety.enable_validation);
    for (control, reason) in &config.safety.blocked_controls {
        if let Some(target) = mappings::find_control(control).and_then(|a| a.write) {
            info!(control = %control, reason = %reason, "Control blocked");
            safety.block(target, reason.clone());
        }
    }

    let settings = EngineSettings {
        poll_interval: config.poll_interval(),
        settle_delay: advanced.settle_delay(),
        command_qos: advanced.mqtt_qos_command,
    };
    let context = BridgeContext::new(runner.shutdown(), RateLimiter::new(config.rate_limit()));
    let status = StatusPublisher::new(
        publisher.clone(),
        status_topic,
        runner.name(),
        runner.version(),
    );

    let mut bridge = Bridge::new(settings, device, publisher.clone(), inbound, topics, context)?
        .with_safety(safety)
        .with_status(status);

    let discovery = &config.integration.discovery;
    if discovery.enabled {
        bridge = bridge.with_discovery(DiscoveryPublisher::new(
            publisher,
            &discovery.prefix,
            advanced.mqtt_retain_discovery,
        ));
    }

    info!(
        modbus = %config.modbus.connection.endpoint(),
        mqtt = %config.mqtt.broker_addr(),
        device_id = %config.base_id(),
        "Bridge configured"
    );

    runner.spawn("engine", bridge.run());
    runner.run().await?;

    info!("Bridge stopped");
    Ok(())
}

/// Clear every discovery entry the configured units could have announced.
async fn remove_discovery(runner: &BridgeRunner<Kermi2MqttConfig>) -> Result<()> {
    let config = runner.config();
    let mut registry = DeviceRegistry::new(topics(config)?);
    registry.discover(&config.modbus.units.enabled())?;

    let (bus, _inbound) =
        runner.mqtt_bus(&config.client_id(), config.advanced.mqtt_backoff(), None)?;
    let bus: Arc<dyn BusClient> = Arc::new(bus);
    bus.connect()
        .await
        .with_context(|| format!("Failed to connect to {}", config.mqtt.broker_addr()))?;

    let publisher = Publisher::new(bus.clone(), config.advanced.mqtt_qos_state, false);
    let discovery = DiscoveryPublisher::new(publisher, &config.integration.discovery.prefix, true);
    discovery.remove_all(&registry).await?;

    bus.disconnect().await?;
    Ok(())
}
