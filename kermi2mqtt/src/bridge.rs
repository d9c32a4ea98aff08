//! The bridge engine: discovery, the poll/publish loop, availability and
//! reconnection of both endpoints.
//!
//! The engine runs as a single task. Inbound commands arrive over a channel
//! and are handled while waiting for the next poll cycle and while the device
//! connection is being re-established.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use tokio::sync::{Mutex, mpsc};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use kermi_bridge_framework::{
    BridgeError, BusClient, InboundMessage, Publisher, Qos, Shutdown, StatusPublisher,
};
use kermi_common::TopicBuilder;

use crate::client::{ClientError, DeviceClient, DeviceType};
use crate::device::{DeviceRegistry, DiscoveryError};
use crate::discovery::DiscoveryPublisher;
use crate::filter;
use crate::safety::{RateLimiter, SafetyRegistry};
use crate::transform::{TransformError, ValueTransformer};

/// Upper bound on the retry delay after a connection-class failure.
pub const CONNECTION_RETRY: Duration = Duration::from_secs(5);

pub const AVAILABILITY_ONLINE: &str = "online";
pub const AVAILABILITY_OFFLINE: &str = "offline";

/// Errors surfaced by the engine.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Device error: {0}")]
    Device(#[from] ClientError),

    #[error("Bus error: {0}")]
    Bus(#[from] BridgeError),

    #[error("Enumeration tables are inconsistent: {0}")]
    Transform(#[from] TransformError),

    #[error("Discovery failed: {0}")]
    Discovery(#[from] DiscoveryError),
}

impl EngineError {
    /// Whether the error means an endpoint is unreachable.
    pub fn is_connection(&self) -> bool {
        match self {
            EngineError::Device(e) => e.is_connection(),
            EngineError::Bus(e) => e.is_connection(),
            _ => false,
        }
    }

    fn is_shutdown(&self) -> bool {
        matches!(self, EngineError::Bus(BridgeError::ShutdownRequested))
    }
}

/// State scoped to one bridge run.
#[derive(Debug, Clone)]
pub struct BridgeContext {
    pub shutdown: Shutdown,
    pub rate_limiter: RateLimiter,
}

impl BridgeContext {
    pub fn new(shutdown: Shutdown, rate_limiter: RateLimiter) -> Self {
        Self {
            shutdown,
            rate_limiter,
        }
    }
}

/// Engine timing and QoS.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub poll_interval: Duration,
    pub settle_delay: Duration,
    pub command_qos: Qos,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(30),
            settle_delay: Duration::from_secs(2),
            command_qos: Qos::AtLeastOnce,
        }
    }
}

/// The bridge engine.
pub struct Bridge {
    pub(crate) settings: EngineSettings,
    pub(crate) device: Arc<dyn DeviceClient>,
    pub(crate) bus: Arc<dyn BusClient>,
    pub(crate) publisher: Publisher,
    pub(crate) transformer: ValueTransformer,
    pub(crate) safety: SafetyRegistry,
    pub(crate) registry: Arc<Mutex<DeviceRegistry>>,
    pub(crate) context: BridgeContext,
    discovery: Option<DiscoveryPublisher>,
    status: Option<StatusPublisher>,
    inbound: mpsc::Receiver<InboundMessage>,
}

impl Bridge {
    /// Create an engine. Fails if the enumeration codecs are inconsistent.
    pub fn new(
        settings: EngineSettings,
        device: Arc<dyn DeviceClient>,
        publisher: Publisher,
        inbound: mpsc::Receiver<InboundMessage>,
        topics: TopicBuilder,
        context: BridgeContext,
    ) -> Result<Self, EngineError> {
        let transformer = ValueTransformer::new()?;
        let bus = publisher.bus().clone();

        Ok(Self {
            settings,
            device,
            bus,
            publisher,
            transformer,
            safety: SafetyRegistry::default(),
            registry: Arc::new(Mutex::new(DeviceRegistry::new(topics))),
            context,
            discovery: None,
            status: None,
            inbound,
        })
    }

    pub fn with_safety(mut self, safety: SafetyRegistry) -> Self {
        self.safety = safety;
        self
    }

    pub fn with_discovery(mut self, discovery: DiscoveryPublisher) -> Self {
        self.discovery = Some(discovery);
        self
    }

    pub fn with_status(mut self, status: StatusPublisher) -> Self {
        self.status = Some(status);
        self
    }

    /// Shared device state.
    pub fn registry(&self) -> Arc<Mutex<DeviceRegistry>> {
        self.registry.clone()
    }

    pub fn context(&self) -> &BridgeContext {
        &self.context
    }

    /// Run until the shutdown signal fires.
    pub async fn run(mut self) -> Result<(), EngineError> {
        match self.start().await {
            Ok(()) => {}
            Err(e) if e.is_shutdown() => {
                info!("Stopped during startup");
                self.disconnect_all().await;
                return Ok(());
            }
            Err(e) => {
                error!(error = %e, "Startup failed");
                if let Some(status) = &self.status {
                    if let Err(publish) = status.publish_error(e.to_string()).await {
                        debug!(error = %publish, "Failed to publish bridge status");
                    }
                }
                self.disconnect_all().await;
                return Err(e);
            }
        }

        let shutdown = self.context.shutdown.clone();
        while !shutdown.is_triggered() {
            match self.ensure_connected().await {
                Ok(()) => {}
                Err(e) if e.is_shutdown() => break,
                Err(e) => {
                    warn!(error = %e, "Reconnection failed");
                    self.wait(self.retry_delay()).await;
                    continue;
                }
            }

            let delay = match self.poll_and_publish().await {
                Ok(count) => {
                    debug!(published = count, "Poll cycle complete");
                    self.settings.poll_interval
                }
                Err(e) if e.is_connection() => {
                    warn!(error = %e, "Poll cycle failed, endpoint unreachable");
                    self.retry_delay()
                }
                Err(e) => {
                    error!(error = %e, "Poll cycle failed");
                    self.settings.poll_interval
                }
            };

            self.wait(delay).await;
        }

        self.stop().await;
        Ok(())
    }

    fn retry_delay(&self) -> Duration {
        CONNECTION_RETRY.min(self.settings.poll_interval)
    }

    /// Connect both endpoints, discover units and announce them.
    async fn start(&mut self) -> Result<(), EngineError> {
        let shutdown = self.context.shutdown.clone();

        self.bus.reconnect_with_backoff(&shutdown).await?;
        let units = self.probe_units().await?;

        {
            let mut registry = self.registry.lock().await;
            let count = registry.discover(&units)?;
            if count == 0 {
                warn!("No Modbus units answered; nothing will be published");
            }
            // Online once the first poll succeeds
            registry.set_available(false);

            if let Some(discovery) = &self.discovery {
                if let Err(e) = discovery.publish_all(&registry, &self.transformer).await {
                    warn!(error = %e, "Failed to publish discovery");
                }
            }
        }

        self.publish_availability().await;
        self.publish_status_running().await;

        let pattern = self.registry.lock().await.topics().command_wildcard();
        self.bus.subscribe(&pattern, self.settings.command_qos).await?;
        info!(pattern = %pattern, "Listening for commands");

        Ok(())
    }

    /// Connect the device client and find the units that answer. Transport
    /// failures during the probe restart the connection schedule.
    async fn probe_units(&mut self) -> Result<Vec<(DeviceType, u8)>, EngineError> {
        let shutdown = self.context.shutdown.clone();

        loop {
            self.reconnect_device().await?;
            match self.device.present_units().await {
                Ok(units) => return Ok(units),
                Err(e) if e.is_connection() => {
                    warn!(error = %e, "Unit probe failed");
                    self.wait(self.device.backoff().initial).await;
                    if shutdown.is_triggered() {
                        return Err(BridgeError::ShutdownRequested.into());
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Reconnect the device client with backoff. Commands arriving meanwhile
    /// are answered right away instead of waiting for the link.
    async fn reconnect_device(&mut self) -> Result<(), EngineError> {
        let device = self.device.clone();
        let shutdown = self.context.shutdown.clone();
        let reconnect = device.reconnect_with_backoff(&shutdown);
        tokio::pin!(reconnect);

        loop {
            tokio::select! {
                result = &mut reconnect => return result.map_err(EngineError::from),
                Some(message) = self.inbound.recv() => self.handle_message(message).await,
            }
        }
    }

    /// Reconnect whichever endpoint is down.
    async fn ensure_connected(&mut self) -> Result<(), EngineError> {
        let shutdown = self.context.shutdown.clone();

        if !self.bus.is_connected() {
            info!("MQTT disconnected, reconnecting");
            self.bus.reconnect_with_backoff(&shutdown).await?;
            self.publish_availability().await;
            self.publish_status_running().await;
        }

        if !self.device.is_connected() {
            info!("Modbus disconnected, reconnecting");
            self.mark_unavailable().await;
            self.reconnect_device().await?;
        }

        Ok(())
    }

    /// One poll cycle: a single bulk read, then one publish per eligible value.
    ///
    /// On failure every device becomes unavailable and the error is
    /// returned. On success devices that were unavailable come back online.
    pub async fn poll_and_publish(&mut self) -> Result<usize, EngineError> {
        let snapshot = match self.device.read_all_devices().await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                self.mark_unavailable().await;
                return Err(e.into());
            }
        };

        let mut registry = self.registry.lock().await;
        let mut published = 0;
        let mut failure = None;

        'devices: for device in registry.devices() {
            for attribute in device.attributes.iter().filter(|a| !a.writable()) {
                let Some(value) = snapshot.get(device.device_type, attribute.key) else {
                    continue;
                };
                if !filter::should_publish(device.device_type, attribute, Some(value)) {
                    continue;
                }

                let payload = self.transformer.encode(attribute, value);
                let topic = device.state_topic(attribute);
                if let Err(e) = self.publisher.publish_state(&topic, &payload).await {
                    failure = Some(e);
                    break 'devices;
                }
                published += 1;
            }
        }

        if let Some(e) = failure {
            drop(registry);
            self.mark_unavailable().await;
            return Err(e.into());
        }

        let now = Utc::now();
        for device in registry.devices_mut() {
            device.last_poll = Some(now);
        }

        if !registry.all_available() {
            registry.set_available(true);
            info!("Devices available");
            for device in registry.devices() {
                let topic = device.availability_topic();
                if let Err(e) = self.publisher.publish_retained(&topic, AVAILABILITY_ONLINE).await {
                    warn!(topic = %topic, error = %e, "Failed to publish availability");
                }
            }
        }

        Ok(published)
    }

    /// Mark every device unavailable and announce it, best-effort.
    async fn mark_unavailable(&self) {
        let mut registry = self.registry.lock().await;
        let was_available = registry.devices().iter().any(|d| d.available);
        registry.set_available(false);
        if was_available {
            warn!("Devices unavailable");
        }

        for device in registry.devices() {
            let topic = device.availability_topic();
            if let Err(e) = self.publisher.publish_retained(&topic, AVAILABILITY_OFFLINE).await {
                debug!(topic = %topic, error = %e, "Failed to publish availability");
            }
        }
    }

    /// Republish the current availability of every device.
    async fn publish_availability(&self) {
        let registry = self.registry.lock().await;
        for device in registry.devices() {
            let payload = if device.available {
                AVAILABILITY_ONLINE
            } else {
                AVAILABILITY_OFFLINE
            };
            let topic = device.availability_topic();
            if let Err(e) = self.publisher.publish_retained(&topic, payload).await {
                warn!(topic = %topic, error = %e, "Failed to publish availability");
            }
        }
    }

    async fn publish_status_running(&self) {
        let Some(status) = &self.status else {
            return;
        };

        let metadata = {
            let registry = self.registry.lock().await;
            serde_json::json!({
                "device_id": registry.base_id(),
                "devices": registry
                    .devices()
                    .iter()
                    .map(|d| serde_json::json!({ "id": d.id, "unit": d.unit_id }))
                    .collect::<Vec<_>>(),
            })
        };

        if let Err(e) = status.publish_running(Some(metadata)).await {
            warn!(error = %e, "Failed to publish bridge status");
        }
    }

    /// Wait for `duration`, handling inbound commands meanwhile. Returns early
    /// on shutdown.
    async fn wait(&mut self, duration: Duration) {
        let shutdown = self.context.shutdown.clone();
        let deadline = Instant::now() + duration;

        loop {
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => return,
                _ = shutdown.triggered() => return,
                message = self.inbound.recv() => match message {
                    Some(message) => self.handle_message(message).await,
                    None => {
                        shutdown.sleep(deadline.saturating_duration_since(Instant::now())).await;
                        return;
                    }
                },
            }
        }
    }

    /// Publish offline state and close both endpoints.
    async fn stop(&mut self) {
        info!("Stopping bridge");

        {
            let mut registry = self.registry.lock().await;
            registry.set_available(false);
            for device in registry.devices() {
                let topic = device.availability_topic();
                if let Err(e) = self.publisher.publish_retained(&topic, AVAILABILITY_OFFLINE).await {
                    debug!(topic = %topic, error = %e, "Failed to publish availability");
                }
            }
        }

        if let Some(status) = &self.status {
            if let Err(e) = status.publish_offline().await {
                debug!(error = %e, "Failed to publish bridge status");
            }
        }

        self.disconnect_all().await;
    }

    async fn disconnect_all(&self) {
        if let Err(e) = self.bus.disconnect().await {
            warn!(error = %e, "MQTT disconnect failed");
        }
        if let Err(e) = self.device.disconnect().await {
            warn!(error = %e, "Modbus disconnect failed");
        }
    }
}
