//! MQTT implementation of [`BusClient`] on top of rumqttc.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{AsyncClient, ConnectReturnCode, Event, EventLoop, LastWill, MqttOptions, Packet};
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;

use kermi_common::{MqttConfig, mqtt_options};

use crate::backoff::BackoffPolicy;
use crate::bus::{BusClient, InboundMessage, Qos};
use crate::error::{BridgeError, Result};

/// Capacity of the rumqttc request channel.
const REQUEST_CAPACITY: usize = 64;

/// Capacity of the inbound message channel handed to the engine.
const INBOUND_CAPACITY: usize = 256;

/// Time allowed for the broker to acknowledge a connection.
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Time allowed for queued packets to drain on disconnect.
const DISCONNECT_GRACE: Duration = Duration::from_secs(2);

struct Connection {
    client: AsyncClient,
    driver: JoinHandle<()>,
}

/// MQTT bus client.
///
/// Each [`connect`](BusClient::connect) builds a fresh rumqttc client and
/// spawns a task driving its event loop. Incoming publishes are forwarded to
/// the receiver returned by [`MqttBus::new`]; subscriptions are replayed on
/// every connection acknowledgement.
pub struct MqttBus {
    options: MqttOptions,
    backoff: BackoffPolicy,
    connect_timeout: Duration,
    connection: Mutex<Option<Connection>>,
    connected: Arc<AtomicBool>,
    subscriptions: Arc<std::sync::Mutex<Vec<(String, Qos)>>>,
    inbound: mpsc::Sender<InboundMessage>,
}

impl MqttBus {
    /// Create a client for the configured broker.
    ///
    /// Returns the client and the stream of inbound messages.
    pub fn new(
        config: &MqttConfig,
        client_id: &str,
        last_will: Option<LastWill>,
        backoff: BackoffPolicy,
    ) -> Result<(Self, mpsc::Receiver<InboundMessage>)> {
        let mut options = mqtt_options(config, client_id)?;
        if let Some(will) = last_will {
            options.set_last_will(will);
        }

        let (inbound, rx) = mpsc::channel(INBOUND_CAPACITY);

        Ok((
            Self {
                options,
                backoff,
                connect_timeout: DEFAULT_CONNECT_TIMEOUT,
                connection: Mutex::new(None),
                connected: Arc::new(AtomicBool::new(false)),
                subscriptions: Arc::new(std::sync::Mutex::new(Vec::new())),
                inbound,
            },
            rx,
        ))
    }

    /// Override the connection acknowledgement timeout.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    fn subscriptions_snapshot(subscriptions: &std::sync::Mutex<Vec<(String, Qos)>>) -> Vec<(String, Qos)> {
        match subscriptions.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    async fn current_client(&self) -> Result<AsyncClient> {
        if !self.is_connected() {
            return Err(BridgeError::connection("not connected"));
        }
        self.connection
            .lock()
            .await
            .as_ref()
            .map(|c| c.client.clone())
            .ok_or_else(|| BridgeError::connection("not connected"))
    }
}

/// Drive one connection's event loop until it fails.
async fn drive(
    mut eventloop: EventLoop,
    client: AsyncClient,
    connected: Arc<AtomicBool>,
    subscriptions: Arc<std::sync::Mutex<Vec<(String, Qos)>>>,
    inbound: mpsc::Sender<InboundMessage>,
    ready: oneshot::Sender<std::result::Result<(), String>>,
) {
    let mut ready = Some(ready);

    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                if ack.code != ConnectReturnCode::Success {
                    connected.store(false, Ordering::SeqCst);
                    if let Some(tx) = ready.take() {
                        let _ = tx.send(Err(format!("broker refused connection: {:?}", ack.code)));
                    }
                    break;
                }

                connected.store(true, Ordering::SeqCst);
                // The async subscribe would wait on the channel this task drains
                for (pattern, qos) in MqttBus::subscriptions_snapshot(&subscriptions) {
                    if let Err(e) = client.try_subscribe(&pattern, qos.into()) {
                        tracing::warn!(pattern = %pattern, error = %e, "Failed to restore subscription");
                    }
                }
                if let Some(tx) = ready.take() {
                    let _ = tx.send(Ok(()));
                }
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                let message = InboundMessage::new(
                    publish.topic.clone(),
                    String::from_utf8_lossy(&publish.payload).into_owned(),
                );
                if let Err(e) = inbound.try_send(message) {
                    tracing::warn!(topic = %publish.topic, error = %e, "Dropping inbound message");
                }
            }
            Ok(Event::Outgoing(rumqttc::Outgoing::Disconnect)) => {
                connected.store(false, Ordering::SeqCst);
                break;
            }
            Ok(_) => {}
            Err(e) => {
                connected.store(false, Ordering::SeqCst);
                match ready.take() {
                    Some(tx) => {
                        let _ = tx.send(Err(e.to_string()));
                    }
                    None => tracing::warn!(error = %e, "MQTT connection lost"),
                }
                break;
            }
        }
    }
}

#[async_trait]
impl BusClient for MqttBus {
    async fn connect(&self) -> Result<()> {
        let mut slot = self.connection.lock().await;
        if let Some(old) = slot.take() {
            old.driver.abort();
        }
        self.connected.store(false, Ordering::SeqCst);

        let (client, eventloop) = AsyncClient::new(self.options.clone(), REQUEST_CAPACITY);
        let (ready_tx, ready_rx) = oneshot::channel();

        let driver = tokio::spawn(drive(
            eventloop,
            client.clone(),
            self.connected.clone(),
            self.subscriptions.clone(),
            self.inbound.clone(),
            ready_tx,
        ));

        let (host, port) = self.options.broker_address();
        match tokio::time::timeout(self.connect_timeout, ready_rx).await {
            Ok(Ok(Ok(()))) => {
                tracing::info!(broker = %format!("{}:{}", host, port), "Connected to MQTT broker");
                *slot = Some(Connection { client, driver });
                Ok(())
            }
            Ok(Ok(Err(message))) => Err(BridgeError::connection(message)),
            Ok(Err(_)) => Err(BridgeError::connection("event loop stopped before acknowledgement")),
            Err(_) => {
                driver.abort();
                Err(BridgeError::connection(format!(
                    "no acknowledgement from {}:{} within {}s",
                    host,
                    port,
                    self.connect_timeout.as_secs()
                )))
            }
        }
    }

    async fn disconnect(&self) -> Result<()> {
        let Some(mut connection) = self.connection.lock().await.take() else {
            return Ok(());
        };

        if self.connected.load(Ordering::SeqCst) {
            if let Err(e) = connection.client.try_disconnect() {
                tracing::debug!(error = %e, "Disconnect request not queued");
            }
            if tokio::time::timeout(DISCONNECT_GRACE, &mut connection.driver)
                .await
                .is_err()
            {
                connection.driver.abort();
            }
        } else {
            connection.driver.abort();
        }

        self.connected.store(false, Ordering::SeqCst);
        tracing::info!("Disconnected from MQTT broker");
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn backoff(&self) -> BackoffPolicy {
        self.backoff
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>, qos: Qos, retain: bool) -> Result<()> {
        let client = self.current_client().await.map_err(|e| BridgeError::Publish {
            topic: topic.to_string(),
            message: e.to_string(),
        })?;

        client
            .publish(topic, qos.into(), retain, payload)
            .await
            .map_err(|e| BridgeError::Publish {
                topic: topic.to_string(),
                message: e.to_string(),
            })
    }

    async fn subscribe(&self, pattern: &str, qos: Qos) -> Result<()> {
        {
            let mut subscriptions = match self.subscriptions.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            if !subscriptions.iter().any(|(p, _)| p == pattern) {
                subscriptions.push((pattern.to_string(), qos));
            }
        }

        // Replayed on the next acknowledgement when offline
        if !self.is_connected() {
            return Ok(());
        }

        let client = self.current_client().await?;
        client
            .subscribe(pattern, qos.into())
            .await
            .map_err(|e| BridgeError::Subscribe {
                pattern: pattern.to_string(),
                message: e.to_string(),
            })?;

        tracing::debug!(pattern = %pattern, "Subscribed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bus() -> (MqttBus, mpsc::Receiver<InboundMessage>) {
        let mut config = MqttConfig::new("127.0.0.1");
        // Nothing listens on port 1
        config.port = 1;
        MqttBus::new(&config, "kermi2mqtt_test", None, BackoffPolicy::default())
            .expect("valid options")
    }

    #[tokio::test]
    async fn test_publish_while_disconnected_is_connection_error() {
        let (bus, _rx) = bus();
        assert!(!bus.is_connected());

        let err = bus
            .publish("kermi/x/status", b"{}".to_vec(), Qos::AtLeastOnce, true)
            .await
            .unwrap_err();
        assert!(err.is_connection());
    }

    #[tokio::test]
    async fn test_subscribe_while_disconnected_is_remembered() {
        let (bus, _rx) = bus();
        bus.subscribe("kermi/x/+/controls/+/set", Qos::AtLeastOnce)
            .await
            .unwrap();
        bus.subscribe("kermi/x/+/controls/+/set", Qos::AtLeastOnce)
            .await
            .unwrap();

        let subs = MqttBus::subscriptions_snapshot(&bus.subscriptions);
        assert_eq!(subs.len(), 1);
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let (bus, _rx) = bus();
        let bus = bus.with_connect_timeout(Duration::from_secs(5));

        let err = bus.connect().await.unwrap_err();
        assert!(err.is_connection());
        assert!(!bus.is_connected());
        assert!(bus.disconnect().await.is_ok());
    }

    #[test]
    fn test_last_will_applied() {
        let config = MqttConfig::new("broker");
        let will = LastWill::new("kermi/x/status", "offline", rumqttc::QoS::AtLeastOnce, true);
        let (bus, _rx) =
            MqttBus::new(&config, "id", Some(will), BackoffPolicy::default()).unwrap();
        assert_eq!(
            bus.options.last_will().map(|w| w.topic.clone()),
            Some("kermi/x/status".to_string())
        );
    }
}
