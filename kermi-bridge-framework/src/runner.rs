//! Bridge runner for lifecycle management.

use std::future::Future;
use std::time::Duration;

use rumqttc::LastWill;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use kermi_common::{LoggingConfig, init_tracing};

use crate::BridgeArgs;
use crate::backoff::BackoffPolicy;
use crate::bus::InboundMessage;
use crate::config::BridgeConfig;
use crate::error::{BridgeError, Result};
use crate::mqtt::MqttBus;
use crate::shutdown::Shutdown;

/// Default upper bound for tasks to finish after shutdown is requested.
const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Bridge runner that manages the lifecycle of the bridge process.
///
/// Handles:
/// - Logging initialization
/// - Task spawning and management
/// - Graceful shutdown on Ctrl+C / SIGTERM, bounded by a timeout
///
/// # Example
///
/// ```ignore
/// use kermi_bridge_framework::{BridgeArgs, BridgeConfig, BridgeRunner};
///
/// #[tokio::main]
/// async fn main() -> anyhow::Result<()> {
///     let args = BridgeArgs::parse();
///     let config = MyBridgeConfig::load(&args.config)?;
///
///     let mut runner = BridgeRunner::new_with_args("mybridge", config, Some(&args))?;
///     let shutdown = runner.shutdown();
///     runner.spawn("worker", async move {
///         shutdown.triggered().await;
///         Ok(())
///     });
///
///     runner.run().await?;
///     Ok(())
/// }
/// ```
pub struct BridgeRunner<C: BridgeConfig> {
    /// Bridge name for logging and status.
    name: String,
    /// Bridge version.
    version: String,
    /// The loaded configuration.
    config: C,
    /// Shared shutdown signal.
    shutdown: Shutdown,
    /// Upper bound on task shutdown.
    shutdown_timeout: Duration,
    /// Spawned tasks.
    tasks: Vec<(String, JoinHandle<()>)>,
}

impl<C: BridgeConfig> BridgeRunner<C> {
    /// Create a runner without logging initialization (used by tests and
    /// callers that installed their own subscriber).
    pub fn new(name: impl Into<String>, config: C) -> Self {
        Self {
            name: name.into(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            config,
            shutdown: Shutdown::new(),
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            tasks: Vec::new(),
        }
    }

    /// Create a new bridge runner, initializing logging with an optional
    /// CLI log level override.
    pub fn new_with_args(
        name: impl Into<String>,
        config: C,
        args: Option<&BridgeArgs>,
    ) -> Result<Self> {
        let runner = Self::new(name, config);

        let log_config = match args.and_then(|a| a.log_level.as_ref()) {
            Some(level) => LoggingConfig {
                level: level.clone(),
                format: runner.config.logging().format,
            },
            None => runner.config.logging().clone(),
        };

        init_tracing(&log_config).map_err(|e| BridgeError::config(e.to_string()))?;

        tracing::info!(bridge = %runner.name, version = %runner.version, "Starting bridge");

        Ok(runner)
    }

    /// Set the upper bound on shutdown time.
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Override the reported version.
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    /// Get the bridge name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get the bridge version.
    pub fn version(&self) -> &str {
        &self.version
    }

    /// Get a reference to the configuration.
    pub fn config(&self) -> &C {
        &self.config
    }

    /// Get a handle to the shutdown signal.
    pub fn shutdown(&self) -> Shutdown {
        self.shutdown.clone()
    }

    /// Create an MQTT bus client for the configured broker.
    pub fn mqtt_bus(
        &self,
        client_id: &str,
        backoff: BackoffPolicy,
        last_will: Option<LastWill>,
    ) -> Result<(MqttBus, mpsc::Receiver<InboundMessage>)> {
        MqttBus::new(self.config.mqtt(), client_id, last_will, backoff)
    }

    /// Spawn a worker task.
    ///
    /// Errors are logged. Any task finishing, successfully or not, stops
    /// the bridge.
    pub fn spawn<F, E>(&mut self, name: impl Into<String>, future: F)
    where
        F: Future<Output = std::result::Result<(), E>> + Send + 'static,
        E: std::fmt::Display + Send + 'static,
    {
        let name = name.into();
        let shutdown = self.shutdown.clone();
        let worker = name.clone();
        let handle = tokio::spawn(async move {
            match future.await {
                Ok(()) => tracing::debug!(worker = %worker, "Worker finished"),
                Err(e) => tracing::error!(worker = %worker, error = %e, "Worker failed"),
            }
            shutdown.trigger();
        });
        self.tasks.push((name, handle));
    }

    /// Run the bridge until a stop signal is received.
    ///
    /// This will:
    /// 1. Wait for Ctrl+C, SIGTERM, or any worker finishing
    /// 2. Trigger the shared shutdown signal
    /// 3. Wait up to the shutdown timeout for every worker
    /// 4. Abort the stragglers and return [`BridgeError::ShutdownTimeout`]
    pub async fn run(self) -> Result<()> {
        tracing::info!(
            bridge = %self.name,
            tasks = self.tasks.len(),
            "Bridge running. Press Ctrl+C to stop."
        );

        tokio::select! {
            _ = wait_for_signal() => {
                tracing::info!(bridge = %self.name, "Received shutdown signal");
            }
            _ = self.shutdown.triggered() => {
                tracing::info!(bridge = %self.name, "Shutdown requested");
            }
        }

        self.shutdown.trigger();
        self.join_tasks().await
    }

    async fn join_tasks(self) -> Result<()> {
        let deadline = tokio::time::Instant::now() + self.shutdown_timeout;
        let mut timed_out = false;

        for (name, mut handle) in self.tasks {
            if timed_out {
                handle.abort();
                continue;
            }
            match tokio::time::timeout_at(deadline, &mut handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::error!(worker = %name, error = %e, "Worker panicked"),
                Err(_) => {
                    tracing::error!(
                        worker = %name,
                        timeout_secs = self.shutdown_timeout.as_secs(),
                        "Worker did not stop in time, aborting"
                    );
                    handle.abort();
                    timed_out = true;
                }
            }
        }

        if timed_out {
            return Err(BridgeError::ShutdownTimeout {
                secs: self.shutdown_timeout.as_secs(),
            });
        }

        tracing::info!(bridge = %self.name, "Goodbye!");
        Ok(())
    }
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(e) => {
            tracing::warn!(error = %e, "Failed to install SIGTERM handler");
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "Failed to listen for Ctrl+C");
                std::future::pending::<()>().await;
            }
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for Ctrl+C");
        std::future::pending::<()>().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MqttConfig;
    use serde::Deserialize;

    #[derive(Debug, Deserialize)]
    struct TestConfig {
        mqtt: MqttConfig,
        #[serde(default)]
        logging: LoggingConfig,
    }

    impl BridgeConfig for TestConfig {
        fn mqtt(&self) -> &MqttConfig {
            &self.mqtt
        }
        fn logging(&self) -> &LoggingConfig {
            &self.logging
        }
        fn base_topic(&self) -> &str {
            "kermi"
        }
    }

    fn runner() -> BridgeRunner<TestConfig> {
        BridgeRunner::new(
            "test",
            TestConfig {
                mqtt: MqttConfig::new("localhost"),
                logging: LoggingConfig::default(),
            },
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_returns_when_worker_stops_cooperatively() {
        let mut runner = runner().with_shutdown_timeout(Duration::from_secs(5));
        let shutdown = runner.shutdown();

        runner.spawn("cooperative", {
            let shutdown = shutdown.clone();
            async move {
                shutdown.triggered().await;
                Ok::<(), BridgeError>(())
            }
        });

        let trigger = shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            trigger.trigger();
        });

        assert!(runner.run().await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stuck_worker_is_aborted_after_timeout() {
        let mut runner = runner().with_shutdown_timeout(Duration::from_secs(3));
        let shutdown = runner.shutdown();

        runner.spawn("stuck", async {
            std::future::pending::<()>().await;
            Ok::<(), BridgeError>(())
        });

        shutdown.trigger();
        let start = tokio::time::Instant::now();
        let result = runner.run().await;

        assert!(matches!(result, Err(BridgeError::ShutdownTimeout { secs: 3 })));
        assert_eq!(start.elapsed(), Duration::from_secs(3));
    }

    #[tokio::test]
    async fn test_failing_worker_stops_bridge() {
        let mut runner = runner();
        runner.spawn("failing", async { Err::<(), _>("boom") });
        assert!(runner.run().await.is_ok());
    }
}
