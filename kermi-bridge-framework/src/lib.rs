//! kermi2mqtt Bridge Framework
//!
//! Lifecycle and transport plumbing for the Modbus-to-MQTT bridge.
//!
//! # Overview
//!
//! This framework provides:
//! - [`BridgeConfig`] trait for configuration loading and validation
//! - [`BridgeRunner`] for managing bridge lifecycle (startup, signal handling, bounded shutdown)
//! - [`BusClient`] trait and its MQTT implementation [`MqttBus`]
//! - [`Publisher`] for publishing text and JSON payloads with the configured QoS/retain policy
//! - [`reconnect_with_backoff`] for exponential-backoff reconnection of any endpoint
//! - [`Shutdown`] for cancelable waits
//! - [`BridgeArgs`] for common CLI argument parsing
//! - [`BridgeStatus`] for standardized status reporting
//!
//! # Example
//!
//! ```ignore
//! use kermi_bridge_framework::{BridgeArgs, BridgeConfig, BridgeRunner};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let args = BridgeArgs::parse();
//!     let config = MyBridgeConfig::load(&args.config)?;
//!
//!     let mut runner = BridgeRunner::new_with_args("mybridge", config, Some(&args))?;
//!     let shutdown = runner.shutdown();
//!     runner.spawn("worker", async move { my_worker(shutdown).await });
//!
//!     // Run until SIGINT/SIGTERM
//!     runner.run().await
//! }
//! ```

mod args;
mod backoff;
mod bus;
mod config;
mod error;
mod mqtt;
mod publisher;
mod runner;
mod shutdown;
mod status;

pub use args::BridgeArgs;
pub use backoff::{BackoffPolicy, reconnect_with_backoff};
pub use bus::{BusClient, InboundMessage, Qos};
pub use config::BridgeConfig;
pub use error::{BridgeError, Result};
pub use mqtt::MqttBus;
pub use publisher::Publisher;
pub use runner::BridgeRunner;
pub use shutdown::Shutdown;
pub use status::{BridgeStatus, StatusPublisher};

// Re-export commonly used types from kermi-common
pub use kermi_common::{LoggingConfig, MqttConfig, TopicBuilder};
